//! A do-nothing backend. Lets the validation core be compiled and smoke
//! tested without any driver present; mapped memory is real host memory so
//! diagnostic buffers stay readable.

use std::{borrow::Cow, ptr::NonNull};

use crate::DeviceResult;

#[derive(Clone)]
pub struct Api;

#[derive(Clone, Debug)]
pub struct Resource;

#[derive(Debug)]
pub struct Memory {
    data: Box<[u8]>,
}

pub struct Device;
pub struct Queue;
pub struct Encoder;

impl crate::Api for Api {
    type Device = Device;
    type Queue = Queue;
    type CommandEncoder = Encoder;

    type Memory = Memory;
    type Buffer = Resource;
    type ShaderModule = Resource;
    type DescriptorSetLayout = Resource;
    type DescriptorPool = Resource;
    type DescriptorSet = Resource;
    type PipelineLayout = Resource;
    type Pipeline = Resource;
    type AccelerationStructure = Resource;
}

impl gpu_alloc::MemoryDevice<Memory> for Device {
    unsafe fn allocate_memory(
        &self,
        size: u64,
        _memory_type: u32,
        _flags: gpu_alloc::AllocationFlags,
    ) -> Result<Memory, gpu_alloc::OutOfMemory> {
        Ok(Memory {
            data: vec![0u8; size as usize].into_boxed_slice(),
        })
    }

    unsafe fn deallocate_memory(&self, memory: Memory) {
        drop(memory);
    }

    unsafe fn map_memory(
        &self,
        memory: &mut Memory,
        offset: u64,
        _size: u64,
    ) -> Result<NonNull<u8>, gpu_alloc::DeviceMapError> {
        NonNull::new(memory.data.as_mut_ptr().add(offset as usize))
            .ok_or(gpu_alloc::DeviceMapError::MapFailed)
    }

    unsafe fn unmap_memory(&self, _memory: &mut Memory) {}

    unsafe fn invalidate_memory_ranges(
        &self,
        _ranges: &[gpu_alloc::MappedMemoryRange<'_, Memory>],
    ) -> Result<(), gpu_alloc::OutOfMemory> {
        Ok(())
    }

    unsafe fn flush_memory_ranges(
        &self,
        _ranges: &[gpu_alloc::MappedMemoryRange<'_, Memory>],
    ) -> Result<(), gpu_alloc::OutOfMemory> {
        Ok(())
    }
}

impl gpu_descriptor::DescriptorDevice<Resource, Resource, Resource> for Device {
    unsafe fn create_descriptor_pool(
        &self,
        _descriptor_count: &gpu_descriptor::DescriptorTotalCount,
        _max_sets: u32,
        _flags: gpu_descriptor::DescriptorPoolCreateFlags,
    ) -> Result<Resource, gpu_descriptor::CreatePoolError> {
        Ok(Resource)
    }

    unsafe fn destroy_descriptor_pool(&self, _pool: Resource) {}

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        _pool: &mut Resource,
        layouts: impl ExactSizeIterator<Item = &'a Resource>,
        sets: &mut impl Extend<Resource>,
    ) -> Result<(), gpu_descriptor::DeviceAllocationError> {
        sets.extend(layouts.map(|_| Resource));
        Ok(())
    }

    unsafe fn dealloc_descriptor_sets<'a>(&self, _pool: &mut Resource, sets: impl Iterator<Item = Resource>) {
        for set in sets {
            drop(set);
        }
    }
}

impl crate::Device<Api> for Device {
    fn properties(&self) -> crate::DeviceProperties {
        crate::DeviceProperties {
            alloc: gpu_alloc::DeviceProperties {
                memory_types: Cow::Owned(vec![gpu_alloc::MemoryType {
                    props: gpu_alloc::MemoryPropertyFlags::DEVICE_LOCAL
                        | gpu_alloc::MemoryPropertyFlags::HOST_VISIBLE
                        | gpu_alloc::MemoryPropertyFlags::HOST_COHERENT,
                    heap: 0,
                }]),
                memory_heaps: Cow::Owned(vec![gpu_alloc::MemoryHeap { size: 1 << 30 }]),
                max_memory_allocation_count: 1024,
                max_memory_allocation_size: 1 << 30,
                non_coherent_atom_size: 64,
                buffer_device_address: false,
            },
            valid_memory_types: 0x1,
            limits: gvt::DeviceLimits::default(),
            capabilities: gvt::DeviceCapabilities {
                api_version: gvt::API_VERSION_1_1,
                vertex_pipeline_stores_and_atomics: true,
                fragment_stores_and_atomics: true,
                ..Default::default()
            },
            max_update_after_bind_descriptors: 0,
        }
    }

    unsafe fn create_buffer(
        &self,
        desc: &crate::BufferDescriptor<'_>,
    ) -> DeviceResult<(Resource, crate::MemoryRequirements)> {
        Ok((
            Resource,
            crate::MemoryRequirements {
                size: desc.size,
                alignment: 16,
                memory_type_bits: 0x1,
            },
        ))
    }

    unsafe fn bind_buffer_memory(
        &self,
        _buffer: &mut Resource,
        _memory: &Memory,
        _offset: u64,
    ) -> DeviceResult<()> {
        Ok(())
    }

    unsafe fn destroy_buffer(&self, _buffer: Resource) {}

    unsafe fn create_descriptor_set_layout(
        &self,
        _desc: &crate::DescriptorSetLayoutDescriptor<'_>,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }

    unsafe fn destroy_descriptor_set_layout(&self, _layout: Resource) {}

    unsafe fn update_descriptor_sets(&self, _writes: &[crate::DescriptorWrite<'_, Api>]) {}

    unsafe fn create_pipeline_layout(
        &self,
        _desc: &crate::PipelineLayoutDescriptor<'_, Api>,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }

    unsafe fn destroy_pipeline_layout(&self, _layout: Resource) {}

    unsafe fn create_shader_module(&self, _spirv: &[u32]) -> DeviceResult<Resource> {
        Ok(Resource)
    }

    unsafe fn destroy_shader_module(&self, _module: Resource) {}

    unsafe fn create_compute_pipeline(
        &self,
        _desc: &crate::ComputePipelineDescriptor<'_, Api>,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }

    unsafe fn destroy_pipeline(&self, _pipeline: Resource) {}

    unsafe fn create_command_encoder(&self, _queue_family: u32) -> DeviceResult<Encoder> {
        Ok(Encoder)
    }

    unsafe fn destroy_command_encoder(&self, _encoder: Encoder) {}

    unsafe fn create_acceleration_structure(
        &self,
        _desc: &crate::AccelerationStructureDescriptor<'_>,
    ) -> DeviceResult<(Resource, crate::MemoryRequirements)> {
        Ok((
            Resource,
            crate::MemoryRequirements {
                size: 256,
                alignment: 256,
                memory_type_bits: 0x1,
            },
        ))
    }

    unsafe fn bind_acceleration_structure_memory(
        &self,
        _accel: &mut Resource,
        _memory: &Memory,
        _offset: u64,
    ) -> DeviceResult<()> {
        Ok(())
    }

    unsafe fn acceleration_structure_handle(&self, _accel: &Resource) -> DeviceResult<u64> {
        Ok(1)
    }

    unsafe fn acceleration_structure_scratch_requirements(
        &self,
        _accel: &Resource,
    ) -> crate::MemoryRequirements {
        crate::MemoryRequirements {
            size: 256,
            alignment: 256,
            memory_type_bits: 0x1,
        }
    }

    unsafe fn destroy_acceleration_structure(&self, _accel: Resource) {}
}

impl crate::Queue<Api> for Queue {
    unsafe fn submit(&mut self, _command_buffers: &[&Encoder]) -> DeviceResult<()> {
        Ok(())
    }

    unsafe fn wait_idle(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

impl crate::CommandEncoder<Api> for Encoder {
    unsafe fn begin(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    unsafe fn end(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    unsafe fn pipeline_barrier(
        &mut self,
        _src_stages: crate::PipelineStages,
        _dst_stages: crate::PipelineStages,
        _memory_barriers: &[crate::MemoryBarrier],
        _buffer_barriers: &[crate::BufferBarrier<'_, Api>],
    ) {
    }

    unsafe fn bind_pipeline(&mut self, _bind_point: gvt::BindPoint, _pipeline: &Resource) {}

    unsafe fn bind_descriptor_sets(
        &mut self,
        _bind_point: gvt::BindPoint,
        _layout: &Resource,
        _first_set: u32,
        _sets: &[&Resource],
        _dynamic_offsets: &[u32],
    ) {
    }

    unsafe fn push_constants(
        &mut self,
        _layout: &Resource,
        _stages: gvt::ShaderStages,
        _offset: u32,
        _data: &[u8],
    ) {
    }

    unsafe fn dispatch(&mut self, _count: [u32; 3]) {}

    unsafe fn build_acceleration_structure(
        &mut self,
        _dst: &Resource,
        _geometry: &crate::TriangleGeometry<'_, Api>,
        _scratch: &Resource,
        _scratch_offset: u64,
    ) {
    }
}

//! GPU memory and descriptor plumbing for the diagnostic resources.
//!
//! Buffers are suballocated through `gpu-alloc`, descriptor sets through
//! `gpu-descriptor`; both allocators live for the whole device and hand
//! out the short-lived per-command resources.

use hal::{Api, Device as _};
use parking_lot::Mutex;

/// A buffer plus the memory block behind it. Lifetime is one validated
/// command on one command buffer; freed when that command buffer is reset.
#[derive(Debug)]
pub struct DeviceMemoryBlock<A: Api> {
    pub buffer: A::Buffer,
    block: gpu_alloc::MemoryBlock<A::Memory>,
    size: u64,
}

impl<A: Api> DeviceMemoryBlock<A> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

pub(crate) struct MemoryAllocator<A: Api> {
    raw: Mutex<gpu_alloc::GpuAllocator<A::Memory>>,
    valid_memory_types: u32,
}

impl<A: Api> MemoryAllocator<A> {
    pub fn new(properties: &hal::DeviceProperties) -> Self {
        let config = gpu_alloc::Config::i_am_prototyping();
        // `gpu_alloc::DeviceProperties` does not derive `Clone`, so reproduce
        // its fields to obtain the owned value `GpuAllocator::new` expects.
        let alloc = &properties.alloc;
        let alloc = gpu_alloc::DeviceProperties {
            memory_types: alloc.memory_types.clone(),
            memory_heaps: alloc.memory_heaps.clone(),
            max_memory_allocation_count: alloc.max_memory_allocation_count,
            max_memory_allocation_size: alloc.max_memory_allocation_size,
            non_coherent_atom_size: alloc.non_coherent_atom_size,
            buffer_device_address: alloc.buffer_device_address,
        };
        Self {
            raw: Mutex::new(gpu_alloc::GpuAllocator::new(config, alloc)),
            valid_memory_types: properties.valid_memory_types,
        }
    }

    /// Create a buffer with fresh memory bound to it. `alloc_usage`
    /// decides host visibility; every diagnostic buffer the layer makes is
    /// mappable from the host.
    pub unsafe fn create_buffer(
        &self,
        device: &A::Device,
        size: u64,
        usage: hal::BufferUses,
        alloc_usage: gpu_alloc::UsageFlags,
    ) -> Result<DeviceMemoryBlock<A>, hal::DeviceError> {
        let (mut buffer, requirements) = device.create_buffer(&hal::BufferDescriptor {
            label: None,
            size,
            usage,
        })?;
        let block = self.raw.lock().alloc(
            device,
            gpu_alloc::Request {
                size: requirements.size,
                align_mask: requirements.alignment.max(1) - 1,
                usage: alloc_usage,
                memory_types: requirements.memory_type_bits & self.valid_memory_types,
            },
        )?;
        device.bind_buffer_memory(&mut buffer, block.memory(), block.offset())?;
        Ok(DeviceMemoryBlock {
            buffer,
            block,
            size,
        })
    }

    pub unsafe fn destroy_buffer(&self, device: &A::Device, block: DeviceMemoryBlock<A>) {
        let DeviceMemoryBlock { buffer, block, .. } = block;
        device.destroy_buffer(buffer);
        self.raw.lock().dealloc(device, block);
    }

    /// Raw memory for resources that are not buffers (the replacement
    /// acceleration structure).
    pub unsafe fn allocate_memory(
        &self,
        device: &A::Device,
        requirements: hal::MemoryRequirements,
        usage: gpu_alloc::UsageFlags,
    ) -> Result<gpu_alloc::MemoryBlock<A::Memory>, hal::DeviceError> {
        Ok(self.raw.lock().alloc(
            device,
            gpu_alloc::Request {
                size: requirements.size,
                align_mask: requirements.alignment.max(1) - 1,
                usage,
                memory_types: requirements.memory_type_bits & self.valid_memory_types,
            },
        )?)
    }

    pub unsafe fn free_memory(
        &self,
        device: &A::Device,
        block: gpu_alloc::MemoryBlock<A::Memory>,
    ) {
        self.raw.lock().dealloc(device, block);
    }

    /// Map the whole block, run `f` over its bytes, unmap.
    pub unsafe fn with_mapping<T>(
        &self,
        device: &A::Device,
        block: &mut DeviceMemoryBlock<A>,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T, hal::DeviceError> {
        let size = block.size as usize;
        let ptr = block.block.map(device, 0, size)?;
        let result = f(std::slice::from_raw_parts_mut(ptr.as_ptr(), size));
        block.block.unmap(device);
        Ok(result)
    }

    pub unsafe fn cleanup(&self, device: &A::Device) {
        self.raw.lock().cleanup(device);
    }
}

/// Chunked pool manager for the diagnostics descriptor sets.
pub(crate) struct DescriptorSetManager<A: Api> {
    raw: Mutex<gpu_descriptor::DescriptorAllocator<A::DescriptorPool, A::DescriptorSet>>,
    layout_counts: gpu_descriptor::DescriptorTotalCount,
}

pub(crate) type DiagnosticSet<A> = gpu_descriptor::DescriptorSet<<A as Api>::DescriptorSet>;

impl<A: Api> DescriptorSetManager<A> {
    pub fn new(max_update_after_bind: u32, storage_buffers_per_set: u32) -> Self {
        Self {
            raw: Mutex::new(gpu_descriptor::DescriptorAllocator::new(
                max_update_after_bind,
            )),
            layout_counts: gpu_descriptor::DescriptorTotalCount {
                storage_buffer: storage_buffers_per_set,
                ..Default::default()
            },
        }
    }

    pub unsafe fn allocate(
        &self,
        device: &A::Device,
        layout: &A::DescriptorSetLayout,
    ) -> Result<DiagnosticSet<A>, hal::DeviceError> {
        let mut sets = self
            .raw
            .lock()
            .allocate(
                device,
                layout,
                gpu_descriptor::DescriptorSetLayoutCreateFlags::empty(),
                &self.layout_counts,
                1,
            )
            .map_err(|err| {
                log::warn!("Descriptor set allocation failed: {}", err);
                hal::DeviceError::OutOfMemory
            })?;
        sets.pop().ok_or(hal::DeviceError::OutOfMemory)
    }

    pub unsafe fn free(&self, device: &A::Device, set: DiagnosticSet<A>) {
        self.raw.lock().free(device, Some(set));
    }

    pub unsafe fn cleanup(&self, device: &A::Device) {
        self.raw.lock().cleanup(device);
    }
}

//! Acceleration structure build validation.
//!
//! Top-level builds consume instance buffers full of opaque bottom-level
//! handles the driver will chase unchecked. A compute pass injected before
//! the build compares every handle against the set of structures that have
//! actually been built and swaps anything else for a known-good
//! replacement structure, so the build reads defined data and the original
//! handle gets reported after submission.

mod shader;

use hal::{Api, CommandEncoder as _, Device as _, Queue as _};

use crate::alloc::{DeviceMemoryBlock, DiagnosticSet, MemoryAllocator};
use crate::context::ValidationContext;
use crate::id::{AccelerationStructureId, CommandBufferId};
use crate::report::{ObjectRef, ReportLevel};
use crate::track::CapturedBindingState;
use crate::vuid;

/// Registry entry for an application acceleration structure.
pub(crate) struct TrackedAccel {
    pub kind: hal::AccelerationStructureKind,
    pub handle: u64,
    pub built: bool,
}

/// Lifecycle of the per-device validation machinery. `Initializing` is
/// only observable if initialization itself triggers a hook re-entry;
/// `Failed` is permanent and takes the whole subsystem with it.
pub(crate) enum AccelState<A: Api> {
    Uninitialized,
    Initializing,
    Ready(AccelResources<A>),
    Failed,
}

pub(crate) struct AccelResources<A: Api> {
    pipeline: A::Pipeline,
    pipeline_layout: A::PipelineLayout,
    replacement_as: A::AccelerationStructure,
    replacement_memory: Option<gpu_alloc::MemoryBlock<A::Memory>>,
    pub replacement_handle: u64,
}

impl<A: Api> AccelResources<A> {
    pub(crate) unsafe fn dispose(self, device: &A::Device, mem: &MemoryAllocator<A>) {
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.pipeline_layout);
        device.destroy_acceleration_structure(self.replacement_as);
        if let Some(memory) = self.replacement_memory {
            mem.free_memory(device, memory);
        }
    }
}

/// Scratch resources for one validated top-level build, freed when the
/// owning command buffer is reset.
pub struct AccelBuildResources<A: Api> {
    pub(crate) target: AccelerationStructureId,
    pub(crate) desc_set: DiagnosticSet<A>,
    pub(crate) buffer: DeviceMemoryBlock<A>,
}

// Word offsets in the validation buffer header; the handle table follows.
const INSTANCES_TO_VALIDATE: usize = 0;
const REPLACEMENT_HANDLE_LO: usize = 1;
const REPLACEMENT_HANDLE_HI: usize = 2;
const INVALID_HANDLE_FOUND: usize = 3;
const INVALID_HANDLE_LO: usize = 4;
const INVALID_HANDLE_HI: usize = 5;
const VALID_HANDLES_COUNT: usize = 6;
const HEADER_WORDS: usize = 7;

/// Instance records are 64 bytes, with the handle in the last 8.
const INSTANCE_SIZE: u64 = 64;

/// A top-level build command as seen by the layer.
pub struct AccelerationStructureBuildInfo<'a, A: Api> {
    pub dst: AccelerationStructureId,
    pub kind: hal::AccelerationStructureKind,
    pub instance_buffer: Option<&'a A::Buffer>,
    pub instance_offset: u64,
    pub instance_count: u32,
}

impl<A: Api> ValidationContext<A> {
    /// Bring up the build validator: build the replacement structure and
    /// the scanning pipeline. A missing ray tracing capability leaves the
    /// validator dormant; any real failure takes down the whole subsystem,
    /// since silently passing on half-validated builds is worse than no
    /// validation at all.
    pub fn initialize_acceleration_structure_validation(&mut self, queue: &mut A::Queue) {
        if self.aborted || !matches!(self.accel, AccelState::Uninitialized) {
            return;
        }
        if !self.capabilities.ray_tracing {
            return;
        }
        self.accel = AccelState::Initializing;
        match self.create_accel_validation_resources(queue) {
            Ok(resources) => {
                self.accel = AccelState::Ready(resources);
                self.sink.report(
                    ReportLevel::Info,
                    ObjectRef::Device,
                    vuid::UNASSIGNED,
                    "Acceleration Structure Building GPU Validation Enabled.",
                );
            }
            Err(message) => {
                self.accel = AccelState::Failed;
                self.abort_with(ObjectRef::Device, message);
            }
        }
    }

    fn create_accel_validation_resources(
        &mut self,
        queue: &mut A::Queue,
    ) -> Result<AccelResources<A>, &'static str> {
        let device = &self.device;

        // A minimal single-triangle bottom-level structure acts as the
        // replacement for invalid handles.
        let mut vbo = unsafe {
            self.mem.create_buffer(
                device,
                (std::mem::size_of::<f32>() * 9) as u64,
                hal::BufferUses::ACCELERATION_STRUCTURE_INPUT,
                gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD,
            )
        }
        .map_err(|_| "Failed to create vertex buffer for acceleration structure build validation.")?;
        let vertices: [f32; 9] = [1.0, 0.0, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0];
        let vbo_write = unsafe {
            self.mem.with_mapping(device, &mut vbo, |bytes| {
                for (chunk, value) in bytes.chunks_exact_mut(4).zip(vertices.iter()) {
                    chunk.copy_from_slice(&value.to_ne_bytes());
                }
            })
        };
        if vbo_write.is_err() {
            unsafe { self.mem.destroy_buffer(device, vbo) };
            return Err("Failed to map vertex buffer for acceleration structure build validation.");
        }

        let mut ibo = match unsafe {
            self.mem.create_buffer(
                device,
                (std::mem::size_of::<u32>() * 3) as u64,
                hal::BufferUses::ACCELERATION_STRUCTURE_INPUT,
                gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD,
            )
        } {
            Ok(ibo) => ibo,
            Err(_) => {
                unsafe { self.mem.destroy_buffer(device, vbo) };
                return Err(
                    "Failed to create index buffer for acceleration structure build validation.",
                );
            }
        };
        let indices: [u32; 3] = [0, 1, 2];
        let ibo_write = unsafe {
            self.mem.with_mapping(device, &mut ibo, |bytes| {
                for (chunk, value) in bytes.chunks_exact_mut(4).zip(indices.iter()) {
                    chunk.copy_from_slice(&value.to_ne_bytes());
                }
            })
        };
        if ibo_write.is_err() {
            unsafe {
                self.mem.destroy_buffer(device, vbo);
                self.mem.destroy_buffer(device, ibo);
            }
            return Err("Failed to map index buffer for acceleration structure build validation.");
        }

        // Everything below shares one cleanup path.
        let mut replacement_as = None;
        let mut replacement_memory = None;
        let mut scratch = None;
        let mut encoder = None;
        let mut pipeline_layout = None;
        let mut shader_module = None;

        let result = (|| -> Result<AccelResources<A>, &'static str> {
            let (mut accel, requirements) = unsafe {
                device.create_acceleration_structure(&hal::AccelerationStructureDescriptor {
                    label: Some("gpuav replacement blas"),
                    kind: hal::AccelerationStructureKind::BottomLevel,
                    geometry_count: 1,
                    instance_count: 0,
                })
            }
            .map_err(|_| {
                "Failed to create acceleration structure for acceleration structure build validation."
            })?;

            let memory = unsafe {
                self.mem
                    .allocate_memory(device, requirements, gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS)
            }
            .map_err(|_| {
                "Failed to alloc acceleration structure memory for acceleration structure build validation."
            });
            let memory = match memory {
                Ok(memory) => memory,
                Err(message) => {
                    unsafe { device.destroy_acceleration_structure(accel) };
                    return Err(message);
                }
            };

            let bind = unsafe {
                device.bind_acceleration_structure_memory(&mut accel, memory.memory(), 0)
            };
            replacement_memory = Some(memory);
            if bind.is_err() {
                unsafe { device.destroy_acceleration_structure(accel) };
                return Err(
                    "Failed to bind acceleration structure memory for acceleration structure build validation.",
                );
            }

            let handle = unsafe { device.acceleration_structure_handle(&accel) };
            replacement_as = Some(accel);
            let replacement_handle = handle.map_err(|_| {
                "Failed to get acceleration structure handle for acceleration structure build validation."
            })?;

            let scratch_requirements = unsafe {
                device.acceleration_structure_scratch_requirements(replacement_as.as_ref().unwrap())
            };
            scratch = Some(
                unsafe {
                    self.mem.create_buffer(
                        device,
                        scratch_requirements.size,
                        hal::BufferUses::ACCELERATION_STRUCTURE_SCRATCH,
                        gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
                    )
                }
                .map_err(|_| {
                    "Failed to create scratch buffer for acceleration structure build validation."
                })?,
            );

            let mut enc = unsafe { device.create_command_encoder(0) }.map_err(|_| {
                "Failed to create command buffer for acceleration structure build validation."
            })?;
            let geometry = hal::TriangleGeometry {
                vertex_buffer: &vbo.buffer,
                vertex_count: 3,
                vertex_stride: 12,
                index_buffer: &ibo.buffer,
                index_count: 3,
            };
            let record = unsafe {
                enc.begin().and_then(|()| {
                    enc.build_acceleration_structure(
                        replacement_as.as_ref().unwrap(),
                        &geometry,
                        &scratch.as_ref().unwrap().buffer,
                        0,
                    );
                    enc.end()
                })
            };
            encoder = Some(enc);
            record.map_err(|_| {
                "Failed to begin command buffer for acceleration structure build validation."
            })?;

            unsafe { queue.submit(&[encoder.as_ref().unwrap()]) }.map_err(|_| {
                "Failed to submit command buffer for acceleration structure build validation."
            })?;
            unsafe { queue.wait_idle() }.map_err(|_| {
                "Failed to wait for queue idle for acceleration structure build validation."
            })?;

            let debug_layout = self.debug_layout.as_ref().ok_or(
                "Failed to find descriptor set layout for acceleration structure build validation.",
            )?;
            let layout = unsafe {
                device.create_pipeline_layout(&hal::PipelineLayoutDescriptor {
                    label: Some("gpuav accel validation"),
                    set_layouts: &[debug_layout],
                })
            }
            .map_err(|_| {
                "Failed to create pipeline layout for acceleration structure build validation."
            })?;
            pipeline_layout = Some(layout);

            let words = shader::validation_shader_words();
            let module = unsafe { device.create_shader_module(&words) }.map_err(|_| {
                "Failed to create compute shader module for acceleration structure build validation."
            })?;
            shader_module = Some(module);

            let pipeline = unsafe {
                device.create_compute_pipeline(&hal::ComputePipelineDescriptor {
                    label: Some("gpuav accel validation"),
                    layout: pipeline_layout.as_ref().unwrap(),
                    module: shader_module.as_ref().unwrap(),
                    entry_point: "main",
                })
            }
            .map_err(|_| {
                "Failed to create compute pipeline for acceleration structure build validation."
            })?;

            Ok(AccelResources {
                pipeline,
                pipeline_layout: pipeline_layout.take().unwrap(),
                replacement_as: replacement_as.take().unwrap(),
                replacement_memory: replacement_memory.take(),
                replacement_handle,
            })
        })();

        // Build-time temporaries go away no matter how things went.
        unsafe {
            self.mem.destroy_buffer(device, vbo);
            self.mem.destroy_buffer(device, ibo);
            if let Some(scratch) = scratch {
                self.mem.destroy_buffer(device, scratch);
            }
            if let Some(encoder) = encoder {
                device.destroy_command_encoder(encoder);
            }
            if let Some(module) = shader_module {
                device.destroy_shader_module(module);
            }
        }
        if result.is_err() {
            unsafe {
                if let Some(layout) = pipeline_layout {
                    device.destroy_pipeline_layout(layout);
                }
                if let Some(accel) = replacement_as {
                    device.destroy_acceleration_structure(accel);
                }
                if let Some(memory) = replacement_memory {
                    self.mem.free_memory(device, memory);
                }
            }
        }
        result
    }

    /// Intercept a build command. Bottom-level builds only update the
    /// valid-handle registry; top-level builds get the scanning dispatch
    /// injected ahead of them.
    pub fn cmd_build_acceleration_structure(
        &mut self,
        cb: CommandBufferId,
        encoder: &mut A::CommandEncoder,
        info: &AccelerationStructureBuildInfo<'_, A>,
    ) {
        if let Some(tracked) = self.accel_structures.get_mut(&info.dst) {
            tracked.built = true;
        }
        self.cb_state_mut(cb).has_accel_build = true;

        if self.aborted || info.kind != hal::AccelerationStructureKind::TopLevel {
            return;
        }
        let replacement_handle = match &self.accel {
            AccelState::Ready(resources) => resources.replacement_handle,
            _ => return,
        };
        // An empty build is valid and needs no scan.
        let instance_buffer = match info.instance_buffer {
            Some(buffer) if info.instance_count > 0 => buffer,
            _ => return,
        };

        let valid_handles: Vec<u64> = self
            .accel_structures
            .values()
            .filter(|tracked| {
                tracked.built && tracked.kind == hal::AccelerationStructureKind::BottomLevel
            })
            .map(|tracked| tracked.handle)
            .collect();

        let buffer_size = ((HEADER_WORDS + 2 * valid_handles.len()) * 4) as u64;
        let mut validation_buffer = match unsafe {
            self.mem.create_buffer(
                &self.device,
                buffer_size,
                hal::BufferUses::STORAGE,
                gpu_alloc::UsageFlags::HOST_ACCESS
                    | gpu_alloc::UsageFlags::UPLOAD
                    | gpu_alloc::UsageFlags::DOWNLOAD,
            )
        } {
            Ok(buffer) => buffer,
            Err(_) => {
                self.abort_with(
                    ObjectRef::Device,
                    "Unable to allocate device memory. Device could become unstable.",
                );
                return;
            }
        };

        let populate = unsafe {
            self.mem
                .with_mapping(&self.device, &mut validation_buffer, |bytes| {
                    let mut words = vec![0u32; HEADER_WORDS + 2 * valid_handles.len()];
                    words[INSTANCES_TO_VALIDATE] = info.instance_count;
                    words[REPLACEMENT_HANDLE_LO] = replacement_handle as u32;
                    words[REPLACEMENT_HANDLE_HI] = (replacement_handle >> 32) as u32;
                    words[INVALID_HANDLE_FOUND] = 0;
                    words[INVALID_HANDLE_LO] = 0;
                    words[INVALID_HANDLE_HI] = 0;
                    words[VALID_HANDLES_COUNT] = valid_handles.len() as u32;
                    for (index, handle) in valid_handles.iter().enumerate() {
                        words[HEADER_WORDS + 2 * index] = *handle as u32;
                        words[HEADER_WORDS + 2 * index + 1] = (*handle >> 32) as u32;
                    }
                    for (chunk, word) in bytes.chunks_exact_mut(4).zip(&words) {
                        chunk.copy_from_slice(&word.to_ne_bytes());
                    }
                })
        };
        if populate.is_err() {
            unsafe { self.mem.destroy_buffer(&self.device, validation_buffer) };
            self.abort_with(
                ObjectRef::Device,
                "Unable to map acceleration structure build validation buffer.",
            );
            return;
        }

        let layout = match &self.debug_layout {
            Some(layout) => layout,
            None => {
                unsafe { self.mem.destroy_buffer(&self.device, validation_buffer) };
                return;
            }
        };
        let desc_set = match unsafe { self.desc_sets.allocate(&self.device, layout) } {
            Ok(set) => set,
            Err(_) => {
                unsafe { self.mem.destroy_buffer(&self.device, validation_buffer) };
                self.abort_with(
                    ObjectRef::Device,
                    "Unable to get descriptor set for acceleration structure build.",
                );
                return;
            }
        };

        let instance_range = INSTANCE_SIZE * info.instance_count as u64;
        unsafe {
            self.device.update_descriptor_sets(&[
                hal::DescriptorWrite {
                    set: desc_set.raw(),
                    binding: 0,
                    buffer: hal::BufferBinding {
                        buffer: instance_buffer,
                        offset: info.instance_offset,
                        size: instance_range,
                    },
                },
                hal::DescriptorWrite {
                    set: desc_set.raw(),
                    binding: 1,
                    buffer: hal::BufferBinding {
                        buffer: &validation_buffer.buffer,
                        offset: 0,
                        size: buffer_size,
                    },
                },
            ]);
        }

        let (pipeline, pipeline_layout) = match &self.accel {
            AccelState::Ready(resources) => {
                (resources.pipeline.clone(), resources.pipeline_layout.clone())
            }
            _ => unreachable!(),
        };

        // Anything previously written to the instance buffer must be
        // visible to the scanning dispatch.
        unsafe {
            encoder.pipeline_barrier(
                hal::PipelineStages::ALL_COMMANDS,
                hal::PipelineStages::COMPUTE_SHADER,
                &[hal::MemoryBarrier {
                    src_access: hal::AccessFlags::MEMORY_WRITE,
                    dst_access: hal::AccessFlags::SHADER_READ,
                }],
                &[],
            );
        }

        let captured = CapturedBindingState::capture(self.cb_state_mut(cb), gvt::BindPoint::Compute);
        unsafe {
            encoder.bind_pipeline(gvt::BindPoint::Compute, &pipeline);
            encoder.bind_descriptor_sets(
                gvt::BindPoint::Compute,
                &pipeline_layout,
                0,
                &[desc_set.raw()],
                &[],
            );
            encoder.dispatch([1, 1, 1]);

            // Patched handles must land before the build reads them.
            encoder.pipeline_barrier(
                hal::PipelineStages::COMPUTE_SHADER,
                hal::PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                &[],
                &[hal::BufferBarrier {
                    buffer: instance_buffer,
                    offset: info.instance_offset,
                    size: instance_range,
                    src_access: hal::AccessFlags::SHADER_WRITE,
                    dst_access: hal::AccessFlags::ACCELERATION_STRUCTURE_READ,
                }],
            );

            // Put the application's compute state back the way it was.
            captured.restore(encoder);
        }

        self.cb_state_mut(cb).accel_builds.push(AccelBuildResources {
            target: info.dst,
            desc_set,
            buffer: validation_buffer,
        });
    }

    /// Read back the validation buffers of a submitted command buffer and
    /// report any invalid handle the scan found.
    pub(crate) fn process_acceleration_structure_builds(&mut self, cb: CommandBufferId) {
        let has_builds = self
            .command_buffers
            .get(&cb)
            .map_or(false, |state| state.has_accel_build);
        if !has_builds {
            return;
        }

        let mut builds = match self.command_buffers.get_mut(&cb) {
            Some(state) => std::mem::take(&mut state.accel_builds),
            None => return,
        };
        for build in builds.iter_mut() {
            let header = unsafe {
                self.mem
                    .with_mapping(&self.device, &mut build.buffer, |bytes| {
                        let mut header = [0u32; HEADER_WORDS];
                        for (word, chunk) in header.iter_mut().zip(bytes.chunks_exact(4)) {
                            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        }
                        header
                    })
            };
            if let Ok(header) = header {
                if header[INVALID_HANDLE_FOUND] > 0 {
                    let invalid_handle = header[INVALID_HANDLE_LO] as u64
                        | (header[INVALID_HANDLE_HI] as u64) << 32;
                    self.sink.report(
                        ReportLevel::Error,
                        ObjectRef::AccelerationStructure(build.target),
                        vuid::ACCELERATION_STRUCTURE,
                        &format!(
                            "Attempted to build top level acceleration structure using invalid \
                             bottom level acceleration structure handle ({:#x})",
                            invalid_handle
                        ),
                    );
                }
            }
        }
        if let Some(state) = self.command_buffers.get_mut(&cb) {
            state.accel_builds = builds;
        }
    }
}

//! The device-lifetime validation context.
//!
//! One `ValidationContext` exists per logical device and owns every
//! registry the subsystem needs: instrumented shader trackers, the device
//! address table, per-command-buffer state, the diagnostics descriptor
//! layouts and the allocators behind the diagnostic buffers. The
//! interception glue calls into it around the driver calls it wraps;
//! nothing here ever fails the application's own call. The first setup
//! problem permanently degrades the context into a pass-through.

use std::collections::BTreeMap;
use std::sync::Arc;

use hal::{Api, Device as _};

use crate::accel::{AccelState, TrackedAccel};
use crate::alloc::{DescriptorSetManager, MemoryAllocator};
use crate::id::{
    AccelerationStructureId, BufferId, CommandBufferId, DescriptorSetId, DescriptorSetLayoutId,
    PipelineId, QueueId, ShaderModuleId,
};
use crate::instrument::{self, PassOptions};
use crate::report::{ObjectRef, ReportLevel, ReportSink};
use crate::track::{
    BoundDescriptorSet, BoundPipeline, CommandBufferState, DescriptorBindingLayout,
    DescriptorSetLayoutInfo, DescriptorSetState, PushConstantData, WrittenState,
};
use crate::vuid;
use crate::FastHashMap;

/// Bindings in the diagnostics descriptor set: output stream, descriptor
/// indexing input, buffer device address input.
pub(crate) const DIAGNOSTIC_BINDING_COUNT: u32 = 3;

/// Devices can report absurdly large descriptor set limits; the pipeline
/// layout padding has to materialize one dummy layout per unused slot, so
/// the reserved index is capped.
const MAX_ADJUSTED_DESCRIPTOR_SETS: u32 = 33;

/// Everything needed to decode records from one instrumented shader after
/// the fact. The original words are kept with pipeline lifetime because
/// the application may destroy the shader module long before submitting
/// work that uses it.
pub struct ShaderTracker {
    pub pipeline: Option<PipelineId>,
    pub shader_module: ShaderModuleId,
    pub words: Vec<u32>,
}

/// Result of instrumenting one shader module.
pub struct InstrumentedShader {
    /// Words to hand to the driver. Falls back to the original program
    /// when instrumentation fails.
    pub words: Vec<u32>,
    /// Unique id the instrumented code reports itself under.
    pub id: u32,
    pub instrumented: bool,
}

/// Layouts the interception glue appends to an application pipeline
/// layout: dummies up to the reserved slot, the diagnostics layout at it.
pub struct PipelineLayoutPadding<'a, A: Api> {
    pub dummy: &'a A::DescriptorSetLayout,
    pub diagnostics: &'a A::DescriptorSetLayout,
    /// Total set count of the padded layout.
    pub total_set_count: u32,
}

pub struct ValidationContext<A: Api> {
    pub(crate) device: A::Device,
    pub(crate) sink: Box<dyn ReportSink>,
    pub(crate) settings: gvt::GpuValidationSettings,
    pub(crate) capabilities: gvt::DeviceCapabilities,
    pub(crate) aborted: bool,
    /// Descriptor set index reserved for the diagnostics set.
    pub(crate) desc_set_bind_index: u32,
    pub(crate) adjusted_max_desc_sets: u32,
    /// Buffer device address checking is possible and enabled.
    pub(crate) bda_checks: bool,
    unique_shader_id: u32,

    pub(crate) debug_layout: Option<A::DescriptorSetLayout>,
    pub(crate) dummy_layout: Option<A::DescriptorSetLayout>,
    pub(crate) mem: MemoryAllocator<A>,
    pub(crate) desc_sets: DescriptorSetManager<A>,

    pub(crate) shader_map: FastHashMap<u32, ShaderTracker>,
    /// Device address -> allocated size, ascending. Feeds the per-command
    /// address table.
    pub(crate) address_map: BTreeMap<u64, u64>,
    buffer_addresses: FastHashMap<BufferId, u64>,
    pub(crate) command_buffers: FastHashMap<CommandBufferId, CommandBufferState<A>>,
    descriptor_layouts: FastHashMap<DescriptorSetLayoutId, Arc<DescriptorSetLayoutInfo>>,
    pub(crate) descriptor_sets: FastHashMap<DescriptorSetId, DescriptorSetState>,
    /// Lazily recorded per-queue barrier command buffers; `None` marks a
    /// queue where creation already failed.
    pub(crate) queue_barriers: FastHashMap<QueueId, Option<A::CommandEncoder>>,
    pub(crate) accel: AccelState<A>,
    pub(crate) accel_structures: FastHashMap<AccelerationStructureId, TrackedAccel>,
}

impl<A: Api> ValidationContext<A> {
    pub fn new(
        device: A::Device,
        settings: gvt::GpuValidationSettings,
        sink: Box<dyn ReportSink>,
    ) -> Self {
        let properties = device.properties();
        let capabilities = properties.capabilities;

        let mut settings = settings;
        if capabilities.robust_buffer_access {
            // The driver already clamps buffer accesses; shader-side
            // bounds checks would only report what cannot happen.
            settings.buffer_oob = false;
        }

        let mem = MemoryAllocator::new(&properties);
        let desc_sets = DescriptorSetManager::new(
            properties.max_update_after_bind_descriptors,
            DIAGNOSTIC_BINDING_COUNT,
        );

        let mut context = Self {
            device,
            sink,
            settings,
            capabilities,
            aborted: false,
            desc_set_bind_index: 0,
            adjusted_max_desc_sets: 0,
            bda_checks: false,
            unique_shader_id: 0,
            debug_layout: None,
            dummy_layout: None,
            mem,
            desc_sets,
            shader_map: FastHashMap::default(),
            address_map: BTreeMap::new(),
            buffer_addresses: FastHashMap::default(),
            command_buffers: FastHashMap::default(),
            descriptor_layouts: FastHashMap::default(),
            descriptor_sets: FastHashMap::default(),
            queue_barriers: FastHashMap::default(),
            accel: AccelState::Uninitialized,
            accel_structures: FastHashMap::default(),
        };
        context.initialize(&properties);
        context
    }

    fn initialize(&mut self, properties: &hal::DeviceProperties) {
        if !self.capabilities.supports_required_features() {
            self.report_setup_problem(
                ObjectRef::Device,
                "GPU-Assisted validation requires API version 1.1 and the \
                 fragmentStoresAndAtomics and vertexPipelineStoresAndAtomics features. \
                 GPU-Assisted validation disabled.",
            );
            self.aborted = true;
            return;
        }

        if self.capabilities.buffer_device_address && !self.capabilities.shader_int64 {
            self.sink.report(
                ReportLevel::Warning,
                ObjectRef::Device,
                vuid::SETUP_WARNING,
                "shaderInt64 feature is not available. No buffer device address checking \
                 will be attempted",
            );
        }
        self.bda_checks =
            self.capabilities.buffer_device_address && self.capabilities.shader_int64;

        self.adjusted_max_desc_sets = properties
            .limits
            .max_bound_descriptor_sets
            .min(MAX_ADJUSTED_DESCRIPTOR_SETS);
        if self.adjusted_max_desc_sets <= 1 {
            self.report_setup_problem(
                ObjectRef::Device,
                "Device can bind only a single descriptor set.",
            );
            self.aborted = true;
            return;
        }
        self.desc_set_bind_index = self.adjusted_max_desc_sets - 1;

        let visibility = gvt::ShaderStages::ALL_GRAPHICS
            | gvt::ShaderStages::COMPUTE
            | gvt::ShaderStages::TASK
            | gvt::ShaderStages::MESH
            | gvt::ShaderStages::ALL_RAY_TRACING;
        let entries: Vec<hal::DescriptorSetLayoutEntry> = (0..DIAGNOSTIC_BINDING_COUNT)
            .map(|binding| hal::DescriptorSetLayoutEntry {
                binding,
                ty: hal::DescriptorType::StorageBuffer,
                count: 1,
                visibility,
            })
            .collect();

        let debug_layout = unsafe {
            self.device
                .create_descriptor_set_layout(&hal::DescriptorSetLayoutDescriptor {
                    label: Some("gpuav diagnostics"),
                    entries: &entries,
                })
        };
        let dummy_layout = unsafe {
            self.device
                .create_descriptor_set_layout(&hal::DescriptorSetLayoutDescriptor {
                    label: Some("gpuav padding"),
                    entries: &[],
                })
        };
        match (debug_layout, dummy_layout) {
            (Ok(debug), Ok(dummy)) => {
                self.debug_layout = Some(debug);
                self.dummy_layout = Some(dummy);
            }
            (debug, dummy) => {
                self.report_setup_problem(
                    ObjectRef::Device,
                    "Unable to create descriptor set layout.",
                );
                unsafe {
                    if let Ok(layout) = debug {
                        self.device.destroy_descriptor_set_layout(layout);
                    }
                    if let Ok(layout) = dummy {
                        self.device.destroy_descriptor_set_layout(layout);
                    }
                }
                self.aborted = true;
            }
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn device(&self) -> &A::Device {
        &self.device
    }

    /// Index the diagnostics descriptor set is bound at.
    pub fn reserved_set_index(&self) -> u32 {
        self.desc_set_bind_index
    }

    pub(crate) fn report_setup_problem(&self, object: ObjectRef, message: &str) {
        self.sink
            .report(ReportLevel::Error, object, vuid::SETUP_ERROR, message);
    }

    pub(crate) fn abort_with(&mut self, object: ObjectRef, message: &str) {
        self.report_setup_problem(object, message);
        self.aborted = true;
    }

    // ---- shader modules & pipelines -----------------------------------

    /// Rewrite a shader module's code before the driver sees it. Always
    /// returns something the driver can run; on instrumentation failure
    /// that is the original program, unwatched.
    pub fn instrument_shader(&mut self, module: ShaderModuleId, code: &[u32]) -> InstrumentedShader {
        if self.aborted {
            return InstrumentedShader {
                words: code.to_vec(),
                id: 0,
                instrumented: false,
            };
        }

        self.unique_shader_id += 1;
        let id = self.unique_shader_id;
        let options = PassOptions {
            reserved_set: self.desc_set_bind_index,
            shader_id: id,
            descriptor_indexing: self.settings.descriptor_indexing
                && self.capabilities.descriptor_indexing,
            buffer_oob: self.settings.buffer_oob,
            buffer_device_address: self.bda_checks,
        };

        // Keep the original program: the decoder wants its debug
        // information even after the application destroys the module.
        self.shader_map.insert(
            id,
            ShaderTracker {
                pipeline: None,
                shader_module: module,
                words: code.to_vec(),
            },
        );

        match instrument::instrument(code, &options) {
            Ok(words) => InstrumentedShader {
                words,
                id,
                instrumented: true,
            },
            Err(err) => {
                self.report_setup_problem(
                    ObjectRef::Device,
                    &format!(
                        "Failure to instrument shader ({}). Proceeding with non-instrumented shader.",
                        err
                    ),
                );
                InstrumentedShader {
                    words: code.to_vec(),
                    id,
                    instrumented: false,
                }
            }
        }
    }

    /// Associate the instrumented shaders of a freshly created pipeline
    /// with its handle, completing their trackers.
    pub fn register_pipeline(&mut self, pipeline: PipelineId, shader_ids: &[u32]) {
        for id in shader_ids {
            if let Some(tracker) = self.shader_map.get_mut(id) {
                tracker.pipeline = Some(pipeline);
            }
        }
    }

    /// Remove all shader trackers owned by a destroyed pipeline.
    pub fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.shader_map
            .retain(|_, tracker| tracker.pipeline != Some(pipeline));
    }

    /// Padding layouts for an application pipeline layout, or `None` when
    /// the layout cannot be extended (too many sets, or the context is
    /// degraded) and must pass through unmodified.
    pub fn pipeline_layout_padding(&self, set_layout_count: u32) -> Option<PipelineLayoutPadding<'_, A>> {
        if self.aborted {
            return None;
        }
        if set_layout_count >= self.adjusted_max_desc_sets {
            self.report_setup_problem(
                ObjectRef::Device,
                &format!(
                    "Pipeline Layout conflict with validation's descriptor set at slot {}. \
                     Application has too many descriptor sets in the pipeline layout to \
                     continue with gpu validation. Validation is not modifying the pipeline \
                     layout. Instrumented shaders are replaced with non-instrumented shaders.",
                    self.desc_set_bind_index
                ),
            );
            return None;
        }
        match (&self.dummy_layout, &self.debug_layout) {
            (Some(dummy), Some(diagnostics)) => Some(PipelineLayoutPadding {
                dummy,
                diagnostics,
                total_set_count: self.adjusted_max_desc_sets,
            }),
            _ => None,
        }
    }

    /// Outcome of the (possibly padded) pipeline layout creation. A failed
    /// creation means instrumented pipelines can no longer be completed.
    pub fn pipeline_layout_created(&mut self, success: bool) {
        if !success && !self.aborted {
            self.abort_with(
                ObjectRef::Device,
                "Unable to create pipeline layout. Device could become unstable.",
            );
        }
    }

    /// Whether a pipeline with this many descriptor set layouts needs its
    /// instrumented shaders swapped back for the originals.
    pub fn pipeline_needs_uninstrumented_shaders(&self, set_layout_count: u32) -> bool {
        set_layout_count >= self.adjusted_max_desc_sets
    }

    // ---- device limit & buffer creation fixups ------------------------

    /// Instance buffers for acceleration structure builds also get scanned
    /// by the validation compute pass, which reads them as storage
    /// buffers.
    pub fn patch_buffer_usage(&self, usage: hal::BufferUses) -> hal::BufferUses {
        if usage.contains(hal::BufferUses::ACCELERATION_STRUCTURE_INPUT) {
            usage | hal::BufferUses::STORAGE
        } else {
            usage
        }
    }

    /// Hide the reserved descriptor set slot from the application when
    /// slot budgeting is on.
    pub fn adjust_descriptor_set_limit(&self, reported: u32) -> u32 {
        if !self.settings.reserve_binding_slot || reported == 0 {
            return reported;
        }
        if reported > 1 {
            reported - 1
        } else {
            self.sink.report(
                ReportLevel::Warning,
                ObjectRef::Device,
                vuid::SETUP_WARNING,
                "Unable to reserve descriptor binding slot on a device with only one slot.",
            );
            reported
        }
    }

    /// A host-stage wait inside a command buffer can deadlock against the
    /// layer's own queue-idle wait.
    pub fn check_wait_events_stages(&self, cb: CommandBufferId, src_stages: hal::PipelineStages) {
        if src_stages.contains(hal::PipelineStages::HOST) {
            self.report_setup_problem(
                ObjectRef::CommandBuffer(cb),
                "CmdWaitEvents recorded with a host source stage. GPU-Assisted validation \
                 waits on queue completion. This wait could block the host's signaling of \
                 this event, resulting in deadlock.",
            );
        }
    }

    // ---- buffer device addresses --------------------------------------

    pub fn buffer_device_address_queried(&mut self, buffer: BufferId, address: u64, size: u64) {
        self.address_map.insert(address, size);
        self.buffer_addresses.insert(buffer, address);
    }

    pub fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(address) = self.buffer_addresses.remove(&buffer) {
            self.address_map.remove(&address);
        }
    }

    // ---- descriptor state tracking ------------------------------------

    pub fn register_descriptor_set_layout(
        &mut self,
        layout: DescriptorSetLayoutId,
        bindings: Vec<DescriptorBindingLayout>,
    ) {
        self.descriptor_layouts
            .insert(layout, Arc::new(DescriptorSetLayoutInfo::new(bindings)));
    }

    pub fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutId) {
        self.descriptor_layouts.remove(&layout);
    }

    pub fn register_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        layout: DescriptorSetLayoutId,
        variable_count: u32,
    ) {
        if let Some(info) = self.descriptor_layouts.get(&layout) {
            self.descriptor_sets
                .insert(set, DescriptorSetState::new(Arc::clone(info), variable_count));
        }
    }

    pub fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        binding: u32,
        array_element: u32,
        states: &[WrittenState],
    ) {
        if let Some(state) = self.descriptor_sets.get_mut(&set) {
            state.write(binding, array_element, states);
        }
    }

    pub fn destroy_descriptor_set(&mut self, set: DescriptorSetId) {
        self.descriptor_sets.remove(&set);
    }

    // ---- command buffer state tracking --------------------------------

    pub(crate) fn cb_state_mut(&mut self, cb: CommandBufferId) -> &mut CommandBufferState<A> {
        self.command_buffers.entry(cb).or_default()
    }

    pub fn cmd_bind_pipeline(
        &mut self,
        cb: CommandBufferId,
        bind_point: gvt::BindPoint,
        pipeline: PipelineId,
        raw: A::Pipeline,
        layout: A::PipelineLayout,
        layout_set_count: u32,
    ) {
        self.cb_state_mut(cb).bound_mut(bind_point).pipeline = Some(BoundPipeline {
            id: pipeline,
            raw,
            layout,
            layout_set_count,
        });
    }

    pub fn cmd_bind_descriptor_sets(
        &mut self,
        cb: CommandBufferId,
        bind_point: gvt::BindPoint,
        first_set: u32,
        sets: Vec<BoundDescriptorSet<A>>,
    ) {
        self.cb_state_mut(cb)
            .bound_mut(bind_point)
            .bind_sets(first_set, sets);
    }

    pub fn cmd_push_constants(
        &mut self,
        cb: CommandBufferId,
        stages: gvt::ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        self.cb_state_mut(cb).push_constants.push(PushConstantData {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    /// A secondary command buffer was recorded into `cb`; its diagnostic
    /// buffers are harvested along with the primary's.
    pub fn cmd_execute_commands(&mut self, cb: CommandBufferId, secondaries: &[CommandBufferId]) {
        self.cb_state_mut(cb)
            .linked_secondaries
            .extend_from_slice(secondaries);
    }

    /// Free every diagnostic resource tied to a reset command buffer.
    pub fn reset_command_buffer(&mut self, cb: CommandBufferId) {
        if self.aborted {
            self.command_buffers.remove(&cb);
            return;
        }
        if let Some(state) = self.command_buffers.remove(&cb) {
            for resources in state.resources {
                unsafe {
                    self.mem.destroy_buffer(&self.device, resources.output_block);
                    if let Some(input) = resources.di_input_block {
                        self.mem.destroy_buffer(&self.device, input.block);
                    }
                    if let Some(input) = resources.bda_input_block {
                        self.mem.destroy_buffer(&self.device, input);
                    }
                    self.desc_sets.free(&self.device, resources.desc_set);
                }
            }
            for build in state.accel_builds {
                unsafe {
                    self.mem.destroy_buffer(&self.device, build.buffer);
                    self.desc_sets.free(&self.device, build.desc_set);
                }
            }
        }
    }

    // ---- acceleration structure registry ------------------------------

    pub fn register_acceleration_structure(
        &mut self,
        id: AccelerationStructureId,
        kind: hal::AccelerationStructureKind,
    ) {
        self.accel_structures.insert(
            id,
            TrackedAccel {
                kind,
                handle: 0,
                built: false,
            },
        );
    }

    /// Record the opaque handle after the structure's memory is bound.
    pub fn acceleration_structure_handle_known(&mut self, id: AccelerationStructureId, handle: u64) {
        if let Some(tracked) = self.accel_structures.get_mut(&id) {
            tracked.handle = handle;
        }
    }

    pub fn destroy_acceleration_structure(&mut self, id: AccelerationStructureId) {
        self.accel_structures.remove(&id);
    }
}

impl<A: Api> Drop for ValidationContext<A> {
    fn drop(&mut self) {
        unsafe {
            for (_, encoder) in self.queue_barriers.drain() {
                if let Some(encoder) = encoder {
                    self.device.destroy_command_encoder(encoder);
                }
            }
            for (_, state) in std::mem::take(&mut self.command_buffers) {
                for resources in state.resources {
                    self.mem.destroy_buffer(&self.device, resources.output_block);
                    if let Some(input) = resources.di_input_block {
                        self.mem.destroy_buffer(&self.device, input.block);
                    }
                    if let Some(input) = resources.bda_input_block {
                        self.mem.destroy_buffer(&self.device, input);
                    }
                    self.desc_sets.free(&self.device, resources.desc_set);
                }
                for build in state.accel_builds {
                    self.mem.destroy_buffer(&self.device, build.buffer);
                    self.desc_sets.free(&self.device, build.desc_set);
                }
            }
            if let AccelState::Ready(resources) =
                std::mem::replace(&mut self.accel, AccelState::Failed)
            {
                resources.dispose(&self.device, &self.mem);
            }
            if let Some(layout) = self.debug_layout.take() {
                self.device.destroy_descriptor_set_layout(layout);
            }
            if let Some(layout) = self.dummy_layout.take() {
                self.device.destroy_descriptor_set_layout(layout);
            }
            self.desc_sets.cleanup(&self.device);
            self.mem.cleanup(&self.device);
        }
    }
}

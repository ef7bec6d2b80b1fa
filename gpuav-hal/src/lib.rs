/*! Driver abstraction for the GPU-assisted validation layer.
 *
 *  The validation core never talks to a concrete graphics API. Everything it
 *  needs from the driver (buffers and the memory behind them, descriptor
 *  pools and sets, shader modules, compute pipelines, recording of its own
 *  injected commands, submission and queue idling) is expressed as the
 *  trait family below, with one [`Api`] implementation per backend. The
 *  driver objects owned by the hosting application (pipelines, descriptor
 *  sets, buffers) appear only as cloneable opaque handles.
 */

pub mod null;

use std::fmt;

pub type Label<'a> = Option<&'a str>;
pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device is lost")]
    Lost,
}

impl From<gpu_alloc::AllocationError> for DeviceError {
    fn from(error: gpu_alloc::AllocationError) -> Self {
        use gpu_alloc::AllocationError as Ae;
        match error {
            Ae::OutOfDeviceMemory | Ae::OutOfHostMemory => Self::OutOfMemory,
            _ => {
                log::error!("memory allocation: {:?}", error);
                Self::Lost
            }
        }
    }
}

impl From<gpu_alloc::MapError> for DeviceError {
    fn from(error: gpu_alloc::MapError) -> Self {
        use gpu_alloc::MapError as Me;
        match error {
            Me::OutOfDeviceMemory | Me::OutOfHostMemory => Self::OutOfMemory,
            _ => {
                log::error!("memory mapping: {:?}", error);
                Self::Lost
            }
        }
    }
}

bitflags::bitflags! {
    /// Buffer usages the layer itself requests or patches in.
    pub struct BufferUses: u32 {
        const STORAGE = 1 << 0;
        const ACCELERATION_STRUCTURE_INPUT = 1 << 1;
        const ACCELERATION_STRUCTURE_SCRATCH = 1 << 2;
    }
}

bitflags::bitflags! {
    pub struct PipelineStages: u32 {
        const ALL_COMMANDS = 1 << 0;
        const COMPUTE_SHADER = 1 << 1;
        const HOST = 1 << 2;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 3;
    }
}

bitflags::bitflags! {
    pub struct AccessFlags: u32 {
        const MEMORY_WRITE = 1 << 0;
        const SHADER_READ = 1 << 1;
        const SHADER_WRITE = 1 << 2;
        const HOST_READ = 1 << 3;
        const ACCELERATION_STRUCTURE_READ = 1 << 4;
    }
}

#[derive(Clone, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: Label<'a>,
    pub size: u64,
    pub usage: BufferUses,
}

/// Memory placement requirements of a freshly created resource, fed into
/// the `gpu-alloc` request.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    StorageBuffer,
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorSetLayoutEntry {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub visibility: gvt::ShaderStages,
}

#[derive(Clone, Debug)]
pub struct DescriptorSetLayoutDescriptor<'a> {
    pub label: Label<'a>,
    pub entries: &'a [DescriptorSetLayoutEntry],
}

#[derive(Clone, Debug)]
pub struct BufferBinding<'a, A: Api> {
    pub buffer: &'a A::Buffer,
    pub offset: u64,
    pub size: u64,
}

/// One storage-buffer descriptor write. The layer only ever writes storage
/// buffers, so the shape stays deliberately narrow.
#[derive(Clone, Debug)]
pub struct DescriptorWrite<'a, A: Api> {
    pub set: &'a A::DescriptorSet,
    pub binding: u32,
    pub buffer: BufferBinding<'a, A>,
}

#[derive(Clone, Debug)]
pub struct PipelineLayoutDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub set_layouts: &'a [&'a A::DescriptorSetLayout],
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub layout: &'a A::PipelineLayout,
    pub module: &'a A::ShaderModule,
    pub entry_point: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Triangle geometry for a bottom-level build. The layer only builds one
/// minimal single-triangle structure (the replacement structure), so index
/// and vertex data are always fully described.
#[derive(Clone, Debug)]
pub struct TriangleGeometry<'a, A: Api> {
    pub vertex_buffer: &'a A::Buffer,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub index_buffer: &'a A::Buffer,
    pub index_count: u32,
}

#[derive(Clone, Debug)]
pub struct AccelerationStructureDescriptor<'a> {
    pub label: Label<'a>,
    pub kind: AccelerationStructureKind,
    pub geometry_count: u32,
    pub instance_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Clone, Debug)]
pub struct BufferBarrier<'a, A: Api> {
    pub buffer: &'a A::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Everything the layer needs to know about the device up front.
#[derive(Debug)]
pub struct DeviceProperties {
    pub alloc: gpu_alloc::DeviceProperties<'static>,
    /// Memory types the layer is allowed to place its buffers in.
    pub valid_memory_types: u32,
    pub limits: gvt::DeviceLimits,
    pub capabilities: gvt::DeviceCapabilities,
    pub max_update_after_bind_descriptors: u32,
}

pub trait Api: Clone + Sized + 'static {
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type CommandEncoder: CommandEncoder<Self>;

    /// Raw device memory object, the `gpu-alloc` currency.
    type Memory: fmt::Debug + Send + Sync + 'static;
    type Buffer: Clone + fmt::Debug + Send + Sync + 'static;
    type ShaderModule: fmt::Debug + Send + Sync + 'static;
    type DescriptorSetLayout: fmt::Debug + Send + Sync + 'static;
    type DescriptorPool: fmt::Debug + Send + Sync + 'static;
    type DescriptorSet: Clone + fmt::Debug + Send + Sync + 'static;
    type PipelineLayout: Clone + fmt::Debug + Send + Sync + 'static;
    type Pipeline: Clone + fmt::Debug + Send + Sync + 'static;
    type AccelerationStructure: fmt::Debug + Send + Sync + 'static;
}

pub trait Device<A: Api>:
    gpu_alloc::MemoryDevice<A::Memory>
    + gpu_descriptor::DescriptorDevice<A::DescriptorSetLayout, A::DescriptorPool, A::DescriptorSet>
    + Send
    + Sync
{
    fn properties(&self) -> DeviceProperties;

    /// Create a buffer without backing memory; the caller allocates a block
    /// through `gpu-alloc` and binds it with [`Device::bind_buffer_memory`].
    unsafe fn create_buffer(
        &self,
        desc: &BufferDescriptor<'_>,
    ) -> DeviceResult<(A::Buffer, MemoryRequirements)>;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: &mut A::Buffer,
        memory: &A::Memory,
        offset: u64,
    ) -> DeviceResult<()>;
    unsafe fn destroy_buffer(&self, buffer: A::Buffer);

    unsafe fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDescriptor<'_>,
    ) -> DeviceResult<A::DescriptorSetLayout>;
    unsafe fn destroy_descriptor_set_layout(&self, layout: A::DescriptorSetLayout);

    /// One batched update covering every binding of the diagnostics set.
    unsafe fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_, A>]);

    unsafe fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<'_, A>,
    ) -> DeviceResult<A::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: A::PipelineLayout);

    unsafe fn create_shader_module(&self, spirv: &[u32]) -> DeviceResult<A::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: A::ShaderModule);

    unsafe fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<'_, A>,
    ) -> DeviceResult<A::Pipeline>;
    unsafe fn destroy_pipeline(&self, pipeline: A::Pipeline);

    unsafe fn create_command_encoder(&self, queue_family: u32) -> DeviceResult<A::CommandEncoder>;
    unsafe fn destroy_command_encoder(&self, encoder: A::CommandEncoder);

    unsafe fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDescriptor<'_>,
    ) -> DeviceResult<(A::AccelerationStructure, MemoryRequirements)>;
    unsafe fn bind_acceleration_structure_memory(
        &self,
        accel: &mut A::AccelerationStructure,
        memory: &A::Memory,
        offset: u64,
    ) -> DeviceResult<()>;
    /// The opaque 64-bit handle instance buffers refer to the structure by.
    unsafe fn acceleration_structure_handle(
        &self,
        accel: &A::AccelerationStructure,
    ) -> DeviceResult<u64>;
    unsafe fn acceleration_structure_scratch_requirements(
        &self,
        accel: &A::AccelerationStructure,
    ) -> MemoryRequirements;
    unsafe fn destroy_acceleration_structure(&self, accel: A::AccelerationStructure);
}

pub trait Queue<A: Api>: Send + Sync {
    unsafe fn submit(&mut self, command_buffers: &[&A::CommandEncoder]) -> DeviceResult<()>;
    /// Block until all submitted work on this queue has completed.
    unsafe fn wait_idle(&mut self) -> DeviceResult<()>;
}

pub trait CommandEncoder<A: Api>: Send + Sync {
    unsafe fn begin(&mut self) -> DeviceResult<()>;
    unsafe fn end(&mut self) -> DeviceResult<()>;

    unsafe fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        memory_barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferBarrier<'_, A>],
    );

    unsafe fn bind_pipeline(&mut self, bind_point: gvt::BindPoint, pipeline: &A::Pipeline);
    unsafe fn bind_descriptor_sets(
        &mut self,
        bind_point: gvt::BindPoint,
        layout: &A::PipelineLayout,
        first_set: u32,
        sets: &[&A::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    unsafe fn push_constants(
        &mut self,
        layout: &A::PipelineLayout,
        stages: gvt::ShaderStages,
        offset: u32,
        data: &[u8],
    );
    unsafe fn dispatch(&mut self, count: [u32; 3]);

    unsafe fn build_acceleration_structure(
        &mut self,
        dst: &A::AccelerationStructure,
        geometry: &TriangleGeometry<'_, A>,
        scratch: &A::Buffer,
        scratch_offset: u64,
    );
}

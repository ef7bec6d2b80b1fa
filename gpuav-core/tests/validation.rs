//! End-to-end tests of the validation context against a mock driver with
//! host-backed memory, failure injection and call counting.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use gpuav_core::instrument::module::{Instruction, SpirvModule};
use gpuav_core::{
    id, record, AccelerationStructureBuildInfo, ObjectRef, ReportLevel, ReportSink,
    ValidationContext,
};
use gvt::{BindPoint, CommandKind};
use hal::Api;
use spirv::Op;

// ---- mock driver ------------------------------------------------------

struct Bytes(UnsafeCell<Box<[u8]>>);
unsafe impl Send for Bytes {}
unsafe impl Sync for Bytes {}

impl Bytes {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self(UnsafeCell::new(vec![0u8; size].into_boxed_slice())))
    }

    unsafe fn slice(&self) -> &mut [u8] {
        &mut *self.0.get()
    }
}

#[derive(Debug)]
struct MockMemory {
    bytes: Arc<Bytes>,
}

impl std::fmt::Debug for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Bytes")
    }
}

#[derive(Clone, Debug)]
struct MockBuffer {
    id: u64,
    size: u64,
}

#[derive(Clone, Debug)]
struct MockSet {
    id: u64,
}

#[derive(Clone, Debug)]
struct MockPipeline {
    id: u64,
}

#[derive(Clone, Debug)]
struct MockPipelineLayout;

#[derive(Debug)]
struct MockShaderModule;

#[derive(Debug)]
struct MockSetLayout;

#[derive(Debug)]
struct MockPool;

#[derive(Debug)]
struct MockAccel;

#[derive(Clone, Debug, PartialEq)]
enum Cmd {
    Begin,
    End,
    MemoryBarrier,
    BufferBarrier(u64),
    BindPipeline(BindPoint, u64),
    BindSets {
        bind_point: BindPoint,
        first_set: u32,
        sets: Vec<u64>,
    },
    PushConstants,
    Dispatch([u32; 3]),
    BuildAccelerationStructure,
}

#[derive(Clone, Debug)]
struct DescriptorWriteLog {
    set: u64,
    binding: u32,
    buffer: u64,
    offset: u64,
    size: u64,
}

struct BufferBacking {
    bytes: Arc<Bytes>,
    offset: u64,
    size: u64,
}

#[derive(Default)]
struct Shared {
    caps: Mutex<gvt::DeviceCapabilities>,
    next_id: AtomicU64,
    wait_idle_calls: AtomicU32,
    submit_calls: AtomicU32,
    fail_buffer_create: AtomicBool,
    fail_descriptor_alloc: AtomicBool,
    backings: Mutex<HashMap<u64, BufferBacking>>,
    descriptor_writes: Mutex<Vec<DescriptorWriteLog>>,
}

impl Shared {
    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn last_write_for_binding(&self, binding: u32) -> Option<DescriptorWriteLog> {
        self.descriptor_writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|write| write.binding == binding)
            .cloned()
    }

    fn write_buffer(&self, buffer: u64, offset: usize, data: &[u8]) {
        let backings = self.backings.lock().unwrap();
        let backing = backings.get(&buffer).expect("buffer has no memory bound");
        assert!((offset + data.len()) as u64 <= backing.size);
        let bytes = unsafe { backing.bytes.slice() };
        let start = backing.offset as usize + offset;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    fn read_buffer_u32(&self, buffer: u64, word: usize) -> u32 {
        let backings = self.backings.lock().unwrap();
        let backing = backings.get(&buffer).expect("buffer has no memory bound");
        let bytes = unsafe { backing.bytes.slice() };
        let start = backing.offset as usize + word * 4;
        u32::from_ne_bytes([
            bytes[start],
            bytes[start + 1],
            bytes[start + 2],
            bytes[start + 3],
        ])
    }

    fn write_buffer_u32(&self, buffer: u64, word: usize, value: u32) {
        self.write_buffer(buffer, word * 4, &value.to_ne_bytes());
    }
}

#[derive(Clone)]
struct MockApi;

struct MockDevice {
    shared: Arc<Shared>,
}

struct MockQueue {
    shared: Arc<Shared>,
}

struct MockEncoder {
    commands: Arc<Mutex<Vec<Cmd>>>,
}

impl MockEncoder {
    fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn log(&self) -> Vec<Cmd> {
        self.commands.lock().unwrap().clone()
    }
}

impl Api for MockApi {
    type Device = MockDevice;
    type Queue = MockQueue;
    type CommandEncoder = MockEncoder;

    type Memory = MockMemory;
    type Buffer = MockBuffer;
    type ShaderModule = MockShaderModule;
    type DescriptorSetLayout = MockSetLayout;
    type DescriptorPool = MockPool;
    type DescriptorSet = MockSet;
    type PipelineLayout = MockPipelineLayout;
    type Pipeline = MockPipeline;
    type AccelerationStructure = MockAccel;
}

impl gpu_alloc::MemoryDevice<MockMemory> for MockDevice {
    unsafe fn allocate_memory(
        &self,
        size: u64,
        _memory_type: u32,
        _flags: gpu_alloc::AllocationFlags,
    ) -> Result<MockMemory, gpu_alloc::OutOfMemory> {
        Ok(MockMemory {
            bytes: Bytes::new(size as usize),
        })
    }

    unsafe fn deallocate_memory(&self, memory: MockMemory) {
        drop(memory);
    }

    unsafe fn map_memory(
        &self,
        memory: &mut MockMemory,
        offset: u64,
        _size: u64,
    ) -> Result<NonNull<u8>, gpu_alloc::DeviceMapError> {
        NonNull::new(memory.bytes.slice().as_mut_ptr().add(offset as usize))
            .ok_or(gpu_alloc::DeviceMapError::MapFailed)
    }

    unsafe fn unmap_memory(&self, _memory: &mut MockMemory) {}

    unsafe fn invalidate_memory_ranges(
        &self,
        _ranges: &[gpu_alloc::MappedMemoryRange<'_, MockMemory>],
    ) -> Result<(), gpu_alloc::OutOfMemory> {
        Ok(())
    }

    unsafe fn flush_memory_ranges(
        &self,
        _ranges: &[gpu_alloc::MappedMemoryRange<'_, MockMemory>],
    ) -> Result<(), gpu_alloc::OutOfMemory> {
        Ok(())
    }
}

impl gpu_descriptor::DescriptorDevice<MockSetLayout, MockPool, MockSet> for MockDevice {
    unsafe fn create_descriptor_pool(
        &self,
        _descriptor_count: &gpu_descriptor::DescriptorTotalCount,
        _max_sets: u32,
        _flags: gpu_descriptor::DescriptorPoolCreateFlags,
    ) -> Result<MockPool, gpu_descriptor::CreatePoolError> {
        Ok(MockPool)
    }

    unsafe fn destroy_descriptor_pool(&self, _pool: MockPool) {}

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        _pool: &mut MockPool,
        layouts: impl ExactSizeIterator<Item = &'a MockSetLayout>,
        sets: &mut impl Extend<MockSet>,
    ) -> Result<(), gpu_descriptor::DeviceAllocationError> {
        if self.shared.fail_descriptor_alloc.load(Ordering::Relaxed) {
            return Err(gpu_descriptor::DeviceAllocationError::OutOfHostMemory);
        }
        sets.extend(layouts.map(|_| MockSet {
            id: self.shared.fresh_id(),
        }));
        Ok(())
    }

    unsafe fn dealloc_descriptor_sets<'a>(
        &self,
        _pool: &mut MockPool,
        sets: impl Iterator<Item = MockSet>,
    ) {
        for set in sets {
            drop(set);
        }
    }
}

impl hal::Device<MockApi> for MockDevice {
    fn properties(&self) -> hal::DeviceProperties {
        hal::DeviceProperties {
            alloc: gpu_alloc::DeviceProperties {
                memory_types: std::borrow::Cow::Owned(vec![gpu_alloc::MemoryType {
                    props: gpu_alloc::MemoryPropertyFlags::DEVICE_LOCAL
                        | gpu_alloc::MemoryPropertyFlags::HOST_VISIBLE
                        | gpu_alloc::MemoryPropertyFlags::HOST_COHERENT,
                    heap: 0,
                }]),
                memory_heaps: std::borrow::Cow::Owned(vec![gpu_alloc::MemoryHeap {
                    size: 64 << 20,
                }]),
                max_memory_allocation_count: 4096,
                max_memory_allocation_size: 64 << 20,
                non_coherent_atom_size: 64,
                buffer_device_address: false,
            },
            valid_memory_types: 0x1,
            limits: gvt::DeviceLimits {
                max_bound_descriptor_sets: 8,
            },
            capabilities: *self.shared.caps.lock().unwrap(),
            max_update_after_bind_descriptors: 0,
        }
    }

    unsafe fn create_buffer(
        &self,
        desc: &hal::BufferDescriptor<'_>,
    ) -> hal::DeviceResult<(MockBuffer, hal::MemoryRequirements)> {
        if self.shared.fail_buffer_create.load(Ordering::Relaxed) {
            return Err(hal::DeviceError::OutOfMemory);
        }
        let id = self.shared.fresh_id();
        Ok((
            MockBuffer {
                id,
                size: desc.size,
            },
            hal::MemoryRequirements {
                size: desc.size,
                alignment: 16,
                memory_type_bits: 0x1,
            },
        ))
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: &mut MockBuffer,
        memory: &MockMemory,
        offset: u64,
    ) -> hal::DeviceResult<()> {
        self.shared.backings.lock().unwrap().insert(
            buffer.id,
            BufferBacking {
                bytes: Arc::clone(&memory.bytes),
                offset,
                size: buffer.size,
            },
        );
        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: MockBuffer) {
        self.shared.backings.lock().unwrap().remove(&buffer.id);
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        _desc: &hal::DescriptorSetLayoutDescriptor<'_>,
    ) -> hal::DeviceResult<MockSetLayout> {
        Ok(MockSetLayout)
    }

    unsafe fn destroy_descriptor_set_layout(&self, _layout: MockSetLayout) {}

    unsafe fn update_descriptor_sets(&self, writes: &[hal::DescriptorWrite<'_, MockApi>]) {
        let mut log = self.shared.descriptor_writes.lock().unwrap();
        for write in writes {
            log.push(DescriptorWriteLog {
                set: write.set.id,
                binding: write.binding,
                buffer: write.buffer.buffer.id,
                offset: write.buffer.offset,
                size: write.buffer.size,
            });
        }
    }

    unsafe fn create_pipeline_layout(
        &self,
        _desc: &hal::PipelineLayoutDescriptor<'_, MockApi>,
    ) -> hal::DeviceResult<MockPipelineLayout> {
        Ok(MockPipelineLayout)
    }

    unsafe fn destroy_pipeline_layout(&self, _layout: MockPipelineLayout) {}

    unsafe fn create_shader_module(&self, _spirv: &[u32]) -> hal::DeviceResult<MockShaderModule> {
        Ok(MockShaderModule)
    }

    unsafe fn destroy_shader_module(&self, _module: MockShaderModule) {}

    unsafe fn create_compute_pipeline(
        &self,
        _desc: &hal::ComputePipelineDescriptor<'_, MockApi>,
    ) -> hal::DeviceResult<MockPipeline> {
        Ok(MockPipeline {
            id: self.shared.fresh_id(),
        })
    }

    unsafe fn destroy_pipeline(&self, _pipeline: MockPipeline) {}

    unsafe fn create_command_encoder(&self, _queue_family: u32) -> hal::DeviceResult<MockEncoder> {
        Ok(MockEncoder::new())
    }

    unsafe fn destroy_command_encoder(&self, _encoder: MockEncoder) {}

    unsafe fn create_acceleration_structure(
        &self,
        _desc: &hal::AccelerationStructureDescriptor<'_>,
    ) -> hal::DeviceResult<(MockAccel, hal::MemoryRequirements)> {
        Ok((
            MockAccel,
            hal::MemoryRequirements {
                size: 256,
                alignment: 256,
                memory_type_bits: 0x1,
            },
        ))
    }

    unsafe fn bind_acceleration_structure_memory(
        &self,
        _accel: &mut MockAccel,
        _memory: &MockMemory,
        _offset: u64,
    ) -> hal::DeviceResult<()> {
        Ok(())
    }

    unsafe fn acceleration_structure_handle(&self, _accel: &MockAccel) -> hal::DeviceResult<u64> {
        Ok(0x9999)
    }

    unsafe fn acceleration_structure_scratch_requirements(
        &self,
        _accel: &MockAccel,
    ) -> hal::MemoryRequirements {
        hal::MemoryRequirements {
            size: 128,
            alignment: 16,
            memory_type_bits: 0x1,
        }
    }

    unsafe fn destroy_acceleration_structure(&self, _accel: MockAccel) {}
}

impl hal::Queue<MockApi> for MockQueue {
    unsafe fn submit(&mut self, _command_buffers: &[&MockEncoder]) -> hal::DeviceResult<()> {
        self.shared.submit_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn wait_idle(&mut self) -> hal::DeviceResult<()> {
        self.shared.wait_idle_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl hal::CommandEncoder<MockApi> for MockEncoder {
    unsafe fn begin(&mut self) -> hal::DeviceResult<()> {
        self.commands.lock().unwrap().push(Cmd::Begin);
        Ok(())
    }

    unsafe fn end(&mut self) -> hal::DeviceResult<()> {
        self.commands.lock().unwrap().push(Cmd::End);
        Ok(())
    }

    unsafe fn pipeline_barrier(
        &mut self,
        _src_stages: hal::PipelineStages,
        _dst_stages: hal::PipelineStages,
        memory_barriers: &[hal::MemoryBarrier],
        buffer_barriers: &[hal::BufferBarrier<'_, MockApi>],
    ) {
        let mut log = self.commands.lock().unwrap();
        if !memory_barriers.is_empty() {
            log.push(Cmd::MemoryBarrier);
        }
        for barrier in buffer_barriers {
            log.push(Cmd::BufferBarrier(barrier.buffer.id));
        }
    }

    unsafe fn bind_pipeline(&mut self, bind_point: BindPoint, pipeline: &MockPipeline) {
        self.commands
            .lock()
            .unwrap()
            .push(Cmd::BindPipeline(bind_point, pipeline.id));
    }

    unsafe fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        _layout: &MockPipelineLayout,
        first_set: u32,
        sets: &[&MockSet],
        _dynamic_offsets: &[u32],
    ) {
        self.commands.lock().unwrap().push(Cmd::BindSets {
            bind_point,
            first_set,
            sets: sets.iter().map(|set| set.id).collect(),
        });
    }

    unsafe fn push_constants(
        &mut self,
        _layout: &MockPipelineLayout,
        _stages: gvt::ShaderStages,
        _offset: u32,
        _data: &[u8],
    ) {
        self.commands.lock().unwrap().push(Cmd::PushConstants);
    }

    unsafe fn dispatch(&mut self, count: [u32; 3]) {
        self.commands.lock().unwrap().push(Cmd::Dispatch(count));
    }

    unsafe fn build_acceleration_structure(
        &mut self,
        _dst: &MockAccel,
        _geometry: &hal::TriangleGeometry<'_, MockApi>,
        _scratch: &MockBuffer,
        _scratch_offset: u64,
    ) {
        self.commands
            .lock()
            .unwrap()
            .push(Cmd::BuildAccelerationStructure);
    }
}

// ---- shared sink ------------------------------------------------------

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<(ReportLevel, String, String)>>>);

impl SharedSink {
    fn reports(&self) -> Vec<(ReportLevel, String, String)> {
        self.0.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter(|(level, ..)| *level == ReportLevel::Error)
            .map(|(_, _, message)| message)
            .collect()
    }
}

impl ReportSink for SharedSink {
    fn report(&self, level: ReportLevel, _object: ObjectRef, vuid: &str, message: &str) {
        self.0
            .lock()
            .unwrap()
            .push((level, vuid.to_string(), message.to_string()));
    }
}

// ---- fixtures ---------------------------------------------------------

fn working_caps() -> gvt::DeviceCapabilities {
    gvt::DeviceCapabilities {
        api_version: gvt::API_VERSION_1_1,
        vertex_pipeline_stores_and_atomics: true,
        fragment_stores_and_atomics: true,
        descriptor_indexing: true,
        ..Default::default()
    }
}

struct Fixture {
    context: ValidationContext<MockApi>,
    shared: Arc<Shared>,
    sink: SharedSink,
}

fn fixture_with(caps: gvt::DeviceCapabilities) -> Fixture {
    let shared = Arc::new(Shared::default());
    *shared.caps.lock().unwrap() = caps;
    let sink = SharedSink::default();
    let device = MockDevice {
        shared: Arc::clone(&shared),
    };
    let context = ValidationContext::new(
        device,
        gvt::GpuValidationSettings::default(),
        Box::new(sink.clone()),
    );
    Fixture {
        context,
        shared,
        sink,
    }
}

fn fixture() -> Fixture {
    fixture_with(working_caps())
}

fn queue(shared: &Arc<Shared>) -> MockQueue {
    MockQueue {
        shared: Arc::clone(shared),
    }
}

/// A small compute module with one dynamically indexed storage buffer
/// access, enough for the instrumenter to have work to do.
fn compute_shader_words() -> Vec<u32> {
    const SB: u32 = spirv::StorageClass::StorageBuffer as u32;
    let module = SpirvModule {
        version: 0x0001_0300,
        generator: 0,
        bound: 16,
        schema: 0,
        instructions: vec![
            Instruction::new(Op::Capability, vec![spirv::Capability::Shader as u32]),
            Instruction::new(
                Op::MemoryModel,
                vec![
                    spirv::AddressingModel::Logical as u32,
                    spirv::MemoryModel::GLSL450 as u32,
                ],
            ),
            Instruction::new(Op::EntryPoint, {
                let mut ops = vec![spirv::ExecutionModel::GLCompute as u32, 12];
                ops.extend(gpuav_core::instrument::module::string_to_words("main"));
                ops
            }),
            Instruction::new(Op::ExecutionMode, vec![12, 17, 1, 1, 1]),
            Instruction::new(Op::Decorate, vec![5, spirv::Decoration::ArrayStride as u32, 4]),
            Instruction::new(
                Op::MemberDecorate,
                vec![6, 0, spirv::Decoration::Offset as u32, 0],
            ),
            Instruction::new(Op::Decorate, vec![6, spirv::Decoration::Block as u32]),
            Instruction::new(Op::Decorate, vec![8, spirv::Decoration::DescriptorSet as u32, 0]),
            Instruction::new(Op::Decorate, vec![8, spirv::Decoration::Binding as u32, 0]),
            Instruction::new(Op::TypeVoid, vec![2]),
            Instruction::new(Op::TypeFunction, vec![3, 2]),
            Instruction::new(Op::TypeInt, vec![4, 32, 0]),
            Instruction::new(Op::TypeRuntimeArray, vec![5, 4]),
            Instruction::new(Op::TypeStruct, vec![6, 5]),
            Instruction::new(Op::TypePointer, vec![7, SB, 6]),
            Instruction::new(Op::Variable, vec![7, 8, SB]),
            Instruction::new(Op::TypePointer, vec![9, SB, 4]),
            Instruction::new(Op::Constant, vec![4, 10, 0]),
            Instruction::new(Op::Constant, vec![4, 11, 32]),
            Instruction::new(Op::Function, vec![2, 12, 0, 3]),
            Instruction::new(Op::Label, vec![13]),
            Instruction::new(Op::AccessChain, vec![9, 14, 8, 10, 11]),
            Instruction::new(Op::Load, vec![4, 15, 14]),
            Instruction::new(Op::Return, vec![]),
            Instruction::new(Op::FunctionEnd, vec![]),
        ],
    };
    module.assemble()
}

fn bind_compute_pipeline(fixture: &mut Fixture, cb: id::CommandBufferId) {
    fixture.context.cmd_bind_pipeline(
        cb,
        BindPoint::Compute,
        id::PipelineId(0x77),
        MockPipeline { id: 0x77 },
        MockPipelineLayout,
        1,
    );
}

fn write_record(
    shared: &Arc<Shared>,
    buffer: u64,
    shader_id: u32,
    kind: record::ErrorKind,
    params: [u32; 3],
) {
    shared.write_buffer_u32(buffer, 0, record::RECORD_WORDS as u32);
    let base = record::RECORD_START_OFFSET;
    shared.write_buffer_u32(buffer, base + record::REC_LEN, record::RECORD_WORDS as u32);
    shared.write_buffer_u32(buffer, base + record::REC_VERSION, record::STREAM_VERSION);
    shared.write_buffer_u32(buffer, base + record::REC_SHADER_ID, shader_id);
    shared.write_buffer_u32(buffer, base + record::REC_INSTRUCTION_INDEX, 20);
    shared.write_buffer_u32(
        buffer,
        base + record::REC_STAGE,
        spirv::ExecutionModel::GLCompute as u32,
    );
    shared.write_buffer_u32(buffer, base + record::REC_ERROR_KIND, kind as u32);
    shared.write_buffer_u32(buffer, base + record::REC_PARAM_0, params[0]);
    shared.write_buffer_u32(buffer, base + record::REC_PARAM_1, params[1]);
    shared.write_buffer_u32(buffer, base + record::REC_PARAM_2, params[2]);
}

// ---- tests ------------------------------------------------------------

#[test]
fn null_backend_smoke() {
    let mut context = ValidationContext::<hal::null::Api>::new(
        hal::null::Device,
        gvt::GpuValidationSettings::default(),
        Box::new(SharedSink::default()),
    );
    assert!(!context.aborted());
    assert_eq!(
        context.reserved_set_index(),
        gvt::DeviceLimits::default().max_bound_descriptor_sets - 1
    );

    let words = compute_shader_words();
    let shader = context.instrument_shader(id::ShaderModuleId(1), &words);
    assert!(shader.instrumented);
}

#[test]
fn setup_failure_degrades_to_pass_through() {
    // No stores-and-atomics support: setup must fail exactly once and
    // every later hook must be a no-op.
    let caps = gvt::DeviceCapabilities {
        api_version: gvt::API_VERSION_1_1,
        ..Default::default()
    };
    let mut fixture = fixture_with(caps);
    assert!(fixture.context.aborted());
    assert_eq!(fixture.sink.errors().len(), 1);

    // Shader instrumentation falls back to the original words.
    let words = compute_shader_words();
    let shader = fixture
        .context
        .instrument_shader(id::ShaderModuleId(1), &words);
    assert_eq!(shader.words, words);
    assert!(!shader.instrumented);

    // Draws allocate nothing and record nothing.
    let cb = id::CommandBufferId(1);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);
    assert!(encoder.log().is_empty());
    assert!(fixture.shared.descriptor_writes.lock().unwrap().is_empty());

    // Submission never stalls the queue.
    let mut queue = queue(&fixture.shared);
    fixture.context.pre_queue_submit(&[&[cb]]);
    fixture
        .context
        .post_queue_submit(id::QueueId(0), &mut queue, 0, &[&[cb]]);
    assert_eq!(fixture.shared.wait_idle_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn submission_without_validated_work_never_idles_the_queue() {
    let mut fixture = fixture();
    assert!(!fixture.context.aborted());

    let cb = id::CommandBufferId(7);
    let mut queue = queue(&fixture.shared);
    fixture.context.pre_queue_submit(&[&[cb]]);
    fixture
        .context
        .post_queue_submit(id::QueueId(0), &mut queue, 0, &[&[cb]]);

    assert_eq!(fixture.shared.wait_idle_calls.load(Ordering::Relaxed), 0);
    assert_eq!(fixture.shared.submit_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn instrumentation_rewrites_eligible_shaders() {
    let mut fixture = fixture();
    let words = compute_shader_words();
    let shader = fixture
        .context
        .instrument_shader(id::ShaderModuleId(5), &words);
    assert!(shader.instrumented);
    assert_ne!(shader.words, words);
    assert!(shader.id != 0);
    fixture
        .context
        .register_pipeline(id::PipelineId(0x77), &[shader.id]);
}

#[test]
fn draw_binds_diagnostics_and_harvest_reports() {
    let mut fixture = fixture();
    let words = compute_shader_words();
    let shader = fixture
        .context
        .instrument_shader(id::ShaderModuleId(5), &words);
    fixture
        .context
        .register_pipeline(id::PipelineId(0x77), &[shader.id]);

    let cb = id::CommandBufferId(3);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);
    assert!(!fixture.context.aborted());

    // The diagnostics set went in right after the application's sets.
    let log = encoder.log();
    assert!(matches!(
        log.last(),
        Some(Cmd::BindSets {
            bind_point: BindPoint::Compute,
            first_set,
            ..
        }) if *first_set == fixture.context.reserved_set_index()
    ));

    // Binding 0 received the output block, sized for one record.
    let output = fixture.shared.last_write_for_binding(0).unwrap();
    assert_eq!(output.size, record::OUTPUT_BUFFER_BYTES);

    // Pretend the instrumented shader reported a read at byte offset 128
    // of a 64-byte storage buffer.
    write_record(
        &fixture.shared,
        output.buffer,
        shader.id,
        record::ErrorKind::StorageBufferOob,
        [0, 64, 128],
    );

    let mut queue = queue(&fixture.shared);
    fixture.context.pre_queue_submit(&[&[cb]]);
    fixture
        .context
        .post_queue_submit(id::QueueId(0), &mut queue, 0, &[&[cb]]);

    assert_eq!(fixture.shared.wait_idle_calls.load(Ordering::Relaxed), 1);
    let reports = fixture.sink.reports();
    let (_, vuid, message) = reports
        .iter()
        .find(|(level, ..)| *level == ReportLevel::Error)
        .expect("expected a violation report");
    assert_eq!(vuid, "VUID-vkCmdDispatch-None-02706");
    assert!(message.contains("Descriptor size is 64"));
    assert!(message.contains("highest byte accessed was 128"));
    assert!(message.contains("Compute Index 0"));

    // The record was consumed: resubmitting reports nothing new.
    let count_before = fixture.sink.reports().len();
    fixture.context.pre_queue_submit(&[&[cb]]);
    fixture
        .context
        .post_queue_submit(id::QueueId(0), &mut queue, 0, &[&[cb]]);
    assert_eq!(fixture.sink.reports().len(), count_before);

    // Reset releases everything without complaint.
    fixture.context.reset_command_buffer(cb);
}

#[test]
fn update_after_bind_descriptors_patch_at_submit() {
    let mut fixture = fixture();

    // One storage buffer binding, update-after-bind, not yet written.
    fixture.context.register_descriptor_set_layout(
        id::DescriptorSetLayoutId(1),
        vec![gpuav_core::track::DescriptorBindingLayout {
            binding: 0,
            count: 1,
            kind: gpuav_core::track::DescriptorKind::StorageBuffer,
            update_after_bind: true,
            variable_count: false,
        }],
    );
    fixture
        .context
        .register_descriptor_set(id::DescriptorSetId(11), id::DescriptorSetLayoutId(1), 0);

    let cb = id::CommandBufferId(4);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    fixture.context.cmd_bind_descriptor_sets(
        cb,
        BindPoint::Compute,
        0,
        vec![gpuav_core::track::BoundDescriptorSet {
            id: id::DescriptorSetId(11),
            raw: MockSet { id: 0x100 },
            dynamic_offsets: Vec::new(),
        }],
    );
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);

    let input = fixture.shared.last_write_for_binding(1).unwrap();
    // Layout: [start=3, sets_to_sizes, sizes, sets_to_bindings,
    // bindings_to_written, written]; the lone status word is last.
    let status_index = 5;
    assert_eq!(fixture.shared.read_buffer_u32(input.buffer, status_index), 0);

    // The descriptor is written between recording and submission.
    fixture.context.update_descriptor_set(
        id::DescriptorSetId(11),
        0,
        0,
        &[gpuav_core::track::WrittenState::Buffer { size: Some(640) }],
    );
    fixture.context.pre_queue_submit(&[&[cb]]);
    assert_eq!(
        fixture.shared.read_buffer_u32(input.buffer, status_index),
        640
    );
}

#[test]
fn per_command_allocation_failure_aborts_once() {
    let mut fixture = fixture();
    fixture
        .shared
        .fail_buffer_create
        .store(true, Ordering::Relaxed);

    let cb = id::CommandBufferId(9);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);

    assert!(fixture.context.aborted());
    assert_eq!(fixture.sink.errors().len(), 1);

    // Further commands are silent no-ops.
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);
    assert_eq!(fixture.sink.errors().len(), 1);
}

#[test]
fn descriptor_pool_exhaustion_aborts() {
    let mut fixture = fixture();
    fixture
        .shared
        .fail_descriptor_alloc
        .store(true, Ordering::Relaxed);

    let cb = id::CommandBufferId(9);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    fixture
        .context
        .allocate_validation_resources(cb, &mut encoder, CommandKind::Dispatch);
    assert!(fixture.context.aborted());
}

#[test]
fn pipeline_layout_padding_respects_the_reserved_slot() {
    let fixture = fixture();
    let padding = fixture.context.pipeline_layout_padding(2).unwrap();
    assert_eq!(padding.total_set_count, 8);

    // A layout already using every slot cannot be padded.
    assert!(fixture.context.pipeline_layout_padding(8).is_none());
    assert_eq!(fixture.sink.errors().len(), 1);
}

#[test]
fn acceleration_structure_build_validation_flow() {
    let caps = gvt::DeviceCapabilities {
        ray_tracing: true,
        ..working_caps()
    };
    let mut fixture = fixture_with(caps);
    let mut queue = queue(&fixture.shared);

    fixture
        .context
        .initialize_acceleration_structure_validation(&mut queue);
    assert!(!fixture.context.aborted());
    // The replacement structure build was submitted and waited on.
    assert!(fixture.shared.submit_calls.load(Ordering::Relaxed) >= 1);
    assert!(fixture.shared.wait_idle_calls.load(Ordering::Relaxed) >= 1);

    // Two valid bottom-level structures.
    for &(index, handle) in [(1u64, 0x1111u64), (2, 0x2222)].iter() {
        let accel = id::AccelerationStructureId(index);
        fixture
            .context
            .register_acceleration_structure(accel, hal::AccelerationStructureKind::BottomLevel);
        fixture
            .context
            .acceleration_structure_handle_known(accel, handle);
        let mut blas_encoder = MockEncoder::new();
        fixture.context.cmd_build_acceleration_structure(
            id::CommandBufferId(50 + index),
            &mut blas_encoder,
            &AccelerationStructureBuildInfo {
                dst: accel,
                kind: hal::AccelerationStructureKind::BottomLevel,
                instance_buffer: None,
                instance_offset: 0,
                instance_count: 0,
            },
        );
        // Bottom-level builds only update the registry.
        assert!(blas_encoder.log().is_empty());
    }

    // Top-level build over three instances.
    let tlas = id::AccelerationStructureId(10);
    fixture
        .context
        .register_acceleration_structure(tlas, hal::AccelerationStructureKind::TopLevel);
    let cb = id::CommandBufferId(60);
    let mut encoder = MockEncoder::new();
    bind_compute_pipeline(&mut fixture, cb);
    let instance_buffer = MockBuffer {
        id: 0xabc,
        size: 3 * 64,
    };
    fixture.context.cmd_build_acceleration_structure(
        cb,
        &mut encoder,
        &AccelerationStructureBuildInfo {
            dst: tlas,
            kind: hal::AccelerationStructureKind::TopLevel,
            instance_buffer: Some(&instance_buffer),
            instance_offset: 0,
            instance_count: 3,
        },
    );

    // Injected sequence: barrier, dispatch bracketed by binds, buffer
    // barrier, then the application state restored.
    let log = encoder.log();
    assert_eq!(log[0], Cmd::MemoryBarrier);
    assert!(log.contains(&Cmd::Dispatch([1, 1, 1])));
    assert_eq!(log.last(), Some(&Cmd::BindPipeline(BindPoint::Compute, 0x77)));
    assert!(log.contains(&Cmd::BufferBarrier(0xabc)));

    // The validation buffer (binding 1 of the injected set) was
    // populated with count, replacement handle and the valid handles.
    let validation = fixture.shared.last_write_for_binding(1).unwrap();
    assert_eq!(fixture.shared.read_buffer_u32(validation.buffer, 0), 3);
    assert_eq!(fixture.shared.read_buffer_u32(validation.buffer, 1), 0x9999);
    assert_eq!(fixture.shared.read_buffer_u32(validation.buffer, 2), 0);
    assert_eq!(fixture.shared.read_buffer_u32(validation.buffer, 6), 2);
    let handles = [
        fixture.shared.read_buffer_u32(validation.buffer, 7),
        fixture.shared.read_buffer_u32(validation.buffer, 9),
    ];
    assert!(handles.contains(&0x1111));
    assert!(handles.contains(&0x2222));

    // Pretend the dispatch found and replaced one invalid handle.
    fixture.shared.write_buffer_u32(validation.buffer, 3, 1);
    fixture
        .shared
        .write_buffer_u32(validation.buffer, 4, 0xdead_beef);
    fixture.shared.write_buffer_u32(validation.buffer, 5, 0);

    fixture.context.pre_queue_submit(&[&[cb]]);
    fixture
        .context
        .post_queue_submit(id::QueueId(0), &mut queue, 0, &[&[cb]]);

    let errors = fixture.sink.errors();
    let report = errors
        .iter()
        .find(|message| message.contains("0xdeadbeef"))
        .expect("expected an invalid-handle report");
    assert!(report.contains("invalid bottom level acceleration structure handle"));

    fixture.context.reset_command_buffer(cb);
}

#[test]
fn ray_tracing_absent_leaves_validator_dormant() {
    let mut fixture = fixture();
    let mut queue = queue(&fixture.shared);
    let submits_before = fixture.shared.submit_calls.load(Ordering::Relaxed);
    fixture
        .context
        .initialize_acceleration_structure_validation(&mut queue);
    assert!(!fixture.context.aborted());
    assert_eq!(
        fixture.shared.submit_calls.load(Ordering::Relaxed),
        submits_before
    );

    // Builds pass through without injected work.
    let cb = id::CommandBufferId(1);
    let mut encoder = MockEncoder::new();
    let instance_buffer = MockBuffer { id: 1, size: 64 };
    fixture.context.cmd_build_acceleration_structure(
        cb,
        &mut encoder,
        &AccelerationStructureBuildInfo {
            dst: id::AccelerationStructureId(1),
            kind: hal::AccelerationStructureKind::TopLevel,
            instance_buffer: Some(&instance_buffer),
            instance_offset: 0,
            instance_count: 1,
        },
    );
    assert!(encoder.log().is_empty());
}

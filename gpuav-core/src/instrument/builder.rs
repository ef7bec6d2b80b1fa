//! Instruction emission for the instrumentation pass: type and constant
//! reuse, the diagnostics interface declarations and the injected helper
//! functions implementing the record-stream ABI.

use spirv::Op;

use super::module::{string_to_words, Instruction, SpirvModule, Word};
use super::pass::{Analysis, TypeInfo};
use crate::record;
use crate::FastHashMap;

pub(super) const STORAGE_CLASS_UNIFORM: u32 = spirv::StorageClass::Uniform as u32;
pub(super) const STORAGE_CLASS_STORAGE_BUFFER: u32 = spirv::StorageClass::StorageBuffer as u32;
pub(super) const STORAGE_CLASS_INPUT: u32 = spirv::StorageClass::Input as u32;
/// `PhysicalStorageBuffer`; spelled numerically so the pass works against
/// modules using the EXT alias as well.
pub(super) const STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER: u32 = 5349;

const CAPABILITY_INT64: u32 = spirv::Capability::Int64 as u32;

const GLSL_STD_450: &str = "GLSL.std.450";
const GLSL_STD_450_UMIN: u32 = 38;

// Execution models beyond the core graphics/compute set.
pub(super) const EXEC_MODEL_RAY_GENERATION: u32 = 5313;
pub(super) const EXEC_MODEL_CALLABLE: u32 = 5318;

const BUILT_IN_LAUNCH_ID: u32 = 5319;

/// Ids of everything the pass injected into a module.
pub(super) struct Injected {
    pub di_var: Option<Word>,
    pub fn_check_desc_index: Word,
    pub fn_check_index_bytes: Word,
    pub fn_check_written: Word,
    pub fn_check_bda: Option<Word>,
}

pub(super) struct Emitter<'m> {
    pub module: &'m mut SpirvModule,
    pub capabilities: Vec<Instruction>,
    pub ext_imports: Vec<Instruction>,
    pub annotations: Vec<Instruction>,
    pub globals: Vec<Instruction>,
    pub functions: Vec<Instruction>,
    /// Input variables that must join every entry point interface.
    pub interface_inputs: Vec<Word>,
    /// Buffer variables that join the interface on SPIR-V 1.4+.
    pub interface_buffers: Vec<Word>,

    int_types: FastHashMap<(u32, u32), Word>,
    float_types: FastHashMap<u32, Word>,
    vector_types: FastHashMap<(Word, u32), Word>,
    pointer_types: FastHashMap<(u32, Word), Word>,
    consts_u32: FastHashMap<u32, Word>,
    function_types: Vec<(Word, Word, Vec<Word>)>,
    void_type: Option<Word>,
    bool_type: Option<Word>,
    glsl_ext: Option<Word>,
    has_int64: bool,
}

impl<'m> Emitter<'m> {
    pub fn new(module: &'m mut SpirvModule, analysis: &Analysis) -> Self {
        let mut int_types = FastHashMap::default();
        let mut float_types = FastHashMap::default();
        let mut vector_types = FastHashMap::default();
        let mut pointer_types = FastHashMap::default();
        let mut function_types = Vec::new();
        let mut void_type = None;
        let mut bool_type = None;

        for (&id, info) in &analysis.types {
            match *info {
                TypeInfo::Void => void_type = Some(id),
                TypeInfo::Bool => bool_type = Some(id),
                TypeInfo::Int { width, signed } => {
                    int_types.insert((width, signed as u32), id);
                }
                TypeInfo::Float { width } => {
                    float_types.insert(width, id);
                }
                TypeInfo::Vector { component, count } => {
                    vector_types.insert((component, count), id);
                }
                TypeInfo::Pointer { class, pointee } => {
                    pointer_types.insert((class, pointee), id);
                }
                TypeInfo::Function { ret, ref params } => {
                    function_types.push((id, ret, params.clone()));
                }
                _ => {}
            }
        }

        let mut consts_u32 = FastHashMap::default();
        if let Some(&u32_ty) = int_types.get(&(32, 0)) {
            for (&id, &(ty, value)) in &analysis.constants {
                if ty == u32_ty && value <= u32::MAX as u64 {
                    consts_u32.entry(value as u32).or_insert(id);
                }
            }
        }

        Self {
            module,
            capabilities: Vec::new(),
            ext_imports: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            interface_inputs: Vec::new(),
            interface_buffers: Vec::new(),
            int_types,
            float_types,
            vector_types,
            pointer_types,
            consts_u32,
            function_types,
            void_type,
            bool_type,
            glsl_ext: analysis.ext_glsl,
            has_int64: analysis.capabilities.contains(&CAPABILITY_INT64),
        }
    }

    fn int_ty(&mut self, width: u32, signed: bool) -> Word {
        if let Some(&id) = self.int_types.get(&(width, signed as u32)) {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::TypeInt, vec![id, width, signed as u32]));
        self.int_types.insert((width, signed as u32), id);
        id
    }

    pub fn u32_ty(&mut self) -> Word {
        self.int_ty(32, false)
    }

    pub fn i32_ty(&mut self) -> Word {
        self.int_ty(32, true)
    }

    pub fn u64_ty(&mut self) -> Word {
        if !self.has_int64 {
            self.capabilities
                .push(Instruction::new(Op::Capability, vec![CAPABILITY_INT64]));
            self.has_int64 = true;
        }
        self.int_ty(64, false)
    }

    pub fn f32_ty(&mut self) -> Word {
        if let Some(&id) = self.float_types.get(&32) {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::TypeFloat, vec![id, 32]));
        self.float_types.insert(32, id);
        id
    }

    pub fn void_ty(&mut self) -> Word {
        if let Some(id) = self.void_type {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals.push(Instruction::new(Op::TypeVoid, vec![id]));
        self.void_type = Some(id);
        id
    }

    pub fn bool_ty(&mut self) -> Word {
        if let Some(id) = self.bool_type {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals.push(Instruction::new(Op::TypeBool, vec![id]));
        self.bool_type = Some(id);
        id
    }

    pub fn vec_ty(&mut self, component: Word, count: u32) -> Word {
        if let Some(&id) = self.vector_types.get(&(component, count)) {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::TypeVector, vec![id, component, count]));
        self.vector_types.insert((component, count), id);
        id
    }

    pub fn ptr_ty(&mut self, class: u32, pointee: Word) -> Word {
        if let Some(&id) = self.pointer_types.get(&(class, pointee)) {
            return id;
        }
        let id = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::TypePointer, vec![id, class, pointee]));
        self.pointer_types.insert((class, pointee), id);
        id
    }

    pub fn const_u32(&mut self, value: u32) -> Word {
        if let Some(&id) = self.consts_u32.get(&value) {
            return id;
        }
        let ty = self.u32_ty();
        let id = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::Constant, vec![ty, id, value]));
        self.consts_u32.insert(value, id);
        id
    }

    fn fn_ty(&mut self, ret: Word, params: &[Word]) -> Word {
        if let Some(&(id, ..)) = self
            .function_types
            .iter()
            .find(|(_, r, p)| *r == ret && p.as_slice() == params)
        {
            return id;
        }
        let id = self.module.alloc_id();
        let mut operands = vec![id, ret];
        operands.extend_from_slice(params);
        self.globals.push(Instruction::new(Op::TypeFunction, operands));
        self.function_types.push((id, ret, params.to_vec()));
        id
    }

    fn glsl_ext(&mut self) -> Word {
        if let Some(id) = self.glsl_ext {
            return id;
        }
        let id = self.module.alloc_id();
        let mut operands = vec![id];
        operands.extend(string_to_words(GLSL_STD_450));
        self.ext_imports.push(Instruction::new(Op::ExtInstImport, operands));
        self.glsl_ext = Some(id);
        id
    }

    fn decorate(&mut self, id: Word, decoration: spirv::Decoration, args: &[u32]) {
        let mut operands = vec![id, decoration as u32];
        operands.extend_from_slice(args);
        self.annotations.push(Instruction::new(Op::Decorate, operands));
    }

    fn decorate_member(&mut self, id: Word, member: u32, decoration: spirv::Decoration, args: &[u32]) {
        let mut operands = vec![id, member, decoration as u32];
        operands.extend_from_slice(args);
        self.annotations
            .push(Instruction::new(Op::MemberDecorate, operands));
    }

    /// Declare one diagnostics buffer at `(reserved_set, binding)`: a block
    /// struct whose members are `leading` u32 scalars followed by a runtime
    /// array of `element_ty` with the given stride.
    fn buffer_var(
        &mut self,
        class: u32,
        reserved_set: u32,
        binding: u32,
        leading: u32,
        element_ty: Word,
        stride: u32,
    ) -> Word {
        let u32_ty = self.u32_ty();
        let rta = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::TypeRuntimeArray, vec![rta, element_ty]));
        self.decorate(rta, spirv::Decoration::ArrayStride, &[stride]);

        let st = self.module.alloc_id();
        let mut members = vec![st];
        members.extend(std::iter::repeat(u32_ty).take(leading as usize));
        members.push(rta);
        self.globals.push(Instruction::new(Op::TypeStruct, members));
        for i in 0..leading {
            self.decorate_member(st, i, spirv::Decoration::Offset, &[i * 4]);
        }
        self.decorate_member(st, leading, spirv::Decoration::Offset, &[leading * 4]);
        let block = if class == STORAGE_CLASS_STORAGE_BUFFER {
            spirv::Decoration::Block
        } else {
            spirv::Decoration::BufferBlock
        };
        self.decorate(st, block, &[]);

        let ptr = self.ptr_ty(class, st);
        let var = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::Variable, vec![ptr, var, class]));
        self.decorate(var, spirv::Decoration::DescriptorSet, &[reserved_set]);
        self.decorate(var, spirv::Decoration::Binding, &[binding]);
        self.interface_buffers.push(var);
        var
    }

    pub fn declare_interface(
        &mut self,
        reserved_set: u32,
        need_di: bool,
        need_bda: bool,
    ) -> (Word, Option<Word>, Option<Word>, u32) {
        let class = if self.module.version_at_least(1, 3) {
            STORAGE_CLASS_STORAGE_BUFFER
        } else {
            STORAGE_CLASS_UNIFORM
        };
        let u32_ty = self.u32_ty();
        let output_var = self.buffer_var(class, reserved_set, 0, 1, u32_ty, 4);
        let di_var = if need_di {
            Some(self.buffer_var(class, reserved_set, 1, 0, u32_ty, 4))
        } else {
            None
        };
        let bda_var = if need_bda {
            let u64_ty = self.u64_ty();
            Some(self.buffer_var(class, reserved_set, 2, 0, u64_ty, 8))
        } else {
            None
        };
        (output_var, di_var, bda_var, class)
    }

    /// Fetch (or inject) the input variable for a builtin and return
    /// `(variable, pointee type)`.
    fn builtin_var(&mut self, analysis: &Analysis, builtin: u32, pointee: Word) -> (Word, Word) {
        if let Some(&var) = analysis.builtins.get(&builtin) {
            if let Some(&(class, existing_pointee)) = analysis.global_vars.get(&var) {
                if class == STORAGE_CLASS_INPUT {
                    return (var, existing_pointee);
                }
            }
        }
        let ptr = self.ptr_ty(STORAGE_CLASS_INPUT, pointee);
        let var = self.module.alloc_id();
        self.globals
            .push(Instruction::new(Op::Variable, vec![ptr, var, STORAGE_CLASS_INPUT]));
        self.decorate(var, spirv::Decoration::BuiltIn, &[builtin]);
        self.interface_inputs.push(var);
        (var, pointee)
    }

    /// Load a scalar builtin as u32, bitcasting signed sources.
    fn load_builtin_scalar(
        &mut self,
        analysis: &Analysis,
        builtin: u32,
        body: &mut Vec<Instruction>,
    ) -> Word {
        let i32_ty = self.i32_ty();
        let u32_ty = self.u32_ty();
        let (var, pointee) = self.builtin_var(analysis, builtin, i32_ty);
        let loaded = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![pointee, loaded, var]));
        if pointee == u32_ty {
            loaded
        } else {
            let cast = self.module.alloc_id();
            body.push(Instruction::new(Op::Bitcast, vec![u32_ty, cast, loaded]));
            cast
        }
    }

    /// Load components of a vector builtin as u32 words.
    fn load_builtin_vector(
        &mut self,
        analysis: &Analysis,
        builtin: u32,
        default_component: Word,
        default_count: u32,
        components: &[u32],
        body: &mut Vec<Instruction>,
    ) -> Vec<Word> {
        let u32_ty = self.u32_ty();
        let default_ty = self.vec_ty(default_component, default_count);
        let (var, pointee) = self.builtin_var(analysis, builtin, default_ty);
        let loaded = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![pointee, loaded, var]));
        let component_ty = self
            .vector_types
            .iter()
            .find(|entry| *entry.1 == pointee)
            .map(|entry| entry.0 .0)
            .unwrap_or(default_component);
        components
            .iter()
            .map(|&index| {
                let extracted = self.module.alloc_id();
                body.push(Instruction::new(
                    Op::CompositeExtract,
                    vec![component_ty, extracted, loaded, index],
                ));
                if component_ty == u32_ty {
                    extracted
                } else {
                    let cast = self.module.alloc_id();
                    body.push(Instruction::new(Op::Bitcast, vec![u32_ty, cast, extracted]));
                    cast
                }
            })
            .collect()
    }

    /// Produce the three stage payload words for the module's execution
    /// model.
    fn stage_payload(
        &mut self,
        analysis: &Analysis,
        model: u32,
        body: &mut Vec<Instruction>,
    ) -> [Word; 3] {
        let zero = self.const_u32(0);
        let f32_ty = self.f32_ty();
        let u32_ty = self.u32_ty();
        let words: Vec<Word> = match model {
            m if m == spirv::ExecutionModel::Vertex as u32 => vec![
                self.load_builtin_scalar(analysis, spirv::BuiltIn::VertexIndex as u32, body),
                self.load_builtin_scalar(analysis, spirv::BuiltIn::InstanceIndex as u32, body),
            ],
            m if m == spirv::ExecutionModel::Fragment as u32 => self.load_builtin_vector(
                analysis,
                spirv::BuiltIn::FragCoord as u32,
                f32_ty,
                4,
                &[0, 1],
                body,
            ),
            m if m == spirv::ExecutionModel::TessellationControl as u32 => vec![
                self.load_builtin_scalar(analysis, spirv::BuiltIn::InvocationId as u32, body),
                self.load_builtin_scalar(analysis, spirv::BuiltIn::PrimitiveId as u32, body),
            ],
            m if m == spirv::ExecutionModel::TessellationEvaluation as u32 => {
                let mut words = vec![self.load_builtin_scalar(
                    analysis,
                    spirv::BuiltIn::PrimitiveId as u32,
                    body,
                )];
                words.extend(self.load_builtin_vector(
                    analysis,
                    spirv::BuiltIn::TessCoord as u32,
                    f32_ty,
                    3,
                    &[0, 1],
                    body,
                ));
                words
            }
            m if m == spirv::ExecutionModel::Geometry as u32 => vec![
                self.load_builtin_scalar(analysis, spirv::BuiltIn::PrimitiveId as u32, body),
                self.load_builtin_scalar(analysis, spirv::BuiltIn::InvocationId as u32, body),
            ],
            m if (EXEC_MODEL_RAY_GENERATION..=EXEC_MODEL_CALLABLE).contains(&m) => {
                self.load_builtin_vector(analysis, BUILT_IN_LAUNCH_ID, u32_ty, 3, &[0, 1, 2], body)
            }
            // GLCompute, task and mesh stages all report the global
            // invocation id.
            _ => self.load_builtin_vector(
                analysis,
                spirv::BuiltIn::GlobalInvocationId as u32,
                u32_ty,
                3,
                &[0, 1, 2],
                body,
            ),
        };
        let mut payload = [zero; 3];
        for (slot, word) in payload.iter_mut().zip(words) {
            *slot = word;
        }
        payload
    }

    /// Emit every helper function and return the injected interface.
    pub fn emit_helpers(
        &mut self,
        analysis: &Analysis,
        shader_id: u32,
        output_var: Word,
        di_var: Option<Word>,
        bda_var: Option<Word>,
        buffer_class: u32,
        need_bda: bool,
    ) -> Injected {
        let model = analysis
            .entry_points
            .first()
            .map(|&(model, _)| model)
            .unwrap_or(spirv::ExecutionModel::GLCompute as u32);

        let fn_stream_write =
            self.emit_stream_write(analysis, model, shader_id, output_var, buffer_class);
        let fn_check_desc_index = self.emit_check_desc_index(fn_stream_write);
        let fn_check_index_bytes = self.emit_check_index_bytes(fn_stream_write);
        let fn_check_written = self.emit_check_written(fn_stream_write);
        let fn_check_bda = if need_bda {
            bda_var.map(|var| self.emit_check_bda(fn_stream_write, var, buffer_class))
        } else {
            None
        };

        Injected {
            di_var,
            fn_check_desc_index,
            fn_check_index_bytes,
            fn_check_written,
            fn_check_bda,
        }
    }

    /// `fn stream_write(instruction, error, p0, p1, p2)`: reserve record
    /// space with an atomic cursor bump and store the record if it fits.
    fn emit_stream_write(
        &mut self,
        analysis: &Analysis,
        model: u32,
        shader_id: u32,
        output_var: Word,
        class: u32,
    ) -> Word {
        let void_ty = self.void_ty();
        let u32_ty = self.u32_ty();
        let bool_ty = self.bool_ty();
        let ptr_u32 = self.ptr_ty(class, u32_ty);
        let fn_ty = self.fn_ty(void_ty, &[u32_ty, u32_ty, u32_ty, u32_ty, u32_ty]);

        let c0 = self.const_u32(0);
        let c1 = self.const_u32(1);
        let c_scope_device = self.const_u32(spirv::Scope::Device as u32);
        let c_record_words = self.const_u32(record::RECORD_WORDS as u32);
        let c_version = self.const_u32(record::STREAM_VERSION);
        let c_shader_id = self.const_u32(shader_id);
        let c_stage = self.const_u32(model);

        let function = self.module.alloc_id();
        let params: Vec<Word> = (0..5).map(|_| self.module.alloc_id()).collect();
        let (p_inst, p_err, p_p0, p_p1, p_p2) =
            (params[0], params[1], params[2], params[3], params[4]);

        let entry = self.module.alloc_id();
        let store_block = self.module.alloc_id();
        let merge = self.module.alloc_id();

        let mut body = Vec::new();
        body.push(Instruction::new(Op::Function, vec![void_ty, function, 0, fn_ty]));
        for &param in &params {
            body.push(Instruction::new(Op::FunctionParameter, vec![u32_ty, param]));
        }
        body.push(Instruction::new(Op::Label, vec![entry]));

        let capacity = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ArrayLength,
            vec![u32_ty, capacity, output_var, 1],
        ));
        let count_ptr = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u32, count_ptr, output_var, c0],
        ));
        let cursor = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AtomicIAdd,
            vec![u32_ty, cursor, count_ptr, c_scope_device, c0, c_record_words],
        ));
        let end = self.module.alloc_id();
        body.push(Instruction::new(Op::IAdd, vec![u32_ty, end, cursor, c_record_words]));
        let fits = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ULessThanEqual,
            vec![bool_ty, fits, end, capacity],
        ));
        body.push(Instruction::new(Op::SelectionMerge, vec![merge, 0]));
        body.push(Instruction::new(
            Op::BranchConditional,
            vec![fits, store_block, merge],
        ));

        body.push(Instruction::new(Op::Label, vec![store_block]));
        let payload = self.stage_payload(analysis, model, &mut body);
        let record_words: [(usize, Word); record::RECORD_WORDS] = [
            (record::REC_LEN, c_record_words),
            (record::REC_VERSION, c_version),
            (record::REC_SHADER_ID, c_shader_id),
            (record::REC_INSTRUCTION_INDEX, p_inst),
            (record::REC_STAGE, c_stage),
            (record::REC_STAGE_WORD_0, payload[0]),
            (record::REC_STAGE_WORD_1, payload[1]),
            (record::REC_STAGE_WORD_2, payload[2]),
            (record::REC_ERROR_KIND, p_err),
            (record::REC_PARAM_0, p_p0),
            (record::REC_PARAM_1, p_p1),
            (record::REC_PARAM_2, p_p2),
        ];
        for &(offset, value) in &record_words {
            let c_offset = self.const_u32(offset as u32);
            let index = self.module.alloc_id();
            body.push(Instruction::new(Op::IAdd, vec![u32_ty, index, cursor, c_offset]));
            let ptr = self.module.alloc_id();
            body.push(Instruction::new(
                Op::AccessChain,
                vec![ptr_u32, ptr, output_var, c1, index],
            ));
            body.push(Instruction::new(Op::Store, vec![ptr, value]));
        }
        body.push(Instruction::new(Op::Branch, vec![merge]));

        body.push(Instruction::new(Op::Label, vec![merge]));
        body.push(Instruction::new(Op::Return, vec![]));
        body.push(Instruction::new(Op::FunctionEnd, vec![]));

        self.functions.extend(body);
        function
    }

    /// `fn check_desc_index(index, length, instruction) -> u32`: report an
    /// out-of-range descriptor array index and clamp it to a safe value.
    fn emit_check_desc_index(&mut self, stream_write: Word) -> Word {
        let u32_ty = self.u32_ty();
        let bool_ty = self.bool_ty();
        let fn_ty = self.fn_ty(u32_ty, &[u32_ty, u32_ty, u32_ty]);
        let glsl = self.glsl_ext();

        let c0 = self.const_u32(0);
        let c1 = self.const_u32(1);
        let c_kind = self.const_u32(record::ErrorKind::DescriptorIndexOob as u32);

        let function = self.module.alloc_id();
        let p_index = self.module.alloc_id();
        let p_length = self.module.alloc_id();
        let p_inst = self.module.alloc_id();
        let entry = self.module.alloc_id();
        let report = self.module.alloc_id();
        let merge = self.module.alloc_id();

        let mut body = vec![
            Instruction::new(Op::Function, vec![u32_ty, function, 0, fn_ty]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_index]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_length]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_inst]),
            Instruction::new(Op::Label, vec![entry]),
        ];
        let in_bounds = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ULessThan,
            vec![bool_ty, in_bounds, p_index, p_length],
        ));
        body.push(Instruction::new(Op::SelectionMerge, vec![merge, 0]));
        body.push(Instruction::new(
            Op::BranchConditional,
            vec![in_bounds, merge, report],
        ));

        body.push(Instruction::new(Op::Label, vec![report]));
        let call = self.module.alloc_id();
        let void_ty = self.void_ty();
        body.push(Instruction::new(
            Op::FunctionCall,
            vec![void_ty, call, stream_write, p_inst, c_kind, p_index, p_length, c0],
        ));
        let last = self.module.alloc_id();
        body.push(Instruction::new(Op::ISub, vec![u32_ty, last, p_length, c1]));
        let clamped = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ExtInst,
            vec![u32_ty, clamped, glsl, GLSL_STD_450_UMIN, p_index, last],
        ));
        let has_length = self.module.alloc_id();
        body.push(Instruction::new(
            Op::INotEqual,
            vec![bool_ty, has_length, p_length, c0],
        ));
        let safe = self.module.alloc_id();
        body.push(Instruction::new(
            Op::Select,
            vec![u32_ty, safe, has_length, clamped, c0],
        ));
        body.push(Instruction::new(Op::Branch, vec![merge]));

        body.push(Instruction::new(Op::Label, vec![merge]));
        let result = self.module.alloc_id();
        body.push(Instruction::new(
            Op::Phi,
            vec![u32_ty, result, p_index, entry, safe, report],
        ));
        body.push(Instruction::new(Op::ReturnValue, vec![result]));
        body.push(Instruction::new(Op::FunctionEnd, vec![]));

        self.functions.extend(body);
        function
    }

    /// `fn check_index_bytes(index, length, stride, offset, kind,
    /// instruction) -> u32`: bounds check an element index into a buffer
    /// block array, reporting declared size and the accessed byte.
    fn emit_check_index_bytes(&mut self, stream_write: Word) -> Word {
        let u32_ty = self.u32_ty();
        let bool_ty = self.bool_ty();
        let void_ty = self.void_ty();
        let fn_ty = self.fn_ty(u32_ty, &[u32_ty; 6]);
        let glsl = self.glsl_ext();

        let c0 = self.const_u32(0);
        let c1 = self.const_u32(1);

        let function = self.module.alloc_id();
        let params: Vec<Word> = (0..6).map(|_| self.module.alloc_id()).collect();
        let (p_index, p_length, p_stride, p_offset, p_kind, p_inst) = (
            params[0], params[1], params[2], params[3], params[4], params[5],
        );
        let entry = self.module.alloc_id();
        let report = self.module.alloc_id();
        let merge = self.module.alloc_id();

        let mut body = vec![Instruction::new(Op::Function, vec![u32_ty, function, 0, fn_ty])];
        for &param in &params {
            body.push(Instruction::new(Op::FunctionParameter, vec![u32_ty, param]));
        }
        body.push(Instruction::new(Op::Label, vec![entry]));
        let in_bounds = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ULessThan,
            vec![bool_ty, in_bounds, p_index, p_length],
        ));
        body.push(Instruction::new(Op::SelectionMerge, vec![merge, 0]));
        body.push(Instruction::new(
            Op::BranchConditional,
            vec![in_bounds, merge, report],
        ));

        body.push(Instruction::new(Op::Label, vec![report]));
        let array_bytes = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IMul,
            vec![u32_ty, array_bytes, p_length, p_stride],
        ));
        let declared_size = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IAdd,
            vec![u32_ty, declared_size, array_bytes, p_offset],
        ));
        let element_byte = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IMul,
            vec![u32_ty, element_byte, p_index, p_stride],
        ));
        let accessed_byte = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IAdd,
            vec![u32_ty, accessed_byte, element_byte, p_offset],
        ));
        let call = self.module.alloc_id();
        body.push(Instruction::new(
            Op::FunctionCall,
            vec![
                void_ty,
                call,
                stream_write,
                p_inst,
                p_kind,
                c0,
                declared_size,
                accessed_byte,
            ],
        ));
        let last = self.module.alloc_id();
        body.push(Instruction::new(Op::ISub, vec![u32_ty, last, p_length, c1]));
        let clamped = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ExtInst,
            vec![u32_ty, clamped, glsl, GLSL_STD_450_UMIN, p_index, last],
        ));
        let has_length = self.module.alloc_id();
        body.push(Instruction::new(
            Op::INotEqual,
            vec![bool_ty, has_length, p_length, c0],
        ));
        let safe = self.module.alloc_id();
        body.push(Instruction::new(
            Op::Select,
            vec![u32_ty, safe, has_length, clamped, c0],
        ));
        body.push(Instruction::new(Op::Branch, vec![merge]));

        body.push(Instruction::new(Op::Label, vec![merge]));
        let result = self.module.alloc_id();
        body.push(Instruction::new(
            Op::Phi,
            vec![u32_ty, result, p_index, entry, safe, report],
        ));
        body.push(Instruction::new(Op::ReturnValue, vec![result]));
        body.push(Instruction::new(Op::FunctionEnd, vec![]));

        self.functions.extend(body);
        function
    }

    /// `fn check_written(status, index, instruction)`: a zero status word
    /// means the descriptor was never written.
    fn emit_check_written(&mut self, stream_write: Word) -> Word {
        let u32_ty = self.u32_ty();
        let bool_ty = self.bool_ty();
        let void_ty = self.void_ty();
        let fn_ty = self.fn_ty(void_ty, &[u32_ty, u32_ty, u32_ty]);

        let c0 = self.const_u32(0);
        let c_kind = self.const_u32(record::ErrorKind::DescriptorUninitialized as u32);

        let function = self.module.alloc_id();
        let p_status = self.module.alloc_id();
        let p_index = self.module.alloc_id();
        let p_inst = self.module.alloc_id();
        let entry = self.module.alloc_id();
        let report = self.module.alloc_id();
        let merge = self.module.alloc_id();

        let mut body = vec![
            Instruction::new(Op::Function, vec![void_ty, function, 0, fn_ty]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_status]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_index]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_inst]),
            Instruction::new(Op::Label, vec![entry]),
        ];
        let unwritten = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IEqual,
            vec![bool_ty, unwritten, p_status, c0],
        ));
        body.push(Instruction::new(Op::SelectionMerge, vec![merge, 0]));
        body.push(Instruction::new(
            Op::BranchConditional,
            vec![unwritten, report, merge],
        ));
        body.push(Instruction::new(Op::Label, vec![report]));
        let call = self.module.alloc_id();
        body.push(Instruction::new(
            Op::FunctionCall,
            vec![void_ty, call, stream_write, p_inst, c_kind, p_index, c0, c0],
        ));
        body.push(Instruction::new(Op::Branch, vec![merge]));
        body.push(Instruction::new(Op::Label, vec![merge]));
        body.push(Instruction::new(Op::Return, vec![]));
        body.push(Instruction::new(Op::FunctionEnd, vec![]));

        self.functions.extend(body);
        function
    }

    /// `fn check_bda(address, instruction)`: walk the sorted address table
    /// and report an address no allocation covers. The table is bounded by
    /// a null address below and a `u64::MAX` sentinel above, so the scan
    /// always terminates.
    fn emit_check_bda(&mut self, stream_write: Word, bda_var: Word, class: u32) -> Word {
        let u32_ty = self.u32_ty();
        let u64_ty = self.u64_ty();
        let bool_ty = self.bool_ty();
        let void_ty = self.void_ty();
        let ptr_u64 = self.ptr_ty(class, u64_ty);
        let fn_ty = self.fn_ty(void_ty, &[u64_ty, u32_ty]);

        let c0 = self.const_u32(0);
        let c1 = self.const_u32(1);
        let c32 = self.const_u32(32);
        let c_kind = self.const_u32(record::ErrorKind::DeviceAddressUnallocated as u32);

        let function = self.module.alloc_id();
        let p_addr = self.module.alloc_id();
        let p_inst = self.module.alloc_id();
        let entry = self.module.alloc_id();
        let header = self.module.alloc_id();
        let loop_body = self.module.alloc_id();
        let continue_block = self.module.alloc_id();
        let loop_merge = self.module.alloc_id();
        let report = self.module.alloc_id();
        let merge = self.module.alloc_id();

        let mut body = vec![
            Instruction::new(Op::Function, vec![void_ty, function, 0, fn_ty]),
            Instruction::new(Op::FunctionParameter, vec![u64_ty, p_addr]),
            Instruction::new(Op::FunctionParameter, vec![u32_ty, p_inst]),
            Instruction::new(Op::Label, vec![entry]),
        ];

        // sizes_start = u32(table[0])
        let start_ptr = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u64, start_ptr, bda_var, c0, c0],
        ));
        let start64 = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![u64_ty, start64, start_ptr]));
        let start = self.module.alloc_id();
        body.push(Instruction::new(Op::UConvert, vec![u32_ty, start, start64]));
        body.push(Instruction::new(Op::Branch, vec![header]));

        // Find the first table entry greater than the address.
        body.push(Instruction::new(Op::Label, vec![header]));
        let i = self.module.alloc_id();
        let i_next = self.module.alloc_id();
        body.push(Instruction::new(
            Op::Phi,
            vec![u32_ty, i, c1, entry, i_next, continue_block],
        ));
        body.push(Instruction::new(
            Op::LoopMerge,
            vec![loop_merge, continue_block, 0],
        ));
        body.push(Instruction::new(Op::Branch, vec![loop_body]));

        body.push(Instruction::new(Op::Label, vec![loop_body]));
        let entry_ptr = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u64, entry_ptr, bda_var, c0, i],
        ));
        let entry_value = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![u64_ty, entry_value, entry_ptr]));
        let keep_going = self.module.alloc_id();
        body.push(Instruction::new(
            Op::UGreaterThanEqual,
            vec![bool_ty, keep_going, p_addr, entry_value],
        ));
        body.push(Instruction::new(
            Op::BranchConditional,
            vec![keep_going, continue_block, loop_merge],
        ));

        body.push(Instruction::new(Op::Label, vec![continue_block]));
        body.push(Instruction::new(Op::IAdd, vec![u32_ty, i_next, i, c1]));
        body.push(Instruction::new(Op::Branch, vec![header]));

        body.push(Instruction::new(Op::Label, vec![loop_merge]));
        let candidate = self.module.alloc_id();
        body.push(Instruction::new(Op::ISub, vec![u32_ty, candidate, i, c1]));
        let base_ptr = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u64, base_ptr, bda_var, c0, candidate],
        ));
        let base = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![u64_ty, base, base_ptr]));
        // Addresses start at word 1, their sizes at word `sizes_start`, so
        // the size of the entry at `candidate` sits at
        // `sizes_start + candidate - 1`.
        let candidate_m1 = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ISub,
            vec![u32_ty, candidate_m1, candidate, c1],
        ));
        let size_index = self.module.alloc_id();
        body.push(Instruction::new(
            Op::IAdd,
            vec![u32_ty, size_index, start, candidate_m1],
        ));
        let size_ptr = self.module.alloc_id();
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u64, size_ptr, bda_var, c0, size_index],
        ));
        let size = self.module.alloc_id();
        body.push(Instruction::new(Op::Load, vec![u64_ty, size, size_ptr]));
        let delta = self.module.alloc_id();
        body.push(Instruction::new(Op::ISub, vec![u64_ty, delta, p_addr, base]));
        let oob = self.module.alloc_id();
        body.push(Instruction::new(
            Op::UGreaterThanEqual,
            vec![bool_ty, oob, delta, size],
        ));
        body.push(Instruction::new(Op::SelectionMerge, vec![merge, 0]));
        body.push(Instruction::new(Op::BranchConditional, vec![oob, report, merge]));

        body.push(Instruction::new(Op::Label, vec![report]));
        let low = self.module.alloc_id();
        body.push(Instruction::new(Op::UConvert, vec![u32_ty, low, p_addr]));
        let shifted = self.module.alloc_id();
        body.push(Instruction::new(
            Op::ShiftRightLogical,
            vec![u64_ty, shifted, p_addr, c32],
        ));
        let high = self.module.alloc_id();
        body.push(Instruction::new(Op::UConvert, vec![u32_ty, high, shifted]));
        let call = self.module.alloc_id();
        body.push(Instruction::new(
            Op::FunctionCall,
            vec![void_ty, call, stream_write, p_inst, c_kind, low, high, c0],
        ));
        body.push(Instruction::new(Op::Branch, vec![merge]));

        body.push(Instruction::new(Op::Label, vec![merge]));
        body.push(Instruction::new(Op::Return, vec![]));
        body.push(Instruction::new(Op::FunctionEnd, vec![]));

        self.functions.extend(body);
        function
    }
}

//! The bindless/bounds/address check injection pass.
//!
//! One linear scan classifies the module (types, constants, decorations,
//! entry points); a second walk over the function bodies collects the
//! access patterns worth checking; then the diagnostics interface and the
//! helper functions are appended and every site is rerouted through a
//! checked index or probe call. Ids are only ever added above the old
//! bound, so untouched instructions keep their meaning.

use spirv::Op;

use super::builder::{
    Emitter, Injected, STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER, STORAGE_CLASS_STORAGE_BUFFER,
};
use super::module::{Instruction, SpirvModule, Word};
use crate::record::ErrorKind;
use crate::{FastHashMap, FastHashSet};

#[derive(Clone, Debug)]
pub struct PassOptions {
    /// Descriptor set index reserved for the diagnostics bindings.
    pub reserved_set: u32,
    /// Unique id baked into every record this shader writes.
    pub shader_id: u32,
    pub descriptor_indexing: bool,
    pub buffer_oob: bool,
    pub buffer_device_address: bool,
}

#[derive(Clone, Debug)]
pub(super) enum TypeInfo {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Word, count: u32 },
    Array { element: Word, length: Word },
    RuntimeArray { element: Word },
    Struct { members: Vec<Word> },
    Pointer { class: u32, pointee: Word },
    Image,
    Sampler,
    SampledImage,
    Function { ret: Word, params: Vec<Word> },
}

#[derive(Default)]
pub(super) struct Analysis {
    pub types: FastHashMap<Word, TypeInfo>,
    /// Integer `OpConstant` values.
    pub constants: FastHashMap<Word, (Word, u64)>,
    /// Module-scope variables: id -> (storage class, pointee type).
    pub global_vars: FastHashMap<Word, (u32, Word)>,
    /// Variables carrying DescriptorSet + Binding decorations.
    pub descriptor_bindings: FastHashMap<Word, (u32, u32)>,
    pub array_strides: FastHashMap<Word, u32>,
    pub member_offsets: FastHashMap<(Word, u32), u32>,
    pub block_structs: FastHashSet<Word>,
    pub buffer_block_structs: FastHashSet<Word>,
    /// BuiltIn decoration -> decorated variable.
    pub builtins: FastHashMap<u32, Word>,
    pub capabilities: FastHashSet<u32>,
    pub ext_glsl: Option<Word>,
    /// (execution model, entry function id) per entry point.
    pub entry_points: Vec<(u32, Word)>,
    /// Result id -> result type, for the value-producing opcodes the pass
    /// cares about. Anything absent here is left uninstrumented.
    pub value_types: FastHashMap<Word, Word>,
    pub memory_model_index: usize,
}

fn produces_typed_value(opcode: u16) -> bool {
    const VALUE_OPS: &[Op] = &[
        Op::Undef,
        Op::Variable,
        Op::Load,
        Op::AccessChain,
        Op::InBoundsAccessChain,
        Op::PtrAccessChain,
        Op::FunctionParameter,
        Op::FunctionCall,
        Op::CopyObject,
        Op::Bitcast,
        Op::ConvertUToPtr,
        Op::ConvertPtrToU,
        Op::UConvert,
        Op::SConvert,
        Op::SNegate,
        Op::IAdd,
        Op::ISub,
        Op::IMul,
        Op::UDiv,
        Op::SDiv,
        Op::UMod,
        Op::SMod,
        Op::SRem,
        Op::BitwiseAnd,
        Op::BitwiseOr,
        Op::BitwiseXor,
        Op::ShiftLeftLogical,
        Op::ShiftRightLogical,
        Op::ShiftRightArithmetic,
        Op::Select,
        Op::Phi,
        Op::CompositeExtract,
        Op::VectorExtractDynamic,
        Op::ExtInst,
        Op::AtomicIAdd,
        Op::AtomicLoad,
    ];
    VALUE_OPS.iter().any(|&op| op as u16 == opcode)
}

/// Minimum operand count the analysis arms rely on, per opcode.
fn expected_operands(opcode: u16) -> usize {
    const COUNTS: &[(Op, usize)] = &[
        (Op::Capability, 1),
        (Op::MemoryModel, 2),
        (Op::ExtInstImport, 2),
        (Op::EntryPoint, 3),
        (Op::Decorate, 2),
        (Op::MemberDecorate, 3),
        (Op::TypeVoid, 1),
        (Op::TypeBool, 1),
        (Op::TypeInt, 3),
        (Op::TypeFloat, 2),
        (Op::TypeVector, 3),
        (Op::TypeArray, 3),
        (Op::TypeRuntimeArray, 2),
        (Op::TypeStruct, 1),
        (Op::TypePointer, 3),
        (Op::TypeImage, 2),
        (Op::TypeSampler, 1),
        (Op::TypeSampledImage, 2),
        (Op::TypeFunction, 2),
        (Op::Constant, 3),
        (Op::Variable, 3),
    ];
    COUNTS
        .iter()
        .find(|&&(op, _)| op as u16 == opcode)
        .map(|&(_, count)| count)
        .unwrap_or(0)
}

pub(super) fn analyze(module: &SpirvModule) -> Analysis {
    let mut analysis = Analysis::default();

    for (index, ins) in module.instructions.iter().enumerate() {
        let ops = &ins.operands;
        // Operand counts below follow the SPIR-V grammar; a module that
        // lies about them is skipped rather than trusted.
        match ins.opcode {
            _ if ops.len() < expected_operands(ins.opcode) => continue,
            op if op == Op::Capability as u16 => {
                analysis.capabilities.insert(ops[0]);
            }
            op if op == Op::MemoryModel as u16 => {
                analysis.memory_model_index = index;
            }
            op if op == Op::ExtInstImport as u16 => {
                let name_words = &ops[1..];
                if super::module::string_to_words("GLSL.std.450") == name_words {
                    analysis.ext_glsl = Some(ops[0]);
                }
            }
            op if op == Op::EntryPoint as u16 => {
                analysis.entry_points.push((ops[0], ops[1]));
            }
            op if op == Op::Decorate as u16 => {
                let (target, decoration) = (ops[0], ops[1]);
                let argument = ops.get(2).copied();
                match decoration {
                    d if d == spirv::Decoration::DescriptorSet as u32 => {
                        if let Some(set) = argument {
                            analysis
                                .descriptor_bindings
                                .entry(target)
                                .or_insert((0, 0))
                                .0 = set;
                        }
                    }
                    d if d == spirv::Decoration::Binding as u32 => {
                        if let Some(binding) = argument {
                            analysis
                                .descriptor_bindings
                                .entry(target)
                                .or_insert((0, 0))
                                .1 = binding;
                        }
                    }
                    d if d == spirv::Decoration::ArrayStride as u32 => {
                        if let Some(stride) = argument {
                            analysis.array_strides.insert(target, stride);
                        }
                    }
                    d if d == spirv::Decoration::Block as u32 => {
                        analysis.block_structs.insert(target);
                    }
                    d if d == spirv::Decoration::BufferBlock as u32 => {
                        analysis.buffer_block_structs.insert(target);
                    }
                    d if d == spirv::Decoration::BuiltIn as u32 => {
                        if let Some(builtin) = argument {
                            analysis.builtins.insert(builtin, target);
                        }
                    }
                    _ => {}
                }
            }
            op if op == Op::MemberDecorate as u16 => {
                if ops[2] == spirv::Decoration::Offset as u32 {
                    if let Some(&offset) = ops.get(3) {
                        analysis.member_offsets.insert((ops[0], ops[1]), offset);
                    }
                }
            }
            op if op == Op::TypeVoid as u16 => {
                analysis.types.insert(ops[0], TypeInfo::Void);
            }
            op if op == Op::TypeBool as u16 => {
                analysis.types.insert(ops[0], TypeInfo::Bool);
            }
            op if op == Op::TypeInt as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Int {
                        width: ops[1],
                        signed: ops[2] != 0,
                    },
                );
            }
            op if op == Op::TypeFloat as u16 => {
                analysis.types.insert(ops[0], TypeInfo::Float { width: ops[1] });
            }
            op if op == Op::TypeVector as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Vector {
                        component: ops[1],
                        count: ops[2],
                    },
                );
            }
            op if op == Op::TypeArray as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Array {
                        element: ops[1],
                        length: ops[2],
                    },
                );
            }
            op if op == Op::TypeRuntimeArray as u16 => {
                analysis
                    .types
                    .insert(ops[0], TypeInfo::RuntimeArray { element: ops[1] });
            }
            op if op == Op::TypeStruct as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Struct {
                        members: ops[1..].to_vec(),
                    },
                );
            }
            op if op == Op::TypePointer as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Pointer {
                        class: ops[1],
                        pointee: ops[2],
                    },
                );
            }
            op if op == Op::TypeImage as u16 => {
                analysis.types.insert(ops[0], TypeInfo::Image);
            }
            op if op == Op::TypeSampler as u16 => {
                analysis.types.insert(ops[0], TypeInfo::Sampler);
            }
            op if op == Op::TypeSampledImage as u16 => {
                analysis.types.insert(ops[0], TypeInfo::SampledImage);
            }
            op if op == Op::TypeFunction as u16 => {
                analysis.types.insert(
                    ops[0],
                    TypeInfo::Function {
                        ret: ops[1],
                        params: ops[2..].to_vec(),
                    },
                );
            }
            op if op == Op::Constant as u16 => {
                let value = match ops.len() {
                    3 => ops[2] as u64,
                    4 => (ops[3] as u64) << 32 | ops[2] as u64,
                    _ => {
                        continue;
                    }
                };
                analysis.constants.insert(ops[1], (ops[0], value));
                analysis.value_types.insert(ops[1], ops[0]);
            }
            op if op == Op::Variable as u16 => {
                analysis.value_types.insert(ops[1], ops[0]);
                // Function-local variables land here too, but they use the
                // Function storage class and never match the patterns the
                // pass looks for, so a single map is fine.
                if let Some(&TypeInfo::Pointer { class, pointee }) = analysis.types.get(&ops[0]) {
                    analysis.global_vars.insert(ops[1], (class, pointee));
                }
            }
            op if produces_typed_value(op) => {
                if ops.len() >= 2 {
                    analysis.value_types.insert(ops[1], ops[0]);
                }
            }
            _ => {}
        }
    }

    analysis
}

enum LengthSource {
    Constant(u32),
    /// Length looked up in the descriptor-indexing input table at runtime.
    InputTable,
}

enum BoundsLength {
    ArrayLength { var: Word, member: u32 },
    Constant(u32),
}

enum SiteKind {
    DescriptorIndex {
        index_operand: usize,
        length: LengthSource,
        set: u32,
        binding: u32,
    },
    BufferBounds {
        index_operand: usize,
        length: BoundsLength,
        stride: u32,
        offset: u32,
        kind: ErrorKind,
    },
    BufferAddress {
        pointer: Word,
    },
}

struct Site {
    instruction: usize,
    kind: SiteKind,
}

fn is_opaque_descriptor(analysis: &Analysis, ty: Word) -> bool {
    match analysis.types.get(&ty) {
        Some(TypeInfo::Image) | Some(TypeInfo::Sampler) | Some(TypeInfo::SampledImage) => true,
        Some(TypeInfo::Struct { .. }) => {
            analysis.block_structs.contains(&ty) || analysis.buffer_block_structs.contains(&ty)
        }
        _ => false,
    }
}

fn const_u32_value(analysis: &Analysis, id: Word) -> Option<u32> {
    analysis
        .constants
        .get(&id)
        .map(|&(_, value)| value as u32)
}

fn collect_sites(
    module: &SpirvModule,
    analysis: &Analysis,
    options: &PassOptions,
) -> Vec<Site> {
    let mut sites = Vec::new();
    let body_start = module.first_function_index();

    for (index, ins) in module.instructions.iter().enumerate().skip(body_start) {
        let ops = &ins.operands;
        if ins.is(Op::AccessChain) || ins.is(Op::InBoundsAccessChain) {
            if ops.len() < 4 {
                continue;
            }
            let base = ops[2];
            let (class, pointee) = match analysis.global_vars.get(&base) {
                Some(&pair) => pair,
                None => continue,
            };
            let (set, binding) = match analysis.descriptor_bindings.get(&base) {
                Some(&pair) => pair,
                None => continue,
            };
            match analysis.types.get(&pointee) {
                Some(&TypeInfo::Array { element, length })
                    if is_opaque_descriptor(analysis, element) =>
                {
                    let declared = match const_u32_value(analysis, length) {
                        Some(value) => value,
                        None => continue,
                    };
                    // A constant index that is statically in bounds needs
                    // no runtime check.
                    if let Some(value) = const_u32_value(analysis, ops[3]) {
                        if value < declared {
                            continue;
                        }
                    }
                    sites.push(Site {
                        instruction: index,
                        kind: SiteKind::DescriptorIndex {
                            index_operand: 3,
                            length: LengthSource::Constant(declared),
                            set,
                            binding,
                        },
                    });
                }
                Some(&TypeInfo::RuntimeArray { element })
                    if is_opaque_descriptor(analysis, element) =>
                {
                    // Runtime-sized descriptor arrays only carry a length
                    // in the input table, which exists only when
                    // descriptor indexing validation is on.
                    if !options.descriptor_indexing {
                        continue;
                    }
                    sites.push(Site {
                        instruction: index,
                        kind: SiteKind::DescriptorIndex {
                            index_operand: 3,
                            length: LengthSource::InputTable,
                            set,
                            binding,
                        },
                    });
                }
                Some(TypeInfo::Struct { members }) if options.buffer_oob => {
                    let is_block = analysis.block_structs.contains(&pointee);
                    let is_buffer_block = analysis.buffer_block_structs.contains(&pointee);
                    if !is_block && !is_buffer_block {
                        continue;
                    }
                    let member = match const_u32_value(analysis, ops[3]) {
                        Some(value) => value,
                        None => continue,
                    };
                    let member_ty = match members.get(member as usize) {
                        Some(&ty) => ty,
                        None => continue,
                    };
                    if ops.len() < 5 {
                        continue;
                    }
                    let storage = class == STORAGE_CLASS_STORAGE_BUFFER || is_buffer_block;
                    let kind = if storage {
                        ErrorKind::StorageBufferOob
                    } else {
                        ErrorKind::UniformBufferOob
                    };
                    let offset = *analysis.member_offsets.get(&(pointee, member)).unwrap_or(&0);
                    match analysis.types.get(&member_ty) {
                        Some(&TypeInfo::RuntimeArray { .. }) => {
                            let stride = match analysis.array_strides.get(&member_ty) {
                                Some(&stride) => stride,
                                None => continue,
                            };
                            sites.push(Site {
                                instruction: index,
                                kind: SiteKind::BufferBounds {
                                    index_operand: 4,
                                    length: BoundsLength::ArrayLength {
                                        var: base,
                                        member,
                                    },
                                    stride,
                                    offset,
                                    kind,
                                },
                            });
                        }
                        Some(&TypeInfo::Array { length, .. }) => {
                            let declared = match const_u32_value(analysis, length) {
                                Some(value) => value,
                                None => continue,
                            };
                            if let Some(value) = const_u32_value(analysis, ops[4]) {
                                if value < declared {
                                    continue;
                                }
                            }
                            let stride = match analysis.array_strides.get(&member_ty) {
                                Some(&stride) => stride,
                                None => continue,
                            };
                            sites.push(Site {
                                instruction: index,
                                kind: SiteKind::BufferBounds {
                                    index_operand: 4,
                                    length: BoundsLength::Constant(declared),
                                    stride,
                                    offset,
                                    kind,
                                },
                            });
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        } else if options.buffer_device_address && (ins.is(Op::Load) || ins.is(Op::Store)) {
            if ops.len() < if ins.is(Op::Load) { 3 } else { 2 } {
                continue;
            }
            let pointer = if ins.is(Op::Load) { ops[2] } else { ops[0] };
            let pointer_ty = match analysis.value_types.get(&pointer) {
                Some(&ty) => ty,
                None => continue,
            };
            if let Some(&TypeInfo::Pointer { class, .. }) = analysis.types.get(&pointer_ty) {
                if class == STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER {
                    sites.push(Site {
                        instruction: index,
                        kind: SiteKind::BufferAddress { pointer },
                    });
                }
            }
        }
    }

    sites
}

#[derive(Default)]
struct PlannedEdit {
    pre: Vec<Instruction>,
    replace: Option<(usize, Word)>,
}

/// Convert an index operand to u32 if its type is known; `None` keeps the
/// site uninstrumented (fail open rather than risk an ill-typed module).
fn index_as_u32(
    emitter: &mut Emitter<'_>,
    analysis: &Analysis,
    index_id: Word,
    pre: &mut Vec<Instruction>,
) -> Option<Word> {
    let ty = *analysis.value_types.get(&index_id)?;
    match analysis.types.get(&ty) {
        Some(&TypeInfo::Int { width: 32, signed }) => {
            if signed {
                let u32_ty = emitter.u32_ty();
                let cast = emitter.module.alloc_id();
                pre.push(Instruction::new(Op::Bitcast, vec![u32_ty, cast, index_id]));
                Some(cast)
            } else {
                Some(index_id)
            }
        }
        _ => None,
    }
}

/// Emit `data[data[…]]` chains over the descriptor-indexing input table.
fn load_table_word(
    emitter: &mut Emitter<'_>,
    di_var: Word,
    class: u32,
    index: Word,
    pre: &mut Vec<Instruction>,
) -> Word {
    let u32_ty = emitter.u32_ty();
    let ptr_u32 = emitter.ptr_ty(class, u32_ty);
    let c0 = emitter.const_u32(0);
    let ptr = emitter.module.alloc_id();
    pre.push(Instruction::new(
        Op::AccessChain,
        vec![ptr_u32, ptr, di_var, c0, index],
    ));
    let value = emitter.module.alloc_id();
    pre.push(Instruction::new(Op::Load, vec![u32_ty, value, ptr]));
    value
}

fn add_u32(
    emitter: &mut Emitter<'_>,
    a: Word,
    b: Word,
    pre: &mut Vec<Instruction>,
) -> Word {
    let u32_ty = emitter.u32_ty();
    let sum = emitter.module.alloc_id();
    pre.push(Instruction::new(Op::IAdd, vec![u32_ty, sum, a, b]));
    sum
}

/// Run the pass. Returns false when nothing needed instrumentation, in
/// which case the module is untouched.
pub(super) fn run(module: &mut SpirvModule, options: &PassOptions) -> bool {
    let analysis = analyze(module);
    let sites = collect_sites(module, &analysis, options);
    if sites.is_empty() {
        return false;
    }

    let need_di = options.descriptor_indexing;
    let need_bda = options.buffer_device_address
        && sites
            .iter()
            .any(|site| matches!(site.kind, SiteKind::BufferAddress { .. }));

    let annotations_index = module.globals_start();
    let functions_index = module.first_function_index();
    let memory_model_index = analysis.memory_model_index;

    let mut emitter = Emitter::new(module, &analysis);
    let (output_var, di_var, bda_var, class) =
        emitter.declare_interface(options.reserved_set, need_di, need_bda);
    let injected: Injected = emitter.emit_helpers(
        &analysis,
        options.shader_id,
        output_var,
        di_var,
        bda_var,
        class,
        need_bda,
    );

    // Plan the per-site rewrites.
    let mut edits: FastHashMap<usize, PlannedEdit> = FastHashMap::default();
    for site in &sites {
        let ordinal = emitter.const_u32(site.instruction as u32);
        let mut pre = Vec::new();
        let mut replace = None;
        match site.kind {
            SiteKind::DescriptorIndex {
                index_operand,
                ref length,
                set,
                binding,
            } => {
                let index_id = module_operand(&emitter, site.instruction, index_operand);
                let index = match index_as_u32(&mut emitter, &analysis, index_id, &mut pre) {
                    Some(id) => id,
                    None => continue,
                };
                let length_id = match *length {
                    LengthSource::Constant(value) => emitter.const_u32(value),
                    LengthSource::InputTable => {
                        let di = match injected.di_var {
                            Some(var) => var,
                            None => continue,
                        };
                        // length = data[data[1 + set] + binding]
                        let c_slot = emitter.const_u32(1 + set);
                        let sizes_base = load_table_word(&mut emitter, di, class, c_slot, &mut pre);
                        let c_binding = emitter.const_u32(binding);
                        let index_word = add_u32(&mut emitter, sizes_base, c_binding, &mut pre);
                        load_table_word(&mut emitter, di, class, index_word, &mut pre)
                    }
                };
                let u32_ty = emitter.u32_ty();
                let checked = emitter.module.alloc_id();
                pre.push(Instruction::new(
                    Op::FunctionCall,
                    vec![
                        u32_ty,
                        checked,
                        injected.fn_check_desc_index,
                        index,
                        length_id,
                        ordinal,
                    ],
                ));
                replace = Some((index_operand, checked));

                if let Some(di) = injected.di_var {
                    // status = data[data[data[data[0] + set] + binding] + index]
                    let c0 = emitter.const_u32(0);
                    let start = load_table_word(&mut emitter, di, class, c0, &mut pre);
                    let c_set = emitter.const_u32(set);
                    let set_slot = add_u32(&mut emitter, start, c_set, &mut pre);
                    let bindings_base = load_table_word(&mut emitter, di, class, set_slot, &mut pre);
                    let c_binding = emitter.const_u32(binding);
                    let binding_slot = add_u32(&mut emitter, bindings_base, c_binding, &mut pre);
                    let written_base =
                        load_table_word(&mut emitter, di, class, binding_slot, &mut pre);
                    let status_slot = add_u32(&mut emitter, written_base, index, &mut pre);
                    let status = load_table_word(&mut emitter, di, class, status_slot, &mut pre);
                    let void_ty = emitter.void_ty();
                    let call = emitter.module.alloc_id();
                    pre.push(Instruction::new(
                        Op::FunctionCall,
                        vec![
                            void_ty,
                            call,
                            injected.fn_check_written,
                            status,
                            index,
                            ordinal,
                        ],
                    ));
                }
            }
            SiteKind::BufferBounds {
                index_operand,
                ref length,
                stride,
                offset,
                kind,
            } => {
                let index_id = module_operand(&emitter, site.instruction, index_operand);
                let index = match index_as_u32(&mut emitter, &analysis, index_id, &mut pre) {
                    Some(id) => id,
                    None => continue,
                };
                let u32_ty = emitter.u32_ty();
                let length_id = match *length {
                    BoundsLength::Constant(value) => emitter.const_u32(value),
                    BoundsLength::ArrayLength { var, member } => {
                        let id = emitter.module.alloc_id();
                        pre.push(Instruction::new(
                            Op::ArrayLength,
                            vec![u32_ty, id, var, member],
                        ));
                        id
                    }
                };
                let c_stride = emitter.const_u32(stride);
                let c_offset = emitter.const_u32(offset);
                let c_kind = emitter.const_u32(kind as u32);
                let checked = emitter.module.alloc_id();
                pre.push(Instruction::new(
                    Op::FunctionCall,
                    vec![
                        u32_ty,
                        checked,
                        injected.fn_check_index_bytes,
                        index,
                        length_id,
                        c_stride,
                        c_offset,
                        c_kind,
                        ordinal,
                    ],
                ));
                replace = Some((index_operand, checked));
            }
            SiteKind::BufferAddress { pointer } => {
                let check = match injected.fn_check_bda {
                    Some(id) => id,
                    None => continue,
                };
                let u64_ty = emitter.u64_ty();
                let void_ty = emitter.void_ty();
                let address = emitter.module.alloc_id();
                pre.push(Instruction::new(
                    Op::ConvertPtrToU,
                    vec![u64_ty, address, pointer],
                ));
                let call = emitter.module.alloc_id();
                pre.push(Instruction::new(
                    Op::FunctionCall,
                    vec![void_ty, call, check, address, ordinal],
                ));
            }
        }
        let edit = edits.entry(site.instruction).or_default();
        edit.pre.extend(pre);
        if replace.is_some() {
            edit.replace = replace;
        }
    }

    if edits.is_empty() {
        return false;
    }

    let Emitter {
        capabilities,
        ext_imports,
        annotations,
        globals,
        functions,
        interface_inputs,
        interface_buffers,
        ..
    } = emitter;

    // New global variables join the entry point interfaces: inputs always,
    // buffers starting with SPIR-V 1.4 where the interface covers every
    // storage class.
    let list_buffers = module.version_at_least(1, 4);
    for ins in module.instructions.iter_mut() {
        if ins.is(Op::EntryPoint) {
            ins.operands.extend_from_slice(&interface_inputs);
            if list_buffers {
                ins.operands.extend_from_slice(&interface_buffers);
            }
        }
    }

    // Splice everything into its section in one rebuild.
    let old = std::mem::take(&mut module.instructions);
    let mut out =
        Vec::with_capacity(old.len() + globals.len() + functions.len() + annotations.len());
    out.extend(capabilities);
    for (index, mut ins) in old.into_iter().enumerate() {
        if index == memory_model_index {
            out.extend(ext_imports.iter().cloned());
        }
        if index == annotations_index {
            out.extend(annotations.iter().cloned());
        }
        if index == functions_index {
            out.extend(globals.iter().cloned());
        }
        if let Some(edit) = edits.remove(&index) {
            out.extend(edit.pre);
            if let Some((operand, id)) = edit.replace {
                ins.operands[operand] = id;
            }
        }
        out.push(ins);
    }
    out.extend(functions);
    module.instructions = out;

    true
}

fn module_operand(emitter: &Emitter<'_>, instruction: usize, operand: usize) -> Word {
    emitter.module.instructions[instruction].operands[operand]
}

//! Generator for the instance-scanning compute shader.
//!
//! The shader walks a top-level build's instance array in a single
//! invocation, compares each instance's 64-bit bottom-level handle against
//! the table of currently valid handles, and on a mismatch bumps the error
//! counter, records the first offending handle and overwrites the
//! instance's handle with the replacement handle so the build stays
//! defined. Source reference, in GLSL terms:
//!
//! ```text
//! struct Instance { uint unused[14]; uint handle_bits_0; uint handle_bits_1; };
//! layout(set=0, binding=0, std430) buffer InstanceBuffer { Instance instances[]; };
//! layout(set=0, binding=1, std430) buffer ValidationBuffer {
//!     uint instances_to_validate;
//!     uint replacement_handle_bits_0;
//!     uint replacement_handle_bits_1;
//!     uint invalid_handle_found;
//!     uint invalid_handle_bits_0;
//!     uint invalid_handle_bits_1;
//!     uint valid_handles_count;
//!     uint valid_handles[];
//! };
//! void main() {
//!     for (uint i = 0; i < instances_to_validate; i++) {
//!         uint h0 = instances[i].handle_bits_0;
//!         uint h1 = instances[i].handle_bits_1;
//!         bool valid = false;
//!         for (uint j = 0; j < valid_handles_count; j++) {
//!             if (h0 == valid_handles[2*j+0] && h1 == valid_handles[2*j+1]) {
//!                 valid = true;
//!                 break;
//!             }
//!         }
//!         if (!valid) {
//!             invalid_handle_found += 1;
//!             invalid_handle_bits_0 = h0;
//!             invalid_handle_bits_1 = h1;
//!             instances[i].handle_bits_0 = replacement_handle_bits_0;
//!             instances[i].handle_bits_1 = replacement_handle_bits_1;
//!         }
//!     }
//! }
//! ```

use spirv::Op;

use crate::instrument::module::{string_to_words, Instruction, SpirvModule};

const UNIFORM: u32 = spirv::StorageClass::Uniform as u32;
const FUNCTION: u32 = spirv::StorageClass::Function as u32;

fn fresh(bound: &mut u32) -> u32 {
    *bound += 1;
    *bound
}

pub(super) fn validation_shader_words() -> Vec<u32> {
    let mut bound = 0u32;

    // Types, constants, interface.
    let void_ty = fresh(&mut bound);
    let fn_ty = fresh(&mut bound);
    let u32_ty = fresh(&mut bound);
    let bool_ty = fresh(&mut bound);
    let c: Vec<u32> = (0..8).map(|_| fresh(&mut bound)).collect();
    let c14 = fresh(&mut bound);
    let pad_array = fresh(&mut bound);
    let instance = fresh(&mut bound);
    let instance_rta = fresh(&mut bound);
    let instance_block = fresh(&mut bound);
    let ptr_instance_block = fresh(&mut bound);
    let instance_var = fresh(&mut bound);
    let handle_rta = fresh(&mut bound);
    let validation_block = fresh(&mut bound);
    let ptr_validation_block = fresh(&mut bound);
    let validation_var = fresh(&mut bound);
    let ptr_u32 = fresh(&mut bound);
    let ptr_u32_fn = fresh(&mut bound);
    let ptr_bool_fn = fresh(&mut bound);
    let const_false = fresh(&mut bound);
    let const_true = fresh(&mut bound);

    let main_fn = fresh(&mut bound);
    let entry = fresh(&mut bound);
    let var_i = fresh(&mut bound);
    let var_h0 = fresh(&mut bound);
    let var_h1 = fresh(&mut bound);
    let var_valid = fresh(&mut bound);
    let var_j = fresh(&mut bound);

    let outer_header = fresh(&mut bound);
    let outer_check = fresh(&mut bound);
    let outer_body = fresh(&mut bound);
    let outer_continue = fresh(&mut bound);
    let outer_merge = fresh(&mut bound);
    let inner_header = fresh(&mut bound);
    let inner_check = fresh(&mut bound);
    let inner_body = fresh(&mut bound);
    let inner_continue = fresh(&mut bound);
    let inner_merge = fresh(&mut bound);
    let match_then = fresh(&mut bound);
    let match_merge = fresh(&mut bound);
    let patch_then = fresh(&mut bound);
    let patch_merge = fresh(&mut bound);

    let mut ins = Vec::with_capacity(128);
    ins.push(Instruction::new(
        Op::Capability,
        vec![spirv::Capability::Shader as u32],
    ));
    ins.push(Instruction::new(
        Op::MemoryModel,
        vec![
            spirv::AddressingModel::Logical as u32,
            spirv::MemoryModel::GLSL450 as u32,
        ],
    ));
    let mut entry_ops = vec![spirv::ExecutionModel::GLCompute as u32, main_fn];
    entry_ops.extend(string_to_words("main"));
    ins.push(Instruction::new(Op::EntryPoint, entry_ops));
    ins.push(Instruction::new(
        Op::ExecutionMode,
        vec![main_fn, spirv::ExecutionMode::LocalSize as u32, 1, 1, 1],
    ));

    // Decorations.
    let decorate = |target: u32, decoration: spirv::Decoration, args: &[u32]| {
        let mut ops = vec![target, decoration as u32];
        ops.extend_from_slice(args);
        Instruction::new(Op::Decorate, ops)
    };
    let member = |target: u32, index: u32, offset: u32| {
        Instruction::new(
            Op::MemberDecorate,
            vec![target, index, spirv::Decoration::Offset as u32, offset],
        )
    };
    ins.push(decorate(pad_array, spirv::Decoration::ArrayStride, &[4]));
    ins.push(member(instance, 0, 0));
    ins.push(member(instance, 1, 56));
    ins.push(member(instance, 2, 60));
    ins.push(decorate(instance_rta, spirv::Decoration::ArrayStride, &[64]));
    ins.push(member(instance_block, 0, 0));
    ins.push(decorate(instance_block, spirv::Decoration::BufferBlock, &[]));
    ins.push(decorate(instance_var, spirv::Decoration::DescriptorSet, &[0]));
    ins.push(decorate(instance_var, spirv::Decoration::Binding, &[0]));
    ins.push(decorate(handle_rta, spirv::Decoration::ArrayStride, &[4]));
    for index in 0..8 {
        ins.push(member(validation_block, index, index * 4));
    }
    ins.push(decorate(
        validation_block,
        spirv::Decoration::BufferBlock,
        &[],
    ));
    ins.push(decorate(
        validation_var,
        spirv::Decoration::DescriptorSet,
        &[0],
    ));
    ins.push(decorate(validation_var, spirv::Decoration::Binding, &[1]));

    // Types and constants.
    ins.push(Instruction::new(Op::TypeVoid, vec![void_ty]));
    ins.push(Instruction::new(Op::TypeFunction, vec![fn_ty, void_ty]));
    ins.push(Instruction::new(Op::TypeInt, vec![u32_ty, 32, 0]));
    ins.push(Instruction::new(Op::TypeBool, vec![bool_ty]));
    for (value, &const_id) in c.iter().enumerate().map(|(v, id)| (v as u32, id)) {
        ins.push(Instruction::new(Op::Constant, vec![u32_ty, const_id, value]));
    }
    ins.push(Instruction::new(Op::Constant, vec![u32_ty, c14, 14]));
    ins.push(Instruction::new(Op::TypeArray, vec![pad_array, u32_ty, c14]));
    ins.push(Instruction::new(
        Op::TypeStruct,
        vec![instance, pad_array, u32_ty, u32_ty],
    ));
    ins.push(Instruction::new(
        Op::TypeRuntimeArray,
        vec![instance_rta, instance],
    ));
    ins.push(Instruction::new(
        Op::TypeStruct,
        vec![instance_block, instance_rta],
    ));
    ins.push(Instruction::new(
        Op::TypePointer,
        vec![ptr_instance_block, UNIFORM, instance_block],
    ));
    ins.push(Instruction::new(
        Op::Variable,
        vec![ptr_instance_block, instance_var, UNIFORM],
    ));
    ins.push(Instruction::new(
        Op::TypeRuntimeArray,
        vec![handle_rta, u32_ty],
    ));
    let mut validation_members = vec![validation_block];
    validation_members.extend(std::iter::repeat(u32_ty).take(7));
    validation_members.push(handle_rta);
    ins.push(Instruction::new(Op::TypeStruct, validation_members));
    ins.push(Instruction::new(
        Op::TypePointer,
        vec![ptr_validation_block, UNIFORM, validation_block],
    ));
    ins.push(Instruction::new(
        Op::Variable,
        vec![ptr_validation_block, validation_var, UNIFORM],
    ));
    ins.push(Instruction::new(
        Op::TypePointer,
        vec![ptr_u32, UNIFORM, u32_ty],
    ));
    ins.push(Instruction::new(
        Op::TypePointer,
        vec![ptr_u32_fn, FUNCTION, u32_ty],
    ));
    ins.push(Instruction::new(
        Op::TypePointer,
        vec![ptr_bool_fn, FUNCTION, bool_ty],
    ));
    ins.push(Instruction::new(Op::ConstantFalse, vec![bool_ty, const_false]));
    ins.push(Instruction::new(Op::ConstantTrue, vec![bool_ty, const_true]));

    // fn main
    ins.push(Instruction::new(Op::Function, vec![void_ty, main_fn, 0, fn_ty]));
    ins.push(Instruction::new(Op::Label, vec![entry]));
    for &(var, ptr) in &[
        (var_i, ptr_u32_fn),
        (var_h0, ptr_u32_fn),
        (var_h1, ptr_u32_fn),
        (var_valid, ptr_bool_fn),
        (var_j, ptr_u32_fn),
    ] {
        ins.push(Instruction::new(Op::Variable, vec![ptr, var, FUNCTION]));
    }
    ins.push(Instruction::new(Op::Store, vec![var_i, c[0]]));
    ins.push(Instruction::new(Op::Branch, vec![outer_header]));

    // Helpers for the repetitive load/access patterns.
    let mut body = Vec::new();
    let load_u32 = |bound: &mut u32, body: &mut Vec<Instruction>, ptr: u32| {
        let value = fresh(bound);
        body.push(Instruction::new(Op::Load, vec![u32_ty, value, ptr]));
        value
    };
    let header_ptr = |bound: &mut u32, body: &mut Vec<Instruction>, member_const: u32| {
        let ptr = fresh(bound);
        body.push(Instruction::new(
            Op::AccessChain,
            vec![ptr_u32, ptr, validation_var, member_const],
        ));
        ptr
    };
    let instance_handle_ptr =
        |bound: &mut u32, body: &mut Vec<Instruction>, index: u32, member_const: u32| {
            let ptr = fresh(bound);
            body.push(Instruction::new(
                Op::AccessChain,
                vec![ptr_u32, ptr, instance_var, c[0], index, member_const],
            ));
            ptr
        };

    // for (i = 0; i < instances_to_validate; i++)
    body.push(Instruction::new(Op::Label, vec![outer_header]));
    body.push(Instruction::new(
        Op::LoopMerge,
        vec![outer_merge, outer_continue, 0],
    ));
    body.push(Instruction::new(Op::Branch, vec![outer_check]));

    body.push(Instruction::new(Op::Label, vec![outer_check]));
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let count_ptr = header_ptr(&mut bound, &mut body, c[0]);
    let count = load_u32(&mut bound, &mut body, count_ptr);
    let keep_going = fresh(&mut bound);
    body.push(Instruction::new(
        Op::ULessThan,
        vec![bool_ty, keep_going, i_value, count],
    ));
    body.push(Instruction::new(
        Op::BranchConditional,
        vec![keep_going, outer_body, outer_merge],
    ));

    // h0 = instances[i].handle_bits_0; h1 = instances[i].handle_bits_1
    body.push(Instruction::new(Op::Label, vec![outer_body]));
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let h0_ptr = instance_handle_ptr(&mut bound, &mut body, i_value, c[1]);
    let h0 = load_u32(&mut bound, &mut body, h0_ptr);
    body.push(Instruction::new(Op::Store, vec![var_h0, h0]));
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let h1_ptr = instance_handle_ptr(&mut bound, &mut body, i_value, c[2]);
    let h1 = load_u32(&mut bound, &mut body, h1_ptr);
    body.push(Instruction::new(Op::Store, vec![var_h1, h1]));
    body.push(Instruction::new(Op::Store, vec![var_valid, const_false]));
    body.push(Instruction::new(Op::Store, vec![var_j, c[0]]));
    body.push(Instruction::new(Op::Branch, vec![inner_header]));

    // for (j = 0; j < valid_handles_count; j++)
    body.push(Instruction::new(Op::Label, vec![inner_header]));
    body.push(Instruction::new(
        Op::LoopMerge,
        vec![inner_merge, inner_continue, 0],
    ));
    body.push(Instruction::new(Op::Branch, vec![inner_check]));

    body.push(Instruction::new(Op::Label, vec![inner_check]));
    let j_value = load_u32(&mut bound, &mut body, var_j);
    let valid_count_ptr = header_ptr(&mut bound, &mut body, c[6]);
    let valid_count = load_u32(&mut bound, &mut body, valid_count_ptr);
    let scan = fresh(&mut bound);
    body.push(Instruction::new(
        Op::ULessThan,
        vec![bool_ty, scan, j_value, valid_count],
    ));
    body.push(Instruction::new(
        Op::BranchConditional,
        vec![scan, inner_body, inner_merge],
    ));

    // valid_handles[2*j] == h0 && valid_handles[2*j+1] == h1
    body.push(Instruction::new(Op::Label, vec![inner_body]));
    let j_value = load_u32(&mut bound, &mut body, var_j);
    let doubled = fresh(&mut bound);
    body.push(Instruction::new(
        Op::IMul,
        vec![u32_ty, doubled, c[2], j_value],
    ));
    let low_ptr = fresh(&mut bound);
    body.push(Instruction::new(
        Op::AccessChain,
        vec![ptr_u32, low_ptr, validation_var, c[7], doubled],
    ));
    let low = load_u32(&mut bound, &mut body, low_ptr);
    let h0_now = load_u32(&mut bound, &mut body, var_h0);
    let low_matches = fresh(&mut bound);
    body.push(Instruction::new(
        Op::IEqual,
        vec![bool_ty, low_matches, h0_now, low],
    ));
    let odd = fresh(&mut bound);
    body.push(Instruction::new(Op::IAdd, vec![u32_ty, odd, doubled, c[1]]));
    let high_ptr = fresh(&mut bound);
    body.push(Instruction::new(
        Op::AccessChain,
        vec![ptr_u32, high_ptr, validation_var, c[7], odd],
    ));
    let high = load_u32(&mut bound, &mut body, high_ptr);
    let h1_now = load_u32(&mut bound, &mut body, var_h1);
    let high_matches = fresh(&mut bound);
    body.push(Instruction::new(
        Op::IEqual,
        vec![bool_ty, high_matches, h1_now, high],
    ));
    let both_match = fresh(&mut bound);
    body.push(Instruction::new(
        Op::LogicalAnd,
        vec![bool_ty, both_match, low_matches, high_matches],
    ));
    body.push(Instruction::new(Op::SelectionMerge, vec![match_merge, 0]));
    body.push(Instruction::new(
        Op::BranchConditional,
        vec![both_match, match_then, match_merge],
    ));
    body.push(Instruction::new(Op::Label, vec![match_then]));
    body.push(Instruction::new(Op::Store, vec![var_valid, const_true]));
    body.push(Instruction::new(Op::Branch, vec![inner_merge]));
    body.push(Instruction::new(Op::Label, vec![match_merge]));
    body.push(Instruction::new(Op::Branch, vec![inner_continue]));

    body.push(Instruction::new(Op::Label, vec![inner_continue]));
    let j_value = load_u32(&mut bound, &mut body, var_j);
    let j_next = fresh(&mut bound);
    body.push(Instruction::new(Op::IAdd, vec![u32_ty, j_next, j_value, c[1]]));
    body.push(Instruction::new(Op::Store, vec![var_j, j_next]));
    body.push(Instruction::new(Op::Branch, vec![inner_header]));

    // if (!valid) report and patch
    body.push(Instruction::new(Op::Label, vec![inner_merge]));
    let valid_now = fresh(&mut bound);
    body.push(Instruction::new(
        Op::Load,
        vec![bool_ty, valid_now, var_valid],
    ));
    let invalid = fresh(&mut bound);
    body.push(Instruction::new(
        Op::LogicalNot,
        vec![bool_ty, invalid, valid_now],
    ));
    body.push(Instruction::new(Op::SelectionMerge, vec![patch_merge, 0]));
    body.push(Instruction::new(
        Op::BranchConditional,
        vec![invalid, patch_then, patch_merge],
    ));

    body.push(Instruction::new(Op::Label, vec![patch_then]));
    let found_ptr = header_ptr(&mut bound, &mut body, c[3]);
    let found = load_u32(&mut bound, &mut body, found_ptr);
    let found_next = fresh(&mut bound);
    body.push(Instruction::new(
        Op::IAdd,
        vec![u32_ty, found_next, found, c[1]],
    ));
    let found_ptr_again = header_ptr(&mut bound, &mut body, c[3]);
    body.push(Instruction::new(Op::Store, vec![found_ptr_again, found_next]));
    let h0_now = load_u32(&mut bound, &mut body, var_h0);
    let invalid_low_ptr = header_ptr(&mut bound, &mut body, c[4]);
    body.push(Instruction::new(Op::Store, vec![invalid_low_ptr, h0_now]));
    let h1_now = load_u32(&mut bound, &mut body, var_h1);
    let invalid_high_ptr = header_ptr(&mut bound, &mut body, c[5]);
    body.push(Instruction::new(Op::Store, vec![invalid_high_ptr, h1_now]));
    let replacement_low_ptr = header_ptr(&mut bound, &mut body, c[1]);
    let replacement_low = load_u32(&mut bound, &mut body, replacement_low_ptr);
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let dst_low = instance_handle_ptr(&mut bound, &mut body, i_value, c[1]);
    body.push(Instruction::new(Op::Store, vec![dst_low, replacement_low]));
    let replacement_high_ptr = header_ptr(&mut bound, &mut body, c[2]);
    let replacement_high = load_u32(&mut bound, &mut body, replacement_high_ptr);
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let dst_high = instance_handle_ptr(&mut bound, &mut body, i_value, c[2]);
    body.push(Instruction::new(Op::Store, vec![dst_high, replacement_high]));
    body.push(Instruction::new(Op::Branch, vec![patch_merge]));

    body.push(Instruction::new(Op::Label, vec![patch_merge]));
    body.push(Instruction::new(Op::Branch, vec![outer_continue]));

    body.push(Instruction::new(Op::Label, vec![outer_continue]));
    let i_value = load_u32(&mut bound, &mut body, var_i);
    let i_next = fresh(&mut bound);
    body.push(Instruction::new(Op::IAdd, vec![u32_ty, i_next, i_value, c[1]]));
    body.push(Instruction::new(Op::Store, vec![var_i, i_next]));
    body.push(Instruction::new(Op::Branch, vec![outer_header]));

    body.push(Instruction::new(Op::Label, vec![outer_merge]));
    body.push(Instruction::new(Op::Return, vec![]));
    body.push(Instruction::new(Op::FunctionEnd, vec![]));

    ins.extend(body);

    let module = SpirvModule {
        // SPIR-V 1.0 with BufferBlock storage keeps the shader runnable on
        // every device the layer supports.
        version: 0x0001_0000,
        generator: 0,
        bound: bound + 1,
        schema: 0,
        instructions: ins,
    };
    module.assemble()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::module::SpirvModule;

    #[test]
    fn generated_shader_is_well_formed() {
        let words = validation_shader_words();
        let module = SpirvModule::parse(&words).unwrap();
        crate::instrument::verify_module(&module).unwrap();
    }

    #[test]
    fn generated_shader_declares_both_bindings() {
        let words = validation_shader_words();
        let module = SpirvModule::parse(&words).unwrap();
        let bindings: Vec<u32> = module
            .instructions
            .iter()
            .filter(|ins| {
                ins.is(spirv::Op::Decorate)
                    && ins.operands.get(1) == Some(&(spirv::Decoration::Binding as u32))
            })
            .map(|ins| ins.operands[2])
            .collect();
        assert_eq!(bindings, vec![0, 1]);
    }
}

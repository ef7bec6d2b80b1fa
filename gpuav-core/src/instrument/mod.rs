//! Shader instrumentation: rewrite SPIR-V so that invalid descriptor and
//! memory accesses report a diagnostic record instead of being undefined
//! behavior.
//!
//! The rewrite is semantics-preserving on valid input. Out-of-range
//! indices are clamped after reporting so execution stays defined either
//! way. Any failure here is recoverable by the caller: the original words
//! still run, they just go unwatched.

mod builder;
mod dce;
pub mod module;
mod pass;
mod verify;

pub use module::{ParseError, SpirvModule};
pub use pass::PassOptions;
pub use verify::VerifyError;

#[derive(Clone, Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("rewritten module failed verification: {0}")]
    Verify(#[from] VerifyError),
}

/// Structural verification, shared with the generated-shader tests.
pub(crate) fn verify_module(module: &SpirvModule) -> Result<(), VerifyError> {
    verify::verify(module)
}

/// Rewrite `words` according to `options`. Returns the module to hand to
/// the driver; when the module contains nothing worth checking this is a
/// plain copy of the input.
pub fn instrument(words: &[u32], options: &PassOptions) -> Result<Vec<u32>, InstrumentError> {
    let mut module = SpirvModule::parse(words)?;
    if !pass::run(&mut module, options) {
        return Ok(words.to_vec());
    }
    dce::run(&mut module);
    verify::verify(&module)?;
    Ok(module.assemble())
}

#[cfg(test)]
mod tests {
    use super::module::{string_to_words, Instruction};
    use super::*;
    use spirv::Op;

    const STORAGE_BUFFER: u32 = spirv::StorageClass::StorageBuffer as u32;
    const UNIFORM_CONSTANT: u32 = spirv::StorageClass::UniformConstant as u32;

    fn entry_point(main: u32) -> Instruction {
        let mut ops = vec![spirv::ExecutionModel::GLCompute as u32, main];
        ops.extend(string_to_words("main"));
        Instruction::new(Op::EntryPoint, ops)
    }

    /// A compute shader indexing both a runtime-sized storage array and a
    /// sampled-image array with a dynamic index.
    fn test_shader() -> Vec<u32> {
        let module = SpirvModule {
            version: 0x0001_0300,
            generator: 0,
            bound: 26,
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
                entry_point(12),
                Instruction::new(Op::ExecutionMode, vec![12, 17, 1, 1, 1]),
                Instruction::new(Op::Decorate, vec![5, spirv::Decoration::ArrayStride as u32, 4]),
                Instruction::new(
                    Op::MemberDecorate,
                    vec![6, 0, spirv::Decoration::Offset as u32, 0],
                ),
                Instruction::new(Op::Decorate, vec![6, spirv::Decoration::Block as u32]),
                Instruction::new(Op::Decorate, vec![8, spirv::Decoration::DescriptorSet as u32, 0]),
                Instruction::new(Op::Decorate, vec![8, spirv::Decoration::Binding as u32, 0]),
                Instruction::new(
                    Op::Decorate,
                    vec![22, spirv::Decoration::DescriptorSet as u32, 0],
                ),
                Instruction::new(Op::Decorate, vec![22, spirv::Decoration::Binding as u32, 1]),
                Instruction::new(Op::TypeVoid, vec![2]),
                Instruction::new(Op::TypeFunction, vec![3, 2]),
                Instruction::new(Op::TypeInt, vec![4, 32, 0]),
                Instruction::new(Op::TypeRuntimeArray, vec![5, 4]),
                Instruction::new(Op::TypeStruct, vec![6, 5]),
                Instruction::new(Op::TypePointer, vec![7, STORAGE_BUFFER, 6]),
                Instruction::new(Op::Variable, vec![7, 8, STORAGE_BUFFER]),
                Instruction::new(Op::TypePointer, vec![9, STORAGE_BUFFER, 4]),
                Instruction::new(Op::Constant, vec![4, 10, 0]),
                Instruction::new(Op::Constant, vec![4, 11, 5]),
                Instruction::new(Op::TypeFloat, vec![16, 32]),
                Instruction::new(Op::TypeImage, vec![18, 16, 1, 0, 0, 0, 1, 0]),
                Instruction::new(Op::TypeSampledImage, vec![19, 18]),
                Instruction::new(Op::Constant, vec![4, 25, 4]),
                Instruction::new(Op::TypeArray, vec![20, 19, 25]),
                Instruction::new(Op::TypePointer, vec![21, UNIFORM_CONSTANT, 20]),
                Instruction::new(Op::Variable, vec![21, 22, UNIFORM_CONSTANT]),
                Instruction::new(Op::TypePointer, vec![23, UNIFORM_CONSTANT, 19]),
                Instruction::new(Op::Function, vec![2, 12, 0, 3]),
                Instruction::new(Op::Label, vec![13]),
                Instruction::new(Op::AccessChain, vec![9, 14, 8, 10, 11]),
                Instruction::new(Op::Load, vec![4, 15, 14]),
                Instruction::new(Op::AccessChain, vec![23, 24, 22, 15]),
                Instruction::new(Op::Return, vec![]),
                Instruction::new(Op::FunctionEnd, vec![]),
            ],
        };
        module.assemble()
    }

    fn options() -> PassOptions {
        PassOptions {
            reserved_set: 7,
            shader_id: 23,
            descriptor_indexing: true,
            buffer_oob: true,
            buffer_device_address: false,
        }
    }

    #[test]
    fn instruments_and_stays_well_formed() {
        let words = test_shader();
        let out = instrument(&words, &options()).unwrap();
        assert_ne!(out, words);

        let rewritten = SpirvModule::parse(&out).unwrap();
        verify::verify(&rewritten).unwrap();

        // The diagnostics bindings landed at the reserved set.
        let reserved: Vec<u32> = rewritten
            .instructions
            .iter()
            .filter(|ins| {
                ins.is(Op::Decorate)
                    && ins.operands.get(1) == Some(&(spirv::Decoration::DescriptorSet as u32))
                    && ins.operands.get(2) == Some(&7)
            })
            .filter_map(|ins| ins.operands.first().copied())
            .collect();
        assert!(!reserved.is_empty());

        // Both access sites now route through checks.
        let calls = rewritten
            .instructions
            .iter()
            .filter(|ins| ins.is(Op::FunctionCall))
            .count();
        assert!(calls >= 2, "expected injected check calls, saw {}", calls);
    }

    #[test]
    fn instrumented_output_is_reinstrumentable_input() {
        // The rewritten module must still parse and assemble cleanly.
        let out = instrument(&test_shader(), &options()).unwrap();
        let module = SpirvModule::parse(&out).unwrap();
        assert_eq!(module.assemble(), out);
    }

    #[test]
    fn module_without_sites_is_untouched() {
        let module = SpirvModule {
            version: 0x0001_0300,
            generator: 0,
            bound: 8,
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
                entry_point(4),
                Instruction::new(Op::TypeVoid, vec![2]),
                Instruction::new(Op::TypeFunction, vec![3, 2]),
                Instruction::new(Op::Function, vec![2, 4, 0, 3]),
                Instruction::new(Op::Label, vec![5]),
                Instruction::new(Op::Return, vec![]),
                Instruction::new(Op::FunctionEnd, vec![]),
            ],
        };
        let words = module.assemble();
        assert_eq!(instrument(&words, &options()).unwrap(), words);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(instrument(&[1, 2, 3], &options()).is_err());
    }

    #[test]
    fn in_bounds_constant_descriptor_index_is_skipped() {
        // Index 5 into the image array is out of the declared bound of 4,
        // so the site instruments; bound the array at 16 instead and the
        // constant index is provably fine.
        let mut words = test_shader();
        let mut module = SpirvModule::parse(&words).unwrap();
        for ins in module.instructions.iter_mut() {
            if ins.is(Op::Constant) && ins.operands[1] == 25 {
                ins.operands[2] = 16;
            }
        }
        // Use the constant 5 as the image array index instead of the
        // loaded value.
        for ins in module.instructions.iter_mut() {
            if ins.is(Op::AccessChain) && ins.operands[1] == 24 {
                ins.operands[3] = 11;
            }
        }
        words = module.assemble();
        let out = instrument(&words, &options()).unwrap();
        let rewritten = SpirvModule::parse(&out).unwrap();
        // Only the storage buffer access checks remain; the image array
        // site dropped out.
        let image_checked = rewritten
            .instructions
            .iter()
            .any(|ins| ins.is(Op::AccessChain) && ins.operands.get(2) == Some(&22) && ins.operands[3] != 11);
        assert!(!image_checked);
    }
}

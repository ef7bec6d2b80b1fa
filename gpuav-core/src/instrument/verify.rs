//! Structural well-formedness checks for a rewritten module. Not a full
//! validator; it catches the ways a buggy rewrite would actually break a
//! module (frame damage, id reuse, unterminated blocks) before the result
//! is handed to the driver.

use spirv::Op;

use super::module::{defined_id, is_block_terminator, SpirvModule};
use crate::FastHashSet;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("instruction {0} exceeds the 16-bit word count limit")]
    OversizedInstruction(usize),
    #[error("id {0} is not below the module bound {1}")]
    IdAboveBound(u32, u32),
    #[error("id {0} is defined more than once")]
    DuplicateId(u32),
    #[error("entry point references id {0} which is not a function")]
    BadEntryPoint(u32),
    #[error("instruction {0}: function declaration inside a function body")]
    NestedFunction(usize),
    #[error("instruction {0}: function end without a function")]
    StrayFunctionEnd(usize),
    #[error("instruction {0}: expected a label to open a block")]
    ExpectedLabel(usize),
    #[error("function ending at instruction {0} has an unterminated block")]
    UnterminatedBlock(usize),
    #[error("module ends inside a function body")]
    UnterminatedFunction,
}

pub(super) fn verify(module: &SpirvModule) -> Result<(), VerifyError> {
    let mut defined: FastHashSet<u32> = FastHashSet::default();
    let mut function_ids: FastHashSet<u32> = FastHashSet::default();
    let mut entry_targets: Vec<u32> = Vec::new();

    #[derive(PartialEq)]
    enum Where {
        Module,
        FunctionHeader,
        Block,
        BetweenBlocks,
    }
    let mut position = Where::Module;

    for (index, ins) in module.instructions.iter().enumerate() {
        if ins.word_count() > u16::MAX as usize {
            return Err(VerifyError::OversizedInstruction(index));
        }
        if let Some(id) = defined_id(ins) {
            if id == 0 || id >= module.bound {
                return Err(VerifyError::IdAboveBound(id, module.bound));
            }
            if !defined.insert(id) {
                return Err(VerifyError::DuplicateId(id));
            }
        }

        // Debug line markers are free to sit anywhere.
        if ins.is(Op::Line) || ins.is(Op::NoLine) {
            continue;
        }

        match ins.opcode {
            op if op == Op::EntryPoint as u16 => {
                if let Some(&target) = ins.operands.get(1) {
                    entry_targets.push(target);
                }
            }
            op if op == Op::Function as u16 => {
                if position != Where::Module {
                    return Err(VerifyError::NestedFunction(index));
                }
                if let Some(&id) = ins.operands.get(1) {
                    function_ids.insert(id);
                }
                position = Where::FunctionHeader;
            }
            op if op == Op::FunctionParameter as u16 => {
                if position != Where::FunctionHeader {
                    return Err(VerifyError::ExpectedLabel(index));
                }
            }
            op if op == Op::Label as u16 => {
                match position {
                    Where::FunctionHeader | Where::BetweenBlocks => position = Where::Block,
                    // A label in the middle of a block means the previous
                    // block never terminated.
                    Where::Block => return Err(VerifyError::UnterminatedBlock(index)),
                    Where::Module => return Err(VerifyError::ExpectedLabel(index)),
                }
            }
            op if op == Op::FunctionEnd as u16 => match position {
                Where::BetweenBlocks => position = Where::Module,
                Where::Module => return Err(VerifyError::StrayFunctionEnd(index)),
                _ => return Err(VerifyError::UnterminatedBlock(index)),
            },
            _ => match position {
                Where::Block => {
                    if is_block_terminator(ins) {
                        position = Where::BetweenBlocks;
                    }
                }
                Where::FunctionHeader | Where::BetweenBlocks => {
                    // Only local variables may precede the first real
                    // instruction of a block, and they belong to a block.
                    return Err(VerifyError::ExpectedLabel(index));
                }
                Where::Module => {}
            },
        }
    }

    if position != Where::Module {
        return Err(VerifyError::UnterminatedFunction);
    }
    for target in entry_targets {
        if !function_ids.contains(&target) {
            return Err(VerifyError::BadEntryPoint(target));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::module::{Instruction, SpirvModule};
    use super::*;

    fn minimal() -> SpirvModule {
        let mut ops = vec![spirv::ExecutionModel::GLCompute as u32, 4];
        ops.extend(super::super::module::string_to_words("main"));
        SpirvModule {
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
                Instruction::new(Op::EntryPoint, ops),
                Instruction::new(Op::TypeVoid, vec![2]),
                Instruction::new(Op::TypeFunction, vec![3, 2]),
                Instruction::new(Op::Function, vec![2, 4, 0, 3]),
                Instruction::new(Op::Label, vec![5]),
                Instruction::new(Op::Return, vec![]),
                Instruction::new(Op::FunctionEnd, vec![]),
            ],
        }
    }

    #[test]
    fn accepts_minimal_module() {
        verify(&minimal()).unwrap();
    }

    #[test]
    fn rejects_unterminated_block() {
        let mut module = minimal();
        // Drop the OpReturn.
        module.instructions.remove(7);
        assert!(matches!(
            verify(&module),
            Err(VerifyError::UnterminatedBlock(_))
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut module = minimal();
        module
            .instructions
            .insert(4, Instruction::new(Op::TypeBool, vec![2]));
        assert_eq!(verify(&module), Err(VerifyError::DuplicateId(2)));
    }

    #[test]
    fn rejects_dangling_entry_point() {
        let mut module = minimal();
        module.instructions[2].operands[1] = 6;
        assert_eq!(verify(&module), Err(VerifyError::BadEntryPoint(6)));
    }
}

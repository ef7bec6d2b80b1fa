//! Dead function elimination, run after check injection so that helper
//! code paths the module never calls do not survive into the driver.

use spirv::Op;

use super::module::{defined_id, SpirvModule, Word};
use crate::FastHashSet;

struct FunctionRange {
    id: Word,
    start: usize,
    end: usize,
}

/// Remove functions unreachable from any entry point, along with the
/// debug names and decorations that referred to them. Returns whether
/// anything was removed.
pub(super) fn run(module: &mut SpirvModule) -> bool {
    let mut functions = Vec::new();
    let mut current: Option<FunctionRange> = None;
    for (index, ins) in module.instructions.iter().enumerate() {
        if ins.is(Op::Function) {
            if let Some(&id) = ins.operands.get(1) {
                current = Some(FunctionRange {
                    id,
                    start: index,
                    end: index,
                });
            }
        } else if ins.is(Op::FunctionEnd) {
            if let Some(mut range) = current.take() {
                range.end = index;
                functions.push(range);
            }
        }
    }
    if functions.is_empty() {
        return false;
    }

    // Call graph, then reachability from the entry points.
    let mut reachable: FastHashSet<Word> = FastHashSet::default();
    let mut worklist: Vec<Word> = module
        .instructions
        .iter()
        .filter(|ins| ins.is(Op::EntryPoint))
        .filter_map(|ins| ins.operands.get(1).copied())
        .collect();
    while let Some(id) = worklist.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(range) = functions.iter().find(|range| range.id == id) {
            for ins in &module.instructions[range.start..=range.end] {
                if ins.is(Op::FunctionCall) {
                    if let Some(&callee) = ins.operands.get(2) {
                        worklist.push(callee);
                    }
                }
            }
        }
    }

    let dead: Vec<&FunctionRange> = functions
        .iter()
        .filter(|range| !reachable.contains(&range.id))
        .collect();
    if dead.is_empty() {
        return false;
    }

    let mut dead_indices: FastHashSet<usize> = FastHashSet::default();
    let mut dead_ids: FastHashSet<Word> = FastHashSet::default();
    for range in &dead {
        for index in range.start..=range.end {
            dead_indices.insert(index);
            if let Some(id) = defined_id(&module.instructions[index]) {
                dead_ids.insert(id);
            }
        }
    }

    let old = std::mem::take(&mut module.instructions);
    module.instructions = old
        .into_iter()
        .enumerate()
        .filter(|(index, ins)| {
            if dead_indices.contains(index) {
                return false;
            }
            let refers_dead = match ins.opcode {
                op if op == Op::Name as u16
                    || op == Op::MemberName as u16
                    || op == Op::Decorate as u16
                    || op == Op::MemberDecorate as u16 =>
                {
                    ins.operands
                        .first()
                        .map_or(false, |target| dead_ids.contains(target))
                }
                _ => false,
            };
            !refers_dead
        })
        .map(|(_, ins)| ins)
        .collect();

    true
}

#[cfg(test)]
mod tests {
    use super::super::module::{Instruction, SpirvModule};
    use super::*;

    #[test]
    fn removes_uncalled_function() {
        // Entry %10 calls %20; %30 is never called.
        let void_ty = 2u32;
        let fn_ty = 3u32;
        let mut instructions = vec![
            Instruction::new(Op::Capability, vec![spirv::Capability::Shader as u32]),
            Instruction::new(
                Op::MemoryModel,
                vec![
                    spirv::AddressingModel::Logical as u32,
                    spirv::MemoryModel::GLSL450 as u32,
                ],
            ),
            Instruction::new(Op::EntryPoint, {
                let mut ops = vec![spirv::ExecutionModel::GLCompute as u32, 10];
                ops.extend(super::super::module::string_to_words("main"));
                ops
            }),
            Instruction::new(Op::Name, {
                let mut ops = vec![30];
                ops.extend(super::super::module::string_to_words("dead"));
                ops
            }),
            Instruction::new(Op::TypeVoid, vec![void_ty]),
            Instruction::new(Op::TypeFunction, vec![fn_ty, void_ty]),
        ];
        for &(id, called) in &[(10u32, Some(20u32)), (20, None), (30, None)] {
            instructions.push(Instruction::new(Op::Function, vec![void_ty, id, 0, fn_ty]));
            instructions.push(Instruction::new(Op::Label, vec![id + 1]));
            if let Some(callee) = called {
                instructions.push(Instruction::new(
                    Op::FunctionCall,
                    vec![void_ty, id + 2, callee],
                ));
            }
            instructions.push(Instruction::new(Op::Return, vec![]));
            instructions.push(Instruction::new(Op::FunctionEnd, vec![]));
        }
        let mut module = SpirvModule {
            version: 0x0001_0300,
            generator: 0,
            bound: 100,
            schema: 0,
            instructions,
        };

        assert!(run(&mut module));
        let remaining: Vec<u32> = module
            .instructions
            .iter()
            .filter(|ins| ins.is(Op::Function))
            .map(|ins| ins.operands[1])
            .collect();
        assert_eq!(remaining, vec![10, 20]);
        assert!(!module.instructions.iter().any(|ins| ins.is(Op::Name)));

        // A second run finds nothing left to remove.
        assert!(!run(&mut module));
    }
}

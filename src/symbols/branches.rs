//! Branch-point analysis over decoded instruction streams.
//!
//! Conditional coverage needs one counter per *outgoing edge* of every
//! conditional fork. The debug symbols only map instructions to lines, so
//! the edges themselves are recovered from the decoded IL: every
//! conditional branch contributes a fall-through edge and a taken edge,
//! every switch contributes its default edge and one edge per case. The
//! governing sequence point (the last visible point at or before the fork)
//! supplies the source anchor; forks governed by a hidden point or by no
//! point at all are emitted with `start_line == -1` so consumers can skip
//! them — compiler-synthesised forks in generated equality members look
//! exactly like this.

use dotscope::assembly::{FlowType, Instruction};

use std::collections::HashMap;

use crate::symbols::{BranchPoint, SequencePoint};

/// Computes the branch points of one method.
///
/// `instructions` must be the method's full stream decoded at base offset
/// 0, in offset order; `sequence_points` must be in IL offset order, as
/// produced by [`crate::symbols::SymbolFile::sequence_points`].
///
/// The result is ordered by fork offset, fall-through edge first.
/// Ordinals number branch points cumulatively per source line.
#[must_use]
pub fn branch_points(
    instructions: &[Instruction],
    sequence_points: &[SequencePoint],
) -> Vec<BranchPoint> {
    let mut points = Vec::new();
    let mut ordinals: HashMap<(u32, u32), u32> = HashMap::new();

    let mut current_point: Option<&SequencePoint> = None;
    let mut next_point = 0usize;

    for instruction in instructions {
        let offset = instruction.offset as u32;

        while next_point < sequence_points.len()
            && sequence_points[next_point].il_offset <= offset
        {
            current_point = Some(&sequence_points[next_point]);
            next_point += 1;
        }

        let is_fork = matches!(
            instruction.flow_type,
            FlowType::ConditionalBranch | FlowType::Switch
        );
        if !is_fork {
            continue;
        }

        let fall_through = (instruction.offset + instruction.size) as u32;
        let mut targets: Vec<u32> = Vec::with_capacity(instruction.branch_targets.len() + 1);
        targets.push(fall_through);
        targets.extend(instruction.branch_targets.iter().map(|&t| t as u32));

        // A conditional that branches to its own fall-through is not a
        // real fork; nothing to count.
        if targets.iter().skip(1).all(|&t| t == fall_through) {
            continue;
        }

        let anchor = current_point.filter(|point| !point.is_hidden);
        let (document, start_line) = match anchor {
            Some(point) => (Some(point.document), point.start_line as i32),
            None => (None, -1),
        };

        for (path, &end_offset) in targets.iter().enumerate() {
            let ordinal = match (document, start_line) {
                (Some(doc), line) if line >= 0 => {
                    let counter = ordinals.entry((doc, line as u32)).or_insert(0);
                    let ordinal = *counter;
                    *counter += 1;
                    ordinal
                }
                _ => path as u32,
            };

            points.push(BranchPoint {
                document,
                offset,
                end_offset,
                start_line,
                path: path as u32,
                ordinal,
            });
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotscope::assembly::{InstructionCategory, Operand, StackBehavior};

    fn instr(
        offset: u64,
        size: u64,
        mnemonic: &'static str,
        flow: FlowType,
        targets: &[u64],
    ) -> Instruction {
        Instruction {
            rva: offset,
            offset,
            size,
            opcode: 0,
            prefix: 0,
            mnemonic,
            category: InstructionCategory::ControlFlow,
            flow_type: flow,
            operand: Operand::None,
            stack_behavior: StackBehavior {
                pops: 0,
                pushes: 0,
                net_effect: 0,
            },
            branch_targets: targets.to_vec(),
        }
    }

    fn visible_point(il_offset: u32, line: u32) -> SequencePoint {
        SequencePoint {
            il_offset,
            start_line: line,
            end_line: line,
            start_column: 1,
            end_column: 2,
            document: 1,
            is_hidden: false,
        }
    }

    fn hidden_point(il_offset: u32) -> SequencePoint {
        SequencePoint {
            il_offset,
            start_line: 0x00FE_EFEE,
            end_line: 0x00FE_EFEE,
            start_column: 0,
            end_column: 0,
            document: 1,
            is_hidden: true,
        }
    }

    #[test]
    fn conditional_yields_two_edges_in_path_order() {
        // if (x) { ... } else { ... } on line 20
        let instructions = vec![
            instr(0, 1, "ldarg.0", FlowType::Sequential, &[]),
            instr(1, 2, "brfalse.s", FlowType::ConditionalBranch, &[10]),
            instr(3, 1, "nop", FlowType::Sequential, &[]),
            instr(10, 1, "ret", FlowType::Return, &[]),
        ];
        let points = vec![visible_point(0, 20)];

        let branches = branch_points(&instructions, &points);
        assert_eq!(branches.len(), 2);

        assert_eq!(branches[0].offset, 1);
        assert_eq!(branches[0].end_offset, 3);
        assert_eq!(branches[0].path, 0);
        assert_eq!(branches[0].ordinal, 0);
        assert_eq!(branches[0].start_line, 20);
        assert_eq!(branches[0].document, Some(1));

        assert_eq!(branches[1].end_offset, 10);
        assert_eq!(branches[1].path, 1);
        assert_eq!(branches[1].ordinal, 1);
        assert!(!branches[0].is_skipped());
    }

    #[test]
    fn switch_yields_default_edge_plus_case_edges() {
        let instructions = vec![
            instr(0, 17, "switch", FlowType::Switch, &[20, 30, 40]),
            instr(17, 1, "nop", FlowType::Sequential, &[]),
        ];
        let points = vec![visible_point(0, 7)];

        let branches = branch_points(&instructions, &points);
        assert_eq!(branches.len(), 4);
        assert_eq!(branches[0].end_offset, 17); // default / fall-through
        assert_eq!(branches[1].end_offset, 20);
        assert_eq!(branches[3].end_offset, 40);
        assert_eq!(branches[3].path, 3);
        assert_eq!(branches[3].ordinal, 3);
    }

    #[test]
    fn fork_without_visible_anchor_is_marked_skipped() {
        let instructions = vec![
            instr(0, 2, "brtrue.s", FlowType::ConditionalBranch, &[8]),
            instr(2, 1, "nop", FlowType::Sequential, &[]),
        ];

        // No sequence points at all (generated method).
        let no_anchor = branch_points(&instructions, &[]);
        assert_eq!(no_anchor.len(), 2);
        assert!(no_anchor.iter().all(BranchPoint::is_skipped));
        assert!(no_anchor.iter().all(|b| b.start_line == -1));

        // A hidden point governs the fork: same outcome.
        let hidden = branch_points(&instructions, &[hidden_point(0)]);
        assert!(hidden.iter().all(BranchPoint::is_skipped));
    }

    #[test]
    fn degenerate_branch_to_fall_through_is_ignored() {
        let instructions = vec![
            instr(0, 2, "brtrue.s", FlowType::ConditionalBranch, &[2]),
            instr(2, 1, "ret", FlowType::Return, &[]),
        ];
        let points = vec![visible_point(0, 3)];
        assert!(branch_points(&instructions, &points).is_empty());
    }

    #[test]
    fn ordinals_accumulate_per_line() {
        // Two forks attributed to the same line 12.
        let instructions = vec![
            instr(0, 2, "brtrue.s", FlowType::ConditionalBranch, &[10]),
            instr(2, 2, "brfalse.s", FlowType::ConditionalBranch, &[12]),
            instr(4, 1, "nop", FlowType::Sequential, &[]),
        ];
        let points = vec![visible_point(0, 12)];

        let branches = branch_points(&instructions, &points);
        assert_eq!(branches.len(), 4);
        let ordinals: Vec<u32> = branches.iter().map(|b| b.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
    }
}

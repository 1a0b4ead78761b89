//! Cross-iteration dependency analysis
//!
//! Decides whether every value a single-block loop carries across the
//! backedge is computed independently per lane, which is the safety
//! precondition for widening the loop into packed arithmetic. The check
//! propagates a "dirty" taint through the block: a value is dirty once it
//! depends on another inter-iteration value, or on a post-increment reading
//! of the induction variable.

use crate::cfg::{BitSet, CompilationUnit};
use crate::loops::LoopInformation;
use crate::mir::Opcode;

/// True when the loop has no cross-iteration dependency other than each
/// inter-iteration value's own accumulation chain
///
/// Conservative: any instruction without SSA annotations makes the loop
/// unsafe.
pub fn check_loop_dependency(unit: &CompilationUnit, li: &LoopInformation) -> bool {
    let Some(iv) = li.induction_variables.first() else {
        return false;
    };
    let vr_iv = iv.vreg;
    let Some(iv_phi) = li.get_phi(unit, vr_iv) else {
        return false;
    };
    let Some(ssa_vr_iv) = unit
        .mir(iv_phi)
        .ssa
        .as_ref()
        .and_then(|rep| rep.defs.first().copied())
    else {
        return false;
    };

    let mut phi_vrs = BitSet::new();
    for &mid in &unit.block(li.entry).mirs {
        let mir = unit.mir(mid);
        if mir.insn.opcode != Opcode::Phi {
            break;
        }
        phi_vrs.set(mir.insn.va as usize);
    }

    let mut dirty = BitSet::new();
    for &mid in &unit.block(li.entry).mirs {
        let Some(rep) = unit.mir(mid).ssa.as_ref() else {
            return false;
        };
        for u in &rep.uses {
            if dirty.contains(u.vreg as usize) {
                // Anything computed from a dirty value is dirty.
                for d in &rep.defs {
                    dirty.set(d.vreg as usize);
                }
            } else if phi_vrs.contains(u.vreg as usize) {
                if u.vreg != vr_iv {
                    // Reading another inter-iteration value taints every
                    // other register this instruction writes.
                    for d in &rep.defs {
                        if d.vreg != u.vreg {
                            dirty.set(d.vreg as usize);
                        }
                    }
                } else if *u != ssa_vr_iv {
                    // Reading the induction variable after its increment.
                    for d in &rep.defs {
                        if d.vreg != vr_iv {
                            dirty.set(d.vreg as usize);
                        }
                    }
                }
            }
        }
    }

    let clean = !phi_vrs.iter().any(|v| dirty.contains(v));
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BlockId, BlockType, JitMode};
    use crate::config::JitConfig;
    use crate::mir::DecodedInsn;

    /// Canonical loop CFG with the given body instructions
    fn loop_unit(body_insns: &[DecodedInsn], num_vregs: u32) -> (CompilationUnit, BlockId) {
        let mut unit = CompilationUnit::new("loop", num_vregs, JitConfig::default());
        unit.jit_mode = JitMode::Loop;
        let preheader = unit.new_block(BlockType::Code);
        let body = unit.new_block(BlockType::Code);
        let exit = unit.new_block(BlockType::Code);
        let bwcc = unit.new_block(BlockType::ChainingCellBackwardBranch);
        unit.block_mut(unit.entry_block).fall_through = Some(preheader);
        unit.block_mut(preheader).fall_through = Some(body);
        unit.block_mut(body).taken = Some(exit);
        unit.block_mut(body).fall_through = Some(bwcc);
        unit.block_mut(bwcc).fall_through = Some(body);
        unit.block_mut(exit).fall_through = Some(unit.exit_block);
        for insn in body_insns {
            unit.push_insn(body, *insn);
        }
        unit.compute_basic_block_information(true);
        (unit, body)
    }

    #[test]
    fn test_independent_accumulation_is_safe() {
        // v1 += v2; v0 += 1; if v0 >= v3 exit
        let (unit, _) = loop_unit(
            &[
                DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 2),
                DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
                DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
            ],
            4,
        );
        assert_eq!(unit.loops.len(), 1);
        assert!(check_loop_dependency(&unit, &unit.loops[0]));
    }

    #[test]
    fn test_cross_value_dependency_is_unsafe() {
        // v1 += v2; v2 = v1: each iteration reads the other carried value.
        let (unit, _) = loop_unit(
            &[
                DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 2),
                DecodedInsn::with_ops(Opcode::Move, 2, 1, 0),
                DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
                DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
            ],
            4,
        );
        assert_eq!(unit.loops.len(), 1);
        assert!(!check_loop_dependency(&unit, &unit.loops[0]));
    }

    #[test]
    fn test_post_increment_iv_read_is_unsafe() {
        // v1 reads the induction variable after its increment.
        let (unit, _) = loop_unit(
            &[
                DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
                DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 0),
                DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
            ],
            4,
        );
        assert_eq!(unit.loops.len(), 1);
        assert!(!check_loop_dependency(&unit, &unit.loops[0]));
    }

    #[test]
    fn test_pre_increment_iv_read_is_safe() {
        // v1 reads the induction variable before its increment; the value
        // it folds in is the per-iteration lane index.
        let (unit, _) = loop_unit(
            &[
                DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 0),
                DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
                DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
            ],
            4,
        );
        assert_eq!(unit.loops.len(), 1);
        assert!(check_loop_dependency(&unit, &unit.loops[0]));
    }
}

//! SSA construction
//!
//! Rebuilds phi nodes and SSA annotations from scratch every time it runs, so
//! passes that reshape the CFG can simply request a recompute instead of
//! patching versions incrementally. Phi placement is pruned by liveness, so
//! values that are dead at a join point get no phi there.

use crate::cfg::{BitSet, BlockId, CompilationUnit, MirId};
use crate::mir::{DecodedInsn, Opcode, SsaReg, SsaRep};

/// Recompute phis and SSA annotations for the whole unit
///
/// Requires predecessors and dominators to be up to date.
pub fn compute_ssa(unit: &mut CompilationUnit) {
    strip_phis(unit);
    for mir in &mut unit.mirs {
        mir.ssa = None;
    }

    let nvregs = unit.vreg_capacity() as usize;
    let (live_in, def_blocks) = liveness(unit, nvregs);
    insert_phis(unit, nvregs, &live_in, &def_blocks);
    rename(unit, nvregs);
    build_use_chains(unit);
}

fn strip_phis(unit: &mut CompilationUnit) {
    let phi_ids: Vec<MirId> = unit
        .mirs
        .iter()
        .enumerate()
        .filter(|(_, m)| m.insn.opcode == Opcode::Phi)
        .map(|(i, _)| MirId(i as u32))
        .collect();
    if phi_ids.is_empty() {
        return;
    }
    for bb in &mut unit.blocks {
        bb.mirs.retain(|m| !phi_ids.contains(m));
    }
}

/// Per-block live-in sets plus, per vreg, the blocks defining it
fn liveness(unit: &CompilationUnit, nvregs: usize) -> (Vec<BitSet>, Vec<BitSet>) {
    let n = unit.blocks.len();
    let mut gen = vec![BitSet::new(); n];
    let mut kill = vec![BitSet::new(); n];
    let mut def_blocks = vec![BitSet::new(); nvregs];

    for (bi, bb) in unit.blocks.iter().enumerate() {
        for &mid in &bb.mirs {
            let (uses, defs) = unit.mir(mid).insn.operands();
            for u in uses {
                if !kill[bi].contains(u as usize) {
                    gen[bi].set(u as usize);
                }
            }
            for d in defs {
                kill[bi].set(d as usize);
                def_blocks[d as usize].set(bi);
            }
        }
    }

    let mut live_in = gen.clone();
    let order = unit.postorder();
    let mut changed = true;
    while changed {
        changed = false;
        for &id in &order {
            let bi = id.index();
            let mut live_out = BitSet::new();
            for s in unit.block(id).successors() {
                live_out.union_with(&live_in[s.index()]);
            }
            for k in kill[bi].iter() {
                live_out.clear_bit(k);
            }
            live_out.union_with(&gen[bi]);
            if live_out != live_in[bi] {
                live_in[bi] = live_out;
                changed = true;
            }
        }
    }
    (live_in, def_blocks)
}

/// Dominance frontier of every block
fn dominance_frontiers(unit: &CompilationUnit) -> Vec<BitSet> {
    let n = unit.blocks.len();
    let idom = unit.immediate_dominators();
    let mut frontiers = vec![BitSet::new(); n];
    for bi in 0..n {
        let bb = &unit.blocks[bi];
        if bb.hidden || bb.predecessors.count() < 2 {
            continue;
        }
        let Some(join_idom) = idom[bi] else { continue };
        for p in bb.predecessors.iter() {
            let mut runner = BlockId(p as u32);
            while runner != join_idom {
                frontiers[runner.index()].set(bi);
                match idom[runner.index()] {
                    Some(next) => runner = next,
                    None => break,
                }
            }
        }
    }
    frontiers
}

fn insert_phis(
    unit: &mut CompilationUnit,
    nvregs: usize,
    live_in: &[BitSet],
    def_blocks: &[BitSet],
) {
    let frontiers = dominance_frontiers(unit);
    for vreg in 0..nvregs {
        if def_blocks[vreg].is_empty() {
            continue;
        }
        let mut has_phi = BitSet::new();
        let mut worklist: Vec<usize> = def_blocks[vreg].iter().collect();
        while let Some(b) = worklist.pop() {
            for f in frontiers[b].iter() {
                if has_phi.contains(f) || !live_in[f].contains(vreg) {
                    continue;
                }
                has_phi.set(f);
                let phi = unit.new_mir(DecodedInsn::with_ops(Opcode::Phi, vreg as u32, 0, 0));
                unit.prepend_mir(BlockId(f as u32), phi);
                if !def_blocks[vreg].contains(f) {
                    worklist.push(f);
                }
            }
        }
    }
}

/// Dominator-tree renaming with one version stack per virtual register
fn rename(unit: &mut CompilationUnit, nvregs: usize) {
    for mir in &mut unit.mirs {
        mir.ssa = Some(SsaRep::default());
    }

    // Version 0 is the value flowing in from before the trace.
    let mut stacks: Vec<Vec<(u32, Option<MirId>)>> = vec![vec![(0, None)]; nvregs];
    let mut next_version: Vec<u32> = vec![1; nvregs];

    let idom = unit.immediate_dominators();
    let n = unit.blocks.len();
    let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); n];
    for (b, parent) in idom.iter().enumerate() {
        if let Some(p) = parent {
            children[p.index()].push(BlockId(b as u32));
        }
    }

    rename_block(
        unit,
        unit.entry_block,
        &children,
        &mut stacks,
        &mut next_version,
    );
}

fn rename_block(
    unit: &mut CompilationUnit,
    block: BlockId,
    children: &[Vec<BlockId>],
    stacks: &mut [Vec<(u32, Option<MirId>)>],
    next_version: &mut [u32],
) {
    let mirs = unit.block(block).mirs.clone();
    let mut pushed: Vec<u32> = Vec::new();

    for &mid in &mirs {
        let insn = unit.mir(mid).insn;
        let (uses, defs) = insn.operands();

        let rep = unit.mir_mut(mid).ssa.as_mut().unwrap();
        if insn.opcode != Opcode::Phi {
            for u in uses {
                let (version, def) = *stacks[u as usize].last().unwrap();
                rep.uses.push(SsaReg::new(u, version));
                rep.def_where.push(def);
            }
        }
        for d in defs {
            let version = next_version[d as usize];
            next_version[d as usize] += 1;
            rep.defs.push(SsaReg::new(d, version));
            rep.use_chains.push(Vec::new());
            stacks[d as usize].push((version, Some(mid)));
            pushed.push(d);
        }
    }

    // Feed the end-of-block versions into successor phis.
    let succs: Vec<BlockId> = unit.block(block).successors().collect();
    for s in succs {
        let succ_mirs = unit.block(s).mirs.clone();
        for mid in succ_mirs {
            if unit.mir(mid).insn.opcode != Opcode::Phi {
                break;
            }
            let vreg = unit.mir(mid).insn.va;
            let (version, def) = *stacks[vreg as usize].last().unwrap();
            let rep = unit.mir_mut(mid).ssa.as_mut().unwrap();
            rep.uses.push(SsaReg::new(vreg, version));
            rep.def_where.push(def);
        }
    }

    for c in &children[block.index()] {
        rename_block(unit, *c, children, stacks, next_version);
    }

    for d in pushed.iter().rev() {
        stacks[*d as usize].pop();
    }
}

/// Record, on every definition, the instructions that read it
fn build_use_chains(unit: &mut CompilationUnit) {
    let order = unit.preorder();
    for id in order {
        let mirs = unit.block(id).mirs.clone();
        for mid in mirs {
            let Some(rep) = unit.mir(mid).ssa.clone() else {
                continue;
            };
            for (slot, def) in rep.def_where.iter().enumerate() {
                let Some(def_mir) = def else { continue };
                let use_vreg = rep.uses[slot].vreg;
                let def_rep = unit.mir_mut(*def_mir).ssa.as_mut().unwrap();
                if let Some(di) = def_rep.defs.iter().position(|d| d.vreg == use_vreg) {
                    def_rep.use_chains[di].push(mid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cfg::BlockType;
    use crate::config::JitConfig;

    /// entry -> preheader -> body -> body (backedge via taken) / exit
    fn simple_loop() -> (CompilationUnit, BlockId) {
        let mut unit = CompilationUnit::new("loop", 4, JitConfig::default());
        let preheader = unit.new_block(BlockType::Code);
        let body = unit.new_block(BlockType::Code);
        let exit = unit.new_block(BlockType::Code);
        unit.block_mut(unit.entry_block).fall_through = Some(preheader);
        unit.block_mut(preheader).fall_through = Some(body);
        unit.block_mut(body).taken = Some(exit);
        unit.block_mut(body).fall_through = Some(body);
        unit.block_mut(exit).fall_through = Some(unit.exit_block);

        // v0 += 1; v1 += v0; if v0 >= v2 exit
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1));
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 0));
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::IfGe, 0, 2, 0));
        (unit, body)
    }

    #[test]
    fn test_phis_inserted_at_loop_entry() {
        let (mut unit, body) = simple_loop();
        unit.compute_predecessors();
        unit.compute_dominators();
        compute_ssa(&mut unit);

        let phis: Vec<u32> = unit
            .block(body)
            .mirs
            .iter()
            .take_while(|m| unit.mir(**m).insn.opcode == Opcode::Phi)
            .map(|m| unit.mir(*m).insn.va)
            .collect();
        // v0 and v1 are live around the backedge; v2 is never defined in
        // the trace, so it needs no phi.
        assert!(phis.contains(&0));
        assert!(phis.contains(&1));
        assert!(!phis.contains(&2));
    }

    #[test]
    fn test_phi_has_one_use_per_predecessor() {
        let (mut unit, body) = simple_loop();
        unit.compute_predecessors();
        unit.compute_dominators();
        compute_ssa(&mut unit);

        for &mid in &unit.block(body).mirs {
            if unit.mir(mid).insn.opcode != Opcode::Phi {
                break;
            }
            let rep = unit.mir(mid).ssa.as_ref().unwrap();
            assert_eq!(rep.uses.len(), 2);
            assert_eq!(rep.defs.len(), 1);
        }
    }

    #[test]
    fn test_versions_and_def_where() {
        let (mut unit, body) = simple_loop();
        unit.compute_predecessors();
        unit.compute_dominators();
        compute_ssa(&mut unit);

        // The add-literal reads the phi def of v0 and writes a new version.
        let add = unit
            .block(body)
            .mirs
            .iter()
            .find(|m| unit.mir(**m).insn.opcode == Opcode::AddIntLit)
            .copied()
            .unwrap();
        let rep = unit.mir(add).ssa.as_ref().unwrap();
        assert_eq!(rep.uses[0].vreg, 0);
        assert!(rep.def_where[0].is_some());
        let phi = rep.def_where[0].unwrap();
        assert_eq!(unit.mir(phi).insn.opcode, Opcode::Phi);
        assert_ne!(rep.defs[0].version, rep.uses[0].version);

        // The branch reads v2, which is only defined before the trace.
        let branch = *unit.block(body).mirs.last().unwrap();
        let brep = unit.mir(branch).ssa.as_ref().unwrap();
        assert_eq!(brep.uses[1], SsaReg::new(2, 0));
        assert_eq!(brep.def_where[1], None);
    }

    #[test]
    fn test_use_chains_point_back_at_readers() {
        let (mut unit, body) = simple_loop();
        unit.compute_predecessors();
        unit.compute_dominators();
        compute_ssa(&mut unit);

        let add = unit
            .block(body)
            .mirs
            .iter()
            .find(|m| unit.mir(**m).insn.opcode == Opcode::AddIntLit)
            .copied()
            .unwrap();
        let rep = unit.mir(add).ssa.as_ref().unwrap();
        // v0's new version is read by the accumulate, the branch, and the
        // loop-entry phi.
        assert_eq!(rep.use_chains[0].len(), 3);
    }

    #[test]
    fn test_recompute_strips_stale_phis() {
        let (mut unit, body) = simple_loop();
        unit.compute_predecessors();
        unit.compute_dominators();
        compute_ssa(&mut unit);
        let before = unit.block(body).mirs.len();
        compute_ssa(&mut unit);
        assert_eq!(unit.block(body).mirs.len(), before);
    }
}

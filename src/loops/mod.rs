//! Natural loop detection and loop-shaped trace formation
//!
//! Loop information is rebuilt from the dominator tree whenever a pass
//! reports a loop-structure change, so passes never patch membership sets by
//! hand. A loop here is a natural loop: a dominator-backedge target plus
//! every block that can reach the backedge source without leaving through
//! the target.

use tracing::debug;

use crate::cfg::{BitSet, BlockId, BlockType, CompilationUnit, MirId};
use crate::mir::{DataflowAttrs, Opcode};

pub mod dependency;

/// A basic induction variable: `v = v + literal` once per iteration
#[derive(Debug, Clone)]
pub struct InductionVariable {
    pub vreg: u32,
    /// Per-iteration increment
    pub increment: i32,
    /// The add instruction stepping the variable
    pub mir: MirId,
}

/// Everything the optimizer knows about one natural loop
#[derive(Debug, Clone, Default)]
pub struct LoopInformation {
    /// Loop head; phis for values live around the backedge sit here
    pub entry: BlockId,
    /// Block executed once before the loop is entered
    pub pre_header: Option<BlockId>,
    /// Member blocks, chaining cells excluded
    pub basic_blocks: BitSet,
    /// Backward-branch chaining cells feeding the backedge
    pub backward_branches: BitSet,
    /// Blocks outside the loop reached from inside it
    pub exit_loops: BitSet,
    /// Where control continues after the single exit block
    pub post_exit: Option<BlockId>,
    /// Virtual registers merged by a phi at the loop head
    pub inter_iteration: BitSet,
    pub induction_variables: Vec<InductionVariable>,
    /// Loops whose blocks are a strict subset of this one's
    pub nested: Vec<LoopInformation>,
}

impl LoopInformation {
    /// Detect every natural loop of the unit and nest them by containment
    ///
    /// Requires predecessors, dominators and SSA to be current.
    pub fn build(unit: &CompilationUnit) -> Vec<LoopInformation> {
        let mut loops: Vec<LoopInformation> = Vec::new();

        for bb in &unit.blocks {
            if bb.hidden {
                continue;
            }
            for succ in bb.successors() {
                let head = unit.block(succ);
                if head.block_type.is_chaining_cell() || !unit.dominates(succ, bb.id) {
                    continue;
                }
                // bb -> succ is a backedge; merge into an existing loop with
                // the same head if one exists.
                let li = match loops.iter_mut().find(|l| l.entry == succ) {
                    Some(existing) => existing,
                    None => {
                        loops.push(LoopInformation {
                            entry: succ,
                            ..Default::default()
                        });
                        loops.last_mut().unwrap()
                    }
                };
                li.collect_members(unit, bb.id);
            }
        }

        for li in &mut loops {
            li.finish(unit);
        }
        nest_by_containment(loops)
    }

    /// Natural-loop worklist from one backedge source back up to the head
    fn collect_members(&mut self, unit: &CompilationUnit, backedge_source: BlockId) {
        if unit.block(backedge_source).block_type.is_chaining_cell() {
            self.backward_branches.set(backedge_source.index());
        }
        self.basic_blocks.set(self.entry.index());
        let mut worklist = vec![backedge_source];
        while let Some(id) = worklist.pop() {
            if unit.block(id).block_type.is_chaining_cell() {
                // Cells carry no bytecode; walk through them.
            } else {
                if self.basic_blocks.contains(id.index()) {
                    continue;
                }
                self.basic_blocks.set(id.index());
            }
            if id == self.entry {
                continue;
            }
            for p in unit.block(id).predecessors.iter() {
                let pid = BlockId(p as u32);
                if !self.basic_blocks.contains(p) || unit.block(pid).block_type.is_chaining_cell()
                {
                    worklist.push(pid);
                }
            }
        }
    }

    /// Fill the derived fields once membership is known
    fn finish(&mut self, unit: &CompilationUnit) {
        // Pre-header: the non-loop, non-cell predecessor of the head.
        self.pre_header = unit
            .block(self.entry)
            .predecessors
            .iter()
            .map(|p| BlockId(p as u32))
            .find(|p| {
                !self.basic_blocks.contains(p.index())
                    && !unit.block(*p).block_type.is_chaining_cell()
            });

        for b in self.basic_blocks.iter() {
            for succ in unit.block(BlockId(b as u32)).successors() {
                if self.basic_blocks.contains(succ.index()) {
                    continue;
                }
                if unit.block(succ).block_type.is_chaining_cell() {
                    continue;
                }
                self.exit_loops.set(succ.index());
            }
        }
        if self.exit_loops.count() == 1 {
            let exit = BlockId(self.exit_loops.first().unwrap() as u32);
            self.post_exit = unit
                .block(exit)
                .fall_through
                .filter(|p| !unit.block(*p).block_type.is_chaining_cell());
        }

        for &mid in &unit.block(self.entry).mirs {
            let mir = unit.mir(mid);
            if mir.insn.opcode != Opcode::Phi {
                break;
            }
            self.inter_iteration.set(mir.insn.va as usize);
        }

        self.find_induction_variables(unit);
    }

    fn find_induction_variables(&mut self, unit: &CompilationUnit) {
        // Registers the loop's conditional branches actually test. A
        // stepped register that never reaches a branch is an accumulator,
        // not an induction variable.
        let mut tested = BitSet::new();
        for b in self.basic_blocks.iter() {
            for &mid in &unit.block(BlockId(b as u32)).mirs {
                let insn = unit.mir(mid).insn;
                if insn.opcode.is_conditional_branch() {
                    for u in insn.operands().0 {
                        tested.set(u as usize);
                    }
                }
            }
        }

        for b in self.basic_blocks.iter() {
            for &mid in &unit.block(BlockId(b as u32)).mirs {
                let insn = unit.mir(mid).insn;
                if insn.opcode != Opcode::AddIntLit || insn.va != insn.vb {
                    continue;
                }
                if !self.inter_iteration.contains(insn.va as usize)
                    || !tested.contains(insn.va as usize)
                {
                    continue;
                }
                if self.count_defs(unit, insn.va) != 1 {
                    continue;
                }
                self.induction_variables.push(InductionVariable {
                    vreg: insn.va,
                    increment: insn.vc as i32,
                    mir: mid,
                });
            }
        }
    }

    /// Non-phi definitions of `vreg` inside the loop
    fn count_defs(&self, unit: &CompilationUnit, vreg: u32) -> usize {
        let mut count = 0;
        for b in self.basic_blocks.iter() {
            for &mid in &unit.block(BlockId(b as u32)).mirs {
                let mir = unit.mir(mid);
                if mir.insn.opcode == Opcode::Phi {
                    continue;
                }
                let (_, defs) = mir.insn.operands();
                count += defs.iter().filter(|d| **d == vreg).count();
            }
        }
        count
    }

    // ==================== Predicates ====================

    pub fn is_innermost(&self) -> bool {
        self.nested.is_empty()
    }

    pub fn num_basic_blocks(&self) -> usize {
        self.basic_blocks.count()
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.basic_blocks.contains(block.index())
    }

    fn any_mir(&self, unit: &CompilationUnit, pred: impl Fn(Opcode) -> bool) -> bool {
        self.basic_blocks.iter().any(|b| {
            unit.block(BlockId(b as u32))
                .mirs
                .iter()
                .any(|m| pred(unit.mir(*m).insn.opcode))
        })
    }

    pub fn can_throw(&self, unit: &CompilationUnit) -> bool {
        self.any_mir(unit, |op| op.attrs().contains(DataflowAttrs::CAN_THROW))
    }

    pub fn has_invoke(&self, unit: &CompilationUnit) -> bool {
        self.any_mir(unit, |op| op.attrs().contains(DataflowAttrs::INVOKE))
    }

    /// One block, no nesting, and nothing that touches memory, calls out,
    /// throws, or works on register pairs
    pub fn is_very_simple(&self, unit: &CompilationUnit) -> bool {
        self.is_innermost()
            && self.num_basic_blocks() == 1
            && !self.any_mir(unit, |op| {
                op.attrs().intersects(
                    DataflowAttrs::MEMORY
                        | DataflowAttrs::INVOKE
                        | DataflowAttrs::CAN_THROW
                        | DataflowAttrs::WIDE,
                )
            })
    }

    /// All basic induction variables step upwards
    pub fn is_count_up(&self) -> bool {
        !self.induction_variables.is_empty()
            && self.induction_variables.iter().all(|iv| iv.increment > 0)
    }

    /// Exactly one basic induction variable, stepping by one
    pub fn is_unique_iv_incrementing_by_1(&self) -> bool {
        self.induction_variables.len() == 1 && self.induction_variables[0].increment == 1
    }

    /// The phi merging `vreg` at the loop head, if any
    pub fn get_phi(&self, unit: &CompilationUnit, vreg: u32) -> Option<MirId> {
        unit.block(self.entry)
            .mirs
            .iter()
            .copied()
            .take_while(|m| unit.mir(*m).insn.opcode == Opcode::Phi)
            .find(|m| unit.mir(*m).insn.va == vreg)
    }

    /// The single exit block, when the loop has exactly one
    pub fn exit_block(&self) -> Option<BlockId> {
        if self.exit_loops.count() == 1 {
            self.exit_loops.first().map(|b| BlockId(b as u32))
        } else {
            None
        }
    }

    /// The single backward-branch cell, when the loop has exactly one
    pub fn backward_block(&self) -> Option<BlockId> {
        if self.backward_branches.count() == 1 {
            self.backward_branches.first().map(|b| BlockId(b as u32))
        } else {
            None
        }
    }

    /// Prepend copies of `templates` at every loop exit and backward-branch
    /// block, preserving their order
    pub fn add_instructions_to_exits(&self, unit: &mut CompilationUnit, templates: &[MirId]) {
        let mut targets: Vec<BlockId> = self
            .exit_loops
            .iter()
            .chain(self.backward_branches.iter())
            .map(|b| BlockId(b as u32))
            .collect();
        targets.dedup();
        for target in targets {
            for (i, &tmpl) in templates.iter().enumerate() {
                let copy = unit.copy_mir(tmpl);
                unit.block_mut(target).mirs.insert(i, copy);
            }
        }
    }
}

fn nest_by_containment(mut loops: Vec<LoopInformation>) -> Vec<LoopInformation> {
    // Sort small to large so each loop nests into the smallest container.
    loops.sort_by_key(|l| l.num_basic_blocks());
    let mut top: Vec<LoopInformation> = Vec::new();
    'outer: while let Some(li) = loops.pop() {
        // `li` is now the largest remaining loop; check previously placed
        // larger loops for a container, innermost first.
        for candidate in top.iter_mut() {
            if let Some(parent) = find_container(candidate, &li) {
                parent.nested.push(li);
                continue 'outer;
            }
        }
        top.push(li);
    }
    top
}

fn find_container<'a>(
    candidate: &'a mut LoopInformation,
    li: &LoopInformation,
) -> Option<&'a mut LoopInformation> {
    if !candidate.basic_blocks.contains(li.entry.index()) {
        return None;
    }
    // Descend iteratively; reborrowing through the child index keeps a
    // single live mutable borrow at each step.
    let mut current = candidate;
    loop {
        let child = current
            .nested
            .iter()
            .position(|inner| inner.basic_blocks.contains(li.entry.index()));
        match child {
            Some(i) => current = &mut current.nested[i],
            None => return Some(current),
        }
    }
}

// ==================== Loop-shaped trace passes ====================

/// Bail out of loop mode when the trace does not actually loop back to its
/// own head, or branches around more than the configuration allows
pub fn reject_loops_start(unit: &mut CompilationUnit) {
    let mut backedges = 0;
    let mut heads: Vec<BlockId> = Vec::new();
    for bb in &unit.blocks {
        if bb.hidden || bb.block_type != BlockType::Code {
            continue;
        }
        for succ in bb.successors() {
            let target = unit.block(succ);
            if target.block_type != BlockType::Code {
                continue;
            }
            // A backedge is a self edge or a branch to a strictly earlier
            // offset; equal offsets on distinct blocks are forward edges.
            if succ == bb.id || target.start_offset < bb.start_offset {
                backedges += 1;
                if !heads.contains(&succ) {
                    heads.push(succ);
                }
            }
        }
    }
    if backedges == 0 {
        debug!(method = %unit.method, "trace has no backward branch, leaving loop mode");
        unit.quit_loop_mode = true;
    } else if heads.len() > 1 && !unit.config.nested_loops {
        // Backedges to distinct heads mean an inner loop inside the region.
        debug!(method = %unit.method, heads = heads.len(), "nested loop shape rejected");
        unit.quit_loop_mode = true;
    } else if backedges > heads.len() && !unit.config.branch_loops {
        debug!(method = %unit.method, backedges, "multiple backward branches rejected");
        unit.quit_loop_mode = true;
    }
}

/// Shape the raw trace into the canonical loop CFG: a dedicated pre-header
/// in front of the head, and a backward-branch chaining cell on the backedge
pub fn form_loop_start(unit: &mut CompilationUnit) {
    let body = unit.blocks.iter().find(|bb| {
        bb.block_type == BlockType::Code
            && (bb.taken == Some(bb.id) || bb.fall_through == Some(bb.id))
    });
    let Some(body) = body.map(|bb| bb.id) else {
        debug!(method = %unit.method, "no self-looping block, leaving loop mode");
        unit.quit_loop_mode = true;
        return;
    };

    let preheader = unit.new_block(BlockType::Code);
    unit.block_mut(preheader).start_offset = unit.block(body).start_offset;
    for i in 0..unit.blocks.len() {
        let id = BlockId(i as u32);
        if id == body || id == preheader {
            continue;
        }
        if unit.blocks[i].taken == Some(body) {
            unit.blocks[i].taken = Some(preheader);
        }
        if unit.blocks[i].fall_through == Some(body) {
            unit.blocks[i].fall_through = Some(preheader);
        }
    }
    unit.block_mut(preheader).fall_through = Some(body);

    let bwcc = unit.new_block(BlockType::ChainingCellBackwardBranch);
    unit.block_mut(bwcc).start_offset = unit.block(body).start_offset;
    unit.block_mut(bwcc).fall_through = Some(body);
    if unit.block(body).fall_through == Some(body) {
        unit.block_mut(body).fall_through = Some(bwcc);
    } else {
        unit.block_mut(body).taken = Some(bwcc);
    }
}

/// Flag unresolved class or member references; a loop trace cannot carry
/// them, so it falls back to a plain trace
pub fn check_references_work(unit: &mut CompilationUnit, block: BlockId) -> bool {
    if block.index() >= unit.blocks.len() {
        return false;
    }
    let mirs = unit.block(block).mirs.clone();
    for mid in mirs {
        let insn = unit.mir(mid).insn;
        if !insn.opcode.must_resolve() {
            continue;
        }
        let Some(idx) = insn.ref_index() else { continue };
        if unit.unresolved_refs.contains(&idx) {
            debug!(
                method = %unit.method,
                reference = idx,
                "unresolved reference in trace"
            );
            if unit.jit_mode == crate::cfg::JitMode::Loop {
                unit.quit_loop_mode = true;
            }
            // One unresolved reference sinks the whole block.
            break;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::JitMode;
    use crate::config::JitConfig;
    use crate::mir::DecodedInsn;

    /// Raw trace shape as the intake produces it: entry -> body -> exit
    /// code, with the body falling through to itself
    fn raw_loop_trace() -> (CompilationUnit, BlockId, BlockId) {
        let mut unit = CompilationUnit::new("raw", 4, JitConfig::default());
        unit.jit_mode = JitMode::Loop;
        let body = unit.new_block(BlockType::Code);
        let exit = unit.new_block(BlockType::Code);
        unit.block_mut(unit.entry_block).fall_through = Some(body);
        unit.block_mut(body).taken = Some(exit);
        unit.block_mut(body).fall_through = Some(body);
        unit.block_mut(exit).fall_through = Some(unit.exit_block);
        // The branch compares the counter v0 against the bound v3, so no
        // other register is branch-tested.
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1));
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0));
        (unit, body, exit)
    }

    #[test]
    fn test_form_loop_builds_canonical_cfg() {
        let (mut unit, body, exit) = raw_loop_trace();
        form_loop_start(&mut unit);
        assert!(!unit.quit_loop_mode);
        unit.compute_basic_block_information(true);

        assert_eq!(unit.loops.len(), 1);
        let li = &unit.loops[0];
        assert_eq!(li.entry, body);
        assert_eq!(li.num_basic_blocks(), 1);
        assert_eq!(li.backward_branches.count(), 1);
        assert!(li.pre_header.is_some());
        assert_eq!(li.exit_block(), Some(exit));
        assert_eq!(li.post_exit, Some(unit.exit_block));

        let bwcc = li.backward_block().unwrap();
        assert_eq!(
            unit.block(bwcc).block_type,
            BlockType::ChainingCellBackwardBranch
        );
        assert_eq!(unit.block(bwcc).fall_through, Some(body));
    }

    #[test]
    fn test_form_loop_bails_on_straight_trace() {
        let mut unit = CompilationUnit::new("straight", 4, JitConfig::default());
        unit.jit_mode = JitMode::Loop;
        let body = unit.new_block(BlockType::Code);
        unit.block_mut(unit.entry_block).fall_through = Some(body);
        unit.block_mut(body).fall_through = Some(unit.exit_block);
        form_loop_start(&mut unit);
        assert!(unit.quit_loop_mode);
    }

    #[test]
    fn test_reject_loops_accepts_single_backedge() {
        let (mut unit, _, _) = raw_loop_trace();
        reject_loops_start(&mut unit);
        assert!(!unit.quit_loop_mode);
    }

    #[test]
    fn test_reject_loops_bails_without_backedge() {
        let mut unit = CompilationUnit::new("straight", 4, JitConfig::default());
        unit.jit_mode = JitMode::Loop;
        let body = unit.new_block(BlockType::Code);
        unit.block_mut(unit.entry_block).fall_through = Some(body);
        unit.block_mut(body).fall_through = Some(unit.exit_block);
        reject_loops_start(&mut unit);
        assert!(unit.quit_loop_mode);
    }

    #[test]
    fn test_induction_variable_needs_branch_use() {
        let (mut unit, body, _) = raw_loop_trace();
        // v1 steps like an induction variable but the branch never tests it.
        let accum = DecodedInsn::with_ops(Opcode::AddIntLit, 1, 1, 1);
        let mid = unit.new_mir(accum);
        unit.block_mut(body).mirs.insert(0, mid);
        form_loop_start(&mut unit);
        unit.compute_basic_block_information(true);

        let li = &unit.loops[0];
        assert_eq!(li.induction_variables.len(), 1);
        assert_eq!(li.induction_variables[0].vreg, 0);
        assert_eq!(li.induction_variables[0].increment, 1);
        assert!(li.is_unique_iv_incrementing_by_1());
        assert!(li.is_count_up());
        assert!(li.inter_iteration.contains(1));
    }

    #[test]
    fn test_very_simple_rejects_memory_ops() {
        let (mut unit, body, _) = raw_loop_trace();
        let aget = DecodedInsn::with_ops(Opcode::Aget, 1, 2, 0);
        let mid = unit.new_mir(aget);
        unit.block_mut(body).mirs.insert(0, mid);
        form_loop_start(&mut unit);
        unit.compute_basic_block_information(true);

        let li = &unit.loops[0];
        assert!(!li.is_very_simple(&unit));
        assert!(li.can_throw(&unit));
    }

    #[test]
    fn test_check_references_bails_loop_mode() {
        let (mut unit, body, _) = raw_loop_trace();
        let iget = DecodedInsn::with_ops(Opcode::Iget, 1, 2, 7);
        let mid = unit.new_mir(iget);
        unit.block_mut(body).mirs.insert(0, mid);
        unit.unresolved_refs.insert(7);

        check_references_work(&mut unit, body);
        assert!(unit.quit_loop_mode);
    }

    #[test]
    fn test_check_references_ignores_resolved() {
        let (mut unit, body, _) = raw_loop_trace();
        let iget = DecodedInsn::with_ops(Opcode::IgetQuick, 1, 2, 16);
        let mid = unit.new_mir(iget);
        unit.block_mut(body).mirs.insert(0, mid);
        unit.unresolved_refs.insert(16);

        // Quickened accesses carry a resolved offset, not a reference.
        check_references_work(&mut unit, body);
        assert!(!unit.quit_loop_mode);
    }

    #[test]
    fn test_check_references_stops_at_first_unresolved() {
        let (mut unit, body, _) = raw_loop_trace();
        for idx in [7, 8] {
            let iget = DecodedInsn::with_ops(Opcode::Iget, 1, 2, idx);
            let mid = unit.new_mir(iget);
            unit.block_mut(body).mirs.insert(0, mid);
            unit.unresolved_refs.insert(idx);
        }
        check_references_work(&mut unit, body);
        assert!(unit.quit_loop_mode);
    }

    #[test]
    fn test_reject_loops_bails_on_second_backedge() {
        let (mut unit, body, _) = raw_loop_trace();
        // Both edges loop back to the same head.
        unit.block_mut(body).taken = Some(body);
        assert!(!unit.config.branch_loops);
        reject_loops_start(&mut unit);
        assert!(unit.quit_loop_mode);
    }

    #[test]
    fn test_reject_loops_nested_shape_needs_config() {
        let (mut unit, _, exit) = raw_loop_trace();
        // A second self loop on the exit block makes two distinct heads.
        unit.block_mut(exit).taken = Some(exit);
        reject_loops_start(&mut unit);
        assert!(unit.quit_loop_mode);

        let (mut unit, _, exit) = raw_loop_trace();
        unit.block_mut(exit).taken = Some(exit);
        unit.config.nested_loops = true;
        reject_loops_start(&mut unit);
        assert!(!unit.quit_loop_mode);
    }

    fn loop_over(entry: u32, members: &[usize]) -> LoopInformation {
        let mut li = LoopInformation {
            entry: BlockId(entry),
            ..Default::default()
        };
        for &m in members {
            li.basic_blocks.set(m);
        }
        li
    }

    #[test]
    fn test_nesting_descends_to_innermost_container() {
        let loops = vec![
            loop_over(1, &[1, 2, 3, 4]),
            loop_over(2, &[2, 3]),
            loop_over(3, &[3]),
        ];
        let top = nest_by_containment(loops);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].entry, BlockId(1));
        assert_eq!(top[0].nested.len(), 1);
        assert_eq!(top[0].nested[0].entry, BlockId(2));
        assert_eq!(top[0].nested[0].nested.len(), 1);
        assert_eq!(top[0].nested[0].nested[0].entry, BlockId(3));
    }
}

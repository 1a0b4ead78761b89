//! Accumulation sinking
//!
//! A loop that adds the induction-variable step into an accumulator every
//! iteration, for example `total = total + 1` next to `i = i + 1`, performs
//! one addition per iteration that is fully determined by the trip count.
//! This pass removes the per-iteration add, compensates once in the
//! pre-header, and materializes the accumulated amount on every path out of
//! the loop, backward branches included, so the interpreter always sees the
//! correct register values.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::cfg::{CompilationUnit, JitMode, MirId};
use crate::expr::{classify, mirs_to_expressions, Expression, LinearAccumulation};
use crate::loops::LoopInformation;
use crate::mir::{DecodedInsn, Opcode};

/// The pass applies when at least one innermost loop is simple enough
pub fn sink_accumulations_gate(unit: &CompilationUnit) -> bool {
    if unit.jit_mode != JitMode::Loop || unit.quit_loop_mode {
        return false;
    }
    let mut found = false;
    for_each_innermost(&unit.loops, &mut |li| {
        found |= loop_qualifies(unit, li);
    });
    found
}

/// Sink accumulations in every qualifying innermost loop
pub fn sink_accumulations_end(unit: &mut CompilationUnit) {
    let loops = std::mem::take(&mut unit.loops);
    for_each_innermost(&loops, &mut |li| {
        if loop_qualifies(unit, li) {
            sink_accumulation(unit, li);
        }
    });
    unit.loops = loops;
}

fn for_each_innermost<'a>(
    loops: &'a [LoopInformation],
    f: &mut impl FnMut(&'a LoopInformation),
) {
    for li in loops {
        if li.is_innermost() {
            f(li);
        } else {
            for_each_innermost(&li.nested, f);
        }
    }
}

/// One block, one exit, one backward branch, no side exits or calls, and a
/// unique induction variable stepping by one
fn loop_qualifies(unit: &CompilationUnit, li: &LoopInformation) -> bool {
    li.is_innermost()
        && li.num_basic_blocks() == 1
        && li.exit_loops.count() <= 1
        && li.backward_branches.count() <= 1
        && !li.can_throw(unit)
        && !li.has_invoke(unit)
        && li.is_unique_iv_incrementing_by_1()
}

// ==================== Accumulator discovery ====================

/// The basic induction variable stepping by exactly one
fn choose_iv(li: &LoopInformation) -> Option<(u32, i32)> {
    if li.is_unique_iv_incrementing_by_1() {
        let iv = &li.induction_variables[0];
        Some((iv.vreg, iv.increment))
    } else {
        None
    }
}

fn mir_in_loop(unit: &CompilationUnit, li: &LoopInformation, mir: MirId) -> bool {
    unit.block_of(mir).is_some_and(|b| li.contains(b))
}

/// Inter-iteration registers whose entire in-loop def chain is a single
/// cycle back to the loop-head phi
fn filter_vrs(unit: &CompilationUnit, li: &LoopInformation) -> Vec<u32> {
    let mut vrs = Vec::new();
    for vr in li.inter_iteration.iter() {
        let vr = vr as u32;
        if li.induction_variables.iter().any(|iv| iv.vreg == vr) {
            continue;
        }
        let Some(phi) = li.get_phi(unit, vr) else {
            continue;
        };
        if check_no_other_uses(unit, li, vr, phi) {
            vrs.push(vr);
        }
    }
    vrs
}

/// Follow the def chain of `vr` from its phi around the loop: each def must
/// have exactly one in-loop reader, and each reader must redefine `vr`,
/// until the chain closes at the phi
fn check_no_other_uses(
    unit: &CompilationUnit,
    li: &LoopInformation,
    vr: u32,
    phi: MirId,
) -> bool {
    let mut current = phi;
    loop {
        let Some(rep) = unit.mir(current).ssa.as_ref() else {
            return false;
        };
        let Some(slot) = rep.defs.iter().position(|d| d.vreg == vr) else {
            return false;
        };
        let in_loop_users: Vec<MirId> = rep.use_chains[slot]
            .iter()
            .copied()
            .filter(|u| mir_in_loop(unit, li, *u))
            .collect();
        if in_loop_users.len() != 1 {
            return false;
        }
        let next = in_loop_users[0];
        if next == phi {
            return true;
        }
        let Some(next_rep) = unit.mir(next).ssa.as_ref() else {
            return false;
        };
        if next_rep.defs.len() != 1 || next_rep.defs[0].vreg != vr {
            return false;
        }
        current = next;
    }
}

/// The in-loop definition of `vr` reaching the backedge: the phi use with
/// the higher SSA version
fn find_last_definition(unit: &CompilationUnit, phi: MirId) -> Option<MirId> {
    let rep = unit.mir(phi).ssa.as_ref()?;
    rep.uses
        .iter()
        .zip(rep.def_where.iter())
        .max_by_key(|(u, _)| u.version)
        .and_then(|(_, dw)| *dw)
}

/// Every in-loop instruction feeding the last definition of each register,
/// in dependency order
fn fill_accumulator_map(
    unit: &CompilationUnit,
    li: &LoopInformation,
    vrs: &[u32],
) -> FxHashMap<u32, Vec<MirId>> {
    let mut map = FxHashMap::default();
    // Phis are merge points, not computation; never walk through them.
    let mut phis: FxHashSet<MirId> = FxHashSet::default();
    for &mid in &unit.block(li.entry).mirs {
        if unit.mir(mid).insn.opcode != Opcode::Phi {
            break;
        }
        phis.insert(mid);
    }

    for &vr in vrs {
        let Some(phi) = li.get_phi(unit, vr) else {
            continue;
        };
        let Some(last) = find_last_definition(unit, phi) else {
            continue;
        };
        let mut visited = phis.clone();
        let mut list = Vec::new();
        collect_defs(unit, li, last, &mut visited, &mut list);
        map.insert(vr, list);
    }
    map
}

fn collect_defs(
    unit: &CompilationUnit,
    li: &LoopInformation,
    mir: MirId,
    visited: &mut FxHashSet<MirId>,
    out: &mut Vec<MirId>,
) {
    if !visited.insert(mir) || !mir_in_loop(unit, li, mir) {
        return;
    }
    if let Some(rep) = unit.mir(mir).ssa.as_ref() {
        for dw in rep.def_where.iter().flatten() {
            collect_defs(unit, li, *dw, visited, out);
        }
    }
    out.push(mir);
}

/// Expression tree of the final value of each accumulator candidate
fn build_expressions(
    unit: &CompilationUnit,
    li: &LoopInformation,
    vrs: &[u32],
) -> Vec<(u32, Expression)> {
    let map = fill_accumulator_map(unit, li, vrs);
    let mut out = Vec::new();
    for &vr in vrs {
        let Some(list) = map.get(&vr) else { continue };
        if let Some((_, expr)) = mirs_to_expressions(unit, list).into_iter().last() {
            out.push((vr, expr));
        }
    }
    out
}

/// Is `vr` accumulated linearly, with a constant step, by this loop?
///
/// Used by the vectorizer to decide whether a loop output can be kept in a
/// vector register and reduced horizontally at the exits.
pub fn have_safe_accumulation(unit: &CompilationUnit, li: &LoopInformation, vr: u32) -> bool {
    let Some(phi) = li.get_phi(unit, vr) else {
        return false;
    };
    let one_def = unit
        .mir(phi)
        .ssa
        .as_ref()
        .is_some_and(|rep| rep.defs.len() == 1);
    if !one_def {
        return false;
    }

    let vrs = filter_vrs(unit, li);
    for (evr, expr) in build_expressions(unit, li, &vrs) {
        if evr != vr {
            continue;
        }
        return match classify(&expr, vr) {
            LinearAccumulation::Seen => true,
            // Error means the accumulator feeds itself more than once.
            _ => false,
        };
    }
    false
}

// ==================== Dangling constant removal ====================

/// A non-root node of the accumulation tree may only be reshaped when its
/// intermediate results never escape: at most one reader per def, all of
/// them inside the loop
fn check_usage(unit: &CompilationUnit, li: &LoopInformation, mir: MirId) -> bool {
    let Some(rep) = unit.mir(mir).ssa.as_ref() else {
        return false;
    };
    rep.use_chains.iter().all(|users| {
        users.len() <= 1 && users.iter().all(|u| mir_in_loop(unit, li, *u))
    })
}

/// Find the addition folding the induction step into the accumulation
fn find_dangling(
    unit: &CompilationUnit,
    li: &LoopInformation,
    expr: &Expression,
    increment: i32,
    is_root: bool,
) -> Option<MirId> {
    let Expression::Binary {
        mir,
        kind,
        lhs,
        rhs,
        ..
    } = expr
    else {
        return None;
    };
    if *kind != crate::expr::ExpKind::Add {
        return None;
    }
    if !is_root && !check_usage(unit, li, *mir) {
        return None;
    }
    if rhs.is_constant_value(increment) || lhs.is_constant_value(increment) {
        return Some(*mir);
    }
    find_dangling(unit, li, lhs, increment, false)
        .or_else(|| find_dangling(unit, li, rhs, increment, false))
}

fn sink_accumulation(unit: &mut CompilationUnit, li: &LoopInformation) {
    let Some((iv_vreg, increment)) = choose_iv(li) else {
        return;
    };
    let Some(pre_header) = li.pre_header else {
        return;
    };

    let vrs = filter_vrs(unit, li);
    let exprs = build_expressions(unit, li, &vrs);

    let (sink_op, hoist_op) = if increment >= 0 {
        (Opcode::AddInt, Opcode::SubInt)
    } else {
        (Opcode::SubInt, Opcode::AddInt)
    };

    let mut to_sink = Vec::new();
    let mut to_hoist = Vec::new();
    let mut to_remove = Vec::new();
    for (vr, expr) in &exprs {
        if classify(expr, *vr) != LinearAccumulation::Seen {
            continue;
        }
        let Some(node) = find_dangling(unit, li, expr, increment, true) else {
            continue;
        };
        let Expression::Binary {
            assign_to: result_vr,
            ..
        } = expr
        else {
            continue;
        };
        to_sink.push(DecodedInsn::with_ops(sink_op, *result_vr, *result_vr, iv_vreg));
        to_hoist.push(DecodedInsn::with_ops(hoist_op, *result_vr, *result_vr, iv_vreg));
        to_remove.push(node);
    }
    if to_remove.is_empty() {
        return;
    }
    debug!(
        method = %unit.method,
        accumulators = to_remove.len(),
        "sinking accumulations out of loop body"
    );

    let sink_mirs: Vec<MirId> = to_sink.into_iter().map(|i| unit.new_mir(i)).collect();
    li.add_instructions_to_exits(unit, &sink_mirs);
    for insn in to_hoist {
        let mid = unit.new_mir(insn);
        unit.append_mir(pre_header, mid);
    }
    for node in to_remove {
        remove_accumulation(unit, node);
    }
}

/// Delete the per-iteration add, redirecting its readers to the surviving
/// operand when the add renamed the value
fn remove_accumulation(unit: &mut CompilationUnit, mir: MirId) {
    let insn = unit.mir(mir).insn;
    if insn.va != insn.vb {
        if let Some(rep) = unit.mir(mir).ssa.clone() {
            for users in &rep.use_chains {
                for &user in users {
                    unit.mir_mut(user).insn.rewrite_use(insn.va, insn.vb);
                }
            }
        }
    }
    if let Some(block) = unit.block_of(mir) {
        unit.remove_mir(block, mir);
    }
}

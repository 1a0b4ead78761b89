//! Loop vectorization: CFG rewrite
//!
//! The widened loop runs next to the original one. A new guard compares the
//! induction variable against the bound minus one vector's worth of lanes;
//! while it passes, control stays in a duplicated body whose arithmetic has
//! been rewritten onto vector registers. Once fewer than a full vector of
//! iterations remains, the accumulators are reduced back into their virtual
//! registers and the untouched scalar loop finishes the tail.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::cfg::{BlockId, BlockType, CompilationUnit, MirId};
use crate::loops::LoopInformation;
use crate::mir::{DecodedInsn, Opcode};

use super::{vectorization_gate, RegisterAssociation, VectorizationInfo, VectorizedType};

/// Pass entry point: vectorize the first innermost loop whose gate accepts
///
/// At most one loop per run; the transform reshapes the CFG, so remaining
/// loop information is stale once it fires.
pub fn vectorize_start(unit: &mut CompilationUnit) {
    let loops = std::mem::take(&mut unit.loops);
    vectorize_first(unit, &loops);
    unit.loops = loops;
}

fn vectorize_first(unit: &mut CompilationUnit, loops: &[LoopInformation]) -> bool {
    for li in loops {
        if li.is_innermost() {
            if vectorize_loop(unit, li) {
                return true;
            }
        } else if vectorize_first(unit, &li.nested) {
            return true;
        }
    }
    false
}

fn vectorize_loop(unit: &mut CompilationUnit, li: &LoopInformation) -> bool {
    let Some(mut info) = vectorization_gate(unit, li) else {
        return false;
    };
    let bb = li.entry;
    let Some(preheader) = li.pre_header else {
        return false;
    };
    let Some(exit) = li.exit_block() else {
        return false;
    };
    let Some(post_exit) = li.post_exit else {
        return false;
    };
    let Some(bwcc) = li.backward_block() else {
        return false;
    };
    debug!(
        method = %unit.method,
        ty = ?info.ty,
        bound = info.upper_bound,
        "vectorizing loop"
    );

    let copy_bb = unit.copy_block(bb);
    let copy_preheader = unit.copy_block(preheader);
    let copy_exit = unit.copy_block(exit);
    let copy_bwcc = unit.copy_block(bwcc);

    let Some(main_test) = create_main_test(unit, bb, &info) else {
        return false;
    };
    let vectorized_test = unit.copy_block(main_test);
    reduce_test_bound(unit, vectorized_test, info.ty.lanes());

    info.assign_vectorized_registers();

    // Everything that used to enter the scalar pre-header now enters the
    // vectorized guard first.
    for i in 0..unit.blocks.len() {
        let id = BlockId(i as u32);
        if id == vectorized_test || id == main_test {
            continue;
        }
        if unit.blocks[i].taken == Some(preheader) {
            unit.blocks[i].taken = Some(vectorized_test);
        }
        if unit.blocks[i].fall_through == Some(preheader) {
            unit.blocks[i].fall_through = Some(vectorized_test);
        }
    }

    // Wire the vector loop out of the duplicated blocks, mirroring the
    // branch sense of the original body.
    let fall_is_backward = unit
        .block(copy_bb)
        .fall_through
        .is_some_and(|f| unit.block(f).block_type == BlockType::ChainingCellBackwardBranch);
    if fall_is_backward {
        unit.block_mut(copy_bb).fall_through = Some(copy_bwcc);
        unit.block_mut(copy_bb).taken = Some(copy_exit);
        unit.block_mut(vectorized_test).fall_through = Some(copy_preheader);
        unit.block_mut(vectorized_test).taken = None;
    } else {
        unit.block_mut(copy_bb).taken = Some(copy_bwcc);
        unit.block_mut(copy_bb).fall_through = Some(copy_exit);
        unit.block_mut(vectorized_test).taken = Some(copy_preheader);
        unit.block_mut(vectorized_test).fall_through = None;
    }
    unit.block_mut(copy_bwcc).fall_through = Some(copy_bb);
    unit.block_mut(copy_preheader).fall_through = Some(copy_bb);

    // The scalar loop keeps running behind the main guard.
    let fall_is_code = unit
        .block(bb)
        .fall_through
        .is_some_and(|f| unit.block(f).block_type == BlockType::Code);
    if fall_is_code {
        unit.block_mut(main_test).fall_through = Some(post_exit);
        unit.block_mut(main_test).taken = Some(preheader);
    } else {
        unit.block_mut(main_test).taken = Some(post_exit);
        unit.block_mut(main_test).fall_through = Some(preheader);
    }
    unit.block_mut(preheader).fall_through = Some(bb);

    // Falling out of the vector loop hands off to the scalar guard.
    if unit.block(vectorized_test).taken.is_none() {
        unit.block_mut(vectorized_test).taken = Some(main_test);
    } else {
        unit.block_mut(vectorized_test).fall_through = Some(main_test);
    }
    unit.block_mut(copy_exit).fall_through = Some(main_test);
    unit.block_mut(copy_exit).taken = None;

    unit.compute_basic_block_information(false);

    hoist_setup(unit, &info, copy_preheader);
    sink_wrap_up(unit, &info, copy_exit);
    sink_wrap_up(unit, &info, copy_bwcc);
    rewrite_body(unit, &mut info, copy_bb);
    true
}

/// Guard block `[const scratch, #bound; if <cond> .. scratch]`, duplicated
/// from the loop's own bound test
fn create_main_test(
    unit: &mut CompilationUnit,
    bb: BlockId,
    info: &VectorizationInfo,
) -> Option<BlockId> {
    let branch = unit.block(bb).last_mir()?;
    let copy_const = unit.copy_mir(info.bound_const);
    let copy_if = unit.copy_mir(branch);
    unit.mir_mut(copy_const).insn.va = info.scratch_vr;
    if info.bound_is_first_operand {
        unit.mir_mut(copy_if).insn.va = info.scratch_vr;
    } else {
        unit.mir_mut(copy_if).insn.vb = info.scratch_vr;
    }
    let id = unit.new_block(BlockType::Code);
    let start_offset = unit.block(bb).start_offset;
    let block = unit.block_mut(id);
    block.start_offset = start_offset;
    block.mirs = vec![copy_const, copy_if];
    Some(id)
}

/// Lower a guard's constant by one vector of iterations
fn reduce_test_bound(unit: &mut CompilationUnit, block: BlockId, lanes: i32) {
    let mirs = unit.block(block).mirs.clone();
    for mid in mirs {
        let mir = unit.mir_mut(mid);
        if mir.insn.opcode == Opcode::Const {
            mir.insn.vb = (mir.insn.vb as i32 - lanes) as u32;
        }
    }
}

// ==================== Vector prologue and epilogue ====================

fn packed_splat(ty: VectorizedType, value: i32) -> u32 {
    match ty {
        VectorizedType::Int => value as u32,
        // Two 16-bit lanes per word.
        VectorizedType::Byte | VectorizedType::Short => {
            ((value as u32) << 16) | (value as u32 & 0xFFFF)
        }
    }
}

/// Fill the vector registers before entering the widened loop: zeroed
/// accumulators, broadcast inputs, a laned ramp for the induction variable,
/// and splatted constants
fn hoist_setup(unit: &mut CompilationUnit, info: &VectorizationInfo, block: BlockId) {
    let lane_bytes = info.ty.lane_bytes();
    for (&vr, assoc) in &info.registers {
        if !assoc.input {
            continue;
        }
        if assoc.output {
            let mut insn = DecodedInsn::new(Opcode::Const128);
            insn.va = assoc.slot;
            let mid = unit.new_mir(insn);
            unit.append_mir(block, mid);
        } else {
            let insn = DecodedInsn::with_ops(Opcode::PackedSet, assoc.slot, vr, lane_bytes);
            let mid = unit.new_mir(insn);
            unit.append_mir(block, mid);
            if vr == info.iv_vreg {
                handle_induction_variable(unit, info, block, assoc.slot);
            }
        }
    }
    for (&value, &slot) in &info.constants {
        let mut insn = DecodedInsn::new(Opcode::Const128);
        insn.va = slot;
        insn.args = [packed_splat(info.ty, value); 4];
        let mid = unit.new_mir(insn);
        unit.append_mir(block, mid);
    }
}

/// Turn the broadcast induction value into a per-lane ramp by adding
/// `[0, inc, 2*inc, ..]` from a free temporary slot
fn handle_induction_variable(
    unit: &mut CompilationUnit,
    info: &VectorizationInfo,
    block: BlockId,
    iv_slot: u32,
) {
    let used: FxHashSet<u32> = info
        .registers
        .values()
        .map(|a| a.slot)
        .chain(info.constants.values().copied())
        .collect();
    let Some(temp) = (0..unit.config.vector_registers).find(|s| !used.contains(s)) else {
        return;
    };

    let mut ramp = DecodedInsn::new(Opcode::Const128);
    ramp.va = temp;
    match info.ty {
        VectorizedType::Int => {
            for (i, word) in ramp.args.iter_mut().enumerate() {
                *word = (i as i32 * info.iv_increment) as u32;
            }
        }
        VectorizedType::Byte | VectorizedType::Short => {
            for (w, word) in ramp.args.iter_mut().enumerate() {
                let lo = (2 * w as i32) * info.iv_increment;
                let hi = (2 * w as i32 + 1) * info.iv_increment;
                *word = ((hi as u32) << 16) | (lo as u32 & 0xFFFF);
            }
        }
    }
    let ramp_mid = unit.new_mir(ramp);
    unit.append_mir(block, ramp_mid);

    let add = DecodedInsn::with_ops(Opcode::PackedAdd, iv_slot, temp, info.ty.lane_bytes());
    let add_mid = unit.new_mir(add);
    unit.append_mir(block, add_mid);
}

/// Reduce every accumulator back into its virtual register on a path out of
/// the vector loop
fn sink_wrap_up(unit: &mut CompilationUnit, info: &VectorizationInfo, block: BlockId) {
    for (i, (vr, assoc)) in info.outputs().enumerate() {
        let insn =
            DecodedInsn::with_ops(Opcode::PackedAddReduce, vr, assoc.slot, info.ty.lane_bytes());
        let mid = unit.new_mir(insn);
        unit.block_mut(block).mirs.insert(i, mid);
    }
}

// ==================== Body rewrite ====================

/// Rewrite every instruction of the duplicated body onto vector registers
fn rewrite_body(unit: &mut CompilationUnit, info: &mut VectorizationInfo, block: BlockId) {
    let lanes = info.ty.lanes();
    let lane_bytes = info.ty.lane_bytes();
    let mirs = unit.block(block).mirs.clone();

    for &mid in &mirs {
        let insn = unit.mir(mid).insn;
        let op = insn.opcode;

        if op == Opcode::Phi {
            continue;
        }
        if let Some(value) = insn.constant() {
            handle_constant(unit, info, block, mid, value);
            continue;
        }
        if op.is_conditional_branch() {
            // The loop test stays scalar against the reduced bound.
            continue;
        }

        if op.uses_literal() {
            if insn.va == info.iv_vreg {
                // The induction step: advance the lane ramp, then widen
                // the scalar step to a full vector of iterations.
                let step_slot = info.constants[&(insn.vc as i32 * lanes)];
                let iv_slot = info.registers[&info.iv_vreg].slot;
                let add = DecodedInsn::with_ops(Opcode::PackedAdd, iv_slot, step_slot, lane_bytes);
                let add_mid = unit.new_mir(add);
                unit.insert_mir_before(block, mid, add_mid);
                unit.mir_mut(mid).insn.vc = lanes as u32;
                continue;
            }
            let va_slot = info.registers[&insn.va].slot;
            let rsub = op.is_reverse_subtract();
            if insn.va != insn.vb {
                let src = if rsub {
                    info.constants[&(insn.vc as i32)]
                } else {
                    info.registers[&insn.vb].slot
                };
                let mv = DecodedInsn::with_ops(Opcode::Move128, va_slot, src, 0);
                let mv_mid = unit.new_mir(mv);
                unit.insert_mir_before(block, mid, mv_mid);
            }
            let vb = if rsub {
                info.registers[&insn.vb].slot
            } else {
                info.constants[&(insn.vc as i32)]
            };
            let mir = unit.mir_mut(mid);
            mir.insn.opcode = op.vectorized().unwrap();
            mir.insn.va = va_slot;
            mir.insn.vb = vb;
            mir.insn.vc = lane_bytes;
            continue;
        }

        if op.vectorized().is_some() {
            let va_slot = info.registers[&insn.va].slot;
            let src2 = if insn.va == insn.vc {
                insn.vb
            } else {
                if insn.va != insn.vb {
                    let mv = DecodedInsn::with_ops(
                        Opcode::Move128,
                        va_slot,
                        info.registers[&insn.vb].slot,
                        0,
                    );
                    let mv_mid = unit.new_mir(mv);
                    unit.insert_mir_before(block, mid, mv_mid);
                }
                insn.vc
            };
            let vb_slot = info.registers[&src2].slot;
            let mir = unit.mir_mut(mid);
            mir.insn.opcode = op.vectorized().unwrap();
            mir.insn.va = va_slot;
            mir.insn.vb = vb_slot;
            mir.insn.vc = lane_bytes;
        }
    }
}

/// A constant definition inside the vector body either feeds the loop test,
/// in which case its literal shrinks by one vector of lanes, or it feeds
/// arithmetic, in which case its readers are redirected to a placeholder
/// register bound to the splatted constant's slot
fn handle_constant(
    unit: &mut CompilationUnit,
    info: &mut VectorizationInfo,
    block: BlockId,
    mid: MirId,
    value: i32,
) {
    let lanes = info.ty.lanes();
    let Some(rep) = unit.mir(mid).ssa.clone() else {
        return;
    };
    let Some(user) = rep.use_chains.iter().flatten().next().copied() else {
        return;
    };
    let user_insn = unit.mir(user).insn;
    if user_insn.opcode.is_conditional_branch()
        && (user_insn.va == info.iv_vreg || user_insn.vb == info.iv_vreg)
    {
        let mir = unit.mir_mut(mid);
        mir.insn.vb = (mir.insn.vb as i32 - lanes) as u32;
        return;
    }

    let Some(&slot) = info.constants.get(&value) else {
        return;
    };
    let mut temp = unit.num_vregs + unit.config.max_scratch_registers + 2;
    while info.registers.contains_key(&temp) {
        temp += 1;
    }
    let old = unit.mir(mid).insn.va;
    let mirs = unit.block(block).mirs.clone();
    let pos = mirs.iter().position(|m| *m == mid).unwrap_or(0);
    for &later in &mirs[pos + 1..] {
        unit.mir_mut(later).insn.rewrite_use(old, temp);
        if unit.mir(later).insn.operands().1.contains(&old) {
            break;
        }
    }
    info.registers.insert(
        temp,
        RegisterAssociation {
            slot,
            input: false,
            output: false,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::JitMode;
    use crate::config::JitConfig;

    /// Counted accumulation loop in canonical shape:
    ///   v3 = 100; v1 += v2; v0 += 1; if v0 >= v3 exit
    fn counted_loop() -> (CompilationUnit, [BlockId; 4]) {
        let mut unit = CompilationUnit::new("vec", 6, JitConfig::default());
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

        let mut bound = DecodedInsn::new(Opcode::Const);
        bound.va = 3;
        bound.vb = 100;
        unit.push_insn(body, bound);
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 2));
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1));
        unit.push_insn(body, DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0));
        unit.compute_basic_block_information(true);
        (unit, [preheader, body, exit, bwcc])
    }

    fn ops(unit: &CompilationUnit, block: BlockId) -> Vec<Opcode> {
        unit.block(block)
            .mirs
            .iter()
            .map(|m| unit.mir(*m).insn.opcode)
            .collect()
    }

    fn find_const_literal(unit: &CompilationUnit, block: BlockId) -> Option<i32> {
        unit.block(block)
            .mirs
            .iter()
            .map(|m| unit.mir(*m).insn)
            .find(|i| i.opcode == Opcode::Const)
            .map(|i| i.vb as i32)
    }

    #[test]
    fn test_vectorize_builds_parallel_loop() {
        let (mut unit, [preheader, body, exit, bwcc]) = counted_loop();
        let before = unit.blocks.len();
        vectorize_start(&mut unit);
        // Four duplicated blocks plus the two guard blocks.
        assert_eq!(unit.blocks.len(), before + 6);

        let copy_bb = BlockId(before as u32);
        let copy_preheader = BlockId(before as u32 + 1);
        let copy_exit = BlockId(before as u32 + 2);
        let copy_bwcc = BlockId(before as u32 + 3);
        let main_test = BlockId(before as u32 + 4);
        let vectorized_test = BlockId(before as u32 + 5);

        // Entry now reaches the vectorized guard first.
        assert_eq!(
            unit.block(unit.entry_block).fall_through,
            Some(vectorized_test)
        );
        assert_eq!(unit.block(vectorized_test).fall_through, Some(copy_preheader));
        assert_eq!(unit.block(vectorized_test).taken, Some(main_test));
        assert_eq!(unit.block(copy_preheader).fall_through, Some(copy_bb));
        assert_eq!(unit.block(copy_bb).fall_through, Some(copy_bwcc));
        assert_eq!(unit.block(copy_bb).taken, Some(copy_exit));
        assert_eq!(unit.block(copy_bwcc).fall_through, Some(copy_bb));
        assert_eq!(unit.block(copy_exit).fall_through, Some(main_test));

        // The scalar guard either finishes the tail or skips it.
        assert_eq!(unit.block(main_test).fall_through, Some(preheader));
        assert_eq!(unit.block(main_test).taken, Some(unit.exit_block));
        assert_eq!(unit.block(preheader).fall_through, Some(body));

        // Scalar loop shape is untouched.
        assert_eq!(unit.block(body).taken, Some(exit));
        assert_eq!(unit.block(body).fall_through, Some(bwcc));
    }

    #[test]
    fn test_guard_bounds() {
        let (mut unit, _) = counted_loop();
        let before = unit.blocks.len();
        vectorize_start(&mut unit);
        let main_test = BlockId(before as u32 + 4);
        let vectorized_test = BlockId(before as u32 + 5);

        assert_eq!(find_const_literal(&unit, main_test), Some(100));
        // Four int lanes per vector iteration.
        assert_eq!(find_const_literal(&unit, vectorized_test), Some(96));

        // The guards test against the scratch register, not v3.
        let scratch = 6;
        for block in [main_test, vectorized_test] {
            let last = unit.block(block).last_mir().unwrap();
            let insn = unit.mir(last).insn;
            assert_eq!(insn.opcode, Opcode::IfGe);
            assert_eq!(insn.vb, scratch);
        }
    }

    #[test]
    fn test_vector_prologue_and_epilogue() {
        let (mut unit, _) = counted_loop();
        let before = unit.blocks.len();
        vectorize_start(&mut unit);
        let copy_preheader = BlockId(before as u32 + 1);
        let copy_exit = BlockId(before as u32 + 2);
        let copy_bwcc = BlockId(before as u32 + 3);

        let prologue = ops(&unit, copy_preheader);
        // IV broadcast plus ramp, input broadcast, zeroed accumulator, and
        // the splatted step constant.
        assert!(prologue.contains(&Opcode::PackedSet));
        assert!(prologue.contains(&Opcode::Const128));
        assert!(prologue.contains(&Opcode::PackedAdd));

        // Both ways out of the vector loop reduce the accumulator.
        assert_eq!(ops(&unit, copy_exit)[0], Opcode::PackedAddReduce);
        assert_eq!(ops(&unit, copy_bwcc)[0], Opcode::PackedAddReduce);
        let reduce = unit.block(copy_exit).mirs[0];
        assert_eq!(unit.mir(reduce).insn.va, 1);
    }

    #[test]
    fn test_vector_body_rewrite() {
        let (mut unit, _) = counted_loop();
        let before = unit.blocks.len();
        vectorize_start(&mut unit);
        let copy_bb = BlockId(before as u32);

        let body_ops = ops(&unit, copy_bb);
        // The accumulation became packed; the induction step got a packed
        // lane advance next to its scalar widening.
        assert!(body_ops.contains(&Opcode::PackedAdd));
        assert!(body_ops.contains(&Opcode::AddIntLit));
        assert!(body_ops.contains(&Opcode::IfGe));

        // The scalar induction step now advances a full vector per trip.
        let step = unit
            .block(copy_bb)
            .mirs
            .iter()
            .map(|m| unit.mir(*m).insn)
            .find(|i| i.opcode == Opcode::AddIntLit)
            .unwrap();
        assert_eq!(step.vc, 4);

        // The in-body bound constant was tightened for the vector exit.
        assert_eq!(find_const_literal(&unit, copy_bb), Some(96));
    }

    #[test]
    fn test_scalar_loop_unchanged() {
        let (mut unit, [_, body, ..]) = counted_loop();
        let scalar_ops_before = ops(&unit, body)
            .into_iter()
            .filter(|o| *o != Opcode::Phi)
            .collect::<Vec<_>>();
        vectorize_start(&mut unit);
        let scalar_ops_after = ops(&unit, body)
            .into_iter()
            .filter(|o| *o != Opcode::Phi)
            .collect::<Vec<_>>();
        assert_eq!(scalar_ops_before, scalar_ops_after);
        assert_eq!(find_const_literal(&unit, body), Some(100));
    }

    #[test]
    fn test_gate_failure_leaves_cfg_alone() {
        let (mut unit, _) = counted_loop();
        unit.config.min_vectorized_iterations = 1000;
        unit.compute_basic_block_information(true);
        let before = unit.blocks.len();
        vectorize_start(&mut unit);
        assert_eq!(unit.blocks.len(), before);
    }
}

//! Loop vectorization: analysis and safety gate
//!
//! A very simple counted loop is widened so each iteration of the emitted
//! loop processes one packed vector of lanes. The gate in this module
//! decides whether the transform is safe and profitable and, along the way,
//! fills a [`VectorizationInfo`] describing every virtual register and
//! constant the loop touches. The CFG rewrite itself lives in
//! [`transform`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::cfg::{CompilationUnit, MirId};
use crate::config::JitConfig;
use crate::loops::{dependency::check_loop_dependency, LoopInformation};
use crate::mir::{DecodedInsn, Opcode};
use crate::sinking::have_safe_accumulation;

pub mod transform;

pub use transform::vectorize_start;

/// Element type of the vectorized loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VectorizedType {
    Byte,
    Short,
    #[default]
    Int,
}

impl VectorizedType {
    /// Lanes per 128-bit vector register
    pub fn lanes(self) -> i32 {
        match self {
            VectorizedType::Byte | VectorizedType::Short => 8,
            VectorizedType::Int => 4,
        }
    }

    /// Bytes per lane as encoded in packed instructions
    pub fn lane_bytes(self) -> u32 {
        match self {
            VectorizedType::Byte | VectorizedType::Short => 2,
            VectorizedType::Int => 4,
        }
    }
}

/// How one virtual register participates in the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterAssociation {
    /// Assigned vector register
    pub slot: u32,
    /// Live on loop entry
    pub input: bool,
    /// Live after the loop
    pub output: bool,
}

/// Everything the transform needs to know about one vectorizable loop
///
/// `registers` and `constants` are ordered maps so vector register slots are
/// assigned deterministically.
#[derive(Debug, Clone, Default)]
pub struct VectorizationInfo {
    pub registers: BTreeMap<u32, RegisterAssociation>,
    /// Constant value to vector register slot
    pub constants: BTreeMap<i32, u32>,
    pub ty: VectorizedType,
    /// Statically known trip count bound
    pub upper_bound: i32,
    /// Scalar scratch register for the duplicated loop tests
    pub scratch_vr: u32,
    pub iv_vreg: u32,
    pub iv_increment: i32,
    /// Constant definition feeding the loop's bound test
    pub bound_const: MirId,
    /// The bound is the branch's first operand
    pub bound_is_first_operand: bool,
}

impl VectorizationInfo {
    fn set_input(&mut self, vreg: u32, input: bool) {
        self.registers.entry(vreg).or_default().input = input;
    }

    fn set_output(&mut self, vreg: u32, output: bool) {
        self.registers.entry(vreg).or_default().output = output;
    }

    /// Vector registers in map order, constants after registers
    pub fn assign_vectorized_registers(&mut self) {
        let mut slot = 0;
        for assoc in self.registers.values_mut() {
            assoc.slot = slot;
            slot += 1;
        }
        for const_slot in self.constants.values_mut() {
            *const_slot = slot;
            slot += 1;
        }
    }

    /// Output registers in slot-assignment order
    pub fn outputs(&self) -> impl Iterator<Item = (u32, RegisterAssociation)> + '_ {
        self.registers
            .iter()
            .filter(|(_, a)| a.output)
            .map(|(vr, a)| (*vr, *a))
    }
}

// ==================== Gate ====================

/// Full safety and profitability check for one loop
///
/// Allocates the scratch register on success, so the caller is expected to
/// go through with the transform.
pub fn vectorization_gate(
    unit: &mut CompilationUnit,
    li: &LoopInformation,
) -> Option<VectorizationInfo> {
    if !li.is_very_simple(unit) {
        return None;
    }
    if !li.is_unique_iv_incrementing_by_1() {
        return None;
    }

    let mut info = VectorizationInfo::default();

    if !li.is_count_up() {
        return None;
    }

    let (bound, bound_const, first) = find_upper_bound(unit, li)?;
    info.upper_bound = bound;
    info.bound_const = bound_const;
    info.bound_is_first_operand = first;
    if bound < unit.config.min_vectorized_iterations {
        debug!(bound, "loop bound below vectorization threshold");
        return None;
    }

    if !check_loop_dependency(unit, li) {
        debug!(method = %unit.method, "cross-iteration dependency, not vectorizing");
        return None;
    }

    if !fill_vectorization_information(unit, li, &mut info) {
        return None;
    }

    if !arch_supports_packed_size(&unit.config, info.ty.lane_bytes()) {
        return None;
    }

    let needed = info.registers.len() + info.constants.len();
    if needed >= unit.config.vector_registers as usize {
        debug!(needed, "not enough vector registers");
        return None;
    }

    for (vr, _) in info.outputs() {
        if !have_safe_accumulation(unit, li, vr) {
            debug!(vreg = vr, "loop output is not a safe accumulation");
            return None;
        }
    }

    // Allocated last: a rejected loop must not consume one of the unit's
    // scratch registers.
    info.scratch_vr = unit.get_free_scratch_register()?;
    Some(info)
}

/// The loop must end in a two-register compare against a known constant
fn find_upper_bound(
    unit: &CompilationUnit,
    li: &LoopInformation,
) -> Option<(i32, MirId, bool)> {
    let last = unit.block(li.entry).last_mir()?;
    let insn = unit.mir(last).insn;
    if !insn.opcode.is_conditional_branch() || insn.opcode.is_zero_branch() {
        return None;
    }
    let rep = unit.mir(last).ssa.as_ref()?;
    if rep.uses.len() != 2 {
        return None;
    }
    for (i, dw) in rep.def_where.iter().enumerate() {
        let Some(def) = dw else { continue };
        if let Some(value) = unit.mir(*def).insn.constant() {
            return Some((value, *def, i == 0));
        }
    }
    None
}

/// Can the target do packed arithmetic at this lane width?
///
/// Narrow lanes are always available; 4-byte lanes need hardware support.
pub fn arch_supports_packed_size(config: &JitConfig, lane_bytes: u32) -> bool {
    lane_bytes < 4 || config.packed_int_support
}

/// Is this extended opcode one the back end can emit?
pub fn arch_supports_extended_op(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        Const128 | Move128 | PackedSet | PackedAdd | PackedSub | PackedMul | PackedAnd
            | PackedOr | PackedXor | PackedAddReduce
    )
}

/// One instruction the widened loop can express
fn is_vectorizable(insn: &DecodedInsn) -> bool {
    if insn.opcode.is_conditional_branch() {
        return true;
    }
    if insn.opcode == Opcode::Const {
        return true;
    }
    if let Some(packed) = insn.opcode.vectorized() {
        if !arch_supports_extended_op(packed) {
            return false;
        }
        // Packed subtraction cannot swap its operands afterwards.
        return !(insn.opcode == Opcode::SubInt && insn.va == insn.vc);
    }
    false
}

/// Classify every register and constant of the loop body
fn fill_vectorization_information(
    unit: &CompilationUnit,
    li: &LoopInformation,
    info: &mut VectorizationInfo,
) -> bool {
    let iv = &li.induction_variables[0];
    info.iv_vreg = iv.vreg;
    info.iv_increment = iv.increment;
    if info.iv_increment < 0 {
        return false;
    }

    let body = li.entry;
    let mirs = unit.block(body).mirs.clone();
    for &mid in &mirs {
        let insn = unit.mir(mid).insn;

        if insn.opcode == Opcode::Phi {
            info.set_input(insn.va, true);
            info.set_output(insn.va, true);
            continue;
        }
        if !is_vectorizable(&insn) {
            debug!(opcode = ?insn.opcode, "instruction has no packed form");
            return false;
        }

        if insn.va == info.iv_vreg && !insn.opcode.is_conditional_branch() {
            // The induction step itself; everything reading the stepped
            // value inside the body must be the phi or the bound test.
            let Some(rep) = unit.mir(mid).ssa.as_ref() else {
                return false;
            };
            for users in &rep.use_chains {
                for &user in users {
                    if unit.block_of(user) != Some(body) {
                        continue;
                    }
                    let op = unit.mir(user).insn.opcode;
                    if op != Opcode::Phi && !op.is_conditional_branch() {
                        return false;
                    }
                }
            }
            continue;
        }

        if let Some(value) = insn.constant() {
            info.set_output(insn.va, false);
            let Some(rep) = unit.mir(mid).ssa.as_ref() else {
                return false;
            };
            let first_use = rep.use_chains.iter().flatten().next().copied();
            let Some(user) = first_use else { continue };
            if Some(user) == unit.block(body).last_mir()
                || unit.block_of(user) != Some(body)
                || unit.mir(user).insn.opcode.is_conditional_branch()
            {
                // Feeds the loop test or leaves the body; not a vector
                // constant.
                continue;
            }
            info.constants.insert(value, 0);
            continue;
        }

        let (_, defs) = insn.operands();
        for d in defs {
            info.set_output(d, true);
        }
        let Some(rep) = unit.mir(mid).ssa.as_ref() else {
            return false;
        };
        for (i, u) in rep.uses.iter().enumerate().rev() {
            match rep.def_where[i] {
                None => info.set_input(u.vreg, true),
                Some(def) => {
                    let def_sets_const = unit.mir(def).insn.opcode.sets_const();
                    info.set_output(u.vreg, !def_sets_const);
                }
            }
        }
        if insn.opcode.uses_literal() {
            info.constants.insert(insn.vc as i32, 0);
        }
    }

    info.set_output(info.iv_vreg, false);

    let Some(ty) = find_type(unit, li, info) else {
        return false;
    };
    info.ty = ty;
    info.constants.insert(info.iv_increment * ty.lanes(), 0);
    true
}

/// Element type of the loop, derived from truncating casts after the exit
///
/// Casts inside the body disqualify the loop entirely; an output truncated
/// on the exit path narrows its lanes. Multiple outputs take the widest
/// type among them.
fn find_type(
    unit: &CompilationUnit,
    li: &LoopInformation,
    info: &VectorizationInfo,
) -> Option<VectorizedType> {
    for &mid in &unit.block(li.entry).mirs {
        if unit.mir(mid).insn.opcode.is_cast() {
            return None;
        }
    }

    let mut ty: Option<VectorizedType> = None;
    for (vr, _) in info.outputs() {
        let mut out_ty = VectorizedType::Int;
        if let Some(exit) = li.exit_block() {
            for &mid in &unit.block(exit).mirs {
                let insn = unit.mir(mid).insn;
                if !insn.opcode.is_cast() || insn.vb != vr {
                    continue;
                }
                out_ty = match insn.opcode {
                    Opcode::IntToByte => VectorizedType::Byte,
                    Opcode::IntToShort => VectorizedType::Short,
                    _ => return None,
                };
                break;
            }
        }
        ty = Some(match ty {
            Some(t) => t.max(out_ty),
            None => out_ty,
        });
    }
    Some(ty.unwrap_or(VectorizedType::Int))
}

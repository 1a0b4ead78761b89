//! Arithmetic expression trees over MIR
//!
//! Rebuilds the dataflow of a straight-line instruction list as expression
//! trees, so loop transforms can pattern-match shapes like "linear
//! accumulation into one register" without chasing SSA chains by hand.

use rustc_hash::FxHashMap;

use crate::cfg::{CompilationUnit, MirId};
use crate::mir::Opcode;

/// Arithmetic kind of a binary expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpKind {
    Add,
    Sub,
    Mul,
    /// Any other operation; opaque to the accumulation matchers
    Other,
}

impl ExpKind {
    fn of(opcode: Opcode) -> Option<ExpKind> {
        use Opcode::*;
        match opcode {
            AddInt | AddIntLit => Some(ExpKind::Add),
            SubInt | RsubInt | RsubIntLit => Some(ExpKind::Sub),
            MulInt | MulIntLit => Some(ExpKind::Mul),
            AndInt | OrInt | XorInt | ShlInt | AndIntLit | OrIntLit | XorIntLit => {
                Some(ExpKind::Other)
            }
            _ => None,
        }
    }
}

/// One node of an expression tree
#[derive(Debug, Clone)]
pub enum Expression {
    /// A known integer literal
    Constant { value: i32 },
    /// An opaque register value
    Register { vreg: u32 },
    /// A two-operand arithmetic instruction and its operand subtrees
    Binary {
        mir: MirId,
        kind: ExpKind,
        assign_to: u32,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

impl Expression {
    pub fn is_constant_value(&self, value: i32) -> bool {
        matches!(self, Expression::Constant { value: v } if *v == value)
    }
}

/// Classification of a tree with respect to one accumulator register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearAccumulation {
    /// The register does not appear
    NotSeen,
    /// The register appears exactly once, only under additions
    Seen,
    /// The register is multiplied, subtracted, or used more than once
    Error,
}

/// Does this tree accumulate linearly into `vr`?
pub fn classify(expr: &Expression, vr: u32) -> LinearAccumulation {
    use LinearAccumulation::*;
    match expr {
        Expression::Constant { .. } => NotSeen,
        Expression::Register { vreg } => {
            if *vreg == vr {
                Seen
            } else {
                NotSeen
            }
        }
        Expression::Binary { kind, lhs, rhs, .. } => {
            let l = classify(lhs, vr);
            let r = classify(rhs, vr);
            match (l, r) {
                (Error, _) | (_, Error) | (Seen, Seen) => Error,
                (Seen, NotSeen) | (NotSeen, Seen) => {
                    if *kind == ExpKind::Add {
                        Seen
                    } else {
                        Error
                    }
                }
                (NotSeen, NotSeen) => NotSeen,
            }
        }
    }
}

/// Build an expression tree per arithmetic instruction of `mirs`, folding
/// earlier results of the same list into later operands
///
/// Instructions outside the arithmetic subset contribute opaque register
/// leaves for whatever they define.
pub fn mirs_to_expressions(
    unit: &CompilationUnit,
    mirs: &[MirId],
) -> Vec<(MirId, Expression)> {
    let mut latest: FxHashMap<u32, Expression> = FxHashMap::default();
    let mut out = Vec::new();

    for &mid in mirs {
        let insn = unit.mir(mid).insn;

        if let Some(value) = insn.constant() {
            latest.insert(insn.va, Expression::Constant { value });
            continue;
        }
        if insn.opcode == Opcode::Move {
            let src = lookup(&latest, insn.vb);
            latest.insert(insn.va, src);
            continue;
        }

        let Some(kind) = ExpKind::of(insn.opcode) else {
            let (_, defs) = insn.operands();
            for d in defs {
                latest.insert(d, Expression::Register { vreg: d });
            }
            continue;
        };

        let (lhs, rhs) = if insn.opcode.is_reverse_subtract() {
            (
                Expression::Constant {
                    value: insn.vc as i32,
                },
                lookup(&latest, insn.vb),
            )
        } else if insn.opcode.uses_literal() {
            (
                lookup(&latest, insn.vb),
                Expression::Constant {
                    value: insn.vc as i32,
                },
            )
        } else {
            (lookup(&latest, insn.vb), lookup(&latest, insn.vc))
        };

        let expr = Expression::Binary {
            mir: mid,
            kind,
            assign_to: insn.va,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
        latest.insert(insn.va, expr.clone());
        out.push((mid, expr));
    }
    out
}

fn lookup(latest: &FxHashMap<u32, Expression>, vreg: u32) -> Expression {
    latest
        .get(&vreg)
        .cloned()
        .unwrap_or(Expression::Register { vreg })
}

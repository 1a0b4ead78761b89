//! Mid-level IR for the trace compiler
//!
//! Instructions are decoded register-based bytecode plus the extended opcodes
//! the optimizer introduces (phi nodes, runtime checks, packed vector ops).
//! A [`Mir`] wraps a decoded instruction with its SSA annotations.

use bitflags::bitflags;

use crate::cfg::MirId;

bitflags! {
    /// Dataflow attributes of an opcode
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataflowAttrs: u32 {
        /// Defines a constant
        const SETS_CONST = 1 << 0;
        /// Defines or uses a register pair
        const WIDE = 1 << 1;
        /// Conditional branch
        const BRANCH = 1 << 2;
        /// Primitive conversion
        const CAST = 1 << 3;
        /// Touches the heap
        const MEMORY = 1 << 4;
        /// Carries a class, method, or field reference
        const REFERENCE = 1 << 5;
        /// Quickened form: the reference was resolved at rewrite time
        const QUICK = 1 << 6;
        /// Method invocation
        const INVOKE = 1 << 7;
        /// Can raise an exception
        const CAN_THROW = 1 << 8;
        /// Compiler-internal extended opcode
        const EXTENDED = 1 << 9;
        /// Operates on vector registers
        const PACKED = 1 << 10;
    }
}

/// Instruction opcodes: decoded bytecode plus extended compiler ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ========== Basics ==========
    /// No operation
    Nop,
    /// vA = vB
    Move,
    /// vA = #literal (literal carried in `vb`)
    Const,
    /// vA/vA+1 = #wide literal
    ConstWide,
    /// Unconditional branch
    Goto,
    /// Return with no value
    ReturnVoid,

    // ========== Conditional branches ==========
    /// if vA == vB branch
    IfEq,
    /// if vA != vB branch
    IfNe,
    /// if vA < vB branch
    IfLt,
    /// if vA >= vB branch
    IfGe,
    /// if vA > vB branch
    IfGt,
    /// if vA <= vB branch
    IfLe,
    /// if vA == 0 branch
    IfEqz,
    /// if vA != 0 branch
    IfNez,
    /// if vA < 0 branch
    IfLtz,
    /// if vA >= 0 branch
    IfGez,
    /// if vA > 0 branch
    IfGtz,
    /// if vA <= 0 branch
    IfLez,

    // ========== Integer ALU, register forms ==========
    /// vA = vB + vC
    AddInt,
    /// vA = vB - vC
    SubInt,
    /// vA = vB * vC
    MulInt,
    /// vA = vB / vC
    DivInt,
    /// vA = vB & vC
    AndInt,
    /// vA = vB | vC
    OrInt,
    /// vA = vB ^ vC
    XorInt,
    /// vA = vB << vC
    ShlInt,

    // ========== Integer ALU, literal forms (literal in `vc`) ==========
    /// vA = vB + #lit
    AddIntLit,
    /// vA = #lit - vB
    RsubInt,
    /// vA = #lit - vB (narrow literal)
    RsubIntLit,
    /// vA = vB * #lit
    MulIntLit,
    /// vA = vB & #lit
    AndIntLit,
    /// vA = vB | #lit
    OrIntLit,
    /// vA = vB ^ #lit
    XorIntLit,

    // ========== Conversions ==========
    /// vA/vA+1 = (long) vB
    IntToLong,
    /// vA = (float) vB
    IntToFloat,
    /// vA/vA+1 = (double) vB
    IntToDouble,
    /// vA = (int) vB/vB+1
    LongToInt,
    /// vA = (byte) vB
    IntToByte,
    /// vA = (char) vB
    IntToChar,
    /// vA = (short) vB
    IntToShort,

    // ========== Memory ==========
    /// vA = array vB at index vC
    Aget,
    /// array vB at index vC = vA
    Aput,
    /// vA = field `vc` of object vB
    Iget,
    /// field `vc` of object vB = vA
    Iput,
    /// Quickened instance get: field byte offset in `vc`
    IgetQuick,
    /// Quickened instance put: field byte offset in `vc`
    IputQuick,
    /// vA = static field `vb`
    Sget,
    /// static field `vb` = vA
    Sput,

    // ========== Invokes and allocation ==========
    /// Virtual dispatch through method reference `vb`
    InvokeVirtual,
    /// Static call to method reference `vb`
    InvokeStatic,
    /// Interface dispatch through method reference `vb`
    InvokeInterface,
    /// Quickened virtual dispatch: vtable index in `vb`
    InvokeVirtualQuick,
    /// Quickened super call: vtable index in `vb`
    InvokeSuperQuick,
    /// vA = new instance of class reference `vb`
    NewInstance,

    // ========== Extended compiler opcodes ==========
    /// SSA merge point for the virtual register in `va`
    Phi,
    /// Runtime null check of vA
    NullCheck,
    /// Runtime bound check of index vA against array vB
    BoundCheck,
    /// Load a 128-bit immediate (in `args`) into vector register `va`
    Const128,
    /// Copy vector register `vb` into vector register `va`
    Move128,
    /// Broadcast virtual register `vb` into every lane of vector register
    /// `va`, lane size in `vc`
    PackedSet,
    /// Packed addition: xmm `va` += xmm `vb`, lane size in `vc`
    PackedAdd,
    /// Packed subtraction
    PackedSub,
    /// Packed multiplication
    PackedMul,
    /// Packed bitwise and
    PackedAnd,
    /// Packed bitwise or
    PackedOr,
    /// Packed bitwise xor
    PackedXor,
    /// Horizontal add of xmm `vb` accumulated into virtual register `va`
    PackedAddReduce,
}

impl Opcode {
    /// Dataflow attributes for this opcode
    pub fn attrs(self) -> DataflowAttrs {
        use Opcode::*;
        match self {
            Const => DataflowAttrs::SETS_CONST,
            ConstWide => DataflowAttrs::SETS_CONST | DataflowAttrs::WIDE,

            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz
            | IfLez => DataflowAttrs::BRANCH,

            DivInt => DataflowAttrs::CAN_THROW,

            IntToLong | IntToDouble => DataflowAttrs::CAST | DataflowAttrs::WIDE,
            LongToInt => DataflowAttrs::CAST | DataflowAttrs::WIDE,
            IntToFloat | IntToByte | IntToChar | IntToShort => DataflowAttrs::CAST,

            Aget | Aput => DataflowAttrs::MEMORY | DataflowAttrs::CAN_THROW,
            Iget | Iput | Sget | Sput => {
                DataflowAttrs::MEMORY | DataflowAttrs::REFERENCE | DataflowAttrs::CAN_THROW
            }
            IgetQuick | IputQuick => {
                DataflowAttrs::MEMORY
                    | DataflowAttrs::REFERENCE
                    | DataflowAttrs::QUICK
                    | DataflowAttrs::CAN_THROW
            }

            InvokeVirtual | InvokeStatic | InvokeInterface => {
                DataflowAttrs::INVOKE | DataflowAttrs::REFERENCE | DataflowAttrs::CAN_THROW
            }
            InvokeVirtualQuick | InvokeSuperQuick => {
                DataflowAttrs::INVOKE
                    | DataflowAttrs::REFERENCE
                    | DataflowAttrs::QUICK
                    | DataflowAttrs::CAN_THROW
            }
            NewInstance => DataflowAttrs::REFERENCE | DataflowAttrs::CAN_THROW,

            Phi | NullCheck | BoundCheck => DataflowAttrs::EXTENDED,
            Const128 | Move128 | PackedSet | PackedAdd | PackedSub | PackedMul | PackedAnd
            | PackedOr | PackedXor | PackedAddReduce => {
                DataflowAttrs::EXTENDED | DataflowAttrs::PACKED
            }

            _ => DataflowAttrs::empty(),
        }
    }

    /// Is this a two-way conditional branch?
    pub fn is_conditional_branch(self) -> bool {
        self.attrs().contains(DataflowAttrs::BRANCH)
    }

    /// Is this a compare-to-zero conditional branch?
    pub fn is_zero_branch(self) -> bool {
        use Opcode::*;
        matches!(self, IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez)
    }

    /// Does this opcode define a constant?
    pub fn sets_const(self) -> bool {
        self.attrs().contains(DataflowAttrs::SETS_CONST)
    }

    /// Is this a primitive conversion?
    pub fn is_cast(self) -> bool {
        self.attrs().contains(DataflowAttrs::CAST)
    }

    /// Literal-operand ALU form: the value in `vc` is an immediate, not a
    /// register.
    pub fn uses_literal(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddIntLit | RsubInt | RsubIntLit | MulIntLit | AndIntLit | OrIntLit | XorIntLit
        )
    }

    /// Reverse-subtract forms, where `vb` stays a register operand
    pub fn is_reverse_subtract(self) -> bool {
        matches!(self, Opcode::RsubInt | Opcode::RsubIntLit)
    }

    /// The packed counterpart of an integer ALU opcode, if one exists
    pub fn vectorized(self) -> Option<Opcode> {
        use Opcode::*;
        match self {
            AddInt | AddIntLit => Some(PackedAdd),
            SubInt | RsubInt | RsubIntLit => Some(PackedSub),
            MulInt | MulIntLit => Some(PackedMul),
            AndInt | AndIntLit => Some(PackedAnd),
            OrInt | OrIntLit => Some(PackedOr),
            XorInt | XorIntLit => Some(PackedXor),
            _ => None,
        }
    }

    /// Does this opcode require its class/method/field reference to be
    /// resolved before the trace can execute?
    ///
    /// Quickened forms already hold a resolved offset or vtable index, and
    /// interface dispatch resolves at runtime, so they are exempt.
    pub fn must_resolve(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Iget | Iput | Sget | Sput | InvokeVirtual | InvokeStatic | NewInstance
        )
    }
}

/// A decoded instruction: opcode plus raw operand fields
///
/// Operand meaning depends on the opcode; see the [`Opcode`] per-variant
/// docs. `args` is only populated for `Const128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    pub opcode: Opcode,
    pub va: u32,
    pub vb: u32,
    pub vc: u32,
    /// 128-bit immediate payload, little endian words
    pub args: [u32; 4],
}

impl DecodedInsn {
    /// A new instruction with all operands zero
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            va: 0,
            vb: 0,
            vc: 0,
            args: [0; 4],
        }
    }

    /// Three-operand constructor
    pub fn with_ops(opcode: Opcode, va: u32, vb: u32, vc: u32) -> Self {
        Self {
            opcode,
            va,
            vb,
            vc,
            args: [0; 4],
        }
    }

    /// The non-wide constant this instruction defines, if any
    pub fn constant(&self) -> Option<i32> {
        match self.opcode {
            Opcode::Const => Some(self.vb as i32),
            _ => None,
        }
    }

    /// The reference-pool index this instruction carries, if any
    pub fn ref_index(&self) -> Option<u32> {
        use Opcode::*;
        match self.opcode {
            Iget | Iput | IgetQuick | IputQuick => Some(self.vc),
            Sget | Sput | NewInstance => Some(self.vb),
            InvokeVirtual | InvokeStatic | InvokeInterface | InvokeVirtualQuick
            | InvokeSuperQuick => Some(self.vb),
            _ => None,
        }
    }

    /// Replace every register-use of `from` with `to`, leaving definitions
    /// and literal operands alone
    pub fn rewrite_use(&mut self, from: u32, to: u32) {
        use Opcode::*;
        let (va, vb, vc) = match self.opcode {
            Move | AddIntLit | RsubInt | RsubIntLit | MulIntLit | AndIntLit | OrIntLit
            | XorIntLit | IntToLong | IntToFloat | IntToDouble | LongToInt | IntToByte
            | IntToChar | IntToShort | Iget | IgetQuick => (false, true, false),
            AddInt | SubInt | MulInt | DivInt | AndInt | OrInt | XorInt | ShlInt | Aget => {
                (false, true, true)
            }
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | BoundCheck | Iput | IputQuick => {
                (true, true, false)
            }
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez | Sput | NullCheck => {
                (true, false, false)
            }
            Aput => (true, true, true),
            _ => (false, false, false),
        };
        if va && self.va == from {
            self.va = to;
        }
        if vb && self.vb == from {
            self.vb = to;
        }
        if vc && self.vc == from {
            self.vc = to;
        }
    }

    /// Virtual registers read and written by this instruction, in operand
    /// order. Phi uses are variable arity and tracked in [`SsaRep`] instead;
    /// packed opcodes work on vector registers and carry at most the scalar
    /// operands listed here.
    pub fn operands(&self) -> (Vec<u32>, Vec<u32>) {
        use Opcode::*;
        let (uses, defs): (&[u32], &[u32]) = match self.opcode {
            Move => (&[self.vb], &[self.va]),
            Const | ConstWide => (&[], &[self.va]),
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => (&[self.va, self.vb], &[]),
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => (&[self.va], &[]),
            AddInt | SubInt | MulInt | DivInt | AndInt | OrInt | XorInt | ShlInt => {
                (&[self.vb, self.vc], &[self.va])
            }
            AddIntLit | RsubInt | RsubIntLit | MulIntLit | AndIntLit | OrIntLit | XorIntLit => {
                (&[self.vb], &[self.va])
            }
            IntToLong | IntToFloat | IntToDouble | LongToInt | IntToByte | IntToChar
            | IntToShort => (&[self.vb], &[self.va]),
            Aget => (&[self.vb, self.vc], &[self.va]),
            Aput => (&[self.va, self.vb, self.vc], &[]),
            Iget | IgetQuick => (&[self.vb], &[self.va]),
            Iput | IputQuick => (&[self.va, self.vb], &[]),
            Sget => (&[], &[self.va]),
            Sput => (&[self.va], &[]),
            NewInstance => (&[], &[self.va]),
            Phi => (&[], &[self.va]),
            NullCheck => (&[self.va], &[]),
            BoundCheck => (&[self.va, self.vb], &[]),
            PackedSet => (&[self.vb], &[]),
            PackedAddReduce => (&[self.va], &[self.va]),
            _ => (&[], &[]),
        };
        (uses.to_vec(), defs.to_vec())
    }
}

/// An SSA value: virtual register plus definition version
///
/// Version 0 is the value live at trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SsaReg {
    pub vreg: u32,
    pub version: u32,
}

impl SsaReg {
    pub fn new(vreg: u32, version: u32) -> Self {
        Self { vreg, version }
    }
}

/// SSA annotations of one instruction
#[derive(Debug, Clone, Default)]
pub struct SsaRep {
    /// Values read, in operand order (phi nodes: one entry per predecessor)
    pub uses: Vec<SsaReg>,
    /// Values written
    pub defs: Vec<SsaReg>,
    /// Defining instruction of each use; `None` when the value flows in from
    /// before the trace
    pub def_where: Vec<Option<MirId>>,
    /// Instructions reading each def, in block layout order, parallel to
    /// `defs`
    pub use_chains: Vec<Vec<MirId>>,
}

/// One instruction in the compilation unit arena
#[derive(Debug, Clone)]
pub struct Mir {
    pub insn: DecodedInsn,
    /// Bytecode offset this instruction came from
    pub offset: u32,
    pub ssa: Option<SsaRep>,
    /// Set when this instruction was produced by duplicating another block
    pub copied_from: Option<MirId>,
}

impl Mir {
    pub fn new(insn: DecodedInsn, offset: u32) -> Self {
        Self {
            insn,
            offset,
            ssa: None,
            copied_from: None,
        }
    }
}

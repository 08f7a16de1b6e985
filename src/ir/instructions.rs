//! Instructions and terminators of the input IR.

use crate::ir::constants::Constant;
use crate::ir::types::{FunctionType, Type};
use crate::ir::{BlockId, ValueId};

/// An operand: either another SSA value in the same function, or a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(ValueId),
    Const(Constant),
}

impl Operand {
    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Value(_) => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        self.as_const().and_then(Constant::as_int)
    }
}

/// Source location carried through for `//@line` annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugLoc {
    pub line: u32,
    pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FPTrunc,
    FPExt,
    FPToUI,
    FPToSI,
    UIToFP,
    SIToFP,
    PtrToInt,
    IntToPtr,
    Bitcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IntPredicate::Ugt | IntPredicate::Uge | IntPredicate::Ult | IntPredicate::Ule
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    Uno,
    True,
}

/// Read-modify-write operations for `atomicrmw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
}

/// Who a call targets.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// Direct call to a function known by symbol name.
    Direct(String),
    /// Indirect call through a function pointer, with the callee type needed
    /// to pick the signature table.
    Indirect { pointer: Operand, sig: FunctionType },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Binary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
    },
    FCmp {
        pred: FloatPredicate,
        lhs: Operand,
        rhs: Operand,
    },
    Cast {
        op: CastOp,
        value: Operand,
    },
    Load {
        ptr: Operand,
        align: u32,
        volatile: bool,
    },
    Store {
        ptr: Operand,
        value: Operand,
        align: u32,
        volatile: bool,
    },
    Gep {
        base: Operand,
        indices: Vec<Operand>,
    },
    Alloca {
        allocated: Type,
        count: Operand,
        align: u32,
    },
    Call {
        callee: Callee,
        args: Vec<Operand>,
    },
    Select {
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
    },
    Phi {
        incoming: Vec<(BlockId, Operand)>,
    },
    AtomicRmw {
        op: RmwOp,
        ptr: Operand,
        value: Operand,
    },
    Fence,
    ExtractElement {
        vector: Operand,
        index: Operand,
    },
    InsertElement {
        vector: Operand,
        element: Operand,
        index: Operand,
    },
    ShuffleVector {
        a: Operand,
        b: Operand,
        /// Lane selection; negative entries are undef lanes.
        mask: Vec<i32>,
    },
}

/// One SSA instruction. `ty` is the result type (`Void` for pure effects).
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    /// Source-level name; unnamed values get numbered identifiers.
    pub name: Option<String>,
    pub ty: Type,
    pub kind: InstKind,
    pub debug: Option<DebugLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        cond: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    IndirectBr {
        addr: Operand,
        dests: Vec<BlockId>,
    },
    Ret(Option<Operand>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Terminator::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, dest)| *dest));
                out
            }
            Terminator::IndirectBr { dests, .. } => dests.clone(),
            Terminator::Ret(_) | Terminator::Unreachable => vec![],
        }
    }
}

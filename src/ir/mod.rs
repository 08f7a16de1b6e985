//! In-memory model of the pre-lowered SSA IR consumed by the generator.
//!
//! This is the collaborator contract with the front end: an immutable module
//! holding a data layout descriptor, globals with optional initializer
//! constants, and functions made of basic blocks in SSA form. The generator
//! only borrows it for the duration of one emission.

pub mod constants;
pub mod instructions;
pub mod module;
pub mod types;

pub use constants::{ConstExpr, Constant};
pub use instructions::{
    BinOp, Callee, CastOp, DebugLoc, FloatPredicate, InstKind, Instruction, IntPredicate, Operand,
    RmwOp, Terminator,
};
pub use module::{
    BasicBlock, FnAttrs, Function, GlobalAlias, GlobalVariable, Module, Param,
    EXPECTED_TARGET_TRIPLE,
};
pub use types::{DataLayout, FunctionType, Type};

/// Identifies an SSA value (parameter or instruction result) within one
/// function. Dense, starting at 0 with the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Identifies a basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

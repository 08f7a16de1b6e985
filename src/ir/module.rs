//! Module-level containers: globals, functions, aliases.

use crate::ir::constants::{ConstExpr, Constant};
use crate::ir::instructions::{Instruction, Terminator};
use crate::ir::types::{DataLayout, Type};
use crate::ir::{BlockId, ValueId};

/// The target triple the generator expects; anything else draws a warning.
pub const EXPECTED_TARGET_TRIPLE: &str = "asmjs-unknown-emscripten";

#[derive(Debug, Clone)]
pub struct Module {
    pub target_triple: String,
    pub data_layout: DataLayout,
    pub globals: Vec<GlobalVariable>,
    pub functions: Vec<Function>,
    pub aliases: Vec<GlobalAlias>,
}

impl Module {
    pub fn new() -> Module {
        Module {
            target_triple: EXPECTED_TARGET_TRIPLE.to_owned(),
            data_layout: DataLayout::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            aliases: Vec::new(),
        }
    }

    pub fn find_global(&self, name: &str) -> Option<&GlobalVariable> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn find_alias(&self, name: &str) -> Option<&GlobalAlias> {
        self.aliases.iter().find(|a| a.name == name)
    }

    /// Resolves through aliases and constant pointer casts until an actual
    /// definition (function, global, block address) is reached.
    pub fn resolve_fully<'m>(&'m self, constant: &'m Constant) -> &'m Constant {
        let mut current = constant;
        loop {
            match current {
                Constant::Global(name) => {
                    if let Some(alias) = self.find_alias(name) {
                        current = &alias.target;
                        continue;
                    }
                    return current;
                }
                Constant::Expr(expr) => match expr.as_ref() {
                    ConstExpr::Bitcast { value, .. }
                    | ConstExpr::PtrToInt(value)
                    | ConstExpr::IntToPtr(value) => {
                        current = value;
                        continue;
                    }
                    _ => return current,
                },
                _ => return current,
            }
        }
    }
}

impl Default for Module {
    fn default() -> Module {
        Module::new()
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    /// The value type (the global itself is a pointer to this).
    pub ty: Type,
    /// Requested alignment in bytes; 0 means the default.
    pub align: u32,
    pub init: Option<Constant>,
    /// Internal linkage (not visible for dlsym/export purposes).
    pub internal: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalAlias {
    pub name: String,
    pub target: Constant,
}

#[derive(Debug, Clone, Default)]
pub struct FnAttrs {
    pub min_size: bool,
    pub optimize_for_size: bool,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub id: ValueId,
    pub name: Option<String>,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    /// Empty for declarations.
    pub blocks: Vec<BasicBlock>,
    pub attrs: FnAttrs,
    pub internal: bool,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub insts: Vec<Instruction>,
    pub term: Terminator,
}

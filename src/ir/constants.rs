//! The recursive constant sum type of the input IR.

use crate::diagnostics::CodegenError;
use crate::ir::module::Module;
use crate::ir::types::{FunctionType, Type};
use crate::ir::BlockId;

/// A constant value, as it appears in global initializers and instruction
/// operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Integer constant. Widths above 32 only appear in global data.
    Int { value: i64, width: u32 },
    Float(f32),
    Double(f64),
    /// Null pointer of the given pointer type.
    Null(Type),
    Undef(Type),
    /// `zeroinitializer` of an arbitrary type.
    AggregateZero(Type),
    /// A byte string (data-sequential array of i8), e.g. `c"hello\00"`.
    Str(Vec<u8>),
    Vector { ty: Type, elems: Vec<Constant> },
    Array(Vec<Constant>),
    Struct { fields: Vec<Constant>, packed: bool },
    /// Reference to a global variable, function, or alias, by symbol name.
    Global(String),
    /// Address of a basic block, for `indirectbr` targets.
    BlockAddress { function: String, block: BlockId },
    Expr(Box<ConstExpr>),
}

/// A constant expression, a sum over the opcodes the pre-lowered IR can
/// still contain.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    PtrToInt(Constant),
    IntToPtr(Constant),
    Bitcast { value: Constant, to: Type },
    Add(Constant, Constant),
    Sub(Constant, Constant),
    Gep { base: Constant, indices: Vec<Constant> },
}

impl Constant {
    pub fn i32(value: i32) -> Constant {
        Constant::Int {
            value: value as i64,
            width: 32,
        }
    }

    pub fn bool(value: bool) -> Constant {
        Constant::Int {
            value: value as i64,
            width: 1,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_zero_int(&self) -> bool {
        matches!(self, Constant::Int { value: 0, .. })
    }

    /// The type of this constant. Symbol references need the module to
    /// recover what they point at.
    pub fn ty(&self, module: &Module) -> Result<Type, CodegenError> {
        match self {
            Constant::Int { width, .. } => Ok(Type::Int(*width)),
            Constant::Float(_) => Ok(Type::Float),
            Constant::Double(_) => Ok(Type::Double),
            Constant::Null(ty) | Constant::Undef(ty) | Constant::AggregateZero(ty) => {
                Ok(ty.clone())
            }
            Constant::Str(bytes) => Ok(Type::array_of(Type::Int(8), bytes.len() as u32)),
            Constant::Vector { ty, .. } => Ok(ty.clone()),
            Constant::Array(elems) => {
                let elem_ty = match elems.first() {
                    Some(first) => first.ty(module)?,
                    None => Type::Int(8),
                };
                Ok(Type::array_of(elem_ty, elems.len() as u32))
            }
            Constant::Struct { fields, packed } => {
                let mut field_tys = Vec::with_capacity(fields.len());
                for field in fields {
                    field_tys.push(field.ty(module)?);
                }
                Ok(Type::Struct {
                    fields: field_tys,
                    packed: *packed,
                })
            }
            Constant::Global(name) => {
                if let Some(global) = module.find_global(name) {
                    return Ok(Type::ptr_to(global.ty.clone()));
                }
                if let Some(function) = module.find_function(name) {
                    return Ok(Type::ptr_to(Type::Func(Box::new(FunctionType {
                        ret: function.ret.clone(),
                        params: function.params.iter().map(|p| p.ty.clone()).collect(),
                    }))));
                }
                if let Some(alias) = module.find_alias(name) {
                    return alias.target.ty(module);
                }
                Err(CodegenError::missing_global_address(name))
            }
            Constant::BlockAddress { .. } => Ok(Type::ptr_to(Type::Int(8))),
            Constant::Expr(expr) => expr.ty(module),
        }
    }
}

impl ConstExpr {
    pub fn ty(&self, module: &Module) -> Result<Type, CodegenError> {
        match self {
            ConstExpr::PtrToInt(_) => Ok(Type::Int(32)),
            ConstExpr::IntToPtr(_) => Ok(Type::ptr_to(Type::Int(8))),
            ConstExpr::Bitcast { to, .. } => Ok(to.clone()),
            ConstExpr::Add(lhs, _) | ConstExpr::Sub(lhs, _) => lhs.ty(module),
            ConstExpr::Gep { base, .. } => base.ty(module),
        }
    }
}

//! Scalar expression lowering.
//!
//! Each instruction becomes `$dst = <rhs>;` (the assignment is dropped when
//! the result has no users), where `<rhs>` carries the coercions that let
//! the consumer re-derive the static type: `|0` for signed/nonspecific
//! integers, `>>>0` for unsigned, `+` for doubles, `Math_fround` for precise
//! floats. Pointer-identity bitcasts and all-zero GEPs are never emitted;
//! every operand fetch looks through them.

use crate::codegen::control_flow::FunctionLowerer;
use crate::codegen::layout::GepWalk;
use crate::codegen::simd::{ensure_float, simd_type};
use crate::codegen::STACK_ALIGN;
use crate::diagnostics::{CodegenError, CodegenWarning, WarningKind};
use crate::ir::{
    BinOp, CastOp, ConstExpr, Constant, FloatPredicate, InstKind, Instruction, IntPredicate,
    Operand, Type, ValueId,
};

// Coercion request flags. `ASM_SIGNED` is the default (no bits set).
pub(crate) type AsmCast = u32;
pub(crate) const ASM_SIGNED: AsmCast = 0;
pub(crate) const ASM_UNSIGNED: AsmCast = 1;
/// Do not differentiate sub-32-bit widths; `|0` regardless of size or sign.
pub(crate) const ASM_NONSPECIFIC: AsmCast = 2;
/// Values returned from an FFI are limited to things that cross an FFI.
pub(crate) const ASM_FFI_IN: AsmCast = 4;
/// Params passed to an FFI are limited to things that cross an FFI.
pub(crate) const ASM_FFI_OUT: AsmCast = 8;
/// The value must be explicitly cast (or be an integer constant).
pub(crate) const ASM_MUST_CAST: AsmCast = 16;
/// Return float constants as their raw bit pattern, so NaN canonicalization
/// cannot eat the payload. Incompatible with `ASM_UNSIGNED`.
pub(crate) const ASM_FORCE_FLOAT_AS_INTBITS: AsmCast = 32;

/// An operand after looking through pointer-identity casts.
#[derive(Clone, Copy)]
pub(crate) enum Stripped<'ir> {
    Value(ValueId),
    Con(&'ir Constant),
}

/// Looks through constant pointer bitcasts and all-zero constant GEPs.
pub(crate) fn strip_const(mut constant: &Constant) -> &Constant {
    loop {
        let Constant::Expr(expr) = constant else {
            return constant;
        };
        match expr.as_ref() {
            ConstExpr::Bitcast { value, .. } => constant = value,
            ConstExpr::Gep { base, indices }
                if indices.iter().all(|i| i.as_int() == Some(0)) =>
            {
                constant = base;
            }
            _ => return constant,
        }
    }
}

/// `base` plus a constant byte offset, parenthesized to stay asm-typed.
pub(crate) fn add_offset(base: &str, offset: i32) -> String {
    if base.is_empty() {
        return offset.to_string();
    }
    if offset == 0 {
        return base.to_owned();
    }
    format!("(({}) + {}|0)", base, offset)
}

fn lsb_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl<'a, 'ir> FunctionLowerer<'a, 'ir> {
    // ========================================================================
    // Operand access
    // ========================================================================

    pub(crate) fn is_pointer_identity(&self, inst: &Instruction) -> bool {
        match &inst.kind {
            InstKind::Cast {
                op: CastOp::Bitcast,
                value,
            } => {
                inst.ty.is_pointer()
                    && self
                        .operand_ty(value)
                        .map(|ty| ty.is_pointer())
                        .unwrap_or(false)
            }
            InstKind::Gep { indices, .. } => {
                indices.iter().all(|index| index.as_const_int() == Some(0))
            }
            _ => false,
        }
    }

    pub(crate) fn strip_operand(&self, op: &'ir Operand) -> Stripped<'ir> {
        let mut current = op;
        loop {
            match current {
                Operand::Value(id) => match self.def(*id) {
                    Some(inst) if self.is_pointer_identity(inst) => {
                        current = match &inst.kind {
                            InstKind::Cast { value, .. } => value,
                            InstKind::Gep { base, .. } => base,
                            _ => unreachable!("pointer identities are casts or GEPs"),
                        };
                    }
                    _ => return Stripped::Value(*id),
                },
                Operand::Const(constant) => return Stripped::Con(strip_const(constant)),
            }
        }
    }

    pub(crate) fn operand_ty(&self, op: &Operand) -> Result<Type, CodegenError> {
        match op {
            Operand::Value(id) => {
                if let Some(param) = self.param(*id) {
                    return Ok(param.ty.clone());
                }
                if let Some(def) = self.def(*id) {
                    return Ok(def.ty.clone());
                }
                Err(CodegenError::unsupported_instruction(format!(
                    "operand references unknown SSA value {:?}",
                    id
                )))
            }
            Operand::Const(constant) => constant.ty(self.em.module),
        }
    }

    pub(crate) fn stripped_ty(&self, stripped: &Stripped<'ir>) -> Result<Type, CodegenError> {
        match stripped {
            Stripped::Value(id) => self.operand_ty(&Operand::Value(*id)),
            Stripped::Con(constant) => constant.ty(self.em.module),
        }
    }

    // ========================================================================
    // Names and assignments
    // ========================================================================

    pub(crate) fn local_name(&mut self, id: ValueId) -> Result<String, CodegenError> {
        if let Some(name) = self.value_names.get(&id) {
            return Ok(name.clone());
        }
        // A static alloca coalesced into another speaks in its
        // representative's name.
        if let Some(def) = self.def(id) {
            if matches!(def.kind, InstKind::Alloca { .. }) {
                let rep = self.frame.representative(id);
                if rep != id {
                    let name = self.local_name(rep)?;
                    self.value_names.insert(id, name.clone());
                    return Ok(name);
                }
            }
        }
        let raw = if let Some(param) = self.param(id) {
            param.name.clone()
        } else {
            self.def(id).and_then(|inst| inst.name.clone())
        };
        let name = match raw {
            Some(raw) => super::names::sanitize_local(&raw),
            None => {
                let numbered = super::names::sanitize_local(&self.unique_num.to_string());
                self.unique_num += 1;
                numbered
            }
        };
        self.value_names.insert(id, name.clone());
        Ok(name)
    }

    pub(crate) fn ad_hoc_assign(&mut self, name: &str, ty: &Type) -> Result<String, CodegenError> {
        self.used_vars.insert(name.to_owned(), ty.clone());
        Ok(format!("{} = ", name))
    }

    pub(crate) fn get_assign(&mut self, inst: &Instruction) -> Result<String, CodegenError> {
        let name = self.local_name(inst.id)?;
        self.ad_hoc_assign(&name, &inst.ty)
    }

    pub(crate) fn assign_if_needed(&mut self, inst: &Instruction) -> Result<String, CodegenError> {
        if self.is_used(inst.id) {
            self.get_assign(inst)
        } else {
            Ok(String::new())
        }
    }

    // ========================================================================
    // Value rendering
    // ========================================================================

    pub(crate) fn value_str(
        &mut self,
        op: &'ir Operand,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        match self.strip_operand(op) {
            Stripped::Con(constant) => self.constant_str(constant, sign),
            Stripped::Value(id) => self.local_name(id),
        }
    }

    pub(crate) fn value_as_cast_str(
        &mut self,
        op: &'ir Operand,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        let stripped = self.strip_operand(op);
        if let Stripped::Con(constant) = stripped {
            if matches!(
                constant,
                Constant::Int { .. } | Constant::Float(_) | Constant::Double(_)
            ) {
                return self.constant_str(constant, sign);
            }
        }
        let ty = self.stripped_ty(&stripped)?;
        let inner = self.value_str(op, ASM_SIGNED)?;
        self.get_cast(&inner, &ty, sign)
    }

    pub(crate) fn value_as_paren_str(&mut self, op: &'ir Operand) -> Result<String, CodegenError> {
        match self.strip_operand(op) {
            Stripped::Con(constant) => self.constant_str(constant, ASM_SIGNED),
            Stripped::Value(_) => Ok(format!("({})", self.value_str(op, ASM_SIGNED)?)),
        }
    }

    pub(crate) fn value_as_cast_paren_str(
        &mut self,
        op: &'ir Operand,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        let stripped = self.strip_operand(op);
        if let Stripped::Con(constant) = stripped {
            if matches!(
                constant,
                Constant::Int { .. }
                    | Constant::Float(_)
                    | Constant::Double(_)
                    | Constant::Undef(_)
            ) {
                return self.constant_str(constant, sign);
            }
        }
        let ty = self.stripped_ty(&stripped)?;
        let inner = self.value_str(op, ASM_SIGNED)?;
        Ok(format!("({})", self.get_cast(&inner, &ty, sign)?))
    }

    // ========================================================================
    // Casts
    // ========================================================================

    pub(crate) fn get_cast(
        &self,
        s: &str,
        ty: &Type,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        match ty {
            Type::Vector { .. } => Ok(format!("SIMD_{}_check({})", simd_type(ty)?, s)),
            Type::Float => {
                if self.em.config.precise_f32 && sign & ASM_FFI_OUT == 0 {
                    if sign & ASM_FFI_IN != 0 {
                        Ok(format!("Math_fround(+({}))", s))
                    } else {
                        Ok(format!("Math_fround({})", s))
                    }
                } else {
                    Ok(format!("+{}", s))
                }
            }
            Type::Double => Ok(format!("+{}", s)),
            Type::Int(width) => {
                if sign & ASM_NONSPECIFIC == 0 {
                    match width {
                        1 => {
                            return Ok(if sign == ASM_UNSIGNED {
                                format!("{}&1", s)
                            } else {
                                format!("{}<<31>>31", s)
                            });
                        }
                        8 => {
                            return Ok(if sign == ASM_UNSIGNED {
                                format!("{}&255", s)
                            } else {
                                format!("{}<<24>>24", s)
                            });
                        }
                        16 => {
                            return Ok(if sign == ASM_UNSIGNED {
                                format!("{}&65535", s)
                            } else {
                                format!("{}<<16>>16", s)
                            });
                        }
                        32 => {}
                        other => {
                            return Err(CodegenError::integer_too_wide(format!(
                                "cannot coerce an i{} value",
                                other
                            )));
                        }
                    }
                }
                if sign == ASM_UNSIGNED {
                    Ok(format!("{}>>>0", s))
                } else {
                    Ok(format!("{}|0", s))
                }
            }
            Type::Ptr(_) | Type::Func(_) => {
                if sign == ASM_UNSIGNED {
                    Ok(format!("{}>>>0", s))
                } else {
                    Ok(format!("{}|0", s))
                }
            }
            Type::Void => Err(CodegenError::unsupported_instruction(
                "cannot coerce a void value",
            )),
            Type::Array { .. } | Type::Struct { .. } => Err(
                CodegenError::unsupported_instruction("cannot coerce an aggregate value"),
            ),
        }
    }

    pub(crate) fn get_paren_cast(
        &self,
        s: &str,
        ty: &Type,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        self.get_cast(&format!("({})", s), ty, sign)
    }

    fn ensure_cast(&self, s: &str, ty: &Type, sign: AsmCast) -> Result<String, CodegenError> {
        if sign & ASM_MUST_CAST != 0 {
            self.get_cast(s, ty, ASM_SIGNED)
        } else {
            Ok(s.to_owned())
        }
    }

    pub(crate) fn double_to_int(s: &str) -> String {
        format!("~~({})", s)
    }

    pub(crate) fn ensure_float_ty(&self, s: String, ty: &Type) -> String {
        ensure_float(s, self.em.config.precise_f32 && *ty == Type::Float)
    }

    // ========================================================================
    // Constants
    // ========================================================================

    fn float_literal(
        &mut self,
        value: f64,
        bits_noncanonical: bool,
        ty: &Type,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        if value.is_infinite() {
            let spelled = if value < 0.0 { "-inf" } else { "inf" };
            return self.ensure_cast(spelled, ty, sign);
        }
        if value.is_nan() {
            if bits_noncanonical && self.em.config.warn_on_noncanonical_nans {
                self.em.diagnostics.warn(CodegenWarning::new(
                    WarningKind::NoncanonicalNan,
                    "cannot represent a NaN literal with custom bit pattern in \
                     NaN-canonicalizing JS engines without erasing bits",
                ));
            }
            return self.ensure_cast("nan", ty, sign);
        }
        // Literals with a dot may lose it through downstream minification;
        // mark integral values as floating-point with a unary plus.
        if value == value.trunc() && value.abs() < 9e15 {
            return Ok(format!("+{}", value as i64));
        }
        Ok(format!("{:?}", value))
    }

    pub(crate) fn constant_str(
        &mut self,
        cv: &Constant,
        sign: AsmCast,
    ) -> Result<String, CodegenError> {
        let module = self.em.module;
        match cv {
            Constant::Null(_) => Ok("0".to_owned()),
            Constant::Global(name) => {
                if module.find_function(name).is_some() {
                    let index = self.em.function_index_for(name)?;
                    return Ok(self.em.relocate_function_pointer(index.to_string()));
                }
                if let Some(alias) = module.find_alias(name) {
                    // Linking of the output is not supported, so weak and
                    // other alias kinds do not matter here.
                    let target = strip_const(&alias.target);
                    return self.constant_str(target, sign);
                }
                if let Some(global) = module.find_global(name) {
                    if global.init.is_none() {
                        let mangled = self.em.global_js_name(name);
                        self.em.externals.insert(mangled.clone());
                        if self.em.config.relocatable {
                            // Linked externs are read through calls, hoisted
                            // to the top of the function.
                            self.reloc_externs.insert(mangled.clone());
                            let temp = format!("t${}", mangled);
                            self.used_vars.insert(temp.clone(), Type::Int(32));
                            return Ok(temp);
                        }
                        return Ok(mangled);
                    }
                    let address = self.em.layout.absolute_address(name)?;
                    return Ok(self.em.relocate_global(address.to_string()));
                }
                Err(CodegenError::missing_global_address(name))
            }
            Constant::Int { value, width } => {
                // Bools are always unsigned: either 0 or 1.
                if *width == 1 {
                    return Ok(((*value as u64) & 1).to_string());
                }
                if sign == ASM_UNSIGNED {
                    Ok(((*value as u64) & lsb_mask(*width)).to_string())
                } else {
                    Ok(value.to_string())
                }
            }
            Constant::Float(value) => {
                if sign & ASM_FORCE_FLOAT_AS_INTBITS != 0 {
                    debug_assert_eq!(sign & ASM_UNSIGNED, 0);
                    return Ok((value.to_bits() as i32).to_string());
                }
                let noncanonical = value.is_nan() && value.to_bits() != 0x7FC0_0000;
                let mut text =
                    self.float_literal(*value as f64, noncanonical, &Type::Float, sign)?;
                if self.em.config.precise_f32 && sign & ASM_FFI_OUT == 0 {
                    text = format!("Math_fround({})", text);
                }
                Ok(text)
            }
            Constant::Double(value) => {
                if sign & ASM_FORCE_FLOAT_AS_INTBITS != 0 {
                    debug_assert_eq!(sign & ASM_UNSIGNED, 0);
                    return Ok((value.to_bits() as i64).to_string());
                }
                let noncanonical = value.is_nan() && value.to_bits() != 0x7FF8_0000_0000_0000;
                self.float_literal(*value, noncanonical, &Type::Double, sign)
            }
            Constant::Undef(ty) | Constant::AggregateZero(ty) => {
                if ty.is_vector() {
                    self.em.check_vector_type(ty)?;
                    let elem_is_int = ty
                        .vector_parts()
                        .map(|(elem, _)| elem.is_integer())
                        .unwrap_or(true);
                    return Ok(format!(
                        "SIMD_{}_splat({})",
                        simd_type(ty)?,
                        ensure_float("0".to_owned(), !elem_is_int)
                    ));
                }
                if ty.is_floating_point() {
                    let mut text = "+0".to_owned();
                    if self.em.config.precise_f32 && *ty == Type::Float && sign & ASM_FFI_OUT == 0
                    {
                        text = format!("Math_fround({})", text);
                    }
                    return Ok(text);
                }
                // Also covers things like zero-length aggregates that the
                // front end emits for landing pads.
                Ok("0".to_owned())
            }
            Constant::Vector { .. } => self.constant_vector_str(cv),
            Constant::Array(elems) => {
                // Single-element constant arrays of pointers show up for
                // landing-pad tables; anything else should have been
                // flattened upstream.
                if elems.len() == 1 {
                    return self.constant_str(strip_const(&elems[0]), ASM_SIGNED);
                }
                Err(CodegenError::unsupported_constant(
                    "constant array used as a value",
                ))
            }
            Constant::Str(_) | Constant::Struct { .. } => Err(
                CodegenError::unsupported_constant("aggregate constant used as a scalar value"),
            ),
            Constant::BlockAddress { function, block } => {
                Ok(self.em.block_address(function, *block).to_string())
            }
            Constant::Expr(expr) => Ok(format!("({})", self.const_expr_str(expr)?)),
        }
    }

    fn const_expr_str(&mut self, expr: &ConstExpr) -> Result<String, CodegenError> {
        let module = self.em.module;
        match expr {
            ConstExpr::PtrToInt(inner) | ConstExpr::IntToPtr(inner) => {
                self.constant_str(inner, ASM_SIGNED)
            }
            ConstExpr::Bitcast { value, to } => {
                let from_ty = value.ty(module)?;
                let text = self.constant_str(value, ASM_SIGNED)?;
                self.bitcast_text(text, &from_ty, to)
            }
            ConstExpr::Add(lhs, rhs) | ConstExpr::Sub(lhs, rhs) => {
                let ty = lhs.ty(module)?;
                let operator = if matches!(expr, ConstExpr::Add(..)) {
                    "+"
                } else {
                    "-"
                };
                let lhs = self.constant_str(lhs, ASM_SIGNED)?;
                let rhs = self.constant_str(rhs, ASM_SIGNED)?;
                self.get_paren_cast(&format!("{} {} {}", lhs, operator, rhs), &ty, ASM_SIGNED)
            }
            ConstExpr::Gep { base, indices } => {
                let dl = &module.data_layout;
                let stripped = strip_const(base);
                let mut constant_offset: i64 = 0;
                let mut text = String::new();
                let foldable = match stripped {
                    Constant::Global(name) => module
                        .find_global(name)
                        .map(|global| global.init.is_some() && !self.em.config.relocatable)
                        .unwrap_or(false),
                    _ => false,
                };
                if foldable {
                    let Constant::Global(name) = stripped else {
                        unreachable!()
                    };
                    constant_offset = self.em.layout.absolute_address(name)? as i64;
                } else {
                    text = format!("({})", self.constant_str(stripped, ASM_SIGNED)?);
                }
                let base_ty = base.ty(module)?;
                let pointee = base_ty.pointee().cloned().ok_or_else(|| {
                    CodegenError::unsupported_constant("constant GEP base is not a pointer")
                })?;
                let mut walk = GepWalk::new(pointee);
                for (position, index) in indices.iter().enumerate() {
                    let index = index.as_int().ok_or_else(|| {
                        CodegenError::unsupported_constant("non-constant index in constant GEP")
                    })?;
                    constant_offset += walk.step(dl, position, index)?;
                }
                Ok(add_offset(&text, constant_offset as i32))
            }
        }
    }

    // ========================================================================
    // Integer multiply
    // ========================================================================

    fn imul_peephole(&mut self, other: String, factor: u32) -> Option<String> {
        if factor == 0 {
            return Some("0".to_owned());
        }
        if factor == 1 {
            return Some(other);
        }
        if factor.is_power_of_two() {
            return Some(format!("{}<<{}", other, factor.trailing_zeros()));
        }
        if factor < (1 << 20) {
            // Small enough that the double product is exact; avoid imul.
            return Some(format!("({}*{})|0", other, factor));
        }
        None
    }

    pub(crate) fn imul(
        &mut self,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        // Multiplying two constants is the optimizer's job, not ours.
        let (factor, other) = match (lhs.as_const_int(), rhs.as_const_int()) {
            (Some(k), _) => (Some(k), rhs),
            (_, Some(k)) => (Some(k), lhs),
            _ => (None, lhs),
        };
        if let Some(k) = factor {
            let other_str = self.value_str(other, ASM_SIGNED)?;
            if let Some(folded) = self.imul_peephole(other_str, k as u32) {
                return Ok(folded);
            }
        }
        Ok(format!(
            "Math_imul({}, {})|0",
            self.value_str(lhs, ASM_SIGNED)?,
            self.value_str(rhs, ASM_SIGNED)?
        ))
    }

    pub(crate) fn imul_with_const(
        &mut self,
        op: &'ir Operand,
        factor: i64,
    ) -> Result<String, CodegenError> {
        let other_str = self.value_str(op, ASM_SIGNED)?;
        if let Some(folded) = self.imul_peephole(other_str.clone(), factor as u32) {
            return Ok(folded);
        }
        Ok(format!("Math_imul({}, {})|0", other_str, factor))
    }

    // ========================================================================
    // Instruction dispatch
    // ========================================================================

    pub(crate) fn generate_expression(
        &mut self,
        inst: &'ir Instruction,
        code: &mut String,
    ) -> Result<(), CodegenError> {
        if let Type::Int(width) = inst.ty {
            if width > 32 {
                return Err(CodegenError::integer_too_wide(format!(
                    "i{} result reached the backend; 64-bit ops must be split upstream",
                    width
                )));
            }
        }
        let mut text = String::new();
        if !self.generate_simd_expression(inst, &mut text)? {
            match self.scalar_expression_text(inst)? {
                Some(scalar) => text = scalar,
                None => return Ok(()),
            }
        }
        if text.is_empty() {
            return Ok(());
        }
        code.push_str(&text);
        code.push(';');
        if let Some(debug) = &inst.debug {
            if debug.line > 0 {
                let file = if debug.file.is_empty() {
                    "?"
                } else {
                    debug.file.as_str()
                };
                code.push_str(&format!(" //@line {} \"{}\"", debug.line, file));
            }
        }
        code.push('\n');
        Ok(())
    }

    /// Lowers one scalar instruction; `None` means nothing is emitted at
    /// all (nativized allocas, ignored calls).
    fn scalar_expression_text(
        &mut self,
        inst: &'ir Instruction,
    ) -> Result<Option<String>, CodegenError> {
        let text = match &inst.kind {
            InstKind::Binary { op, lhs, rhs } => {
                let assign = self.assign_if_needed(inst)?;
                let body = self.binary_text(inst, *op, lhs, rhs)?;
                format!("{}{}", assign, body)
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let sign = if pred.is_unsigned() {
                    ASM_UNSIGNED
                } else {
                    ASM_SIGNED
                };
                let operator = match pred {
                    IntPredicate::Eq => "==",
                    IntPredicate::Ne => "!=",
                    IntPredicate::Ule | IntPredicate::Sle => "<=",
                    IntPredicate::Uge | IntPredicate::Sge => ">=",
                    IntPredicate::Ult | IntPredicate::Slt => "<",
                    IntPredicate::Ugt | IntPredicate::Sgt => ">",
                };
                let assign = self.assign_if_needed(inst)?;
                format!(
                    "{}({}){}({})",
                    assign,
                    self.value_as_cast_str(lhs, sign)?,
                    operator,
                    self.value_as_cast_str(rhs, sign)?
                )
            }
            InstKind::FCmp { pred, lhs, rhs } => {
                let assign = self.assign_if_needed(inst)?;
                format!("{}{}", assign, self.scalar_fcmp_text(*pred, lhs, rhs)?)
            }
            InstKind::Cast { op, value } => {
                let assign = self.assign_if_needed(inst)?;
                let body = self.cast_text(inst, *op, value)?;
                format!("{}{}", assign, body)
            }
            InstKind::Select {
                cond,
                then_value,
                else_value,
            } => {
                let assign = self.assign_if_needed(inst)?;
                format!(
                    "{}{} ? {} : {}",
                    assign,
                    self.value_str(cond, ASM_SIGNED)?,
                    self.value_str(then_value, ASM_SIGNED)?,
                    self.value_str(else_value, ASM_SIGNED)?
                )
            }
            InstKind::Alloca { .. } => return self.alloca_text(inst),
            InstKind::Load { ptr, align, volatile } => {
                if let Stripped::Value(id) = self.strip_operand(ptr) {
                    if self.frame.is_nativized(id) {
                        let assign = self.get_assign(inst)?;
                        let source = self.value_str(ptr, ASM_SIGNED)?;
                        return Ok(Some(format!("{}{}", assign, source)));
                    }
                }
                self.get_load(inst, ptr, &inst.ty, *align, *volatile)?
            }
            InstKind::Store {
                ptr,
                value,
                align,
                volatile,
            } => {
                let value_ty = self.operand_ty(value)?;
                if let Type::Int(width) = value_ty {
                    if width > 32 {
                        return Err(CodegenError::integer_too_wide(format!(
                            "storing an i{} value; 64-bit ops must be split upstream",
                            width
                        )));
                    }
                }
                let value_text = self.value_str(value, ASM_SIGNED)?;
                if let Stripped::Value(id) = self.strip_operand(ptr) {
                    if self.frame.is_nativized(id) {
                        let target = self.value_str(ptr, ASM_SIGNED)?;
                        return Ok(Some(format!("{} = {}", target, value_text)));
                    }
                }
                self.get_store(inst, ptr, &value_ty, &value_text, *align, *volatile)?
            }
            InstKind::Gep { base, indices } => {
                let assign = self.assign_if_needed(inst)?;
                let body = self.gep_text(base, indices)?;
                format!("{}{}", assign, body)
            }
            InstKind::Call { .. } => match self.handle_call(inst)? {
                Some(call) => call,
                None => return Ok(None),
            },
            InstKind::Phi { .. } => return Ok(None), // resolved on the edges
            InstKind::AtomicRmw { op, ptr, value } => {
                self.atomic_rmw_text(inst, *op, ptr, value)?
            }
            InstKind::Fence => {
                if self.em.config.enable_pthreads {
                    "Atomics_fence()".to_owned()
                } else {
                    // No threads, so nothing to order against.
                    "/* fence */".to_owned()
                }
            }
            InstKind::ExtractElement { .. }
            | InstKind::InsertElement { .. }
            | InstKind::ShuffleVector { .. } => {
                return Err(CodegenError::unsupported_instruction(
                    "vector instruction on a non-vector type",
                ));
            }
        };
        Ok(Some(text))
    }

    fn binary_text(
        &mut self,
        inst: &'ir Instruction,
        op: BinOp,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        Ok(match op {
            BinOp::Add | BinOp::Sub => {
                let operator = if op == BinOp::Add { "+" } else { "-" };
                let body = format!(
                    "{} {} {}",
                    self.value_as_paren_str(lhs)?,
                    operator,
                    self.value_as_paren_str(rhs)?
                );
                self.get_paren_cast(&body, &inst.ty, ASM_SIGNED)?
            }
            BinOp::Mul => self.imul(lhs, rhs)?,
            BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem => {
                let sign = if matches!(op, BinOp::SDiv | BinOp::SRem) {
                    ASM_SIGNED
                } else {
                    ASM_UNSIGNED
                };
                let operator = if matches!(op, BinOp::UDiv | BinOp::SDiv) {
                    " / "
                } else {
                    " % "
                };
                format!(
                    "({}{}{})&-1",
                    self.value_as_cast_paren_str(lhs, sign)?,
                    operator,
                    self.value_as_cast_paren_str(rhs, sign)?
                )
            }
            BinOp::And => format!(
                "{} & {}",
                self.value_str(lhs, ASM_SIGNED)?,
                self.value_str(rhs, ASM_SIGNED)?
            ),
            BinOp::Or => format!(
                "{} | {}",
                self.value_str(lhs, ASM_SIGNED)?,
                self.value_str(rhs, ASM_SIGNED)?
            ),
            BinOp::Xor => format!(
                "{} ^ {}",
                self.value_str(lhs, ASM_SIGNED)?,
                self.value_str(rhs, ASM_SIGNED)?
            ),
            BinOp::Shl => {
                let mut shifted = format!(
                    "{} << {}",
                    self.value_str(lhs, ASM_SIGNED)?,
                    self.value_str(rhs, ASM_SIGNED)?
                );
                if inst.ty.int_width().map(|w| w < 32).unwrap_or(false) {
                    // Drop bits shifted beyond the width of this value.
                    shifted = self.get_paren_cast(&shifted, &inst.ty, ASM_UNSIGNED)?;
                }
                shifted
            }
            BinOp::AShr | BinOp::LShr => {
                let mut input = self.value_str(lhs, ASM_SIGNED)?;
                if inst.ty.int_width().map(|w| w < 32).unwrap_or(false) {
                    // Fill in the high bits; the shift itself is 32-bit.
                    let sign = if op == BinOp::AShr {
                        ASM_SIGNED
                    } else {
                        ASM_UNSIGNED
                    };
                    input = format!("({})", self.get_cast(&input, &inst.ty, sign)?);
                }
                let operator = if op == BinOp::AShr { " >> " } else { " >>> " };
                format!("{}{}{}", input, operator, self.value_str(rhs, ASM_SIGNED)?)
            }
            BinOp::FAdd | BinOp::FMul | BinOp::FDiv | BinOp::FRem => {
                let operator = match op {
                    BinOp::FAdd => " + ",
                    BinOp::FMul => " * ",
                    BinOp::FDiv => " / ",
                    _ => " % ",
                };
                let body = format!(
                    "{}{}{}",
                    self.value_str(lhs, ASM_SIGNED)?,
                    operator,
                    self.value_str(rhs, ASM_SIGNED)?
                );
                self.ensure_float_ty(body, &inst.ty)
            }
            BinOp::FSub => {
                // fneg(x) arrives as -0.0 - x.
                if is_negative_zero(lhs) {
                    let body = format!("-{}", self.value_str(rhs, ASM_SIGNED)?);
                    self.ensure_float_ty(body, &inst.ty)
                } else {
                    let body = format!(
                        "{} - {}",
                        self.value_str(lhs, ASM_SIGNED)?,
                        self.value_str(rhs, ASM_SIGNED)?
                    );
                    self.ensure_float_ty(body, &inst.ty)
                }
            }
        })
    }

    fn scalar_fcmp_text(
        &mut self,
        pred: FloatPredicate,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let a = self.value_str(lhs, ASM_SIGNED)?;
        let b = self.value_str(rhs, ASM_SIGNED)?;
        Ok(match pred {
            // Comparisons which are simple JS operators.
            FloatPredicate::Oeq => format!("{} == {}", a, b),
            FloatPredicate::Une => format!("{} != {}", a, b),
            FloatPredicate::Ogt => format!("{} > {}", a, b),
            FloatPredicate::Oge => format!("{} >= {}", a, b),
            FloatPredicate::Olt => format!("{} < {}", a, b),
            FloatPredicate::Ole => format!("{} <= {}", a, b),
            // Comparisons which are inverses of JS operators.
            FloatPredicate::Ugt => format!("!({} <= {})", a, b),
            FloatPredicate::Uge => format!("!({} < {})", a, b),
            FloatPredicate::Ult => format!("!({} >= {})", a, b),
            FloatPredicate::Ule => format!("!({} > {})", a, b),
            // Comparisons which require explicit NaN checks.
            FloatPredicate::Ueq => format!(
                "({} != {}) | ({} != {}) | ({} == {})",
                a, a, b, b, a, b
            ),
            FloatPredicate::One => format!(
                "({} == {}) & ({} == {}) & ({} != {})",
                a, a, b, b, a, b
            ),
            // Simple NaN checks.
            FloatPredicate::Ord => format!("({} == {}) & ({} == {})", a, a, b, b),
            FloatPredicate::Uno => format!("({} != {}) | ({} != {})", a, a, b, b),
            // Simple constants.
            FloatPredicate::False => "0".to_owned(),
            FloatPredicate::True => "1".to_owned(),
        })
    }

    fn cast_text(
        &mut self,
        inst: &'ir Instruction,
        op: CastOp,
        value: &'ir Operand,
    ) -> Result<String, CodegenError> {
        Ok(match op {
            CastOp::Trunc => {
                let out_bits = inst.ty.int_width().ok_or_else(|| {
                    CodegenError::unsupported_instruction("trunc to non-integer")
                })?;
                format!(
                    "{}&{}",
                    self.value_str(value, ASM_SIGNED)?,
                    lsb_mask(out_bits)
                )
            }
            CastOp::SExt => {
                let in_bits = self
                    .operand_ty(value)?
                    .int_width()
                    .ok_or_else(|| CodegenError::unsupported_instruction("sext of non-integer"))?;
                let shift = 32 - in_bits;
                format!(
                    "{} << {} >> {}",
                    self.value_str(value, ASM_SIGNED)?,
                    shift,
                    shift
                )
            }
            CastOp::ZExt => self.value_as_cast_str(value, ASM_UNSIGNED)?,
            CastOp::FPExt => {
                if self.em.config.precise_f32 {
                    format!("+{}", self.value_str(value, ASM_SIGNED)?)
                } else {
                    self.value_str(value, ASM_SIGNED)?
                }
            }
            CastOp::FPTrunc => {
                let body = self.value_str(value, ASM_SIGNED)?;
                self.ensure_float_ty(body, &inst.ty)
            }
            CastOp::SIToFP => {
                let inner = self.value_as_cast_paren_str(value, ASM_SIGNED)?;
                format!("({})", self.get_cast(&inner, &inst.ty, ASM_SIGNED)?)
            }
            CastOp::UIToFP => {
                let inner = self.value_as_cast_paren_str(value, ASM_UNSIGNED)?;
                format!("({})", self.get_cast(&inner, &inst.ty, ASM_SIGNED)?)
            }
            CastOp::FPToSI => {
                format!("({})", Self::double_to_int(&self.value_as_paren_str(value)?))
            }
            CastOp::FPToUI => {
                let inner = Self::double_to_int(&self.value_as_paren_str(value)?);
                format!("({})", self.get_cast(&inner, &inst.ty, ASM_UNSIGNED)?)
            }
            CastOp::PtrToInt | CastOp::IntToPtr => self.value_str(value, ASM_SIGNED)?,
            CastOp::Bitcast => {
                let from_ty = self.operand_ty(value)?;
                let text = self.value_str(value, ASM_SIGNED)?;
                self.bitcast_text(text, &from_ty, &inst.ty)?
            }
        })
    }

    /// Same-width reinterpretation. Int/float transmutes go through memory
    /// at the `tempDoublePtr` scratch slot.
    pub(crate) fn bitcast_text(
        &self,
        value: String,
        from_ty: &Type,
        to_ty: &Type,
    ) -> Result<String, CodegenError> {
        if from_ty.is_integer() && to_ty.is_floating_point() {
            if from_ty.int_width() != Some(32) {
                return Err(CodegenError::unsupported_instruction(
                    "bitcast of a non-32-bit integer to float",
                ));
            }
            let read = self.get_cast("HEAPF32[tempDoublePtr>>2]", &Type::Float, ASM_SIGNED)?;
            return Ok(format!("(HEAP32[tempDoublePtr>>2]={},{})", value, read));
        }
        if from_ty.is_floating_point() && to_ty.is_integer() {
            if to_ty.int_width() != Some(32) {
                return Err(CodegenError::unsupported_instruction(
                    "bitcast of a float to a non-32-bit integer",
                ));
            }
            return Ok(format!(
                "(HEAPF32[tempDoublePtr>>2]={},HEAP32[tempDoublePtr>>2]|0)",
                value
            ));
        }
        Ok(value)
    }

    fn alloca_text(&mut self, inst: &'ir Instruction) -> Result<Option<String>, CodegenError> {
        let InstKind::Alloca {
            allocated,
            count,
            align,
        } = &inst.kind
        else {
            unreachable!()
        };
        // The stack pointer is restored on return even when every slot was
        // nativized; nativized slots still count into the frame size.
        self.stack_bumped = true;

        if self.frame.is_nativized(inst.id) {
            let name = self.local_name(inst.id)?;
            self.used_vars.insert(name, allocated.clone());
            return Ok(None);
        }

        if let Some(offset) = self.frame.frame_offset(inst.id) {
            if self.frame.representative(inst.id) != inst.id {
                // Another alloca carries the storage and the assignment.
                return Ok(None);
            }
            let mut text = self.get_assign(inst)?;
            if self.frame.max_alignment() <= STACK_ALIGN {
                text.push_str("sp");
            } else {
                text.push_str("sp_a"); // aligned base of the frame
            }
            if offset != 0 {
                text.push_str(&format!(" + {}|0", offset));
            }
            return Ok(Some(text));
        }

        // Dynamic alloca: bump the stack at run time.
        if *align > STACK_ALIGN {
            return Err(CodegenError::unsupported_instruction(format!(
                "dynamic alloca with alignment {} above the stack alignment",
                align
            )));
        }
        let dl = &self.em.module.data_layout;
        let base_size = dl.type_alloc_size(allocated);
        let size = match count.as_const_int() {
            Some(n) => stack_align(base_size as u64 * n as u64).to_string(),
            None => {
                let dynamic = format!("(({}*{})|0)", base_size, self.value_str(count, ASM_SIGNED)?);
                stack_align_str(&dynamic)
            }
        };
        let assign = self.get_assign(inst)?;
        Ok(Some(format!(
            "{}STACKTOP; {}",
            assign,
            self.stack_bump(&size)
        )))
    }

    fn gep_text(
        &mut self,
        base: &'ir Operand,
        indices: &'ir [Operand],
    ) -> Result<String, CodegenError> {
        let dl = &self.em.module.data_layout;
        let mut constant_offset: i64 = 0;
        let mut text = String::new();

        // A statically laid-out global base folds to a plain address.
        let mut folded = false;
        if !self.em.config.relocatable {
            if let Stripped::Con(Constant::Global(name)) = self.strip_operand(base) {
                let has_init = self
                    .em
                    .module
                    .find_global(name)
                    .map(|g| g.init.is_some())
                    .unwrap_or(false);
                if has_init {
                    constant_offset = self.em.layout.absolute_address(name)? as i64;
                    folded = true;
                }
            }
        }
        if !folded {
            text = self.value_as_paren_str(base)?;
        }

        let base_ty = self.operand_ty(base)?;
        let pointee = base_ty
            .pointee()
            .cloned()
            .ok_or_else(|| CodegenError::unsupported_instruction("GEP base is not a pointer"))?;
        let mut walk = GepWalk::new(pointee);
        for (position, index) in indices.iter().enumerate() {
            if let Some(value) = index.as_const_int() {
                constant_offset += walk.step(dl, position, value)?;
            } else {
                // Flush the accumulated offset first; reassociating the adds
                // would widen the window for slow wraparounds.
                text = add_offset(&text, constant_offset as i32);
                constant_offset = 0;
                let element_size = walk.element_size_for(dl, position)?;
                let scaled = self.imul_with_const(index, element_size as i64)?;
                text = if text.is_empty() {
                    scaled
                } else {
                    format!("({} + ({})|0)", text, scaled)
                };
                walk.step_dynamic(position)?;
            }
        }
        Ok(add_offset(&text, constant_offset as i32))
    }
}

fn is_negative_zero(op: &Operand) -> bool {
    match op.as_const() {
        Some(Constant::Float(v)) => v.to_bits() == 0x8000_0000,
        Some(Constant::Double(v)) => v.to_bits() == 0x8000_0000_0000_0000,
        _ => false,
    }
}

pub(crate) fn stack_align(size: u64) -> u64 {
    (size + STACK_ALIGN as u64 - 1) & !(STACK_ALIGN as u64 - 1)
}

pub(crate) fn stack_align_str(size: &str) -> String {
    format!("(({}+{})&-{})", size, STACK_ALIGN - 1, STACK_ALIGN)
}

//! Vector (SIMD.js) lowering.
//!
//! Vector types map to 128-bit SIMD.js types by element intness and width;
//! narrower vectors are padded with zero lanes, and comparison results
//! (vectors of i1) borrow the lane width of the compare that produced them.

use crate::codegen::control_flow::FunctionLowerer;
use crate::codegen::expr::{ASM_FORCE_FLOAT_AS_INTBITS, ASM_SIGNED};
use crate::diagnostics::CodegenError;
use crate::ir::{
    BinOp, CastOp, Constant, FloatPredicate, InstKind, Instruction, IntPredicate, Operand, Type,
};

pub(crate) fn ensure_float(value: String, wrap: bool) -> String {
    if wrap {
        format!("Math_fround({})", value)
    } else {
        value
    }
}

pub(crate) fn element_bits(elem: &Type) -> Result<u32, CodegenError> {
    match elem {
        Type::Int(width) => Ok(*width),
        Type::Float => Ok(32),
        Type::Double => Ok(64),
        Type::Ptr(_) => Ok(32),
        other => Err(CodegenError::unsupported_vector_type(format!(
            "unsupported vector element type {:?}",
            other
        ))),
    }
}

/// Lane width used for the SIMD.js type. Bit vectors (i1 lanes) take the
/// width of the integer vector they came from.
fn actual_primitive_bits(ty: &Type) -> Result<u32, CodegenError> {
    let Some((elem, lanes)) = ty.vector_parts() else {
        return Err(CodegenError::unsupported_vector_type(format!(
            "expected a vector type, got {:?}",
            ty
        )));
    };
    let mut bits = element_bits(elem)?;
    if elem.is_integer() && bits == 1 {
        bits = 128 / lanes;
    }
    if bits == 0 || 128 % bits != 0 {
        return Err(CodegenError::unsupported_vector_type(format!(
            "cannot map {}-bit lanes onto a 128-bit vector",
            bits
        )));
    }
    Ok(bits)
}

/// The SIMD.js type name for a vector type, e.g. `Int32x4` or `Float64x2`.
pub(crate) fn simd_type(ty: &Type) -> Result<String, CodegenError> {
    let Some((elem, _)) = ty.vector_parts() else {
        return Err(CodegenError::unsupported_vector_type(format!(
            "expected a vector type, got {:?}",
            ty
        )));
    };
    let bits = actual_primitive_bits(ty)?;
    let lanes = 128 / bits;
    let prefix = if elem.is_integer() || elem.is_pointer() {
        "Int"
    } else {
        "Float"
    };
    Ok(format!("{}{}x{}", prefix, bits, lanes))
}

/// Lane count after padding to 128 bits.
pub(crate) fn padded_lane_count(ty: &Type) -> Result<u32, CodegenError> {
    Ok(128 / actual_primitive_bits(ty)?)
}

fn bool_vec_to_int_vec(lanes: u32, value: &str) -> String {
    let width = 128 / lanes;
    let simd = format!("SIMD_Int{}x{}", width, lanes);
    format!(
        "{}_select({}, {}_splat(-1), {}_splat(0))",
        simd, value, simd, simd
    )
}

fn int_vec_to_bool_vec(lanes: u32, value: &str) -> String {
    let width = 128 / lanes;
    let simd = format!("SIMD_Int{}x{}", width, lanes);
    format!("{}_notEqual({}, {}_splat(0))", simd, value, simd)
}

/// Where a vector's per-lane splat value came from.
enum SplatSource<'ir> {
    Op(&'ir Operand),
    Con(&'ir Constant),
    Zero,
}

impl<'a, 'ir> FunctionLowerer<'a, 'ir> {
    /// Reinterprets between vector types. Bool vectors widen through a
    /// select; everything else goes through `fromXxxBits`.
    pub(crate) fn simd_cast(
        &mut self,
        from: &Type,
        to: &Type,
        value: String,
    ) -> Result<String, CodegenError> {
        let (from_elem, from_lanes) = from.vector_parts().ok_or_else(|| {
            CodegenError::unsupported_vector_type("SIMD cast from a non-vector")
        })?;
        let (to_elem, to_lanes) = to
            .vector_parts()
            .ok_or_else(|| CodegenError::unsupported_vector_type("SIMD cast to a non-vector"))?;
        let from_int = from_elem.is_integer() || from_elem.is_pointer();
        let to_int = to_elem.is_integer() || to_elem.is_pointer();
        let from_bits = element_bits(from_elem)?;
        let to_bits = element_bits(to_elem)?;
        if from_int == to_int && from_bits == to_bits {
            return Ok(value);
        }
        let from_is_bool = from_int && from_bits == 1;
        let to_is_bool = to_int && to_bits == 1;
        if from_is_bool && !to_is_bool {
            return Ok(bool_vec_to_int_vec(128 / to_bits, &value));
        }
        if from_bits * from_lanes != to_bits * to_lanes && !from_is_bool && !to_is_bool {
            return Err(CodegenError::unsupported_vector_type(
                "SIMD cast between items of different bit sizes",
            ));
        }
        Ok(format!(
            "SIMD_{}_from{}Bits({})",
            simd_type(to)?,
            simd_type(from)?,
            value
        ))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Lowers a vector-producing or vector-consuming instruction. Returns
    /// false when the instruction is not SIMD (or is a call, which takes the
    /// ordinary path and simply carries a SIMD value).
    pub(crate) fn generate_simd_expression(
        &mut self,
        inst: &'ir Instruction,
        out: &mut String,
    ) -> Result<bool, CodegenError> {
        if inst.ty.is_vector() {
            self.em.check_vector_type(&inst.ty)?;
            let simd = simd_type(&inst.ty)?;
            match &inst.kind {
                InstKind::Call { .. } => return Ok(false),
                InstKind::ICmp { pred, lhs, rhs } => {
                    let text = self.vector_icmp(inst, *pred, lhs, rhs)?;
                    out.push_str(&text);
                }
                InstKind::FCmp { pred, lhs, rhs } => {
                    let text = self.vector_fcmp(inst, *pred, lhs, rhs)?;
                    out.push_str(&text);
                }
                InstKind::Cast {
                    op: CastOp::SExt | CastOp::Bitcast | CastOp::SIToFP,
                    value,
                } => {
                    let from = self.operand_ty(value)?;
                    let assign = self.assign_if_needed(inst)?;
                    let inner = self.value_str(value, ASM_SIGNED)?;
                    let cast = self.simd_cast(&from, &inst.ty, inner)?;
                    out.push_str(&format!("{}{}", assign, cast));
                }
                InstKind::Select {
                    cond,
                    then_value,
                    else_value,
                } => {
                    if !self.operand_ty(cond)?.is_vector() {
                        // Scalar condition: plain ?: handles it.
                        return Ok(false);
                    }
                    // i1 lanes are represented as sign-extended integers, so
                    // selecting on them is an elementwise select.
                    let assign = self.assign_if_needed(inst)?;
                    out.push_str(&format!(
                        "{}SIMD_{}_select({},{},{})",
                        assign,
                        simd,
                        self.value_str(cond, ASM_SIGNED)?,
                        self.value_str(then_value, ASM_SIGNED)?,
                        self.value_str(else_value, ASM_SIGNED)?
                    ));
                }
                InstKind::Binary { op, lhs, rhs } => {
                    let text = self.vector_binary(inst, &simd, *op, lhs, rhs)?;
                    out.push_str(&text);
                }
                InstKind::Load { ptr, .. } => {
                    let (elem, lanes) = inst.ty.vector_parts().unwrap();
                    let load = if element_bits(elem)? == 32 {
                        match lanes {
                            1 => "_load1",
                            2 => "_load2",
                            3 => "_load3",
                            _ => "_load",
                        }
                    } else {
                        "_load"
                    };
                    let assign = self.assign_if_needed(inst)?;
                    out.push_str(&format!(
                        "{}SIMD_{}{}(HEAPU8, {})",
                        assign,
                        simd,
                        load,
                        self.value_str(ptr, ASM_SIGNED)?
                    ));
                }
                InstKind::InsertElement { .. } => {
                    let text = self.insert_element_expression(inst)?;
                    out.push_str(&text);
                }
                InstKind::ShuffleVector { .. } => {
                    let text = self.shuffle_vector_expression(inst)?;
                    out.push_str(&text);
                }
                InstKind::Phi { .. } => {
                    // Resolved on the incoming edges.
                }
                _ => {
                    return Err(CodegenError::unsupported_instruction(format!(
                        "invalid vector instruction {:?}",
                        inst.kind
                    )));
                }
            }
            return Ok(true);
        }

        // Vector-consuming instructions with scalar (or void) results.
        match &inst.kind {
            InstKind::Store { ptr, value, .. } => {
                let value_ty = self.operand_ty(value)?;
                if !value_ty.is_vector() {
                    return Ok(false);
                }
                self.em.check_vector_type(&value_ty)?;
                let simd = simd_type(&value_ty)?;
                let (elem, lanes) = value_ty.vector_parts().unwrap();
                let store = if element_bits(elem)? == 32 {
                    match lanes {
                        1 => "_store1",
                        2 => "_store2",
                        3 => "_store3",
                        _ => "_store",
                    }
                } else {
                    "_store"
                };
                // The address is computed once into a temp so the store
                // expression stays simple.
                let temp = format!("temp_{}_ptr", simd);
                let ptr_ty = self.operand_ty(ptr)?;
                let assign = self.ad_hoc_assign(&temp, &ptr_ty)?;
                let value_text = self.value_str(value, ASM_SIGNED)?;
                out.push_str(&format!(
                    "{}{};SIMD_{}{}(HEAPU8, {}, {})",
                    assign,
                    self.value_str(ptr, ASM_SIGNED)?,
                    simd,
                    store,
                    temp,
                    value_text
                ));
                Ok(true)
            }
            InstKind::ExtractElement { vector, index } => {
                let vec_ty = self.operand_ty(vector)?;
                self.em.check_vector_type(&vec_ty)?;
                let Some(lane) = index.as_const_int() else {
                    return Err(CodegenError::unsupported_instruction(
                        "SIMD extract element with non-constant index",
                    ));
                };
                let assign = self.assign_if_needed(inst)?;
                let extract = format!(
                    "SIMD_{}_extractLane({},{})",
                    simd_type(&vec_ty)?,
                    self.value_str(vector, ASM_SIGNED)?,
                    lane
                );
                out.push_str(&format!(
                    "{}{}",
                    assign,
                    self.get_cast(&extract, &inst.ty, ASM_SIGNED)?
                ));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn vector_binary(
        &mut self,
        inst: &'ir Instruction,
        simd: &str,
        op: BinOp,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let simple = |this: &mut Self, name: &str| -> Result<String, CodegenError> {
            let assign = this.assign_if_needed(inst)?;
            Ok(format!(
                "{}SIMD_{}_{}({},{})",
                assign,
                simd,
                name,
                this.value_str(lhs, ASM_SIGNED)?,
                this.value_str(rhs, ASM_SIGNED)?
            ))
        };
        match op {
            BinOp::Add | BinOp::FAdd => simple(self, "add"),
            BinOp::Sub => simple(self, "sub"),
            BinOp::Mul | BinOp::FMul => simple(self, "mul"),
            BinOp::FDiv => simple(self, "div"),
            BinOp::And => simple(self, "and"),
            BinOp::Or => simple(self, "or"),
            BinOp::Xor => {
                // not(x) arrives as x ^ all-ones.
                if is_all_ones_vector(rhs) {
                    let assign = self.assign_if_needed(inst)?;
                    Ok(format!(
                        "{}SIMD_{}_not({})",
                        assign,
                        simd,
                        self.value_str(lhs, ASM_SIGNED)?
                    ))
                } else {
                    simple(self, "xor")
                }
            }
            BinOp::FSub => {
                // fneg(x) arrives as -0.0 - x.
                if is_negative_zero_vector(lhs) {
                    let assign = self.assign_if_needed(inst)?;
                    Ok(format!(
                        "{}SIMD_{}_neg({})",
                        assign,
                        simd,
                        self.value_str(rhs, ASM_SIGNED)?
                    ))
                } else {
                    simple(self, "sub")
                }
            }
            BinOp::SDiv | BinOp::UDiv | BinOp::SRem | BinOp::URem => {
                // The SIMD API has no integer division; unroll to scalars,
                // which is what hardware would do anyway.
                self.unrolled_expression(inst, op, lhs, rhs)
            }
            BinOp::AShr | BinOp::LShr | BinOp::Shl => self.shift_expression(inst, op, lhs, rhs),
            BinOp::FRem => Err(CodegenError::unsupported_instruction(
                "vector frem has no SIMD lowering",
            )),
        }
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    fn vector_icmp(
        &mut self,
        inst: &'ir Instruction,
        pred: IntPredicate,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let (name, invert) = match pred {
            IntPredicate::Eq => ("equal", false),
            IntPredicate::Ne => ("equal", true),
            IntPredicate::Sle => ("greaterThan", true),
            IntPredicate::Sge => ("lessThan", true),
            IntPredicate::Ule => ("unsignedLessThanOrEqual", false),
            IntPredicate::Uge => ("unsignedGreaterThanOrEqual", false),
            IntPredicate::Ult => ("unsignedLessThan", false),
            IntPredicate::Slt => ("lessThan", false),
            IntPredicate::Ugt => ("unsignedGreaterThan", false),
            IntPredicate::Sgt => ("greaterThan", false),
        };
        let operand_simd = simd_type(&self.operand_ty(lhs)?)?;
        let assign = self.assign_if_needed(inst)?;
        let compare = format!(
            "SIMD_{}_{}({},{})",
            operand_simd,
            name,
            self.value_str(lhs, ASM_SIGNED)?,
            self.value_str(rhs, ASM_SIGNED)?
        );
        if invert {
            let result_simd = simd_type(&inst.ty)?;
            Ok(format!("{}SIMD_{}_not({})", assign, result_simd, compare))
        } else {
            Ok(format!("{}{}", assign, compare))
        }
    }

    fn vector_fcmp(
        &mut self,
        inst: &'ir Instruction,
        pred: FloatPredicate,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let result_simd = simd_type(&inst.ty)?;
        let lanes = inst
            .ty
            .vector_parts()
            .map(|(_, lanes)| lanes)
            .unwrap_or(4);
        let operand_simd = simd_type(&self.operand_ty(lhs)?)?;
        let assign = self.assign_if_needed(inst)?;

        let a = self.value_str(lhs, ASM_SIGNED)?;
        let b = self.value_str(rhs, ASM_SIGNED)?;
        let cmp = |name: &str, x: &str, y: &str| {
            format!("SIMD_{}_{}({},{})", operand_simd, name, x, y)
        };

        // The ordered/unordered composites are synthesized from
        // equality-with-self NaN checks.
        let composed = match pred {
            FloatPredicate::False => {
                return Ok(format!(
                    "{}SIMD_{}_splat({})",
                    assign,
                    result_simd,
                    ensure_float("0".to_owned(), true)
                ));
            }
            FloatPredicate::True => {
                return Ok(format!(
                    "{}SIMD_{}_splat({})",
                    assign,
                    result_simd,
                    ensure_float("-1".to_owned(), true)
                ));
            }
            FloatPredicate::One => Some((
                "and",
                vec![
                    bool_vec_to_int_vec(lanes, &cmp("equal", &a, &a)),
                    bool_vec_to_int_vec(lanes, &cmp("equal", &b, &b)),
                    bool_vec_to_int_vec(lanes, &cmp("notEqual", &a, &b)),
                ],
            )),
            FloatPredicate::Ueq => Some((
                "or",
                vec![
                    bool_vec_to_int_vec(lanes, &cmp("notEqual", &a, &a)),
                    bool_vec_to_int_vec(lanes, &cmp("notEqual", &b, &b)),
                    bool_vec_to_int_vec(lanes, &cmp("equal", &a, &b)),
                ],
            )),
            FloatPredicate::Ord => Some((
                "and",
                vec![
                    bool_vec_to_int_vec(lanes, &cmp("equal", &a, &a)),
                    bool_vec_to_int_vec(lanes, &cmp("equal", &b, &b)),
                ],
            )),
            FloatPredicate::Uno => Some((
                "or",
                vec![
                    bool_vec_to_int_vec(lanes, &cmp("notEqual", &a, &a)),
                    bool_vec_to_int_vec(lanes, &cmp("notEqual", &b, &b)),
                ],
            )),
            _ => None,
        };
        if let Some((joiner, terms)) = composed {
            let mut combined = terms[0].clone();
            for term in &terms[1..] {
                combined = format!("SIMD_{}_{}({},{})", result_simd, joiner, combined, term);
            }
            return Ok(format!(
                "{}{}",
                assign,
                int_vec_to_bool_vec(lanes, &combined)
            ));
        }

        let (name, invert) = match pred {
            FloatPredicate::Oeq => ("equal", false),
            FloatPredicate::Ogt => ("greaterThan", false),
            FloatPredicate::Oge => ("greaterThanOrEqual", false),
            FloatPredicate::Olt => ("lessThan", false),
            FloatPredicate::Ole => ("lessThanOrEqual", false),
            FloatPredicate::Ugt => ("lessThanOrEqual", true),
            FloatPredicate::Uge => ("lessThan", true),
            FloatPredicate::Ult => ("greaterThanOrEqual", true),
            FloatPredicate::Ule => ("greaterThan", true),
            FloatPredicate::Une => ("notEqual", false),
            _ => {
                return Err(CodegenError::unsupported_instruction(
                    "invalid vector fcmp predicate",
                ));
            }
        };
        let compare = cmp(name, &a, &b);
        if invert {
            Ok(format!("{}SIMD_{}_not({})", assign, result_simd, compare))
        } else {
            Ok(format!("{}{}", assign, compare))
        }
    }

    // ========================================================================
    // Element inserts, extracts, shuffles
    // ========================================================================

    /// Vector construction arrives as chains of single-use insertelement
    /// instructions; only the base of a chain emits code, as a splat, a
    /// constructor call, or a series of lane replacements.
    fn insert_element_expression(
        &mut self,
        inst: &'ir Instruction,
    ) -> Result<String, CodegenError> {
        let InstKind::InsertElement { vector, .. } = &inst.kind else {
            unreachable!()
        };

        // Part of a larger chain, or feeding a splat-shuffle: handled when
        // the chain's last insert (or the shuffle) is reached.
        let users = self.users_of(inst.id);
        if users.len() == 1 {
            if let Some(user) = self.def(users[0]) {
                if matches!(user.kind, InstKind::InsertElement { .. }) {
                    return Ok(String::new());
                }
                if let InstKind::ShuffleVector { mask, .. } = &user.kind {
                    let feeds_splat = mask.iter().all(|&m| m == 0)
                        && !matches!(
                            vector,
                            Operand::Value(id) if self
                                .def(*id)
                                .map(|d| matches!(d.kind, InstKind::InsertElement { .. }))
                                .unwrap_or(false)
                        );
                    if feeds_splat {
                        if let InstKind::InsertElement { index, .. } = &inst.kind {
                            if index.as_const_int() == Some(0) {
                                return Ok(String::new());
                            }
                        }
                    }
                }
            }
        }

        let (elem_ty, lanes) = inst.ty.vector_parts().unwrap();
        let elem_is_float = !elem_ty.is_integer() && !elem_ty.is_pointer();
        let lanes = lanes as usize;
        let simd = simd_type(&inst.ty)?;

        // Walk the chain, collecting the inserted element per lane.
        let mut operands: Vec<Option<&'ir Operand>> = vec![None; lanes];
        let mut inserted = 0usize;
        let mut splat: Option<&'ir Operand> = None;
        let mut current = inst;
        let base: &'ir Operand;
        loop {
            let InstKind::InsertElement {
                vector,
                element,
                index,
            } = &current.kind
            else {
                unreachable!()
            };
            let Some(lane) = index.as_const_int() else {
                return Err(CodegenError::unsupported_instruction(
                    "insertelement with non-constant index",
                ));
            };
            let lane = lane as usize;
            if lane >= lanes {
                return Err(CodegenError::unsupported_instruction(
                    "insertelement lane out of range",
                ));
            }
            if operands[lane].is_none() {
                inserted += 1;
                operands[lane] = Some(element);
                match splat {
                    None if inserted == 1 => splat = Some(element),
                    Some(existing) if existing == element => {}
                    _ => splat = None,
                }
            }
            match vector {
                Operand::Value(id)
                    if self.users_of(*id).len() == 1
                        && self
                            .def(*id)
                            .map(|d| matches!(d.kind, InstKind::InsertElement { .. }))
                            .unwrap_or(false) =>
                {
                    current = self.def(*id).unwrap();
                }
                other => {
                    base = other;
                    break;
                }
            }
        }

        let assign = self.assign_if_needed(inst)?;
        let wrap_lane = |this: &mut Self, op: &'ir Operand| -> Result<String, CodegenError> {
            let text = this.value_str(op, ASM_SIGNED)?;
            // The lane constructors require actual float32 values even when
            // the module is not otherwise precise about floats.
            Ok(ensure_float(
                text,
                elem_is_float && !this.em.config.precise_f32 && *elem_ty == Type::Float,
            ))
        };

        if inserted == lanes {
            if let Some(splat) = splat {
                let operand = wrap_lane(self, splat)?;
                return Ok(format!("{}SIMD_{}_splat({})", assign, simd, operand));
            }
            let mut text = format!("{}SIMD_{}(", assign, simd);
            for lane in 0..lanes {
                if lane != 0 {
                    text.push_str(", ");
                }
                let operand = operands[lane].expect("all lanes inserted");
                text.push_str(&wrap_lane(self, operand)?);
            }
            text.push(')');
            return Ok(text);
        }

        // Partial chain: replace lanes on top of the base value.
        let mut result = self.value_str(base, ASM_SIGNED)?;
        for lane in 0..lanes {
            let Some(operand) = operands[lane] else {
                continue;
            };
            let operand = wrap_lane(self, operand)?;
            result = format!("SIMD_{}_replaceLane({},{},{})", simd, result, lane, operand);
        }
        Ok(format!("{}{}", assign, result))
    }

    fn shuffle_vector_expression(
        &mut self,
        inst: &'ir Instruction,
    ) -> Result<String, CodegenError> {
        let InstKind::ShuffleVector { a, b, mask } = &inst.kind else {
            unreachable!()
        };
        let assign = self.assign_if_needed(inst)?;
        let simd = simd_type(&inst.ty)?;
        let (result_elem, _) = inst.ty.vector_parts().unwrap();

        // An insert at lane 0 shuffled with a zero mask is a splat; the
        // insert was skipped, so emit the splat here.
        if mask.iter().all(|&m| m == 0) {
            if let Operand::Value(id) = a {
                if let Some(InstKind::InsertElement { element, index, .. }) =
                    self.def(*id).map(|d| &d.kind)
                {
                    if index.as_const_int() == Some(0) {
                        let mut operand = self.value_str(element, ASM_SIGNED)?;
                        if !self.em.config.precise_f32 && *result_elem == Type::Float {
                            operand = format!("Math_fround({})", operand);
                        }
                        return Ok(format!("{}SIMD_{}_splat({})", assign, simd, operand));
                    }
                }
            }
        }

        let a_text = self.value_str(a, ASM_SIGNED)?;
        let b_text = self.value_str(b, ASM_SIGNED)?;
        let op_ty = self.operand_ty(a)?;
        let (_, op_lanes) = op_ty.vector_parts().ok_or_else(|| {
            CodegenError::unsupported_vector_type("shufflevector of non-vectors")
        })?;
        let op_lanes = op_lanes as i32;
        let ret_padded = padded_lane_count(&inst.ty)? as i32;
        let op_padded = padded_lane_count(&op_ty)? as i32;

        let swizzle_a = mask.iter().all(|&m| m < op_lanes);
        let swizzle_b = mask.iter().all(|&m| !(0..op_lanes).contains(&m));
        if swizzle_a || swizzle_b {
            let source = if swizzle_a { a_text } else { b_text };
            let mut text = format!("{}SIMD_{}_swizzle({}", assign, simd, source);
            for &m in mask {
                let lane = if m < 0 {
                    0
                } else if m < op_lanes {
                    m
                } else {
                    m - op_lanes
                };
                text.push_str(&format!(", {}", lane));
            }
            for _ in mask.len() as i32..ret_padded {
                text.push_str(", 0");
            }
            text.push(')');
            return Ok(text);
        }

        // Fully general two-vector shuffle. Indices into the second operand
        // shift by the padding difference between LLVM and SIMD.js lanes.
        let b_ty = self.operand_ty(b)?;
        let a_cast = self.simd_cast(&op_ty, &inst.ty, a_text)?;
        let b_cast = self.simd_cast(&b_ty, &inst.ty, b_text)?;
        let mut text = format!("{}SIMD_{}_shuffle({}, {}, ", assign, simd, a_cast, b_cast);
        for (position, &m) in mask.iter().enumerate() {
            if position != 0 {
                text.push_str(", ");
            }
            let lane = if m < 0 {
                0
            } else if m < op_lanes {
                m
            } else {
                m + op_padded - op_lanes
            };
            text.push_str(&lane.to_string());
        }
        for _ in mask.len() as i32..ret_padded {
            text.push_str(", 0");
        }
        text.push(')');
        Ok(text)
    }

    // ========================================================================
    // Shifts and unrolled operations
    // ========================================================================

    /// Splat detection for shift counts: a constant splat vector, zero
    /// initializer, or an insertelement chain inserting one value everywhere.
    fn splat_value(&self, op: &'ir Operand) -> Option<SplatSource<'ir>> {
        match op {
            Operand::Const(constant) => match constant {
                Constant::Vector { elems, .. } => {
                    let first = elems.first()?;
                    if elems.iter().all(|e| e == first) {
                        Some(SplatSource::Con(first))
                    } else {
                        None
                    }
                }
                Constant::AggregateZero(_) => Some(SplatSource::Zero),
                _ => None,
            },
            Operand::Value(_) => {
                let ty = self.operand_ty(op).ok()?;
                let (_, lanes) = ty.vector_parts()?;
                let mut result: Option<&'ir Operand> = None;
                for lane in 0..lanes {
                    let element = self.element_at(op, lane as i64)?;
                    match result {
                        None => result = Some(element),
                        Some(existing) if existing == element => {}
                        _ => return None,
                    }
                }
                result.map(SplatSource::Op)
            }
        }
    }

    fn element_at(&self, op: &'ir Operand, lane: i64) -> Option<&'ir Operand> {
        let Operand::Value(id) = op else {
            return None;
        };
        let def = self.def(*id)?;
        let InstKind::InsertElement {
            vector,
            element,
            index,
        } = &def.kind
        else {
            return None;
        };
        if index.as_const_int() == Some(lane) {
            return Some(element);
        }
        self.element_at(vector, lane)
    }

    fn shift_expression(
        &mut self,
        inst: &'ir Instruction,
        op: BinOp,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        // Shifting every lane by the same amount uses the by-scalar form;
        // SIMD.js has no vector-vector shifts.
        if let Some(splat) = self.splat_value(rhs) {
            let name = match op {
                BinOp::AShr => "shiftRightArithmeticByScalar",
                BinOp::LShr => "shiftRightLogicalByScalar",
                _ => "shiftLeftByScalar",
            };
            let assign = self.assign_if_needed(inst)?;
            let simd = simd_type(&inst.ty)?;
            let count = match splat {
                SplatSource::Op(operand) => self.value_str(operand, ASM_SIGNED)?,
                SplatSource::Con(constant) => self.constant_str(constant, ASM_SIGNED)?,
                SplatSource::Zero => "0".to_owned(),
            };
            return Ok(format!(
                "{}SIMD_{}_{}({}, {})",
                assign,
                simd,
                name,
                self.value_str(lhs, ASM_SIGNED)?,
                count
            ));
        }
        self.unrolled_expression(inst, op, lhs, rhs)
    }

    /// Per-lane extract/compute/rebuild for operations SIMD.js lacks.
    fn unrolled_expression(
        &mut self,
        inst: &'ir Instruction,
        op: BinOp,
        lhs: &'ir Operand,
        rhs: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let (elem, lanes) = inst.ty.vector_parts().unwrap();
        let elem = elem.clone();
        let bits = element_bits(&elem)?;
        if bits == 32 && lanes < 4 {
            return Err(CodegenError::unsupported_vector_type(
                "unrolled lowering expects full-width 32-bit vectors",
            ));
        }
        let extract = if elem.is_integer() || elem.is_pointer() {
            self.em.simd.int32x4 = true;
            "SIMD_Int32x4_extractLane("
        } else {
            self.em.simd.float32x4 = true;
            "SIMD_Float32x4_extractLane("
        };
        let wrap_float = !self.em.config.precise_f32 && elem == Type::Float;
        let a = self.value_str(lhs, ASM_SIGNED)?;
        let b = self.value_str(rhs, ASM_SIGNED)?;

        let assign = self.assign_if_needed(inst)?;
        let mut text = format!("{}SIMD_{}(", assign, simd_type(&inst.ty)?);
        for lane in 0..lanes {
            if lane != 0 {
                text.push_str(", ");
            }
            if wrap_float {
                text.push_str("Math_fround(");
            }
            let left = format!("({}{},{})", extract, a, lane);
            let right = format!("({}{},{})", extract, b, lane);
            let piece = match op {
                BinOp::SDiv => format!("{}|0) / {}|0)|0", left, right),
                BinOp::UDiv => format!("{}>>>0) / {}>>>0)>>>0", left, right),
                BinOp::SRem => format!("{}|0) % {}|0)|0", left, right),
                BinOp::URem => format!("{}>>>0) % {}>>>0)>>>0", left, right),
                BinOp::AShr => format!("{}|0) >> {}|0)|0", left, right),
                BinOp::LShr => format!("{}|0) >>> {}|0)|0", left, right),
                BinOp::Shl => format!("{}|0) << {}|0)|0", left, right),
                _ => {
                    return Err(CodegenError::unsupported_instruction(
                        "invalid unrolled vector operation",
                    ));
                }
            };
            text.push_str(&piece);
            if wrap_float {
                text.push(')');
            }
        }
        text.push(')');
        Ok(text)
    }

    // ========================================================================
    // Constant vectors
    // ========================================================================

    pub(crate) fn constant_vector_str(&mut self, cv: &Constant) -> Result<String, CodegenError> {
        let Constant::Vector { ty, elems } = cv else {
            return Err(CodegenError::unsupported_constant(
                "expected a vector constant",
            ));
        };
        self.em.check_vector_type(ty)?;
        let (elem_ty, _) = ty.vector_parts().unwrap();
        let elem_ty = elem_ty.clone();
        let is_int = elem_ty.is_integer() || elem_ty.is_pointer();
        let simd = simd_type(ty)?;

        // Float vectors holding NaNs with non-canonical bits must be built
        // as integer vectors and reinterpreted, or the payload bits die.
        let has_special_nans = !is_int
            && elems.iter().any(|e| match e {
                Constant::Float(v) => v.is_nan() && v.to_bits() != 0x7FC0_0000,
                Constant::Double(v) => v.is_nan() && v.to_bits() != 0x7FF8_0000_0000_0000,
                _ => false,
            });
        let element_cast = if has_special_nans {
            ASM_FORCE_FLOAT_AS_INTBITS
        } else {
            ASM_SIGNED
        };

        let first = self.constant_str(&elems[0], element_cast)?;
        let mut all_equal = true;
        for elem in &elems[1..] {
            if self.constant_str(elem, element_cast)? != first {
                all_equal = false;
                break;
            }
        }

        let bits = element_bits(&elem_ty)?;
        let int_ty = Type::vector_of(Type::Int(bits), elems.len() as u32);

        if all_equal {
            if !has_special_nans {
                return Ok(format!(
                    "SIMD_{}_splat({})",
                    simd,
                    ensure_float(first, !is_int)
                ));
            }
            self.em.check_vector_type(&int_ty)?;
            let built = format!("SIMD_{}_splat({})", simd_type(&int_ty)?, first);
            return self.simd_cast(&int_ty, ty, built);
        }

        let padded = padded_lane_count(ty)? as usize;
        if !has_special_nans {
            let mut text = format!("SIMD_{}({}", simd, ensure_float(first, !is_int));
            for elem in &elems[1..] {
                let value = self.constant_str(elem, ASM_SIGNED)?;
                text.push_str(&format!(",{}", ensure_float(value, !is_int)));
            }
            for _ in elems.len()..padded {
                let zero = if is_int { "0" } else { "+0" };
                text.push_str(&format!(",{}", ensure_float(zero.to_owned(), !is_int)));
            }
            text.push(')');
            return Ok(text);
        }

        self.em.check_vector_type(&int_ty)?;
        let mut text = format!("SIMD_{}({}", simd_type(&int_ty)?, first);
        for elem in &elems[1..] {
            let value = self.constant_str(elem, ASM_FORCE_FLOAT_AS_INTBITS)?;
            text.push_str(&format!(",{}", value));
        }
        for _ in elems.len()..padded {
            text.push_str(",0");
        }
        text.push(')');
        self.simd_cast(&int_ty, ty, text)
    }
}

fn is_all_ones_vector(op: &Operand) -> bool {
    match op.as_const() {
        Some(Constant::Vector { elems, .. }) => elems
            .iter()
            .all(|e| matches!(e, Constant::Int { value: -1, .. })),
        _ => false,
    }
}

fn is_negative_zero_vector(op: &Operand) -> bool {
    match op.as_const() {
        Some(Constant::Vector { elems, .. }) => elems.iter().all(|e| match e {
            Constant::Float(v) => v.to_bits() == 0x8000_0000,
            Constant::Double(v) => v.to_bits() == 0x8000_0000_0000_0000,
            _ => false,
        }),
        _ => false,
    }
}

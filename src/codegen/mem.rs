//! Loads, stores, and atomics through the typed heap views.
//!
//! An address is shifted by log2 of the access width and indexed into the
//! view matching the width and intness (`HEAP8`..`HEAPF64`). Accesses wider
//! than their alignment are split into aligned pieces, gathered through the
//! 8-byte `tempDoublePtr` scratch slot when a float view is involved.

use crate::codegen::control_flow::FunctionLowerer;
use crate::codegen::expr::{Stripped, ASM_NONSPECIFIC, ASM_SIGNED};
use crate::diagnostics::{CodegenError, CodegenWarning, WarningKind};
use crate::ir::{CastOp, Constant, InstKind, Instruction, Operand, RmwOp, Type};

/// Stores carrying this marker alignment are intentional segfaults.
const SEGFAULT_STORE_ALIGN: u32 = 536870912;

pub(crate) fn heap_name(bytes: u32, integer: bool) -> Result<&'static str, CodegenError> {
    Ok(match (bytes, integer) {
        (8, _) => "HEAPF64",
        (4, true) => "HEAP32",
        (4, false) => "HEAPF32",
        (2, _) => "HEAP16",
        (1, _) => "HEAP8",
        _ => {
            return Err(CodegenError::unsupported_instruction(format!(
                "no heap view for a {}-byte access",
                bytes
            )));
        }
    })
}

pub(crate) fn heap_shift(bytes: u32) -> u32 {
    match bytes {
        8 => 3,
        4 => 2,
        2 => 1,
        _ => 0,
    }
}

pub(crate) fn heap_shift_str(bytes: u32) -> &'static str {
    match bytes {
        8 => ">>3",
        4 => ">>2",
        2 => ">>1",
        _ => ">>0",
    }
}

fn atomic_type_suffix(heap: &str) -> &'static str {
    match heap {
        "HEAPF32" => "f32",
        "HEAPF64" => "f64",
        _ => "",
    }
}

impl<'a, 'ir> FunctionLowerer<'a, 'ir> {
    /// Heap view and shifted index for a pointer operand. Initialized
    /// globals fold to a constant index; other pointers render as shifted
    /// expressions. `bytes` overrides the access width (ignored on the
    /// folded-global path, which always uses the global's own size).
    pub(crate) fn heap_name_and_index(
        &mut self,
        ptr: &'ir Operand,
        bytes: Option<u32>,
    ) -> Result<(String, &'static str), CodegenError> {
        let dl = &self.em.module.data_layout;
        if let Stripped::Con(Constant::Global(name)) = self.strip_operand(ptr) {
            if self.em.layout.has_address(name) {
                let global = self
                    .em
                    .module
                    .find_global(name)
                    .ok_or_else(|| CodegenError::missing_global_address(name))?;
                let width = dl.type_alloc_size(&global.ty);
                let heap = heap_name(width, global.ty.is_integer_or_pointer())?;
                let address = self.em.layout.absolute_address(name)?;
                let index = if self.em.config.relocatable {
                    format!(
                        "{}{}",
                        self.em.relocate_global(address.to_string()),
                        heap_shift_str(width)
                    )
                } else {
                    (address >> heap_shift(width)).to_string()
                };
                return Ok((index, heap));
            }
        }
        let ptr_ty = self.operand_ty(ptr)?;
        let pointee = ptr_ty.pointee().ok_or_else(|| {
            CodegenError::unsupported_instruction("memory access through a non-pointer")
        })?;
        let width = bytes.unwrap_or_else(|| dl.type_alloc_size(pointee));
        let heap = heap_name(width, pointee.is_integer_or_pointer())?;
        let index = format!(
            "{}{}",
            self.value_str(ptr, ASM_SIGNED)?,
            heap_shift_str(width)
        );
        Ok((index, heap))
    }

    pub(crate) fn get_ptr_use(&mut self, ptr: &'ir Operand) -> Result<String, CodegenError> {
        let (index, heap) = self.heap_name_and_index(ptr, None)?;
        Ok(format!("{}[{}]", heap, index))
    }

    fn get_ptr_load(&mut self, ptr: &'ir Operand) -> Result<String, CodegenError> {
        let pointee = self
            .operand_ty(ptr)?
            .pointee()
            .cloned()
            .ok_or_else(|| CodegenError::unsupported_instruction("load through a non-pointer"))?;
        let access = self.get_ptr_use(ptr)?;
        self.get_cast(&access, &pointee, ASM_NONSPECIFIC)
    }

    /// Whether the pointer is a known absolute value (null, undef, or an
    /// inttoptr of a constant). Loads from those are either intentional
    /// segfaults or code problems; both deserve the abort marker.
    fn is_absolute(&self, ptr: &'ir Operand) -> bool {
        match self.strip_operand(ptr) {
            Stripped::Con(Constant::Null(_)) | Stripped::Con(Constant::Undef(_)) => true,
            Stripped::Con(_) => false,
            Stripped::Value(id) => match self.def(id) {
                Some(Instruction {
                    kind:
                        InstKind::Cast {
                            op: CastOp::IntToPtr,
                            value,
                        },
                    ..
                }) => value.as_const_int().is_some(),
                _ => false,
            },
        }
    }

    fn warn_unaligned(&mut self, what: &str) {
        if self.em.config.warn_on_unaligned {
            let function = self.func.name.clone();
            self.em.diagnostics.warn(
                CodegenWarning::new(
                    WarningKind::UnalignedAccess,
                    format!("unaligned {} (this can negatively affect performance)", what),
                )
                .in_function(&function),
            );
        }
    }

    fn warn_unaligned_volatile(&mut self, what: &str) {
        let function = self.func.name.clone();
        self.em.diagnostics.warn(
            CodegenWarning::new(
                WarningKind::UnalignedVolatileAccess,
                format!("unable to implement unaligned volatile {} as atomic", what),
            )
            .in_function(&function),
        );
    }

    // ========================================================================
    // Loads
    // ========================================================================

    pub(crate) fn get_load(
        &mut self,
        inst: &'ir Instruction,
        ptr: &'ir Operand,
        ty: &Type,
        alignment: u32,
        volatile: bool,
    ) -> Result<String, CodegenError> {
        let bytes = self.em.module.data_layout.type_alloc_size(ty);
        let assign = self.get_assign(inst)?;
        let pthreads = self.em.config.enable_pthreads;
        let sep = ';';

        if bytes <= alignment || alignment == 0 {
            let mut text;
            if pthreads && volatile {
                let (index, heap) = self.heap_name_and_index(ptr, None)?;
                if heap == "HEAPF32" || heap == "HEAPF64" {
                    // No float atomics in the API; go through emulation.
                    let fround = self.em.config.precise_f32 && heap == "HEAPF32";
                    text = format!(
                        "{}{}_emscripten_atomic_load_{}({}{}",
                        assign,
                        if fround { "Math_fround(" } else { "+" },
                        atomic_type_suffix(heap),
                        self.value_str(ptr, ASM_SIGNED)?,
                        if fround { "))" } else { ")" }
                    );
                } else {
                    text = format!("{}Atomics_load({},{})", assign, heap, index);
                }
            } else {
                text = format!("{}{}", assign, self.get_ptr_load(ptr)?);
            }
            if self.is_absolute(ptr) {
                text.push_str("; abort() /* segfault, load from absolute addr */");
            }
            return Ok(text);
        }

        // Unaligned in some manner.
        if pthreads && volatile {
            self.warn_unaligned_volatile("load");
        }
        self.warn_unaligned("load");

        let ps = self.value_str(ptr, ASM_SIGNED)?;
        let text = match bytes {
            8 => {
                let gather = match alignment {
                    4 => format!(
                        "HEAP32[tempDoublePtr>>2]=HEAP32[{}>>2]{}\
                         HEAP32[tempDoublePtr+4>>2]=HEAP32[{}+4>>2]",
                        ps, sep, ps
                    ),
                    2 => format!(
                        "HEAP16[tempDoublePtr>>1]=HEAP16[{p}>>1]{s}\
                         HEAP16[tempDoublePtr+2>>1]=HEAP16[{p}+2>>1]{s}\
                         HEAP16[tempDoublePtr+4>>1]=HEAP16[{p}+4>>1]{s}\
                         HEAP16[tempDoublePtr+6>>1]=HEAP16[{p}+6>>1]",
                        p = ps,
                        s = sep
                    ),
                    1 => {
                        let mut pieces = Vec::with_capacity(8);
                        for i in 0..8 {
                            let at = if i == 0 {
                                ps.clone()
                            } else {
                                format!("{}+{}", ps, i)
                            };
                            pieces
                                .push(format!("HEAP8[tempDoublePtr+{}>>0]=HEAP8[{}>>0]", i, at));
                        }
                        pieces[0] = format!("HEAP8[tempDoublePtr>>0]=HEAP8[{}>>0]", ps);
                        pieces.join(&sep.to_string())
                    }
                    _ => {
                        return Err(CodegenError::unsupported_instruction(
                            "bad alignment for an 8-byte load",
                        ));
                    }
                };
                format!("{}{}{}+HEAPF64[tempDoublePtr>>3]", gather, sep, assign)
            }
            4 => {
                if ty.is_integer_or_pointer() {
                    match alignment {
                        2 => format!(
                            "{}HEAPU16[{p}>>1]|(HEAPU16[{p}+2>>1]<<16)",
                            assign,
                            p = ps
                        ),
                        1 => format!(
                            "{}HEAPU8[{p}>>0]|(HEAPU8[{p}+1>>0]<<8)|\
                             (HEAPU8[{p}+2>>0]<<16)|(HEAPU8[{p}+3>>0]<<24)",
                            assign,
                            p = ps
                        ),
                        _ => {
                            return Err(CodegenError::unsupported_instruction(
                                "bad alignment for a 4-byte integer load",
                            ));
                        }
                    }
                } else {
                    let gather = match alignment {
                        2 => format!(
                            "HEAP16[tempDoublePtr>>1]=HEAP16[{p}>>1]{s}\
                             HEAP16[tempDoublePtr+2>>1]=HEAP16[{p}+2>>1]",
                            p = ps,
                            s = sep
                        ),
                        1 => format!(
                            "HEAP8[tempDoublePtr>>0]=HEAP8[{p}>>0]{s}\
                             HEAP8[tempDoublePtr+1>>0]=HEAP8[{p}+1>>0]{s}\
                             HEAP8[tempDoublePtr+2>>0]=HEAP8[{p}+2>>0]{s}\
                             HEAP8[tempDoublePtr+3>>0]=HEAP8[{p}+3>>0]",
                            p = ps,
                            s = sep
                        ),
                        _ => {
                            return Err(CodegenError::unsupported_instruction(
                                "bad alignment for a 4-byte float load",
                            ));
                        }
                    };
                    let reload =
                        self.get_cast("HEAPF32[tempDoublePtr>>2]", &Type::Float, ASM_SIGNED)?;
                    format!("{}{}{}{}", gather, sep, assign, reload)
                }
            }
            2 => format!("{}HEAPU8[{p}>>0]|(HEAPU8[{p}+1>>0]<<8)", assign, p = ps),
            _ => {
                return Err(CodegenError::unsupported_instruction(
                    "bad unaligned load width",
                ));
            }
        };
        Ok(text)
    }

    // ========================================================================
    // Stores
    // ========================================================================

    pub(crate) fn get_store(
        &mut self,
        _inst: &'ir Instruction,
        ptr: &'ir Operand,
        ty: &Type,
        value_text: &str,
        alignment: u32,
        volatile: bool,
    ) -> Result<String, CodegenError> {
        let bytes = self.em.module.data_layout.type_alloc_size(ty);
        let pthreads = self.em.config.enable_pthreads;

        if bytes <= alignment || alignment == 0 {
            let mut text;
            if pthreads && volatile {
                let (index, heap) = self.heap_name_and_index(ptr, None)?;
                if heap == "HEAPF32" || heap == "HEAPF64" {
                    text = format!(
                        "_emscripten_atomic_store_{}({},{})",
                        atomic_type_suffix(heap),
                        self.value_str(ptr, ASM_SIGNED)?,
                        value_text
                    );
                    if self.em.config.precise_f32 && heap == "HEAPF32" {
                        text = format!("Math_fround({})", text);
                    } else {
                        text = format!("+{}", text);
                    }
                } else {
                    text = format!("Atomics_store({},{},{})", heap, index, value_text);
                }
            } else {
                text = format!("{} = {}", self.get_ptr_use(ptr)?, value_text);
            }
            if alignment == SEGFAULT_STORE_ALIGN {
                text.push_str("; abort() /* segfault */");
            }
            return Ok(text);
        }

        // Unaligned in some manner.
        if pthreads && volatile {
            self.warn_unaligned_volatile("store");
        }
        self.warn_unaligned("store");

        let ps = self.value_str(ptr, ASM_SIGNED)?;
        let vs = value_text;
        let text = match bytes {
            8 => {
                let spill = format!("HEAPF64[tempDoublePtr>>3]={};", vs);
                let scatter = match alignment {
                    4 => format!(
                        "HEAP32[{p}>>2]=HEAP32[tempDoublePtr>>2];\
                         HEAP32[{p}+4>>2]=HEAP32[tempDoublePtr+4>>2]",
                        p = ps
                    ),
                    2 => format!(
                        "HEAP16[{p}>>1]=HEAP16[tempDoublePtr>>1];\
                         HEAP16[{p}+2>>1]=HEAP16[tempDoublePtr+2>>1];\
                         HEAP16[{p}+4>>1]=HEAP16[tempDoublePtr+4>>1];\
                         HEAP16[{p}+6>>1]=HEAP16[tempDoublePtr+6>>1]",
                        p = ps
                    ),
                    1 => format!(
                        "HEAP8[{p}>>0]=HEAP8[tempDoublePtr>>0];\
                         HEAP8[{p}+1>>0]=HEAP8[tempDoublePtr+1>>0];\
                         HEAP8[{p}+2>>0]=HEAP8[tempDoublePtr+2>>0];\
                         HEAP8[{p}+3>>0]=HEAP8[tempDoublePtr+3>>0];\
                         HEAP8[{p}+4>>0]=HEAP8[tempDoublePtr+4>>0];\
                         HEAP8[{p}+5>>0]=HEAP8[tempDoublePtr+5>>0];\
                         HEAP8[{p}+6>>0]=HEAP8[tempDoublePtr+6>>0];\
                         HEAP8[{p}+7>>0]=HEAP8[tempDoublePtr+7>>0]",
                        p = ps
                    ),
                    _ => {
                        return Err(CodegenError::unsupported_instruction(
                            "bad alignment for an 8-byte store",
                        ));
                    }
                };
                format!("{}{}", spill, scatter)
            }
            4 => {
                if ty.is_integer_or_pointer() {
                    match alignment {
                        2 => format!(
                            "HEAP16[{p}>>1]={v}&65535;HEAP16[{p}+2>>1]={v}>>>16",
                            p = ps,
                            v = vs
                        ),
                        1 => format!(
                            "HEAP8[{p}>>0]={v}&255;HEAP8[{p}+1>>0]=({v}>>8)&255;\
                             HEAP8[{p}+2>>0]=({v}>>16)&255;HEAP8[{p}+3>>0]={v}>>24",
                            p = ps,
                            v = vs
                        ),
                        _ => {
                            return Err(CodegenError::unsupported_instruction(
                                "bad alignment for a 4-byte integer store",
                            ));
                        }
                    }
                } else {
                    let spill = format!("HEAPF32[tempDoublePtr>>2]={};", vs);
                    let scatter = match alignment {
                        2 => format!(
                            "HEAP16[{p}>>1]=HEAP16[tempDoublePtr>>1];\
                             HEAP16[{p}+2>>1]=HEAP16[tempDoublePtr+2>>1]",
                            p = ps
                        ),
                        1 => format!(
                            "HEAP8[{p}>>0]=HEAP8[tempDoublePtr>>0];\
                             HEAP8[{p}+1>>0]=HEAP8[tempDoublePtr+1>>0];\
                             HEAP8[{p}+2>>0]=HEAP8[tempDoublePtr+2>>0];\
                             HEAP8[{p}+3>>0]=HEAP8[tempDoublePtr+3>>0]",
                            p = ps
                        ),
                        _ => {
                            return Err(CodegenError::unsupported_instruction(
                                "bad alignment for a 4-byte float store",
                            ));
                        }
                    };
                    format!("{}{}", spill, scatter)
                }
            }
            2 => format!(
                "HEAP8[{p}>>0]={v}&255;HEAP8[{p}+1>>0]={v}>>8",
                p = ps,
                v = vs
            ),
            _ => {
                return Err(CodegenError::unsupported_instruction(
                    "bad unaligned store width",
                ));
            }
        };
        Ok(text)
    }

    // ========================================================================
    // Read-modify-write atomics
    // ========================================================================

    pub(crate) fn atomic_rmw_text(
        &mut self,
        inst: &'ir Instruction,
        op: RmwOp,
        ptr: &'ir Operand,
        value: &'ir Operand,
    ) -> Result<String, CodegenError> {
        let value_text = self.value_str(value, ASM_SIGNED)?;
        if self.em.config.enable_pthreads {
            let assign = self.get_assign(inst)?;
            let (index, heap) = self.heap_name_and_index(ptr, None)?;
            let atomic_func = match op {
                RmwOp::Xchg => "exchange",
                RmwOp::Add => "add",
                RmwOp::Sub => "sub",
                RmwOp::And => "and",
                RmwOp::Or => "or",
                RmwOp::Xor => "xor",
                RmwOp::Nand => {
                    return Err(CodegenError::unsupported_instruction(
                        "atomic nand has no Atomics mapping",
                    ));
                }
            };
            if heap == "HEAPF32" || heap == "HEAPF64" {
                let fround = self.em.config.precise_f32 && heap == "HEAPF32";
                return Ok(format!(
                    "{}{}_emscripten_atomic_{}_{}({}, {}{}",
                    assign,
                    if fround { "Math_fround(" } else { "+" },
                    atomic_func,
                    atomic_type_suffix(heap),
                    self.value_str(ptr, ASM_SIGNED)?,
                    value_text,
                    if fround { "))" } else { ")" }
                ));
            }
            if op == RmwOp::Xchg && heap == "HEAP32" {
                // Atomics.exchange on Int32Array is not available everywhere.
                return Ok(format!(
                    "{}_emscripten_atomic_exchange_u32({}, {})|0",
                    assign,
                    self.value_str(ptr, ASM_SIGNED)?,
                    value_text
                ));
            }
            return Ok(format!(
                "{}Atomics_{}({}, {}, {})",
                assign, atomic_func, heap, index, value_text
            ));
        }

        // Single-threaded: a plain load, compute, store sequence.
        let load = self.get_load(inst, ptr, &inst.ty, 0, false)?;
        let name = self.local_name(inst.id)?;
        let stored = match op {
            RmwOp::Xchg => value_text,
            RmwOp::Add => format!("(({}+{})|0)", name, value_text),
            RmwOp::Sub => format!("(({}-{})|0)", name, value_text),
            RmwOp::And => format!("({}&{})", name, value_text),
            RmwOp::Nand => format!("(~({}&{}))", name, value_text),
            RmwOp::Or => format!("({}|{})", name, value_text),
            RmwOp::Xor => format!("({}^{})", name, value_text),
        };
        let ty = inst.ty.clone();
        let store = self.get_store(inst, ptr, &ty, &stored, 0, false)?;
        Ok(format!("{};{}", load, store))
    }
}

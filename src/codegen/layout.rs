//! Two-phase layout of global initializers into the memory image.
//!
//! Phase 1 walks every initializer and allocates an address for each
//! materialized constant inside the byte vector of its alignment class.
//! Only once all addresses are known can phase 2 write the actual bytes,
//! because initializers may refer to other globals' addresses. Values that
//! are still not knowable (function-table indices under relocation,
//! unresolved externals) are deferred as post-set assignment strings.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::codegen::{ModuleEmitter, DEFAULT_MEM_ALIGN};
use crate::diagnostics::CodegenError;
use crate::ir::{ConstExpr, Constant};

/// Relative address of a global: offset inside its alignment class vector,
/// plus the class recorded in bits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Address {
    pub offset: u32,
    pub alignment_bits: u32,
}

#[derive(Debug, Default)]
pub(crate) struct GlobalLayout {
    /// Alignment class (bytes) -> packed byte vector. Ordered so the blob
    /// and start addresses are deterministic.
    pub(crate) data: BTreeMap<u32, Vec<u8>>,
    addresses: FxHashMap<String, Address>,
    /// Alignment class -> absolute base address of that class's vector.
    aligned_starts: FxHashMap<u32, u32>,
    pub(crate) post_sets: Vec<String>,
    pub(crate) global_base_padding: u32,
    pub(crate) max_global_align: u32,
}

impl GlobalLayout {
    pub(crate) fn new() -> GlobalLayout {
        GlobalLayout::default()
    }

    fn ensure_aligned(alignment: u32, data: &mut Vec<u8>) {
        debug_assert!(alignment.is_power_of_two());
        while data.len() as u32 & (alignment - 1) != 0 {
            data.push(0);
        }
    }

    /// Allocates space for a named global in its alignment class, recording
    /// its relative address. Returns the class vector for the caller to
    /// append the payload bytes.
    fn allocate_address(&mut self, name: &str, alignment: u32) -> &mut Vec<u8> {
        let data = self.data.entry(alignment).or_default();
        Self::ensure_aligned(alignment, data);
        self.addresses.insert(
            name.to_owned(),
            Address {
                offset: data.len() as u32,
                alignment_bits: alignment * 8,
            },
        );
        data
    }

    /// Offset of a global inside its alignment class vector.
    pub(crate) fn relative_address(&self, name: &str) -> Result<u32, CodegenError> {
        self.addresses
            .get(name)
            .map(|a| a.offset)
            .ok_or_else(|| CodegenError::missing_global_address(name))
    }

    /// Absolute address of a global (relative to the module base when
    /// relocatable). Valid only after [`finalize`](Self::finalize).
    pub(crate) fn absolute_address(&self, name: &str) -> Result<u32, CodegenError> {
        let address = self
            .addresses
            .get(name)
            .ok_or_else(|| CodegenError::missing_global_address(name))?;
        let alignment = address.alignment_bits / 8;
        let start = self
            .aligned_starts
            .get(&alignment)
            .copied()
            .ok_or_else(|| CodegenError::missing_global_address(name))?;
        let absolute = address.offset + start;
        debug_assert_eq!(absolute % alignment, 0);
        Ok(absolute)
    }

    pub(crate) fn has_address(&self, name: &str) -> bool {
        self.addresses.contains_key(name)
    }

    /// Closes phase 1: pads every class vector to a class multiple, derives
    /// `MaxGlobalAlign` and the global-base padding, and places each class's
    /// vector, largest classes first.
    pub(crate) fn finalize(&mut self, global_base: u32, relocatable: bool) {
        debug_assert_eq!(self.max_global_align, 0);
        for (&alignment, data) in self.data.iter_mut() {
            if alignment > self.max_global_align {
                self.max_global_align = alignment;
            }
            Self::ensure_aligned(alignment, data);
        }
        if !relocatable && self.max_global_align > 0 {
            while (global_base + self.global_base_padding) % self.max_global_align != 0 {
                self.global_base_padding += 1;
            }
        }
        for &alignment in self.data.keys() {
            let mut start = global_base + self.global_base_padding;
            for (&other, data) in self.data.iter() {
                if other > alignment {
                    start += data.len() as u32;
                }
            }
            self.aligned_starts.insert(alignment, start);
        }
    }
}

// ============================================================================
// Constant parsing (both phases) on the emitter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Calculate,
    Emit,
}

impl<'ir> ModuleEmitter<'ir> {
    /// Runs both layout phases over every initialized global, then computes
    /// the named-globals export set under relocation.
    pub(crate) fn process_constants(&mut self) -> Result<(), CodegenError> {
        let module = self.module;
        for (index, global) in module.globals.iter().enumerate() {
            if let Some(init) = &global.init {
                let name = self.global_effective_names[index].clone();
                self.parse_constant(&name, init, global.align, Phase::Calculate)?;
            }
        }
        self.layout
            .finalize(self.config.global_base, self.config.relocatable);
        for (index, global) in module.globals.iter().enumerate() {
            if let Some(init) = &global.init {
                let name = self.global_effective_names[index].clone();
                self.parse_constant(&name, init, global.align, Phase::Emit)?;
            }
        }
        if self.config.relocatable {
            for global in &module.globals {
                if global.init.is_none() || global.internal {
                    continue;
                }
                if !self.layout.has_address(&global.name) {
                    continue;
                }
                // Skip symbols whose mangled form differs; C code could not
                // dlsym them anyhow.
                let mangled = self.global_js_name(&global.name);
                if mangled[1..] == global.name {
                    let address = self.layout.absolute_address(&global.name)?;
                    self.named_globals.insert(global.name.clone(), address);
                }
            }
        }
        Ok(())
    }

    fn parse_constant(
        &mut self,
        name: &str,
        cv: &Constant,
        alignment: u32,
        phase: Phase,
    ) -> Result<(), CodegenError> {
        if matches!(cv, Constant::Global(_)) {
            return Ok(());
        }
        let alignment = if alignment == 0 {
            DEFAULT_MEM_ALIGN
        } else {
            alignment.next_power_of_two()
        };
        let calculate = phase == Phase::Calculate;
        let dl = &self.module.data_layout;

        match cv {
            Constant::Str(bytes) => {
                if calculate {
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend_from_slice(bytes);
                }
            }
            Constant::Float(value) => {
                if calculate {
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            Constant::Double(value) => {
                if calculate {
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            Constant::Int { value, .. } => {
                if calculate {
                    // Initializer data slots are padded out to 64 bits.
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend_from_slice(&(*value as u64).to_le_bytes());
                }
            }
            Constant::AggregateZero(ty) => {
                if calculate {
                    let bytes = dl.type_store_size(ty);
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend(std::iter::repeat(0u8).take(bytes as usize));
                }
            }
            Constant::Array(elems) => {
                if calculate {
                    self.parse_special_array(name, elems)?;
                }
            }
            Constant::Struct { fields, packed } => {
                if name == "__init_array_start" {
                    // The static-constructor list; it never lands in memory.
                    if calculate {
                        for field in fields {
                            let resolved = self.module.resolve_fully(field);
                            if let Constant::Global(func) = resolved {
                                let func = func.clone();
                                let js = self.global_js_name(&func);
                                self.global_initializers.push(js);
                            }
                        }
                    }
                } else if calculate {
                    let bytes = dl.type_store_size(&cv.ty(self.module)?);
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend(std::iter::repeat(0u8).take(bytes as usize));
                } else {
                    self.emit_packed_struct(name, fields, *packed, alignment)?;
                }
            }
            Constant::Expr(expr) => {
                if name == "__init_array_start" {
                    if calculate {
                        let resolved = self.module.resolve_fully(cv);
                        if let Constant::Global(func) = resolved {
                            let func = func.clone();
                            let js = self.global_js_name(&func);
                            self.global_initializers.push(js);
                        }
                    }
                } else if name == "__fini_array_start" {
                    // nothing to do
                } else if calculate {
                    // A pointer-sized integer whose value needs phase 2.
                    let data = self.layout.allocate_address(name, alignment);
                    data.extend_from_slice(&[0, 0, 0, 0]);
                } else {
                    self.emit_pointer_expr(name, expr, alignment)?;
                }
            }
            Constant::Null(_) => {
                return Err(CodegenError::unsupported_constant(format!(
                    "unlowered null pointer initializer for '{}'",
                    name
                )));
            }
            Constant::Vector { .. } => {
                return Err(CodegenError::unsupported_constant(format!(
                    "unlowered vector initializer for '{}'",
                    name
                )));
            }
            Constant::BlockAddress { .. } => {
                return Err(CodegenError::unsupported_constant(format!(
                    "unlowered block address initializer for '{}'",
                    name
                )));
            }
            Constant::Undef(_) => {
                return Err(CodegenError::unsupported_constant(format!(
                    "unlowered undef initializer for '{}'",
                    name
                )));
            }
            Constant::Global(_) => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Constant arrays only appear as compiler-internal lists: `llvm.used`
    /// keep-alives become exports, annotation lists are dropped.
    fn parse_special_array(&mut self, name: &str, elems: &[Constant]) -> Result<(), CodegenError> {
        match name {
            "llvm.used" => {
                for elem in elems {
                    let resolved = self.module.resolve_fully(elem);
                    if let Constant::Global(symbol) = resolved {
                        if self.module.find_function(symbol).is_some() {
                            let symbol = symbol.clone();
                            let js = self.global_js_name(&symbol);
                            self.exports.push(js);
                        }
                    }
                }
                Ok(())
            }
            "llvm.global.annotations" => Ok(()),
            _ => Err(CodegenError::unsupported_constant(format!(
                "unexpected constant array initializer for '{}'",
                name
            ))),
        }
    }

    /// Phase-2 write of a flattened (packed) struct initializer. Per the
    /// upstream flattening pass the fields are raw bytes, strings, zero
    /// fills, and pointer-sized constant expressions.
    fn emit_packed_struct(
        &mut self,
        name: &str,
        fields: &[Constant],
        packed: bool,
        alignment: u32,
    ) -> Result<(), CodegenError> {
        if !packed {
            return Err(CodegenError::unsupported_constant(format!(
                "struct initializer for '{}' was not flattened to a packed struct",
                name
            )));
        }
        let mut offset = self.layout.relative_address(name)?;
        let offset_start = offset;
        let absolute = self.layout.absolute_address(name)?;
        for field in fields {
            match field {
                Constant::AggregateZero(ty) => {
                    // Already zero; just skip ahead.
                    offset += self.module.data_layout.type_store_size(ty);
                }
                Constant::Str(bytes) => {
                    let data = self.layout.data.get_mut(&alignment).expect("class exists");
                    assert!(offset as usize + bytes.len() <= data.len());
                    data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
                    offset += bytes.len() as u32;
                }
                Constant::Expr(expr) => {
                    let target = absolute + (offset - offset_start);
                    let value = match expr.as_ref() {
                        ConstExpr::PtrToInt(inner) => self.const_as_offset(inner, target)?,
                        ConstExpr::Add(lhs, rhs) => {
                            let base = self.const_as_offset(lhs, target)?;
                            let addend = rhs.as_int().ok_or_else(|| {
                                CodegenError::unsupported_constant(format!(
                                    "non-constant addend in initializer for '{}'",
                                    name
                                ))
                            })?;
                            base.wrapping_add(addend as u32)
                        }
                        _ => {
                            return Err(CodegenError::unsupported_constant(format!(
                                "unexpected constant expression in initializer for '{}'",
                                name
                            )));
                        }
                    };
                    let data = self.layout.data.get_mut(&alignment).expect("class exists");
                    assert!(offset as usize + 4 <= data.len());
                    data[offset as usize..offset as usize + 4]
                        .copy_from_slice(&value.to_le_bytes());
                    offset += 4;
                }
                _ => {
                    return Err(CodegenError::unsupported_constant(format!(
                        "unexpected constant kind in flattened initializer for '{}'",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Phase-2 write of a lone pointer-sized constant expression, e.g.
    /// `ptrtoint` of a function or a lowered GEP `add(ptrtoint(base), K)`.
    fn emit_pointer_expr(
        &mut self,
        name: &str,
        expr: &ConstExpr,
        alignment: u32,
    ) -> Result<(), CodegenError> {
        let mut value = 0u32;
        // Deconstruct lowered getelementptrs.
        let mut current: &Constant;
        match expr {
            ConstExpr::Add(lhs, rhs) => {
                value = rhs.as_int().ok_or_else(|| {
                    CodegenError::unsupported_constant(format!(
                        "non-constant addend in initializer for '{}'",
                        name
                    ))
                })? as u32;
                current = lhs;
            }
            ConstExpr::PtrToInt(inner) => current = inner,
            other => {
                return Err(CodegenError::unsupported_constant(format!(
                    "unexpected top-level constant expression {:?} for '{}'",
                    other, name
                )));
            }
        }
        if let Constant::Expr(inner) = current {
            if let ConstExpr::PtrToInt(pointee) = inner.as_ref() {
                current = pointee;
            }
        }

        // Deconstruct remaining getelementptrs into base plus offset.
        let (base, base_offset) = self.pointer_base_with_constant_offset(current)?;
        value = value.wrapping_add(base_offset as u32);

        let target = self.layout.absolute_address(name)?;
        value = value.wrapping_add(self.const_as_offset(base, target)?);

        let offset = self.layout.relative_address(name)? as usize;
        let data = self.layout.data.get_mut(&alignment).expect("class exists");
        assert!(offset + 4 <= data.len());
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Strips constant GEPs and pointer casts, accumulating their constant
    /// byte offset.
    pub(crate) fn pointer_base_with_constant_offset<'c>(
        &self,
        constant: &'c Constant,
    ) -> Result<(&'c Constant, i64), CodegenError> {
        let dl = &self.module.data_layout;
        let mut current = constant;
        let mut offset = 0i64;
        loop {
            match current {
                Constant::Expr(expr) => match expr.as_ref() {
                    ConstExpr::Bitcast { value, .. } => current = value,
                    ConstExpr::Gep { base, indices } => {
                        let base_ty = base.ty(self.module)?;
                        let Some(pointee) = base_ty.pointee().cloned() else {
                            return Err(CodegenError::unsupported_constant(
                                "constant GEP applied to a non-pointer",
                            ));
                        };
                        let mut walker = GepWalk::new(pointee);
                        for (position, index) in indices.iter().enumerate() {
                            let index = index.as_int().ok_or_else(|| {
                                CodegenError::unsupported_constant(
                                    "non-constant index in constant GEP",
                                )
                            })?;
                            offset += walker.step(dl, position, index)?;
                        }
                        current = base;
                    }
                    _ => return Ok((current, offset)),
                },
                _ => return Ok((current, offset)),
            }
        }
    }

    /// The numeric value a constant contributes when written into a global
    /// slot. When the value cannot be known yet, zero is written and a
    /// post-set patches the slot at the given absolute address.
    pub(crate) fn const_as_offset(
        &mut self,
        value: &Constant,
        absolute_target: u32,
    ) -> Result<u32, CodegenError> {
        let resolved = self.module.resolve_fully(value).clone();
        match &resolved {
            Constant::Global(symbol) => {
                if self.module.find_function(symbol).is_some() {
                    let index = self.function_index_for(symbol)?;
                    if self.config.relocatable {
                        let target = self.relocate_global(absolute_target.to_string());
                        let fp = self.relocate_function_pointer(index.to_string());
                        self.layout
                            .post_sets
                            .push(format!(" HEAP32[{} >> 2] = {};", target, fp));
                        return Ok(0);
                    }
                    return Ok(index);
                }
                if let Some(global) = self.module.find_global(symbol) {
                    if global.init.is_none() {
                        // External data: only the linker knows the address.
                        let mangled = self.global_js_name(symbol);
                        self.externals.insert(mangled.clone());
                        let target = self.relocate_global(absolute_target.to_string());
                        if self.config.relocatable {
                            let access = format!("HEAP32[{} >> 2]", target);
                            self.layout.post_sets.push(format!(
                                " temp = g${}() | 0; {} = ({} | 0) + temp;",
                                mangled, access, access
                            ));
                        } else {
                            self.layout
                                .post_sets
                                .push(format!(" HEAP32[{} >> 2] = {};", target, mangled));
                        }
                        return Ok(0);
                    }
                    if self.config.relocatable {
                        // One of ours, but its address moves with the module
                        // base; emit zero now and add the relocated address
                        // on top of whatever offset the slot already holds.
                        let target = self.relocate_global(absolute_target.to_string());
                        let access = format!("HEAP32[{} >> 2]", target);
                        let address =
                            self.relocate_global(self.layout.absolute_address(symbol)?.to_string());
                        self.layout.post_sets.push(format!(
                            " {} = ({} | 0) + {};",
                            access, access, address
                        ));
                        return Ok(0);
                    }
                    return self.layout.absolute_address(symbol);
                }
                Err(CodegenError::missing_global_address(symbol))
            }
            Constant::BlockAddress { function, block } => Ok(self.block_address(function, *block)),
            other => Err(CodegenError::unsupported_constant(format!(
                "cannot write constant {:?} as a memory offset",
                other
            ))),
        }
    }
}

/// Element-by-element GEP type walker shared by constant and instruction
/// lowering.
pub(crate) struct GepWalk {
    current: crate::ir::Type,
}

impl GepWalk {
    pub(crate) fn new(pointee: crate::ir::Type) -> GepWalk {
        GepWalk { current: pointee }
    }

    /// Advances over one constant index, returning the byte offset it
    /// contributes. `position == 0` steps over whole pointees; later
    /// positions descend into aggregates.
    pub(crate) fn step(
        &mut self,
        dl: &crate::ir::DataLayout,
        position: usize,
        index: i64,
    ) -> Result<i64, CodegenError> {
        use crate::ir::Type;
        if position == 0 {
            return Ok(dl.type_alloc_size(&self.current) as i64 * index);
        }
        match &self.current {
            Type::Struct { fields, .. } => {
                let offset = dl.struct_field_offset(&self.current, index as u32)?;
                let next = fields.get(index as usize).cloned().ok_or_else(|| {
                    CodegenError::unsupported_constant("struct GEP index out of range")
                })?;
                self.current = next;
                Ok(offset as i64)
            }
            Type::Array { elem, .. } | Type::Vector { elem, .. } => {
                let size = dl.type_alloc_size(elem) as i64;
                let next = (**elem).clone();
                self.current = next;
                Ok(size * index)
            }
            other => Err(CodegenError::unsupported_constant(format!(
                "GEP index into non-aggregate type {:?}",
                other
            ))),
        }
    }

    /// The element type reached after the previous step; used by dynamic
    /// GEP lowering to scale non-constant indices.
    pub(crate) fn element_size_for(
        &self,
        dl: &crate::ir::DataLayout,
        position: usize,
    ) -> Result<u32, CodegenError> {
        use crate::ir::Type;
        if position == 0 {
            return Ok(dl.type_alloc_size(&self.current));
        }
        match &self.current {
            Type::Array { elem, .. } | Type::Vector { elem, .. } => Ok(dl.type_alloc_size(elem)),
            other => Err(CodegenError::unsupported_instruction(format!(
                "dynamic GEP index into type {:?}",
                other
            ))),
        }
    }

    /// Descends for a dynamic (non-constant) index.
    pub(crate) fn step_dynamic(&mut self, position: usize) -> Result<(), CodegenError> {
        use crate::ir::Type;
        if position == 0 {
            return Ok(());
        }
        match &self.current {
            Type::Array { elem, .. } | Type::Vector { elem, .. } => {
                let next = (**elem).clone();
                self.current = next;
                Ok(())
            }
            other => Err(CodegenError::unsupported_instruction(format!(
                "dynamic GEP index into type {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_vectors_stay_aligned() {
        let mut layout = GlobalLayout::new();
        layout.allocate_address("a", 4).extend_from_slice(&[1, 2]);
        layout
            .allocate_address("b", 4)
            .extend_from_slice(&[3, 4, 5, 6]);
        // "b" starts at the next 4-aligned offset, not at 2.
        assert_eq!(layout.relative_address("b").unwrap(), 4);
    }

    #[test]
    fn larger_classes_are_placed_first() {
        let mut layout = GlobalLayout::new();
        layout.allocate_address("small", 1).extend_from_slice(&[1]);
        layout
            .allocate_address("big", 8)
            .extend_from_slice(&[0; 8]);
        layout.finalize(8, false);
        assert_eq!(layout.max_global_align, 8);
        // Base 8 is already 8-aligned: no padding. The 8-class vector sits
        // at the base, the 1-class vector after it.
        assert_eq!(layout.global_base_padding, 0);
        assert_eq!(layout.absolute_address("big").unwrap(), 8);
        assert_eq!(layout.absolute_address("small").unwrap(), 16);
    }

    #[test]
    fn global_base_padding_restores_max_alignment() {
        let mut layout = GlobalLayout::new();
        layout
            .allocate_address("v", 16)
            .extend_from_slice(&[0; 16]);
        layout.finalize(8, false);
        // Base 8 must be padded to the next multiple of 16.
        assert_eq!(layout.global_base_padding, 8);
        assert_eq!(layout.absolute_address("v").unwrap(), 16);
    }

    #[test]
    fn offsets_honor_alignment_invariant() {
        let mut layout = GlobalLayout::new();
        layout.allocate_address("a", 2).extend_from_slice(&[1]);
        layout.allocate_address("b", 2).extend_from_slice(&[2, 3]);
        layout.allocate_address("c", 8).extend_from_slice(&[0; 4]);
        layout.finalize(8, false);
        for (name, align) in [("a", 2), ("b", 2), ("c", 8)] {
            assert_eq!(layout.relative_address(name).unwrap() % align, 0);
            assert_eq!(layout.absolute_address(name).unwrap() % align, 0);
        }
        // Every class vector length is a multiple of its class.
        for (&class, data) in layout.data.iter() {
            assert_eq!(data.len() as u32 % class, 0);
        }
    }
}

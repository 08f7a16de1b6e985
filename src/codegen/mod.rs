//! The translation engine: IR module in, asm.js-style text out.
//!
//! Emission is a single serial pass per module: global constants are laid
//! out first (two phases), then every defined function is lowered in IR
//! order, then the deferred post-sets, the memory-initializer blob, and the
//! metadata manifest. Each section's backing data may be cleared once it is
//! written.

pub(crate) mod allocas;
pub mod calls;
pub(crate) mod control_flow;
pub(crate) mod expr;
pub(crate) mod layout;
pub(crate) mod mem;
pub(crate) mod metadata;
pub(crate) mod names;
pub(crate) mod simd;
pub(crate) mod tables;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::codegen::calls::{CallHandlerTable, InlineJsRegistry};
use crate::codegen::layout::GlobalLayout;
use crate::codegen::simd::simd_type;
use crate::codegen::tables::FunctionTableSet;
use crate::config::AsmJsConfig;
use crate::diagnostics::{CodegenError, CodegenWarning, Diagnostics, WarningKind};
use crate::ir::{BlockId, FunctionType, Module, Type, EXPECTED_TARGET_TRIPLE};
use crate::relooper::{FlowRecovery, LabelDispatch};

pub(crate) const DEFAULT_MEM_ALIGN: u32 = 8;
pub(crate) const STACK_ALIGN: u32 = 16;
pub(crate) const POST_SET_CHUNK: usize = 100;

/// The result of one module emission: the complete output text (function
/// bodies, post-sets, memory initializer, metadata manifest) plus any
/// warnings raised along the way.
#[derive(Debug)]
pub struct AsmJsOutput {
    pub source: String,
    pub warnings: Vec<CodegenWarning>,
}

/// Generates asm.js-style output for a module with the default call-handler
/// table and the built-in label-dispatch control-flow recovery.
pub fn generate_module(module: &Module, config: AsmJsConfig) -> Result<AsmJsOutput, CodegenError> {
    let mut recovery = LabelDispatch::new();
    generate_module_with(module, config, CallHandlerTable::default(), &mut recovery)
}

/// Like [`generate_module`], but with a caller-supplied call-handler table
/// (intrinsic and runtime-call policy) and control-flow recovery service.
pub fn generate_module_with(
    module: &Module,
    config: AsmJsConfig,
    handlers: CallHandlerTable,
    recovery: &mut dyn FlowRecovery,
) -> Result<AsmJsOutput, CodegenError> {
    config.validate()?;
    let mut emitter = ModuleEmitter::new(module, config, handlers);
    emitter.run(recovery)?;
    Ok(AsmJsOutput {
        source: emitter.out,
        warnings: emitter.diagnostics.warnings,
    })
}

/// Which SIMD.js types the emitted module touches. Published in metadata so
/// the consumer can emit the right polyfills.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SimdUse {
    pub int8x16: bool,
    pub int16x8: bool,
    pub int32x4: bool,
    pub float32x4: bool,
    pub float64x2: bool,
}

impl SimdUse {
    /// The aggregate flag the metadata publishes. Int16x8 has never been
    /// part of this disjunction in the consumer contract, so it stays out.
    pub(crate) fn any_published(&self) -> bool {
        self.int8x16 || self.int32x4 || self.float32x4 || self.float64x2
    }
}

pub(crate) struct ModuleEmitter<'ir> {
    pub(crate) module: &'ir Module,
    pub(crate) config: AsmJsConfig,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) out: String,

    /// Raw global symbol name -> mangled JS name.
    global_names: FxHashMap<String, String>,
    /// Per-global effective symbol names; unnamed globals get `glb_N`.
    pub(crate) global_effective_names: Vec<String>,

    pub(crate) layout: GlobalLayout,
    pub(crate) tables: FunctionTableSet,
    pub(crate) handlers: CallHandlerTable,
    pub(crate) inline_js: InlineJsRegistry,
    /// Per function: basic block -> dense index, assigned first-touch.
    block_addresses: FxHashMap<String, FxHashMap<BlockId, u32>>,

    pub(crate) declares: BTreeSet<String>,
    pub(crate) redirects: BTreeMap<String, String>,
    pub(crate) externals: BTreeSet<String>,
    pub(crate) global_initializers: Vec<String>,
    pub(crate) exports: Vec<String>,
    pub(crate) aliases: BTreeMap<String, String>,
    pub(crate) named_globals: BTreeMap<String, u32>,
    pub(crate) cant_validate: String,
    pub(crate) simd: SimdUse,
}

impl<'ir> ModuleEmitter<'ir> {
    pub(crate) fn new(
        module: &'ir Module,
        config: AsmJsConfig,
        handlers: CallHandlerTable,
    ) -> ModuleEmitter<'ir> {
        let tables = FunctionTableSet::new(
            config.reserved_function_pointers,
            config.no_aliasing_function_pointers,
        );
        ModuleEmitter {
            module,
            config,
            diagnostics: Diagnostics::new(),
            out: String::new(),
            global_names: FxHashMap::default(),
            global_effective_names: Vec::new(),
            layout: GlobalLayout::new(),
            tables,
            handlers,
            inline_js: InlineJsRegistry::new(),
            block_addresses: FxHashMap::default(),
            declares: BTreeSet::new(),
            redirects: BTreeMap::new(),
            externals: BTreeSet::new(),
            global_initializers: Vec::new(),
            exports: Vec::new(),
            aliases: BTreeMap::new(),
            named_globals: BTreeMap::new(),
            cant_validate: String::new(),
            simd: SimdUse::default(),
        }
    }

    pub(crate) fn run(&mut self, recovery: &mut dyn FlowRecovery) -> Result<(), CodegenError> {
        if self.module.target_triple != EXPECTED_TARGET_TRIPLE {
            self.diagnostics.warn(CodegenWarning::new(
                WarningKind::MismatchedTargetTriple,
                format!(
                    "incorrect target triple '{}' (expected '{}')",
                    self.module.target_triple, EXPECTED_TARGET_TRIPLE
                ),
            ));
        }

        self.assign_effective_global_names();
        self.process_constants()?;
        if self.config.relocatable {
            self.collect_aliases();
        }

        self.out.push_str("\n// EMSCRIPTEN_START_FUNCTIONS\n");
        let module = self.module;
        for function in &module.functions {
            if !function.is_declaration() {
                self.emit_function(function, recovery)?;
            }
        }
        self.emit_post_sets();
        self.out.push_str("// EMSCRIPTEN_END_FUNCTIONS\n\n");

        self.emit_memory_initializer();

        self.tables.round_to_powers_of_two();
        self.patch_function_table_masks();
        self.emit_metadata()?;
        Ok(())
    }

    // ========================================================================
    // Names and per-module bookkeeping
    // ========================================================================

    /// Gives every initialized global a usable symbol name; unnamed ones
    /// receive fresh `glb_N` names that do not collide with real globals.
    fn assign_effective_global_names(&mut self) {
        let mut next_id = 1u32;
        let module = self.module;
        for global in &module.globals {
            if !global.name.is_empty() {
                self.global_effective_names.push(global.name.clone());
                continue;
            }
            let mut candidate;
            loop {
                candidate = format!("glb_{}", next_id);
                next_id += 1;
                if module.find_global(&candidate).is_none() {
                    break;
                }
            }
            self.global_effective_names.push(candidate);
        }
    }

    pub(crate) fn global_js_name(&mut self, raw: &str) -> String {
        if let Some(name) = self.global_names.get(raw) {
            return name.clone();
        }
        let mangled = names::sanitize_global(raw);
        self.global_names.insert(raw.to_owned(), mangled.clone());
        mangled
    }

    pub(crate) fn block_address(&mut self, function: &str, block: BlockId) -> u32 {
        let blocks = self.block_addresses.entry(function.to_owned()).or_default();
        let next = blocks.len() as u32;
        *blocks.entry(block).or_insert(next)
    }

    fn collect_aliases(&mut self) {
        let module = self.module;
        for alias in &module.aliases {
            let resolved = module.resolve_fully(&alias.target);
            if let crate::ir::Constant::Global(target_name) = resolved {
                let key = self.global_js_name(&alias.name);
                let value = self.global_js_name(target_name);
                self.aliases.insert(key, value);
            }
        }
    }

    // ========================================================================
    // Types, signatures, SIMD bookkeeping
    // ========================================================================

    /// Validates a vector type's geometry and records which SIMD types the
    /// module uses.
    pub(crate) fn check_vector_type(&mut self, ty: &Type) -> Result<(), CodegenError> {
        let Some((elem, lanes)) = ty.vector_parts() else {
            return Err(CodegenError::unsupported_vector_type(format!(
                "expected a vector type, got {:?}",
                ty
            )));
        };
        let prim_size = simd::element_bits(elem)?;
        if prim_size * lanes > 128 || lanes > 16 {
            return Err(CodegenError::unsupported_vector_type(format!(
                "vector of {} x {} bits exceeds 128 bits",
                lanes, prim_size
            )));
        }
        if elem.is_integer() {
            match prim_size {
                8 if lanes <= 16 => self.simd.int8x16 = true,
                16 if lanes <= 8 => self.simd.int16x8 = true,
                32 if lanes <= 4 => self.simd.int32x4 = true,
                // Comparison results come in as vectors of i1; they borrow
                // the lane width of whatever compare produced them.
                1 | 128 => {}
                _ => {
                    return Err(CodegenError::unsupported_vector_type(format!(
                        "unsupported integer vector: {} lanes of {} bits",
                        lanes, prim_size
                    )));
                }
            }
        } else {
            match prim_size {
                32 if lanes <= 4 => self.simd.float32x4 = true,
                64 if lanes <= 2 => self.simd.float64x2 = true,
                _ => {
                    return Err(CodegenError::unsupported_vector_type(format!(
                        "unsupported float vector: {} lanes of {} bits",
                        lanes, prim_size
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn signature_letter(&mut self, ty: &Type) -> Result<char, CodegenError> {
        Ok(match ty {
            Type::Void => 'v',
            Type::Float => {
                if self.config.precise_f32 {
                    'f'
                } else {
                    'd'
                }
            }
            Type::Double => 'd',
            Type::Vector { elem, .. } => {
                self.check_vector_type(ty)?;
                if elem.is_integer() {
                    'I'
                } else {
                    'F'
                }
            }
            _ => 'i',
        })
    }

    pub(crate) fn function_signature(&mut self, sig: &FunctionType) -> Result<String, CodegenError> {
        let mut out = String::with_capacity(sig.params.len() + 1);
        out.push(self.signature_letter(&sig.ret)?);
        for param in &sig.params {
            out.push(self.signature_letter(param)?);
        }
        Ok(out)
    }

    /// Assigns (or returns) the table slot of a function known by raw name,
    /// recording redirect handlers for functions that are only ever indexed.
    pub(crate) fn function_index_for(&mut self, raw_name: &str) -> Result<u32, CodegenError> {
        let mangled = self.global_js_name(raw_name);
        if let Some(index) = self.tables.lookup_index(&mangled) {
            return Ok(index);
        }
        let sig = match self.module.find_function(raw_name) {
            Some(function) => {
                if function.is_declaration() {
                    self.declares.insert(raw_name.to_owned());
                }
                let fn_ty = FunctionType {
                    ret: function.ret.clone(),
                    params: function.params.iter().map(|p| p.ty.clone()).collect(),
                };
                self.function_signature(&fn_ty)?
            }
            None => {
                self.declares.insert(raw_name.to_owned());
                // Unknown externals get the universal `i` signature.
                "i".to_owned()
            }
        };
        let index = self.tables.function_index(&mangled, &sig);
        if let Some(calls::CallHandler::Redirect(target)) = self.handlers.lookup(raw_name) {
            let target = target.clone();
            self.redirects.insert(raw_name.to_owned(), target);
        }
        Ok(index)
    }

    // ========================================================================
    // Relocation helpers
    // ========================================================================

    pub(crate) fn relocate_function_pointer(&self, fp: String) -> String {
        if self.config.relocatable {
            format!("(fb + ({}) | 0)", fp)
        } else {
            fp
        }
    }

    pub(crate) fn relocate_global(&self, address: String) -> String {
        if self.config.relocatable {
            format!("(gb + ({}) | 0)", address)
        } else {
            address
        }
    }

    // ========================================================================
    // Module epilogue sections
    // ========================================================================

    /// Emits the deferred post-set assignments, split into functions of 100
    /// so no single function grows too large for JS engines to compile.
    /// Each chunk tail-calls the next.
    fn emit_post_sets(&mut self) {
        let post_sets = std::mem::take(&mut self.layout.post_sets);
        let total = post_sets.len();
        let mut index = 0;
        let mut chunk = 0;
        loop {
            if chunk == 0 {
                self.out.push_str("function runPostSets() {\n");
            } else {
                self.out
                    .push_str(&format!("function runPostSets{}() {{\n", chunk));
            }
            if self.config.relocatable {
                // A temp var keeps relocation thunk calls validation-friendly
                // under heap growth.
                self.out.push_str(" var temp = 0;\n");
            }
            let end = (index + POST_SET_CHUNK).min(total);
            while index < end {
                self.out.push_str(&post_sets[index]);
                self.out.push('\n');
                index += 1;
            }
            chunk += 1;
            if index < total {
                self.out.push_str(&format!(" runPostSets{}();\n", chunk));
            }
            self.out.push_str("}\n");
            if index >= total {
                break;
            }
        }
    }

    fn emit_memory_initializer(&mut self) {
        if self.config.enable_pthreads {
            // Workers share the main thread's heap; only the main runtime
            // applies the initializer.
            self.out.push_str("if (!ENVIRONMENT_IS_PTHREAD) {\n");
        }
        self.out.push_str("/* memory initializer */ allocate([");
        if self.layout.max_global_align > 0 {
            let mut first = true;
            for _ in 0..self.layout.global_base_padding {
                if !first {
                    self.out.push(',');
                }
                first = false;
                self.out.push('0');
            }
            // Larger alignment classes first; their vectors sit at the base.
            let data = std::mem::take(&mut self.layout.data);
            for bytes in data.values().rev() {
                if bytes.is_empty() {
                    continue;
                }
                if !first {
                    self.out.push(',');
                }
                first = false;
                let mut sep = false;
                for byte in bytes {
                    if sep {
                        self.out.push(',');
                    }
                    sep = true;
                    self.out.push_str(&byte.to_string());
                }
            }
        }
        self.out
            .push_str("], \"i8\", ALLOC_NONE, Runtime.GLOBAL_BASE);\n");
        if self.config.enable_pthreads {
            self.out.push_str("}\n");
        }
    }

    /// Replaces every `#FM_<sig>#` mask placeholder left in function bodies
    /// with the final (power-of-two minus one) mask of that table.
    fn patch_function_table_masks(&mut self) {
        let signatures: Vec<String> = self.tables.signatures().cloned().collect();
        for sig in signatures {
            let placeholder = tables::mask_placeholder(&sig);
            if self.out.contains(&placeholder) {
                let mask = self.tables.mask(&sig).to_string();
                self.out = self.out.replace(&placeholder, &mask);
            }
        }
    }

    /// Zero-value text for a declared local of the given type.
    pub(crate) fn var_initializer(&mut self, ty: &Type) -> Result<String, CodegenError> {
        Ok(match ty {
            Type::Int(_) | Type::Ptr(_) | Type::Func(_) => "0".to_owned(),
            Type::Float if self.config.precise_f32 => "Math_fround(0)".to_owned(),
            Type::Float | Type::Double => "+0".to_owned(),
            Type::Vector { .. } => {
                self.check_vector_type(ty)?;
                let name = simd_type(ty)?;
                let lanes = simd::padded_lane_count(ty)?;
                let mut init = format!("SIMD_{}(0", name);
                for _ in 1..lanes {
                    init.push_str(",0");
                }
                init.push(')');
                init
            }
            _ => {
                return Err(CodegenError::unsupported_instruction(format!(
                    "unsupported local variable type {:?}",
                    ty
                )));
            }
        })
    }
}

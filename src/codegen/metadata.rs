//! The metadata manifest appended after the module body.
//!
//! The downstream consumer reads this JSON object to learn what the module
//! declares, exports, and requires: external symbols, function tables,
//! static constructors, SIMD usage, and the named-globals map under
//! relocation. Field order is part of the (informal) contract, so the
//! struct's declaration order matters.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::codegen::ModuleEmitter;
use crate::diagnostics::CodegenError;

#[derive(Serialize)]
struct MetadataManifest {
    declares: Vec<String>,
    redirects: BTreeMap<String, String>,
    externs: Vec<String>,
    #[serde(rename = "implementedFunctions")]
    implemented_functions: Vec<String>,
    tables: BTreeMap<String, String>,
    initializers: Vec<String>,
    exports: Vec<String>,
    aliases: BTreeMap<String, String>,
    #[serde(rename = "cantValidate")]
    cant_validate: String,
    simd: u8,
    #[serde(rename = "simdInt8x16")]
    simd_int8x16: u8,
    #[serde(rename = "simdInt16x8")]
    simd_int16x8: u8,
    #[serde(rename = "simdInt32x4")]
    simd_int32x4: u8,
    #[serde(rename = "simdFloat32x4")]
    simd_float32x4: u8,
    #[serde(rename = "simdFloat64x2")]
    simd_float64x2: u8,
    #[serde(rename = "maxGlobalAlign")]
    max_global_align: u32,
    #[serde(rename = "namedGlobals")]
    named_globals: BTreeMap<String, String>,
    #[serde(rename = "asmConsts")]
    asm_consts: BTreeMap<u32, String>,
    #[serde(rename = "asmConstArities")]
    asm_const_arities: BTreeMap<u32, Vec<u32>>,
}

impl<'ir> ModuleEmitter<'ir> {
    pub(crate) fn emit_metadata(&mut self) -> Result<(), CodegenError> {
        let module = self.module;
        let mut implemented_functions = Vec::new();
        for function in &module.functions {
            if !function.is_declaration() {
                implemented_functions.push(self.global_js_name(&function.name));
            }
        }

        let mut tables = BTreeMap::new();
        for (sig, table) in self.tables.iter() {
            tables.insert(
                sig.clone(),
                format!("var FUNCTION_TABLE_{} = [{}];", sig, table.join(",")),
            );
        }

        let redirects = self
            .redirects
            .iter()
            .map(|(from, to)| (format!("_{}", from), to.clone()))
            .collect();

        let named_globals = self
            .named_globals
            .iter()
            .map(|(name, address)| (name.clone(), address.to_string()))
            .collect();

        let manifest = MetadataManifest {
            declares: self.declares.iter().cloned().collect(),
            redirects,
            externs: self.externals.iter().cloned().collect(),
            implemented_functions,
            tables,
            initializers: std::mem::take(&mut self.global_initializers),
            exports: std::mem::take(&mut self.exports),
            aliases: std::mem::take(&mut self.aliases),
            cant_validate: self.cant_validate.clone(),
            simd: self.simd.any_published() as u8,
            simd_int8x16: self.simd.int8x16 as u8,
            simd_int16x8: self.simd.int16x8 as u8,
            simd_int32x4: self.simd.int32x4 as u8,
            simd_float32x4: self.simd.float32x4 as u8,
            simd_float64x2: self.simd.float64x2 as u8,
            max_global_align: self.layout.max_global_align,
            named_globals,
            asm_consts: self.inline_js.codes_by_id(),
            asm_const_arities: self.inline_js.arities_by_id(),
        };
        let rendered = serde_json::to_string_pretty(&manifest)
            .expect("metadata manifest serialization is infallible");
        self.out.push_str("\n\n// EMSCRIPTEN_METADATA\n");
        self.out.push_str(&rendered);
        self.out.push('\n');
        Ok(())
    }
}

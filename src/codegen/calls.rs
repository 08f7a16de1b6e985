//! Call dispatch.
//!
//! Direct calls consult a handler table keyed by callee name: the host
//! injects its intrinsic and runtime-call policy there, and anything without
//! an entry gets the default lowering (a plain call with per-argument FFI
//! coercions). Indirect calls go through the per-signature function table,
//! masked to the table's power-of-two length, or through `ftCall_<sig>`
//! emulation when function pointers are emulated.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::codegen::control_flow::FunctionLowerer;
use crate::codegen::expr::{
    Stripped, ASM_FFI_IN, ASM_FFI_OUT, ASM_NONSPECIFIC, ASM_SIGNED,
};
use crate::codegen::tables::mask_placeholder;
use crate::diagnostics::CodegenError;
use crate::ir::{Callee, Constant, InstKind, Instruction, Operand, Type};

/// How a named callee is lowered.
#[derive(Debug, Clone, PartialEq)]
pub enum CallHandler {
    /// Plain call with FFI coercions.
    Default,
    /// Emit nothing (debug markers, lifetime intrinsics).
    Ignore,
    /// The callee is an inline-JS marker; its first argument is the code.
    InlineJs,
    /// Call a different (runtime library) function instead.
    Redirect(String),
}

/// Callee name -> handler. Hosts extend this with their intrinsic policy.
#[derive(Debug, Clone)]
pub struct CallHandlerTable {
    handlers: FxHashMap<String, CallHandler>,
}

impl CallHandlerTable {
    pub fn new() -> CallHandlerTable {
        CallHandlerTable {
            handlers: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: CallHandler) {
        self.handlers.insert(name.into(), handler);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&CallHandler> {
        self.handlers.get(name)
    }

    pub(crate) fn resolve(&self, name: &str) -> CallHandler {
        if let Some(handler) = self.handlers.get(name) {
            return handler.clone();
        }
        // The inline-JS markers are suffixed by return-type spellings and
        // appear with many names; match on the stem.
        if name.starts_with("emscripten_asm_const") {
            return CallHandler::InlineJs;
        }
        CallHandler::Default
    }
}

impl Default for CallHandlerTable {
    /// Registers the intrinsics that never lower to code. Everything else is
    /// host policy.
    fn default() -> CallHandlerTable {
        let mut table = CallHandlerTable::new();
        for name in [
            "llvm.dbg.declare",
            "llvm.dbg.value",
            "llvm.lifetime.start",
            "llvm.lifetime.end",
            "llvm.invariant.start",
            "llvm.invariant.end",
            "llvm.prefetch",
        ] {
            table.register(name, CallHandler::Ignore);
        }
        table
    }
}

/// Inline-JS bodies, deduplicated by text, with the argument counts seen at
/// their call sites.
#[derive(Debug, Default)]
pub(crate) struct InlineJsRegistry {
    ids: BTreeMap<String, u32>,
    arities: BTreeMap<u32, BTreeSet<u32>>,
}

impl InlineJsRegistry {
    pub(crate) fn new() -> InlineJsRegistry {
        InlineJsRegistry::default()
    }

    pub(crate) fn id_for(&mut self, code: String, arity: u32) -> u32 {
        let next = self.ids.len() as u32;
        let id = *self.ids.entry(code).or_insert(next);
        self.arities.entry(id).or_default().insert(arity);
        id
    }

    pub(crate) fn codes_by_id(&self) -> BTreeMap<u32, String> {
        self.ids
            .iter()
            .map(|(code, id)| (*id, code.clone()))
            .collect()
    }

    pub(crate) fn arities_by_id(&self) -> BTreeMap<u32, Vec<u32>> {
        self.arities
            .iter()
            .map(|(id, set)| (*id, set.iter().copied().collect()))
            .collect()
    }
}

/// Unescapes nothing; escapes newline sequences and quotes so the body can
/// travel inside the JSON metadata.
fn escape_inline_js(bytes: &[u8]) -> String {
    let trimmed = match bytes.last() {
        Some(0) => &bytes[..bytes.len() - 1],
        _ => bytes,
    };
    let code = String::from_utf8_lossy(trimmed).replace("\\n", "\\\\n");
    let mut out = String::with_capacity(code.len());
    let mut prev = '\0';
    for ch in code.chars() {
        if ch == '"' {
            if prev == '\\' {
                // The slash needs escaping as well.
                out.push('\\');
            }
            out.push('\\');
            out.push('"');
        } else {
            out.push(ch);
        }
        prev = ch;
    }
    out
}

impl<'a, 'ir> FunctionLowerer<'a, 'ir> {
    /// Lowers a call instruction. `None` means the call vanishes entirely.
    pub(crate) fn handle_call(
        &mut self,
        inst: &'ir Instruction,
    ) -> Result<Option<String>, CodegenError> {
        let InstKind::Call { callee, args } = &inst.kind else {
            unreachable!("handle_call on a non-call");
        };
        match callee {
            Callee::Indirect { pointer, sig } => {
                let sig_str = self.em.function_signature(sig)?;
                let pointer_text = self.value_str(pointer, ASM_SIGNED)?;
                let mut rendered = Vec::with_capacity(args.len());
                for arg in args {
                    rendered.push(self.value_as_cast_str(arg, ASM_NONSPECIFIC)?);
                }
                let call = if self.em.config.emulated_function_pointers {
                    let mut text = format!("ftCall_{}({}|0", sig_str, pointer_text);
                    for arg in &rendered {
                        text.push_str(&format!(",{}", arg));
                    }
                    text.push(')');
                    text
                } else {
                    self.em.tables.ensure_table(&sig_str);
                    format!(
                        "FUNCTION_TABLE_{}[{} & {}]({})",
                        sig_str,
                        pointer_text,
                        mask_placeholder(&sig_str),
                        rendered.join(",")
                    )
                };
                self.finish_call(inst, call, false).map(Some)
            }
            Callee::Direct(name) => match self.em.handlers.resolve(name) {
                CallHandler::Ignore => Ok(None),
                CallHandler::InlineJs => self.inline_js_call(inst, args).map(Some),
                CallHandler::Redirect(target) => {
                    self.em.redirects.insert(name.clone(), target.clone());
                    self.em.declares.insert(target.clone());
                    self.direct_call_text(inst, &target, args, true).map(Some)
                }
                CallHandler::Default => {
                    let ffi = match self.em.module.find_function(name) {
                        Some(function) => function.is_declaration(),
                        None => true,
                    };
                    if ffi {
                        self.em.declares.insert(name.clone());
                    }
                    self.direct_call_text(inst, name, args, ffi).map(Some)
                }
            },
        }
    }

    fn direct_call_text(
        &mut self,
        inst: &'ir Instruction,
        raw_name: &str,
        args: &'ir [Operand],
        ffi: bool,
    ) -> Result<String, CodegenError> {
        let mangled = self.em.global_js_name(raw_name);
        let arg_sign = ASM_NONSPECIFIC | if ffi { ASM_FFI_OUT } else { 0 };
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            rendered.push(self.value_as_cast_str(arg, arg_sign)?);
        }
        let call = format!("{}({})", mangled, rendered.join(","));
        self.finish_call(inst, call, ffi)
    }

    fn inline_js_call(
        &mut self,
        inst: &'ir Instruction,
        args: &'ir [Operand],
    ) -> Result<String, CodegenError> {
        let Some(first) = args.first() else {
            return Err(CodegenError::unsupported_instruction(
                "inline-JS call without a code argument",
            ));
        };
        let code = self.inline_js_code(first)?;
        let arity = (args.len() - 1) as u32;
        let id = self.em.inline_js.id_for(code, arity);
        let mut rendered = Vec::with_capacity(args.len() - 1);
        for arg in &args[1..] {
            rendered.push(self.value_as_cast_str(arg, ASM_NONSPECIFIC)?);
        }
        self.em
            .declares
            .insert(format!("emscripten_asm_const_{}", id));
        let call = format!("_emscripten_asm_const_{}({})", id, rendered.join(","));
        self.finish_call(inst, call, true)
    }

    /// Resolves an inline-JS marker's code argument to the body text: a
    /// pointer to a string global (or a zero initializer for empty bodies).
    fn inline_js_code(&mut self, op: &'ir Operand) -> Result<String, CodegenError> {
        let Stripped::Con(constant) = self.strip_operand(op) else {
            return Err(CodegenError::unsupported_instruction(
                "inline-JS code argument is not a constant",
            ));
        };
        let resolved = self.em.module.resolve_fully(constant);
        let Constant::Global(name) = resolved else {
            return Err(CodegenError::unsupported_instruction(
                "inline-JS code argument does not name a global",
            ));
        };
        let global = self
            .em
            .module
            .find_global(name)
            .ok_or_else(|| CodegenError::missing_global_address(name))?;
        match &global.init {
            Some(Constant::AggregateZero(_)) => Ok(" ".to_owned()),
            Some(Constant::Str(bytes)) => Ok(escape_inline_js(bytes)),
            _ => Err(CodegenError::unsupported_constant(
                "inline-JS body must be a string constant",
            )),
        }
    }

    /// Attaches the result assignment and return-type coercion to a call.
    fn finish_call(
        &mut self,
        inst: &'ir Instruction,
        call: String,
        ffi: bool,
    ) -> Result<String, CodegenError> {
        if inst.ty == Type::Void || !self.is_used(inst.id) {
            return Ok(call);
        }
        let sign = ASM_NONSPECIFIC | if ffi { ASM_FFI_IN } else { 0 };
        let assign = self.get_assign(inst)?;
        Ok(format!("{}{}", assign, self.get_cast(&call, &inst.ty, sign)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_js_bodies_are_deduplicated() {
        let mut registry = InlineJsRegistry::new();
        let a = registry.id_for("console.log('x')".to_owned(), 0);
        let b = registry.id_for("console.log('x')".to_owned(), 2);
        let c = registry.id_for("console.log('y')".to_owned(), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let arities = registry.arities_by_id();
        assert_eq!(arities[&a], vec![0, 2]);
        assert_eq!(arities[&c], vec![1]);
    }

    #[test]
    fn quote_escaping_keeps_prior_escapes() {
        assert_eq!(escape_inline_js(b"say(\"hi\")\0"), "say(\\\"hi\\\")");
        // An already-escaped quote gets its backslash escaped as well.
        assert_eq!(escape_inline_js(b"x = \\\"y\\\""), "x = \\\\\\\"y\\\\\\\"");
    }

    #[test]
    fn handler_resolution_prefers_exact_entries() {
        let mut table = CallHandlerTable::default();
        table.register("memcpy", CallHandler::Redirect("_memcpy".to_owned()));
        assert_eq!(
            table.resolve("memcpy"),
            CallHandler::Redirect("_memcpy".to_owned())
        );
        assert_eq!(table.resolve("llvm.dbg.declare"), CallHandler::Ignore);
        assert_eq!(
            table.resolve("emscripten_asm_const_int"),
            CallHandler::InlineJs
        );
        assert_eq!(table.resolve("printf"), CallHandler::Default);
    }
}

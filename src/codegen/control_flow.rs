//! Per-function lowering: blocks and branch edges are registered with a
//! structured-control-flow recovery session, whose rendered output is then
//! spliced into the emitted function body between the local declarations
//! and the closing brace.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::codegen::allocas::{instruction_operands, FrameAnalysis};
use crate::codegen::expr::{ASM_MUST_CAST, ASM_NONSPECIFIC, ASM_SIGNED};
use crate::codegen::{ModuleEmitter, STACK_ALIGN};
use crate::diagnostics::CodegenError;
use crate::ir::{
    BasicBlock, BlockId, Constant, Function, InstKind, Instruction, Operand, Param, Terminator,
    Type, ValueId,
};
use crate::relooper::{BlockHandle, FlowRecovery, SessionOptions};

impl<'ir> ModuleEmitter<'ir> {
    pub(crate) fn emit_function(
        &mut self,
        func: &'ir Function,
        recovery: &mut dyn FlowRecovery,
    ) -> Result<(), CodegenError> {
        FunctionLowerer::new(self, func).run(recovery)
    }
}

/// Scratch state for lowering one function. Dropped (and therefore cleared)
/// at the function boundary.
pub(crate) struct FunctionLowerer<'a, 'ir> {
    pub(crate) em: &'a mut ModuleEmitter<'ir>,
    pub(crate) func: &'ir Function,
    pub(crate) value_names: FxHashMap<ValueId, String>,
    pub(crate) unique_num: u32,
    /// Locals that need a `var` declaration, with their types. Ordered so
    /// declarations are deterministic.
    pub(crate) used_vars: BTreeMap<String, Type>,
    pub(crate) frame: FrameAnalysis,
    pub(crate) stack_bumped: bool,
    /// Externals referenced in this function under relocation; loaded once
    /// at entry.
    pub(crate) reloc_externs: BTreeSet<String>,
    use_counts: FxHashMap<ValueId, u32>,
    users: FxHashMap<ValueId, Vec<ValueId>>,
    defs: FxHashMap<ValueId, (usize, usize)>,
    params_by_id: FxHashMap<ValueId, usize>,
}

impl<'a, 'ir> FunctionLowerer<'a, 'ir> {
    fn new(em: &'a mut ModuleEmitter<'ir>, func: &'ir Function) -> FunctionLowerer<'a, 'ir> {
        let frame = FrameAnalysis::analyze(
            func,
            &em.module.data_layout,
            em.config.optimization_level == 0,
        );
        let mut defs = FxHashMap::default();
        let mut use_counts: FxHashMap<ValueId, u32> = FxHashMap::default();
        let mut users: FxHashMap<ValueId, Vec<ValueId>> = FxHashMap::default();
        let mut params_by_id = FxHashMap::default();
        for (index, param) in func.params.iter().enumerate() {
            params_by_id.insert(param.id, index);
        }
        for (block_index, block) in func.blocks.iter().enumerate() {
            for (inst_index, inst) in block.insts.iter().enumerate() {
                defs.insert(inst.id, (block_index, inst_index));
                for operand in instruction_operands(&inst.kind) {
                    if let Operand::Value(id) = operand {
                        *use_counts.entry(*id).or_insert(0) += 1;
                        users.entry(*id).or_default().push(inst.id);
                    }
                }
            }
            for operand in block.term.operands() {
                if let Operand::Value(id) = operand {
                    *use_counts.entry(*id).or_insert(0) += 1;
                }
            }
        }
        FunctionLowerer {
            em,
            func,
            value_names: FxHashMap::default(),
            unique_num: 0,
            used_vars: BTreeMap::new(),
            frame,
            stack_bumped: false,
            reloc_externs: BTreeSet::new(),
            use_counts,
            users,
            defs,
            params_by_id,
        }
    }

    // ========================================================================
    // Value lookups
    // ========================================================================

    pub(crate) fn def(&self, id: ValueId) -> Option<&'ir Instruction> {
        self.defs
            .get(&id)
            .map(|&(block, inst)| &self.func.blocks[block].insts[inst])
    }

    pub(crate) fn param(&self, id: ValueId) -> Option<&'ir Param> {
        self.params_by_id.get(&id).map(|&i| &self.func.params[i])
    }

    pub(crate) fn is_used(&self, id: ValueId) -> bool {
        self.use_counts.get(&id).copied().unwrap_or(0) > 0
    }

    pub(crate) fn users_of(&self, id: ValueId) -> &[ValueId] {
        self.users.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    // ========================================================================
    // Driver
    // ========================================================================

    fn run(mut self, recovery: &mut dyn FlowRecovery) -> Result<(), CodegenError> {
        let func = self.func;
        crate::codegen_log!("lowering function '{}'", func.name);
        let name = self.em.global_js_name(&func.name);

        // Lower the body first; local declarations depend on what it used.
        let mut session = recovery.new_session(SessionOptions {
            minimize_size: func.attrs.min_size || func.attrs.optimize_for_size,
        });
        let mut handles: FxHashMap<BlockId, BlockHandle> = FxHashMap::default();
        for block in &func.blocks {
            let text = self.block_text(block)?;
            let condition = self.condition_variable_text(&block.term)?;
            handles.insert(block.id, session.add_block(text, condition));
        }
        for block in &func.blocks {
            self.add_branches(block, session.as_mut(), &handles)?;
        }
        session.calculate(handles[&func.blocks[0].id]);
        let rendered = session.render();

        self.used_vars.insert("sp".to_owned(), Type::Int(32));
        if self.frame.max_alignment() > STACK_ALIGN {
            self.used_vars.insert("sp_a".to_owned(), Type::Int(32));
        }
        self.used_vars.insert("label".to_owned(), Type::Int(32));

        // Signature and parameter coercions.
        let mut header = format!("function {}(", name);
        for (index, param) in func.params.iter().enumerate() {
            if index > 0 {
                header.push(',');
            }
            header.push_str(&self.local_name(param.id)?);
        }
        header.push_str(") {\n");
        for param in &func.params {
            let pname = self.local_name(param.id)?;
            let coerced = self.get_cast(&pname, &param.ty, ASM_NONSPECIFIC)?;
            header.push_str(&format!(" {} = {};\n", pname, coerced));
        }
        self.em.out.push_str(&header);

        self.emit_var_declarations()?;
        if self.em.config.optimization_level < 2 && self.used_vars.len() > 2000 {
            self.em
                .diagnostics
                .warn_too_many_locals(&func.name, self.used_vars.len());
        }

        // Stack entry.
        self.em.out.push_str(" sp = STACKTOP;\n");
        let frame_size = self.frame.frame_size();
        if frame_size > 0 {
            let max_alignment = self.frame.max_alignment();
            if max_alignment > STACK_ALIGN {
                self.em.out.push_str(&format!(
                    " sp_a = STACKTOP = (STACKTOP + {})&-{};\n",
                    max_alignment - 1,
                    max_alignment
                ));
            }
            let bump = self.stack_bump(&frame_size.to_string());
            self.em.out.push_str(&format!(" {}\n", bump));
        }

        // Externals are loaded once at entry under relocation, so a heap
        // access never hides a call.
        if self.em.config.relocatable && !self.reloc_externs.is_empty() {
            let externs = std::mem::take(&mut self.reloc_externs);
            for name in externs {
                self.em
                    .out
                    .push_str(&format!("t${} = g${}() | 0;\n", name, name));
            }
        }

        self.em.out.push_str(&rendered);
        if !rendered.ends_with('\n') {
            self.em.out.push('\n');
        }

        if let Some(final_return) = self.final_return_if_missing(&rendered)? {
            self.em.out.push_str(&final_return);
        }
        self.em.out.push_str("}\n");

        if self.em.config.relocatable && !func.internal {
            let exported = self.em.global_js_name(&func.name);
            self.em.exports.push(exported);
        }
        Ok(())
    }

    pub(crate) fn stack_bump(&self, size: &str) -> String {
        let mut bump = format!("STACKTOP = STACKTOP + {}|0;", size);
        if self.em.config.assertions > 0 {
            bump.push_str(" if ((STACKTOP|0) >= (STACK_MAX|0)) abort();");
        }
        bump
    }

    fn emit_var_declarations(&mut self) -> Result<(), CodegenError> {
        if self.used_vars.is_empty() {
            return Ok(());
        }
        let vars: Vec<(String, Type)> = self
            .used_vars
            .iter()
            .map(|(name, ty)| (name.clone(), ty.clone()))
            .collect();
        let mut count = 0;
        for (name, ty) in &vars {
            if count == 20 {
                self.em.out.push_str(";\n");
                count = 0;
            }
            if count == 0 {
                self.em.out.push_str(" var ");
            } else {
                self.em.out.push_str(", ");
            }
            count += 1;
            let init = self.em.var_initializer(ty)?;
            self.em.out.push_str(&format!("{} = {}", name, init));
        }
        self.em.out.push_str(";\n");
        Ok(())
    }

    /// If the rendered body cannot end by falling off a `return`, appends a
    /// typed default return so the output stays type-checkable.
    fn final_return_if_missing(&mut self, rendered: &str) -> Result<Option<String>, CodegenError> {
        if self.func.ret == Type::Void {
            return Ok(None);
        }
        let search_from = rendered.rfind('}').unwrap_or(0);
        if rendered[search_from..].contains("return ") {
            return Ok(None);
        }
        let undef = Constant::Undef(self.func.ret.clone());
        let value = self.constant_str(&undef, ASM_NONSPECIFIC)?;
        let cast = self.get_paren_cast(&value, &self.func.ret.clone(), ASM_NONSPECIFIC)?;
        Ok(Some(format!(" return {};\n", cast)))
    }

    // ========================================================================
    // Blocks and edges
    // ========================================================================

    /// Lowered text of every non-φ, non-terminator instruction in a block,
    /// plus the return/unreachable tail when the block ends the function.
    fn block_text(&mut self, block: &'ir BasicBlock) -> Result<String, CodegenError> {
        let mut code = String::new();
        for inst in &block.insts {
            if matches!(inst.kind, InstKind::Phi { .. }) {
                // φs are resolved on the incoming edges.
                continue;
            }
            if self.is_pointer_identity(inst) {
                continue;
            }
            self.generate_expression(inst, &mut code)?;
        }
        match &block.term {
            Terminator::Ret(value) => {
                if self.stack_bumped {
                    code.push_str("STACKTOP = sp;");
                }
                code.push_str("return");
                if let Some(value) = value {
                    code.push(' ');
                    code.push_str(
                        &self.value_as_cast_paren_str(value, ASM_NONSPECIFIC | ASM_MUST_CAST)?,
                    );
                }
                code.push_str(";\n");
            }
            Terminator::Unreachable => {
                // An abort typically precedes these; nothing to execute.
                code.push_str("// unreachable\n");
            }
            _ => {}
        }
        Ok(code)
    }

    /// Switch-like terminators dispatch on a condition variable; everything
    /// else lets the recovery service inline conditions. LLVM switches are
    /// trusted as-is: too-big or too-sparse ones were split upstream.
    fn uses_condition_variable(term: &Terminator) -> bool {
        matches!(
            term,
            Terminator::Switch { .. } | Terminator::IndirectBr { .. }
        )
    }

    fn condition_variable_text(
        &mut self,
        term: &'ir Terminator,
    ) -> Result<Option<String>, CodegenError> {
        if !Self::uses_condition_variable(term) {
            return Ok(None);
        }
        match term {
            Terminator::Switch { cond, .. } => {
                Ok(Some(self.value_as_cast_str(cond, ASM_SIGNED)?))
            }
            Terminator::IndirectBr { addr, .. } => {
                Ok(Some(self.value_as_cast_str(addr, ASM_SIGNED)?))
            }
            _ => Ok(None),
        }
    }

    fn add_branches(
        &mut self,
        block: &'ir BasicBlock,
        session: &mut dyn crate::relooper::FlowSession,
        handles: &FxHashMap<BlockId, BlockHandle>,
    ) -> Result<(), CodegenError> {
        let from = handles[&block.id];
        match &block.term {
            Terminator::Br(target) => {
                let phi = self.phi_code(block.id, *target)?;
                session.add_branch(from, handles[target], None, phi);
            }
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let condition = self.value_str(cond, ASM_SIGNED)?;
                let then_phi = self.phi_code(block.id, *then_dest)?;
                let else_phi = self.phi_code(block.id, *else_dest)?;
                session.add_branch(from, handles[then_dest], Some(condition), then_phi);
                session.add_branch(from, handles[else_dest], None, else_phi);
            }
            Terminator::IndirectBr { dests, .. } => {
                let mut seen: FxHashSet<BlockId> = FxHashSet::default();
                let mut have_default = false;
                for dest in dests {
                    if !seen.insert(*dest) {
                        continue;
                    }
                    let phi = self.phi_code(block.id, *dest)?;
                    let selector = if have_default {
                        let index = self.em.block_address(&self.func.name, *dest);
                        Some(format!("case {}: ", index))
                    } else {
                        // The first destination becomes the default; the IR
                        // gives us nothing better to pick.
                        have_default = true;
                        None
                    };
                    session.add_branch(from, handles[dest], selector, phi);
                }
            }
            Terminator::Switch {
                cond,
                default,
                cases,
            } => {
                let use_switch = Self::uses_condition_variable(&block.term);
                let default_phi = self.phi_code(block.id, *default)?;
                session.add_branch(from, handles[default], None, default_phi);

                let mut conditions: BTreeMap<BlockId, String> = BTreeMap::new();
                for (value, dest) in cases {
                    let condition = if use_switch {
                        format!("case {}: ", value)
                    } else {
                        format!(
                            "({} == {})",
                            self.value_as_cast_paren_str(cond, ASM_SIGNED)?,
                            value
                        )
                    };
                    let existing = conditions.entry(*dest).or_default();
                    let joiner = if !use_switch && !existing.is_empty() {
                        " | "
                    } else {
                        ""
                    };
                    *existing = format!("{}{}{}", condition, joiner, existing);
                }
                let mut processed: FxHashSet<BlockId> = FxHashSet::default();
                for (_, dest) in cases {
                    if !processed.insert(*dest) {
                        continue;
                    }
                    if dest == default {
                        // The default edge already covers it.
                        continue;
                    }
                    let phi = self.phi_code(block.id, *dest)?;
                    let condition = conditions.get(dest).cloned();
                    session.add_branch(from, handles[dest], condition, phi);
                }
            }
            Terminator::Ret(_) | Terminator::Unreachable => {}
        }
        Ok(())
    }

    // ========================================================================
    // φ resolution
    // ========================================================================

    /// Assignment code for the φs in `to` whose incoming edge is `from`.
    ///
    /// φs in the same block may read each other; assignments are ordered by
    /// their dependencies and cycles are broken by copying the old value
    /// into a `<var>$phi` temporary first.
    fn phi_code(&mut self, from: BlockId, to: BlockId) -> Result<Option<String>, CodegenError> {
        let to_block = self
            .func
            .block(to)
            .ok_or_else(|| CodegenError::unsupported_branch(format!("missing block {:?}", to)))?;

        let mut phi_vars: BTreeSet<String> = BTreeSet::new();
        for inst in &to_block.insts {
            let InstKind::Phi { .. } = inst.kind else {
                break;
            };
            phi_vars.insert(self.local_name(inst.id)?);
        }
        if phi_vars.is_empty() {
            return Ok(None);
        }

        let mut assigns: BTreeMap<String, String> = BTreeMap::new();
        let mut values: BTreeMap<String, &'ir Operand> = BTreeMap::new();
        let mut types: BTreeMap<String, &'ir Type> = BTreeMap::new();
        let mut deps: BTreeMap<String, String> = BTreeMap::new();
        for inst in &to_block.insts {
            let InstKind::Phi { incoming } = &inst.kind else {
                break;
            };
            let Some((_, operand)) = incoming.iter().find(|(pred, _)| *pred == from) else {
                continue;
            };
            let name = self.local_name(inst.id)?;
            assigns.insert(name.clone(), self.get_assign(inst)?);
            types.insert(name.clone(), &inst.ty);
            values.insert(name.clone(), operand);
            // A φ that reads another φ of the same block is a dependency;
            // stripped the same way expression translation strips operands.
            if let crate::codegen::expr::Stripped::Value(id) = self.strip_operand(operand) {
                if let Some(def) = self.def(id) {
                    if matches!(def.kind, InstKind::Phi { .. })
                        && to_block.insts.iter().any(|i| i.id == id)
                    {
                        let dep_name = self.local_name(id)?;
                        if phi_vars.contains(&dep_name) {
                            deps.insert(name.clone(), dep_name);
                        }
                    }
                }
            }
        }

        // Emit assignments topologically: a φ that reads another φ's old
        // value must be assigned before the φ it reads. When no assignment
        // is free the remaining ones form a cycle; break it by saving one
        // incoming value into a `<var>$phi` temporary.
        let mut pre = String::new();
        let mut post = String::new();
        let mut broken: BTreeMap<String, String> = BTreeMap::new();
        while !assigns.is_empty() {
            let free = assigns
                .keys()
                .find(|name| {
                    !assigns
                        .keys()
                        .any(|reader| reader != *name && deps.get(reader) == Some(*name))
                })
                .cloned();
            match free {
                Some(name) => {
                    let value_text = match broken.get(&name) {
                        Some(temp) => temp.clone(),
                        None => self.value_str(values[&name], ASM_SIGNED)?,
                    };
                    post.push_str(&assigns[&name]);
                    post.push_str(&value_text);
                    post.push(';');
                    assigns.remove(&name);
                    deps.remove(&name);
                }
                None => {
                    let name = assigns
                        .keys()
                        .find(|name| deps.contains_key(*name))
                        .cloned()
                        .expect("a stuck φ set must contain a dependency cycle");
                    let temp = format!("{}$phi", name);
                    pre.push_str(&self.ad_hoc_assign(&temp, types[&name])?);
                    pre.push_str(&self.value_str(values[&name], ASM_SIGNED)?);
                    pre.push(';');
                    broken.insert(name.clone(), temp);
                    deps.remove(&name);
                }
            }
        }
        Ok(Some(format!("{}{}", pre, post)))
    }
}

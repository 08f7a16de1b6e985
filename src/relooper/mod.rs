//! Structured-control-flow recovery service.
//!
//! The generator does not reconstruct structured control flow itself; it
//! hands a block graph to a recovery session and splices the rendered result
//! into the function body. The production-quality relooper lives outside
//! this crate — [`FlowRecovery`] is the seam it plugs into.
//!
//! The crate ships [`LabelDispatch`], the universal fallback renderer: a
//! `while (1) switch (label | 0)` dispatch loop. It is correct for arbitrary
//! graphs and keeps the generator usable and testable on its own; it just
//! produces slower output than a real relooper on reducible control flow.

/// Handle to a block registered with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(pub usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Prefer smaller output over readability (set for functions marked
    /// min-size or optimize-for-size).
    pub minimize_size: bool,
}

/// One recovery session, used for a single function.
///
/// Blocks are added with their already-lowered body text and, when the block
/// ends in a switch-like terminator, the condition expression to dispatch
/// on. Branches carry an optional selector (a condition expression, or
/// `case N: ` labels when the source block dispatches on a condition
/// variable) and optional φ-resolution code to run when the edge is taken.
pub trait FlowSession {
    fn add_block(&mut self, code: String, switch_condition: Option<String>) -> BlockHandle;

    fn add_branch(
        &mut self,
        from: BlockHandle,
        to: BlockHandle,
        condition: Option<String>,
        phi_code: Option<String>,
    );

    fn calculate(&mut self, entry: BlockHandle);

    fn render(&mut self) -> String;
}

/// Factory for recovery sessions. One per module emission; implementations
/// may recycle scratch buffers between functions.
pub trait FlowRecovery {
    fn new_session(&mut self, options: SessionOptions) -> Box<dyn FlowSession>;
}

// ============================================================================
// Label-dispatch implementation
// ============================================================================

struct Branch {
    to: usize,
    condition: Option<String>,
    phi_code: Option<String>,
}

struct BlockData {
    code: String,
    switch_condition: Option<String>,
    branches: Vec<Branch>,
}

/// The shipped dispatch-loop recovery. See the module docs.
#[derive(Default)]
pub struct LabelDispatch {}

impl LabelDispatch {
    pub fn new() -> LabelDispatch {
        LabelDispatch {}
    }
}

impl FlowRecovery for LabelDispatch {
    fn new_session(&mut self, options: SessionOptions) -> Box<dyn FlowSession> {
        Box::new(LabelDispatchSession {
            options,
            blocks: Vec::new(),
            entry: 0,
            // Function bodies can get large; start with a sizable scratch
            // buffer so rendering does not thrash the allocator.
            out: String::with_capacity(1024 * 1024),
        })
    }
}

struct LabelDispatchSession {
    options: SessionOptions,
    blocks: Vec<BlockData>,
    entry: usize,
    out: String,
}

impl LabelDispatchSession {
    fn label_of(&self, block: usize) -> usize {
        block + 1
    }

    /// φ-resolution code (if any) followed by the label assignment that
    /// re-enters the dispatch loop.
    fn jump_text(&self, branch_index: usize, block_index: usize) -> String {
        let branch = &self.blocks[block_index].branches[branch_index];
        let mut stmt = String::new();
        if let Some(phi) = &branch.phi_code {
            stmt.push_str(phi);
        }
        stmt.push_str(&format!("label = {}; break;", self.label_of(branch.to)));
        stmt
    }

    fn render_block(&mut self, index: usize) {
        let indent = if self.options.minimize_size { "" } else { " " };
        self.out
            .push_str(&format!("case {}: {{\n", self.label_of(index)));

        let code = self.blocks[index].code.clone();
        if !code.is_empty() {
            self.out.push_str(indent);
            self.out.push_str(&code);
            if !code.ends_with('\n') {
                self.out.push('\n');
            }
        }

        let branch_count = self.blocks[index].branches.len();
        if self.blocks[index].switch_condition.is_some() {
            // Condition-variable dispatch: branches carry `case N: ` selector
            // labels, the default carries none.
            let cond = self.blocks[index].switch_condition.clone().unwrap();
            self.out
                .push_str(&format!("{}switch ({}) {{\n", indent, cond));
            let mut default = None;
            for i in 0..branch_count {
                if self.blocks[index].branches[i].condition.is_none() {
                    default = Some(i);
                    continue;
                }
                let selector = self.blocks[index].branches[i].condition.clone().unwrap();
                let jump = self.jump_text(i, index);
                self.out
                    .push_str(&format!("{}{}{{ {} }}\n", indent, selector, jump));
            }
            if let Some(i) = default {
                let jump = self.jump_text(i, index);
                self.out
                    .push_str(&format!("{}default: {{ {} }}\n", indent, jump));
            }
            self.out.push_str(indent);
            self.out.push_str("}\n");
            self.out.push_str(indent);
            self.out.push_str("break;\n");
        } else {
            // Conditional chain: every conditional branch tests and jumps;
            // the unconditional branch (if any) comes last.
            for i in 0..branch_count {
                match self.blocks[index].branches[i].condition.clone() {
                    Some(cond) => {
                        let jump = self.jump_text(i, index);
                        self.out
                            .push_str(&format!("{}if ({}) {{ {} }}\n", indent, cond, jump));
                    }
                    None => {
                        let jump = self.jump_text(i, index);
                        self.out.push_str(indent);
                        self.out.push_str(&jump);
                        self.out.push('\n');
                    }
                }
            }
            if branch_count == 0 {
                // Terminating block (return or unreachable).
                self.out.push_str(indent);
                self.out.push_str("break;\n");
            }
        }
        self.out.push_str("}\n");
    }
}

impl FlowSession for LabelDispatchSession {
    fn add_block(&mut self, code: String, switch_condition: Option<String>) -> BlockHandle {
        self.blocks.push(BlockData {
            code,
            switch_condition,
            branches: Vec::new(),
        });
        BlockHandle(self.blocks.len() - 1)
    }

    fn add_branch(
        &mut self,
        from: BlockHandle,
        to: BlockHandle,
        condition: Option<String>,
        phi_code: Option<String>,
    ) {
        self.blocks[from.0].branches.push(Branch {
            to: to.0,
            condition,
            phi_code,
        });
    }

    fn calculate(&mut self, entry: BlockHandle) {
        self.entry = entry.0;
    }

    fn render(&mut self) -> String {
        // A lone block with no outgoing edges needs no dispatch machinery.
        if self.blocks.len() == 1 && self.blocks[0].branches.is_empty() {
            let code = std::mem::take(&mut self.blocks[0].code);
            return code;
        }

        self.out.clear();
        self.out
            .push_str(&format!("label = {};\n", self.label_of(self.entry)));
        self.out.push_str("while (1) switch (label | 0) {\n");
        for index in 0..self.blocks.len() {
            self.render_block(index);
        }
        self.out.push_str("}\n");
        std::mem::take(&mut self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Box<dyn FlowSession> {
        LabelDispatch::new().new_session(SessionOptions::default())
    }

    #[test]
    fn single_block_renders_bare_code() {
        let mut s = session();
        let b = s.add_block("return 1;".to_owned(), None);
        s.calculate(b);
        assert_eq!(s.render(), "return 1;");
    }

    #[test]
    fn two_block_chain_uses_dispatch_loop() {
        let mut s = session();
        let a = s.add_block("x = 1;".to_owned(), None);
        let b = s.add_block("return x | 0;".to_owned(), None);
        s.add_branch(a, b, None, None);
        s.calculate(a);
        let out = s.render();
        assert!(out.contains("while (1) switch (label | 0)"));
        assert!(out.contains("label = 2; break;"));
        assert!(out.contains("return x | 0;"));
    }

    #[test]
    fn conditional_branch_renders_if_then_fallthrough() {
        let mut s = session();
        let a = s.add_block(String::new(), None);
        let b = s.add_block("one();".to_owned(), None);
        let c = s.add_block("two();".to_owned(), None);
        s.add_branch(a, b, Some("($x | 0) > 0".to_owned()), None);
        s.add_branch(a, c, None, None);
        s.calculate(a);
        let out = s.render();
        assert!(out.contains("if (($x | 0) > 0) { label = 2; break; }"));
    }

    #[test]
    fn switch_condition_renders_case_selectors() {
        let mut s = session();
        let a = s.add_block(String::new(), Some("$v | 0".to_owned()));
        let b = s.add_block(String::new(), None);
        let c = s.add_block(String::new(), None);
        s.add_branch(a, b, None, None);
        s.add_branch(a, c, Some("case 1: case 2: ".to_owned()), None);
        s.calculate(a);
        let out = s.render();
        assert!(out.contains("switch ($v | 0) {"));
        assert!(out.contains("case 1: case 2: { label = 3; break; }"));
        assert!(out.contains("default: { label = 2; break; }"));
    }

    #[test]
    fn phi_code_runs_before_the_jump() {
        let mut s = session();
        let a = s.add_block(String::new(), None);
        let b = s.add_block("return $x | 0;".to_owned(), None);
        s.add_branch(a, b, None, Some("$x = 5;".to_owned()));
        s.calculate(a);
        let out = s.render();
        assert!(out.contains("$x = 5;label = 2; break;"));
    }
}

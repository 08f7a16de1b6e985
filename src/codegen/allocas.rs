//! Stack frame analysis for a single function.
//!
//! Decides which allocas are *nativized* (their address is never taken, so
//! they become plain JS locals with no stack space), assigns frame offsets
//! to the static entry-block allocas, and reports the frame size and
//! maximum alignment the prologue must honor. The representative hook lets
//! an allocation-coalescing analysis fold equivalent slots together; the
//! default analysis gives every slot its own storage.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::codegen::STACK_ALIGN;
use crate::ir::types::align_to;
use crate::ir::{Function, InstKind, Operand, ValueId};

#[derive(Debug, Default)]
pub(crate) struct FrameAnalysis {
    nativized: FxHashSet<ValueId>,
    frame_offsets: FxHashMap<ValueId, u32>,
    representatives: FxHashMap<ValueId, ValueId>,
    frame_size: u32,
    max_alignment: u32,
}

impl FrameAnalysis {
    /// `nativize` should be set only for unoptimized IR; optimized IR has
    /// already had its promotable slots removed by mem2reg and friends.
    pub(crate) fn analyze(
        func: &Function,
        dl: &crate::ir::DataLayout,
        nativize: bool,
    ) -> FrameAnalysis {
        let mut analysis = FrameAnalysis::default();
        if nativize {
            analysis.calculate_nativized(func);
        }
        analysis.layout_frame(func, dl);
        analysis
    }

    pub(crate) fn is_nativized(&self, id: ValueId) -> bool {
        self.nativized.contains(&id)
    }

    /// Frame offset of a static alloca, if the analysis placed it.
    pub(crate) fn frame_offset(&self, id: ValueId) -> Option<u32> {
        let id = self.representative(id);
        self.frame_offsets.get(&id).copied()
    }

    /// The alloca this one has been coalesced into (itself by default).
    pub(crate) fn representative(&self, id: ValueId) -> ValueId {
        self.representatives.get(&id).copied().unwrap_or(id)
    }

    pub(crate) fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub(crate) fn max_alignment(&self) -> u32 {
        self.max_alignment
    }

    /// An alloca whose address is only ever loaded from or stored *to* can
    /// live in a JS variable. Vectors and aggregates stay in memory; their
    /// loads and stores are not scalar.
    fn calculate_nativized(&mut self, func: &Function) {
        let mut candidates: FxHashSet<ValueId> = FxHashSet::default();
        for block in &func.blocks {
            for inst in &block.insts {
                if let InstKind::Alloca { allocated, .. } = &inst.kind {
                    if allocated.is_vector() || allocated.is_aggregate() {
                        continue;
                    }
                    candidates.insert(inst.id);
                }
            }
        }
        if candidates.is_empty() {
            return;
        }
        for block in &func.blocks {
            for inst in &block.insts {
                match &inst.kind {
                    InstKind::Load { ptr, .. } => {
                        // A load through the slot is fine.
                        let _ = ptr;
                    }
                    InstKind::Store { ptr, value, .. } => {
                        // A store *to* the slot is fine; a store *of* its
                        // address escapes it.
                        if let Operand::Value(id) = value {
                            candidates.remove(id);
                        }
                        let _ = ptr;
                    }
                    other => {
                        for operand in operands_of(other) {
                            if let Operand::Value(id) = operand {
                                candidates.remove(id);
                            }
                        }
                    }
                }
            }
            for operand in block.term.operands() {
                if let Operand::Value(id) = operand {
                    candidates.remove(id);
                }
            }
        }
        self.nativized = candidates;
    }

    /// Assigns offsets to static entry-block allocas in source order.
    /// Nativized slots still participate so the frame size matches what the
    /// prologue restore expects.
    fn layout_frame(&mut self, func: &Function, dl: &crate::ir::DataLayout) {
        let Some(entry) = func.entry_block() else {
            return;
        };
        let mut offset = 0u32;
        let mut max_alignment = 1u32;
        for inst in &entry.insts {
            let InstKind::Alloca {
                allocated,
                count,
                align,
            } = &inst.kind
            else {
                continue;
            };
            let Some(count) = count.as_const_int() else {
                continue; // dynamic alloca, handled at the bump site
            };
            let alignment = (*align).max(dl.abi_alignment(allocated)).max(1);
            max_alignment = max_alignment.max(alignment);
            offset = align_to(offset, alignment);
            self.frame_offsets.insert(inst.id, offset);
            offset += dl.type_alloc_size(allocated) * count as u32;
        }
        self.frame_size = align_to(offset, STACK_ALIGN);
        if self.frame_offsets.is_empty() {
            self.frame_size = 0;
        }
        self.max_alignment = max_alignment;
    }
}

/// All value operands of an instruction kind, for escape analysis.
pub(crate) fn operands_of(kind: &InstKind) -> Vec<&Operand> {
    match kind {
        InstKind::Binary { lhs, rhs, .. }
        | InstKind::ICmp { lhs, rhs, .. }
        | InstKind::FCmp { lhs, rhs, .. } => vec![lhs, rhs],
        InstKind::Cast { value, .. } => vec![value],
        InstKind::Load { ptr, .. } => vec![ptr],
        InstKind::Store { ptr, value, .. } => vec![ptr, value],
        InstKind::Gep { base, indices } => {
            let mut out = vec![base];
            out.extend(indices.iter());
            out
        }
        InstKind::Alloca { count, .. } => vec![count],
        InstKind::Call { callee, args } => {
            let mut out: Vec<&Operand> = Vec::new();
            if let crate::ir::Callee::Indirect { pointer, .. } = callee {
                out.push(pointer);
            }
            out.extend(args.iter());
            out
        }
        InstKind::Select {
            cond,
            then_value,
            else_value,
        } => vec![cond, then_value, else_value],
        InstKind::Phi { incoming } => incoming.iter().map(|(_, op)| op).collect(),
        InstKind::AtomicRmw { ptr, value, .. } => vec![ptr, value],
        InstKind::Fence => vec![],
        InstKind::ExtractElement { vector, index } => vec![vector, index],
        InstKind::InsertElement {
            vector,
            element,
            index,
        } => vec![vector, element, index],
        InstKind::ShuffleVector { a, b, .. } => vec![a, b],
    }
}

impl crate::ir::Terminator {
    pub(crate) fn operands(&self) -> Vec<&Operand> {
        match self {
            crate::ir::Terminator::CondBr { cond, .. } => vec![cond],
            crate::ir::Terminator::Switch { cond, .. } => vec![cond],
            crate::ir::Terminator::IndirectBr { addr, .. } => vec![addr],
            crate::ir::Terminator::Ret(Some(value)) => vec![value],
            _ => vec![],
        }
    }
}

pub(crate) use operands_of as instruction_operands;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BasicBlock, BlockId, Constant, DataLayout, FnAttrs, Function, Instruction, Terminator,
        Type,
    };

    fn alloca(id: u32, ty: Type, align: u32) -> Instruction {
        Instruction {
            id: ValueId(id),
            name: None,
            ty: Type::ptr_to(ty.clone()),
            kind: InstKind::Alloca {
                allocated: ty,
                count: Operand::Const(Constant::i32(1)),
                align,
            },
            debug: None,
        }
    }

    fn func_with_entry(insts: Vec<Instruction>) -> Function {
        Function {
            name: "f".to_owned(),
            params: vec![],
            ret: Type::Void,
            blocks: vec![BasicBlock {
                id: BlockId(0),
                insts,
                term: Terminator::Ret(None),
            }],
            attrs: FnAttrs::default(),
            internal: false,
        }
    }

    #[test]
    fn frame_offsets_respect_alignment() {
        let func = func_with_entry(vec![
            alloca(0, Type::Int(8), 0),
            alloca(1, Type::Double, 8),
            alloca(2, Type::Int(32), 0),
        ]);
        let analysis = FrameAnalysis::analyze(&func, &DataLayout::new(), true);
        assert_eq!(analysis.frame_offset(ValueId(0)), Some(0));
        assert_eq!(analysis.frame_offset(ValueId(1)), Some(8));
        assert_eq!(analysis.frame_offset(ValueId(2)), Some(16));
        assert_eq!(analysis.frame_size(), 32); // rounded to stack alignment
    }

    #[test]
    fn address_never_taken_slots_are_nativized() {
        let mut insts = vec![alloca(0, Type::Int(32), 0)];
        insts.push(Instruction {
            id: ValueId(1),
            name: None,
            ty: Type::Void,
            kind: InstKind::Store {
                ptr: Operand::Value(ValueId(0)),
                value: Operand::Const(Constant::i32(1)),
                align: 4,
                volatile: false,
            },
            debug: None,
        });
        let func = func_with_entry(insts);
        let analysis = FrameAnalysis::analyze(&func, &DataLayout::new(), true);
        assert!(analysis.is_nativized(ValueId(0)));
    }

    #[test]
    fn escaping_slots_stay_in_memory() {
        let mut insts = vec![alloca(0, Type::Int(32), 0), alloca(1, Type::Int(32), 0)];
        // Store the address of slot 0 into slot 1: slot 0 escapes.
        insts.push(Instruction {
            id: ValueId(2),
            name: None,
            ty: Type::Void,
            kind: InstKind::Store {
                ptr: Operand::Value(ValueId(1)),
                value: Operand::Value(ValueId(0)),
                align: 4,
                volatile: false,
            },
            debug: None,
        });
        let func = func_with_entry(insts);
        let analysis = FrameAnalysis::analyze(&func, &DataLayout::new(), true);
        assert!(!analysis.is_nativized(ValueId(0)));
        assert!(analysis.is_nativized(ValueId(1)));
    }

    #[test]
    fn vector_allocas_are_never_nativized() {
        let func = func_with_entry(vec![alloca(0, Type::vector_of(Type::Int(32), 4), 16)]);
        let analysis = FrameAnalysis::analyze(&func, &DataLayout::new(), true);
        assert!(!analysis.is_nativized(ValueId(0)));
        assert_eq!(analysis.max_alignment(), 16);
    }
}

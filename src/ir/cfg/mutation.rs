//! Buffered edits against a [`ControlFlowGraph`].
//!
//! Passes usually decide on several rewrites while iterating over a block. Applying them
//! immediately would shift the indices still being visited, so [`CfgMutation`] records them
//! against the positions observed and applies them in one [`CfgMutation::flush`].

use std::collections::BTreeMap;

use crate::ir::{
    cfg::{CfgPosition, ControlFlowGraph, EdgeKind},
    IRInstruction, IROpcode, MethodItem,
};

#[derive(Debug, Default)]
struct Change {
    before: Vec<MethodItem>,
    after: Vec<MethodItem>,
    replace: Option<Vec<MethodItem>>,
}

/// A write buffer of instruction-level edits.
///
/// Rules applied by [`CfgMutation::flush`]:
///
/// 1. replacing (or removing) an instruction that owns a `move-result-pseudo*` removes the
///    pseudo as well;
/// 2. inserting before the first instruction of a block inserts at the block's head, ahead
///    of its leading positions;
/// 3. several inserts at the same anchor keep the order they were recorded in, and a later
///    replace of the same anchor overrides an earlier one;
/// 4. inserting after an instruction with a result pseudo inserts after the pseudo.
///
/// ```rust,ignore
/// let mut mutation = CfgMutation::new();
/// mutation.replace(pos, vec![IRInstruction::new(IROpcode::Nop)]);
/// mutation.flush(&mut cfg);
/// ```
#[derive(Debug, Default)]
pub struct CfgMutation {
    changes: BTreeMap<CfgPosition, Change>,
}

impl CfgMutation {
    /// Creates an empty mutation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of anchors touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Inserts instructions before `pos`.
    pub fn insert_before(&mut self, pos: CfgPosition, insns: Vec<IRInstruction>) {
        self.insert_before_var(pos, insns.into_iter().map(MethodItem::Insn).collect());
    }

    /// Inserts instructions after `pos`.
    pub fn insert_after(&mut self, pos: CfgPosition, insns: Vec<IRInstruction>) {
        self.insert_after_var(pos, insns.into_iter().map(MethodItem::Insn).collect());
    }

    /// Inserts arbitrary items (instructions, positions, source blocks) before `pos`.
    pub fn insert_before_var(&mut self, pos: CfgPosition, items: Vec<MethodItem>) {
        self.changes.entry(pos).or_default().before.extend(items);
    }

    /// Inserts arbitrary items after `pos`.
    pub fn insert_after_var(&mut self, pos: CfgPosition, items: Vec<MethodItem>) {
        self.changes.entry(pos).or_default().after.extend(items);
    }

    /// Replaces the instruction at `pos`.
    pub fn replace(&mut self, pos: CfgPosition, insns: Vec<IRInstruction>) {
        self.replace_var(pos, insns.into_iter().map(MethodItem::Insn).collect());
    }

    /// Replaces the instruction at `pos` with arbitrary items.
    pub fn replace_var(&mut self, pos: CfgPosition, items: Vec<MethodItem>) {
        self.changes.entry(pos).or_default().replace = Some(items);
    }

    /// Removes the instruction at `pos`.
    pub fn remove(&mut self, pos: CfgPosition) {
        self.replace_var(pos, Vec::new());
    }

    /// Applies every recorded change and clears the buffer.
    ///
    /// # Returns
    ///
    /// The number of anchors that were edited.
    ///
    /// # Panics
    ///
    /// Aborts if an anchor is not an instruction, or if an insert would land between an
    /// instruction and its result pseudo.
    pub fn flush(&mut self, cfg: &mut ControlFlowGraph) -> usize {
        let changes = std::mem::take(&mut self.changes);
        let count = changes.len();
        let mut touched = Vec::new();
        // Descending order keeps lower indices of the same block valid.
        for (pos, change) in changes.into_iter().rev() {
            let Some(insn) = cfg.insn_at(pos) else {
                invariant_failed!("mutation anchor {:?} is not an instruction", pos);
            };
            let opcode = insn.opcode();
            invariant!(
                change.before.is_empty() || !opcode.is_move_result_pseudo(),
                "cannot insert before the pseudo at {:?}",
                pos
            );
            let first_insn = cfg
                .block(pos.block)
                .first_insn()
                .is_some_and(|(i, _)| i == pos.index);
            let pseudo = cfg
                .move_result_of(pos)
                .filter(|p| {
                    cfg.insn_at(*p)
                        .is_some_and(|i| i.opcode().is_move_result_pseudo())
                });
            let span_end = pseudo.map_or(pos.index + 1, |p| p.index + 1);

            let block = cfg.block_mut(pos.block);
            let mut middle: Vec<MethodItem> = match change.replace {
                Some(items) => items,
                None => block.items[pos.index..span_end].to_vec(),
            };
            let replaced_branch = (opcode.is_conditional_branch() || opcode == IROpcode::Switch)
                && !middle
                    .iter()
                    .any(|i| i.insn().is_some_and(|i| i.opcode() == opcode));
            middle.extend(change.after);
            block.items.splice(pos.index..span_end, middle);
            let head = if first_insn { 0 } else { pos.index };
            block.items.splice(head..head, change.before);

            if replaced_branch {
                cfg.delete_succ_edges_if(pos.block, |e| matches!(e.kind, EdgeKind::Branch(_)));
            }
            touched.push(pos.block);
        }
        touched.dedup();
        for b in touched {
            cfg.drop_stale_throw_edges(b);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CodeBuilder, IROpcode};

    fn ops(cfg: &ControlFlowGraph) -> Vec<IROpcode> {
        cfg.instructions().iter().map(|(_, i)| i.opcode()).collect()
    }

    #[test]
    fn test_replace_removes_pseudo() {
        let mut b = CodeBuilder::new(2);
        b.sget("LFoo;.f:I", 0).return_void();
        let mut cfg = b.build_cfg();
        let entry = cfg.entry();
        let mut m = CfgMutation::new();
        m.replace(
            CfgPosition::new(entry, 0),
            vec![IRInstruction::new(IROpcode::Const).with_dest(0).with_literal(3)],
        );
        m.flush(&mut cfg);
        assert_eq!(ops(&cfg), vec![IROpcode::Const, IROpcode::ReturnVoid]);
    }

    #[test]
    fn test_inserts_keep_order() {
        let mut b = CodeBuilder::new(2);
        b.const_int(0, 1).return_void();
        let mut cfg = b.build_cfg();
        let entry = cfg.entry();
        let at = CfgPosition::new(entry, 1);
        let mut m = CfgMutation::new();
        m.insert_before(at, vec![IRInstruction::new(IROpcode::Const).with_dest(1).with_literal(1)]);
        m.insert_before(at, vec![IRInstruction::new(IROpcode::Const).with_dest(1).with_literal(2)]);
        m.flush(&mut cfg);
        let literals: Vec<_> = cfg
            .instructions()
            .iter()
            .filter_map(|(_, i)| i.literal())
            .collect();
        assert_eq!(literals, vec![1, 1, 2]);
    }

    #[test]
    fn test_insert_after_skips_pseudo() {
        let mut b = CodeBuilder::new(2);
        b.sget("LFoo;.f:I", 0).return_void();
        let mut cfg = b.build_cfg();
        let entry = cfg.entry();
        let mut m = CfgMutation::new();
        m.insert_after(
            CfgPosition::new(entry, 0),
            vec![IRInstruction::new(IROpcode::Nop)],
        );
        m.flush(&mut cfg);
        assert_eq!(
            ops(&cfg),
            vec![
                IROpcode::Sget,
                IROpcode::MoveResultPseudo,
                IROpcode::Nop,
                IROpcode::ReturnVoid
            ]
        );
    }

    #[test]
    fn test_later_replace_wins() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 1).return_void();
        let mut cfg = b.build_cfg();
        let at = CfgPosition::new(cfg.entry(), 0);
        let mut m = CfgMutation::new();
        m.replace(at, vec![IRInstruction::new(IROpcode::Const).with_dest(0).with_literal(5)]);
        m.replace(at, vec![IRInstruction::new(IROpcode::Const).with_dest(0).with_literal(6)]);
        assert_eq!(m.flush(&mut cfg), 1);
        assert_eq!(cfg.instructions()[0].1.literal(), Some(6));
    }
}

//! Structural edits on the editable CFG.
//!
//! Every edit keeps three things consistent: pseudo pairs stay inside one block, a block
//! owns throw edges exactly when it still contains a may-throw instruction, and leading
//! debug positions of removed blocks survive on their successor unless it already carries
//! an equivalent one.

use crate::ir::{
    cfg::{BlockId, CfgPosition, ControlFlowGraph, EdgeKind},
    IRInstruction, MethodItem,
};
use crate::pool::DexType;

impl ControlFlowGraph {
    /// Removes the instruction at `pos` together with its result pseudo.
    ///
    /// Removing an `if-*` or `switch` drops its branch edges, leaving the fall-through. When
    /// the block no longer contains a may-throw instruction its throw edges are dropped too.
    ///
    /// # Panics
    ///
    /// Aborts if `pos` does not hold an instruction, or holds a `move-result-pseudo*` whose
    /// producer is still present.
    pub fn remove_insn(&mut self, pos: CfgPosition) -> IRInstruction {
        invariant!(
            self.primary_instruction_of(pos).is_none(),
            "cannot remove the pseudo at {:?} without its producer",
            pos
        );
        if let Some(pseudo) = self
            .move_result_of(pos)
            .filter(|p| self.insn_at(*p).is_some_and(|i| i.opcode().is_move_result_pseudo()))
        {
            self.block_mut(pos.block).items.remove(pseudo.index);
        }
        let removed = match self.block_mut(pos.block).items.remove(pos.index) {
            MethodItem::Insn(insn) => insn,
            other => invariant_failed!("{} at {:?} is not an instruction", other, pos),
        };
        if removed.opcode().is_conditional_branch() || removed.opcode() == crate::ir::IROpcode::Switch {
            self.delete_succ_edges_if(pos.block, |e| matches!(e.kind, EdgeKind::Branch(_)));
        }
        self.drop_stale_throw_edges(pos.block);
        removed
    }

    /// Drops the throw edges of `block` if nothing in it can throw any more.
    pub fn drop_stale_throw_edges(&mut self, block: BlockId) {
        if !self.block(block).may_throw() {
            self.delete_succ_edges_if(block, |e| e.is_throw());
        }
    }

    /// Splits `pos.block` before `pos`: the new block receives the item at `pos` and every
    /// later item, together with the outgoing edges, and the old block falls through to it.
    ///
    /// Throw edges are kept by whichever half still contains a may-throw instruction.
    ///
    /// # Panics
    ///
    /// Aborts if the split would separate an instruction from its result move.
    pub fn split_block(&mut self, pos: CfgPosition) -> BlockId {
        invariant!(
            !self
                .insn_at(pos)
                .is_some_and(|i| i.opcode().is_move_result_any()),
            "split at {:?} would separate a result move from its producer",
            pos
        );
        let handlers = self.handlers(pos.block);
        let new = self.create_block();
        let tail = self.block_mut(pos.block).items.split_off(pos.index);
        self.block_mut(new).items = tail;
        self.move_succ_edges(pos.block, new);
        self.add_edge(pos.block, new, EdgeKind::Goto);
        self.drop_stale_throw_edges(new);
        if self.block(pos.block).may_throw() {
            self.append_handlers(pos.block, &handlers);
        }
        new
    }

    /// Splits `pos.block` after the instruction at `pos` (and after its result move, if
    /// any). Returns the new block.
    pub fn split_block_after(&mut self, pos: CfgPosition) -> BlockId {
        let anchor = self.move_result_of(pos).unwrap_or(pos);
        self.split_block(CfgPosition::new(pos.block, anchor.index + 1))
    }

    /// Appends throw edges to `block`, numbered after its existing handlers.
    pub fn append_handlers(&mut self, block: BlockId, handlers: &[(Option<DexType>, BlockId)]) {
        let mut index = self.throw_edges(block).len() as u32;
        for (catch_type, target) in handlers {
            self.add_edge(
                block,
                *target,
                EdgeKind::Throw {
                    catch_type: catch_type.clone(),
                    index,
                },
            );
            index += 1;
        }
    }

    /// Copies the throw edges of `from` onto `to`.
    pub fn copy_throw_edges(&mut self, from: BlockId, to: BlockId) {
        let handlers = self.handlers(from);
        self.append_handlers(to, &handlers);
    }

    /// Points the `goto` edge of `block` at `target`, creating it if missing.
    pub fn set_goto_target(&mut self, block: BlockId, target: BlockId) {
        self.delete_succ_edges_if(block, |e| e.kind == EdgeKind::Goto);
        self.add_edge(block, target, EdgeKind::Goto);
    }

    /// Ends `block` with a conditional branch.
    ///
    /// # Arguments
    ///
    /// * `block` - Block that receives the branch as its last instruction
    /// * `insn` - An `if-*` instruction
    /// * `if_true` - Destination when the condition holds
    /// * `if_false` - Fall-through destination
    pub fn create_branch(
        &mut self,
        block: BlockId,
        insn: IRInstruction,
        if_true: BlockId,
        if_false: BlockId,
    ) {
        invariant!(
            insn.opcode().is_conditional_branch(),
            "create_branch needs an if-*, got {}",
            insn
        );
        self.delete_succ_edges_if(block, |e| {
            matches!(e.kind, EdgeKind::Goto | EdgeKind::Branch(_))
        });
        self.block_mut(block).items.push(MethodItem::Insn(insn));
        self.add_edge(block, if_true, EdgeKind::Branch(None));
        self.add_edge(block, if_false, EdgeKind::Goto);
    }

    /// Ends `block` with a `switch` over `cases`, falling through to `default`.
    pub fn create_switch(
        &mut self,
        block: BlockId,
        insn: IRInstruction,
        default: BlockId,
        cases: &[(i32, BlockId)],
    ) {
        invariant!(
            insn.opcode() == crate::ir::IROpcode::Switch,
            "create_switch needs a switch, got {}",
            insn
        );
        self.delete_succ_edges_if(block, |e| {
            matches!(e.kind, EdgeKind::Goto | EdgeKind::Branch(_))
        });
        self.block_mut(block).items.push(MethodItem::Insn(insn));
        for &(key, target) in cases {
            self.add_edge(block, target, EdgeKind::Branch(Some(key)));
        }
        self.add_edge(block, default, EdgeKind::Goto);
    }

    /// Copies the leading positions of `from` to the head of `to`, skipping those `to`
    /// already carries.
    pub(crate) fn transfer_leading_positions(&mut self, from: BlockId, to: BlockId) {
        if from == to {
            return;
        }
        let existing = self.block(to).leading_positions();
        let moved: Vec<MethodItem> = self
            .block(from)
            .leading_positions()
            .into_iter()
            .filter(|p| !existing.contains(p))
            .collect();
        if moved.is_empty() {
            return;
        }
        let items = &mut self.block_mut(to).items;
        items.splice(0..0, moved);
    }

    /// Removes a block and all of its edges.
    ///
    /// Leading positions survive at the head of the block's `goto` successor. Removing the
    /// entry block moves the entry to that successor.
    ///
    /// # Panics
    ///
    /// Aborts when removing an entry block that has no unique `goto` successor.
    pub fn remove_block(&mut self, block: BlockId) {
        let succ = self.goto_target(block);
        if let Some(s) = succ {
            self.transfer_leading_positions(block, s);
        }
        if block == self.entry {
            match succ {
                Some(s) if s != block => self.entry = s,
                _ => invariant_failed!("cannot remove entry block {} without a successor", block),
            }
        }
        self.delete_block_and_edges(block);
    }

    /// Reroutes every edge into `old` to `new` and removes `old`.
    pub fn replace_block(&mut self, old: BlockId, new: BlockId) {
        let preds: Vec<_> = self.block(old).preds.clone();
        for e in preds {
            self.redirect_edge(e, new);
        }
        self.transfer_leading_positions(old, new);
        if old == self.entry {
            self.entry = new;
        }
        self.delete_block_and_edges(old);
    }

    /// Removes every block not reachable from the entry.
    ///
    /// # Returns
    ///
    /// The number of blocks and of instructions removed.
    pub fn remove_unreachable_blocks(&mut self) -> (usize, usize) {
        let reachable = self.reachable_blocks();
        let doomed: Vec<BlockId> = self
            .blocks
            .keys()
            .copied()
            .filter(|b| !reachable.contains(b) && Some(*b) != self.exit)
            .collect();
        let mut insns = 0;
        for &b in &doomed {
            insns += self.block(b).num_opcodes();
            self.delete_block_and_edges(b);
        }
        (doomed.len(), insns)
    }

    /// Appends an instruction to the end of a block.
    ///
    /// # Panics
    ///
    /// Aborts if the block already ends with a terminator.
    pub fn push_back(&mut self, block: BlockId, insn: IRInstruction) {
        invariant!(
            !self
                .block(block)
                .last_insn()
                .is_some_and(|(_, i)| i.opcode().ends_block()),
            "cannot append {} after the terminator of {}",
            insn,
            block
        );
        self.block_mut(block).items.push(MethodItem::Insn(insn));
    }
}

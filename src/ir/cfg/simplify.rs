//! Graph simplification: unreachable and empty block removal, block coalescing, and
//! position cleanup.

use crate::ir::{
    cfg::{BlockId, ControlFlowGraph, EdgeKind},
    MethodItem,
};

impl ControlFlowGraph {
    /// Simplifies the graph until nothing changes.
    ///
    /// - unreachable blocks are removed;
    /// - empty blocks whose only successor is a `goto` are bypassed, their leading
    ///   positions moving to the successor unless it carries an equivalent one;
    /// - a block with a single `goto` successor that has no other predecessor is merged
    ///   with it, unless that would put a may-throw instruction under foreign handlers;
    /// - adjacent duplicate positions collapse to the last one.
    ///
    /// # Returns
    ///
    /// `true` if the graph changed.
    pub fn simplify(&mut self) -> bool {
        let mut changed = false;
        loop {
            let mut round = self.remove_unreachable_blocks().0 > 0;
            round |= self.remove_empty_blocks();
            round |= self.coalesce_blocks();
            round |= self.collapse_duplicate_positions();
            if !round {
                break;
            }
            changed = true;
        }
        changed
    }

    fn sole_goto_successor(&self, block: BlockId) -> Option<BlockId> {
        let mut edges = self.succ_edges(block);
        let (_, edge) = edges.next()?;
        if edges.next().is_some() || edge.kind != EdgeKind::Goto {
            return None;
        }
        Some(edge.target)
    }

    /// The first block reached from `block` that is not an empty `goto`-only block.
    pub(crate) fn skip_empty_gotos(&self, block: BlockId) -> BlockId {
        let mut current = block;
        let mut seen = vec![current];
        while Some(current) != self.exit && self.block(current).is_empty() {
            match self.sole_goto_successor(current) {
                Some(next) if !seen.contains(&next) => {
                    seen.push(next);
                    current = next;
                }
                _ => break,
            }
        }
        current
    }

    fn remove_empty_blocks(&mut self) -> bool {
        let candidates: Vec<BlockId> = self
            .block_ids()
            .filter(|&b| Some(b) != self.exit && self.block(b).is_empty())
            .collect();
        let mut changed = false;
        for b in candidates {
            if !self.contains(b) || !self.block(b).is_empty() {
                continue;
            }
            let Some(succ) = self.sole_goto_successor(b) else {
                continue;
            };
            if succ == b {
                continue;
            }
            self.replace_block(b, succ);
            changed = true;
        }
        changed
    }

    fn coalesce_blocks(&mut self) -> bool {
        let mut changed = false;
        for b in self.blocks() {
            if !self.contains(b) {
                continue;
            }
            // Chains collapse one link per iteration of this loop.
            while let Some(s) = self.coalesce_target(b) {
                let moved = std::mem::take(&mut self.block_mut(s).items);
                self.block_mut(b).items.extend(moved);
                self.delete_edges_between(b, s);
                self.move_succ_edges(s, b);
                self.delete_block_and_edges(s);
                self.drop_stale_throw_edges(b);
                changed = true;
            }
        }
        changed
    }

    fn coalesce_target(&self, b: BlockId) -> Option<BlockId> {
        let normal: Vec<_> = self
            .succ_edges(b)
            .filter(|(_, e)| !e.is_throw())
            .map(|(_, e)| e)
            .collect();
        let [edge] = normal.as_slice() else {
            return None;
        };
        if edge.kind != EdgeKind::Goto {
            return None;
        }
        let s = edge.target;
        if s == b || s == self.entry || Some(s) == self.exit || self.block(s).preds.len() != 1 {
            return None;
        }
        let b_throws = self.block(b).may_throw();
        let s_throws = self.block(s).may_throw();
        if b_throws && (s_throws || !self.throw_edges(s).is_empty()) {
            return None;
        }
        if !b_throws && !self.throw_edges(b).is_empty() {
            return None;
        }
        Some(s)
    }

    fn collapse_duplicate_positions(&mut self) -> bool {
        let mut changed = false;
        let ids: Vec<BlockId> = self.block_ids().collect();
        for id in ids {
            let items = &mut self.block_mut(id).items;
            let before = items.len();
            let mut out: Vec<MethodItem> = Vec::with_capacity(before);
            for item in items.drain(..) {
                if let (Some(MethodItem::Position(prev)), MethodItem::Position(cur)) =
                    (out.last(), &item)
                {
                    if prev == cur {
                        out.pop();
                    }
                }
                out.push(item);
            }
            changed |= out.len() != before;
            *items = out;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        ir::{cfg::EdgeKind, CodeBuilder, DexPosition, IRInstruction, IROpcode, MethodItem},
        pool::DexMethodRef,
    };

    #[test]
    fn test_simplify_coalesces_chain() {
        let mut b = CodeBuilder::new(1);
        let (l1, l2) = (b.label(), b.label());
        b.const_int(0, 1)
            .goto(l1)
            .bind(l2)
            .ret(0)
            .bind(l1)
            .goto(l2);
        let mut cfg = b.build_cfg();
        assert!(cfg.num_blocks() >= 2);
        assert!(cfg.simplify());
        assert_eq!(cfg.num_blocks(), 1);
        let ops: Vec<_> = cfg.instructions().iter().map(|(_, i)| i.opcode()).collect();
        assert_eq!(ops, vec![IROpcode::Const, IROpcode::Return]);
    }

    #[test]
    fn test_removed_entry_positions_move_to_new_entry() {
        let m = DexMethodRef::parse("LFoo;.bar:()V").unwrap();
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 1);
        let mut cfg = b.build_cfg();
        let old_entry = cfg.entry();
        let new_entry = cfg.create_block();
        cfg.add_edge(new_entry, old_entry, EdgeKind::Goto);
        cfg.set_entry(new_entry);
        let pos = DexPosition::new(Some(m), None, 4);
        cfg.block_mut(new_entry)
            .items_mut()
            .push(MethodItem::Position(Arc::clone(&pos)));
        cfg.push_back(old_entry, IRInstruction::new(IROpcode::ReturnVoid));
        cfg.simplify();
        assert_eq!(cfg.entry(), old_entry);
        assert_eq!(
            cfg.block(old_entry).leading_positions(),
            vec![MethodItem::Position(pos)]
        );
    }

    #[test]
    fn test_collapse_duplicate_positions() {
        let m = DexMethodRef::parse("LFoo;.bar:()V").unwrap();
        let pos = DexPosition::new(Some(m), None, 9);
        let mut b = CodeBuilder::new(1);
        b.position(Arc::clone(&pos))
            .position(Arc::clone(&pos))
            .return_void();
        let mut cfg = b.build_cfg();
        cfg.simplify();
        assert_eq!(cfg.block(cfg.entry()).leading_positions().len(), 1);
    }
}

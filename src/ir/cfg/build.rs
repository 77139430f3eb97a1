//! Construction of a [`ControlFlowGraph`] from an [`IRList`].

use std::{collections::HashMap, sync::Arc};

use crate::ir::{
    cfg::{BlockId, ControlFlowGraph, EdgeKind},
    CatchEntry, DexPosition, IRList, IROpcode, ItemId, MethodItem, TargetKind, TryKind,
};

/// A block while the list is being partitioned.
struct Pending {
    items: Vec<MethodItem>,
    /// Catch chain head of the innermost enclosing try region.
    try_ctx: Option<ItemId>,
    /// The branch instruction ending the block, with its list id.
    branch: Option<(ItemId, IROpcode)>,
}

impl Pending {
    fn new(try_ctx: Option<ItemId>) -> Self {
        Self {
            items: Vec::new(),
            try_ctx,
            branch: None,
        }
    }

    fn has_insns(&self) -> bool {
        self.items.iter().any(MethodItem::is_insn)
    }

    fn has_leading_position(&self) -> bool {
        self.items
            .iter()
            .take_while(|i| !i.is_insn())
            .any(|i| i.position().is_some())
    }

    fn ends_in_terminal(&self) -> bool {
        self.items
            .iter()
            .rev()
            .find_map(MethodItem::insn)
            .is_some_and(|i| i.opcode().is_terminal())
    }
}

struct Partitioner {
    blocks: Vec<Pending>,
    try_stack: Vec<ItemId>,
    /// A may-throw instruction inside a try ended the current block; the next primary
    /// instruction starts a new one.
    pending_split: bool,
    /// Where each `Target` landed: branch id -> (kind, block index).
    targets: HashMap<ItemId, Vec<(TargetKind, usize)>>,
    /// Where each `Catch` landed.
    catches: HashMap<ItemId, (CatchEntry, usize)>,
    /// Position in effect at the current point of the text.
    position: Option<Arc<DexPosition>>,
}

impl Partitioner {
    fn new() -> Self {
        Self {
            blocks: vec![Pending::new(None)],
            try_stack: Vec::new(),
            pending_split: false,
            targets: HashMap::new(),
            catches: HashMap::new(),
            position: None,
        }
    }

    fn current(&mut self) -> &mut Pending {
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    fn current_index(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Starts a new block if the current one holds instructions. Trailing positions of the
    /// old block describe the code that follows, so they move along.
    fn split(&mut self) {
        self.pending_split = false;
        if !self.current().has_insns() {
            return;
        }
        let current = self.current();
        let keep = current
            .items
            .iter()
            .rposition(MethodItem::is_insn)
            .map_or(0, |i| i + 1);
        let carried = current.items.split_off(keep);
        let mut next = Pending::new(self.try_stack.last().copied());
        next.items = carried;
        self.blocks.push(next);
    }

    fn feed(&mut self, id: ItemId, item: MethodItem) {
        match item {
            MethodItem::Target(t) => {
                self.split();
                let at = self.current_index();
                self.targets.entry(t.src).or_default().push((t.kind, at));
            }
            MethodItem::Catch(entry) => {
                self.split();
                let at = self.current_index();
                self.catches.insert(id, (entry, at));
            }
            MethodItem::Try(marker) => {
                self.split();
                match marker.kind {
                    TryKind::Start => self.try_stack.push(marker.catch_start),
                    TryKind::End => {
                        let open = self.try_stack.pop();
                        invariant!(
                            open == Some(marker.catch_start),
                            "try end {} does not close the innermost region",
                            id
                        );
                    }
                }
                let ctx = self.try_stack.last().copied();
                self.current().try_ctx = ctx;
            }
            MethodItem::Position(pos) => {
                self.position = Some(pos.clone());
                self.current().items.push(MethodItem::Position(pos));
            }
            MethodItem::SourceBlock(sb) => {
                self.current().items.push(MethodItem::SourceBlock(sb));
            }
            MethodItem::Insn(insn) => {
                let op = insn.opcode();
                if self.pending_split && !op.is_move_result_any() {
                    self.split();
                }
                let fresh = !self.current().has_insns() && self.current_index() > 0;
                if fresh && !self.current().has_leading_position() {
                    if let Some(pos) = self.position.clone() {
                        self.current().items.insert(0, MethodItem::Position(pos));
                    }
                }
                let in_try = !self.try_stack.is_empty();
                if op.is_branch() {
                    self.current().branch = Some((id, op));
                }
                self.current().items.push(MethodItem::Insn(insn));
                if op.ends_block() {
                    self.pending_split = false;
                    let next = Pending::new(self.try_stack.last().copied());
                    self.blocks.push(next);
                } else if in_try && op.may_throw() {
                    self.pending_split = true;
                }
            }
        }
    }
}

impl ControlFlowGraph {
    /// Builds an editable CFG from a list.
    ///
    /// # Arguments
    ///
    /// * `list` - The method body; consumed, the CFG becomes authoritative
    /// * `registers_size` - The method's register count
    ///
    /// # Panics
    ///
    /// Aborts if the list violates the pseudo-pair or try-nesting invariants, or if a branch
    /// has no target.
    #[must_use]
    pub fn build(list: IRList, registers_size: u32) -> Self {
        let mut part = Partitioner::new();
        for (id, item) in list.into_items() {
            part.feed(id, item);
        }
        invariant!(part.try_stack.is_empty(), "unterminated try region");

        let Partitioner {
            blocks,
            targets,
            catches,
            ..
        } = part;

        let mut cfg = ControlFlowGraph::empty(registers_size);
        let mut ids: Vec<BlockId> = Vec::with_capacity(blocks.len());
        ids.push(cfg.entry);
        for _ in 1..blocks.len() {
            ids.push(cfg.create_block());
        }

        let count = blocks.len();
        let mut contexts = Vec::with_capacity(count);
        for (index, pending) in blocks.into_iter().enumerate() {
            let id = ids[index];
            let falls_through = !pending.ends_in_terminal() && index + 1 < count;
            let mut items = pending.items;
            contexts.push((pending.try_ctx, items.iter().any(|i| {
                i.insn().is_some_and(|insn| insn.may_throw())
            })));

            if let Some((branch_id, op)) = pending.branch {
                let landed = targets.get(&branch_id).cloned().unwrap_or_default();
                invariant!(!landed.is_empty(), "branch {} has no target", branch_id);
                match op {
                    IROpcode::Goto => {
                        if let Some(pos) = items.iter().rposition(MethodItem::is_insn) {
                            items.remove(pos);
                        }
                        cfg.add_edge(id, ids[landed[0].1], EdgeKind::Goto);
                    }
                    IROpcode::Switch => {
                        for (kind, at) in landed {
                            let key = match kind {
                                TargetKind::Case(k) => k,
                                TargetKind::Simple => invariant_failed!(
                                    "switch {} has a non-case target",
                                    branch_id
                                ),
                            };
                            cfg.add_edge(id, ids[at], EdgeKind::Branch(Some(key)));
                        }
                    }
                    _ => {
                        cfg.add_edge(id, ids[landed[0].1], EdgeKind::Branch(None));
                    }
                }
            }
            if falls_through {
                cfg.add_edge(id, ids[index + 1], EdgeKind::Goto);
            }
            cfg.block_mut(id).items = items;
        }

        for (index, (ctx, throws)) in contexts.into_iter().enumerate() {
            let (Some(head), true) = (ctx, throws) else {
                continue;
            };
            let mut cursor = Some(head);
            let mut handler_index = 0;
            while let Some(catch_id) = cursor {
                let Some((entry, at)) = catches.get(&catch_id) else {
                    invariant_failed!("try region names missing catch {}", catch_id);
                };
                cfg.add_edge(
                    ids[index],
                    ids[*at],
                    EdgeKind::Throw {
                        catch_type: entry.catch_type.clone(),
                        index: handler_index,
                    },
                );
                handler_index += 1;
                cursor = entry.next;
            }
        }

        // Trailing blocks created after a final terminator hold nothing.
        let dangling: Vec<BlockId> = cfg
            .blocks
            .values()
            .filter(|b| b.id != cfg.entry && b.items.is_empty() && b.preds.is_empty())
            .map(|b| b.id)
            .collect();
        for b in dangling {
            cfg.delete_block_and_edges(b);
        }
        cfg
    }
}

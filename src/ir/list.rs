//! The linear IR list.
//!
//! An [`IRList`] is a doubly linked list stored in an arena. Items are addressed by
//! [`ItemId`]s that stay valid until the item is removed, which lets branch targets, try
//! markers and catch chains point at each other without owning references.
//!
//! # Pseudo pairs
//!
//! An instruction whose opcode has a `move-result-pseudo*` result is always immediately
//! followed by that pseudo. [`IRList::remove`] and [`IRList::replace`] keep the pair
//! together: removing the producer removes its pseudo, and removing the pseudo alone is a
//! bug that aborts.

use crate::ir::{IRInstruction, ItemId, MethodItem, TryKind};

#[derive(Debug, Clone)]
struct Node {
    item: Option<MethodItem>,
    prev: Option<ItemId>,
    next: Option<ItemId>,
}

/// An ordered sequence of method items.
#[derive(Debug, Clone, Default)]
pub struct IRList {
    nodes: Vec<Node>,
    head: Option<ItemId>,
    tail: Option<ItemId>,
    len: usize,
}

impl IRList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the list holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The id the next inserted item will receive.
    #[must_use]
    pub fn next_id(&self) -> ItemId {
        ItemId(self.nodes.len() as u32)
    }

    fn alloc(&mut self, item: MethodItem) -> ItemId {
        let id = self.next_id();
        self.nodes.push(Node {
            item: Some(item),
            prev: None,
            next: None,
        });
        self.len += 1;
        id
    }

    fn node(&self, id: ItemId) -> &Node {
        let node = &self.nodes[id.index()];
        invariant!(node.item.is_some(), "item {} was removed", id);
        node
    }

    fn link_after(&mut self, at: Option<ItemId>, id: ItemId) {
        let next = match at {
            Some(a) => self.nodes[a.index()].next,
            None => self.head,
        };
        self.nodes[id.index()].prev = at;
        self.nodes[id.index()].next = next;
        match at {
            Some(a) => self.nodes[a.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
    }

    /// Appends an item and returns its id.
    pub fn push_back(&mut self, item: impl Into<MethodItem>) -> ItemId {
        let id = self.alloc(item.into());
        self.link_after(self.tail, id);
        id
    }

    /// Prepends an item and returns its id.
    pub fn push_front(&mut self, item: impl Into<MethodItem>) -> ItemId {
        let id = self.alloc(item.into());
        self.link_after(None, id);
        id
    }

    /// Inserts `item` immediately before `at`.
    pub fn insert_before(&mut self, at: ItemId, item: impl Into<MethodItem>) -> ItemId {
        let prev = self.node(at).prev;
        let id = self.alloc(item.into());
        self.link_after(prev, id);
        id
    }

    /// Inserts `item` immediately after `at`.
    ///
    /// Inserting after an instruction that owns a `move-result-pseudo` would split the pair,
    /// so the item lands after the pseudo instead.
    pub fn insert_after(&mut self, at: ItemId, item: impl Into<MethodItem>) -> ItemId {
        let anchor = self.pseudo_of(at).unwrap_or(at);
        self.node(anchor);
        let id = self.alloc(item.into());
        self.link_after(Some(anchor), id);
        id
    }

    /// The item with the given id.
    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<&MethodItem> {
        self.nodes.get(id.index()).and_then(|n| n.item.as_ref())
    }

    /// Mutable access to the item with the given id.
    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut MethodItem> {
        self.nodes.get_mut(id.index()).and_then(|n| n.item.as_mut())
    }

    /// The instruction with the given id.
    #[must_use]
    pub fn insn(&self, id: ItemId) -> Option<&IRInstruction> {
        self.get(id).and_then(MethodItem::insn)
    }

    /// Mutable access to the instruction with the given id.
    pub fn insn_mut(&mut self, id: ItemId) -> Option<&mut IRInstruction> {
        self.get_mut(id).and_then(MethodItem::insn_mut)
    }

    /// The first item.
    #[must_use]
    pub fn first(&self) -> Option<ItemId> {
        self.head
    }

    /// The last item.
    #[must_use]
    pub fn last(&self) -> Option<ItemId> {
        self.tail
    }

    /// The item after `id`.
    #[must_use]
    pub fn next(&self, id: ItemId) -> Option<ItemId> {
        self.node(id).next
    }

    /// The item before `id`.
    #[must_use]
    pub fn prev(&self, id: ItemId) -> Option<ItemId> {
        self.node(id).prev
    }

    /// If `id` is an instruction with a result pseudo, the pseudo's id.
    #[must_use]
    pub fn pseudo_of(&self, id: ItemId) -> Option<ItemId> {
        let insn = self.insn(id)?;
        if !insn.opcode().has_move_result_pseudo() {
            return None;
        }
        let next = self.next(id)?;
        self.insn(next)
            .filter(|i| i.opcode().is_move_result_pseudo())
            .map(|_| next)
    }

    /// If `id` is a `move-result-pseudo*`, the id of its producer.
    #[must_use]
    pub fn primary_of(&self, id: ItemId) -> Option<ItemId> {
        let insn = self.insn(id)?;
        if !insn.opcode().is_move_result_pseudo() {
            return None;
        }
        let prev = self.prev(id)?;
        self.insn(prev)
            .filter(|i| i.opcode().has_move_result_pseudo())
            .map(|_| prev)
    }

    fn unlink(&mut self, id: ItemId) -> MethodItem {
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        let node = &mut self.nodes[id.index()];
        node.prev = None;
        node.next = None;
        match node.item.take() {
            Some(item) => item,
            None => invariant_failed!("item {} unlinked twice", id),
        }
    }

    /// Removes an item.
    ///
    /// Removing an instruction also removes its result pseudo, and removing a branch
    /// removes the targets that point at it. Returns the removed item.
    ///
    /// # Panics
    ///
    /// Aborts if `id` is a `move-result-pseudo*` whose producer is still present.
    pub fn remove(&mut self, id: ItemId) -> MethodItem {
        invariant!(
            self.primary_of(id).is_none(),
            "cannot remove move-result-pseudo {} without its producer",
            id
        );
        if let Some(pseudo) = self.pseudo_of(id) {
            self.unlink(pseudo);
        }
        let is_branch = self.insn(id).is_some_and(|i| i.opcode().is_branch());
        if is_branch {
            for target in self.targets_of(id) {
                self.unlink(target);
            }
        }
        self.unlink(id)
    }

    /// Replaces `id` with `items`, returning the ids of the inserted items.
    ///
    /// The old instruction's result pseudo goes with it; the replacement supplies its own.
    pub fn replace(&mut self, id: ItemId, items: Vec<MethodItem>) -> Vec<ItemId> {
        let ids = items
            .into_iter()
            .map(|item| self.insert_before(id, item))
            .collect();
        self.remove(id);
        ids
    }

    /// Consumes the list, returning its items in order with their ids.
    #[must_use]
    pub fn into_items(mut self) -> Vec<(ItemId, MethodItem)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = &mut self.nodes[id.index()];
            cursor = node.next;
            if let Some(item) = node.item.take() {
                out.push((id, item));
            }
        }
        out
    }

    /// Ids of all live items, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<ItemId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Iterates over `(id, item)` pairs in order.
    pub fn iter(&self) -> IRListIter<'_> {
        IRListIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Iterates over `(id, instruction)` pairs in order.
    pub fn instructions(&self) -> impl Iterator<Item = (ItemId, &IRInstruction)> {
        self.iter()
            .filter_map(|(id, item)| item.insn().map(|i| (id, i)))
    }

    /// Ids of the `Target` items whose source is `branch`.
    #[must_use]
    pub fn targets_of(&self, branch: ItemId) -> Vec<ItemId> {
        self.iter()
            .filter_map(|(id, item)| match item {
                MethodItem::Target(t) if t.src == branch => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Number of instructions, not counting `load-param*` and result pseudos.
    #[must_use]
    pub fn count_opcodes(&self) -> usize {
        self.instructions()
            .filter(|(_, i)| !is_internal(i))
            .count()
    }

    /// Estimated size of all instructions in 16-bit code units.
    #[must_use]
    pub fn sum_opcode_sizes(&self) -> u32 {
        self.instructions()
            .map(|(_, i)| i.opcode().size_estimate())
            .sum()
    }

    /// Checks the structural invariants of the list: pseudo pairs are adjacent, branch
    /// targets point at branches, and try regions nest.
    ///
    /// # Panics
    ///
    /// Aborts on the first violation found.
    pub fn check_invariants(&self) {
        let mut open_tries: Vec<ItemId> = Vec::new();
        let mut prev: Option<(ItemId, &MethodItem)> = None;
        for (id, item) in self.iter() {
            let prev_needs_pseudo = matches!(
                prev,
                Some((_, MethodItem::Insn(p))) if p.opcode().has_move_result_pseudo()
            );
            match item {
                MethodItem::Insn(insn) if insn.opcode().is_move_result_pseudo() => {
                    invariant!(prev_needs_pseudo, "orphaned {} at {}", insn, id);
                }
                _ => invariant!(
                    !prev_needs_pseudo,
                    "missing move-result-pseudo after {}",
                    prev.map_or(id, |(p, _)| p)
                ),
            }
            match item {
                MethodItem::Target(t) => invariant!(
                    self.insn(t.src).is_some_and(|i| i.opcode().is_branch()),
                    "target {} points at non-branch {}",
                    id,
                    t.src
                ),
                MethodItem::Try(marker) => match marker.kind {
                    TryKind::Start => open_tries.push(marker.catch_start),
                    TryKind::End => invariant!(
                        open_tries.pop() == Some(marker.catch_start),
                        "try end at {} does not match the innermost open try",
                        id
                    ),
                },
                _ => {}
            }
            prev = Some((id, item));
        }
        invariant!(open_tries.is_empty(), "unterminated try region");
        invariant!(
            !matches!(prev, Some((_, MethodItem::Insn(p))) if p.opcode().has_move_result_pseudo()),
            "list ends with an instruction missing its move-result-pseudo"
        );
    }
}

fn is_internal(insn: &IRInstruction) -> bool {
    insn.opcode().is_load_param() || insn.opcode().is_move_result_pseudo()
}

/// Iterator over the items of an [`IRList`].
pub struct IRListIter<'a> {
    list: &'a IRList,
    cursor: Option<ItemId>,
}

impl<'a> Iterator for IRListIter<'a> {
    type Item = (ItemId, &'a MethodItem);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = &self.list.nodes[id.index()];
        self.cursor = node.next;
        node.item.as_ref().map(|item| (id, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{BranchTarget, IROpcode, Operand, TargetKind},
        pool::{DexFieldRef, DexType},
    };

    fn insn(op: IROpcode) -> IRInstruction {
        IRInstruction::new(op)
    }

    #[test]
    fn test_insert_and_iterate() {
        let mut list = IRList::new();
        let a = list.push_back(insn(IROpcode::Nop));
        let c = list.push_back(insn(IROpcode::ReturnVoid));
        let b = list.insert_before(c, insn(IROpcode::Nop));
        let z = list.push_front(insn(IROpcode::Nop));
        assert_eq!(list.ids(), vec![z, a, b, c]);
        assert_eq!(list.len(), 4);
        assert_eq!(list.count_opcodes(), 4);
    }

    #[test]
    fn test_remove_producer_removes_pseudo() {
        let mut list = IRList::new();
        let field = DexFieldRef::parse("LFoo;.x:I").unwrap();
        let get = list.push_back(
            insn(IROpcode::Sget).with_operand(Operand::Field(field)),
        );
        list.push_back(insn(IROpcode::MoveResultPseudo).with_dest(0));
        let ret = list.push_back(insn(IROpcode::ReturnVoid));
        list.check_invariants();
        list.remove(get);
        assert_eq!(list.ids(), vec![ret]);
    }

    #[test]
    #[should_panic(expected = "without its producer")]
    fn test_remove_pseudo_alone_aborts() {
        let mut list = IRList::new();
        list.push_back(
            insn(IROpcode::NewInstance).with_operand(Operand::Type(DexType::make("LFoo;"))),
        );
        let pseudo = list.push_back(insn(IROpcode::MoveResultPseudoObject).with_dest(0));
        list.remove(pseudo);
    }

    #[test]
    fn test_insert_after_skips_pseudo() {
        let mut list = IRList::new();
        let cls = list.push_back(
            insn(IROpcode::ConstClass).with_operand(Operand::Type(DexType::make("LFoo;"))),
        );
        let pseudo = list.push_back(insn(IROpcode::MoveResultPseudoObject).with_dest(0));
        let nop = list.insert_after(cls, insn(IROpcode::Nop));
        assert_eq!(list.ids(), vec![cls, pseudo, nop]);
    }

    #[test]
    fn test_remove_branch_removes_targets() {
        let mut list = IRList::new();
        let goto = list.push_back(insn(IROpcode::Goto));
        list.push_back(MethodItem::Target(BranchTarget {
            src: goto,
            kind: TargetKind::Simple,
        }));
        let ret = list.push_back(insn(IROpcode::ReturnVoid));
        list.remove(goto);
        assert_eq!(list.ids(), vec![ret]);
    }

    #[test]
    fn test_replace() {
        let mut list = IRList::new();
        let a = list.push_back(insn(IROpcode::Nop));
        list.push_back(insn(IROpcode::ReturnVoid));
        let new = list.replace(
            a,
            vec![
                insn(IROpcode::Const).with_dest(0).with_literal(1).into(),
                insn(IROpcode::Const).with_dest(1).with_literal(2).into(),
            ],
        );
        assert_eq!(new.len(), 2);
        assert_eq!(list.len(), 3);
        assert_eq!(list.insn(new[1]).and_then(IRInstruction::literal), Some(2));
        assert!(list.get(a).is_none());
    }
}

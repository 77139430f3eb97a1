//! Turning a [`ControlFlowGraph`] back into an [`IRList`].
//!
//! # Algorithm
//!
//! 1. **Layout.** Blocks are visited in [`ControlFlowGraph::blocks`] order; each newly placed
//!    block greedily pulls its `goto` successor right behind it, so unconditional edges
//!    become fall-through wherever the successor is still free.
//! 2. **Symbolic emission.** Every block contributes catch entries (one per distinct handler
//!    suffix it heads), branch targets for incoming branch edges and for `goto` edges that
//!    could not become fall-through, try markers around runs of blocks sharing one handler
//!    list, its own items, and a synthesized `goto` where needed.
//! 3. **Resolution.** Symbolic references are turned into [`ItemId`]s of the fresh list.

use std::{collections::HashMap, sync::Arc};

use crate::ir::{
    cfg::{BlockId, ControlFlowGraph, EdgeKind},
    BranchTarget, CatchEntry, DexPosition, IRInstruction, IRList, IROpcode, ItemId, MethodItem,
    TargetKind, TryKind, TryMarker,
};
use crate::pool::DexType;

type HandlerList = Vec<(Option<DexType>, BlockId)>;

/// The branch instruction a target refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BranchRef {
    /// The `if-*` or `switch` ending a block.
    Native(BlockId),
    /// The `goto` synthesized at the end of a block.
    Goto(BlockId),
}

enum Sym {
    Item(MethodItem),
    NativeBranch(BlockId, IRInstruction),
    Goto(BlockId),
    Target(BranchRef, TargetKind),
    Try(TryKind, usize),
    Catch(usize),
}

impl ControlFlowGraph {
    /// Computes the block layout used by [`ControlFlowGraph::linearize`].
    #[must_use]
    pub fn layout(&self) -> Vec<BlockId> {
        let mut placed = std::collections::HashSet::new();
        let mut order = Vec::with_capacity(self.blocks.len());
        for b in self.blocks() {
            if Some(b) == self.exit {
                continue;
            }
            let mut cursor = Some(b);
            while let Some(cur) = cursor {
                if !placed.insert(cur) {
                    break;
                }
                order.push(cur);
                cursor = self
                    .goto_target(cur)
                    .filter(|&t| t != self.entry && !placed.contains(&t));
            }
        }
        order
    }

    /// Linearizes the graph into a list, consuming it.
    #[must_use]
    pub fn linearize(mut self) -> IRList {
        self.remove_exit_block();
        let layout = self.layout();
        let next_in_layout: HashMap<BlockId, Option<BlockId>> = layout
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, layout.get(i + 1).copied()))
            .collect();

        // Distinct handler suffixes, each becoming one catch entry.
        let mut suffixes: Vec<HandlerList> = Vec::new();
        let mut suffix_index: HashMap<HandlerList, usize> = HashMap::new();
        let mut catches_at: HashMap<BlockId, Vec<usize>> = HashMap::new();
        let handler_lists: HashMap<BlockId, HandlerList> = layout
            .iter()
            .map(|&b| (b, self.handlers(b)))
            .collect();
        for &b in &layout {
            let list = &handler_lists[&b];
            for start in 0..list.len() {
                let suffix: HandlerList = list[start..].to_vec();
                if suffix_index.contains_key(&suffix) {
                    continue;
                }
                let idx = suffixes.len();
                suffix_index.insert(suffix.clone(), idx);
                catches_at.entry(suffix[0].1).or_default().push(idx);
                suffixes.push(suffix);
            }
        }

        // Incoming targets per block.
        let mut targets_at: HashMap<BlockId, Vec<(BranchRef, TargetKind)>> = HashMap::new();
        let mut needs_goto: HashMap<BlockId, BlockId> = HashMap::new();
        for &b in &layout {
            for (_, edge) in self.succ_edges(b) {
                match edge.kind {
                    EdgeKind::Branch(None) => targets_at
                        .entry(edge.target)
                        .or_default()
                        .push((BranchRef::Native(b), TargetKind::Simple)),
                    EdgeKind::Branch(Some(k)) => targets_at
                        .entry(edge.target)
                        .or_default()
                        .push((BranchRef::Native(b), TargetKind::Case(k))),
                    EdgeKind::Goto if next_in_layout[&b] != Some(edge.target) => {
                        needs_goto.insert(b, edge.target);
                        targets_at
                            .entry(edge.target)
                            .or_default()
                            .push((BranchRef::Goto(b), TargetKind::Simple));
                    }
                    _ => {}
                }
            }
        }

        let region_of = |b: &BlockId| {
            let list = &handler_lists[b];
            if list.is_empty() {
                None
            } else {
                suffix_index.get(list).copied()
            }
        };

        let mut syms: Vec<Sym> = Vec::new();
        let mut open_region: Option<usize> = None;
        let mut position: Option<Arc<DexPosition>> = None;
        for (i, &b) in layout.iter().enumerate() {
            let region = region_of(&b);
            for &c in catches_at.get(&b).into_iter().flatten() {
                syms.push(Sym::Catch(c));
            }
            for &(src, kind) in targets_at.get(&b).into_iter().flatten() {
                syms.push(Sym::Target(src, kind));
            }
            if open_region.is_none() {
                if let Some(r) = region {
                    syms.push(Sym::Try(TryKind::Start, r));
                    open_region = Some(r);
                }
            }

            let block = self.block_mut(b);
            let items = std::mem::take(&mut block.items);
            let mut leading = true;
            for item in items {
                match item {
                    MethodItem::Position(p) => {
                        if leading && position.as_ref() == Some(&p) {
                            continue;
                        }
                        position = Some(p.clone());
                        syms.push(Sym::Item(MethodItem::Position(p)));
                    }
                    MethodItem::Insn(insn) if insn.opcode().is_conditional_branch() => {
                        leading = false;
                        syms.push(Sym::NativeBranch(b, insn));
                    }
                    MethodItem::Insn(insn) if insn.opcode() == IROpcode::Switch => {
                        leading = false;
                        syms.push(Sym::NativeBranch(b, insn));
                    }
                    other => {
                        leading &= !other.is_insn();
                        syms.push(Sym::Item(other));
                    }
                }
            }
            if needs_goto.contains_key(&b) {
                syms.push(Sym::Goto(b));
            }

            let next_region = layout.get(i + 1).and_then(region_of);
            if open_region.is_some() && next_region != open_region {
                if let Some(r) = open_region.take() {
                    syms.push(Sym::Try(TryKind::End, r));
                }
            }
        }
        if let Some(r) = open_region.take() {
            syms.push(Sym::Try(TryKind::End, r));
        }

        // Every sym becomes one item; item i receives ItemId(i) in the fresh list.
        let mut branch_ids: HashMap<BranchRef, ItemId> = HashMap::new();
        let mut catch_ids: HashMap<usize, ItemId> = HashMap::new();
        for (i, sym) in syms.iter().enumerate() {
            let id = ItemId(i as u32);
            match sym {
                Sym::NativeBranch(b, _) => {
                    branch_ids.insert(BranchRef::Native(*b), id);
                }
                Sym::Goto(b) => {
                    branch_ids.insert(BranchRef::Goto(*b), id);
                }
                Sym::Catch(c) => {
                    catch_ids.insert(*c, id);
                }
                _ => {}
            }
        }

        let mut list = IRList::new();
        for sym in syms {
            let item = match sym {
                Sym::Item(item) => item,
                Sym::NativeBranch(_, insn) => MethodItem::Insn(insn),
                Sym::Goto(_) => MethodItem::Insn(IRInstruction::new(IROpcode::Goto)),
                Sym::Target(src, kind) => {
                    let Some(&src) = branch_ids.get(&src) else {
                        invariant_failed!("target refers to a branch that was not emitted");
                    };
                    MethodItem::Target(BranchTarget { src, kind })
                }
                Sym::Try(kind, region) => {
                    let Some(&catch_start) = catch_ids.get(&region) else {
                        invariant_failed!("try region without catch entry");
                    };
                    MethodItem::Try(TryMarker { kind, catch_start })
                }
                Sym::Catch(c) => {
                    let suffix = &suffixes[c];
                    let next = (suffix.len() > 1)
                        .then(|| suffix_index.get(&suffix[1..]))
                        .flatten()
                        .and_then(|n| catch_ids.get(n).copied());
                    MethodItem::Catch(CatchEntry {
                        catch_type: suffix[0].0.clone(),
                        next,
                    })
                }
            };
            list.push_back(item);
        }
        list
    }
}

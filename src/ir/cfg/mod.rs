//! The editable control-flow graph.
//!
//! While a method's CFG is built, it is the authoritative form of the method body: blocks
//! own their items, and control flow lives exclusively in typed edges. Branch targets, try
//! markers and catch entries do not exist inside blocks; they are regenerated when the CFG
//! is linearized back into an [`IRList`](crate::ir::IRList).
//!
//! # Architecture
//!
//! - [`ControlFlowGraph`] owns a map of [`Block`]s and a slab of [`Edge`]s. Blocks refer to
//!   their edges by [`EdgeId`], edges refer to blocks by [`BlockId`]; nothing owns anything
//!   across the graph.
//! - Construction ([`ControlFlowGraph::build`]) partitions the list at labels, try markers,
//!   catch entries and after terminators. Inside a try region every may-throw instruction
//!   also ends its block (together with its trailing result move), so a block with throw
//!   edges throws only from its last primary instruction.
//! - Linearization ([`ControlFlowGraph::linearize`]) chooses a layout that turns `goto`
//!   edges into fall-through where possible and re-creates labels and try regions.
//! - Structural edits ([`ControlFlowGraph::split_block`], [`ControlFlowGraph::remove_block`],
//!   ...) and the buffered [`CfgMutation`] keep pseudo pairs and throw edges consistent.
//!
//! # Invariants
//!
//! - exactly one entry block;
//! - a block containing a may-throw instruction inside a try region has a throw edge to
//!   every handler of that region, in handler order;
//! - an instruction with a `move-result-pseudo*` is immediately followed by it in the same
//!   block;
//! - blocks ending in a conditional branch have one `Branch` edge and one `Goto` edge.

mod build;
mod edit;
mod linearize;
mod mutation;
mod simplify;

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

pub use mutation::CfgMutation;

use crate::{
    ir::{IRInstruction, MethodItem, Reg},
    pool::DexType,
    utils::graph::{reverse_postorder, Successors},
};

/// Identifier of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// The raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Identifier of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) u32);

impl EdgeId {
    /// The raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The kind of a control-flow edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Unconditional transfer: fall-through, `goto`, the not-taken side of an `if-*`, or the
    /// default case of a switch.
    Goto,
    /// The taken side of an `if-*` (`None`) or a switch case (`Some(key)`).
    Branch(Option<i32>),
    /// Exceptional transfer to a handler.
    Throw {
        /// The handler's exception type; `None` catches everything.
        catch_type: Option<DexType>,
        /// Position of the handler in the region's handler list.
        index: u32,
    },
    /// Virtual edge keeping the synthetic exit connected.
    Ghost,
}

/// A directed edge between two blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Source block.
    pub src: BlockId,
    /// Target block.
    pub target: BlockId,
    /// Edge kind.
    pub kind: EdgeKind,
}

impl Edge {
    /// `true` for throw edges.
    #[must_use]
    pub fn is_throw(&self) -> bool {
        matches!(self.kind, EdgeKind::Throw { .. })
    }
}

/// A position inside the CFG: an item index within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CfgPosition {
    /// The block.
    pub block: BlockId,
    /// Index into the block's items.
    pub index: usize,
}

impl CfgPosition {
    /// Creates a position.
    #[must_use]
    pub const fn new(block: BlockId, index: usize) -> Self {
        Self { block, index }
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    items: Vec<MethodItem>,
    preds: Vec<EdgeId>,
    succs: Vec<EdgeId>,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            items: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    /// The block's id.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The block's items: instructions, positions and source blocks.
    #[must_use]
    pub fn items(&self) -> &[MethodItem] {
        &self.items
    }

    /// Mutable access to the items.
    ///
    /// Callers are responsible for keeping pseudo pairs adjacent and for the terminator
    /// staying last; prefer [`CfgMutation`] for anything but in-place operand rewrites.
    pub fn items_mut(&mut self) -> &mut Vec<MethodItem> {
        &mut self.items
    }

    /// Incoming edges.
    #[must_use]
    pub fn preds(&self) -> &[EdgeId] {
        &self.preds
    }

    /// Outgoing edges.
    #[must_use]
    pub fn succs(&self) -> &[EdgeId] {
        &self.succs
    }

    /// Iterates over `(index, instruction)` pairs.
    pub fn instructions(&self) -> impl DoubleEndedIterator<Item = (usize, &IRInstruction)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.insn().map(|insn| (i, insn)))
    }

    /// `true` if the block contains no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.items.iter().any(MethodItem::is_insn)
    }

    /// Number of instructions, not counting `load-param*` and result pseudos.
    #[must_use]
    pub fn num_opcodes(&self) -> usize {
        self.instructions()
            .filter(|(_, i)| {
                !i.opcode().is_load_param() && !i.opcode().is_move_result_pseudo()
            })
            .count()
    }

    /// The first instruction and its index.
    #[must_use]
    pub fn first_insn(&self) -> Option<(usize, &IRInstruction)> {
        self.instructions().next()
    }

    /// The last instruction and its index.
    #[must_use]
    pub fn last_insn(&self) -> Option<(usize, &IRInstruction)> {
        self.instructions().next_back()
    }

    /// `true` if any instruction may throw.
    #[must_use]
    pub fn may_throw(&self) -> bool {
        self.instructions().any(|(_, i)| i.may_throw())
    }

    /// Index of the last may-throw instruction.
    #[must_use]
    pub fn last_throwing_index(&self) -> Option<usize> {
        self.instructions()
            .filter(|(_, i)| i.may_throw())
            .map(|(idx, _)| idx)
            .next_back()
    }

    /// `true` if the block ends with a return.
    #[must_use]
    pub fn ends_with_return(&self) -> bool {
        self.last_insn()
            .is_some_and(|(_, i)| i.opcode().is_return())
    }

    /// The positions preceding the first instruction.
    #[must_use]
    pub fn leading_positions(&self) -> Vec<MethodItem> {
        self.items
            .iter()
            .take_while(|item| !item.is_insn())
            .filter(|item| item.position().is_some())
            .cloned()
            .collect()
    }
}

/// An editable control-flow graph.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: BTreeMap<BlockId, Block>,
    edges: Vec<Option<Edge>>,
    entry: BlockId,
    exit: Option<BlockId>,
    registers_size: u32,
    next_block: u32,
}

impl ControlFlowGraph {
    pub(crate) fn empty(registers_size: u32) -> Self {
        let mut cfg = Self {
            blocks: BTreeMap::new(),
            edges: Vec::new(),
            entry: BlockId(0),
            exit: None,
            registers_size,
            next_block: 0,
        };
        cfg.entry = cfg.create_block();
        cfg
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Makes `block` the entry block.
    pub fn set_entry(&mut self, block: BlockId) {
        invariant!(self.blocks.contains_key(&block), "unknown block {}", block);
        self.entry = block;
    }

    /// The synthetic exit block, if [`ControlFlowGraph::calculate_exit_block`] created one.
    #[must_use]
    pub fn exit(&self) -> Option<BlockId> {
        self.exit
    }

    /// Number of registers the method uses.
    #[must_use]
    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    /// Overrides the register count.
    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = size;
    }

    /// Allocates a fresh narrow register.
    pub fn allocate_temp(&mut self) -> Reg {
        let r = self.registers_size;
        self.registers_size += 1;
        r
    }

    /// Allocates a fresh register pair and returns its low half.
    pub fn allocate_wide_temp(&mut self) -> Reg {
        let r = self.registers_size;
        self.registers_size += 2;
        r
    }

    /// Creates an empty block without edges.
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(id, Block::new(id));
        id
    }

    /// Number of blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// `true` if `block` exists.
    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains_key(&block)
    }

    /// The block with the given id.
    ///
    /// # Panics
    ///
    /// Aborts if the block does not exist.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        match self.blocks.get(&id) {
            Some(b) => b,
            None => invariant_failed!("unknown block {}", id),
        }
    }

    /// Mutable access to a block.
    ///
    /// # Panics
    ///
    /// Aborts if the block does not exist.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        match self.blocks.get_mut(&id) {
            Some(b) => b,
            None => invariant_failed!("unknown block {}", id),
        }
    }

    /// Block ids in deterministic order: reverse post-order from the entry, followed by
    /// blocks unreachable from the entry in creation order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockId> {
        let mut order = reverse_postorder(self, self.entry);
        let seen: HashSet<BlockId> = order.iter().copied().collect();
        order.extend(self.blocks.keys().copied().filter(|b| !seen.contains(b)));
        order
    }

    /// Block ids in creation order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    /// The edge with the given id.
    ///
    /// # Panics
    ///
    /// Aborts if the edge was deleted.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> &Edge {
        match self.edges.get(id.index()).and_then(Option::as_ref) {
            Some(e) => e,
            None => invariant_failed!("edge {:?} was deleted", id),
        }
    }

    /// Outgoing edges of `block`.
    pub fn succ_edges(&self, block: BlockId) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.block(block)
            .succs
            .iter()
            .map(move |&e| (e, self.edge(e)))
    }

    /// Incoming edges of `block`.
    pub fn pred_edges(&self, block: BlockId) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.block(block)
            .preds
            .iter()
            .map(move |&e| (e, self.edge(e)))
    }

    /// Distinct successor blocks, in edge order.
    #[must_use]
    pub fn successors_of(&self, block: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for (_, e) in self.succ_edges(block) {
            if !out.contains(&e.target) {
                out.push(e.target);
            }
        }
        out
    }

    /// Distinct predecessor blocks, in edge order.
    #[must_use]
    pub fn predecessors_of(&self, block: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for (_, e) in self.pred_edges(block) {
            if !out.contains(&e.src) {
                out.push(e.src);
            }
        }
        out
    }

    /// The target of the block's `Goto` edge.
    #[must_use]
    pub fn goto_target(&self, block: BlockId) -> Option<BlockId> {
        self.succ_edges(block)
            .find(|(_, e)| e.kind == EdgeKind::Goto)
            .map(|(_, e)| e.target)
    }

    /// The block's throw edges, sorted by handler index.
    #[must_use]
    pub fn throw_edges(&self, block: BlockId) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self
            .succ_edges(block)
            .map(|(_, e)| e)
            .filter(|e| e.is_throw())
            .collect();
        edges.sort_by_key(|e| match e.kind {
            EdgeKind::Throw { index, .. } => index,
            _ => 0,
        });
        edges
    }

    /// The block's handler list: `(catch type, handler block)` in handler order.
    #[must_use]
    pub fn handlers(&self, block: BlockId) -> Vec<(Option<DexType>, BlockId)> {
        self.throw_edges(block)
            .into_iter()
            .map(|e| match &e.kind {
                EdgeKind::Throw { catch_type, .. } => (catch_type.clone(), e.target),
                _ => (None, e.target),
            })
            .collect()
    }

    /// `true` if `block` is the target of a throw edge.
    #[must_use]
    pub fn is_catch(&self, block: BlockId) -> bool {
        self.pred_edges(block).any(|(_, e)| e.is_throw())
    }

    /// Adds an edge and returns its id.
    pub fn add_edge(&mut self, src: BlockId, target: BlockId, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(Edge { src, target, kind }));
        self.block_mut(src).succs.push(id);
        self.block_mut(target).preds.push(id);
        id
    }

    /// Deletes an edge.
    pub fn delete_edge(&mut self, id: EdgeId) {
        let Some(edge) = self.edges.get_mut(id.index()).and_then(Option::take) else {
            invariant_failed!("edge {:?} deleted twice", id);
        };
        if let Some(b) = self.blocks.get_mut(&edge.src) {
            b.succs.retain(|&e| e != id);
        }
        if let Some(b) = self.blocks.get_mut(&edge.target) {
            b.preds.retain(|&e| e != id);
        }
    }

    /// Deletes every edge from `src` to `target`.
    pub fn delete_edges_between(&mut self, src: BlockId, target: BlockId) {
        let doomed: Vec<EdgeId> = self
            .succ_edges(src)
            .filter(|(_, e)| e.target == target)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.delete_edge(id);
        }
    }

    /// Deletes the outgoing edges of `block` matching `pred`.
    pub fn delete_succ_edges_if(&mut self, block: BlockId, pred: impl Fn(&Edge) -> bool) {
        let doomed: Vec<EdgeId> = self
            .succ_edges(block)
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.delete_edge(id);
        }
    }

    /// Points an existing edge at a new target.
    pub fn redirect_edge(&mut self, id: EdgeId, target: BlockId) {
        let old = self.edge(id).target;
        if old == target {
            return;
        }
        self.block_mut(old).preds.retain(|&e| e != id);
        self.block_mut(target).preds.push(id);
        if let Some(Some(edge)) = self.edges.get_mut(id.index()) {
            edge.target = target;
        }
    }

    /// Moves every outgoing edge of `from` so that it leaves `to` instead.
    pub(crate) fn move_succ_edges(&mut self, from: BlockId, to: BlockId) {
        let succs = std::mem::take(&mut self.block_mut(from).succs);
        for &id in &succs {
            if let Some(Some(edge)) = self.edges.get_mut(id.index()) {
                edge.src = to;
            }
        }
        self.block_mut(to).succs.extend(succs);
    }

    /// The instruction at a position.
    #[must_use]
    pub fn insn_at(&self, pos: CfgPosition) -> Option<&IRInstruction> {
        self.blocks
            .get(&pos.block)
            .and_then(|b| b.items.get(pos.index))
            .and_then(MethodItem::insn)
    }

    /// Mutable access to the instruction at a position.
    pub fn insn_at_mut(&mut self, pos: CfgPosition) -> Option<&mut IRInstruction> {
        self.blocks
            .get_mut(&pos.block)
            .and_then(|b| b.items.get_mut(pos.index))
            .and_then(MethodItem::insn_mut)
    }

    /// All instructions with their positions, in [`ControlFlowGraph::blocks`] order.
    #[must_use]
    pub fn instructions(&self) -> Vec<(CfgPosition, &IRInstruction)> {
        self.blocks()
            .into_iter()
            .flat_map(|b| {
                self.block(b)
                    .instructions()
                    .map(move |(i, insn)| (CfgPosition::new(b, i), insn))
            })
            .collect()
    }

    /// Number of instructions, not counting internal pseudo-instructions.
    #[must_use]
    pub fn num_opcodes(&self) -> usize {
        self.blocks.values().map(Block::num_opcodes).sum()
    }

    /// Estimated size in code units.
    #[must_use]
    pub fn sum_opcode_sizes(&self) -> u32 {
        self.blocks
            .values()
            .flat_map(|b| b.instructions().map(|(_, i)| i.opcode().size_estimate()))
            .sum()
    }

    /// The `move-result*` or `move-result-pseudo*` following the instruction at `pos`.
    #[must_use]
    pub fn move_result_of(&self, pos: CfgPosition) -> Option<CfgPosition> {
        let block = self.block(pos.block);
        let (idx, next) = block
            .instructions()
            .find(|(i, _)| *i > pos.index)?;
        next.opcode()
            .is_move_result_any()
            .then_some(CfgPosition::new(pos.block, idx))
    }

    /// The producer of the `move-result-pseudo*` at `pos`.
    #[must_use]
    pub fn primary_instruction_of(&self, pos: CfgPosition) -> Option<CfgPosition> {
        let block = self.block(pos.block);
        let (idx, prev) = block
            .instructions()
            .rev()
            .find(|(i, _)| *i < pos.index)?;
        prev.opcode()
            .has_move_result_pseudo()
            .then_some(CfgPosition::new(pos.block, idx))
    }

    /// The `load-param*` instructions of the entry block, in order.
    #[must_use]
    pub fn param_instructions(&self) -> Vec<(CfgPosition, &IRInstruction)> {
        self.block(self.entry)
            .instructions()
            .take_while(|(_, i)| i.opcode().is_load_param())
            .map(|(i, insn)| (CfgPosition::new(self.entry, i), insn))
            .collect()
    }

    /// Blocks that leave the method: they end with a return or a throw, or have no
    /// successors at all.
    #[must_use]
    pub fn exit_points(&self) -> Vec<BlockId> {
        self.blocks
            .values()
            .filter(|b| {
                b.last_insn().is_some_and(|(_, i)| {
                    i.opcode().is_return() || i.opcode() == crate::ir::IROpcode::Throw
                }) || self.succ_edges(b.id).all(|(_, e)| e.kind == EdgeKind::Ghost)
            })
            .map(|b| b.id)
            .filter(|&b| Some(b) != self.exit)
            .collect()
    }

    /// Creates a synthetic exit block with ghost edges from every exit point.
    ///
    /// Blocks that cannot reach any exit (infinite loops) are connected as well, so a
    /// backward traversal from the exit visits every block. Calling this again replaces the
    /// previous exit.
    pub fn calculate_exit_block(&mut self) -> BlockId {
        self.remove_exit_block();
        let exit = self.create_block();
        for b in self.exit_points() {
            if b != exit {
                self.add_edge(b, exit, EdgeKind::Ghost);
            }
        }
        self.exit = Some(exit);
        let reaching = self.blocks_reaching(exit);
        let stranded: Vec<BlockId> = self
            .blocks
            .keys()
            .copied()
            .filter(|b| !reaching.contains(b))
            .collect();
        for b in stranded {
            self.add_edge(b, exit, EdgeKind::Ghost);
        }
        exit
    }

    /// Removes the synthetic exit block and its ghost edges.
    pub fn remove_exit_block(&mut self) {
        if let Some(exit) = self.exit.take() {
            self.delete_block_and_edges(exit);
        }
    }

    /// Blocks from which `target` is reachable, including `target`.
    #[must_use]
    pub fn blocks_reaching(&self, target: BlockId) -> HashSet<BlockId> {
        let mut seen = HashSet::from([target]);
        let mut stack = vec![target];
        while let Some(b) = stack.pop() {
            for p in self.predecessors_of(b) {
                if seen.insert(p) {
                    stack.push(p);
                }
            }
        }
        seen
    }

    /// Blocks reachable from the entry.
    #[must_use]
    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::from([self.entry]);
        let mut stack = vec![self.entry];
        while let Some(b) = stack.pop() {
            for s in self.successors_of(b) {
                if seen.insert(s) {
                    stack.push(s);
                }
            }
        }
        seen
    }

    fn delete_block_and_edges(&mut self, block: BlockId) {
        let b = self.block(block);
        let edges: Vec<EdgeId> = b.preds.iter().chain(b.succs.iter()).copied().collect();
        for e in edges {
            if self.edges.get(e.index()).is_some_and(Option::is_some) {
                self.delete_edge(e);
            }
        }
        self.blocks.remove(&block);
    }

    /// Renders the graph for diagnostics.
    #[must_use]
    pub fn show(&self) -> String {
        self.to_string()
    }
}

impl Successors for ControlFlowGraph {
    type Node = BlockId;

    fn successors(&self, node: BlockId) -> Vec<BlockId> {
        self.successors_of(node)
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.blocks() {
            let block = self.block(id);
            write!(f, "{id}")?;
            if id == self.entry {
                f.write_str(" (entry)")?;
            }
            f.write_str(" preds:")?;
            for (_, e) in self.pred_edges(id) {
                write!(f, " {}", e.src)?;
            }
            f.write_str(" succs:")?;
            for (_, e) in self.succ_edges(id) {
                match &e.kind {
                    EdgeKind::Goto => write!(f, " goto {}", e.target)?,
                    EdgeKind::Branch(None) => write!(f, " branch {}", e.target)?,
                    EdgeKind::Branch(Some(k)) => write!(f, " case {k} {}", e.target)?,
                    EdgeKind::Throw { catch_type, .. } => match catch_type {
                        Some(t) => write!(f, " throw {t} {}", e.target)?,
                        None => write!(f, " throw <any> {}", e.target)?,
                    },
                    EdgeKind::Ghost => write!(f, " ghost {}", e.target)?,
                }
            }
            writeln!(f)?;
            for item in &block.items {
                writeln!(f, "  {item}")?;
            }
        }
        Ok(())
    }
}

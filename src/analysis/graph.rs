//! Fixpoint views of the editable CFG.
//!
//! The CFG itself is the forward view. [`ReversedCfg`] flips every edge for backward
//! analyses; its entry is the CFG's synthetic exit block when one has been calculated, or
//! a virtual sink otherwise, so a read-only analysis never has to mutate the graph.

use std::collections::HashSet;

use crate::{
    analysis::FixpointGraph,
    ir::cfg::{BlockId, ControlFlowGraph, EdgeId},
};

impl FixpointGraph for ControlFlowGraph {
    type Node = BlockId;
    type Edge = EdgeId;

    fn entry(&self) -> BlockId {
        ControlFlowGraph::entry(self)
    }

    fn predecessors(&self, node: BlockId) -> Vec<EdgeId> {
        self.block(node).preds().to_vec()
    }

    fn successors(&self, node: BlockId) -> Vec<EdgeId> {
        self.block(node).succs().to_vec()
    }

    fn source(&self, edge: EdgeId) -> BlockId {
        self.edge(edge).src
    }

    fn target(&self, edge: EdgeId) -> BlockId {
        self.edge(edge).target
    }
}

/// An edge of the reversed CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversedEdge {
    /// A CFG edge, traversed target to source.
    Cfg(EdgeId),
    /// From the virtual sink to a block that leaves the method.
    Sink(BlockId),
}

/// The CFG with every edge reversed.
pub struct ReversedCfg<'a> {
    cfg: &'a ControlFlowGraph,
    exit: BlockId,
    sinks: Vec<BlockId>,
}

impl<'a> ReversedCfg<'a> {
    /// Node id of the virtual sink when the CFG has no exit block.
    pub const VIRTUAL_EXIT: BlockId = BlockId(u32::MAX);

    /// Creates the reversed view.
    ///
    /// Without a calculated exit block, every block that returns, throws, has no
    /// successors, or cannot reach such a block (an infinite loop) is connected to the
    /// virtual sink.
    #[must_use]
    pub fn new(cfg: &'a ControlFlowGraph) -> Self {
        if let Some(exit) = cfg.exit() {
            return Self {
                cfg,
                exit,
                sinks: Vec::new(),
            };
        }
        let mut sinks = cfg.exit_points();
        let mut reaching: HashSet<BlockId> = sinks.iter().copied().collect();
        let mut stack = sinks.clone();
        while let Some(b) = stack.pop() {
            for p in cfg.predecessors_of(b) {
                if reaching.insert(p) {
                    stack.push(p);
                }
            }
        }
        // Visit stranded blocks in id order so the view stays deterministic.
        for b in cfg.block_ids() {
            if reaching.contains(&b) {
                continue;
            }
            sinks.push(b);
            reaching.insert(b);
            let mut stack = vec![b];
            while let Some(x) = stack.pop() {
                for p in cfg.predecessors_of(x) {
                    if reaching.insert(p) {
                        stack.push(p);
                    }
                }
            }
        }
        Self {
            cfg,
            exit: Self::VIRTUAL_EXIT,
            sinks,
        }
    }

    /// The underlying CFG.
    #[must_use]
    pub fn cfg(&self) -> &'a ControlFlowGraph {
        self.cfg
    }

    /// `true` if `node` is the virtual sink.
    #[must_use]
    pub fn is_virtual_exit(&self, node: BlockId) -> bool {
        node == Self::VIRTUAL_EXIT
    }
}

impl FixpointGraph for ReversedCfg<'_> {
    type Node = BlockId;
    type Edge = ReversedEdge;

    fn entry(&self) -> BlockId {
        self.exit
    }

    fn predecessors(&self, node: BlockId) -> Vec<ReversedEdge> {
        if self.is_virtual_exit(node) {
            return Vec::new();
        }
        let mut out: Vec<ReversedEdge> = self
            .cfg
            .block(node)
            .succs()
            .iter()
            .map(|&e| ReversedEdge::Cfg(e))
            .collect();
        if self.sinks.contains(&node) {
            out.push(ReversedEdge::Sink(node));
        }
        out
    }

    fn successors(&self, node: BlockId) -> Vec<ReversedEdge> {
        if self.is_virtual_exit(node) {
            return self.sinks.iter().map(|&b| ReversedEdge::Sink(b)).collect();
        }
        self.cfg
            .block(node)
            .preds()
            .iter()
            .map(|&e| ReversedEdge::Cfg(e))
            .collect()
    }

    fn source(&self, edge: ReversedEdge) -> BlockId {
        match edge {
            ReversedEdge::Cfg(e) => self.cfg.edge(e).target,
            ReversedEdge::Sink(_) => self.exit,
        }
    }

    fn target(&self, edge: ReversedEdge) -> BlockId {
        match edge {
            ReversedEdge::Cfg(e) => self.cfg.edge(e).src,
            ReversedEdge::Sink(b) => b,
        }
    }
}

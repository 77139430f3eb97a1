//! Register liveness.
//!
//! A register is *live* at a program point if some path from that point reads it before
//! writing it. This is a backward analysis over [`ReversedCfg`].
//!
//! # Algorithm
//!
//! - `live_before(i) = uses(i) ∪ (live_after(i) − defs(i))`
//! - at a may-throw instruction, the live-in sets of the block's handlers are added to
//!   `live_before`, because control may leave the block right there
//! - `live_out(B)` is the union of `live_in(S)` over the normal successors of `B`
//!
//! The domain keeps the two contributions apart so the node transfer can apply the
//! handler sets at the throwing instruction instead of at the block end.

use std::collections::HashMap;

use crate::{
    analysis::{
        AbstractDomain, FixpointAnalysis, MonotonicFixpointIterator, ReversedCfg, ReversedEdge,
    },
    ir::cfg::{BlockId, ControlFlowGraph},
    utils::BitSet,
};

/// Live registers flowing backwards into a block's end.
#[derive(Debug, Clone, Default)]
pub struct LiveRegs {
    /// Live after the block's last instruction.
    pub live: BitSet,
    /// Live at handler entries, applied at the block's throwing instruction.
    pub at_throw: BitSet,
}

impl PartialEq for LiveRegs {
    fn eq(&self, other: &Self) -> bool {
        same_bits(&self.live, &other.live) && same_bits(&self.at_throw, &other.at_throw)
    }
}

fn same_bits(a: &BitSet, b: &BitSet) -> bool {
    a.is_subset(b) && b.is_subset(a)
}

impl AbstractDomain for LiveRegs {
    const FINITE_HEIGHT: bool = true;

    fn bottom() -> Self {
        Self::default()
    }

    // Liveness never needs a top; "everything live" has no finite representation here.
    fn top() -> Self {
        Self::default()
    }

    fn is_bottom(&self) -> bool {
        self.live.is_empty() && self.at_throw.is_empty()
    }

    fn is_top(&self) -> bool {
        false
    }

    fn leq(&self, other: &Self) -> bool {
        self.live.is_subset(&other.live) && self.at_throw.is_subset(&other.at_throw)
    }

    fn join_with(&mut self, other: &Self) {
        self.live.union_with(&other.live);
        self.at_throw.union_with(&other.at_throw);
    }
}

struct LivenessTransfer;

impl LivenessTransfer {
    fn step(cfg: &ControlFlowGraph, block: BlockId, out: &LiveRegs) -> BitSet {
        let b = cfg.block(block);
        let throw_at = if cfg.throw_edges(block).is_empty() {
            None
        } else {
            b.last_throwing_index()
        };
        let mut live = out.live.clone();
        for (idx, insn) in b.instructions().rev() {
            for d in insn.reg_defs() {
                live.remove(d as usize);
            }
            if Some(idx) == throw_at {
                live.union_with(&out.at_throw);
            }
            for u in insn.reg_uses() {
                live.insert(u as usize);
            }
        }
        live
    }
}

impl FixpointAnalysis<ReversedCfg<'_>> for LivenessTransfer {
    type Domain = LiveRegs;

    fn analyze_node(&self, graph: &ReversedCfg<'_>, node: BlockId, state: &mut LiveRegs) {
        if graph.is_virtual_exit(node) || Some(node) == graph.cfg().exit() {
            *state = LiveRegs::default();
            return;
        }
        let live = Self::step(graph.cfg(), node, state);
        *state = LiveRegs {
            live,
            at_throw: BitSet::default(),
        };
    }

    fn analyze_edge(
        &self,
        graph: &ReversedCfg<'_>,
        edge: ReversedEdge,
        _entry: &LiveRegs,
        exit: &LiveRegs,
    ) -> LiveRegs {
        match edge {
            ReversedEdge::Cfg(e) if graph.cfg().edge(e).is_throw() => LiveRegs {
                live: BitSet::default(),
                at_throw: exit.live.clone(),
            },
            _ => exit.clone(),
        }
    }
}

/// Liveness results for one CFG.
#[derive(Debug, Clone, Default)]
pub struct LivenessResult {
    live_in: HashMap<BlockId, BitSet>,
    live_out: HashMap<BlockId, LiveRegs>,
}

impl LivenessResult {
    /// Computes liveness for every block.
    #[must_use]
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let reversed = ReversedCfg::new(cfg);
        let mut fp = MonotonicFixpointIterator::new(&reversed, LivenessTransfer);
        fp.run(LiveRegs::default());
        let mut result = Self::default();
        for b in cfg.block_ids() {
            // Backward: the entry state is at the block end, the exit state at its start.
            result.live_out.insert(b, fp.entry_state_at(b));
            result.live_in.insert(b, fp.exit_state_at(b).live);
        }
        result
    }

    /// Registers live at the start of `block`.
    #[must_use]
    pub fn live_in(&self, block: BlockId) -> BitSet {
        self.live_in.get(&block).cloned().unwrap_or_default()
    }

    /// Registers live after the last instruction of `block` on normal control flow.
    #[must_use]
    pub fn live_out(&self, block: BlockId) -> BitSet {
        self.live_out
            .get(&block)
            .map(|l| l.live.clone())
            .unwrap_or_default()
    }

    /// The live set after each instruction of `block`, keyed by item index.
    ///
    /// The set after the block's throwing instruction includes the handlers' live-in
    /// registers.
    #[must_use]
    pub fn live_after_each(&self, cfg: &ControlFlowGraph, block: BlockId) -> HashMap<usize, BitSet> {
        let out = self.live_out.get(&block).cloned().unwrap_or_default();
        let b = cfg.block(block);
        let throw_at = if cfg.throw_edges(block).is_empty() {
            None
        } else {
            b.last_throwing_index()
        };
        let mut live = out.live.clone();
        let mut result = HashMap::new();
        for (idx, insn) in b.instructions().rev() {
            let mut after = live.clone();
            if Some(idx) == throw_at {
                // Writes of a throwing instruction happen only when it does not throw.
                after.union_with(&out.at_throw);
            }
            result.insert(idx, after);
            for d in insn.reg_defs() {
                live.remove(d as usize);
            }
            if Some(idx) == throw_at {
                live.union_with(&out.at_throw);
            }
            for u in insn.reg_uses() {
                live.insert(u as usize);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::CodeBuilder, ir::IROpcode, pool::DexType};

    #[test]
    fn test_straight_line() {
        let mut b = CodeBuilder::new(3);
        b.const_int(0, 1)
            .const_int(1, 2)
            .binop(IROpcode::AddInt, 2, 0, 0)
            .ret(2);
        let cfg = b.build_cfg();
        let live = LivenessResult::compute(&cfg);
        let after = live.live_after_each(&cfg, cfg.entry());
        // r1 is never read.
        assert!(after.values().all(|s| !s.contains(1)));
        assert!(live.live_in(cfg.entry()).is_empty());
    }

    #[test]
    fn test_loop_keeps_counter_live() {
        let mut b = CodeBuilder::new(2);
        let head = b.label();
        let done = b.label();
        b.load_param(1)
            .const_int(0, 0)
            .bind(head)
            .if_z(IROpcode::IfEqz, 1, done)
            .add_lit(IROpcode::AddIntLit, 0, 0, 1)
            .goto(head)
            .bind(done)
            .ret(0);
        let cfg = b.build_cfg();
        let live = LivenessResult::compute(&cfg);
        let head_block = cfg
            .block_ids()
            .find(|&id| {
                cfg.block(id)
                    .first_insn()
                    .is_some_and(|(_, i)| i.opcode() == IROpcode::IfEqz)
            })
            .unwrap();
        let at_head = live.live_in(head_block);
        assert!(at_head.contains(0) && at_head.contains(1));
    }

    #[test]
    fn test_handler_uses_are_live_at_throw() {
        let mut b = CodeBuilder::new(2);
        let handler = b.catch_label();
        b.const_int(0, 5)
            .try_start(handler)
            .invoke_static("LFoo;.bar:()I", &[])
            .move_result(IROpcode::MoveResult, 0)
            .try_end(handler)
            .ret(0)
            .bind_catch(handler, Some(DexType::throwable()))
            .ret(0);
        let cfg = b.build_cfg();
        let live = LivenessResult::compute(&cfg);
        let (thrower, idx) = cfg
            .instructions()
            .into_iter()
            .find(|(_, i)| i.opcode() == IROpcode::InvokeStatic)
            .map(|(p, _)| (p.block, p.index))
            .unwrap();
        // r0 is overwritten by the move-result, but the handler reads the old value.
        let before_invoke: BitSet = {
            let after = live.live_after_each(&cfg, thrower);
            after[&idx].clone()
        };
        assert!(before_invoke.contains(0));
    }
}

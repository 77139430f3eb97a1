//! Register allocation.
//!
//! Passes create registers freely (the inliner shifts callee frames above the caller's,
//! temps are appended at the top), so frames grow. This pass renames every register so
//! that values whose live ranges never overlap share one.
//!
//! # Algorithm
//!
//! 1. Every register that is written or read is a node; a register read or written as a
//!    pair is a wide node covering two slots.
//! 2. A node defined at a point interferes with every node live right after that point.
//!    The source of a move does not interfere with its destination, which lets biased
//!    colouring turn the move into a self-move that is then deleted.
//! 3. Nodes are coloured greedily in order of first appearance, lowest free slot first,
//!    trying the source of the defining move before anything else.
//! 4. Parameters are placed above every other colour, in declaration order, because the
//!    runtime passes arguments in the last registers of the frame.
//!
//! Methods in which a register is used both as the low half of a pair and on its own in
//! a way that makes the halves ambiguous are left untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;

use crate::{
    analysis::LivenessResult,
    compiler::{walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions},
    ir::{
        cfg::{CfgPosition, ControlFlowGraph},
        Reg,
    },
    model::Program,
    passes::utils::{with_cfg, Changed},
    Result,
};

/// Outcome of allocating one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Frame size before.
    pub before: u32,
    /// Frame size after.
    pub after: u32,
    /// Moves that became self-moves and were deleted.
    pub moves_coalesced: usize,
}

impl Changed for AllocationStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.after < self.before || self.moves_coalesced > 0
    }
}

#[derive(Debug, Default)]
struct Node {
    width: u32,
    neighbours: BTreeSet<Reg>,
    hint: Option<Reg>,
}

struct InterferenceGraph {
    nodes: BTreeMap<Reg, Node>,
    order: Vec<Reg>,
    params: Vec<Reg>,
}

impl InterferenceGraph {
    fn touch(&mut self, reg: Reg, width: u32) {
        let node = self.nodes.entry(reg).or_insert_with(|| {
            self.order.push(reg);
            Node::default()
        });
        node.width = node.width.max(width);
    }

    fn node_of(&self, reg: Reg) -> Option<Reg> {
        if self.nodes.contains_key(&reg) {
            return Some(reg);
        }
        let low = reg.checked_sub(1)?;
        self.nodes
            .get(&low)
            .filter(|n| n.width == 2)
            .map(|_| low)
    }

    fn interfere(&mut self, a: Reg, b: Reg) {
        if a == b {
            return;
        }
        if let Some(n) = self.nodes.get_mut(&a) {
            n.neighbours.insert(b);
        }
        if let Some(n) = self.nodes.get_mut(&b) {
            n.neighbours.insert(a);
        }
    }

    /// Collects the nodes of `cfg`, or `None` if some pair overlaps another register.
    fn build(cfg: &ControlFlowGraph) -> Option<Self> {
        let mut graph = Self {
            nodes: BTreeMap::new(),
            order: Vec::new(),
            params: Vec::new(),
        };
        let blocks = cfg.blocks();
        for &block in &blocks {
            for (_, insn) in cfg.block(block).instructions() {
                if let Some(d) = insn.dest() {
                    graph.touch(d, if insn.dest_is_wide() { 2 } else { 1 });
                    if insn.opcode().is_load_param() && block == cfg.entry() {
                        graph.params.push(d);
                    }
                    if insn.opcode().is_move() {
                        if let Some(node) = graph.nodes.get_mut(&d) {
                            node.hint.get_or_insert(insn.src(0));
                        }
                    }
                }
                for (i, &s) in insn.srcs().iter().enumerate() {
                    graph.touch(s, if insn.src_is_wide(i) { 2 } else { 1 });
                }
            }
        }
        let overlapping = graph
            .nodes
            .iter()
            .any(|(&r, n)| n.width == 2 && graph.nodes.contains_key(&(r + 1)));
        if overlapping {
            return None;
        }

        let liveness = LivenessResult::compute(cfg);
        for &block in &blocks {
            let after = liveness.live_after_each(cfg, block);
            for (index, insn) in cfg.block(block).instructions() {
                let (Some(d), Some(live)) = (insn.dest(), after.get(&index)) else {
                    continue;
                };
                let source = insn.opcode().is_move().then(|| insn.src(0));
                let live: Vec<Reg> = live
                    .iter()
                    .filter_map(|l| graph.node_of(l as Reg))
                    .filter(|&n| Some(n) != source)
                    .collect();
                for n in live {
                    graph.interfere(d, n);
                }
            }
        }
        Some(graph)
    }

    /// Colours every node and returns the mapping and the frame size.
    fn colour(&self) -> (HashMap<Reg, Reg>, u32) {
        let mut colours: HashMap<Reg, Reg> = HashMap::new();
        let width = |r: &Reg| self.nodes.get(r).map_or(1, |n| n.width);
        for reg in self.order.iter().filter(|r| !self.params.contains(r)) {
            let Some(node) = self.nodes.get(reg) else {
                continue;
            };
            let taken: Vec<(Reg, Reg)> = node
                .neighbours
                .iter()
                .filter_map(|n| colours.get(n).map(|&c| (c, c + width(n))))
                .collect();
            let free = |c: Reg| {
                taken
                    .iter()
                    .all(|&(lo, hi)| c + node.width <= lo || c >= hi)
            };
            let hinted = node
                .hint
                .and_then(|h| colours.get(&h).copied())
                .filter(|&c| free(c));
            let colour = hinted.unwrap_or_else(|| (0..).find(|&c| free(c)).unwrap_or(0));
            colours.insert(*reg, colour);
        }
        let mut top = colours
            .iter()
            .map(|(r, &c)| c + width(r))
            .max()
            .unwrap_or(0);
        for param in &self.params {
            colours.insert(*param, top);
            top += width(param);
        }
        (colours, top)
    }
}

/// Re-allocates the registers of `cfg`. Returns `None` if the method was left untouched.
pub fn allocate_registers(cfg: &mut ControlFlowGraph) -> Option<AllocationStats> {
    let graph = InterferenceGraph::build(cfg)?;
    let (colours, size) = graph.colour();
    let before = cfg.registers_size();
    let rename = |r: Reg| {
        if let Some(&c) = colours.get(&r) {
            return c;
        }
        match graph.node_of(r) {
            Some(low) => colours.get(&low).map_or(r, |&c| c + 1),
            None => r,
        }
    };

    let mut self_moves = Vec::new();
    for block in cfg.blocks() {
        for (index, item) in cfg.block_mut(block).items_mut().iter_mut().enumerate() {
            let Some(insn) = item.insn_mut() else {
                continue;
            };
            insn.remap_registers(&rename);
            if insn.opcode().is_move() && insn.dest() == Some(insn.src(0)) {
                self_moves.push(CfgPosition::new(block, index));
            }
        }
    }
    for pos in self_moves.iter().rev() {
        cfg.remove_insn(*pos);
    }
    cfg.set_registers_size(size);
    Some(AllocationStats {
        before,
        after: size,
        moves_coalesced: self_moves.len(),
    })
}

/// `RegAllocPass`.
#[derive(Debug, Default)]
pub struct RegAllocPass;

impl RegAllocPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for RegAllocPass {
    fn name(&self) -> &'static str {
        "RegAllocPass"
    }

    fn description(&self) -> &'static str {
        "Shrink frames by colouring the register interference graph"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::RegistersAllocated, Interaction::Establishes),
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let total = walk::parallel_reduce(
            program,
            |method| {
                let before = method.code().map_or(0, |c| c.registers_size());
                let stats = with_cfg(method, |cfg| allocate_registers(cfg).unwrap_or_default());
                if !stats.changed() {
                    return AllocationStats {
                        before,
                        after: before,
                        moves_coalesced: 0,
                    };
                }
                debug!("{}: {} -> {} registers", method.reference(), stats.before, stats.after);
                ctx.events
                    .record(EventKind::RegistersAllocated)
                    .method(method.reference())
                    .message(format!("{} -> {}", stats.before, stats.after));
                stats
            },
            |a, b| AllocationStats {
                before: a.before + b.before,
                after: a.after + b.after,
                moves_coalesced: a.moves_coalesced + b.moves_coalesced,
            },
        );
        ctx.incr_metric("registers_before", i64::from(total.before));
        ctx.incr_metric("registers_after", i64::from(total.after));
        ctx.incr_metric("moves_coalesced", total.moves_coalesced as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::IROpcode,
        model::DexMethod,
        test::helpers::{program_of, run_pass, static_method},
    };

    fn listing(method: &DexMethod) -> Vec<String> {
        method
            .code()
            .unwrap()
            .instructions()
            .iter()
            .map(|i| i.to_string())
            .collect()
    }

    #[test]
    fn test_disjoint_ranges_share_registers() {
        let mut program = program_of(vec![static_method("LFoo;.f:()I", 4, |b| {
            b.const_int(0, 1)
                .const_int(1, 2)
                .binop(IROpcode::AddInt, 2, 0, 1)
                .ret(2);
        })]);
        let metrics = run_pass(&mut RegAllocPass::new(), &mut program);
        assert_eq!(metrics.get("registers_before"), 4);
        assert_eq!(metrics.get("registers_after"), 2);
        let method = program.methods().next().unwrap();
        assert_eq!(method.code().unwrap().registers_size(), 2);
        assert_eq!(listing(method)[2], "add-int v0, v0, v1");
    }

    #[test]
    fn test_params_at_top() {
        let mut program = program_of(vec![static_method("LFoo;.g:(I)I", 5, |b| {
            b.load_param(4)
                .const_int(0, 7)
                .binop(IROpcode::AddInt, 1, 0, 4)
                .ret(1);
        })]);
        run_pass(&mut RegAllocPass::new(), &mut program);
        let method = program.methods().next().unwrap();
        assert_eq!(method.code().unwrap().registers_size(), 2);
        assert_eq!(
            listing(method),
            vec!["load-param v1", "const v0, 7", "add-int v0, v0, v1", "return v0"]
        );
    }

    #[test]
    fn test_wide_pairs_do_not_overlap() {
        let mut program = program_of(vec![static_method("LFoo;.w:()J", 6, |b| {
            b.const_wide(4, 1)
                .const_int(0, 2)
                .sput("LFoo;.i:I", 0)
                .ret_wide(4);
        })]);
        run_pass(&mut RegAllocPass::new(), &mut program);
        let code = program.methods().next().unwrap().code().unwrap();
        assert_eq!(code.registers_size(), 3);
        let dests: Vec<Option<Reg>> = code.instructions().iter().map(|i| i.dest()).collect();
        assert_eq!(dests[0], Some(0));
        assert_eq!(dests[1], Some(2));
    }

    #[test]
    fn test_moves_coalesced() {
        let mut program = program_of(vec![static_method("LFoo;.m:()I", 4, |b| {
            b.const_int(0, 1).mov(IROpcode::Move, 3, 0).ret(3);
        })]);
        let metrics = run_pass(&mut RegAllocPass::new(), &mut program);
        assert_eq!(metrics.get("moves_coalesced"), 1);
        let method = program.methods().next().unwrap();
        assert_eq!(listing(method), vec!["const v0, 1", "return v0"]);
    }

    #[test]
    fn test_ambiguous_pairs_left_alone() {
        let mut program = program_of(vec![static_method("LFoo;.a:()V", 4, |b| {
            b.const_wide(0, 1).const_int(1, 2).sput("LFoo;.i:I", 1).return_void();
        })]);
        let before = program.methods().next().unwrap().code().unwrap().to_string();
        let metrics = run_pass(&mut RegAllocPass::new(), &mut program);
        assert_eq!(metrics.get("registers_after"), 4);
        assert_eq!(program.methods().next().unwrap().code().unwrap().to_string(), before);
    }
}

//! Block-local copy propagation.
//!
//! Each register is tagged with a value number as the block is walked forward: constants by
//! their literal, every other definition by a fresh number, and moves by their source's
//! number. Moves and constants that write a value the destination already holds are deleted,
//! and instruction sources are renamed to the lowest register holding the same value.
//!
//! Wide values are not tracked; a wide definition clobbers both halves. Monitor
//! instructions keep their registers because the verifier pairs them by register.

use std::collections::BTreeMap;

use crate::{
    compiler::{walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions},
    ir::{
        cfg::{BlockId, CfgPosition, ControlFlowGraph},
        IRInstruction, IROpcode, Reg,
    },
    model::Program,
    passes::utils::{with_cfg, Changed},
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueId {
    Literal(i64),
    Fresh(u32),
}

/// Counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyPropStats {
    /// Moves and constants deleted.
    pub moves_eliminated: usize,
    /// Source operands renamed.
    pub sources_replaced: usize,
}

impl Changed for CopyPropStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.moves_eliminated + self.sources_replaced > 0
    }
}

#[derive(Default)]
struct Numbering {
    values: BTreeMap<Reg, ValueId>,
    next: u32,
}

impl Numbering {
    fn get(&self, reg: Reg) -> Option<ValueId> {
        self.values.get(&reg).copied()
    }

    fn fresh(&mut self) -> ValueId {
        self.next += 1;
        ValueId::Fresh(self.next)
    }

    /// The number of `reg`, assigning one on first sight.
    fn of(&mut self, reg: Reg) -> ValueId {
        if let Some(v) = self.get(reg) {
            return v;
        }
        let v = self.fresh();
        self.values.insert(reg, v);
        v
    }

    fn representative(&self, reg: Reg) -> Option<Reg> {
        let value = self.get(reg)?;
        self.values
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(r, _)| *r)
            .filter(|r| *r < reg)
    }

    fn clobber(&mut self, insn: &IRInstruction) {
        for d in insn.reg_defs() {
            self.values.remove(&d);
        }
    }
}

/// Runs copy propagation on every block of `cfg`.
pub fn propagate_copies(cfg: &mut ControlFlowGraph) -> CopyPropStats {
    let mut stats = CopyPropStats::default();
    for block in cfg.blocks() {
        propagate_block(cfg, block, &mut stats);
    }
    stats
}

fn propagate_block(cfg: &mut ControlFlowGraph, block: BlockId, stats: &mut CopyPropStats) {
    let mut numbering = Numbering::default();
    let mut dead = Vec::new();
    let indices: Vec<usize> = cfg.block(block).instructions().map(|(i, _)| i).collect();
    for idx in indices {
        let pos = CfgPosition::new(block, idx);
        let Some(insn) = cfg.insn_at_mut(pos) else {
            continue;
        };
        let op = insn.opcode();

        if !matches!(op, IROpcode::MonitorEnter | IROpcode::MonitorExit) && !op.is_move_result_any() {
            for i in 0..insn.srcs().len() {
                if insn.src_is_wide(i) {
                    continue;
                }
                if let Some(rep) = numbering.representative(insn.src(i)) {
                    insn.set_src(i, rep);
                    stats.sources_replaced += 1;
                }
            }
        }

        match op {
            IROpcode::Move | IROpcode::MoveObject => {
                let (dest, src) = (insn.dest().unwrap_or_default(), insn.src(0));
                let value = numbering.of(src);
                if dest == src || numbering.get(dest) == Some(value) {
                    dead.push(pos);
                    continue;
                }
                numbering.clobber(insn);
                numbering.values.insert(dest, value);
            }
            IROpcode::Const => {
                let dest = insn.dest().unwrap_or_default();
                let value = ValueId::Literal(insn.literal().unwrap_or_default());
                if numbering.get(dest) == Some(value) {
                    dead.push(pos);
                    continue;
                }
                numbering.clobber(insn);
                numbering.values.insert(dest, value);
            }
            _ => {
                numbering.clobber(insn);
                if let Some(dest) = insn.dest().filter(|_| !insn.dest_is_wide()) {
                    let fresh = numbering.fresh();
                    numbering.values.insert(dest, fresh);
                }
            }
        }
    }
    stats.moves_eliminated += dead.len();
    for pos in dead.into_iter().rev() {
        cfg.remove_insn(pos);
    }
}

/// `CopyPropagationPass`.
#[derive(Debug, Default)]
pub struct CopyPropagationPass;

impl CopyPropagationPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for CopyPropagationPass {
    fn name(&self) -> &'static str {
        "CopyPropagationPass"
    }

    fn description(&self) -> &'static str {
        "Delete redundant moves and constants within blocks"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let stats = walk::parallel_reduce(
            program,
            |method| {
                let stats = with_cfg(method, propagate_copies);
                if stats.moves_eliminated > 0 {
                    ctx.events
                        .record(EventKind::InstructionRemoved)
                        .method(method.reference())
                        .message(format!("{} redundant moves", stats.moves_eliminated));
                }
                stats
            },
            |a, b| CopyPropStats {
                moves_eliminated: a.moves_eliminated + b.moves_eliminated,
                sources_replaced: a.sources_replaced + b.sources_replaced,
            },
        );
        ctx.incr_metric("moves_eliminated", stats.moves_eliminated as i64);
        ctx.incr_metric("sources_replaced", stats.sources_replaced as i64);
        Ok(())
    }
}

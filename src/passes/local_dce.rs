//! Local dead-code elimination.
//!
//! Removes, within one method, every instruction that cannot affect the method's
//! observable behaviour: instructions in blocks unreachable from the entry, and
//! instructions whose effects are limited to allocation (see
//! [`classify`](crate::analysis::classify)) and whose result is not live.
//!
//! # Algorithm
//!
//! 1. Delete blocks unreachable from the entry.
//! 2. Compute liveness and delete every removable instruction whose definitions are dead.
//!    An instruction with a `move-result-pseudo` is judged by the pseudo's destination
//!    and removed together with it. An invoke followed by a `move-result` is kept until
//!    a later round has removed the dead `move-result`.
//! 3. Delete conditional branches whose taken and fall-through edges meet the same block,
//!    looking through empty blocks that only jump onward.
//! 4. Repeat until nothing changes. Removing the last may-throw instruction of a block
//!    drops its throw edges, which can make a catch block unreachable in the next round.
//!
//! Try regions are not items of the CFG: a surviving may-throw instruction keeps its
//! throw edges, and linearization re-emits the try markers around it.
//!
//! # Example
//!
//! ```rust
//! use dexopt::ir::CodeBuilder;
//! use dexopt::passes::LocalDce;
//!
//! let mut b = CodeBuilder::new(2);
//! b.const_int(0, 1).const_string(1, "unused").ret(0);
//! let mut cfg = b.build_cfg();
//!
//! let stats = LocalDce::new().run(&mut cfg);
//! assert_eq!(stats.instructions_removed, 1);
//! ```

use std::ops::Add;

use log::debug;

use crate::{
    analysis::{classify, LivenessResult},
    compiler::{
        walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions,
    },
    ir::{
        cfg::{CfgPosition, ControlFlowGraph, EdgeKind},
        IRInstruction, IROpcode,
    },
    model::Program,
    passes::utils::{with_cfg, Changed},
    Result,
};

/// Counts of what one run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DceStats {
    /// Instructions deleted, unreachable ones included.
    pub instructions_removed: usize,
    /// Unreachable blocks deleted.
    pub blocks_removed: usize,
    /// Conditional branches collapsed into gotos.
    pub branches_removed: usize,
}

impl Add for DceStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            instructions_removed: self.instructions_removed + other.instructions_removed,
            blocks_removed: self.blocks_removed + other.blocks_removed,
            branches_removed: self.branches_removed + other.branches_removed,
        }
    }
}

impl Changed for DceStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        *self != Self::default()
    }
}

/// The per-method dead-code eliminator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDce;

impl LocalDce {
    /// Creates the eliminator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Eliminates dead code in `cfg` until nothing more can be removed.
    pub fn run(&self, cfg: &mut ControlFlowGraph) -> DceStats {
        let mut stats = DceStats::default();
        loop {
            let (blocks, insns) = cfg.remove_unreachable_blocks();
            stats.blocks_removed += blocks;
            stats.instructions_removed += insns;

            let dead = Self::dead_instructions(cfg);
            for &pos in dead.iter().rev() {
                cfg.remove_insn(pos);
            }
            stats.instructions_removed += dead.len();

            let branches = Self::collapse_branches(cfg);
            stats.branches_removed += branches;

            if blocks == 0 && dead.is_empty() && branches == 0 {
                return stats;
            }
        }
    }

    /// Positions of dead instructions, in ascending order.
    fn dead_instructions(cfg: &ControlFlowGraph) -> Vec<CfgPosition> {
        let liveness = LivenessResult::compute(cfg);
        let mut dead = Vec::new();
        for block in cfg.blocks() {
            let after = liveness.live_after_each(cfg, block);
            for (index, insn) in cfg.block(block).instructions() {
                let pos = CfgPosition::new(block, index);
                if !Self::is_candidate(insn) {
                    continue;
                }
                let result_at = match cfg.move_result_of(pos) {
                    Some(r) if insn.opcode().has_move_result_pseudo() => r,
                    // The move-result goes first.
                    Some(_) => continue,
                    None => pos,
                };
                let Some(defs) = cfg.insn_at(result_at).map(IRInstruction::reg_defs) else {
                    continue;
                };
                let live = after.get(&result_at.index);
                let is_dead = defs
                    .iter()
                    .all(|&r| !live.is_some_and(|l| l.contains(r as usize)));
                if is_dead {
                    dead.push(pos);
                }
            }
        }
        dead
    }

    fn is_candidate(insn: &IRInstruction) -> bool {
        let op = insn.opcode();
        if op.is_load_param()
            || op.ends_block()
            || op.is_move_result_pseudo()
            || op == IROpcode::MoveException
        {
            return false;
        }
        classify(insn).is_removable()
    }

    /// Replaces `if-*` whose both edges reach one block by a plain fall-through.
    ///
    /// Empty `goto`-only blocks on either edge are looked through, so an arm emptied by
    /// this round still collapses its branch.
    pub(crate) fn collapse_branches(cfg: &mut ControlFlowGraph) -> usize {
        let mut collapsed = 0;
        for block in cfg.blocks() {
            let Some((index, last)) = cfg.block(block).last_insn() else {
                continue;
            };
            if !last.opcode().is_conditional_branch() {
                continue;
            }
            let edges: Vec<_> = cfg
                .succ_edges(block)
                .filter(|(_, e)| matches!(e.kind, EdgeKind::Goto | EdgeKind::Branch(_)))
                .map(|(_, e)| (e.kind == EdgeKind::Goto, e.target))
                .collect();
            if edges.len() < 2 {
                continue;
            }
            let landing = cfg.skip_empty_gotos(edges[0].1);
            if edges.iter().any(|&(_, t)| cfg.skip_empty_gotos(t) != landing) {
                continue;
            }
            // The fall-through block stays the successor; positions on it are kept.
            let fallthrough = edges
                .iter()
                .find(|(is_goto, _)| *is_goto)
                .map_or(landing, |&(_, t)| t);
            cfg.remove_insn(CfgPosition::new(block, index));
            for &(_, target) in &edges {
                cfg.delete_edges_between(block, target);
            }
            cfg.add_edge(block, fallthrough, EdgeKind::Goto);
            collapsed += 1;
        }
        collapsed
    }
}

/// `LocalDcePass`: runs [`LocalDce`] on every method.
#[derive(Debug, Default)]
pub struct LocalDcePass;

impl LocalDcePass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for LocalDcePass {
    fn name(&self) -> &'static str {
        "LocalDcePass"
    }

    fn description(&self) -> &'static str {
        "Remove unreachable blocks and pure instructions with dead results"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Establishes),
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let dce = LocalDce::new();
        let stats = walk::parallel_reduce(
            program,
            |method| {
                let stats = with_cfg(method, |cfg| dce.run(cfg));
                if stats.changed() {
                    ctx.events
                        .record(EventKind::InstructionRemoved)
                        .method(method.reference())
                        .message(format!("{} dead instructions", stats.instructions_removed));
                }
                stats
            },
            Add::add,
        );
        debug!(
            "LocalDcePass: removed {} instructions, {} blocks",
            stats.instructions_removed, stats.blocks_removed
        );
        ctx.incr_metric("instructions_removed", stats.instructions_removed as i64);
        ctx.incr_metric("blocks_removed", stats.blocks_removed as i64);
        ctx.incr_metric("branches_removed", stats.branches_removed as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{CodeBuilder, IRCode, MethodItem},
        passes::utils::with_code_cfg,
        pool::DexType,
    };

    fn dce(code: &mut IRCode) -> DceStats {
        with_code_cfg(code, |cfg| LocalDce::new().run(cfg))
    }

    fn opcodes(code: &IRCode) -> Vec<IROpcode> {
        code.instructions().iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn test_removes_dead_pure_chain() {
        let mut b = CodeBuilder::new(3);
        b.const_int(0, 1)
            .const_int(1, 2)
            .binop(IROpcode::AddInt, 2, 1, 1)
            .ret(0);
        let mut code = b.build();
        let stats = dce(&mut code);
        assert_eq!(stats.instructions_removed, 2);
        assert_eq!(opcodes(&code), vec![IROpcode::Const, IROpcode::Return]);
    }

    #[test]
    fn test_keeps_effects() {
        let mut b = CodeBuilder::new(2);
        b.const_int(0, 0)
            .invoke_static("LFoo;.sideEffect:(I)V", &[0])
            .sget("LFoo;.f:I", 1)
            .binop(IROpcode::DivInt, 1, 1, 0)
            .return_void();
        let mut code = b.build();
        let before = code.count_opcodes();
        assert!(!dce(&mut code).changed());
        assert_eq!(code.count_opcodes(), before);
    }

    #[test]
    fn test_pure_invoke_and_result_removed() {
        let mut b = CodeBuilder::new(2);
        b.const_int(0, 3)
            .invoke_static("Ljava/lang/Integer;.valueOf:(I)Ljava/lang/Integer;", &[0])
            .move_result(IROpcode::MoveResultObject, 1)
            .return_void();
        let mut code = b.build();
        dce(&mut code);
        assert_eq!(opcodes(&code), vec![IROpcode::ReturnVoid]);
    }

    #[test]
    fn test_unreachable_catch_removed_with_last_thrower() {
        let mut b = CodeBuilder::new(1);
        let handler = b.catch_label();
        b.try_start(handler)
            .new_instance(0, "LFoo;")
            .try_end(handler)
            .return_void()
            .bind_catch(handler, Some(DexType::throwable()))
            .return_void();
        let mut code = b.build();
        dce(&mut code);
        assert!(!code.has_try_regions());
        assert_eq!(opcodes(&code), vec![IROpcode::ReturnVoid]);
    }

    #[test]
    fn test_handler_use_keeps_value_alive() {
        let mut b = CodeBuilder::new(2);
        let handler = b.catch_label();
        b.const_int(0, 7)
            .try_start(handler)
            .invoke_static("LFoo;.a:()V", &[])
            .try_end(handler)
            .return_void()
            .bind_catch(handler, None)
            .ret(0);
        let mut code = b.build();
        dce(&mut code);
        assert!(opcodes(&code).contains(&IROpcode::Const));
    }

    #[test]
    fn test_same_target_branch_collapsed() {
        let mut b = CodeBuilder::new(1);
        let next = b.label();
        b.load_param(0)
            .if_z(IROpcode::IfEqz, 0, next)
            .bind(next)
            .return_void();
        let mut code = b.build();
        let stats = dce(&mut code);
        assert_eq!(stats.branches_removed, 1);
        assert!(!opcodes(&code).contains(&IROpcode::IfEqz));
    }

    #[test]
    fn test_idempotent() {
        let mut b = CodeBuilder::new(2);
        let skip = b.label();
        b.load_param(1)
            .const_int(0, 5)
            .if_z(IROpcode::IfNez, 1, skip)
            .const_string(0, "dead")
            .bind(skip)
            .return_void();
        let mut code = b.build();
        let first = dce(&mut code);
        assert_eq!(first.instructions_removed, 2);
        assert_eq!(first.branches_removed, 1);
        assert_eq!(opcodes(&code), vec![IROpcode::LoadParam, IROpcode::ReturnVoid]);
        let once = code.to_string();
        assert!(!dce(&mut code).changed());
        assert_eq!(code.to_string(), once);
        assert!(code
            .list()
            .iter()
            .all(|(_, item)| !matches!(item, MethodItem::Insn(i) if i.opcode() == IROpcode::ConstString)));
    }
}

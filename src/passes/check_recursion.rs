//! Detection of deeply self-recursive methods.
//!
//! Some ART versions inline a method into itself repeatedly when it calls itself from many
//! sites, blowing up compile time and code size. A method with at least
//! `bad_recursion_count` self-invocations is *detected*. If it has no try regions it is
//! also *patched*: every may-throw block gets a catch-all handler that rethrows, which
//! keeps the runtime inliner away from it without changing behaviour.

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, walk, EventKind, Interaction, Pass, PassContext, Property,
        PropertyInteractions,
    },
    ir::{cfg::ControlFlowGraph, IRCode, IRInstruction, IROpcode},
    model::{DexMethod, Program},
    pool::DexMethodRef,
    Result,
};

/// Options of [`CheckRecursionPass`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckRecursionConfig {
    /// Minimum number of self-invocations that flags a method.
    pub bad_recursion_count: usize,
}

impl Default for CheckRecursionConfig {
    fn default() -> Self {
        Self {
            bad_recursion_count: 4,
        }
    }
}

/// Number of invokes in `code` that target `method` itself.
#[must_use]
pub fn self_invocations(method: &DexMethodRef, code: &IRCode) -> usize {
    code.instructions()
        .iter()
        .filter(|i| i.opcode().is_invoke() && i.method() == Some(method))
        .count()
}

/// Gives every may-throw block of `cfg` a catch-all handler that rethrows.
///
/// # Returns
///
/// `false` if nothing in the body can throw, leaving `cfg` untouched.
pub fn wrap_in_rethrow(cfg: &mut ControlFlowGraph) -> bool {
    let throwing: Vec<_> = cfg
        .blocks()
        .into_iter()
        .filter(|&b| cfg.block(b).may_throw())
        .collect();
    if throwing.is_empty() {
        return false;
    }
    let exception = cfg.allocate_temp();
    let handler = cfg.create_block();
    cfg.push_back(
        handler,
        IRInstruction::new(IROpcode::MoveException).with_dest(exception),
    );
    cfg.push_back(
        handler,
        IRInstruction::new(IROpcode::Throw).with_srcs(&[exception]),
    );
    for block in throwing {
        cfg.append_handlers(block, &[(None, handler)]);
    }
    true
}

#[derive(Debug, Default, Clone, Copy)]
struct RecursionStats {
    detected: usize,
    patched: usize,
}

/// `CheckRecursionPass`.
#[derive(Debug, Default)]
pub struct CheckRecursionPass {
    config: CheckRecursionConfig,
}

impl CheckRecursionPass {
    /// Creates the pass with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, method: &mut DexMethod) -> RecursionStats {
        let reference = method.reference().clone();
        let Some(code) = method.code_mut() else {
            return RecursionStats::default();
        };
        let calls = self_invocations(&reference, code);
        if calls < self.config.bad_recursion_count {
            return RecursionStats::default();
        }
        debug!("{reference} calls itself {calls} times");
        if code.has_try_regions() {
            return RecursionStats {
                detected: 1,
                patched: 0,
            };
        }
        code.build_cfg();
        let patched = wrap_in_rethrow(code.cfg_mut());
        code.clear_cfg();
        RecursionStats {
            detected: 1,
            patched: usize::from(patched),
        }
    }
}

impl Pass for CheckRecursionPass {
    fn name(&self) -> &'static str {
        "CheckRecursionPass"
    }

    fn description(&self) -> &'static str {
        "Shield heavily self-recursive methods from runtime self-inlining"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let this = &*self;
        let stats = walk::parallel_reduce(
            program,
            |method| {
                let stats = this.check(method);
                if stats.patched > 0 {
                    ctx.events
                        .record(EventKind::MethodPatched)
                        .method(method.reference())
                        .message("wrapped in catch-all rethrow");
                }
                stats
            },
            |a, b| RecursionStats {
                detected: a.detected + b.detected,
                patched: a.patched + b.patched,
            },
        );
        ctx.incr_metric("methods_detected", stats.detected as i64);
        ctx.incr_metric("methods_patched", stats.patched as i64);
        Ok(())
    }
}

//! Inlining of bridge and synthetic trampolines.
//!
//! javac emits bridge methods for covariant overrides and synthetic accessors for nested
//! class access. Both are trampolines: their body loads its parameters, forwards them
//! unchanged to one invoke, optionally moves the result, and returns. Calls to them cost a
//! frame and a method reference for nothing, so every call that provably reaches a
//! trampoline is replaced by the trampoline's body through the [inliner](super::inliner).
//!
//! Only call sites that cannot dispatch elsewhere are rewritten: static and direct
//! invokes, and virtual invokes of a final trampoline or one declared in a final class.
//! Synthetic non-virtual trampolines left without callers are deleted.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, walk, EventKind, Interaction, Pass, PassContext, Property,
        PropertyInteractions,
    },
    ir::{
        cfg::{CfgPosition, ControlFlowGraph},
        IROpcode,
    },
    model::{AccessFlags, ClassHierarchy, DexMethod, MethodSearch, Program},
    passes::{
        inliner::{apply_promotions, inline_at, InlineContext, Promotion},
        utils::{with_cfg, Changed},
    },
    pool::DexMethodRef,
    Result,
};

/// Options of [`BridgeSynthInlinePass`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSynthConfig {
    /// Inline bridge methods.
    pub inline_bridges: bool,
    /// Inline synthetic accessors.
    pub inline_synthetics: bool,
    /// Delete synthetic trampolines that lost every caller.
    pub remove_dead_trampolines: bool,
}

impl Default for BridgeSynthConfig {
    fn default() -> Self {
        Self {
            inline_bridges: true,
            inline_synthetics: true,
            remove_dead_trampolines: true,
        }
    }
}

/// Returns the forwarded target if `method` is a trampoline.
///
/// The body must be exactly: the `load-param*` instructions, one invoke taking the
/// loaded registers in order, an optional `move-result*`, and a return of that result
/// (or `return-void`).
#[must_use]
pub fn trampoline_target(method: &DexMethod) -> Option<DexMethodRef> {
    let code = method.code()?;
    let insns = code.instructions();
    let params: Vec<_> = insns
        .iter()
        .take_while(|i| i.opcode().is_load_param())
        .filter_map(|i| i.dest())
        .collect();
    let mut rest = insns[params.len()..].iter();

    let invoke = rest.next()?;
    if !invoke.opcode().is_invoke()
        || matches!(invoke.opcode(), IROpcode::InvokeSuper | IROpcode::InvokeCustom)
        || invoke.srcs() != params.as_slice()
    {
        return None;
    }
    let mut next = rest.next()?;
    let mut result = None;
    if next.opcode().is_move_result() {
        result = next.dest();
        next = rest.next()?;
    }
    let returns_result = match (next.opcode(), result) {
        (IROpcode::ReturnVoid, None) => true,
        (op, Some(r)) if op.is_return() && op != IROpcode::ReturnVoid => next.srcs() == [r],
        _ => false,
    };
    if !returns_result || rest.next().is_some() {
        return None;
    }
    invoke.method().cloned()
}

/// `true` if an invoke of `method` with `op` always reaches that definition.
fn is_monomorphic(op: IROpcode, method: &DexMethod, hierarchy: &ClassHierarchy) -> bool {
    match op {
        IROpcode::InvokeStatic | IROpcode::InvokeDirect => true,
        IROpcode::InvokeVirtual => {
            method.access().contains(AccessFlags::FINAL)
                || hierarchy
                    .access(method.class())
                    .is_some_and(|a| a.contains(AccessFlags::FINAL))
        }
        _ => false,
    }
}

fn search_for(op: IROpcode) -> Option<MethodSearch> {
    match op {
        IROpcode::InvokeStatic => Some(MethodSearch::Static),
        IROpcode::InvokeDirect => Some(MethodSearch::Direct),
        IROpcode::InvokeVirtual => Some(MethodSearch::Virtual),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct MethodStats {
    inlined: usize,
    refused: usize,
    promotions: Vec<Promotion>,
}

impl Changed for MethodStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.inlined > 0
    }
}

/// Upper bound on inlines per method, which also stops trampoline cycles.
const MAX_INLINES_PER_METHOD: usize = 256;

struct Inliner<'a> {
    trampolines: &'a HashMap<DexMethodRef, DexMethod>,
    hierarchy: &'a ClassHierarchy,
}

impl Inliner<'_> {
    fn callee_at(&self, op: IROpcode, target: &DexMethodRef) -> Option<&DexMethod> {
        let resolved = self
            .hierarchy
            .resolve_method(target, search_for(op)?)
            .map_or_else(|| target.clone(), |r| r.reference);
        let callee = self.trampolines.get(&resolved)?;
        is_monomorphic(op, callee, self.hierarchy).then_some(callee)
    }

    fn sites(&self, cfg: &ControlFlowGraph) -> Vec<CfgPosition> {
        cfg.instructions()
            .into_iter()
            .filter(|(_, insn)| {
                insn.method()
                    .is_some_and(|m| self.callee_at(insn.opcode(), m).is_some())
            })
            .map(|(pos, _)| pos)
            .collect()
    }

    fn run(&self, caller: &DexMethodRef, cfg: &mut ControlFlowGraph) -> MethodStats {
        let mut stats = MethodStats::default();
        let ctx = InlineContext {
            hierarchy: self.hierarchy,
            caller,
            allow_promotion: true,
        };
        for _ in 0..MAX_INLINES_PER_METHOD {
            let sites = self.sites(cfg);
            let Some(&site) = sites.get(stats.refused) else {
                break;
            };
            let Some(callee) = cfg
                .insn_at(site)
                .and_then(|i| i.method().and_then(|m| self.callee_at(i.opcode(), m)))
            else {
                break;
            };
            match inline_at(cfg, site, callee, &ctx) {
                Ok(inlined) => {
                    stats.inlined += 1;
                    stats.promotions.extend(inlined.promotions);
                }
                Err(reason) => {
                    debug!("not inlining {} into {caller}: {reason}", callee.reference());
                    stats.refused += 1;
                }
            }
        }
        stats
    }
}

/// `BridgeSynthInlinePass`.
#[derive(Debug, Default)]
pub struct BridgeSynthInlinePass {
    config: BridgeSynthConfig,
}

impl BridgeSynthInlinePass {
    /// Creates the pass with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn wanted(&self, method: &DexMethod) -> bool {
        (self.config.inline_bridges && method.is_bridge())
            || (self.config.inline_synthetics && method.is_synthetic())
    }

    fn find_trampolines(&self, program: &Program) -> HashMap<DexMethodRef, DexMethod> {
        program
            .methods()
            .filter(|m| self.wanted(m) && trampoline_target(m).is_some())
            .map(|m| (m.reference().clone(), m.clone()))
            .collect()
    }

    /// Deletes synthetic non-virtual trampolines no instruction refers to any more.
    fn remove_dead(program: &mut Program, trampolines: &HashMap<DexMethodRef, DexMethod>) -> usize {
        let referenced: BTreeSet<DexMethodRef> = program
            .methods()
            .filter_map(DexMethod::code)
            .flat_map(|code| {
                code.instructions()
                    .into_iter()
                    .filter_map(|i| i.method().cloned())
                    .collect::<Vec<_>>()
            })
            .collect();
        let doomed: Vec<DexMethodRef> = trampolines
            .values()
            .filter(|m| m.is_synthetic() && !m.is_virtual() && !referenced.contains(m.reference()))
            .map(|m| m.reference().clone())
            .collect();
        let mut removed = 0;
        for method in &doomed {
            if let Some(class) = program.class_mut(method.class()) {
                removed += usize::from(class.remove_method(method).is_some());
            }
        }
        removed
    }
}

impl Pass for BridgeSynthInlinePass {
    fn name(&self) -> &'static str {
        "BridgeSynthInlinePass"
    }

    fn description(&self) -> &'static str {
        "Inline bridge and synthetic trampolines at their call sites"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::PreservesButDowngrades),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let trampolines = self.find_trampolines(program);
        ctx.incr_metric("trampolines_found", trampolines.len() as i64);
        if trampolines.is_empty() {
            return Ok(());
        }
        let hierarchy = program.hierarchy();
        let inliner = Inliner {
            trampolines: &trampolines,
            hierarchy: &hierarchy,
        };

        let stats = walk::parallel_reduce(
            program,
            |method| {
                let caller = method.reference().clone();
                let stats = with_cfg(method, |cfg| inliner.run(&caller, cfg));
                if stats.inlined > 0 {
                    ctx.events
                        .record(EventKind::MethodInlined)
                        .method(&caller)
                        .message(format!("{} trampoline calls", stats.inlined));
                }
                if stats.refused > 0 {
                    ctx.events
                        .record(EventKind::InlineRefused)
                        .method(&caller)
                        .message(format!("{} trampoline calls kept", stats.refused));
                }
                stats
            },
            |mut a, b| {
                a.inlined += b.inlined;
                a.refused += b.refused;
                a.promotions.extend(b.promotions);
                a
            },
        );

        let mut promotions = stats.promotions;
        promotions.sort();
        promotions.dedup();
        let opened = apply_promotions(program, &promotions);
        for promotion in &promotions {
            ctx.events
                .record(EventKind::MemberOpened)
                .message(format!("{promotion:?}"));
        }

        let removed = if self.config.remove_dead_trampolines {
            Self::remove_dead(program, &trampolines)
        } else {
            0
        };
        debug!(
            "BridgeSynthInlinePass: {} calls inlined, {} refused, {} trampolines removed",
            stats.inlined, stats.refused, removed
        );
        ctx.incr_metric("calls_inlined", stats.inlined as i64);
        ctx.incr_metric("inline_refused", stats.refused as i64);
        ctx.incr_metric("members_opened", opened as i64);
        ctx.incr_metric("trampolines_removed", removed as i64);
        Ok(())
    }
}

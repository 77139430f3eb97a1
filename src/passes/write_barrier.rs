//! Write-barrier lowering.
//!
//! Some collectors need to hear about every reference store into the heap. This pass
//! places a call to a configured static barrier right after each `iput-object`,
//! `sput-object` and `aput-object`, passing the object that was written into: the
//! instance, the array, or the declaring class (loaded with `const-class`) for static
//! fields. Stores of the null constant need no barrier and are skipped.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    analysis::{
        AbstractDomain, ConstantDomain, FixpointAnalysis, MonotonicFixpointIterator,
        RegisterEnvironment,
    },
    compiler::{
        parse_options, walk, EventKind, Interaction, Pass, PassContext, Property,
        PropertyInteractions,
    },
    ir::{
        cfg::{BlockId, CfgMutation, CfgPosition, ControlFlowGraph},
        IRInstruction, IROpcode, Operand,
    },
    model::Program,
    passes::utils::with_cfg,
    pool::DexMethodRef,
    Result,
};

type Env = RegisterEnvironment<ConstantDomain<i64>>;

/// Options of [`WriteBarrierLoweringPass`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriteBarrierConfig {
    /// The barrier, a static method taking one `Object`, e.g.
    /// `Lcom/app/Barrier;.onStore:(Ljava/lang/Object;)V`.
    pub barrier_method: Option<String>,
}

/// Tracks which registers hold a known integer constant.
struct ConstantAnalysis;

impl ConstantAnalysis {
    fn step(insn: &IRInstruction, env: &mut Env) {
        let Some(dest) = insn.dest() else {
            return;
        };
        let value = match insn.opcode() {
            IROpcode::Const => insn
                .literal()
                .map_or(ConstantDomain::Top, ConstantDomain::Value),
            IROpcode::Move | IROpcode::MoveObject => env.get(insn.src(0)),
            _ => ConstantDomain::Top,
        };
        env.set(dest, value);
        if insn.dest_is_wide() {
            env.havoc(dest + 1);
        }
        // A wide pair starting right below `dest` is clobbered too.
        if dest > 0 {
            env.havoc(dest - 1);
        }
    }
}

impl FixpointAnalysis<ControlFlowGraph> for ConstantAnalysis {
    type Domain = Env;

    fn analyze_node(&self, graph: &ControlFlowGraph, node: BlockId, state: &mut Env) {
        if state.is_bottom() {
            return;
        }
        for (_, insn) in graph.block(node).instructions() {
            Self::step(insn, state);
        }
    }
}

fn stores_reference(opcode: IROpcode) -> bool {
    matches!(
        opcode,
        IROpcode::IputObject | IROpcode::SputObject | IROpcode::AputObject
    )
}

/// Inserts a call to `barrier` after every reference store of `cfg` whose value may be
/// non-null. Returns the number of barriers added.
pub fn add_write_barriers(cfg: &mut ControlFlowGraph, barrier: &DexMethodRef) -> usize {
    let stores: Vec<(CfgPosition, IRInstruction)> = {
        let mut fixpoint = MonotonicFixpointIterator::new(&*cfg, ConstantAnalysis);
        fixpoint.run(Env::top());
        let mut found = Vec::new();
        for block in cfg.blocks() {
            let mut env = fixpoint.entry_state_at(block);
            if env.is_bottom() {
                continue;
            }
            for (index, insn) in cfg.block(block).instructions() {
                if stores_reference(insn.opcode())
                    && env.get(insn.src(0)).value() != Some(&0)
                {
                    found.push((CfgPosition::new(block, index), insn.clone()));
                }
                ConstantAnalysis::step(insn, &mut env);
            }
        }
        found
    };

    let mut mutation = CfgMutation::new();
    let mut class_temp = None;
    for (pos, store) in &stores {
        let invoke = |holder| {
            IRInstruction::new(IROpcode::InvokeStatic)
                .with_srcs(&[holder])
                .with_operand(Operand::Method(barrier.clone()))
        };
        let insns = match store.opcode() {
            IROpcode::SputObject => {
                let Some(field) = store.field() else {
                    continue;
                };
                let temp = *class_temp.get_or_insert_with(|| cfg.allocate_temp());
                vec![
                    IRInstruction::new(IROpcode::ConstClass)
                        .with_operand(Operand::Type(field.class().clone())),
                    IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(temp),
                    invoke(temp),
                ]
            }
            _ => vec![invoke(store.src(1))],
        };
        mutation.insert_after(*pos, insns);
    }
    mutation.flush(cfg);
    stores.len()
}

/// `WriteBarrierLoweringPass`.
#[derive(Debug, Default)]
pub struct WriteBarrierLoweringPass {
    barrier: Option<DexMethodRef>,
}

impl WriteBarrierLoweringPass {
    /// Creates the pass without a barrier; it does nothing until configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the pass calling `barrier`.
    #[must_use]
    pub fn with_barrier(barrier: DexMethodRef) -> Self {
        Self {
            barrier: Some(barrier),
        }
    }
}

impl Pass for WriteBarrierLoweringPass {
    fn name(&self) -> &'static str {
        "WriteBarrierLoweringPass"
    }

    fn description(&self) -> &'static str {
        "Call a write barrier after every reference store"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        let config: WriteBarrierConfig = parse_options(self.name(), options)?;
        self.barrier = config
            .barrier_method
            .as_deref()
            .map(DexMethodRef::parse)
            .transpose()?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::PreservesButDowngrades),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let Some(barrier) = self.barrier.clone() else {
            warn!("{}: no barrier_method configured, skipping", self.name());
            ctx.events.warn("no barrier method configured");
            ctx.set_metric("added_write_barriers", 0);
            return Ok(());
        };
        let added = walk::parallel_reduce(
            program,
            |method| {
                let added = with_cfg(method, |cfg| add_write_barriers(cfg, &barrier));
                if added > 0 {
                    debug!("{}: {added} write barriers", method.reference());
                    ctx.events
                        .record(EventKind::BarrierAdded)
                        .method(method.reference())
                        .message(format!("{added} barriers"));
                }
                added
            },
            |a, b| a + b,
        );
        ctx.incr_metric("added_write_barriers", added as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::helpers::{opcodes_of, program_of, run_pass, static_method};

    const BARRIER: &str = "LGc;.barrier:(Ljava/lang/Object;)V";

    fn pass() -> WriteBarrierLoweringPass {
        WriteBarrierLoweringPass::with_barrier(DexMethodRef::parse(BARRIER).unwrap())
    }

    #[test]
    fn test_instance_and_array_stores() {
        let mut program = program_of(vec![static_method(
            "LFoo;.store:(LFoo;[Ljava/lang/Object;Ljava/lang/Object;)V",
            4,
            |b| {
                b.load_param_object(0)
                    .load_param_object(1)
                    .load_param_object(2)
                    .iput("LFoo;.f:Ljava/lang/Object;", 2, 0)
                    .const_int(3, 0)
                    .aput(IROpcode::AputObject, 2, 1, 3)
                    .return_void();
            },
        )]);
        let metrics = run_pass(&mut pass(), &mut program);
        assert_eq!(metrics.get("added_write_barriers"), 2);

        let method = program.methods().next().unwrap();
        let invokes: Vec<Vec<u32>> = method
            .code()
            .unwrap()
            .instructions()
            .iter()
            .filter(|i| i.opcode() == IROpcode::InvokeStatic)
            .map(|i| i.srcs().to_vec())
            .collect();
        assert_eq!(invokes, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_static_store_loads_class() {
        let mut program = program_of(vec![static_method("LFoo;.set:(Ljava/lang/Object;)V", 1, |b| {
            b.load_param_object(0)
                .sput("LFoo;.s:Ljava/lang/Object;", 0)
                .return_void();
        })]);
        run_pass(&mut pass(), &mut program);
        let method = program.methods().next().unwrap();
        let ops = opcodes_of(method);
        let sput = ops.iter().position(|o| o == "sput-object").unwrap();
        assert_eq!(ops[sput + 1], "const-class");
        assert_eq!(ops[sput + 3], "invoke-static");
        assert_eq!(method.code().unwrap().registers_size(), 2);
    }

    #[test]
    fn test_null_store_skipped() {
        let mut program = program_of(vec![static_method("LFoo;.clear:(LFoo;)V", 2, |b| {
            b.load_param_object(0)
                .const_int(1, 0)
                .iput("LFoo;.f:Ljava/lang/Object;", 1, 0)
                .return_void();
        })]);
        let before = program.methods().next().unwrap().code().unwrap().to_string();
        let metrics = run_pass(&mut pass(), &mut program);
        assert_eq!(metrics.get("added_write_barriers"), 0);
        assert_eq!(program.methods().next().unwrap().code().unwrap().to_string(), before);
    }

    #[test]
    fn test_unconfigured_is_noop() {
        let mut program = program_of(vec![static_method("LFoo;.set:(Ljava/lang/Object;)V", 1, |b| {
            b.load_param_object(0)
                .sput("LFoo;.s:Ljava/lang/Object;", 0)
                .return_void();
        })]);
        let metrics = run_pass(&mut WriteBarrierLoweringPass::new(), &mut program);
        assert_eq!(metrics.get("added_write_barriers"), 0);
        assert!(!opcodes_of(program.methods().next().unwrap()).contains(&"invoke-static".to_string()));
    }
}

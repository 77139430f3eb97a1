//! Redundant `check-cast` elimination.
//!
//! A forward must-type analysis over [`ClassDomain`] computes, for every reference register
//! at every point, a class every possible value is assignable to. A `check-cast v, T` whose
//! operand is already known to be a `T` cannot fail and is removed together with its
//! result pseudo; when the cast writes a different register it becomes a `move-object`.
//!
//! Types come from the instructions that create or load values: `new-instance`,
//! `const-string`, declared parameter, field and return types, and earlier casts. The null
//! constant is `Bottom`, which is assignable to anything.

use log::debug;

use crate::{
    analysis::{
        AbstractDomain, ClassDomain, FixpointAnalysis, MonotonicFixpointIterator,
        RegisterEnvironment,
    },
    compiler::{walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions},
    ir::{
        cfg::{BlockId, CfgPosition, ControlFlowGraph},
        IRInstruction, IROpcode, MethodItem,
    },
    model::{ClassHierarchy, DexMethod, Program},
    passes::utils::{with_cfg, Changed},
    pool::DexType,
    Result,
};

type Env = RegisterEnvironment<ClassDomain>;

/// The must-type analysis.
pub struct CastAnalysis<'a> {
    hierarchy: &'a ClassHierarchy,
    params: Vec<DexType>,
}

impl<'a> CastAnalysis<'a> {
    /// Creates the analysis for a method whose `load-param*` instructions bind `params`
    /// (the receiver first for instance methods).
    #[must_use]
    pub fn new(hierarchy: &'a ClassHierarchy, params: Vec<DexType>) -> Self {
        Self { hierarchy, params }
    }

    /// The parameter types of `method` as seen by its body.
    #[must_use]
    pub fn params_of(method: &DexMethod) -> Vec<DexType> {
        let mut params = Vec::new();
        if !method.is_static() {
            params.push(method.class().clone());
        }
        params.extend(method.proto().args().iter().cloned());
        params
    }

    fn class(&self, ty: &DexType) -> ClassDomain {
        if ty.is_reference() {
            ClassDomain::of(ty, self.hierarchy)
        } else {
            ClassDomain::Top
        }
    }

    /// Applies one instruction. `primary` is the instruction before a result pseudo.
    fn step(&self, insn: &IRInstruction, primary: Option<&IRInstruction>, param: &mut usize, env: &mut Env) {
        let op = insn.opcode();
        for d in insn.reg_defs() {
            env.havoc(d);
        }
        let Some(dest) = insn.dest() else {
            return;
        };
        let value = match op {
            _ if op.is_load_param() => {
                let ty = self.params.get(*param).cloned();
                *param += 1;
                match ty {
                    Some(t) if op == IROpcode::LoadParamObject => self.class(&t),
                    _ => return,
                }
            }
            IROpcode::Const if insn.literal() == Some(0) => ClassDomain::Bottom,
            IROpcode::MoveObject => env.get(insn.src(0)),
            IROpcode::MoveException => self.class(&DexType::throwable()),
            IROpcode::MoveResultObject => match primary {
                Some(p) if p.opcode().is_invoke() => match p.method() {
                    Some(m) => self.class(m.proto().rtype()),
                    None => return,
                },
                Some(p) if p.opcode() == IROpcode::FilledNewArray => match p.type_ref() {
                    Some(t) => self.class(t),
                    None => return,
                },
                _ => return,
            },
            IROpcode::MoveResultPseudoObject => match primary {
                Some(p) => self.result_of(p, env),
                None => return,
            },
            _ => return,
        };
        env.set(dest, value);
    }

    fn result_of(&self, primary: &IRInstruction, env: &Env) -> ClassDomain {
        let op = primary.opcode();
        match op {
            IROpcode::NewInstance | IROpcode::NewArray | IROpcode::ConstClass => match op {
                IROpcode::ConstClass => self.class(&DexType::class()),
                _ => primary.type_ref().map_or(ClassDomain::Top, |t| self.class(t)),
            },
            IROpcode::ConstString => self.class(&DexType::string()),
            IROpcode::CheckCast => {
                let src = env.get(primary.src(0));
                match primary.type_ref() {
                    Some(t) if src.is_subtype_of(t) => src,
                    Some(t) => self.class(t),
                    None => ClassDomain::Top,
                }
            }
            _ if op.is_iget() || op.is_sget() => {
                primary.field().map_or(ClassDomain::Top, |f| self.class(f.ty()))
            }
            IROpcode::AgetObject => match env.get(primary.src(0)).ty().and_then(DexType::component_type) {
                Some(t) => self.class(&t),
                None => ClassDomain::Top,
            },
            _ => ClassDomain::Top,
        }
    }

    /// Replays `block` from `state`, calling `visit` with the state before each instruction.
    fn replay(
        &self,
        cfg: &ControlFlowGraph,
        block: BlockId,
        state: &mut Env,
        mut visit: impl FnMut(usize, &IRInstruction, &Env),
    ) {
        let mut param = 0;
        let mut prev: Option<&IRInstruction> = None;
        for (idx, insn) in cfg.block(block).instructions() {
            visit(idx, insn, state);
            let primary = prev.filter(|_| insn.opcode().is_move_result_any());
            self.step(insn, primary, &mut param, state);
            prev = Some(insn);
        }
    }
}

impl FixpointAnalysis<ControlFlowGraph> for CastAnalysis<'_> {
    type Domain = Env;

    fn analyze_node(&self, graph: &ControlFlowGraph, node: BlockId, state: &mut Env) {
        if state.is_bottom() {
            return;
        }
        self.replay(graph, node, state, |_, _, _| {});
    }
}

/// Counts of removed casts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CastStats {
    /// Casts deleted outright.
    pub removed: usize,
    /// Casts turned into `move-object`.
    pub replaced: usize,
}

impl Changed for CastStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.removed + self.replaced > 0
    }
}

/// Removes the casts of `cfg` that cannot fail.
pub fn remove_redundant_check_casts(cfg: &mut ControlFlowGraph, analysis: &CastAnalysis<'_>) -> CastStats {
    let redundant: Vec<(CfgPosition, Option<IRInstruction>)> = {
        let mut fixpoint = MonotonicFixpointIterator::new(&*cfg, analysis);
        fixpoint.run(Env::top());
        let mut found = Vec::new();
        for block in cfg.blocks() {
            let mut state = fixpoint.entry_state_at(block);
            if state.is_bottom() {
                continue;
            }
            analysis.replay(cfg, block, &mut state, |idx, insn, env| {
                if insn.opcode() != IROpcode::CheckCast {
                    return;
                }
                let pos = CfgPosition::new(block, idx);
                let (Some(ty), Some(result)) = (insn.type_ref(), cfg.move_result_of(pos)) else {
                    return;
                };
                if !env.get(insn.src(0)).is_subtype_of(ty) {
                    return;
                }
                let dest = cfg.insn_at(result).and_then(IRInstruction::dest);
                let replacement = dest.filter(|d| *d != insn.src(0)).map(|d| {
                    IRInstruction::new(IROpcode::MoveObject)
                        .with_dest(d)
                        .with_srcs(&[insn.src(0)])
                });
                found.push((pos, replacement));
            });
        }
        found
    };

    let mut stats = CastStats::default();
    for (pos, replacement) in redundant.into_iter().rev() {
        cfg.remove_insn(pos);
        match replacement {
            Some(mov) => {
                cfg.block_mut(pos.block)
                    .items_mut()
                    .insert(pos.index, MethodItem::Insn(mov));
                stats.replaced += 1;
            }
            None => stats.removed += 1,
        }
    }
    stats
}

/// `RemoveRedundantCheckCastsPass`.
#[derive(Debug, Default)]
pub struct RemoveRedundantCheckCastsPass;

impl RemoveRedundantCheckCastsPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for RemoveRedundantCheckCastsPass {
    fn name(&self) -> &'static str {
        "RemoveRedundantCheckCastsPass"
    }

    fn description(&self) -> &'static str {
        "Remove check-cast instructions whose operand type is already known"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let hierarchy = program.hierarchy();
        let (removed, replaced) = walk::parallel_reduce(
            program,
            |method| {
                let analysis = CastAnalysis::new(&hierarchy, CastAnalysis::params_of(method));
                let stats = with_cfg(method, |cfg| remove_redundant_check_casts(cfg, &analysis));
                if stats.changed() {
                    debug!("{}: {} casts removed", method.reference(), stats.removed + stats.replaced);
                    ctx.events
                        .record(EventKind::CastRemoved)
                        .method(method.reference())
                        .message(format!("{} removed, {} to moves", stats.removed, stats.replaced));
                }
                (stats.removed, stats.replaced)
            },
            |a, b| (a.0 + b.0, a.1 + b.1),
        );
        ctx.incr_metric("num_removed_casts", removed as i64);
        ctx.incr_metric("num_casts_to_moves", replaced as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{CodeBuilder, IRCode},
        model::{AccessFlags, DexClass},
        passes::utils::with_code_cfg,
    };

    fn hierarchy() -> ClassHierarchy {
        let b = DexClass::new(DexType::make("LB;"), Some(DexType::object()), AccessFlags::PUBLIC);
        let c = DexClass::new(DexType::make("LC;"), Some(DexType::make("LB;")), AccessFlags::PUBLIC);
        let d = DexClass::new(DexType::make("LD;"), Some(DexType::make("LC;")), AccessFlags::PUBLIC);
        Program::from_classes(vec![b, c, d]).hierarchy()
    }

    fn run(code: &mut IRCode, params: Vec<DexType>) -> CastStats {
        let h = hierarchy();
        let analysis = CastAnalysis::new(&h, params);
        with_code_cfg(code, |cfg| remove_redundant_check_casts(cfg, &analysis))
    }

    fn cast_after_new(target: &str) -> IRCode {
        let mut b = CodeBuilder::new(1);
        b.new_instance(0, "LC;").check_cast(0, 0, target).ret_object(0);
        b.build()
    }

    fn has_cast(code: &IRCode) -> bool {
        code.instructions()
            .iter()
            .any(|i| i.opcode() == IROpcode::CheckCast)
    }

    #[test]
    fn test_cast_to_same_and_super_type_removed() {
        for target in ["LC;", "LB;", "Ljava/lang/Object;"] {
            let mut code = cast_after_new(target);
            assert_eq!(run(&mut code, vec![]).removed, 1, "{target}");
            assert!(!has_cast(&code));
        }
    }

    #[test]
    fn test_narrowing_cast_kept() {
        let mut code = cast_after_new("LD;");
        assert!(!run(&mut code, vec![]).changed());
        assert!(has_cast(&code));
    }

    #[test]
    fn test_different_registers_become_move() {
        let mut b = CodeBuilder::new(2);
        b.load_param_object(0).check_cast(1, 0, "LB;").ret_object(1);
        let mut code = b.build();
        let stats = run(&mut code, vec![DexType::make("LC;")]);
        assert_eq!(stats.replaced, 1);
        let text: Vec<String> = code.instructions().iter().map(|i| i.to_string()).collect();
        assert_eq!(text, vec!["load-param-object v0", "move-object v1, v0", "return-object v1"]);
    }

    #[test]
    fn test_join_of_branches() {
        let mut b = CodeBuilder::new(2);
        let other = b.label();
        let join = b.label();
        b.load_param(1)
            .if_z(IROpcode::IfEqz, 1, other)
            .new_instance(0, "LD;")
            .goto(join)
            .bind(other)
            .new_instance(0, "LC;")
            .bind(join)
            .check_cast(0, 0, "LB;")
            .check_cast(0, 0, "LD;")
            .ret_object(0);
        let mut code = b.build();
        let stats = run(&mut code, vec![DexType::int()]);
        assert_eq!(stats.removed, 1);
        let casts: Vec<String> = code
            .instructions()
            .iter()
            .filter(|i| i.opcode() == IROpcode::CheckCast)
            .map(|i| i.to_string())
            .collect();
        assert_eq!(casts, vec!["check-cast v0, LD;"]);
    }

    #[test]
    fn test_null_cast_removed() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 0).check_cast(0, 0, "LD;").ret_object(0);
        let mut code = b.build();
        assert_eq!(run(&mut code, vec![]).removed, 1);
    }
}

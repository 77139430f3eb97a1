//! Peephole optimization over short instruction windows.
//!
//! A [`Pattern`] looks at the instructions of a block starting at some position and, when it
//! recognises its shape, returns a [`Rewrite`]: how many instructions it consumed and what
//! replaces them. Patterns are tried greedily left to right within each block, and a block
//! is rescanned until no pattern fires.
//!
//! # Guarantees
//!
//! - A replacement computes the same observable effect and defines the same registers as
//!   the instructions it replaces.
//! - Patterns whose replacement needs the 4-bit register form ([`Pattern::narrow`]) do not
//!   fire when any register involved exceeds 15.
//! - Put/get forwarding only fires for resolvable, non-volatile fields and only when the
//!   get reloads into the register that was stored.
//!
//! Methods where nothing matches are left untouched, without a CFG round trip.

use std::collections::BTreeMap;

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, walk, EventKind, Interaction, Pass, PassContext, Property,
        PropertyInteractions,
    },
    ir::{
        cfg::{BlockId, ControlFlowGraph},
        IRInstruction, IROpcode, MethodItem, Operand, Reg,
    },
    model::{ClassHierarchy, Program},
    passes::{
        local_dce::LocalDce,
        utils::{with_cfg, Changed},
    },
    pool::{DexMethodRef, DexProto, DexType},
    Result,
};

/// The result of a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewrite {
    /// Number of instructions, from the match position, that are replaced.
    pub consumed: usize,
    /// The instructions put in their place.
    pub replacement: Vec<IRInstruction>,
}

/// What a pattern may consult besides the instructions.
pub struct MatchContext<'a> {
    /// Used to resolve fields for the volatility check.
    pub hierarchy: &'a ClassHierarchy,
}

/// A named rewrite rule.
pub struct Pattern {
    /// Name used for enabling, disabling and metrics.
    pub name: &'static str,
    /// `true` if the replacement uses instruction forms limited to registers `v0..=v15`.
    pub narrow: bool,
    /// The matcher: receives the block's instructions from the match position onwards.
    pub rewrite: fn(&[&IRInstruction], &MatchContext<'_>) -> Option<Rewrite>,
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern").field("name", &self.name).finish()
    }
}

fn string_builder_init(args: Vec<DexType>) -> DexMethodRef {
    DexMethodRef::make(
        DexType::string_builder(),
        "<init>",
        DexProto::make(DexType::void(), args),
    )
}

fn string_builder_append_string() -> DexMethodRef {
    DexMethodRef::make(
        DexType::string_builder(),
        "append",
        DexProto::make(DexType::string_builder(), vec![DexType::string()]),
    )
}

/// `invoke-direct {b} <init>()V; const-string s; invoke-virtual {b, s} append(String)`
/// becomes `const-string s; invoke-direct {b, s} <init>(String)V`.
fn init_append_string(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let [init, cs, pseudo, append, rest @ ..] = w else {
        return None;
    };
    if init.opcode() != IROpcode::InvokeDirect
        || init.method() != Some(&string_builder_init(Vec::new()))
        || cs.opcode() != IROpcode::ConstString
        || pseudo.opcode() != IROpcode::MoveResultPseudoObject
        || append.opcode() != IROpcode::InvokeVirtual
        || append.method() != Some(&string_builder_append_string())
    {
        return None;
    }
    let builder = init.src(0);
    let string = pseudo.dest()?;
    if string == builder || append.srcs() != [builder, string] {
        return None;
    }
    let mut replacement = vec![
        (*cs).clone(),
        (*pseudo).clone(),
        IRInstruction::new(IROpcode::InvokeDirect)
            .with_srcs(&[builder, string])
            .with_operand(Operand::Method(string_builder_init(vec![DexType::string()]))),
    ];
    let mut consumed = 4;
    // append returns its receiver
    if let Some(result) = rest.first().filter(|i| i.opcode() == IROpcode::MoveResultObject) {
        consumed += 1;
        let dest = result.dest()?;
        if dest != builder {
            replacement.push(
                IRInstruction::new(IROpcode::MoveObject)
                    .with_dest(dest)
                    .with_srcs(&[builder]),
            );
        }
    }
    Some(Rewrite {
        consumed,
        replacement,
    })
}

fn literal_op(w: &[&IRInstruction], op: IROpcode) -> Option<(Reg, Reg, i64)> {
    let insn = w.first()?;
    if insn.opcode() != op {
        return None;
    }
    Some((insn.dest()?, insn.src(0), insn.literal()?))
}

fn mov(dest: Reg, src: Reg) -> IRInstruction {
    IRInstruction::new(IROpcode::Move)
        .with_dest(dest)
        .with_srcs(&[src])
}

/// `add-int/lit a, b, 0` becomes `move a, b`.
fn add_lit_zero(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let (dest, src, lit) = literal_op(w, IROpcode::AddIntLit)?;
    (lit == 0).then(|| Rewrite {
        consumed: 1,
        replacement: vec![mov(dest, src)],
    })
}

/// `mul-int/lit a, b, 1` becomes `move a, b`.
fn mul_lit_one(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let (dest, src, lit) = literal_op(w, IROpcode::MulIntLit)?;
    (lit == 1).then(|| Rewrite {
        consumed: 1,
        replacement: vec![mov(dest, src)],
    })
}

/// `mul-int/lit a, b, 2^k` becomes `shl-int/lit a, b, k`.
fn mul_lit_pow2(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let (dest, src, lit) = literal_op(w, IROpcode::MulIntLit)?;
    if lit < 2 || lit > i64::from(i32::MAX) || lit.count_ones() != 1 {
        return None;
    }
    Some(Rewrite {
        consumed: 1,
        replacement: vec![IRInstruction::new(IROpcode::ShlIntLit)
            .with_dest(dest)
            .with_srcs(&[src])
            .with_literal(i64::from(lit.trailing_zeros()))],
    })
}

/// `rsub-int/lit a, b, 0` becomes `neg-int a, b`.
fn rsub_zero_to_neg(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let (dest, src, lit) = literal_op(w, IROpcode::RsubIntLit)?;
    (lit == 0).then(|| Rewrite {
        consumed: 1,
        replacement: vec![IRInstruction::new(IROpcode::NegInt)
            .with_dest(dest)
            .with_srcs(&[src])],
    })
}

/// `move a, a` is dropped.
fn self_move(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let insn = w.first()?;
    (insn.opcode().is_move() && insn.dest() == Some(insn.src(0))).then(|| Rewrite {
        consumed: 1,
        replacement: Vec::new(),
    })
}

/// The get and its pseudo are dropped when they reload the value just stored.
fn forward_put_get(
    w: &[&IRInstruction],
    ctx: &MatchContext<'_>,
    is_put: fn(IROpcode) -> bool,
    is_get: fn(IROpcode) -> bool,
) -> Option<Rewrite> {
    let [put, get, pseudo, ..] = w else {
        return None;
    };
    if !is_put(put.opcode()) || !is_get(get.opcode()) || !pseudo.opcode().is_move_result_pseudo() {
        return None;
    }
    let field = put.field()?;
    if get.field() != Some(field) || ctx.hierarchy.is_volatile(field) {
        return None;
    }
    // The holder operands must agree; statics have none.
    if put.srcs()[1..] != *get.srcs() || pseudo.dest()? != put.src(0) {
        return None;
    }
    Some(Rewrite {
        consumed: 3,
        replacement: vec![(*put).clone()],
    })
}

fn sput_sget(w: &[&IRInstruction], ctx: &MatchContext<'_>) -> Option<Rewrite> {
    forward_put_get(w, ctx, IROpcode::is_sput, IROpcode::is_sget)
}

fn iput_iget(w: &[&IRInstruction], ctx: &MatchContext<'_>) -> Option<Rewrite> {
    forward_put_get(w, ctx, IROpcode::is_iput, IROpcode::is_iget)
}

fn array_kind(op: IROpcode) -> Option<u8> {
    use IROpcode as Op;
    Some(match op {
        Op::Aget | Op::Aput => 0,
        Op::AgetWide | Op::AputWide => 1,
        Op::AgetObject | Op::AputObject => 2,
        Op::AgetBoolean | Op::AputBoolean => 3,
        Op::AgetByte | Op::AputByte => 4,
        Op::AgetChar | Op::AputChar => 5,
        Op::AgetShort | Op::AputShort => 6,
        _ => return None,
    })
}

/// `aput v, arr, i; aget arr, i -> v` drops the get.
fn aput_aget(w: &[&IRInstruction], _: &MatchContext<'_>) -> Option<Rewrite> {
    let [put, get, pseudo, ..] = w else {
        return None;
    };
    if !put.opcode().is_aput() || !get.opcode().is_aget() || !pseudo.opcode().is_move_result_pseudo() {
        return None;
    }
    let (value, array, index) = (put.src(0), put.src(1), put.src(2));
    if array_kind(put.opcode()) != array_kind(get.opcode())
        || get.srcs() != [array, index]
        || pseudo.dest()? != value
        // object arrays may hold a narrower runtime type than the stored value
        || put.opcode() == IROpcode::AputObject
    {
        return None;
    }
    Some(Rewrite {
        consumed: 3,
        replacement: vec![(*put).clone()],
    })
}

/// Every pattern, in the order they are tried.
pub static PATTERNS: &[Pattern] = &[
    Pattern {
        name: "init_append_string",
        narrow: false,
        rewrite: init_append_string,
    },
    Pattern {
        name: "add_lit_zero",
        narrow: false,
        rewrite: add_lit_zero,
    },
    Pattern {
        name: "mul_lit_one",
        narrow: false,
        rewrite: mul_lit_one,
    },
    Pattern {
        name: "mul_lit_pow2",
        narrow: false,
        rewrite: mul_lit_pow2,
    },
    Pattern {
        name: "rsub_zero_to_neg",
        narrow: true,
        rewrite: rsub_zero_to_neg,
    },
    Pattern {
        name: "self_move",
        narrow: false,
        rewrite: self_move,
    },
    Pattern {
        name: "sput_sget",
        narrow: false,
        rewrite: sput_sget,
    },
    Pattern {
        name: "iput_iget",
        narrow: false,
        rewrite: iput_iget,
    },
    Pattern {
        name: "aput_aget",
        narrow: false,
        rewrite: aput_aget,
    },
];

/// Name of the metric counting collapsed same-target branches.
const COLLAPSE_BRANCH: &str = "collapse_same_target_branch";

/// Per-pattern match counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeepholeStats {
    /// Matches by pattern name.
    pub matches: BTreeMap<&'static str, usize>,
}

impl PeepholeStats {
    /// Total number of rewrites.
    #[must_use]
    pub fn total(&self) -> usize {
        self.matches.values().sum()
    }

    fn merge(mut self, other: Self) -> Self {
        for (name, n) in other.matches {
            *self.matches.entry(name).or_default() += n;
        }
        self
    }
}

impl Changed for PeepholeStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.total() > 0
    }
}

/// The pattern engine.
#[derive(Debug)]
pub struct Peephole {
    patterns: Vec<&'static Pattern>,
}

impl Default for Peephole {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Peephole {
    /// An engine running every pattern except those named in `disabled`.
    #[must_use]
    pub fn new(disabled: &[String]) -> Self {
        Self {
            patterns: PATTERNS
                .iter()
                .filter(|p| !disabled.iter().any(|d| d == p.name))
                .collect(),
        }
    }

    /// Names of the enabled patterns.
    #[must_use]
    pub fn enabled(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|p| p.name).collect()
    }

    /// Runs every enabled pattern on `cfg` to a fixpoint.
    pub fn run(&self, cfg: &mut ControlFlowGraph, hierarchy: &ClassHierarchy) -> PeepholeStats {
        let ctx = MatchContext { hierarchy };
        let mut stats = PeepholeStats::default();
        for block in cfg.blocks() {
            self.run_block(cfg, block, &ctx, &mut stats);
        }
        let collapsed = LocalDce::collapse_branches(cfg);
        if collapsed > 0 {
            *stats.matches.entry(COLLAPSE_BRANCH).or_default() += collapsed;
        }
        stats
    }

    fn run_block(
        &self,
        cfg: &mut ControlFlowGraph,
        block: BlockId,
        ctx: &MatchContext<'_>,
        stats: &mut PeepholeStats,
    ) {
        let mut start = 0;
        loop {
            let (indices, found) = {
                let insns: Vec<(usize, &IRInstruction)> = cfg.block(block).instructions().collect();
                let window: Vec<&IRInstruction> = insns.iter().map(|(_, i)| *i).collect();
                let found = (start..window.len()).find_map(|at| {
                    self.patterns.iter().find_map(|p| {
                        let rewrite = (p.rewrite)(&window[at..], ctx)?;
                        if p.narrow && !fits_narrow(&window[at..at + rewrite.consumed], &rewrite) {
                            return None;
                        }
                        Some((at, p.name, rewrite))
                    })
                });
                (insns.iter().map(|(i, _)| *i).collect::<Vec<_>>(), found)
            };
            let Some((at, name, rewrite)) = found else {
                return;
            };
            debug!("peephole {name} at {block}:{at}");
            *stats.matches.entry(name).or_default() += 1;

            let items = cfg.block_mut(block).items_mut();
            let span = &indices[at..at + rewrite.consumed];
            for &idx in span[1..].iter().rev() {
                items.remove(idx);
            }
            items.splice(
                span[0]..=span[0],
                rewrite.replacement.into_iter().map(MethodItem::Insn),
            );
            cfg.drop_stale_throw_edges(block);
            // Rewrites can enable a match that begins one instruction earlier.
            start = at.saturating_sub(1);
        }
    }
}

fn fits_narrow(source: &[&IRInstruction], rewrite: &Rewrite) -> bool {
    source
        .iter()
        .copied()
        .chain(rewrite.replacement.iter())
        .flat_map(|i| i.reg_uses().into_iter().chain(i.reg_defs()))
        .all(|r| r <= 15)
}

/// Options of [`PeepholePass`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeepholeConfig {
    /// Patterns that must not run.
    pub disabled_peepholes: Vec<String>,
}

/// `PeepholePass`: runs the [`Peephole`] engine on every method.
#[derive(Debug, Default)]
pub struct PeepholePass {
    config: PeepholeConfig,
}

impl PeepholePass {
    /// Creates the pass with every pattern enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pass for PeepholePass {
    fn name(&self) -> &'static str {
        "PeepholePass"
    }

    fn description(&self) -> &'static str {
        "Rewrite short instruction sequences into cheaper equivalents"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let engine = Peephole::new(&self.config.disabled_peepholes);
        let hierarchy = program.hierarchy();
        let stats = walk::parallel_reduce(
            program,
            |method| {
                let stats = with_cfg(method, |cfg| engine.run(cfg, &hierarchy));
                for (name, n) in &stats.matches {
                    ctx.events
                        .record(EventKind::InstructionReplaced)
                        .method(method.reference())
                        .message(format!("{name} x{n}"));
                }
                stats
            },
            PeepholeStats::merge,
        );
        for (name, n) in &stats.matches {
            ctx.incr_metric(name, *n as i64);
        }
        ctx.set_metric("peepholes_applied", stats.total() as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{CodeBuilder, IRCode},
        model::{AccessFlags, DexClass, DexField},
        passes::utils::with_code_cfg,
        pool::DexFieldRef,
    };

    fn peephole(code: &mut IRCode, hierarchy: &ClassHierarchy) -> PeepholeStats {
        with_code_cfg(code, |cfg| Peephole::default().run(cfg, hierarchy))
    }

    fn text(code: &IRCode) -> Vec<String> {
        code.instructions().iter().map(|i| i.to_string()).collect()
    }

    fn hierarchy_with_field(access: AccessFlags) -> ClassHierarchy {
        let mut class = DexClass::new(
            DexType::make("LFoo;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        class.add_field(DexField::new(
            DexFieldRef::make(DexType::make("LFoo;"), "f", DexType::int()),
            access | AccessFlags::STATIC,
        ));
        Program::from_classes(vec![class]).hierarchy()
    }

    #[test]
    fn test_init_append_fused() {
        let mut b = CodeBuilder::new(2);
        b.new_instance(0, "Ljava/lang/StringBuilder;")
            .invoke_direct("Ljava/lang/StringBuilder;.<init>:()V", &[0])
            .const_string(1, "foo")
            .invoke_virtual(
                "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;",
                &[0, 1],
            )
            .return_void();
        let mut code = b.build();
        let stats = peephole(&mut code, &ClassHierarchy::default());
        assert_eq!(stats.matches.get("init_append_string"), Some(&1));
        let ops: Vec<IROpcode> = code.instructions().iter().map(|i| i.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                IROpcode::NewInstance,
                IROpcode::MoveResultPseudoObject,
                IROpcode::ConstString,
                IROpcode::MoveResultPseudoObject,
                IROpcode::InvokeDirect,
                IROpcode::ReturnVoid,
            ]
        );
        let init = code.instructions()[4].clone();
        assert_eq!(init.srcs(), [0, 1]);
        assert_eq!(init.method(), Some(&string_builder_init(vec![DexType::string()])));
    }

    #[test]
    fn test_arithmetic_patterns() {
        let mut b = CodeBuilder::new(3);
        b.load_param(0)
            .add_lit(IROpcode::MulIntLit, 1, 0, 8)
            .add_lit(IROpcode::AddIntLit, 2, 1, 0)
            .add_lit(IROpcode::AddIntLit, 2, 2, 0)
            .ret(2);
        let mut code = b.build();
        let stats = peephole(&mut code, &ClassHierarchy::default());
        assert_eq!(stats.matches.get("mul_lit_pow2"), Some(&1));
        assert_eq!(stats.matches.get("add_lit_zero"), Some(&2));
        assert_eq!(stats.matches.get("self_move"), Some(&1));
        assert_eq!(
            text(&code),
            vec!["load-param v0", "shl-int/lit v1, v0, 3", "move v2, v1", "return v2"]
        );
    }

    #[test]
    fn test_narrow_pattern_respects_register_width() {
        let mut b = CodeBuilder::new(20);
        b.load_param(19)
            .add_lit(IROpcode::RsubIntLit, 16, 19, 0)
            .add_lit(IROpcode::RsubIntLit, 1, 2, 0)
            .ret(16);
        let mut code = b.build();
        let stats = peephole(&mut code, &ClassHierarchy::default());
        assert_eq!(stats.matches.get("rsub_zero_to_neg"), Some(&1));
        let ops: Vec<IROpcode> = code.instructions().iter().map(|i| i.opcode()).collect();
        assert_eq!(ops[1], IROpcode::RsubIntLit);
        assert_eq!(ops[2], IROpcode::NegInt);
    }

    #[test]
    fn test_sput_sget_requires_non_volatile_field() {
        let build = || {
            let mut b = CodeBuilder::new(2);
            b.load_param(0)
                .sput("LFoo;.f:I", 0)
                .sget("LFoo;.f:I", 0)
                .ret(0);
            b.build()
        };

        let mut plain = build();
        let stats = peephole(&mut plain, &hierarchy_with_field(AccessFlags::PUBLIC));
        assert_eq!(stats.matches.get("sput_sget"), Some(&1));
        assert!(!plain.instructions().iter().any(|i| i.opcode().is_sget()));

        let mut volatile = build();
        let hierarchy = hierarchy_with_field(AccessFlags::PUBLIC | AccessFlags::VOLATILE);
        assert!(!peephole(&mut volatile, &hierarchy).changed());

        // Unresolvable fields are treated as volatile.
        let mut unknown = build();
        assert!(!peephole(&mut unknown, &ClassHierarchy::default()).changed());
    }

    #[test]
    fn test_sget_into_other_register_kept() {
        let mut b = CodeBuilder::new(2);
        b.load_param(0)
            .sput("LFoo;.f:I", 0)
            .sget("LFoo;.f:I", 1)
            .ret(1);
        let mut code = b.build();
        assert!(!peephole(&mut code, &hierarchy_with_field(AccessFlags::PUBLIC)).changed());
    }

    #[test]
    fn test_aput_aget_forwarded() {
        let mut b = CodeBuilder::new(3);
        b.load_param_object(0)
            .load_param(1)
            .load_param(2)
            .aput(IROpcode::Aput, 2, 0, 1)
            .aget(IROpcode::Aget, 2, 0, 1)
            .ret(2);
        let mut code = b.build();
        let stats = peephole(&mut code, &ClassHierarchy::default());
        assert_eq!(stats.matches.get("aput_aget"), Some(&1));
        assert!(!code.instructions().iter().any(|i| i.opcode().is_aget()));
    }

    #[test]
    fn test_no_match_is_no_op() {
        let mut b = CodeBuilder::new(2);
        let skip = b.label();
        b.load_param(0)
            .if_z(IROpcode::IfEqz, 0, skip)
            .add_lit(IROpcode::AddIntLit, 1, 0, 3)
            .bind(skip)
            .return_void();
        let mut code = b.build();
        let before = code.clone();
        assert!(!peephole(&mut code, &ClassHierarchy::default()).changed());
        assert_eq!(code.to_string(), before.to_string());
        assert_eq!(code.list().ids(), before.list().ids());
    }

    #[test]
    fn test_disabled_pattern_skipped() {
        let engine = Peephole::new(&["mul_lit_pow2".to_string()]);
        assert!(!engine.enabled().contains(&"mul_lit_pow2"));
        let mut b = CodeBuilder::new(2);
        b.load_param(0).add_lit(IROpcode::MulIntLit, 1, 0, 4).ret(1);
        let mut code = b.build();
        let stats = with_code_cfg(&mut code, |cfg| engine.run(cfg, &ClassHierarchy::default()));
        assert!(!stats.changed());
    }
}

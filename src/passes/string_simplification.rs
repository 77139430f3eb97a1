//! `StringBuilder` chain folding.
//!
//! Each block is interpreted over a small string domain: a register may hold a known string
//! constant, or a builder created in the block whose content is an optional unknown prefix
//! (the *base*, a register) followed by a known *suffix*. Modelled operations are
//! `new-instance StringBuilder`, `<init>()`, `<init>(String)`, `append(String)` and
//! `toString()`; any other use of a builder register makes the builder escape.
//!
//! At a `toString()` whose builder did not escape:
//!
//! - without a base, the whole chain is deleted and the result register receives a
//!   `const-string` of the suffix;
//! - with a base and at least two constant pieces, the chain is rebuilt as a single
//!   `new + init + append(base) + append(suffix) + toString`.
//!
//! Every register that aliased the builder must be dead after the `toString()`, so a
//! builder reaching the method boundary or another block is never rewritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;

use crate::{
    analysis::LivenessResult,
    compiler::{walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions},
    ir::{
        cfg::{BlockId, ControlFlowGraph},
        IRInstruction, IROpcode, MethodItem, Operand, Reg,
    },
    model::Program,
    passes::utils::{with_cfg, Changed},
    pool::{DexMethodRef, DexProto, DexString, DexType},
    Result,
};

/// The `StringBuilder` methods the domain understands.
struct BuilderMethods {
    init: DexMethodRef,
    init_string: DexMethodRef,
    append_string: DexMethodRef,
    to_string: DexMethodRef,
}

impl BuilderMethods {
    fn new() -> Self {
        let sb = DexType::string_builder();
        let method = |name: &str, rtype: DexType, args: Vec<DexType>| {
            DexMethodRef::make(sb.clone(), name, DexProto::make(rtype, args))
        };
        Self {
            init: method("<init>", DexType::void(), vec![]),
            init_string: method("<init>", DexType::void(), vec![DexType::string()]),
            append_string: method("append", sb.clone(), vec![DexType::string()]),
            to_string: method("toString", DexType::string(), vec![]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Stringy {
    Str(String),
    Builder(usize),
}

#[derive(Debug, Default)]
struct Builder {
    chain: BTreeSet<usize>,
    aliases: BTreeSet<Reg>,
    base: Option<(Reg, bool)>,
    suffix: String,
    pieces: usize,
    initialized: bool,
    finished: bool,
    escaped: bool,
}

#[derive(Debug)]
struct Candidate {
    builder: usize,
    to_string: usize,
    result: usize,
    dest: Reg,
}

enum Pending {
    New(usize),
    Str(String),
    Append(usize),
    ToString(usize, usize),
}

/// Counts reported by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringStats {
    /// `const-string` instructions created.
    pub const_strings_added: usize,
    /// Instructions inserted, the new constants included.
    pub instructions_added: usize,
    /// Builder chain instructions deleted.
    pub instructions_removed: usize,
}

impl StringStats {
    fn add(self, o: Self) -> Self {
        Self {
            const_strings_added: self.const_strings_added + o.const_strings_added,
            instructions_added: self.instructions_added + o.instructions_added,
            instructions_removed: self.instructions_removed + o.instructions_removed,
        }
    }
}

impl Changed for StringStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.instructions_removed > 0
    }
}

/// Folds the builder chains of `cfg`.
pub fn simplify_strings(cfg: &mut ControlFlowGraph) -> StringStats {
    let methods = BuilderMethods::new();
    let liveness = LivenessResult::compute(cfg);
    let mut stats = StringStats::default();
    for block in cfg.blocks() {
        let live_after = liveness.live_after_each(cfg, block);
        let insns: Vec<(usize, IRInstruction)> = cfg
            .block(block)
            .instructions()
            .map(|(i, insn)| (i, insn.clone()))
            .collect();
        let (builders, candidates) = interpret(&insns, &methods);
        let accepted: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| {
                let b = &builders[c.builder];
                let live = live_after.get(&c.result);
                !b.escaped
                    && (b.base.is_none() || b.pieces >= 2)
                    && b.aliases
                        .iter()
                        .all(|r| *r == c.dest || !live.is_some_and(|l| l.contains(*r as usize)))
            })
            .collect();
        if !accepted.is_empty() {
            rewrite_block(cfg, block, &builders, &accepted, &methods, &mut stats);
        }
    }
    stats
}

fn interpret(insns: &[(usize, IRInstruction)], m: &BuilderMethods) -> (Vec<Builder>, Vec<Candidate>) {
    let mut builders: Vec<Builder> = Vec::new();
    let mut values: HashMap<Reg, Stringy> = HashMap::new();
    let mut candidates = Vec::new();
    let mut pending: Option<Pending> = None;

    for (idx, insn) in insns {
        let (idx, op) = (*idx, insn.opcode());
        let last = pending.take();
        let builder_of = |values: &HashMap<Reg, Stringy>, r: Reg| match values.get(&r) {
            Some(Stringy::Builder(b)) => Some(*b),
            _ => None,
        };
        let receiver = insn
            .srcs()
            .first()
            .and_then(|r| builder_of(&values, *r))
            .filter(|b| !builders[*b].finished);
        let callee = insn.method();
        let mut defined: Option<Stringy> = None;

        match op {
            IROpcode::NewInstance if insn.type_ref() == Some(&DexType::string_builder()) => {
                builders.push(Builder {
                    chain: BTreeSet::from([idx]),
                    ..Builder::default()
                });
                pending = Some(Pending::New(builders.len() - 1));
            }
            IROpcode::ConstString => {
                if let Some(s) = insn.string() {
                    pending = Some(Pending::Str(s.as_str().to_string()));
                }
            }
            IROpcode::MoveResultPseudoObject => match last {
                Some(Pending::New(b)) => {
                    builders[b].chain.insert(idx);
                    defined = Some(Stringy::Builder(b));
                }
                Some(Pending::Str(s)) => defined = Some(Stringy::Str(s)),
                _ => {}
            },
            IROpcode::MoveResultObject => match last {
                Some(Pending::Append(b)) => {
                    builders[b].chain.insert(idx);
                    defined = Some(Stringy::Builder(b));
                }
                Some(Pending::ToString(b, at)) => {
                    builders[b].chain.insert(idx);
                    if let Some(dest) = insn.dest() {
                        candidates.push(Candidate {
                            builder: b,
                            to_string: at,
                            result: idx,
                            dest,
                        });
                        let known = &builders[b];
                        if !known.escaped && known.base.is_none() {
                            defined = Some(Stringy::Str(known.suffix.clone()));
                        }
                    }
                }
                _ => {}
            },
            IROpcode::MoveObject => {
                defined = values.get(&insn.src(0)).cloned();
            }
            IROpcode::InvokeDirect if receiver.is_some() && callee == Some(&m.init) => {
                if let Some(b) = receiver {
                    let builder = &mut builders[b];
                    builder.escaped |= builder.initialized;
                    builder.initialized = true;
                    builder.chain.insert(idx);
                }
            }
            IROpcode::InvokeDirect if receiver.is_some() && callee == Some(&m.init_string) => {
                if let Some(b) = receiver {
                    let arg = values.get(&insn.src(1)).cloned();
                    let builder = &mut builders[b];
                    builder.escaped |= builder.initialized;
                    builder.initialized = true;
                    builder.chain.insert(idx);
                    match arg {
                        Some(Stringy::Str(s)) => {
                            builder.suffix = s;
                            builder.pieces += 1;
                        }
                        _ => builder.base = Some((insn.src(1), true)),
                    }
                }
            }
            IROpcode::InvokeVirtual if receiver.is_some() && callee == Some(&m.append_string) => {
                if let Some(b) = receiver {
                    let arg = values.get(&insn.src(1)).cloned();
                    let builder = &mut builders[b];
                    builder.escaped |= !builder.initialized;
                    builder.chain.insert(idx);
                    match arg {
                        Some(Stringy::Str(s)) => {
                            builder.suffix.push_str(&s);
                            builder.pieces += 1;
                        }
                        Some(Stringy::Builder(_)) => builder.escaped = true,
                        None if builder.suffix.is_empty() && builder.base.is_none() => {
                            builder.base = Some((insn.src(1), false));
                        }
                        None => builder.escaped = true,
                    }
                    pending = Some(Pending::Append(b));
                }
            }
            IROpcode::InvokeVirtual if receiver.is_some() && callee == Some(&m.to_string) => {
                if let Some(b) = receiver {
                    let builder = &mut builders[b];
                    builder.escaped |= !builder.initialized;
                    builder.finished = true;
                    builder.chain.insert(idx);
                    pending = Some(Pending::ToString(b, idx));
                }
            }
            _ => {
                for r in insn.reg_uses() {
                    if let Some(b) = builder_of(&values, r) {
                        builders[b].escaped = true;
                    }
                }
            }
        }

        for d in insn.reg_defs() {
            values.remove(&d);
            for b in builders.iter_mut() {
                if b.base.is_some_and(|(r, _)| r == d) && !b.finished {
                    b.escaped = true;
                }
            }
        }
        if let (Some(value), Some(dest)) = (defined, insn.dest()) {
            if let Stringy::Builder(b) = value {
                builders[b].aliases.insert(dest);
            }
            values.insert(dest, value);
        }
    }
    (builders, candidates)
}

fn rewrite_block(
    cfg: &mut ControlFlowGraph,
    block: BlockId,
    builders: &[Builder],
    accepted: &[&Candidate],
    m: &BuilderMethods,
    stats: &mut StringStats,
) {
    let mut removed: BTreeSet<usize> = BTreeSet::new();
    let mut replacements: BTreeMap<usize, Vec<IRInstruction>> = BTreeMap::new();
    for c in accepted {
        let b = &builders[c.builder];
        removed.extend(b.chain.iter().copied());
        let suffix = DexString::make(&b.suffix);
        let code = match b.base {
            None => vec![
                IRInstruction::new(IROpcode::ConstString).with_operand(Operand::String(suffix)),
                IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(c.dest),
            ],
            Some((base, via_init)) => {
                let builder = cfg.allocate_temp();
                let text = cfg.allocate_temp();
                let invoke = |op: IROpcode, srcs: &[Reg], method: &DexMethodRef| {
                    IRInstruction::new(op)
                        .with_srcs(srcs)
                        .with_operand(Operand::Method(method.clone()))
                };
                let mut code = vec![
                    IRInstruction::new(IROpcode::NewInstance)
                        .with_operand(Operand::Type(DexType::string_builder())),
                    IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(builder),
                ];
                if via_init {
                    code.push(invoke(IROpcode::InvokeDirect, &[builder, base], &m.init_string));
                } else {
                    code.push(invoke(IROpcode::InvokeDirect, &[builder], &m.init));
                    code.push(invoke(IROpcode::InvokeVirtual, &[builder, base], &m.append_string));
                }
                code.extend([
                    IRInstruction::new(IROpcode::ConstString).with_operand(Operand::String(suffix)),
                    IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(text),
                    invoke(IROpcode::InvokeVirtual, &[builder, text], &m.append_string),
                    invoke(IROpcode::InvokeVirtual, &[builder], &m.to_string),
                    IRInstruction::new(IROpcode::MoveResultObject).with_dest(c.dest),
                ]);
                code
            }
        };
        stats.const_strings_added += 1;
        stats.instructions_added += code
            .iter()
            .filter(|i| !i.opcode().is_move_result_pseudo())
            .count();
        replacements.insert(c.to_string, code);
    }

    let items = std::mem::take(cfg.block_mut(block).items_mut());
    let mut rebuilt = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        if let Some(code) = replacements.remove(&idx) {
            rebuilt.extend(code.into_iter().map(MethodItem::Insn));
        }
        if removed.contains(&idx) {
            if item.insn().is_some_and(|i| !i.opcode().is_move_result_any()) {
                stats.instructions_removed += 1;
            }
            continue;
        }
        rebuilt.push(item);
    }
    *cfg.block_mut(block).items_mut() = rebuilt;
    cfg.drop_stale_throw_edges(block);
    debug!("folded {} builder chains in {block}", accepted.len());
}

/// `StringSimplificationPass`.
#[derive(Debug, Default)]
pub struct StringSimplificationPass;

impl StringSimplificationPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for StringSimplificationPass {
    fn name(&self) -> &'static str {
        "StringSimplificationPass"
    }

    fn description(&self) -> &'static str {
        "Fold StringBuilder chains over constant strings"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::PreservesButDowngrades),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let stats = walk::parallel_reduce(
            program,
            |method| {
                let stats = with_cfg(method, simplify_strings);
                if stats.changed() {
                    ctx.events
                        .record(EventKind::StringFolded)
                        .method(method.reference())
                        .message(format!("{} builder instructions folded", stats.instructions_removed));
                }
                stats
            },
            StringStats::add,
        );
        ctx.incr_metric("num_const_strings_added", stats.const_strings_added as i64);
        ctx.incr_metric("num_instructions_added", stats.instructions_added as i64);
        ctx.incr_metric("num_instructions_removed", stats.instructions_removed as i64);
        Ok(())
    }
}

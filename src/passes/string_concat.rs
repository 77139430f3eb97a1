//! Folding of constant string concatenations in static initializers.
//!
//! javac compiles `static final String S = "v" + 2 + 'x';` (when it cannot fold it
//! itself) into a `StringBuilder` chain in `<clinit>`:
//!
//! ```text
//! new-instance v0, Ljava/lang/StringBuilder;
//! invoke-direct {v0}, Ljava/lang/StringBuilder;.<init>:()V
//! const-string v1, "v"
//! invoke-virtual {v0, v1}, Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;
//! ...
//! invoke-virtual {v0}, Ljava/lang/StringBuilder;.toString:()Ljava/lang/String;
//! move-result-object v2
//! sput-object v2, LFoo;.S:Ljava/lang/String;
//! ```
//!
//! When every appended value is a constant string, int, long, char or boolean, the
//! builder never escapes, and the result goes straight into a `String` field of the same
//! class, the chain collapses to one `const-string`. The constant loads feeding the
//! appends are left for dead-code elimination.

use std::collections::HashMap;

use log::debug;

use crate::{
    analysis::LivenessResult,
    compiler::{walk, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions},
    ir::{
        cfg::{BlockId, CfgMutation, CfgPosition, ControlFlowGraph},
        IRInstruction, IROpcode, Operand, Reg,
    },
    model::{DexMethod, Program},
    passes::utils::{with_cfg, Changed},
    pool::{DexMethodRef, DexString, DexType},
    Result,
};

const STRING_BUILDER: &str = "Ljava/lang/StringBuilder;";

#[derive(Debug, Clone, PartialEq)]
enum Constant {
    Literal(i64),
    Text(String),
}

/// A builder chain under construction.
#[derive(Debug, Default)]
struct Chain {
    text: String,
    doomed: Vec<usize>,
    aliases: Vec<Reg>,
}

/// One foldable chain: what to delete and what to put in place of `toString`.
#[derive(Debug)]
struct Fold {
    doomed: Vec<usize>,
    to_string: usize,
    result: usize,
    dest: Reg,
    text: String,
}

/// Counts of one method's rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcatStats {
    /// Chains folded.
    pub folded: usize,
    /// Instructions deleted.
    pub insns_removed: usize,
}

impl Changed for ConcatStats {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed(&self) -> bool {
        self.folded > 0
    }
}

fn builder_method(method: &DexMethodRef, name: &str) -> bool {
    method.class().descriptor() == STRING_BUILDER && method.name().as_str() == name
}

/// Renders `value` the way `StringBuilder.append(arg)` would for argument type `arg`.
fn render(arg: &DexType, value: &Constant) -> Option<String> {
    match (arg.descriptor(), value) {
        ("Ljava/lang/String;", Constant::Text(s)) => Some(s.clone()),
        ("I" | "J" | "S" | "B", Constant::Literal(n)) => Some(n.to_string()),
        ("C", Constant::Literal(n)) => u32::try_from(*n)
            .ok()
            .and_then(char::from_u32)
            .map(String::from),
        ("Z", Constant::Literal(n)) => Some((*n != 0).to_string()),
        _ => None,
    }
}

fn find_folds(cfg: &ControlFlowGraph, block: BlockId, class: &DexType, liveness: &LivenessResult) -> Vec<Fold> {
    let insns: Vec<(usize, &IRInstruction)> = cfg.block(block).instructions().collect();
    let live_after = liveness.live_after_each(cfg, block);
    let mut constants: HashMap<Reg, Constant> = HashMap::new();
    let mut chains: HashMap<Reg, Chain> = HashMap::new();
    let mut folds = Vec::new();

    let mut i = 0;
    while i < insns.len() {
        let (index, insn) = insns[i];
        let next = insns.get(i + 1).copied();
        let op = insn.opcode();
        i += 1;

        match op {
            IROpcode::NewInstance
                if insn.type_ref().is_some_and(|t| t.descriptor() == STRING_BUILDER) =>
            {
                if let Some((pseudo, p)) = next.filter(|(_, n)| n.opcode().is_move_result_pseudo()) {
                    if let Some(dest) = p.dest() {
                        constants.remove(&dest);
                        chains.retain(|_, c| !c.aliases.contains(&dest));
                        chains.insert(
                            dest,
                            Chain {
                                doomed: vec![index, pseudo],
                                aliases: vec![dest],
                                ..Chain::default()
                            },
                        );
                    }
                    i += 1;
                }
                continue;
            }
            IROpcode::ConstString => {
                if let (Some(s), Some((_, p))) = (insn.string(), next) {
                    if let Some(dest) = p.dest().filter(|_| p.opcode().is_move_result_pseudo()) {
                        chains.retain(|_, c| !c.aliases.contains(&dest));
                        constants.insert(dest, Constant::Text(s.as_str().to_string()));
                        i += 1;
                        continue;
                    }
                }
            }
            IROpcode::Const | IROpcode::ConstWide => {
                if let (Some(dest), Some(n)) = (insn.dest(), insn.literal()) {
                    chains.retain(|_, c| !c.aliases.contains(&dest));
                    if insn.dest_is_wide() {
                        constants.remove(&(dest + 1));
                    }
                    constants.insert(dest, Constant::Literal(n));
                    continue;
                }
            }
            _ => {}
        }

        let builder = insn
            .srcs()
            .first()
            .and_then(|s| chains.iter().find(|(_, c)| c.aliases.contains(s)).map(|(k, _)| *k));
        let method = insn.method();
        let handled = match (builder, method) {
            (Some(b), Some(m)) if op == IROpcode::InvokeDirect && builder_method(m, "<init>") => {
                let init = match m.proto().args() {
                    [] => Some(String::new()),
                    [arg] => insn
                        .srcs()
                        .get(1)
                        .and_then(|s| constants.get(s))
                        .and_then(|v| render(arg, v)),
                    _ => None,
                };
                match (init, chains.get_mut(&b)) {
                    (Some(text), Some(chain)) if chain.doomed.len() == 2 => {
                        chain.text = text;
                        chain.doomed.push(index);
                        true
                    }
                    _ => false,
                }
            }
            (Some(b), Some(m)) if op == IROpcode::InvokeVirtual && builder_method(m, "append") => {
                let piece = match m.proto().args() {
                    [arg] => insn
                        .srcs()
                        .get(1)
                        .and_then(|s| constants.get(s))
                        .and_then(|v| render(arg, v)),
                    _ => None,
                };
                match (piece, chains.get_mut(&b)) {
                    (Some(piece), Some(chain)) => {
                        chain.text.push_str(&piece);
                        chain.doomed.push(index);
                        if let Some((result, r)) = next.filter(|(_, n)| n.opcode() == IROpcode::MoveResultObject) {
                            chain.doomed.push(result);
                            if let Some(alias) = r.dest() {
                                constants.remove(&alias);
                                chain.aliases.push(alias);
                            }
                            i += 1;
                        }
                        true
                    }
                    _ => false,
                }
            }
            (Some(b), Some(m)) if op == IROpcode::InvokeVirtual && builder_method(m, "toString") => {
                let result = next.filter(|(_, n)| n.opcode() == IROpcode::MoveResultObject);
                let store = insns.get(i + 1).copied();
                if let (Some((result, r)), Some((store_index, s))) = (result, store) {
                    let dest = r.dest();
                    let stored = s.opcode() == IROpcode::SputObject
                        && s.srcs().first().copied() == dest
                        && s.field().is_some_and(|f| f.class() == class && f.ty() == &DexType::string());
                    let escapes = chains.get(&b).is_some_and(|c| {
                        live_after
                            .get(&store_index)
                            .is_some_and(|live| c.aliases.iter().any(|a| live.contains(*a as usize)))
                    });
                    if let (true, false, Some(dest), Some(chain)) = (stored, escapes, dest, chains.remove(&b)) {
                        if chain.doomed.len() >= 3 {
                            folds.push(Fold {
                                doomed: chain.doomed,
                                to_string: index,
                                result,
                                dest,
                                text: chain.text,
                            });
                        }
                    }
                    i += 1;
                }
                chains.remove(&b);
                true
            }
            _ => false,
        };
        if handled {
            continue;
        }

        // Any other use of a builder lets it escape.
        chains.retain(|_, c| !insn.srcs().iter().any(|s| c.aliases.contains(s)));
        for d in insn.reg_defs() {
            constants.remove(&d);
            chains.retain(|_, c| !c.aliases.contains(&d));
        }
    }
    folds
}

/// Folds the constant builder chains of `cfg`, a `<clinit>` of `class`.
pub fn fold_concatenations(cfg: &mut ControlFlowGraph, class: &DexType) -> ConcatStats {
    let liveness = LivenessResult::compute(cfg);
    let folds: Vec<(BlockId, Fold)> = cfg
        .blocks()
        .into_iter()
        .flat_map(|b| find_folds(cfg, b, class, &liveness).into_iter().map(move |f| (b, f)))
        .collect();

    let mut stats = ConcatStats::default();
    let mut mutation = CfgMutation::new();
    for (block, fold) in folds {
        debug!("folding builder chain into \"{}\"", fold.text);
        for index in &fold.doomed {
            let pos = CfgPosition::new(block, *index);
            let pseudo = cfg
                .insn_at(pos)
                .is_some_and(|i| i.opcode().is_move_result_pseudo());
            // Pseudos go away with their owner.
            if !pseudo {
                mutation.remove(pos);
            }
            stats.insns_removed += 1;
        }
        mutation.remove(CfgPosition::new(block, fold.result));
        mutation.replace(
            CfgPosition::new(block, fold.to_string),
            vec![
                IRInstruction::new(IROpcode::ConstString)
                    .with_operand(Operand::String(DexString::make(&fold.text))),
                IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(fold.dest),
            ],
        );
        stats.folded += 1;
    }
    mutation.flush(cfg);
    stats
}

fn is_clinit(method: &DexMethod) -> bool {
    method.name().as_str() == "<clinit>"
}

/// `StringConcatenatorPass`.
#[derive(Debug, Default)]
pub struct StringConcatenatorPass;

impl StringConcatenatorPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for StringConcatenatorPass {
    fn name(&self) -> &'static str {
        "StringConcatenatorPass"
    }

    fn description(&self) -> &'static str {
        "Fold constant StringBuilder chains in static initializers"
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::PreservesButDowngrades),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let (methods, removed) = walk::parallel_reduce(
            program,
            |method| {
                if !is_clinit(method) {
                    return (0, 0);
                }
                let class = method.class().clone();
                let stats = with_cfg(method, |cfg| fold_concatenations(cfg, &class));
                if !stats.changed() {
                    return (0, 0);
                }
                ctx.events
                    .record(EventKind::StringFolded)
                    .method(method.reference())
                    .message(format!("{} builder chains", stats.folded));
                (1, stats.insns_removed)
            },
            |a, b| (a.0 + b.0, a.1 + b.1),
        );
        ctx.incr_metric("methods_rewritten", methods as i64);
        ctx.incr_metric("insns_removed", removed as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::AccessFlags,
        test::helpers::{method, opcodes_of, program_of, run_pass},
    };

    const INIT: &str = "Ljava/lang/StringBuilder;.<init>:()V";
    const APPEND_STR: &str =
        "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;";
    const APPEND_INT: &str = "Ljava/lang/StringBuilder;.append:(I)Ljava/lang/StringBuilder;";
    const APPEND_CHAR: &str = "Ljava/lang/StringBuilder;.append:(C)Ljava/lang/StringBuilder;";
    const TO_STRING: &str = "Ljava/lang/StringBuilder;.toString:()Ljava/lang/String;";

    fn clinit(body: impl FnOnce(&mut crate::ir::CodeBuilder)) -> DexMethod {
        method("LFoo;.<clinit>:()V", AccessFlags::STATIC | AccessFlags::CONSTRUCTOR, 3, body)
    }

    fn folded_string(method: &DexMethod) -> Option<String> {
        method
            .code()?
            .instructions()
            .iter()
            .rev()
            .find_map(|i| i.string().map(|s| s.as_str().to_string()))
    }

    #[test]
    fn test_chain_folded() {
        let mut program = program_of(vec![clinit(|b| {
            b.new_instance(0, STRING_BUILDER)
                .invoke_direct(INIT, &[0])
                .const_string(1, "v")
                .invoke_virtual(APPEND_STR, &[0, 1])
                .move_result(IROpcode::MoveResultObject, 0)
                .const_int(1, 2)
                .invoke_virtual(APPEND_INT, &[0, 1])
                .const_int(1, 'x' as i64)
                .invoke_virtual(APPEND_CHAR, &[0, 1])
                .invoke_virtual(TO_STRING, &[0])
                .move_result(IROpcode::MoveResultObject, 2)
                .sput("LFoo;.S:Ljava/lang/String;", 2)
                .return_void();
        })]);
        let metrics = run_pass(&mut StringConcatenatorPass::new(), &mut program);
        assert_eq!(metrics.get("methods_rewritten"), 1);

        let method = program.methods().next().unwrap();
        let ops = opcodes_of(method);
        assert!(!ops.iter().any(|o| o.starts_with("invoke")));
        assert!(!ops.contains(&"new-instance".to_string()));
        let sput = ops.iter().position(|o| o == "sput-object").unwrap();
        assert_eq!(ops[sput - 2], "const-string");
        assert_eq!(folded_string(method).as_deref(), Some("v2x"));
        assert!(metrics.get("insns_removed") >= 6);
    }

    #[test]
    fn test_field_of_other_class_untouched() {
        let mut program = program_of(vec![clinit(|b| {
            b.new_instance(0, STRING_BUILDER)
                .invoke_direct(INIT, &[0])
                .const_int(1, 1)
                .invoke_virtual(APPEND_INT, &[0, 1])
                .invoke_virtual(TO_STRING, &[0])
                .move_result(IROpcode::MoveResultObject, 2)
                .sput("LBar;.S:Ljava/lang/String;", 2)
                .return_void();
        })]);
        let metrics = run_pass(&mut StringConcatenatorPass::new(), &mut program);
        assert_eq!(metrics.get("methods_rewritten"), 0);
    }

    #[test]
    fn test_escaping_builder_untouched() {
        let mut program = program_of(vec![clinit(|b| {
            b.new_instance(0, STRING_BUILDER)
                .invoke_direct(INIT, &[0])
                .invoke_static("LLog;.keep:(Ljava/lang/Object;)V", &[0])
                .invoke_virtual(TO_STRING, &[0])
                .move_result(IROpcode::MoveResultObject, 2)
                .sput("LFoo;.S:Ljava/lang/String;", 2)
                .return_void();
        })]);
        let metrics = run_pass(&mut StringConcatenatorPass::new(), &mut program);
        assert_eq!(metrics.get("methods_rewritten"), 0);
    }

    #[test]
    fn test_non_constant_append_untouched() {
        let mut program = program_of(vec![
            clinit(|b| {
                b.new_instance(0, STRING_BUILDER)
                    .invoke_direct(INIT, &[0])
                    .invoke_static("LFoo;.seed:()I", &[])
                    .move_result(IROpcode::MoveResult, 1)
                    .invoke_virtual(APPEND_INT, &[0, 1])
                    .invoke_virtual(TO_STRING, &[0])
                    .move_result(IROpcode::MoveResultObject, 2)
                    .sput("LFoo;.S:Ljava/lang/String;", 2)
                    .return_void();
            }),
        ]);
        let metrics = run_pass(&mut StringConcatenatorPass::new(), &mut program);
        assert_eq!(metrics.get("methods_rewritten"), 0);
        assert_eq!(folded_string(program.methods().next().unwrap()), None);
    }
}

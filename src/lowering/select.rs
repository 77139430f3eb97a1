//! Instruction selection.
//!
//! Walks the IR list once and picks the narrowest concrete encoding for every
//! instruction. Branch destinations stay symbolic (the IR branch item they belong to);
//! [`super::layout`] assigns addresses and resolves them.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use crate::{
    ir::{
        ArrayData, BranchTarget, CatchEntry, IRInstruction, IRList, IROpcode, ItemId,
        MethodItem, Operand, Reg, TargetKind, TryKind,
    },
    lowering::{DexInstruction, DexOpcode, LoweringStats},
    pool::DexType,
    Error, Result,
};

use IROpcode as Op;

const NIBBLE: Reg = 0xf;
const BYTE: Reg = 0xff;

/// What the offset of a selected instruction refers to.
#[derive(Debug, Clone)]
pub(super) enum Jump {
    None,
    /// The `Simple` target of the IR branch.
    Branch(ItemId),
    /// The `Case` targets of the IR switch, sorted keys.
    Switch(ItemId, Vec<i32>),
    /// A `fill-array-data` payload.
    Array(Arc<ArrayData>),
}

#[derive(Debug, Clone)]
pub(super) struct Selected {
    pub insn: DexInstruction,
    pub jump: Jump,
}

/// Everything layout needs to know about a non-instruction item.
#[derive(Debug, Clone)]
pub(super) enum Mark {
    Target(BranchTarget),
    Try(TryKind, ItemId),
    Catch(ItemId, CatchEntry),
    Line(u32),
}

/// Selected instructions plus the marks between them. A mark at index `i` sits right
/// before instruction `i`.
#[derive(Debug)]
pub(super) struct Selection {
    pub insns: Vec<Selected>,
    pub marks: Vec<(usize, Mark)>,
    pub registers_size: u32,
    pub ins_size: u32,
    pub outs_size: u32,
    pub stats: LoweringStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralForm {
    Lit8,
    Lit16,
    Scratch,
}

fn literal_form(op: IROpcode, dest: Reg, src: Reg, literal: i64) -> LiteralForm {
    if i8::try_from(literal).is_ok() && dest <= BYTE && src <= BYTE {
        LiteralForm::Lit8
    } else if !op.is_shift() && i16::try_from(literal).is_ok() && dest <= NIBBLE && src <= NIBBLE {
        LiteralForm::Lit16
    } else {
        LiteralForm::Scratch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvokeForm {
    Short,
    Range,
    Scratch,
}

fn invoke_form(words: &[Reg]) -> InvokeForm {
    if words.len() <= 5 && words.iter().all(|&r| r <= NIBBLE) {
        InvokeForm::Short
    } else if is_contiguous(words) {
        InvokeForm::Range
    } else {
        InvokeForm::Scratch
    }
}

fn is_contiguous(regs: &[Reg]) -> bool {
    regs.windows(2).all(|w| w[1] == w[0] + 1)
}

fn is_invoke_like(op: IROpcode) -> bool {
    op.is_invoke() || op == Op::FilledNewArray
}

/// Scratch registers `insn` needs beyond the method's own frame.
fn scratch_needed(insn: &IRInstruction) -> u32 {
    let op = insn.opcode();
    if op.is_literal_op() {
        return match (insn.dest(), insn.srcs().first(), insn.literal()) {
            (Some(dest), Some(&src), Some(lit))
                if literal_form(op, dest, src, lit) == LiteralForm::Scratch =>
            {
                1
            }
            _ => 0,
        };
    }
    if is_invoke_like(op) {
        let words = insn.reg_uses();
        if invoke_form(&words) == InvokeForm::Scratch {
            return words.len() as u32;
        }
    }
    0
}

fn param_width(param: &IRInstruction) -> u32 {
    if param.dest_is_wide() {
        2
    } else {
        1
    }
}

/// `true` if the parameters already arrive in their final registers.
fn params_at_top(params: &[&IRInstruction], registers_size: u32, ins_size: u32) -> bool {
    let Some(mut reg) = registers_size.checked_sub(ins_size) else {
        return false;
    };
    for param in params {
        if param.dest() != Some(reg) {
            return false;
        }
        reg += param_width(param);
    }
    true
}

fn dex_op(name: &str) -> Result<DexOpcode> {
    DexOpcode::from_name(name).ok_or_else(|| Error::Lowering(format!("no DEX opcode named {name}")))
}

fn ir_name(op: IROpcode) -> &'static str {
    op.into()
}

fn dest_of(insn: &IRInstruction) -> Reg {
    match insn.dest() {
        Some(d) => d,
        None => invariant_failed!("{} has no destination", insn),
    }
}

fn literal_of(insn: &IRInstruction) -> i64 {
    match insn.literal() {
        Some(v) => v,
        None => invariant_failed!("{} has no literal", insn),
    }
}

/// Fails unless every register of `regs` fits its slot in `opcode`'s format.
pub(super) fn check_registers(opcode: DexOpcode, regs: &[Reg]) -> Result<()> {
    let fits = if opcode.is_range() {
        regs.len() <= 0xff
            && regs.last().map_or(true, |&r| r <= 0xffff)
            && is_contiguous(regs)
    } else {
        let limits = opcode.format().register_limits();
        regs.len() <= limits.len() && regs.iter().zip(limits).all(|(r, limit)| r <= limit)
    };
    if fits {
        Ok(())
    } else {
        Err(Error::Lowering(format!(
            "{opcode} cannot encode registers {regs:?}"
        )))
    }
}

struct Selector {
    scratch: Reg,
    cases: HashMap<ItemId, Vec<i32>>,
    insns: Vec<Selected>,
    outs_size: u32,
    stats: LoweringStats,
}

/// Selects concrete instructions for `list`, a body using `registers_size` registers.
///
/// Parameters are relocated to the top of the frame: unless they already arrive in place,
/// the frame grows by the parameter words (plus any scratch block) and the body starts
/// with moves from the incoming registers into the registers the IR expects.
pub(super) fn select(list: &IRList, registers_size: u32) -> Result<Selection> {
    let items: Vec<(ItemId, &MethodItem)> = list.iter().collect();

    let params: Vec<&IRInstruction> = items
        .iter()
        .filter_map(|(_, item)| item.insn())
        .filter(|insn| insn.opcode().is_load_param())
        .collect();
    let ins_size: u32 = params.iter().map(|p| param_width(p)).sum();

    let mut cases: HashMap<ItemId, Vec<i32>> = HashMap::new();
    let mut scratch_size = 0;
    for (_, item) in &items {
        match item {
            MethodItem::Target(BranchTarget {
                src,
                kind: TargetKind::Case(key),
            }) => cases.entry(*src).or_default().push(*key),
            MethodItem::Insn(insn) => scratch_size = scratch_size.max(scratch_needed(insn)),
            _ => {}
        }
    }

    let in_place = scratch_size == 0 && params_at_top(&params, registers_size, ins_size);
    let (frame, param_base) = if in_place {
        (registers_size, registers_size - ins_size)
    } else {
        let base = registers_size + scratch_size;
        (base + ins_size, base)
    };

    let mut selector = Selector {
        scratch: registers_size,
        cases,
        insns: Vec::new(),
        outs_size: 0,
        stats: LoweringStats::default(),
    };

    if !in_place {
        let mut incoming = param_base;
        for param in &params {
            let mv = match param.opcode() {
                Op::LoadParamWide => Op::MoveWide,
                Op::LoadParamObject => Op::MoveObject,
                _ => Op::Move,
            };
            selector.emit_move(mv, dest_of(param), incoming)?;
            selector.stats.param_moves += 1;
            incoming += param_width(param);
        }
    }

    let mut marks = Vec::new();
    let mut i = 0;
    while i < items.len() {
        let (id, item) = items[i];
        let at = selector.insns.len();
        match item {
            MethodItem::Insn(insn) if insn.opcode().is_load_param() => {}
            MethodItem::Insn(insn) if insn.opcode().has_move_result_pseudo() => {
                let pseudo = items
                    .get(i + 1)
                    .and_then(|(_, next)| next.insn())
                    .filter(|next| next.opcode().is_move_result_pseudo());
                let Some(dest) = pseudo.and_then(IRInstruction::dest) else {
                    invariant_failed!("{} is missing its move-result-pseudo", insn);
                };
                selector.select_with_result(insn, dest)?;
                i += 1;
            }
            MethodItem::Insn(insn) => selector.select(id, insn)?,
            MethodItem::Target(target) => marks.push((at, Mark::Target(*target))),
            MethodItem::Try(marker) => marks.push((at, Mark::Try(marker.kind, marker.catch_start))),
            MethodItem::Catch(entry) => marks.push((at, Mark::Catch(id, entry.clone()))),
            MethodItem::Position(position) => marks.push((at, Mark::Line(position.line))),
            MethodItem::SourceBlock(_) => {}
        }
        i += 1;
    }

    Ok(Selection {
        insns: selector.insns,
        marks,
        registers_size: frame,
        ins_size,
        outs_size: selector.outs_size,
        stats: selector.stats,
    })
}

impl Selector {
    fn push(&mut self, opcode: DexOpcode, regs: Vec<Reg>, operand: Operand) -> Result<()> {
        self.push_jump(opcode, regs, operand, Jump::None)
    }

    fn push_jump(&mut self, opcode: DexOpcode, regs: Vec<Reg>, operand: Operand, jump: Jump) -> Result<()> {
        check_registers(opcode, &regs)?;
        self.insns.push(Selected {
            insn: DexInstruction::new(opcode, regs, operand),
            jump,
        });
        Ok(())
    }

    fn emit_move(&mut self, op: IROpcode, dest: Reg, src: Reg) -> Result<()> {
        let base = ir_name(op);
        let opcode = if dest <= NIBBLE && src <= NIBBLE {
            dex_op(base)?
        } else if dest <= BYTE {
            dex_op(&format!("{base}/from16"))?
        } else {
            dex_op(&format!("{base}/16"))?
        };
        self.push(opcode, vec![dest, src], Operand::None)
    }

    fn emit_const(&mut self, dest: Reg, value: i64) -> Result<()> {
        // Narrow constants are sign-extended 32-bit values.
        let value = value as i32;
        let opcode = if dest <= NIBBLE && (-7..=7).contains(&value) {
            DexOpcode::Const4
        } else if i16::try_from(value).is_ok() {
            DexOpcode::Const16
        } else if value & 0xffff == 0 {
            DexOpcode::ConstHigh16
        } else {
            DexOpcode::Const
        };
        self.push(opcode, vec![dest], Operand::Literal(i64::from(value)))
    }

    fn emit_const_wide(&mut self, dest: Reg, value: i64) -> Result<()> {
        let opcode = if i16::try_from(value).is_ok() {
            DexOpcode::ConstWide16
        } else if i32::try_from(value).is_ok() {
            DexOpcode::ConstWide32
        } else if value & 0xffff_ffff_ffff == 0 {
            DexOpcode::ConstWideHigh16
        } else {
            DexOpcode::ConstWide
        };
        self.push(opcode, vec![dest], Operand::Literal(value))
    }

    fn select(&mut self, id: ItemId, insn: &IRInstruction) -> Result<()> {
        let op = insn.opcode();
        match op {
            Op::Nop => self.push(DexOpcode::Nop, Vec::new(), Operand::None),
            Op::Move | Op::MoveWide | Op::MoveObject => {
                self.emit_move(op, dest_of(insn), insn.src(0))
            }
            Op::Const => self.emit_const(dest_of(insn), literal_of(insn)),
            Op::ConstWide => self.emit_const_wide(dest_of(insn), literal_of(insn)),
            Op::Goto => self.push_jump(DexOpcode::Goto, Vec::new(), Operand::None, Jump::Branch(id)),
            Op::Switch => self.select_switch(id, insn),
            Op::FillArrayData => {
                let Operand::Data(data) = insn.operand() else {
                    return Err(Error::Lowering(format!("{insn} has no array payload")));
                };
                let data = data.clone();
                self.push_jump(
                    DexOpcode::FillArrayData,
                    vec![insn.src(0)],
                    Operand::None,
                    Jump::Array(data),
                )
            }
            _ if op.is_conditional_branch() => self.push_jump(
                dex_op(ir_name(op))?,
                insn.srcs().to_vec(),
                Operand::None,
                Jump::Branch(id),
            ),
            _ if is_invoke_like(op) => self.select_invoke(insn),
            _ if op.is_binop() => self.select_binop(op, dest_of(insn), insn.src(0), insn.src(1)),
            _ if op.is_literal_op() => self.select_literal(insn),
            _ if op.is_move_result_pseudo() => invariant_failed!("orphaned {}", insn),
            _ => {
                let mut regs: Vec<Reg> = insn.dest().into_iter().collect();
                regs.extend_from_slice(insn.srcs());
                self.push(dex_op(ir_name(op))?, regs, insn.operand().clone())
            }
        }
    }

    /// Instructions whose DEX form writes `dest` directly.
    fn select_with_result(&mut self, insn: &IRInstruction, dest: Reg) -> Result<()> {
        let op = insn.opcode();
        if op == Op::CheckCast {
            let src = insn.src(0);
            if src != dest {
                self.emit_move(Op::MoveObject, dest, src)?;
                self.stats.move_for_check_cast += 1;
            }
            return self.push(DexOpcode::CheckCast, vec![dest], insn.operand().clone());
        }
        let mut regs = vec![dest];
        regs.extend_from_slice(insn.srcs());
        self.push(dex_op(ir_name(op))?, regs, insn.operand().clone())
    }

    fn select_binop(&mut self, op: IROpcode, dest: Reg, a: Reg, b: Reg) -> Result<()> {
        let base = ir_name(op);
        let other = if dest == a {
            Some(b)
        } else if dest == b && op.is_commutative() {
            Some(a)
        } else {
            None
        };
        match other {
            Some(other) if dest <= NIBBLE && other <= NIBBLE => {
                self.stats.to_2addr += 1;
                self.push(dex_op(&format!("{base}/2addr"))?, vec![dest, other], Operand::None)
            }
            _ => self.push(dex_op(base)?, vec![dest, a, b], Operand::None),
        }
    }

    fn select_literal(&mut self, insn: &IRInstruction) -> Result<()> {
        let op = insn.opcode();
        let (dest, src, literal) = (dest_of(insn), insn.src(0), literal_of(insn));
        let base = ir_name(op).trim_end_matches("/lit");
        match literal_form(op, dest, src, literal) {
            LiteralForm::Lit8 => self.push(
                dex_op(&format!("{base}/lit8"))?,
                vec![dest, src],
                Operand::Literal(literal),
            ),
            LiteralForm::Lit16 => {
                let name = if op == Op::RsubIntLit {
                    base.to_string()
                } else {
                    format!("{base}/lit16")
                };
                self.push(dex_op(&name)?, vec![dest, src], Operand::Literal(literal))
            }
            LiteralForm::Scratch => {
                let scratch = self.scratch;
                self.emit_const(scratch, literal)?;
                if op == Op::RsubIntLit {
                    self.select_binop(Op::SubInt, dest, scratch, src)
                } else {
                    let binop = IROpcode::from_str(base)
                        .map_err(|_| Error::Lowering(format!("{op} has no register form")))?;
                    self.select_binop(binop, dest, src, scratch)
                }
            }
        }
    }

    fn select_invoke(&mut self, insn: &IRInstruction) -> Result<()> {
        let op = insn.opcode();
        let base = ir_name(op);
        let words = insn.reg_uses();
        if op.is_invoke() {
            self.outs_size = self.outs_size.max(words.len() as u32);
        }
        let regs = match invoke_form(&words) {
            InvokeForm::Short => return self.push(dex_op(base)?, words, insn.operand().clone()),
            InvokeForm::Range => words,
            InvokeForm::Scratch => {
                let mut reg = self.scratch;
                for (i, &src) in insn.srcs().iter().enumerate() {
                    if insn.src_is_wide(i) {
                        self.emit_move(Op::MoveWide, reg, src)?;
                        reg += 2;
                    } else {
                        let mv = if arg_is_reference(insn, i) {
                            Op::MoveObject
                        } else {
                            Op::Move
                        };
                        self.emit_move(mv, reg, src)?;
                        reg += 1;
                    }
                }
                (self.scratch..reg).collect()
            }
        };
        self.stats.range_invokes += 1;
        self.push(dex_op(&format!("{base}/range"))?, regs, insn.operand().clone())
    }

    fn select_switch(&mut self, id: ItemId, insn: &IRInstruction) -> Result<()> {
        let mut keys = self.cases.remove(&id).unwrap_or_default();
        keys.sort_unstable();
        keys.dedup();
        let packed = match (keys.first(), keys.last()) {
            (Some(&low), Some(&high)) => {
                let span = i64::from(high) - i64::from(low) + 1;
                4 + 2 * span <= 2 + 4 * keys.len() as i64
            }
            _ => false,
        };
        let opcode = if packed {
            DexOpcode::PackedSwitch
        } else {
            DexOpcode::SparseSwitch
        };
        self.push_jump(opcode, vec![insn.src(0)], Operand::None, Jump::Switch(id, keys))
    }
}

fn arg_is_reference(insn: &IRInstruction, index: usize) -> bool {
    if insn.opcode() == Op::FilledNewArray {
        return insn
            .type_ref()
            .and_then(DexType::component_type)
            .is_some_and(|t| t.is_reference());
    }
    insn.invoke_arg_type(index).is_some_and(|t| t.is_reference())
}

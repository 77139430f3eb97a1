//! Lifting lowered code back into the IR.
//!
//! The inverse of [`super::lower`] up to encoding choices: widths, `/2addr` and `/range`
//! forms collapse into the abstract opcode, incoming parameters become `load-param*`
//! instructions at the top of the frame, and nops vanish.

use std::{collections::HashMap, str::FromStr};

use crate::{
    ir::{
        CatchLabel, CodeBuilder, DexPosition, IRCode, IRInstruction, IROpcode, Label, Operand, Reg,
    },
    lowering::{DexInstruction, DexOpcode, Format, LoweredCode, Payload},
    pool::{DexMethodRef, DexType},
    Error, Result,
};

use IROpcode as Op;

/// The IR opcode a concrete opcode is a form of.
fn ir_opcode(opcode: DexOpcode) -> Result<IROpcode> {
    let name = match opcode.format() {
        Format::F22b | Format::F22s => format!("{}/lit", opcode.base_name()),
        _ => opcode.base_name().to_string(),
    };
    IROpcode::from_str(&name).map_err(|_| Error::Lowering(format!("{opcode} has no IR form")))
}

#[derive(Default)]
struct Marks {
    labels: HashMap<u32, Label>,
    catches: HashMap<u32, Vec<(CatchLabel, Option<DexType>)>>,
    try_starts: HashMap<u32, Vec<CatchLabel>>,
    try_ends: HashMap<u32, Vec<CatchLabel>>,
    lines: HashMap<u32, u32>,
}

impl Marks {
    fn emit(&self, b: &mut CodeBuilder, addr: u32, method: &DexMethodRef) {
        for &head in self.try_ends.get(&addr).into_iter().flatten() {
            b.try_end(head);
        }
        for (label, ty) in self.catches.get(&addr).into_iter().flatten() {
            b.bind_catch(*label, ty.clone());
        }
        if let Some(&label) = self.labels.get(&addr) {
            b.bind(label);
        }
        for &head in self.try_starts.get(&addr).into_iter().flatten() {
            b.try_start(head);
        }
        if let Some(&line) = self.lines.get(&addr) {
            b.position(DexPosition::new(Some(method.clone()), None, line));
        }
    }

    fn label(&self, addr: u32) -> Result<Label> {
        self.labels
            .get(&addr)
            .copied()
            .ok_or_else(|| Error::Lowering(format!("no instruction at branch target {addr:#x}")))
    }
}

/// Rebuilds an IR body for `method` from its lowered code.
///
/// # Errors
///
/// Returns [`Error::Lowering`] if the code is inconsistent: offsets that point between
/// instructions, payload offsets without a payload, or a frame too small for the
/// parameters.
pub fn lift(lowered: &LoweredCode, method: &DexMethodRef, is_static: bool) -> Result<IRCode> {
    let mut b = CodeBuilder::new(lowered.registers_size());

    let mut reg = lowered
        .registers_size()
        .checked_sub(lowered.ins_size())
        .ok_or_else(|| Error::Lowering(format!("{method}: frame smaller than its parameters")))?;
    if !is_static {
        b.load_param_object(reg);
        reg += 1;
    }
    for arg in method.proto().args() {
        if arg.is_wide() {
            b.load_param_wide(reg);
            reg += 2;
        } else if arg.is_reference() {
            b.load_param_object(reg);
            reg += 1;
        } else {
            b.load_param(reg);
            reg += 1;
        }
    }

    let mut marks = Marks::default();
    for insn in lowered.instructions() {
        let op = insn.opcode();
        if op.is_branch() {
            marks.labels.entry(insn.target()).or_insert_with(|| b.label());
        } else if matches!(op, DexOpcode::PackedSwitch | DexOpcode::SparseSwitch) {
            let fallthrough = insn.address() + insn.size();
            for (_, rel) in payload_of(lowered, insn)?.cases() {
                let to = insn.address().wrapping_add_signed(rel);
                if to != fallthrough {
                    marks.labels.entry(to).or_insert_with(|| b.label());
                }
            }
        }
    }

    let mut interned: HashMap<(Option<DexType>, u32, Option<CatchLabel>), CatchLabel> =
        HashMap::new();
    let mut heads: Vec<Option<CatchLabel>> = Vec::new();
    for handler in lowered.handlers() {
        let entries: Vec<(Option<DexType>, u32)> = handler
            .catches
            .iter()
            .map(|(ty, addr)| (Some(ty.clone()), *addr))
            .chain(handler.catch_all.map(|addr| (None, addr)))
            .collect();
        let mut next = None;
        for (ty, addr) in entries.into_iter().rev() {
            let key = (ty.clone(), addr, next);
            let label = match interned.get(&key) {
                Some(&label) => label,
                None => {
                    let label = b.catch_label();
                    if let Some(n) = next {
                        b.catch_next(label, n);
                    }
                    marks.catches.entry(addr).or_default().push((label, ty));
                    interned.insert(key, label);
                    label
                }
            };
            next = Some(label);
        }
        heads.push(next);
    }
    for item in lowered.tries() {
        let Some(Some(head)) = heads.get(item.handler) else {
            continue;
        };
        marks.try_starts.entry(item.start_addr).or_default().push(*head);
        marks
            .try_ends
            .entry(item.start_addr + item.insn_count)
            .or_default()
            .push(*head);
    }
    marks.lines = lowered
        .debug_lines()
        .iter()
        .map(|entry| (entry.address, entry.line))
        .collect();

    for insn in lowered.instructions() {
        marks.emit(&mut b, insn.address(), method);
        lift_insn(&mut b, insn, lowered, &marks)?;
    }
    marks.emit(&mut b, lowered.code_size(), method);

    Ok(b.build())
}

fn payload_of<'a>(lowered: &'a LoweredCode, insn: &DexInstruction) -> Result<&'a Payload> {
    lowered
        .payload_at(insn.target())
        .ok_or_else(|| Error::Lowering(format!("{insn} has no payload")))
}

fn lift_insn(b: &mut CodeBuilder, insn: &DexInstruction, lowered: &LoweredCode, marks: &Marks) -> Result<()> {
    let op = insn.opcode();
    let regs = insn.regs();
    match op {
        DexOpcode::Nop => return Ok(()),
        DexOpcode::PackedSwitch | DexOpcode::SparseSwitch => {
            let fallthrough = insn.address() + insn.size();
            let mut cases = Vec::new();
            for (key, rel) in payload_of(lowered, insn)?.cases() {
                let to = insn.address().wrapping_add_signed(rel);
                if to != fallthrough {
                    cases.push((key, marks.label(to)?));
                }
            }
            b.switch(regs[0], &cases);
            return Ok(());
        }
        DexOpcode::FillArrayData => {
            let Payload::ArrayData(data) = payload_of(lowered, insn)? else {
                return Err(Error::Lowering(format!("{insn} points at a switch payload")));
            };
            b.insn(
                IRInstruction::new(Op::FillArrayData)
                    .with_srcs(&regs[..1])
                    .with_operand(Operand::Data(data.clone())),
            );
            return Ok(());
        }
        _ if op.is_goto() => {
            b.goto(marks.label(insn.target())?);
            return Ok(());
        }
        _ => {}
    }

    let ir = ir_opcode(op)?;
    if ir.is_conditional_branch() {
        let label = marks.label(insn.target())?;
        if ir.is_testz() {
            b.if_z(ir, regs[0], label);
        } else {
            b.if_cmp(ir, regs[0], regs[1], label);
        }
        return Ok(());
    }

    let operand = insn.operand().clone();
    if let Some(pseudo) = ir.pseudo_for_result() {
        let srcs = if ir == Op::CheckCast { &regs[..1] } else { &regs[1..] };
        b.insn(IRInstruction::new(ir).with_srcs(srcs).with_operand(operand));
        b.insn(IRInstruction::new(pseudo).with_dest(regs[0]));
    } else if ir.is_invoke() {
        let probe = IRInstruction::new(ir).with_operand(operand);
        let srcs = collapse_wide(&probe, regs);
        b.insn(probe.with_srcs(&srcs));
    } else if ir.has_dest() {
        let srcs = if op.name().ends_with("/2addr") {
            regs.to_vec()
        } else {
            regs[1..].to_vec()
        };
        b.insn(
            IRInstruction::new(ir)
                .with_dest(regs[0])
                .with_srcs(&srcs)
                .with_operand(operand),
        );
    } else {
        b.insn(IRInstruction::new(ir).with_srcs(regs).with_operand(operand));
    }
    Ok(())
}

/// Folds the register pairs of wide arguments into single source slots.
fn collapse_wide(invoke: &IRInstruction, words: &[Reg]) -> Vec<Reg> {
    let mut srcs = Vec::new();
    let mut word = 0;
    while word < words.len() {
        let wide = invoke.src_is_wide(srcs.len());
        srcs.push(words[word]);
        word += if wide { 2 } else { 1 };
    }
    srcs
}

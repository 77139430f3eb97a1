//! Address assignment.
//!
//! Gotos start in their one-unit form and are widened until every offset fits; widening
//! only ever grows an instruction, so the loop terminates. Payloads follow the code at even
//! addresses. Try regions become non-overlapping address ranges, with the innermost
//! region winning where IR regions nest.

use std::collections::HashMap;

use crate::{
    ir::{CatchEntry, ItemId, Operand, TargetKind, TryKind},
    lowering::{
        select::{Jump, Mark, Selected, Selection},
        CatchHandler, DexInstruction, DexOpcode, LineEntry, LoweredCode, Payload, PayloadEntry,
        TryItem,
    },
    Error, Result,
};

type Targets = HashMap<(ItemId, TargetKind), u32>;

fn assign_addresses(insns: &mut [Selected]) -> u32 {
    let mut addr = 0;
    for selected in insns.iter_mut() {
        selected.insn.address = addr;
        addr += selected.insn.size();
    }
    addr
}

fn address_of(insns: &[Selected], end: u32, index: usize) -> u32 {
    insns.get(index).map_or(end, |s| s.insn.address)
}

fn collect_targets(insns: &[Selected], marks: &[(usize, Mark)], end: u32) -> Targets {
    marks
        .iter()
        .filter_map(|(index, mark)| match mark {
            Mark::Target(t) => Some(((t.src, t.kind), address_of(insns, end, *index))),
            _ => None,
        })
        .collect()
}

fn target(targets: &Targets, branch: ItemId, kind: TargetKind) -> u32 {
    match targets.get(&(branch, kind)) {
        Some(&addr) => addr,
        None => invariant_failed!("branch {} has no target for {:?}", branch, kind),
    }
}

fn relative(from: u32, to: u32) -> i64 {
    i64::from(to) - i64::from(from)
}

/// The narrowest goto that can jump `offset` units. A zero offset needs `goto/32`.
fn goto_for(offset: i64) -> DexOpcode {
    if offset != 0 && i8::try_from(offset).is_ok() {
        DexOpcode::Goto
    } else if offset != 0 && i16::try_from(offset).is_ok() {
        DexOpcode::Goto16
    } else {
        DexOpcode::Goto32
    }
}

/// Places the selected instructions and builds the tables that refer to addresses.
pub(super) fn layout(selection: Selection) -> Result<LoweredCode> {
    let Selection {
        mut insns,
        marks,
        registers_size,
        ins_size,
        outs_size,
        mut stats,
    } = selection;

    let mut end = assign_addresses(&mut insns);
    loop {
        let targets = collect_targets(&insns, &marks, end);
        let mut widened = false;
        for selected in insns.iter_mut() {
            if let Jump::Branch(branch) = selected.jump {
                if selected.insn.opcode.is_goto() {
                    let to = target(&targets, branch, TargetKind::Simple);
                    let needed = goto_for(relative(selected.insn.address, to));
                    if needed.units() > selected.insn.opcode.units() {
                        selected.insn.opcode = needed;
                        widened = true;
                    }
                }
            }
        }
        if !widened {
            break;
        }
        end = assign_addresses(&mut insns);
    }
    stats.widened_gotos = insns
        .iter()
        .filter(|s| matches!(s.insn.opcode, DexOpcode::Goto16 | DexOpcode::Goto32))
        .count() as u32;

    let targets = collect_targets(&insns, &marks, end);
    let mut payloads = Vec::new();
    let mut payload_addr = end + (end & 1);
    for selected in insns.iter_mut() {
        let insn = &mut selected.insn;
        let payload = match &selected.jump {
            Jump::None => continue,
            Jump::Branch(branch) => {
                let offset = relative(insn.address, target(&targets, *branch, TargetKind::Simple));
                insn.offset = if insn.opcode.is_goto() {
                    i32::try_from(offset)
                        .map_err(|_| Error::Lowering(format!("goto offset {offset} out of range")))?
                } else {
                    i16::try_from(offset).map(i32::from).map_err(|_| {
                        Error::Lowering(format!(
                            "{} at {:#x} cannot reach {offset:+} units",
                            insn.opcode, insn.address
                        ))
                    })?
                };
                continue;
            }
            Jump::Switch(branch, keys) => switch_payload(insn, *branch, keys, &targets)?,
            Jump::Array(data) => Payload::ArrayData(data.clone()),
        };
        insn.offset = i32::try_from(relative(insn.address, payload_addr))
            .map_err(|_| Error::Lowering("payload out of range".to_string()))?;
        let size = payload.size();
        payloads.push(PayloadEntry {
            address: payload_addr,
            payload,
        });
        payload_addr += size;
        payload_addr += payload_addr & 1;
    }

    let (tries, handlers) = build_tries(&insns, &marks, end);
    let debug_lines = build_lines(&insns, &marks, end);

    let mut instructions: Vec<DexInstruction> = insns.into_iter().map(|s| s.insn).collect();
    if !payloads.is_empty() && end & 1 == 1 {
        let mut pad = DexInstruction::new(DexOpcode::Nop, Vec::new(), Operand::None);
        pad.address = end;
        instructions.push(pad);
    }

    Ok(LoweredCode {
        registers_size,
        ins_size,
        outs_size,
        instructions,
        payloads,
        tries,
        handlers,
        debug_lines,
        stats,
        interface_body: false,
    })
}

fn switch_payload(insn: &DexInstruction, branch: ItemId, keys: &[i32], targets: &Targets) -> Result<Payload> {
    let fallthrough = insn.address + insn.size();
    let case = |key: i32| -> Result<i32> {
        let to = targets
            .get(&(branch, TargetKind::Case(key)))
            .copied()
            .unwrap_or(fallthrough);
        i32::try_from(relative(insn.address, to))
            .map_err(|_| Error::Lowering(format!("switch case {key} out of range")))
    };
    if insn.opcode == DexOpcode::PackedSwitch {
        let (Some(&first_key), Some(&last_key)) = (keys.first(), keys.last()) else {
            return Ok(Payload::PackedSwitch {
                first_key: 0,
                targets: Vec::new(),
            });
        };
        let targets = (first_key..=last_key).map(case).collect::<Result<Vec<_>>>()?;
        Ok(Payload::PackedSwitch { first_key, targets })
    } else {
        let targets = keys.iter().map(|&k| case(k)).collect::<Result<Vec<_>>>()?;
        Ok(Payload::SparseSwitch {
            keys: keys.to_vec(),
            targets,
        })
    }
}

fn handler_of(head: ItemId, catches: &HashMap<ItemId, (CatchEntry, u32)>) -> CatchHandler {
    let mut handler = CatchHandler::default();
    let mut cursor = Some(head);
    let mut steps = 0;
    while let Some(id) = cursor {
        let Some((entry, addr)) = catches.get(&id) else {
            invariant_failed!("try region names unknown catch {}", id);
        };
        steps += 1;
        invariant!(steps <= catches.len(), "catch chain from {} loops", head);
        match &entry.catch_type {
            Some(ty) => handler.catches.push((ty.clone(), *addr)),
            None => {
                handler.catch_all = Some(*addr);
                break;
            }
        }
        cursor = entry.next;
    }
    handler
}

fn build_tries(insns: &[Selected], marks: &[(usize, Mark)], end: u32) -> (Vec<TryItem>, Vec<CatchHandler>) {
    let catches: HashMap<ItemId, (CatchEntry, u32)> = marks
        .iter()
        .filter_map(|(index, mark)| match mark {
            Mark::Catch(id, entry) => Some((*id, (entry.clone(), address_of(insns, end, *index)))),
            _ => None,
        })
        .collect();

    let mut ranges: Vec<(u32, u32, ItemId)> = Vec::new();
    let mut open: Vec<ItemId> = Vec::new();
    let mut segment_start = 0;
    for (index, mark) in marks {
        let Mark::Try(kind, catch_start) = mark else {
            continue;
        };
        let addr = address_of(insns, end, *index);
        if let Some(&innermost) = open.last() {
            if addr > segment_start {
                ranges.push((segment_start, addr, innermost));
            }
        }
        match kind {
            TryKind::Start => open.push(*catch_start),
            TryKind::End => {
                open.pop();
            }
        }
        segment_start = addr;
    }

    let mut handlers: Vec<CatchHandler> = Vec::new();
    let mut tries: Vec<TryItem> = Vec::new();
    for (start, stop, head) in ranges {
        let handler = handler_of(head, &catches);
        let index = match handlers.iter().position(|h| *h == handler) {
            Some(i) => i,
            None => {
                handlers.push(handler);
                handlers.len() - 1
            }
        };
        match tries.last_mut() {
            Some(last) if last.handler == index && last.start_addr + last.insn_count == start => {
                last.insn_count = stop - last.start_addr;
            }
            _ => tries.push(TryItem {
                start_addr: start,
                insn_count: stop - start,
                handler: index,
            }),
        }
    }
    (tries, handlers)
}

fn build_lines(insns: &[Selected], marks: &[(usize, Mark)], end: u32) -> Vec<LineEntry> {
    let mut lines: Vec<LineEntry> = Vec::new();
    for (index, mark) in marks {
        let Mark::Line(line) = mark else {
            continue;
        };
        let address = address_of(insns, end, *index);
        if address == end {
            continue;
        }
        match lines.last_mut() {
            Some(last) if last.address == address => last.line = *line,
            Some(last) if last.line == *line => {}
            _ => lines.push(LineEntry {
                address,
                line: *line,
            }),
        }
    }
    lines
}

//! Instruction lowering: from the register IR to concrete DEX instructions.
//!
//! The IR has one `move`, one `const` and three-address arithmetic; DEX has several widths
//! of each, two-address forms, literal forms and register ranges. Lowering picks the
//! narrowest encoding that can hold an instruction's registers and literals, then lays
//! the method out in code units.
//!
//! # Stages
//!
//! 1. **Selection** - parameters are relocated to the top registers, every IR instruction
//!    becomes one or more [`DexInstruction`]s. Invokes whose arguments do not fit the
//!    five-nibble form use `/range`, copying into a scratch block when the arguments are not
//!    already contiguous. Literals too wide for `/lit8` or `/lit16` are loaded into a
//!    scratch register first.
//! 2. **Layout** - addresses are assigned, gotos are widened until every offset fits,
//!    switch and array payloads are placed after the code, and try regions, handler lists
//!    and the line table are built.
//!
//! [`lift`] goes the other way, so lowered code can be checked with the IR type checker.
//!
//! # Examples
//!
//! ```rust
//! use dexopt::{ir::{CodeBuilder, IROpcode}, lowering::{lower, DexOpcode}};
//!
//! let mut b = CodeBuilder::new(3);
//! b.load_param(1)
//!     .load_param(2)
//!     .binop(IROpcode::AddInt, 2, 1, 2)
//!     .ret(2);
//! let lowered = lower(&b.build())?;
//! assert_eq!(lowered.instructions()[0].opcode(), DexOpcode::AddInt2Addr);
//! assert_eq!(lowered.stats().to_2addr, 1);
//! # Ok::<(), dexopt::Error>(())
//! ```

mod instruction;
mod layout;
mod lift;
mod opcode;
mod select;

use std::{fmt, ops::AddAssign};

use log::debug;
use rayon::prelude::*;

pub use instruction::{CatchHandler, DexInstruction, LineEntry, Payload, PayloadEntry, TryItem};
pub use lift::lift;
pub use opcode::{DexOpcode, Format, DEX_035, DEX_037, DEX_038, DEX_039};

use crate::{
    compiler::Metrics,
    ir::IRCode,
    model::{ClassHierarchy, DexMethod, Program},
    pool::DexMethodRef,
    Error, Result,
};

/// Counters of the rewrites lowering performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoweringStats {
    /// Binary operations encoded in their `/2addr` form.
    pub to_2addr: u32,
    /// Moves inserted before a `check-cast` whose source and destination differ.
    pub move_for_check_cast: u32,
    /// Moves from the incoming parameter registers.
    pub param_moves: u32,
    /// Invokes and `filled-new-array`s encoded with a register range.
    pub range_invokes: u32,
    /// Gotos that needed `goto/16` or `goto/32`.
    pub widened_gotos: u32,
}

impl LoweringStats {
    /// Adds the counters to `metrics`.
    pub fn report(&self, metrics: &Metrics) {
        metrics.incr("to_2addr", i64::from(self.to_2addr));
        metrics.incr("move_for_check_cast", i64::from(self.move_for_check_cast));
        metrics.incr("param_moves", i64::from(self.param_moves));
        metrics.incr("range_invokes", i64::from(self.range_invokes));
        metrics.incr("widened_gotos", i64::from(self.widened_gotos));
    }
}

impl AddAssign for LoweringStats {
    fn add_assign(&mut self, other: Self) {
        self.to_2addr += other.to_2addr;
        self.move_for_check_cast += other.move_for_check_cast;
        self.param_moves += other.param_moves;
        self.range_invokes += other.range_invokes;
        self.widened_gotos += other.widened_gotos;
    }
}

/// A method body in concrete DEX form.
#[derive(Debug, Clone)]
pub struct LoweredCode {
    registers_size: u32,
    ins_size: u32,
    outs_size: u32,
    instructions: Vec<DexInstruction>,
    payloads: Vec<PayloadEntry>,
    tries: Vec<TryItem>,
    handlers: Vec<CatchHandler>,
    debug_lines: Vec<LineEntry>,
    stats: LoweringStats,
    interface_body: bool,
}

impl LoweredCode {
    /// Registers in the frame, parameters included.
    #[must_use]
    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    /// Parameter words, which occupy the top of the frame.
    #[must_use]
    pub fn ins_size(&self) -> u32 {
        self.ins_size
    }

    /// Largest argument word count of any invoke.
    #[must_use]
    pub fn outs_size(&self) -> u32 {
        self.outs_size
    }

    /// Instructions in address order.
    #[must_use]
    pub fn instructions(&self) -> &[DexInstruction] {
        &self.instructions
    }

    /// Payloads in address order.
    #[must_use]
    pub fn payloads(&self) -> &[PayloadEntry] {
        &self.payloads
    }

    /// The payload at `address`, if one starts there.
    #[must_use]
    pub fn payload_at(&self, address: u32) -> Option<&Payload> {
        self.payloads
            .iter()
            .find(|p| p.address == address)
            .map(|p| &p.payload)
    }

    /// Try items, ascending and non-overlapping.
    #[must_use]
    pub fn tries(&self) -> &[TryItem] {
        &self.tries
    }

    /// Handler lists referenced by [`Self::tries`].
    #[must_use]
    pub fn handlers(&self) -> &[CatchHandler] {
        &self.handlers
    }

    /// Line table.
    #[must_use]
    pub fn debug_lines(&self) -> &[LineEntry] {
        &self.debug_lines
    }

    /// What lowering had to rewrite.
    #[must_use]
    pub fn stats(&self) -> LoweringStats {
        self.stats
    }

    /// Address just past the last instruction.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.instructions.last().map_or(0, |i| i.address + i.size())
    }

    /// Total size in code units, payloads included.
    #[must_use]
    pub fn insns_size(&self) -> u32 {
        self.payloads
            .last()
            .map_or(self.code_size(), |p| p.address + p.payload.size())
    }

    /// `true` for default and static methods of interfaces.
    #[must_use]
    pub fn is_interface_body(&self) -> bool {
        self.interface_body
    }

    /// Oldest DEX version that can hold this body.
    #[must_use]
    pub fn min_dex_version(&self) -> u32 {
        let base = if self.interface_body { DEX_037 } else { DEX_035 };
        self.instructions
            .iter()
            .map(|i| i.opcode.min_dex_version())
            .fold(base, u32::max)
    }
}

impl fmt::Display for LoweredCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "registers={} ins={} outs={}",
            self.registers_size, self.ins_size, self.outs_size
        )?;
        for insn in &self.instructions {
            writeln!(f, "{insn}")?;
        }
        for entry in &self.payloads {
            match &entry.payload {
                Payload::PackedSwitch { first_key, targets } => {
                    writeln!(f, "{:04x}: packed-switch-payload {first_key} {targets:?}", entry.address)?;
                }
                Payload::SparseSwitch { keys, targets } => {
                    writeln!(f, "{:04x}: sparse-switch-payload {keys:?} {targets:?}", entry.address)?;
                }
                Payload::ArrayData(data) => writeln!(
                    f,
                    "{:04x}: array-payload {} x {}b",
                    entry.address,
                    data.len(),
                    data.element_width
                )?,
            }
        }
        for item in &self.tries {
            writeln!(
                f,
                "try {:04x}..{:04x} -> {:?}",
                item.start_addr,
                item.start_addr + item.insn_count,
                self.handlers.get(item.handler)
            )?;
        }
        Ok(())
    }
}

/// Lowers a method body.
///
/// A body whose CFG is built is linearized on a copy first.
///
/// # Errors
///
/// Returns [`Error::Lowering`] if an instruction's registers do not fit any of its
/// encodings, or a conditional branch cannot reach its target.
pub fn lower(code: &IRCode) -> Result<LoweredCode> {
    if code.cfg_built() {
        let mut linear = code.clone();
        linear.clear_cfg();
        return lower(&linear);
    }
    let selection = select::select(code.list(), code.registers_size())?;
    layout::layout(selection)
}

/// Lowers `method`, marking bodies of interface methods for the DEX 037 check.
///
/// # Errors
///
/// Returns [`Error::Lowering`] if the method has no body or cannot be encoded; the message
/// names the method.
pub fn lower_method(method: &DexMethod, hierarchy: &ClassHierarchy) -> Result<LoweredCode> {
    let Some(code) = method.code() else {
        return Err(Error::Lowering(format!("{} has no code", method.show())));
    };
    let mut lowered = lower(code).map_err(|e| match e {
        Error::Lowering(message) => Error::Lowering(format!("{}: {message}", method.show())),
        other => other,
    })?;
    lowered.interface_body =
        hierarchy.is_interface(method.class()) && !method.reference().is_clinit();
    Ok(lowered)
}

/// Every method body of a program in lowered form.
#[derive(Debug, Clone)]
pub struct LoweredProgram {
    /// Lowered bodies, one per method with code.
    pub methods: Vec<(DexMethodRef, LoweredCode)>,
    /// Summed counters.
    pub stats: LoweringStats,
    /// Oldest DEX version that can hold every body.
    pub min_dex_version: u32,
}

/// Lowers every method body of `program` in parallel.
///
/// # Errors
///
/// Returns the first [`Error::Lowering`] encountered.
pub fn lower_program(program: &Program) -> Result<LoweredProgram> {
    let hierarchy = program.hierarchy();
    let methods: Vec<&DexMethod> = program.methods().filter(|m| m.code().is_some()).collect();
    let methods = methods
        .into_par_iter()
        .map(|m| lower_method(m, &hierarchy).map(|code| (m.reference().clone(), code)))
        .collect::<Result<Vec<_>>>()?;

    let mut stats = LoweringStats::default();
    for (_, code) in &methods {
        stats += code.stats();
    }
    let min_dex_version = methods
        .iter()
        .map(|(_, code)| code.min_dex_version())
        .fold(DEX_035, u32::max);
    debug!(
        "lowered {} methods, min dex version {:03}",
        methods.len(),
        min_dex_version
    );
    Ok(LoweredProgram {
        methods,
        stats,
        min_dex_version,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        ir::{ArrayData, CodeBuilder, DexPosition, IRInstruction, IROpcode, Operand},
        model::{AccessFlags, DexClass},
        pool::{DexProto, DexType},
        test::helpers::{class_with_methods, static_method},
        typecheck::IRTypeChecker,
    };

    fn opcodes(lowered: &LoweredCode) -> Vec<DexOpcode> {
        lowered.instructions().iter().map(DexInstruction::opcode).collect()
    }

    fn lowered_body(registers: u32, body: impl FnOnce(&mut CodeBuilder)) -> LoweredCode {
        let mut b = CodeBuilder::new(registers);
        body(&mut b);
        lower(&b.build()).unwrap()
    }

    #[test]
    fn test_two_addr_and_commutative_swap() {
        let lowered = lowered_body(3, |b| {
            b.load_param(1)
                .load_param(2)
                .binop(IROpcode::AddInt, 2, 1, 2)
                .binop(IROpcode::SubInt, 2, 1, 2)
                .binop(IROpcode::SubInt, 1, 1, 2)
                .ret(1);
        });
        assert_eq!(
            opcodes(&lowered),
            vec![
                DexOpcode::AddInt2Addr,
                DexOpcode::SubInt,
                DexOpcode::SubInt2Addr,
                DexOpcode::Return
            ]
        );
        assert_eq!(lowered.instructions()[0].regs(), &[2, 1]);
        assert_eq!(lowered.stats().to_2addr, 2);
        assert_eq!(lowered.registers_size(), 3);
        assert_eq!(lowered.stats().param_moves, 0);
    }

    #[test]
    fn test_check_cast_move() {
        let lowered = lowered_body(2, |b| {
            b.load_param_object(1)
                .check_cast(0, 1, "Ljava/lang/String;")
                .ret_object(0);
        });
        assert_eq!(
            opcodes(&lowered),
            vec![DexOpcode::MoveObject, DexOpcode::CheckCast, DexOpcode::ReturnObject]
        );
        assert_eq!(lowered.instructions()[1].regs(), &[0]);
        assert_eq!(lowered.stats().move_for_check_cast, 1);

        let metrics = Metrics::new();
        lowered.stats().report(&metrics);
        assert_eq!(metrics.get("move_for_check_cast"), 1);
        assert_eq!(metrics.get("to_2addr"), 0);
    }

    #[test]
    fn test_const_widths() {
        let lowered = lowered_body(2, |b| {
            b.const_int(0, 7)
                .const_int(0, -8)
                .const_int(0, 0x1234)
                .const_int(0, 0x10000)
                .const_int(0, 0x12345)
                .const_wide(0, 1)
                .const_wide(0, 100_000)
                .const_wide(0, 1 << 48)
                .const_wide(0, 1 << 40)
                .return_void();
        });
        assert_eq!(
            opcodes(&lowered),
            vec![
                DexOpcode::Const4,
                DexOpcode::Const16,
                DexOpcode::Const16,
                DexOpcode::ConstHigh16,
                DexOpcode::Const,
                DexOpcode::ConstWide16,
                DexOpcode::ConstWide32,
                DexOpcode::ConstWideHigh16,
                DexOpcode::ConstWide,
                DexOpcode::ReturnVoid
            ]
        );
    }

    #[test]
    fn test_literal_forms() {
        let lowered = lowered_body(20, |b| {
            b.add_lit(IROpcode::AddIntLit, 0, 1, 5)
                .add_lit(IROpcode::AddIntLit, 0, 1, 1000)
                .add_lit(IROpcode::RsubIntLit, 0, 1, 1000)
                .add_lit(IROpcode::AddIntLit, 17, 18, 1000)
                .add_lit(IROpcode::ShlIntLit, 0, 1, 200)
                .return_void();
        });
        assert_eq!(
            opcodes(&lowered),
            vec![
                DexOpcode::AddIntLit8,
                DexOpcode::AddIntLit16,
                DexOpcode::RsubInt,
                DexOpcode::Const16,
                DexOpcode::AddInt,
                DexOpcode::Const16,
                DexOpcode::ShlInt,
                DexOpcode::ReturnVoid
            ]
        );
        // The scratch register sits right above the body's registers.
        assert_eq!(lowered.instructions()[3].regs(), &[20]);
        assert_eq!(lowered.instructions()[4].regs(), &[17, 18, 20]);
        assert_eq!(lowered.registers_size(), 21);
    }

    #[test]
    fn test_param_relocation() {
        let lowered = lowered_body(2, |b| {
            b.load_param(0).ret(0);
        });
        assert_eq!(lowered.registers_size(), 3);
        assert_eq!(lowered.ins_size(), 1);
        assert_eq!(lowered.instructions()[0].opcode(), DexOpcode::Move);
        assert_eq!(lowered.instructions()[0].regs(), &[0, 2]);
        assert_eq!(lowered.stats().param_moves, 1);
    }

    #[test]
    fn test_range_invokes() {
        let lowered = lowered_body(20, |b| {
            b.const_int(17, 1)
                .const_int(3, 2)
                .invoke_static("LFoo;.f:(II)V", &[17, 3])
                .invoke_static("LFoo;.f:(II)V", &[16, 17])
                .invoke_static("LFoo;.g:(JI)V", &[0, 2])
                .return_void();
        });
        assert_eq!(
            opcodes(&lowered),
            vec![
                DexOpcode::Const16,
                DexOpcode::Const4,
                DexOpcode::MoveFrom16,
                DexOpcode::MoveFrom16,
                DexOpcode::InvokeStaticRange,
                DexOpcode::InvokeStaticRange,
                DexOpcode::InvokeStatic,
                DexOpcode::ReturnVoid
            ]
        );
        assert_eq!(lowered.instructions()[4].regs(), &[20, 21]);
        assert_eq!(lowered.instructions()[5].regs(), &[16, 17]);
        assert_eq!(lowered.instructions()[6].regs(), &[0, 1, 2]);
        assert_eq!(lowered.stats().range_invokes, 2);
        assert_eq!(lowered.outs_size(), 3);
        assert_eq!(lowered.registers_size(), 22);
    }

    #[test]
    fn test_goto_widening() {
        let lowered = lowered_body(1, |b| {
            let end = b.label();
            b.goto(end);
            for _ in 0..200 {
                b.insn(IRInstruction::new(IROpcode::Nop));
            }
            b.bind(end).return_void();
        });
        let goto = &lowered.instructions()[0];
        assert_eq!(goto.opcode(), DexOpcode::Goto16);
        assert_eq!(goto.offset(), 202);
        assert_eq!(lowered.stats().widened_gotos, 1);

        let spin = lowered_body(1, |b| {
            let top = b.label();
            b.bind(top).goto(top);
        });
        assert_eq!(spin.instructions()[0].opcode(), DexOpcode::Goto32);
        assert_eq!(spin.instructions()[0].offset(), 0);
    }

    #[test]
    fn test_conditional_out_of_range() {
        let mut b = CodeBuilder::new(1);
        let far = b.label();
        b.load_param(0).if_z(IROpcode::IfEqz, 0, far);
        for _ in 0..40_000 {
            b.insn(IRInstruction::new(IROpcode::Nop));
        }
        b.bind(far).return_void();
        assert!(matches!(lower(&b.build()), Err(Error::Lowering(_))));
    }

    #[test]
    fn test_switch_payloads() {
        let packed = lowered_body(1, |b| {
            let (one, two) = (b.label(), b.label());
            b.load_param(0)
                .switch(0, &[(1, one), (2, two), (4, one)])
                .return_void()
                .bind(one)
                .return_void()
                .bind(two)
                .return_void();
        });
        let switch = &packed.instructions()[0];
        assert_eq!(switch.opcode(), DexOpcode::PackedSwitch);
        match packed.payload_at(switch.target()) {
            Some(Payload::PackedSwitch { first_key, targets }) => {
                assert_eq!(*first_key, 1);
                // switch (3) + return-void: key 3 falls through to offset 3.
                assert_eq!(targets, &vec![4, 5, 3, 4]);
            }
            other => panic!("expected a packed payload, got {other:?}"),
        }
        assert_eq!(packed.payloads()[0].address % 2, 0);

        let sparse = lowered_body(1, |b| {
            let (low, high) = (b.label(), b.label());
            b.load_param(0)
                .switch(0, &[(1, low), (1000, high)])
                .return_void()
                .bind(low)
                .return_void()
                .bind(high)
                .return_void();
        });
        assert_eq!(sparse.instructions()[0].opcode(), DexOpcode::SparseSwitch);
        assert!(matches!(
            sparse.payload_at(sparse.instructions()[0].target()),
            Some(Payload::SparseSwitch { keys, .. }) if keys == &vec![1, 1000]
        ));
    }

    #[test]
    fn test_array_payload_alignment() {
        let data = Arc::new(ArrayData {
            element_width: 4,
            data: vec![0; 12],
        });
        let lowered = lowered_body(2, |b| {
            b.const_int(1, 3)
                .new_array(0, 1, "[I")
                .insn(
                    IRInstruction::new(IROpcode::FillArrayData)
                        .with_srcs(&[0])
                        .with_operand(Operand::Data(data.clone())),
                )
                .return_void();
        });
        // const/4 + new-array + fill-array-data + return-void end at 7; one nop pads.
        assert_eq!(lowered.code_size(), 8);
        assert_eq!(lowered.instructions().last().map(DexInstruction::opcode), Some(DexOpcode::Nop));
        assert_eq!(lowered.payloads()[0].address, 8);
        assert_eq!(lowered.instructions()[2].offset(), 5);
        assert_eq!(lowered.insns_size(), 18);
    }

    #[test]
    fn test_tries_and_lines() {
        let method = DexMethodRef::parse("LFoo;.run:()V").unwrap();
        let lowered = lowered_body(1, |b| {
            let handler = b.catch_label();
            b.position(DexPosition::new(Some(method.clone()), None, 10))
                .try_start(handler)
                .invoke_static("LFoo;.f:()V", &[])
                .try_end(handler)
                .position(DexPosition::new(Some(method.clone()), None, 11))
                .return_void()
                .bind_catch(handler, Some(DexType::throwable()))
                .move_exception(0)
                .throw(0);
        });
        assert_eq!(
            lowered.tries(),
            &[TryItem {
                start_addr: 0,
                insn_count: 3,
                handler: 0
            }]
        );
        assert_eq!(lowered.handlers()[0].catches, vec![(DexType::throwable(), 4)]);
        assert_eq!(lowered.handlers()[0].catch_all, None);
        assert_eq!(
            lowered.debug_lines(),
            &[
                LineEntry { address: 0, line: 10 },
                LineEntry { address: 3, line: 11 }
            ]
        );
    }

    #[test]
    fn test_min_dex_version() {
        let plain = lowered_body(1, |b| {
            b.return_void();
        });
        assert_eq!(plain.min_dex_version(), DEX_035);

        let custom = lowered_body(1, |b| {
            b.invoke(IROpcode::InvokeCustom, "LFoo;.site:()V", &[]).return_void();
        });
        assert_eq!(custom.min_dex_version(), DEX_038);

        let proto = DexProto::make(DexType::void(), Vec::new());
        let method_type = lowered_body(1, |b| {
            b.insn(IRInstruction::new(IROpcode::ConstMethodType).with_operand(Operand::Proto(proto)))
                .insn(IRInstruction::new(IROpcode::MoveResultPseudoObject).with_dest(0))
                .return_void();
        });
        assert_eq!(method_type.min_dex_version(), DEX_039);

        let default_method = static_method("LIface;.helper:()V", 1, |b| {
            b.return_void();
        });
        let mut iface = DexClass::new(
            DexType::make("LIface;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
        );
        iface.add_method(default_method);
        let program = Program::from_classes(vec![iface, class_with_methods("LOther;", Vec::new())]);
        let lowered = lower_program(&program).unwrap();
        assert_eq!(lowered.min_dex_version, DEX_037);
        assert_eq!(lowered.methods.len(), 1);
    }

    #[test]
    fn test_lift_preserves_type_check_verdict() {
        let good = static_method("LFoo;.mix:(IJ)J", 6, |b| {
            b.load_param(0)
                .load_param_wide(1)
                .unop(IROpcode::IntToLong, 3, 0)
                .binop(IROpcode::AddLong, 3, 3, 1)
                .ret_wide(3);
        });
        let bad = static_method("LFoo;.broken:()J", 2, |b| {
            b.const_int(0, 1).ret_wide(0);
        });
        for method in [good, bad] {
            let before = IRTypeChecker::new(&method).check().is_ok();
            let lowered = lower(method.code().unwrap()).unwrap();
            let lifted = lift(&lowered, method.reference(), true).unwrap();
            let relifted = DexMethod::new(method.reference().clone(), method.access()).with_code(lifted);
            let after = IRTypeChecker::new(&relifted).check().is_ok();
            assert_eq!(before, after, "{}", lowered);
        }
    }
}

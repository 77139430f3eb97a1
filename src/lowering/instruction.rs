//! Lowered instructions, payloads and exception tables.

use std::{fmt, sync::Arc};

use crate::{
    ir::{ArrayData, Operand, Reg},
    lowering::{DexOpcode, Format},
    pool::DexType,
};

/// A concrete DEX instruction at a fixed code-unit address.
///
/// Registers are listed in encoding slot order. Range forms list every register of the
/// range, so `regs` always names everything the instruction reads or writes. Branches and
/// payload instructions carry their offset relative to `address`.
#[derive(Debug, Clone, PartialEq)]
pub struct DexInstruction {
    pub(crate) address: u32,
    pub(crate) opcode: DexOpcode,
    pub(crate) regs: Vec<Reg>,
    pub(crate) operand: Operand,
    pub(crate) offset: i32,
}

impl DexInstruction {
    pub(crate) fn new(opcode: DexOpcode, regs: Vec<Reg>, operand: Operand) -> Self {
        Self {
            address: 0,
            opcode,
            regs,
            operand,
            offset: 0,
        }
    }

    /// Address in code units from the start of the method.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// The opcode.
    #[must_use]
    pub fn opcode(&self) -> DexOpcode {
        self.opcode
    }

    /// Registers in slot order.
    #[must_use]
    pub fn regs(&self) -> &[Reg] {
        &self.regs
    }

    /// Literal or reference operand.
    #[must_use]
    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// Branch or payload offset in code units, relative to this instruction.
    #[must_use]
    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Absolute address the offset points at.
    #[must_use]
    pub fn target(&self) -> u32 {
        self.address.wrapping_add_signed(self.offset)
    }

    /// Size in code units.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.opcode.units()
    }
}

impl fmt::Display for DexInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: {}", self.address, self.opcode)?;
        let mut sep = " ";
        if self.opcode.is_range() && !self.regs.is_empty() {
            let first = self.regs[0];
            let last = first + self.regs.len() as u32 - 1;
            write!(f, " {{v{first} .. v{last}}}")?;
            sep = ", ";
        } else if matches!(self.opcode.format(), Format::F35c | Format::F45cc) {
            let regs: Vec<String> = self.regs.iter().map(|r| format!("v{r}")).collect();
            write!(f, " {{{}}}", regs.join(", "))?;
            sep = ", ";
        } else {
            for r in &self.regs {
                write!(f, "{sep}v{r}")?;
                sep = ", ";
            }
        }
        if self.opcode.is_branch() || self.opcode.has_payload() {
            return write!(f, "{sep}{:+}", self.offset);
        }
        match &self.operand {
            Operand::None | Operand::Data(_) => Ok(()),
            Operand::Literal(v) => write!(f, "{sep}{v:#x}"),
            Operand::String(s) => write!(f, "{sep}{:?}", s.as_str()),
            Operand::Type(t) => write!(f, "{sep}{t}"),
            Operand::Field(fr) => write!(f, "{sep}{fr}"),
            Operand::Method(m) => write!(f, "{sep}{m}"),
            Operand::Proto(p) => write!(f, "{sep}{p}"),
        }
    }
}

/// Out-of-line data referenced by `packed-switch`, `sparse-switch` and
/// `fill-array-data`. Switch targets are relative to the switch instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Consecutive keys starting at `first_key`.
    PackedSwitch {
        /// Key of the first target.
        first_key: i32,
        /// One relative target per key.
        targets: Vec<i32>,
    },
    /// Sorted keys, each with its own target.
    SparseSwitch {
        /// Ascending keys.
        keys: Vec<i32>,
        /// One relative target per key.
        targets: Vec<i32>,
    },
    /// Array elements.
    ArrayData(Arc<ArrayData>),
}

impl Payload {
    /// Size in code units, including the identifying header.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Payload::PackedSwitch { targets, .. } => 4 + 2 * targets.len() as u32,
            Payload::SparseSwitch { keys, .. } => 2 + 4 * keys.len() as u32,
            Payload::ArrayData(data) => {
                let bytes = data.len() as u32 * u32::from(data.element_width);
                4 + bytes.div_ceil(2)
            }
        }
    }

    /// `(key, relative target)` pairs of a switch payload.
    #[must_use]
    pub fn cases(&self) -> Vec<(i32, i32)> {
        match self {
            Payload::PackedSwitch { first_key, targets } => targets
                .iter()
                .enumerate()
                .map(|(i, &t)| (first_key.wrapping_add(i as i32), t))
                .collect(),
            Payload::SparseSwitch { keys, targets } => {
                keys.iter().copied().zip(targets.iter().copied()).collect()
            }
            Payload::ArrayData(_) => Vec::new(),
        }
    }
}

/// A payload placed after the instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadEntry {
    /// Address of the payload; always even.
    pub address: u32,
    /// The data.
    pub payload: Payload,
}

/// A covered address range and the handler list guarding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem {
    /// First covered code unit.
    pub start_addr: u32,
    /// Number of covered code units.
    pub insn_count: u32,
    /// Index into [`LoweredCode::handlers`](crate::lowering::LoweredCode::handlers).
    pub handler: usize,
}

/// The typed handlers of a try item, tried in order, plus an optional catch-all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CatchHandler {
    /// `(exception type, handler address)` in order.
    pub catches: Vec<(DexType, u32)>,
    /// Handler address for everything else.
    pub catch_all: Option<u32>,
}

/// Start of a new source line in the debug line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// First code unit of the line.
    pub address: u32,
    /// Source line.
    pub line: u32,
}

//! Register-based IR instructions.

use std::{fmt, sync::Arc};

use crate::{
    ir::{IROpcode, OperandKind},
    pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType},
};

/// A virtual register number.
pub type Reg = u32;

/// Raw payload of a `fill-array-data` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayData {
    /// Width of one element in bytes (1, 2, 4 or 8).
    pub element_width: u16,
    /// Little-endian element bytes.
    pub data: Vec<u8>,
}

impl ArrayData {
    /// Number of elements in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / usize::from(self.element_width.max(1))
    }

    /// `true` when the payload has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The non-register operand of an instruction.
///
/// Branch offsets are not operands: a branch's destinations are the `Target` items that
/// point back at it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Operand {
    /// No operand.
    #[default]
    None,
    /// Literal value of `const*` and the `/lit` arithmetic forms.
    Literal(i64),
    /// String reference.
    String(DexString),
    /// Type reference.
    Type(DexType),
    /// Field reference.
    Field(DexFieldRef),
    /// Method reference.
    Method(DexMethodRef),
    /// Proto reference.
    Proto(DexProto),
    /// Array payload.
    Data(Arc<ArrayData>),
}

impl Operand {
    /// The operand kind, for validation against [`IROpcode::operand_kind`].
    #[must_use]
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Literal(_) => OperandKind::Literal,
            Operand::String(_) => OperandKind::String,
            Operand::Type(_) => OperandKind::Type,
            Operand::Field(_) => OperandKind::Field,
            Operand::Method(_) => OperandKind::Method,
            Operand::Proto(_) => OperandKind::Proto,
            Operand::Data(_) => OperandKind::Data,
        }
    }
}

/// An IR instruction: opcode, optional destination, ordered sources, and one operand.
///
/// Wide values name their low register; the high half is implicitly `reg + 1`. Invoke
/// sources list one register per declared argument (plus the receiver), so a `long`
/// argument occupies a single source slot.
#[derive(Debug, Clone, PartialEq)]
pub struct IRInstruction {
    opcode: IROpcode,
    dest: Option<Reg>,
    srcs: Vec<Reg>,
    operand: Operand,
}

impl IRInstruction {
    /// Creates an instruction with no registers and no operand.
    #[must_use]
    pub fn new(opcode: IROpcode) -> Self {
        Self {
            opcode,
            dest: None,
            srcs: Vec::new(),
            operand: Operand::None,
        }
    }

    /// Builder-style destination setter.
    #[must_use]
    pub fn with_dest(mut self, dest: Reg) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Builder-style sources setter.
    #[must_use]
    pub fn with_srcs(mut self, srcs: &[Reg]) -> Self {
        self.srcs = srcs.to_vec();
        self
    }

    /// Builder-style operand setter.
    #[must_use]
    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operand = operand;
        self
    }

    /// Builder-style literal setter.
    #[must_use]
    pub fn with_literal(self, value: i64) -> Self {
        self.with_operand(Operand::Literal(value))
    }

    /// The opcode.
    #[must_use]
    pub fn opcode(&self) -> IROpcode {
        self.opcode
    }

    /// Replaces the opcode, keeping registers and operand.
    pub fn set_opcode(&mut self, opcode: IROpcode) {
        self.opcode = opcode;
    }

    /// The destination register, if any.
    #[must_use]
    pub fn dest(&self) -> Option<Reg> {
        self.dest
    }

    /// `true` if the instruction writes a register.
    #[must_use]
    pub fn has_dest(&self) -> bool {
        self.dest.is_some()
    }

    /// Sets the destination register.
    pub fn set_dest(&mut self, dest: Reg) {
        self.dest = Some(dest);
    }

    /// The source registers.
    #[must_use]
    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    /// Source `index`.
    ///
    /// # Panics
    ///
    /// Panics if the instruction has fewer sources.
    #[must_use]
    pub fn src(&self, index: usize) -> Reg {
        self.srcs[index]
    }

    /// Replaces source `index`.
    pub fn set_src(&mut self, index: usize, reg: Reg) {
        self.srcs[index] = reg;
    }

    /// Replaces all sources.
    pub fn set_srcs(&mut self, srcs: Vec<Reg>) {
        self.srcs = srcs;
    }

    /// The operand.
    #[must_use]
    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// Replaces the operand.
    pub fn set_operand(&mut self, operand: Operand) {
        self.operand = operand;
    }

    /// The literal operand, if any.
    #[must_use]
    pub fn literal(&self) -> Option<i64> {
        match self.operand {
            Operand::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// The string operand, if any.
    #[must_use]
    pub fn string(&self) -> Option<&DexString> {
        match &self.operand {
            Operand::String(s) => Some(s),
            _ => None,
        }
    }

    /// The type operand, if any.
    #[must_use]
    pub fn type_ref(&self) -> Option<&DexType> {
        match &self.operand {
            Operand::Type(t) => Some(t),
            _ => None,
        }
    }

    /// The field operand, if any.
    #[must_use]
    pub fn field(&self) -> Option<&DexFieldRef> {
        match &self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    /// The method operand, if any.
    #[must_use]
    pub fn method(&self) -> Option<&DexMethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    /// The proto operand, if any.
    #[must_use]
    pub fn proto(&self) -> Option<&DexProto> {
        match &self.operand {
            Operand::Proto(p) => Some(p),
            _ => None,
        }
    }

    /// The array payload, if any.
    #[must_use]
    pub fn data(&self) -> Option<&ArrayData> {
        match &self.operand {
            Operand::Data(d) => Some(d),
            _ => None,
        }
    }

    /// `true` if the destination is a register pair.
    #[must_use]
    pub fn dest_is_wide(&self) -> bool {
        self.opcode.dest_is_wide()
    }

    /// `true` if source `index` is a register pair.
    #[must_use]
    pub fn src_is_wide(&self, index: usize) -> bool {
        if self.opcode.is_invoke() {
            return self.invoke_arg_type(index).is_some_and(|t| t.is_wide());
        }
        self.opcode.src_is_wide(index)
    }

    /// For invokes: the declared type of source `index` (the receiver maps to the method's
    /// class).
    #[must_use]
    pub fn invoke_arg_type(&self, index: usize) -> Option<DexType> {
        let method = self.method()?;
        if self.opcode == IROpcode::InvokeStatic || self.opcode == IROpcode::InvokeCustom {
            return method.proto().args().get(index).cloned();
        }
        if index == 0 {
            return Some(method.class().clone());
        }
        method.proto().args().get(index - 1).cloned()
    }

    /// Every register read, including the high halves of wide sources.
    #[must_use]
    pub fn reg_uses(&self) -> Vec<Reg> {
        let mut out = Vec::with_capacity(self.srcs.len() + 1);
        for (i, &r) in self.srcs.iter().enumerate() {
            out.push(r);
            if self.src_is_wide(i) {
                out.push(r + 1);
            }
        }
        out
    }

    /// Every register written, including the high half of a wide destination.
    #[must_use]
    pub fn reg_defs(&self) -> Vec<Reg> {
        match self.dest {
            Some(d) if self.dest_is_wide() => vec![d, d + 1],
            Some(d) => vec![d],
            None => Vec::new(),
        }
    }

    /// `true` if the instruction may raise an exception.
    #[must_use]
    pub fn may_throw(&self) -> bool {
        self.opcode.may_throw()
    }

    /// Largest register referenced (counting wide high halves), plus one.
    #[must_use]
    pub fn registers_needed(&self) -> u32 {
        self.reg_uses()
            .into_iter()
            .chain(self.reg_defs())
            .map(|r| r + 1)
            .max()
            .unwrap_or(0)
    }

    /// Renames every register through `map`.
    pub fn remap_registers(&mut self, mut map: impl FnMut(Reg) -> Reg) {
        if let Some(d) = self.dest {
            self.dest = Some(map(d));
        }
        for s in &mut self.srcs {
            *s = map(*s);
        }
    }
}

impl fmt::Display for IRInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        let mut sep = " ";
        if let Some(d) = self.dest {
            write!(f, "{sep}v{d}")?;
            sep = ", ";
        }
        for s in &self.srcs {
            write!(f, "{sep}v{s}")?;
            sep = ", ";
        }
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Literal(v) => write!(f, "{sep}{v}"),
            Operand::String(s) => write!(f, "{sep}{:?}", s.as_str()),
            Operand::Type(t) => write!(f, "{sep}{t}"),
            Operand::Field(fr) => write!(f, "{sep}{fr}"),
            Operand::Method(m) => write!(f, "{sep}{m}"),
            Operand::Proto(p) => write!(f, "{sep}{p}"),
            Operand::Data(d) => write!(f, "{sep}<{} x {}b>", d.len(), d.element_width),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let insn = IRInstruction::new(IROpcode::AddIntLit)
            .with_dest(1)
            .with_srcs(&[0])
            .with_literal(5);
        assert_eq!(insn.to_string(), "add-int/lit v1, v0, 5");
        let s = IRInstruction::new(IROpcode::ConstString)
            .with_operand(Operand::String(DexString::make("hi")));
        assert_eq!(s.to_string(), "const-string \"hi\"");
    }

    #[test]
    fn test_invoke_wide_args() {
        let m = DexMethodRef::parse("LFoo;.bar:(JI)V").unwrap();
        let insn = IRInstruction::new(IROpcode::InvokeVirtual)
            .with_srcs(&[0, 1, 3])
            .with_operand(Operand::Method(m));
        assert!(!insn.src_is_wide(0));
        assert!(insn.src_is_wide(1));
        assert!(!insn.src_is_wide(2));
        assert_eq!(insn.reg_uses(), vec![0, 1, 2, 3]);
        assert_eq!(insn.registers_needed(), 4);
    }

    #[test]
    fn test_static_invoke_arg_types() {
        let m = DexMethodRef::parse("LFoo;.bar:(D)V").unwrap();
        let insn = IRInstruction::new(IROpcode::InvokeStatic)
            .with_srcs(&[4])
            .with_operand(Operand::Method(m));
        assert!(insn.src_is_wide(0));
        assert_eq!(insn.reg_uses(), vec![4, 5]);
    }

    #[test]
    fn test_wide_defs() {
        let insn = IRInstruction::new(IROpcode::ConstWide)
            .with_dest(2)
            .with_literal(1);
        assert_eq!(insn.reg_defs(), vec![2, 3]);
    }
}

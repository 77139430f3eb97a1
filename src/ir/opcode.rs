//! The abstract IR opcode set.
//!
//! IR opcodes abstract over the concrete DEX encodings: there is one `move`, one `const`, one
//! `add-int/lit` and one `switch`, and lowering picks the narrowest concrete form. Binary
//! operations are always three-address. A handful of pseudo-opcodes exist only in the IR:
//! `load-param*` binds parameters at method entry, and `move-result-pseudo*` carries the
//! result of instructions whose DEX form writes a destination register directly.

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Numeric kind of an arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumKind {
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
}

impl NumKind {
    /// `true` for `Long` and `Double`.
    #[must_use]
    pub const fn is_wide(self) -> bool {
        matches!(self, NumKind::Long | NumKind::Double)
    }
}

/// The kind of operand an opcode carries beside its registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Registers only
    None,
    /// 64-bit literal
    Literal,
    /// String reference
    String,
    /// Type reference
    Type,
    /// Field reference
    Field,
    /// Method reference
    Method,
    /// Proto reference
    Proto,
    /// Array payload
    Data,
}

/// Abstract IR opcodes.
#[allow(missing_docs)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum IROpcode {
    Nop,
    Move,
    MoveWide,
    MoveObject,
    MoveResult,
    MoveResultWide,
    MoveResultObject,
    MoveException,
    ReturnVoid,
    Return,
    ReturnWide,
    ReturnObject,
    Const,
    ConstWide,
    ConstString,
    ConstClass,
    ConstMethodHandle,
    ConstMethodType,
    MonitorEnter,
    MonitorExit,
    CheckCast,
    InstanceOf,
    ArrayLength,
    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,
    Throw,
    Goto,
    Switch,
    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,
    Aget,
    AgetWide,
    AgetObject,
    AgetBoolean,
    AgetByte,
    AgetChar,
    AgetShort,
    Aput,
    AputWide,
    AputObject,
    AputBoolean,
    AputByte,
    AputChar,
    AputShort,
    Iget,
    IgetWide,
    IgetObject,
    IgetBoolean,
    IgetByte,
    IgetChar,
    IgetShort,
    Iput,
    IputWide,
    IputObject,
    IputBoolean,
    IputByte,
    IputChar,
    IputShort,
    Sget,
    SgetWide,
    SgetObject,
    SgetBoolean,
    SgetByte,
    SgetChar,
    SgetShort,
    Sput,
    SputWide,
    SputObject,
    SputBoolean,
    SputByte,
    SputChar,
    SputShort,
    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,
    InvokePolymorphic,
    InvokeCustom,
    NegInt,
    NotInt,
    NegLong,
    NotLong,
    NegFloat,
    NegDouble,
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    RemInt,
    AndInt,
    OrInt,
    XorInt,
    ShlInt,
    ShrInt,
    UshrInt,
    AddLong,
    SubLong,
    MulLong,
    DivLong,
    RemLong,
    AndLong,
    OrLong,
    XorLong,
    ShlLong,
    ShrLong,
    UshrLong,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,
    #[strum(serialize = "add-int/lit")]
    AddIntLit,
    #[strum(serialize = "rsub-int/lit")]
    RsubIntLit,
    #[strum(serialize = "mul-int/lit")]
    MulIntLit,
    #[strum(serialize = "div-int/lit")]
    DivIntLit,
    #[strum(serialize = "rem-int/lit")]
    RemIntLit,
    #[strum(serialize = "and-int/lit")]
    AndIntLit,
    #[strum(serialize = "or-int/lit")]
    OrIntLit,
    #[strum(serialize = "xor-int/lit")]
    XorIntLit,
    #[strum(serialize = "shl-int/lit")]
    ShlIntLit,
    #[strum(serialize = "shr-int/lit")]
    ShrIntLit,
    #[strum(serialize = "ushr-int/lit")]
    UshrIntLit,
    LoadParam,
    LoadParamWide,
    LoadParamObject,
    MoveResultPseudo,
    MoveResultPseudoWide,
    MoveResultPseudoObject,
}

use IROpcode as Op;

impl IROpcode {
    /// Conditional branches (`if-*`).
    #[must_use]
    pub const fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Op::IfEq
                | Op::IfNe
                | Op::IfLt
                | Op::IfGe
                | Op::IfGt
                | Op::IfLe
                | Op::IfEqz
                | Op::IfNez
                | Op::IfLtz
                | Op::IfGez
                | Op::IfGtz
                | Op::IfLez
        )
    }

    /// `if-*z`, comparing one register against zero.
    #[must_use]
    pub const fn is_testz(self) -> bool {
        matches!(
            self,
            Op::IfEqz | Op::IfNez | Op::IfLtz | Op::IfGez | Op::IfGtz | Op::IfLez
        )
    }

    /// Any instruction that transfers control to a branch target.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        self.is_conditional_branch() || matches!(self, Op::Goto | Op::Switch)
    }

    /// `return*`
    #[must_use]
    pub const fn is_return(self) -> bool {
        matches!(
            self,
            Op::ReturnVoid | Op::Return | Op::ReturnWide | Op::ReturnObject
        )
    }

    /// Instructions after which control never falls through.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.is_return() || matches!(self, Op::Throw | Op::Goto)
    }

    /// Instructions that end a basic block unconditionally.
    #[must_use]
    pub const fn ends_block(self) -> bool {
        self.is_branch() || self.is_return() || matches!(self, Op::Throw)
    }

    /// `invoke-*`
    #[must_use]
    pub const fn is_invoke(self) -> bool {
        matches!(
            self,
            Op::InvokeVirtual
                | Op::InvokeSuper
                | Op::InvokeDirect
                | Op::InvokeStatic
                | Op::InvokeInterface
                | Op::InvokePolymorphic
                | Op::InvokeCustom
        )
    }

    /// `load-param*`
    #[must_use]
    pub const fn is_load_param(self) -> bool {
        matches!(self, Op::LoadParam | Op::LoadParamWide | Op::LoadParamObject)
    }

    /// `move-result-pseudo*`
    #[must_use]
    pub const fn is_move_result_pseudo(self) -> bool {
        matches!(
            self,
            Op::MoveResultPseudo | Op::MoveResultPseudoWide | Op::MoveResultPseudoObject
        )
    }

    /// `move-result*` (not the pseudo forms)
    #[must_use]
    pub const fn is_move_result(self) -> bool {
        matches!(self, Op::MoveResult | Op::MoveResultWide | Op::MoveResultObject)
    }

    /// Either kind of result move.
    #[must_use]
    pub const fn is_move_result_any(self) -> bool {
        self.is_move_result() || self.is_move_result_pseudo()
    }

    /// `move`, `move-wide`, `move-object`
    #[must_use]
    pub const fn is_move(self) -> bool {
        matches!(self, Op::Move | Op::MoveWide | Op::MoveObject)
    }

    /// Instructions whose result is delivered through a following `move-result-pseudo*`.
    #[must_use]
    pub const fn has_move_result_pseudo(self) -> bool {
        matches!(
            self,
            Op::ConstString
                | Op::ConstClass
                | Op::ConstMethodHandle
                | Op::ConstMethodType
                | Op::CheckCast
                | Op::InstanceOf
                | Op::ArrayLength
                | Op::NewInstance
                | Op::NewArray
        ) || self.is_aget()
            || self.is_iget()
            || self.is_sget()
    }

    /// Instructions that may be followed by a `move-result*`.
    #[must_use]
    pub const fn has_move_result(self) -> bool {
        self.is_invoke() || matches!(self, Op::FilledNewArray)
    }

    /// Instructions that can raise an exception.
    #[must_use]
    pub const fn may_throw(self) -> bool {
        self.is_invoke()
            || self.is_aget()
            || self.is_aput()
            || self.is_iget()
            || self.is_iput()
            || self.is_sget()
            || self.is_sput()
            || matches!(
                self,
                Op::ConstClass
                    | Op::ConstMethodHandle
                    | Op::ConstMethodType
                    | Op::MonitorEnter
                    | Op::MonitorExit
                    | Op::CheckCast
                    | Op::ArrayLength
                    | Op::NewInstance
                    | Op::NewArray
                    | Op::FilledNewArray
                    | Op::FillArrayData
                    | Op::Throw
                    | Op::DivInt
                    | Op::RemInt
                    | Op::DivLong
                    | Op::RemLong
                    | Op::DivIntLit
                    | Op::RemIntLit
            )
    }

    /// `aget*`
    #[must_use]
    pub const fn is_aget(self) -> bool {
        matches!(
            self,
            Op::Aget
                | Op::AgetWide
                | Op::AgetObject
                | Op::AgetBoolean
                | Op::AgetByte
                | Op::AgetChar
                | Op::AgetShort
        )
    }

    /// `aput*`
    #[must_use]
    pub const fn is_aput(self) -> bool {
        matches!(
            self,
            Op::Aput
                | Op::AputWide
                | Op::AputObject
                | Op::AputBoolean
                | Op::AputByte
                | Op::AputChar
                | Op::AputShort
        )
    }

    /// `iget*`
    #[must_use]
    pub const fn is_iget(self) -> bool {
        matches!(
            self,
            Op::Iget
                | Op::IgetWide
                | Op::IgetObject
                | Op::IgetBoolean
                | Op::IgetByte
                | Op::IgetChar
                | Op::IgetShort
        )
    }

    /// `iput*`
    #[must_use]
    pub const fn is_iput(self) -> bool {
        matches!(
            self,
            Op::Iput
                | Op::IputWide
                | Op::IputObject
                | Op::IputBoolean
                | Op::IputByte
                | Op::IputChar
                | Op::IputShort
        )
    }

    /// `sget*`
    #[must_use]
    pub const fn is_sget(self) -> bool {
        matches!(
            self,
            Op::Sget
                | Op::SgetWide
                | Op::SgetObject
                | Op::SgetBoolean
                | Op::SgetByte
                | Op::SgetChar
                | Op::SgetShort
        )
    }

    /// `sput*`
    #[must_use]
    pub const fn is_sput(self) -> bool {
        matches!(
            self,
            Op::Sput
                | Op::SputWide
                | Op::SputObject
                | Op::SputBoolean
                | Op::SputByte
                | Op::SputChar
                | Op::SputShort
        )
    }

    /// Field loads and stores.
    #[must_use]
    pub const fn is_field_op(self) -> bool {
        self.is_iget() || self.is_iput() || self.is_sget() || self.is_sput()
    }

    /// The `/lit` arithmetic forms.
    #[must_use]
    pub const fn is_literal_op(self) -> bool {
        matches!(
            self,
            Op::AddIntLit
                | Op::RsubIntLit
                | Op::MulIntLit
                | Op::DivIntLit
                | Op::RemIntLit
                | Op::AndIntLit
                | Op::OrIntLit
                | Op::XorIntLit
                | Op::ShlIntLit
                | Op::ShrIntLit
                | Op::UshrIntLit
        )
    }

    /// Three-address binary operations on registers.
    #[must_use]
    pub fn is_binop(self) -> bool {
        (Op::AddInt..=Op::RemDouble).contains(&self)
    }

    /// One-source arithmetic and conversions.
    #[must_use]
    pub fn is_unop(self) -> bool {
        (Op::NegInt..=Op::IntToShort).contains(&self)
    }

    /// Binary operations whose operands may be swapped.
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Op::AddInt
                | Op::MulInt
                | Op::AndInt
                | Op::OrInt
                | Op::XorInt
                | Op::AddLong
                | Op::MulLong
                | Op::AndLong
                | Op::OrLong
                | Op::XorLong
                | Op::AddFloat
                | Op::MulFloat
                | Op::AddDouble
                | Op::MulDouble
        )
    }

    /// Shift operations; their shift amount is always an int.
    #[must_use]
    pub const fn is_shift(self) -> bool {
        matches!(
            self,
            Op::ShlInt
                | Op::ShrInt
                | Op::UshrInt
                | Op::ShlLong
                | Op::ShrLong
                | Op::UshrLong
                | Op::ShlIntLit
                | Op::ShrIntLit
                | Op::UshrIntLit
        )
    }

    /// The numeric kind operated on by binary operations and literal operations.
    #[must_use]
    pub fn num_kind(self) -> Option<NumKind> {
        if self.is_literal_op() {
            return Some(NumKind::Int);
        }
        if !self.is_binop() {
            return None;
        }
        Some(if self <= Op::UshrInt {
            NumKind::Int
        } else if self <= Op::UshrLong {
            NumKind::Long
        } else if self <= Op::RemFloat {
            NumKind::Float
        } else {
            NumKind::Double
        })
    }

    /// For unary operations and conversions: (source kind, result kind).
    #[must_use]
    pub const fn unop_kinds(self) -> Option<(NumKind, NumKind)> {
        use NumKind::{Double, Float, Int, Long};
        Some(match self {
            Op::NegInt | Op::NotInt | Op::IntToByte | Op::IntToChar | Op::IntToShort => (Int, Int),
            Op::NegLong | Op::NotLong => (Long, Long),
            Op::NegFloat => (Float, Float),
            Op::NegDouble => (Double, Double),
            Op::IntToLong => (Int, Long),
            Op::IntToFloat => (Int, Float),
            Op::IntToDouble => (Int, Double),
            Op::LongToInt => (Long, Int),
            Op::LongToFloat => (Long, Float),
            Op::LongToDouble => (Long, Double),
            Op::FloatToInt => (Float, Int),
            Op::FloatToLong => (Float, Long),
            Op::FloatToDouble => (Float, Double),
            Op::DoubleToInt => (Double, Int),
            Op::DoubleToLong => (Double, Long),
            Op::DoubleToFloat => (Double, Float),
            _ => return None,
        })
    }

    /// For comparisons: the kind of both operands.
    #[must_use]
    pub const fn cmp_kind(self) -> Option<NumKind> {
        match self {
            Op::CmplFloat | Op::CmpgFloat => Some(NumKind::Float),
            Op::CmplDouble | Op::CmpgDouble => Some(NumKind::Double),
            Op::CmpLong => Some(NumKind::Long),
            _ => None,
        }
    }

    /// The non-register operand carried by this opcode.
    #[must_use]
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Op::Const | Op::ConstWide => OperandKind::Literal,
            op if op.is_literal_op() => OperandKind::Literal,
            Op::ConstString => OperandKind::String,
            Op::ConstClass
            | Op::CheckCast
            | Op::InstanceOf
            | Op::NewInstance
            | Op::NewArray
            | Op::FilledNewArray => OperandKind::Type,
            op if op.is_field_op() => OperandKind::Field,
            op if op.is_invoke() => OperandKind::Method,
            Op::ConstMethodHandle => OperandKind::Method,
            Op::ConstMethodType => OperandKind::Proto,
            Op::FillArrayData => OperandKind::Data,
            _ => OperandKind::None,
        }
    }

    /// `true` if this opcode writes a register pair.
    #[must_use]
    pub fn dest_is_wide(self) -> bool {
        match self {
            Op::MoveWide
            | Op::MoveResultWide
            | Op::ConstWide
            | Op::LoadParamWide
            | Op::MoveResultPseudoWide => true,
            op if op.num_kind().is_some() => op.num_kind().is_some_and(NumKind::is_wide),
            op => op.unop_kinds().is_some_and(|(_, r)| r.is_wide()),
        }
    }

    /// `true` if this opcode writes an object reference.
    #[must_use]
    pub const fn dest_is_object(self) -> bool {
        matches!(
            self,
            Op::MoveObject
                | Op::MoveResultObject
                | Op::MoveResultPseudoObject
                | Op::MoveException
                | Op::LoadParamObject
        )
    }

    /// `true` if this opcode writes a destination register directly.
    #[must_use]
    pub fn has_dest(self) -> bool {
        self.is_move()
            || self.is_move_result_any()
            || self.is_load_param()
            || self.is_binop()
            || self.is_unop()
            || self.is_literal_op()
            || self.cmp_kind().is_some()
            || matches!(self, Op::Const | Op::ConstWide | Op::MoveException)
    }

    /// For opcodes whose source registers have a fixed wideness, whether source `index` is a
    /// register pair. Invokes depend on the callee proto and are handled by the instruction.
    #[must_use]
    pub fn src_is_wide(self, index: usize) -> bool {
        match self {
            Op::MoveWide | Op::ReturnWide => index == 0,
            Op::AputWide | Op::IputWide | Op::SputWide => index == 0,
            Op::CmpLong | Op::CmplDouble | Op::CmpgDouble => true,
            Op::ShlLong | Op::ShrLong | Op::UshrLong => index == 0,
            op if op.is_binop() => op.num_kind().is_some_and(NumKind::is_wide),
            op => op.unop_kinds().is_some_and(|(s, _)| s.is_wide()),
        }
    }

    /// The result-pseudo opcode matching a field/array load of this opcode.
    #[must_use]
    pub fn pseudo_for_result(self) -> Option<IROpcode> {
        if !self.has_move_result_pseudo() {
            return None;
        }
        Some(match self {
            Op::AgetWide | Op::IgetWide | Op::SgetWide => Op::MoveResultPseudoWide,
            Op::AgetObject
            | Op::IgetObject
            | Op::SgetObject
            | Op::ConstString
            | Op::ConstClass
            | Op::ConstMethodHandle
            | Op::ConstMethodType
            | Op::CheckCast
            | Op::NewInstance
            | Op::NewArray => Op::MoveResultPseudoObject,
            _ => Op::MoveResultPseudo,
        })
    }

    /// Swaps the sense of a conditional branch (`if-eq` becomes `if-ne`).
    #[must_use]
    pub const fn invert_conditional(self) -> Option<IROpcode> {
        Some(match self {
            Op::IfEq => Op::IfNe,
            Op::IfNe => Op::IfEq,
            Op::IfLt => Op::IfGe,
            Op::IfGe => Op::IfLt,
            Op::IfGt => Op::IfLe,
            Op::IfLe => Op::IfGt,
            Op::IfEqz => Op::IfNez,
            Op::IfNez => Op::IfEqz,
            Op::IfLtz => Op::IfGez,
            Op::IfGez => Op::IfLtz,
            Op::IfGtz => Op::IfLez,
            Op::IfLez => Op::IfGtz,
            _ => return None,
        })
    }

    /// The literal form of a register binary operation, if one exists.
    #[must_use]
    pub const fn to_literal_op(self) -> Option<IROpcode> {
        Some(match self {
            Op::AddInt => Op::AddIntLit,
            Op::MulInt => Op::MulIntLit,
            Op::DivInt => Op::DivIntLit,
            Op::RemInt => Op::RemIntLit,
            Op::AndInt => Op::AndIntLit,
            Op::OrInt => Op::OrIntLit,
            Op::XorInt => Op::XorIntLit,
            Op::ShlInt => Op::ShlIntLit,
            Op::ShrInt => Op::ShrIntLit,
            Op::UshrInt => Op::UshrIntLit,
            _ => return None,
        })
    }

    /// Estimated encoded size in 16-bit code units, for the narrowest usual encoding.
    #[must_use]
    pub fn size_estimate(self) -> u32 {
        match self {
            op if op.is_load_param() || op.is_move_result_pseudo() => 0,
            Op::Nop
            | Op::Move
            | Op::MoveWide
            | Op::MoveObject
            | Op::ReturnVoid
            | Op::Return
            | Op::ReturnWide
            | Op::ReturnObject
            | Op::MonitorEnter
            | Op::MonitorExit
            | Op::Throw
            | Op::Goto
            | Op::MoveException => 1,
            op if op.is_move_result() || op.is_unop() => 1,
            Op::ConstWide => 5,
            Op::Const | Op::FillArrayData | Op::Switch => 3,
            op if op.is_invoke() || op == Op::FilledNewArray => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_names_round_trip() {
        assert_eq!(IROpcode::AddIntLit.to_string(), "add-int/lit");
        assert_eq!(IROpcode::MoveResultPseudoObject.to_string(), "move-result-pseudo-object");
        assert_eq!(IROpcode::from_str("int-to-long").unwrap(), IROpcode::IntToLong);
        assert_eq!(IROpcode::from_str("if-eqz").unwrap(), IROpcode::IfEqz);
    }

    #[test]
    fn test_classification() {
        assert!(IROpcode::IgetObject.has_move_result_pseudo());
        assert!(!IROpcode::InvokeStatic.has_move_result_pseudo());
        assert!(IROpcode::InvokeStatic.has_move_result());
        assert!(IROpcode::DivInt.may_throw());
        assert!(!IROpcode::DivFloat.may_throw());
        assert!(IROpcode::Goto.ends_block());
        assert!(IROpcode::SubLong.is_binop());
        assert!(!IROpcode::SubLong.is_commutative());
    }

    #[test]
    fn test_wideness() {
        assert!(IROpcode::AddLong.dest_is_wide());
        assert!(IROpcode::IntToDouble.dest_is_wide());
        assert!(!IROpcode::LongToInt.dest_is_wide());
        assert!(IROpcode::LongToInt.src_is_wide(0));
        assert!(IROpcode::ShlLong.src_is_wide(0));
        assert!(!IROpcode::ShlLong.src_is_wide(1));
        assert!(!IROpcode::CmpLong.dest_is_wide());
        assert!(IROpcode::CmpLong.src_is_wide(1));
    }

    #[test]
    fn test_num_kinds() {
        assert_eq!(IROpcode::RemFloat.num_kind(), Some(NumKind::Float));
        assert_eq!(IROpcode::UshrLong.num_kind(), Some(NumKind::Long));
        assert_eq!(IROpcode::XorIntLit.num_kind(), Some(NumKind::Int));
        assert_eq!(IROpcode::Move.num_kind(), None);
    }
}

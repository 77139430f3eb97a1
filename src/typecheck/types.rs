//! The register type lattice of the verifier model.
//!
//! ```text
//!                              TOP
//!        /      |      \       |       \       /     \
//!      INT    FLOAT  REFERENCE LONG1 DOUBLE1  LONG2 DOUBLE2
//!        \     /         |       \   /          \   /
//!         CONST          |      CONST1          CONST2
//!            \           |         \              /
//!             ---------- ZERO       \            /
//!                          \-------- BOTTOM ----/
//! ```
//!
//! `ZERO` is the literal 0, usable as an int, a float or the null reference until its first
//! use disambiguates it. `CONST` is any other 32-bit literal, usable as int or float.
//! Wide values occupy a register pair typed `*1` (low) and `*2` (high).

use std::fmt;

use crate::{
    analysis::{AbstractDomain, ClassDomain, RegisterEnvironment},
    ir::Reg,
    pool::{DexType, TypeCategory},
};

/// The type of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IRType {
    /// Unreachable.
    Bottom,
    /// The literal zero.
    Zero,
    /// A non-zero 32-bit literal.
    Const,
    /// Low half of a wide literal.
    Const1,
    /// High half of a wide literal.
    Const2,
    /// A 32-bit integer (including boolean, byte, short and char).
    Int,
    /// A 32-bit float.
    Float,
    /// Low half of a long.
    Long1,
    /// High half of a long.
    Long2,
    /// Low half of a double.
    Double1,
    /// High half of a double.
    Double2,
    /// An object reference.
    Reference,
    /// Conflicting or uninitialized.
    Top,
}

impl IRType {
    /// The (low, high) types of a wide value of `category`, or the single type of a
    /// narrow one in the low slot.
    #[must_use]
    pub fn of_category(category: TypeCategory) -> (IRType, Option<IRType>) {
        match category {
            TypeCategory::Long => (IRType::Long1, Some(IRType::Long2)),
            TypeCategory::Double => (IRType::Double1, Some(IRType::Double2)),
            TypeCategory::Float => (IRType::Float, None),
            TypeCategory::Reference => (IRType::Reference, None),
            TypeCategory::Void => (IRType::Top, None),
            _ => (IRType::Int, None),
        }
    }

    /// The types of a value of `ty`.
    #[must_use]
    pub fn of(ty: &DexType) -> (IRType, Option<IRType>) {
        Self::of_category(ty.category())
    }

    /// `true` for the low half of any wide type.
    #[must_use]
    pub fn is_wide_low(self) -> bool {
        matches!(self, IRType::Const1 | IRType::Long1 | IRType::Double1)
    }

    /// `true` for the high half of any wide type.
    #[must_use]
    pub fn is_wide_high(self) -> bool {
        matches!(self, IRType::Const2 | IRType::Long2 | IRType::Double2)
    }

    fn covers(self, other: IRType) -> bool {
        use IRType::*;
        match (other, self) {
            (a, b) if a == b => true,
            (Bottom, _) | (_, Top) => true,
            (Zero, Const | Int | Float | Reference) => true,
            (Const, Int | Float) => true,
            (Const1, Long1 | Double1) => true,
            (Const2, Long2 | Double2) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IRType::Bottom => "BOTTOM",
            IRType::Zero => "ZERO",
            IRType::Const => "CONST",
            IRType::Const1 => "CONST1",
            IRType::Const2 => "CONST2",
            IRType::Int => "INT",
            IRType::Float => "FLOAT",
            IRType::Long1 => "LONG1",
            IRType::Long2 => "LONG2",
            IRType::Double1 => "DOUBLE1",
            IRType::Double2 => "DOUBLE2",
            IRType::Reference => "REFERENCE",
            IRType::Top => "TOP",
        };
        f.write_str(name)
    }
}

impl AbstractDomain for IRType {
    const FINITE_HEIGHT: bool = true;

    fn bottom() -> Self {
        IRType::Bottom
    }

    fn top() -> Self {
        IRType::Top
    }

    fn is_bottom(&self) -> bool {
        *self == IRType::Bottom
    }

    fn is_top(&self) -> bool {
        *self == IRType::Top
    }

    fn leq(&self, other: &Self) -> bool {
        other.covers(*self)
    }

    fn join_with(&mut self, other: &Self) {
        if self.covers(*other) {
            return;
        }
        if other.covers(*self) {
            *self = *other;
            return;
        }
        *self = IRType::Top;
    }
}

/// Abstract state at a program point: a primitive type per register, plus the class of
/// registers holding references.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeState {
    /// Register types.
    pub types: RegisterEnvironment<IRType>,
    /// Classes of reference registers.
    pub classes: RegisterEnvironment<ClassDomain>,
}

impl TypeState {
    /// The type of `reg`.
    #[must_use]
    pub fn get(&self, reg: Reg) -> IRType {
        self.types.get(reg)
    }

    /// The class of `reg`, `Top` when unknown.
    #[must_use]
    pub fn class_of(&self, reg: Reg) -> ClassDomain {
        self.classes.get(reg)
    }

    /// Writes a narrow value to `reg`, invalidating any wide value it overlapped.
    pub fn set(&mut self, reg: Reg, ty: IRType, class: ClassDomain) {
        if reg > 0 && self.get(reg - 1).is_wide_low() {
            self.types.set(reg - 1, IRType::Top);
        }
        if self.get(reg + 1).is_wide_high() {
            self.types.set(reg + 1, IRType::Top);
        }
        self.types.set(reg, ty);
        self.classes.set(reg, class);
    }

    /// Writes a wide value to the pair `reg`, `reg + 1`.
    pub fn set_wide(&mut self, reg: Reg, low: IRType, high: IRType) {
        self.classes.havoc(reg);
        self.classes.havoc(reg + 1);
        if reg > 0 && self.get(reg - 1).is_wide_low() {
            self.types.set(reg - 1, IRType::Top);
        }
        if self.get(reg + 2).is_wide_high() {
            self.types.set(reg + 2, IRType::Top);
        }
        self.types.set(reg, low);
        self.types.set(reg + 1, high);
    }
}

impl AbstractDomain for TypeState {
    const FINITE_HEIGHT: bool = true;

    fn bottom() -> Self {
        Self {
            types: RegisterEnvironment::bottom(),
            classes: RegisterEnvironment::bottom(),
        }
    }

    fn top() -> Self {
        Self {
            types: RegisterEnvironment::top(),
            classes: RegisterEnvironment::top(),
        }
    }

    fn is_bottom(&self) -> bool {
        self.types.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.types.is_top() && self.classes.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        self.types.leq(&other.types) && self.classes.leq(&other.classes)
    }

    fn join_with(&mut self, other: &Self) {
        self.types.join_with(&other.types);
        self.classes.join_with(&other.classes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_order() {
        assert!(IRType::Zero.leq(&IRType::Reference));
        assert!(IRType::Zero.leq(&IRType::Float));
        assert!(IRType::Const.leq(&IRType::Int));
        assert!(!IRType::Const.leq(&IRType::Reference));
        assert_eq!(IRType::Int.join(&IRType::Float), IRType::Top);
        assert_eq!(IRType::Zero.join(&IRType::Const), IRType::Const);
        assert_eq!(IRType::Const1.join(&IRType::Long1), IRType::Long1);
    }

    #[test]
    fn test_wide_write_invalidates_halves() {
        let mut state = TypeState::top();
        state.set_wide(0, IRType::Long1, IRType::Long2);
        state.set(1, IRType::Int, ClassDomain::Top);
        assert_eq!(state.get(0), IRType::Top);
        assert_eq!(state.get(1), IRType::Int);

        state.set_wide(2, IRType::Double1, IRType::Double2);
        state.set_wide(1, IRType::Long1, IRType::Long2);
        assert_eq!(state.get(3), IRType::Top);
    }
}

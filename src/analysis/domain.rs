//! Abstract domains for the fixpoint iterator.
//!
//! A domain is a lattice with a least element (`bottom`, "unreachable"), a greatest element
//! (`top`, "anything"), a partial order and a join. Domains whose ascending chains are not
//! finite also provide a widening operator; [`AbstractDomain::FINITE_HEIGHT`] declares which
//! case applies so the iterator knows whether to extrapolate at loop heads.
//!
//! # Provided Domains
//!
//! - [`ConstantDomain`] - the flat lattice `Bottom < Value(v) < Top`
//! - [`RegisterEnvironment`] - a map from registers to a value domain where absent
//!   registers are implicitly `Top`

use std::{collections::BTreeMap, fmt::Debug};

use crate::ir::Reg;

/// A join semi-lattice with explicit extremal elements.
///
/// Implementations must make `join` the least upper bound with respect to `leq`:
/// commutative, associative and idempotent, with `bottom` as the identity.
pub trait AbstractDomain: Clone + Debug + PartialEq {
    /// `true` if every ascending chain is finite, so that joins alone terminate.
    const FINITE_HEIGHT: bool;

    /// The least element.
    fn bottom() -> Self;

    /// The greatest element.
    fn top() -> Self;

    /// `true` if this is the least element.
    fn is_bottom(&self) -> bool;

    /// `true` if this is the greatest element.
    fn is_top(&self) -> bool;

    /// The partial order.
    fn leq(&self, other: &Self) -> bool;

    /// Replaces `self` with the least upper bound of `self` and `other`.
    fn join_with(&mut self, other: &Self);

    /// Replaces `self` with an upper bound of `self` and `other` that guarantees
    /// termination when applied along any ascending chain.
    ///
    /// Finite-height domains can keep the default, which is the join.
    fn widen_with(&mut self, other: &Self) {
        self.join_with(other);
    }

    /// Returns the join of two elements.
    #[must_use]
    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.join_with(other);
        out
    }
}

/// The flat lattice over values of `T`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ConstantDomain<T> {
    /// No value: unreachable.
    #[default]
    Bottom,
    /// Exactly this value.
    Value(T),
    /// Any value.
    Top,
}

impl<T> ConstantDomain<T> {
    /// The known value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            ConstantDomain::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone + Debug + PartialEq> AbstractDomain for ConstantDomain<T> {
    const FINITE_HEIGHT: bool = true;

    fn bottom() -> Self {
        ConstantDomain::Bottom
    }

    fn top() -> Self {
        ConstantDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ConstantDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ConstantDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstantDomain::Bottom, _) | (_, ConstantDomain::Top) => true,
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) => a == b,
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        match (&*self, other) {
            (_, ConstantDomain::Bottom) | (ConstantDomain::Top, _) => {}
            (ConstantDomain::Bottom, _) => *self = other.clone(),
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) if a == b => {}
            _ => *self = ConstantDomain::Top,
        }
    }
}

/// An environment mapping registers to abstract values.
///
/// Registers without a binding are `Top`; binding a register to `Top` removes it. The
/// environment as a whole is `Bottom` when the program point is unreachable.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterEnvironment<D> {
    /// Unreachable.
    Bottom,
    /// Reachable, with the given non-top bindings.
    Map(BTreeMap<Reg, D>),
}

impl<D: AbstractDomain> Default for RegisterEnvironment<D> {
    fn default() -> Self {
        Self::top()
    }
}

impl<D: AbstractDomain> RegisterEnvironment<D> {
    /// The value of `reg`. `Bottom` environments yield `D::bottom()`.
    #[must_use]
    pub fn get(&self, reg: Reg) -> D {
        match self {
            RegisterEnvironment::Bottom => D::bottom(),
            RegisterEnvironment::Map(m) => m.get(&reg).cloned().unwrap_or_else(D::top),
        }
    }

    /// Binds `reg`. Has no effect on a `Bottom` environment.
    pub fn set(&mut self, reg: Reg, value: D) {
        if let RegisterEnvironment::Map(m) = self {
            if value.is_top() {
                m.remove(&reg);
            } else {
                m.insert(reg, value);
            }
        }
    }

    /// Forgets `reg`.
    pub fn havoc(&mut self, reg: Reg) {
        if let RegisterEnvironment::Map(m) = self {
            m.remove(&reg);
        }
    }

    /// Forgets every binding.
    pub fn havoc_all(&mut self) {
        if let RegisterEnvironment::Map(m) = self {
            m.clear();
        }
    }

    /// Forgets every binding matching `pred`.
    pub fn havoc_if(&mut self, mut pred: impl FnMut(Reg, &D) -> bool) {
        if let RegisterEnvironment::Map(m) = self {
            m.retain(|r, v| !pred(*r, v));
        }
    }

    /// The non-top bindings, in register order.
    pub fn bindings(&self) -> impl Iterator<Item = (Reg, &D)> {
        let map = match self {
            RegisterEnvironment::Bottom => None,
            RegisterEnvironment::Map(m) => Some(m),
        };
        map.into_iter().flat_map(|m| m.iter().map(|(r, v)| (*r, v)))
    }
}

impl<D: AbstractDomain> AbstractDomain for RegisterEnvironment<D> {
    const FINITE_HEIGHT: bool = D::FINITE_HEIGHT;

    fn bottom() -> Self {
        RegisterEnvironment::Bottom
    }

    fn top() -> Self {
        RegisterEnvironment::Map(BTreeMap::new())
    }

    fn is_bottom(&self) -> bool {
        matches!(self, RegisterEnvironment::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, RegisterEnvironment::Map(m) if m.is_empty())
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (RegisterEnvironment::Bottom, _) => true,
            (_, RegisterEnvironment::Bottom) => false,
            (RegisterEnvironment::Map(a), RegisterEnvironment::Map(b)) => b
                .iter()
                .all(|(r, v)| a.get(r).is_some_and(|mine| mine.leq(v))),
        }
    }

    fn join_with(&mut self, other: &Self) {
        self.combine(other, D::join_with);
    }

    fn widen_with(&mut self, other: &Self) {
        self.combine(other, D::widen_with);
    }
}

impl<D: AbstractDomain> RegisterEnvironment<D> {
    fn combine(&mut self, other: &Self, op: impl Fn(&mut D, &D)) {
        match (&mut *self, other) {
            (_, RegisterEnvironment::Bottom) => {}
            (RegisterEnvironment::Bottom, _) => *self = other.clone(),
            (RegisterEnvironment::Map(a), RegisterEnvironment::Map(b)) => {
                a.retain(|r, v| match b.get(r) {
                    Some(theirs) => {
                        op(v, theirs);
                        !v.is_top()
                    }
                    None => false,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Const = ConstantDomain<i64>;

    #[test]
    fn test_constant_join() {
        let mut a = Const::Value(1);
        a.join_with(&Const::Bottom);
        assert_eq!(a, Const::Value(1));
        a.join_with(&Const::Value(1));
        assert_eq!(a, Const::Value(1));
        a.join_with(&Const::Value(2));
        assert!(a.is_top());
        assert!(Const::Bottom.leq(&Const::Value(3)));
        assert!(!Const::Value(3).leq(&Const::Value(4)));
    }

    #[test]
    fn test_environment_implicit_top() {
        let mut env = RegisterEnvironment::<Const>::top();
        env.set(0, Const::Value(7));
        env.set(1, Const::Value(8));
        assert_eq!(env.get(0), Const::Value(7));
        assert!(env.get(5).is_top());

        let mut other = RegisterEnvironment::<Const>::top();
        other.set(0, Const::Value(7));
        other.set(1, Const::Value(9));
        env.join_with(&other);
        assert_eq!(env.get(0), Const::Value(7));
        assert!(env.get(1).is_top());
        assert_eq!(env.bindings().count(), 1);
    }

    #[test]
    fn test_environment_bottom() {
        let mut env = RegisterEnvironment::<Const>::bottom();
        env.set(0, Const::Value(1));
        assert!(env.is_bottom());
        assert!(env.get(0).is_bottom());

        let mut top = RegisterEnvironment::<Const>::top();
        top.set(3, Const::Value(1));
        env.join_with(&top);
        assert_eq!(env.get(3), Const::Value(1));
        assert!(RegisterEnvironment::<Const>::bottom().leq(&env));
        assert!(env.leq(&RegisterEnvironment::top()));
    }
}

//! A lattice of class types ordered by subtyping.
//!
//! Every abstract value carries its own super chain and interface set, taken from a
//! [`ClassHierarchy`] when the value is created, so joins need no access to the hierarchy.
//! The join is the least common super class; when that is `java.lang.Object` but both
//! operands implement a common interface, the interface wins (the lexicographically first,
//! for determinism).

use std::{collections::BTreeSet, sync::Arc};

use crate::{analysis::AbstractDomain, model::ClassHierarchy, pool::DexType};

/// A known class type with its supertypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassValue {
    chain: Arc<[DexType]>,
    interfaces: Arc<BTreeSet<DexType>>,
}

impl ClassValue {
    /// The value for `ty`.
    #[must_use]
    pub fn new(ty: &DexType, hierarchy: &ClassHierarchy) -> Self {
        let mut chain = hierarchy.super_chain(ty);
        let object = DexType::object();
        if chain.last() != Some(&object) && *ty != object {
            chain.push(object);
        }
        let interfaces = if ty.is_array() {
            ["Ljava/lang/Cloneable;", "Ljava/io/Serializable;"]
                .iter()
                .map(|d| DexType::make(d))
                .collect()
        } else {
            hierarchy.all_interfaces(ty)
        };
        Self {
            chain: chain.into(),
            interfaces: Arc::new(interfaces),
        }
    }

    /// The type itself.
    #[must_use]
    pub fn ty(&self) -> &DexType {
        &self.chain[0]
    }

    /// `true` if this type is assignable to `other`.
    #[must_use]
    pub fn is_subtype_of(&self, other: &DexType) -> bool {
        self.chain.contains(other) || self.interfaces.contains(other)
    }

    fn join(&self, other: &Self) -> Self {
        if other.is_subtype_of(self.ty()) {
            return self.clone();
        }
        if self.is_subtype_of(other.ty()) {
            return other.clone();
        }
        let object = DexType::object();
        let common = self
            .chain
            .iter()
            .position(|t| other.chain.contains(t))
            .filter(|&i| self.chain[i] != object);
        if let Some(i) = common {
            return Self {
                chain: self.chain[i..].into(),
                interfaces: Arc::new(
                    self.interfaces
                        .intersection(&other.interfaces)
                        .cloned()
                        .collect(),
                ),
            };
        }
        let shared: BTreeSet<DexType> = self
            .interfaces
            .intersection(&other.interfaces)
            .cloned()
            .collect();
        match shared.iter().next().cloned() {
            Some(iface) => {
                let rest: BTreeSet<DexType> =
                    shared.into_iter().filter(|t| *t != iface).collect();
                Self {
                    chain: vec![iface, object].into(),
                    interfaces: Arc::new(rest),
                }
            }
            None => Self {
                chain: vec![object].into(),
                interfaces: Arc::new(BTreeSet::new()),
            },
        }
    }
}

/// `Bottom | Class(T) | Top`, ordered by subtyping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClassDomain {
    /// Unreachable, or the null constant.
    #[default]
    Bottom,
    /// A value of (a subtype of) this class.
    Class(ClassValue),
    /// Unknown.
    Top,
}

impl ClassDomain {
    /// The domain element for `ty`.
    #[must_use]
    pub fn of(ty: &DexType, hierarchy: &ClassHierarchy) -> Self {
        ClassDomain::Class(ClassValue::new(ty, hierarchy))
    }

    /// The known type, if any.
    #[must_use]
    pub fn ty(&self) -> Option<&DexType> {
        match self {
            ClassDomain::Class(c) => Some(c.ty()),
            _ => None,
        }
    }

    /// `true` if every value described is assignable to `ty`. `Bottom` (null) is
    /// assignable to anything.
    #[must_use]
    pub fn is_subtype_of(&self, ty: &DexType) -> bool {
        match self {
            ClassDomain::Bottom => true,
            ClassDomain::Class(c) => c.is_subtype_of(ty),
            ClassDomain::Top => *ty == DexType::object(),
        }
    }
}

impl AbstractDomain for ClassDomain {
    const FINITE_HEIGHT: bool = true;

    fn bottom() -> Self {
        ClassDomain::Bottom
    }

    fn top() -> Self {
        ClassDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ClassDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ClassDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClassDomain::Bottom, _) | (_, ClassDomain::Top) => true,
            (ClassDomain::Class(a), ClassDomain::Class(b)) => a.is_subtype_of(b.ty()),
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        *self = match (&*self, other) {
            (_, ClassDomain::Bottom) | (ClassDomain::Top, _) => return,
            (ClassDomain::Bottom, x) => x.clone(),
            (ClassDomain::Class(a), ClassDomain::Class(b)) => ClassDomain::Class(a.join(b)),
            (_, ClassDomain::Top) => ClassDomain::Top,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{AccessFlags, DexClass, Program},
        pool::DexType,
    };

    fn hierarchy() -> ClassHierarchy {
        let object = Some(DexType::object());
        let mut b = DexClass::new(DexType::make("LB;"), object.clone(), AccessFlags::PUBLIC);
        b.add_interface(DexType::make("LRunnable;"));
        let c = DexClass::new(DexType::make("LC;"), Some(DexType::make("LB;")), AccessFlags::PUBLIC);
        let d = DexClass::new(DexType::make("LD;"), Some(DexType::make("LC;")), AccessFlags::PUBLIC);
        let mut e = DexClass::new(DexType::make("LE;"), object, AccessFlags::PUBLIC);
        e.add_interface(DexType::make("LRunnable;"));
        Program::from_classes(vec![b, c, d, e]).hierarchy()
    }

    #[test]
    fn test_subtype_order() {
        let h = hierarchy();
        let c = ClassDomain::of(&DexType::make("LC;"), &h);
        let b = ClassDomain::of(&DexType::make("LB;"), &h);
        assert!(c.leq(&b));
        assert!(!b.leq(&c));
        assert!(c.is_subtype_of(&DexType::make("LRunnable;")));
        assert!(!c.is_subtype_of(&DexType::make("LD;")));
    }

    #[test]
    fn test_join() {
        let h = hierarchy();
        let c = ClassDomain::of(&DexType::make("LC;"), &h);
        let d = ClassDomain::of(&DexType::make("LD;"), &h);
        let e = ClassDomain::of(&DexType::make("LE;"), &h);
        assert_eq!(c.join(&d).ty(), Some(&DexType::make("LC;")));
        assert_eq!(d.join(&e).ty(), Some(&DexType::make("LRunnable;")));
        assert_eq!(
            d.join(&ClassDomain::of(&DexType::string(), &h)).ty(),
            Some(&DexType::object())
        );
        assert_eq!(ClassDomain::Bottom.join(&c), c);
    }
}

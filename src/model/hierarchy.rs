//! An immutable snapshot of the class hierarchy.
//!
//! Passes that walk methods in parallel hold `&mut` access to method bodies, so they cannot
//! look at other classes through the [`Program`]. They consult a [`ClassHierarchy`] built
//! beforehand instead: super chains, interfaces, access flags and member flags of every
//! class defined in the program.
//!
//! Types not defined in the program (framework classes) are *external*. The snapshot knows
//! nothing about them beyond their name, so subtype tests against them only succeed for
//! identity and `java.lang.Object`.

use std::collections::{BTreeSet, HashMap};

use crate::{
    model::{AccessFlags, Program},
    pool::{DexFieldRef, DexMethodRef, DexType},
};

#[derive(Debug, Clone)]
struct ClassInfo {
    super_class: Option<DexType>,
    interfaces: Vec<DexType>,
    access: AccessFlags,
    fields: Vec<(DexFieldRef, AccessFlags)>,
    methods: Vec<(DexMethodRef, AccessFlags)>,
}

/// How a method reference is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSearch {
    /// `invoke-direct`: the named class only.
    Direct,
    /// `invoke-static`: the class and its super classes.
    Static,
    /// `invoke-virtual`: the class and its super classes.
    Virtual,
    /// `invoke-super`: starting at the super class of the named class.
    Super,
    /// `invoke-interface`: the class, its super classes and every implemented interface.
    Interface,
}

/// A member found by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<R> {
    /// The definition's reference (its class may be a super class of the one named).
    pub reference: R,
    /// The member's access flags.
    pub access: AccessFlags,
}

/// Snapshot of the classes defined in a program.
#[derive(Debug, Clone, Default)]
pub struct ClassHierarchy {
    classes: HashMap<DexType, ClassInfo>,
}

impl ClassHierarchy {
    /// Builds the snapshot.
    #[must_use]
    pub fn from_program(program: &Program) -> Self {
        let classes = program
            .classes()
            .map(|c| {
                let info = ClassInfo {
                    super_class: c.super_class().cloned(),
                    interfaces: c.interfaces().to_vec(),
                    access: c.access(),
                    fields: c
                        .fields()
                        .map(|f| (f.reference().clone(), f.access()))
                        .collect(),
                    methods: c
                        .methods()
                        .map(|m| (m.reference().clone(), m.access()))
                        .collect(),
                };
                (c.ty().clone(), info)
            })
            .collect();
        Self { classes }
    }

    /// `true` if `ty` is defined in the program.
    #[must_use]
    pub fn contains(&self, ty: &DexType) -> bool {
        self.classes.contains_key(ty)
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// `true` if no class is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Super class of a program class.
    #[must_use]
    pub fn super_class(&self, ty: &DexType) -> Option<&DexType> {
        self.classes.get(ty)?.super_class.as_ref()
    }

    /// Directly implemented interfaces of a program class.
    #[must_use]
    pub fn interfaces(&self, ty: &DexType) -> &[DexType] {
        self.classes.get(ty).map_or(&[], |c| c.interfaces.as_slice())
    }

    /// Access flags of a program class.
    #[must_use]
    pub fn access(&self, ty: &DexType) -> Option<AccessFlags> {
        self.classes.get(ty).map(|c| c.access)
    }

    /// `true` if `ty` is a program interface.
    #[must_use]
    pub fn is_interface(&self, ty: &DexType) -> bool {
        self.access(ty)
            .is_some_and(|a| a.contains(AccessFlags::INTERFACE))
    }

    /// The super chain of `ty`, starting with `ty` itself and ending at the first class
    /// outside the program.
    #[must_use]
    pub fn super_chain(&self, ty: &DexType) -> Vec<DexType> {
        let mut chain = vec![ty.clone()];
        let mut cursor = self.super_class(ty).cloned();
        while let Some(t) = cursor {
            if chain.contains(&t) {
                break;
            }
            cursor = self.super_class(&t).cloned();
            chain.push(t);
        }
        chain
    }

    /// Every interface `ty` implements, directly or through super classes and
    /// super interfaces.
    #[must_use]
    pub fn all_interfaces(&self, ty: &DexType) -> BTreeSet<DexType> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<DexType> = Vec::new();
        for c in self.super_chain(ty) {
            stack.extend(self.interfaces(&c).iter().cloned());
        }
        while let Some(i) = stack.pop() {
            if out.insert(i.clone()) {
                stack.extend(self.interfaces(&i).iter().cloned());
            }
        }
        out
    }

    /// `true` if a value of type `sub` can be assigned to `sup`.
    #[must_use]
    pub fn is_subtype(&self, sub: &DexType, sup: &DexType) -> bool {
        if sub == sup {
            return true;
        }
        if !sub.is_reference() || !sup.is_reference() {
            return false;
        }
        if *sup == DexType::object() {
            return true;
        }
        if sub.is_array() {
            return match (sub.component_type(), sup.component_type()) {
                (Some(a), Some(b)) if a.is_reference() && b.is_reference() => {
                    self.is_subtype(&a, &b)
                }
                (Some(a), Some(b)) => a == b,
                _ => {
                    sup.descriptor() == "Ljava/lang/Cloneable;"
                        || sup.descriptor() == "Ljava/io/Serializable;"
                }
            };
        }
        if self.super_chain(sub).contains(sup) {
            return true;
        }
        self.all_interfaces(sub).contains(sup)
    }

    /// Least common super type of two reference types.
    ///
    /// The class-chain join is used when it is more specific than `Object`. Otherwise, if both
    /// types implement a common interface, the lexicographically first such interface is the
    /// result, so the join stays deterministic.
    #[must_use]
    pub fn least_common_supertype(&self, a: &DexType, b: &DexType) -> DexType {
        if self.is_subtype(a, b) {
            return b.clone();
        }
        if self.is_subtype(b, a) {
            return a.clone();
        }
        if a.is_array() && b.is_array() {
            if let (Some(ca), Some(cb)) = (a.component_type(), b.component_type()) {
                if ca.is_reference() && cb.is_reference() {
                    return self.least_common_supertype(&ca, &cb).array_of();
                }
            }
            return DexType::object();
        }
        let chain_a = self.super_chain(a);
        let class_join = self
            .super_chain(b)
            .into_iter()
            .find(|t| chain_a.contains(t));
        if let Some(join) = class_join.filter(|t| *t != DexType::object()) {
            return join;
        }
        let shared: Option<DexType> = self
            .all_interfaces(a)
            .intersection(&self.all_interfaces(b))
            .next()
            .cloned();
        shared.unwrap_or_else(DexType::object)
    }

    /// Resolves a field reference against the named class and its super classes.
    #[must_use]
    pub fn resolve_field(&self, field: &DexFieldRef) -> Option<Resolved<DexFieldRef>> {
        for class in self.super_chain(field.class()) {
            let Some(info) = self.classes.get(&class) else { break };
            let found = info
                .fields
                .iter()
                .find(|(f, _)| f.name() == field.name() && f.ty() == field.ty());
            if let Some((f, access)) = found {
                return Some(Resolved {
                    reference: f.clone(),
                    access: *access,
                });
            }
        }
        None
    }

    /// Resolves a method reference.
    #[must_use]
    pub fn resolve_method(
        &self,
        method: &DexMethodRef,
        search: MethodSearch,
    ) -> Option<Resolved<DexMethodRef>> {
        let matches = |m: &DexMethodRef| m.name() == method.name() && m.proto() == method.proto();
        let find_in = |ty: &DexType| {
            self.classes.get(ty).and_then(|info| {
                info.methods
                    .iter()
                    .find(|(m, _)| matches(m))
                    .map(|(m, a)| Resolved {
                        reference: m.clone(),
                        access: *a,
                    })
            })
        };
        match search {
            MethodSearch::Direct => find_in(method.class()),
            MethodSearch::Static | MethodSearch::Virtual => self
                .super_chain(method.class())
                .iter()
                .find_map(|c| find_in(c)),
            MethodSearch::Super => {
                let start = self.super_class(method.class())?;
                self.super_chain(start).iter().find_map(|c| find_in(c))
            }
            MethodSearch::Interface => self
                .super_chain(method.class())
                .iter()
                .find_map(|c| find_in(c))
                .or_else(|| {
                    self.all_interfaces(method.class())
                        .iter()
                        .find_map(|i| find_in(i))
                }),
        }
    }

    /// `true` if the resolved field is declared volatile. Unresolvable fields are treated
    /// as volatile.
    #[must_use]
    pub fn is_volatile(&self, field: &DexFieldRef) -> bool {
        self.resolve_field(field)
            .is_none_or(|r| r.access.contains(AccessFlags::VOLATILE))
    }

    /// `true` if code in class `from` may reference a member of `owner` with flags
    /// `access`.
    ///
    /// External owners are assumed accessible.
    #[must_use]
    pub fn is_accessible(&self, from: &DexType, owner: &DexType, access: AccessFlags) -> bool {
        let Some(class_access) = self.access(owner) else {
            return true;
        };
        let same_package = from.package() == owner.package();
        if !class_access.contains(AccessFlags::PUBLIC) && !same_package {
            return false;
        }
        if access.contains(AccessFlags::PUBLIC) {
            true
        } else if access.contains(AccessFlags::PRIVATE) {
            from == owner
        } else if access.contains(AccessFlags::PROTECTED) {
            same_package || self.is_subtype(from, owner)
        } else {
            same_package
        }
    }
}

//! Per-dex reference caps and the running reference count of a dex being filled.

use std::collections::BTreeSet;

use crate::{
    model::{ClassRefs, DexClass},
    pool::{DexFieldRef, DexMethodRef, DexType},
};

/// Number of indexes in a 16-bit reference table.
pub const MAX_REFS: usize = 65536;

/// Type-reference cap before API 26.
pub const MAX_TYPE_REFS_PRE_26: usize = 32768;

/// Caps on the references one dex may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexLimits {
    /// Method references.
    pub methods: usize,
    /// Field references.
    pub fields: usize,
    /// Type references.
    pub types: usize,
}

impl DexLimits {
    /// The platform caps for apps whose minimum API level is `min_sdk`.
    #[must_use]
    pub fn for_min_sdk(min_sdk: u32) -> Self {
        Self {
            methods: MAX_REFS,
            fields: MAX_REFS,
            types: if min_sdk < 26 {
                MAX_TYPE_REFS_PRE_26
            } else {
                MAX_REFS
            },
        }
    }

    /// These caps with `reserve` subtracted, saturating at zero.
    #[must_use]
    pub fn reserving(self, reserve: &Reservation) -> Self {
        Self {
            methods: self.methods.saturating_sub(reserve.methods),
            fields: self.fields.saturating_sub(reserve.fields),
            types: self.types.saturating_sub(reserve.types),
        }
    }
}

/// Reference slots kept free in every dex for code generated after packing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Method references.
    pub methods: usize,
    /// Field references.
    pub fields: usize,
    /// Type references.
    pub types: usize,
}

impl Reservation {
    /// Adds two reservations.
    #[must_use]
    pub fn plus(self, other: Reservation) -> Self {
        Self {
            methods: self.methods + other.methods,
            fields: self.fields + other.fields,
            types: self.types + other.types,
        }
    }
}

/// Which cap a class would break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overflow {
    /// `"method"`, `"field"` or `"type"`.
    pub kind: &'static str,
    /// Count the dex would reach.
    pub count: usize,
    /// The cap.
    pub limit: usize,
}

/// The distinct references of a dex under construction.
#[derive(Debug, Clone, Default)]
pub struct DexRefs {
    methods: BTreeSet<DexMethodRef>,
    fields: BTreeSet<DexFieldRef>,
    types: BTreeSet<DexType>,
}

impl DexRefs {
    /// Empty counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The references of every class in `classes`.
    #[must_use]
    pub fn of_classes<'a>(classes: impl IntoIterator<Item = &'a DexClass>) -> Self {
        let mut refs = Self::new();
        for class in classes {
            refs.add(&class.gather_refs());
        }
        refs
    }

    /// Number of distinct method references.
    #[must_use]
    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    /// Number of distinct field references.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Number of distinct type references.
    #[must_use]
    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    /// Counts after adding `class` refs, without adding them.
    #[must_use]
    pub fn counts_with(&self, class: &ClassRefs) -> (usize, usize, usize) {
        let methods = self.methods.len() + class.methods.difference(&self.methods).count();
        let fields = self.fields.len() + class.fields.difference(&self.fields).count();
        let types = self.types.len() + class.types.difference(&self.types).count();
        (methods, fields, types)
    }

    /// The first cap adding `class` would exceed, if any.
    #[must_use]
    pub fn overflow_with(&self, class: &ClassRefs, limits: &DexLimits) -> Option<Overflow> {
        let (methods, fields, types) = self.counts_with(class);
        [
            ("method", methods, limits.methods),
            ("field", fields, limits.fields),
            ("type", types, limits.types),
        ]
        .into_iter()
        .find(|&(_, count, limit)| count > limit)
        .map(|(kind, count, limit)| Overflow { kind, count, limit })
    }

    /// `true` if adding `class` keeps every count within `limits`.
    #[must_use]
    pub fn fits(&self, class: &ClassRefs, limits: &DexLimits) -> bool {
        self.overflow_with(class, limits).is_none()
    }

    /// Adds `class` refs.
    pub fn add(&mut self, class: &ClassRefs) {
        self.methods.extend(class.methods.iter().cloned());
        self.fields.extend(class.fields.iter().cloned());
        self.types.extend(class.types.iter().cloned());
    }

    /// Adds every reference of `other`.
    pub fn merge(&mut self, other: &DexRefs) {
        self.methods.extend(other.methods.iter().cloned());
        self.fields.extend(other.fields.iter().cloned());
        self.types.extend(other.types.iter().cloned());
    }

    /// `true` if the merged counts of `self` and `other` stay within `limits`.
    #[must_use]
    pub fn fits_merged(&self, other: &DexRefs, limits: &DexLimits) -> bool {
        self.methods.union(&other.methods).count() <= limits.methods
            && self.fields.union(&other.fields).count() <= limits.fields
            && self.types.union(&other.types).count() <= limits.types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::helpers::{class_with_methods, static_method};

    #[test]
    fn test_type_cap_depends_on_api_level() {
        assert_eq!(DexLimits::for_min_sdk(21).types, MAX_TYPE_REFS_PRE_26);
        assert_eq!(DexLimits::for_min_sdk(26).types, MAX_REFS);
        assert_eq!(DexLimits::for_min_sdk(21).methods, MAX_REFS);
    }

    #[test]
    fn test_shared_refs_counted_once() {
        let a = class_with_methods(
            "LA;",
            vec![static_method("LA;.f:()V", 1, |b| {
                b.invoke_static("LShared;.g:()V", &[]).return_void();
            })],
        );
        let b = class_with_methods(
            "LB;",
            vec![static_method("LB;.f:()V", 1, |b| {
                b.invoke_static("LShared;.g:()V", &[]).return_void();
            })],
        );
        let mut refs = DexRefs::new();
        refs.add(&a.gather_refs());
        assert_eq!(refs.num_methods(), 2);
        let (methods, _, _) = refs.counts_with(&b.gather_refs());
        assert_eq!(methods, 3);
    }

    #[test]
    fn test_overflow_reports_kind() {
        let a = class_with_methods("LA;", vec![static_method("LA;.f:()V", 1, |b| {
            b.return_void();
        })]);
        let limits = DexLimits {
            methods: 0,
            fields: 10,
            types: 10,
        };
        let overflow = DexRefs::new().overflow_with(&a.gather_refs(), &limits);
        assert_eq!(overflow.map(|o| o.kind), Some("method"));
        let reserved = DexLimits::for_min_sdk(21).reserving(&Reservation {
            methods: 10,
            fields: 0,
            types: 0,
        });
        assert_eq!(reserved.methods, MAX_REFS - 10);
    }
}

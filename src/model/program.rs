use crate::{
    model::{ClassHierarchy, DexClass, DexMethod},
    pool::DexType,
};

/// Layout labels of one dex, as recorded in the interdex manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DexInfo {
    /// The primary dex (`classes.dex`).
    pub primary: bool,
    /// Holds coldstart classes.
    pub coldstart: bool,
    /// Holds extended-coldstart classes.
    pub extended: bool,
    /// Holds scroll-set classes.
    pub scroll: bool,
    /// Holds background-set classes.
    pub background: bool,
}

/// One output dex file: an ordered class list.
#[derive(Debug, Clone, Default)]
pub struct DexUnit {
    /// Classes in emission order.
    pub classes: Vec<DexClass>,
    /// Layout labels.
    pub info: DexInfo,
}

impl DexUnit {
    /// Creates a dex holding `classes`.
    #[must_use]
    pub fn new(classes: Vec<DexClass>, info: DexInfo) -> Self {
        Self { classes, info }
    }

    /// `true` if the first class is a generated canary.
    #[must_use]
    pub fn has_canary(&self) -> bool {
        self.classes.first().is_some_and(|c| {
            c.state().generated && c.ty().descriptor().starts_with("Lsecondary/dex")
        })
    }
}

/// The whole program: every class, grouped by dex.
///
/// The loader hands the program over with the input dex grouping; the interdex pass
/// recomputes it.
#[derive(Debug, Clone, Default)]
pub struct Program {
    dexes: Vec<DexUnit>,
    min_sdk: u32,
}

impl Program {
    /// Creates a program from dexes.
    #[must_use]
    pub fn new(dexes: Vec<DexUnit>, min_sdk: u32) -> Self {
        Self { dexes, min_sdk }
    }

    /// Creates a single-dex program; the dex is marked primary.
    #[must_use]
    pub fn from_classes(classes: Vec<DexClass>) -> Self {
        let info = DexInfo {
            primary: true,
            ..DexInfo::default()
        };
        Self::new(vec![DexUnit::new(classes, info)], 21)
    }

    /// Minimum Android API level of the app.
    #[must_use]
    pub fn min_sdk(&self) -> u32 {
        self.min_sdk
    }

    /// Sets the minimum API level.
    pub fn set_min_sdk(&mut self, min_sdk: u32) {
        self.min_sdk = min_sdk;
    }

    /// The dexes in order.
    #[must_use]
    pub fn dexes(&self) -> &[DexUnit] {
        &self.dexes
    }

    /// Mutable dexes.
    pub fn dexes_mut(&mut self) -> &mut Vec<DexUnit> {
        &mut self.dexes
    }

    /// Replaces the dex layout.
    pub fn set_dexes(&mut self, dexes: Vec<DexUnit>) {
        self.dexes = dexes;
    }

    /// Removes every class from its dex, returning them in order and leaving no dexes.
    pub fn take_classes(&mut self) -> Vec<DexClass> {
        std::mem::take(&mut self.dexes)
            .into_iter()
            .flat_map(|d| d.classes)
            .collect()
    }

    /// All classes in dex order.
    pub fn classes(&self) -> impl Iterator<Item = &DexClass> {
        self.dexes.iter().flat_map(|d| d.classes.iter())
    }

    /// All classes, mutably.
    pub fn classes_mut(&mut self) -> impl Iterator<Item = &mut DexClass> {
        self.dexes.iter_mut().flat_map(|d| d.classes.iter_mut())
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.dexes.iter().map(|d| d.classes.len()).sum()
    }

    /// All methods.
    pub fn methods(&self) -> impl Iterator<Item = &DexMethod> {
        self.classes().flat_map(DexClass::methods)
    }

    /// All methods, mutably.
    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut DexMethod> {
        self.classes_mut().flat_map(DexClass::methods_mut)
    }

    /// Looks up a class definition.
    #[must_use]
    pub fn class(&self, ty: &DexType) -> Option<&DexClass> {
        self.classes().find(|c| c.ty() == ty)
    }

    /// Looks up a class definition, mutably.
    pub fn class_mut(&mut self, ty: &DexType) -> Option<&mut DexClass> {
        self.classes_mut().find(|c| c.ty() == ty)
    }

    /// Appends a class to dex `dex`, creating empty dexes as needed.
    pub fn add_class(&mut self, dex: usize, class: DexClass) {
        while self.dexes.len() <= dex {
            self.dexes.push(DexUnit::default());
        }
        self.dexes[dex].classes.push(class);
    }

    /// Removes a class definition.
    pub fn remove_class(&mut self, ty: &DexType) -> Option<DexClass> {
        for dex in &mut self.dexes {
            if let Some(i) = dex.classes.iter().position(|c| c.ty() == ty) {
                return Some(dex.classes.remove(i));
            }
        }
        None
    }

    /// Snapshot of the class hierarchy.
    #[must_use]
    pub fn hierarchy(&self) -> ClassHierarchy {
        ClassHierarchy::from_program(self)
    }
}

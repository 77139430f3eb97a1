//! The program data model: classes, fields, methods and their grouping into dexes.
//!
//! Definitions own their members and bodies. Everything that refers to another entity
//! (a method's owning class, a call target, a super class) does so through interned
//! handles from [`crate::pool`], never through owning references.
//!
//! # Key Components
//!
//! - [`DexClass`] - a class definition with direct/virtual method lists and field lists
//! - [`DexMethod`] / [`DexField`] - member definitions
//! - [`Program`] - all classes, grouped into [`DexUnit`]s
//! - [`ClassHierarchy`] - an immutable snapshot used during parallel method walks

mod access;
mod annotation;
mod class;
mod field;
mod hierarchy;
mod method;
mod program;

pub use access::AccessFlags;
pub use annotation::{AnnotationVisibility, DexAnnotation, EncodedValue};
pub use class::{canary_name, ClassRefs, ClassState, DexClass};
pub use field::DexField;
pub use hierarchy::{ClassHierarchy, MethodSearch, Resolved};
pub use method::DexMethod;
pub use program::{DexInfo, DexUnit, Program};

//! Annotations and encoded values.

use crate::pool::{DexFieldRef, DexMethodRef, DexString, DexType};

/// Retention of an annotation in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationVisibility {
    /// Only kept for build tools
    Build,
    /// Visible through reflection
    Runtime,
    /// Used by the runtime itself (`dalvik.annotation.*`)
    System,
}

/// A constant value as stored in annotations and static field initializers.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    /// Integral value of any width (`byte` .. `long`, `char`, `boolean`)
    Int(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// String literal
    String(DexString),
    /// `Class` literal
    Type(DexType),
    /// Field reference
    Field(DexFieldRef),
    /// Method reference
    Method(DexMethodRef),
    /// Enum constant
    Enum(DexFieldRef),
    /// Array of values
    Array(Vec<EncodedValue>),
    /// Nested annotation
    Annotation(Box<DexAnnotation>),
    /// `null`
    Null,
}

/// A single annotation instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DexAnnotation {
    /// The annotation class.
    pub ty: DexType,
    /// Retention.
    pub visibility: AnnotationVisibility,
    /// Named element values, in declaration order.
    pub elements: Vec<(DexString, EncodedValue)>,
}

impl DexAnnotation {
    /// Creates an annotation without elements.
    #[must_use]
    pub fn new(ty: DexType, visibility: AnnotationVisibility) -> Self {
        Self {
            ty,
            visibility,
            elements: Vec::new(),
        }
    }

    /// Returns the value of the named element.
    #[must_use]
    pub fn element(&self, name: &str) -> Option<&EncodedValue> {
        self.elements
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
    }
}

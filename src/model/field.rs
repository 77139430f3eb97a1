use crate::{
    model::{AccessFlags, DexAnnotation, EncodedValue},
    pool::{DexFieldRef, DexType},
};

/// A field definition.
#[derive(Debug, Clone)]
pub struct DexField {
    field: DexFieldRef,
    access: AccessFlags,
    static_value: Option<EncodedValue>,
    annotations: Vec<DexAnnotation>,
}

impl DexField {
    /// Creates a field definition.
    #[must_use]
    pub fn new(field: DexFieldRef, access: AccessFlags) -> Self {
        Self {
            field,
            access,
            static_value: None,
            annotations: Vec::new(),
        }
    }

    /// The field reference.
    #[must_use]
    pub fn reference(&self) -> &DexFieldRef {
        &self.field
    }

    /// Owning class.
    #[must_use]
    pub fn class(&self) -> &DexType {
        self.field.class()
    }

    /// Access flags.
    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Replaces the access flags.
    pub fn set_access(&mut self, access: AccessFlags) {
        self.access = access;
    }

    /// `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    /// `true` for volatile fields.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.access.contains(AccessFlags::VOLATILE)
    }

    /// Initial value of a static field.
    #[must_use]
    pub fn static_value(&self) -> Option<&EncodedValue> {
        self.static_value.as_ref()
    }

    /// Sets the initial value of a static field.
    pub fn set_static_value(&mut self, value: Option<EncodedValue>) {
        self.static_value = value;
    }

    /// Annotations.
    #[must_use]
    pub fn annotations(&self) -> &[DexAnnotation] {
        &self.annotations
    }

    /// Adds an annotation.
    pub fn add_annotation(&mut self, annotation: DexAnnotation) {
        self.annotations.push(annotation);
    }
}

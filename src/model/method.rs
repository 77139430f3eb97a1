use std::fmt;

use crate::{
    ir::IRCode,
    model::{AccessFlags, DexAnnotation},
    pool::{DexMethodRef, DexProto, DexString, DexType},
};

/// A method definition: a reference plus flags and an optional body.
#[derive(Debug, Clone)]
pub struct DexMethod {
    method: DexMethodRef,
    access: AccessFlags,
    code: Option<IRCode>,
    annotations: Vec<DexAnnotation>,
}

impl DexMethod {
    /// Creates a method without a body.
    #[must_use]
    pub fn new(method: DexMethodRef, access: AccessFlags) -> Self {
        Self {
            method,
            access,
            code: None,
            annotations: Vec::new(),
        }
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_code(mut self, code: IRCode) -> Self {
        self.code = Some(code);
        self
    }

    /// The method reference.
    #[must_use]
    pub fn reference(&self) -> &DexMethodRef {
        &self.method
    }

    /// Replaces the reference; used by renaming and relocation.
    pub(crate) fn set_reference(&mut self, method: DexMethodRef) {
        self.method = method;
    }

    /// Owning class.
    #[must_use]
    pub fn class(&self) -> &DexType {
        self.method.class()
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &DexString {
        self.method.name()
    }

    /// Prototype.
    #[must_use]
    pub fn proto(&self) -> &DexProto {
        self.method.proto()
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

    /// `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    /// `true` for `<init>` and `<clinit>`.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.access.contains(AccessFlags::CONSTRUCTOR) || self.method.is_init() || self.method.is_clinit()
    }

    /// `true` for methods dispatched through the vtable: neither static, private nor a
    /// constructor.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        !self.is_static() && !self.is_constructor() && !self.access.contains(AccessFlags::PRIVATE)
    }

    /// `true` for bridge methods.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.access.contains(AccessFlags::BRIDGE)
    }

    /// `true` for synthetic methods.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.access.contains(AccessFlags::SYNTHETIC)
    }

    /// Number of parameter registers including `this`, counting wide arguments twice.
    #[must_use]
    pub fn param_words(&self) -> usize {
        let this = usize::from(!self.is_static());
        this + self.proto().arg_words()
    }

    /// The body.
    #[must_use]
    pub fn code(&self) -> Option<&IRCode> {
        self.code.as_ref()
    }

    /// Mutable body.
    pub fn code_mut(&mut self) -> Option<&mut IRCode> {
        self.code.as_mut()
    }

    /// Replaces the body.
    pub fn set_code(&mut self, code: Option<IRCode>) {
        self.code = code;
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

    /// Renders the method header and body for diagnostics.
    #[must_use]
    pub fn show(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{:#x}]", self.method, self.access.bits())?;
        match &self.code {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("<no code>\n"),
        }
    }
}

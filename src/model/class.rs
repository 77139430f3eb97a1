use std::collections::BTreeSet;

use crate::{
    ir::{MethodItem, Operand},
    model::{AccessFlags, DexAnnotation, DexField, DexMethod, EncodedValue},
    pool::{DexFieldRef, DexMethodRef, DexString, DexType},
};

/// Bookkeeping that passes attach to a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassState {
    /// Some member visibility was promoted to public.
    pub opened: bool,
    /// Never executed in observed traces.
    pub dynamically_dead: bool,
    /// Created by the optimizer (canaries, helpers).
    pub generated: bool,
    /// Hot at startup; passes avoid growing it.
    pub perf_sensitive: bool,
}

/// The references a class contributes to the dex that holds it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassRefs {
    /// Method references: definitions and call targets.
    pub methods: BTreeSet<DexMethodRef>,
    /// Field references: definitions and accesses.
    pub fields: BTreeSet<DexFieldRef>,
    /// Type references.
    pub types: BTreeSet<DexType>,
    /// String literals.
    pub strings: BTreeSet<DexString>,
}

impl ClassRefs {
    /// Adds every reference of `other`.
    pub fn extend(&mut self, other: &ClassRefs) {
        self.methods.extend(other.methods.iter().cloned());
        self.fields.extend(other.fields.iter().cloned());
        self.types.extend(other.types.iter().cloned());
        self.strings.extend(other.strings.iter().cloned());
    }

    fn add_type(&mut self, ty: &DexType) {
        self.types.insert(ty.clone());
    }

    fn add_method(&mut self, m: &DexMethodRef) {
        self.methods.insert(m.clone());
        self.add_type(m.class());
        self.add_type(m.proto().rtype());
        for a in m.proto().args() {
            self.add_type(a);
        }
    }

    fn add_field(&mut self, f: &DexFieldRef) {
        self.fields.insert(f.clone());
        self.add_type(f.class());
        self.add_type(f.ty());
    }

    fn add_value(&mut self, value: &EncodedValue) {
        match value {
            EncodedValue::String(s) => {
                self.strings.insert(s.clone());
            }
            EncodedValue::Type(t) => self.add_type(t),
            EncodedValue::Field(f) | EncodedValue::Enum(f) => self.add_field(f),
            EncodedValue::Method(m) => self.add_method(m),
            EncodedValue::Array(values) => values.iter().for_each(|v| self.add_value(v)),
            EncodedValue::Annotation(a) => self.add_annotation(a),
            _ => {}
        }
    }

    fn add_annotation(&mut self, annotation: &DexAnnotation) {
        self.add_type(&annotation.ty);
        for (_, value) in &annotation.elements {
            self.add_value(value);
        }
    }
}

/// A class definition.
#[derive(Debug, Clone)]
pub struct DexClass {
    ty: DexType,
    super_class: Option<DexType>,
    interfaces: Vec<DexType>,
    access: AccessFlags,
    ifields: Vec<DexField>,
    sfields: Vec<DexField>,
    dmethods: Vec<DexMethod>,
    vmethods: Vec<DexMethod>,
    annotations: Vec<DexAnnotation>,
    source_file: Option<DexString>,
    state: ClassState,
}

impl DexClass {
    /// Creates an empty class.
    #[must_use]
    pub fn new(ty: DexType, super_class: Option<DexType>, access: AccessFlags) -> Self {
        Self {
            ty,
            super_class,
            interfaces: Vec::new(),
            access,
            ifields: Vec::new(),
            sfields: Vec::new(),
            dmethods: Vec::new(),
            vmethods: Vec::new(),
            annotations: Vec::new(),
            source_file: None,
            state: ClassState::default(),
        }
    }

    /// Creates the canary of secondary dex `ordinal`: an empty public interface named
    /// `Lsecondary/dexNN/Canary;`.
    #[must_use]
    pub fn canary(ordinal: usize) -> Self {
        let mut class = Self::new(
            DexType::make(&canary_name(ordinal)),
            Some(DexType::object()),
            AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
        );
        class.state.generated = true;
        class
    }

    /// The class type.
    #[must_use]
    pub fn ty(&self) -> &DexType {
        &self.ty
    }

    /// The super class; `None` only for `java.lang.Object`.
    #[must_use]
    pub fn super_class(&self) -> Option<&DexType> {
        self.super_class.as_ref()
    }

    /// Directly implemented interfaces.
    #[must_use]
    pub fn interfaces(&self) -> &[DexType] {
        &self.interfaces
    }

    /// Adds an implemented interface.
    pub fn add_interface(&mut self, ty: DexType) {
        if !self.interfaces.contains(&ty) {
            self.interfaces.push(ty);
        }
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

    /// `true` for interfaces.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    /// Source file name.
    #[must_use]
    pub fn source_file(&self) -> Option<&DexString> {
        self.source_file.as_ref()
    }

    /// Sets the source file name.
    pub fn set_source_file(&mut self, file: Option<DexString>) {
        self.source_file = file;
    }

    /// Pass bookkeeping.
    #[must_use]
    pub fn state(&self) -> &ClassState {
        &self.state
    }

    /// Mutable pass bookkeeping.
    pub fn state_mut(&mut self) -> &mut ClassState {
        &mut self.state
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

    /// Instance fields in declaration order.
    #[must_use]
    pub fn ifields(&self) -> &[DexField] {
        &self.ifields
    }

    /// Static fields in declaration order.
    #[must_use]
    pub fn sfields(&self) -> &[DexField] {
        &self.sfields
    }

    /// All fields: static first.
    pub fn fields(&self) -> impl Iterator<Item = &DexField> {
        self.sfields.iter().chain(self.ifields.iter())
    }

    /// Adds a field to the static or instance list according to its flags.
    ///
    /// # Panics
    ///
    /// Aborts if the field belongs to another class.
    pub fn add_field(&mut self, field: DexField) {
        invariant!(
            field.class() == &self.ty,
            "field {} added to {}",
            field.reference(),
            self.ty
        );
        if field.is_static() {
            self.sfields.push(field);
        } else {
            self.ifields.push(field);
        }
    }

    /// Finds a field definition.
    #[must_use]
    pub fn find_field(&self, field: &DexFieldRef) -> Option<&DexField> {
        self.fields().find(|f| f.reference() == field)
    }

    /// Finds a field definition, mutably.
    pub fn find_field_mut(&mut self, field: &DexFieldRef) -> Option<&mut DexField> {
        self.sfields
            .iter_mut()
            .chain(self.ifields.iter_mut())
            .find(|f| f.reference() == field)
    }

    /// Direct methods: constructors, statics and private instance methods.
    #[must_use]
    pub fn dmethods(&self) -> &[DexMethod] {
        &self.dmethods
    }

    /// Virtual methods.
    #[must_use]
    pub fn vmethods(&self) -> &[DexMethod] {
        &self.vmethods
    }

    /// All methods: direct first.
    pub fn methods(&self) -> impl Iterator<Item = &DexMethod> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    /// All methods, mutably.
    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut DexMethod> {
        self.dmethods.iter_mut().chain(self.vmethods.iter_mut())
    }

    /// Number of method definitions.
    #[must_use]
    pub fn num_methods(&self) -> usize {
        self.dmethods.len() + self.vmethods.len()
    }

    /// Adds a method to the direct or virtual list according to its flags.
    ///
    /// # Panics
    ///
    /// Aborts if the method's owning class is not this class.
    pub fn add_method(&mut self, method: DexMethod) {
        invariant!(
            method.class() == &self.ty,
            "method {} added to {}",
            method.reference(),
            self.ty
        );
        if method.is_virtual() {
            self.vmethods.push(method);
        } else {
            self.dmethods.push(method);
        }
    }

    /// Removes and returns a method definition.
    pub fn remove_method(&mut self, method: &DexMethodRef) -> Option<DexMethod> {
        if let Some(i) = self.dmethods.iter().position(|m| m.reference() == method) {
            return Some(self.dmethods.remove(i));
        }
        let i = self.vmethods.iter().position(|m| m.reference() == method)?;
        Some(self.vmethods.remove(i))
    }

    /// Finds a method definition.
    #[must_use]
    pub fn find_method(&self, method: &DexMethodRef) -> Option<&DexMethod> {
        self.methods().find(|m| m.reference() == method)
    }

    /// Finds a method definition, mutably.
    pub fn find_method_mut(&mut self, method: &DexMethodRef) -> Option<&mut DexMethod> {
        self.methods_mut().find(|m| m.reference() == method)
    }

    /// Renames a method, appending `$N` when the name is already taken for the same proto.
    ///
    /// Call sites are not rewritten.
    ///
    /// # Returns
    ///
    /// The method's new reference, or `None` if `method` is not defined here.
    pub fn rename_method(&mut self, method: &DexMethodRef, name: &str) -> Option<DexMethodRef> {
        self.find_method(method)?;
        let taken = |candidate: &str| {
            self.methods().any(|m| {
                m.reference() != method
                    && m.name().as_str() == candidate
                    && m.proto() == method.proto()
            })
        };
        let mut candidate = name.to_string();
        let mut suffix = 1;
        while taken(&candidate) {
            candidate = format!("{name}${suffix}");
            suffix += 1;
        }
        let renamed = DexMethodRef::make(self.ty.clone(), &candidate, method.proto().clone());
        if let Some(m) = self.find_method_mut(method) {
            m.set_reference(renamed.clone());
        }
        Some(renamed)
    }

    /// Collects every reference the class puts into its dex.
    #[must_use]
    pub fn gather_refs(&self) -> ClassRefs {
        let mut refs = ClassRefs::default();
        refs.add_type(&self.ty);
        if let Some(s) = &self.super_class {
            refs.add_type(s);
        }
        for i in &self.interfaces {
            refs.add_type(i);
        }
        if let Some(file) = &self.source_file {
            refs.strings.insert(file.clone());
        }
        for a in &self.annotations {
            refs.add_annotation(a);
        }
        for f in self.fields() {
            refs.add_field(f.reference());
            if let Some(v) = f.static_value() {
                refs.add_value(v);
            }
        }
        for m in self.methods() {
            refs.add_method(m.reference());
            refs.strings.insert(m.name().clone());
            for a in m.annotations() {
                refs.add_annotation(a);
            }
            let Some(code) = m.code() else { continue };
            for insn in code.instructions() {
                match insn.operand() {
                    Operand::String(s) => {
                        refs.strings.insert(s.clone());
                    }
                    Operand::Type(t) => refs.add_type(t),
                    Operand::Field(f) => refs.add_field(f),
                    Operand::Method(mr) => refs.add_method(mr),
                    _ => {}
                }
            }
            if code.cfg_built() {
                continue;
            }
            for (_, item) in code.list().iter() {
                if let MethodItem::Catch(c) = item {
                    if let Some(t) = &c.catch_type {
                        refs.add_type(t);
                    }
                }
            }
        }
        refs
    }
}

/// Descriptor of the canary class of secondary dex `ordinal`.
#[must_use]
pub fn canary_name(ordinal: usize) -> String {
    format!("Lsecondary/dex{ordinal:02}/Canary;")
}

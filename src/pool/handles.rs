//! Handle types for interned entities.
//!
//! Each handle wraps an `Arc` to the canonical entry. Equality and hashing use the entry's
//! address; ordering uses the canonical text so that sorted output is stable across runs.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{pool::global, Result};

macro_rules! identity_handle {
    ($name:ident, $key:ident) => {
        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                std::ptr::hash(Arc::as_ptr(&self.0), state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                if Arc::ptr_eq(&self.0, &other.0) {
                    return Ordering::Equal;
                }
                self.$key()
                    .cmp(&other.$key())
                    .then_with(|| {
                        Arc::as_ptr(&self.0)
                            .cast::<()>()
                            .cmp(&Arc::as_ptr(&other.0).cast::<()>())
                    })
            }
        }
    };
}

/// An interned UTF-8 string.
#[derive(Clone)]
pub struct DexString(Arc<str>);

identity_handle!(DexString, as_str);

impl DexString {
    pub(super) fn new(text: &str) -> Self {
        Self(Arc::from(text))
    }

    /// Interns `text` in the global pool.
    pub fn make(text: &str) -> Self {
        global().make_string(text)
    }

    /// The string's contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// The verifier-level category of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    /// `V`
    Void,
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `S`
    Short,
    /// `C`
    Char,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// Class or array reference.
    Reference,
}

impl TypeCategory {
    /// `true` for `J` and `D`, which occupy a register pair.
    #[must_use]
    pub const fn is_wide(self) -> bool {
        matches!(self, TypeCategory::Long | TypeCategory::Double)
    }

    /// `true` for the int-like primitives (`Z B S C I`).
    #[must_use]
    pub const fn is_int_like(self) -> bool {
        matches!(
            self,
            TypeCategory::Boolean
                | TypeCategory::Byte
                | TypeCategory::Short
                | TypeCategory::Char
                | TypeCategory::Int
        )
    }
}

pub(super) struct TypeEntry {
    descriptor: DexString,
}

/// An interned type, identified by its DEX descriptor.
#[derive(Clone)]
pub struct DexType(Arc<TypeEntry>);

identity_handle!(DexType, descriptor);

impl DexType {
    pub(super) fn new(descriptor: DexString) -> Self {
        Self(Arc::new(TypeEntry { descriptor }))
    }

    /// Interns `descriptor` in the global pool.
    pub fn make(descriptor: &str) -> Self {
        global().make_type(descriptor)
    }

    /// The descriptor text, e.g. `Ljava/lang/String;`.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        self.0.descriptor.as_str()
    }

    /// The interned descriptor string.
    #[must_use]
    pub fn name(&self) -> &DexString {
        &self.0.descriptor
    }

    /// The verifier category of this type.
    #[must_use]
    pub fn category(&self) -> TypeCategory {
        match self.descriptor().as_bytes().first() {
            Some(b'V') => TypeCategory::Void,
            Some(b'Z') => TypeCategory::Boolean,
            Some(b'B') => TypeCategory::Byte,
            Some(b'S') => TypeCategory::Short,
            Some(b'C') => TypeCategory::Char,
            Some(b'I') => TypeCategory::Int,
            Some(b'J') => TypeCategory::Long,
            Some(b'F') => TypeCategory::Float,
            Some(b'D') => TypeCategory::Double,
            _ => TypeCategory::Reference,
        }
    }

    /// `true` for `J` and `D`.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        self.category().is_wide()
    }

    /// `true` for class and array types.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.category() == TypeCategory::Reference
    }

    /// `true` for primitive types other than `V`.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        !matches!(self.category(), TypeCategory::Reference | TypeCategory::Void)
    }

    /// `true` for `V`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.category() == TypeCategory::Void
    }

    /// `true` for array types.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.descriptor().starts_with('[')
    }

    /// The element type of an array type, or `None` for non-arrays.
    #[must_use]
    pub fn component_type(&self) -> Option<DexType> {
        self.descriptor().strip_prefix('[').map(DexType::make)
    }

    /// The array type whose elements are `self`.
    #[must_use]
    pub fn array_of(&self) -> DexType {
        DexType::make(&format!("[{}", self.descriptor()))
    }

    /// The package part of a class descriptor (`Lcom/foo/Bar;` gives `Lcom/foo/`).
    #[must_use]
    pub fn package(&self) -> &str {
        let d = self.descriptor();
        match d.rfind('/') {
            Some(i) => &d[..=i],
            None => "L",
        }
    }

    /// Converts to the Java binary name (`Lcom/foo/Bar;` to `com.foo.Bar`).
    #[must_use]
    pub fn java_name(&self) -> String {
        let d = self.descriptor();
        d.strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .map_or_else(|| d.to_string(), |s| s.replace('/', "."))
    }

    /// `java.lang.Object`.
    #[must_use]
    pub fn object() -> DexType {
        DexType::make("Ljava/lang/Object;")
    }

    /// `java.lang.String`.
    #[must_use]
    pub fn string() -> DexType {
        DexType::make("Ljava/lang/String;")
    }

    /// `java.lang.StringBuilder`.
    #[must_use]
    pub fn string_builder() -> DexType {
        DexType::make("Ljava/lang/StringBuilder;")
    }

    /// `java.lang.Throwable`.
    #[must_use]
    pub fn throwable() -> DexType {
        DexType::make("Ljava/lang/Throwable;")
    }

    /// `java.lang.Class`.
    #[must_use]
    pub fn class() -> DexType {
        DexType::make("Ljava/lang/Class;")
    }

    /// `V`
    #[must_use]
    pub fn void() -> DexType {
        DexType::make("V")
    }

    /// `I`
    #[must_use]
    pub fn int() -> DexType {
        DexType::make("I")
    }

    /// `J`
    #[must_use]
    pub fn long() -> DexType {
        DexType::make("J")
    }

    /// `Z`
    #[must_use]
    pub fn boolean() -> DexType {
        DexType::make("Z")
    }
}

impl fmt::Display for DexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

impl fmt::Debug for DexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

/// Checks the shape of a single type descriptor.
pub(crate) fn is_valid_descriptor(d: &str) -> bool {
    let body = d.trim_start_matches('[');
    match body.as_bytes() {
        [b'V'] => body.len() == d.len(),
        [b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D'] => true,
        [b'L', .., b';'] => body.len() > 2 && !body[1..body.len() - 1].contains(';'),
        _ => false,
    }
}

pub(super) fn shorty(rtype: &DexType, args: &[DexType]) -> String {
    fn short(t: &DexType) -> char {
        match t.descriptor().as_bytes()[0] {
            b'[' => 'L',
            c => c as char,
        }
    }
    std::iter::once(rtype)
        .chain(args)
        .map(short)
        .collect()
}

pub(super) struct ProtoEntry {
    rtype: DexType,
    args: Vec<DexType>,
    shorty: DexString,
    descriptor: String,
}

/// An interned method prototype: return type plus ordered argument types.
#[derive(Clone)]
pub struct DexProto(Arc<ProtoEntry>);

identity_handle!(DexProto, descriptor);

impl DexProto {
    pub(super) fn new(rtype: DexType, args: Vec<DexType>, shorty: DexString) -> Self {
        let descriptor = format!(
            "({}){}",
            args.iter().map(DexType::descriptor).collect::<String>(),
            rtype.descriptor()
        );
        Self(Arc::new(ProtoEntry {
            rtype,
            args,
            shorty,
            descriptor,
        }))
    }

    /// Interns a proto in the global pool.
    pub fn make(rtype: DexType, args: Vec<DexType>) -> Self {
        global().make_proto(rtype, args)
    }

    /// Parses and interns a proto descriptor in the global pool.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the descriptor is not a proto.
    pub fn parse(descriptor: &str) -> Result<Self> {
        global().parse_proto(descriptor)
    }

    /// The return type.
    #[must_use]
    pub fn rtype(&self) -> &DexType {
        &self.0.rtype
    }

    /// The argument types, excluding any implicit receiver.
    #[must_use]
    pub fn args(&self) -> &[DexType] {
        &self.0.args
    }

    /// The shorty form (`ILI` for `(Ljava/lang/String;I)I`).
    #[must_use]
    pub fn shorty(&self) -> &DexString {
        &self.0.shorty
    }

    /// The descriptor form, e.g. `(I)V`.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.0.descriptor
    }

    /// Number of 32-bit argument words, excluding any receiver.
    #[must_use]
    pub fn arg_words(&self) -> usize {
        self.0
            .args
            .iter()
            .map(|a| if a.is_wide() { 2 } else { 1 })
            .sum()
    }
}

impl fmt::Display for DexProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

impl fmt::Debug for DexProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

pub(super) struct FieldEntry {
    class: DexType,
    name: DexString,
    ty: DexType,
    text: String,
}

/// An interned field reference: owning class, name and type.
#[derive(Clone)]
pub struct DexFieldRef(Arc<FieldEntry>);

identity_handle!(DexFieldRef, text);

impl DexFieldRef {
    pub(super) fn new(class: DexType, name: DexString, ty: DexType) -> Self {
        let text = format!("{}.{}:{}", class, name, ty);
        Self(Arc::new(FieldEntry {
            class,
            name,
            ty,
            text,
        }))
    }

    /// Interns a field reference in the global pool.
    pub fn make(class: DexType, name: &str, ty: DexType) -> Self {
        global().make_field(class, name, ty)
    }

    /// Parses and interns `LFoo;.name:T` in the global pool.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the text is not a field reference.
    pub fn parse(text: &str) -> Result<Self> {
        global().parse_field(text)
    }

    /// The class that declares (or is referenced as declaring) the field.
    #[must_use]
    pub fn class(&self) -> &DexType {
        &self.0.class
    }

    /// The field name.
    #[must_use]
    pub fn name(&self) -> &DexString {
        &self.0.name
    }

    /// The field type.
    #[must_use]
    pub fn ty(&self) -> &DexType {
        &self.0.ty
    }

    /// The canonical text form.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.0.text
    }
}

impl fmt::Display for DexFieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl fmt::Debug for DexFieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

pub(super) struct MethodEntry {
    class: DexType,
    name: DexString,
    proto: DexProto,
    text: String,
}

/// An interned method reference: owning class, name and proto.
#[derive(Clone)]
pub struct DexMethodRef(Arc<MethodEntry>);

identity_handle!(DexMethodRef, text);

impl DexMethodRef {
    pub(super) fn new(class: DexType, name: DexString, proto: DexProto) -> Self {
        let text = format!("{}.{}:{}", class, name, proto);
        Self(Arc::new(MethodEntry {
            class,
            name,
            proto,
            text,
        }))
    }

    /// Interns a method reference in the global pool.
    pub fn make(class: DexType, name: &str, proto: DexProto) -> Self {
        global().make_method(class, name, proto)
    }

    /// Parses and interns `LFoo;.name:(I)V` in the global pool.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the text is not a method reference.
    pub fn parse(text: &str) -> Result<Self> {
        global().parse_method(text)
    }

    /// The class the method is referenced on.
    #[must_use]
    pub fn class(&self) -> &DexType {
        &self.0.class
    }

    /// The method name.
    #[must_use]
    pub fn name(&self) -> &DexString {
        &self.0.name
    }

    /// The method prototype.
    #[must_use]
    pub fn proto(&self) -> &DexProto {
        &self.0.proto
    }

    /// The canonical text form.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.0.text
    }

    /// `true` for `<init>`.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.name().as_str() == "<init>"
    }

    /// `true` for `<clinit>`.
    #[must_use]
    pub fn is_clinit(&self) -> bool {
        self.name().as_str() == "<clinit>"
    }

    /// Returns the same name and proto on a different class.
    #[must_use]
    pub fn with_class(&self, class: DexType) -> DexMethodRef {
        global().make_method(class, self.name().as_str(), self.proto().clone())
    }
}

impl fmt::Display for DexMethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl fmt::Debug for DexMethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_categories() {
        assert_eq!(DexType::make("J").category(), TypeCategory::Long);
        assert!(DexType::make("D").is_wide());
        assert!(DexType::make("[I").is_reference());
        assert!(DexType::make("[I").is_array());
        assert_eq!(DexType::make("[I").component_type(), Some(DexType::int()));
        assert_eq!(DexType::int().array_of(), DexType::make("[I"));
        assert!(DexType::void().is_void());
        assert!(!DexType::void().is_primitive());
    }

    #[test]
    fn test_handles_order_by_key() {
        let a = DexString::make("alpha");
        let b = DexString::make("beta");
        assert_eq!(a.cmp(&DexString::make("alpha")), Ordering::Equal);
        assert!(a < b);
        let mut types = vec![DexType::make("LZ;"), DexType::make("LA;"), DexType::make("LM;")];
        types.sort();
        let names: Vec<String> = types.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["LA;", "LM;", "LZ;"]);
    }

    #[test]
    fn test_type_names() {
        let t = DexType::make("Lcom/foo/Bar;");
        assert_eq!(t.java_name(), "com.foo.Bar");
        assert_eq!(t.package(), "Lcom/foo/");
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(is_valid_descriptor("I"));
        assert!(is_valid_descriptor("[[Ljava/lang/String;"));
        assert!(!is_valid_descriptor("[V"));
        assert!(!is_valid_descriptor("L;"));
        assert!(!is_valid_descriptor("Lfoo"));
        assert!(!is_valid_descriptor("II"));
    }

    #[test]
    fn test_ordering_is_by_text() {
        let a = DexType::make("LA;");
        let b = DexType::make("LB;");
        assert!(a < b);
        let mut v = vec![b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b]);
    }

    #[test]
    fn test_proto_words() {
        let p = DexProto::parse("(IJLjava/lang/Object;)V").unwrap();
        assert_eq!(p.arg_words(), 4);
        assert_eq!(p.shorty().as_str(), "VIJL");
    }
}

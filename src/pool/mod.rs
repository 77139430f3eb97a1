//! The interned-entity pool.
//!
//! Strings, types, protos, field references and method references are canonicalized here:
//! semantically equal entities share one allocation, so handle identity (pointer equality)
//! is the only comparison the rest of the crate performs on them.
//!
//! # Architecture
//!
//! - [`DexPool`] owns one concurrent map per entity kind. `make_*` returns the existing
//!   entry or inserts a new one; `get_*` never inserts.
//! - Handles ([`DexString`], [`DexType`], [`DexProto`], [`DexFieldRef`], [`DexMethodRef`]) are
//!   cheap `Arc` clones. Entries live at least as long as the pool, so handles never dangle.
//! - [`global()`] is the process-wide pool. The convenience constructors on the handle types
//!   (`DexType::make`, `DexMethodRef::parse`, ...) intern into it. Separate [`DexPool`]
//!   instances exist for isolated tests.
//!
//! # Thread Safety
//!
//! Every map is a [`DashMap`], so lookups and inserts from concurrent method walks only
//! contend on the shard holding the key.

mod handles;

use std::sync::OnceLock;

use dashmap::DashMap;

pub use handles::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType, TypeCategory};

use crate::Result;

type FieldKey = (DexType, DexString, DexType);
type MethodKey = (DexType, DexString, DexProto);

/// A deduplicating registry of interned entities.
#[derive(Default)]
pub struct DexPool {
    strings: DashMap<Box<str>, DexString>,
    types: DashMap<DexString, DexType>,
    protos: DashMap<(DexType, Vec<DexType>), DexProto>,
    fields: DashMap<FieldKey, DexFieldRef>,
    methods: DashMap<MethodKey, DexMethodRef>,
}

static GLOBAL: OnceLock<DexPool> = OnceLock::new();

/// Returns the process-wide pool.
pub fn global() -> &'static DexPool {
    GLOBAL.get_or_init(DexPool::new)
}

impl DexPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string.
    pub fn make_string(&self, text: &str) -> DexString {
        if let Some(s) = self.strings.get(text) {
            return s.clone();
        }
        self.strings
            .entry(text.into())
            .or_insert_with(|| DexString::new(text))
            .clone()
    }

    /// Looks up an interned string without creating it.
    #[must_use]
    pub fn get_string(&self, text: &str) -> Option<DexString> {
        self.strings.get(text).map(|s| s.clone())
    }

    /// Interns a type by descriptor (`I`, `Ljava/lang/String;`, `[J`, ...).
    pub fn make_type(&self, descriptor: &str) -> DexType {
        let name = self.make_string(descriptor);
        if let Some(t) = self.types.get(&name) {
            return t.clone();
        }
        self.types
            .entry(name.clone())
            .or_insert_with(|| DexType::new(name))
            .clone()
    }

    /// Looks up an interned type without creating it.
    #[must_use]
    pub fn get_type(&self, descriptor: &str) -> Option<DexType> {
        let name = self.get_string(descriptor)?;
        self.types.get(&name).map(|t| t.clone())
    }

    /// Interns a proto from its return type and argument types.
    pub fn make_proto(&self, rtype: DexType, args: Vec<DexType>) -> DexProto {
        let key = (rtype, args);
        if let Some(p) = self.protos.get(&key) {
            return p.clone();
        }
        let shorty = self.make_string(&handles::shorty(&key.0, &key.1));
        self.protos
            .entry(key.clone())
            .or_insert_with(|| DexProto::new(key.0, key.1, shorty))
            .clone()
    }

    /// Looks up an interned proto without creating it.
    #[must_use]
    pub fn get_proto(&self, rtype: &DexType, args: &[DexType]) -> Option<DexProto> {
        self.protos
            .get(&(rtype.clone(), args.to_vec()))
            .map(|p| p.clone())
    }

    /// Interns a field reference.
    pub fn make_field(&self, class: DexType, name: &str, ty: DexType) -> DexFieldRef {
        let key = (class, self.make_string(name), ty);
        if let Some(f) = self.fields.get(&key) {
            return f.clone();
        }
        self.fields
            .entry(key.clone())
            .or_insert_with(|| DexFieldRef::new(key.0, key.1, key.2))
            .clone()
    }

    /// Looks up an interned field reference without creating it.
    #[must_use]
    pub fn get_field(&self, class: &DexType, name: &str, ty: &DexType) -> Option<DexFieldRef> {
        let name = self.get_string(name)?;
        self.fields
            .get(&(class.clone(), name, ty.clone()))
            .map(|f| f.clone())
    }

    /// Interns a method reference.
    pub fn make_method(&self, class: DexType, name: &str, proto: DexProto) -> DexMethodRef {
        let key = (class, self.make_string(name), proto);
        if let Some(m) = self.methods.get(&key) {
            return m.clone();
        }
        self.methods
            .entry(key.clone())
            .or_insert_with(|| DexMethodRef::new(key.0, key.1, key.2))
            .clone()
    }

    /// Looks up an interned method reference without creating it.
    #[must_use]
    pub fn get_method(&self, class: &DexType, name: &str, proto: &DexProto) -> Option<DexMethodRef> {
        let name = self.get_string(name)?;
        self.methods
            .get(&(class.clone(), name, proto.clone()))
            .map(|m| m.clone())
    }

    /// Parses and interns a proto descriptor such as `(ILjava/lang/String;)V`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the descriptor is not a well-formed proto.
    pub fn parse_proto(&self, descriptor: &str) -> Result<DexProto> {
        let rest = descriptor
            .strip_prefix('(')
            .ok_or_else(|| malformed_error!("proto {} does not start with '('", descriptor))?;
        let close = rest
            .find(')')
            .ok_or_else(|| malformed_error!("proto {} has no ')'", descriptor))?;
        let args = split_descriptors(&rest[..close])?
            .into_iter()
            .map(|d| self.make_type(d))
            .collect();
        let rtype = &rest[close + 1..];
        if !handles::is_valid_descriptor(rtype) {
            return Err(malformed_error!("bad return type in proto {}", descriptor));
        }
        Ok(self.make_proto(self.make_type(rtype), args))
    }

    /// Parses and interns a method reference of the form `LFoo;.bar:(I)V`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the text is not a method reference.
    pub fn parse_method(&self, text: &str) -> Result<DexMethodRef> {
        let (class, rest) = text
            .split_once(";.")
            .ok_or_else(|| malformed_error!("method {} has no class part", text))?;
        let (name, proto) = rest
            .split_once(':')
            .ok_or_else(|| malformed_error!("method {} has no proto part", text))?;
        let class = self.make_type(&format!("{class};"));
        Ok(self.make_method(class, name, self.parse_proto(proto)?))
    }

    /// Parses and interns a field reference of the form `LFoo;.bar:I`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the text is not a field reference.
    pub fn parse_field(&self, text: &str) -> Result<DexFieldRef> {
        let (class, rest) = text
            .split_once(";.")
            .ok_or_else(|| malformed_error!("field {} has no class part", text))?;
        let (name, ty) = rest
            .split_once(':')
            .ok_or_else(|| malformed_error!("field {} has no type part", text))?;
        if !handles::is_valid_descriptor(ty) {
            return Err(malformed_error!("field {} has a bad type", text));
        }
        let class = self.make_type(&format!("{class};"));
        Ok(self.make_field(class, name, self.make_type(ty)))
    }

    /// Number of interned strings.
    #[must_use]
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Number of interned method references.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Splits a concatenation of type descriptors (`IJLjava/lang/String;[B`).
fn split_descriptors(mut text: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    while !text.is_empty() {
        let bytes = text.as_bytes();
        let mut end = 0;
        while bytes.get(end) == Some(&b'[') {
            end += 1;
        }
        match bytes.get(end) {
            Some(b'L') => {
                let semi = text[end..]
                    .find(';')
                    .ok_or_else(|| malformed_error!("unterminated class descriptor in {}", text))?;
                end += semi + 1;
            }
            Some(b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D') => end += 1,
            _ => return Err(malformed_error!("bad descriptor in {}", text)),
        }
        out.push(&text[..end]);
        text = &text[end..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_is_idempotent() {
        let pool = DexPool::new();
        let a = pool.make_type("LFoo;");
        let b = pool.make_type("LFoo;");
        assert_eq!(a, b);
        assert_eq!(pool.get_type("LFoo;"), Some(a));
        assert_eq!(pool.get_type("LBar;"), None);
    }

    #[test]
    fn test_pools_do_not_share_identity() {
        let p1 = DexPool::new();
        let p2 = DexPool::new();
        assert_ne!(p1.make_string("x"), p2.make_string("x"));
    }

    #[test]
    fn test_parse_method() {
        let pool = DexPool::new();
        let m = pool
            .parse_method("Ljava/lang/String;.indexOf:(Ljava/lang/String;I)I")
            .unwrap();
        assert_eq!(m.class().descriptor(), "Ljava/lang/String;");
        assert_eq!(m.name().as_str(), "indexOf");
        assert_eq!(m.proto().args().len(), 2);
        assert_eq!(m.proto().shorty().as_str(), "ILI");
        assert_eq!(
            m,
            pool.parse_method("Ljava/lang/String;.indexOf:(Ljava/lang/String;I)I")
                .unwrap()
        );
    }

    #[test]
    fn test_parse_proto_rejects_garbage() {
        let pool = DexPool::new();
        assert!(pool.parse_proto("I)V").is_err());
        assert!(pool.parse_proto("(Lfoo)V").is_err());
        assert!(pool.parse_proto("(I)Q").is_err());
        assert!(pool.parse_proto("([[JD)[I").is_ok());
    }

    #[test]
    fn test_parse_field() {
        let pool = DexPool::new();
        let f = pool.parse_field("LFoo;.count:I").unwrap();
        assert_eq!(f.to_string(), "LFoo;.count:I");
        assert!(pool.parse_field("LFoo;.count").is_err());
    }
}

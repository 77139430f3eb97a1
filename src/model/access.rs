//! DEX access flags.

use bitflags::bitflags;

bitflags! {
    /// Access flags of classes, fields and methods, with their DEX encoding values.
    ///
    /// Some bits are shared between member kinds: `VOLATILE` is `BRIDGE` on methods and
    /// `TRANSIENT` is `VARARGS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        /// Visible everywhere
        const PUBLIC = 0x1;
        /// Visible only to the defining class
        const PRIVATE = 0x2;
        /// Visible to the package and subclasses
        const PROTECTED = 0x4;
        /// Not bound to an instance
        const STATIC = 0x8;
        /// Not subclassable / overridable / assignable after construction
        const FINAL = 0x10;
        /// Associated lock is acquired around calls (native methods only)
        const SYNCHRONIZED = 0x20;
        /// Field accesses are ordered
        const VOLATILE = 0x40;
        /// Compiler-generated bridge method
        const BRIDGE = 0x40;
        /// Field is not serialized
        const TRANSIENT = 0x80;
        /// Last argument is a varargs array
        const VARARGS = 0x80;
        /// Implemented in native code
        const NATIVE = 0x100;
        /// Class is an interface
        const INTERFACE = 0x200;
        /// Not directly instantiable / has no body
        const ABSTRACT = 0x400;
        /// Strict floating point
        const STRICT = 0x800;
        /// Not directly defined in source
        const SYNTHETIC = 0x1000;
        /// Annotation class
        const ANNOTATION = 0x2000;
        /// Enum class or enum constant field
        const ENUM = 0x4000;
        /// Constructor (`<init>` or `<clinit>`)
        const CONSTRUCTOR = 0x10000;
        /// Declared `synchronized`
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

impl AccessFlags {
    /// Mask of the three visibility bits.
    pub const VISIBILITY: AccessFlags = AccessFlags::PUBLIC
        .union(AccessFlags::PRIVATE)
        .union(AccessFlags::PROTECTED);

    /// `true` if none of public/private/protected is set.
    #[must_use]
    pub fn is_package_private(self) -> bool {
        !self.intersects(Self::VISIBILITY)
    }

    /// Returns these flags with the visibility replaced by `PUBLIC`.
    #[must_use]
    pub fn made_public(self) -> Self {
        (self - Self::VISIBILITY) | Self::PUBLIC
    }
}

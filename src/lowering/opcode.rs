//! Concrete DEX opcodes and their encoding formats.

use std::fmt;

/// Instruction formats of the Dalvik bytecode, named after the Dalvik format ids: the first
/// digit is the size in 16-bit code units, the second the number of registers, the letter
/// the kind of extra data.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F32x,
    F30t,
    F31t,
    F31i,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
}

impl Format {
    /// Encoded size in code units.
    #[must_use]
    pub const fn units(self) -> u32 {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,
            Format::F32x
            | Format::F30t
            | Format::F31t
            | Format::F31i
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F45cc | Format::F4rcc => 4,
            Format::F51l => 5,
        }
    }

    /// Largest register number each register slot of the format can hold, in slot order.
    /// Range formats report one slot for the first register of the range.
    #[must_use]
    pub const fn register_limits(self) -> &'static [u32] {
        const NIBBLE: u32 = 0xf;
        const BYTE: u32 = 0xff;
        const SHORT: u32 = 0xffff;
        match self {
            Format::F10x | Format::F10t | Format::F20t | Format::F30t => &[],
            Format::F12x | Format::F22t | Format::F22s | Format::F22c => &[NIBBLE, NIBBLE],
            Format::F11n => &[NIBBLE],
            Format::F11x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F31t
            | Format::F31i
            | Format::F31c
            | Format::F51l => &[BYTE],
            Format::F22x => &[BYTE, SHORT],
            Format::F23x => &[BYTE, BYTE, BYTE],
            Format::F22b => &[BYTE, BYTE],
            Format::F32x => &[SHORT, SHORT],
            Format::F35c | Format::F45cc => &[NIBBLE; 5],
            Format::F3rc | Format::F4rcc => &[SHORT],
        }
    }
}

macro_rules! dex_opcodes {
    ($($variant:ident = $value:literal, $name:literal, $format:ident;)*) => {
        /// Concrete DEX opcodes, up to version 039.
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum DexOpcode {
            $($variant,)*
        }

        impl DexOpcode {
            /// Every opcode, in value order.
            pub const ALL: &'static [DexOpcode] = &[$(DexOpcode::$variant,)*];

            /// The opcode byte.
            #[must_use]
            pub const fn value(self) -> u8 {
                match self {
                    $(DexOpcode::$variant => $value,)*
                }
            }

            /// The mnemonic, e.g. `move/from16`.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(DexOpcode::$variant => $name,)*
                }
            }

            /// The encoding format.
            #[must_use]
            pub const fn format(self) -> Format {
                match self {
                    $(DexOpcode::$variant => Format::$format,)*
                }
            }

            /// Looks an opcode up by its byte.
            #[must_use]
            pub const fn from_value(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(DexOpcode::$variant),)*
                    _ => None,
                }
            }

            /// Looks an opcode up by its mnemonic.
            #[must_use]
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(DexOpcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

dex_opcodes! {
    Nop = 0x00, "nop", F10x;
    Move = 0x01, "move", F12x;
    MoveFrom16 = 0x02, "move/from16", F22x;
    Move16 = 0x03, "move/16", F32x;
    MoveWide = 0x04, "move-wide", F12x;
    MoveWideFrom16 = 0x05, "move-wide/from16", F22x;
    MoveWide16 = 0x06, "move-wide/16", F32x;
    MoveObject = 0x07, "move-object", F12x;
    MoveObjectFrom16 = 0x08, "move-object/from16", F22x;
    MoveObject16 = 0x09, "move-object/16", F32x;
    MoveResult = 0x0a, "move-result", F11x;
    MoveResultWide = 0x0b, "move-result-wide", F11x;
    MoveResultObject = 0x0c, "move-result-object", F11x;
    MoveException = 0x0d, "move-exception", F11x;
    ReturnVoid = 0x0e, "return-void", F10x;
    Return = 0x0f, "return", F11x;
    ReturnWide = 0x10, "return-wide", F11x;
    ReturnObject = 0x11, "return-object", F11x;
    Const4 = 0x12, "const/4", F11n;
    Const16 = 0x13, "const/16", F21s;
    Const = 0x14, "const", F31i;
    ConstHigh16 = 0x15, "const/high16", F21h;
    ConstWide16 = 0x16, "const-wide/16", F21s;
    ConstWide32 = 0x17, "const-wide/32", F31i;
    ConstWide = 0x18, "const-wide", F51l;
    ConstWideHigh16 = 0x19, "const-wide/high16", F21h;
    ConstString = 0x1a, "const-string", F21c;
    ConstStringJumbo = 0x1b, "const-string/jumbo", F31c;
    ConstClass = 0x1c, "const-class", F21c;
    MonitorEnter = 0x1d, "monitor-enter", F11x;
    MonitorExit = 0x1e, "monitor-exit", F11x;
    CheckCast = 0x1f, "check-cast", F21c;
    InstanceOf = 0x20, "instance-of", F22c;
    ArrayLength = 0x21, "array-length", F12x;
    NewInstance = 0x22, "new-instance", F21c;
    NewArray = 0x23, "new-array", F22c;
    FilledNewArray = 0x24, "filled-new-array", F35c;
    FilledNewArrayRange = 0x25, "filled-new-array/range", F3rc;
    FillArrayData = 0x26, "fill-array-data", F31t;
    Throw = 0x27, "throw", F11x;
    Goto = 0x28, "goto", F10t;
    Goto16 = 0x29, "goto/16", F20t;
    Goto32 = 0x2a, "goto/32", F30t;
    PackedSwitch = 0x2b, "packed-switch", F31t;
    SparseSwitch = 0x2c, "sparse-switch", F31t;
    CmplFloat = 0x2d, "cmpl-float", F23x;
    CmpgFloat = 0x2e, "cmpg-float", F23x;
    CmplDouble = 0x2f, "cmpl-double", F23x;
    CmpgDouble = 0x30, "cmpg-double", F23x;
    CmpLong = 0x31, "cmp-long", F23x;
    IfEq = 0x32, "if-eq", F22t;
    IfNe = 0x33, "if-ne", F22t;
    IfLt = 0x34, "if-lt", F22t;
    IfGe = 0x35, "if-ge", F22t;
    IfGt = 0x36, "if-gt", F22t;
    IfLe = 0x37, "if-le", F22t;
    IfEqz = 0x38, "if-eqz", F21t;
    IfNez = 0x39, "if-nez", F21t;
    IfLtz = 0x3a, "if-ltz", F21t;
    IfGez = 0x3b, "if-gez", F21t;
    IfGtz = 0x3c, "if-gtz", F21t;
    IfLez = 0x3d, "if-lez", F21t;
    Aget = 0x44, "aget", F23x;
    AgetWide = 0x45, "aget-wide", F23x;
    AgetObject = 0x46, "aget-object", F23x;
    AgetBoolean = 0x47, "aget-boolean", F23x;
    AgetByte = 0x48, "aget-byte", F23x;
    AgetChar = 0x49, "aget-char", F23x;
    AgetShort = 0x4a, "aget-short", F23x;
    Aput = 0x4b, "aput", F23x;
    AputWide = 0x4c, "aput-wide", F23x;
    AputObject = 0x4d, "aput-object", F23x;
    AputBoolean = 0x4e, "aput-boolean", F23x;
    AputByte = 0x4f, "aput-byte", F23x;
    AputChar = 0x50, "aput-char", F23x;
    AputShort = 0x51, "aput-short", F23x;
    Iget = 0x52, "iget", F22c;
    IgetWide = 0x53, "iget-wide", F22c;
    IgetObject = 0x54, "iget-object", F22c;
    IgetBoolean = 0x55, "iget-boolean", F22c;
    IgetByte = 0x56, "iget-byte", F22c;
    IgetChar = 0x57, "iget-char", F22c;
    IgetShort = 0x58, "iget-short", F22c;
    Iput = 0x59, "iput", F22c;
    IputWide = 0x5a, "iput-wide", F22c;
    IputObject = 0x5b, "iput-object", F22c;
    IputBoolean = 0x5c, "iput-boolean", F22c;
    IputByte = 0x5d, "iput-byte", F22c;
    IputChar = 0x5e, "iput-char", F22c;
    IputShort = 0x5f, "iput-short", F22c;
    Sget = 0x60, "sget", F21c;
    SgetWide = 0x61, "sget-wide", F21c;
    SgetObject = 0x62, "sget-object", F21c;
    SgetBoolean = 0x63, "sget-boolean", F21c;
    SgetByte = 0x64, "sget-byte", F21c;
    SgetChar = 0x65, "sget-char", F21c;
    SgetShort = 0x66, "sget-short", F21c;
    Sput = 0x67, "sput", F21c;
    SputWide = 0x68, "sput-wide", F21c;
    SputObject = 0x69, "sput-object", F21c;
    SputBoolean = 0x6a, "sput-boolean", F21c;
    SputByte = 0x6b, "sput-byte", F21c;
    SputChar = 0x6c, "sput-char", F21c;
    SputShort = 0x6d, "sput-short", F21c;
    InvokeVirtual = 0x6e, "invoke-virtual", F35c;
    InvokeSuper = 0x6f, "invoke-super", F35c;
    InvokeDirect = 0x70, "invoke-direct", F35c;
    InvokeStatic = 0x71, "invoke-static", F35c;
    InvokeInterface = 0x72, "invoke-interface", F35c;
    InvokeVirtualRange = 0x74, "invoke-virtual/range", F3rc;
    InvokeSuperRange = 0x75, "invoke-super/range", F3rc;
    InvokeDirectRange = 0x76, "invoke-direct/range", F3rc;
    InvokeStaticRange = 0x77, "invoke-static/range", F3rc;
    InvokeInterfaceRange = 0x78, "invoke-interface/range", F3rc;
    NegInt = 0x7b, "neg-int", F12x;
    NotInt = 0x7c, "not-int", F12x;
    NegLong = 0x7d, "neg-long", F12x;
    NotLong = 0x7e, "not-long", F12x;
    NegFloat = 0x7f, "neg-float", F12x;
    NegDouble = 0x80, "neg-double", F12x;
    IntToLong = 0x81, "int-to-long", F12x;
    IntToFloat = 0x82, "int-to-float", F12x;
    IntToDouble = 0x83, "int-to-double", F12x;
    LongToInt = 0x84, "long-to-int", F12x;
    LongToFloat = 0x85, "long-to-float", F12x;
    LongToDouble = 0x86, "long-to-double", F12x;
    FloatToInt = 0x87, "float-to-int", F12x;
    FloatToLong = 0x88, "float-to-long", F12x;
    FloatToDouble = 0x89, "float-to-double", F12x;
    DoubleToInt = 0x8a, "double-to-int", F12x;
    DoubleToLong = 0x8b, "double-to-long", F12x;
    DoubleToFloat = 0x8c, "double-to-float", F12x;
    IntToByte = 0x8d, "int-to-byte", F12x;
    IntToChar = 0x8e, "int-to-char", F12x;
    IntToShort = 0x8f, "int-to-short", F12x;
    AddInt = 0x90, "add-int", F23x;
    SubInt = 0x91, "sub-int", F23x;
    MulInt = 0x92, "mul-int", F23x;
    DivInt = 0x93, "div-int", F23x;
    RemInt = 0x94, "rem-int", F23x;
    AndInt = 0x95, "and-int", F23x;
    OrInt = 0x96, "or-int", F23x;
    XorInt = 0x97, "xor-int", F23x;
    ShlInt = 0x98, "shl-int", F23x;
    ShrInt = 0x99, "shr-int", F23x;
    UshrInt = 0x9a, "ushr-int", F23x;
    AddLong = 0x9b, "add-long", F23x;
    SubLong = 0x9c, "sub-long", F23x;
    MulLong = 0x9d, "mul-long", F23x;
    DivLong = 0x9e, "div-long", F23x;
    RemLong = 0x9f, "rem-long", F23x;
    AndLong = 0xa0, "and-long", F23x;
    OrLong = 0xa1, "or-long", F23x;
    XorLong = 0xa2, "xor-long", F23x;
    ShlLong = 0xa3, "shl-long", F23x;
    ShrLong = 0xa4, "shr-long", F23x;
    UshrLong = 0xa5, "ushr-long", F23x;
    AddFloat = 0xa6, "add-float", F23x;
    SubFloat = 0xa7, "sub-float", F23x;
    MulFloat = 0xa8, "mul-float", F23x;
    DivFloat = 0xa9, "div-float", F23x;
    RemFloat = 0xaa, "rem-float", F23x;
    AddDouble = 0xab, "add-double", F23x;
    SubDouble = 0xac, "sub-double", F23x;
    MulDouble = 0xad, "mul-double", F23x;
    DivDouble = 0xae, "div-double", F23x;
    RemDouble = 0xaf, "rem-double", F23x;
    AddInt2Addr = 0xb0, "add-int/2addr", F12x;
    SubInt2Addr = 0xb1, "sub-int/2addr", F12x;
    MulInt2Addr = 0xb2, "mul-int/2addr", F12x;
    DivInt2Addr = 0xb3, "div-int/2addr", F12x;
    RemInt2Addr = 0xb4, "rem-int/2addr", F12x;
    AndInt2Addr = 0xb5, "and-int/2addr", F12x;
    OrInt2Addr = 0xb6, "or-int/2addr", F12x;
    XorInt2Addr = 0xb7, "xor-int/2addr", F12x;
    ShlInt2Addr = 0xb8, "shl-int/2addr", F12x;
    ShrInt2Addr = 0xb9, "shr-int/2addr", F12x;
    UshrInt2Addr = 0xba, "ushr-int/2addr", F12x;
    AddLong2Addr = 0xbb, "add-long/2addr", F12x;
    SubLong2Addr = 0xbc, "sub-long/2addr", F12x;
    MulLong2Addr = 0xbd, "mul-long/2addr", F12x;
    DivLong2Addr = 0xbe, "div-long/2addr", F12x;
    RemLong2Addr = 0xbf, "rem-long/2addr", F12x;
    AndLong2Addr = 0xc0, "and-long/2addr", F12x;
    OrLong2Addr = 0xc1, "or-long/2addr", F12x;
    XorLong2Addr = 0xc2, "xor-long/2addr", F12x;
    ShlLong2Addr = 0xc3, "shl-long/2addr", F12x;
    ShrLong2Addr = 0xc4, "shr-long/2addr", F12x;
    UshrLong2Addr = 0xc5, "ushr-long/2addr", F12x;
    AddFloat2Addr = 0xc6, "add-float/2addr", F12x;
    SubFloat2Addr = 0xc7, "sub-float/2addr", F12x;
    MulFloat2Addr = 0xc8, "mul-float/2addr", F12x;
    DivFloat2Addr = 0xc9, "div-float/2addr", F12x;
    RemFloat2Addr = 0xca, "rem-float/2addr", F12x;
    AddDouble2Addr = 0xcb, "add-double/2addr", F12x;
    SubDouble2Addr = 0xcc, "sub-double/2addr", F12x;
    MulDouble2Addr = 0xcd, "mul-double/2addr", F12x;
    DivDouble2Addr = 0xce, "div-double/2addr", F12x;
    RemDouble2Addr = 0xcf, "rem-double/2addr", F12x;
    AddIntLit16 = 0xd0, "add-int/lit16", F22s;
    RsubInt = 0xd1, "rsub-int", F22s;
    MulIntLit16 = 0xd2, "mul-int/lit16", F22s;
    DivIntLit16 = 0xd3, "div-int/lit16", F22s;
    RemIntLit16 = 0xd4, "rem-int/lit16", F22s;
    AndIntLit16 = 0xd5, "and-int/lit16", F22s;
    OrIntLit16 = 0xd6, "or-int/lit16", F22s;
    XorIntLit16 = 0xd7, "xor-int/lit16", F22s;
    AddIntLit8 = 0xd8, "add-int/lit8", F22b;
    RsubIntLit8 = 0xd9, "rsub-int/lit8", F22b;
    MulIntLit8 = 0xda, "mul-int/lit8", F22b;
    DivIntLit8 = 0xdb, "div-int/lit8", F22b;
    RemIntLit8 = 0xdc, "rem-int/lit8", F22b;
    AndIntLit8 = 0xdd, "and-int/lit8", F22b;
    OrIntLit8 = 0xde, "or-int/lit8", F22b;
    XorIntLit8 = 0xdf, "xor-int/lit8", F22b;
    ShlIntLit8 = 0xe0, "shl-int/lit8", F22b;
    ShrIntLit8 = 0xe1, "shr-int/lit8", F22b;
    UshrIntLit8 = 0xe2, "ushr-int/lit8", F22b;
    InvokePolymorphic = 0xfa, "invoke-polymorphic", F45cc;
    InvokePolymorphicRange = 0xfb, "invoke-polymorphic/range", F4rcc;
    InvokeCustom = 0xfc, "invoke-custom", F35c;
    InvokeCustomRange = 0xfd, "invoke-custom/range", F3rc;
    ConstMethodHandle = 0xfe, "const-method-handle", F21c;
    ConstMethodType = 0xff, "const-method-type", F21c;
}

/// DEX file format versions, by the number in the file magic.
pub const DEX_035: u32 = 35;
/// Default and static interface methods.
pub const DEX_037: u32 = 37;
/// `invoke-custom` and call sites.
pub const DEX_038: u32 = 38;
/// `invoke-polymorphic` and method handle constants.
pub const DEX_039: u32 = 39;

impl DexOpcode {
    /// Size in code units.
    #[must_use]
    pub const fn units(self) -> u32 {
        self.format().units()
    }

    /// The oldest DEX version that knows this opcode.
    #[must_use]
    pub const fn min_dex_version(self) -> u32 {
        match self {
            DexOpcode::InvokeCustom | DexOpcode::InvokeCustomRange => DEX_038,
            DexOpcode::InvokePolymorphic
            | DexOpcode::InvokePolymorphicRange
            | DexOpcode::ConstMethodHandle
            | DexOpcode::ConstMethodType => DEX_039,
            _ => DEX_035,
        }
    }

    /// `true` for the register-range forms.
    #[must_use]
    pub const fn is_range(self) -> bool {
        matches!(self.format(), Format::F3rc | Format::F4rcc)
    }

    /// `goto`, `goto/16`, `goto/32`
    #[must_use]
    pub const fn is_goto(self) -> bool {
        matches!(self, DexOpcode::Goto | DexOpcode::Goto16 | DexOpcode::Goto32)
    }

    /// Instructions whose offset points at a payload.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        matches!(
            self,
            DexOpcode::PackedSwitch | DexOpcode::SparseSwitch | DexOpcode::FillArrayData
        )
    }

    /// Instructions whose offset is a branch.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self.format(), Format::F10t | Format::F20t | Format::F30t | Format::F21t | Format::F22t)
    }

    /// The mnemonic without its width or form suffix, which is the name of the matching
    /// IR opcode for most instructions: `move/from16` gives `move`, `add-int/2addr` gives
    /// `add-int`.
    #[must_use]
    pub fn base_name(self) -> &'static str {
        let name = self.name();
        match name.split_once('/') {
            Some((base, _)) => base,
            None => name,
        }
    }
}

impl fmt::Display for DexOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

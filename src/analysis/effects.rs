//! The conservative effect model.
//!
//! Every instruction is classified by the observable effects it may have. Dead-code
//! elimination may delete an instruction whose result is dead only when its effects are
//! limited to [`Effects::ALLOC`]: allocation is unobservable once nothing refers to the
//! allocated object. Anything that may throw, store or call is retained.
//!
//! Invocations are [`Effects::CALL`] unless the callee is on the built-in table of
//! side-effect-free standard library methods returned by [`pure_methods`].

use std::{collections::HashSet, sync::OnceLock};

use bitflags::bitflags;

use crate::{
    ir::{IRInstruction, IROpcode},
    pool::DexMethodRef,
};

bitflags! {
    /// Observable effects of an instruction. The empty set means no effect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Effects: u8 {
        /// Allocates an object or interns a constant.
        const ALLOC = 0x1;
        /// May raise an exception.
        const THROW = 0x2;
        /// May write memory visible outside the method or synchronize.
        const STORE = 0x4;
        /// Calls code with unknown effects.
        const CALL = 0x8;
    }
}

impl Effects {
    /// `true` if removing the instruction is unobservable once its result is dead.
    #[must_use]
    pub fn is_removable(self) -> bool {
        !self.intersects(Effects::THROW | Effects::STORE | Effects::CALL)
    }
}

/// Classifies `insn`.
///
/// Invokes of methods listed by [`pure_methods`] count as having no effect.
#[must_use]
pub fn classify(insn: &IRInstruction) -> Effects {
    use IROpcode as Op;

    let op = insn.opcode();
    match op {
        _ if op.is_invoke() => {
            if is_pure_invoke(insn) {
                Effects::empty()
            } else {
                Effects::CALL | Effects::THROW | Effects::STORE
            }
        }
        _ if op.is_aput() || op.is_iput() || op.is_sput() => Effects::STORE | Effects::THROW,
        Op::FillArrayData | Op::MonitorEnter | Op::MonitorExit => Effects::STORE | Effects::THROW,
        Op::NewInstance | Op::NewArray | Op::FilledNewArray | Op::ConstString => Effects::ALLOC,
        Op::Throw
        | Op::CheckCast
        | Op::ArrayLength
        | Op::ConstClass
        | Op::ConstMethodHandle
        | Op::ConstMethodType => Effects::THROW,
        _ if op.is_aget() || op.is_iget() || op.is_sget() => Effects::THROW,
        Op::DivInt | Op::RemInt | Op::DivLong | Op::RemLong => Effects::THROW,
        Op::DivIntLit | Op::RemIntLit => {
            if insn.literal() == Some(0) {
                Effects::THROW
            } else {
                Effects::empty()
            }
        }
        _ => Effects::empty(),
    }
}

/// `true` if `insn` invokes a method from the pure-method table.
#[must_use]
pub fn is_pure_invoke(insn: &IRInstruction) -> bool {
    insn.opcode().is_invoke()
        && insn.opcode() != IROpcode::InvokeSuper
        && insn
            .method()
            .is_some_and(|m| pure_methods().contains(m))
}

const PURE_METHODS: &[&str] = &[
    "Ljava/lang/Boolean;.booleanValue:()Z",
    "Ljava/lang/Boolean;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Boolean;.getBoolean:(Ljava/lang/String;)Z",
    "Ljava/lang/Boolean;.hashCode:()I",
    "Ljava/lang/Boolean;.toString:()Ljava/lang/String;",
    "Ljava/lang/Boolean;.toString:(Z)Ljava/lang/String;",
    "Ljava/lang/Boolean;.valueOf:(Z)Ljava/lang/Boolean;",
    "Ljava/lang/Byte;.byteValue:()B",
    "Ljava/lang/Byte;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Byte;.toString:(B)Ljava/lang/String;",
    "Ljava/lang/Byte;.valueOf:(B)Ljava/lang/Byte;",
    "Ljava/lang/Character;.charValue:()C",
    "Ljava/lang/Character;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Character;.valueOf:(C)Ljava/lang/Character;",
    "Ljava/lang/Character;.toString:(C)Ljava/lang/String;",
    "Ljava/lang/Class;.getName:()Ljava/lang/String;",
    "Ljava/lang/Class;.getSimpleName:()Ljava/lang/String;",
    "Ljava/lang/Double;.compare:(DD)I",
    "Ljava/lang/Double;.doubleValue:()D",
    "Ljava/lang/Double;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Double;.isNaN:(D)Z",
    "Ljava/lang/Double;.toString:(D)Ljava/lang/String;",
    "Ljava/lang/Double;.valueOf:(D)Ljava/lang/Double;",
    "Ljava/lang/Enum;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Enum;.name:()Ljava/lang/String;",
    "Ljava/lang/Enum;.ordinal:()I",
    "Ljava/lang/Enum;.toString:()Ljava/lang/String;",
    "Ljava/lang/Float;.compare:(FF)I",
    "Ljava/lang/Float;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Float;.floatValue:()F",
    "Ljava/lang/Float;.isNaN:(F)Z",
    "Ljava/lang/Float;.toString:(F)Ljava/lang/String;",
    "Ljava/lang/Float;.valueOf:(F)Ljava/lang/Float;",
    "Ljava/lang/Integer;.bitCount:(I)I",
    "Ljava/lang/Integer;.compare:(II)I",
    "Ljava/lang/Integer;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Integer;.intValue:()I",
    "Ljava/lang/Integer;.longValue:()J",
    "Ljava/lang/Integer;.toString:()Ljava/lang/String;",
    "Ljava/lang/Integer;.toString:(I)Ljava/lang/String;",
    "Ljava/lang/Integer;.valueOf:(I)Ljava/lang/Integer;",
    "Ljava/lang/Long;.bitCount:(J)I",
    "Ljava/lang/Long;.compare:(JJ)I",
    "Ljava/lang/Long;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Long;.intValue:()I",
    "Ljava/lang/Long;.longValue:()J",
    "Ljava/lang/Long;.toString:(J)Ljava/lang/String;",
    "Ljava/lang/Long;.valueOf:(J)Ljava/lang/Long;",
    "Ljava/lang/Math;.abs:(D)D",
    "Ljava/lang/Math;.abs:(F)F",
    "Ljava/lang/Math;.abs:(I)I",
    "Ljava/lang/Math;.abs:(J)J",
    "Ljava/lang/Math;.max:(DD)D",
    "Ljava/lang/Math;.max:(II)I",
    "Ljava/lang/Math;.max:(JJ)J",
    "Ljava/lang/Math;.min:(DD)D",
    "Ljava/lang/Math;.min:(II)I",
    "Ljava/lang/Math;.min:(JJ)J",
    "Ljava/lang/Math;.sqrt:(D)D",
    "Ljava/lang/Object;.getClass:()Ljava/lang/Class;",
    "Ljava/lang/Short;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/Short;.shortValue:()S",
    "Ljava/lang/Short;.toString:(S)Ljava/lang/String;",
    "Ljava/lang/Short;.valueOf:(S)Ljava/lang/Short;",
    "Ljava/lang/String;.charAt:(I)C",
    "Ljava/lang/String;.compareTo:(Ljava/lang/String;)I",
    "Ljava/lang/String;.equals:(Ljava/lang/Object;)Z",
    "Ljava/lang/String;.equalsIgnoreCase:(Ljava/lang/String;)Z",
    "Ljava/lang/String;.hashCode:()I",
    "Ljava/lang/String;.indexOf:(I)I",
    "Ljava/lang/String;.isEmpty:()Z",
    "Ljava/lang/String;.length:()I",
    "Ljava/lang/String;.startsWith:(Ljava/lang/String;)Z",
    "Ljava/lang/String;.endsWith:(Ljava/lang/String;)Z",
    "Ljava/lang/String;.substring:(I)Ljava/lang/String;",
    "Ljava/lang/String;.substring:(II)Ljava/lang/String;",
    "Ljava/lang/String;.toString:()Ljava/lang/String;",
    "Ljava/lang/String;.valueOf:(C)Ljava/lang/String;",
    "Ljava/lang/String;.valueOf:(I)Ljava/lang/String;",
    "Ljava/lang/String;.valueOf:(J)Ljava/lang/String;",
    "Ljava/lang/String;.valueOf:(Z)Ljava/lang/String;",
    "Ljava/lang/System;.identityHashCode:(Ljava/lang/Object;)I",
    "Ljava/lang/Thread;.currentThread:()Ljava/lang/Thread;",
];

/// The built-in table of side-effect-free standard library methods.
///
/// The set is interned on first use and shared for the lifetime of the process.
pub fn pure_methods() -> &'static HashSet<DexMethodRef> {
    static PURE: OnceLock<HashSet<DexMethodRef>> = OnceLock::new();
    PURE.get_or_init(|| {
        PURE_METHODS
            .iter()
            .filter_map(|text| DexMethodRef::parse(text).ok())
            .collect()
    })
}

//! The register-based intermediate representation.
//!
//! Method bodies are held as [`IRCode`]: either a linear [`IRList`] of [`MethodItem`]s or
//! an editable [`cfg::ControlFlowGraph`]. Passes normally build the CFG, edit it and clear
//! it again.
//!
//! # Key Components
//!
//! - [`IROpcode`] - the abstract opcode set, including the `load-param*` and
//!   `move-result-pseudo*` pseudo-opcodes
//! - [`IRInstruction`] - opcode, optional destination, sources and one operand
//! - [`MethodItem`] - instructions, branch targets, try markers, catch entries, positions
//!   and source blocks
//! - [`IRList`] - the linear form, with stable item ids
//! - [`cfg`] - the editable control-flow graph and [`cfg::CfgMutation`]
//! - [`CodeBuilder`] - fluent construction of method bodies
//!
//! # Registers
//!
//! Registers are plain `u32` numbers. Wide values (long, double) occupy a pair; the
//! instruction names the low half.

mod builder;
pub mod cfg;
mod code;
mod instruction;
mod item;
mod list;
mod opcode;

pub use builder::{field_opcodes, CatchLabel, CodeBuilder, Label};
pub use code::{DebugItem, IRCode};
pub use instruction::{ArrayData, IRInstruction, Operand, Reg};
pub use item::{
    BranchTarget, CatchEntry, DexPosition, ItemId, MethodItem, SourceBlock, TargetKind, TryKind,
    TryMarker,
};
pub use list::{IRList, IRListIter};
pub use opcode::{IROpcode, NumKind, OperandKind};

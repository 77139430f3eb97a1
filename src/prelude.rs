//! # dexopt Prelude
//!
//! Re-exports of the types most programs built on `dexopt` need: the error type, the
//! program model, the IR builder, the pass pipeline and lowering.
//!
//! ```rust
//! use dexopt::prelude::*;
//!
//! let registry = PassRegistry::with_defaults();
//! assert!(registry.contains("InterDexPass"));
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dexopt operations
pub use crate::Error;

/// The result type used throughout dexopt
pub use crate::Result;

// ================================================================================================
// Constant Pool and Program Model
// ================================================================================================

/// Interned references
pub use crate::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType};

/// Classes, members and the program
pub use crate::model::{
    AccessFlags, ClassHierarchy, DexClass, DexField, DexMethod, DexUnit, Program,
};

// ================================================================================================
// IR
// ================================================================================================

/// Register IR and its builder
pub use crate::ir::{CodeBuilder, IRCode, IRInstruction, IROpcode, Operand, Reg};

/// Control-flow graph
pub use crate::ir::cfg::ControlFlowGraph;

/// Verifier mirror
pub use crate::typecheck::IRTypeChecker;

// ================================================================================================
// Pipeline
// ================================================================================================

/// Pass interface and manager
pub use crate::compiler::{
    Config, ConfigFiles, Metrics, Pass, PassContext, PassManager, PassRegistry, Property,
};

// ================================================================================================
// Lowering
// ================================================================================================

/// Concrete DEX instructions
pub use crate::lowering::{
    lift, lower, lower_program, DexInstruction, DexOpcode, LoweredCode, LoweredProgram,
};

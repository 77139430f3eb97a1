//! IR type checking.
//!
//! The checker re-derives what the Dalvik verifier would infer about every register and
//! rejects methods a pass has left in an unverifiable state. The pass manager runs it
//! before the first pass and, when configured, after every pass.
//!
//! # Architecture
//!
//! - [`IRType`] is the register lattice (`ZERO`, `CONST`, wide halves, `REFERENCE`, ...).
//! - [`TypeState`] pairs it with the [`ClassDomain`](crate::analysis::ClassDomain) of
//!   reference registers.
//! - [`IRTypeChecker`] infers states with the fixpoint iterator and validates each
//!   instruction against the state before it.

mod checker;
mod types;

pub use checker::{IRTypeChecker, TypeCheckerOptions};
pub use types::{IRType, TypeState};

//! Static analysis framework.
//!
//! This module provides the abstract-interpretation machinery the optimization passes
//! build on: lattices, a monotone fixpoint iterator over any graph, forward and reversed
//! views of the editable CFG, register liveness, a class-type lattice and the conservative
//! effect model.
//!
//! # Architecture
//!
//! - **Domains** ([`AbstractDomain`]) define bottom, top, the order, join and widening.
//! - **Analyses** ([`FixpointAnalysis`]) supply node and edge transfer functions.
//! - **The iterator** ([`MonotonicFixpointIterator`]) visits nodes in weak topological
//!   order and exposes `entry_state_at` / `exit_state_at` after convergence.
//!
//! # Example
//!
//! ```rust
//! use dexopt::analysis::LivenessResult;
//! use dexopt::ir::CodeBuilder;
//!
//! let mut b = CodeBuilder::new(2);
//! b.const_int(0, 1).const_int(1, 2).ret(0);
//! let cfg = b.build_cfg();
//!
//! let live = LivenessResult::compute(&cfg);
//! let after = live.live_after_each(&cfg, cfg.entry());
//! assert!(after.values().all(|regs| !regs.contains(1)));
//! ```

mod class_domain;
mod domain;
mod effects;
mod fixpoint;
mod graph;
mod liveness;

pub use class_domain::{ClassDomain, ClassValue};
pub use domain::{AbstractDomain, ConstantDomain, RegisterEnvironment};
pub use effects::{classify, is_pure_invoke, pure_methods, Effects};
pub use fixpoint::{FixpointAnalysis, FixpointGraph, MonotonicFixpointIterator};
pub use graph::{ReversedCfg, ReversedEdge};
pub use liveness::{LiveRegs, LivenessResult};

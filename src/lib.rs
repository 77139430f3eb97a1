// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # dexopt
//!
//! A whole-program optimizer core for Dalvik Executable (DEX) bytecode. `dexopt` holds an
//! application's classes in memory, rewrites method bodies through an ordered pipeline of
//! passes, partitions the classes into dex files under the per-file reference caps, and
//! lowers the optimized register IR back into concrete DEX instructions.
//!
//! Reading and writing `.dex` containers is out of scope; the crate starts from an in-memory
//! [`model::Program`] and ends with [`lowering::LoweredCode`] per method plus the dex
//! partition recorded on the program.
//!
//! ## Features
//!
//! - **Interned constant pool** - strings, types, protos, field and method references are
//!   canonical handles; equality is pointer equality
//! - **Register IR with an editable CFG** - linear item lists with try/catch markers and
//!   positions, lifted into basic blocks with throw edges for optimization
//! - **Abstract interpretation** - a monotonic fixpoint iterator over weak topological
//!   orders, with constant, class and liveness domains
//! - **Verifier mirror** - [`typecheck::IRTypeChecker`] rejects bodies the DEX verifier
//!   would reject, optionally after every pass
//! - **Optimizations** - local DCE, peephole rewrites, redundant check-cast removal, string
//!   simplification and concatenation folding, inlining, copy propagation, register
//!   allocation
//! - **Interdex** - coldstart ordering, canaries, cross-dex reference minimization and
//!   capacity checks
//! - **Lowering** - narrowest encodings, `/2addr` and `/range` forms, payloads, try tables
//!
//! ## Quick Start
//!
//! ```rust
//! use dexopt::prelude::*;
//!
//! let mut b = CodeBuilder::new(2);
//! b.const_int(0, 1)
//!     .const_int(1, 2)
//!     .ret(1);
//! let method = DexMethod::new(
//!     DexMethodRef::parse("LFoo;.two:()I")?,
//!     AccessFlags::PUBLIC | AccessFlags::STATIC,
//! )
//! .with_code(b.build());
//! let mut class = DexClass::new(
//!     DexType::make("LFoo;"),
//!     Some(DexType::object()),
//!     AccessFlags::PUBLIC,
//! );
//! class.add_method(method);
//! let mut program = Program::from_classes(vec![class]);
//!
//! let registry = PassRegistry::with_defaults();
//! let mut manager = PassManager::new(&registry, Config::with_passes(&["LocalDcePass"]))?;
//! manager.run(&mut program)?;
//! assert_eq!(manager.report()["pass_stats"][0]["metrics"]["instructions_removed"], 1);
//!
//! let lowered = lower_program(&program)?;
//! assert_eq!(lowered.methods[0].1.instructions().len(), 2);
//! # Ok::<(), dexopt::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`pool`] - interned strings, types, protos and member references
//! - [`model`] - classes, fields, methods, access flags, the class hierarchy and the program
//! - [`ir`] - the register IR, its instruction lists and the control-flow graph
//! - [`analysis`] - fixpoint iteration, abstract domains, liveness and the effect model
//! - [`typecheck`] - the IR type checker
//! - [`passes`] - the optimization and layout passes
//! - [`compiler`] - the pass trait, registry, manager, configuration and metrics
//! - [`lowering`] - concrete DEX instruction selection and layout
//! - [`utils`] - bit sets and graph orders
//! - [`Error`] and [`Result`] - error handling
//!
//! Invariant violations inside the IR (a split move-result-pseudo pair, unbalanced try
//! markers) are bugs, not data errors, and panic with the location that detected them.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most used types.
pub mod prelude;

/// Abstract interpretation: fixpoint iteration, domains, liveness and effects.
pub mod analysis;

/// Pipeline infrastructure: passes, registry, manager, configuration and metrics.
pub mod compiler;

/// The register IR and its control-flow graph.
pub mod ir;

/// Concrete DEX instruction selection, layout and lifting.
pub mod lowering;

/// Classes, members and the program under optimization.
pub mod model;

/// Optimization and layout passes.
pub mod passes;

/// The interned constant pool.
pub mod pool;

/// The IR type checker.
pub mod typecheck;

/// Bit sets and graph traversal orders.
pub mod utils;

/// `dexopt` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust
/// use dexopt::{pool::DexMethodRef, Result};
///
/// fn arity(sig: &str) -> Result<usize> {
///     Ok(DexMethodRef::parse(sig)?.proto().args().len())
/// }
/// assert_eq!(arity("LFoo;.bar:(IJ)V")?, 2);
/// # Ok::<(), dexopt::Error>(())
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dexopt` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use dexopt::{compiler::{Config, PassManager, PassRegistry}, Error};
///
/// let registry = PassRegistry::with_defaults();
/// match PassManager::new(&registry, Config::with_passes(&["NoSuchPass"])) {
///     Err(Error::UnknownPass(name)) => assert_eq!(name, "NoSuchPass"),
///     _ => unreachable!(),
/// }
/// ```
pub use error::Error;

/// Lowers every method body of a program.
///
/// See [`lowering::lower_program`].
pub use lowering::lower_program;

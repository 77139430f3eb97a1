//! The optimization passes.
//!
//! Every pass implements [`crate::compiler::Pass`] and is activated by name through the
//! [`crate::compiler::PassRegistry`]. Most passes are per-method rewrites over the
//! editable CFG and spread over the thread pool with the [`crate::compiler::walk`]
//! helpers; [`InterDexPass`] and [`DexRemovalPass`] work on the dex list as a whole.
//!
//! # Pass list
//!
//! | Pass | Effect |
//! |------|--------|
//! | [`LocalDcePass`] | Removes dead instructions and unreachable blocks |
//! | [`PeepholePass`] | Rewrites short instruction patterns |
//! | [`RemoveRedundantCheckCastsPass`] | Drops casts the verifier can already prove |
//! | [`CopyPropagationPass`] | Removes moves and constants re-establishing known values |
//! | [`StringSimplificationPass`] | Folds constant string operations |
//! | [`BridgeSynthInlinePass`] | Inlines bridge and synthetic trampolines |
//! | [`CheckRecursionPass`] | Guards deeply self-recursive methods |
//! | [`InterDexPass`] | Distributes classes over dexes |
//! | [`DexRemovalPass`] | Merges partly filled secondaries |
//! | [`WriteBarrierLoweringPass`] | Calls a barrier after reference stores |
//! | [`RegAllocPass`] | Compacts the register frame |
//! | [`TrackResourcesPass`] | Counts reads of resource classes |
//! | [`StringConcatenatorPass`] | Folds constant builder chains in `<clinit>` |
//!
//! The building blocks behind the passes ([`inliner::inline_at`],
//! [`local_dce::LocalDce`], [`peephole::Peephole`]...) are public so frontends can run
//! them on single methods.

pub(crate) mod utils;

pub mod bridge_inline;
pub mod check_cast;
pub mod check_recursion;
pub mod copy_prop;
pub mod dex_removal;
pub mod inliner;
pub mod interdex;
pub mod local_dce;
pub mod peephole;
pub mod regalloc;
pub mod string_concat;
pub mod string_simplification;
pub mod track_resources;
pub mod write_barrier;

pub use bridge_inline::BridgeSynthInlinePass;
pub use check_cast::RemoveRedundantCheckCastsPass;
pub use check_recursion::CheckRecursionPass;
pub use copy_prop::CopyPropagationPass;
pub use dex_removal::DexRemovalPass;
pub use interdex::InterDexPass;
pub use local_dce::{LocalDce, LocalDcePass};
pub use peephole::PeepholePass;
pub use regalloc::RegAllocPass;
pub use string_concat::StringConcatenatorPass;
pub use string_simplification::StringSimplificationPass;
pub use track_resources::TrackResourcesPass;
pub use write_barrier::WriteBarrierLoweringPass;

//! Pipeline infrastructure shared by all passes.
//!
//! This module sits between the IR and the passes:
//!
//! - [`crate::ir`] and [`crate::analysis`]: the code representation and the analyses
//! - [`compiler`](self): pass interface, activation, execution and reporting
//! - [`crate::passes`]: the transformations themselves
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Pass Pipeline                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Config                      JSON tree: pass list, checker,      │
//! │    └─ per-pass options        per-pass option trees              │
//! │                                                                  │
//! │  PassRegistry                name -> fresh pass instance         │
//! │                                                                  │
//! │  PassManager                                                     │
//! │    ├─ activation              look up, configure, check          │
//! │    │                          required properties                │
//! │    ├─ eval_pass               every pass, before any runs        │
//! │    ├─ run_pass                one pass at a time, in order       │
//! │    ├─ IRTypeChecker           after configured passes            │
//! │    └─ final dex-limit check   unless DexLimitsObeyed holds       │
//! │                                                                  │
//! │  Pass trait                  Interface for all passes            │
//! │  PassContext                 metrics, events, reserved budgets   │
//! │  walk                        rayon fan-out over methods          │
//! │  EventLog                    Change tracking and diagnostics     │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod events;
mod manager;
mod metrics;
mod pass;
mod properties;
mod registry;
pub mod walk;

pub use config::{parse_options, Config, ConfigFiles, TypeCheckerConfig};
pub use events::{Event, EventBuilder, EventKind, EventLog};
pub use manager::{verify_dex_limits, PassManager, PassRun};
pub use metrics::Metrics;
pub use pass::{Pass, PassContext, ReservedRefs};
pub use properties::{Interaction, Property, PropertyInteractions, PropertyState};
pub use registry::{PassFactory, PassRegistry};

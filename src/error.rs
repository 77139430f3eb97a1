use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Only recoverable conditions are modelled here. Broken internal invariants (a split
/// move-result-pseudo pair, unbalanced try markers, a wide register half escaping) are bugs and
/// abort through the `invariant!` macro instead of travelling through `Result`.
///
/// # Error Categories
///
/// ## Input Errors
/// - [`Error::Malformed`] - Input that cannot be modelled (bad descriptors, broken IR lists)
/// - [`Error::InvalidBetamap`] - A malformed entry in the interdex class order
///
/// ## Build Failures
/// - [`Error::TypeCheck`] - The IR type checker rejected a method
/// - [`Error::CapacityExceeded`] - A class does not fit into any dex
/// - [`Error::Lowering`] - A method cannot be encoded as DEX instructions
///
/// ## Configuration Errors
/// - [`Error::UnknownPass`] - The pass list names a pass that is not registered
/// - [`Error::MissingProperty`] - A pass requires a property nobody established
/// - [`Error::Config`] - Options that could not be interpreted
///
/// # Examples
///
/// ```rust
/// use dexopt::{Error, passes::interdex::parse_betamap};
///
/// match parse_betamap(&["Lcom/foo/Bar"]) {
///     Err(Error::InvalidBetamap(entry)) => eprintln!("bad betamap entry {entry}"),
///     Err(e) => eprintln!("other error: {e}"),
///     Ok(entries) => println!("{} entries", entries.len()),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input could not be modelled.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An interdex class-order entry is neither a descriptor nor a `.class` name.
    ///
    /// This is a data error in the coldstart list, so frontends may choose to report it
    /// without failing the build.
    #[error("Invalid betamap entry: {0}")]
    InvalidBetamap(String),

    /// A class alone exceeds one of the per-dex reference caps.
    #[error("Class {class} cannot be placed in dex {dex}: {detail}")]
    CapacityExceeded {
        /// Descriptor of the offending class
        class: String,
        /// Ordinal of the dex that was being filled
        dex: usize,
        /// Which cap was exceeded and by how much
        detail: String,
    },

    /// The configured pass list names a pass that is not registered.
    #[error("No pass named {0} is registered")]
    UnknownPass(String),

    /// A pass requires a property that is not established at its position in the pipeline.
    #[error("Pass {pass} requires property {property} which does not hold")]
    MissingProperty {
        /// Name of the pass that declared the requirement
        pass: String,
        /// The missing property
        property: String,
    },

    /// A configuration tree could not be interpreted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The IR type checker rejected a method.
    ///
    /// Carries the method's name and its IR dump so the failure can be diagnosed without
    /// re-running the pipeline.
    #[error("Type check failed for {method}: {message}\n{ir}")]
    TypeCheck {
        /// The rejected method
        method: String,
        /// What the checker found wrong
        message: String,
        /// Printed IR of the method
        ir: String,
    },

    /// A method cannot be lowered to concrete DEX instructions.
    #[error("Lowering failed: {0}")]
    Lowering(String),

    /// JSON (de)serialization error.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
}

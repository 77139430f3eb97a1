//! Pipeline configuration.
//!
//! A [`Config`] is a JSON tree. Known top-level keys configure the manager and the type
//! checker; every other key is kept verbatim as the option tree of the pass of that name.
//!
//! ```rust
//! use dexopt::compiler::Config;
//!
//! let config = Config::from_json_str(r#"{
//!     "passes": ["LocalDcePass", "InterDexPass"],
//!     "ir_type_checker": {"run_after_each_pass": true},
//!     "InterDexPass": {"minimize_cross_dex_refs": false}
//! }"#)?;
//! assert_eq!(config.passes.len(), 2);
//! assert!(config.ir_type_checker.polymorphic_constants);
//! assert!(config.pass_options("InterDexPass").is_some());
//! # Ok::<(), dexopt::Error>(())
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{typecheck::TypeCheckerOptions, Error, Result};

/// When and how the IR type checker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeCheckerConfig {
    /// Check every method after every pass.
    pub run_after_each_pass: bool,
    /// See [`TypeCheckerOptions::polymorphic_constants`].
    pub polymorphic_constants: bool,
    /// See [`TypeCheckerOptions::verify_moves`].
    pub verify_moves: bool,
    /// Passes after which the checker runs even when `run_after_each_pass` is off.
    pub run_after_passes: Vec<String>,
}

impl Default for TypeCheckerConfig {
    fn default() -> Self {
        Self {
            run_after_each_pass: false,
            polymorphic_constants: true,
            verify_moves: false,
            run_after_passes: Vec::new(),
        }
    }
}

impl TypeCheckerConfig {
    /// The checker options.
    #[must_use]
    pub fn options(&self) -> TypeCheckerOptions {
        TypeCheckerOptions {
            polymorphic_constants: self.polymorphic_constants,
            verify_moves: self.verify_moves,
        }
    }

    /// `true` if the checker runs after `pass`.
    #[must_use]
    pub fn runs_after(&self, pass: &str) -> bool {
        self.run_after_each_pass || self.run_after_passes.iter().any(|p| p == pass)
    }

    /// `true` if the checker runs at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.run_after_each_pass || !self.run_after_passes.is_empty()
    }
}

/// The configuration tree consumed by the pass manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pass names in execution order; a name may repeat.
    pub passes: Vec<String>,
    /// Type checker settings.
    pub ir_type_checker: TypeCheckerConfig,
    /// Minimum API level, overriding the program's.
    pub min_sdk: Option<u32>,
    /// Output directory of the app, opaque to the core.
    pub apk_dir: Option<String>,
    /// Path of the coldstart class list.
    pub coldstart_classes: Option<String>,
    /// Path of the ProGuard map, opaque to the core.
    pub proguard_map: Option<String>,
    /// Option trees keyed by pass name.
    #[serde(flatten)]
    pub pass_options: BTreeMap<String, Value>,
}

impl Config {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed JSON or mistyped known keys.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Interprets an already parsed JSON tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for mistyped known keys.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be read, [`Error::Json`] if it does
    /// not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// A configuration running `passes` with defaults everywhere else.
    #[must_use]
    pub fn with_passes<S: AsRef<str>>(passes: &[S]) -> Self {
        Self {
            passes: passes.iter().map(|p| p.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }

    /// The raw option tree of `pass`.
    #[must_use]
    pub fn pass_options(&self, pass: &str) -> Option<&Value> {
        self.pass_options.get(pass)
    }

    /// Sets the option tree of `pass`.
    pub fn set_pass_options(&mut self, pass: &str, options: Value) {
        self.pass_options.insert(pass.to_string(), options);
    }

    /// Deserializes the options of `pass`, falling back to `T::default()` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the pass if the tree does not fit `T`.
    pub fn options_for<T: DeserializeOwned + Default>(&self, pass: &str) -> Result<T> {
        match self.pass_options(pass) {
            None => Ok(T::default()),
            Some(v) => parse_options(pass, v),
        }
    }
}

/// Deserializes a pass option tree.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the pass if the tree does not fit `T`.
pub fn parse_options<T: DeserializeOwned>(pass: &str, options: &Value) -> Result<T> {
    serde_json::from_value(options.clone())
        .map_err(|e| Error::Config(format!("invalid options for {pass}: {e}")))
}

/// Inputs the configuration points at, loaded by the frontend.
#[derive(Debug, Clone, Default)]
pub struct ConfigFiles {
    /// Interdex class order, one entry per line.
    pub coldstart_classes: Vec<String>,
    /// Resolved output directory.
    pub apk_dir: Option<PathBuf>,
}

impl ConfigFiles {
    /// Loads the files named by `config`. Missing keys yield empty inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if a named file cannot be read.
    pub fn load(config: &Config) -> Result<Self> {
        let coldstart_classes = match &config.coldstart_classes {
            Some(path) => Self::split_lines(&std::fs::read_to_string(path)?),
            None => Vec::new(),
        };
        Ok(Self {
            coldstart_classes,
            apk_dir: config.apk_dir.as_ref().map(PathBuf::from),
        })
    }

    /// Files holding the given coldstart list.
    #[must_use]
    pub fn with_coldstart<S: AsRef<str>>(classes: &[S]) -> Self {
        Self {
            coldstart_classes: classes.iter().map(|c| c.as_ref().to_string()).collect(),
            apk_dir: None,
        }
    }

    fn split_lines(text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

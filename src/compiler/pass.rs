//! The pass interface.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::{
    compiler::{Config, ConfigFiles, EventLog, Metrics, Property, PropertyInteractions},
    model::Program,
    Result,
};

/// A whole-program transformation.
///
/// Passes are created by the [`PassRegistry`](crate::compiler::PassRegistry), configured
/// from their option tree, evaluated once before any pass runs, and finally run in
/// pipeline order. Per-method work inside `run_pass` should go through the
/// [`walk`](crate::compiler::walk) helpers so it spreads over the thread pool.
pub trait Pass: Send + Sync {
    /// The name the pass is activated by in [`Config::passes`].
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str {
        "No description available"
    }

    /// Reads the pass's option tree. Called only when the configuration has one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the tree does not match the pass's options.
    fn configure(&mut self, _options: &Value) -> Result<()> {
        Ok(())
    }

    /// How the pass affects program properties. Properties not listed are destroyed.
    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::new()
    }

    /// Properties that must hold when the pass starts.
    fn requires(&self) -> Vec<Property> {
        Vec::new()
    }

    /// Cheap pre-analysis run for every pass before the first pass runs; may reserve
    /// reference budgets through [`PassContext::reserved`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pre-analysis fails.
    fn eval_pass(&mut self, _program: &Program, _ctx: &PassContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Transforms the program.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be transformed; the pipeline stops.
    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()>;
}

/// Reference budgets reserved by passes for classes they will add after interdex.
#[derive(Debug, Default)]
pub struct ReservedRefs {
    methods: AtomicUsize,
    fields: AtomicUsize,
    types: AtomicUsize,
}

impl ReservedRefs {
    /// Reserves room in every dex.
    pub fn reserve(&self, methods: usize, fields: usize, types: usize) {
        self.methods.fetch_add(methods, Ordering::Relaxed);
        self.fields.fetch_add(fields, Ordering::Relaxed);
        self.types.fetch_add(types, Ordering::Relaxed);
    }

    /// Reserved method references.
    #[must_use]
    pub fn methods(&self) -> usize {
        self.methods.load(Ordering::Relaxed)
    }

    /// Reserved field references.
    #[must_use]
    pub fn fields(&self) -> usize {
        self.fields.load(Ordering::Relaxed)
    }

    /// Reserved type references.
    #[must_use]
    pub fn types(&self) -> usize {
        self.types.load(Ordering::Relaxed)
    }
}

/// What a running pass can see of the manager.
pub struct PassContext<'a> {
    /// The whole configuration.
    pub config: &'a Config,
    /// Inputs the configuration points at.
    pub files: &'a ConfigFiles,
    /// Counters of this pass invocation.
    pub metrics: &'a Metrics,
    /// The run's event log.
    pub events: &'a EventLog,
    /// Budgets reserved during evaluation.
    pub reserved: &'a ReservedRefs,
    /// Position of the invocation in the pass list.
    pub index: usize,
    /// How many earlier invocations of the same pass precede this one.
    pub occurrence: usize,
}

impl PassContext<'_> {
    /// Adds `n` to the metric `key` of this invocation.
    pub fn incr_metric(&self, key: &str, n: i64) {
        self.metrics.incr(key, n);
    }

    /// Sets the metric `key` of this invocation.
    pub fn set_metric(&self, key: &str, n: i64) {
        self.metrics.set(key, n);
    }
}

//! Name-to-pass lookup used at activation.

use std::collections::BTreeMap;

use crate::{
    compiler::Pass,
    passes::{
        BridgeSynthInlinePass, CheckRecursionPass, CopyPropagationPass, DexRemovalPass,
        InterDexPass, LocalDcePass, PeepholePass, RegAllocPass, RemoveRedundantCheckCastsPass,
        StringConcatenatorPass, StringSimplificationPass, TrackResourcesPass,
        WriteBarrierLoweringPass,
    },
    Error, Result,
};

/// Creates a fresh, unconfigured pass.
pub type PassFactory = fn() -> Box<dyn Pass>;

/// The passes that can be named in [`Config::passes`](crate::compiler::Config::passes).
///
/// Every activation creates a new instance, so a pass listed twice runs as two
/// independent invocations with their own options and state.
///
/// ```rust
/// use dexopt::compiler::PassRegistry;
///
/// let registry = PassRegistry::with_defaults();
/// assert!(registry.contains("InterDexPass"));
/// assert!(registry.create("NoSuchPass").is_err());
/// ```
#[derive(Clone, Default)]
pub struct PassRegistry {
    factories: BTreeMap<String, PassFactory>,
}

impl PassRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in pass.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("LocalDcePass", || Box::new(LocalDcePass::new()));
        registry.register("PeepholePass", || Box::new(PeepholePass::new()));
        registry.register("RemoveRedundantCheckCastsPass", || {
            Box::new(RemoveRedundantCheckCastsPass::new())
        });
        registry.register("CopyPropagationPass", || Box::new(CopyPropagationPass::new()));
        registry.register("StringSimplificationPass", || {
            Box::new(StringSimplificationPass::new())
        });
        registry.register("BridgeSynthInlinePass", || Box::new(BridgeSynthInlinePass::new()));
        registry.register("CheckRecursionPass", || Box::new(CheckRecursionPass::new()));
        registry.register("InterDexPass", || Box::new(InterDexPass::new()));
        registry.register("DexRemovalPass", || Box::new(DexRemovalPass::new()));
        registry.register("WriteBarrierLoweringPass", || {
            Box::new(WriteBarrierLoweringPass::new())
        });
        registry.register("RegAllocPass", || Box::new(RegAllocPass::new()));
        registry.register("TrackResourcesPass", || Box::new(TrackResourcesPass::new()));
        registry.register("StringConcatenatorPass", || Box::new(StringConcatenatorPass::new()));
        registry
    }

    /// Adds or replaces the pass activated by `name`.
    pub fn register(&mut self, name: &str, factory: PassFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// `true` if `name` can be activated.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Creates the pass activated by `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPass`] if nothing is registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Pass>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownPass(name.to_string()))
    }
}

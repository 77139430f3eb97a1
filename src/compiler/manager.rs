//! Pipeline execution.
//!
//! The [`PassManager`] turns the configured pass list into pass instances, validates the
//! property requirements of the whole list up front, and then runs the passes one after
//! another over the program. Per-method work inside a pass is parallel; the passes
//! themselves never overlap.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use log::{debug, info};
use rayon::prelude::*;
use serde_json::{json, Value};

use crate::{
    compiler::{
        Config, ConfigFiles, EventLog, Metrics, Pass, PassContext, PassRegistry, Property,
        PropertyState, ReservedRefs,
    },
    model::{DexMethod, Program},
    passes::interdex::{DexLimits, DexRefs},
    typecheck::IRTypeChecker,
    Error, Result,
};

/// What one invocation of a pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRun {
    /// Name of the pass.
    pub name: String,
    /// Position in the pass list.
    pub index: usize,
    /// Earlier invocations of the same pass.
    pub occurrence: usize,
    /// Counters the pass reported, `pass_order` included.
    pub metrics: BTreeMap<String, i64>,
    /// Time spent in `run_pass`.
    pub wall_time: Duration,
}

struct Activation {
    pass: Box<dyn Pass>,
    occurrence: usize,
    metrics: Metrics,
}

/// Runs the configured passes over a program.
///
/// # Examples
///
/// ```rust
/// use dexopt::compiler::{Config, PassManager, PassRegistry};
/// use dexopt::model::Program;
///
/// let config = Config::with_passes(&["LocalDcePass", "PeepholePass", "LocalDcePass"]);
/// let mut manager = PassManager::new(&PassRegistry::with_defaults(), config)?;
/// let mut program = Program::from_classes(Vec::new());
/// manager.run(&mut program)?;
///
/// let report = manager.report();
/// assert_eq!(report["pass_stats"].as_array().map(Vec::len), Some(3));
/// # Ok::<(), dexopt::Error>(())
/// ```
pub struct PassManager {
    config: Config,
    files: ConfigFiles,
    activations: Vec<Activation>,
    events: EventLog,
    reserved: ReservedRefs,
    runs: Vec<PassRun>,
    properties: PropertyState,
}

impl PassManager {
    /// Activates every pass named by `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPass`] for a name the registry does not know.
    /// - [`Error::Config`] for option trees a pass rejects.
    /// - [`Error::MissingProperty`] if a pass requires a property that does not hold at its
    ///   position in the list.
    pub fn new(registry: &PassRegistry, config: Config) -> Result<Self> {
        let mut activations = Vec::with_capacity(config.passes.len());
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for name in &config.passes {
            let mut pass = registry.create(name)?;
            if let Some(options) = config.pass_options(name) {
                pass.configure(options)?;
            }
            let occurrence = seen.entry(name.as_str()).or_default();
            activations.push(Activation {
                pass,
                occurrence: *occurrence,
                metrics: Metrics::new(),
            });
            *occurrence += 1;
        }

        let mut properties = PropertyState::new();
        for activation in &activations {
            for required in activation.pass.requires() {
                if !properties.holds(required) {
                    return Err(Error::MissingProperty {
                        pass: activation.pass.name().to_string(),
                        property: required.to_string(),
                    });
                }
            }
            properties.apply(&activation.pass.property_interactions());
        }

        Ok(Self {
            config,
            files: ConfigFiles::default(),
            activations,
            events: EventLog::new(),
            reserved: ReservedRefs::default(),
            runs: Vec::new(),
            properties: PropertyState::new(),
        })
    }

    /// Supplies the inputs the configuration points at.
    #[must_use]
    pub fn with_files(mut self, files: ConfigFiles) -> Self {
        self.files = files;
        self
    }

    /// The configuration the manager was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Transformations recorded by the passes.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Invocations completed so far, in order.
    #[must_use]
    pub fn runs(&self) -> &[PassRun] {
        &self.runs
    }

    /// Metrics of the `occurrence`-th invocation of `pass`.
    #[must_use]
    pub fn metrics_of(&self, pass: &str, occurrence: usize) -> Option<&BTreeMap<String, i64>> {
        self.runs
            .iter()
            .find(|r| r.name == pass && r.occurrence == occurrence)
            .map(|r| &r.metrics)
    }

    /// `true` if `property` held after the last pass.
    #[must_use]
    pub fn holds(&self, property: Property) -> bool {
        self.properties.holds(property)
    }

    /// Evaluates and runs every activated pass over `program`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing pass and returns its error. A configured type check that
    /// rejects a method yields [`Error::TypeCheck`]; a dex over its caps at the end of the
    /// run yields [`Error::CapacityExceeded`].
    pub fn run(&mut self, program: &mut Program) -> Result<()> {
        let checker = &self.config.ir_type_checker;
        if checker.enabled() {
            debug!("type checking input");
            self.type_check(program)?;
        }

        for (index, activation) in self.activations.iter_mut().enumerate() {
            let ctx = PassContext {
                config: &self.config,
                files: &self.files,
                metrics: &activation.metrics,
                events: &self.events,
                reserved: &self.reserved,
                index,
                occurrence: activation.occurrence,
            };
            activation.pass.eval_pass(program, &ctx)?;
        }

        self.properties = PropertyState::new();
        for index in 0..self.activations.len() {
            let run = self.run_one(index, program)?;
            if self.config.ir_type_checker.runs_after(&run.name) {
                debug!("type checking after {}", run.name);
                self.type_check(program)?;
            }
            self.runs.push(run);
        }

        if self.properties.holds_strictly(Property::DexLimitsObeyed) {
            debug!("dex limits established, skipping final verification");
        } else {
            verify_dex_limits(program)?;
        }
        Ok(())
    }

    fn run_one(&mut self, index: usize, program: &mut Program) -> Result<PassRun> {
        let activation = &mut self.activations[index];
        let name = activation.pass.name().to_string();
        info!("running {name} (#{index})");
        activation.metrics.set("pass_order", index as i64);

        let ctx = PassContext {
            config: &self.config,
            files: &self.files,
            metrics: &activation.metrics,
            events: &self.events,
            reserved: &self.reserved,
            index,
            occurrence: activation.occurrence,
        };
        let start = Instant::now();
        activation.pass.run_pass(program, &ctx)?;
        let wall_time = start.elapsed();

        let metrics = activation.metrics.snapshot();
        info!("{name} finished in {wall_time:?}");
        for (key, value) in &metrics {
            debug!("  {key} = {value}");
        }
        self.properties
            .apply(&activation.pass.property_interactions());

        Ok(PassRun {
            name,
            index,
            occurrence: activation.occurrence,
            metrics,
            wall_time,
        })
    }

    fn type_check(&self, program: &Program) -> Result<()> {
        let hierarchy = program.hierarchy();
        let options = self.config.ir_type_checker.options();
        let methods: Vec<&DexMethod> = program.methods().filter(|m| m.code().is_some()).collect();
        methods.into_par_iter().try_for_each(|method| {
            IRTypeChecker::new(method)
                .with_hierarchy(&hierarchy)
                .with_options(options)
                .check()
        })
    }

    /// Per-pass metrics and wall times of the completed run.
    ///
    /// ```json
    /// {
    ///   "pass_stats": [
    ///     {"pass_name": "LocalDcePass", "occurrence": 0, "wall_time_ms": 3,
    ///      "metrics": {"pass_order": 0, "instructions_removed": 12}}
    ///   ],
    ///   "total_wall_time_ms": 3,
    ///   "num_events": 12
    /// }
    /// ```
    #[must_use]
    pub fn report(&self) -> Value {
        let stats: Vec<Value> = self
            .runs
            .iter()
            .map(|run| {
                json!({
                    "pass_name": run.name,
                    "occurrence": run.occurrence,
                    "wall_time_ms": run.wall_time.as_millis() as u64,
                    "metrics": run.metrics,
                })
            })
            .collect();
        let total: Duration = self.runs.iter().map(|r| r.wall_time).sum();
        json!({
            "pass_stats": stats,
            "total_wall_time_ms": total.as_millis() as u64,
            "num_events": self.events.len(),
        })
    }
}

/// Checks every dex of `program` against the unreserved caps of its API level.
///
/// # Errors
///
/// Returns [`Error::CapacityExceeded`] naming the last class of the first dex over a cap.
pub fn verify_dex_limits(program: &Program) -> Result<()> {
    let limits = DexLimits::for_min_sdk(program.min_sdk());
    for (ordinal, dex) in program.dexes().iter().enumerate() {
        let refs = DexRefs::of_classes(&dex.classes);
        let over = [
            ("method", refs.num_methods(), limits.methods),
            ("field", refs.num_fields(), limits.fields),
            ("type", refs.num_types(), limits.types),
        ]
        .into_iter()
        .find(|&(_, count, limit)| count > limit);
        if let Some((kind, count, limit)) = over {
            let class = dex
                .classes
                .last()
                .map(|c| c.ty().to_string())
                .unwrap_or_default();
            return Err(Error::CapacityExceeded {
                class,
                dex: ordinal,
                detail: format!("{count} {kind} refs, cap {limit}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        compiler::{Interaction, PropertyInteractions},
        ir::IROpcode,
        test::helpers::{program_of, static_method},
    };

    fn dead_const_program() -> Program {
        program_of(vec![static_method("LFoo;.f:()V", 2, |b| {
            b.const_int(0, 1).const_int(1, 2).return_void();
        })])
    }

    #[test]
    fn test_repeated_passes_are_independent_invocations() {
        let config = Config::with_passes(&["LocalDcePass", "PeepholePass", "LocalDcePass"]);
        let mut manager = PassManager::new(&PassRegistry::with_defaults(), config).unwrap();
        let mut program = dead_const_program();
        manager.run(&mut program).unwrap();

        assert_eq!(manager.runs().len(), 3);
        assert_eq!(manager.metrics_of("LocalDcePass", 0).unwrap()["pass_order"], 0);
        assert_eq!(manager.metrics_of("LocalDcePass", 1).unwrap()["pass_order"], 2);
        assert_eq!(manager.metrics_of("PeepholePass", 0).unwrap()["pass_order"], 1);

        let ops: Vec<IROpcode> = program
            .methods()
            .next()
            .unwrap()
            .code()
            .unwrap()
            .instructions()
            .iter()
            .map(|i| i.opcode())
            .collect();
        assert_eq!(ops, vec![IROpcode::ReturnVoid]);
    }

    #[test]
    fn test_unknown_pass_rejected_at_activation() {
        let config = Config::with_passes(&["LocalDcePass", "FancyPass"]);
        let err = PassManager::new(&PassRegistry::with_defaults(), config).err();
        assert!(matches!(err, Some(Error::UnknownPass(name)) if name == "FancyPass"));
    }

    #[test]
    fn test_requirements_checked_at_activation() {
        let mut registry = PassRegistry::with_defaults();
        registry.register("Scrambler", || Box::new(Marker(PropertyInteractions::new())));
        let err = PassManager::new(&registry, Config::with_passes(&["DexRemovalPass"])).err();
        assert!(matches!(err, Some(Error::MissingProperty { .. })));

        let ok = PassManager::new(
            &registry,
            Config::with_passes(&["InterDexPass", "TrackResourcesPass", "DexRemovalPass"]),
        );
        assert!(ok.is_ok());

        // unmentioned properties are destroyed
        let err = PassManager::new(
            &registry,
            Config::with_passes(&["InterDexPass", "Scrambler", "DexRemovalPass"]),
        )
        .err();
        assert!(matches!(err, Some(Error::MissingProperty { pass, .. }) if pass == "DexRemovalPass"));
    }

    #[test]
    fn test_options_reach_the_pass() {
        let mut config = Config::with_passes(&["CheckRecursionPass"]);
        config.set_pass_options("CheckRecursionPass", json!({"bad_recursion_count": "x"}));
        let err = PassManager::new(&PassRegistry::with_defaults(), config).err();
        assert!(matches!(err, Some(Error::Config(msg)) if msg.contains("CheckRecursionPass")));
    }

    #[test]
    fn test_type_check_after_pass() {
        let mut config = Config::with_passes(&["PeepholePass"]);
        config.ir_type_checker.run_after_each_pass = true;
        let mut manager = PassManager::new(&PassRegistry::with_defaults(), config).unwrap();
        // long read from an int register
        let mut program = program_of(vec![static_method("LFoo;.bad:()J", 2, |b| {
            b.const_int(0, 1).ret_wide(0);
        })]);
        let err = manager.run(&mut program).unwrap_err();
        match err {
            Error::TypeCheck { method, ir, .. } => {
                assert!(method.contains("bad"));
                assert!(!ir.is_empty());
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_report_shape() {
        let config = Config::with_passes(&["LocalDcePass"]);
        let mut manager = PassManager::new(&PassRegistry::with_defaults(), config).unwrap();
        manager.run(&mut dead_const_program()).unwrap();
        let report = manager.report();
        let stats = report["pass_stats"].as_array().unwrap();
        assert_eq!(stats[0]["pass_name"], "LocalDcePass");
        assert_eq!(stats[0]["metrics"]["pass_order"], 0);
        assert!(report["total_wall_time_ms"].is_u64());
    }

    struct Marker(PropertyInteractions);

    impl Pass for Marker {
        fn name(&self) -> &'static str {
            "Marker"
        }

        fn property_interactions(&self) -> PropertyInteractions {
            self.0.clone()
        }

        fn run_pass(&mut self, _: &mut Program, _: &PassContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_final_limit_check_skipped_when_established() {
        let mut registry = PassRegistry::new();
        registry.register("Establish", || {
            Box::new(Marker(PropertyInteractions::from([(
                Property::DexLimitsObeyed,
                Interaction::Establishes,
            )])))
        });
        registry.register("Downgrade", || {
            Box::new(Marker(PropertyInteractions::from([(
                Property::DexLimitsObeyed,
                Interaction::PreservesButDowngrades,
            )])))
        });

        let mut manager =
            PassManager::new(&registry, Config::with_passes(&["Establish"])).unwrap();
        manager.run(&mut dead_const_program()).unwrap();
        assert!(manager.holds(Property::DexLimitsObeyed));

        let mut manager =
            PassManager::new(&registry, Config::with_passes(&["Establish", "Downgrade"])).unwrap();
        manager.run(&mut dead_const_program()).unwrap();
        assert!(manager.holds(Property::DexLimitsObeyed));
    }
}

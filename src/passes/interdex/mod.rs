//! Distribution of classes over dex files.
//!
//! A dex file indexes methods, fields and types with 16-bit ids, so an app with more
//! than 64K of any of them needs several dexes. Which class lands where matters at
//! runtime: classes loaded during startup should sit together at the front, and classes
//! that reference each other should share a dex so the shared references are paid once.
//!
//! [`InterDexPass`] rebuilds the dex list of the program:
//!
//! 1. The primary dex keeps the classes of the input primary dexes.
//! 2. The betamap, an ordered class list with region markers (see [`betamap`]), places
//!    the coldstart classes and labels their dexes.
//! 3. Every other class is grouped by [`minimizer::CrossDexRefMinimizer`].
//! 4. Classes marked dynamically dead come last.
//!
//! Every secondary dex starts with a canary class `Lsecondary/dexNN/Canary;` and the
//! pass writes one manifest line per dex (see [`manifest`]).
//!
//! # Examples
//!
//! ```rust,ignore
//! use dexopt::passes::interdex::betamap::parse_betamap;
//!
//! let entries = parse_betamap(&["Lcom/app/Main;", "DexEndMarker0.class"])?;
//! assert_eq!(entries.len(), 2);
//! ```

pub mod betamap;
pub mod limits;
pub mod manifest;
pub mod minimizer;
pub mod packer;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions,
    },
    model::{DexUnit, Program},
    pool::DexType,
    Result,
};

pub use betamap::{parse_betamap, BetamapEntry};
pub use limits::{DexLimits, DexRefs, Reservation};
pub use manifest::{manifest_entries, render_manifest, write_manifest, ManifestEntry};
pub use minimizer::{CrossDexRefMinimizer, MinimizerWeights};
pub use packer::{pack, PackOptions, PackStats, Packed};

/// Options of [`InterDexPass`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterDexConfig {
    /// Follow the betamap.
    pub order_interdex: bool,
    /// Group the remaining classes to share references.
    pub minimize_cross_dex_refs: bool,
    /// Move dynamically dead classes behind everything else.
    pub reorder_dynamically_dead_classes: bool,
    /// Method references kept free in every dex.
    pub reserved_mrefs: usize,
    /// Field references kept free in every dex.
    pub reserved_frefs: usize,
    /// Type references kept free in every dex.
    pub reserved_trefs: usize,
    /// Write the manifest into the output directory when one is configured.
    pub emit_manifest: bool,
    /// Minimizer weights.
    #[serde(flatten)]
    pub weights: MinimizerWeights,
}

impl Default for InterDexConfig {
    fn default() -> Self {
        Self {
            order_interdex: true,
            minimize_cross_dex_refs: true,
            reorder_dynamically_dead_classes: true,
            reserved_mrefs: 0,
            reserved_frefs: 0,
            reserved_trefs: 0,
            emit_manifest: true,
            weights: MinimizerWeights::default(),
        }
    }
}

impl InterDexConfig {
    fn reservation(&self) -> Reservation {
        Reservation {
            methods: self.reserved_mrefs,
            fields: self.reserved_frefs,
            types: self.reserved_trefs,
        }
    }
}

/// `InterDexPass`.
#[derive(Debug, Default)]
pub struct InterDexPass {
    config: InterDexConfig,
    manifest: Vec<ManifestEntry>,
}

impl InterDexPass {
    /// Creates the pass with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the pass with `config`.
    #[must_use]
    pub fn with_config(config: InterDexConfig) -> Self {
        Self {
            config,
            manifest: Vec::new(),
        }
    }

    /// The manifest of the last run.
    #[must_use]
    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }
}

fn primary_classes(dexes: &[DexUnit]) -> Vec<DexType> {
    dexes
        .iter()
        .filter(|d| d.info.primary)
        .flat_map(|d| d.classes.iter().map(|c| c.ty().clone()))
        .collect()
}

impl Pass for InterDexPass {
    fn name(&self) -> &'static str {
        "InterDexPass"
    }

    fn description(&self) -> &'static str {
        "Assign classes to dex files following the coldstart order and reference caps"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::DexLimitsObeyed, Interaction::Establishes),
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let betamap = parse_betamap(&ctx.files.coldstart_classes)?;
        let min_sdk = ctx.config.min_sdk.unwrap_or_else(|| program.min_sdk());
        let reserved = Reservation {
            methods: ctx.reserved.methods(),
            fields: ctx.reserved.fields(),
            types: ctx.reserved.types(),
        };
        let limits = DexLimits::for_min_sdk(min_sdk).reserving(&self.config.reservation().plus(reserved));
        debug!(
            "dex caps for API {min_sdk}: {} methods, {} fields, {} types",
            limits.methods, limits.fields, limits.types
        );
        let options = PackOptions {
            order_interdex: self.config.order_interdex,
            minimize_cross_dex_refs: self.config.minimize_cross_dex_refs,
            reorder_dynamically_dead_classes: self.config.reorder_dynamically_dead_classes,
            weights: self.config.weights,
            limits,
        };

        let primary = primary_classes(program.dexes());
        let Packed { dexes, stats } = pack(program.take_classes(), &primary, &betamap, &options)?;

        self.manifest = manifest_entries(&dexes);
        for entry in &self.manifest {
            ctx.events
                .record(EventKind::DexClosed)
                .message(entry.to_string());
        }
        if self.config.emit_manifest {
            if let Some(dir) = &ctx.files.apk_dir {
                let path = write_manifest(dir, &dexes)?;
                debug!("wrote {}", path.display());
            }
        }

        let coldstart_dexes = dexes.iter().filter(|d| d.info.coldstart).count();
        info!(
            "{} dexes ({coldstart_dexes} coldstart), {} betamap classes missing",
            dexes.len(),
            stats.betamap_missing_classes
        );
        ctx.set_metric("num_dexes", dexes.len() as i64);
        ctx.set_metric("num_coldstart_dexes", coldstart_dexes as i64);
        ctx.set_metric("num_canaries", stats.canaries as i64);
        ctx.set_metric("num_coldstart_classes", stats.coldstart_classes as i64);
        ctx.set_metric("num_deferred_dead_classes", stats.deferred_dead_classes as i64);
        ctx.set_metric("betamap_missing_classes", stats.betamap_missing_classes as i64);

        program.set_dexes(dexes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::ConfigFiles,
        model::DexInfo,
        test::helpers::{class, run_pass_with},
    };

    fn s6_program() -> Program {
        let primary = DexUnit::new(
            vec![class("LPrimary;"), class("LC0;")],
            DexInfo {
                primary: true,
                ..DexInfo::default()
            },
        );
        let rest = DexUnit::new(
            (1..=12).map(|i| class(&format!("LC{i};"))).collect(),
            DexInfo::default(),
        );
        Program::new(vec![primary, rest], 21)
    }

    fn s6_betamap() -> Vec<String> {
        let mut lines: Vec<String> = vec!["LPrimary;".into(), "LC0;".into(), "DexEndMarker0.class".into()];
        lines.extend((1..=6).map(|i| format!("LC{i};")));
        lines.push("ColdStart20PctEnd.class".into());
        lines.extend((9..=12).map(|i| format!("LC{i};")));
        lines.push("DexEndMarker0.class".into());
        lines
    }

    /// Caps of two classes per secondary: canary, `Object` and two classes.
    fn two_per_dex() -> InterDexPass {
        InterDexPass::with_config(InterDexConfig {
            reserved_trefs: limits::MAX_TYPE_REFS_PRE_26 - 4,
            minimize_cross_dex_refs: false,
            ..InterDexConfig::default()
        })
    }

    fn names(dex: &DexUnit) -> Vec<String> {
        dex.classes.iter().map(|c| c.ty().to_string()).collect()
    }

    #[test]
    fn test_coldstart_layout() {
        let mut program = s6_program();
        let mut pass = two_per_dex();
        let files = ConfigFiles::with_coldstart(&s6_betamap());
        let metrics = run_pass_with(&mut pass, &mut program, &files);

        let dexes = program.dexes();
        assert_eq!(names(&dexes[0]), vec!["LPrimary;", "LC0;"]);
        assert!(dexes[0].info.primary);
        assert_eq!(
            names(&dexes[1]),
            vec!["Lsecondary/dex01/Canary;", "LC1;", "LC2;"]
        );
        assert_eq!(names(&dexes[2])[1..], ["LC3;", "LC4;"]);
        assert_eq!(names(&dexes[3])[1..], ["LC5;", "LC6;"]);
        assert_eq!(names(&dexes[4])[1..], ["LC9;", "LC10;"]);
        assert_eq!(names(&dexes[5])[1..], ["LC11;", "LC12;"]);
        assert_eq!(names(&dexes[6])[1..], ["LC7;", "LC8;"]);
        assert_eq!(dexes.len(), 7);

        for (ordinal, dex) in dexes.iter().enumerate().skip(1) {
            assert!(dex.has_canary());
            assert_eq!(dex.classes[0].ty().to_string(), crate::model::canary_name(ordinal));
        }
        assert!((1..=5).all(|i| dexes[i].info.coldstart));
        assert!(!dexes[6].info.coldstart);
        assert!(!dexes[3].info.extended && dexes[4].info.extended);

        assert_eq!(pass.manifest().len(), 7);
        assert_eq!(
            pass.manifest()[1].to_string(),
            "Lsecondary/dex01/Canary;,ordinal=1,coldstart=1,extended=0,primary=0,scroll=0,background=0"
        );
        assert_eq!(
            pass.manifest()[0].to_string(),
            "Lsecondary/dex00/Canary;,ordinal=0,coldstart=0,extended=0,primary=1,scroll=0,background=0"
        );
        assert_eq!(metrics.get("num_dexes"), 7);
        assert_eq!(metrics.get("num_coldstart_dexes"), 5);
        assert_eq!(metrics.get("num_canaries"), 6);
        assert_eq!(metrics.get("betamap_missing_classes"), 0);
    }

    #[test]
    fn test_missing_betamap_classes_counted() {
        let mut program = s6_program();
        let files = ConfigFiles::with_coldstart(&["LGone;", "LC1;", "DexEndMarker0.class"]);
        let metrics = run_pass_with(&mut two_per_dex(), &mut program, &files);
        assert_eq!(metrics.get("betamap_missing_classes"), 1);
        assert_eq!(names(&program.dexes()[1])[1..], ["LC1;"]);
    }

    #[test]
    fn test_betamap_ignored_when_disabled() {
        let mut program = s6_program();
        let mut pass = InterDexPass::with_config(InterDexConfig {
            order_interdex: false,
            minimize_cross_dex_refs: false,
            ..InterDexConfig::default()
        });
        let files = ConfigFiles::with_coldstart(&["LC12;", "DexEndMarker0.class"]);
        run_pass_with(&mut pass, &mut program, &files);
        assert_eq!(program.dexes().len(), 2);
        assert_eq!(names(&program.dexes()[1])[1], "LC1;");
        assert!(!program.dexes()[1].info.coldstart);
    }

    #[test]
    fn test_minimizer_groups_related_classes() {
        let mut a = class("LA;");
        a.add_interface(DexType::make("LShared;"));
        let b = class("LB;");
        let mut c = class("LC;");
        c.add_interface(DexType::make("LShared;"));
        let mut program = Program::new(vec![DexUnit::new(vec![a, b, c], DexInfo::default())], 21);
        let mut pass = InterDexPass::with_config(InterDexConfig {
            // Object, Shared and two classes
            reserved_trefs: limits::MAX_TYPE_REFS_PRE_26 - 4,
            ..InterDexConfig::default()
        });
        run_pass_with(&mut pass, &mut program, &ConfigFiles::default());
        let grouped: Vec<Vec<String>> = program.dexes().iter().map(names).collect();
        assert!(grouped.iter().any(|d| d.contains(&"LA;".to_string()) && d.contains(&"LC;".to_string())));
    }

    #[test]
    fn test_invalid_betamap_fails_pass() {
        let mut program = s6_program();
        let files = ConfigFiles::with_coldstart(&["com/foo/Bar"]);
        let config = crate::compiler::Config::default();
        let metrics = crate::compiler::Metrics::new();
        let events = crate::compiler::EventLog::new();
        let reserved = crate::compiler::ReservedRefs::default();
        let ctx = PassContext {
            config: &config,
            files: &files,
            metrics: &metrics,
            events: &events,
            reserved: &reserved,
            index: 0,
            occurrence: 0,
        };
        let err = InterDexPass::new().run_pass(&mut program, &ctx).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidBetamap(_)));
    }
}

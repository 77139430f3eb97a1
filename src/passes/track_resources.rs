//! Usage report for resource classes.
//!
//! Android resource ids live in static fields of the generated `R$<kind>` classes. This
//! pass counts the static reads of those fields (and of any class under a configured
//! prefix) so later resource shrinking knows which classes are still reached from code.
//! It changes nothing.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, walk, Interaction, Pass, PassContext, Property, PropertyInteractions,
    },
    model::Program,
    pool::DexType,
    Result,
};

/// Options of [`TrackResourcesPass`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackResourcesConfig {
    /// Descriptor prefixes of further classes to track, e.g. `Lcom/app/Config`.
    pub classes_to_track: Vec<String>,
}

/// `true` for the generated resource classes: `R$string`, `Lcom/app/R$id;`...
#[must_use]
pub fn is_resource_class(ty: &DexType) -> bool {
    let descriptor = ty.descriptor();
    let simple = descriptor.rsplit('/').next().unwrap_or(descriptor);
    simple.trim_start_matches('L').starts_with("R$")
}

/// `TrackResourcesPass`.
#[derive(Debug, Default)]
pub struct TrackResourcesPass {
    config: TrackResourcesConfig,
    reads: BTreeMap<DexType, usize>,
}

impl TrackResourcesPass {
    /// Creates the pass with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Static reads per tracked class, from the last run.
    #[must_use]
    pub fn reads(&self) -> &BTreeMap<DexType, usize> {
        &self.reads
    }

    fn tracked(&self, ty: &DexType) -> bool {
        is_resource_class(ty)
            || self
                .config
                .classes_to_track
                .iter()
                .any(|p| ty.descriptor().starts_with(p.as_str()))
    }
}

fn merge(mut a: BTreeMap<DexType, usize>, b: BTreeMap<DexType, usize>) -> BTreeMap<DexType, usize> {
    for (ty, n) in b {
        *a.entry(ty).or_default() += n;
    }
    a
}

impl Pass for TrackResourcesPass {
    fn name(&self) -> &'static str {
        "TrackResourcesPass"
    }

    fn description(&self) -> &'static str {
        "Count static field reads of resource classes"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let this = &*self;
        let reads = walk::parallel_reduce_ref(
            program,
            |method| {
                let mut reads = BTreeMap::new();
                let Some(code) = method.code() else {
                    return reads;
                };
                for insn in code.instructions() {
                    let Some(field) = insn.field().filter(|_| insn.opcode().is_sget()) else {
                        continue;
                    };
                    if this.tracked(field.class()) {
                        *reads.entry(field.class().clone()).or_default() += 1;
                    }
                }
                reads
            },
            merge,
        );
        for (ty, n) in &reads {
            debug!("{ty}: {n} static reads");
        }
        let field_refs: usize = reads.values().sum();
        info!("{field_refs} static reads of {} tracked classes", reads.len());
        ctx.incr_metric("num_field_refs", field_refs as i64);
        ctx.incr_metric("num_classes_tracked", reads.len() as i64);
        self.reads = reads;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::helpers::{program_of, run_pass, static_method};

    #[test]
    fn test_resource_class_names() {
        assert!(is_resource_class(&DexType::make("Lcom/app/R$string;")));
        assert!(is_resource_class(&DexType::make("LR$id;")));
        assert!(!is_resource_class(&DexType::make("Lcom/app/Router;")));
        assert!(!is_resource_class(&DexType::make("Lcom/app/R;")));
    }

    fn reader() -> Program {
        program_of(vec![static_method("LMain;.ids:()V", 1, |b| {
            b.sget("Lcom/app/R$id;.title:I", 0)
                .sget("Lcom/app/R$id;.body:I", 0)
                .sget("Lcom/app/R$string;.name:I", 0)
                .sget("Lcom/app/Flags;.debug:Z", 0)
                .sput("Lcom/app/R$id;.title:I", 0)
                .return_void();
        })])
    }

    #[test]
    fn test_resource_reads_counted() {
        let mut program = reader();
        let mut pass = TrackResourcesPass::new();
        let metrics = run_pass(&mut pass, &mut program);
        assert_eq!(metrics.get("num_field_refs"), 3);
        assert_eq!(metrics.get("num_classes_tracked"), 2);
        assert_eq!(pass.reads().get(&DexType::make("Lcom/app/R$id;")), Some(&2));
    }

    #[test]
    fn test_configured_prefixes() {
        let mut program = reader();
        let mut pass = TrackResourcesPass::new();
        pass.configure(&serde_json::json!({"classes_to_track": ["Lcom/app/Flags"]}))
            .unwrap();
        let metrics = run_pass(&mut pass, &mut program);
        assert_eq!(metrics.get("num_field_refs"), 4);
        assert_eq!(metrics.get("num_classes_tracked"), 3);
    }
}

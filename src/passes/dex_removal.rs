//! Consolidation of dexes emptied by later passes.
//!
//! Passes running after interdex may delete classes, leaving secondaries only partly
//! filled. A secondary is folded into the dex right before it when their combined
//! references still fit the caps. Only neighbours are merged, so the global class order
//! is unchanged; coldstart dexes are never merged because their boundaries come from the
//! betamap, and the primary dex never absorbs a secondary. Canaries are renumbered
//! afterwards so every secondary still starts with the canary of its ordinal.

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    compiler::{
        parse_options, EventKind, Interaction, Pass, PassContext, Property, PropertyInteractions,
    },
    model::{DexClass, DexUnit, Program},
    passes::interdex::{DexLimits, DexRefs, Reservation},
    Result,
};

/// Options of [`DexRemovalPass`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexRemovalConfig {
    /// Method references kept free in every dex.
    pub reserved_mrefs: usize,
    /// Field references kept free in every dex.
    pub reserved_frefs: usize,
    /// Type references kept free in every dex.
    pub reserved_trefs: usize,
}

/// `DexRemovalPass`.
#[derive(Debug, Default)]
pub struct DexRemovalPass {
    config: DexRemovalConfig,
}

impl DexRemovalPass {
    /// Creates the pass with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn payload(dex: &DexUnit) -> &[DexClass] {
    if dex.has_canary() {
        &dex.classes[1..]
    } else {
        &dex.classes
    }
}

fn mergeable(into: &DexUnit, from: &DexUnit) -> bool {
    !into.info.primary && !from.info.primary && !into.info.coldstart && !from.info.coldstart
}

/// Merges neighbouring secondaries that fit together. Returns how many dexes vanished.
pub fn consolidate(dexes: &mut Vec<DexUnit>, limits: &DexLimits) -> usize {
    let mut removed = 0;
    let mut i = 1;
    while i + 1 < dexes.len() {
        let (into, from) = (&dexes[i], &dexes[i + 1]);
        let fits = mergeable(into, from)
            && DexRefs::of_classes(&into.classes)
                .fits_merged(&DexRefs::of_classes(payload(from)), limits);
        if !fits {
            i += 1;
            continue;
        }
        let from = dexes.remove(i + 1);
        let info = from.info;
        let skip = usize::from(from.has_canary());
        let into = &mut dexes[i];
        into.classes.extend(from.classes.into_iter().skip(skip));
        into.info.extended |= info.extended;
        into.info.scroll |= info.scroll;
        into.info.background |= info.background;
        debug!("merged the next dex into dex {i}");
        removed += 1;
    }
    if removed > 0 {
        renumber_canaries(dexes);
    }
    removed
}

fn renumber_canaries(dexes: &mut [DexUnit]) {
    for (ordinal, dex) in dexes.iter_mut().enumerate().skip(1) {
        if dex.has_canary() {
            dex.classes[0] = DexClass::canary(ordinal);
        }
    }
}

impl Pass for DexRemovalPass {
    fn name(&self) -> &'static str {
        "DexRemovalPass"
    }

    fn description(&self) -> &'static str {
        "Merge partially filled secondary dexes into their predecessor"
    }

    fn configure(&mut self, options: &Value) -> Result<()> {
        self.config = parse_options(self.name(), options)?;
        Ok(())
    }

    fn property_interactions(&self) -> PropertyInteractions {
        PropertyInteractions::from([
            (Property::DexLimitsObeyed, Interaction::Preserves),
            (Property::NoUnreachableInstructions, Interaction::Preserves),
            (Property::RegistersAllocated, Interaction::Preserves),
        ])
    }

    fn requires(&self) -> Vec<Property> {
        vec![Property::DexLimitsObeyed]
    }

    fn run_pass(&mut self, program: &mut Program, ctx: &PassContext<'_>) -> Result<()> {
        let min_sdk = ctx.config.min_sdk.unwrap_or_else(|| program.min_sdk());
        let reservation = Reservation {
            methods: self.config.reserved_mrefs + ctx.reserved.methods(),
            fields: self.config.reserved_frefs + ctx.reserved.fields(),
            types: self.config.reserved_trefs + ctx.reserved.types(),
        };
        let limits = DexLimits::for_min_sdk(min_sdk).reserving(&reservation);
        let before = program.dexes().len();
        let removed = consolidate(program.dexes_mut(), &limits);
        if removed > 0 {
            ctx.events
                .record(EventKind::DexRemoved)
                .message(format!("{before} dexes reduced to {}", before - removed));
        }
        ctx.set_metric("num_dexes_removed", removed as i64);
        Ok(())
    }
}

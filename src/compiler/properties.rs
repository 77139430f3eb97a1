//! Program properties established and consumed by passes.
//!
//! Each pass declares how it interacts with every property it knows about. A property the
//! pass does not mention is destroyed by it. The manager replays these declarations over
//! the configured pass list at activation, so a pass whose requirement is not met is
//! rejected before anything runs.

use std::collections::BTreeMap;

use strum::{Display, EnumIter, EnumString};

/// A fact about the whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter)]
pub enum Property {
    /// No method contains an instruction unreachable from its entry.
    NoUnreachableInstructions,
    /// Every dex fits the per-dex reference caps.
    DexLimitsObeyed,
    /// Methods use physical register numbers.
    RegistersAllocated,
}

/// How a pass affects a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Interaction {
    /// The property holds after the pass.
    Establishes,
    /// The property holds after the pass if it held before.
    Preserves,
    /// The property no longer holds.
    Destroys,
    /// The property keeps holding but must be re-verified at the end of the run.
    PreservesButDowngrades,
}

/// Interactions declared by one pass.
pub type PropertyInteractions = BTreeMap<Property, Interaction>;

/// Which properties hold at a point of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyState {
    // true when downgraded
    held: BTreeMap<Property, bool>,
}

impl PropertyState {
    /// Nothing holds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `property` holds.
    #[must_use]
    pub fn holds(&self, property: Property) -> bool {
        self.held.contains_key(&property)
    }

    /// `true` if `property` holds and was never downgraded since it was established.
    #[must_use]
    pub fn holds_strictly(&self, property: Property) -> bool {
        self.held.get(&property) == Some(&false)
    }

    /// Applies a pass's declarations.
    pub fn apply(&mut self, interactions: &PropertyInteractions) {
        let mut next = BTreeMap::new();
        for (&property, &downgraded) in &self.held {
            match interactions.get(&property) {
                Some(Interaction::Preserves) => {
                    next.insert(property, downgraded);
                }
                Some(Interaction::PreservesButDowngrades) => {
                    next.insert(property, true);
                }
                _ => {}
            }
        }
        for (&property, &interaction) in interactions {
            if interaction == Interaction::Establishes {
                next.insert(property, false);
            }
        }
        self.held = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmentioned_properties_are_destroyed() {
        let mut state = PropertyState::new();
        state.apply(&BTreeMap::from([(Property::DexLimitsObeyed, Interaction::Establishes)]));
        assert!(state.holds_strictly(Property::DexLimitsObeyed));

        state.apply(&BTreeMap::from([(
            Property::DexLimitsObeyed,
            Interaction::PreservesButDowngrades,
        )]));
        assert!(state.holds(Property::DexLimitsObeyed));
        assert!(!state.holds_strictly(Property::DexLimitsObeyed));

        state.apply(&BTreeMap::new());
        assert!(!state.holds(Property::DexLimitsObeyed));
    }
}

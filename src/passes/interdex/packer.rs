//! Assignment of classes to dexes.
//!
//! The order is: the primary dex, the betamap (coldstart) classes with their region
//! markers, every other class either grouped by the cross-dex minimizer or in input
//! order, and last the classes observed dead at runtime. Each secondary dex opens with
//! its canary. A dex is closed when the next class would break a reference cap or when
//! a `DexEndMarker` says so.

use std::collections::HashMap;

use log::debug;

use crate::{
    model::{ClassRefs, DexClass, DexInfo, DexUnit},
    passes::interdex::{
        betamap::BetamapEntry,
        limits::{DexLimits, DexRefs, Overflow},
        minimizer::{CrossDexRefMinimizer, MinimizerWeights},
    },
    pool::DexType,
    Error, Result,
};

/// Knobs of [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Follow the betamap. When `false` the betamap is ignored.
    pub order_interdex: bool,
    /// Group non-coldstart classes with the cross-dex minimizer.
    pub minimize_cross_dex_refs: bool,
    /// Move dynamically dead classes to the end.
    pub reorder_dynamically_dead_classes: bool,
    /// Minimizer weights.
    pub weights: MinimizerWeights,
    /// Per-dex caps, reservations already subtracted.
    pub limits: DexLimits,
}

/// Counters of one packing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Classes placed from the coldstart part of the betamap.
    pub coldstart_classes: usize,
    /// Betamap classes absent from the program.
    pub betamap_missing_classes: usize,
    /// Dynamically dead classes moved to the end.
    pub deferred_dead_classes: usize,
    /// Canaries emitted.
    pub canaries: usize,
}

/// The result of [`pack`].
#[derive(Debug)]
pub struct Packed {
    /// Dexes in output order; the first is the primary dex.
    pub dexes: Vec<DexUnit>,
    /// Counters.
    pub stats: PackStats,
}

fn is_canary(class: &DexClass) -> bool {
    class.state().generated && class.ty().descriptor().starts_with("Lsecondary/dex")
}

fn capacity_error(class: &DexClass, dex: usize, overflow: &Overflow) -> Error {
    Error::CapacityExceeded {
        class: class.ty().to_string(),
        dex,
        detail: format!(
            "{} references would reach {} (limit {})",
            overflow.kind, overflow.count, overflow.limit
        ),
    }
}

/// Fills dexes one at a time.
struct Emitter<'a> {
    limits: &'a DexLimits,
    done: Vec<DexUnit>,
    classes: Vec<DexClass>,
    refs: DexRefs,
    info: DexInfo,
    payload: usize,
    labels: DexInfo,
}

impl<'a> Emitter<'a> {
    fn new(limits: &'a DexLimits) -> Self {
        let mut emitter = Self {
            limits,
            done: Vec::new(),
            classes: Vec::new(),
            refs: DexRefs::new(),
            info: DexInfo::default(),
            payload: 0,
            labels: DexInfo::default(),
        };
        emitter.open();
        emitter
    }

    fn ordinal(&self) -> usize {
        self.done.len()
    }

    fn open(&mut self) {
        let ordinal = self.ordinal();
        self.classes = Vec::new();
        self.refs = DexRefs::new();
        self.payload = 0;
        self.info = DexInfo {
            primary: ordinal == 0,
            ..DexInfo::default()
        };
        if ordinal > 0 {
            let canary = DexClass::canary(ordinal);
            self.refs.add(&canary.gather_refs());
            self.classes.push(canary);
        }
    }

    /// Closes the current dex unless it holds nothing but its canary.
    fn flush(&mut self) {
        if self.payload == 0 {
            return;
        }
        let classes = std::mem::take(&mut self.classes);
        debug!(
            "closing dex {} with {} classes ({} methods, {} fields, {} types)",
            self.ordinal(),
            classes.len(),
            self.refs.num_methods(),
            self.refs.num_fields(),
            self.refs.num_types()
        );
        self.done.push(DexUnit::new(classes, self.info));
        self.open();
    }

    /// Adds `class`, closing the current dex first if it would overflow and `may_spill`.
    ///
    /// Returns `true` when a new dex was opened for the class.
    fn add(&mut self, class: DexClass, refs: &ClassRefs, may_spill: bool) -> Result<bool> {
        let mut opened = false;
        if let Some(overflow) = self.refs.overflow_with(refs, self.limits) {
            if self.payload == 0 || !may_spill {
                return Err(capacity_error(&class, self.ordinal(), &overflow));
            }
            self.flush();
            opened = true;
            if let Some(overflow) = self.refs.overflow_with(refs, self.limits) {
                return Err(capacity_error(&class, self.ordinal(), &overflow));
            }
        }
        self.refs.add(refs);
        self.classes.push(class);
        self.payload += 1;
        self.info.coldstart |= self.labels.coldstart;
        self.info.extended |= self.labels.extended;
        self.info.scroll |= self.labels.scroll;
        self.info.background |= self.labels.background;
        Ok(opened)
    }

    fn finish(mut self) -> Vec<DexUnit> {
        if self.payload > 0 || self.done.is_empty() {
            let classes = std::mem::take(&mut self.classes);
            self.done.push(DexUnit::new(classes, self.info));
        }
        self.done
    }
}

/// Candidate classes, taken out as they are placed.
struct Pool {
    classes: Vec<Option<DexClass>>,
    refs: Vec<ClassRefs>,
}

impl Pool {
    fn take(&mut self, index: usize) -> Option<(DexClass, &ClassRefs)> {
        let class = self.classes[index].take()?;
        Some((class, &self.refs[index]))
    }
}

/// Distributes `classes` over dexes.
///
/// `primary` lists the classes of the primary dex in the order they are emitted.
/// Canaries generated by an earlier run are dropped and regenerated.
///
/// # Errors
///
/// Returns [`Error::CapacityExceeded`] if a class does not fit an empty dex, or if the
/// primary classes do not fit the primary dex together.
pub fn pack(
    classes: Vec<DexClass>,
    primary: &[DexType],
    betamap: &[BetamapEntry],
    options: &PackOptions,
) -> Result<Packed> {
    let classes: Vec<DexClass> = classes.into_iter().filter(|c| !is_canary(c)).collect();
    let index: HashMap<DexType, usize> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.ty().clone(), i))
        .collect();
    let mut pool = Pool {
        refs: classes.iter().map(DexClass::gather_refs).collect(),
        classes: classes.into_iter().map(Some).collect(),
    };
    let mut stats = PackStats::default();
    let mut emitter = Emitter::new(&options.limits);

    for ty in primary {
        let Some(&i) = index.get(ty) else {
            debug!("primary class {ty} is not in the program");
            continue;
        };
        if let Some((class, refs)) = pool.take(i) {
            emitter.add(class, refs, false)?;
        }
    }
    emitter.flush();

    if options.order_interdex {
        let last_end = betamap.iter().rposition(|e| *e == BetamapEntry::DexEnd);
        for (position, entry) in betamap.iter().enumerate() {
            match entry {
                BetamapEntry::Class(ty) => {
                    let Some(&i) = index.get(ty) else {
                        debug!("betamap class {ty} is not in the program");
                        stats.betamap_missing_classes += 1;
                        continue;
                    };
                    let coldstart = last_end.is_some_and(|end| position < end);
                    emitter.labels.coldstart = coldstart;
                    if let Some((class, refs)) = pool.take(i) {
                        emitter.add(class, refs, true)?;
                        stats.coldstart_classes += usize::from(coldstart);
                    }
                }
                BetamapEntry::DexEnd => emitter.flush(),
                BetamapEntry::ColdStart20PctEnd => emitter.labels.extended = true,
                BetamapEntry::ScrollSetStart => emitter.labels.scroll = true,
                BetamapEntry::ScrollSetEnd => emitter.labels.scroll = false,
                BetamapEntry::BackgroundSetStart => emitter.labels.background = true,
                BetamapEntry::BackgroundSetEnd => emitter.labels.background = false,
            }
        }
        emitter.labels = DexInfo::default();
    }

    let (dead, live): (Vec<usize>, Vec<usize>) = (0..pool.classes.len())
        .filter(|&i| pool.classes[i].is_some())
        .partition(|&i| {
            options.reorder_dynamically_dead_classes
                && pool.classes[i]
                    .as_ref()
                    .is_some_and(|c| c.state().dynamically_dead)
        });

    if options.minimize_cross_dex_refs {
        let mut minimizer = CrossDexRefMinimizer::new(options.weights);
        for &i in &live {
            minimizer.insert(&pool.refs[i]);
        }
        minimizer.reset();
        while !minimizer.is_empty() {
            let pick = if emitter.payload == 0 {
                minimizer.worst()
            } else {
                minimizer.best()
            };
            let Some(pick) = pick else {
                break;
            };
            if let Some((class, refs)) = pool.take(live[pick]) {
                if emitter.add(class, refs, true)? {
                    minimizer.reset();
                }
            }
            minimizer.erase(pick, true);
        }
    } else {
        for &i in &live {
            if let Some((class, refs)) = pool.take(i) {
                emitter.add(class, refs, true)?;
            }
        }
    }

    for &i in &dead {
        if let Some((class, refs)) = pool.take(i) {
            emitter.add(class, refs, true)?;
            stats.deferred_dead_classes += 1;
        }
    }

    let dexes = emitter.finish();
    stats.canaries = dexes.iter().filter(|d| d.has_canary()).count();
    Ok(Packed { dexes, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{AccessFlags, ClassState},
        pool::DexType,
    };

    fn bare(name: &str) -> DexClass {
        DexClass::new(
            DexType::make(name),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        )
    }

    fn options(types: usize) -> PackOptions {
        PackOptions {
            order_interdex: true,
            minimize_cross_dex_refs: false,
            reorder_dynamically_dead_classes: true,
            weights: MinimizerWeights::default(),
            limits: DexLimits {
                methods: 100,
                fields: 100,
                types,
            },
        }
    }

    fn names(dex: &DexUnit) -> Vec<String> {
        dex.classes.iter().map(|c| c.ty().to_string()).collect()
    }

    #[test]
    fn test_dex_filled_until_cap() {
        // Without primary classes the primary dex is filled like any other.
        let classes = vec![bare("LA;"), bare("LB;"), bare("LC;")];
        let packed = pack(classes, &[], &[], &options(4)).unwrap();
        assert_eq!(packed.dexes.len(), 1);
        assert!(packed.dexes[0].info.primary);
        assert_eq!(names(&packed.dexes[0]), vec!["LA;", "LB;", "LC;"]);
        assert_eq!(packed.stats.canaries, 0);

        let primary = [DexType::make("LA;")];
        // canary + Object + 2 classes = 4 types
        let classes = vec![bare("LA;"), bare("LB;"), bare("LC;"), bare("LD;")];
        let packed = pack(classes, &primary, &[], &options(4)).unwrap();
        let all: Vec<Vec<String>> = packed.dexes.iter().map(names).collect();
        assert_eq!(
            all,
            vec![
                vec!["LA;".to_string()],
                vec!["Lsecondary/dex01/Canary;".into(), "LB;".into(), "LC;".into()],
                vec!["Lsecondary/dex02/Canary;".into(), "LD;".into()],
            ]
        );
        assert_eq!(packed.stats.canaries, 2);
    }

    #[test]
    fn test_primary_classes_keep_given_order() {
        let primary = [DexType::make("LC;"), DexType::make("LA;"), DexType::make("LMissing;")];
        let classes = vec![bare("LA;"), bare("LB;"), bare("LC;")];
        let packed = pack(classes, &primary, &[], &options(100)).unwrap();
        assert_eq!(names(&packed.dexes[0]), vec!["LC;", "LA;"]);
        assert_eq!(
            names(&packed.dexes[1]),
            vec!["Lsecondary/dex01/Canary;", "LB;"]
        );
    }

    #[test]
    fn test_dead_classes_go_last() {
        let mut dead = bare("LDead;");
        *dead.state_mut() = ClassState {
            dynamically_dead: true,
            ..ClassState::default()
        };
        let classes = vec![dead, bare("LLive1;"), bare("LLive2;")];
        let packed = pack(classes, &[], &[], &options(100)).unwrap();
        assert_eq!(names(&packed.dexes[0]), vec!["LLive1;", "LLive2;", "LDead;"]);
        assert_eq!(packed.stats.deferred_dead_classes, 1);
    }

    #[test]
    fn test_oversized_class_is_error() {
        let classes = vec![bare("LHuge;")];
        let err = pack(classes, &[], &[], &options(1)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { ref class, dex: 0, .. } if class == "LHuge;"));
    }

    #[test]
    fn test_stale_canaries_regenerated() {
        let primary = [DexType::make("LA;")];
        let classes = vec![bare("LA;"), DexClass::canary(7), bare("LB;")];
        let packed = pack(classes, &primary, &[], &options(100)).unwrap();
        assert_eq!(packed.dexes.len(), 2);
        assert_eq!(
            names(&packed.dexes[1]),
            vec!["Lsecondary/dex01/Canary;", "LB;"]
        );
    }
}

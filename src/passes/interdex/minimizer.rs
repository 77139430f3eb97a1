//! Cross-dex reference minimization.
//!
//! Classes that share references should land in the same dex: every reference a dex
//! holds costs an entry in its tables, and a reference shared by two dexes is paid twice.
//! The minimizer orders the classes left over after coldstart placement so that each dex
//! is grown by the class with the best ratio of already-present ("applied") to new
//! ("unapplied") references.
//!
//! Each reference carries a weight by kind. Applied references count their full weight;
//! unapplied references count their weight divided by their frequency across all
//! classes, because a reference few classes use is unlikely to be shared later.
//!
//! A new dex is seeded with the *worst* class, the one with the largest seed-weighted
//! reference set, so heavy classes do not all pile up at the end.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use serde::Deserialize;

use crate::{
    model::ClassRefs,
    pool::{DexFieldRef, DexMethodRef, DexString, DexType},
};

/// Weights of the minimizer's scores, per reference kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MinimizerWeights {
    /// Weight of a method reference in affinity scores.
    pub method_ref_weight: u64,
    /// Weight of a field reference in affinity scores.
    pub field_ref_weight: u64,
    /// Weight of a type reference in affinity scores.
    pub type_ref_weight: u64,
    /// Weight of a string reference in affinity scores.
    pub string_ref_weight: u64,
    /// Weight of a method reference when choosing the seed of a dex.
    pub method_seed_weight: u64,
    /// Weight of a field reference when choosing the seed of a dex.
    pub field_seed_weight: u64,
    /// Weight of a type reference when choosing the seed of a dex.
    pub type_seed_weight: u64,
    /// Weight of a string reference when choosing the seed of a dex.
    pub string_seed_weight: u64,
}

impl Default for MinimizerWeights {
    fn default() -> Self {
        Self {
            method_ref_weight: 100,
            field_ref_weight: 90,
            type_ref_weight: 100,
            string_ref_weight: 90,
            method_seed_weight: 100,
            field_seed_weight: 20,
            type_seed_weight: 30,
            string_seed_weight: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RefKey {
    Method(DexMethodRef),
    Field(DexFieldRef),
    Type(DexType),
    String(DexString),
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Method,
    Field,
    Type,
    String,
}

impl MinimizerWeights {
    fn affinity(&self, kind: Kind) -> u64 {
        match kind {
            Kind::Method => self.method_ref_weight,
            Kind::Field => self.field_ref_weight,
            Kind::Type => self.type_ref_weight,
            Kind::String => self.string_ref_weight,
        }
    }

    fn seed(&self, kind: Kind) -> u64 {
        match kind {
            Kind::Method => self.method_seed_weight,
            Kind::Field => self.field_seed_weight,
            Kind::Type => self.type_seed_weight,
            Kind::String => self.string_seed_weight,
        }
    }
}

const SCALE: u64 = 1000;

#[derive(Debug, Default, Clone)]
struct Entry {
    refs: Vec<usize>,
    applied: u64,
    unapplied: u64,
    version: u32,
    remaining: bool,
}

impl Entry {
    fn score(&self) -> u64 {
        (self.applied << 16) / (self.unapplied + 1)
    }
}

/// Orders classes to minimize cross-dex references.
///
/// Classes are identified by their insertion index.
#[derive(Debug, Default)]
pub struct CrossDexRefMinimizer {
    weights: MinimizerWeights,
    ids: HashMap<RefKey, usize>,
    kinds: Vec<Kind>,
    users: Vec<Vec<usize>>,
    applied: Vec<bool>,
    entries: Vec<Entry>,
    heap: BinaryHeap<(u64, Reverse<usize>, u32)>,
    remaining: usize,
}

impl CrossDexRefMinimizer {
    /// Creates an empty minimizer.
    #[must_use]
    pub fn new(weights: MinimizerWeights) -> Self {
        Self {
            weights,
            ..Self::default()
        }
    }

    /// Number of classes not yet erased.
    #[must_use]
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// `true` when every class was erased.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    fn intern(&mut self, key: RefKey, kind: Kind) -> usize {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.kinds.len();
        self.ids.insert(key, id);
        self.kinds.push(kind);
        self.users.push(Vec::new());
        self.applied.push(false);
        id
    }

    /// Adds a class and returns its index.
    pub fn insert(&mut self, refs: &ClassRefs) -> usize {
        let index = self.entries.len();
        let mut ids = Vec::new();
        ids.extend(refs.methods.iter().map(|m| self.intern(RefKey::Method(m.clone()), Kind::Method)));
        ids.extend(refs.fields.iter().map(|f| self.intern(RefKey::Field(f.clone()), Kind::Field)));
        ids.extend(refs.types.iter().map(|t| self.intern(RefKey::Type(t.clone()), Kind::Type)));
        ids.extend(refs.strings.iter().map(|s| self.intern(RefKey::String(s.clone()), Kind::String)));
        for &id in &ids {
            self.users[id].push(index);
        }
        self.entries.push(Entry {
            refs: ids,
            remaining: true,
            ..Entry::default()
        });
        self.remaining += 1;
        index
    }

    fn unapplied_weight(&self, id: usize) -> u64 {
        let frequency = self.users[id].len().max(1) as u64;
        self.weights.affinity(self.kinds[id]) * SCALE / frequency
    }

    fn applied_weight(&self, id: usize) -> u64 {
        self.weights.affinity(self.kinds[id]) * SCALE
    }

    fn push(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.version += 1;
        self.heap.push((entry.score(), Reverse(index), entry.version));
    }

    /// Forgets which references the current dex holds; called when a new dex opens.
    pub fn reset(&mut self) {
        self.applied.iter_mut().for_each(|a| *a = false);
        self.heap.clear();
        for index in 0..self.entries.len() {
            if !self.entries[index].remaining {
                continue;
            }
            let unapplied = self.entries[index]
                .refs
                .iter()
                .map(|&id| self.unapplied_weight(id))
                .sum();
            let entry = &mut self.entries[index];
            entry.applied = 0;
            entry.unapplied = unapplied;
            self.push(index);
        }
    }

    /// The remaining class with the largest seed-weighted set of references the current
    /// dex does not hold yet.
    #[must_use]
    pub fn worst(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.remaining)
            .map(|(i, e)| {
                let seed: u64 = e
                    .refs
                    .iter()
                    .filter(|&&id| !self.applied[id])
                    .map(|&id| self.weights.seed(self.kinds[id]))
                    .sum();
                (seed, Reverse(i))
            })
            .max()
            .map(|(_, Reverse(i))| i)
    }

    /// The remaining class with the best affinity to the current dex.
    pub fn best(&mut self) -> Option<usize> {
        while let Some(&(_, Reverse(index), version)) = self.heap.peek() {
            let entry = &self.entries[index];
            if entry.remaining && entry.version == version {
                return Some(index);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes a class. When `placed` its references join the current dex and the scores
    /// of every class sharing them improve.
    pub fn erase(&mut self, index: usize, placed: bool) {
        if !self.entries[index].remaining {
            return;
        }
        self.entries[index].remaining = false;
        self.remaining -= 1;
        if !placed {
            return;
        }
        let refs = self.entries[index].refs.clone();
        for id in refs {
            if self.applied[id] {
                continue;
            }
            self.applied[id] = true;
            let (gain, loss) = (self.applied_weight(id), self.unapplied_weight(id));
            let users = self.users[id].clone();
            for user in users {
                let entry = &mut self.entries[user];
                if !entry.remaining {
                    continue;
                }
                entry.applied += gain;
                entry.unapplied = entry.unapplied.saturating_sub(loss);
                self.push(user);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(types: &[&str]) -> ClassRefs {
        let mut r = ClassRefs::default();
        for t in types {
            r.types.insert(DexType::make(t));
        }
        r
    }

    #[test]
    fn test_affine_class_follows_seed() {
        let mut m = CrossDexRefMinimizer::new(MinimizerWeights::default());
        let a = m.insert(&refs(&["LA;", "LShared1;", "LShared2;", "LShared3;"]));
        let b = m.insert(&refs(&["LB;", "LOther;"]));
        let c = m.insert(&refs(&["LC;", "LShared1;", "LShared2;", "LShared3;"]));
        m.reset();

        assert_eq!(m.worst(), Some(a));
        m.erase(a, true);
        assert_eq!(m.best(), Some(c));
        m.erase(c, true);
        assert_eq!(m.best(), Some(b));
        m.erase(b, true);
        assert!(m.is_empty());
        assert_eq!(m.best(), None);
    }

    #[test]
    fn test_reset_forgets_applied_refs() {
        let mut m = CrossDexRefMinimizer::new(MinimizerWeights::default());
        let a = m.insert(&refs(&["LA;", "LX;"]));
        let b = m.insert(&refs(&["LB;", "LX;", "LY;", "LZ;"]));
        m.reset();
        m.erase(a, true);
        m.reset();
        assert_eq!(m.worst(), Some(b));
        assert_eq!(m.len(), 1);
    }
}

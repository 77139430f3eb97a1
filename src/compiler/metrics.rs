//! Per-pass metric counters.
//!
//! Counters are keyed by name and updated through shared references, so per-method
//! closures can call [`Metrics::incr`] concurrently; each key is updated under its
//! `DashMap` shard lock.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Named integer counters of one pass invocation.
#[derive(Debug, Default)]
pub struct Metrics {
    values: DashMap<String, i64>,
}

impl Metrics {
    /// Creates an empty metric table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to `key`, creating it at zero.
    pub fn incr(&self, key: &str, n: i64) {
        *self.values.entry(key.to_string()).or_insert(0) += n;
    }

    /// Overwrites `key`.
    pub fn set(&self, key: &str, n: i64) {
        self.values.insert(key.to_string(), n);
    }

    /// The value of `key`, zero if never touched.
    #[must_use]
    pub fn get(&self, key: &str) -> i64 {
        self.values.get(key).map_or(0, |v| *v)
    }

    /// `true` if `key` was ever written.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Adds every counter of `other`.
    pub fn merge(&self, other: &Metrics) {
        for entry in &other.values {
            self.incr(entry.key(), *entry.value());
        }
    }

    /// Sorted copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;

    #[test]
    fn test_concurrent_increments() {
        let metrics = Metrics::new();
        (0..1000).into_par_iter().for_each(|_| metrics.incr("hits", 1));
        metrics.set("pass_order", 3);
        metrics.incr("pass_order", 1);
        assert_eq!(metrics.get("hits"), 1000);
        assert_eq!(metrics.get("pass_order"), 4);
        assert_eq!(metrics.get("missing"), 0);

        let other = Metrics::new();
        other.incr("hits", 5);
        metrics.merge(&other);
        assert_eq!(metrics.snapshot()["hits"], 1005);
    }
}

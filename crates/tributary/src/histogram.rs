//! Thread-safe additive accumulator keyed by `K`.
//!
//! Every operation is atomic per key: `dashmap` holds the shard lock for the
//! duration of an increment or a removal, so concurrent writers never race
//! on the same key and a removed value is observed by exactly one caller.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::AddAssign;

use dashmap::DashMap;

/// Additive map `K -> V`, `V = i64` unless a richer monoid is needed.
#[derive(Debug)]
pub struct Histogram<K, V = i64>
where
    K: Eq + Hash,
{
    values: DashMap<K, V>,
}

impl<K, V> Histogram<K, V>
where
    K: Eq + Hash + Clone,
    V: Copy + Default + AddAssign,
{
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Adds `amount` to `key`, creating the entry on first use.
    pub fn increment(&self, key: K, amount: V) {
        *self.values.entry(key).or_default() += amount;
    }

    /// Returns the current value of `key` without consuming it.
    pub fn get(&self, key: &K) -> V {
        self.values.get(key).map(|v| *v).unwrap_or_default()
    }

    /// Atomically reads and deletes `key`. Returns the default (zero) when
    /// the key is absent.
    pub fn remove(&self, key: &K) -> V {
        self.values
            .remove(key)
            .map(|(_, value)| value)
            .unwrap_or_default()
    }

    /// Folds every entry of `other` into this histogram.
    pub fn merge(&self, other: &Histogram<K, V>) {
        // Collect first: merging a histogram into itself must not hold a
        // shard read lock while taking the same shard's write lock.
        let entries: Vec<(K, V)> = other
            .values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (key, value) in entries {
            self.increment(key, value);
        }
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> Default for Histogram<K, V>
where
    K: Eq + Hash + Clone,
    V: Copy + Default + AddAssign,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for Histogram<K, V>
where
    K: Eq + Hash + Clone,
    V: Copy + Default + AddAssign,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let histogram = Self::new();
        for (key, value) in iter {
            histogram.increment(key, value);
        }
        histogram
    }
}

//! # tributary-types: Core types for `Tributary`
//!
//! This crate contains shared types used across the load-side runtime:
//! - Stream identity ([`StreamDescriptor`])
//! - Writer lanes ([`PartitionKey`])
//! - Checkpoint ordering ([`CheckpointIndex`])
//! - Accounting ([`EmissionStats`])

use std::{
    fmt::{Debug, Display},
    iter::Sum,
    ops::{Add, AddAssign},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Stream identity
// ============================================================================

/// Identity of a logical stream: an optional namespace plus a name.
///
/// Descriptors are immutable and are used as map keys everywhere, so they
/// derive `Hash` and `Ord` (namespace first, then name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    namespace: Option<String>,
    name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Creates a descriptor without a namespace.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }

    /// Creates a descriptor in the given namespace.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Some(namespace.into()), name)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ============================================================================
// Partitions - Copy (cheap index values)
// ============================================================================

/// One of the fixed writer lanes, `0..partition_count`.
///
/// Partitions are assigned when the pipeline is built and never change for
/// the lifetime of a sync.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionKey(u32);

impl PartitionKey {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the partition as a `usize` for indexing lane vectors.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns every partition key of a pipeline with `count` lanes.
    pub fn all(count: usize) -> Vec<PartitionKey> {
        (0..count).map(|id| PartitionKey(id as u32)).collect()
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl From<u32> for PartitionKey {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PartitionKey> for u32 {
    fn from(key: PartitionKey) -> Self {
        key.0
    }
}

// ============================================================================
// Checkpoint ordering
// ============================================================================

/// Per-stream position of a checkpoint boundary.
///
/// Indexes start at 1 and increase by one each time the extractor closes a
/// window of records for the stream. Index `N` names the window of records
/// that precede the `N`-th checkpoint of that stream.
///
/// [`CheckpointIndex::NONE`] (zero) means "no work was ever tagged for this
/// stream" and is always considered committed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CheckpointIndex(u64);

impl CheckpointIndex {
    pub const NONE: CheckpointIndex = CheckpointIndex(0);
    pub const FIRST: CheckpointIndex = CheckpointIndex(1);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the vacuous index.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns the following index.
    ///
    /// # Panics
    ///
    /// Panics on overflow.
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("checkpoint index overflow"))
    }

    /// Returns the preceding index, saturating at [`CheckpointIndex::NONE`].
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for CheckpointIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CheckpointIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<CheckpointIndex> for u64 {
    fn from(index: CheckpointIndex) -> Self {
        index.0
    }
}

// ============================================================================
// Accounting
// ============================================================================

/// Record and byte counts attributed to a checkpoint.
///
/// Forms a commutative monoid under [`EmissionStats::merge`] with
/// [`EmissionStats::ZERO`] as identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct EmissionStats {
    pub count: u64,
    pub bytes: u64,
}

impl EmissionStats {
    pub const ZERO: EmissionStats = EmissionStats { count: 0, bytes: 0 };

    pub fn new(count: u64, bytes: u64) -> Self {
        Self { count, bytes }
    }

    /// Component-wise addition.
    #[must_use]
    pub fn merge(self, other: EmissionStats) -> EmissionStats {
        EmissionStats {
            count: self.count + other.count,
            bytes: self.bytes + other.bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Add for EmissionStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.merge(rhs)
    }
}

impl AddAssign for EmissionStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.merge(rhs);
    }
}

impl Sum for EmissionStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, EmissionStats::merge)
    }
}

impl Display for EmissionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} records / {} bytes", self.count, self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(StreamDescriptor::unqualified("users") => "users"; "no namespace")]
    #[test_case(StreamDescriptor::namespaced("public", "users") => "public.users"; "namespaced")]
    fn stream_descriptor_display(descriptor: StreamDescriptor) -> String {
        descriptor.to_string()
    }

    #[test]
    fn stream_descriptor_orders_namespace_first() {
        let a = StreamDescriptor::namespaced("a", "z");
        let b = StreamDescriptor::namespaced("b", "a");
        assert!(a < b);
        assert!(StreamDescriptor::unqualified("z") < a);
    }

    #[test]
    fn stream_descriptor_serde_shape() {
        let descriptor = StreamDescriptor::namespaced("public", "users");
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["namespace"], "public");
        assert_eq!(json["name"], "users");
    }

    #[test]
    fn partition_keys_cover_all_lanes() {
        let keys = PartitionKey::all(3);
        assert_eq!(
            keys,
            vec![PartitionKey::new(0), PartitionKey::new(1), PartitionKey::new(2)]
        );
        assert_eq!(keys[2].as_usize(), 2);
        assert_eq!(keys[1].to_string(), "p1");
    }

    #[test]
    fn checkpoint_index_neighbours() {
        let index = CheckpointIndex::FIRST;
        assert_eq!(index.next(), CheckpointIndex::new(2));
        assert_eq!(index.prev(), CheckpointIndex::NONE);
        assert_eq!(CheckpointIndex::NONE.prev(), CheckpointIndex::NONE);
        assert!(CheckpointIndex::NONE.is_none());
        assert!(!index.is_none());
    }

    #[test]
    #[should_panic(expected = "checkpoint index overflow")]
    fn checkpoint_index_overflow_panics() {
        let _ = CheckpointIndex::new(u64::MAX).next();
    }

    #[test]
    fn emission_stats_sum() {
        let total: EmissionStats = [EmissionStats::new(1, 10), EmissionStats::new(2, 20)]
            .into_iter()
            .sum();
        assert_eq!(total, EmissionStats::new(3, 30));
        assert!(EmissionStats::default().is_zero());
    }

    fn stats() -> impl Strategy<Value = EmissionStats> {
        (0u64..1_000_000, 0u64..1_000_000_000).prop_map(|(c, b)| EmissionStats::new(c, b))
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in stats(), b in stats()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
        }

        #[test]
        fn merge_is_associative(a in stats(), b in stats(), c in stats()) {
            prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
        }

        #[test]
        fn zero_is_identity(a in stats()) {
            prop_assert_eq!(a.merge(EmissionStats::ZERO), a);
            prop_assert_eq!(EmissionStats::ZERO.merge(a), a);
        }
    }
}

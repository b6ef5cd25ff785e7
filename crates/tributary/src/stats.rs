//! Emitted and committed record/byte accounting.
//!
//! The emitted store counts what the extractor handed over. The committed
//! store counts what writers durably flushed, per stream and partition, and
//! is drained by the enricher: each committed entry is attributed to exactly
//! one flushed checkpoint, the first one whose window covers it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tributary_types::{CheckpointIndex, EmissionStats, PartitionKey, StreamDescriptor};

use crate::histogram::Histogram;

/// Per-stream counts of records received from the extractor.
#[derive(Debug, Default)]
pub struct EmittedStatsStore {
    counts: Histogram<StreamDescriptor>,
    bytes: Histogram<StreamDescriptor>,
}

impl EmittedStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, stream: &StreamDescriptor, count: u64, bytes: u64) {
        self.counts.increment(stream.clone(), to_signed(count));
        self.bytes.increment(stream.clone(), to_signed(bytes));
    }

    pub fn stats(&self, stream: &StreamDescriptor) -> EmissionStats {
        EmissionStats::new(
            to_unsigned(self.counts.get(stream)),
            to_unsigned(self.bytes.get(stream)),
        )
    }

    /// Point-in-time view of every stream.
    pub fn snapshot(&self) -> HashMap<StreamDescriptor, EmissionStats> {
        let bytes = self.bytes.snapshot();
        self.counts
            .snapshot()
            .into_iter()
            .map(|(stream, count)| {
                let stream_bytes = bytes.get(&stream).copied().unwrap_or_default();
                let stats = EmissionStats::new(to_unsigned(count), to_unsigned(stream_bytes));
                (stream, stats)
            })
            .collect()
    }

    pub fn total(&self) -> EmissionStats {
        self.snapshot().into_values().sum()
    }
}

/// Stats taken out of the committed store for one stream, kept so they can
/// be put back if the checkpoint carrying them fails to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakenStats {
    pub stream: StreamDescriptor,
    pub per_window: Vec<(WindowKey, EmissionStats)>,
}

impl TakenStats {
    pub fn total(&self) -> EmissionStats {
        self.per_window.iter().map(|(_, stats)| *stats).sum()
    }
}

/// A partition's share of one checkpoint window.
pub type WindowKey = (PartitionKey, CheckpointIndex);

/// Per-stream counts of records durably flushed by writers, keyed by
/// partition and checkpoint window.
///
/// Keeping the window lets a checkpoint take exactly the records it covers,
/// even when a later window's records were flushed before it was emitted.
#[derive(Debug, Default)]
pub struct CommittedStatsStore {
    streams: DashMap<StreamDescriptor, Arc<Histogram<WindowKey, EmissionStats>>>,
}

impl CommittedStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a writer's flush into the store, outside any window.
    ///
    /// Stats accepted this way go to the next checkpoint of the stream.
    pub fn accept_stats(
        &self,
        stream: &StreamDescriptor,
        flushed: &Histogram<PartitionKey>,
        bytes: &Histogram<PartitionKey>,
    ) {
        self.accept_window_stats(stream, CheckpointIndex::NONE, flushed, bytes);
    }

    /// Merges a writer's flush of window `index` into the store.
    ///
    /// `flushed` holds record counts and `bytes` byte counts, both keyed by
    /// partition. Each partition's pair is applied in a single increment so a
    /// concurrent removal sees both or neither.
    pub fn accept_window_stats(
        &self,
        stream: &StreamDescriptor,
        index: CheckpointIndex,
        flushed: &Histogram<PartitionKey>,
        bytes: &Histogram<PartitionKey>,
    ) {
        let histogram = self.histogram(stream);
        let bytes = bytes.snapshot();
        let mut counts = flushed.snapshot();
        for partition in bytes.keys() {
            counts.entry(*partition).or_default();
        }
        for (partition, count) in counts {
            let partition_bytes = bytes.get(&partition).copied().unwrap_or_default();
            histogram.increment(
                (partition, index),
                EmissionStats::new(to_unsigned(count), to_unsigned(partition_bytes)),
            );
        }
    }

    /// Removes the listed partitions' stats for `stream`, across every
    /// window, and returns their sum. Zero when nothing was committed.
    pub fn remove_stats(&self, stream: &StreamDescriptor, keys: &[PartitionKey]) -> EmissionStats {
        self.take_stats(stream, keys, CheckpointIndex::new(u64::MAX))
            .total()
    }

    /// Takes the listed partitions' stats for windows up to and including
    /// `through`, keeping the breakdown for [`restore`](Self::restore).
    pub fn take_stats(
        &self,
        stream: &StreamDescriptor,
        keys: &[PartitionKey],
        through: CheckpointIndex,
    ) -> TakenStats {
        let mut taken = TakenStats {
            stream: stream.clone(),
            per_window: Vec::new(),
        };
        let Some(histogram) = self.streams.get(stream).map(|entry| Arc::clone(entry.value())) else {
            return taken;
        };
        let mut windows: Vec<WindowKey> = histogram
            .snapshot()
            .into_keys()
            .filter(|(partition, index)| *index <= through && keys.contains(partition))
            .collect();
        windows.sort_unstable();
        for window in windows {
            let stats = histogram.remove(&window);
            if !stats.is_zero() {
                taken.per_window.push((window, stats));
            }
        }
        taken
    }

    /// Returns previously taken stats to the store.
    pub fn restore(&self, taken: TakenStats) {
        if taken.per_window.is_empty() {
            return;
        }
        let histogram = self.histogram(&taken.stream);
        for (window, stats) in taken.per_window {
            histogram.increment(window, stats);
        }
    }

    /// Committed stats not yet attributed to a checkpoint, without consuming
    /// them.
    pub fn pending(&self, stream: &StreamDescriptor) -> EmissionStats {
        self.streams
            .get(stream)
            .map(|histogram| histogram.snapshot().into_values().sum())
            .unwrap_or_default()
    }

    fn histogram(&self, stream: &StreamDescriptor) -> Arc<Histogram<WindowKey, EmissionStats>> {
        Arc::clone(self.streams.entry(stream.clone()).or_default().value())
    }
}

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

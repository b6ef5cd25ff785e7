//! Decorates outgoing checkpoint messages with committed stats.

use std::collections::BTreeMap;
use std::sync::Arc;

use tributary_types::{CheckpointIndex, EmissionStats, PartitionKey, StreamDescriptor};

use crate::checkpoint::{CheckpointMessage, StreamState};
use crate::namespace::NamespaceMapper;
use crate::stats::{CommittedStatsStore, TakenStats};

/// Consumes committed stats for a checkpoint and writes them onto its
/// message.
///
/// Enrichment takes the stats out of the store. The caller keeps the
/// returned [`TakenStats`] until the message has been emitted and hands them
/// back through [`StateStatsEnricher::restore`] if emission fails, so a
/// failed flush never loses or double counts records.
#[derive(Debug, Clone)]
pub struct StateStatsEnricher {
    committed: Arc<CommittedStatsStore>,
    mapper: Arc<NamespaceMapper>,
}

impl StateStatsEnricher {
    pub fn new(committed: Arc<CommittedStatsStore>, mapper: Arc<NamespaceMapper>) -> Self {
        Self { committed, mapper }
    }

    /// Writes stats for `partitions` onto `message` and returns what was
    /// taken from the store.
    ///
    /// `windows` maps each internal stream to the checkpoint window the
    /// message closes; only stats of that window and older are taken. A
    /// stream missing from `windows` only receives unwindowed stats.
    pub fn enrich(
        &self,
        message: &mut CheckpointMessage,
        partitions: &[PartitionKey],
        windows: &BTreeMap<StreamDescriptor, CheckpointIndex>,
    ) -> Vec<TakenStats> {
        match message {
            CheckpointMessage::Stream(state) => {
                vec![self.enrich_stream(state, partitions, windows)]
            }
            CheckpointMessage::Global(global) | CheckpointMessage::GlobalSnapshot(global) => {
                let taken: Vec<TakenStats> = global
                    .stream_states
                    .iter_mut()
                    .map(|state| self.enrich_stream(state, partitions, windows))
                    .collect();
                let total: EmissionStats = taken.iter().map(TakenStats::total).sum();
                global.apply_stats(total);
                taken
            }
        }
    }

    /// Puts stats taken by [`enrich`](Self::enrich) back into the store.
    pub fn restore(&self, taken: Vec<TakenStats>) {
        for stats in taken {
            self.committed.restore(stats);
        }
    }

    fn enrich_stream(
        &self,
        state: &mut StreamState,
        partitions: &[PartitionKey],
        windows: &BTreeMap<StreamDescriptor, CheckpointIndex>,
    ) -> TakenStats {
        let stream = self.mapper.map(&state.stream);
        let through = windows.get(&stream).copied().unwrap_or(CheckpointIndex::NONE);
        let taken = self.committed.take_stats(&stream, partitions, through);
        state.apply_stats(taken.total());
        taken
    }
}

//! Which checkpoint windows each partition has durably committed.
//!
//! Window `N` of a stream is the set of records tagged with index `N`.
//! A partition reports windows individually ([`CommitTracker::mark`]) or as a
//! prefix ([`CommitTracker::mark_through`]). A stream is committed through `N`
//! only once every partition has committed every window `1..=N`; a window
//! reported ahead of a gap is held until the gap closes.

use std::collections::{BTreeSet, HashMap};

use tributary_types::{CheckpointIndex, PartitionKey, StreamDescriptor};

use crate::error::CheckpointError;

#[derive(Debug, Clone, Default)]
struct PartitionProgress {
    /// Every window up to and including this one is committed.
    through: CheckpointIndex,
    /// Committed windows beyond a gap.
    ahead: BTreeSet<CheckpointIndex>,
}

impl PartitionProgress {
    fn mark(&mut self, index: CheckpointIndex) {
        if index > self.through {
            self.ahead.insert(index);
            self.absorb();
        }
    }

    fn mark_through(&mut self, index: CheckpointIndex) {
        if index > self.through {
            self.through = index;
            self.ahead = self.ahead.split_off(&index.next());
            self.absorb();
        }
    }

    fn absorb(&mut self) {
        while self.ahead.remove(&self.through.next()) {
            self.through = self.through.next();
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommitTracker {
    partition_count: usize,
    streams: HashMap<StreamDescriptor, Vec<PartitionProgress>>,
}

impl CommitTracker {
    pub(crate) fn new(partition_count: usize) -> Self {
        Self {
            partition_count,
            streams: HashMap::new(),
        }
    }

    pub(crate) fn mark(
        &mut self,
        stream: &StreamDescriptor,
        partition: PartitionKey,
        index: CheckpointIndex,
    ) -> Result<(), CheckpointError> {
        self.progress(stream, partition)?.mark(index);
        Ok(())
    }

    pub(crate) fn mark_through(
        &mut self,
        stream: &StreamDescriptor,
        partition: PartitionKey,
        index: CheckpointIndex,
    ) -> Result<(), CheckpointError> {
        self.progress(stream, partition)?.mark_through(index);
        Ok(())
    }

    /// Highest index every partition has committed a contiguous prefix
    /// through.
    pub(crate) fn committed_through(&self, stream: &StreamDescriptor) -> CheckpointIndex {
        self.streams
            .get(stream)
            .and_then(|partitions| partitions.iter().map(|p| p.through).min())
            .unwrap_or(CheckpointIndex::NONE)
    }

    /// [`CheckpointIndex::NONE`] is always committed.
    pub(crate) fn is_committed(&self, stream: &StreamDescriptor, index: CheckpointIndex) -> bool {
        index.is_none() || self.committed_through(stream) >= index
    }

    fn progress(
        &mut self,
        stream: &StreamDescriptor,
        partition: PartitionKey,
    ) -> Result<&mut PartitionProgress, CheckpointError> {
        if partition.as_usize() >= self.partition_count {
            return Err(CheckpointError::UnknownPartition {
                partition,
                partition_count: self.partition_count,
            });
        }
        let partitions = self
            .streams
            .entry(stream.clone())
            .or_insert_with(|| vec![PartitionProgress::default(); self.partition_count]);
        Ok(&mut partitions[partition.as_usize()])
    }
}

//! Pending checkpoints and the flush path.
//!
//! # Locking
//!
//! Pending state sits behind one mutex, held only for short bookkeeping
//! sections. A second lock serializes flushers: the flush path picks the
//! next ready checkpoint under the state lock, releases it, enriches and
//! emits, then retakes it to retire the checkpoint. Adds and commit reports
//! never wait on the sink.
//!
//! # Ordering
//!
//! Within a stream, pending checkpoints leave strictly in index order. In
//! global mode, globals leave in the order they were added.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tributary_types::{CheckpointIndex, PartitionKey, StreamDescriptor};

use super::commits::CommitTracker;
use super::{CheckpointMessage, CheckpointMode};
use crate::clock::Clock;
use crate::enrich::StateStatsEnricher;
use crate::error::CheckpointError;
use crate::reservation::Reservation;
use crate::sink::CheckpointSink;

#[derive(Debug)]
struct PendingCheckpoint {
    message: CheckpointMessage,
    reservation: Reservation,
}

#[derive(Debug)]
struct PendingGlobal {
    indexes: Vec<(StreamDescriptor, CheckpointIndex)>,
    checkpoint: PendingCheckpoint,
}

#[derive(Debug, Default)]
struct StreamCheckpoints {
    pending: BTreeMap<CheckpointIndex, PendingCheckpoint>,
    last_added: CheckpointIndex,
    last_flushed: CheckpointIndex,
    last_flush_ms: Option<u64>,
}

#[derive(Debug)]
struct ManagerState {
    mode: Option<CheckpointMode>,
    streams: BTreeMap<StreamDescriptor, StreamCheckpoints>,
    globals: VecDeque<PendingGlobal>,
    commits: CommitTracker,
    flushed: u64,
}

impl ManagerState {
    fn check_mode(&self, adding: CheckpointMode) -> Result<(), CheckpointError> {
        match self.mode {
            Some(existing) if existing != adding => {
                Err(CheckpointError::MixedCheckpointKinds { existing, adding })
            }
            _ => Ok(()),
        }
    }

    fn check_order(
        &self,
        stream: &StreamDescriptor,
        index: CheckpointIndex,
    ) -> Result<(), CheckpointError> {
        let last = self
            .streams
            .get(stream)
            .map_or(CheckpointIndex::NONE, |s| s.last_added);
        if index <= last {
            return Err(CheckpointError::OutOfOrder {
                stream: stream.clone(),
                index,
                last,
            });
        }
        Ok(())
    }

    /// The next checkpoint whose windows are all committed, if any.
    fn next_ready(&self) -> Option<ReadyCheckpoint> {
        match self.mode? {
            CheckpointMode::Stream => self.streams.iter().find_map(|(stream, checkpoints)| {
                let (index, pending) = checkpoints.pending.first_key_value()?;
                self.commits
                    .is_committed(stream, *index)
                    .then(|| ReadyCheckpoint::Stream {
                        stream: stream.clone(),
                        index: *index,
                        message: pending.message.clone(),
                    })
            }),
            CheckpointMode::Global => {
                let global = self.globals.front()?;
                global
                    .indexes
                    .iter()
                    .all(|(stream, index)| self.commits.is_committed(stream, *index))
                    .then(|| ReadyCheckpoint::Global {
                        indexes: global.indexes.clone(),
                        message: global.checkpoint.message.clone(),
                    })
            }
        }
    }

    /// Retires a checkpoint returned by `next_ready` and releases its
    /// reservation.
    fn retire(&mut self, ready: &ReadyCheckpoint, now_ms: u64) {
        match ready {
            ReadyCheckpoint::Stream { stream, index, .. } => {
                let Some(checkpoints) = self.streams.get_mut(stream) else {
                    return;
                };
                if let Some(pending) = checkpoints.pending.remove(index) {
                    pending.reservation.release();
                }
                checkpoints.last_flushed = *index;
                checkpoints.last_flush_ms = Some(now_ms);
            }
            ReadyCheckpoint::Global { .. } => {
                let Some(global) = self.globals.pop_front() else {
                    return;
                };
                for (stream, index) in &global.indexes {
                    let checkpoints = self.streams.entry(stream.clone()).or_default();
                    checkpoints.last_flushed = checkpoints.last_flushed.max(*index);
                    checkpoints.last_flush_ms = Some(now_ms);
                }
                global.checkpoint.reservation.release();
            }
        }
        self.flushed += 1;
    }
}

/// A checkpoint picked for flushing, with a copy of its message to enrich.
#[derive(Debug)]
enum ReadyCheckpoint {
    Stream {
        stream: StreamDescriptor,
        index: CheckpointIndex,
        message: CheckpointMessage,
    },
    Global {
        indexes: Vec<(StreamDescriptor, CheckpointIndex)>,
        message: CheckpointMessage,
    },
}

impl ReadyCheckpoint {
    fn message(&self) -> &CheckpointMessage {
        match self {
            Self::Stream { message, .. } | Self::Global { message, .. } => message,
        }
    }

    /// The window each stream's stats are taken through.
    fn windows(&self) -> BTreeMap<StreamDescriptor, CheckpointIndex> {
        match self {
            Self::Stream { stream, index, .. } => BTreeMap::from([(stream.clone(), *index)]),
            Self::Global { indexes, .. } => indexes.iter().cloned().collect(),
        }
    }
}

/// Tracks pending checkpoints and emits each one once every partition has
/// committed the records it covers.
pub struct CheckpointManager {
    state: Mutex<ManagerState>,
    flush_lock: Mutex<()>,
    enricher: StateStatsEnricher,
    sink: Arc<dyn CheckpointSink>,
    clock: Arc<dyn Clock>,
    partitions: Vec<PartitionKey>,
    last_flush_ms: AtomicU64,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("partitions", &self.partitions.len())
            .field("pending", &self.pending_count())
            .field("last_flush_ms", &self.get_last_successful_flush_time_ms())
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Creates a manager for `partition_count` writer partitions.
    ///
    /// The last successful flush time starts at the clock's current time.
    ///
    /// # Panics
    ///
    /// Panics if `partition_count` is 0.
    pub fn new(
        partition_count: usize,
        enricher: StateStatsEnricher,
        sink: Arc<dyn CheckpointSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(partition_count > 0, "partition_count must be positive");
        let now = clock.now_ms();
        Self {
            state: Mutex::new(ManagerState {
                mode: None,
                streams: BTreeMap::new(),
                globals: VecDeque::new(),
                commits: CommitTracker::new(partition_count),
                flushed: 0,
            }),
            flush_lock: Mutex::new(()),
            enricher,
            sink,
            clock,
            partitions: PartitionKey::all(partition_count),
            last_flush_ms: AtomicU64::new(now),
        }
    }

    /// Records a pending checkpoint closing window `index` of `stream`.
    ///
    /// On error the reservation is released.
    pub fn add_stream_checkpoint(
        &self,
        stream: StreamDescriptor,
        index: CheckpointIndex,
        message: CheckpointMessage,
        reservation: Reservation,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        state.check_mode(CheckpointMode::Stream)?;
        state.check_order(&stream, index)?;

        state.mode = Some(CheckpointMode::Stream);
        debug!(stream = %stream, index = index.as_u64(), "stream checkpoint added");
        let checkpoints = state.streams.entry(stream).or_default();
        checkpoints.last_added = index;
        checkpoints.pending.insert(
            index,
            PendingCheckpoint {
                message,
                reservation,
            },
        );
        Ok(())
    }

    /// Records a pending checkpoint spanning several streams. Streams listed
    /// with [`CheckpointIndex::NONE`] have no work to wait for.
    ///
    /// On error the reservation is released.
    pub fn add_global_checkpoint(
        &self,
        indexes: Vec<(StreamDescriptor, CheckpointIndex)>,
        message: CheckpointMessage,
        reservation: Reservation,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();
        state.check_mode(CheckpointMode::Global)?;
        for (stream, index) in &indexes {
            if !index.is_none() {
                state.check_order(stream, *index)?;
            }
        }

        state.mode = Some(CheckpointMode::Global);
        for (stream, index) in &indexes {
            if !index.is_none() {
                state.streams.entry(stream.clone()).or_default().last_added = *index;
            }
        }
        debug!(streams = indexes.len(), "global checkpoint added");
        state.globals.push_back(PendingGlobal {
            indexes,
            checkpoint: PendingCheckpoint {
                message,
                reservation,
            },
        });
        Ok(())
    }

    /// Marks window `index` of `stream` committed on `partition`.
    pub fn mark_committed(
        &self,
        stream: &StreamDescriptor,
        partition: PartitionKey,
        index: CheckpointIndex,
    ) -> Result<(), CheckpointError> {
        self.state.lock().commits.mark(stream, partition, index)
    }

    /// Marks every window of `stream` up to and including `index` committed
    /// on `partition`.
    pub fn mark_committed_through(
        &self,
        stream: &StreamDescriptor,
        partition: PartitionKey,
        index: CheckpointIndex,
    ) -> Result<(), CheckpointError> {
        self.state
            .lock()
            .commits
            .mark_through(stream, partition, index)
    }

    /// Enriches and emits every checkpoint that is ready, in order.
    ///
    /// Returns how many were emitted. If the sink fails, the failing
    /// checkpoint stays pending with its reservation, the stats taken for it
    /// go back to the committed store, and the error is returned; a later
    /// call retries it.
    pub fn flush_ready_checkpoint_messages(&self) -> Result<usize, CheckpointError> {
        let _flush = self.flush_lock.lock();
        let mut emitted = 0;

        loop {
            let Some(ready) = self.state.lock().next_ready() else {
                break;
            };

            let mut message = ready.message().clone();
            let taken = self
                .enricher
                .enrich(&mut message, &self.partitions, &ready.windows());
            if let Err(err) = self.sink.emit(&message) {
                self.enricher.restore(taken);
                warn!(error = %err, emitted, "checkpoint emission failed; will retry");
                return Err(err.into());
            }

            let now = self.clock.now_ms();
            self.state.lock().retire(&ready, now);
            self.last_flush_ms.fetch_max(now, Ordering::AcqRel);
            emitted += 1;

            match &ready {
                ReadyCheckpoint::Stream { stream, index, .. } => info!(
                    stream = %stream,
                    index = index.as_u64(),
                    records = message.totals().unwrap_or_default().count,
                    "stream checkpoint flushed"
                ),
                ReadyCheckpoint::Global { .. } => info!(
                    records = message.totals().unwrap_or_default().count,
                    "global checkpoint flushed"
                ),
            }
        }

        Ok(emitted)
    }

    /// Per stream, the lowest index still pending. In global mode, the
    /// indexes of the oldest pending global checkpoint.
    pub fn get_next_checkpoint_indexes(&self) -> BTreeMap<StreamDescriptor, CheckpointIndex> {
        let state = self.state.lock();
        match state.mode {
            Some(CheckpointMode::Stream) => state
                .streams
                .iter()
                .filter_map(|(stream, checkpoints)| {
                    let index = checkpoints.pending.keys().next()?;
                    Some((stream.clone(), *index))
                })
                .collect(),
            Some(CheckpointMode::Global) => state
                .globals
                .front()
                .map(|global| {
                    global
                        .indexes
                        .iter()
                        .filter(|(_, index)| !index.is_none())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => BTreeMap::new(),
        }
    }

    /// Per stream, the newest index added.
    pub fn get_last_checkpoint_indexes(&self) -> BTreeMap<StreamDescriptor, CheckpointIndex> {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|(_, checkpoints)| !checkpoints.last_added.is_none())
            .map(|(stream, checkpoints)| (stream.clone(), checkpoints.last_added))
            .collect()
    }

    /// Time of the last successful emission, or of construction if nothing
    /// has been emitted yet. Never decreases.
    pub fn get_last_successful_flush_time_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state
            .streams
            .values()
            .map(|checkpoints| checkpoints.pending.len())
            .sum::<usize>()
            + state.globals.len()
    }

    pub fn last_flushed_index(&self, stream: &StreamDescriptor) -> CheckpointIndex {
        self.state
            .lock()
            .streams
            .get(stream)
            .map_or(CheckpointIndex::NONE, |checkpoints| checkpoints.last_flushed)
    }

    /// Last emission time for one stream.
    pub fn last_stream_flush_time_ms(&self, stream: &StreamDescriptor) -> Option<u64> {
        self.state
            .lock()
            .streams
            .get(stream)
            .and_then(|checkpoints| checkpoints.last_flush_ms)
    }

    /// Highest index of `stream` committed on every partition.
    pub fn committed_through(&self, stream: &StreamDescriptor) -> CheckpointIndex {
        self.state.lock().commits.committed_through(stream)
    }

    /// True once every partition has committed `stream` through `index`.
    pub fn is_committed(&self, stream: &StreamDescriptor, index: CheckpointIndex) -> bool {
        self.state.lock().commits.is_committed(stream, index)
    }

    /// Total checkpoints emitted so far.
    pub fn flushed_count(&self) -> u64 {
        self.state.lock().flushed
    }

    pub fn mode(&self) -> Option<CheckpointMode> {
        self.state.lock().mode
    }

    pub fn partitions(&self) -> &[PartitionKey] {
        &self.partitions
    }
}

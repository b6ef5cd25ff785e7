//! Wiring of a sync: ingress, writer threads, and background tasks.
//!
//! ```text
//! Ingress ─┬─ records ──▶ record lanes ──────▶ tributary-writer-{n}
//!          │                                         │ mark_committed_through
//!          └─ checkpoints ▶ checkpoint lane ─▶ tributary-checkpoint-update
//!                                                    │ add_*_checkpoint
//!                                                    ▼
//!              tributary-timed-flush ──────▶ CheckpointManager ──▶ sink
//! ```
//!
//! Both queues draw from one [`MemoryBudget`]. When the budget is exhausted
//! the ingress forces a flush on every writer before it blocks, so records
//! buffered below `batch_size_bytes` cannot hold the budget forever.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use tributary_config::{QueueConfig, TributaryConfig};
use tributary_types::{CheckpointIndex, EmissionStats, PartitionKey, StreamDescriptor};

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointMessage};
use crate::clock::{Clock, ShutdownSignal, SystemClock};
use crate::enrich::StateStatsEnricher;
use crate::error::{CheckpointError, PipelineError, PipelineResult, StreamError};
use crate::namespace::NamespaceMapper;
use crate::queue::PartitionedQueue;
use crate::reservation::{MemoryBudget, Reservation};
use crate::sink::{CheckpointSink, JsonLinesSink};
use crate::stats::{CommittedStatsStore, EmittedStatsStore};
use crate::stream::{StreamRegistry, StreamResult};
use crate::tasks::{CheckpointUpdateTask, ForceFlushEvent, TimedFlushTask};
use crate::writer::{
    CheckpointBoundary, PartitionRouter, Record, WorkerReport, WriterFactory, WriterMessage,
    WriterRuntime,
};

const UPDATE_THREAD: &str = "tributary-checkpoint-update";
const TIMED_FLUSH_THREAD: &str = "tributary-timed-flush";

/// Assembles a [`Pipeline`] from its configuration and collaborators.
pub struct PipelineBuilder {
    config: TributaryConfig,
    sink: Option<Arc<dyn CheckpointSink>>,
    clock: Option<Arc<dyn Clock>>,
    mapper: NamespaceMapper,
}

impl PipelineBuilder {
    pub fn new(config: TributaryConfig) -> Self {
        Self {
            config,
            sink: None,
            clock: None,
            mapper: NamespaceMapper::identity(),
        }
    }

    /// Where enriched checkpoints go. Defaults to JSON lines on stdout.
    pub fn sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn namespace_mapper(mut self, mapper: NamespaceMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Validates the configuration and starts every thread of the sync.
    ///
    /// Writers are created on the calling thread, so a factory error is
    /// returned here before anything else runs.
    pub fn start(self, factory: &dyn WriterFactory) -> PipelineResult<(Pipeline, Ingress)> {
        self.config.validate()?;
        let Self {
            config,
            sink,
            clock,
            mapper,
        } = self;

        let sink =
            sink.unwrap_or_else(|| Arc::new(JsonLinesSink::stdout()) as Arc<dyn CheckpointSink>);
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let mapper = Arc::new(mapper);
        let partition_count = config.writers.partition_count;

        let budget = MemoryBudget::new(config.queue.memory_budget_bytes());
        let records = PartitionedQueue::new(partition_count, budget.clone());
        let checkpoints = PartitionedQueue::new(1, budget.clone());

        let emitted = Arc::new(EmittedStatsStore::new());
        let committed = Arc::new(CommittedStatsStore::new());
        let streams = Arc::new(StreamRegistry::new());
        let enricher = StateStatsEnricher::new(Arc::clone(&committed), Arc::clone(&mapper));
        let manager = Arc::new(CheckpointManager::new(
            partition_count,
            enricher,
            sink,
            Arc::clone(&clock),
        ));

        let writers = WriterRuntime::start(
            &records,
            factory,
            &manager,
            &committed,
            config.writers.batch_size_bytes,
        )?;

        // From here on a failed spawn drops the pipeline, which aborts it.
        let mut pipeline = Pipeline {
            records: records.clone(),
            checkpoints: checkpoints.clone(),
            budget,
            manager: Arc::clone(&manager),
            emitted: Arc::clone(&emitted),
            committed,
            streams: Arc::clone(&streams),
            writers,
            update_task: None,
            timed_flush: None,
            shutdown: ShutdownSignal::new(),
            finished: false,
        };

        let update = CheckpointUpdateTask::new(
            checkpoints.consume(PartitionKey::new(0))?,
            Arc::clone(&manager),
        );
        pipeline.update_task = Some(spawn(UPDATE_THREAD, move || update.run())?);

        let cadence = Duration::from_millis(config.checkpoint.max_checkpoint_flush_time_ms);
        let timed = TimedFlushTask::new(
            Arc::clone(&manager),
            records.clone(),
            clock,
            cadence,
            pipeline.shutdown.clone(),
        );
        pipeline.timed_flush = Some(spawn(TIMED_FLUSH_THREAD, move || timed.run())?);

        info!(
            partitions = partition_count,
            budget_bytes = ?pipeline.budget.limit_bytes(),
            flush_cadence_ms = config.checkpoint.max_checkpoint_flush_time_ms,
            "pipeline started"
        );

        let ingress = Ingress {
            router: PartitionRouter::new(partition_count, config.writers.partition_strategy),
            queue_config: config.queue,
            records,
            checkpoints,
            emitted,
            streams,
            mapper,
            windows: HashMap::new(),
        };
        Ok((pipeline, ingress))
    }
}

fn spawn<T, F>(name: &str, f: F) -> PipelineResult<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| PipelineError::Spawn {
            name: name.to_string(),
            source,
        })
}

/// Producer side of a sync: the extractor's records and checkpoint markers
/// enter here, in order.
///
/// Each stream has one open checkpoint window. Records are tagged with it,
/// and a checkpoint or the end of the stream closes it.
pub struct Ingress {
    records: PartitionedQueue<WriterMessage>,
    checkpoints: PartitionedQueue<Checkpoint>,
    emitted: Arc<EmittedStatsStore>,
    streams: Arc<StreamRegistry>,
    mapper: Arc<NamespaceMapper>,
    queue_config: QueueConfig,
    router: PartitionRouter,
    windows: HashMap<StreamDescriptor, CheckpointIndex>,
}

impl Ingress {
    /// Queues one record of `declared`, blocking while the memory budget is
    /// exhausted. Returns the partition it was routed to.
    ///
    /// Fails with [`StreamError::RecordAfterEndOfStream`] once the stream's
    /// end has been marked.
    ///
    /// [`StreamError::RecordAfterEndOfStream`]: crate::error::StreamError::RecordAfterEndOfStream
    pub fn submit_record(
        &mut self,
        declared: &StreamDescriptor,
        data: impl Into<Bytes>,
    ) -> PipelineResult<PartitionKey> {
        let stream = self.mapper.map(declared);
        self.streams.ensure_open(&stream)?;
        let data: Bytes = data.into();
        let size = data.len() as u64;

        let reservation =
            self.reserve(&self.records, self.queue_config.estimated_footprint(size))?;
        let index = *self
            .windows
            .entry(stream.clone())
            .or_insert(CheckpointIndex::FIRST);
        let partition = self.router.route(&stream);

        self.records.publish(
            partition,
            WriterMessage::Record(Record {
                stream: stream.clone(),
                index,
                data,
            }),
            reservation,
        )?;
        self.emitted.increment(&stream, 1, size);
        Ok(partition)
    }

    /// Closes the open window of every stream the checkpoint covers and
    /// queues the checkpoint behind those windows' records.
    pub fn submit_checkpoint(&mut self, message: CheckpointMessage) -> PipelineResult<()> {
        let reservation = self.reserve(
            &self.checkpoints,
            self.queue_config
                .estimated_footprint(message.estimated_size_bytes()),
        )?;

        let checkpoint = if let CheckpointMessage::Stream(state) = &message {
            let stream = self.mapper.map(&state.stream);
            let index = self.close_window(&stream);
            Checkpoint::Stream {
                stream,
                index,
                message,
            }
        } else {
            let indexes = self.close_all_windows(&message);
            Checkpoint::Global { indexes, message }
        };

        let closed: Vec<_> = checkpoint
            .indexes()
            .into_iter()
            .filter(|(_, index)| !index.is_none())
            .collect();
        debug!(
            kind = %checkpoint.mode(),
            streams = closed.len(),
            "checkpoint submitted"
        );
        if !closed.is_empty() {
            self.records
                .broadcast(&WriterMessage::Boundary(CheckpointBoundary { indexes: closed }))?;
        }
        self.checkpoints
            .publish(PartitionKey::new(0), checkpoint, reservation)?;
        Ok(())
    }

    /// Closes the open window of `declared` for good. Records already queued
    /// are still written, and later records of the stream are rejected.
    ///
    /// Returns the closed window; the stream succeeds once it is committed.
    pub fn mark_end_of_stream(
        &mut self,
        declared: &StreamDescriptor,
    ) -> PipelineResult<CheckpointIndex> {
        let stream = self.mapper.map(declared);
        if self.streams.end_index(&stream).is_some() {
            return Err(StreamError::EndOfStreamAlreadyMarked { stream }.into());
        }
        let index = self.close_window(&stream);
        self.streams.mark_end_of_stream(&stream, index)?;
        self.records
            .broadcast(&WriterMessage::Boundary(CheckpointBoundary {
                indexes: vec![(stream, index)],
            }))?;
        Ok(index)
    }

    /// The index records of `declared` are currently tagged with.
    pub fn open_index(&self, declared: &StreamDescriptor) -> CheckpointIndex {
        self.windows
            .get(&self.mapper.map(declared))
            .copied()
            .unwrap_or(CheckpointIndex::FIRST)
    }

    pub fn emitted_stats(&self) -> &EmittedStatsStore {
        &self.emitted
    }

    /// Reserves `bytes` on `queue`. If the budget is exhausted, every writer
    /// is told to flush its batch first, releasing the records it holds.
    fn reserve<T>(&self, queue: &PartitionedQueue<T>, bytes: u64) -> PipelineResult<Reservation> {
        if let Some(reservation) = queue.try_reserve(bytes)? {
            return Ok(reservation);
        }
        debug!(bytes, "memory budget exhausted; forcing writer flush");
        self.records
            .broadcast(&WriterMessage::ForceFlush(ForceFlushEvent::default()))?;
        Ok(queue.reserve(bytes)?)
    }

    fn close_window(&mut self, stream: &StreamDescriptor) -> CheckpointIndex {
        let open = self
            .windows
            .entry(stream.clone())
            .or_insert(CheckpointIndex::FIRST);
        let closed = *open;
        *open = closed.next();
        closed
    }

    /// Streams named by the message that never had a window get
    /// [`CheckpointIndex::NONE`].
    fn close_all_windows(
        &mut self,
        message: &CheckpointMessage,
    ) -> Vec<(StreamDescriptor, CheckpointIndex)> {
        let mut indexes: BTreeMap<StreamDescriptor, CheckpointIndex> = message
            .declared_streams()
            .into_iter()
            .map(|declared| (self.mapper.map(declared), CheckpointIndex::NONE))
            .collect();
        for (stream, open) in &mut self.windows {
            indexes.insert(stream.clone(), *open);
            *open = open.next();
        }
        indexes.into_iter().collect()
    }
}

/// Outcome of a drained sync.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub emitted: HashMap<StreamDescriptor, EmissionStats>,
    pub checkpoints_added: u64,
    pub checkpoints_flushed: u64,
    /// Checkpoints that could not be acknowledged before shutdown.
    pub pending_checkpoints: usize,
    pub forced_flushes: u64,
    pub writers: Vec<WorkerReport>,
    /// Result of every stream the sync saw.
    pub streams: BTreeMap<StreamDescriptor, StreamResult>,
}

impl SyncSummary {
    pub fn total_emitted(&self) -> EmissionStats {
        self.emitted.values().copied().sum()
    }

    pub fn all_streams_succeeded(&self) -> bool {
        self.streams.values().all(StreamResult::is_success)
    }

    pub fn total_written(&self) -> EmissionStats {
        self.writers
            .iter()
            .map(|report| EmissionStats::new(report.records_written, report.bytes_written))
            .sum()
    }
}

/// Running sync. Finish it with [`Pipeline::finish`]; dropping it aborts.
pub struct Pipeline {
    records: PartitionedQueue<WriterMessage>,
    checkpoints: PartitionedQueue<Checkpoint>,
    budget: MemoryBudget,
    manager: Arc<CheckpointManager>,
    emitted: Arc<EmittedStatsStore>,
    committed: Arc<CommittedStatsStore>,
    streams: Arc<StreamRegistry>,
    writers: WriterRuntime,
    update_task: Option<JoinHandle<Result<u64, CheckpointError>>>,
    timed_flush: Option<JoinHandle<u64>>,
    shutdown: ShutdownSignal,
    finished: bool,
}

impl Pipeline {
    /// Drains the sync after the extractor's last message.
    ///
    /// Every thread is joined before an error is returned. Errors are
    /// reported in pipeline order: update task, writers, final flush.
    ///
    /// Each stream is then resolved: succeeded if its end was marked and is
    /// committed, incomplete otherwise, or failed if the sync failed.
    pub fn finish(mut self, ingress: Ingress) -> PipelineResult<SyncSummary> {
        drop(ingress);
        self.finished = true;

        self.checkpoints.close();
        let added = self.join_update_task();

        self.records.close();
        let writers = self.writers.join();

        let final_flush = self.manager.flush_ready_checkpoint_messages();

        self.shutdown.trigger();
        let forced = self.join_timed_flush();

        let failed = added.is_err() || writers.is_err() || final_flush.is_err() || forced.is_err();
        self.resolve_streams(failed);

        let checkpoints_added = added?;
        let writers = writers?;
        final_flush?;
        let forced_flushes = forced?;

        let summary = SyncSummary {
            emitted: self.emitted.snapshot(),
            checkpoints_added,
            checkpoints_flushed: self.manager.flushed_count(),
            pending_checkpoints: self.manager.pending_count(),
            forced_flushes,
            writers,
            streams: self.streams.results(),
        };
        if summary.pending_checkpoints > 0 {
            warn!(
                pending = summary.pending_checkpoints,
                "sync finished with unacknowledged checkpoints"
            );
        }
        info!(
            records = summary.total_emitted().count,
            checkpoints = summary.checkpoints_flushed,
            "sync finished"
        );
        Ok(summary)
    }

    /// Stops every thread without the final checkpoint flush.
    ///
    /// Items already queued are still handed to the writers as their lanes
    /// drain.
    pub fn abort(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.finished = true;
        self.checkpoints.close();
        self.records.close();
        self.shutdown.trigger();

        let _ = self.join_update_task();
        let _ = self.writers.join();
        let _ = self.join_timed_flush();
        for (stream, _) in self.streams.unresolved() {
            self.streams.mark_processing_failed(&stream, "sync aborted");
        }
        warn!(
            pending = self.manager.pending_count(),
            "pipeline aborted"
        );
    }

    fn resolve_streams(&self, failed: bool) {
        for (stream, end) in self.streams.unresolved() {
            if failed {
                self.streams
                    .mark_processing_failed(&stream, "sync failed before the stream was committed");
                continue;
            }
            match end {
                Some(index) if self.manager.is_committed(&stream, index) => {
                    // End is marked, so this cannot fail
                    let _ = self.streams.mark_processing_succeeded(&stream);
                }
                _ => self.streams.mark_incomplete(&stream),
            }
        }
    }

    /// Returns the number of checkpoints added. Already joined counts as 0.
    fn join_update_task(&mut self) -> PipelineResult<u64> {
        match self.update_task.take() {
            Some(handle) => Ok(join_named(handle, UPDATE_THREAD)??),
            None => Ok(0),
        }
    }

    fn join_timed_flush(&mut self) -> PipelineResult<u64> {
        match self.timed_flush.take() {
            Some(handle) => join_named(handle, TIMED_FLUSH_THREAD),
            None => Ok(0),
        }
    }

    pub fn manager(&self) -> &Arc<CheckpointManager> {
        &self.manager
    }

    pub fn emitted_stats(&self) -> &Arc<EmittedStatsStore> {
        &self.emitted
    }

    pub fn committed_stats(&self) -> &Arc<CommittedStatsStore> {
        &self.committed
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.finished {
            self.stop();
        }
    }
}

fn join_named<T>(handle: JoinHandle<T>, name: &str) -> PipelineResult<T> {
    handle
        .join()
        .map_err(|_| PipelineError::TaskPanicked(name.to_string()))
}

//! Thread-per-partition writer runtime.
//!
//! Each partition has one dedicated OS thread draining its lane of the
//! record queue into a [`DestinationWriter`]. Records are batched until
//! `batch_size_bytes`, a [`ForceFlushEvent`], or the end of the lane.
//!
//! # Commit reporting
//!
//! The ingress broadcasts a [`CheckpointBoundary`] to every lane when it
//! closes a checkpoint window. Lanes are FIFO, so once a worker sees the
//! boundary for window `N` of a stream, every record of windows `..=N` on
//! this lane is behind it. The worker reports `N` as committed on its
//! partition as soon as none of that stream's records are still buffered:
//! immediately if the batch holds none, otherwise after the next flush.
//!
//! # Design
//!
//! - No async runtime: plain named threads blocking on their lane.
//! - A failing destination stops its worker and closes the record queue so
//!   the producer is released instead of blocking on a full budget.
//! - Record reservations are held until the batch containing them has been
//!   flushed.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tracing::{debug, error, instrument, warn};
use tributary_config::PartitionStrategy;
use tributary_types::{CheckpointIndex, EmissionStats, PartitionKey, StreamDescriptor};

use crate::checkpoint::CheckpointManager;
use crate::error::{PipelineError, PipelineResult, WriterError};
use crate::histogram::Histogram;
use crate::queue::{PartitionConsumer, PartitionedQueue};
use crate::reservation::Reservation;
use crate::stats::CommittedStatsStore;
use crate::tasks::ForceFlushEvent;

/// One record, tagged with the checkpoint window it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stream: StreamDescriptor,
    pub index: CheckpointIndex,
    pub data: Bytes,
}

/// The listed checkpoint windows are closed: no further records of them
/// follow on this lane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointBoundary {
    pub indexes: Vec<(StreamDescriptor, CheckpointIndex)>,
}

/// Items carried on a writer lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterMessage {
    Record(Record),
    Boundary(CheckpointBoundary),
    ForceFlush(ForceFlushEvent),
}

/// Destination-specific sink for one partition's records.
pub trait DestinationWriter: Send {
    /// Buffers or writes one record.
    fn write(&mut self, record: &Record) -> Result<(), WriterError>;

    /// Makes every record written so far durable.
    fn flush(&mut self) -> Result<(), WriterError>;
}

/// Builds the destination writer for each partition.
pub trait WriterFactory {
    fn create(&self, partition: PartitionKey) -> Result<Box<dyn DestinationWriter>, WriterError>;
}

impl<F> WriterFactory for F
where
    F: Fn(PartitionKey) -> Result<Box<dyn DestinationWriter>, WriterError>,
{
    fn create(&self, partition: PartitionKey) -> Result<Box<dyn DestinationWriter>, WriterError> {
        self(partition)
    }
}

/// Assigns records to partitions.
///
/// `ByStream` is deterministic: a stream always maps to the same partition,
/// preserving per-stream order.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    partition_count: usize,
    strategy: PartitionStrategy,
    next: usize,
}

impl PartitionRouter {
    /// # Panics
    ///
    /// Panics if `partition_count` is 0.
    pub fn new(partition_count: usize, strategy: PartitionStrategy) -> Self {
        assert!(partition_count > 0, "partition_count must be positive");
        Self {
            partition_count,
            strategy,
            next: 0,
        }
    }

    pub fn route(&mut self, stream: &StreamDescriptor) -> PartitionKey {
        let slot = match self.strategy {
            PartitionStrategy::ByStream => {
                let mut hasher = DefaultHasher::new();
                stream.hash(&mut hasher);
                (hasher.finish() % self.partition_count as u64) as usize
            }
            PartitionStrategy::RoundRobin => {
                let slot = self.next;
                self.next = (self.next + 1) % self.partition_count;
                slot
            }
        };
        PartitionKey::new(slot as u32)
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }
}

/// Totals for one worker over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerReport {
    pub partition: PartitionKey,
    pub records_written: u64,
    pub bytes_written: u64,
    pub batches_flushed: u64,
    pub forced_flushes: u64,
}

#[derive(Debug, Default)]
struct Batch {
    bytes: u64,
    per_window: HashMap<(StreamDescriptor, CheckpointIndex), EmissionStats>,
    reservations: Vec<Reservation>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.per_window.is_empty()
    }

    fn holds(&self, stream: &StreamDescriptor) -> bool {
        self.per_window.keys().any(|(buffered, _)| buffered == stream)
    }
}

/// Drains one lane into one destination writer.
pub struct WriterWorker {
    partition: PartitionKey,
    writer: Box<dyn DestinationWriter>,
    consumer: PartitionConsumer<WriterMessage>,
    manager: Arc<CheckpointManager>,
    committed: Arc<CommittedStatsStore>,
    batch_size_bytes: u64,
    batch: Batch,
    /// Newest window closed by a boundary, per stream.
    closed: HashMap<StreamDescriptor, CheckpointIndex>,
    /// Newest window reported committed, per stream.
    reported: HashMap<StreamDescriptor, CheckpointIndex>,
    report: WorkerReport,
}

impl WriterWorker {
    pub fn new(
        writer: Box<dyn DestinationWriter>,
        consumer: PartitionConsumer<WriterMessage>,
        manager: Arc<CheckpointManager>,
        committed: Arc<CommittedStatsStore>,
        batch_size_bytes: u64,
    ) -> Self {
        let partition = consumer.partition_key();
        Self {
            partition,
            writer,
            consumer,
            manager,
            committed,
            batch_size_bytes,
            batch: Batch::default(),
            closed: HashMap::new(),
            reported: HashMap::new(),
            report: WorkerReport {
                partition,
                ..WorkerReport::default()
            },
        }
    }

    /// Runs until the lane ends, then flushes the remainder.
    #[instrument(skip_all, fields(partition = %self.partition))]
    pub fn run(mut self) -> Result<WorkerReport, WriterError> {
        while let Some(delivery) = self.consumer.recv() {
            let (message, reservation) = delivery.into_parts();
            match message {
                WriterMessage::Record(record) => self.write(&record, reservation)?,
                WriterMessage::Boundary(boundary) => self.close_windows(boundary),
                WriterMessage::ForceFlush(event) => {
                    debug!(streams = event.indexes.len(), "forced flush");
                    self.report.forced_flushes += 1;
                    self.flush()?;
                }
            }
        }
        self.flush()?;
        debug!(
            records = self.report.records_written,
            batches = self.report.batches_flushed,
            "lane drained"
        );
        Ok(self.report)
    }

    fn write(
        &mut self,
        record: &Record,
        reservation: Option<Reservation>,
    ) -> Result<(), WriterError> {
        self.writer.write(record)?;

        let size = record.data.len() as u64;
        self.batch.bytes += size;
        *self
            .batch
            .per_window
            .entry((record.stream.clone(), record.index))
            .or_default() += EmissionStats::new(1, size);
        self.batch.reservations.extend(reservation);

        if self.batch.bytes >= self.batch_size_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn close_windows(&mut self, boundary: CheckpointBoundary) {
        let mut reported_any = false;
        for (stream, index) in boundary.indexes {
            let closed = self.closed.entry(stream.clone()).or_default();
            *closed = (*closed).max(index);
            if !self.batch.holds(&stream) {
                reported_any |= self.report_stream(&stream);
            }
        }
        if reported_any {
            self.flush_checkpoints();
        }
    }

    /// Flushes the destination, publishes the batch's stats, releases its
    /// reservations, then reports every closed window.
    fn flush(&mut self) -> Result<(), WriterError> {
        if !self.batch.is_empty() {
            self.writer.flush()?;

            let batch = std::mem::take(&mut self.batch);
            for ((stream, index), stats) in &batch.per_window {
                let flushed: Histogram<PartitionKey> =
                    [(self.partition, to_signed(stats.count))].into_iter().collect();
                let bytes: Histogram<PartitionKey> =
                    [(self.partition, to_signed(stats.bytes))].into_iter().collect();
                self.committed.accept_window_stats(stream, *index, &flushed, &bytes);
                self.report.records_written += stats.count;
                self.report.bytes_written += stats.bytes;
            }
            self.report.batches_flushed += 1;
            debug!(
                bytes = batch.bytes,
                windows = batch.per_window.len(),
                "batch flushed"
            );
            drop(batch.reservations);
        }

        let streams: Vec<StreamDescriptor> = self.closed.keys().cloned().collect();
        let mut reported_any = false;
        for stream in &streams {
            reported_any |= self.report_stream(stream);
        }
        if reported_any {
            self.flush_checkpoints();
        }
        Ok(())
    }

    /// Reports the stream's closed windows if they advanced. Returns true if
    /// anything was reported. A rejected report is retried on the next flush.
    fn report_stream(&mut self, stream: &StreamDescriptor) -> bool {
        let Some(closed) = self.closed.get(stream).copied() else {
            return false;
        };
        let reported = self.reported.get(stream).copied().unwrap_or_default();
        if closed <= reported {
            return false;
        }
        if let Err(err) = self
            .manager
            .mark_committed_through(stream, self.partition, closed)
        {
            warn!(stream = %stream, error = %err, "failed to report committed window");
            return false;
        }
        self.reported.insert(stream.clone(), closed);
        true
    }

    fn flush_checkpoints(&self) {
        if let Err(err) = self.manager.flush_ready_checkpoint_messages() {
            warn!(error = %err, "checkpoint flush after commit failed");
        }
    }
}

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

type WorkerHandle = thread::JoinHandle<Result<WorkerReport, WriterError>>;

/// Owns the writer threads.
///
/// # Lifecycle
///
/// 1. [`WriterRuntime::start`] creates every partition's writer and spawns
///    its thread.
/// 2. Closing the record queue ends each lane; workers flush and exit.
/// 3. [`WriterRuntime::join`] collects every worker's report.
///
/// Dropping the runtime closes the record queue and joins the threads.
pub struct WriterRuntime {
    records: PartitionedQueue<WriterMessage>,
    handles: Vec<(PartitionKey, Option<WorkerHandle>)>,
}

impl WriterRuntime {
    /// Spawns one `tributary-writer-{n}` thread per partition of `records`.
    pub fn start(
        records: &PartitionedQueue<WriterMessage>,
        factory: &dyn WriterFactory,
        manager: &Arc<CheckpointManager>,
        committed: &Arc<CommittedStatsStore>,
        batch_size_bytes: u64,
    ) -> PipelineResult<Self> {
        let mut runtime = Self {
            records: records.clone(),
            handles: Vec::with_capacity(records.partition_count()),
        };

        for partition in PartitionKey::all(records.partition_count()) {
            let writer = factory
                .create(partition)
                .map_err(|source| PipelineError::writer(partition, source))?;
            let worker = WriterWorker::new(
                writer,
                records.consume(partition)?,
                Arc::clone(manager),
                Arc::clone(committed),
                batch_size_bytes,
            );

            let queue = records.clone();
            let name = format!("tributary-writer-{}", partition.as_usize());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let result = worker.run();
                    if let Err(err) = &result {
                        error!(
                            partition = %partition,
                            error = %err,
                            "writer failed; closing record queue"
                        );
                        queue.close();
                    }
                    result
                })
                .map_err(|source| PipelineError::Spawn { name, source })?;
            runtime.handles.push((partition, Some(handle)));
        }

        Ok(runtime)
    }

    /// Waits for every worker. Returns the first failure after all threads
    /// have been joined.
    pub fn join(&mut self) -> PipelineResult<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_error = None;

        for (partition, handle) in &mut self.handles {
            let Some(handle) = handle.take() else {
                continue;
            };
            let outcome = match handle.join() {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(source)) => Err(PipelineError::writer(*partition, source)),
                Err(_) => Err(PipelineError::TaskPanicked(format!(
                    "tributary-writer-{}",
                    partition.as_usize()
                ))),
            };
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WriterRuntime {
    fn drop(&mut self) {
        if self.handles.iter().any(|(_, handle)| handle.is_some()) {
            self.records.close();
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMessage;
    use crate::clock::{Clock, ManualClock};
    use crate::enrich::StateStatsEnricher;
    use crate::namespace::NamespaceMapper;
    use crate::reservation::MemoryBudget;
    use crate::sink::{CheckpointSink, CollectingSink};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;

    /// Records every write and flush into shared state.
    #[derive(Clone, Default)]
    struct MemoryWriter {
        written: Arc<Mutex<Vec<Record>>>,
        flushes: Arc<Mutex<u64>>,
        fail_on_flush: bool,
    }

    impl DestinationWriter for MemoryWriter {
        fn write(&mut self, record: &Record) -> Result<(), WriterError> {
            self.written.lock().push(record.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), WriterError> {
            if self.fail_on_flush {
                return Err(WriterError::Destination("disk full".to_string()));
            }
            *self.flushes.lock() += 1;
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<CheckpointManager>,
        committed: Arc<CommittedStatsStore>,
        sink: Arc<CollectingSink>,
    }

    fn fixture(partitions: usize) -> Fixture {
        let sink = Arc::new(CollectingSink::new());
        let committed = Arc::new(CommittedStatsStore::new());
        let enricher =
            StateStatsEnricher::new(Arc::clone(&committed), Arc::new(NamespaceMapper::identity()));
        let manager = Arc::new(CheckpointManager::new(
            partitions,
            enricher,
            Arc::clone(&sink) as Arc<dyn CheckpointSink>,
            Arc::new(ManualClock::new(0)) as Arc<dyn Clock>,
        ));
        Fixture {
            manager,
            committed,
            sink,
        }
    }

    fn s(name: &str) -> StreamDescriptor {
        StreamDescriptor::unqualified(name)
    }

    fn idx(i: u64) -> CheckpointIndex {
        CheckpointIndex::new(i)
    }

    fn record(stream: &str, index: u64, data: &'static [u8]) -> WriterMessage {
        WriterMessage::Record(Record {
            stream: s(stream),
            index: idx(index),
            data: Bytes::from_static(data),
        })
    }

    fn boundary(stream: &str, index: u64) -> WriterMessage {
        WriterMessage::Boundary(CheckpointBoundary {
            indexes: vec![(s(stream), idx(index))],
        })
    }

    fn publish(queue: &PartitionedQueue<WriterMessage>, message: WriterMessage) {
        let reservation = queue.reserve(10).unwrap();
        queue.publish(PartitionKey::new(0), message, reservation).unwrap();
    }

    fn worker(
        f: &Fixture,
        queue: &PartitionedQueue<WriterMessage>,
        writer: MemoryWriter,
        batch_size_bytes: u64,
    ) -> WriterWorker {
        WriterWorker::new(
            Box::new(writer),
            queue.consume(PartitionKey::new(0)).unwrap(),
            Arc::clone(&f.manager),
            Arc::clone(&f.committed),
            batch_size_bytes,
        )
    }

    #[test]
    fn by_stream_routing_is_deterministic() {
        let mut router = PartitionRouter::new(4, PartitionStrategy::ByStream);
        let first = router.route(&s("users"));
        for _ in 0..10 {
            assert_eq!(router.route(&s("users")), first);
        }

        let seen: HashSet<_> = (0..100)
            .map(|i| router.route(&s(&format!("stream-{i}"))))
            .collect();
        assert_eq!(seen.len(), 4, "should spread across all partitions");
    }

    #[test]
    fn round_robin_cycles() {
        let mut router = PartitionRouter::new(3, PartitionStrategy::RoundRobin);
        let routed: Vec<u32> = (0..6).map(|_| u32::from(router.route(&s("a")))).collect();
        assert_eq!(routed, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "partition_count must be positive")]
    fn router_zero_partitions_panics() {
        let _router = PartitionRouter::new(0, PartitionStrategy::ByStream);
    }

    #[test]
    fn full_batch_flushes_and_publishes_stats() {
        let f = fixture(1);
        let queue = PartitionedQueue::new(1, MemoryBudget::bounded(1_000));
        let writer = MemoryWriter::default();

        publish(&queue, record("a", 1, b"12345"));
        publish(&queue, record("a", 1, b"67890"));
        publish(&queue, record("a", 1, b"x"));
        queue.close();

        let report = worker(&f, &queue, writer.clone(), 10).run().unwrap();

        // One batch at the size threshold, one remainder at lane end
        assert_eq!(report.batches_flushed, 2);
        assert_eq!(report.records_written, 3);
        assert_eq!(*writer.flushes.lock(), 2);
        assert_eq!(f.committed.pending(&s("a")), EmissionStats::new(3, 11));
        assert_eq!(queue.outstanding_bytes(), 0);
    }

    #[test]
    fn boundary_without_buffered_records_commits_immediately() {
        let f = fixture(1);
        let queue = PartitionedQueue::new(1, MemoryBudget::unbounded());
        queue.broadcast(&boundary("a", 1)).unwrap();
        queue.close();

        worker(&f, &queue, MemoryWriter::default(), 1_000).run().unwrap();
        assert_eq!(f.manager.committed_through(&s("a")), idx(1));
    }

    #[test]
    fn buffered_window_commits_only_after_flush() {
        let f = fixture(1);
        let queue = PartitionedQueue::new(1, MemoryBudget::unbounded());
        let writer = MemoryWriter::default();
        f.manager
            .add_stream_checkpoint(
                s("a"),
                idx(1),
                CheckpointMessage::stream(s("a"), json!(null)),
                Reservation::empty(),
            )
            .unwrap();

        publish(&queue, record("a", 1, b"abc"));
        queue.broadcast(&boundary("a", 1)).unwrap();
        let handle = {
            let worker = worker(&f, &queue, writer.clone(), 1_000);
            thread::spawn(move || worker.run())
        };

        // The boundary cannot be reported while the record is buffered
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(f.manager.committed_through(&s("a")), CheckpointIndex::NONE);
        assert!(f.sink.is_empty());

        queue
            .broadcast(&WriterMessage::ForceFlush(ForceFlushEvent::default()))
            .unwrap();
        queue.close();
        let report = handle.join().unwrap().unwrap();

        assert_eq!(report.forced_flushes, 1);
        assert_eq!(f.manager.committed_through(&s("a")), idx(1));
        assert_eq!(f.sink.len(), 1);
        assert_eq!(
            f.sink.messages()[0].totals(),
            Some(EmissionStats::new(1, 3))
        );
    }

    #[test]
    fn rejected_commit_report_is_not_marked_reported() {
        // The manager only knows partition 0; the worker drains partition 1
        let f = fixture(1);
        let queue = PartitionedQueue::new(2, MemoryBudget::unbounded());
        let mut worker = WriterWorker::new(
            Box::new(MemoryWriter::default()),
            queue.consume(PartitionKey::new(1)).unwrap(),
            Arc::clone(&f.manager),
            Arc::clone(&f.committed),
            1_000,
        );

        worker.close_windows(CheckpointBoundary {
            indexes: vec![(s("a"), idx(1))],
        });

        assert!(worker.reported.is_empty());
        assert_eq!(worker.closed.get(&s("a")), Some(&idx(1)));
    }

    #[test]
    fn flushed_stats_keep_their_window() {
        let f = fixture(1);
        let queue = PartitionedQueue::new(1, MemoryBudget::unbounded());
        publish(&queue, record("a", 1, b"ab"));
        publish(&queue, record("a", 2, b"cde"));
        queue.close();

        worker(&f, &queue, MemoryWriter::default(), 1_000).run().unwrap();

        let only = |through: u64| {
            f.committed
                .take_stats(&s("a"), &PartitionKey::all(1), idx(through))
                .total()
        };
        assert_eq!(only(1), EmissionStats::new(1, 2));
        assert_eq!(only(2), EmissionStats::new(1, 3));
    }

    #[test]
    fn destination_failure_closes_the_queue() {
        let f = fixture(1);
        let queue = PartitionedQueue::new(1, MemoryBudget::bounded(1_000));
        let writer = MemoryWriter {
            fail_on_flush: true,
            ..MemoryWriter::default()
        };
        let factory = move |_: PartitionKey| -> Result<Box<dyn DestinationWriter>, WriterError> {
            Ok(Box::new(writer.clone()))
        };

        let mut runtime =
            WriterRuntime::start(&queue, &factory, &f.manager, &f.committed, 1).unwrap();
        publish(&queue, record("a", 1, b"abc"));

        let err = runtime.join().unwrap_err();
        assert!(matches!(err, PipelineError::Writer { .. }));
        assert!(queue.is_closed());
        assert!(matches!(
            queue.reserve(1),
            Err(crate::error::QueueError::Closed)
        ));
    }

    #[test]
    fn factory_error_surfaces_from_start() {
        let f = fixture(2);
        let queue = PartitionedQueue::new(2, MemoryBudget::unbounded());
        let factory = |partition: PartitionKey| -> Result<Box<dyn DestinationWriter>, WriterError> {
            if partition.as_usize() == 1 {
                return Err(WriterError::Destination("no credentials".to_string()));
            }
            Ok(Box::new(MemoryWriter::default()))
        };

        let result = WriterRuntime::start(&queue, &factory, &f.manager, &f.committed, 1);
        assert!(matches!(result, Err(PipelineError::Writer { .. })));
    }

    #[test]
    fn runtime_drains_every_lane() {
        let f = fixture(2);
        let queue = PartitionedQueue::new(2, MemoryBudget::unbounded());
        let writers: Vec<MemoryWriter> = vec![MemoryWriter::default(), MemoryWriter::default()];
        let factory = {
            let writers = writers.clone();
            move |partition: PartitionKey| -> Result<Box<dyn DestinationWriter>, WriterError> {
                Ok(Box::new(writers[partition.as_usize()].clone()))
            }
        };

        let mut runtime =
            WriterRuntime::start(&queue, &factory, &f.manager, &f.committed, 1_000).unwrap();
        for i in 0..10u32 {
            let reservation = queue.reserve(1).unwrap();
            queue
                .publish(PartitionKey::new(i % 2), record("a", 1, b"r"), reservation)
                .unwrap();
        }
        queue.close();

        let reports = runtime.join().unwrap();
        assert_eq!(reports.iter().map(|r| r.records_written).sum::<u64>(), 10);
        assert_eq!(writers[0].written.lock().len(), 5);
        assert_eq!(writers[1].written.lock().len(), 5);
        assert_eq!(runtime.partition_count(), 2);
    }
}

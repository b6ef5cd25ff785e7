//! Bounds checkpoint latency when records arrive too slowly to fill batches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use tributary_types::{CheckpointIndex, StreamDescriptor};

use crate::checkpoint::CheckpointManager;
use crate::clock::{Clock, Delay, ShutdownSignal};
use crate::queue::PartitionedQueue;
use crate::writer::WriterMessage;

/// Tells every writer to flush its partial batch now.
///
/// `indexes` are the lowest pending checkpoint index per stream, i.e. how
/// far commits must reach to unblock the next acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForceFlushEvent {
    pub indexes: BTreeMap<StreamDescriptor, CheckpointIndex>,
}

/// Result of one iteration of the timed flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// A [`ForceFlushEvent`] was broadcast.
    pub forced: bool,
    /// How long to wait before the next tick.
    pub next_delay: Duration,
}

pub struct TimedFlushTask {
    manager: Arc<CheckpointManager>,
    records: PartitionedQueue<WriterMessage>,
    clock: Arc<dyn Clock>,
    cadence: Duration,
    shutdown: ShutdownSignal,
}

impl TimedFlushTask {
    pub fn new(
        manager: Arc<CheckpointManager>,
        records: PartitionedQueue<WriterMessage>,
        clock: Arc<dyn Clock>,
        cadence: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            manager,
            records,
            clock,
            cadence,
            shutdown,
        }
    }

    /// Loops until shutdown is signalled or the record queue closes.
    /// Returns how many forced flushes were broadcast.
    pub fn run(self) -> u64 {
        let mut forced = 0;
        let mut delay = self.cadence;
        loop {
            if self.clock.delay(delay, &self.shutdown) == Delay::Cancelled {
                break;
            }
            if self.records.is_closed() {
                break;
            }
            let outcome = self.tick();
            if outcome.forced {
                forced += 1;
            }
            delay = outcome.next_delay;
        }
        debug!(forced, "timed flush task stopped");
        forced
    }

    /// Flushes what is ready, then forces writers to flush if the last
    /// successful flush is at least one cadence old and checkpoints are
    /// waiting.
    pub fn tick(&self) -> TickOutcome {
        if let Err(err) = self.manager.flush_ready_checkpoint_messages() {
            warn!(error = %err, "timed checkpoint flush failed");
        }

        let cadence_ms = duration_ms(self.cadence);
        let since = self
            .clock
            .now_ms()
            .saturating_sub(self.manager.get_last_successful_flush_time_ms());

        if since >= cadence_ms {
            let indexes = self.manager.get_next_checkpoint_indexes();
            if indexes.is_empty() {
                return TickOutcome {
                    forced: false,
                    next_delay: self.cadence,
                };
            }
            info!(
                since_last_flush_ms = since,
                streams = indexes.len(),
                "forcing writers to flush"
            );
            let forced = match self
                .records
                .broadcast(&WriterMessage::ForceFlush(ForceFlushEvent { indexes }))
            {
                Ok(()) => true,
                Err(err) => {
                    debug!(error = %err, "record queue closed; skipping forced flush");
                    false
                }
            };
            return TickOutcome {
                forced,
                next_delay: self.cadence,
            };
        }

        TickOutcome {
            forced: false,
            next_delay: Duration::from_millis(cadence_ms - since),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointMessage;
    use crate::clock::ManualClock;
    use crate::enrich::StateStatsEnricher;
    use crate::namespace::NamespaceMapper;
    use crate::reservation::{MemoryBudget, Reservation};
    use crate::sink::{CheckpointSink, CollectingSink};
    use crate::stats::CommittedStatsStore;
    use serde_json::json;
    use std::thread;
    use std::time::Instant;
    use tributary_types::PartitionKey;

    const CADENCE: Duration = Duration::from_millis(100);

    struct Fixture {
        task: TimedFlushTask,
        manager: Arc<CheckpointManager>,
        records: PartitionedQueue<WriterMessage>,
        sink: Arc<CollectingSink>,
        clock: Arc<ManualClock>,
    }

    fn fixture(partitions: usize) -> Fixture {
        let sink = Arc::new(CollectingSink::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let enricher = StateStatsEnricher::new(
            Arc::new(CommittedStatsStore::new()),
            Arc::new(NamespaceMapper::identity()),
        );
        let manager = Arc::new(CheckpointManager::new(
            partitions,
            enricher,
            Arc::clone(&sink) as Arc<dyn CheckpointSink>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let records = PartitionedQueue::new(partitions, MemoryBudget::unbounded());
        let task = TimedFlushTask::new(
            Arc::clone(&manager),
            records.clone(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            CADENCE,
            ShutdownSignal::new(),
        );
        Fixture {
            task,
            manager,
            records,
            sink,
            clock,
        }
    }

    fn stream() -> StreamDescriptor {
        StreamDescriptor::unqualified("a")
    }

    fn add_pending(manager: &CheckpointManager, index: u64) {
        manager
            .add_stream_checkpoint(
                stream(),
                CheckpointIndex::new(index),
                CheckpointMessage::stream(stream(), json!(null)),
                Reservation::empty(),
            )
            .unwrap();
    }

    fn drain_force_flushes(records: &PartitionedQueue<WriterMessage>, partition: u32) -> usize {
        let consumer = records.consume(PartitionKey::new(partition)).unwrap();
        std::iter::from_fn(|| consumer.try_recv())
            .filter(|delivery| matches!(delivery.value, WriterMessage::ForceFlush(_)))
            .count()
    }

    #[test]
    fn waits_out_the_remaining_cadence() {
        let f = fixture(1);
        add_pending(&f.manager, 1);
        f.clock.advance(Duration::from_millis(30));

        let outcome = f.task.tick();
        assert!(!outcome.forced);
        assert_eq!(outcome.next_delay, Duration::from_millis(70));
        assert_eq!(drain_force_flushes(&f.records, 0), 0);
    }

    #[test]
    fn stale_pending_checkpoint_forces_every_writer() {
        let f = fixture(3);
        add_pending(&f.manager, 1);
        f.clock.advance(CADENCE);

        let outcome = f.task.tick();
        assert!(outcome.forced);
        assert_eq!(outcome.next_delay, CADENCE);

        for partition in 0..3 {
            let consumer = f.records.consume(PartitionKey::new(partition)).unwrap();
            let delivery = consumer.try_recv().expect("force flush broadcast");
            let WriterMessage::ForceFlush(event) = delivery.value else {
                panic!("expected a force flush");
            };
            assert_eq!(event.indexes, BTreeMap::from([(stream(), CheckpointIndex::new(1))]));
        }
    }

    #[test]
    fn nothing_pending_never_forces() {
        let f = fixture(1);
        f.clock.advance(CADENCE * 5);

        let outcome = f.task.tick();
        assert!(!outcome.forced);
        assert_eq!(outcome.next_delay, CADENCE);
    }

    #[test]
    fn committed_checkpoint_flushes_on_the_next_tick() {
        let f = fixture(1);
        add_pending(&f.manager, 1);
        f.clock.advance(CADENCE);
        assert!(f.task.tick().forced);

        // A writer acting on the event commits the window
        f.manager
            .mark_committed_through(&stream(), PartitionKey::new(0), CheckpointIndex::new(1))
            .unwrap();
        f.clock.advance(CADENCE);

        let outcome = f.task.tick();
        assert!(!outcome.forced);
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.manager.get_last_successful_flush_time_ms(), 10_200);
    }

    #[test]
    fn closed_queue_is_not_forced() {
        let f = fixture(1);
        add_pending(&f.manager, 1);
        f.records.close();
        f.clock.advance(CADENCE);
        assert!(!f.task.tick().forced);
    }

    #[test]
    fn run_stops_promptly_on_shutdown() {
        let sink = Arc::new(CollectingSink::new());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let enricher = StateStatsEnricher::new(
            Arc::new(CommittedStatsStore::new()),
            Arc::new(NamespaceMapper::identity()),
        );
        let manager = Arc::new(CheckpointManager::new(
            1,
            enricher,
            sink as Arc<dyn CheckpointSink>,
            Arc::clone(&clock),
        ));
        let shutdown = ShutdownSignal::new();
        let task = TimedFlushTask::new(
            manager,
            PartitionedQueue::new(1, MemoryBudget::unbounded()),
            clock,
            Duration::from_secs(3600),
            shutdown.clone(),
        );

        let started = Instant::now();
        let handle = thread::spawn(move || task.run());
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        assert_eq!(handle.join().unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

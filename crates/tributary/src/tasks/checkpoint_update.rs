//! Single consumer that moves checkpoint markers into the manager.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::CheckpointError;
use crate::queue::{Delivery, PartitionConsumer};
use crate::reservation::Reservation;

/// Drains the checkpoint lane into the [`CheckpointManager`].
///
/// This task is the only caller of the manager's add operations, so indexes
/// for a stream arrive in the order the ingress assigned them.
pub struct CheckpointUpdateTask {
    consumer: PartitionConsumer<Checkpoint>,
    manager: Arc<CheckpointManager>,
}

impl CheckpointUpdateTask {
    pub fn new(consumer: PartitionConsumer<Checkpoint>, manager: Arc<CheckpointManager>) -> Self {
        Self { consumer, manager }
    }

    /// Runs until the lane is closed and drained. Returns the number of
    /// checkpoints added.
    ///
    /// # Errors
    ///
    /// An add that the manager rejects (out of order, mixed kinds) ends the
    /// task; the sync cannot produce correct acknowledgments past it.
    pub fn run(self) -> Result<u64, CheckpointError> {
        let mut added = 0;
        while let Some(delivery) = self.consumer.recv() {
            self.apply(delivery).inspect_err(|err| {
                error!(error = %err, added, "checkpoint update task stopping");
            })?;
            added += 1;

            if let Err(err) = self.manager.flush_ready_checkpoint_messages() {
                warn!(error = %err, "opportunistic flush after add failed");
            }
        }
        debug!(added, "checkpoint lane drained");
        Ok(added)
    }

    /// Adds one marker to the manager, keeping only the part of its
    /// reservation that the retained message needs.
    fn apply(&self, delivery: Delivery<Checkpoint>) -> Result<(), CheckpointError> {
        let (checkpoint, reservation) = delivery.into_parts();
        let mut reservation = reservation.unwrap_or_else(Reservation::empty);
        let retained = checkpoint
            .message()
            .estimated_size_bytes()
            .min(reservation.bytes());
        let kept = reservation.split(retained);
        reservation.release();

        match checkpoint {
            Checkpoint::Stream {
                stream,
                index,
                message,
            } => self
                .manager
                .add_stream_checkpoint(stream, index, message, kept),
            Checkpoint::Global { indexes, message } => {
                self.manager.add_global_checkpoint(indexes, message, kept)
            }
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
    use crate::queue::PartitionedQueue;
    use crate::reservation::MemoryBudget;
    use crate::sink::{CheckpointSink, CollectingSink};
    use crate::stats::CommittedStatsStore;
    use serde_json::json;
    use std::thread;
    use tributary_types::{CheckpointIndex, PartitionKey, StreamDescriptor};

    fn manager(sink: &Arc<CollectingSink>) -> Arc<CheckpointManager> {
        let enricher = StateStatsEnricher::new(
            Arc::new(CommittedStatsStore::new()),
            Arc::new(NamespaceMapper::identity()),
        );
        Arc::new(CheckpointManager::new(
            1,
            enricher,
            Arc::clone(sink) as Arc<dyn CheckpointSink>,
            Arc::new(ManualClock::new(0)) as Arc<dyn Clock>,
        ))
    }

    fn stream_checkpoint(index: u64) -> Checkpoint {
        let stream = StreamDescriptor::unqualified("a");
        Checkpoint::Stream {
            stream: stream.clone(),
            index: CheckpointIndex::new(index),
            message: CheckpointMessage::stream(stream, json!({ "position": index })),
        }
    }

    #[test]
    fn adds_markers_in_lane_order() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(&sink);
        let lane = PartitionedQueue::new(1, MemoryBudget::unbounded());

        for i in 1..=3 {
            let reservation = lane.reserve(10).unwrap();
            lane.publish(PartitionKey::new(0), stream_checkpoint(i), reservation)
                .unwrap();
        }
        lane.close();

        let task = CheckpointUpdateTask::new(
            lane.consume(PartitionKey::new(0)).unwrap(),
            Arc::clone(&manager),
        );
        assert_eq!(task.run().unwrap(), 3);
        assert_eq!(manager.pending_count(), 3);
        assert_eq!(
            manager.get_last_checkpoint_indexes()[&StreamDescriptor::unqualified("a")],
            CheckpointIndex::new(3)
        );
    }

    #[test]
    fn keeps_only_the_retained_payload_reservation() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(&sink);
        let lane = PartitionedQueue::new(1, MemoryBudget::bounded(100_000));

        let checkpoint = stream_checkpoint(1);
        let payload = checkpoint.message().estimated_size_bytes();
        let reservation = lane.reserve(payload * 3).unwrap();
        lane.publish(PartitionKey::new(0), checkpoint, reservation)
            .unwrap();
        lane.close();

        CheckpointUpdateTask::new(lane.consume(PartitionKey::new(0)).unwrap(), Arc::clone(&manager))
            .run()
            .unwrap();
        assert_eq!(lane.outstanding_bytes(), payload);

        manager
            .mark_committed_through(
                &StreamDescriptor::unqualified("a"),
                PartitionKey::new(0),
                CheckpointIndex::new(1),
            )
            .unwrap();
        manager.flush_ready_checkpoint_messages().unwrap();
        assert_eq!(lane.outstanding_bytes(), 0);
    }

    #[test]
    fn rejected_add_stops_the_task() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(&sink);
        let lane = PartitionedQueue::new(1, MemoryBudget::bounded(1_000));

        for i in [2, 1] {
            let reservation = lane.reserve(10).unwrap();
            lane.publish(PartitionKey::new(0), stream_checkpoint(i), reservation)
                .unwrap();
        }
        lane.close();

        let err = CheckpointUpdateTask::new(lane.consume(PartitionKey::new(0)).unwrap(), manager)
            .run()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::OutOfOrder { .. }));
    }

    #[test]
    fn runs_until_the_lane_closes() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(&sink);
        let lane = PartitionedQueue::new(1, MemoryBudget::unbounded());

        let handle = {
            let task = CheckpointUpdateTask::new(
                lane.consume(PartitionKey::new(0)).unwrap(),
                Arc::clone(&manager),
            );
            thread::spawn(move || task.run())
        };

        for i in 1..=5 {
            let reservation = lane.reserve(1).unwrap();
            lane.publish(PartitionKey::new(0), stream_checkpoint(i), reservation)
                .unwrap();
        }
        lane.close();

        assert_eq!(handle.join().unwrap().unwrap(), 5);
    }
}

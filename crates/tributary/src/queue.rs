//! Partitioned, memory-budgeted queue.
//!
//! Each partition is a lock-free `crossbeam-queue` lane. Capacity is not
//! bounded by item count but by bytes: producers take a [`Reservation`] from
//! the shared [`MemoryBudget`] before publishing, and the reservation travels
//! with the item until the consumer releases it.
//!
//! # Ordering
//!
//! Items are FIFO per partition. There is no ordering across partitions.
//!
//! # Shutdown
//!
//! [`PartitionedQueue::close`] rejects further publishes, closes the budget so
//! blocked producers fail with [`QueueError::Closed`], and wakes consumers.
//! Consumers drain what is already queued and then see the end of the lane.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tributary_types::PartitionKey;

use crate::error::QueueError;
use crate::reservation::{MemoryBudget, Reservation};

/// An item handed to a consumer together with its reservation.
///
/// Broadcast control items carry no reservation.
#[derive(Debug)]
pub struct Delivery<T> {
    pub value: T,
    pub reservation: Option<Reservation>,
}

impl<T> Delivery<T> {
    pub fn into_parts(self) -> (T, Option<Reservation>) {
        (self.value, self.reservation)
    }
}

#[derive(Debug)]
struct Lane<T> {
    items: SegQueue<Delivery<T>>,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self {
            items: SegQueue::new(),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Pushes under the lane lock unless `closed` is set. A consumer that
    /// saw the lane closed and empty under the same lock never misses an
    /// item.
    fn push(&self, delivery: Delivery<T>, closed: &AtomicBool) -> Result<(), QueueError> {
        let _guard = self.lock.lock();
        if closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.items.push(delivery);
        self.ready.notify_one();
        Ok(())
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }
}

#[derive(Debug)]
struct Shared<T> {
    lanes: Vec<Lane<T>>,
    budget: MemoryBudget,
    closed: AtomicBool,
}

/// Memory-budgeted queue with one FIFO lane per partition.
#[derive(Debug)]
pub struct PartitionedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PartitionedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> PartitionedQueue<T> {
    /// Creates a queue with `partitions` lanes drawing on `budget`.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is 0.
    pub fn new(partitions: usize, budget: MemoryBudget) -> Self {
        assert!(partitions > 0, "queue must have at least one partition");
        Self {
            shared: Arc::new(Shared {
                lanes: (0..partitions).map(|_| Lane::new()).collect(),
                budget,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Reserves `bytes` from the queue's budget, blocking while it is
    /// exhausted.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.shared.budget.reserve(bytes)
    }

    /// Like [`reserve`](Self::reserve) but returns `None` instead of
    /// blocking when the budget is exhausted.
    pub fn try_reserve(&self, bytes: u64) -> Result<Option<Reservation>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.shared.budget.try_reserve(bytes)
    }

    /// Enqueues `value` on `partition`. On error the reservation is dropped,
    /// which releases it.
    pub fn publish(
        &self,
        partition: PartitionKey,
        value: T,
        reservation: Reservation,
    ) -> Result<(), QueueError> {
        self.lane(partition)?.push(
            Delivery {
                value,
                reservation: Some(reservation),
            },
            &self.shared.closed,
        )
    }

    /// Returns a blocking consumer over `partition`.
    pub fn consume(&self, partition: PartitionKey) -> Result<PartitionConsumer<T>, QueueError> {
        self.lane(partition)?;
        Ok(PartitionConsumer {
            shared: Arc::clone(&self.shared),
            partition,
        })
    }

    /// Closes the queue and its budget and wakes every waiter.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.budget.close();
        for lane in &self.shared.lanes {
            lane.wake_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn partition_count(&self) -> usize {
        self.shared.lanes.len()
    }

    /// Items currently queued on `partition` (0 for an unknown partition).
    pub fn len(&self, partition: PartitionKey) -> usize {
        self.shared
            .lanes
            .get(partition.as_usize())
            .map_or(0, |lane| lane.items.len())
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.shared.budget
    }

    /// Bytes currently reserved against the queue's budget.
    pub fn outstanding_bytes(&self) -> u64 {
        self.shared.budget.outstanding_bytes()
    }

    /// The budget limit, `None` when unbounded.
    pub fn budget_bytes(&self) -> Option<u64> {
        self.shared.budget.limit_bytes()
    }

    fn lane(&self, partition: PartitionKey) -> Result<&Lane<T>, QueueError> {
        self.shared
            .lanes
            .get(partition.as_usize())
            .ok_or(QueueError::UnknownPartition {
                partition,
                partition_count: self.shared.lanes.len(),
            })
    }
}

impl<T: Clone> PartitionedQueue<T> {
    /// Enqueues a clone of `value` on every lane, without a reservation.
    ///
    /// A concurrent close may leave the value on only some lanes.
    pub fn broadcast(&self, value: &T) -> Result<(), QueueError> {
        for lane in &self.shared.lanes {
            lane.push(
                Delivery {
                    value: value.clone(),
                    reservation: None,
                },
                &self.shared.closed,
            )?;
        }
        Ok(())
    }
}

/// Blocking consumer over one lane.
///
/// Iteration ends once the queue is closed and the lane is drained.
#[derive(Debug)]
pub struct PartitionConsumer<T> {
    shared: Arc<Shared<T>>,
    partition: PartitionKey,
}

impl<T> PartitionConsumer<T> {
    pub fn partition_key(&self) -> PartitionKey {
        self.partition
    }

    /// Pops the next item without blocking.
    pub fn try_recv(&self) -> Option<Delivery<T>> {
        self.lane().items.pop()
    }

    /// Blocks until an item arrives or the queue is closed and drained.
    pub fn recv(&self) -> Option<Delivery<T>> {
        self.recv_until(None)
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery<T>> {
        self.recv_until(Some(Instant::now() + timeout))
    }

    fn recv_until(&self, deadline: Option<Instant>) -> Option<Delivery<T>> {
        let lane = self.lane();
        loop {
            if let Some(delivery) = lane.items.pop() {
                return Some(delivery);
            }

            let mut guard = lane.lock.lock();
            if let Some(delivery) = lane.items.pop() {
                return Some(delivery);
            }
            // Publishers check `closed` under this lock, so nothing can land
            // after this point.
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if lane.ready.wait_until(&mut guard, deadline).timed_out() {
                        drop(guard);
                        return lane.items.pop();
                    }
                }
                None => lane.ready.wait(&mut guard),
            }
        }
    }

    fn lane(&self) -> &Lane<T> {
        &self.shared.lanes[self.partition.as_usize()]
    }
}

impl<T> Iterator for PartitionConsumer<T> {
    type Item = Delivery<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

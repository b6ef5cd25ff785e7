//! Memory budget and RAII reservations.
//!
//! Producers acquire a [`Reservation`] sized to the estimated in-memory
//! footprint of an item before enqueueing it. The reservation travels with
//! the item and credits the budget when it is released or dropped, so the
//! sum of outstanding reservations never exceeds the budget on any path,
//! including errors and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::QueueError;

/// Shared byte budget. Cloning yields another handle to the same budget.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    /// `None` means unbounded.
    limit: Option<u64>,
    outstanding: AtomicU64,
    closed: AtomicBool,
    next_ticket: AtomicU64,
    lock: Mutex<()>,
    freed: Condvar,
    /// Tickets currently outstanding, used to catch double releases.
    #[cfg(debug_assertions)]
    live: Mutex<std::collections::HashSet<u64>>,
}

impl MemoryBudget {
    /// Creates a budget of `limit` bytes, or an unbounded one for `None`.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                outstanding: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                next_ticket: AtomicU64::new(0),
                lock: Mutex::new(()),
                freed: Condvar::new(),
                #[cfg(debug_assertions)]
                live: Mutex::new(std::collections::HashSet::new()),
            }),
        }
    }

    pub fn bounded(limit: u64) -> Self {
        Self::new(Some(limit))
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Reserves `bytes`, blocking until enough of the budget is free.
    ///
    /// # Errors
    ///
    /// - [`QueueError::ReservationExceedsBudget`] when `bytes` is larger than
    ///   the whole budget; this would otherwise block forever.
    /// - [`QueueError::Closed`] when the budget is closed before or while
    ///   waiting.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation, QueueError> {
        self.check_fits(bytes)?;

        loop {
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            if self.try_debit(bytes) {
                return Ok(self.issue(bytes));
            }

            let mut guard = self.inner.lock.lock();
            // Re-check under the lock: a credit between the failed debit and
            // the wait would otherwise be missed.
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            if self.try_debit(bytes) {
                drop(guard);
                return Ok(self.issue(bytes));
            }
            self.inner.freed.wait(&mut guard);
        }
    }

    /// Reserves `bytes` without blocking. Returns `Ok(None)` when the budget
    /// is currently exhausted.
    pub fn try_reserve(&self, bytes: u64) -> Result<Option<Reservation>, QueueError> {
        self.check_fits(bytes)?;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(self.try_debit(bytes).then(|| self.issue(bytes)))
    }

    /// Closes the budget. Blocked and future `reserve` calls fail with
    /// [`QueueError::Closed`]; releasing outstanding reservations still works.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.freed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Bytes currently held by outstanding reservations.
    pub fn outstanding_bytes(&self) -> u64 {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Configured limit, `None` when unbounded.
    pub fn limit_bytes(&self) -> Option<u64> {
        self.inner.limit
    }

    fn check_fits(&self, bytes: u64) -> Result<(), QueueError> {
        match self.inner.limit {
            Some(budget) if bytes > budget => Err(QueueError::ReservationExceedsBudget {
                requested: bytes,
                budget,
            }),
            _ => Ok(()),
        }
    }

    fn try_debit(&self, bytes: u64) -> bool {
        let Some(limit) = self.inner.limit else {
            self.inner.outstanding.fetch_add(bytes, Ordering::AcqRel);
            return true;
        };
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= limit)
            })
            .is_ok()
    }

    fn issue(&self, bytes: u64) -> Reservation {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.inner.live.lock().insert(ticket);
        Reservation {
            budget: Some(self.clone()),
            bytes,
            ticket,
        }
    }

    fn credit(&self, ticket: u64, bytes: u64) {
        #[cfg(debug_assertions)]
        assert!(
            self.inner.live.lock().remove(&ticket),
            "reservation ticket {ticket} released twice"
        );
        #[cfg(not(debug_assertions))]
        let _ = ticket;

        let result = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(bytes)
            });
        assert!(
            result.is_ok(),
            "memory budget underflow releasing {bytes} bytes"
        );

        let _guard = self.inner.lock.lock();
        self.inner.freed.notify_all();
    }
}

/// Capacity ticket debited from a [`MemoryBudget`].
///
/// Released exactly once: explicitly via [`Reservation::release`], or on
/// drop. Both consume the ticket, so a second release cannot be written.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    budget: Option<MemoryBudget>,
    bytes: u64,
    ticket: u64,
}

impl Reservation {
    /// A zero-byte reservation not tied to any budget.
    pub fn empty() -> Self {
        Self {
            budget: None,
            bytes: 0,
            ticket: 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Credits the reserved bytes back to the budget.
    pub fn release(self) {
        drop(self);
    }

    /// Moves `bytes` of this reservation into a new, independent reservation.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds what this reservation holds.
    pub fn split(&mut self, bytes: u64) -> Reservation {
        assert!(
            bytes <= self.bytes,
            "cannot split {bytes} bytes from a reservation of {}",
            self.bytes
        );
        self.bytes -= bytes;
        match &self.budget {
            Some(budget) => {
                let ticket = budget.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                #[cfg(debug_assertions)]
                budget.inner.live.lock().insert(ticket);
                Reservation {
                    budget: Some(budget.clone()),
                    bytes,
                    ticket,
                }
            }
            None => Reservation {
                budget: None,
                bytes,
                ticket: 0,
            },
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(budget) = self.budget.take() {
            budget.credit(self.ticket, self.bytes);
        }
    }
}

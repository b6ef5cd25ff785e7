//! Time sources and cancellable waits.
//!
//! Production code uses [`SystemClock`]. Tests drive the timed flush task
//! deterministically with [`ManualClock`], whose delays advance its own time
//! instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

/// Outcome of a cancellable delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// The full duration elapsed.
    Elapsed,
    /// Shutdown was signalled before the duration elapsed.
    Cancelled,
}

/// Time source with a cancellable delay.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Waits for `duration` or until `shutdown` is triggered, whichever
    /// comes first.
    fn delay(&self, duration: Duration, shutdown: &ShutdownSignal) -> Delay;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
            })
    }

    fn delay(&self, duration: Duration, shutdown: &ShutdownSignal) -> Delay {
        if shutdown.wait_timeout(duration) {
            Delay::Cancelled
        } else {
            Delay::Elapsed
        }
    }
}

/// Clock whose time only moves when told to.
///
/// `delay` advances the clock by the requested duration and returns
/// immediately, unless shutdown has been triggered.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(millis, Ordering::AcqRel);
    }

    /// Sets the clock to `now_ms`.
    ///
    /// # Panics
    ///
    /// Panics if time would move backwards.
    pub fn set(&self, now_ms: u64) {
        let previous = self.now_ms.swap(now_ms, Ordering::AcqRel);
        assert!(
            now_ms >= previous,
            "clock moved backwards from {previous} to {now_ms}"
        );
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }

    fn delay(&self, duration: Duration, shutdown: &ShutdownSignal) -> Delay {
        if shutdown.is_triggered() {
            return Delay::Cancelled;
        }
        self.advance(duration);
        Delay::Elapsed
    }
}

/// One-shot, clonable shutdown flag that sleeping tasks can wait on.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers shutdown and wakes every waiter.
    pub fn trigger(&self) {
        let (triggered, cond) = &*self.inner;
        *triggered.lock() = true;
        cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Blocks for at most `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (triggered, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = triggered.lock();
        while !*guard {
            if cond.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

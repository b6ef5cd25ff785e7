//! Long-lived background tasks of a sync.

mod checkpoint_update;
mod timed_flush;

pub use checkpoint_update::CheckpointUpdateTask;
pub use timed_flush::{ForceFlushEvent, TickOutcome, TimedFlushTask};

//! Pipeline error types.

use tributary_config::ConfigError;
use tributary_types::{CheckpointIndex, PartitionKey, StreamDescriptor};
use thiserror::Error;

use crate::checkpoint::CheckpointMode;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors from the reservation queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed; blocked producers are released with this error.
    #[error("queue closed")]
    Closed,

    /// A single item needs more memory than the whole budget. Waiting would
    /// never succeed, so this is reported as a configuration error.
    #[error("reservation of {requested} bytes exceeds the whole queue budget of {budget} bytes")]
    ReservationExceedsBudget { requested: u64, budget: u64 },

    /// Publish or consume against a lane that does not exist.
    #[error("unknown partition {partition} (queue has {partition_count} partitions)")]
    UnknownPartition {
        partition: PartitionKey,
        partition_count: usize,
    },
}

impl QueueError {
    /// Returns true for errors that retrying cannot fix.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ReservationExceedsBudget { .. } | Self::UnknownPartition { .. }
        )
    }
}

/// Errors from an output sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The message could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The downstream consumer rejected or could not accept the message.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Errors from checkpoint bookkeeping and emission.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Indexes for a stream must be added in strictly increasing order.
    #[error(
        "checkpoint index {index} for stream {stream} is not after the last added index {last}"
    )]
    OutOfOrder {
        stream: StreamDescriptor,
        index: CheckpointIndex,
        last: CheckpointIndex,
    },

    /// A sync is either per-stream or global, never both.
    #[error("cannot add a {adding} checkpoint to a sync tracking {existing} checkpoints")]
    MixedCheckpointKinds {
        existing: CheckpointMode,
        adding: CheckpointMode,
    },

    /// A commit was reported for a partition outside the configured set.
    #[error("partition {partition} is outside the {partition_count} configured partitions")]
    UnknownPartition {
        partition: PartitionKey,
        partition_count: usize,
    },

    /// The enriched message could not be handed to the sink. The checkpoint
    /// stays pending.
    #[error("failed to emit checkpoint: {0}")]
    Emit(#[from] SinkError),
}

impl CheckpointError {
    /// Returns true if a later flush attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Emit(_))
    }
}

/// Errors from stream lifecycle bookkeeping.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The extractor sent a record after the stream's end.
    #[error("record for stream {stream} after its end of stream")]
    RecordAfterEndOfStream { stream: StreamDescriptor },

    #[error("end of stream already marked for stream {stream}")]
    EndOfStreamAlreadyMarked { stream: StreamDescriptor },

    /// A stream can only succeed once its end has been marked.
    #[error("stream {stream} cannot succeed before its end of stream")]
    EndOfStreamNotMarked { stream: StreamDescriptor },
}

/// Errors raised by a destination writer.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The destination rejected a write or a flush.
    #[error("destination error: {0}")]
    Destination(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while running a sync.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Stream lifecycle error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// A writer worker failed.
    #[error("writer for partition {partition} failed: {source}")]
    Writer {
        partition: PartitionKey,
        source: WriterError,
    },

    /// Thread spawn failed.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// A background task panicked.
    #[error("task {0} panicked")]
    TaskPanicked(String),
}

impl PipelineError {
    /// Creates a `Writer` error for the given partition.
    pub fn writer(partition: PartitionKey, source: WriterError) -> Self {
        Self::Writer { partition, source }
    }
}

//! # tributary: write-side core of a data connector
//!
//! Moves records from an extractor to a destination while tracking
//! checkpoints, so the orchestrating platform only sees a checkpoint once
//! every record before it is durable at the destination.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            tributary                             │
//! │  ┌─────────┐   ┌──────────────────┐   ┌──────────────────────┐   │
//! │  │ Ingress │ → │ PartitionedQueue │ → │ tributary-writer-{n} │   │
//! │  └─────────┘   │  (MemoryBudget)  │   └──────────┬───────────┘   │
//! │       │        └──────────────────┘              │ commits       │
//! │       │        ┌──────────────────┐   ┌──────────▼───────────┐   │
//! │       └──────→ │ checkpoint lane  │ → │  CheckpointManager   │ → sink
//! │                └──────────────────┘   └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Like the rest of the workspace, the runtime uses plain threads and
//! condition variables instead of an async executor.
//!
//! ## Usage
//!
//! ```ignore
//! use tributary::{PipelineBuilder, StreamDescriptor};
//! use tributary_config::TributaryConfig;
//!
//! let (pipeline, mut ingress) = PipelineBuilder::new(TributaryConfig::default())
//!     .start(&|partition| Ok(Box::new(MyWriter::open(partition)?) as Box<_>))?;
//! ingress.submit_record(&StreamDescriptor::unqualified("users"), b"{}".to_vec())?;
//! ingress.submit_checkpoint(message)?;
//! ingress.mark_end_of_stream(&StreamDescriptor::unqualified("users"))?;
//! let summary = pipeline.finish(ingress)?;
//! ```

pub mod checkpoint;
pub mod clock;
pub mod enrich;
mod error;
pub mod histogram;
pub mod logging;
pub mod namespace;
pub mod pipeline;
pub mod queue;
pub mod reservation;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod tasks;
pub mod writer;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMessage, CheckpointMode};
pub use clock::{Clock, ManualClock, ShutdownSignal, SystemClock};
pub use enrich::StateStatsEnricher;
pub use error::{
    CheckpointError, PipelineError, PipelineResult, QueueError, SinkError, StreamError,
    WriterError,
};
pub use histogram::Histogram;
pub use namespace::{NamespaceDefinition, NamespaceMapper};
pub use pipeline::{Ingress, Pipeline, PipelineBuilder, SyncSummary};
pub use queue::{Delivery, PartitionConsumer, PartitionedQueue};
pub use reservation::{MemoryBudget, Reservation};
pub use sink::{CheckpointSink, CollectingSink, JsonLinesSink};
pub use stats::{CommittedStatsStore, EmittedStatsStore};
pub use stream::{StreamRegistry, StreamResult};
pub use tributary_types::{CheckpointIndex, EmissionStats, PartitionKey, StreamDescriptor};
pub use writer::{DestinationWriter, Record, WriterFactory, WriterMessage};

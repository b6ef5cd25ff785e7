//! Checkpoint tracking and emission.
//!
//! A checkpoint closes a window of records for one stream ([`Checkpoint::Stream`])
//! or for every stream of the sync at once ([`Checkpoint::Global`]). The
//! [`CheckpointManager`] holds checkpoints until every partition has
//! committed the windows they close, then enriches and emits them in order.

mod commits;
mod manager;
mod message;

use std::fmt::{self, Display};

use tributary_types::{CheckpointIndex, StreamDescriptor};

pub use manager::CheckpointManager;
pub use message::{CheckpointMessage, CheckpointStats, GlobalState, StreamState};

/// Whether a sync checkpoints per stream or globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointMode {
    Stream,
    Global,
}

impl Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// A checkpoint marker with its assigned indexes.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
    Stream {
        stream: StreamDescriptor,
        index: CheckpointIndex,
        message: CheckpointMessage,
    },
    /// `message` is a `Global` or `GlobalSnapshot` message.
    Global {
        indexes: Vec<(StreamDescriptor, CheckpointIndex)>,
        message: CheckpointMessage,
    },
}

impl Checkpoint {
    pub fn mode(&self) -> CheckpointMode {
        match self {
            Self::Stream { .. } => CheckpointMode::Stream,
            Self::Global { .. } => CheckpointMode::Global,
        }
    }

    pub fn message(&self) -> &CheckpointMessage {
        match self {
            Self::Stream { message, .. } | Self::Global { message, .. } => message,
        }
    }

    /// Every `(stream, index)` pair that must be committed before this
    /// checkpoint may be emitted.
    pub fn indexes(&self) -> Vec<(StreamDescriptor, CheckpointIndex)> {
        match self {
            Self::Stream { stream, index, .. } => vec![(stream.clone(), *index)],
            Self::Global { indexes, .. } => indexes.clone(),
        }
    }
}

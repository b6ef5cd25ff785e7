//! Output collaborators receiving enriched checkpoint messages.

use std::io::Write;

use parking_lot::Mutex;

use crate::checkpoint::CheckpointMessage;
use crate::error::SinkError;

/// Hands an enriched checkpoint to the orchestrating platform.
///
/// Called with the manager's flush lock held, so implementations see
/// messages in flush order and are never called concurrently by one
/// manager.
pub trait CheckpointSink: Send + Sync {
    fn emit(&self, message: &CheckpointMessage) -> Result<(), SinkError>;
}

/// Keeps every emitted message in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<CheckpointMessage>>,
    failures_remaining: Mutex<usize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` emissions fail with [`SinkError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    pub fn messages(&self) -> Vec<CheckpointMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl CheckpointSink for CollectingSink {
    fn emit(&self, message: &CheckpointMessage) -> Result<(), SinkError> {
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Unavailable("injected failure".to_string()));
            }
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Writes one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> CheckpointSink for JsonLinesSink<W> {
    fn emit(&self, message: &CheckpointMessage) -> Result<(), SinkError> {
        let line = serde_json::to_vec(message)?;
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

//! Per-stream lifecycle: open, end of stream, and the final result.
//!
//! A stream is open until the extractor marks its end. Its result is
//! resolved exactly once, either explicitly or when the pipeline finishes,
//! and threads can block on it with [`StreamRegistry::await_stream_result`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use tributary_types::{CheckpointIndex, StreamDescriptor};

use crate::error::StreamError;

/// How processing of one stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResult {
    /// End of stream was received and every record before it is durable.
    Succeeded,
    /// The sync ended cleanly but the stream never reached a committed end.
    Incomplete,
    Failed { reason: String },
}

impl StreamResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for StreamResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Incomplete => f.write_str("incomplete"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct StreamStatus {
    /// Window closed by the end-of-stream marker.
    end: Option<CheckpointIndex>,
    result: Option<StreamResult>,
}

/// Tracks every stream seen by the ingress.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamDescriptor, StreamStatus>>,
    resolved: Condvar,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` if new. Fails once its end has been marked.
    pub fn ensure_open(&self, stream: &StreamDescriptor) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream.clone()).or_default();
        if status.end.is_some() {
            return Err(StreamError::RecordAfterEndOfStream {
                stream: stream.clone(),
            });
        }
        Ok(())
    }

    /// Records that no records of `stream` follow window `index`.
    pub fn mark_end_of_stream(
        &self,
        stream: &StreamDescriptor,
        index: CheckpointIndex,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream.clone()).or_default();
        if status.end.is_some() {
            return Err(StreamError::EndOfStreamAlreadyMarked {
                stream: stream.clone(),
            });
        }
        status.end = Some(index);
        debug!(stream = %stream, index = index.as_u64(), "end of stream");
        Ok(())
    }

    /// The window closed by the end-of-stream marker, if any.
    pub fn end_index(&self, stream: &StreamDescriptor) -> Option<CheckpointIndex> {
        self.streams.lock().get(stream).and_then(|status| status.end)
    }

    /// Resolves `stream` as succeeded. Requires its end to be marked.
    ///
    /// A stream that already has a result keeps it.
    pub fn mark_processing_succeeded(&self, stream: &StreamDescriptor) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream.clone()).or_default();
        if status.end.is_none() {
            return Err(StreamError::EndOfStreamNotMarked {
                stream: stream.clone(),
            });
        }
        if status.result.is_none() {
            status.result = Some(StreamResult::Succeeded);
            self.resolved.notify_all();
        }
        Ok(())
    }

    /// Resolves `stream` as failed unless it already has a result.
    pub fn mark_processing_failed(&self, stream: &StreamDescriptor, reason: impl Into<String>) {
        let reason = reason.into();
        let mut streams = self.streams.lock();
        let status = streams.entry(stream.clone()).or_default();
        if status.result.is_none() {
            warn!(stream = %stream, reason = %reason, "stream failed");
            status.result = Some(StreamResult::Failed { reason });
            self.resolved.notify_all();
        }
    }

    /// Resolves `stream` as incomplete unless it already has a result.
    pub fn mark_incomplete(&self, stream: &StreamDescriptor) {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream.clone()).or_default();
        if status.result.is_none() {
            status.result = Some(StreamResult::Incomplete);
            self.resolved.notify_all();
        }
    }

    pub fn result(&self, stream: &StreamDescriptor) -> Option<StreamResult> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|status| status.result.clone())
    }

    /// Blocks until `stream` has a result. `None` on timeout.
    pub fn await_stream_result(
        &self,
        stream: &StreamDescriptor,
        timeout: Duration,
    ) -> Option<StreamResult> {
        let deadline = Instant::now() + timeout;
        let mut streams = self.streams.lock();
        loop {
            if let Some(result) = streams.get(stream).and_then(|status| status.result.clone()) {
                return Some(result);
            }
            if self.resolved.wait_until(&mut streams, deadline).timed_out() {
                return streams.get(stream).and_then(|status| status.result.clone());
            }
        }
    }

    /// Streams without a result yet, with their end-of-stream window.
    pub fn unresolved(&self) -> Vec<(StreamDescriptor, Option<CheckpointIndex>)> {
        self.streams
            .lock()
            .iter()
            .filter(|(_, status)| status.result.is_none())
            .map(|(stream, status)| (stream.clone(), status.end))
            .collect()
    }

    /// Every resolved stream and its result.
    pub fn results(&self) -> BTreeMap<StreamDescriptor, StreamResult> {
        self.streams
            .lock()
            .iter()
            .filter_map(|(stream, status)| Some((stream.clone(), status.result.clone()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn s(name: &str) -> StreamDescriptor {
        StreamDescriptor::unqualified(name)
    }

    #[test]
    fn success_requires_end_of_stream() {
        let registry = StreamRegistry::new();
        registry.ensure_open(&s("a")).unwrap();
        assert!(matches!(
            registry.mark_processing_succeeded(&s("a")),
            Err(StreamError::EndOfStreamNotMarked { .. })
        ));

        registry.mark_end_of_stream(&s("a"), CheckpointIndex::new(3)).unwrap();
        registry.mark_processing_succeeded(&s("a")).unwrap();
        assert_eq!(registry.result(&s("a")), Some(StreamResult::Succeeded));
        assert_eq!(registry.end_index(&s("a")), Some(CheckpointIndex::new(3)));
    }

    #[test]
    fn ended_stream_rejects_records_and_second_end() {
        let registry = StreamRegistry::new();
        registry.mark_end_of_stream(&s("a"), CheckpointIndex::FIRST).unwrap();

        assert!(matches!(
            registry.ensure_open(&s("a")),
            Err(StreamError::RecordAfterEndOfStream { .. })
        ));
        assert!(matches!(
            registry.mark_end_of_stream(&s("a"), CheckpointIndex::new(2)),
            Err(StreamError::EndOfStreamAlreadyMarked { .. })
        ));
        registry.ensure_open(&s("b")).unwrap();
    }

    #[test]
    fn first_result_wins() {
        let registry = StreamRegistry::new();
        registry.mark_processing_failed(&s("a"), "destination gone");
        registry.mark_end_of_stream(&s("a"), CheckpointIndex::FIRST).unwrap();
        registry.mark_processing_succeeded(&s("a")).unwrap();
        registry.mark_incomplete(&s("a"));

        assert_eq!(
            registry.result(&s("a")),
            Some(StreamResult::Failed {
                reason: "destination gone".to_string()
            })
        );
    }

    #[test]
    fn await_wakes_on_resolution() {
        let registry = Arc::new(StreamRegistry::new());
        registry.ensure_open(&s("a")).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.await_stream_result(&s("a"), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        registry.mark_processing_failed(&s("a"), "boom");

        let result = waiter.join().unwrap();
        assert!(matches!(result, Some(StreamResult::Failed { .. })));
    }

    #[test]
    fn await_times_out_without_result() {
        let registry = StreamRegistry::new();
        registry.ensure_open(&s("a")).unwrap();
        assert_eq!(
            registry.await_stream_result(&s("a"), Duration::from_millis(10)),
            None
        );
    }

    #[test]
    fn unresolved_lists_open_and_ended_streams() {
        let registry = StreamRegistry::new();
        registry.ensure_open(&s("a")).unwrap();
        registry.mark_end_of_stream(&s("b"), CheckpointIndex::new(2)).unwrap();
        registry.ensure_open(&s("c")).unwrap();
        registry.mark_incomplete(&s("c"));

        let mut unresolved = registry.unresolved();
        unresolved.sort();
        assert_eq!(
            unresolved,
            vec![(s("a"), None), (s("b"), Some(CheckpointIndex::new(2)))]
        );
        assert_eq!(registry.results().len(), 1);
    }
}

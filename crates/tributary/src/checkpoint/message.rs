//! The state message echoed back to the orchestrator.
//!
//! The extractor's payload (`data`, `shared_state`) is opaque and carried
//! through unchanged. Only the stats fields are written here, by the
//! enricher, just before emission.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_types::{EmissionStats, StreamDescriptor};

use super::CheckpointMode;

/// Record count reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStats {
    pub record_count: u64,
}

/// State of a single stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    /// Stream identity as declared by the extractor, before namespace
    /// mapping.
    pub stream: StreamDescriptor,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<CheckpointStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_stats: Option<CheckpointStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl StreamState {
    pub fn new(stream: StreamDescriptor, data: Value) -> Self {
        Self {
            stream,
            data,
            source_stats: None,
            destination_stats: None,
            total_records: None,
            total_bytes: None,
        }
    }

    /// Writes destination stats onto the state.
    pub fn apply_stats(&mut self, stats: EmissionStats) {
        self.destination_stats = Some(CheckpointStats {
            record_count: stats.count,
        });
        self.total_records = Some(stats.count);
        self.total_bytes = Some(stats.bytes);
    }
}

/// State spanning every stream of a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    #[serde(default)]
    pub shared_state: Value,
    #[serde(default)]
    pub stream_states: Vec<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<CheckpointStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_stats: Option<CheckpointStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl GlobalState {
    pub fn new(shared_state: Value, stream_states: Vec<StreamState>) -> Self {
        Self {
            shared_state,
            stream_states,
            source_stats: None,
            destination_stats: None,
            total_records: None,
            total_bytes: None,
        }
    }

    pub fn apply_stats(&mut self, stats: EmissionStats) {
        self.destination_stats = Some(CheckpointStats {
            record_count: stats.count,
        });
        self.total_records = Some(stats.count);
        self.total_bytes = Some(stats.bytes);
    }
}

/// A checkpoint as produced by the extractor and emitted downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointMessage {
    Stream(StreamState),
    Global(GlobalState),
    GlobalSnapshot(GlobalState),
}

impl CheckpointMessage {
    pub fn stream(stream: StreamDescriptor, data: Value) -> Self {
        Self::Stream(StreamState::new(stream, data))
    }

    pub fn global(shared_state: Value, stream_states: Vec<StreamState>) -> Self {
        Self::Global(GlobalState::new(shared_state, stream_states))
    }

    pub fn mode(&self) -> CheckpointMode {
        match self {
            Self::Stream(_) => CheckpointMode::Stream,
            Self::Global(_) | Self::GlobalSnapshot(_) => CheckpointMode::Global,
        }
    }

    /// Streams named by the message, as declared.
    pub fn declared_streams(&self) -> Vec<&StreamDescriptor> {
        match self {
            Self::Stream(state) => vec![&state.stream],
            Self::Global(global) | Self::GlobalSnapshot(global) => {
                global.stream_states.iter().map(|state| &state.stream).collect()
            }
        }
    }

    /// Serialized size, used to size the message's reservation.
    pub fn estimated_size_bytes(&self) -> u64 {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len() as u64)
    }

    /// Top-level destination stats, if the message has been enriched.
    pub fn destination_stats(&self) -> Option<CheckpointStats> {
        match self {
            Self::Stream(state) => state.destination_stats,
            Self::Global(global) | Self::GlobalSnapshot(global) => global.destination_stats,
        }
    }

    /// Top-level `(total_records, total_bytes)`, if the message has been
    /// enriched.
    pub fn totals(&self) -> Option<EmissionStats> {
        let (records, bytes) = match self {
            Self::Stream(state) => (state.total_records, state.total_bytes),
            Self::Global(global) | Self::GlobalSnapshot(global) => {
                (global.total_records, global.total_bytes)
            }
        };
        Some(EmissionStats::new(records?, bytes?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_message_wire_shape() {
        let mut message = CheckpointMessage::stream(
            StreamDescriptor::namespaced("public", "users"),
            json!({"cursor": 42}),
        );
        let CheckpointMessage::Stream(state) = &mut message else {
            unreachable!()
        };
        state.apply_stats(EmissionStats::new(3, 300));

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "STREAM");
        assert_eq!(value["stream"]["name"], "users");
        assert_eq!(value["data"]["cursor"], 42);
        assert_eq!(value["destinationStats"]["recordCount"], 3);
        assert_eq!(value["totalRecords"], 3);
        assert_eq!(value["totalBytes"], 300);
    }

    #[test]
    fn unenriched_message_omits_stats() {
        let message = CheckpointMessage::global(json!({"lsn": 7}), vec![]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "GLOBAL");
        assert!(value.get("destinationStats").is_none());
        assert!(message.totals().is_none());
    }

    #[test]
    fn parses_extractor_json() {
        let message: CheckpointMessage = serde_json::from_str(
            r#"{
                "type": "GLOBAL_SNAPSHOT",
                "sharedState": {"snapshot": true},
                "streamStates": [
                    {"stream": {"namespace": null, "name": "a"}, "data": 1},
                    {"stream": {"namespace": "s", "name": "b"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(message.mode(), CheckpointMode::Global);
        assert_eq!(
            message.declared_streams(),
            vec![
                &StreamDescriptor::unqualified("a"),
                &StreamDescriptor::namespaced("s", "b")
            ]
        );
        assert!(message.estimated_size_bytes() > 0);
    }
}

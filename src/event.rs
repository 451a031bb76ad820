//! Log event model shared by the collectors and the broadcast server.
//!
//! Every line read from a source becomes a [`LogEvent`]. Conditions the
//! collectors detect themselves (a missing file, a stopped container, a
//! dropped stream) are delivered in-band as ordinary events whose message
//! starts with [`NOTICE_PREFIX`], so viewers see them in the same stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix marking events synthesized by shepai rather than read from the source.
pub const NOTICE_PREFIX: &str = "[shepai]";

/// Kind of source an event was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Container,
}

/// Output stream of the line. File sources have no stream and serialize as `""`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamKind {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl StreamKind {
    /// Map a multiplexed frame's stream selector byte. Only `2` means stderr.
    pub fn from_selector(selector: u8) -> Self {
        if selector == 2 {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        }
    }
}

/// A single normalized log line.
///
/// Serializes as `{"timestamp", "source", "stream", "message"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Parsed from the line when possible, otherwise the ingestion instant
    pub timestamp: DateTime<Utc>,

    /// Which collector produced the event
    pub source: SourceKind,

    /// stdout/stderr for containers, unspecified for files
    pub stream: StreamKind,

    /// One logical line with framing and line terminator removed
    pub message: String,
}

impl LogEvent {
    /// Create an event from a line read out of a file.
    ///
    /// `timestamp` falls back to the current instant when `None`.
    pub fn from_file_line(message: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            source: SourceKind::File,
            stream: StreamKind::Unspecified,
            message: message.into(),
        }
    }

    /// Create an event from a demultiplexed container frame.
    pub fn from_container_line(
        stream: StreamKind,
        message: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            source: SourceKind::Container,
            stream,
            message: message.into(),
        }
    }

    /// Create a synthetic status event stamped with the current instant.
    pub fn notice(source: SourceKind, stream: StreamKind, text: impl AsRef<str>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            stream,
            message: format!("{} {}", NOTICE_PREFIX, text.as_ref()),
        }
    }

    /// Whether this event was synthesized by a collector.
    pub fn is_notice(&self) -> bool {
        self.message.starts_with(NOTICE_PREFIX)
    }
}

/// Messages written to push-channel readers.
///
/// The snapshot is sent exactly once when a reader registers; every live
/// event afterwards is wrapped in [`PushMessage::Event`].
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage<'a> {
    Snapshot { events: &'a [LogEvent] },
    Event { event: &'a LogEvent },
}

/// Body of the pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub events: Vec<LogEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_event() -> LogEvent {
        LogEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            source: SourceKind::Container,
            stream: StreamKind::Stderr,
            message: "hello".to_string(),
        }
    }

    #[test]
    fn test_log_event_serialization_shape() {
        let json = serde_json::to_value(fixed_event()).unwrap();
        assert_eq!(json["timestamp"], "2024-01-01T00:00:00Z");
        assert_eq!(json["source"], "container");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn test_file_event_has_empty_stream() {
        let event = LogEvent::from_file_line("line", None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["source"], "file");
        assert_eq!(json["stream"], "");
    }

    #[test]
    fn test_stream_selector_mapping() {
        assert_eq!(StreamKind::from_selector(2), StreamKind::Stderr);
        assert_eq!(StreamKind::from_selector(1), StreamKind::Stdout);
        assert_eq!(StreamKind::from_selector(0), StreamKind::Stdout);
        assert_eq!(StreamKind::from_selector(7), StreamKind::Stdout);
    }

    #[test]
    fn test_notice_is_prefixed() {
        let event = LogEvent::notice(SourceKind::File, StreamKind::Stderr, "File 'a.log' not found");
        assert!(event.is_notice());
        assert_eq!(event.message, "[shepai] File 'a.log' not found");
        assert!(!LogEvent::from_file_line("plain", None).is_notice());
    }

    #[test]
    fn test_push_message_shapes() {
        let event = fixed_event();
        let snapshot = serde_json::to_value(PushMessage::Snapshot {
            events: std::slice::from_ref(&event),
        })
        .unwrap();
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["events"][0]["message"], "hello");

        let live = serde_json::to_value(PushMessage::Event { event: &event }).unwrap();
        assert_eq!(live["type"], "event");
        assert_eq!(live["event"]["stream"], "stderr");
    }

    #[test]
    fn test_snapshot_response_round_trip() {
        let body = SnapshotResponse {
            events: vec![fixed_event()],
        };
        let text = serde_json::to_string(&body).unwrap();
        let parsed: SnapshotResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.events, body.events);
    }
}

//! Push-channel wire protocol.
//!
//! Inbound frames are envelopes `{type, timestamp, data}` whose `data` shape
//! depends on `type`. The runner this client was first written against names
//! its messages `test_*` and its fields after proxies (`proxy_name`,
//! `total_proxies`, ...); both spellings decode, the canonical one encodes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of an inbound push message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SessionStart,
    SessionProgress,
    SessionResult,
    SessionComplete,
    SessionCancelled,
    Error,
}

impl MessageKind {
    /// Resolve a wire `type` string.
    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "session-start" | "test_start" => Some(Self::SessionStart),
            "session-progress" | "test_progress" => Some(Self::SessionProgress),
            "session-result" | "test_result" => Some(Self::SessionResult),
            "session-complete" | "test_complete" => Some(Self::SessionComplete),
            "session-cancelled" | "test_cancelled" => Some(Self::SessionCancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session-start",
            Self::SessionProgress => "session-progress",
            Self::SessionResult => "session-result",
            Self::SessionComplete => "session-complete",
            Self::SessionCancelled => "session-cancelled",
            Self::Error => "error",
        }
    }
}

/// Raw inbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Echo of the configuration the runner accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInfo {
    #[serde(alias = "total_proxies")]
    pub total_targets: u32,
    #[serde(default)]
    pub config: Value,
}

/// Progress of the running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, alias = "current_proxy")]
    pub current_target: String,
    pub completed_count: u32,
    pub total_count: u32,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

/// Outcome status of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    Failed,
    Pending,
    Timeout,
    #[serde(other)]
    Unknown,
}

/// One streaming-platform unlock check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockResult {
    pub platform: String,
    pub status: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub latency_ms: f64,
}

/// Per-target outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    #[serde(alias = "proxy_name")]
    pub target_name: String,
    #[serde(default, alias = "proxy_type")]
    pub target_type: String,
    #[serde(default, alias = "proxy_ip", skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default, alias = "packet_loss")]
    pub packet_loss_pct: f64,
    #[serde(default, alias = "download_speed_mbps")]
    pub download_mbps: f64,
    #[serde(default, alias = "upload_speed_mbps")]
    pub upload_mbps: f64,
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_results: Option<Vec<UnlockResult>>,
}

impl TargetResult {
    /// Whether this target carried unlock checks.
    #[must_use]
    pub fn has_unlock_results(&self) -> bool {
        self.unlock_results.as_ref().is_some_and(|r| !r.is_empty())
    }
}

/// Terminal summary of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub total_tested: u32,
    #[serde(alias = "successful_tests")]
    pub successful: u32,
    #[serde(alias = "failed_tests")]
    pub failed: u32,
    #[serde(default, alias = "total_duration")]
    pub duration: String,
    #[serde(default, alias = "average_latency")]
    pub avg_latency: f64,
    #[serde(default, alias = "average_download_mbps")]
    pub avg_download_mbps: f64,
    #[serde(default, alias = "average_upload_mbps")]
    pub avg_upload_mbps: f64,
    #[serde(default, alias = "best_proxy")]
    pub best_target: String,
    #[serde(default, alias = "best_download_speed_mbps")]
    pub best_download_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_stats: Option<Value>,
}

/// Terminal summary of a cancelled session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    #[serde(default)]
    pub message: String,
    pub completed_tests: u32,
    pub total_tests: u32,
    #[serde(default)]
    pub partial_duration: String,
}

/// Error reported by the runner or the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// Decode error for inbound frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Typed inbound push message.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start(StartInfo),
    Progress(Progress),
    Result(TargetResult),
    Complete(Completion),
    Cancelled(Cancellation),
    Error(ErrorInfo),
}

impl SessionEvent {
    /// Decode a raw text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not an envelope, names an unknown type,
    /// or carries a payload that does not match its type.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
        Self::from_envelope(envelope)
    }

    /// Convert an already parsed envelope.
    ///
    /// # Errors
    /// See [`SessionEvent::decode`].
    pub fn from_envelope(envelope: Envelope) -> Result<Self, DecodeError> {
        let kind =
            MessageKind::from_wire(&envelope.kind).ok_or(DecodeError::UnknownType(envelope.kind))?;
        let data = envelope.data;
        let payload = |source| DecodeError::Payload {
            kind: kind.as_str(),
            source,
        };

        let event = match kind {
            MessageKind::SessionStart => Self::Start(serde_json::from_value(data).map_err(payload)?),
            MessageKind::SessionProgress => {
                Self::Progress(serde_json::from_value(data).map_err(payload)?)
            }
            MessageKind::SessionResult => Self::Result(serde_json::from_value(data).map_err(payload)?),
            MessageKind::SessionComplete => {
                Self::Complete(serde_json::from_value(data).map_err(payload)?)
            }
            MessageKind::SessionCancelled => {
                Self::Cancelled(serde_json::from_value(data).map_err(payload)?)
            }
            MessageKind::Error => Self::Error(serde_json::from_value(data).map_err(payload)?),
        };
        Ok(event)
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Start(_) => MessageKind::SessionStart,
            Self::Progress(_) => MessageKind::SessionProgress,
            Self::Result(_) => MessageKind::SessionResult,
            Self::Complete(_) => MessageKind::SessionComplete,
            Self::Cancelled(_) => MessageKind::SessionCancelled,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Whether this event ends a session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Cancelled(_))
    }

    /// Encode as a canonical envelope stamped with `timestamp`.
    #[must_use]
    pub fn encode_at(&self, timestamp: DateTime<Utc>) -> String {
        let data = match self {
            Self::Start(d) => serde_json::to_value(d),
            Self::Progress(d) => serde_json::to_value(d),
            Self::Result(d) => serde_json::to_value(d),
            Self::Complete(d) => serde_json::to_value(d),
            Self::Cancelled(d) => serde_json::to_value(d),
            Self::Error(d) => serde_json::to_value(d),
        }
        .unwrap_or(Value::Null);

        let envelope = Envelope {
            kind: self.kind().as_str().to_string(),
            timestamp: Some(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            data,
        };
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    /// Encode as a canonical envelope stamped now.
    #[must_use]
    pub fn encode(&self) -> String {
        self.encode_at(Utc::now())
    }
}

/// Message from client to runner over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask the runner to cancel a task.
    StopTest {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn stop_test(task_id: impl Into<String>) -> Self {
        Self::StopTest {
            task_id: task_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_canonical_result() {
        let raw = json!({
            "type": "session-result",
            "timestamp": "2025-01-01T00:00:00Z",
            "data": {
                "target_name": "hk-01",
                "target_type": "vmess",
                "latency_ms": 42,
                "jitter_ms": 3.5,
                "packet_loss_pct": 0.0,
                "download_mbps": 88.1,
                "upload_mbps": 12.0,
                "status": "success"
            }
        })
        .to_string();

        let SessionEvent::Result(result) = SessionEvent::decode(&raw).unwrap() else {
            panic!("expected a result event");
        };
        assert_eq!(result.target_name, "hk-01");
        assert!((result.latency_ms - 42.0).abs() < f64::EPSILON);
        assert_eq!(result.status, TargetStatus::Success);
        assert!(!result.has_unlock_results());
    }

    #[test]
    fn test_decode_legacy_names() {
        let raw = json!({
            "type": "test_complete",
            "timestamp": "2025-01-01T00:00:00Z",
            "data": {
                "total_tested": 3,
                "successful_tests": 2,
                "failed_tests": 1,
                "total_duration": "12s",
                "average_latency": 80.5,
                "average_download_mbps": 40.0,
                "average_upload_mbps": 9.0,
                "best_proxy": "jp-02",
                "best_download_speed_mbps": 71.2
            }
        })
        .to_string();

        let event = SessionEvent::decode(&raw).unwrap();
        assert_eq!(event.kind(), MessageKind::SessionComplete);
        let SessionEvent::Complete(done) = event else {
            unreachable!()
        };
        assert_eq!(done.successful, 2);
        assert_eq!(done.best_target, "jp-02");
        assert_eq!(done.duration, "12s");
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let raw = r#"{"type":"test_result","timestamp":"x","data":{"proxy_name":"a","status":"weird"}}"#;
        let SessionEvent::Result(result) = SessionEvent::decode(raw).unwrap() else {
            panic!("expected a result event");
        };
        assert_eq!(result.status, TargetStatus::Unknown);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            SessionEvent::decode("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            SessionEvent::decode(r#"{"type":"heartbeat","timestamp":"x","data":{}}"#),
            Err(DecodeError::UnknownType(kind)) if kind == "heartbeat"
        ));
        assert!(matches!(
            SessionEvent::decode(r#"{"type":"session-progress","timestamp":"x","data":{"completed_count":"many"}}"#),
            Err(DecodeError::Payload { kind: "session-progress", .. })
        ));
    }

    #[test]
    fn test_encoded_event_decodes_to_itself() {
        let event = SessionEvent::Cancelled(Cancellation {
            message: "stopped by user".to_string(),
            completed_tests: 2,
            total_tests: 5,
            partial_duration: "4s".to_string(),
        });
        let raw = event.encode();
        assert!(raw.contains("\"type\":\"session-cancelled\""));
        assert_eq!(SessionEvent::decode(&raw).unwrap(), event);
    }

    #[test]
    fn test_stop_test_serialization() {
        let msg = ClientMessage::stop_test("task-17");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stop_test");
        assert_eq!(json["taskId"], "task-17");
        assert!(json["timestamp"].is_string());

        let parsed: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }
}

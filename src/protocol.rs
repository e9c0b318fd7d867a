//! Wire message taxonomy
//!
//! Every frame is one UTF-8 JSON object of shape `{type, data}`. Inbound
//! frames are decoded in two steps: the envelope first, then the payload for
//! the discriminant. Unknown discriminants are surfaced as
//! [`ClientMessage::Unknown`] so the connection loop can log and drop them;
//! missing required payload fields are protocol errors. Fields beyond the
//! declared schema are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Classification of tracker-reported error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerErrorKind {
    Generic,
    Javascript,
    PromiseRejection,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// `session_start` payload. Everything beyond the two identity fields is the
/// session metadata and is carried opaquely.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRef {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionalSessionRef {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsPayload {
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPageRequest {
    session_id: String,
    #[serde(default)]
    from_index: usize,
}

/// Decoded inbound message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    // Tracker
    SessionStart(SessionStart),
    EventsBatch { events: Vec<Value> },
    SessionEnd { session_id: Option<String> },
    Heartbeat { session_id: Option<String> },
    TrackerError { payload: Value },
    JavascriptError { payload: Value },
    PromiseRejection { payload: Value },
    VisibilityChange { payload: Value },
    // Viewer
    GetActiveSessions,
    ViewerJoinSession { session_id: String },
    ViewerLeaveSession { session_id: String },
    GetSessionEvents { session_id: String, from_index: usize },
    /// Recognized envelope, unrecognized discriminant.
    Unknown { kind: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

        let message = match envelope.kind.as_str() {
            "session_start" => Self::SessionStart(payload(&envelope.kind, envelope.data)?),
            "events_batch" => {
                let EventsPayload { events } = payload(&envelope.kind, envelope.data)?;
                Self::EventsBatch { events }
            }
            "session_end" => {
                let OptionalSessionRef { session_id } = payload(&envelope.kind, envelope.data)?;
                Self::SessionEnd { session_id }
            }
            "heartbeat" => {
                let OptionalSessionRef { session_id } = payload(&envelope.kind, envelope.data)?;
                Self::Heartbeat { session_id }
            }
            "error" => Self::TrackerError { payload: envelope.data },
            "javascript_error" => Self::JavascriptError { payload: envelope.data },
            "promise_rejection" => Self::PromiseRejection { payload: envelope.data },
            "visibility_change" => Self::VisibilityChange { payload: envelope.data },
            "get_active_sessions" => Self::GetActiveSessions,
            "viewer_join_session" => {
                let SessionRef { session_id } = payload(&envelope.kind, envelope.data)?;
                Self::ViewerJoinSession { session_id }
            }
            "viewer_leave_session" => {
                let SessionRef { session_id } = payload(&envelope.kind, envelope.data)?;
                Self::ViewerLeaveSession { session_id }
            }
            "get_session_events" => {
                let EventsPageRequest { session_id, from_index } =
                    payload(&envelope.kind, envelope.data)?;
                Self::GetSessionEvents { session_id, from_index }
            }
            _ => Self::Unknown { kind: envelope.kind.clone() },
        };

        Ok(message)
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// One session as it appears in `active_sessions` snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub event_count: u64,
    pub error_count: u64,
}

/// Broadcast payload that forwards an opaque tracker record under the
/// originating session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastDetail {
    pub session_id: String,
    #[serde(flatten)]
    pub detail: Value,
}

impl BroadcastDetail {
    /// Non-object payloads are nested under a `payload` key so the frame
    /// stays a JSON object.
    pub fn new(session_id: String, payload: Value) -> Self {
        let detail = if payload.is_object() {
            payload
        } else {
            serde_json::json!({ "payload": payload })
        };
        Self { session_id, detail }
    }
}

/// Outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ActiveSessions {
        sessions: Vec<SessionSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        user_id: String,
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_id: String,
        events: Vec<Value>,
        metadata: Value,
        total_events: u64,
        is_active: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionEvents {
        session_id: String,
        events: Vec<Value>,
        from_index: usize,
        total_events: u64,
        has_more: bool,
    },
    #[serde(rename_all = "camelCase")]
    EventsBatch {
        session_id: String,
        events: Vec<Value>,
    },
    VisibilityChange(BroadcastDetail),
    JavascriptError(BroadcastDetail),
    PromiseRejection(BroadcastDetail),
    #[serde(rename_all = "camelCase")]
    SessionAssigned {
        session_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_session_start_splits_metadata() {
        let frame = r#"{
            "type": "session_start",
            "data": {
                "sessionId": "s1",
                "userId": "u1",
                "url": "/a",
                "viewport": {"width": 100, "height": 100, "devicePixelRatio": 1},
                "startTime": 1000,
                "timeZone": "UTC"
            }
        }"#;

        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::SessionStart(start) => {
                assert_eq!(start.session_id, "s1");
                assert_eq!(start.user_id, "u1");
                assert_eq!(start.metadata["url"], "/a");
                assert_eq!(start.metadata["viewport"]["width"], 100);
                // Identity fields are not duplicated into the metadata blob.
                assert!(start.metadata.get("sessionId").is_none());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_events_batch_preserves_order() {
        let frame = r#"{"type":"events_batch","data":{"events":[{"k":1},{"k":2},{"k":3}]}}"#;
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::EventsBatch { events } => {
                let keys: Vec<i64> = events.iter().map(|e| e["k"].as_i64().unwrap()).collect();
                assert_eq!(keys, vec![1, 2, 3]);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let frame = r#"{"type":"time_travel","data":{}}"#;
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::Unknown { kind } => assert_eq!(kind, "time_travel"),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_extra_envelope_fields_ignored() {
        let frame = r#"{"type":"heartbeat","data":{"sessionId":"s1"},"v":2,"seq":99}"#;
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::Heartbeat { session_id } => assert_eq!(session_id.as_deref(), Some("s1")),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_heartbeat_without_data() {
        match ClientMessage::parse(r#"{"type":"heartbeat"}"#).unwrap() {
            ClientMessage::Heartbeat { session_id } => assert!(session_id.is_none()),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_required_field_is_protocol_error() {
        let err = ClientMessage::parse(r#"{"type":"viewer_join_session","data":{}}"#).unwrap_err();
        match err {
            ProtocolError::InvalidPayload { kind, .. } => assert_eq!(kind, "viewer_join_session"),
            other => panic!("wrong error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_frame() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_get_session_events_from_index_defaults_to_zero() {
        let frame = r#"{"type":"get_session_events","data":{"sessionId":"s1"}}"#;
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::GetSessionEvents { session_id, from_index } => {
                assert_eq!(session_id, "s1");
                assert_eq!(from_index, 0);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_envelope_shape() {
        let msg = ServerMessage::SessionEvents {
            session_id: "s1".to_string(),
            events: vec![json!({"k": 1})],
            from_index: 0,
            total_events: 2,
            has_more: true,
        };
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();

        assert_eq!(frame["type"], "session_events");
        assert_eq!(frame["data"]["sessionId"], "s1");
        assert_eq!(frame["data"]["fromIndex"], 0);
        assert_eq!(frame["data"]["totalEvents"], 2);
        assert_eq!(frame["data"]["hasMore"], true);
    }

    #[test]
    fn test_broadcast_detail_flattens_object_payload() {
        let msg = ServerMessage::JavascriptError(BroadcastDetail::new(
            "s1".to_string(),
            json!({"message": "boom", "line": 7}),
        ));
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();

        assert_eq!(frame["type"], "javascript_error");
        assert_eq!(frame["data"]["sessionId"], "s1");
        assert_eq!(frame["data"]["message"], "boom");
        assert_eq!(frame["data"]["line"], 7);
    }

    #[test]
    fn test_broadcast_detail_wraps_non_object_payload() {
        let msg = ServerMessage::VisibilityChange(BroadcastDetail::new(
            "s1".to_string(),
            json!("hidden"),
        ));
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(frame["data"]["payload"], "hidden");
    }

    #[test]
    fn test_session_assigned_shape() {
        let msg = ServerMessage::SessionAssigned { session_id: "17099-ab12cd34".to_string() };
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(frame["type"], "session_assigned");
        assert_eq!(frame["data"]["sessionId"], "17099-ab12cd34");
    }
}

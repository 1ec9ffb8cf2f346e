//! Wire protocol types exchanged between host and child.
//!
//! Three shapes travel over a bridge channel:
//! - **Event**: fire-and-forget, no reply expected
//! - **Request**: an event carrying an `id`, answered by exactly one response
//! - **Response**: correlates to a request by `id`
//!
//! Inbound payloads are classified once into [`Message`] and handled by
//! matching on the variant.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch, the timestamp unit of every message.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Marker field that always serializes as `true` and only deserializes from `true`.
///
/// Used for `needResponse` and `isResponse` so a `false` value can never be
/// mistaken for a request or a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct True;

impl Serialize for True {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for True {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(True)
        } else {
            Err(de::Error::custom("expected `true`"))
        }
    }
}

/// Fire-and-forget message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: u64,
    /// Partition key, present only when the sender runs in isolation mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

impl EventMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: now_millis(),
            window_id: None,
        }
    }
}

/// Message expecting exactly one [`ResponseMessage`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    pub need_response: True,
}

impl RequestMessage {
    pub fn new(id: impl Into<String>, message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            message_type: message_type.into(),
            payload,
            timestamp: now_millis(),
            window_id: None,
            need_response: True,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    pub is_response: True,
}

impl ResponseMessage {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_millis(),
            window_id: None,
            is_response: True,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: now_millis(),
            window_id: None,
            is_response: True,
        }
    }
}

/// Reasons an inbound payload is not a message of this protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no string `type` field")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Invalid {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Any message of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Event(EventMessage),
    Request(RequestMessage),
    Response(ResponseMessage),
}

impl Message {
    /// Classify a raw inbound value.
    ///
    /// `isResponse: true` wins over `needResponse: true`, which wins over a
    /// plain `type`. Anything else is malformed.
    pub fn classify(value: Value) -> Result<Self, ProtocolError> {
        let (is_response, need_response, has_type) = match &value {
            Value::Object(map) => (
                map.get("isResponse").and_then(Value::as_bool) == Some(true),
                map.get("needResponse").and_then(Value::as_bool) == Some(true),
                map.get("type").is_some_and(Value::is_string),
            ),
            _ => return Err(ProtocolError::NotAnObject),
        };

        if is_response {
            serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|source| ProtocolError::Invalid {
                    kind: "response",
                    source,
                })
        } else if need_response {
            serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|source| ProtocolError::Invalid {
                    kind: "request",
                    source,
                })
        } else if has_type {
            serde_json::from_value(value)
                .map(Message::Event)
                .map_err(|source| ProtocolError::Invalid {
                    kind: "event",
                    source,
                })
        } else {
            Err(ProtocolError::MissingType)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
        }
    }

    pub fn window_id(&self) -> Option<&str> {
        match self {
            Self::Event(m) => m.window_id.as_deref(),
            Self::Request(m) => m.window_id.as_deref(),
            Self::Response(m) => m.window_id.as_deref(),
        }
    }

    pub fn set_window_id(&mut self, window_id: Option<String>) {
        match self {
            Self::Event(m) => m.window_id = window_id,
            Self::Request(m) => m.window_id = window_id,
            Self::Response(m) => m.window_id = window_id,
        }
    }
}

impl From<EventMessage> for Message {
    fn from(message: EventMessage) -> Self {
        Self::Event(message)
    }
}

impl From<RequestMessage> for Message {
    fn from(message: RequestMessage) -> Self {
        Self::Request(message)
    }
}

impl From<ResponseMessage> for Message {
    fn from(message: ResponseMessage) -> Self {
        Self::Response(message)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::classify(value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TS: u64 = 1_700_000_000_000;

    #[test]
    fn event_serializes() {
        let msg = EventMessage {
            message_type: "user:login".to_string(),
            payload: json!({"name": "ada"}),
            timestamp: TS,
            window_id: None,
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "user:login",
          "payload": {
            "name": "ada"
          },
          "timestamp": 1700000000000
        }
        "#);
    }

    #[test]
    fn request_serializes_with_window_id() {
        let mut msg = RequestMessage::new("msg_1_1", "math:add", json!([1, 2]));
        msg.timestamp = TS;
        msg.window_id = Some("window_a".to_string());
        insta::assert_json_snapshot!(msg, @r#"
        {
          "id": "msg_1_1",
          "type": "math:add",
          "payload": [
            1,
            2
          ],
          "timestamp": 1700000000000,
          "windowId": "window_a",
          "needResponse": true
        }
        "#);
    }

    #[test]
    fn failure_response_serializes() {
        let mut msg = ResponseMessage::failure("msg_1_1", "No handler for message type: a:b");
        msg.timestamp = TS;
        insta::assert_json_snapshot!(msg, @r#"
        {
          "id": "msg_1_1",
          "success": false,
          "error": "No handler for message type: a:b",
          "timestamp": 1700000000000,
          "isResponse": true
        }
        "#);
    }

    #[test]
    fn classify_response_takes_precedence() {
        let raw = json!({
            "id": "msg_1_1",
            "success": true,
            "data": 3,
            "timestamp": TS,
            "isResponse": true,
            "needResponse": true,
            "type": "math:add"
        });
        match Message::classify(raw).unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, "msg_1_1");
                assert_eq!(r.data, Some(json!(3)));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_request() {
        let raw = json!({
            "id": "msg_1_2",
            "type": "math:add",
            "payload": [1, 2],
            "timestamp": TS,
            "needResponse": true
        });
        let msg = Message::classify(raw).unwrap();
        assert_eq!(msg.kind(), "request");
    }

    #[test]
    fn classify_event_with_false_need_response() {
        let raw = json!({"type": "ui:resize", "payload": 10, "needResponse": false});
        match Message::classify(raw).unwrap() {
            Message::Event(e) => {
                assert_eq!(e.message_type, "ui:resize");
                assert_eq!(e.payload, json!(10));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_malformed_payloads() {
        assert!(matches!(
            Message::classify(json!([1, 2])),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            Message::classify(json!({})),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            Message::classify(json!({"type": 3})),
            Err(ProtocolError::MissingType)
        ));
        // A request without an id cannot be answered.
        assert!(matches!(
            Message::classify(json!({"type": "a:b", "needResponse": true})),
            Err(ProtocolError::Invalid { kind: "request", .. })
        ));
    }

    #[test]
    fn message_deserializes_through_classification() {
        let msg: Message = serde_json::from_str(
            r#"{"id":"x","success":false,"error":"boom","timestamp":1,"isResponse":true}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "response");
        assert!(serde_json::from_str::<Message>(r#"{"payload":1}"#).is_err());
    }

    #[test]
    fn window_id_accessors() {
        let mut msg = Message::from(EventMessage::new("a:b", Value::Null));
        assert_eq!(msg.window_id(), None);
        msg.set_window_id(Some("w1".to_string()));
        assert_eq!(msg.window_id(), Some("w1"));
    }
}

//! Wire codec seam and the default JSON codec for the hub's text protocol.
//!
//! The engine only ever sees [`OutgoingMessage`] and [`IncomingMessage`]; the codec owns the
//! frame layout. A codec instance is handed to the connection at construction.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};
use tracing::warn;

use crate::core::{HubError, HubResult, WsFrame, data_bytes};
use crate::ws::subscriptions::EventFilter;

/// Keys owned by the envelope; callers may not set them as payload fields.
const RESERVED_KEYS: [&str; 2] = ["id", "type"];

/// A logical request: a type tag plus payload fields.
///
/// The identifier is assigned by the engine at send time.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    kind: String,
    fields: BTreeMap<String, Value>,
}

impl OutgoingMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Attach any serializable value as a payload field.
    pub fn with_serialized<T: Serialize + ?Sized>(
        self,
        key: impl Into<String>,
        value: &T,
    ) -> HubResult<Self> {
        let value = sonic_rs::to_value(value).map_err(|e| HubError::Codec(e.to_string()))?;
        Ok(self.with_field(key, value))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub(crate) fn auth(access_token: &str) -> Self {
        Self::new("auth").with_field("access_token", access_token)
    }

    /// Subscribe request; the match-any filter omits `event_type`.
    pub fn subscribe_events(filter: &EventFilter) -> Self {
        let message = Self::new("subscribe_events");
        match filter.as_event_type() {
            Some(event_type) => message.with_field("event_type", event_type),
            None => message,
        }
    }

    pub fn unsubscribe_events(subscription: u64) -> Self {
        Self::new("unsubscribe_events").with_field("subscription", subscription)
    }

    pub fn ping() -> Self {
        Self::new("ping")
    }
}

/// Error payload carried on an unsuccessful `result` frame.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServerErrorInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Raw response correlated to one request.
#[derive(Clone, Debug, PartialEq)]
pub struct HubResponse {
    pub id: u64,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ServerErrorInfo>,
}

impl HubResponse {
    /// Deserialize the payload of a successful response.
    ///
    /// A failed response becomes [`HubError::ServerError`]; a missing payload deserializes
    /// from JSON `null`, so `()` and `Option<T>` targets accept it.
    pub fn into_result<T: DeserializeOwned>(self) -> HubResult<T> {
        if !self.success {
            let error = self.error.unwrap_or_else(|| ServerErrorInfo {
                code: "unknown_error".to_string(),
                message: "request failed without error details".to_string(),
            });
            return Err(HubError::ServerError {
                code: error.code,
                message: error.message,
            });
        }
        let payload = self.result.unwrap_or_default();
        sonic_rs::from_value(&payload).map_err(|e| HubError::Codec(e.to_string()))
    }
}

/// Unsolicited event routed by server subscription id.
#[derive(Clone, Debug, PartialEq)]
pub struct HubEvent {
    pub subscription_id: u64,
    pub payload: Value,
}

impl HubEvent {
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("event_type").and_then(|v| v.as_str())
    }
}

/// The closed set of incoming message kinds the engine understands.
#[derive(Clone, Debug, PartialEq)]
pub enum IncomingMessage {
    AuthRequired { ha_version: Option<String> },
    AuthOk { ha_version: Option<String> },
    AuthInvalid { message: String },
    Result(HubResponse),
    Event(HubEvent),
    Pong { id: u64 },
    Unknown { kind: String },
}

/// Encodes outgoing messages and decodes incoming frames.
pub trait HubCodec: Send + Sync + 'static {
    /// Encode `message`, stamping `id` when the message is correlatable.
    fn encode(&self, id: Option<u64>, message: &OutgoingMessage) -> HubResult<WsFrame>;

    /// Decode one frame into zero or more messages (frames may be coalesced).
    fn decode(&self, frame: &WsFrame) -> HubResult<Vec<IncomingMessage>>;
}

#[derive(Serialize)]
struct WireOutgoing<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(flatten)]
    fields: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct WireIncoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ha_version: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ServerErrorInfo>,
    #[serde(default)]
    event: Option<Value>,
}

impl WireIncoming {
    fn into_message(self) -> HubResult<IncomingMessage> {
        let missing_id = |kind: &str| HubError::Codec(format!("`{kind}` frame without id"));
        Ok(match self.kind.as_str() {
            "auth_required" => IncomingMessage::AuthRequired {
                ha_version: self.ha_version,
            },
            "auth_ok" => IncomingMessage::AuthOk {
                ha_version: self.ha_version,
            },
            "auth_invalid" => IncomingMessage::AuthInvalid {
                message: self.message.unwrap_or_default(),
            },
            "result" => IncomingMessage::Result(HubResponse {
                id: self.id.ok_or_else(|| missing_id("result"))?,
                success: self.success.unwrap_or(false),
                result: self.result,
                error: self.error,
            }),
            "event" => IncomingMessage::Event(HubEvent {
                subscription_id: self.id.ok_or_else(|| missing_id("event"))?,
                payload: self.event.unwrap_or_default(),
            }),
            "pong" => IncomingMessage::Pong {
                id: self.id.ok_or_else(|| missing_id("pong"))?,
            },
            _ => IncomingMessage::Unknown { kind: self.kind },
        })
    }
}

/// JSON text codec (serde + sonic-rs).
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl HubCodec for JsonCodec {
    fn encode(&self, id: Option<u64>, message: &OutgoingMessage) -> HubResult<WsFrame> {
        if let Some(key) = RESERVED_KEYS
            .iter()
            .find(|key| message.fields.contains_key(**key))
        {
            return Err(HubError::InvalidArgument(format!(
                "`{key}` is assigned by the connection and cannot be a payload field"
            )));
        }
        let wire = WireOutgoing {
            id,
            kind: &message.kind,
            fields: &message.fields,
        };
        let text = sonic_rs::to_string(&wire).map_err(|e| HubError::Codec(e.to_string()))?;
        Ok(WsFrame::text(text))
    }

    fn decode(&self, frame: &WsFrame) -> HubResult<Vec<IncomingMessage>> {
        let Some(bytes) = data_bytes(frame) else {
            return Ok(Vec::new());
        };
        let coalesced = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'[');
        if !coalesced {
            let wire: WireIncoming =
                sonic_rs::from_slice(bytes).map_err(|e| HubError::Codec(e.to_string()))?;
            return Ok(vec![wire.into_message()?]);
        }

        // Entries are decoded one by one; a bad entry must not take its neighbours with it.
        let entries: Vec<Value> =
            sonic_rs::from_slice(bytes).map_err(|e| HubError::Codec(e.to_string()))?;
        let mut messages = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let decoded = sonic_rs::from_value::<WireIncoming>(entry)
                .map_err(|e| HubError::Codec(e.to_string()))
                .and_then(WireIncoming::into_message);
            match decoded {
                Ok(message) => messages.push(message),
                Err(err) => warn!(index, error = %err, "skipping malformed entry of a coalesced frame"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(text: &str) -> IncomingMessage {
        let mut messages = JsonCodec.decode(&WsFrame::text(text)).expect("decode");
        assert_eq!(messages.len(), 1);
        messages.remove(0)
    }

    #[test]
    fn encode_stamps_id_and_flattens_fields() {
        let message = OutgoingMessage::new("call_service")
            .with_field("domain", "light")
            .with_field("service", "turn_on");
        let frame = JsonCodec.encode(Some(7), &message).expect("encode");
        let text = frame.as_text().expect("text");
        let value: Value = sonic_rs::from_str(text).expect("json");
        assert_eq!(value.get("id").and_then(|v| v.as_u64()), Some(7));
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("call_service"));
        assert_eq!(value.get("domain").and_then(|v| v.as_str()), Some("light"));
    }

    #[test]
    fn auth_is_sent_without_id() {
        let frame = JsonCodec
            .encode(None, &OutgoingMessage::auth("secret"))
            .expect("encode");
        let value: Value = sonic_rs::from_str(frame.as_text().expect("text")).expect("json");
        assert!(value.get("id").is_none());
        assert_eq!(value.get("access_token").and_then(|v| v.as_str()), Some("secret"));
    }

    #[test]
    fn reserved_fields_are_rejected() {
        let message = OutgoingMessage::new("get_states").with_field("id", 3u64);
        let err = JsonCodec.encode(Some(1), &message).unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }

    #[test]
    fn match_any_subscribe_omits_event_type() {
        let any = OutgoingMessage::subscribe_events(&EventFilter::Any);
        assert!(!any.fields().contains_key("event_type"));
        let typed = OutgoingMessage::subscribe_events(&EventFilter::event_type("state_changed"));
        assert_eq!(
            typed.fields().get("event_type").and_then(|v| v.as_str()),
            Some("state_changed")
        );
    }

    #[test]
    fn decodes_handshake_frames() {
        assert_eq!(
            decode_one(r#"{"type":"auth_required","ha_version":"2024.1.0"}"#),
            IncomingMessage::AuthRequired {
                ha_version: Some("2024.1.0".to_string())
            }
        );
        assert_eq!(
            decode_one(r#"{"type":"auth_invalid","message":"Invalid password"}"#),
            IncomingMessage::AuthInvalid {
                message: "Invalid password".to_string()
            }
        );
    }

    #[test]
    fn decodes_failed_result_into_server_error() {
        let IncomingMessage::Result(response) = decode_one(
            r#"{"id":4,"type":"result","success":false,"error":{"code":"not_found","message":"Entity not found"}}"#,
        ) else {
            panic!("expected result");
        };
        assert_eq!(response.id, 4);
        match response.into_result::<()>() {
            Err(HubError::ServerError { code, message }) => {
                assert_eq!(code, "not_found");
                assert_eq!(message, "Entity not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn typed_result_deserializes_payload() {
        #[derive(Deserialize)]
        struct Config {
            version: String,
        }
        let IncomingMessage::Result(response) =
            decode_one(r#"{"id":2,"type":"result","success":true,"result":{"version":"2024.1.0"}}"#)
        else {
            panic!("expected result");
        };
        let config: Config = response.into_result().expect("typed");
        assert_eq!(config.version, "2024.1.0");
    }

    #[test]
    fn decodes_coalesced_frames_in_order() {
        let frame = WsFrame::text(
            r#"[{"id":1,"type":"event","event":{"event_type":"state_changed"}},{"id":2,"type":"pong"}]"#,
        );
        let messages = JsonCodec.decode(&frame).expect("decode");
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            IncomingMessage::Event(event) => {
                assert_eq!(event.subscription_id, 1);
                assert_eq!(event.event_type(), Some("state_changed"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(messages[1], IncomingMessage::Pong { id: 2 });
    }

    #[test]
    fn malformed_entry_does_not_drop_the_rest_of_a_batch() {
        let frame = WsFrame::text(
            r#"[{"id":1,"type":"result","success":true,"result":null},{"type":"result","success":true},{"id":3,"type":"pong"}]"#,
        );
        let messages = JsonCodec.decode(&frame).expect("decode");
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], IncomingMessage::Result(response) if response.id == 1));
        assert_eq!(messages[1], IncomingMessage::Pong { id: 3 });

        let untyped = WsFrame::text(r#"[42,{"id":5,"type":"pong"}]"#);
        assert_eq!(
            JsonCodec.decode(&untyped).expect("decode"),
            vec![IncomingMessage::Pong { id: 5 }]
        );
        assert!(JsonCodec.decode(&WsFrame::text("[{\"id\":1,")).is_err());
    }

    #[test]
    fn serialized_fields_keep_their_structure() {
        #[derive(Serialize)]
        struct Target {
            entity_id: Vec<&'static str>,
        }
        let message = OutgoingMessage::new("call_service")
            .with_serialized(
                "target",
                &Target {
                    entity_id: vec!["light.kitchen"],
                },
            )
            .expect("serialize");
        let target = message.fields().get("target").expect("target");
        assert_eq!(
            target["entity_id"][0].as_str(),
            Some("light.kitchen")
        );
    }

    #[test]
    fn unknown_kinds_and_control_frames_are_tolerated() {
        assert_eq!(
            decode_one(r#"{"type":"supported_features"}"#),
            IncomingMessage::Unknown {
                kind: "supported_features".to_string()
            }
        );
        let none = JsonCodec
            .decode(&WsFrame::Ping(bytes::Bytes::new()))
            .expect("decode");
        assert!(none.is_empty());
        assert!(JsonCodec.decode(&WsFrame::text("not json")).is_err());
    }
}

//! Wire format: envelopes, correlation ids, and the error object.
//!
//! One [`Envelope`] is one message on the transport, either a request or a
//! reply. Field names are shortened on the wire (`ns`, `id`, `nm`, ...) to
//! keep frames small; optional fields are omitted entirely when absent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{WsrError, WsrResult};
use crate::transport::WireMessage;

/// Reserved operation name for the peer identity handshake.
pub const REMOTE_NAME: &str = "_remote_";

/// Reserved operation name for the keepalive echo.
pub const PING_NAME: &str = "_ping_";

/// Reserved operation name for loop-back dispatch of an embedded envelope.
pub const REQUEST_NAME: &str = "_request_";

/// Unique identifier for request-reply correlation.
/// Uses ULID for lexicographically sortable, unique ids.
///
/// The id is the only thing matching a reply to its request, so it is
/// treated as a capability: whoever knows it can resolve the call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request id using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a peer endpoint, as exchanged by the `_remote_` handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// The peer's endpoint id.
    pub id: String,
}

/// The wire error object carried by error replies (`er` field).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class name, `"WebsocketerError"` for errors raised locally.
    pub name: String,
    /// Stable `ERR_WSR_*` (or application-defined) code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ErrorInfo {
    /// Create an error object with the default name.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: "WebsocketerError".to_string(),
            code: code.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Build the wire object for an error raised on this side.
    ///
    /// Errors of a recognized kind keep their code; anything else already
    /// collapsed to `ERR_WSR_INTERNAL` via [`WsrError::code`]. Remote errors
    /// being relayed keep their original name.
    pub fn from_error(error: &WsrError) -> Self {
        let name = match error {
            WsrError::Remote { name, .. } => name.clone(),
            _ => "WebsocketerError".to_string(),
        };
        Self {
            name,
            code: error.code().to_string(),
            message: error.to_string(),
            payload: error.payload().cloned(),
        }
    }

    /// Rehydrate a received error object into a [`WsrError::Remote`].
    ///
    /// With `debug` set, the failing operation name is appended to the
    /// message text so call sites show up in logs without a stack.
    pub fn into_error(self, request_name: &str, debug: bool) -> WsrError {
        let message = if debug {
            format!("{} -> {}", self.message, request_name)
        } else {
            self.message
        };
        WsrError::Remote {
            name: self.name,
            code: self.code,
            message,
            payload: self.payload,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single message on the wire.
///
/// Requests carry `is_request = true` and expect exactly one reply bearing
/// the same `id` and `name`. Replies carry either a payload or an error,
/// never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Namespace tag isolating independent instances on a shared socket.
    #[serde(rename = "ns")]
    pub namespace: String,
    /// Correlation id; a reply carries the id of its request.
    #[serde(rename = "id")]
    pub id: RequestId,
    /// Operation name.
    #[serde(rename = "nm")]
    pub name: String,
    /// True for requests, false for replies.
    #[serde(rename = "rq")]
    pub is_request: bool,
    /// Sender endpoint id.
    #[serde(rename = "fr", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Destination endpoint id, for cluster routing.
    #[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Opaque payload.
    #[serde(rename = "pl", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error object, present only on error replies.
    #[serde(rename = "er", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Set once the request has been handed to the cluster collaborator,
    /// preventing double-forwarding across hops.
    #[serde(rename = "ic", default, skip_serializing_if = "is_false")]
    pub forwarded: bool,
}

impl Envelope {
    /// Build a fresh request envelope with a generated id.
    pub fn request(
        namespace: impl Into<String>,
        name: impl Into<String>,
        from: impl Into<String>,
        to: Option<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: RequestId::new(),
            name: name.into(),
            is_request: true,
            from: Some(from.into()),
            to,
            payload,
            error: None,
            forwarded: false,
        }
    }

    /// Build a fresh success reply for `request`.
    ///
    /// The inbound envelope is never mutated into a reply; replies are
    /// always newly constructed with the sender/destination swapped.
    pub fn reply(request: &Envelope, from: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            namespace: request.namespace.clone(),
            id: request.id.clone(),
            name: request.name.clone(),
            is_request: false,
            from: Some(from.into()),
            to: request.from.clone(),
            payload,
            error: None,
            forwarded: false,
        }
    }

    /// Build a fresh error reply for `request`.
    pub fn error_reply(request: &Envelope, from: impl Into<String>, error: ErrorInfo) -> Self {
        Self {
            payload: None,
            error: Some(error),
            ..Self::reply(request, from, None)
        }
    }

    /// Mark the envelope as handed to the cluster collaborator.
    pub fn into_forwarded(mut self) -> Self {
        self.forwarded = true;
        self
    }

    /// Whether `self` is a well-formed reply to `request`: not a request
    /// itself, and carrying the same id and name.
    pub fn answers(&self, request: &Envelope) -> bool {
        !self.is_request && self.id == request.id && self.name == request.name
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> WsrResult<WireMessage> {
        Ok(WireMessage::text(serde_json::to_string(self)?))
    }

    /// Deserialize from a text or UTF-8 binary frame.
    pub fn decode(message: &WireMessage) -> WsrResult<Self> {
        match message {
            WireMessage::Text(text) => Ok(serde_json::from_str(text)?),
            WireMessage::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_display() {
        let id: RequestId = "my-request-123".into();
        assert_eq!(format!("{}", id), "my-request-123");
        assert_eq!(id.as_str(), "my-request-123");
    }

    #[test]
    fn test_wire_keys_are_short() {
        let env = Envelope::request("app", "echo", "a", None, Some(json!(1)));
        let encoded = env.encode().unwrap();
        let raw: Value = serde_json::from_str(encoded.as_text().unwrap()).unwrap();
        let obj = raw.as_object().unwrap();
        assert!(obj.contains_key("ns"));
        assert!(obj.contains_key("id"));
        assert!(obj.contains_key("nm"));
        assert!(obj.contains_key("rq"));
        assert!(obj.contains_key("fr"));
        assert!(obj.contains_key("pl"));
        // absent optionals are omitted, not null
        assert!(!obj.contains_key("to"));
        assert!(!obj.contains_key("er"));
        assert!(!obj.contains_key("ic"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let env = Envelope::request(
            "app",
            "sum",
            "alice",
            Some("bob".to_string()),
            Some(json!({ "a": 1, "b": 2 })),
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_binary_frame() {
        let env = Envelope::request("app", "echo", "a", None, None);
        let text = serde_json::to_string(&env).unwrap();
        let decoded = Envelope::decode(&WireMessage::binary(text.into_bytes())).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode(&WireMessage::text("not json")).is_err());
        assert!(Envelope::decode(&WireMessage::text(r#"{"ns":"app"}"#)).is_err());
    }

    #[test]
    fn test_reply_swaps_addressing() {
        let request = Envelope::request("app", "echo", "alice", Some("bob".into()), None);
        let reply = Envelope::reply(&request, "bob", Some(json!("hi")));
        assert!(!reply.is_request);
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.name, request.name);
        assert_eq!(reply.from.as_deref(), Some("bob"));
        assert_eq!(reply.to.as_deref(), Some("alice"));
        assert!(reply.answers(&request));
    }

    #[test]
    fn test_error_reply_carries_no_payload() {
        let request = Envelope::request("app", "echo", "alice", None, Some(json!(1)));
        let reply = Envelope::error_reply(
            &request,
            "bob",
            ErrorInfo::new("ERR_WSR_NO_LISTENER", "no listener for 'echo'"),
        );
        assert!(reply.payload.is_none());
        let error = reply.error.unwrap();
        assert_eq!(error.code, "ERR_WSR_NO_LISTENER");
        assert_eq!(error.name, "WebsocketerError");
    }

    #[test]
    fn test_forwarded_flag_crosses_the_wire() {
        let env = Envelope::request("app", "echo", "a", Some("b".into()), None).into_forwarded();
        let text = env.encode().unwrap();
        assert!(text.as_text().unwrap().contains("\"ic\":true"));
        let decoded = Envelope::decode(&text).unwrap();
        assert!(decoded.forwarded);
    }

    #[test]
    fn test_answers_rejects_mismatches() {
        let request = Envelope::request("app", "echo", "a", None, None);
        let mut reply = Envelope::reply(&request, "b", None);
        assert!(reply.answers(&request));
        reply.name = "other".into();
        assert!(!reply.answers(&request));
        let stranger = Envelope::reply(&Envelope::request("app", "echo", "a", None, None), "b", None);
        assert!(!stranger.answers(&request));
    }

    #[test]
    fn test_error_info_debug_suffix() {
        let info = ErrorInfo::new("ERR_WSR_INTERNAL", "boom");
        let err = info.clone().into_error("save", true);
        assert_eq!(err.to_string(), "boom -> save");
        let err = info.into_error("save", false);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_error_info_from_error_keeps_remote_name() {
        let remote = WsrError::Remote {
            name: "RemoteWebsocketerError".into(),
            code: "ERR_APP_DENIED".into(),
            message: "denied".into(),
            payload: Some(json!({ "reason": "quota" })),
        };
        let info = ErrorInfo::from_error(&remote);
        assert_eq!(info.name, "RemoteWebsocketerError");
        assert_eq!(info.code, "ERR_APP_DENIED");
        assert_eq!(info.payload, Some(json!({ "reason": "quota" })));

        let local = WsrError::internal("boom");
        let info = ErrorInfo::from_error(&local);
        assert_eq!(info.name, "WebsocketerError");
        assert_eq!(info.code, "ERR_WSR_INTERNAL");
    }
}

//! # Protocol Frames
//!
//! Every frame is an internally tagged JSON object: `{"type": "call", ...}`.
//!
//! ## Invariants
//! - A `Response` carries exactly one of `result` / `error`.
//! - A `null` result is a present result, distinct from a missing one.
//! - Frames hold only data; sender identity is supplied by the transport.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorPayload;
use crate::ident::Role;

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Call(Request),
    CallResponse(Response),
    Ping(Ping),
    Pong(Pong),
    Subscribe(SubjectRef),
    Unsubscribe(SubjectRef),
    ValueUpdate(ValueUpdate),
    Complete(Complete),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Call(_) => MessageKind::Call,
            Self::CallResponse(_) => MessageKind::CallResponse,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Subscribe(_) => MessageKind::Subscribe,
            Self::Unsubscribe(_) => MessageKind::Unsubscribe,
            Self::ValueUpdate(_) => MessageKind::ValueUpdate,
            Self::Complete(_) => MessageKind::Complete,
        }
    }
}

/// The `type` discriminator of a frame, used by transports to route handlers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum MessageKind {
    Call,
    CallResponse,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    ValueUpdate,
    Complete,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::CallResponse => "call-response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ValueUpdate => "value-update",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound call. `id` is unique among the caller's outstanding calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub to: Role,
    pub from: Role,
}

/// The answer to a `Request` with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub service: String,
    pub method: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub from: Role,
}

impl Response {
    pub fn ok(request: &Request, from: Role, result: Value) -> Self {
        Self {
            id: request.id.clone(),
            service: request.service.clone(),
            method: request.method.clone(),
            result: Some(result),
            error: None,
            from,
        }
    }

    pub fn err(request: &Request, from: Role, error: ErrorPayload) -> Self {
        Self {
            id: request.id.clone(),
            service: request.service.clone(),
            method: request.method.clone(),
            result: None,
            error: Some(error),
            from,
        }
    }

    /// Collapses the two optional fields into one outcome.
    ///
    /// `error` wins if a peer sent both; a frame with neither is a `null` result.
    pub fn into_outcome(self) -> std::result::Result<Value, ErrorPayload> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// Readiness probe sent before the first call to a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: String,
    pub service: String,
    pub to: Role,
    pub from: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub id: String,
    pub from: Role,
}

/// Names one subject; used by both `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRef {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {
    pub key: String,
}

// `Option<Value>` would read an explicit `null` as absent.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

//! # Error Definitions
//!
//! Two different things live here. `Error` is the protocol failing locally
//! (a frame that does not encode or decode). `ErrorPayload` is a *remote*
//! failure travelling inside a `call-response`, and `FaultKind` names the
//! failures the engine itself produces.

use serde::Deserialize;
use serde::Serialize;

/// Failures of the codec itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A frame could not be turned into JSON.
    Encode(String),
    /// Bytes on the wire were not a valid frame.
    Decode(String),
    /// An argument list or result did not match the expected Rust type.
    Convert(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::Convert(msg) => write!(f, "Conversion error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the engine rather than by a service implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// No implementation is registered under the requested key.
    UnknownService,
    /// The implementation exists but has no such method.
    UnknownMethod,
    /// The method failed or panicked.
    HandlerFailure,
    /// The readiness handshake never completed.
    ReadinessTimeout,
    /// A required transport capability is missing.
    TransportUnavailable,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::UnknownService,
        FaultKind::UnknownMethod,
        FaultKind::HandlerFailure,
        FaultKind::ReadinessTimeout,
        FaultKind::TransportUnavailable,
    ];

    /// The `name` this fault carries on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownService => "UnknownService",
            Self::UnknownMethod => "UnknownMethod",
            Self::HandlerFailure => "HandlerFailure",
            Self::ReadinessTimeout => "ReadinessTimeout",
            Self::TransportUnavailable => "TransportUnavailable",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The serialized form of a failure, as carried by `call-response.error`.
///
/// `message` is always present; `stack` is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn unknown_service(service: &str) -> Self {
        Self::new(FaultKind::UnknownService.as_str(), format!("Unknown service: {}", service))
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(FaultKind::UnknownMethod.as_str(), format!("Unknown method: {}", method))
    }

    /// The engine fault this payload represents, if the name is one of ours.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        FaultKind::from_name(&self.name)
    }
}

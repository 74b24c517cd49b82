//! # Transport Abstraction
//!
//! The narrow interface between the engine and whatever actually moves
//! frames between contexts.
//!
//! ## Philosophy
//!
//! - **Fire and forget**: `send` never fails the caller. A transport that
//!   cannot deliver logs and drops the frame.
//! - **Kind-routed**: handlers subscribe to one `MessageKind` and get back an
//!   unsubscribe function, so components can tear their listeners down.
//! - **Ambient identity**: the transport, not the payload, says who sent a
//!   frame. Responses and subject pushes are addressed from that origin.

use std::sync::Arc;

use isowire::Message;
use isowire::MessageKind;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ContextRole;

/// Transport-assigned identity of one context.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Where a frame should go.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Address {
    /// Every other endpoint on the channel.
    #[default]
    Broadcast,
    /// Exactly one endpoint.
    Endpoint(EndpointId),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Endpoint(id) => write!(f, "{}", id),
        }
    }
}

/// What a transport can do, as far as routing cares.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Can reach a hub context.
    pub upstream: bool,
    /// Can address arbitrary endpoints by id.
    pub directed: bool,
}

impl Capabilities {
    /// Guesses the structural role from what the transport offers.
    ///
    /// Directed addressing means this context can fan out to others, which
    /// makes it a hub. Upstream-only means it is a leaf.
    pub fn detect_role(&self) -> Option<ContextRole> {
        match (self.directed, self.upstream) {
            (true, _) => Some(ContextRole::Hub),
            (false, true) => Some(ContextRole::Leaf),
            (false, false) => None,
        }
    }

    /// Whether this transport can carry traffic for `role`.
    pub fn supports(&self, role: ContextRole) -> bool {
        match role {
            ContextRole::Hub => self.directed,
            ContextRole::Leaf => self.upstream,
        }
    }
}

/// A frame as delivered to a handler.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub origin: EndpointId,
    /// Addressed to this endpoint alone rather than broadcast.
    pub directed: bool,
    pub message: Message,
}

pub type Handler = Arc<dyn Fn(Inbound) + Send + Sync>;
pub type ClosedHandler = Arc<dyn Fn(EndpointId) + Send + Sync>;
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Errors that occur while a transport moves a frame.
///
/// These never reach engine callers; transports log them.
#[derive(Debug, Clone)]
pub enum Error {
    /// The addressed endpoint is gone or never existed.
    UnknownEndpoint(EndpointId),
    /// The channel behind this endpoint was closed.
    Closed,
    /// The frame could not cross the serialization boundary.
    Wire(isowire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEndpoint(id) => write!(f, "Unknown endpoint: {}", id),
            Self::Closed => write!(f, "Channel closed"),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<isowire::Error> for Error {
    fn from(e: isowire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A mechanism to move frames between contexts.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync + 'static {
    /// The identity other contexts see as this transport's origin.
    fn endpoint(&self) -> EndpointId;

    fn capabilities(&self) -> Capabilities;

    /// Sends a frame without waiting for delivery.
    ///
    /// # invariants
    /// - Must not block on the receiver.
    /// - Must not return or panic on delivery failure; log instead.
    fn send(&self, to: Address, message: &Message);

    /// Registers a handler for one frame kind.
    fn on_message(&self, kind: MessageKind, handler: Handler) -> Unsubscribe;

    /// Registers a handler told when another endpoint goes away.
    ///
    /// Transports that cannot observe this return `None`.
    fn on_endpoint_closed(&self, _handler: ClosedHandler) -> Option<Unsubscribe> {
        None
    }
}

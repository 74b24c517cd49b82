//! Mock transports for testing.
//!
//! These are used internally by the test suite and are not part of the public API.

use std::sync::Arc;
use std::sync::Mutex;

use isowire::Message;
use isowire::MessageKind;

use crate::channel::HandlerSet;
use crate::lock;
use crate::transport::Address;
use crate::transport::Capabilities;
use crate::transport::ClosedHandler;
use crate::transport::EndpointId;
use crate::transport::Handler;
use crate::transport::Inbound;
use crate::transport::Transport;
use crate::transport::Unsubscribe;

/// Records every outgoing frame and lets a test play the other side.
///
/// Injected frames skip the codec and reach handlers synchronously.
pub struct RecordingTransport {
    id: EndpointId,
    capabilities: Capabilities,
    handlers: Arc<HandlerSet>,
    sent: Mutex<Vec<(Address, Message)>>,
}

impl RecordingTransport {
    pub fn new(id: u64) -> Self {
        Self::with_capabilities(id, Capabilities { upstream: true, directed: true })
    }

    pub fn with_capabilities(id: u64, capabilities: Capabilities) -> Self {
        Self {
            id: EndpointId(id),
            capabilities,
            handlers: Arc::new(HandlerSet::default()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Delivers `message` as if `origin` had sent it to this endpoint.
    pub fn inject(&self, origin: u64, message: Message) {
        self.handlers.dispatch(Inbound {
            origin: EndpointId(origin),
            directed: true,
            message,
        });
    }

    /// Delivers `message` as if `origin` had broadcast it.
    pub fn inject_broadcast(&self, origin: u64, message: Message) {
        self.handlers.dispatch(Inbound {
            origin: EndpointId(origin),
            directed: false,
            message,
        });
    }

    /// Reports `peer` as gone.
    pub fn close_peer(&self, peer: u64) {
        self.handlers.notify_closed(EndpointId(peer));
    }

    /// Drains everything sent so far.
    pub fn take(&self) -> Vec<(Address, Message)> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Drains everything sent so far to `peer`.
    pub fn take_for(&self, peer: u64) -> Vec<Message> {
        let mut sent = lock(&self.sent);
        let (mine, rest): (Vec<_>, Vec<_>) = sent
            .drain(..)
            .partition(|(to, _)| *to == Address::Endpoint(EndpointId(peer)));
        *sent = rest;
        mine.into_iter().map(|(_, message)| message).collect()
    }
}

impl Transport for RecordingTransport {
    fn endpoint(&self) -> EndpointId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn send(&self, to: Address, message: &Message) {
        lock(&self.sent).push((to, message.clone()));
    }

    fn on_message(&self, kind: MessageKind, handler: Handler) -> Unsubscribe {
        self.handlers.register(kind, handler)
    }

    fn on_endpoint_closed(&self, handler: ClosedHandler) -> Option<Unsubscribe> {
        Some(self.handlers.register_closed(handler))
    }
}

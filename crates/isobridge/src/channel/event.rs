//! # Event channel
//!
//! Same-context dispatch: `send` runs the receivers' handlers before it
//! returns. Frames still go through the codec, so a handler never sees
//! anything a cross-context transport could not have carried.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use isowire::Message;
use isowire::MessageKind;
use tracing::warn;

use crate::channel::HandlerSet;
use crate::transport;
use crate::transport::Address;
use crate::transport::Capabilities;
use crate::transport::ClosedHandler;
use crate::transport::EndpointId;
use crate::transport::Handler;
use crate::transport::Inbound;
use crate::transport::Transport;
use crate::transport::Unsubscribe;

#[derive(Default)]
struct Bus {
    members: DashMap<EndpointId, Arc<HandlerSet>>,
    next_id: AtomicU64,
}

/// One member of a synchronous in-context bus.
///
/// `EventChannel::new` starts a bus, `attach` adds another member to it.
pub struct EventChannel {
    id: EndpointId,
    bus: Arc<Bus>,
    handlers: Arc<HandlerSet>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::join(Arc::new(Bus::default()))
    }

    /// Adds another member to this channel's bus.
    pub fn attach(&self) -> Self {
        Self::join(self.bus.clone())
    }

    fn join(bus: Arc<Bus>) -> Self {
        let id = EndpointId(bus.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handlers = Arc::new(HandlerSet::default());
        bus.members.insert(id, handlers.clone());
        Self { id, bus, handlers }
    }

    fn try_send(&self, to: Address, message: &Message) -> transport::Result<()> {
        let bytes = isowire::encode(message)?;

        let directed = matches!(to, Address::Endpoint(_));
        let targets: Vec<Arc<HandlerSet>> = match to {
            Address::Endpoint(target) => {
                let member = self
                    .bus
                    .members
                    .get(&target)
                    .map(|entry| entry.value().clone())
                    .ok_or(transport::Error::UnknownEndpoint(target))?;
                vec![member]
            }
            Address::Broadcast => self
                .bus
                .members
                .iter()
                .filter(|entry| *entry.key() != self.id)
                .map(|entry| entry.value().clone())
                .collect(),
        };

        for handlers in targets {
            let message = isowire::decode(&bytes)?;
            handlers.dispatch(Inbound {
                origin: self.id,
                directed,
                message,
            });
        }
        Ok(())
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EventChannel {
    fn endpoint(&self) -> EndpointId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { upstream: true, directed: true }
    }

    fn send(&self, to: Address, message: &Message) {
        if let Err(e) = self.try_send(to, message) {
            warn!(endpoint = %self.id, %to, kind = %message.kind(), "send failed: {}", e);
        }
    }

    fn on_message(&self, kind: MessageKind, handler: Handler) -> Unsubscribe {
        self.handlers.register(kind, handler)
    }

    fn on_endpoint_closed(&self, handler: ClosedHandler) -> Option<Unsubscribe> {
        Some(self.handlers.register_closed(handler))
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.bus.members.remove(&self.id);
        let survivors: Vec<Arc<HandlerSet>> = self
            .bus
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handlers in survivors {
            handlers.notify_closed(self.id);
        }
    }
}

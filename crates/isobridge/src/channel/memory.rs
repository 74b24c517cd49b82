//! # Memory network
//!
//! Endpoints in one process connected by unbounded tokio channels. Each
//! endpoint owns a pump task that decodes inbound bytes and hands frames to
//! its handlers, so delivery is asynchronous and ordered per sender/receiver
//! pair, just like a real message port.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use isowire::Message;
use isowire::MessageKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
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

struct Delivery {
    origin: EndpointId,
    directed: bool,
    bytes: Vec<u8>,
}

struct Slot {
    tx: mpsc::UnboundedSender<Delivery>,
    handlers: Arc<HandlerSet>,
}

#[derive(Default)]
struct Network {
    endpoints: DashMap<EndpointId, Slot>,
    next_id: AtomicU64,
}

/// A set of endpoints that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Network>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new endpoint and starts its pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn endpoint(&self, capabilities: Capabilities) -> MemoryEndpoint {
        let id = EndpointId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handlers = Arc::new(HandlerSet::default());

        self.inner.endpoints.insert(id, Slot { tx, handlers: handlers.clone() });

        let pump_handlers = handlers.clone();
        let pump = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match isowire::decode(&delivery.bytes) {
                    Ok(message) => pump_handlers.dispatch(Inbound {
                        origin: delivery.origin,
                        directed: delivery.directed,
                        message,
                    }),
                    Err(e) => warn!(endpoint = %id, origin = %delivery.origin, "dropping undecodable frame: {}", e),
                }
            }
            trace!(endpoint = %id, "pump stopped");
        });

        debug!(endpoint = %id, ?capabilities, "endpoint attached");
        MemoryEndpoint {
            id,
            capabilities,
            network: self.inner.clone(),
            handlers,
            pump,
        }
    }

    /// An endpoint that can address any other endpoint.
    pub fn hub(&self) -> MemoryEndpoint {
        self.endpoint(Capabilities { upstream: false, directed: true })
    }

    /// An endpoint that can only talk upstream and reply to its callers.
    pub fn leaf(&self) -> MemoryEndpoint {
        self.endpoint(Capabilities { upstream: true, directed: false })
    }

    /// Number of attached endpoints.
    pub fn len(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.endpoints.is_empty()
    }
}

/// One context's view of a `MemoryNetwork`.
///
/// Closing (or dropping) the endpoint detaches it and tells every remaining
/// endpoint that it is gone.
pub struct MemoryEndpoint {
    id: EndpointId,
    capabilities: Capabilities,
    network: Arc<Network>,
    handlers: Arc<HandlerSet>,
    pump: JoinHandle<()>,
}

impl MemoryEndpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Detaches from the network. Idempotent.
    pub fn close(&self) {
        if self.network.endpoints.remove(&self.id).is_none() {
            return;
        }
        self.pump.abort();
        debug!(endpoint = %self.id, "endpoint closed");

        let survivors: Vec<Arc<HandlerSet>> = self
            .network
            .endpoints
            .iter()
            .map(|entry| entry.value().handlers.clone())
            .collect();
        for handlers in survivors {
            handlers.notify_closed(self.id);
        }
    }

    fn try_send(&self, to: Address, message: &Message) -> transport::Result<()> {
        if !self.network.endpoints.contains_key(&self.id) {
            return Err(transport::Error::Closed);
        }
        let bytes = isowire::encode(message)?;

        match to {
            Address::Endpoint(target) => {
                let tx = self
                    .network
                    .endpoints
                    .get(&target)
                    .map(|slot| slot.tx.clone())
                    .ok_or(transport::Error::UnknownEndpoint(target))?;
                let delivery = Delivery {
                    origin: self.id,
                    directed: true,
                    bytes,
                };
                tx.send(delivery).map_err(|_| transport::Error::UnknownEndpoint(target))
            }
            Address::Broadcast => {
                let peers: Vec<mpsc::UnboundedSender<Delivery>> = self
                    .network
                    .endpoints
                    .iter()
                    .filter(|entry| *entry.key() != self.id)
                    .map(|entry| entry.value().tx.clone())
                    .collect();
                for tx in peers {
                    // a peer closing mid-broadcast is not our failure
                    let _ = tx.send(Delivery {
                        origin: self.id,
                        directed: false,
                        bytes: bytes.clone(),
                    });
                }
                Ok(())
            }
        }
    }
}

impl Transport for MemoryEndpoint {
    fn endpoint(&self) -> EndpointId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
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

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

//! # In-process channels
//!
//! Transports that keep every context inside one process while still pushing
//! each frame through the JSON codec, so nothing that would not survive a
//! real isolation boundary can sneak across.
//!
//! - `memory`: asynchronous delivery with broadcast and directed addressing.
//! - `event`: synchronous same-context dispatch.

pub mod event;
pub mod memory;

pub use event::EventChannel;
pub use memory::MemoryEndpoint;
pub use memory::MemoryNetwork;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use isowire::MessageKind;
use tracing::trace;

use crate::transport::ClosedHandler;
use crate::transport::EndpointId;
use crate::transport::Handler;
use crate::transport::Inbound;
use crate::transport::Unsubscribe;

/// Kind-routed handler registry shared by the channel implementations.
#[derive(Default)]
pub(crate) struct HandlerSet {
    next_id: AtomicU64,
    handlers: DashMap<MessageKind, Vec<(u64, Handler)>>,
    closed: DashMap<u64, ClosedHandler>,
}

impl HandlerSet {
    pub(crate) fn register(self: &Arc<Self>, kind: MessageKind, handler: Handler) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.entry(kind).or_default().push((id, handler));

        let set = Arc::downgrade(self);
        Box::new(move || {
            let Some(set) = set.upgrade() else { return };
            if let Some(mut list) = set.handlers.get_mut(&kind) {
                list.retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    pub(crate) fn register_closed(self: &Arc<Self>, handler: ClosedHandler) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.closed.insert(id, handler);

        let set = Arc::downgrade(self);
        Box::new(move || {
            if let Some(set) = set.upgrade() {
                set.closed.remove(&id);
            }
        })
    }

    /// Hands a frame to every handler of its kind.
    ///
    /// The handler list is cloned out first: a handler may register or
    /// unregister listeners while it runs.
    pub(crate) fn dispatch(&self, inbound: Inbound) {
        let kind = inbound.message.kind();
        let handlers: Vec<Handler> = match self.handlers.get(&kind) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => Vec::new(),
        };

        if handlers.is_empty() {
            trace!(%kind, origin = %inbound.origin, "no handler for frame");
            return;
        }

        for handler in handlers {
            handler(inbound.clone());
        }
    }

    pub(crate) fn notify_closed(&self, endpoint: EndpointId) {
        let handlers: Vec<ClosedHandler> = self.closed.iter().map(|entry| entry.value().clone()).collect();
        for handler in handlers {
            handler(endpoint);
        }
    }
}

//! # Service Host
//!
//! Registers services under their identifier keys and answers requests
//! addressed to this context's role.
//!
//! ## Invariants
//!
//! - Exactly one `call-response` per `call` received; dispatch never throws
//!   across the wire.
//! - Unknown service, unknown method, method error and method panic all
//!   become an `error` payload with a defined `message`.
//! - The response goes to the endpoint the request came from.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use isowire::ErrorPayload;
use isowire::Identifier;
use isowire::Message;
use isowire::MessageKind;
use isowire::Pong;
use isowire::Request;
use isowire::Response;
use isowire::Role;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use crate::disposable::Disposable;
use crate::service;
use crate::service::CallContext;
use crate::service::Service;
use crate::transport::Address;
use crate::transport::EndpointId;
use crate::transport::Inbound;
use crate::transport::Transport;

struct Registration {
    role: Option<Role>,
    service: Arc<dyn Service>,
}

/// Key → implementation, plus the dispatch rules. No transport attached.
#[derive(Default)]
pub struct ServiceTable {
    services: DashMap<String, Registration>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any previous one under the same key.
    pub fn insert(&self, identifier: &Identifier, service: Arc<dyn Service>) {
        let replaced = self.services.insert(
            identifier.key.to_string(),
            Registration { role: identifier.role, service },
        );
        if replaced.is_some() {
            debug!(service = identifier.key, "replaced registered service");
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.services.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Whether a request for `service` targeting `to` is handled here.
    ///
    /// A registration without a role serves any target.
    pub fn serves(&self, service: &str, to: Role) -> bool {
        self.services
            .get(service)
            .is_some_and(|registration| registration.role.is_none_or(|role| role == to))
    }

    /// Runs one request against the table.
    pub async fn dispatch(&self, request: &Request, origin: EndpointId) -> Result<Value, ErrorPayload> {
        let Some(service) = self.services.get(&request.service).map(|r| r.service.clone()) else {
            return Err(ErrorPayload::unknown_service(&request.service));
        };
        if !service.has_method(&request.method) {
            return Err(ErrorPayload::unknown_method(&request.method));
        }

        let ctx = CallContext {
            request_id: request.id.clone(),
            origin,
            from: request.from,
        };

        // panics before the first await and errors after it share one path
        let invocation = service.invoke(&request.method, request.args.clone(), ctx);
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(service::error_payload(err)),
            Err(panic) => Err(service::panic_payload(panic)),
        }
    }

    /// Dispatches and wraps the outcome in a response frame.
    pub async fn respond(&self, request: &Request, origin: EndpointId, from: Role) -> Response {
        match self.dispatch(request, origin).await {
            Ok(value) => Response::ok(request, from, value),
            Err(error) => {
                debug!(id = %request.id, service = %request.service, method = %request.method, name = %error.name, "call failed: {}", error.message);
                Response::err(request, from, error)
            }
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    role: Role,
    table: ServiceTable,
    disposable: Disposable,
}

impl Shared {
    fn on_call(self: Arc<Self>, inbound: Inbound) {
        let Message::Call(request) = inbound.message else { return };
        if request.to != self.role {
            trace!(id = %request.id, to = %request.to, "call addressed to another role");
            return;
        }

        let origin = inbound.origin;
        tokio::spawn(async move {
            let response = self.table.respond(&request, origin, self.role).await;
            self.transport.send(Address::Endpoint(origin), &Message::CallResponse(response));
        });
    }

    fn on_ping(&self, inbound: Inbound) {
        let Message::Ping(ping) = inbound.message else { return };
        if ping.to != self.role {
            return;
        }
        trace!(id = %ping.id, service = %ping.service, origin = %inbound.origin, "answering ping");
        self.transport.send(
            Address::Endpoint(inbound.origin),
            &Message::Pong(Pong { id: ping.id, from: self.role }),
        );
    }
}

/// A service table bound to a transport, answering for one role.
#[derive(Clone)]
pub struct Host {
    shared: Arc<Shared>,
}

impl Host {
    pub fn new(transport: Arc<dyn Transport>, role: Role) -> Self {
        let shared = Arc::new(Shared {
            transport,
            role,
            table: ServiceTable::new(),
            disposable: Disposable::new(),
        });

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Call, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_call(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Ping, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_ping(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        debug!(endpoint = %shared.transport.endpoint(), %role, "host listening");
        Self { shared }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn register(&self, identifier: &Identifier, service: impl Service) {
        self.register_arc(identifier, Arc::new(service));
    }

    pub fn register_arc(&self, identifier: &Identifier, service: Arc<dyn Service>) {
        debug!(service = identifier.key, role = %self.shared.role, "registering service");
        self.shared.table.insert(identifier, service);
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.shared.table.remove(key)
    }

    pub fn table(&self) -> &ServiceTable {
        &self.shared.table
    }

    /// Stops accepting requests. Requests already dispatched still answer.
    pub fn dispose(&self) {
        self.shared.disposable.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposable.is_disposed()
    }
}

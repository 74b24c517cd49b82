//! # Router
//!
//! One component per context that hosts services, calls other contexts and,
//! on a hub, relays calls between contexts that cannot reach each other.
//!
//! ## Decision per inbound frame
//!
//! - `ping`: answered at once with `pong`. The service table is not
//!   consulted.
//! - `call` for a locally registered service: dispatched here; the response
//!   goes back to the origin endpoint.
//! - any other `call`: a hub relays it under a fresh id to the directed
//!   route configured for its target role; a leaf drops it. A hub never
//!   re-broadcasts: a broadcast call already reached every context that
//!   could serve it. A hub answers `Unknown service` only for calls sent to
//!   it directly that it cannot forward anywhere.
//! - `call-response` for a relayed id: rewritten to the original id and sent
//!   to the original origin.
//!
//! ## Invariants
//!
//! - A relay entry lives until its response passes through or the call
//!   timeout elapses, whichever is first.
//! - `Router::call` never touches the transport for a local service.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use isowire::ErrorPayload;
use isowire::FaultKind;
use isowire::Identifier;
use isowire::Message;
use isowire::MessageKind;
use isowire::Pong;
use isowire::Request;
use isowire::Role;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::client;
use crate::client::Client;
use crate::config::ContextRole;
use crate::config::RouterConfig;
use crate::disposable::Disposable;
use crate::host::ServiceTable;
use crate::proxy::Caller;
use crate::proxy::ServiceProxy;
use crate::service::Service;
use crate::transport::Address;
use crate::transport::Capabilities;
use crate::transport::EndpointId;
use crate::transport::Inbound;
use crate::transport::Transport;

/// Errors that occur while setting up a router.
#[derive(Debug, Clone)]
pub enum Error {
    /// The transport cannot carry traffic for the configured role.
    TransportUnavailable {
        context: ContextRole,
        capabilities: Capabilities,
    },
}

impl Error {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::TransportUnavailable { .. } => FaultKind::TransportUnavailable,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportUnavailable { context, capabilities } => {
                write!(f, "Transport unavailable for {} context: {:?}", context, capabilities)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

struct Relay {
    origin: EndpointId,
    id: String,
}

struct RouterShared {
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    table: ServiceTable,
    relays: DashMap<String, Relay>,
    nonce: String,
    seq: AtomicU64,
    disposable: Disposable,
}

impl RouterShared {
    fn role(&self) -> Role {
        self.config.role()
    }

    fn next_id(&self, tag: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}{}", self.nonce, tag, seq)
    }

    fn on_ping(&self, inbound: Inbound) {
        let Message::Ping(ping) = inbound.message else { return };
        trace!(id = %ping.id, service = %ping.service, origin = %inbound.origin, "answering ping");
        self.transport.send(
            Address::Endpoint(inbound.origin),
            &Message::Pong(Pong { id: ping.id, from: self.role() }),
        );
    }

    fn on_call(self: Arc<Self>, inbound: Inbound) {
        let Message::Call(request) = inbound.message else { return };
        let origin = inbound.origin;
        let directed = inbound.directed;

        if self.table.serves(&request.service, request.to) {
            tokio::spawn(async move {
                let response = self.table.respond(&request, origin, self.role()).await;
                self.transport.send(Address::Endpoint(origin), &Message::CallResponse(response));
            });
            return;
        }

        let context = self.config.context;
        match context {
            ContextRole::Leaf => {
                debug!(id = %request.id, service = %request.service, to = %request.to, "leaf dropping unserved call");
            }
            ContextRole::Hub => self.relay(request, origin, directed),
        }
    }

    fn relay(self: Arc<Self>, mut request: Request, origin: EndpointId, directed: bool) {
        let route = match self.config.client.route_for(request.to) {
            Address::Endpoint(next) if request.to != self.role() && next != origin => next,
            _ if directed => {
                // sent here on purpose and there is no next hop
                let payload = ErrorPayload::unknown_service(&request.service);
                let response = isowire::Response::err(&request, self.role(), payload);
                self.transport.send(Address::Endpoint(origin), &Message::CallResponse(response));
                return;
            }
            _ => {
                debug!(id = %request.id, service = %request.service, to = %request.to, %origin, "no directed route, dropping broadcast call");
                return;
            }
        };
        let route = Address::Endpoint(route);

        let relayed = self.next_id("r");
        let original = std::mem::replace(&mut request.id, relayed.clone());
        debug!(id = %original, relayed = %relayed, %origin, %route, service = %request.service, "relaying call");
        self.relays.insert(relayed.clone(), Relay { origin, id: original });
        self.transport.send(route, &Message::Call(request));

        if let Some(after) = self.config.client.call_timeout() {
            let weak = Arc::downgrade(&self);
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let Some(shared) = weak.upgrade() else { return };
                if let Some((_, relay)) = shared.relays.remove(&relayed) {
                    debug!(id = %relay.id, origin = %relay.origin, ?after, "relay expired");
                }
            });
        }
    }

    fn on_response(&self, inbound: Inbound) {
        let Message::CallResponse(mut response) = inbound.message else { return };
        let Some((_, relay)) = self.relays.remove(&response.id) else { return };
        trace!(relayed = %response.id, id = %relay.id, origin = %relay.origin, "relaying response");
        response.id = relay.id;
        self.transport.send(Address::Endpoint(relay.origin), &Message::CallResponse(response));
    }
}

/// Hosts, calls and relays for one context.
#[derive(Clone)]
pub struct Router {
    shared: Arc<RouterShared>,
    client: Client,
}

impl Router {
    /// Binds a router to `transport`.
    ///
    /// Fails with [`Error::TransportUnavailable`] when the transport lacks
    /// what the configured context role needs.
    pub fn new(transport: Arc<dyn Transport>, config: RouterConfig) -> Result<Self> {
        let capabilities = transport.capabilities();
        if !capabilities.supports(config.context) {
            return Err(Error::TransportUnavailable {
                context: config.context,
                capabilities,
            });
        }

        let client = Client::new(transport.clone(), config.client.clone());
        let shared = Arc::new(RouterShared {
            transport,
            config,
            table: ServiceTable::new(),
            relays: DashMap::new(),
            nonce: format!("{:08x}", rand::random::<u32>()),
            seq: AtomicU64::new(0),
            disposable: Disposable::new(),
        });

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Ping, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_ping(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Call, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_call(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::CallResponse, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_response(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        let inner = client.clone();
        shared.disposable.add(move || inner.dispose());

        info!(
            endpoint = %shared.transport.endpoint(),
            context = %shared.config.context,
            role = %shared.role(),
            "router ready"
        );
        Ok(Self { shared, client })
    }

    pub fn context(&self) -> ContextRole {
        self.shared.config.context
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    /// The client used for calls that leave this context.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Number of relayed calls still waiting for a response.
    pub fn relays(&self) -> usize {
        self.shared.relays.len()
    }

    pub fn register(&self, identifier: &Identifier, service: impl Service) {
        self.register_arc(identifier, Arc::new(service));
    }

    pub fn register_arc(&self, identifier: &Identifier, service: Arc<dyn Service>) {
        debug!(service = identifier.key, role = %self.role(), "registering service");
        self.shared.table.insert(identifier, service);
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.shared.table.remove(key)
    }

    /// Calls a service, locally when it is registered here.
    pub async fn call(&self, service: &str, method: &str, to: Role, args: Vec<Value>) -> client::Result<Value> {
        if !self.shared.table.serves(service, to) {
            return self.client.call(service, method, to, args).await;
        }

        let request = Request {
            id: self.shared.next_id("l"),
            service: service.to_string(),
            method: method.to_string(),
            args,
            to,
            from: self.role(),
        };
        trace!(id = %request.id, service, method, "short-circuit call");
        self.shared
            .table
            .dispatch(&request, self.shared.transport.endpoint())
            .await
            .map_err(|payload| client::Error::Remote(payload.into()))
    }

    /// Typed form of [`Router::call`].
    pub async fn invoke<A, R>(&self, service: &str, method: &str, to: Role, args: &A) -> client::Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = isowire::to_args(args)?;
        let value = self.call(service, method, to, args).await?;
        Ok(isowire::from_value(value)?)
    }

    /// Builds a proxy for the service.
    ///
    /// A local service needs no handshake; a remote one must answer a ping
    /// first.
    pub async fn create_service(&self, identifier: &Identifier) -> client::Result<ServiceProxy> {
        let to = identifier.role.unwrap_or(self.shared.config.client.default_target);
        if !self.shared.table.serves(identifier.key, to) {
            self.client.ready(identifier.key, to).await?;
        }
        Ok(ServiceProxy::new(Arc::new(self.clone()), *identifier, to))
    }

    /// Stops answering and relaying, and disposes the inner client.
    pub fn dispose(&self) {
        self.shared.disposable.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposable.is_disposed()
    }
}

#[async_trait::async_trait]
impl Caller for Router {
    async fn forward(&self, service: &str, method: &str, to: Role, args: Vec<Value>) -> client::Result<Value> {
        self.call(service, method, to, args).await
    }
}

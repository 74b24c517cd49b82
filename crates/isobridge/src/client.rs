//! # Request/Response Client
//!
//! Issues calls to services in other contexts and settles each one when the
//! matching `call-response` arrives.
//!
//! ## Invariants
//!
//! - Every request id is unique for the lifetime of the client (random
//!   nonce plus a monotonic sequence).
//! - The pending entry exists before the request is sent, and is gone once
//!   the call settles, times out, or its future is dropped.
//! - A response whose id has no pending entry (unknown or duplicate) is
//!   dropped and logged.
//! - `create_service` never sends a `call` before the readiness handshake
//!   has seen a `pong`.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use isowire::ErrorPayload;
use isowire::FaultKind;
use isowire::Identifier;
use isowire::Message;
use isowire::MessageKind;
use isowire::Ping;
use isowire::Request;
use isowire::Role;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::trace;

use crate::config::ClientConfig;
use crate::disposable::Disposable;
use crate::proxy::ServiceProxy;
use crate::transport::Inbound;
use crate::transport::Transport;

/// An error rebuilt from a `call-response` error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteError {
    /// The protocol fault this error names, if it is one.
    pub fn kind(&self) -> Option<FaultKind> {
        FaultKind::from_name(&self.name)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorPayload> for RemoteError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            name: payload.name,
            message: payload.message,
            stack: payload.stack,
        }
    }
}

/// Errors that occur while calling a remote service.
#[derive(Debug, Clone)]
pub enum Error {
    /// The remote side answered with an error.
    Remote(RemoteError),
    /// The readiness handshake saw no `pong` in time.
    NotReady { service: String, waited: Duration },
    /// No response arrived within the call timeout.
    Timeout {
        service: String,
        method: String,
        after: Duration,
    },
    /// The proxy's descriptor does not list the method.
    UnknownMethod { service: String, method: String },
    /// Arguments or result could not cross the wire.
    Wire(isowire::Error),
    /// The client was disposed before the call was made.
    Disposed,
    /// The pending entry vanished without a response.
    Dropped,
}

impl Error {
    /// The protocol fault this error corresponds to, if any.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Remote(remote) => remote.kind(),
            Self::NotReady { .. } => Some(FaultKind::ReadinessTimeout),
            Self::UnknownMethod { .. } => Some(FaultKind::UnknownMethod),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "{}", e),
            Self::NotReady { service, waited } => {
                write!(f, "Service not ready: {} (waited {:?})", service, waited)
            }
            Self::Timeout { service, method, after } => {
                write!(f, "Call timed out after {:?}: {}.{}", after, service, method)
            }
            Self::UnknownMethod { method, .. } => write!(f, "Unknown method: {}", method),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Disposed => write!(f, "Client disposed"),
            Self::Dropped => write!(f, "Call dropped without a response"),
        }
    }
}

impl std::error::Error for Error {}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<isowire::Error> for Error {
    fn from(e: isowire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Continuation = oneshot::Sender<std::result::Result<Value, ErrorPayload>>;

struct Shared {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    nonce: String,
    seq: AtomicU64,
    pending: DashMap<String, Continuation>,
    pongs: DashMap<String, oneshot::Sender<()>>,
    disposable: Disposable,
}

impl Shared {
    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.nonce, seq)
    }

    fn on_response(&self, inbound: Inbound) {
        let Message::CallResponse(response) = inbound.message else { return };
        match self.pending.remove(&response.id) {
            Some((_, tx)) => {
                // the caller may have given up already
                let _ = tx.send(response.into_outcome());
            }
            None => debug!(id = %response.id, origin = %inbound.origin, "dropping unmatched response"),
        }
    }

    fn on_pong(&self, inbound: Inbound) {
        let Message::Pong(pong) = inbound.message else { return };
        match self.pongs.remove(&pong.id) {
            Some((_, tx)) => {
                let _ = tx.send(());
            }
            None => trace!(id = %pong.id, "dropping unmatched pong"),
        }
    }
}

/// Removes a pending entry when the call future goes away, whatever the
/// reason.
struct PendingGuard<'a> {
    table: &'a DashMap<String, Continuation>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Issues requests over a transport and correlates their responses.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let nonce = format!("{:08x}", rand::random::<u32>());
        let shared = Arc::new(Shared {
            transport,
            config,
            nonce,
            seq: AtomicU64::new(0),
            pending: DashMap::new(),
            pongs: DashMap::new(),
            disposable: Disposable::new(),
        });

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared
            .transport
            .on_message(MessageKind::CallResponse, listener(weak, Shared::on_response));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Pong, listener(weak, Shared::on_pong));
        shared.disposable.add(unsubscribe);

        debug!(endpoint = %shared.transport.endpoint(), nonce = %shared.nonce, "client ready");
        Self { shared }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Number of calls still waiting for a response.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    /// Calls `service.method` in the context serving `to`.
    pub async fn call(&self, service: &str, method: &str, to: Role, args: Vec<Value>) -> Result<Value> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let shared = &self.shared;
        let id = shared.next_id();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            table: &shared.pending,
            id: id.clone(),
        };

        let address = shared.config.route_for(to);
        trace!(%id, service, method, %to, %address, "sending call");
        let request = Request {
            id,
            service: service.to_string(),
            method: method.to_string(),
            args,
            to,
            from: shared.config.role,
        };
        shared.transport.send(address, &Message::Call(request));

        let outcome = match shared.config.call_timeout() {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(service, method, ?after, "call timed out");
                    return Err(Error::Timeout {
                        service: service.to_string(),
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(Error::Remote(payload.into())),
            Err(_) => Err(Error::Dropped),
        }
    }

    /// Typed form of [`Client::call`].
    pub async fn invoke<A, R>(&self, service: &str, method: &str, to: Role, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = isowire::to_args(args)?;
        let value = self.call(service, method, to, args).await?;
        Ok(isowire::from_value(value)?)
    }

    /// Pings `service` until the context serving `to` answers.
    ///
    /// Re-sends on the configured interval and gives up after the configured
    /// timeout with [`Error::NotReady`].
    pub async fn ready(&self, service: &str, to: Role) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let shared = &self.shared;
        let id = shared.next_id();
        let (tx, mut rx) = oneshot::channel();
        shared.pongs.insert(id.clone(), tx);

        let ping = Message::Ping(Ping {
            id: id.clone(),
            service: service.to_string(),
            to,
            from: shared.config.role,
        });
        let address = shared.config.route_for(to);
        let waited = shared.config.ready_timeout();

        let mut ticker = tokio::time::interval(shared.config.ready_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(waited);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                answered = &mut rx => break answered.map_err(|_| Error::Dropped),
                _ = &mut deadline => break Err(Error::NotReady { service: service.to_string(), waited }),
                _ = ticker.tick() => {
                    trace!(%id, service, %address, "ping");
                    shared.transport.send(address, &ping);
                }
            }
        };

        shared.pongs.remove(&id);
        match &outcome {
            Ok(()) => debug!(service, %to, "service ready"),
            Err(e) => debug!(service, %to, "handshake failed: {}", e),
        }
        outcome
    }

    /// Waits for the service to answer, then builds its proxy.
    ///
    /// The target is the identifier's role, or the configured default.
    pub async fn create_service(&self, identifier: &Identifier) -> Result<ServiceProxy> {
        let to = identifier.role.unwrap_or(self.shared.config.default_target);
        self.ready(identifier.key, to).await?;
        Ok(ServiceProxy::new(Arc::new(self.clone()), *identifier, to))
    }

    /// Unregisters the client's listeners. Calls already in flight are left
    /// alone.
    pub fn dispose(&self) {
        self.shared.disposable.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposable.is_disposed()
    }
}

fn listener(weak: Weak<Shared>, f: fn(&Shared, Inbound)) -> crate::transport::Handler {
    Arc::new(move |inbound: Inbound| {
        if let Some(shared) = weak.upgrade() {
            f(&shared, inbound);
        }
    })
}

#[async_trait::async_trait]
impl crate::proxy::Caller for Client {
    async fn forward(&self, service: &str, method: &str, to: Role, args: Vec<Value>) -> Result<Value> {
        self.call(service, method, to, args).await
    }
}

//! # IsoBridge
//!
//! The protocol engine that lets isolated contexts call each other and
//! watch each other's state, on top of any transport that can move
//! `isowire` frames.
//!
//! ## Architecture
//!
//! - `transport`: the narrow seam to the outside world, plus in-process
//!   implementations under `channel`.
//! - `client` / `proxy`: outbound calls, response correlation, readiness
//!   handshake, per-service call stubs.
//! - `service` / `host`: service tables and request dispatch.
//! - `hub` / `subscriber`: subjects owned by one context and watched by others.
//! - `router`: one component that hosts, calls and relays depending on the
//!   context's structural role.
//! - `disposable`: teardown shared by everything above.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub mod channel;
pub mod client;
pub mod config;
pub mod disposable;
pub mod host;
pub mod hub;
pub mod proxy;
pub mod router;
pub mod service;
pub mod subscriber;
pub mod transport;

pub use channel::EventChannel;
pub use channel::MemoryEndpoint;
pub use channel::MemoryNetwork;
pub use client::Client;
pub use client::RemoteError;
pub use config::ClientConfig;
pub use config::ContextRole;
pub use config::RouterConfig;
pub use config::SubscriberConfig;
pub use disposable::Disposable;
pub use host::Host;
pub use host::ServiceTable;
pub use hub::Subject;
pub use hub::SubjectManager;
pub use proxy::Caller;
pub use proxy::ServiceProxy;
pub use router::Router;
pub use service::CallContext;
pub use service::Fault;
pub use service::Service;
pub use service::ServiceBuilder;
pub use subscriber::SubjectClient;
pub use subscriber::SubjectStream;
pub use transport::Address;
pub use transport::Capabilities;
pub use transport::EndpointId;
pub use transport::Transport;

#[cfg(test)]
mod mock_transport;

#[cfg(test)]
mod tests;

/// Locks a std mutex, recovering the data if a holder panicked.
///
/// Every table guarded this way stays structurally valid between statements,
/// so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

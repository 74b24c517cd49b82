//! # Configuration
//!
//! Plain structs with defaults and `with_*` setters. Every struct also
//! deserializes from JSON so a host application can ship its wiring as data;
//! durations are spelled in milliseconds there.

use std::collections::HashMap;
use std::time::Duration;

use isowire::Role;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::transport::Address;

#[derive(Debug, Clone)]
pub enum Error {
    Parse(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::Parse(e.to_string()))
}

/// Structural position of a context.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    /// Can address other contexts and relays between them.
    Hub,
    /// Talks upstream only.
    Leaf,
}

impl std::fmt::Display for ContextRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub => f.write_str("hub"),
            Self::Leaf => f.write_str("leaf"),
        }
    }
}

/// Settings for the calling side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The role this context reports as `from`.
    pub role: Role,
    /// Target for identifiers that declare no role.
    pub default_target: Role,
    /// Where to send frames for a given target role.
    pub routes: HashMap<Role, Address>,
    /// Where to send frames for roles without a route.
    pub fallback: Address,
    /// `None` waits forever.
    pub call_timeout_ms: Option<u64>,
    pub ready_interval_ms: u64,
    pub ready_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            role: Role::Content,
            default_target: Role::Background,
            routes: HashMap::new(),
            fallback: Address::Broadcast,
            call_timeout_ms: Some(30_000),
            ready_interval_ms: 100,
            ready_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn new(role: Role) -> Self {
        Self { role, ..Self::default() }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        from_json(json)
    }

    pub fn with_default_target(mut self, role: Role) -> Self {
        self.default_target = role;
        self
    }

    pub fn with_route(mut self, role: Role, address: Address) -> Self {
        self.routes.insert(role, address);
        self
    }

    pub fn with_fallback(mut self, address: Address) -> Self {
        self.fallback = address;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_readiness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ready_interval_ms = interval.as_millis() as u64;
        self.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn route_for(&self, role: Role) -> Address {
        self.routes.get(&role).copied().unwrap_or(self.fallback)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn ready_interval(&self) -> Duration {
        // an interval of zero would spin
        Duration::from_millis(self.ready_interval_ms.max(1))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Settings for a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub context: ContextRole,
    #[serde(default)]
    pub client: ClientConfig,
}

impl RouterConfig {
    pub fn new(context: ContextRole, client: ClientConfig) -> Self {
        Self { context, client }
    }

    pub fn hub(role: Role) -> Self {
        Self::new(ContextRole::Hub, ClientConfig::new(role))
    }

    pub fn leaf(role: Role) -> Self {
        Self::new(ContextRole::Leaf, ClientConfig::new(role))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        from_json(json)
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// The role services registered on this router answer for.
    pub fn role(&self) -> Role {
        self.client.role
    }
}

/// Settings for the watching side of a subject hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Where `subscribe` / `unsubscribe` frames go.
    pub hub: Address,
}

impl SubscriberConfig {
    pub fn new(hub: Address) -> Self {
        Self { hub }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        from_json(json)
    }
}

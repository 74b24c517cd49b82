//! # Service Proxy
//!
//! A caller-side handle for one remote service. The service's identifier
//! lists its methods; the proxy builds one forwarding stub per name, and
//! every stub hands its arguments to the underlying caller under its own
//! method name.
//!
//! ## Invariants
//!
//! - A stub never changes the arguments it is given.
//! - Asking for a method the identifier does not list fails locally with the
//!   same `Unknown method` identity a host would produce. Nothing is sent.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use isowire::Identifier;
use isowire::Role;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::Error;
use crate::client::Result;

/// Anything that can move a call to the context serving `to`.
///
/// Implemented by [`crate::Client`] (always remote) and [`crate::Router`]
/// (local first).
#[async_trait::async_trait]
pub trait Caller: Send + Sync + 'static {
    async fn forward(&self, service: &str, method: &str, to: Role, args: Vec<Value>) -> Result<Value>;
}

type Forward = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One method of a remote service.
#[derive(Clone)]
pub struct MethodStub {
    name: &'static str,
    forward: Forward,
}

impl MethodStub {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        (self.forward)(args)
    }
}

impl std::fmt::Debug for MethodStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodStub").field("name", &self.name).finish()
    }
}

#[derive(Clone)]
pub struct ServiceProxy {
    identifier: Identifier,
    to: Role,
    stubs: HashMap<&'static str, MethodStub>,
}

impl ServiceProxy {
    pub fn new(caller: Arc<dyn Caller>, identifier: Identifier, to: Role) -> Self {
        let stubs = identifier
            .methods
            .iter()
            .map(|&name| {
                let caller = caller.clone();
                let service = identifier.key;
                let forward: Forward = Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, Result<Value>> {
                    let caller = caller.clone();
                    Box::pin(async move { caller.forward(service, name, to, args).await })
                });
                (name, MethodStub { name, forward })
            })
            .collect();

        Self { identifier, to, stubs }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// The role this proxy's calls are addressed to.
    pub fn target(&self) -> Role {
        self.to
    }

    pub fn method(&self, name: &str) -> Result<&MethodStub> {
        self.stubs.get(name).ok_or_else(|| Error::UnknownMethod {
            service: self.identifier.key.to_string(),
            method: name.to_string(),
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.identifier.methods.iter().copied()
    }

    /// Calls `method` with a serializable argument tuple and decodes the
    /// result.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let stub = self.method(method)?;
        let args = isowire::to_args(args)?;
        let value = stub.call(args).await?;
        Ok(isowire::from_value(value)?)
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.identifier.key)
            .field("to", &self.to)
            .field("methods", &self.identifier.methods)
            .finish()
    }
}

//! # Services
//!
//! What a host dispatches to. A service is any `Service` implementation; the
//! usual way to build one is a method table:
//!
//! ```
//! use isobridge::ServiceBuilder;
//!
//! let math = ServiceBuilder::new()
//!     .method_sync("add", |(a, b): (i64, i64), _ctx| Ok(a + b))
//!     .method("slow_double", |(x,): (i64,), _ctx| async move { anyhow::Ok(x * 2) })
//!     .build();
//! # let _ = math;
//! ```
//!
//! Methods take their declared arguments and a `CallContext` describing the
//! caller as two separate inputs, and return `anyhow::Result`. Any error
//! converts into the wire payload; a `Fault` lets a method choose the
//! payload's `name`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use isowire::ErrorPayload;
use isowire::FaultKind;
use isowire::Role;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::transport::EndpointId;

/// Who is calling, as seen by a method implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub request_id: String,
    /// The endpoint the request arrived from.
    pub origin: EndpointId,
    /// The role the caller declared.
    pub from: Role,
}

/// A method failure with an explicit wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into(), stack: None }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<Fault> for ErrorPayload {
    fn from(fault: Fault) -> Self {
        ErrorPayload { message: fault.message, name: fault.name, stack: fault.stack }
    }
}

/// A named set of callable methods.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// Whether `method` belongs to this service.
    fn has_method(&self, method: &str) -> bool;

    /// Runs a method that `has_method` accepted.
    async fn invoke(&self, method: &str, args: Vec<Value>, ctx: CallContext) -> anyhow::Result<Value>;
}

type MethodFn = Arc<dyn Fn(Vec<Value>, CallContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Builds a `MethodTable` one method at a time.
#[derive(Default)]
pub struct ServiceBuilder {
    methods: HashMap<String, MethodFn>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an async method. Arguments arrive as a tuple decoded from the
    /// positional argument list.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let method_name = name.to_string();

        let method: MethodFn = Arc::new(move |args, ctx| {
            let f = f.clone();
            let method_name = method_name.clone();
            Box::pin(async move {
                let args: A = isowire::from_args(args)
                    .map_err(|e| Fault::new("InvalidArguments", format!("{}: {}", method_name, e)))?;
                let result = f(args, ctx).await?;
                Ok(isowire::codec::to_value(&result)?)
            })
        });

        self.methods.insert(name.to_string(), method);
        self
    }

    /// Adds a method that finishes without awaiting anything.
    pub fn method_sync<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CallContext) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.method(name, move |args: A, ctx| {
            let f = f.clone();
            async move { f(args, ctx) }
        })
    }

    pub fn build(self) -> MethodTable {
        MethodTable { methods: self.methods }
    }
}

/// A service made of independently registered methods.
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait::async_trait]
impl Service for MethodTable {
    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    async fn invoke(&self, method: &str, args: Vec<Value>, ctx: CallContext) -> anyhow::Result<Value> {
        let Some(f) = self.methods.get(method) else {
            return Err(Fault::from(ErrorPayload::unknown_method(method)).into());
        };
        f(args, ctx).await
    }
}

impl From<ErrorPayload> for Fault {
    fn from(payload: ErrorPayload) -> Self {
        Self { name: payload.name, message: payload.message, stack: payload.stack }
    }
}

/// Turns a method error into its wire form.
///
/// A `Fault` keeps its own name; anything else is a `HandlerFailure` whose
/// stack is the rendered error chain.
pub(crate) fn error_payload(err: anyhow::Error) -> ErrorPayload {
    if let Some(fault) = err.downcast_ref::<Fault>() {
        return fault.clone().into();
    }
    let stack = format!("{:?}", err);
    ErrorPayload::new(FaultKind::HandlerFailure.as_str(), err.to_string()).with_stack(stack)
}

/// Turns a panic payload into its wire form. `message` is always defined.
pub(crate) fn panic_payload(panic: Box<dyn Any + Send>) -> ErrorPayload {
    let message = if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "method panicked with a non-string payload".to_string()
    };
    ErrorPayload::new(FaultKind::HandlerFailure.as_str(), format!("panicked: {}", message))
}

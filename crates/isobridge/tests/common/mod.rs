//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use isobridge::ServiceBuilder;
use isobridge::service::Fault;
use isobridge::service::MethodTable;
use isowire::Identifier;
use isowire::Role;
use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

pub const IMATH: Identifier = Identifier::new("IMath", Role::Background).with_methods(&["add", "divide", "explode"]);
pub const ICOUNTER: Identifier = Identifier::new("ICounter", Role::Background);
pub const IPAGE: Identifier = Identifier::new("IPage", Role::Content).with_methods(&["title"]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
}

/// Installs a test subscriber once. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn math() -> MethodTable {
    ServiceBuilder::new()
        .method_sync("add", |(a, b): (i64, i64), _ctx| Ok(a + b))
        .method("divide", |(a, b): (i64, i64), _ctx| async move {
            if b == 0 {
                return Err(anyhow::Error::new(Fault::new("RangeError", "division by zero")));
            }
            anyhow::Ok(a / b)
        })
        .method_sync("explode", |(): (), _ctx| -> anyhow::Result<()> { panic!("kaboom") })
        .build()
}

pub fn page(title: &'static str) -> MethodTable {
    ServiceBuilder::new()
        .method_sync("title", move |(): (), _ctx| Ok(title.to_string()))
        .build()
}

/// Fails the test if `future` takes longer than two seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

/// Polls `condition` until it holds, for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

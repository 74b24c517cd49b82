//! # Disposable
//!
//! The one resource-lifecycle primitive: a list of teardown callbacks that
//! runs once. Ownership is single and explicit; nothing here counts
//! references.

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::lock;

type Teardown = Box<dyn FnOnce() + Send>;

/// Composable teardown.
///
/// # Invariants
/// - Callbacks run in registration order, each exactly once.
/// - `dispose` is idempotent.
/// - A callback added after disposal runs immediately instead of leaking.
#[derive(Default)]
pub struct Disposable {
    disposed: AtomicBool,
    teardowns: Mutex<Vec<Teardown>>,
}

impl Disposable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a teardown callback.
    pub fn add(&self, teardown: impl FnOnce() + Send + 'static) {
        let mut teardowns = lock(&self.teardowns);
        if self.disposed.load(Ordering::Acquire) {
            drop(teardowns);
            teardown();
            return;
        }
        teardowns.push(Box::new(teardown));
    }

    /// Runs every registered callback the first time it is called.
    pub fn dispose(&self) {
        let teardowns = {
            let mut teardowns = lock(&self.teardowns);
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *teardowns)
        };

        // run outside the lock so a callback may touch this registry
        for teardown in teardowns {
            teardown();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .field("pending", &lock(&self.teardowns).len())
            .finish()
    }
}

//! # Subject Subscriber
//!
//! The watching side of a hub subject. Local streams for the same key share
//! one wire subscription.
//!
//! ## Invariants
//!
//! - The first local stream for a key sends `subscribe`; later streams reuse
//!   it and immediately see the last known value.
//! - Dropping the last stream for a live key sends `unsubscribe`. The hub
//!   counts subscriptions per endpoint, so clients sharing a transport do not
//!   cancel each other. A client that subscribes while another one on the
//!   same endpoint is already watching makes the hub re-push the current
//!   value, which the existing streams see once more.
//! - `complete` from the hub ends every stream for the key.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use isowire::Identifier;
use isowire::Message;
use isowire::MessageKind;
use isowire::SubjectRef;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use crate::config::SubscriberConfig;
use crate::disposable::Disposable;
use crate::lock;
use crate::transport::Inbound;
use crate::transport::Transport;

#[derive(Default)]
struct Feed {
    latest: Option<Value>,
    completed: bool,
    watchers: HashMap<u64, mpsc::UnboundedSender<Value>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: SubscriberConfig,
    feeds: Mutex<HashMap<String, Feed>>,
    next_watch: AtomicU64,
    disposable: Disposable,
}

impl Shared {
    fn on_value(&self, inbound: Inbound) {
        let Message::ValueUpdate(update) = inbound.message else { return };
        let mut feeds = lock(&self.feeds);
        let Some(feed) = feeds.get_mut(&update.key) else {
            trace!(key = %update.key, "value for unwatched key");
            return;
        };

        feed.watchers.retain(|_, tx| tx.send(update.value.clone()).is_ok());
        feed.latest = Some(update.value);
    }

    fn on_complete(&self, inbound: Inbound) {
        let Message::Complete(done) = inbound.message else { return };
        let mut feeds = lock(&self.feeds);
        if let Some(feed) = feeds.get_mut(&done.key) {
            feed.completed = true;
            feed.watchers.clear();
            debug!(key = %done.key, "subject completed");
        }
    }

    fn release(&self, key: &str, watch: u64) {
        let mut feeds = lock(&self.feeds);
        let Some(feed) = feeds.get_mut(key) else { return };
        let removed = feed.watchers.remove(&watch).is_some();
        if !feed.watchers.is_empty() {
            return;
        }

        let live = removed && !feed.completed;
        feeds.remove(key);
        drop(feeds);

        if live {
            trace!(key, "last stream dropped");
            self.send(Message::Unsubscribe(SubjectRef { key: key.to_string() }));
        }
    }

    fn send(&self, message: Message) {
        self.transport.send(self.config.hub, &message);
    }
}

/// Subscribes to subjects owned by a hub context.
#[derive(Clone)]
pub struct SubjectClient {
    shared: Arc<Shared>,
}

impl SubjectClient {
    pub fn new(transport: Arc<dyn Transport>, config: SubscriberConfig) -> Self {
        let shared = Arc::new(Shared {
            transport,
            config,
            feeds: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(0),
            disposable: Disposable::new(),
        });

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::ValueUpdate, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_value(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Complete, Arc::new(move |inbound: Inbound| {
            if let Some(shared) = weak.upgrade() {
                shared.on_complete(inbound);
            }
        }));
        shared.disposable.add(unsubscribe);

        // ends every open stream and hands back the hub subscriptions
        let weak = Arc::downgrade(&shared);
        shared.disposable.add(move || {
            let Some(shared) = weak.upgrade() else { return };
            let feeds = std::mem::take(&mut *lock(&shared.feeds));
            for (key, feed) in feeds {
                if !feed.completed && !feed.watchers.is_empty() {
                    shared.send(Message::Unsubscribe(SubjectRef { key }));
                }
            }
        });

        Self { shared }
    }

    /// Watches the subject `"{identifier.key}-{instance_key}"`.
    pub fn subscribe<T: DeserializeOwned>(&self, identifier: &Identifier, instance_key: &str) -> SubjectStream<T> {
        self.subscribe_key(&isowire::subject_key(identifier, instance_key))
    }

    /// Watches a subject by its full key.
    pub fn subscribe_key<T: DeserializeOwned>(&self, key: &str) -> SubjectStream<T> {
        let watch = self.shared.next_watch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut feeds = lock(&self.shared.feeds);
            let feed = feeds.entry(key.to_string()).or_default();
            let first = feed.watchers.is_empty();
            if first {
                *feed = Feed::default();
            } else if let Some(latest) = &feed.latest {
                let _ = tx.send(latest.clone());
            }
            feed.watchers.insert(watch, tx);
            first
        };

        if first && !self.is_disposed() {
            debug!(key, hub = %self.shared.config.hub, "subscribing");
            self.shared.send(Message::Subscribe(SubjectRef { key: key.to_string() }));
        }

        SubjectStream {
            key: key.to_string(),
            watch,
            rx,
            shared: Arc::downgrade(&self.shared),
            _value: PhantomData,
        }
    }

    /// Number of keys with at least one open stream.
    pub fn watched(&self) -> usize {
        lock(&self.shared.feeds).values().filter(|feed| !feed.watchers.is_empty()).count()
    }

    /// Stops listening and ends every open stream.
    pub fn dispose(&self) {
        self.shared.disposable.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposable.is_disposed()
    }
}

/// Values of one subject, in push order. Ends when the subject completes.
pub struct SubjectStream<T> {
    key: String,
    watch: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    shared: Weak<Shared>,
    _value: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SubjectStream<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The next value, or `None` once the subject has completed.
    pub async fn recv(&mut self) -> Option<isowire::Result<T>> {
        let value = self.rx.recv().await?;
        Some(isowire::from_value(value))
    }

    /// A value that has already arrived, if any.
    pub fn try_recv(&mut self) -> Option<isowire::Result<T>> {
        let value = self.rx.try_recv().ok()?;
        Some(isowire::from_value(value))
    }
}

impl<T> Drop for SubjectStream<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(&self.key, self.watch);
        }
    }
}

impl<T> std::fmt::Debug for SubjectStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectStream").field("key", &self.key).finish()
    }
}

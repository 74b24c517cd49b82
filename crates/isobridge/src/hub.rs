//! # Subscription Hub
//!
//! Owns named subjects and pushes their values to subscribers in other
//! contexts.
//!
//! ## Lifecycle
//!
//! Per key: no subject → `create_subject` → subject with 0..N active
//! subscribers → `complete` (terminal) or `remove_subject`.
//!
//! Per (key, subscriber): a `subscribe` before the subject exists parks the
//! subscriber in *pending*; creation moves every pending subscriber to
//! *active* and pushes the initial value. A `subscribe` after creation goes
//! straight to *active* with an immediate push.
//!
//! Several local watchers may share one endpoint, so membership is counted:
//! every `subscribe` adds one, every `unsubscribe` takes one away, and the
//! endpoint leaves the set at zero.
//!
//! ## Invariants
//!
//! - Pending and active sets for a key are disjoint.
//! - Creation and the pending drain happen under one lock, so a subscriber
//!   sees the initial value exactly once.
//! - Every `subscribe` to a live subject pushes its current value, even for
//!   an endpoint that is already active.
//! - Values reach active subscribers only, in `next` order. Pushes are sent
//!   while the state lock is held.
//! - After `complete`, `next` is a no-op and the active set is empty.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;

use isowire::Complete;
use isowire::Identifier;
use isowire::Message;
use isowire::MessageKind;
use isowire::ValueUpdate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use crate::disposable::Disposable;
use crate::lock;
use crate::transport::Address;
use crate::transport::EndpointId;
use crate::transport::Inbound;
use crate::transport::Transport;

/// Errors that occur while managing subjects.
#[derive(Debug, Clone)]
pub enum Error {
    /// A subject already lives under this key.
    SubjectExists(String),
    /// The value could not be converted to or from its wire form.
    Wire(isowire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SubjectExists(key) => write!(f, "Subject already exists: {}", key),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<isowire::Error> for Error {
    fn from(e: isowire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct SubjectState {
    generation: u64,
    value: Value,
    completed: bool,
}

/// Endpoint → number of subscriptions it holds on one key.
type Members = HashMap<EndpointId, usize>;

#[derive(Default)]
struct HubState {
    next_generation: u64,
    subjects: HashMap<String, SubjectState>,
    pending: HashMap<String, Members>,
    active: HashMap<String, Members>,
}

struct HubShared {
    transport: Arc<dyn Transport>,
    state: Mutex<HubState>,
    disposable: Disposable,
}

impl HubShared {
    fn push(&self, to: EndpointId, key: &str, value: &Value) {
        self.transport.send(
            Address::Endpoint(to),
            &Message::ValueUpdate(ValueUpdate { key: key.to_string(), value: value.clone() }),
        );
    }

    fn push_complete(&self, to: EndpointId, key: &str) {
        self.transport
            .send(Address::Endpoint(to), &Message::Complete(Complete { key: key.to_string() }));
    }

    fn subscribe(&self, key: &str, subscriber: EndpointId) {
        let mut state = lock(&self.state);
        let state = &mut *state;

        let Some(subject) = state.subjects.get(key) else {
            *state.pending.entry(key.to_string()).or_default().entry(subscriber).or_default() += 1;
            trace!(key, %subscriber, "subscriber pending");
            return;
        };

        if subject.completed {
            trace!(key, %subscriber, "late subscriber to completed subject");
            self.push(subscriber, key, &subject.value);
            self.push_complete(subscriber, key);
            return;
        }

        let active = state.active.entry(key.to_string()).or_default();
        let count = active.entry(subscriber).or_default();
        *count += 1;
        trace!(key, %subscriber, count = *count, "subscriber active");
        self.push(subscriber, key, &subject.value);
    }

    fn unsubscribe(&self, key: &str, subscriber: EndpointId) {
        let mut state = lock(&self.state);
        let state = &mut *state;
        for sets in [&mut state.pending, &mut state.active] {
            let Some(set) = sets.get_mut(key) else { continue };
            if let Some(count) = set.get_mut(&subscriber) {
                *count -= 1;
                if *count == 0 {
                    set.remove(&subscriber);
                }
            }
            if set.is_empty() {
                sets.remove(key);
            }
        }
        trace!(key, %subscriber, "unsubscribed");
    }

    fn remove_subscriber(&self, subscriber: EndpointId) {
        let mut state = lock(&self.state);
        let state = &mut *state;
        for sets in [&mut state.pending, &mut state.active] {
            sets.retain(|_, set| {
                set.remove(&subscriber);
                !set.is_empty()
            });
        }
        debug!(%subscriber, "subscriber purged");
    }
}

/// The hub side of subject sharing.
#[derive(Clone)]
pub struct SubjectManager {
    shared: Arc<HubShared>,
}

impl SubjectManager {
    /// Starts listening for `subscribe` / `unsubscribe` on `transport`.
    ///
    /// Subscribers are identified by the origin endpoint of their frames.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(HubShared {
            transport,
            state: Mutex::new(HubState::default()),
            disposable: Disposable::new(),
        });

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Subscribe, Arc::new(move |inbound: Inbound| {
            let (Some(shared), Message::Subscribe(subject)) = (weak.upgrade(), inbound.message) else { return };
            shared.subscribe(&subject.key, inbound.origin);
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let unsubscribe = shared.transport.on_message(MessageKind::Unsubscribe, Arc::new(move |inbound: Inbound| {
            let (Some(shared), Message::Unsubscribe(subject)) = (weak.upgrade(), inbound.message) else { return };
            shared.unsubscribe(&subject.key, inbound.origin);
        }));
        shared.disposable.add(unsubscribe);

        let weak = Arc::downgrade(&shared);
        let closed = shared.transport.on_endpoint_closed(Arc::new(move |endpoint| {
            if let Some(shared) = weak.upgrade() {
                shared.remove_subscriber(endpoint);
            }
        }));
        if let Some(unsubscribe) = closed {
            shared.disposable.add(unsubscribe);
        }

        Self { shared }
    }

    /// Creates the subject `"{identifier.key}-{instance_key}"` and activates
    /// everyone already waiting for it.
    pub fn create_subject<T>(&self, identifier: &Identifier, instance_key: &str, initial: &T) -> Result<Subject<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = isowire::subject_key(identifier, instance_key);
        let value = isowire::to_value(initial)?;

        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        if state.subjects.contains_key(&key) {
            return Err(Error::SubjectExists(key));
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let waiting = state.pending.remove(&key).unwrap_or_default();
        let active = state.active.entry(key.clone()).or_default();
        for (subscriber, count) in waiting {
            *active.entry(subscriber).or_default() += count;
            self.shared.push(subscriber, &key, &value);
        }
        debug!(%key, active = active.len(), "subject created");

        state.subjects.insert(key.clone(), SubjectState { generation, value, completed: false });
        drop(guard);

        Ok(Subject {
            key,
            generation,
            shared: self.shared.clone(),
            _value: PhantomData,
        })
    }

    /// Adds `subscriber` to the key, pushing the current value if the
    /// subject exists.
    pub fn subscribe(&self, key: &str, subscriber: EndpointId) {
        self.shared.subscribe(key, subscriber);
    }

    /// Removes `subscriber` from the key. Idempotent.
    pub fn unsubscribe(&self, key: &str, subscriber: EndpointId) {
        self.shared.unsubscribe(key, subscriber);
    }

    /// Purges `subscriber` from every pending and active set.
    pub fn remove_subscriber(&self, subscriber: EndpointId) {
        self.shared.remove_subscriber(subscriber);
    }

    /// Drops the subject and both of its subscriber sets.
    pub fn remove_subject(&self, key: &str) -> bool {
        let mut state = lock(&self.shared.state);
        state.pending.remove(key);
        state.active.remove(key);
        let removed = state.subjects.remove(key).is_some();
        if removed {
            debug!(key, "subject removed");
        }
        removed
    }

    pub fn has_subject(&self, key: &str) -> bool {
        lock(&self.shared.state).subjects.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.shared.state).subjects.get(key).map(|subject| subject.value.clone())
    }

    pub fn active_subscribers(&self, key: &str) -> Vec<EndpointId> {
        sorted(lock(&self.shared.state).active.get(key))
    }

    pub fn pending_subscribers(&self, key: &str) -> Vec<EndpointId> {
        sorted(lock(&self.shared.state).pending.get(key))
    }

    /// Stops listening. Existing subjects keep their state.
    pub fn dispose(&self) {
        self.shared.disposable.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposable.is_disposed()
    }
}

fn sorted(set: Option<&Members>) -> Vec<EndpointId> {
    let mut ids: Vec<EndpointId> = set.map(|set| set.keys().copied().collect()).unwrap_or_default();
    ids.sort();
    ids
}

/// Owner handle for one subject.
///
/// A handle only ever touches the subject it created: once that subject is
/// removed, even a new subject under the same key is out of its reach.
pub struct Subject<T> {
    key: String,
    generation: u64,
    shared: Arc<HubShared>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Subject<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replaces the value and pushes it to every active subscriber.
    ///
    /// A completed or removed subject ignores the call.
    pub fn next(&self, value: &T) -> Result<()> {
        let value = isowire::to_value(value)?;

        let mut state = lock(&self.shared.state);
        let state = &mut *state;
        let Some(subject) = state.subjects.get_mut(&self.key).filter(|s| s.generation == self.generation) else {
            trace!(key = %self.key, "next on removed subject");
            return Ok(());
        };
        if subject.completed {
            trace!(key = %self.key, "next on completed subject");
            return Ok(());
        }

        subject.value = value;
        if let Some(active) = state.active.get(&self.key) {
            for &subscriber in active.keys() {
                self.shared.push(subscriber, &self.key, &subject.value);
            }
        }
        Ok(())
    }

    /// Ends the subject. Active subscribers get `complete` and are dropped.
    pub fn complete(&self) {
        let mut state = lock(&self.shared.state);
        let state = &mut *state;
        let Some(subject) = state.subjects.get_mut(&self.key).filter(|s| s.generation == self.generation) else {
            return;
        };
        if subject.completed {
            return;
        }

        subject.completed = true;
        let active = state.active.remove(&self.key).unwrap_or_default();
        for subscriber in active.into_keys() {
            self.shared.push_complete(subscriber, &self.key);
        }
        debug!(key = %self.key, "subject completed");
    }

    /// The current value, or `None` once the subject is removed.
    pub fn value(&self) -> Result<Option<T>> {
        let state = lock(&self.shared.state);
        match state.subjects.get(&self.key).filter(|s| s.generation == self.generation) {
            Some(subject) => Ok(Some(isowire::from_value(subject.value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn is_completed(&self) -> bool {
        let state = lock(&self.shared.state);
        state
            .subjects
            .get(&self.key)
            .is_some_and(|s| s.generation == self.generation && s.completed)
    }

    /// Disposes the subject and clears its subscriber sets.
    pub fn remove(&self) {
        let mut state = lock(&self.shared.state);
        let owned = state.subjects.get(&self.key).is_some_and(|s| s.generation == self.generation);
        if owned {
            state.subjects.remove(&self.key);
            state.pending.remove(&self.key);
            state.active.remove(&self.key);
            debug!(key = %self.key, "subject removed");
        }
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject").field("key", &self.key).finish()
    }
}

//! Live query registry. A subscription pairs a compiled path with a
//! callback; the registry is a plain ordered vector so delivery follows
//! registration order and cancellation is a removal by id.

use std::sync::{Arc, Mutex, Weak};

use osmosis_common::JsonValue;

use crate::jsonpath::CompiledJsonPath;

/// Receives the full result list of its query — always a list, a singular
/// path yields one element.
pub type SubscriberCallback = Arc<dyn Fn(&[JsonValue]) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SubscriptionEntry {
    pub id: u64,
    pub compiled: CompiledJsonPath,
    pub callback: SubscriberCallback,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<SubscriptionEntry>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn insert(&self, compiled: CompiledJsonPath, callback: SubscriberCallback) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(SubscriptionEntry {
            id,
            compiled,
            callback,
        });
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
            detached: false,
        }
    }

    /// Snapshot of the current entries, so delivery never holds the lock and
    /// a callback may subscribe or cancel without deadlocking.
    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }
}

/// Cancelation handle for a live query. Dropping it unsubscribes; call
/// [Subscription::detach] to keep the query alive for the lifetime of the
/// store instead.
#[must_use = "dropping a Subscription cancels it immediately; call detach() to keep it alive"]
pub struct Subscription {
    registry: Weak<Mutex<RegistryInner>>,
    id: u64,
    detached: bool,
}

impl Subscription {
    /// Cancels the subscription. Idempotent; safe to call while a delivery
    /// is in flight (the callback either runs with a full result or not at
    /// all).
    pub fn unsubscribe(mut self) {
        self.remove();
        self.detached = true;
    }

    /// Keeps the subscription registered without retaining a handle.
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap();
            inner.entries.retain(|entry| entry.id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.remove();
        }
    }
}

//! Cache Events and Subscriber Lists
//!
//! Events are signals, never values: a subscriber that sees
//! [`CacheEvent::Updated`] re-reads the key through the orchestrator on its
//! next render.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::entry::CacheKey;

/// Change notification broadcast by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A newer value for the key was stored
    Updated { key: CacheKey },
    /// The key was removed from every tier
    Invalidated { key: CacheKey },
    /// Every tier was cleared
    GlobalRefresh,
    /// The link came back after being offline; stale entries refresh on
    /// their next read
    Reconnected,
}

impl CacheEvent {
    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Updated { .. } => "Updated",
            CacheEvent::Invalidated { .. } => "Invalidated",
            CacheEvent::GlobalRefresh => "GlobalRefresh",
            CacheEvent::Reconnected => "Reconnected",
        }
    }

    /// Key the event concerns, if it is key-scoped
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheEvent::Updated { key } | CacheEvent::Invalidated { key } => Some(key),
            CacheEvent::GlobalRefresh | CacheEvent::Reconnected => None,
        }
    }

    /// Whether a consumer holding `key` should re-read it
    pub fn affects(&self, key: &CacheKey) -> bool {
        self.key().map_or(true, |k| k == key)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct SubscriberTable<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<E>)>>,
}

/// Ordered list of callbacks notified synchronously on every event
pub struct Subscribers<E> {
    table: Arc<SubscriberTable<E>>,
}

impl<E: 'static> Subscribers<E> {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            table: Arc::new(SubscriberTable {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback; it stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.callbacks.lock().push((id, Arc::new(callback)));

        let weak: Weak<SubscriberTable<E>> = Arc::downgrade(&self.table);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    table.callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
                }
            })),
        }
    }

    /// Notify every subscriber in registration order
    pub fn emit(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly
        let callbacks: Vec<Callback<E>> = self
            .table
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.table.callbacks.lock().len()
    }

    /// Check if nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle detaching a callback when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach the callback now
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    /// Keep the callback registered for the life of the list
    pub fn forget(mut self) {
        self.detach = None;
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<CacheEvent>>>, impl Fn(&CacheEvent) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &CacheEvent| sink.lock().push(e.clone()))
    }

    #[test]
    fn test_emit_reaches_subscribers() {
        let subscribers = Subscribers::new();
        let (seen, callback) = collector();
        let _sub = subscribers.subscribe(callback);

        subscribers.emit(&CacheEvent::Updated {
            key: CacheKey::new("services"),
        });
        subscribers.emit(&CacheEvent::GlobalRefresh);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type(), "Updated");
        assert_eq!(seen[1], CacheEvent::GlobalRefresh);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subscribers = Subscribers::new();
        let (seen, callback) = collector();
        let sub = subscribers.subscribe(callback);
        assert_eq!(subscribers.len(), 1);

        drop(sub);
        assert!(subscribers.is_empty());

        subscribers.emit(&CacheEvent::GlobalRefresh);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe_and_forget() {
        let subscribers: Subscribers<CacheEvent> = Subscribers::new();
        let a = subscribers.subscribe(|_| {});
        let b = subscribers.subscribe(|_| {});
        assert_eq!(subscribers.len(), 2);

        a.unsubscribe();
        b.forget();
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_list() {
        let subscribers: Subscribers<CacheEvent> = Subscribers::new();
        let sub = subscribers.subscribe(|_| {});
        drop(subscribers);
        drop(sub);
    }

    #[test]
    fn test_event_affects() {
        let services = CacheKey::new("services");
        let team = CacheKey::new("team");

        let updated = CacheEvent::Updated {
            key: services.clone(),
        };
        assert!(updated.affects(&services));
        assert!(!updated.affects(&team));
        assert!(CacheEvent::GlobalRefresh.affects(&team));
        assert!(CacheEvent::Reconnected.affects(&services));
        assert_eq!(CacheEvent::Reconnected.key(), None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(CacheEvent::Invalidated {
            key: CacheKey::new("team"),
        })
        .unwrap();
        assert_eq!(json["type"], "Invalidated");
        assert_eq!(json["key"], "team");
    }
}

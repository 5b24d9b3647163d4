//! Single-flight coordination keyed by a hashable value.
//!
//! The first caller to [`SingleFlight::claim`] a key leads and does the work;
//! later callers follow and wait until the leader's guard is dropped, then
//! re-check whatever state the leader was producing.

use std::collections::HashMap;
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// Keys currently being worked on, each with the handle its waiters park on.
pub(crate) struct SingleFlight<K> {
    in_flight: Mutex<HashMap<K, Arc<Notify>>>,
}

/// Outcome of a claim.
pub(crate) enum Flight<'a, K: Eq + Hash> {
    Lead(FlightGuard<'a, K>),
    Follow(Arc<Notify>),
}

/// Held by the leader. Dropping it releases the key and wakes every waiter,
/// also when the leading future is cancelled.
pub(crate) struct FlightGuard<'a, K: Eq + Hash> {
    flight: &'a SingleFlight<K>,
    key: K,
    notify: Arc<Notify>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<Notify>>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Become the leader for `key`, or get the handle of the current one.
    pub(crate) fn claim(&self, key: &K) -> Flight<'_, K> {
        let mut in_flight = self.lock();
        if let Some(notify) = in_flight.get(key) {
            return Flight::Follow(Arc::clone(notify));
        }
        let notify = Arc::new(Notify::new());
        in_flight.insert(key.clone(), Arc::clone(&notify));
        Flight::Lead(FlightGuard {
            flight: self,
            key: key.clone(),
            notify,
        })
    }

    /// Wait until the leader identified by `notify` releases `key`.
    pub(crate) async fn wait(&self, key: &K, notify: Arc<Notify>) {
        let mut notified = pin!(notify.notified());
        notified.as_mut().enable();
        // The leader may have finished between `claim` and `enable`
        if self.still_in_flight(key, &notify) {
            notified.await;
        }
    }

    fn still_in_flight(&self, key: &K, notify: &Arc<Notify>) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, notify))
    }

    /// Whether no key is currently claimed.
    pub(crate) fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K: Eq + Hash> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        let mut in_flight = self
            .flight
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        in_flight.remove(&self.key);
        self.notify.notify_waiters();
    }
}

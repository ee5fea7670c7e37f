//! Bookkeeping for in-flight keyed units.
//!
//! The registry is the only state shared between concurrently running
//! effects. Every operation takes the mutex for a short, synchronous
//! critical section — admission decisions (dedup, throttle, replacement)
//! are atomic, and cancellation only flips a watch channel, so a cancelled
//! unit never needs the lock from inside its own execution context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::effect::CancelKey;

/// Cooperative cancellation handle held by a running unit.
///
/// Resolves when the registry signals cancellation; if the signalling side
/// disappears without cancelling (the unit already removed itself), it stays
/// pending forever — the racing body future wins the select.
pub(crate) struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub(crate) async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

struct Entry {
    id: Uuid,
    cancel: watch::Sender<bool>,
    started_at: Instant,
}

struct Inner<K> {
    running: HashMap<K, Entry>,
    last_started: HashMap<K, Instant>,
    closed: bool,
}

/// Map from cancellation key to running unit, plus last-start timestamps
/// for throttling. Owned exclusively by the scheduler.
pub(crate) struct TaskRegistry<K> {
    inner: Mutex<Inner<K>>,
}

/// Outcome of asking the registry to start a keyed unit.
pub(crate) enum Admission {
    /// The unit may run; it is now registered.
    Started(Registration),
    /// Another unit holds the key and stays; the submission is dropped.
    DuplicateDropped,
    /// The key is inside its throttle cooldown window; dropped.
    Throttled,
    /// The registry has shut down; dropped.
    Closed,
}

/// Identity and cancellation handle for a freshly admitted unit.
pub(crate) struct Registration {
    pub(crate) id: Uuid,
    pub(crate) token: CancelToken,
}

impl<K> TaskRegistry<K> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                running: HashMap::new(),
                last_started: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Number of registered in-flight units.
    pub(crate) fn active(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }

    /// Signal and forget every registered unit; clear throttle state.
    pub(crate) fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.running.len();
        for (_, entry) in inner.running.drain() {
            let _ = entry.cancel.send(true);
        }
        inner.last_started.clear();
        if count > 0 {
            tracing::debug!(count, "cancelled all registered units");
        }
    }

    /// Stop admitting new units, then cancel everything still running.
    pub(crate) fn shutdown(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cancel_all();
    }
}

impl<K: CancelKey> TaskRegistry<K> {
    /// Atomically decide whether a keyed unit may start, applying throttle,
    /// dedup, and cancel-in-flight policy, and register it if so.
    ///
    /// A submission without a throttle window clears any stored timestamp
    /// for the key, so a later throttled submission starts a fresh
    /// measurement rather than inheriting stale state.
    pub(crate) fn admit(
        &self,
        key: &K,
        cancel_in_flight: bool,
        throttle: Option<Duration>,
    ) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Admission::Closed;
        }

        match throttle {
            Some(window) => {
                if let Some(last) = inner.last_started.get(key) {
                    if last.elapsed() < window {
                        return Admission::Throttled;
                    }
                }
            }
            None => {
                inner.last_started.remove(key);
            }
        }

        if let Some(existing) = inner.running.get(key) {
            if !cancel_in_flight {
                return Admission::DuplicateDropped;
            }
            let _ = existing.cancel.send(true);
            tracing::debug!(
                key = ?key,
                ran_for = ?existing.started_at.elapsed(),
                "cancelled in-flight unit for replacement"
            );
        }

        let (cancel, rx) = watch::channel(false);
        let id = Uuid::new_v4();
        let now = Instant::now();
        inner.running.insert(
            key.clone(),
            Entry {
                id,
                cancel,
                started_at: now,
            },
        );
        if throttle.is_some() {
            inner.last_started.insert(key.clone(), now);
        }
        Admission::Started(Registration {
            id,
            token: CancelToken { rx },
        })
    }

    /// Cancel and remove the unit under `key`, if any.
    pub(crate) fn cancel(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.running.remove(key) {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                tracing::debug!(key = ?key, ran_for = ?entry.started_at.elapsed(), "cancelled unit");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `key` only when it still belongs to the unit
    /// identified by `id` — a replaced unit must not tear down its successor.
    fn remove_if(&self, key: &K, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running.get(key).map(|entry| entry.id) == Some(id) {
            inner.running.remove(key);
        }
    }
}

/// Removes the registration on every exit path — success, error, or
/// cancellation — when the running unit's future is dropped or returns.
pub(crate) struct RegistrationGuard<K: CancelKey> {
    registry: Arc<TaskRegistry<K>>,
    key: K,
    id: Uuid,
}

impl<K: CancelKey> RegistrationGuard<K> {
    pub(crate) fn new(registry: Arc<TaskRegistry<K>>, key: K, id: Uuid) -> Self {
        Self { registry, key, id }
    }
}

impl<K: CancelKey> Drop for RegistrationGuard<K> {
    fn drop(&mut self) {
        self.registry.remove_if(&self.key, self.id);
    }
}

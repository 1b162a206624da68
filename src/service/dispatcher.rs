//! Status fanout to registered observers.
//!
//! Observers are held behind tagged handles rather than by identity of the
//! closure, so callers can unregister on teardown without the registry ever
//! owning their surrounding objects. The session engine broadcasts from its
//! own task; callbacks run synchronously and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{trace, warn};

use crate::error::{constants, LanError, Result};
use crate::protocol::appliance::StatusMap;

type ObserverFn = dyn Fn(&StatusMap) + Send + Sync + 'static;

/// Handle returned at registration; the only way to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observer registry with ordered synchronous fanout.
pub struct StatusDispatcher {
    observers: Arc<RwLock<HashMap<ObserverId, Box<ObserverFn>>>>,
    next_id: AtomicU64,
}

impl Default for StatusDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusDispatcher {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; returns the handle that unregisters it.
    pub fn register<F>(&self, observer: F) -> Result<ObserverId>
    where
        F: Fn(&StatusMap) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self
            .observers
            .write()
            .map_err(|_| LanError::Config(constants::ERR_OBSERVER_LOCK.to_string()))?;
        observers.insert(id, Box::new(observer));
        Ok(id)
    }

    /// Remove an observer. Returns whether the handle was still registered.
    pub fn unregister(&self, id: ObserverId) -> Result<bool> {
        let mut observers = self
            .observers
            .write()
            .map_err(|_| LanError::Config(constants::ERR_OBSERVER_LOCK.to_string()))?;
        Ok(observers.remove(&id).is_some())
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer with `status`, synchronously, on the caller's
    /// task.
    pub fn broadcast(&self, status: &StatusMap) {
        let observers = match self.observers.read() {
            Ok(observers) => observers,
            Err(_) => {
                warn!("{}", constants::ERR_OBSERVER_LOCK);
                return;
            }
        };
        trace!(observers = observers.len(), keys = status.len(), "broadcast");
        for observer in observers.values() {
            observer(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::appliance::StatusValue;
    use std::sync::Mutex;

    fn status_with(key: &str, value: StatusValue) -> StatusMap {
        let mut status = StatusMap::new();
        status.insert(key.to_string(), value);
        status
    }

    #[test]
    fn broadcast_reaches_every_observer() {
        let dispatcher = StatusDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            dispatcher
                .register(move |_status: &StatusMap| {
                    seen.lock().unwrap().push(tag);
                })
                .unwrap();
        }

        dispatcher.broadcast(&status_with("available", StatusValue::Bool(true)));
        let mut tags = seen.lock().unwrap().clone();
        tags.sort_unstable();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn unregister_by_handle() {
        let dispatcher = StatusDispatcher::new();
        let count = Arc::new(Mutex::new(0u32));

        let counter = count.clone();
        let id = dispatcher
            .register(move |_| *counter.lock().unwrap() += 1)
            .unwrap();

        dispatcher.broadcast(&StatusMap::new());
        assert!(dispatcher.unregister(id).unwrap());
        dispatcher.broadcast(&StatusMap::new());

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!dispatcher.unregister(id).unwrap(), "second removal is a no-op");
    }

    #[test]
    fn updates_arrive_in_order_per_observer() {
        let dispatcher = StatusDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        dispatcher
            .register(move |status: &StatusMap| {
                if let Some(StatusValue::Int(n)) = status.get("seq") {
                    sink.lock().unwrap().push(*n);
                }
            })
            .unwrap();

        for n in 0..5 {
            dispatcher.broadcast(&status_with("seq", StatusValue::Int(n)));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}

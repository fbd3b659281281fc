//! Subscriber sets for outbound engine events.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::EngineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(uuid::Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// An ordered set of listeners keyed by [`ListenerId`].
///
/// [`emit`](Self::emit) dispatches over a snapshot, so a listener may add or
/// remove listeners (itself included) while it is being called.
#[derive(Default)]
pub struct Listeners {
    entries: RwLock<Vec<(ListenerId, Listener)>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under a fresh id.
    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.insert(id, listener);
        id
    }

    /// Register `listener` under an existing id, replacing any listener with
    /// the same id.
    pub fn insert(&self, id: ListenerId, listener: Listener) {
        let mut entries = self.write();
        match entries.iter_mut().find(|(key, _)| *key == id) {
            Some(entry) => entry.1 = listener,
            None => entries.push((id, listener)),
        }
    }

    /// Returns `true` if a listener was removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.write();
        let len = entries.len();
        entries.retain(|(key, _)| *key != id);
        entries.len() != len
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(ListenerId, Listener)> {
        self.read().clone()
    }

    pub fn emit(&self, event: &EngineEvent) {
        for (_, listener) in self.snapshot() {
            listener(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ListenerId, Listener)>> {
        self.entries.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ListenerId, Listener)>> {
        self.entries.write().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    #[test]
    fn test_emit_in_registration_order() {
        let listeners = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            listeners.add(Arc::new(move |_: &EngineEvent| seen.lock().unwrap().push(tag)));
        }
        listeners.emit(&EngineEvent::Ready);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = {
            let count = count.clone();
            listeners.add(Arc::new(move |_: &EngineEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        listeners.emit(&EngineEvent::Ready);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&EngineEvent::Ready);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let listeners = Arc::new(Listeners::new());
        let count = Arc::new(AtomicUsize::new(0));
        let id = ListenerId::new();
        {
            let weak = Arc::downgrade(&listeners);
            let count = count.clone();
            listeners.insert(
                id,
                Arc::new(move |_: &EngineEvent| {
                    count.fetch_add(1, Ordering::SeqCst);
                    if let Some(listeners) = weak.upgrade() {
                        listeners.remove(id);
                    }
                }),
            );
        }
        listeners.emit(&EngineEvent::Ready);
        listeners.emit(&EngineEvent::Ready);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_insert_keeps_id() {
        let listeners = Listeners::new();
        let id = listeners.add(Arc::new(|_: &EngineEvent| {}));
        listeners.insert(id, Arc::new(|_: &EngineEvent| {}));
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners.snapshot()[0].0, id);
    }
}

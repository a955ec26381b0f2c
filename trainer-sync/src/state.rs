use std::sync::{Arc, Mutex, PoisonError};

use im::Vector;
use slotmap::SlotMap;

use crate::SyncError;

slotmap::new_key_type! {
    pub struct ListenerKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing loaded yet.
    Empty,
    /// A full fetch is running.
    Loading,
    Ready,
    /// Ready, and a background count check is running.
    Verifying,
}

/// What the rendering layer sees of one collection.
#[derive(Debug, Clone)]
pub struct Snapshot<T: Clone> {
    pub items: Vector<T>,
    pub loading: bool,
    pub error: Option<SyncError>,
    pub phase: Phase,
}

impl<T: Clone> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            items: Vector::new(),
            loading: false,
            error: None,
            phase: Phase::Empty,
        }
    }
}

type Listener<T> = Arc<dyn Fn(&Snapshot<T>) + Send + Sync>;

pub(crate) struct Listeners<T: Clone> {
    registered: Mutex<SlotMap<ListenerKey, Listener<T>>>,
}

impl<T: Clone> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            registered: Mutex::new(SlotMap::with_key()),
        }
    }

    pub(crate) fn register(&self, listener: Listener<T>) -> ListenerKey {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(listener)
    }

    pub(crate) fn unregister(&self, key: ListenerKey) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Call every listener with `snapshot`. The registry is not locked while listeners run,
    /// so a listener may register or unregister others.
    pub(crate) fn notify(&self, snapshot: &Snapshot<T>) {
        let listeners: Vec<Listener<T>> = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

//! Mirra store: the local object cache plus the coalescing event queue
//! that decouples reflector write rate from handler processing rate.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use mirra_core::{Event, Obj, ObjKey};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::debug;

/// Thread-safe key -> object cache.
///
/// Writes are serialized through the interior lock; `list` hands back a
/// point-in-time copy that is safe to iterate while mutation continues.
#[derive(Debug, Default)]
pub struct Store {
    inner: RwLock<FxHashMap<ObjKey, Obj>>,
}

impl Store {
    pub fn new() -> Self {
        Self { inner: RwLock::new(FxHashMap::default()) }
    }

    /// Insert or replace the object under its own key.
    pub fn insert(&self, obj: Obj) -> Option<Obj> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let prev = map.insert(obj.key(), obj);
        metrics::gauge!("mirra_store_objects", map.len() as f64);
        prev
    }

    /// Remove a key; removing an absent key is a no-op.
    pub fn delete(&self, key: &ObjKey) -> Option<Obj> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let prev = map.remove(key);
        metrics::gauge!("mirra_store_objects", map.len() as f64);
        prev
    }

    pub fn get(&self, key: &ObjKey) -> Option<Obj> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn contains_key(&self, key: &ObjKey) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    /// Consistent point-in-time snapshot of all objects.
    pub fn list(&self) -> Vec<Obj> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjKey> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Coalescing map keyed by object key with first-seen FIFO order.
///
/// At most one pending event per key; a re-pushed key keeps its original
/// position, so a hot key cannot starve the rest of the queue. Memory is
/// bounded by the number of distinct changed keys, not the event count.
#[derive(Debug, Default)]
pub struct Coalescer {
    map: FxHashMap<ObjKey, Event>,
    order: VecDeque<ObjKey>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Merge `ev` into the pending entry for its key.
    ///
    /// Net-effect rules: add then update stays an add carrying the latest
    /// object; anything followed by delete becomes the delete; a delete
    /// followed by a recreation becomes an update from the last known
    /// deleted state, so consumers never observe the intermediate absence.
    pub fn push(&mut self, ev: Event) {
        let key = ev.key();
        match self.map.remove(&key) {
            None => {
                self.order.push_back(key.clone());
                self.map.insert(key, ev);
            }
            Some(pending) => {
                let merged = merge(pending, ev);
                self.map.insert(key, merged);
            }
        }
    }

    /// Peek at the pending event for a key, if any.
    pub fn get(&self, key: &ObjKey) -> Option<&Event> {
        self.map.get(key)
    }

    /// Pop the oldest pending event, if any.
    pub fn pop_front(&mut self) -> Option<Event> {
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                return Some(ev);
            }
        }
        None
    }

    /// Drain everything currently pending, in first-seen order.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(ev) = self.pop_front() {
            out.push(ev);
        }
        out
    }
}

fn merge(pending: Event, incoming: Event) -> Event {
    use Event::*;
    match (pending, incoming) {
        // Latest object wins while the net effect is still "first appearance".
        (Added(_), Added(new)) => Added(new),
        (Added(_), Updated { new, .. }) => Added(new),
        // The key was never seen by consumers in its added state.
        (Added(_), Deleted(last)) => Deleted(last),
        (Updated { old, .. }, Updated { new, .. }) => Updated { old, new },
        (Updated { old, .. }, Added(new)) => Updated { old, new },
        (Updated { .. }, Deleted(last)) => Deleted(last),
        // Recreation: surface as an update from the last known state.
        (Deleted(last), Added(new)) => Updated { old: last, new },
        (Deleted(last), Updated { new, .. }) => Updated { old: last, new },
        (Deleted(_), Deleted(last)) => Deleted(last),
    }
}

/// Async delivery queue over a [`Coalescer`].
///
/// Single-producer in practice (the reflector); any number of consumers
/// may `pop`, each event going to exactly one of them.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Coalescer,
    closed: bool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue (or merge) an event. Pushes after `close` are dropped.
    pub fn push(&self, ev: Event) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            debug!(key = %ev.key(), "push on closed queue dropped");
            return;
        }
        state.pending.push(ev);
        metrics::gauge!("mirra_queue_depth", state.pending.len() as f64);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next event. Returns `None` once the queue is closed
    /// and fully drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting state, otherwise a
            // close() between the check and the await is lost.
            notified.as_mut().enable();
            {
                let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(ev) = state.pending.pop_front() {
                    metrics::gauge!("mirra_queue_depth", state.pending.len() as f64);
                    // Wake the next consumer in case more events are ready.
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(ev);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Close the queue; pending events remain poppable, new pushes drop.
    pub fn close(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

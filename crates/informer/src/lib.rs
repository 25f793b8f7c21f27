//! Mirra informer: the consumer-facing facade over reflector, store and
//! queue. Consumers register handlers, start the informer, wait for the
//! initial sync, and read the cache; they never mutate the store.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use mirra_core::{Event, ListWatch, Obj, ObjKey};
use mirra_reflector::{Reflector, ReflectorConfig};
use mirra_store::{EventQueue, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors surfaced to the caller of the informer lifecycle API. Transport
/// failures never show up here; the reflector recovers them internally.
#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    /// Configuration that cannot even attempt a first list.
    #[error("fatal config: {0}")]
    FatalConfig(String),
    #[error("informer already started")]
    AlreadyStarted,
    #[error("informer not started")]
    NotStarted,
}

/// Callbacks for cache change notifications.
///
/// Invoked from the dispatcher task, in registration order, one event at
/// a time. A panicking callback is caught and logged; it never stops
/// delivery to other handlers or later events.
pub trait Handler: Send + Sync {
    fn on_add(&self, obj: &Obj);
    fn on_update(&self, old: &Obj, new: &Obj);
    fn on_delete(&self, obj: &Obj);
}

/// Read-only view over the informer's store.
#[derive(Clone)]
pub struct CacheView {
    store: Arc<Store>,
}

impl CacheView {
    pub fn get(&self, key: &ObjKey) -> Option<Obj> {
        self.store.get(key)
    }

    /// Point-in-time snapshot of everything cached.
    pub fn list(&self) -> Vec<Obj> {
        self.store.list()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Pulls events off the queue and fans them out to handlers until the
/// queue is closed and drained.
struct Dispatcher {
    queue: Arc<EventQueue>,
    handlers: Arc<Vec<Arc<dyn Handler>>>,
}

impl Dispatcher {
    async fn run(self) {
        while let Some(ev) = self.queue.pop().await {
            self.dispatch(&ev);
        }
        info!("dispatcher drained and stopped");
    }

    fn dispatch(&self, ev: &Event) {
        for handler in self.handlers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match ev {
                Event::Added(o) => handler.on_add(o),
                Event::Updated { old, new } => handler.on_update(old, new),
                Event::Deleted(o) => handler.on_delete(o),
            }));
            if outcome.is_err() {
                metrics::counter!("mirra_handler_panics_total", 1u64);
                error!(key = %ev.key(), "handler panicked; continuing");
            }
        }
        metrics::counter!("mirra_events_dispatched_total", 1u64);
    }
}

/// Owns the reflector + dispatcher lifecycle for one remote collection.
pub struct Informer {
    source: Arc<dyn ListWatch>,
    store: Arc<Store>,
    queue: Arc<EventQueue>,
    handlers: Vec<Arc<dyn Handler>>,
    config: ReflectorConfig,
    synced_rx: watch::Receiver<bool>,
    synced_tx: Option<watch::Sender<bool>>,
    cancel: CancellationToken,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl Informer {
    pub fn new(source: Arc<dyn ListWatch>) -> Self {
        Self::with_config(source, ReflectorConfig::default())
    }

    pub fn with_config(source: Arc<dyn ListWatch>, config: ReflectorConfig) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            source,
            store: Arc::new(Store::new()),
            queue: Arc::new(EventQueue::new()),
            handlers: Vec::new(),
            config,
            synced_rx: rx,
            synced_tx: Some(tx),
            cancel: CancellationToken::new(),
            tasks: None,
        }
    }

    /// Register a handler; allowed only before `start`.
    pub fn register_handler(&mut self, handler: Arc<dyn Handler>) -> Result<(), InformerError> {
        if self.tasks.is_some() {
            return Err(InformerError::AlreadyStarted);
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Launch the reflector and dispatcher as independent tasks.
    pub fn start(&mut self) -> Result<(), InformerError> {
        if self.tasks.is_some() {
            return Err(InformerError::AlreadyStarted);
        }
        if self.config.batch_max == 0 {
            return Err(InformerError::FatalConfig("batch_max must be nonzero".into()));
        }
        let synced_tx = self.synced_tx.take().ok_or(InformerError::AlreadyStarted)?;

        let reflector = Reflector::new(
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            synced_tx,
            self.cancel.clone(),
            self.config.clone(),
        );
        let dispatcher = Dispatcher {
            queue: Arc::clone(&self.queue),
            handlers: Arc::new(self.handlers.clone()),
        };
        let r = tokio::spawn(reflector.run());
        let d = tokio::spawn(dispatcher.run());
        self.tasks = Some((r, d));
        info!(handlers = self.handlers.len(), "informer started");
        Ok(())
    }

    /// Block until the first successful list has been applied to the
    /// store, or `timeout` elapses. True means synced.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|synced| *synced))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Read-only access to the local cache.
    pub fn cache(&self) -> CacheView {
        CacheView { store: Arc::clone(&self.store) }
    }

    /// Signal both tasks to stop and wait for them to exit. Pending
    /// queued events are still delivered before the dispatcher exits.
    pub async fn stop(&mut self) -> Result<(), InformerError> {
        let (r, d) = self.tasks.take().ok_or(InformerError::NotStarted)?;
        self.cancel.cancel();
        self.queue.close();
        let _ = r.await;
        let _ = d.await;
        info!("informer stopped");
        Ok(())
    }
}

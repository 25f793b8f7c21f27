//! Mirra reflector: drives list-then-watch synchronization from a remote
//! source into the local [`Store`], emitting net change events into the
//! [`EventQueue`].
//!
//! The loop is the state machine Idle -> Listing -> Watching, with
//! Relisting entered when the remote reports the sync cursor expired and
//! Stopped reached from any blocking point via the cancellation token.

#![forbid(unsafe_code)]

mod backoff;

pub use backoff::Backoff;

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use mirra_core::{Event, ListWatch, Obj, SourceError, SourceEvent, SourceEventKind, WatchStream};
use mirra_store::{Coalescer, EventQueue, Store};
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the sync loop; defaults come from `MIRRA_*` env vars.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// First retry delay after a transient failure.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Max watch events drained into one store application batch.
    pub batch_max: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        let base_ms = env_u64("MIRRA_WATCH_BACKOFF_BASE_MS", 200);
        let max_secs = env_u64("MIRRA_WATCH_BACKOFF_MAX_SECS", 30);
        let batch_max = env_u64("MIRRA_BATCH_MAX", 256) as usize;
        Self {
            backoff_base: Duration::from_millis(base_ms),
            backoff_max: Duration::from_secs(max_secs),
            batch_max: batch_max.max(1),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

enum Pump {
    Cancelled,
    Expired,
    Ended,
}

/// List/watch synchronization driver.
///
/// Owns the sync cursor; the store and queue are shared with readers and
/// the dispatcher. `run` consumes the reflector and loops until cancelled.
pub struct Reflector {
    source: Arc<dyn ListWatch>,
    store: Arc<Store>,
    queue: Arc<EventQueue>,
    cursor: Option<String>,
    synced_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    config: ReflectorConfig,
}

impl Reflector {
    pub fn new(
        source: Arc<dyn ListWatch>,
        store: Arc<Store>,
        queue: Arc<EventQueue>,
        synced_tx: watch::Sender<bool>,
        cancel: CancellationToken,
        config: ReflectorConfig,
    ) -> Self {
        Self { source, store, queue, cursor: None, synced_tx, cancel, config }
    }

    /// Resume from a cursor saved by a prior run.
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        'relist: loop {
            // Listing / Relisting: retried with backoff until it succeeds.
            let page = loop {
                let attempt = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("reflector stopped during list");
                        return;
                    }
                    r = self.source.list(self.cursor.as_deref()) => r,
                };
                match attempt {
                    Ok(page) => break page,
                    Err(SourceError::ExpiredCursor) => {
                        info!("list cursor expired; relisting from scratch");
                        metrics::counter!("mirra_relists_total", 1u64);
                        self.cursor = None;
                    }
                    Err(e) => {
                        metrics::counter!("mirra_watch_errors_total", 1u64, "phase" => "list");
                        let delay = backoff.next_delay();
                        warn!(error = %e, delay_ms = %delay.as_millis(), "list failed; backing off");
                        if !self.sleep(delay).await {
                            return;
                        }
                    }
                }
            };
            let emitted = self.reconcile(page.items);
            self.cursor = Some(page.resource_version.clone());
            backoff.reset();
            metrics::counter!("mirra_lists_total", 1u64);
            info!(
                objects = self.store.len(),
                emitted,
                cursor = %page.resource_version,
                "list reconciled"
            );
            self.synced_tx.send_replace(true);

            // Watching: reopen from the cursor on stream end or transient
            // failure; fall back to a full relist only on cursor expiry.
            loop {
                let cursor = self.cursor.clone().unwrap_or_default();
                let opened = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("reflector stopped while opening watch");
                        return;
                    }
                    r = self.source.watch(&cursor) => r,
                };
                let mut stream = match opened {
                    Ok(s) => s,
                    Err(SourceError::ExpiredCursor) => {
                        info!(cursor = %cursor, "watch cursor expired; relisting");
                        metrics::counter!("mirra_relists_total", 1u64);
                        self.cursor = None;
                        continue 'relist;
                    }
                    Err(e) => {
                        metrics::counter!("mirra_watch_errors_total", 1u64, "phase" => "watch");
                        let delay = backoff.next_delay();
                        warn!(error = %e, delay_ms = %delay.as_millis(), "watch open failed; backing off");
                        if !self.sleep(delay).await {
                            return;
                        }
                        continue;
                    }
                };
                debug!(cursor = %cursor, "watch opened");
                match self.pump(&mut stream, &mut backoff).await {
                    Pump::Cancelled => {
                        info!("reflector stopped during watch");
                        return;
                    }
                    Pump::Expired => {
                        info!("watch reported expired cursor; relisting");
                        metrics::counter!("mirra_relists_total", 1u64);
                        self.cursor = None;
                        continue 'relist;
                    }
                    Pump::Ended => {
                        let delay = backoff.next_delay();
                        debug!(delay_ms = %delay.as_millis(), "watch ended; reopening from cursor");
                        if !self.sleep(delay).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Consume one watch stream until it ends, errors, or is cancelled.
    async fn pump(&mut self, stream: &mut WatchStream, backoff: &mut Backoff) -> Pump {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Pump::Cancelled,
                n = stream.next() => n,
            };
            let first = match next {
                None => return Pump::Ended,
                Some(Err(SourceError::ExpiredCursor)) => return Pump::Expired,
                Some(Err(SourceError::Malformed(m))) => {
                    metrics::counter!("mirra_malformed_events_total", 1u64);
                    warn!(error = %m, "skipping malformed event");
                    continue;
                }
                Some(Err(e)) => {
                    metrics::counter!("mirra_watch_errors_total", 1u64, "phase" => "stream");
                    warn!(error = %e, "watch stream failed; reopening from cursor");
                    return Pump::Ended;
                }
                Some(Ok(ev)) => ev,
            };

            // Drain whatever the stream has ready so that a delete and an
            // immediate recreate land in the same batch and apply to the
            // store as a single update.
            let mut batch = vec![first];
            let mut outcome = None;
            while batch.len() < self.config.batch_max {
                match stream.next().now_or_never() {
                    Some(Some(Ok(ev))) => batch.push(ev),
                    Some(Some(Err(SourceError::Malformed(m)))) => {
                        metrics::counter!("mirra_malformed_events_total", 1u64);
                        warn!(error = %m, "skipping malformed event");
                    }
                    Some(Some(Err(SourceError::ExpiredCursor))) => {
                        outcome = Some(Pump::Expired);
                        break;
                    }
                    Some(Some(Err(e))) => {
                        metrics::counter!("mirra_watch_errors_total", 1u64, "phase" => "stream");
                        warn!(error = %e, "watch stream failed; reopening from cursor");
                        outcome = Some(Pump::Ended);
                        break;
                    }
                    Some(None) => {
                        outcome = Some(Pump::Ended);
                        break;
                    }
                    None => break,
                }
            }
            self.apply_batch(batch);
            backoff.reset();
            if let Some(out) = outcome {
                return out;
            }
        }
    }

    /// Coalesce a batch of source events per key, mutate the store with
    /// the net effect, then publish. Store mutation happens strictly
    /// before the event becomes visible to the dispatcher.
    fn apply_batch(&mut self, batch: Vec<SourceEvent>) {
        let mut pending = Coalescer::new();
        for se in batch {
            self.cursor = Some(se.obj.resource_version.clone());
            let key = se.obj.key();
            // Prior state as of this point in the batch: a pending entry
            // shadows the store.
            let prior: Option<Obj> = match pending.get(&key) {
                Some(Event::Deleted(_)) => None,
                Some(ev) => Some(ev.latest().clone()),
                None => self.store.get(&key),
            };
            let ev = match se.kind {
                SourceEventKind::Added | SourceEventKind::Updated => match prior {
                    // Same version replayed; nothing changed.
                    Some(old) if old.resource_version == se.obj.resource_version => continue,
                    Some(old) => Event::Updated { old, new: se.obj },
                    None => Event::Added(se.obj),
                },
                SourceEventKind::Deleted => match prior {
                    Some(last) => Event::Deleted(last),
                    // Replayed delete for a key consumers never saw;
                    // the store holds nothing to remove either.
                    None => {
                        debug!(key = %key, "ignoring delete for unknown key");
                        continue;
                    }
                },
            };
            pending.push(ev);
        }
        for ev in pending.drain_ready() {
            match &ev {
                Event::Added(o) | Event::Updated { new: o, .. } => {
                    self.store.insert(o.clone());
                }
                Event::Deleted(o) => {
                    self.store.delete(&o.key());
                }
            }
            metrics::counter!("mirra_events_applied_total", 1u64);
            self.queue.push(ev);
        }
    }

    /// Diff a full listing against current store contents. Keys absent
    /// from the listing are synthetic deletes; unchanged resource
    /// versions emit nothing, so relisting the same snapshot is a no-op.
    fn reconcile(&mut self, items: Vec<Obj>) -> usize {
        let mut seen: FxHashSet<mirra_core::ObjKey> = FxHashSet::default();
        let mut emitted = 0usize;
        for obj in items {
            let key = obj.key();
            seen.insert(key.clone());
            match self.store.get(&key) {
                Some(cur) if cur.resource_version == obj.resource_version => {}
                Some(cur) => {
                    self.store.insert(obj.clone());
                    self.queue.push(Event::Updated { old: cur, new: obj });
                    emitted += 1;
                }
                None => {
                    self.store.insert(obj.clone());
                    self.queue.push(Event::Added(obj));
                    emitted += 1;
                }
            }
        }
        for key in self.store.keys() {
            if !seen.contains(&key) {
                if let Some(last) = self.store.delete(&key) {
                    self.queue.push(Event::Deleted(last));
                    emitted += 1;
                }
            }
        }
        if emitted > 0 {
            metrics::counter!("mirra_events_applied_total", emitted as u64);
        }
        emitted
    }

    /// Cancellable sleep; false means the token fired.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

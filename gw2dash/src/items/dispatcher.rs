//! Batch dispatcher: owns the debounce timer and turns pending ids into bulk lookups.

use super::cache::CachedItem;
use super::collector::Shared;
use super::upstream::ItemLookup;
use super::ItemDetail;
use crate::types::ItemId;
use futures::future::join_all;
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Drives flushes for one [`BatchCollector`](super::BatchCollector).
///
/// Spawn [`run`](Self::run) once; it returns after the shutdown token fires and every
/// outstanding lookup has written its results.
pub struct BatchDispatcher<L> {
    shared: Arc<Shared>,
    lookup: Arc<L>,
}

impl<L: ItemLookup> BatchDispatcher<L> {
    pub(crate) fn new(shared: Arc<Shared>, lookup: Arc<L>) -> Self {
        Self { shared, lookup }
    }

    pub async fn run(self, shutdown_token: CancellationToken) {
        let settings = &self.shared.settings;
        info!(
            debounce_ms = settings.debounce_window.as_millis() as u64,
            max_coalesce_ms = settings.max_coalesce_delay.as_millis() as u64,
            max_batch_size = settings.max_batch_size,
            "Item batch dispatcher started"
        );

        let mut join_set = JoinSet::new();

        loop {
            // Clean up completed flushes
            while let Some(result) = join_set.try_join_next() {
                if let Err(e) = result {
                    error!("Item flush task panicked: {}", e);
                }
            }

            let deadline = self.shared.state.lock().flush_deadline(settings);

            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("Shutdown signal received, flushing pending item requests");
                    self.flush(&mut join_set);
                    while let Some(result) = join_set.join_next().await {
                        if let Err(e) = result {
                            error!("Item flush task panicked: {}", e);
                        }
                    }
                    info!("Item batch dispatcher shutdown complete");
                    break;
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // A request may have pushed the deadline back while we slept
                    let due = self
                        .shared
                        .state
                        .lock()
                        .flush_deadline(settings)
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if due {
                        self.flush(&mut join_set);
                    }
                }

                // New request: loop around and recompute the deadline
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    /// Snapshot-and-clear the pending set and look it up in the background.
    fn flush(&self, join_set: &mut JoinSet<()>) {
        let batch = self.shared.state.lock().take_pending();
        if batch.is_empty() {
            return;
        }

        counter!("gw2dash_item_flushes_total").increment(1);
        histogram!("gw2dash_item_flush_size").record(batch.len() as f64);

        let max_batch_size = self.shared.settings.max_batch_size.max(1);
        let chunks: Vec<Vec<ItemId>> = batch.chunks(max_batch_size).map(<[ItemId]>::to_vec).collect();
        let span = info_span!("flush_item_batch", batch_size = batch.len(), chunks = chunks.len());

        let shared = self.shared.clone();
        let lookup = self.lookup.clone();
        join_set.spawn(
            async move {
                debug!("Dispatching item batch");
                join_all(chunks.into_iter().map(|chunk| dispatch_chunk(&shared, lookup.as_ref(), chunk))).await;
            }
            .instrument(span),
        );
    }
}

/// Look one chunk up and write one cache entry per id.
///
/// Failures stay inside the chunk: every id of a failed chunk gets a failure sentinel and no other
/// chunk is affected.
async fn dispatch_chunk<L: ItemLookup>(shared: &Shared, lookup: &L, chunk: Vec<ItemId>) {
    let guard = InFlightGuard::new(shared, chunk);
    let ids = guard.ids();

    match tokio::time::timeout(shared.settings.upstream_timeout, lookup.lookup(ids)).await {
        Ok(Ok(items)) => {
            let mut found: HashMap<ItemId, ItemDetail> = items.into_iter().map(|item| (item.id, item)).collect();
            let mut missing = 0usize;
            for &id in ids {
                match found.remove(&id) {
                    Some(item) => shared.cache.set(id, CachedItem::Found(Arc::new(item))),
                    None => {
                        missing += 1;
                        shared.cache.set(id, CachedItem::Missing)
                    }
                };
            }
            counter!("gw2dash_item_chunks_total", "result" => "ok").increment(1);
            debug!(chunk_size = ids.len(), missing, "Item chunk resolved");
        }
        Ok(Err(e)) => {
            error!(chunk_size = ids.len(), error = %e, "Item chunk lookup failed");
            counter!("gw2dash_item_chunks_total", "result" => "error").increment(1);
            guard.fail_all(&e.to_string());
        }
        Err(_) => {
            let message = format!("upstream did not answer within {:?}", shared.settings.upstream_timeout);
            warn!(chunk_size = ids.len(), "Item chunk lookup timed out");
            counter!("gw2dash_item_chunks_total", "result" => "timeout").increment(1);
            guard.fail_all(&message);
        }
    }

    guard.complete();
}

/// Releases a chunk's ids from the in-flight set when dropped.
///
/// If the chunk never completed (the lookup panicked or the task was aborted), every id gets a
/// failure sentinel first so waiters fail fast instead of running into their ceiling.
struct InFlightGuard<'a> {
    shared: &'a Shared,
    ids: Vec<ItemId>,
    completed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(shared: &'a Shared, ids: Vec<ItemId>) -> Self {
        Self {
            shared,
            ids,
            completed: false,
        }
    }

    fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    fn fail_all(&self, message: &str) {
        let message: Arc<str> = Arc::from(message);
        for &id in &self.ids {
            self.shared.cache.set(id, CachedItem::Failed(message.clone()));
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(chunk_size = self.ids.len(), "Item chunk dropped before completing");
            self.fail_all("item lookup aborted");
        }
        // Cache entries are written before the ids leave the in-flight set
        let mut state = self.shared.state.lock();
        for id in &self.ids {
            state.in_flight.remove(id);
        }
    }
}

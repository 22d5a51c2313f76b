//! Request collector: turns single-item requests into a pending batch.

use super::cache::ResultCache;
use super::dispatcher::BatchDispatcher;
use super::upstream::ItemLookup;
use super::waiter::ItemWaiter;
use super::BatchSettings;
use crate::types::{InvalidItemId, ItemId};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Pending and in-flight ids plus the timestamps that drive the debounce deadline.
#[derive(Debug, Default)]
pub(crate) struct BatchState {
    pub(crate) pending: HashSet<ItemId>,
    pub(crate) in_flight: HashSet<ItemId>,
    pub(crate) first_request_at: Option<Instant>,
    pub(crate) last_request_at: Option<Instant>,
}

impl BatchState {
    /// When the pending batch is due, or `None` if nothing is pending.
    ///
    /// The debounce window is measured from the most recent request, but never pushes the flush
    /// past `first request + max_coalesce_delay`.
    pub(crate) fn flush_deadline(&self, settings: &BatchSettings) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        let (first, last) = (self.first_request_at?, self.last_request_at?);
        Some((last + settings.debounce_window).min(first + settings.max_coalesce_delay))
    }

    /// Snapshot-and-clear: move every pending id into the in-flight set.
    pub(crate) fn take_pending(&mut self) -> Vec<ItemId> {
        let mut batch: Vec<ItemId> = self.pending.drain().collect();
        batch.sort_unstable();
        self.in_flight.extend(batch.iter().copied());
        self.first_request_at = None;
        self.last_request_at = None;
        batch
    }
}

/// State shared by the collector handles, the dispatcher and its flush tasks.
pub(crate) struct Shared {
    pub(crate) state: Mutex<BatchState>,
    pub(crate) wake: Notify,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) settings: BatchSettings,
}

/// Cheap, cloneable handle for requesting item details.
#[derive(Clone)]
pub struct BatchCollector {
    shared: Arc<Shared>,
}

/// Queue sizes at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub cached: usize,
    pub pending: usize,
    pub in_flight: usize,
}

impl BatchCollector {
    /// Creates a collector and the dispatcher that serves it.
    ///
    /// The dispatcher does nothing until [`BatchDispatcher::run`] is spawned; requests made before
    /// that simply wait in the pending set.
    pub fn new<L: ItemLookup>(settings: BatchSettings, cache: Arc<ResultCache>, lookup: Arc<L>) -> (Self, BatchDispatcher<L>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(BatchState::default()),
            wake: Notify::new(),
            cache,
            settings,
        });
        let dispatcher = BatchDispatcher::new(shared.clone(), lookup);
        (Self { shared }, dispatcher)
    }

    /// Validate a raw id and request it.
    pub fn request_item(&self, raw_id: i64) -> Result<ItemWaiter, InvalidItemId> {
        let id = ItemId::try_from(raw_id)?;
        Ok(self.request(id))
    }

    /// Request one item.
    ///
    /// A fresh cache entry resolves the returned waiter immediately. An id that is already queued
    /// or in flight is not queued again; its waiter is resolved by the outstanding lookup.
    pub fn request(&self, id: ItemId) -> ItemWaiter {
        let cache = &self.shared.cache;
        if let Some(entry) = cache.get(id).filter(|entry| cache.is_fresh(entry)) {
            counter!("gw2dash_item_requests_total", "outcome" => "cache_hit").increment(1);
            return ItemWaiter::ready(id, entry.item.to_result(id));
        }

        // Subscribe before touching the pending set so the resolution cannot slip past us
        let receiver = cache.subscribe();

        let mut state = self.shared.state.lock();

        // Checked again under the lock: the dispatcher writes the cache before releasing in-flight ids
        let stale_generation = match cache.get(id) {
            Some(entry) if cache.is_fresh(&entry) => {
                counter!("gw2dash_item_requests_total", "outcome" => "cache_hit").increment(1);
                return ItemWaiter::ready(id, entry.item.to_result(id));
            }
            Some(entry) => Some(entry.generation),
            None => None,
        };

        if state.in_flight.contains(&id) {
            counter!("gw2dash_item_requests_total", "outcome" => "in_flight").increment(1);
            trace!(item_id = %id, "Joining in-flight lookup");
        } else {
            let newly_queued = state.pending.insert(id);
            let now = Instant::now();
            state.first_request_at.get_or_insert(now);
            state.last_request_at = Some(now);
            drop(state);

            let outcome = if newly_queued { "queued" } else { "coalesced" };
            counter!("gw2dash_item_requests_total", "outcome" => outcome).increment(1);
            trace!(item_id = %id, outcome, "Item requested");
            self.shared.wake.notify_one();
        }

        ItemWaiter::pending(id, cache.clone(), receiver, stale_generation, self.shared.settings.wait_timeout)
    }

    /// Request several items; duplicates in `ids` share one waiter target.
    pub fn request_many(&self, ids: impl IntoIterator<Item = ItemId>) -> Vec<ItemWaiter> {
        ids.into_iter().map(|id| self.request(id)).collect()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.shared.cache
    }

    pub fn stats(&self) -> CollectorStats {
        let state = self.shared.state.lock();
        CollectorStats {
            cached: self.shared.cache.len(),
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::CachedItem;
    use crate::items::upstream::MockItemLookup;
    use crate::test_utils::{item_id, sample_item};
    use std::time::Duration;

    fn collector() -> (BatchCollector, BatchDispatcher<MockItemLookup>) {
        let cache = Arc::new(ResultCache::new(Duration::from_secs(3600), Duration::from_secs(30)));
        BatchCollector::new(BatchSettings::default(), cache, Arc::new(MockItemLookup::new()))
    }

    #[test]
    fn test_flush_deadline_empty() {
        let state = BatchState::default();
        assert!(state.flush_deadline(&BatchSettings::default()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_deadline_follows_last_request_until_cap() {
        let settings = BatchSettings::default();
        let start = Instant::now();
        let mut state = BatchState::default();
        state.pending.insert(item_id(1));
        state.first_request_at = Some(start);
        state.last_request_at = Some(start + Duration::from_millis(40));

        assert_eq!(state.flush_deadline(&settings), Some(start + Duration::from_millis(90)));

        state.last_request_at = Some(start + Duration::from_millis(480));
        assert_eq!(state.flush_deadline(&settings), Some(start + Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_take_pending_moves_ids_in_flight() {
        let mut state = BatchState::default();
        state.pending.extend([item_id(3), item_id(1), item_id(2)]);
        state.first_request_at = Some(Instant::now());
        state.last_request_at = state.first_request_at;

        let batch = state.take_pending();

        assert_eq!(batch, vec![item_id(1), item_id(2), item_id(3)]);
        assert!(state.pending.is_empty());
        assert_eq!(state.in_flight.len(), 3);
        assert!(state.first_request_at.is_none());
    }

    #[test]
    fn test_request_item_rejects_invalid_id() {
        let (collector, _dispatcher) = collector();
        assert!(collector.request_item(0).is_err());
        assert!(collector.request_item(-3).is_err());
        assert_eq!(collector.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_duplicate_requests_share_one_pending_slot() {
        let (collector, _dispatcher) = collector();
        let first = collector.request_item(42).unwrap();
        let second = collector.request_item(42).unwrap();

        assert!(!first.is_ready() && !second.is_ready());
        assert_eq!(collector.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_entry_short_circuits() {
        let (collector, _dispatcher) = collector();
        collector.cache().set(item_id(7), CachedItem::Found(Arc::new(sample_item(7, "Seven"))));

        let waiter = collector.request(item_id(7));

        assert!(waiter.is_ready());
        assert_eq!(collector.stats().pending, 0);
        assert_eq!(waiter.wait().await.unwrap().name, "Seven");
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_wait_for_state_lock() {
        let (collector, _dispatcher) = collector();
        collector.cache().set(item_id(9), CachedItem::Found(Arc::new(sample_item(9, "Nine"))));

        let _held = collector.shared.state.lock();
        let waiter = collector.request(item_id(9));

        assert!(waiter.is_ready());
    }

    #[tokio::test]
    async fn test_in_flight_id_is_not_requeued() {
        let (collector, _dispatcher) = collector();
        collector.request(item_id(8));
        collector.shared.state.lock().take_pending();

        collector.request(item_id(8));

        let stats = collector.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 1);
    }
}

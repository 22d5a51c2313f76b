//! Process-wide result cache for item lookups.
//!
//! Entries are never removed. Age only decides whether a *new* request for the id starts a
//! fresh lookup cycle: found/missing entries stay fresh for `freshness`, failure sentinels for
//! the much shorter `failure_retry_after`.

use super::{FetchFailure, ItemDetail, ItemResult};
use crate::types::ItemId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Capacity of the resolution channel. Waiters that fall further behind than this re-read the
/// cache instead of missing their id.
const RESOLUTION_CHANNEL_CAPACITY: usize = 1024;

/// What the cache knows about one id.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedItem {
    Found(Arc<ItemDetail>),
    /// Upstream answered but did not return this id
    Missing,
    /// Failure sentinel: the lookup covering this id failed
    Failed(Arc<str>),
}

impl CachedItem {
    pub fn to_result(&self, id: ItemId) -> ItemResult {
        match self {
            CachedItem::Found(item) => Ok(item.clone()),
            CachedItem::Missing => Err(FetchFailure::NotFound { id }),
            CachedItem::Failed(message) => Err(FetchFailure::UpstreamUnavailable {
                message: message.to_string(),
            }),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CachedItem::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub item: CachedItem,
    /// Cache-wide write sequence number; later writes always carry a larger value
    pub generation: u64,
    pub stored_at: Instant,
}

/// Concurrent id → entry map with a broadcast of every write.
pub struct ResultCache {
    entries: DashMap<ItemId, CacheEntry>,
    generation: AtomicU64,
    resolved: broadcast::Sender<ItemId>,
    freshness: Duration,
    failure_retry_after: Duration,
}

impl ResultCache {
    pub fn new(freshness: Duration, failure_retry_after: Duration) -> Self {
        let (resolved, _) = broadcast::channel(RESOLUTION_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            resolved,
            freshness,
            failure_retry_after,
        }
    }

    pub fn get(&self, id: ItemId) -> Option<CacheEntry> {
        self.entries.get(&id).map(|entry| entry.clone())
    }

    /// Store a resolution and notify waiters. Returns the entry's generation.
    pub fn set(&self, id: ItemId, item: CachedItem) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            id,
            CacheEntry {
                item,
                generation,
                stored_at: Instant::now(),
            },
        );
        // No receivers just means nobody is waiting right now
        let _ = self.resolved.send(id);
        generation
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let ttl = if entry.item.is_failure() {
            self.failure_retry_after
        } else {
            self.freshness
        };
        entry.stored_at.elapsed() < ttl
    }

    /// Subscribe to resolution notifications (the id of every write).
    pub fn subscribe(&self) -> broadcast::Receiver<ItemId> {
        self.resolved.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Per-item waiter: one caller's interest in one id.

use super::cache::ResultCache;
use super::{FetchFailure, ItemResult};
use crate::types::ItemId;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Awaitable handle returned by [`BatchCollector::request`](super::BatchCollector::request).
///
/// Dropping a waiter does not cancel anything: the id stays queued or in flight and the result
/// still lands in the cache for everyone else.
pub struct ItemWaiter {
    id: ItemId,
    default_ceiling: Duration,
    state: WaiterState,
}

enum WaiterState {
    Ready(ItemResult),
    Pending {
        cache: Arc<ResultCache>,
        receiver: broadcast::Receiver<ItemId>,
        /// Generation of a stale entry seen at request time; only newer entries resolve us
        stale_generation: Option<u64>,
    },
}

impl ItemWaiter {
    pub(crate) fn ready(id: ItemId, result: ItemResult) -> Self {
        Self {
            id,
            default_ceiling: Duration::ZERO,
            state: WaiterState::Ready(result),
        }
    }

    pub(crate) fn pending(
        id: ItemId,
        cache: Arc<ResultCache>,
        receiver: broadcast::Receiver<ItemId>,
        stale_generation: Option<u64>,
        default_ceiling: Duration,
    ) -> Self {
        Self {
            id,
            default_ceiling,
            state: WaiterState::Pending {
                cache,
                receiver,
                stale_generation,
            },
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Whether the result was already known when the waiter was created.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, WaiterState::Ready(_))
    }

    /// Wait with the collector's configured ceiling.
    pub async fn wait(self) -> ItemResult {
        let ceiling = self.default_ceiling;
        self.wait_timeout(ceiling).await
    }

    /// Wait for the cache to hold a resolution for this id, giving up after `ceiling`.
    pub async fn wait_timeout(self, ceiling: Duration) -> ItemResult {
        let id = self.id;
        let (cache, mut receiver, stale_generation) = match self.state {
            WaiterState::Ready(result) => return result,
            WaiterState::Pending {
                cache,
                receiver,
                stale_generation,
            } => (cache, receiver, stale_generation),
        };

        let accept = |cache: &ResultCache| -> Option<ItemResult> {
            let entry = cache.get(id)?;
            match stale_generation {
                Some(stale) if entry.generation <= stale => None,
                _ => Some(entry.item.to_result(id)),
            }
        };

        // The resolution may have landed between registration and now
        if let Some(result) = accept(&cache) {
            return result;
        }

        let deadline = Instant::now() + ceiling;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Ok(resolved)) if resolved == id => {
                    if let Some(result) = accept(&cache) {
                        return result;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    trace!(item_id = %id, skipped, "Waiter lagged behind resolutions, re-reading cache");
                    if let Some(result) = accept(&cache) {
                        return result;
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    // The cache owns the sender, so this only happens while tearing down
                    return accept(&cache).unwrap_or_else(|| {
                        Err(FetchFailure::UpstreamUnavailable {
                            message: "result cache closed".to_string(),
                        })
                    });
                }
                Err(_) => {
                    debug!(item_id = %id, ceiling_ms = ceiling.as_millis() as u64, "Item waiter timed out");
                    counter!("gw2dash_item_waiter_timeouts_total").increment(1);
                    return Err(FetchFailure::WaiterTimeout { id, waited: ceiling });
                }
            }
        }
    }
}

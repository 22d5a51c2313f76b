use crate::items::{CollectorStats, ItemDetail};
use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

/// Query parameters for bulk item lookup
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ItemsQuery {
    /// Comma-separated item ids, e.g. `19684,19709,46731`
    #[param(example = "19684,19709")]
    pub ids: String,
}

/// Result of a bulk item lookup.
///
/// Every distinct requested id appears in exactly one of the three lists.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ItemsResponse {
    /// Items that were found, in request order
    #[schema(value_type = Vec<ItemDetail>)]
    pub items: Vec<Arc<ItemDetail>>,
    /// Ids the GW2 API does not know
    pub missing: Vec<ItemId>,
    /// Ids whose lookup failed or timed out; retrying later may succeed
    pub failed: Vec<FailedItem>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FailedItem {
    pub id: ItemId,
    pub reason: String,
}

/// Snapshot of the batching layer
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ItemStatsResponse {
    /// Entries in the result cache, fresh or stale
    pub cached: usize,
    /// Ids waiting for the next flush
    pub pending: usize,
    /// Ids whose upstream lookup is running
    pub in_flight: usize,
}

impl From<CollectorStats> for ItemStatsResponse {
    fn from(stats: CollectorStats) -> Self {
        Self {
            cached: stats.cached,
            pending: stats.pending,
            in_flight: stats.in_flight,
        }
    }
}

//! Batched, de-duplicated item detail lookups.
//!
//! Inventories render one icon per slot, and every icon wants the detail of a single item. Asking
//! the GW2 API once per icon is an N+1 storm, so this module coalesces those single-item requests
//! into bulk `/v2/items?ids=...` calls.
//!
//! # Architecture
//!
//! ```text
//! caller → BatchCollector::request_item(id) ──► ItemWaiter ──────────────┐
//!                 │                                                       │ (wakes on
//!        [pending set + debounce deadline]                                │  resolution)
//!                 │  Notify                                               │
//!                 ▼                                                       │
//!          BatchDispatcher::run ── deadline elapsed ──► snapshot & clear   │
//!                                                            │            │
//!                                          chunks of ≤ max_batch_size     │
//!                                                            │            │
//!                                          ItemLookup::lookup (per chunk) │
//!                                                            ▼            │
//!                                                      ResultCache ───────┘
//! ```
//!
//! - **Collector** ([`collector`]): validates the id, answers immediately from a fresh cache
//!   entry, otherwise adds the id to the pending set and pushes the flush deadline back to
//!   `last request + debounce_window`, capped at `first request + max_coalesce_delay`.
//! - **Dispatcher** ([`dispatcher`]): owns the single timer. On flush it moves the pending set
//!   into the in-flight set, splits it into chunks and looks every chunk up concurrently. Each
//!   chunk writes either its items or a failure sentinel into the cache; chunk failures are
//!   isolated from each other.
//! - **Cache** ([`cache`]): the single source of truth. Every write is broadcast so waiters can
//!   re-read their entry.
//! - **Waiter** ([`waiter`]): resolves from the cache, with a ceiling so a lost dispatch turns
//!   into [`FetchFailure::WaiterTimeout`] instead of a hang.

pub mod cache;
pub mod collector;
pub mod dispatcher;
pub mod upstream;
pub mod waiter;


use crate::config::Config;
use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

pub use cache::{CacheEntry, CachedItem, ResultCache};
pub use collector::{BatchCollector, CollectorStats};
pub use dispatcher::BatchDispatcher;
pub use upstream::{ItemLookup, LookupError, ReqwestItemLookup};
pub use waiter::ItemWaiter;

/// Item rarity tiers, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum Rarity {
    Junk,
    Basic,
    Fine,
    Masterwork,
    Rare,
    Exotic,
    Ascended,
    Legendary,
}

/// Item detail as returned by the GW2 `/v2/items` endpoint.
///
/// Only the fields the dashboard renders are kept; unknown fields (`details`, `game_types`,
/// `upgrades_into`, ...) are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ItemDetail {
    pub id: ItemId,
    pub name: String,
    /// Render service URL of the item icon
    #[serde(default)]
    pub icon: String,
    pub rarity: Rarity,
    /// Item type, e.g. `Weapon`, `CraftingMaterial`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chat_link: String,
    #[serde(default)]
    pub vendor_value: u64,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Why one caller did not get an item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    /// The bulk lookup covering this id failed (network, HTTP status, decode or timeout)
    #[error("upstream item lookup failed: {message}")]
    UpstreamUnavailable { message: String },

    /// The upstream answered but does not know this id
    #[error("item {id} does not exist upstream")]
    NotFound { id: ItemId },

    /// The waiter's ceiling elapsed before any resolution reached the cache
    #[error("timed out after {waited:?} waiting for item {id}")]
    WaiterTimeout { id: ItemId, waited: Duration },
}

/// Resolution handed to one waiter.
pub type ItemResult = Result<Arc<ItemDetail>, FetchFailure>;

/// Tuning knobs shared by the collector, dispatcher and waiters.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Flush delay measured from the most recent request in a burst
    pub debounce_window: Duration,
    /// Upper bound on how long the first request of a batch may be held back
    pub max_coalesce_delay: Duration,
    /// Largest number of ids sent in one upstream call
    pub max_batch_size: usize,
    /// Timeout applied to each chunk lookup
    pub upstream_timeout: Duration,
    /// Default ceiling for [`ItemWaiter::wait`]
    pub wait_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
            max_coalesce_delay: Duration::from_millis(500),
            max_batch_size: 200,
            upstream_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for BatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            debounce_window: config.batching.debounce_window,
            max_coalesce_delay: config.batching.max_coalesce_delay,
            max_batch_size: config.upstream.max_batch_size,
            upstream_timeout: config.upstream.request_timeout,
            wait_timeout: config.batching.wait_timeout,
        }
    }
}

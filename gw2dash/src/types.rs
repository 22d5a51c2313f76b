//! Common type definitions.
//!
//! # ID Types
//!
//! - [`ItemId`]: identifier of one in-game item type, as issued by the GW2 API
//!
//! Item ids are validated once at the call boundary ([`ItemId::try_from`] /
//! [`str::parse`]); everything past that point works with the newtype and never
//! sees a non-positive id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

/// Identifier of an item type in the GW2 API (always positive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "i64", into = "u32")]
#[schema(value_type = u32)]
pub struct ItemId(u32);

/// Rejected item identifier (non-positive, out of range or not a number).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid item id '{raw}': {reason}")]
pub struct InvalidItemId {
    pub raw: String,
    pub reason: &'static str,
}

impl ItemId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for ItemId {
    type Error = InvalidItemId;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            return Err(InvalidItemId {
                raw: value.to_string(),
                reason: "must be positive",
            });
        }
        u32::try_from(value).map(ItemId).map_err(|_| InvalidItemId {
            raw: value.to_string(),
            reason: "out of range",
        })
    }
}

impl FromStr for ItemId {
    type Err = InvalidItemId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value: i64 = trimmed.parse().map_err(|_| InvalidItemId {
            raw: trimmed.to_string(),
            reason: "not an integer",
        })?;
        Self::try_from(value).map_err(|e| InvalidItemId {
            raw: trimmed.to_string(),
            ..e
        })
    }
}

impl From<ItemId> for u32 {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a comma-separated id list such as `"19684,19709, 24"`.
///
/// Empty segments are skipped; duplicates are kept (callers deduplicate where it matters).
pub fn parse_id_list(raw: &str) -> Result<Vec<ItemId>, InvalidItemId> {
    raw.split(',').filter(|s| !s.trim().is_empty()).map(str::parse).collect()
}

//! API request and response data models.
//!
//! Item details themselves are served in their upstream shape ([`crate::items::ItemDetail`]);
//! the models here wrap them for bulk responses and diagnostics.

pub mod items;

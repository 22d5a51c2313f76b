//! HTTP request handlers.
//!
//! - [`items`]: item detail lookups backed by the batching layer

pub mod items;

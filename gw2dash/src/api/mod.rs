//! HTTP API for the dashboard frontend.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! Routes live under `/api/v1` and are documented with `utoipa`; the generated document is served
//! at `/api-docs/openapi.json`.

pub mod handlers;
pub mod models;

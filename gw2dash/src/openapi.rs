//! OpenAPI document for the `/api/v1` surface, served at `/api-docs/openapi.json`.

use utoipa::OpenApi;

use crate::api;
use crate::api::models::items::{FailedItem, ItemStatsResponse, ItemsQuery, ItemsResponse};
use crate::items::{ItemDetail, Rarity};
use crate::types::ItemId;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "gw2dash",
        description = "Guild Wars 2 item details for the dashboard, batched and cached in front of the official API."
    ),
    servers(
        (url = "/api/v1", description = "Dashboard API")
    ),
    paths(
        api::handlers::items::get_item,
        api::handlers::items::get_items,
        api::handlers::items::get_item_stats,
    ),
    components(
        schemas(ItemId, ItemDetail, Rarity, ItemsQuery, ItemsResponse, FailedItem, ItemStatsResponse)
    ),
    tags(
        (name = "items", description = "Item detail lookups"),
    )
)]
pub struct ApiDoc;

//! HTTP handlers for item detail lookups.
//!
//! Every handler goes through the shared [`BatchCollector`](crate::items::BatchCollector), so a
//! page that fires one `GET /api/v1/items/{id}` per inventory slot still costs only a handful of
//! upstream calls.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use futures::future::join_all;
use std::collections::HashSet;

use crate::{
    AppState,
    api::models::items::{FailedItem, ItemStatsResponse, ItemsQuery, ItemsResponse},
    errors::{Error, Result},
    items::{FetchFailure, ItemDetail},
    types::{ItemId, parse_id_list},
};

#[utoipa::path(
    get,
    path = "/items/{id}",
    tag = "items",
    summary = "Get item",
    description = "Get the details of one item. Concurrent requests are coalesced into bulk upstream lookups.",
    params(
        ("id" = u32, Path, description = "GW2 item id"),
    ),
    responses(
        (status = 200, description = "Item details", body = ItemDetail),
        (status = 400, description = "Invalid item id"),
        (status = 404, description = "Item does not exist"),
        (status = 502, description = "GW2 API unavailable"),
        (status = 504, description = "Timed out waiting for the GW2 API"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_item(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ItemDetail>> {
    let id: ItemId = id.parse()?;
    let item = state.items.request(id).wait().await?;
    Ok(Json(item.as_ref().clone()))
}

#[utoipa::path(
    get,
    path = "/items",
    tag = "items",
    summary = "Get items",
    description = "Get the details of several items at once. Unknown and failed ids are reported instead of failing the whole request.",
    params(ItemsQuery),
    responses(
        (status = 200, description = "Lookup results", body = ItemsResponse),
        (status = 400, description = "Invalid or too many item ids"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_items(State(state): State<AppState>, Query(query): Query<ItemsQuery>) -> Result<Json<ItemsResponse>> {
    let ids = parse_id_list(&query.ids)?;

    // Keep request order, drop repeats
    let mut seen = HashSet::new();
    let ids: Vec<ItemId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();

    if ids.is_empty() {
        return Err(Error::BadRequest {
            message: "ids must contain at least one item id".to_string(),
        });
    }
    if ids.len() > state.config.max_ids_per_request {
        return Err(Error::BadRequest {
            message: format!(
                "too many item ids: {} requested, at most {} allowed",
                ids.len(),
                state.config.max_ids_per_request
            ),
        });
    }

    let waiters = state.items.request_many(ids.iter().copied());
    let results = join_all(waiters.into_iter().map(|waiter| waiter.wait())).await;

    let mut response = ItemsResponse {
        items: Vec::new(),
        missing: Vec::new(),
        failed: Vec::new(),
    };
    for (id, result) in ids.into_iter().zip(results) {
        match result {
            Ok(item) => response.items.push(item),
            Err(FetchFailure::NotFound { .. }) => response.missing.push(id),
            Err(failure) => response.failed.push(FailedItem {
                id,
                reason: failure.to_string(),
            }),
        }
    }

    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/items/stats",
    tag = "items",
    summary = "Get batching stats",
    description = "Cache size and the number of ids waiting for or undergoing an upstream lookup.",
    responses(
        (status = 200, description = "Batching stats", body = ItemStatsResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_item_stats(State(state): State<AppState>) -> Json<ItemStatsResponse> {
    Json(state.items.stats().into())
}

#[cfg(test)]
mod tests {
    use crate::api::models::items::{ItemStatsResponse, ItemsResponse};
    use crate::items::ItemDetail;
    use crate::items::upstream::MockItemLookup;
    use crate::test_utils::{create_test_app, item_id, sample_item};
    use axum::http::StatusCode;

    #[test_log::test(tokio::test)]
    async fn test_get_item() {
        let lookup = MockItemLookup::with_items([sample_item(19684, "Mithril Ingot")]);
        let (server, _services) = create_test_app(lookup.clone());

        let response = server.get("/api/v1/items/19684").await;

        response.assert_status_ok();
        let item: ItemDetail = response.json();
        assert_eq!(item.name, "Mithril Ingot");
        assert_eq!(lookup.call_count(), 1);
    }

    #[tokio::test]
    async fn test_get_item_invalid_id() {
        let (server, _services) = create_test_app(MockItemLookup::new());

        for path in ["/api/v1/items/0", "/api/v1/items/-5", "/api/v1/items/abc"] {
            server.get(path).await.assert_status(StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_get_item_unknown() {
        let (server, _services) = create_test_app(MockItemLookup::new());

        server.get("/api/v1/items/999999").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_item_upstream_failure() {
        let lookup = MockItemLookup::new();
        lookup.fail_on(item_id(1));
        let (server, _services) = create_test_app(lookup);

        let response = server.get("/api/v1/items/1").await;

        response.assert_status(StatusCode::BAD_GATEWAY);
        assert!(!response.text().contains("mock upstream"));
    }

    #[tokio::test]
    async fn test_concurrent_item_requests_are_batched() {
        let lookup = MockItemLookup::with_items((1..=5).map(|id| sample_item(id, &format!("Item {id}"))));
        let (server, _services) = create_test_app(lookup.clone());

        let paths: Vec<String> = (1..=5).map(|id| format!("/api/v1/items/{id}")).collect();
        let responses = futures::future::join_all(paths.iter().map(|path| async { server.get(path).await })).await;

        for response in responses {
            response.assert_status_ok();
        }
        assert_eq!(lookup.call_count(), 1);
    }

    #[tokio::test]
    async fn test_get_items_partitions_results() {
        let lookup = MockItemLookup::with_items([sample_item(1, "One"), sample_item(2, "Two"), sample_item(3, "Three")]);
        lookup.fail_on(item_id(3));
        let (server, _services) = create_test_app(lookup.clone());

        // 3 fails the whole chunk it lands in, so request 3 on its own first
        let failed: ItemsResponse = server.get("/api/v1/items").add_query_param("ids", "3").await.json();
        assert_eq!(failed.failed.len(), 1);
        assert_eq!(failed.failed[0].id, item_id(3));

        let response = server.get("/api/v1/items").add_query_param("ids", "2, 1,404,2").await;

        response.assert_status_ok();
        let body: ItemsResponse = response.json();
        let names: Vec<&str> = body.items.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, vec!["Two", "One"]);
        assert_eq!(body.missing, vec![item_id(404)]);
        assert!(body.failed.is_empty());
        assert_eq!(lookup.call_count(), 2);
    }

    #[tokio::test]
    async fn test_get_items_rejects_bad_input() {
        let (server, _services) = create_test_app(MockItemLookup::new());

        server.get("/api/v1/items").add_query_param("ids", "").await.assert_status(StatusCode::BAD_REQUEST);
        server.get("/api/v1/items").add_query_param("ids", "1,x").await.assert_status(StatusCode::BAD_REQUEST);
        server.get("/api/v1/items").await.assert_status(StatusCode::BAD_REQUEST);

        let too_many = (1..=1001).map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        server
            .get("/api/v1/items")
            .add_query_param("ids", too_many)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_item_stats() {
        let lookup = MockItemLookup::with_items([sample_item(1, "One")]);
        let (server, _services) = create_test_app(lookup);

        server.get("/api/v1/items/1").await.assert_status_ok();
        server.get("/api/v1/items/2").await.assert_status(StatusCode::NOT_FOUND);

        let stats: ItemStatsResponse = server.get("/api/v1/items/stats").await.json();
        assert_eq!(stats.cached, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }
}

//! # gw2dash: Guild Wars 2 dashboard backend
//!
//! `gw2dash` serves item details from the official Guild Wars 2 API to the dashboard frontend.
//! Inventory, bank and material-storage views render one icon per slot and ask for every slot's
//! item individually; this crate turns that storm of single-item requests into a few bulk
//! `/v2/items?ids=...` calls.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). Handlers never talk to the GW2 API
//! directly: they go through the batching layer in [`items`], which
//!
//! - collects requests for a short debounce window ([`items::BatchCollector`]),
//! - dispatches the distinct ids in chunks of at most 200 ([`items::BatchDispatcher`]),
//! - stores every outcome, including failures, in a shared cache ([`items::ResultCache`]),
//! - and wakes each caller when its id resolves ([`items::ItemWaiter`]).
//!
//! The dispatcher runs as a background task next to the server and is drained on shutdown, so
//! requests queued when SIGTERM arrives still get an answer.
//!
//! ## Configuration
//!
//! See [`config`]. Everything has a default; an empty config file gives a working server pointed
//! at `https://api.guildwars2.com/v2/`.
//!
//! ## Observability
//!
//! Logs and spans go through `tracing` ([`telemetry`]); batching counters are recorded with the
//! `metrics` facade and exported at `/internal/metrics` when `enable_metrics` is set.

pub mod api;
pub mod config;
pub mod errors;
pub mod items;
pub mod openapi;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
pub mod types;

use axum::{Json, Router, http::HeaderValue, routing::get};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

pub use config::Config;

use crate::config::CorsOrigin;
use crate::items::{BatchCollector, BatchSettings, ItemLookup, ReqwestItemLookup, ResultCache};
use crate::openapi::ApiDoc;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder().config(config).items(collector).build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub items: BatchCollector,
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            // Origins never carry a path, but Url always renders one
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new().allow_origin(origins);
    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router: health check, item API, OpenAPI document and optional metrics.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let api_routes = Router::new()
        .route("/items", get(api::handlers::items::get_items))
        .route("/items/stats", get(api::handlers::items::get_item_stats))
        .route("/items/{id}", get(api::handlers::items::get_item));

    let cors_layer = create_cors_layer(&state.config)?;
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api/v1", api_routes)
        .with_state(state)
        .layer(cors_layer);

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Background tasks that run next to the HTTP server.
///
/// Currently just the item batch dispatcher. Dropping this struct cancels the shutdown token via
/// `drop_guard`; call [`shutdown`](Self::shutdown) to also wait for outstanding lookups.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Build the batching layer and spawn its dispatcher.
fn setup_item_batching<L: ItemLookup>(config: &Config, lookup: L) -> (BatchCollector, BackgroundServices) {
    let shutdown_token = tokio_util::sync::CancellationToken::new();
    let cache = Arc::new(ResultCache::new(config.batching.freshness, config.batching.failure_retry_after));
    let (collector, dispatcher) = BatchCollector::new(BatchSettings::from(config), cache, Arc::new(lookup));

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_token.clone()));

    let services = BackgroundServices {
        background_tasks: vec![dispatcher_handle],
        drop_guard: Some(shutdown_token.clone().drop_guard()),
        shutdown_token,
    };
    (collector, services)
}

pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create an application backed by the real GW2 API.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let lookup = ReqwestItemLookup::new(&config.upstream)?;
        Self::with_lookup(config, lookup)
    }

    /// Create an application with a custom upstream lookup.
    ///
    /// Must be called from inside a tokio runtime; the batch dispatcher is spawned immediately.
    pub fn with_lookup<L: ItemLookup>(config: Config, lookup: L) -> anyhow::Result<Self> {
        debug!("Starting gw2dash with configuration: {:#?}", config);

        let (items, bg_services) = setup_item_batching(&config, lookup);
        let app_state = AppState::builder().config(config.clone()).items(items).build();
        let router = build_router(app_state)?;

        Ok(Self {
            router,
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "gw2dash listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Answer whatever is still queued before exiting
        info!("Draining item batch dispatcher...");
        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::items::upstream::MockItemLookup;
    use crate::test_utils::{create_test_config, sample_item};
    use axum::http::StatusCode;

    fn test_state(config: Config, lookup: MockItemLookup) -> (AppState, BackgroundServices) {
        let (items, services) = setup_item_batching(&config, lookup);
        (AppState::builder().config(config).items(items).build(), services)
    }

    #[tokio::test]
    async fn test_healthz_and_openapi() {
        let (server, _services) = crate::test_utils::create_test_app(MockItemLookup::new());

        let health_response = server.get("/healthz").await;
        health_response.assert_status_ok();
        assert_eq!(health_response.text(), "OK");

        let openapi_response = server.get("/api-docs/openapi.json").await;
        openapi_response.assert_status_ok();
        let document: serde_json::Value = openapi_response.json();
        assert!(document["paths"]["/items/{id}"].is_object());
        assert!(document["components"]["schemas"]["ItemDetail"].is_object());
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let (server, _services) = crate::test_utils::create_test_app(MockItemLookup::new());

        let response = server.get("/healthz").add_header("origin", "http://localhost:5173").await;

        assert_eq!(
            response.headers().get("access-control-allow-origin").map(|v| v.to_str().unwrap()),
            Some("http://localhost:5173")
        );
    }

    #[tokio::test]
    async fn test_build_router_with_metrics_disabled() {
        let (state, _services) = test_state(create_test_config(), MockItemLookup::new());
        let router = build_router(state).expect("Failed to build router");
        let server = axum_test::TestServer::new(router).expect("Failed to create test server");

        server.get("/internal/metrics").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_router_with_metrics_enabled() {
        let mut config = create_test_config();
        config.enable_metrics = true;
        let (state, _services) = test_state(config, MockItemLookup::with_items([sample_item(1, "One")]));
        let router = build_router(state).expect("Failed to build router");
        let server = axum_test::TestServer::new(router).expect("Failed to create test server");

        server.get("/api/v1/items/1").await.assert_status_ok();

        let metrics_response = server.get("/internal/metrics").await;
        metrics_response.assert_status_ok();
        let metrics_content = metrics_response.text();
        assert!(metrics_content.contains("gw2dash_item_requests_total"));
        assert!(metrics_content.contains("gw2dash_item_flushes_total"));
    }

    #[tokio::test]
    async fn test_background_services_shutdown_drains_queue() {
        let lookup = MockItemLookup::with_items([sample_item(7, "Seven")]);
        let (state, services) = test_state(create_test_config(), lookup.clone());

        let waiter = state.items.request(crate::test_utils::item_id(7));
        services.shutdown().await;

        assert_eq!(lookup.call_count(), 1);
        assert_eq!(waiter.wait().await.unwrap().name, "Seven");
    }
}

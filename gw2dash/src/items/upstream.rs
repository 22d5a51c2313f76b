//! Upstream item lookup against the GW2 REST API.
//!
//! This module defines the [`ItemLookup`] trait so the dispatcher can be driven by the real
//! reqwest client in production and by [`MockItemLookup`] in tests.

use super::ItemDetail;
use crate::config::UpstreamConfig;
use crate::types::ItemId;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Body text the GW2 API sends with a 404 when none of the requested ids exist.
const ALL_IDS_INVALID: &str = "all ids provided are invalid";

/// Errors from a single bulk lookup call.
#[derive(Debug, Error)]
pub enum LookupError {
    /// Transport failure (connect, TLS, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status other than the "all ids invalid" 404
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body was not a JSON array of items
    #[error("error decoding response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Invalid base URL in configuration
    #[error("invalid upstream URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Bulk-capable item lookup.
///
/// Implementations return the items the upstream knows about; ids it does not know are simply
/// absent from the result. An `Err` means the whole call failed and says nothing about
/// individual ids.
#[async_trait]
pub trait ItemLookup: Send + Sync + 'static {
    async fn lookup(&self, ids: &[ItemId]) -> Result<Vec<ItemDetail>, LookupError>;
}

/// Production lookup using reqwest.
pub struct ReqwestItemLookup {
    client: Client,
    items_url: Url,
    api_key: Option<String>,
    language: Option<String>,
}

impl ReqwestItemLookup {
    pub fn new(config: &UpstreamConfig) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("gw2dash/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let items_url = ensure_slash(&config.base_url).join("items")?;

        Ok(Self {
            client,
            items_url,
            api_key: config.api_key.clone(),
            language: config.language.clone(),
        })
    }
}

/// Makes sure a url has a trailing slash.
///
/// `Url::join` replaces the last path segment unless the base ends in '/', so
/// `https://api.guildwars2.com/v2` joined with `items` would give `/items` instead of `/v2/items`.
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

#[async_trait]
impl ItemLookup for ReqwestItemLookup {
    #[instrument(skip_all, fields(ids = ids.len()))]
    async fn lookup(&self, ids: &[ItemId]) -> Result<Vec<ItemDetail>, LookupError> {
        let ids_param = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");

        let mut request = self.client.get(self.items_url.clone()).query(&[("ids", ids_param.as_str())]);
        if let Some(language) = &self.language {
            request = request.query(&[("lang", language.as_str())]);
        }
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(url = %self.items_url, error = %e, "Item lookup request failed");
            e
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            if body.contains(ALL_IDS_INVALID) {
                debug!(ids = %ids_param, "Upstream reports none of the requested ids exist");
                return Ok(Vec::new());
            }
            return Err(LookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(url = %self.items_url, status = status.as_u16(), "Item lookup returned an error status");
            return Err(LookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body_text = response.text().await?;
        match serde_json::from_str::<Vec<ItemDetail>>(&body_text) {
            Ok(items) => {
                debug!(requested = ids.len(), returned = items.len(), "Item lookup completed");
                Ok(items)
            }
            Err(e) => {
                tracing::error!("Failed to parse items response as JSON. Error: {}", e);
                tracing::debug!("Response body was: {}", body_text);
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Record of a call made to [`MockItemLookup`].
#[derive(Debug, Clone)]
pub struct MockLookupCall {
    pub ids: Vec<ItemId>,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct MockState {
    items: HashMap<ItemId, ItemDetail>,
    failing: HashSet<ItemId>,
    delay: Option<Duration>,
    calls: Vec<MockLookupCall>,
}

/// In-memory lookup for tests.
///
/// Serves items from a fixed catalogue, fails any call that contains an id registered with
/// [`fail_on`](Self::fail_on), and records every call with its (tokio) timestamp.
#[derive(Clone, Default)]
pub struct MockItemLookup {
    state: Arc<Mutex<MockState>>,
}

impl MockItemLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = ItemDetail>) -> Self {
        let mock = Self::new();
        for item in items {
            mock.add_item(item);
        }
        mock
    }

    pub fn add_item(&self, item: ItemDetail) {
        self.state.lock().items.insert(item.id, item);
    }

    /// Make every call that includes `id` fail with a 503.
    pub fn fail_on(&self, id: ItemId) {
        self.state.lock().failing.insert(id);
    }

    /// Delay every response (measured on the tokio clock).
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<MockLookupCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Every id sent upstream, in call order, duplicates included.
    pub fn requested_ids(&self) -> Vec<ItemId> {
        self.state.lock().calls.iter().flat_map(|c| c.ids.iter().copied()).collect()
    }
}

#[async_trait]
impl ItemLookup for MockItemLookup {
    async fn lookup(&self, ids: &[ItemId]) -> Result<Vec<ItemDetail>, LookupError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(MockLookupCall {
                ids: ids.to_vec(),
                at: tokio::time::Instant::now(),
            });
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if ids.iter().any(|id| state.failing.contains(id)) {
            return Err(LookupError::Status {
                status: 503,
                body: "mock upstream unavailable".to_string(),
            });
        }

        Ok(ids.iter().filter_map(|id| state.items.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_item;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn upstream_config(server: &MockServer) -> UpstreamConfig {
        UpstreamConfig {
            base_url: format!("{}/v2", server.uri()).parse().unwrap(),
            api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    fn ids(raw: &[u32]) -> Vec<ItemId> {
        raw.iter().map(|id| ItemId::try_from(i64::from(*id)).unwrap()).collect()
    }

    #[test]
    fn test_ensure_slash() {
        let url: Url = "https://api.guildwars2.com/v2".parse().unwrap();
        assert_eq!(ensure_slash(&url).join("items").unwrap().as_str(), "https://api.guildwars2.com/v2/items");

        let url: Url = "https://api.guildwars2.com/v2/".parse().unwrap();
        assert_eq!(ensure_slash(&url).join("items").unwrap().as_str(), "https://api.guildwars2.com/v2/items");
    }

    #[tokio::test]
    async fn test_lookup_sends_ids_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .and(query_param("ids", "19684,19709"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![
                sample_item(19684, "Mithril Ingot"),
                sample_item(19709, "Elder Wood Plank"),
            ]))
            .expect(1)
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let items = lookup.lookup(&ids(&[19684, 19709])).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Mithril Ingot");
    }

    #[tokio::test]
    async fn test_lookup_sends_language() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .and(query_param("lang", "de"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![sample_item(1, "Barren")]))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = upstream_config(&server);
        config.language = Some("de".to_string());
        let lookup = ReqwestItemLookup::new(&config).unwrap();

        assert_eq!(lookup.lookup(&ids(&[1])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_partial_content_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .respond_with(ResponseTemplate::new(206).set_body_json(vec![sample_item(1, "Known")]))
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let items = lookup.lookup(&ids(&[1, 999_999])).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.get(), 1);
    }

    #[tokio::test]
    async fn test_lookup_all_ids_invalid_returns_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"text": "all ids provided are invalid"})))
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let items = lookup.lookup(&ids(&[999_998, 999_999])).await.unwrap();

        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_plain_404_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such endpoint"))
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let err = lookup.lookup(&ids(&[1])).await.unwrap_err();

        assert!(matches!(err, LookupError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_lookup_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .respond_with(ResponseTemplate::new(503).set_body_string("API not active"))
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let err = lookup.lookup(&ids(&[1])).await.unwrap_err();

        match err {
            LookupError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "API not active");
            }
            other => panic!("Expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let lookup = ReqwestItemLookup::new(&upstream_config(&server)).unwrap();
        let err = lookup.lookup(&ids(&[1])).await.unwrap_err();

        assert!(matches!(err, LookupError::Decode(_)));
    }

    #[tokio::test]
    async fn test_mock_lookup_records_calls_and_fails_on_request() {
        let mock = MockItemLookup::with_items([sample_item(1, "One"), sample_item(2, "Two")]);
        mock.fail_on(ItemId::try_from(3_i64).unwrap());

        let items = mock.lookup(&ids(&[1, 2, 4])).await.unwrap();
        assert_eq!(items.len(), 2);

        assert!(mock.lookup(&ids(&[1, 3])).await.is_err());

        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requested_ids(), ids(&[1, 2, 4, 1, 3]));
    }
}

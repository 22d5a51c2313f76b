//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be changed with `-f` or `GW2DASH_CONFIG`.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. **YAML config file** (default: `config.yaml`, a missing file is fine)
//! 2. **Environment variables** prefixed with `GW2DASH_`
//!
//! Nested values use double underscores, e.g. `GW2DASH_BATCHING__DEBOUNCE_WINDOW=80ms` or
//! `GW2DASH_UPSTREAM__API_KEY=...`. Durations are written in humantime form (`50ms`, `10s`, `1h`).
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 3000
//! upstream:
//!   base_url: https://api.guildwars2.com/v2/
//!   language: en
//!   request_timeout: 10s
//!   max_batch_size: 200
//! batching:
//!   debounce_window: 50ms
//!   max_coalesce_delay: 500ms
//!   wait_timeout: 10s
//!   freshness: 1h
//!   failure_retry_after: 30s
//! cors:
//!   allowed_origins:
//!     - http://localhost:5173
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// Largest chunk the GW2 API accepts in one `ids=` query.
pub const UPSTREAM_MAX_IDS: usize = 200;

/// CLI args - just for locating the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "GW2DASH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    pub upstream: UpstreamConfig,
    pub batching: BatchingConfig,
    pub cors: CorsConfig,
    /// Maximum number of ids accepted by one `GET /api/v1/items?ids=` call
    pub max_ids_per_request: usize,
    /// Expose Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export spans over OTLP (see [`crate::telemetry`])
    pub enable_otel_export: bool,
}

/// Connection to the GW2 REST API.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// API root; `items` is resolved relative to it
    pub base_url: Url,
    /// Optional API key, sent as a bearer token
    pub api_key: Option<String>,
    /// Optional `lang` parameter (en, de, es, fr, zh)
    pub language: Option<String>,
    /// Timeout for one bulk lookup
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Ids per upstream call
    pub max_batch_size: usize,
}

// Hand-written so the API key never reaches the startup log
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("language", &self.language)
            .field("request_timeout", &self.request_timeout)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

/// Request coalescing and caching knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingConfig {
    /// Quiet period after the last request before a batch is flushed
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,
    /// Longest a request can be held back by a steady stream of newer requests
    #[serde(with = "humantime_serde")]
    pub max_coalesce_delay: Duration,
    /// How long a caller waits for its item before giving up
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// How long found/missing results are served from cache
    #[serde(with = "humantime_serde")]
    pub freshness: Duration,
    /// How long a failed lookup is remembered before the id is retried
    #[serde(with = "humantime_serde")]
    pub failure_retry_after: Duration,
}

/// CORS configuration for the dashboard frontend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// Either `*` or one origin URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    #[serde(deserialize_with = "parse_wildcard", serialize_with = "serialize_wildcard")]
    Wildcard,
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn serialize_wildcard<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("*")
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            upstream: UpstreamConfig::default(),
            batching: BatchingConfig::default(),
            cors: CorsConfig::default(),
            max_ids_per_request: 1000,
            enable_metrics: true,
            enable_otel_export: false,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://api.guildwars2.com/v2/").expect("static URL is valid"),
            api_key: None,
            language: None,
            request_timeout: Duration::from_secs(10),
            max_batch_size: UPSTREAM_MAX_IDS,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
            max_coalesce_delay: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(10),
            freshness: Duration::from_secs(60 * 60),
            failure_retry_after: Duration::from_secs(30),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Url(
                Url::parse("http://localhost:5173").expect("static URL is valid"), // Vite dev server
            )],
            max_age: Some(3600),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;

        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // GW2DASH_CONFIG names the file itself and is not a config key
            .merge(Env::prefixed("GW2DASH_").ignore(&["config"]).split("__"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.upstream.max_batch_size == 0 || self.upstream.max_batch_size > UPSTREAM_MAX_IDS {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: upstream.max_batch_size must be between 1 and {UPSTREAM_MAX_IDS} (got {})",
                    self.upstream.max_batch_size
                ),
            });
        }

        if self.upstream.request_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: upstream.request_timeout must be greater than zero".to_string(),
            });
        }

        let batching = &self.batching;
        if batching.debounce_window.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: batching.debounce_window must be greater than zero".to_string(),
            });
        }

        if batching.max_coalesce_delay < batching.debounce_window {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: batching.max_coalesce_delay ({:?}) cannot be shorter than batching.debounce_window ({:?})",
                    batching.max_coalesce_delay, batching.debounce_window
                ),
            });
        }

        if batching.wait_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: batching.wait_timeout must be greater than zero".to_string(),
            });
        }

        if self.max_ids_per_request == 0 {
            return Err(Error::Internal {
                operation: "Config validation: max_ids_per_request must be at least 1".to_string(),
            });
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

//! Runtime configuration.
//!
//! A small JSON config file (optional; every field has a default) plus
//! environment fallbacks for the upstream base URL and API key. The parsed
//! config is wrapped with a shared `reqwest::Client` so every request uses
//! one connection pool.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Parsed JSON configuration (deserializable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Upstream OpenAI-compatible API base, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    #[serde(rename = "OPENAI_BASE_URL")]
    pub base_url: Option<String>,

    /// Fallback upstream API key, used when the client supplies none.
    #[serde(default)]
    #[serde(rename = "OPENAI_API_KEY")]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout")]
    #[serde(rename = "API_TIMEOUT_MS")]
    pub api_timeout_ms: u64,

    /// Maximum number of idle connections per host in the shared HTTP pool.
    #[serde(default = "default_pool_max_idle_per_host")]
    #[serde(rename = "POOL_MAX_IDLE_PER_HOST")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in milliseconds (0 = no timeout).
    #[serde(default = "default_pool_idle_timeout_ms")]
    #[serde(rename = "POOL_IDLE_TIMEOUT_MS")]
    pub pool_idle_timeout_ms: u64,

    /// SSE channel buffer size per stream (number of chunks).
    #[serde(default = "default_sse_buffer_size")]
    #[serde(rename = "SSE_BUFFER_SIZE")]
    pub sse_buffer_size: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_timeout_ms: default_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            sse_buffer_size: default_sse_buffer_size(),
        }
    }
}

/// Runtime configuration shared across all handlers via Axum state.
/// Wraps the parsed config plus a shared reqwest::Client connection pool.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    base_url: String,
    api_key: Option<String>,
    sse_buffer_size: usize,
    http_client: reqwest::Client,
}

impl Config {
    /// Load from `path` if it exists; otherwise run on defaults and
    /// environment fallbacks. An unreadable or unparsable file is an error.
    pub fn load(path: &str) -> Result<Self> {
        if fs::metadata(path).is_ok() {
            Self::from_file(path)
        } else {
            Self::from_config_file(ConfigFile::default())
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        let file: ConfigFile =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        Self::from_config_file(file)
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        // File value wins; env vars cover the no-config-file deployment.
        let base_url = file
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .or_else(|| std::env::var("OPENROUTER_BASE_URL").ok());
        let base_url = normalize_base_url(base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));

        let api_key = file
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());

        let mut client_builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(file.api_timeout_ms))
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true);

        if file.pool_idle_timeout_ms > 0 {
            client_builder = client_builder
                .pool_idle_timeout(std::time::Duration::from_millis(file.pool_idle_timeout_ms));
        }

        let http_client = client_builder.build()?;

        Ok(Config {
            inner: Arc::new(ConfigInner {
                base_url,
                api_key,
                sse_buffer_size: file.sse_buffer_size,
                http_client,
            }),
        })
    }

    /// Get the shared HTTP client. One pool for all requests.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Full upstream completions endpoint.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.inner.base_url)
    }

    pub fn fallback_api_key(&self) -> Option<&str> {
        self.inner.api_key.as_deref()
    }

    pub fn sse_buffer_size(&self) -> usize {
        self.inner.sse_buffer_size
    }
}

/// Trim whitespace and trailing slashes; an empty value falls back to the
/// default upstream.
pub fn normalize_base_url(raw: &str) -> String {
    let normalized = raw.trim().trim_end_matches('/');
    if normalized.is_empty() {
        DEFAULT_BASE_URL.to_string()
    } else {
        normalized.to_string()
    }
}

fn default_timeout() -> u64 {
    600000 // 10 minutes
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_pool_idle_timeout_ms() -> u64 {
    90000 // 90 seconds
}

fn default_sse_buffer_size() -> usize {
    32
}

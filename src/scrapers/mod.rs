//! Page fetching: plain HTTP with retries, browser fallback, caching and
//! visible-content extraction.

pub mod backoff;
pub mod browser;
pub mod cache;
pub mod content;
pub mod http_client;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use backoff::Backoff;
pub use browser::{BrowserError, BrowserFallback, BrowserFetcher, BrowserOptions};
pub use cache::{InMemoryPageCache, PageCache};
pub use content::{extract_visible_content, PageContent};
pub use http_client::{FetchPipeline, HttpReply, HttpTransport, ReqwestTransport, TransportError};

use crate::proxy::{ProxyEndpoint, ProxyKind};

/// Errors from fetching a domain's page.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("no proxies available")]
    NoProxies,
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("HTTP {code}")]
    Status { code: u16 },
    #[error("HTTP 403 (blocked); browser fallback failed: {0}")]
    Blocked(String),
    #[error("retries exhausted")]
    Exhausted,
}

impl FetchError {
    /// Whether another plain HTTP attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) => true,
            FetchError::Status { code } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// How a page was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchSource {
    Http,
    Browser,
    Cache,
}

/// A fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
    pub source: FetchSource,
}

/// Per-call fetch policy, taken from the unit's configuration snapshot.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub use_proxy: bool,
    pub proxy_kind: ProxyKind,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub browser: BrowserOptions,
    pub cache_ttl: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_proxy: false,
            proxy_kind: ProxyKind::Http,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            backoff: Backoff::default(),
            browser: BrowserOptions::default(),
            cache_ttl: Some(Duration::from_secs(3600)),
        }
    }
}

/// Anything that can turn a domain into page HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, domain: &str, options: &FetchOptions) -> Result<FetchedPage, FetchError>;
}

/// Prepend a scheme when the input is a bare domain.
pub fn normalize_url(domain: &str) -> Result<String, FetchError> {
    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidUrl(domain.to_string()));
    }
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    url::Url::parse(&candidate)
        .ok()
        .filter(|u| u.host_str().is_some())
        .map(|_| candidate)
        .ok_or_else(|| FetchError::InvalidUrl(domain.to_string()))
}

/// Host part of a domain or URL, used for referers and record defaults.
pub fn host_of(domain: &str) -> String {
    normalize_url(domain)
        .ok()
        .and_then(|u| url::Url::parse(&u).ok())
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| domain.trim().to_string())
}

/// Proxy handed to the browser fallback, kept alongside its protocol.
#[derive(Debug, Clone)]
pub struct BrowserProxy {
    pub endpoint: ProxyEndpoint,
    pub kind: ProxyKind,
}

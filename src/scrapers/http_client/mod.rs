//! Plain HTTP fetch path with proxy rotation, retries and browser escalation.

mod headers;

pub use headers::{identity_headers, random_user_agent, ACCEPT_LANGUAGE, IMPERSONATE_USER_AGENTS};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::browser::BrowserFallback;
use super::cache::PageCache;
use super::{
    host_of, normalize_url, BrowserProxy, FetchError, FetchOptions, FetchSource, FetchedPage,
    PageFetcher,
};
use crate::proxy::{ProxyEndpoint, ProxyRotator};

/// Raw response from the transport.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Transport-level failure before a status line arrived.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(msg) => FetchError::Timeout(msg),
            TransportError::Connection(msg) => FetchError::Connection(msg),
        }
    }
}

/// One GET request as seen by the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Proxy URL including credentials.
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

/// Sends a single GET request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError>;
}

/// reqwest-backed transport. Clients are cached per proxy and timeout pair.
#[derive(Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<(Option<String>, Duration, Duration), Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, request: &HttpRequest) -> Result<Client, TransportError> {
        let key = (request.proxy.clone(), request.timeout, request.connect_timeout);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(request.timeout)
            .connect_timeout(request.connect_timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true);

        if let Some(ref proxy) = request.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Connection(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build client: {}", e)))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        let client = self.client_for(&request)?;
        let response = client
            .get(&request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(HttpReply { status, body })
    }
}

/// Fetches one page per domain.
///
/// Retries transient failures with capped backoff, marks proxies on every
/// outcome and escalates to the browser on the first 403.
pub struct FetchPipeline {
    transport: Arc<dyn HttpTransport>,
    browser: Arc<dyn BrowserFallback>,
    proxies: Arc<ProxyRotator>,
    cache: Option<Arc<dyn PageCache>>,
}

impl FetchPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        browser: Arc<dyn BrowserFallback>,
        proxies: Arc<ProxyRotator>,
    ) -> Self {
        Self {
            transport,
            browser,
            proxies,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn proxies(&self) -> &Arc<ProxyRotator> {
        &self.proxies
    }

    async fn cached(&self, url: &str, options: &FetchOptions) -> Option<FetchedPage> {
        options.cache_ttl?;
        let cache = self.cache.as_ref()?;
        match cache.get(url).await {
            Ok(Some(html)) => {
                debug!("Cache hit for {}", url);
                Some(FetchedPage {
                    url: url.to_string(),
                    html,
                    source: FetchSource::Cache,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Page cache read failed for {}: {}", url, e);
                None
            }
        }
    }

    async fn store(&self, page: &FetchedPage, options: &FetchOptions) {
        let (Some(cache), Some(ttl)) = (self.cache.as_ref(), options.cache_ttl) else {
            return;
        };
        if let Err(e) = cache.put(&page.url, &page.html, ttl).await {
            warn!("Page cache write failed for {}: {}", page.url, e);
        }
    }

    async fn escalate(
        &self,
        url: &str,
        endpoint: Option<&ProxyEndpoint>,
        options: &FetchOptions,
    ) -> Result<FetchedPage, FetchError> {
        info!("{} returned 403, escalating to browser", url);
        let proxy = endpoint.map(|ep| BrowserProxy {
            endpoint: ep.clone(),
            kind: options.proxy_kind,
        });
        match self.browser.fetch(url, proxy.as_ref(), &options.browser).await {
            Ok(html) => Ok(FetchedPage {
                url: url.to_string(),
                html,
                source: FetchSource::Browser,
            }),
            Err(e) => {
                warn!("Browser fallback failed for {}: {}", url, e);
                Err(FetchError::Blocked(e.to_string()))
            }
        }
    }

    async fn fetch_uncached(
        &self,
        url: &str,
        host: &str,
        options: &FetchOptions,
    ) -> Result<FetchedPage, FetchError> {
        let attempts = options.max_retries.max(1);
        let mut last_error = FetchError::Exhausted;

        for attempt in 0..attempts {
            let endpoint = if options.use_proxy {
                Some(
                    self.proxies
                        .next(options.proxy_kind)
                        .map_err(|_| FetchError::NoProxies)?,
                )
            } else {
                None
            };

            let request = HttpRequest {
                url: url.to_string(),
                headers: identity_headers(host),
                proxy: endpoint.as_ref().map(|ep| ep.url(options.proxy_kind)),
                timeout: options.request_timeout,
                connect_timeout: options.connect_timeout,
            };

            debug!(
                "GET {} (attempt {}/{}, proxy: {})",
                url,
                attempt + 1,
                attempts,
                endpoint.as_ref().map(|e| e.key()).unwrap_or_else(|| "none".into())
            );

            match self.transport.get(request).await {
                // only a full page counts; 204 and friends fall through as fatal
                Ok(reply) if reply.status == 200 => {
                    if let Some(ref ep) = endpoint {
                        self.proxies.mark_success(ep);
                    }
                    return Ok(FetchedPage {
                        url: url.to_string(),
                        html: reply.body,
                        source: FetchSource::Http,
                    });
                }
                Ok(reply) if reply.status == 403 => {
                    return self.escalate(url, endpoint.as_ref(), options).await;
                }
                Ok(reply) => {
                    let error = FetchError::Status { code: reply.status };
                    if !error.is_retryable() {
                        debug!("{} returned {}, not retrying", url, reply.status);
                        return Err(error);
                    }
                    warn!("{} returned {} (attempt {})", url, reply.status, attempt + 1);
                    if let Some(ref ep) = endpoint {
                        self.proxies.mark_failed(ep);
                    }
                    last_error = error;
                }
                Err(e) => {
                    warn!("{} failed: {} (attempt {})", url, e, attempt + 1);
                    if let Some(ref ep) = endpoint {
                        self.proxies.mark_failed(ep);
                    }
                    last_error = e.into();
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(options.backoff.delay(attempt)).await;
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl PageFetcher for FetchPipeline {
    async fn fetch(&self, domain: &str, options: &FetchOptions) -> Result<FetchedPage, FetchError> {
        let url = normalize_url(domain)?;
        if let Some(page) = self.cached(&url, options).await {
            return Ok(page);
        }

        let host = host_of(&url);
        let page = self.fetch_uncached(&url, &host, options).await?;
        self.store(&page, options).await;
        Ok(page)
    }
}

//! Live configuration: values operators change while the system runs.
//!
//! A [`RuntimeConfig`] snapshot is resolved once per batch start and once per
//! scheduler fire, then handed to every unit task of that batch.

mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::InMemoryConfigStore;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisConfigStore;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::delivery::DeliverySettings;
use crate::extraction::ExtractionSettings;
use crate::proxy::{ProxyEndpoint, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT};
use crate::scrapers::{BrowserOptions, FetchOptions};
use crate::store::StoreResult;

/// Keys read from the live store.
pub mod keys {
    pub const GEMINI_KEY: &str = "gemini_key";
    pub const PROMPT: &str = "prompt";
    pub const PROXY_HOST: &str = "proxy_host";
    pub const PROXY_LOGIN: &str = "proxy_login";
    pub const PROXY_PASSWORD: &str = "proxy_password";
    pub const PROXY_HTTP_PORT: &str = "proxy_http_port";
    pub const PROXY_SOCKS_PORT: &str = "proxy_socks_port";
    pub const WEBHOOK_URL: &str = "webhook_url";
    pub const WEBHOOK_TOKEN: &str = "webhook_token";

    pub const ALL: &[&str] = &[
        GEMINI_KEY,
        PROMPT,
        PROXY_HOST,
        PROXY_LOGIN,
        PROXY_PASSWORD,
        PROXY_HTTP_PORT,
        PROXY_SOCKS_PORT,
        WEBHOOK_URL,
        WEBHOOK_TOKEN,
    ];
}

/// Key-value surface for live configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Typed configuration snapshot passed down to unit tasks.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fetch: FetchOptions,
    /// Live proxy endpoint, added to the pool when the batch starts.
    pub proxy: Option<ProxyEndpoint>,
    pub extraction: ExtractionSettings,
    pub delivery: DeliverySettings,
}

impl RuntimeConfig {
    /// Snapshot from static settings only.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fetch: FetchOptions {
                use_proxy: settings.use_proxy,
                max_retries: settings.max_retries,
                request_timeout: settings.request_timeout,
                connect_timeout: settings.connect_timeout,
                backoff: settings.backoff,
                browser: BrowserOptions {
                    headless: settings.browser_headless,
                    nav_timeout: settings.browser_nav_timeout,
                    challenge_timeout: settings.browser_challenge_timeout,
                    ..BrowserOptions::default()
                },
                cache_ttl: Some(settings.page_cache_ttl).filter(|t| !t.is_zero()),
                ..FetchOptions::default()
            },
            proxy: None,
            extraction: ExtractionSettings {
                api_key: settings.gemini_api_key.clone(),
                model: settings.gemini_model.clone(),
                prompt: settings.extraction_prompt.clone(),
            },
            delivery: DeliverySettings {
                url: settings.webhook_url.clone(),
                token: settings.webhook_token.clone(),
            },
        }
    }

    /// Read every live key once, falling back to `settings` per missing key.
    ///
    /// An unreachable store yields the static snapshot.
    pub async fn resolve(store: &dyn ConfigStore, settings: &Settings) -> Self {
        let mut config = Self::from_settings(settings);
        let live = match read_all(store).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Live configuration unavailable, using static settings: {}", e);
                return config;
            }
        };
        let value = |key: &str| {
            live.iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, v)| v.clone())
        };

        if let Some(key) = value(keys::GEMINI_KEY) {
            config.extraction.api_key = Some(key);
        }
        if let Some(prompt) = value(keys::PROMPT) {
            config.extraction.prompt = Some(prompt);
        }
        if let Some(url) = value(keys::WEBHOOK_URL) {
            config.delivery.url = Some(url);
        }
        if let Some(token) = value(keys::WEBHOOK_TOKEN) {
            config.delivery.token = Some(token);
        }
        if let Some(host) = value(keys::PROXY_HOST) {
            let port = |key: &str, default: u16| {
                value(key)
                    .and_then(|v| v.trim().parse::<u16>().ok())
                    .unwrap_or(default)
            };
            let mut endpoint = ProxyEndpoint::new(
                host,
                port(keys::PROXY_HTTP_PORT, DEFAULT_HTTP_PORT),
                port(keys::PROXY_SOCKS_PORT, DEFAULT_SOCKS_PORT),
            );
            if let (Some(login), Some(password)) =
                (value(keys::PROXY_LOGIN), value(keys::PROXY_PASSWORD))
            {
                endpoint = endpoint.with_credentials(login, password);
            }
            debug!("Live proxy endpoint {}", endpoint.key());
            config.proxy = Some(endpoint);
            config.fetch.use_proxy = true;
        }
        config
    }
}

async fn read_all(store: &dyn ConfigStore) -> StoreResult<Vec<(&'static str, Option<String>)>> {
    let mut out = Vec::with_capacity(keys::ALL.len());
    for key in keys::ALL {
        let value = store.get(key).await?.filter(|v| !v.trim().is_empty());
        out.push((*key, value));
    }
    Ok(out)
}

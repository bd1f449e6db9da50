//! Static configuration using the prefer crate for file discovery.
//!
//! Precedence, lowest first: built-in defaults, the config file, environment
//! variables. Live values that operators rotate at runtime (credentials,
//! proxy, webhook) are layered on top per batch by [`crate::runtime_config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::extraction::DEFAULT_MODEL;
use crate::proxy::{ProxyEndpoint, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT};
use crate::scrapers::Backoff;

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Resolved application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub worker_concurrency: usize,
    /// A unit running longer than this is logged as slow.
    pub soft_time_limit: Duration,
    /// A unit running longer than this is abandoned and marked failed.
    pub hard_time_limit: Duration,
    pub use_proxy: bool,
    pub browser_headless: bool,
    pub browser_nav_timeout: Duration,
    pub browser_challenge_timeout: Duration,
    pub cancellation_ttl: Duration,
    /// Delay between the last unit draining and control state going idle.
    pub stop_grace: Duration,
    pub page_cache_ttl: Duration,
    pub proxies: Vec<ProxyEndpoint>,
    pub domains_file: Option<PathBuf>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub extraction_prompt: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    /// Register the built-in scraping and cleanup jobs on scheduler start.
    pub default_jobs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff: Backoff::default(),
            worker_concurrency: 10,
            soft_time_limit: Duration::from_secs(300),
            hard_time_limit: Duration::from_secs(360),
            use_proxy: false,
            browser_headless: true,
            browser_nav_timeout: Duration::from_secs(15),
            browser_challenge_timeout: Duration::from_secs(8),
            cancellation_ttl: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(2),
            page_cache_ttl: Duration::from_secs(3600),
            proxies: Vec::new(),
            domains_file: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            extraction_prompt: None,
            webhook_url: None,
            webhook_token: None,
            default_jobs: true,
        }
    }
}

impl Settings {
    /// Read the configured domain list, one domain per line.
    ///
    /// Blank lines and `#` comments are skipped. No file means no domains.
    pub async fn load_domains(&self) -> std::io::Result<Vec<String>> {
        let Some(ref path) = self.domains_file else {
            return Ok(Vec::new());
        };
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(parse_domain_list(&contents))
    }
}

/// Parse a newline-separated domain list.
pub fn parse_domain_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Browser section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    /// Navigation timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav_timeout: Option<u64>,
    /// Challenge wait in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_timeout: Option<u64>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    /// Connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<usize>,
    /// Soft per-unit limit in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_time_limit: Option<u64>,
    /// Hard per-unit limit in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_time_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserSection>,
    /// Page cache TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_cache_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<ProxyEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_jobs: Option<bool>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover `harvester.{toml,yaml,json,...}` in the standard locations.
    pub async fn load() -> Self {
        match prefer::load("harvester").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Self::default()
                }),
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file, parsed by extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn parse(contents: &str, ext: &str) -> Result<Self, String> {
        match ext {
            "toml" => toml::from_str(contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e)),
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e)),
            _ => serde_json::from_str(contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e)),
        }
    }

    /// Directory of the config file, if it came from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Copy the fields that are set onto `settings`.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref url) = self.redis_url {
            settings.redis_url = url.clone();
        }
        if let Some(secs) = self.request_timeout {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_retries {
            settings.max_retries = n;
        }
        if let Some(n) = self.worker_concurrency {
            settings.worker_concurrency = n.max(1);
        }
        if let Some(secs) = self.soft_time_limit {
            settings.soft_time_limit = Duration::from_secs(secs);
        }
        if let Some(secs) = self.hard_time_limit {
            settings.hard_time_limit = Duration::from_secs(secs);
        }
        if let Some(ref browser) = self.browser {
            if let Some(headless) = browser.headless {
                settings.browser_headless = headless;
            }
            if let Some(secs) = browser.nav_timeout {
                settings.browser_nav_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = browser.challenge_timeout {
                settings.browser_challenge_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(secs) = self.page_cache_ttl {
            settings.page_cache_ttl = Duration::from_secs(secs);
        }
        if !self.proxies.is_empty() {
            settings.proxies = self.proxies.clone();
            settings.use_proxy = true;
        }
        // explicit flag wins over the implied one
        if let Some(use_proxy) = self.use_proxy {
            settings.use_proxy = use_proxy;
        }
        if let Some(ref file) = self.domains_file {
            settings.domains_file = Some(self.resolve_path(file, base_dir));
        }
        if let Some(ref key) = self.gemini_api_key {
            settings.gemini_api_key = Some(key.clone());
        }
        if let Some(ref model) = self.gemini_model {
            settings.gemini_model = model.clone();
        }
        if let Some(ref prompt) = self.extraction_prompt {
            settings.extraction_prompt = Some(prompt.clone());
        }
        if let Some(ref url) = self.webhook_url {
            settings.webhook_url = Some(url.clone());
        }
        if let Some(ref token) = self.webhook_token {
            settings.webhook_token = Some(token.clone());
        }
        if let Some(enabled) = self.default_jobs {
            settings.default_jobs = enabled;
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_value(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_value(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Apply environment overrides. Empty values are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(url) = env_value("REDIS_URL") {
        tracing::debug!("Using REDIS_URL from environment");
        settings.redis_url = url;
    }

    if let Some(host) = env_value("PROXY_HOST") {
        let mut endpoint = ProxyEndpoint::new(
            host,
            env_parsed("PROXY_HTTP_PORT").unwrap_or(DEFAULT_HTTP_PORT),
            env_parsed("PROXY_SOCKS_PORT").unwrap_or(DEFAULT_SOCKS_PORT),
        );
        if let (Some(login), Some(password)) = (env_value("PROXY_LOGIN"), env_value("PROXY_PASSWORD")) {
            endpoint = endpoint.with_credentials(login, password);
        }
        settings.proxies.retain(|p| p.key() != endpoint.key());
        settings.proxies.insert(0, endpoint);
        settings.use_proxy = true;
    }

    if let Some(key) = env_value("GEMINI_API_KEY") {
        settings.gemini_api_key = Some(key);
    }
    if let Some(model) = env_value("GEMINI_MODEL") {
        settings.gemini_model = model;
    }
    if let Some(url) = env_value("WEBHOOK_URL") {
        settings.webhook_url = Some(url);
    }
    if let Some(token) = env_value("WEBHOOK_TOKEN") {
        settings.webhook_token = Some(token);
    }
    if let Some(secs) = env_parsed::<u64>("SCRAPING_TIMEOUT") {
        settings.request_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = env_parsed::<u32>("SCRAPING_MAX_RETRIES") {
        settings.max_retries = n;
    }
    if let Some(n) = env_parsed::<usize>("WORKER_CONCURRENCY") {
        settings.worker_concurrency = n.max(1);
    }
    if let Some(headless) = env_bool("BROWSER_HEADLESS") {
        settings.browser_headless = headless;
    }
}

/// Load settings from an explicit file or discovered config, then the environment.
pub async fn load_settings(config_path: Option<&Path>) -> (Settings, Config) {
    let config = match config_path {
        Some(path) => Config::load_from_path(path).await.unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            Config::default()
        }),
        None => Config::load().await,
    };

    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings);

    (settings, config)
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

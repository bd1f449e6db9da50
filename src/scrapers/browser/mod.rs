//! Headless-browser fallback for anti-bot protected sites.
//!
//! Uses chromiumoxide (CDP). One browser process is shared across fetches and
//! every fetch runs in its own short-lived browser context with stealth
//! scripts, a French desktop identity and heavy resources blocked. The proxy
//! is chosen per context, so rotating endpoints never relaunches Chrome.

mod challenge;
mod config;
mod stealth;

pub use challenge::is_challenge_page;
pub use config::BrowserOptions;

use async_trait::async_trait;

use super::BrowserProxy;

/// Errors from the browser fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrowserError {
    #[error("Chrome/Chromium not found; install chromium or set a remote browser URL")]
    ChromeNotFound,
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("devtools protocol error: {0}")]
    Cdp(String),
    #[error("navigation timed out after {0}s")]
    Timeout(u64),
    #[error("still blocked by anti-bot challenge")]
    StillBlocked,
    #[error("browser support not compiled; rebuild with --features browser")]
    NotCompiled,
}

/// Renders a URL in a real browser and returns the final HTML.
#[async_trait]
pub trait BrowserFallback: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&BrowserProxy>,
        options: &BrowserOptions,
    ) -> Result<String, BrowserError>;
}

#[cfg(feature = "browser")]
pub use engine::BrowserFetcher;

#[cfg(feature = "browser")]
mod engine {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chromiumoxide::cdp::browser_protocol::emulation::{
        SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
    };
    use chromiumoxide::cdp::browser_protocol::fetch::{
        AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
        ContinueWithAuthParams, EnableParams as FetchEnableParams, EventAuthRequired,
        EventRequestPaused, FailRequestParams, RequestPattern,
    };
    use chromiumoxide::cdp::browser_protocol::network::{
        ErrorReason, ResourceType, SetUserAgentOverrideParams,
    };
    use chromiumoxide::cdp::browser_protocol::page::{
        AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
    };
    use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
    use chromiumoxide::cdp::browser_protocol::target::{
        CreateBrowserContextParams, CreateTargetParams,
        DisposeBrowserContextParams,
    };
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use super::stealth::{
        BROWSER_LOCALE, BROWSER_TIMEZONE, BROWSER_USER_AGENT, STEALTH_SCRIPTS, VIEWPORT,
    };
    use super::{is_challenge_page, BrowserError, BrowserFallback, BrowserOptions};
    use crate::scrapers::http_client::ACCEPT_LANGUAGE;
    use crate::scrapers::BrowserProxy;

    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &[&str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    /// JavaScript to wait for page ready state.
    const WAIT_FOR_READY_SCRIPT: &str = r#"
        new Promise((resolve) => {
            if (document.readyState === 'complete' || document.readyState === 'interactive') {
                resolve(document.readyState);
            } else {
                document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                setTimeout(() => resolve('timeout'), 10000);
            }
        })
    "#;

    const CHALLENGE_POLL: Duration = Duration::from_secs(1);

    fn cdp(e: impl std::fmt::Display) -> BrowserError {
        BrowserError::Cdp(e.to_string())
    }

    /// Everything whose change requires a new browser process.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct LaunchKey {
        nav_timeout: Duration,
        headless: bool,
        remote_url: Option<String>,
        chrome_args: Vec<String>,
    }

    impl LaunchKey {
        fn new(options: &BrowserOptions) -> Self {
            Self {
                nav_timeout: options.nav_timeout,
                headless: options.headless,
                remote_url: options.remote_url.clone(),
                chrome_args: options.chrome_args.clone(),
            }
        }
    }

    /// Isolated context routed through `proxy`, if any.
    fn context_params(proxy: Option<&BrowserProxy>) -> CreateBrowserContextParams {
        CreateBrowserContextParams {
            proxy_server: proxy.map(|p| p.endpoint.server(p.kind)),
            ..Default::default()
        }
    }

    struct SharedBrowser {
        browser: Browser,
        key: LaunchKey,
        handler: JoinHandle<()>,
    }

    impl Drop for SharedBrowser {
        fn drop(&mut self) {
            self.handler.abort();
        }
    }

    /// Browser fallback backed by a lazily launched, shared Chrome process.
    #[derive(Default)]
    pub struct BrowserFetcher {
        shared: Mutex<Option<Arc<SharedBrowser>>>,
    }

    impl BrowserFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Find Chrome executable.
        fn find_chrome() -> Result<std::path::PathBuf, BrowserError> {
            for path in CHROME_PATHS {
                let p = std::path::Path::new(path);
                if p.exists() {
                    debug!("Found Chrome at: {}", path);
                    return Ok(p.to_path_buf());
                }
            }

            for cmd in &[
                "google-chrome",
                "google-chrome-stable",
                "chromium",
                "chromium-browser",
            ] {
                if let Ok(path) = which::which(cmd) {
                    debug!("Found Chrome in PATH: {}", path.display());
                    return Ok(path);
                }
            }

            Err(BrowserError::ChromeNotFound)
        }

        /// Return the shared browser, replacing it when the launch key changed.
        ///
        /// The lock is held only while creating or replacing; fetches that still
        /// hold the previous browser keep it alive until they finish.
        async fn acquire(&self, key: LaunchKey) -> Result<Arc<SharedBrowser>, BrowserError> {
            let mut slot = self.shared.lock().await;
            if let Some(ref current) = *slot {
                if current.key == key {
                    return Ok(Arc::clone(current));
                }
                info!("Browser configuration changed, replacing browser process");
            }

            let shared = Arc::new(Self::launch(key).await?);
            *slot = Some(Arc::clone(&shared));
            Ok(shared)
        }

        async fn launch(key: LaunchKey) -> Result<SharedBrowser, BrowserError> {
            let (browser, mut handler) = match key.remote_url {
                Some(ref remote) => Self::connect_remote(remote, key.nav_timeout).await?,
                None => {
                    info!("Launching browser (headless={})", key.headless);
                    let mut builder = BrowserConfig::builder()
                        .chrome_executable(Self::find_chrome()?)
                        .request_timeout(key.nav_timeout);
                    if !key.headless {
                        builder = builder.with_head();
                    }
                    builder = builder
                        .arg("--disable-blink-features=AutomationControlled")
                        .arg("--disable-infobars")
                        .arg("--disable-dev-shm-usage")
                        .arg("--disable-setuid-sandbox")
                        .arg("--no-first-run")
                        .arg("--no-default-browser-check")
                        .arg("--no-zygote")
                        .arg("--no-sandbox")
                        .arg("--disable-gpu")
                        .arg("--disable-accelerated-2d-canvas")
                        .arg("--ignore-certificate-errors");
                    for arg in &key.chrome_args {
                        builder = builder.arg(arg);
                    }
                    let config = builder.build().map_err(BrowserError::Launch)?;
                    Browser::launch(config)
                        .await
                        .map_err(|e| BrowserError::Launch(e.to_string()))?
                }
            };

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            Ok(SharedBrowser {
                browser,
                key,
                handler,
            })
        }

        /// Connect to a remote Chrome instance.
        async fn connect_remote(
            url: &str,
            timeout: Duration,
        ) -> Result<(Browser, chromiumoxide::handler::Handler), BrowserError> {
            info!("Connecting to remote browser at {}", url);

            let http_url = url
                .replace("ws://", "http://")
                .replace("wss://", "https://");
            let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

            let resp: serde_json::Value = reqwest::Client::new()
                .get(&version_url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| BrowserError::Launch(e.to_string()))?
                .json()
                .await
                .map_err(|e| BrowserError::Launch(e.to_string()))?;

            let ws_url = resp
                .get("webSocketDebuggerUrl")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrowserError::Launch("no webSocketDebuggerUrl".into()))?;

            let handler_config = chromiumoxide::handler::HandlerConfig {
                request_timeout: timeout,
                ..Default::default()
            };
            Browser::connect_with_config(ws_url, handler_config)
                .await
                .map_err(|e| BrowserError::Launch(e.to_string()))
        }

        /// Apply identity overrides and stealth scripts before navigation.
        async fn prepare(&self, page: &Page) -> Result<(), BrowserError> {
            let ua = SetUserAgentOverrideParams::builder()
                .user_agent(BROWSER_USER_AGENT)
                .accept_language(ACCEPT_LANGUAGE)
                .build()
                .map_err(BrowserError::Cdp)?;
            page.execute(ua).await.map_err(cdp)?;
            page.execute(SetTimezoneOverrideParams::new(BROWSER_TIMEZONE))
                .await
                .map_err(cdp)?;
            page.execute(SetLocaleOverrideParams::builder().locale(BROWSER_LOCALE).build())
                .await
                .map_err(cdp)?;
            page.execute(SetDeviceMetricsOverrideParams::new(
                VIEWPORT.0, VIEWPORT.1, 1.0, false,
            ))
            .await
            .map_err(cdp)?;

            for script in STEALTH_SCRIPTS {
                page.execute(AddScriptToEvaluateOnNewDocumentParams::new(*script))
                    .await
                    .map_err(cdp)?;
            }
            Ok(())
        }

        /// Block heavy resources and answer proxy auth challenges.
        async fn intercept(
            &self,
            page: &Page,
            proxy: Option<&BrowserProxy>,
        ) -> Result<Vec<JoinHandle<()>>, BrowserError> {
            let credentials = proxy.and_then(|p| {
                p.endpoint
                    .login
                    .clone()
                    .zip(p.endpoint.password.clone())
            });

            let mut paused = page
                .event_listener::<EventRequestPaused>()
                .await
                .map_err(cdp)?;
            let mut auth = page
                .event_listener::<EventAuthRequired>()
                .await
                .map_err(cdp)?;

            page.execute(
                FetchEnableParams::builder()
                    .pattern(RequestPattern::builder().url_pattern("*").build())
                    .handle_auth_requests(true)
                    .build(),
            )
            .await
            .map_err(cdp)?;

            let pause_page = page.clone();
            let pauses = tokio::spawn(async move {
                while let Some(event) = paused.next().await {
                    let blocked = matches!(
                        event.resource_type,
                        ResourceType::Image
                            | ResourceType::Font
                            | ResourceType::Stylesheet
                            | ResourceType::Media
                    );
                    let outcome = if blocked {
                        pause_page
                            .execute(FailRequestParams::new(
                                event.request_id.clone(),
                                ErrorReason::BlockedByClient,
                            ))
                            .await
                            .map(|_| ())
                    } else {
                        pause_page
                            .execute(ContinueRequestParams::new(event.request_id.clone()))
                            .await
                            .map(|_| ())
                    };
                    if let Err(e) = outcome {
                        debug!("Request interception reply failed: {}", e);
                    }
                }
            });

            let auth_page = page.clone();
            let auths = tokio::spawn(async move {
                while let Some(event) = auth.next().await {
                    let mut response = AuthChallengeResponse::builder();
                    response = match credentials {
                        Some((ref login, ref password)) => response
                            .response(AuthChallengeResponseResponse::ProvideCredentials)
                            .username(login.clone())
                            .password(password.clone()),
                        None => response.response(AuthChallengeResponseResponse::CancelAuth),
                    };
                    let Ok(response) = response.build() else {
                        continue;
                    };
                    if let Err(e) = auth_page
                        .execute(ContinueWithAuthParams::new(
                            event.request_id.clone(),
                            response,
                        ))
                        .await
                    {
                        debug!("Proxy auth reply failed: {}", e);
                    }
                }
            });

            Ok(vec![pauses, auths])
        }

        async fn navigate(
            &self,
            page: &Page,
            url: &str,
            options: &BrowserOptions,
        ) -> Result<String, BrowserError> {
            let nav_params = NavigateParams::builder()
                .url(url)
                .build()
                .map_err(BrowserError::Cdp)?;

            tokio::time::timeout(options.nav_timeout, page.execute(nav_params))
                .await
                .map_err(|_| BrowserError::Timeout(options.nav_timeout.as_secs()))?
                .map_err(cdp)?;

            match tokio::time::timeout(
                options.nav_timeout,
                page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()),
            )
            .await
            {
                Ok(Ok(result)) => {
                    let state: String = result
                        .into_value()
                        .unwrap_or_else(|_| "unknown".to_string());
                    debug!("Page ready state: {}", state);
                }
                Ok(Err(e)) => debug!("Could not check ready state: {}", e),
                Err(_) => warn!("Timeout waiting for page ready state"),
            }

            let mut html = page.content().await.map_err(cdp)?;
            if !is_challenge_page(&html) {
                return Ok(html);
            }

            info!("Challenge page on {}, waiting up to {:?}", url, options.challenge_timeout);
            let deadline = Instant::now() + options.challenge_timeout;
            while Instant::now() < deadline {
                tokio::time::sleep(CHALLENGE_POLL).await;
                html = page.content().await.map_err(cdp)?;
                if !is_challenge_page(&html) {
                    debug!("Challenge cleared on {}", url);
                    return Ok(html);
                }
            }

            warn!("Still blocked on {} after challenge wait", url);
            Err(BrowserError::StillBlocked)
        }

        async fn fetch_in_context(
            &self,
            shared: &SharedBrowser,
            context_id: BrowserContextId,
            url: &str,
            proxy: Option<&BrowserProxy>,
            options: &BrowserOptions,
        ) -> Result<String, BrowserError> {
            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id)
                .build()
                .map_err(BrowserError::Cdp)?;
            let page = shared.browser.new_page(target).await.map_err(cdp)?;

            let listeners = self.intercept(&page, proxy).await;
            let result = match listeners {
                Ok(ref _tasks) => match self.prepare(&page).await {
                    Ok(()) => self.navigate(&page, url, options).await,
                    Err(e) => Err(e),
                },
                Err(ref e) => Err(e.clone()),
            };

            if let Ok(tasks) = listeners {
                for task in tasks {
                    task.abort();
                }
            }
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
            result
        }
    }

    #[async_trait]
    impl BrowserFallback for BrowserFetcher {
        async fn fetch(
            &self,
            url: &str,
            proxy: Option<&BrowserProxy>,
            options: &BrowserOptions,
        ) -> Result<String, BrowserError> {
            let shared = self.acquire(LaunchKey::new(options)).await?;

            let context_id = shared
                .browser
                .execute(context_params(proxy))
                .await
                .map_err(cdp)?
                .result
                .browser_context_id;

            let result = self
                .fetch_in_context(&shared, context_id.clone(), url, proxy, options)
                .await;

            if let Err(e) = shared
                .browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
            {
                debug!("Failed to dispose browser context: {}", e);
            }

            if let Ok(ref html) = result {
                info!("Browser fetched {} ({} bytes)", url, html.len());
            }
            result
        }
    }

}

/// Stub for when the browser feature is disabled.
#[cfg(not(feature = "browser"))]
#[derive(Default)]
pub struct BrowserFetcher;

#[cfg(not(feature = "browser"))]
impl BrowserFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl BrowserFallback for BrowserFetcher {
    async fn fetch(
        &self,
        _url: &str,
        _proxy: Option<&BrowserProxy>,
        _options: &BrowserOptions,
    ) -> Result<String, BrowserError> {
        Err(BrowserError::NotCompiled)
    }
}

//! Browser-like request identities.

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Current desktop browser user agents, rotated per request.
pub const IMPERSONATE_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Firefox on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

pub const ACCEPT_LANGUAGE: &str = "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7";

/// Get a random user agent.
pub fn random_user_agent() -> &'static str {
    IMPERSONATE_USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(IMPERSONATE_USER_AGENTS[0])
}

/// Client-hint brand list consistent with the chosen user agent.
fn client_hints(user_agent: &str) -> Option<(&'static str, &'static str)> {
    let platform = if user_agent.contains("Windows") {
        "\"Windows\""
    } else {
        "\"macOS\""
    };
    if user_agent.contains("Edg/") {
        Some((
            "\"Microsoft Edge\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            platform,
        ))
    } else if user_agent.contains("Chrome/") {
        Some((
            "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            platform,
        ))
    } else {
        // Firefox and Safari do not send client hints
        None
    }
}

/// Build a fresh header set for one request to `host`.
pub fn identity_headers(host: &str) -> HeaderMap {
    let user_agent = random_user_agent();
    let mut headers = HeaderMap::new();

    let mut put = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };

    put("user-agent", user_agent);
    put(
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    );
    put("accept-language", ACCEPT_LANGUAGE);
    put("accept-encoding", "gzip, deflate, br");
    put("cache-control", "max-age=0");
    put("upgrade-insecure-requests", "1");
    put("sec-fetch-dest", "document");
    put("sec-fetch-mode", "navigate");
    put("sec-fetch-site", "cross-site");
    put("sec-fetch-user", "?1");
    if let Some((brands, platform)) = client_hints(user_agent) {
        put("sec-ch-ua", brands);
        put("sec-ch-ua-mobile", "?0");
        put("sec-ch-ua-platform", platform);
    }
    put("referer", &format!("https://www.google.com/search?q={}", host));

    headers
}

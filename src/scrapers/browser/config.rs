//! Browser fallback configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options for one browser-fallback fetch.
///
/// `headless`, `nav_timeout`, `remote_url` and `chrome_args` form the launch
/// key: a change in any of them replaces the shared browser process. The
/// proxy is applied per browser context instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserOptions {
    /// Run in headless mode (default: true).
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Navigation timeout.
    #[serde(default = "default_nav_timeout", with = "secs")]
    pub nav_timeout: Duration,

    /// How long to wait for a challenge page to clear itself.
    #[serde(default = "default_challenge_timeout", with = "secs")]
    pub challenge_timeout: Duration,

    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            nav_timeout: default_nav_timeout(),
            challenge_timeout: default_challenge_timeout(),
            remote_url: None,
            chrome_args: Vec::new(),
        }
    }
}

pub fn default_headless() -> bool {
    true
}

pub fn default_nav_timeout() -> Duration {
    Duration::from_secs(15)
}

pub fn default_challenge_timeout() -> Duration {
    Duration::from_secs(8)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

//! Fetched-page cache keyed by URL hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::store::StoreResult;

/// Default time a fetched page stays cached.
pub const DEFAULT_PAGE_TTL: Duration = Duration::from_secs(3600);

/// Cache key for a URL: `html_cache:{sha256(url)}`.
pub fn cache_key(url: &str) -> String {
    format!("html_cache:{}", hex::encode(Sha256::digest(url.as_bytes())))
}

#[async_trait]
pub trait PageCache: Send + Sync {
    async fn get(&self, url: &str) -> StoreResult<Option<String>>;
    async fn put(&self, url: &str, html: &str, ttl: Duration) -> StoreResult<()>;
}

/// Process-local page cache.
#[derive(Clone, Default)]
pub struct InMemoryPageCache {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl InMemoryPageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageCache for InMemoryPageCache {
    async fn get(&self, url: &str) -> StoreResult<Option<String>> {
        let key = cache_key(url);
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some((html, expires)) if *expires > Instant::now() => {
                    return Ok(Some(html.clone()))
                }
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // expired
        self.entries.write().await.remove(&key);
        Ok(None)
    }

    async fn put(&self, url: &str, html: &str, ttl: Duration) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .insert(cache_key(url), (html.to_string(), Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_cache::RedisPageCache;

#[cfg(feature = "redis-backend")]
mod redis_cache {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    use super::{cache_key, PageCache};
    use crate::store::{StoreError, StoreResult};
    use crate::KEY_PREFIX;

    /// Page cache shared across processes through Redis.
    #[derive(Clone)]
    pub struct RedisPageCache {
        conn: ConnectionManager,
    }

    impl RedisPageCache {
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }

        fn key(url: &str) -> String {
            format!("{}{}", KEY_PREFIX, cache_key(url))
        }
    }

    #[async_trait]
    impl PageCache for RedisPageCache {
        async fn get(&self, url: &str) -> StoreResult<Option<String>> {
            let mut conn = self.conn.clone();
            conn.get(Self::key(url))
                .await
                .map_err(|e| StoreError::Database(e.to_string()))
        }

        async fn put(&self, url: &str, html: &str, ttl: Duration) -> StoreResult<()> {
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(Self::key(url), html, ttl.as_secs().max(1))
                .await
                .map_err(|e| StoreError::Database(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_shape() {
        let key = cache_key("https://example.com");
        assert!(key.starts_with("html_cache:"));
        assert_eq!(key.len(), "html_cache:".len() + 64);
        assert_eq!(key, cache_key("https://example.com"));
        assert_ne!(key, cache_key("https://example.org"));
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip_and_expiry() {
        let cache = InMemoryPageCache::new();
        cache
            .put("https://a.com", "<html/>", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("https://a.com").await.unwrap().as_deref(),
            Some("<html/>")
        );

        cache
            .put("https://b.com", "old", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("https://b.com").await.unwrap().is_none());
        assert!(cache.get("https://missing.com").await.unwrap().is_none());
    }
}

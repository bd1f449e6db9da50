//! Error type and connection plumbing shared by the persistent stores.

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from progress, session, job and configuration stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Database(e.to_string())
        }
    }
}

/// Open a managed, auto-reconnecting Redis connection.
#[cfg(feature = "redis-backend")]
pub async fn connect(redis_url: &str) -> StoreResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| StoreError::Database(format!("Redis connection error: {}", e)))?;

    redis::aio::ConnectionManager::new(client)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Redis connection manager error: {}", e)))
}

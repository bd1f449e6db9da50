//! Durable job definitions for crash recovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::job::ScheduledJob;
use crate::store::StoreResult;

/// Key-value persistence of `job_id -> definition`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &ScheduledJob) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Every persisted definition. Unreadable entries are skipped.
    async fn load_all(&self) -> StoreResult<Vec<ScheduledJob>>;
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &ScheduledJob) -> StoreResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.jobs.write().await.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_store::RedisJobStore;

#[cfg(feature = "redis-backend")]
mod redis_store {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::warn;

    use super::{JobStore, ScheduledJob};
    use crate::store::{StoreError, StoreResult};
    use crate::KEY_PREFIX;

    /// Definitions in one hash, `scheduler:jobs`, field per job id.
    #[derive(Clone)]
    pub struct RedisJobStore {
        conn: ConnectionManager,
    }

    impl RedisJobStore {
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }

        fn key() -> String {
            format!("{}scheduler:jobs", KEY_PREFIX)
        }
    }

    #[async_trait]
    impl JobStore for RedisJobStore {
        async fn save(&self, job: &ScheduledJob) -> StoreResult<()> {
            let mut conn = self.conn.clone();
            let payload = serde_json::to_string(job)?;
            conn.hset::<_, _, _, ()>(Self::key(), &job.id, payload)
                .await
                .map_err(StoreError::from)
        }

        async fn delete(&self, id: &str) -> StoreResult<()> {
            let mut conn = self.conn.clone();
            conn.hdel::<_, _, ()>(Self::key(), id)
                .await
                .map_err(StoreError::from)
        }

        async fn load_all(&self) -> StoreResult<Vec<ScheduledJob>> {
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> =
                conn.hgetall(Self::key()).await.map_err(StoreError::from)?;
            let mut jobs: Vec<ScheduledJob> = raw
                .into_iter()
                .filter_map(|(id, payload)| match serde_json::from_str::<ScheduledJob>(&payload) {
                    Ok(mut job) => {
                        job.id = id;
                        Some(job)
                    }
                    Err(e) => {
                        warn!("Skipping unreadable persisted job {}: {}", id, e);
                        None
                    }
                })
                .collect();
            jobs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(jobs)
        }
    }
}

//! Redis-backed configuration store, keys `config:{name}`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::ConfigStore;
use crate::store::{StoreError, StoreResult};
use crate::KEY_PREFIX;

#[derive(Clone)]
pub struct RedisConfigStore {
    conn: ConnectionManager,
}

impl RedisConfigStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(name: &str) -> String {
        format!("{}config:{}", KEY_PREFIX, name)
    }
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(Self::key(key)).await.map_err(StoreError::from)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(key), value)
            .await
            .map_err(StoreError::from)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(key))
            .await
            .map_err(StoreError::from)
    }
}

//! Redis-backed session store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::backend::{Outcome, Session, SessionStatus, SessionStore};
use crate::extraction::Record;
use crate::store::{StoreError, StoreResult};
use crate::KEY_PREFIX;

const INCREMENT_SCRIPT: &str = r#"
    local key = KEYS[1]
    local field = ARGV[1]
    local now = ARGV[2]

    if redis.call('EXISTS', key) == 0 then
        return 0
    end
    local total = tonumber(redis.call('HGET', key, 'total') or '0')
    local processed = tonumber(redis.call('HGET', key, 'processed') or '0')
    if processed >= total then
        return 1
    end

    processed = redis.call('HINCRBY', key, 'processed', 1)
    redis.call('HINCRBY', key, field, 1)
    if processed >= total then
        local status = redis.call('HGET', key, 'status')
        local next = nil
        if status == 'running' then
            next = 'completed'
        elseif status == 'stopping' then
            next = 'stopped'
        end
        if next then
            redis.call('HSET', key, 'status', next, 'completed_at', now)
        end
    end
    return 1
"#;

const SET_STATUS_SCRIPT: &str = r#"
    local key = KEYS[1]
    local status = ARGV[1]
    local terminal = ARGV[2] == '1'
    local now = ARGV[3]

    if redis.call('EXISTS', key) == 0 then
        return 0
    end
    local current = redis.call('HGET', key, 'status')
    if current == 'stopped' or current == 'completed' or current == 'failed' then
        return 1
    end
    redis.call('HSET', key, 'status', status)
    if terminal then
        redis.call('HSET', key, 'completed_at', now)
    end
    return 1
"#;

fn db(e: redis::RedisError) -> StoreError {
    StoreError::Database(e.to_string())
}

#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    increment_script: Script,
    set_status_script: Script,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_SCRIPT),
            set_status_script: Script::new(SET_STATUS_SCRIPT),
        }
    }

    fn session_key(id: &str) -> String {
        format!("{}session:{}", KEY_PREFIX, id)
    }

    fn records_key(id: &str) -> String {
        format!("{}session:{}:records", KEY_PREFIX, id)
    }

    fn index_key() -> String {
        format!("{}sessions", KEY_PREFIX)
    }

    async fn require(&self, id: &str) -> StoreResult<Session> {
        self.get_session(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self, total: u64) -> StoreResult<Session> {
        let session = Session::new(uuid::Uuid::new_v4().to_string(), total);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(Self::session_key(&session.id), &session.to_fields())
            .zadd(
                Self::index_key(),
                &session.id,
                session.started_at.timestamp_millis(),
            )
            .query_async::<()>(&mut conn)
            .await
            .map_err(db)?;
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(Self::session_key(id)).await.map_err(db)?;
        if map.is_empty() {
            return Ok(None);
        }
        Session::from_fields(&map)
            .map(Some)
            .ok_or_else(|| StoreError::Serialization(format!("corrupt session hash {}", id)))
    }

    async fn increment(&self, id: &str, outcome: Outcome) -> StoreResult<Session> {
        let mut conn = self.conn.clone();
        let found: i64 = self
            .increment_script
            .key(Self::session_key(id))
            .arg(outcome.field())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(db)?;
        if found == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        self.require(id).await
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<Session> {
        let mut conn = self.conn.clone();
        let found: i64 = self
            .set_status_script
            .key(Self::session_key(id))
            .arg(status.as_str())
            .arg(if status.is_terminal() { "1" } else { "0" })
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(db)?;
        if found == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        self.require(id).await
    }

    async fn append_records(&self, id: &str, records: &[Record]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let payloads = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(Self::records_key(id), payloads)
            .await
            .map_err(db)
    }

    async fn records(&self, id: &str) -> StoreResult<Vec<Record>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::records_key(id), 0, -1)
            .await
            .map_err(db)?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    async fn list_sessions(&self, limit: usize) -> StoreResult<Vec<Session>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(Self::index_key(), 0, limit as isize - 1)
            .await
            .map_err(db)?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get_session(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        // Sessions finish after they start, so only those started before the cutoff qualify.
        let candidates: Vec<String> = conn
            .zrangebyscore(Self::index_key(), "-inf", cutoff.timestamp_millis())
            .await
            .map_err(db)?;

        let mut removed = 0;
        for id in candidates {
            let expired = match self.get_session(&id).await {
                Ok(Some(s)) => {
                    s.status.is_terminal() && s.completed_at.map(|t| t < cutoff).unwrap_or(false)
                }
                // Dangling index entry or unreadable hash.
                Ok(None) | Err(StoreError::Serialization(_)) => true,
                Err(e) => return Err(e),
            };
            if !expired {
                continue;
            }
            redis::pipe()
                .atomic()
                .del(Self::session_key(&id))
                .del(Self::records_key(&id))
                .zrem(Self::index_key(), &id)
                .query_async::<()>(&mut conn)
                .await
                .map_err(db)?;
            removed += 1;
        }
        Ok(removed)
    }
}

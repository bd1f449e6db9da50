//! Redis-backed progress store for multi-process workers.
//!
//! Transitions run as a Lua script so that the per-domain status and the
//! session counters are read and written in one indivisible round-trip.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::backend::{
    ActiveSession, DomainResult, DomainStatus, ProgressCounters, ProgressStore, Transition,
};
use crate::store::{StoreError, StoreResult};
use crate::KEY_PREFIX;

/// TTL for progress keys, refreshed on every transition.
const PROGRESS_TTL_SECS: u64 = 7200; // 2 hours

const TRANSITION_SCRIPT: &str = r#"
    local counters = KEYS[1]
    local domains = KEYS[2]
    local cancel = KEYS[3]
    local domain = ARGV[1]
    local new = ARGV[2]
    local ttl = tonumber(ARGV[3])

    local rank = { pending = 0, running = 1, completed = 2, failed = 2, skipped = 2 }

    local old = redis.call('HGET', domains, domain)
    if not old then
        return { 0, '' }
    end
    if rank[new] == nil or rank[old] == nil or rank[new] <= rank[old] then
        return { 0, old }
    end
    if new == 'running' and redis.call('EXISTS', cancel) == 1 then
        return { 2, old }
    end

    if old == 'running' then
        redis.call('HINCRBY', counters, 'running', -1)
    end
    if new == 'running' then
        redis.call('HINCRBY', counters, 'running', 1)
    else
        local field = new
        if new == 'completed' then
            field = 'successful'
        end
        redis.call('HINCRBY', counters, 'processed', 1)
        redis.call('HINCRBY', counters, field, 1)
    end
    redis.call('HSET', domains, domain, new)
    redis.call('EXPIRE', counters, ttl)
    redis.call('EXPIRE', domains, ttl)

    return { 1, old }
"#;

const CLEAR_ACTIVE_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if not current then
        return 0
    end
    if ARGV[1] ~= '' then
        local ok, decoded = pcall(cjson.decode, current)
        if not ok or decoded.session_id ~= ARGV[1] then
            return 0
        end
    end
    redis.call('DEL', KEYS[1])
    return 1
"#;

fn db(e: redis::RedisError) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Redis-backed progress storage.
#[derive(Clone)]
pub struct RedisProgressStore {
    conn: ConnectionManager,
    transition_script: Script,
    clear_active_script: Script,
}

impl RedisProgressStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            transition_script: Script::new(TRANSITION_SCRIPT),
            clear_active_script: Script::new(CLEAR_ACTIVE_SCRIPT),
        }
    }

    fn counters_key(session_id: &str) -> String {
        format!("{}progress:{}", KEY_PREFIX, session_id)
    }

    fn domains_key(session_id: &str) -> String {
        format!("{}progress:{}:domains", KEY_PREFIX, session_id)
    }

    fn result_key(session_id: &str, domain: &str) -> String {
        format!("{}progress:{}:result:{}", KEY_PREFIX, session_id, domain)
    }

    fn cancel_key() -> String {
        format!("{}control:cancel", KEY_PREFIX)
    }

    fn active_key() -> String {
        format!("{}control:active", KEY_PREFIX)
    }
}

fn field(map: &HashMap<String, String>, name: &str) -> u64 {
    map.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0).max(0) as u64
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn seed(&self, session_id: &str, domains: &[String]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let counters = Self::counters_key(session_id);
        let domains_key = Self::domains_key(session_id);

        let mut seen = HashSet::new();
        let unique: Vec<&str> = domains
            .iter()
            .map(String::as_str)
            .filter(|d| seen.insert(*d))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&counters)
            .del(&domains_key)
            .hset_multiple(
                &counters,
                &[
                    ("total", unique.len() as u64),
                    ("processed", 0),
                    ("successful", 0),
                    ("failed", 0),
                    ("skipped", 0),
                    ("running", 0),
                ],
            )
            .expire(&counters, PROGRESS_TTL_SECS as i64);
        if !unique.is_empty() {
            let pending: Vec<(&str, &str)> = unique
                .iter()
                .map(|d| (*d, DomainStatus::Pending.as_str()))
                .collect();
            pipe.hset_multiple(&domains_key, &pending)
                .expire(&domains_key, PROGRESS_TTL_SECS as i64);
        }
        pipe.query_async::<()>(&mut conn).await.map_err(db)?;
        Ok(())
    }

    async fn transition(
        &self,
        session_id: &str,
        domain: &str,
        to: DomainStatus,
    ) -> StoreResult<Transition> {
        let mut conn = self.conn.clone();
        let (code, old): (i64, String) = self
            .transition_script
            .key(Self::counters_key(session_id))
            .key(Self::domains_key(session_id))
            .key(Self::cancel_key())
            .arg(domain)
            .arg(to.as_str())
            .arg(PROGRESS_TTL_SECS as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(db)?;

        let current = DomainStatus::from_str(&old);
        Ok(match code {
            1 => Transition::Applied {
                previous: current.ok_or_else(|| {
                    StoreError::Serialization(format!("unknown domain status '{}'", old))
                })?,
            },
            2 => Transition::Cancelled,
            _ => Transition::Rejected { current },
        })
    }

    async fn counters(&self, session_id: &str) -> StoreResult<Option<ProgressCounters>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(Self::counters_key(session_id))
            .await
            .map_err(db)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProgressCounters {
            total: field(&map, "total"),
            processed: field(&map, "processed"),
            successful: field(&map, "successful"),
            failed: field(&map, "failed"),
            skipped: field(&map, "skipped"),
            running: field(&map, "running"),
        }))
    }

    async fn domain_status(
        &self,
        session_id: &str,
        domain: &str,
    ) -> StoreResult<Option<DomainStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(Self::domains_key(session_id), domain)
            .await
            .map_err(db)?;
        Ok(raw.as_deref().and_then(DomainStatus::from_str))
    }

    async fn domains(&self, session_id: &str) -> StoreResult<Vec<(String, DomainStatus)>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(Self::domains_key(session_id))
            .await
            .map_err(db)?;
        let mut out: Vec<(String, DomainStatus)> = map
            .into_iter()
            .filter_map(|(d, s)| DomainStatus::from_str(&s).map(|s| (d, s)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn record_result(&self, session_id: &str, result: &DomainResult) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(result)?;
        conn.set_ex::<_, _, ()>(
            Self::result_key(session_id, &result.domain),
            payload,
            PROGRESS_TTL_SECS,
        )
        .await
        .map_err(db)
    }

    async fn results(&self, session_id: &str) -> StoreResult<Vec<DomainResult>> {
        let domains = self.domains(session_id).await?;
        if domains.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let keys: Vec<String> = domains
            .iter()
            .map(|(d, _)| Self::result_key(session_id, d))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(db)?;

        raw.into_iter()
            .flatten()
            .map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .collect()
    }

    async fn set_cancelled(&self, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::cancel_key(), "1", ttl.as_secs().max(1))
            .await
            .map_err(db)
    }

    async fn clear_cancelled(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::cancel_key()).await.map_err(db)
    }

    async fn is_cancelled(&self) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(Self::cancel_key()).await.map_err(db)
    }

    async fn active_session(&self) -> StoreResult<Option<ActiveSession>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::active_key()).await.map_err(db)?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set_active(&self, active: &ActiveSession) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(active)?;
        conn.set::<_, _, ()>(Self::active_key(), payload)
            .await
            .map_err(db)
    }

    async fn claim_active(&self, active: &ActiveSession) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(active)?;
        let set: Option<String> = redis::cmd("SET")
            .arg(Self::active_key())
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(db)?;
        Ok(set.is_some())
    }

    async fn clear_active(&self, session_id: Option<&str>) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .clear_active_script
            .key(Self::active_key())
            .arg(session_id.unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(db)?;
        Ok(removed == 1)
    }
}

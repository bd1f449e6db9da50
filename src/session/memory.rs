//! In-memory session store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::backend::{Outcome, Session, SessionStatus, SessionStore};
use crate::extraction::Record;
use crate::store::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, Session>,
    records: HashMap<String, Vec<Record>>,
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<State>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, total: u64) -> StoreResult<Session> {
        let session = Session::new(uuid::Uuid::new_v4().to_string(), total);
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn increment(&self, id: &str, outcome: Outcome) -> StoreResult<Session> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        session.count(outcome);
        Ok(session.clone())
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<Session> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        session.settle(status);
        Ok(session.clone())
    }

    async fn append_records(&self, id: &str, records: &[Record]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.state
            .write()
            .await
            .records
            .entry(id.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn records(&self, id: &str) -> StoreResult<Vec<Record>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_sessions(&self, limit: usize) -> StoreResult<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.status.is_terminal())
            .filter(|s| s.completed_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            state.sessions.remove(id);
            state.records.remove(id);
        }
        Ok(expired.len())
    }
}

//! In-memory progress backend for single-process operation.
//!
//! One write lock covers both the domain map and the counters, which makes
//! every transition atomic within the process. State is not persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{
    ActiveSession, DomainResult, DomainStatus, ProgressCounters, ProgressStore, Transition,
};
use crate::store::StoreResult;

#[derive(Debug, Default)]
struct SessionProgress {
    counters: ProgressCounters,
    domains: HashMap<String, DomainStatus>,
    order: Vec<String>,
    results: HashMap<String, DomainResult>,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, SessionProgress>,
    cancelled_until: Option<Instant>,
    active: Option<ActiveSession>,
}

impl State {
    fn cancelled(&self) -> bool {
        self.cancelled_until
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }
}

/// In-memory progress storage.
#[derive(Clone, Default)]
pub struct InMemoryProgressStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn seed(&self, session_id: &str, domains: &[String]) -> StoreResult<()> {
        let mut progress = SessionProgress::default();
        for domain in domains {
            if progress
                .domains
                .insert(domain.clone(), DomainStatus::Pending)
                .is_none()
            {
                progress.order.push(domain.clone());
            }
        }
        progress.counters = ProgressCounters::new(progress.order.len() as u64);

        self.state
            .write()
            .await
            .sessions
            .insert(session_id.to_string(), progress);
        Ok(())
    }

    async fn transition(
        &self,
        session_id: &str,
        domain: &str,
        to: DomainStatus,
    ) -> StoreResult<Transition> {
        let mut state = self.state.write().await;
        let cancelled = state.cancelled();
        let Some(progress) = state.sessions.get_mut(session_id) else {
            return Ok(Transition::Rejected { current: None });
        };
        let Some(current) = progress.domains.get(domain).copied() else {
            return Ok(Transition::Rejected { current: None });
        };

        if !current.can_become(to) {
            return Ok(Transition::Rejected {
                current: Some(current),
            });
        }
        if to == DomainStatus::Running && cancelled {
            return Ok(Transition::Cancelled);
        }

        progress.counters.apply(current, to);
        progress.domains.insert(domain.to_string(), to);
        Ok(Transition::Applied { previous: current })
    }

    async fn counters(&self, session_id: &str) -> StoreResult<Option<ProgressCounters>> {
        let state = self.state.read().await;
        Ok(state.sessions.get(session_id).map(|p| p.counters))
    }

    async fn domain_status(
        &self,
        session_id: &str,
        domain: &str,
    ) -> StoreResult<Option<DomainStatus>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(session_id)
            .and_then(|p| p.domains.get(domain).copied()))
    }

    async fn domains(&self, session_id: &str) -> StoreResult<Vec<(String, DomainStatus)>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(session_id)
            .map(|p| {
                p.order
                    .iter()
                    .filter_map(|d| p.domains.get(d).map(|s| (d.clone(), *s)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_result(&self, session_id: &str, result: &DomainResult) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(progress) = state.sessions.get_mut(session_id) {
            progress
                .results
                .insert(result.domain.clone(), result.clone());
        }
        Ok(())
    }

    async fn results(&self, session_id: &str) -> StoreResult<Vec<DomainResult>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(session_id)
            .map(|p| {
                p.order
                    .iter()
                    .filter_map(|d| p.results.get(d).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_cancelled(&self, ttl: Duration) -> StoreResult<()> {
        self.state.write().await.cancelled_until = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn clear_cancelled(&self) -> StoreResult<()> {
        self.state.write().await.cancelled_until = None;
        Ok(())
    }

    async fn is_cancelled(&self) -> StoreResult<bool> {
        Ok(self.state.read().await.cancelled())
    }

    async fn active_session(&self) -> StoreResult<Option<ActiveSession>> {
        Ok(self.state.read().await.active.clone())
    }

    async fn set_active(&self, active: &ActiveSession) -> StoreResult<()> {
        self.state.write().await.active = Some(active.clone());
        Ok(())
    }

    async fn claim_active(&self, active: &ActiveSession) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.active.is_some() {
            return Ok(false);
        }
        state.active = Some(active.clone());
        Ok(true)
    }

    async fn clear_active(&self, session_id: Option<&str>) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let matches = match (&state.active, session_id) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(active), Some(id)) => active.session_id == id,
        };
        if matches {
            state.active = None;
        }
        Ok(matches)
    }
}

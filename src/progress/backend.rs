//! Pluggable backend trait for batch progress and live control state.
//!
//! Per-domain status and per-session counters change together in one atomic
//! step, whether the backend is a process-local map or a shared Redis.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryReport;
use crate::scrapers::FetchSource;
use crate::store::StoreResult;

/// Lifecycle of one domain within a session.
///
/// Statuses only move forward: pending < running < {completed, failed, skipped}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Skipped => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` is progress.
    pub fn can_become(&self, next: DomainStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an atomic status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status and counters were updated.
    Applied { previous: DomainStatus },
    /// The move would regress the domain, or the domain is unknown.
    Rejected { current: Option<DomainStatus> },
    /// A move to running was refused because the batch is being cancelled.
    Cancelled,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Aggregate counters for one session.
///
/// `processed == successful + failed + skipped` and `processed <= total` hold
/// after every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub running: u64,
}

impl ProgressCounters {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Apply the counter side of a `from -> to` transition.
    pub(crate) fn apply(&mut self, from: DomainStatus, to: DomainStatus) {
        if from == DomainStatus::Running {
            self.running = self.running.saturating_sub(1);
        }
        match to {
            DomainStatus::Running => self.running += 1,
            DomainStatus::Completed => {
                self.processed += 1;
                self.successful += 1;
            }
            DomainStatus::Failed => {
                self.processed += 1;
                self.failed += 1;
            }
            DomainStatus::Skipped => {
                self.processed += 1;
                self.skipped += 1;
            }
            DomainStatus::Pending => {}
        }
    }

    pub fn is_finished(&self) -> bool {
        self.processed >= self.total
    }
}

/// What happened to one domain, recorded after its unit finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    pub domain: String,
    pub status: DomainStatus,
    #[serde(default)]
    pub records_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_via: Option<FetchSource>,
    pub finished_at: DateTime<Utc>,
}

/// State of the active-session pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Running,
    Stopping,
}

/// Live pointer to the one session currently allowed to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    pub state: ControlState,
    pub since: DateTime<Utc>,
}

impl ActiveSession {
    pub fn running(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: ControlState::Running,
            since: Utc::now(),
        }
    }
}

/// Progress and live control state storage.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Reset the session's progress: every domain pending, counters zeroed.
    async fn seed(&self, session_id: &str, domains: &[String]) -> StoreResult<()>;

    /// Move one domain to `to`, updating counters in the same atomic step.
    async fn transition(
        &self,
        session_id: &str,
        domain: &str,
        to: DomainStatus,
    ) -> StoreResult<Transition>;

    async fn counters(&self, session_id: &str) -> StoreResult<Option<ProgressCounters>>;

    async fn domain_status(&self, session_id: &str, domain: &str)
        -> StoreResult<Option<DomainStatus>>;

    /// Every domain of the session with its status. Order is unspecified.
    async fn domains(&self, session_id: &str) -> StoreResult<Vec<(String, DomainStatus)>>;

    async fn record_result(&self, session_id: &str, result: &DomainResult) -> StoreResult<()>;

    async fn results(&self, session_id: &str) -> StoreResult<Vec<DomainResult>>;

    /// Raise the cancellation flag; it expires on its own after `ttl`.
    async fn set_cancelled(&self, ttl: Duration) -> StoreResult<()>;

    async fn clear_cancelled(&self) -> StoreResult<()>;

    async fn is_cancelled(&self) -> StoreResult<bool>;

    async fn active_session(&self) -> StoreResult<Option<ActiveSession>>;

    /// Overwrite the active pointer.
    async fn set_active(&self, active: &ActiveSession) -> StoreResult<()>;

    /// Set the active pointer only if none exists. Returns whether it was set.
    async fn claim_active(&self, active: &ActiveSession) -> StoreResult<bool>;

    /// Clear the active pointer. With `Some(id)` it is cleared only while it
    /// still points at that session. Returns whether a pointer was removed.
    async fn clear_active(&self, session_id: Option<&str>) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        use DomainStatus::*;
        assert!(Pending.can_become(Running));
        assert!(Pending.can_become(Skipped));
        assert!(Running.can_become(Completed));
        assert!(!Running.can_become(Pending));
        assert!(!Completed.can_become(Failed));
        assert!(!Skipped.can_become(Running));
        assert!(!Running.can_become(Running));
    }

    #[test]
    fn test_counter_application() {
        let mut c = ProgressCounters::new(2);
        c.apply(DomainStatus::Pending, DomainStatus::Running);
        assert_eq!(c.running, 1);
        c.apply(DomainStatus::Running, DomainStatus::Completed);
        c.apply(DomainStatus::Pending, DomainStatus::Skipped);
        assert_eq!(c.running, 0);
        assert_eq!(c.processed, 2);
        assert_eq!(c.successful, 1);
        assert_eq!(c.skipped, 1);
        assert!(c.is_finished());
    }

    #[test]
    fn test_status_strings() {
        for status in [
            DomainStatus::Pending,
            DomainStatus::Running,
            DomainStatus::Completed,
            DomainStatus::Failed,
            DomainStatus::Skipped,
        ] {
            assert_eq!(DomainStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(DomainStatus::from_str("done"), None);
    }
}

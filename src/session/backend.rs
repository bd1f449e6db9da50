//! Durable session records.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extraction::Record;
use crate::store::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Status a session settles in once every domain is processed.
    pub fn on_finish(&self) -> Self {
        match self {
            Self::Running => Self::Completed,
            Self::Stopping => Self::Stopped,
            other => *other,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one domain, as counted by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Successful,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>, total: u64) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Running,
            total,
            processed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Count one terminal outcome. No-op once `processed == total`.
    pub(crate) fn count(&mut self, outcome: Outcome) {
        if self.processed >= self.total {
            return;
        }
        self.processed += 1;
        match outcome {
            Outcome::Successful => self.successful += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
        if self.processed >= self.total {
            let next = self.status.on_finish();
            if next != self.status {
                self.status = next;
                self.completed_at = Some(Utc::now());
            }
        }
    }

    /// Move to `status` unless already terminal.
    pub(crate) fn settle(&mut self, status: SessionStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Flatten to string fields for hash storage.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("status", self.status.as_str().to_string()),
            ("total", self.total.to_string()),
            ("processed", self.processed.to_string()),
            ("successful", self.successful.to_string()),
            ("failed", self.failed.to_string()),
            ("skipped", self.skipped.to_string()),
            ("started_at", self.started_at.to_rfc3339()),
        ];
        if let Some(done) = self.completed_at {
            fields.push(("completed_at", done.to_rfc3339()));
        }
        fields
    }

    /// Rebuild from hash fields. `None` when required fields are missing.
    pub fn from_fields(map: &HashMap<String, String>) -> Option<Self> {
        let number = |k: &str| map.get(k).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let time = |k: &str| {
            map.get(k)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Some(Self {
            id: map.get("id")?.clone(),
            status: SessionStatus::from_str(map.get("status")?)?,
            total: number("total"),
            processed: number("processed"),
            successful: number("successful"),
            failed: number("failed"),
            skipped: number("skipped"),
            started_at: time("started_at")?,
            completed_at: time("completed_at"),
        })
    }
}

/// Durable session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, total: u64) -> StoreResult<Session>;

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Atomically count one outcome and settle the status when finished.
    async fn increment(&self, id: &str, outcome: Outcome) -> StoreResult<Session>;

    /// Set the status unless the session is already terminal.
    async fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<Session>;

    /// Append records; existing ones are kept.
    async fn append_records(&self, id: &str, records: &[Record]) -> StoreResult<()>;

    async fn records(&self, id: &str) -> StoreResult<Vec<Record>>;

    /// Most recent sessions first.
    async fn list_sessions(&self, limit: usize) -> StoreResult<Vec<Session>>;

    /// Delete terminal sessions finished before `cutoff`. Returns how many.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_settles_on_last_outcome() {
        let mut s = Session::new("s1", 2);
        s.count(Outcome::Successful);
        assert_eq!(s.status, SessionStatus::Running);
        s.count(Outcome::Failed);
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.completed_at.is_some());

        // processed never exceeds total
        s.count(Outcome::Skipped);
        assert_eq!(s.processed, 2);
        assert_eq!(s.skipped, 0);
    }

    #[test]
    fn test_stopping_session_finishes_as_stopped() {
        let mut s = Session::new("s1", 1);
        s.settle(SessionStatus::Stopping);
        s.count(Outcome::Skipped);
        assert_eq!(s.status, SessionStatus::Stopped);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut s = Session::new("s1", 1);
        s.settle(SessionStatus::Failed);
        s.settle(SessionStatus::Running);
        assert_eq!(s.status, SessionStatus::Failed);
    }

    #[test]
    fn test_fields_roundtrip() {
        let mut s = Session::new("s1", 3);
        s.count(Outcome::Successful);
        s.settle(SessionStatus::Stopped);
        let map: HashMap<String, String> = s
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Session::from_fields(&map).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.status, SessionStatus::Stopped);
        assert_eq!(back.successful, 1);
        assert_eq!(
            back.completed_at.map(|t| t.timestamp()),
            s.completed_at.map(|t| t.timestamp())
        );
        assert!(Session::from_fields(&HashMap::new()).is_none());
    }
}

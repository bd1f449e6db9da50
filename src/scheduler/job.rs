//! Scheduled job definitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch size of the built-in partial job.
pub const DEFAULT_PARTIAL_BATCH_SIZE: usize = 500;

/// Id of the built-in session cleanup job.
pub const CLEANUP_JOB_ID: &str = "cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Every configured domain on each fire.
    Full,
    /// A random sample of `batch_size` domains on each fire.
    Partial,
    /// Session retention housekeeping. Never persisted.
    Cleanup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "partial" => Some(Self::Partial),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring job, as persisted for crash recovery.
///
/// An empty `domains` list means "the configured domain list at fire time".
/// A job with `interval_seconds` fires on that fixed period and ignores
/// `cron_expression`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub cron_expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub paused: bool,
}

impl ScheduledJob {
    pub fn full(id: impl Into<String>, cron: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            id: id.into(),
            job_type: JobType::Full,
            cron_expression: cron.into(),
            interval_seconds: None,
            domains,
            batch_size: None,
            paused: false,
        }
    }

    pub fn partial(
        id: impl Into<String>,
        cron: impl Into<String>,
        domains: Vec<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: JobType::Partial,
            cron_expression: cron.into(),
            interval_seconds: None,
            domains,
            batch_size: Some(batch_size),
            paused: false,
        }
    }

    pub(crate) fn cleanup(cron: impl Into<String>) -> Self {
        Self {
            id: CLEANUP_JOB_ID.to_string(),
            job_type: JobType::Cleanup,
            cron_expression: cron.into(),
            interval_seconds: None,
            domains: Vec::new(),
            batch_size: None,
            paused: false,
        }
    }

    /// Fire every `every` instead of on a cron schedule.
    pub fn every(mut self, every: Duration) -> Self {
        self.cron_expression.clear();
        self.interval_seconds = Some(every.as_secs());
        self
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_seconds.map(Duration::from_secs)
    }

    pub fn is_persistent(&self) -> bool {
        self.job_type != JobType::Cleanup
    }

    /// Human readable trigger, for listings and logs.
    pub fn trigger_label(&self) -> String {
        match self.interval_seconds {
            Some(secs) => format!("every {}s", secs),
            None => self.cron_expression.clone(),
        }
    }
}

/// Listing entry for a registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub job_type: JobType,
    /// Empty for interval jobs.
    pub cron_expression: String,
    pub interval_seconds: Option<u64>,
    pub batch_size: Option<usize>,
    pub domains_count: usize,
    pub paused: bool,
    /// Next fire of the live trigger; `None` while paused.
    pub next_run_time: Option<DateTime<Utc>>,
}

/// What one fire did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Started { session_id: String, total: usize },
    /// Another session was active; nothing was queued.
    SkippedActive { session_id: String },
    NoDomains,
    CleanedUp { removed: usize },
}

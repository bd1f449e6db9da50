//! Best-effort delivery of extracted records to a downstream endpoint.

mod webhook;

pub use webhook::{WebhookDelivery, WEBHOOK_USER_AGENT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::extraction::Record;

/// Errors delivering a single record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("invalid delivery request: {0}")]
    Request(String),
}

/// Where and how to deliver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliverySettings {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Per-batch delivery outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    /// No endpoint was configured, nothing was sent.
    #[serde(default)]
    pub skipped: bool,
}

impl DeliveryReport {
    pub fn skipped(total: usize) -> Self {
        Self {
            total,
            skipped: true,
            ..Default::default()
        }
    }
}

/// Sends records downstream; failures end up in the report, never as errors.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(
        &self,
        records: &[Record],
        domain: &str,
        session_id: &str,
        settings: &DeliverySettings,
    ) -> DeliveryReport;
}

//! Structured record extraction from page content.
//!
//! The extraction collaborator is a language model reached over HTTP. It is
//! expected to retry transient failures itself and to tell "no records"
//! (an empty list) apart from "extraction failed" (an error).

mod gemini;
mod parse;
mod record;

pub use gemini::{GeminiExtractor, DEFAULT_MODEL, DEFAULT_PROMPT, MAX_CONTENT_CHARS};
pub use parse::parse_records;
pub use record::Record;

use async_trait::async_trait;

use crate::scrapers::PageContent;

/// Errors from the extraction client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    /// Upstream failed in a way another attempt may fix.
    #[error("transient extraction failure: {0}")]
    Transient(String),
    /// Output could not be read as records.
    #[error("malformed extraction output: {0}")]
    Malformed(String),
    /// Upstream refused the request.
    #[error("extraction request rejected: {0}")]
    Request(String),
    #[error("extraction not configured: {0}")]
    Config(String),
}

/// Credentials and prompt for one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    pub api_key: Option<String>,
    pub model: String,
    /// Replaces the built-in prompt when set.
    pub prompt: Option<String>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            prompt: None,
        }
    }
}

/// Extracts records from one page.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(
        &self,
        content: &PageContent,
        domain: &str,
        settings: &ExtractionSettings,
    ) -> Result<Vec<Record>, ExtractionError>;
}

/// Validate raw objects into records, dropping the ones without a description.
pub fn validate_records(
    objects: &[serde_json::Map<String, serde_json::Value>],
    domain: &str,
) -> Vec<Record> {
    objects
        .iter()
        .filter_map(|o| Record::from_object(o, domain))
        .collect()
}

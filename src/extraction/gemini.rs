//! Google Gemini extraction backend.
//!
//! Calls the `generateContent` REST endpoint with the page content and a
//! prompt asking for a JSON array of offers.
//!
//! Retries (up to 3 attempts, `2^attempt` s apart):
//! - network errors, 429 and 5xx
//! - responses without candidate text (blocked or empty)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::parse::parse_records;
use super::{validate_records, ExtractionClient, ExtractionError, ExtractionSettings, Record};
use crate::scrapers::backoff::{collaborator_backoff, Backoff};
use crate::scrapers::content::truncate_chars;
use crate::scrapers::PageContent;

/// Maximum attempts per extraction.
const MAX_ATTEMPTS: u32 = 3;

/// Content beyond this many characters is cut before prompting.
pub const MAX_CONTENT_CHARS: usize = 80_000;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_PROMPT: &str = r#"You are an expert at analysing shop websites and extracting promo codes and offers.

Find EVERY promo code, sale, discount and special offer in the content of {domain} below.
Look in banners, popups, promo blocks, headers and footers. Only report what is on the page.
Dates use the format "YYYY-MM-DD HH:MM". offer_type: 1=promo code, 2=sale, 3=free shipping, 4=gift.

Answer with a JSON array only, one object per offer:
[
  {
    "shop": "shop name",
    "domain": "{domain}",
    "description": "short summary, at most 60 characters",
    "full_description": "offer conditions, at most 160 characters",
    "code": "PROMOCODE or null",
    "date_start": "2026-01-24 12:00 or null",
    "date_end": "2026-02-24 23:59 or null",
    "offer_type": 1,
    "target_url": "direct link to the offer or the home page",
    "click_url": null,
    "discount": "20% or null",
    "categories": ["3", "11"]
  }
]

If there are no offers, answer with [].

Content of {domain}:
{content}
"#;

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn text(self) -> Option<String> {
        let text: String = self
            .candidates?
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Gemini-compatible extraction client.
pub struct GeminiExtractor {
    client: Client,
    base_url: String,
    backoff: Backoff,
}

impl Default for GeminiExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiExtractor {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            backoff: collaborator_backoff(),
        }
    }

    /// Point at another API host (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn prompt(content: &PageContent, domain: &str, settings: &ExtractionSettings) -> String {
        let body = if content.clean_html.trim().is_empty() {
            content.text.as_str()
        } else {
            content.clean_html.as_str()
        };
        let body = if body.chars().count() > MAX_CONTENT_CHARS {
            warn!("Content for {} truncated to {} chars", domain, MAX_CONTENT_CHARS);
            format!("{}\n...(truncated)", truncate_chars(body, MAX_CONTENT_CHARS))
        } else {
            body.to_string()
        };

        let template = settings
            .prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_PROMPT);
        let prompt = template.replace("{domain}", domain);
        if prompt.contains("{content}") {
            prompt.replace("{content}", &body)
        } else {
            format!("{}\n\nContent of {}:\n{}", prompt, domain, body)
        }
    }

    async fn attempt(&self, url: &str, request: &GeminiRequest) -> Result<String, ExtractionError> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| ExtractionError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ExtractionError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GeminiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(ExtractionError::Request(format!("HTTP {}: {}", status, message)));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Transient(format!("unreadable response: {}", e)))?;
        if let Some(ref error) = parsed.error {
            return Err(ExtractionError::Transient(error.message.clone()));
        }
        parsed
            .text()
            .ok_or_else(|| ExtractionError::Transient("response has no candidate text".into()))
    }
}

#[async_trait]
impl ExtractionClient for GeminiExtractor {
    async fn extract(
        &self,
        content: &PageContent,
        domain: &str,
        settings: &ExtractionSettings,
    ) -> Result<Vec<Record>, ExtractionError> {
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ExtractionError::Config("no extraction API key configured".into()))?;

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: Self::prompt(content, domain, settings),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.3,
                max_output_tokens: 8192,
            },
        };
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, settings.model, api_key
        );

        let mut last_error = ExtractionError::Transient("no attempts made".into());
        for attempt in 1..=MAX_ATTEMPTS {
            debug!("Extraction attempt {}/{} for {}", attempt, MAX_ATTEMPTS, domain);
            match self.attempt(&url, &request).await {
                Ok(text) => {
                    let objects = parse_records(&text)?;
                    let records = validate_records(&objects, domain);
                    if records.len() < objects.len() {
                        warn!(
                            "Dropped {} invalid records from {}",
                            objects.len() - records.len(),
                            domain
                        );
                    }
                    info!("Extracted {} records from {}", records.len(), domain);
                    return Ok(records);
                }
                Err(ExtractionError::Transient(msg)) => {
                    warn!("Extraction attempt {} for {} failed: {}", attempt, domain, msg);
                    last_error = ExtractionError::Transient(msg);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn fast() -> Backoff {
        Backoff::fixed(2.0, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn settings() -> ExtractionSettings {
        ExtractionSettings {
            api_key: Some("test-key".into()),
            ..Default::default()
        }
    }

    fn content() -> PageContent {
        PageContent {
            url: "https://shop.fr".into(),
            text: "Code HIVER20 -20%".into(),
            ..Default::default()
        }
    }

    fn candidate(text: &str) -> String {
        serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_extracts_records() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .with_status(200)
            .with_body(candidate(
                "```json\n[{\"description\": \"-20% sitewide\", \"code\": \"HIVER20\"}, {\"shop\": \"no description\"}]\n```",
            ))
            .create_async()
            .await;

        let extractor = GeminiExtractor::new().with_base_url(server.url()).with_backoff(fast());
        let records = extractor.extract(&content(), "shop.fr", &settings()).await.unwrap();
        mock.assert_async().await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code.as_deref(), Some("HIVER20"));
        assert_eq!(records[0].domain, "shop.fr");
    }

    #[tokio::test]
    async fn test_empty_array_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", Matcher::Any)
            .with_status(200)
            .with_body(candidate("[]"))
            .create_async()
            .await;

        let extractor = GeminiExtractor::new().with_base_url(server.url()).with_backoff(fast());
        let records = extractor.extract(&content(), "shop.fr", &settings()).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_server_errors_retried_then_fail() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let extractor = GeminiExtractor::new().with_base_url(server.url()).with_backoff(fast());
        let err = extractor.extract(&content(), "shop.fr", &settings()).await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, ExtractionError::Transient(_)));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error": {"message": "API key not valid"}}"#)
            .expect(1)
            .create_async()
            .await;

        let extractor = GeminiExtractor::new().with_base_url(server.url()).with_backoff(fast());
        let err = extractor.extract(&content(), "shop.fr", &settings()).await.unwrap_err();
        mock.assert_async().await;
        match err {
            ExtractionError::Request(msg) => assert!(msg.contains("API key not valid")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prose_answer_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .with_status(200)
            .with_body(candidate("Sorry, I cannot help with that."))
            .expect(1)
            .create_async()
            .await;

        let extractor = GeminiExtractor::new().with_base_url(server.url()).with_backoff(fast());
        let err = extractor.extract(&content(), "shop.fr", &settings()).await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, ExtractionError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let extractor = GeminiExtractor::new();
        let err = extractor
            .extract(&content(), "shop.fr", &ExtractionSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Config(_)));
    }

    #[test]
    fn test_prompt_uses_override_and_truncates() {
        let big = PageContent {
            clean_html: "é".repeat(MAX_CONTENT_CHARS + 10),
            ..Default::default()
        };
        let custom = ExtractionSettings {
            prompt: Some("Offers on {domain}:".into()),
            ..settings()
        };
        let prompt = GeminiExtractor::prompt(&big, "shop.fr", &custom);
        assert!(prompt.starts_with("Offers on shop.fr:"));
        assert!(prompt.ends_with("...(truncated)"));
        assert!(prompt.chars().count() < MAX_CONTENT_CHARS + 100);

        let default = GeminiExtractor::prompt(&content(), "shop.fr", &settings());
        assert!(default.contains("Content of shop.fr:\nCode HIVER20 -20%"));
    }
}

//! Webhook delivery: one POST per record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{DeliveryClient, DeliveryError, DeliveryReport, DeliverySettings};
use crate::extraction::Record;
use crate::scrapers::backoff::{collaborator_backoff, Backoff};

pub const WEBHOOK_USER_AGENT: &str = "harvester-webhook/1.0";

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_PAUSE: Duration = Duration::from_millis(500);

/// Posts each record as JSON to a configured URL.
pub struct WebhookDelivery {
    client: Client,
    backoff: Backoff,
    pause: Duration,
}

impl Default for WebhookDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDelivery {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(WEBHOOK_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            backoff: collaborator_backoff(),
            pause: DEFAULT_PAUSE,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pause between consecutive records.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn payload(record: &Record, domain: &str, session_id: &str) -> Result<Value, DeliveryError> {
        let mut payload =
            serde_json::to_value(record).map_err(|e| DeliveryError::Request(e.to_string()))?;
        if let Value::Object(ref mut map) = payload {
            map.insert(
                "_metadata".to_string(),
                json!({
                    "source": "harvester",
                    "domain": domain,
                    "session_id": session_id,
                    "sent_at": Utc::now().to_rfc3339(),
                }),
            );
        }
        Ok(payload)
    }

    async fn send(
        &self,
        url: &str,
        token: Option<&str>,
        payload: &Value,
    ) -> Result<(), DeliveryError> {
        let mut last = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self.client.post(url).json(payload);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if matches!(status, 200 | 201 | 202) {
                        return Ok(());
                    }
                    let body: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(200)
                        .collect();
                    if (400..500).contains(&status) {
                        return Err(DeliveryError::Rejected { status, body });
                    }
                    last = format!("HTTP {}: {}", status, body);
                }
                Err(e) => {
                    last = if e.is_timeout() {
                        format!("timeout: {}", e)
                    } else {
                        format!("request failed: {}", e)
                    };
                }
            }

            warn!("Webhook attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, last);
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }
        }
        Err(DeliveryError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }
}

#[async_trait]
impl DeliveryClient for WebhookDelivery {
    async fn deliver(
        &self,
        records: &[Record],
        domain: &str,
        session_id: &str,
        settings: &DeliverySettings,
    ) -> DeliveryReport {
        let Some(url) = settings.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            debug!("No webhook configured, skipping delivery of {} records", records.len());
            return DeliveryReport::skipped(records.len());
        };
        let token = settings.token.as_deref().filter(|t| !t.is_empty());

        let mut report = DeliveryReport {
            total: records.len(),
            ..Default::default()
        };

        for (i, record) in records.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            let outcome = match Self::payload(record, domain, session_id) {
                Ok(payload) => self.send(url, token, &payload).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => report.successful += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        info!(
            "Delivered {}/{} records for {} ({} failed)",
            report.successful, report.total, domain, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::Map;

    fn record(description: &str) -> Record {
        let mut raw = Map::new();
        raw.insert("description".into(), json!(description));
        Record::from_object(&raw, "shop.fr").unwrap()
    }

    fn fast() -> WebhookDelivery {
        WebhookDelivery::new()
            .with_backoff(Backoff::fixed(2.0, Duration::from_millis(1), Duration::from_millis(5)))
            .with_pause(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_posts_with_metadata_and_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("authorization", "Bearer secret")
            .match_header("user-agent", WEBHOOK_USER_AGENT)
            .match_body(Matcher::PartialJson(json!({
                "description": "-20%",
                "_metadata": { "source": "harvester", "domain": "shop.fr", "session_id": "s1" }
            })))
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let settings = DeliverySettings {
            url: Some(format!("{}/hook", server.url())),
            token: Some("secret".into()),
        };
        let report = fast().deliver(&[record("-20%")], "shop.fr", "s1", &settings).await;
        mock.assert_async().await;
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 0);
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal_per_record() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(422)
            .with_body("bad record")
            .expect(2)
            .create_async()
            .await;

        let settings = DeliverySettings {
            url: Some(format!("{}/hook", server.url())),
            token: None,
        };
        let report = fast()
            .deliver(&[record("a"), record("b")], "shop.fr", "s1", &settings)
            .await;
        mock.assert_async().await;
        assert_eq!(report.total, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("422"));
    }

    #[tokio::test]
    async fn test_server_error_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let settings = DeliverySettings {
            url: Some(format!("{}/hook", server.url())),
            token: None,
        };
        let report = fast().deliver(&[record("a")], "shop.fr", "s1", &settings).await;
        mock.assert_async().await;
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_no_url_skips() {
        let report = fast()
            .deliver(&[record("a")], "shop.fr", "s1", &DeliverySettings::default())
            .await;
        assert!(report.skipped);
        assert_eq!(report.total, 1);
        assert_eq!(report.successful, 0);
    }
}

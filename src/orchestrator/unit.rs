//! The per-domain unit task: fetch, extract, persist, deliver.
//!
//! Every status change goes through [`ProgressStore::transition`]. The
//! session row is incremented only when that transition was applied, so a
//! domain is counted exactly once whichever path finishes it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::pool::{UnitJob, UnitRunner};
use super::Services;
use crate::delivery::DeliveryReport;
use crate::progress::{ControlState, DomainResult, DomainStatus, Transition};
use crate::scrapers::{extract_visible_content, Backoff, FetchSource};
use crate::session::{Outcome, SessionStatus};
use crate::store::StoreResult;

/// Attempts at a progress transition before the unit gives up on it.
const TRANSITION_ATTEMPTS: u32 = 3;

fn transition_backoff() -> Backoff {
    Backoff::fixed(2.0, Duration::from_millis(100), Duration::from_secs(2))
}

/// What a unit ended with, before it is written to the stores.
#[derive(Debug, Default)]
struct Finish {
    records_count: usize,
    error: Option<String>,
    delivery: Option<DeliveryReport>,
    fetched_via: Option<FetchSource>,
}

impl Finish {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

fn outcome_of(status: DomainStatus) -> Option<Outcome> {
    match status {
        DomainStatus::Completed => Some(Outcome::Successful),
        DomainStatus::Failed => Some(Outcome::Failed),
        DomainStatus::Skipped => Some(Outcome::Skipped),
        DomainStatus::Pending | DomainStatus::Running => None,
    }
}

/// Runs units against the shared services.
pub struct DomainUnit {
    services: Arc<Services>,
}

impl DomainUnit {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// True when the batch is being stopped, or when the active pointer no
    /// longer names this unit's session as running.
    async fn cancelled(&self, unit: &UnitJob) -> bool {
        if unit.cancel.is_cancelled() {
            return true;
        }
        let progress = &self.services.progress;
        match progress.is_cancelled().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!("Could not read cancellation flag: {}", e),
        }
        match progress.active_session().await {
            Ok(Some(active)) => {
                active.session_id != unit.session_id || active.state != ControlState::Running
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not read active session: {}", e);
                false
            }
        }
    }

    async fn transition(&self, unit: &UnitJob, to: DomainStatus) -> StoreResult<Transition> {
        let backoff = transition_backoff();
        let mut attempt = 0;
        loop {
            match self
                .services
                .progress
                .transition(&unit.session_id, &unit.domain, to)
                .await
            {
                Ok(t) => return Ok(t),
                Err(e) if attempt + 1 < TRANSITION_ATTEMPTS => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        "Could not move {} to {} (attempt {}/{}): {}, retrying in {:?}",
                        unit.domain,
                        to,
                        attempt + 1,
                        TRANSITION_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Move the domain to a terminal status and count it.
    async fn finish(&self, unit: &UnitJob, status: DomainStatus, finish: Finish) {
        let progress = &self.services.progress;
        let (status, finish) = match self.transition(unit, status).await {
            Ok(t) if t.is_applied() => (status, finish),
            Ok(t) => {
                debug!("{} not moved to {}: {:?}", unit.domain, status, t);
                return;
            }
            Err(e) if status == DomainStatus::Failed => {
                error!("Could not record {} as failed: {}", unit.domain, e);
                return;
            }
            Err(e) => {
                error!("Could not record {} as {}: {}", unit.domain, status, e);
                // one last write so the domain still counts towards the total
                match progress
                    .transition(&unit.session_id, &unit.domain, DomainStatus::Failed)
                    .await
                {
                    Ok(t) if t.is_applied() => (
                        DomainStatus::Failed,
                        Finish {
                            error: Some(format!("could not record {}: {}", status, e)),
                            ..finish
                        },
                    ),
                    Ok(t) => {
                        debug!("{} not moved to failed: {:?}", unit.domain, t);
                        return;
                    }
                    Err(e) => {
                        error!("Could not record {} as failed: {}", unit.domain, e);
                        return;
                    }
                }
            }
        };

        let result = DomainResult {
            domain: unit.domain.clone(),
            status,
            records_count: finish.records_count,
            error: finish.error,
            delivery: finish.delivery,
            fetched_via: finish.fetched_via,
            finished_at: Utc::now(),
        };
        if let Err(e) = progress.record_result(&unit.session_id, &result).await {
            warn!("Could not store result for {}: {}", unit.domain, e);
        }

        let Some(outcome) = outcome_of(status) else {
            return;
        };
        match self.services.sessions.increment(&unit.session_id, outcome).await {
            Ok(session) => {
                if session.status == SessionStatus::Completed {
                    info!(
                        "Session {} completed: {}/{} successful, {} failed, {} skipped",
                        session.id, session.successful, session.total, session.failed, session.skipped
                    );
                    if let Err(e) = progress.clear_active(Some(&session.id)).await {
                        warn!("Could not clear active session {}: {}", session.id, e);
                    }
                }
            }
            Err(e) => error!("Could not count {} for session {}: {}", unit.domain, unit.session_id, e),
        }
    }

    /// Mark a unit that never started as skipped.
    pub(crate) async fn skip(&self, unit: &UnitJob) {
        self.finish(unit, DomainStatus::Skipped, Finish::default()).await;
    }

    async fn process(&self, unit: &UnitJob) {
        if self.cancelled(unit).await {
            debug!("{} skipped before fetch", unit.domain);
            self.skip(unit).await;
            return;
        }

        match self.transition(unit, DomainStatus::Running).await {
            Ok(Transition::Applied { .. }) => {}
            Ok(Transition::Cancelled) => {
                debug!("{} refused to start, batch is stopping", unit.domain);
                self.skip(unit).await;
                return;
            }
            Ok(Transition::Rejected { current }) => {
                debug!("{} already {:?}, not starting", unit.domain, current);
                return;
            }
            Err(e) => {
                error!("Could not start {}: {}", unit.domain, e);
                self.finish(
                    unit,
                    DomainStatus::Failed,
                    Finish::error(format!("could not start: {}", e)),
                )
                .await;
                return;
            }
        }

        let config = &unit.config;
        let page = match self.services.fetcher.fetch(&unit.domain, &config.fetch).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Fetch failed for {}: {}", unit.domain, e);
                self.finish(unit, DomainStatus::Failed, Finish::error(e.to_string()))
                    .await;
                return;
            }
        };

        if self.cancelled(unit).await {
            debug!("{} skipped after fetch", unit.domain);
            self.finish(
                unit,
                DomainStatus::Skipped,
                Finish {
                    fetched_via: Some(page.source),
                    ..Default::default()
                },
            )
            .await;
            return;
        }

        let content = extract_visible_content(&page.html, &page.url);
        let records = match self
            .services
            .extractor
            .extract(&content, &unit.domain, &config.extraction)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Extraction failed for {}: {}", unit.domain, e);
                self.finish(
                    unit,
                    DomainStatus::Failed,
                    Finish {
                        error: Some(e.to_string()),
                        fetched_via: Some(page.source),
                        ..Default::default()
                    },
                )
                .await;
                return;
            }
        };

        if let Err(e) = self
            .services
            .sessions
            .append_records(&unit.session_id, &records)
            .await
        {
            warn!("Could not persist records for {}: {}", unit.domain, e);
        }

        let delivery = if records.is_empty() {
            None
        } else {
            Some(
                self.services
                    .delivery
                    .deliver(&records, &unit.domain, &unit.session_id, &config.delivery)
                    .await,
            )
        };

        info!(
            "{}: {} records via {:?}",
            unit.domain,
            records.len(),
            page.source
        );
        self.finish(
            unit,
            DomainStatus::Completed,
            Finish {
                records_count: records.len(),
                error: None,
                delivery,
                fetched_via: Some(page.source),
            },
        )
        .await;
    }
}

#[async_trait]
impl UnitRunner for DomainUnit {
    async fn run(&self, unit: &UnitJob) {
        self.process(unit).await;
    }

    async fn abandoned(&self, unit: &UnitJob, limit: Duration) {
        self.finish(
            unit,
            DomainStatus::Failed,
            Finish::error(format!("hard time limit of {}s exceeded", limit.as_secs())),
        )
        .await;
    }
}

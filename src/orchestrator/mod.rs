//! Batch orchestration: one session per batch, one unit per domain.
//!
//! A batch is started by creating a durable session, claiming the live
//! active-session pointer and seeding progress, then enqueueing one unit per
//! domain on the worker pool. Stopping is cooperative: the cancellation flag
//! is raised, queued units are purged and skipped, and in-flight units
//! observe the flag at their next checkpoint.

mod pool;
mod unit;

pub use pool::{DrainHandle, TimeLimits, UnitJob, UnitRunner, WorkerPool};
pub use unit::DomainUnit;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::delivery::DeliveryClient;
use crate::extraction::ExtractionClient;
use crate::progress::{ActiveSession, ControlState, ProgressStore};
use crate::proxy::ProxyRotator;
use crate::runtime_config::RuntimeConfig;
use crate::scrapers::PageFetcher;
use crate::session::{SessionStatus, SessionStore};
use crate::store::StoreError;

/// Errors from batch control.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("a batch is already running (session {0})")]
    AlreadyRunning(String),
    #[error("no batch is running")]
    NotRunning,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("batch has no domains")]
    EmptyBatch,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

const FINALIZER_POLL: Duration = Duration::from_millis(250);

/// Collaborators shared by the orchestrator and every unit task.
pub struct Services {
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn ExtractionClient>,
    pub delivery: Arc<dyn DeliveryClient>,
    pub progress: Arc<dyn ProgressStore>,
    pub sessions: Arc<dyn SessionStore>,
    /// Pool that live proxy endpoints are added to when a batch starts.
    pub proxies: Option<Arc<ProxyRotator>>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub concurrency: usize,
    pub limits: TimeLimits,
    pub cancellation_ttl: Duration,
    pub stop_grace: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            limits: TimeLimits::default(),
            cancellation_ttl: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.worker_concurrency,
            limits: TimeLimits {
                soft: settings.soft_time_limit,
                hard: settings.hard_time_limit,
            },
            cancellation_ttl: settings.cancellation_ttl,
            stop_grace: settings.stop_grace,
        }
    }
}

/// Returned by a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct BatchHandle {
    pub session_id: String,
    pub total: usize,
    #[serde(skip)]
    pub unit_ids: Vec<Uuid>,
}

/// Returned by a stop request.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub session_id: String,
    /// Queued units purged plus units that were in flight.
    pub revoked: usize,
}

/// Snapshot of a batch for status endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStatus {
    pub session_id: Option<String>,
    pub status: String,
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub running: u64,
    /// Processed domains per minute.
    pub rate: f64,
    pub started_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn idle() -> Self {
        Self {
            status: "idle".to_string(),
            ..Default::default()
        }
    }

    pub fn unknown(session_id: Option<String>) -> Self {
        Self {
            session_id,
            status: "unknown".to_string(),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        SessionStatus::from_str(&self.status)
            .map(|s| s.is_terminal())
            .unwrap_or(false)
    }
}

/// Result of comparing live control state with the durable session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No active pointer.
    Idle,
    /// The durable session is terminal or missing; live state was cleared.
    Cleared { session_id: String },
    /// The durable session is active; the pointer was rewritten from it.
    Reasserted {
        session_id: String,
        state: ControlState,
    },
    Consistent { session_id: String },
}

/// Seam used by the scheduler to start batches.
#[async_trait]
pub trait BatchLauncher: Send + Sync {
    async fn active_session(&self) -> Result<Option<ActiveSession>>;

    async fn start_batch(&self, domains: Vec<String>, config: RuntimeConfig) -> Result<BatchHandle>;

    async fn reconcile(&self) -> Result<ReconcileOutcome>;
}

struct CurrentBatch {
    session_id: String,
    cancel: CancellationToken,
}

pub struct TaskOrchestrator {
    services: Arc<Services>,
    runner: Arc<DomainUnit>,
    pool: WorkerPool,
    options: OrchestratorOptions,
    current: Mutex<Option<CurrentBatch>>,
    finalizer: Mutex<Option<JoinHandle<()>>>,
}

/// Trim, drop empties and duplicates, keep first-seen order.
pub fn dedupe_domains(domains: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    domains
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .filter(|d| seen.insert(d.to_lowercase()))
        .collect()
}

impl TaskOrchestrator {
    /// Build the orchestrator and start its workers. Needs a Tokio runtime.
    pub fn new(services: Services, options: OrchestratorOptions) -> Self {
        let services = Arc::new(services);
        let runner = Arc::new(DomainUnit::new(services.clone()));
        let pool = WorkerPool::start(options.concurrency, options.limits, runner.clone());
        Self {
            services,
            runner,
            pool,
            options,
            current: Mutex::new(None),
            finalizer: Mutex::new(None),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Session whose units were dispatched by this process, if any.
    pub fn local_session(&self) -> Option<String> {
        self.current().as_ref().map(|c| c.session_id.clone())
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<CurrentBatch>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for `domains` and dispatch one unit per domain.
    ///
    /// Returns as soon as the units are queued.
    pub async fn start_batch(
        &self,
        domains: Vec<String>,
        config: RuntimeConfig,
    ) -> Result<BatchHandle> {
        if let Err(e) = self.reconcile().await {
            warn!("Reconciliation before start failed: {}", e);
        }

        let domains = dedupe_domains(domains);
        if domains.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }

        let progress = &self.services.progress;
        if let Some(active) = progress.active_session().await? {
            return Err(OrchestratorError::AlreadyRunning(active.session_id));
        }

        let session = self
            .services
            .sessions
            .create_session(domains.len() as u64)
            .await?;

        if !progress
            .claim_active(&ActiveSession::running(&session.id))
            .await?
        {
            // lost a race with another starter
            let winner = progress
                .active_session()
                .await?
                .map(|a| a.session_id)
                .unwrap_or_default();
            if let Err(e) = self
                .services
                .sessions
                .set_status(&session.id, SessionStatus::Failed)
                .await
            {
                warn!("Could not fail orphaned session {}: {}", session.id, e);
            }
            return Err(OrchestratorError::AlreadyRunning(winner));
        }

        if let Err(e) = self.prepare(&session.id, &domains).await {
            error!("Could not prepare session {}: {}", session.id, e);
            if let Err(e) = self
                .services
                .sessions
                .set_status(&session.id, SessionStatus::Failed)
                .await
            {
                warn!("Could not fail unprepared session {}: {}", session.id, e);
            }
            if let Err(e) = progress.clear_active(Some(&session.id)).await {
                warn!("Could not clear active session {}: {}", session.id, e);
            }
            return Err(e.into());
        }

        if let Some(pool) = &self.services.proxies {
            pool.set_live(config.proxy.clone());
        }

        let cancel = CancellationToken::new();
        *self.current() = Some(CurrentBatch {
            session_id: session.id.clone(),
            cancel: cancel.clone(),
        });

        let config = Arc::new(config);
        let mut unit_ids = Vec::with_capacity(domains.len());
        for domain in &domains {
            let id = Uuid::new_v4();
            unit_ids.push(id);
            self.pool.submit(UnitJob {
                id,
                session_id: session.id.clone(),
                domain: domain.clone(),
                config: config.clone(),
                cancel: cancel.clone(),
            });
        }

        info!(
            "Started session {} with {} domains",
            session.id,
            domains.len()
        );
        Ok(BatchHandle {
            session_id: session.id,
            total: domains.len(),
            unit_ids,
        })
    }

    async fn prepare(&self, session_id: &str, domains: &[String]) -> std::result::Result<(), StoreError> {
        self.services.progress.clear_cancelled().await?;
        self.services.progress.seed(session_id, domains).await
    }

    /// Raise the cancellation flag and drain the active batch.
    ///
    /// Returns once queued units are purged; the session settles to
    /// `stopped` in the background when in-flight units finish.
    pub async fn stop_batch(&self) -> Result<StopReport> {
        let progress = &self.services.progress;
        let active = progress
            .active_session()
            .await?
            .ok_or(OrchestratorError::NotRunning)?;
        let session_id = active.session_id.clone();

        progress.set_cancelled(self.options.cancellation_ttl).await?;
        if let Some(current) = self.current().as_ref() {
            if current.session_id == session_id {
                current.cancel.cancel();
            }
        }

        // session row first, so reconciliation never sees a stopping pointer
        // over a running row
        self.services
            .sessions
            .set_status(&session_id, SessionStatus::Stopping)
            .await?;
        progress
            .set_active(&ActiveSession {
                state: ControlState::Stopping,
                ..active
            })
            .await?;

        let purged = self.pool.purge(&session_id);
        let in_flight = self.pool.in_flight();
        for unit in &purged {
            self.runner.skip(unit).await;
        }
        let revoked = purged.len() + in_flight;
        info!(
            "Stopping session {}: {} queued units purged, {} in flight",
            session_id,
            purged.len(),
            in_flight
        );

        self.spawn_finalizer(session_id.clone());
        Ok(StopReport {
            session_id,
            revoked,
        })
    }

    fn spawn_finalizer(&self, session_id: String) {
        let drain = self.pool.drain_handle();
        let services = self.services.clone();
        let grace = self.options.stop_grace;
        let deadline = self.options.limits.hard + grace;
        let handle = tokio::spawn(async move {
            drain.wait_idle().await;
            // units of this session may be queued or running in another
            // process; they skip themselves while the flag is up
            let settled = tokio::time::timeout(deadline, async {
                loop {
                    match services.progress.counters(&session_id).await {
                        Ok(Some(c)) if !c.is_finished() => {}
                        Ok(_) => break,
                        Err(e) => warn!("Could not read progress of {}: {}", session_id, e),
                    }
                    tokio::time::sleep(FINALIZER_POLL).await;
                }
            })
            .await;

            if let Err(e) = services
                .sessions
                .set_status(&session_id, SessionStatus::Stopped)
                .await
            {
                warn!("Could not mark session {} stopped: {}", session_id, e);
            }
            tokio::time::sleep(grace).await;

            if settled.is_ok() {
                if let Err(e) = services.progress.clear_cancelled().await {
                    warn!("Could not clear cancellation flag: {}", e);
                }
            } else {
                // the flag expires on its own; stragglers also skip once the
                // pointer no longer names their session
                warn!(
                    "Units of session {} still unfinished after {:?}, leaving the cancellation flag up",
                    session_id, deadline
                );
            }
            match services.progress.clear_active(Some(&session_id)).await {
                Ok(true) => info!("Session {} stopped, control state idle", session_id),
                Ok(false) => debug!("Active pointer for {} already cleared", session_id),
                Err(e) => warn!("Could not clear active session {}: {}", session_id, e),
            }
        });
        *self.finalizer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Wait for the last stop request's finalizer to settle the session.
    pub async fn wait_stopped(&self) {
        let handle = self
            .finalizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Stop finalizer panicked: {}", e);
            }
        }
    }

    /// Status of `session_id`, or of the active session when `None`.
    ///
    /// Never fails: store errors yield an `unknown` status.
    pub async fn get_status(&self, session_id: Option<&str>) -> BatchStatus {
        match self.try_status(session_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Status unavailable: {}", e);
                BatchStatus::unknown(session_id.map(str::to_string))
            }
        }
    }

    async fn try_status(&self, session_id: Option<&str>) -> std::result::Result<BatchStatus, StoreError> {
        let id = match session_id {
            Some(id) => id.to_string(),
            None => match self.services.progress.active_session().await? {
                Some(active) => active.session_id,
                None => return Ok(BatchStatus::idle()),
            },
        };

        let counters = self.services.progress.counters(&id).await?;
        let session = self.services.sessions.get_session(&id).await?;
        let Some(session) = session else {
            return Ok(BatchStatus::unknown(Some(id)));
        };

        let mut status = BatchStatus {
            session_id: Some(id),
            status: session.status.to_string(),
            total: session.total,
            processed: session.processed,
            successful: session.successful,
            failed: session.failed,
            skipped: session.skipped,
            running: 0,
            rate: 0.0,
            started_at: Some(session.started_at),
        };
        // live counters are ahead of the durable row while units finish
        if let Some(c) = counters {
            if c.processed >= status.processed {
                status.processed = c.processed;
                status.successful = c.successful;
                status.failed = c.failed;
                status.skipped = c.skipped;
            }
            status.running = c.running;
        }

        let end = session.completed_at.unwrap_or_else(Utc::now);
        let minutes = (end - session.started_at).num_milliseconds() as f64 / 60_000.0;
        if minutes > 0.0 {
            status.rate = (status.processed as f64 / minutes * 100.0).round() / 100.0;
        }
        Ok(status)
    }

    /// Repair live control state from the durable session row.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let progress = &self.services.progress;
        let Some(active) = progress.active_session().await? else {
            return Ok(ReconcileOutcome::Idle);
        };
        let session_id = active.session_id.clone();

        let session = self.services.sessions.get_session(&session_id).await?;
        let durable = match session {
            Some(s) if !s.status.is_terminal() => s.status,
            other => {
                info!(
                    "Clearing stale active session {} (durable: {})",
                    session_id,
                    other
                        .map(|s| s.status.to_string())
                        .unwrap_or_else(|| "missing".into())
                );
                progress.clear_active(Some(&session_id)).await?;
                progress.clear_cancelled().await?;
                return Ok(ReconcileOutcome::Cleared { session_id });
            }
        };

        let expected = if durable == SessionStatus::Stopping {
            ControlState::Stopping
        } else {
            ControlState::Running
        };
        let needs_flag = expected == ControlState::Stopping && !progress.is_cancelled().await?;
        if active.state == expected && !needs_flag {
            return Ok(ReconcileOutcome::Consistent { session_id });
        }

        warn!(
            "Live state for {} disagrees with durable status {}, reasserting",
            session_id, durable
        );
        progress
            .set_active(&ActiveSession {
                state: expected,
                ..active
            })
            .await?;
        if expected == ControlState::Stopping {
            progress.set_cancelled(self.options.cancellation_ttl).await?;
        }
        Ok(ReconcileOutcome::Reasserted {
            session_id,
            state: expected,
        })
    }

    /// Stop the workers.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[async_trait]
impl BatchLauncher for TaskOrchestrator {
    async fn active_session(&self) -> Result<Option<ActiveSession>> {
        Ok(self.services.progress.active_session().await?)
    }

    async fn start_batch(&self, domains: Vec<String>, config: RuntimeConfig) -> Result<BatchHandle> {
        TaskOrchestrator::start_batch(self, domains, config).await
    }

    async fn reconcile(&self) -> Result<ReconcileOutcome> {
        TaskOrchestrator::reconcile(self).await
    }
}

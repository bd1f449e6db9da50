//! Cron- and interval-triggered recurring batches using tokio-cron-scheduler.
//!
//! Job definitions are persisted on every add so that a restarted process
//! re-registers them before the timer starts firing. Each fire re-reads the
//! live configuration and refuses to overlap an active session.
//!
//! ```text
//! Scheduler::start()
//!     ├─► reconcile live control state
//!     ├─► restore persisted jobs (not re-persisted)
//!     ├─► add default jobs missing from the store
//!     └─► start the timer
//!             └─► fire(job) ─► active session? skip : resolve config ─► start_batch
//! ```

mod cron;
mod job;
mod store;

pub use self::cron::{normalize_cron, to_trigger_expression};
pub use job::{FireOutcome, JobInfo, JobType, ScheduledJob, CLEANUP_JOB_ID, DEFAULT_PARTIAL_BATCH_SIZE};
pub use store::{InMemoryJobStore, JobStore};

#[cfg(feature = "redis-backend")]
pub use store::RedisJobStore;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::orchestrator::{BatchLauncher, OrchestratorError};
use crate::runtime_config::{ConfigStore, RuntimeConfig};
use crate::session::SessionStore;
use crate::store::StoreError;

/// Cron of the built-in full job.
pub const FULL_JOB_CRON: &str = "0 */6 * * *";
/// Cron of the built-in partial job.
pub const PARTIAL_JOB_CRON: &str = "0 */2 * * *";
/// Cron of the built-in cleanup job.
pub const CLEANUP_JOB_CRON: &str = "0 3 * * *";
/// Sessions finished longer ago than this are removed by the cleanup job.
pub const SESSION_RETENTION_DAYS: i64 = 7;

/// Errors from scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {0}")]
    InvalidCron(String),
    #[error("invalid interval for job {0}: must be at least one second")]
    InvalidInterval(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("timer error: {0}")]
    Timer(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("could not start batch: {0}")]
    Batch(#[from] OrchestratorError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

struct Registered {
    job: ScheduledJob,
    trigger: Option<Uuid>,
}

struct Inner {
    timer: JobScheduler,
    jobs: Mutex<HashMap<String, Registered>>,
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn BatchLauncher>,
    config: Arc<dyn ConfigStore>,
    sessions: Arc<dyn SessionStore>,
    settings: Settings,
}

/// Owns the cron triggers and their persisted definitions.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub async fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn BatchLauncher>,
        config: Arc<dyn ConfigStore>,
        sessions: Arc<dyn SessionStore>,
        settings: Settings,
    ) -> Result<Self> {
        let timer = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                timer,
                jobs: Mutex::new(HashMap::new()),
                store,
                launcher,
                config,
                sessions,
                settings,
            }),
        })
    }

    /// Restore persisted jobs, register defaults and start the timer.
    pub async fn start(&self) -> Result<()> {
        match self.inner.launcher.reconcile().await {
            Ok(outcome) => debug!("Startup reconciliation: {:?}", outcome),
            Err(e) => warn!("Startup reconciliation failed: {}", e),
        }

        let restored = self.restore().await?;
        if restored > 0 {
            info!("Restored {} scheduled jobs", restored);
        }

        if self.inner.settings.default_jobs {
            self.add_default_jobs().await;
        }

        self.inner
            .timer
            .start()
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))?;
        info!("Scheduler started");
        Ok(())
    }

    /// Re-register every persisted definition without writing it back.
    pub async fn restore(&self) -> Result<usize> {
        let persisted = self.inner.store.load_all().await?;
        let mut restored = 0;
        for job in persisted {
            let id = job.id.clone();
            match self.register(job, false).await {
                Ok(()) => restored += 1,
                Err(e) => error!("Could not restore job {}: {}", id, e),
            }
        }
        Ok(restored)
    }

    async fn add_default_jobs(&self) {
        let defaults = [
            ScheduledJob::full("full_scraping", FULL_JOB_CRON, Vec::new()),
            ScheduledJob::partial(
                "partial_scraping",
                PARTIAL_JOB_CRON,
                Vec::new(),
                DEFAULT_PARTIAL_BATCH_SIZE,
            ),
        ];
        for job in defaults {
            if self.inner.jobs.lock().await.contains_key(&job.id) {
                continue;
            }
            let id = job.id.clone();
            if let Err(e) = self.add_job(job).await {
                error!("Could not add default job {}: {}", id, e);
            }
        }
        if let Err(e) = self
            .register(ScheduledJob::cleanup(CLEANUP_JOB_CRON), false)
            .await
        {
            error!("Could not add cleanup job: {}", e);
        }
    }

    /// Register and persist a job, replacing any job with the same id.
    pub async fn add_job(&self, job: ScheduledJob) -> Result<()> {
        let persist = job.is_persistent();
        self.register(job, persist).await
    }

    async fn register(&self, mut job: ScheduledJob, persist: bool) -> Result<()> {
        match job.interval_seconds {
            Some(0) => return Err(SchedulerError::InvalidInterval(job.id)),
            Some(_) => job.cron_expression.clear(),
            None => job.cron_expression = normalize_cron(&job.cron_expression)?,
        }
        if job.job_type == JobType::Partial {
            job.batch_size = Some(
                job.batch_size
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_PARTIAL_BATCH_SIZE),
            );
        }

        let trigger = if job.paused {
            None
        } else {
            Some(self.schedule(&job).await?)
        };

        let previous = self.inner.jobs.lock().await.insert(
            job.id.clone(),
            Registered {
                job: job.clone(),
                trigger,
            },
        );
        if let Some(uuid) = previous.and_then(|p| p.trigger) {
            self.unschedule(uuid).await;
        }

        if persist {
            self.inner.store.save(&job).await?;
        }
        info!(
            "Registered {} job {} ({}{})",
            job.job_type,
            job.id,
            job.trigger_label(),
            if job.paused { ", paused" } else { "" }
        );
        Ok(())
    }

    async fn schedule(&self, job: &ScheduledJob) -> Result<Uuid> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_id = job.id.clone();
        let run = move |_uuid: Uuid, _lock: JobScheduler| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let weak = weak.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let scheduler = Scheduler { inner };
                match scheduler.fire(&job_id).await {
                    Ok(outcome) => debug!("Job {} fired: {:?}", job_id, outcome),
                    Err(e) => error!("Job {} failed: {}", job_id, e),
                }
            })
        };

        let trigger = match job.interval() {
            Some(every) => Job::new_repeated_async(every.max(Duration::from_secs(1)), run)
                .map_err(|e| SchedulerError::Timer(format!("interval job {}: {}", job.id, e)))?,
            None => {
                let expression = to_trigger_expression(&job.cron_expression)?;
                Job::new_async(expression.as_str(), run).map_err(|e| {
                    SchedulerError::InvalidCron(format!("'{}': {}", job.cron_expression, e))
                })?
            }
        };

        self.inner
            .timer
            .add(trigger)
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))
    }

    async fn unschedule(&self, uuid: Uuid) {
        if let Err(e) = self.inner.timer.remove(&uuid).await {
            warn!("Could not remove trigger {}: {}", uuid, e);
        }
    }

    /// Delete the live trigger and the persisted definition.
    pub async fn remove_job(&self, id: &str) -> Result<()> {
        let removed = self
            .inner
            .jobs
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if let Some(uuid) = removed.trigger {
            self.unschedule(uuid).await;
        }
        if removed.job.is_persistent() {
            self.inner.store.delete(id).await?;
        }
        info!("Removed job {}", id);
        Ok(())
    }

    /// Drop the live trigger but keep the definition.
    pub async fn pause_job(&self, id: &str) -> Result<()> {
        let (job, trigger) = {
            let mut jobs = self.inner.jobs.lock().await;
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            entry.job.paused = true;
            (entry.job.clone(), entry.trigger.take())
        };
        if let Some(uuid) = trigger {
            self.unschedule(uuid).await;
        }
        if job.is_persistent() {
            self.inner.store.save(&job).await?;
        }
        info!("Paused job {}", id);
        Ok(())
    }

    pub async fn resume_job(&self, id: &str) -> Result<()> {
        let mut job = self
            .inner
            .jobs
            .lock()
            .await
            .get(id)
            .map(|r| r.job.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if !job.paused {
            return Ok(());
        }
        job.paused = false;
        let persist = job.is_persistent();
        self.register(job, persist).await?;
        info!("Resumed job {}", id);
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let entries: Vec<(ScheduledJob, Option<Uuid>)> = self
            .inner
            .jobs
            .lock()
            .await
            .values()
            .map(|r| (r.job.clone(), r.trigger))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (job, trigger) in entries {
            let next_run_time = match trigger {
                Some(uuid) => {
                    let mut timer = self.inner.timer.clone();
                    timer.next_tick_for_job(uuid).await.ok().flatten()
                }
                None => None,
            };
            infos.push(JobInfo {
                domains_count: job.domains.len(),
                id: job.id,
                job_type: job.job_type,
                cron_expression: job.cron_expression,
                interval_seconds: job.interval_seconds,
                batch_size: job.batch_size,
                paused: job.paused,
                next_run_time,
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Run one fire of `id` now.
    pub async fn fire(&self, id: &str) -> Result<FireOutcome> {
        let job = self
            .inner
            .jobs
            .lock()
            .await
            .get(id)
            .map(|r| r.job.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if job.job_type == JobType::Cleanup {
            let cutoff = Utc::now() - chrono::Duration::days(SESSION_RETENTION_DAYS);
            let removed = self.inner.sessions.cleanup(cutoff).await?;
            info!("Cleanup removed {} sessions", removed);
            return Ok(FireOutcome::CleanedUp { removed });
        }

        if let Some(active) = self.inner.launcher.active_session().await? {
            info!(
                "Job {} fired while session {} is active, skipping",
                id, active.session_id
            );
            return Ok(FireOutcome::SkippedActive {
                session_id: active.session_id,
            });
        }

        let all = if job.domains.is_empty() {
            match self.inner.settings.load_domains().await {
                Ok(domains) => domains,
                Err(e) => {
                    warn!("Could not read domain list: {}", e);
                    Vec::new()
                }
            }
        } else {
            job.domains.clone()
        };
        let domains: Vec<String> = match job.job_type {
            JobType::Partial => {
                let n = job.batch_size.unwrap_or(DEFAULT_PARTIAL_BATCH_SIZE);
                all.choose_multiple(&mut rand::thread_rng(), n)
                    .cloned()
                    .collect()
            }
            _ => all,
        };
        if domains.is_empty() {
            warn!("Job {} has no domains to scrape", id);
            return Ok(FireOutcome::NoDomains);
        }

        let config = RuntimeConfig::resolve(self.inner.config.as_ref(), &self.inner.settings).await;
        match self.inner.launcher.start_batch(domains, config).await {
            Ok(handle) => {
                info!(
                    "Job {} started session {} with {} domains",
                    id, handle.session_id, handle.total
                );
                Ok(FireOutcome::Started {
                    session_id: handle.session_id,
                    total: handle.total,
                })
            }
            Err(OrchestratorError::AlreadyRunning(session_id)) => {
                info!("Job {} lost the start race to {}, skipping", id, session_id);
                Ok(FireOutcome::SkippedActive { session_id })
            }
            Err(OrchestratorError::EmptyBatch) => Ok(FireOutcome::NoDomains),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut timer = self.inner.timer.clone();
        timer
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{BatchHandle, ReconcileOutcome};
    use crate::progress::ActiveSession;
    use crate::runtime_config::InMemoryConfigStore;
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingLauncher {
        active: StdMutex<Option<ActiveSession>>,
        started: StdMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchLauncher for RecordingLauncher {
        async fn active_session(&self) -> crate::orchestrator::Result<Option<ActiveSession>> {
            Ok(self.active.lock().unwrap().clone())
        }

        async fn start_batch(
            &self,
            domains: Vec<String>,
            _config: RuntimeConfig,
        ) -> crate::orchestrator::Result<BatchHandle> {
            let total = domains.len();
            self.started.lock().unwrap().push(domains);
            Ok(BatchHandle {
                session_id: format!("s{}", self.started.lock().unwrap().len()),
                total,
                unit_ids: Vec::new(),
            })
        }

        async fn reconcile(&self) -> crate::orchestrator::Result<ReconcileOutcome> {
            Ok(ReconcileOutcome::Idle)
        }
    }

    async fn scheduler_with(
        store: Arc<dyn JobStore>,
        launcher: Arc<RecordingLauncher>,
    ) -> Scheduler {
        let settings = Settings {
            default_jobs: false,
            ..Settings::default()
        };
        Scheduler::new(
            store,
            launcher,
            Arc::new(InMemoryConfigStore::new()),
            Arc::new(InMemorySessionStore::new()),
            settings,
        )
        .await
        .unwrap()
    }

    fn domains(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("d{}.fr", i)).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_job_persists_normalized_cron() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;

        scheduler
            .add_job(ScheduledJob::full("nightly", "0 3 * *", domains(2)))
            .await
            .unwrap();

        let persisted = store.load_all().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].cron_expression, "0 3 * * *");

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs[0].id, "nightly");
        assert_eq!(jobs[0].domains_count, 2);
        assert!(jobs[0].next_run_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_rejected() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;

        let err = scheduler
            .add_job(ScheduledJob::full("bad", "0 3", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron(_)));
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interval_job_is_scheduled_and_persisted() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;

        scheduler
            .add_job(
                ScheduledJob::partial("sweep", "", domains(4), 2).every(Duration::from_secs(600)),
            )
            .await
            .unwrap();

        let persisted = store.load_all().await.unwrap();
        assert_eq!(persisted[0].interval_seconds, Some(600));
        assert_eq!(persisted[0].cron_expression, "");

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs[0].interval_seconds, Some(600));
        assert!(jobs[0].next_run_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_interval_is_rejected() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;
        let err = scheduler
            .add_job(ScheduledJob::full("busy", "", Vec::new()).every(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval(_)));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_job_defaults_batch_size() {
        let scheduler = scheduler_with(Arc::new(InMemoryJobStore::new()), Arc::default()).await;
        let mut job = ScheduledJob::partial("p", "*/5", Vec::new(), 0);
        job.batch_size = None;
        scheduler.add_job(job).await.unwrap();

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs[0].batch_size, Some(DEFAULT_PARTIAL_BATCH_SIZE));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;
        scheduler
            .add_job(ScheduledJob::full("f", "0 */6 * * *", Vec::new()))
            .await
            .unwrap();

        scheduler.remove_job("f").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(matches!(
            scheduler.remove_job("f").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_and_resume() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler_with(store.clone(), Arc::default()).await;
        scheduler
            .add_job(ScheduledJob::full("f", "0 */6 * * *", Vec::new()))
            .await
            .unwrap();

        scheduler.pause_job("f").await.unwrap();
        let jobs = scheduler.list_jobs().await;
        assert!(jobs[0].paused);
        assert!(jobs[0].next_run_time.is_none());
        assert!(store.load_all().await.unwrap()[0].paused);

        scheduler.resume_job("f").await.unwrap();
        let jobs = scheduler.list_jobs().await;
        assert!(!jobs[0].paused);
        assert!(jobs[0].next_run_time.is_some());
        assert!(!store.load_all().await.unwrap()[0].paused);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fire_skips_while_session_active() {
        let launcher = Arc::new(RecordingLauncher::default());
        *launcher.active.lock().unwrap() = Some(ActiveSession::running("busy"));
        let scheduler = scheduler_with(Arc::new(InMemoryJobStore::new()), launcher.clone()).await;
        scheduler
            .add_job(ScheduledJob::full("f", "0 */6 * * *", domains(3)))
            .await
            .unwrap();

        let outcome = scheduler.fire("f").await.unwrap();
        assert_eq!(
            outcome,
            FireOutcome::SkippedActive {
                session_id: "busy".into()
            }
        );
        assert!(launcher.started.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fire_partial_samples_distinct_domains() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = scheduler_with(Arc::new(InMemoryJobStore::new()), launcher.clone()).await;
        scheduler
            .add_job(ScheduledJob::partial("p", "0 */2 * * *", domains(10), 3))
            .await
            .unwrap();

        let outcome = scheduler.fire("p").await.unwrap();
        assert!(matches!(outcome, FireOutcome::Started { total: 3, .. }));

        let started = launcher.started.lock().unwrap();
        let mut batch = started[0].clone();
        batch.sort();
        batch.dedup();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|d| domains(10).contains(d)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fire_without_domains() {
        let scheduler = scheduler_with(Arc::new(InMemoryJobStore::new()), Arc::default()).await;
        scheduler
            .add_job(ScheduledJob::full("f", "0 */6 * * *", Vec::new()))
            .await
            .unwrap();

        assert_eq!(scheduler.fire("f").await.unwrap(), FireOutcome::NoDomains);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_default_jobs_registered_on_start() {
        let store = Arc::new(InMemoryJobStore::new());
        let settings = Settings::default();
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(RecordingLauncher::default()),
            Arc::new(InMemoryConfigStore::new()),
            Arc::new(InMemorySessionStore::new()),
            settings,
        )
        .await
        .unwrap();
        scheduler.start().await.unwrap();

        let ids: Vec<String> = scheduler.list_jobs().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["cleanup", "full_scraping", "partial_scraping"]);

        let persisted: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(persisted, vec!["full_scraping", "partial_scraping"]);

        scheduler.shutdown().await.unwrap();
    }
}

//! Bounded worker pool consuming unit tasks from a shared queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::runtime_config::RuntimeConfig;

/// One fetch-extract-deliver work item.
#[derive(Debug, Clone)]
pub struct UnitJob {
    pub id: Uuid,
    pub session_id: String,
    pub domain: String,
    pub config: Arc<RuntimeConfig>,
    /// Batch-wide cancellation, shared by every unit of the session.
    pub cancel: CancellationToken,
}

/// Executes units on behalf of the pool.
#[async_trait]
pub trait UnitRunner: Send + Sync + 'static {
    async fn run(&self, unit: &UnitJob);

    /// Called after `run` was abandoned for exceeding the hard limit.
    async fn abandoned(&self, unit: &UnitJob, limit: Duration);
}

/// Per-unit time limits.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(300),
            hard: Duration::from_secs(360),
        }
    }
}

#[derive(Default)]
struct Queue {
    jobs: Mutex<VecDeque<UnitJob>>,
    available: Notify,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Queue {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<UnitJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pop(&self) -> UnitJob {
        loop {
            let notified = self.available.notified();
            {
                let mut jobs = self.lock();
                if let Some(job) = jobs.pop_front() {
                    // counted while the queue lock is held so drain checks never see a gap
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return job;
                }
            }
            notified.await;
        }
    }

    fn is_idle(&self) -> bool {
        let jobs = self.lock();
        jobs.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    fn finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }
}

/// Handle used to wait for the pool to drain without owning it.
#[derive(Clone)]
pub struct DrainHandle {
    queue: Arc<Queue>,
}

impl DrainHandle {
    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.queue.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queue.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Fixed-size pool of workers.
pub struct WorkerPool {
    queue: Arc<Queue>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers. Must be called inside a Tokio runtime.
    pub fn start(concurrency: usize, limits: TimeLimits, runner: Arc<dyn UnitRunner>) -> Self {
        let queue = Arc::new(Queue::default());
        let shutdown = CancellationToken::new();
        let workers = (0..concurrency.max(1))
            .map(|n| {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                let runner = runner.clone();
                tokio::spawn(async move { worker_loop(n, queue, shutdown, runner, limits).await })
            })
            .collect();
        debug!("Started worker pool with {} workers", concurrency.max(1));
        Self {
            queue,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    pub fn submit(&self, job: UnitJob) {
        self.queue.lock().push_back(job);
        self.queue.available.notify_one();
    }

    /// Remove every not-yet-started unit of `session_id` from the queue.
    pub fn purge(&self, session_id: &str) -> Vec<UnitJob> {
        let purged: Vec<UnitJob> = {
            let mut jobs = self.queue.lock();
            let (purged, kept): (Vec<UnitJob>, Vec<UnitJob>) =
                jobs.drain(..).partition(|j| j.session_id == session_id);
            jobs.extend(kept);
            purged
        };
        if self.queue.is_idle() {
            self.queue.idle.notify_waiters();
        }
        purged
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight.load(Ordering::SeqCst)
    }

    pub fn drain_handle(&self) -> DrainHandle {
        DrainHandle {
            queue: self.queue.clone(),
        }
    }

    /// Stop the workers. Queued units are dropped; running ones are aborted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    error!("Worker task failed: {}", e);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    n: usize,
    queue: Arc<Queue>,
    shutdown: CancellationToken,
    runner: Arc<dyn UnitRunner>,
    limits: TimeLimits,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = queue.pop() => job,
        };
        debug!("Worker {} picked up {} ({})", n, job.domain, job.id);

        let run = runner.run(&job);
        tokio::pin!(run);
        let soft = tokio::time::sleep(limits.soft);
        tokio::pin!(soft);
        let hard = tokio::time::sleep(limits.hard);
        tokio::pin!(hard);
        let mut warned = false;

        let finished = loop {
            tokio::select! {
                _ = &mut run => break true,
                _ = &mut soft, if !warned => {
                    warned = true;
                    warn!(
                        "{} exceeded soft time limit of {}s",
                        job.domain,
                        limits.soft.as_secs()
                    );
                }
                _ = &mut hard => break false,
                _ = shutdown.cancelled() => break true,
            }
        };
        if !finished {
            error!(
                "{} exceeded hard time limit of {}s, abandoning",
                job.domain,
                limits.hard.as_secs()
            );
            runner.abandoned(&job, limits.hard).await;
        }
        queue.finish();
    }
    debug!("Worker {} stopped", n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        delay: Duration,
        ran: StdMutex<Vec<String>>,
        abandoned: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ran: StdMutex::new(Vec::new()),
                abandoned: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UnitRunner for Recorder {
        async fn run(&self, unit: &UnitJob) {
            tokio::time::sleep(self.delay).await;
            self.ran.lock().unwrap().push(unit.domain.clone());
        }

        async fn abandoned(&self, unit: &UnitJob, _limit: Duration) {
            self.abandoned.lock().unwrap().push(unit.domain.clone());
        }
    }

    fn job(session: &str, domain: &str) -> UnitJob {
        UnitJob {
            id: Uuid::new_v4(),
            session_id: session.to_string(),
            domain: domain.to_string(),
            config: Arc::new(RuntimeConfig::from_settings(&Default::default())),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_runs_every_submitted_unit() {
        let recorder = Recorder::new(Duration::from_millis(5));
        let pool = WorkerPool::start(3, TimeLimits::default(), recorder.clone());
        for i in 0..10 {
            pool.submit(job("s1", &format!("d{}.fr", i)));
        }
        pool.drain_handle().wait_idle().await;
        assert_eq!(recorder.ran.lock().unwrap().len(), 10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_purge_removes_only_that_session() {
        let recorder = Recorder::new(Duration::from_millis(50));
        let pool = WorkerPool::start(1, TimeLimits::default(), recorder.clone());
        pool.submit(job("s1", "first.fr"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.submit(job("s1", "a.fr"));
        pool.submit(job("s2", "b.fr"));
        pool.submit(job("s1", "c.fr"));

        let purged = pool.purge("s1");
        let names: Vec<_> = purged.iter().map(|j| j.domain.as_str()).collect();
        assert_eq!(names, vec!["a.fr", "c.fr"]);
        assert_eq!(pool.queued(), 1);
        assert_eq!(pool.in_flight(), 1);

        pool.drain_handle().wait_idle().await;
        assert_eq!(*recorder.ran.lock().unwrap(), vec!["first.fr", "b.fr"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_hard_limit_abandons_unit() {
        let recorder = Recorder::new(Duration::from_secs(5));
        let limits = TimeLimits {
            soft: Duration::from_millis(10),
            hard: Duration::from_millis(30),
        };
        let pool = WorkerPool::start(1, limits, recorder.clone());
        pool.submit(job("s1", "slow.fr"));
        pool.drain_handle().wait_idle().await;
        assert!(recorder.ran.lock().unwrap().is_empty());
        assert_eq!(*recorder.abandoned.lock().unwrap(), vec!["slow.fr"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_pool_returns() {
        let pool = WorkerPool::start(2, TimeLimits::default(), Recorder::new(Duration::ZERO));
        pool.drain_handle().wait_idle().await;
        pool.shutdown().await;
    }
}

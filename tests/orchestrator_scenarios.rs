//! End-to-end batch runs against in-memory stores and scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;

use harvester::config::Settings;
use harvester::delivery::{DeliveryClient, DeliveryReport, DeliverySettings};
use harvester::extraction::{ExtractionClient, ExtractionError, ExtractionSettings, Record};
use harvester::orchestrator::{
    BatchStatus, OrchestratorError, OrchestratorOptions, ReconcileOutcome, Services,
    TaskOrchestrator, TimeLimits,
};
use harvester::progress::{
    ActiveSession, ControlState, DomainResult, DomainStatus, InMemoryProgressStore,
    ProgressCounters, ProgressStore, Transition,
};
use harvester::proxy::{ProxyEndpoint, ProxyRotator};
use harvester::runtime_config::RuntimeConfig;
use harvester::scrapers::http_client::HttpRequest;
use harvester::scrapers::{
    Backoff, BrowserError, BrowserFallback, BrowserOptions, FetchError, FetchPipeline,
    FetchSource, FetchedPage, HttpReply, HttpTransport, PageContent, PageFetcher,
    TransportError,
};
use harvester::scrapers::{BrowserProxy, FetchOptions};
use harvester::session::{
    InMemorySessionStore, Outcome, Session, SessionStatus, SessionStore,
};
use harvester::store::{StoreError, StoreResult};

// --- scripted collaborators ---

/// Replies per URL in order; the last reply repeats.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<u16>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    fn script(self, url: &str, statuses: &[u16]) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), statuses.iter().copied().collect());
        self
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        *self.calls.lock().unwrap().entry(request.url.clone()).or_default() += 1;
        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(&request.url)
            .ok_or_else(|| TransportError::Connection("unscripted url".into()))?;
        let status = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            *queue.front().unwrap()
        };
        Ok(HttpReply {
            status,
            body: format!("<html><body><p>page of {}</p></body></html>", request.url),
        })
    }
}

#[derive(Default)]
struct RenderingBrowser {
    calls: AtomicUsize,
}

#[async_trait]
impl BrowserFallback for RenderingBrowser {
    async fn fetch(
        &self,
        url: &str,
        _proxy: Option<&BrowserProxy>,
        _options: &BrowserOptions,
    ) -> Result<String, BrowserError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("<html><body><p>rendered {}</p></body></html>", url))
    }
}

/// One record per page.
#[derive(Default)]
struct OneRecordExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl ExtractionClient for OneRecordExtractor {
    async fn extract(
        &self,
        _content: &PageContent,
        domain: &str,
        _settings: &ExtractionSettings,
    ) -> Result<Vec<Record>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let object = json!({"shop": domain, "description": "10% off everything"});
        Ok(Record::from_object(object.as_object().unwrap(), domain)
            .into_iter()
            .collect())
    }
}

#[derive(Default)]
struct CountingDelivery {
    delivered: AtomicUsize,
}

#[async_trait]
impl DeliveryClient for CountingDelivery {
    async fn deliver(
        &self,
        records: &[Record],
        _domain: &str,
        _session_id: &str,
        _settings: &DeliverySettings,
    ) -> DeliveryReport {
        self.delivered.fetch_add(records.len(), Ordering::SeqCst);
        DeliveryReport {
            total: records.len(),
            successful: records.len(),
            ..Default::default()
        }
    }
}

/// Holds `gated` until released; other domains return immediately.
struct GatedFetcher {
    gated: String,
    entered: Notify,
    release: Notify,
}

impl GatedFetcher {
    fn new(gated: &str) -> Self {
        Self {
            gated: gated.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl PageFetcher for GatedFetcher {
    async fn fetch(&self, domain: &str, _options: &FetchOptions) -> Result<FetchedPage, FetchError> {
        if domain == self.gated {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(FetchedPage {
            url: format!("https://{}", domain),
            html: "<html><body>ok</body></html>".into(),
            source: FetchSource::Http,
        })
    }
}

/// Outcome chosen by a hash of the domain, with a small delay.
struct MixedFetcher;

#[async_trait]
impl PageFetcher for MixedFetcher {
    async fn fetch(&self, domain: &str, _options: &FetchOptions) -> Result<FetchedPage, FetchError> {
        let n: usize = domain.bytes().map(|b| b as usize).sum();
        tokio::time::sleep(Duration::from_millis((n % 5) as u64)).await;
        if n % 3 == 0 {
            return Err(FetchError::Status { code: 404 });
        }
        Ok(FetchedPage {
            url: format!("https://{}", domain),
            html: "<html><body>ok</body></html>".into(),
            source: FetchSource::Http,
        })
    }
}

/// Session store whose backend is down.
struct DownSessionStore;

#[async_trait]
impl SessionStore for DownSessionStore {
    async fn create_session(&self, _total: u64) -> StoreResult<Session> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn get_session(&self, _id: &str) -> StoreResult<Option<Session>> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn increment(&self, _id: &str, _outcome: Outcome) -> StoreResult<Session> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn set_status(&self, _id: &str, _status: SessionStatus) -> StoreResult<Session> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn append_records(&self, _id: &str, _records: &[Record]) -> StoreResult<()> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn records(&self, _id: &str) -> StoreResult<Vec<Record>> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn list_sessions(&self, _limit: usize) -> StoreResult<Vec<Session>> {
        Err(StoreError::Unavailable("down".into()))
    }
    async fn cleanup(&self, _cutoff: DateTime<Utc>) -> StoreResult<usize> {
        Err(StoreError::Unavailable("down".into()))
    }
}

/// In-memory progress whose transitions fail a set number of times per
/// target status before going through.
#[derive(Default)]
struct FlakyProgress {
    inner: InMemoryProgressStore,
    failures: Mutex<HashMap<DomainStatus, usize>>,
    seed_fails: bool,
}

impl FlakyProgress {
    fn failing_seed(mut self) -> Self {
        self.seed_fails = true;
        self
    }

    fn failing(self, to: DomainStatus, times: usize) -> Self {
        self.failures.lock().unwrap().insert(to, times);
        self
    }
}

#[async_trait]
impl ProgressStore for FlakyProgress {
    async fn seed(&self, session_id: &str, domains: &[String]) -> StoreResult<()> {
        if self.seed_fails {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.seed(session_id, domains).await
    }
    async fn transition(
        &self,
        session_id: &str,
        domain: &str,
        to: DomainStatus,
    ) -> StoreResult<Transition> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&to) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Unavailable("connection reset".into()));
                }
            }
        }
        self.inner.transition(session_id, domain, to).await
    }
    async fn counters(&self, session_id: &str) -> StoreResult<Option<ProgressCounters>> {
        self.inner.counters(session_id).await
    }
    async fn domain_status(
        &self,
        session_id: &str,
        domain: &str,
    ) -> StoreResult<Option<DomainStatus>> {
        self.inner.domain_status(session_id, domain).await
    }
    async fn domains(&self, session_id: &str) -> StoreResult<Vec<(String, DomainStatus)>> {
        self.inner.domains(session_id).await
    }
    async fn record_result(&self, session_id: &str, result: &DomainResult) -> StoreResult<()> {
        self.inner.record_result(session_id, result).await
    }
    async fn results(&self, session_id: &str) -> StoreResult<Vec<DomainResult>> {
        self.inner.results(session_id).await
    }
    async fn set_cancelled(&self, ttl: Duration) -> StoreResult<()> {
        self.inner.set_cancelled(ttl).await
    }
    async fn clear_cancelled(&self) -> StoreResult<()> {
        self.inner.clear_cancelled().await
    }
    async fn is_cancelled(&self) -> StoreResult<bool> {
        self.inner.is_cancelled().await
    }
    async fn active_session(&self) -> StoreResult<Option<ActiveSession>> {
        self.inner.active_session().await
    }
    async fn set_active(&self, active: &ActiveSession) -> StoreResult<()> {
        self.inner.set_active(active).await
    }
    async fn claim_active(&self, active: &ActiveSession) -> StoreResult<bool> {
        self.inner.claim_active(active).await
    }
    async fn clear_active(&self, session_id: Option<&str>) -> StoreResult<bool> {
        self.inner.clear_active(session_id).await
    }
}

// --- harness ---

struct Harness {
    orchestrator: TaskOrchestrator,
    progress: Arc<InMemoryProgressStore>,
    sessions: Arc<InMemorySessionStore>,
    extractor: Arc<OneRecordExtractor>,
    delivery: Arc<CountingDelivery>,
}

fn settings() -> Settings {
    Settings {
        backoff: Backoff::fixed(2.0, Duration::ZERO, Duration::ZERO),
        stop_grace: Duration::from_millis(10),
        ..Settings::default()
    }
}

fn options(concurrency: usize) -> OrchestratorOptions {
    OrchestratorOptions {
        concurrency,
        limits: TimeLimits {
            soft: Duration::from_secs(5),
            hard: Duration::from_secs(10),
        },
        cancellation_ttl: Duration::from_secs(60),
        stop_grace: Duration::from_millis(10),
    }
}

fn harness(fetcher: Arc<dyn PageFetcher>, concurrency: usize) -> Harness {
    let progress = Arc::new(InMemoryProgressStore::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let extractor = Arc::new(OneRecordExtractor::default());
    let delivery = Arc::new(CountingDelivery::default());
    let services = Services {
        fetcher,
        extractor: extractor.clone(),
        delivery: delivery.clone(),
        progress: progress.clone(),
        sessions: sessions.clone(),
        proxies: None,
    };
    Harness {
        orchestrator: TaskOrchestrator::new(services, options(concurrency)),
        progress,
        sessions,
        extractor,
        delivery,
    }
}

fn orchestrator_over(
    progress: Arc<dyn ProgressStore>,
    sessions: Arc<dyn SessionStore>,
    fetcher: Arc<dyn PageFetcher>,
    concurrency: usize,
) -> TaskOrchestrator {
    let services = Services {
        fetcher,
        extractor: Arc::new(OneRecordExtractor::default()),
        delivery: Arc::new(CountingDelivery::default()),
        progress,
        sessions,
        proxies: None,
    };
    TaskOrchestrator::new(services, options(concurrency))
}

fn batch_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::from_settings(&settings());
    config.delivery.url = Some("https://sink.test/records".into());
    config
}

fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn wait_terminal(orchestrator: &TaskOrchestrator, session_id: &str) -> BatchStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = orchestrator.get_status(Some(session_id)).await;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch did not finish")
}

// --- scenarios ---

#[tokio::test]
async fn test_mixed_batch_counts_browser_fallback_and_exhausted_retries() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .script("https://a.com", &[200])
            .script("https://b.com", &[403])
            .script("https://c.com", &[500, 500, 500]),
    );
    let browser = Arc::new(RenderingBrowser::default());
    let pipeline = FetchPipeline::new(
        transport.clone(),
        browser.clone(),
        Arc::new(ProxyRotator::new(Vec::new())),
    );
    let h = harness(Arc::new(pipeline), 3);

    let handle = h
        .orchestrator
        .start_batch(domains(&["a.com", "b.com", "c.com"]), batch_config())
        .await
        .unwrap();
    assert_eq!(handle.total, 3);
    assert_eq!(handle.unit_ids.len(), 3);

    let status = wait_terminal(&h.orchestrator, &handle.session_id).await;
    assert_eq!(status.status, "completed");
    assert_eq!(
        (status.total, status.processed, status.successful, status.failed, status.skipped),
        (3, 3, 2, 1, 0)
    );

    assert_eq!(transport.calls("https://a.com"), 1);
    assert_eq!(transport.calls("https://b.com"), 1);
    assert_eq!(transport.calls("https://c.com"), 3);
    assert_eq!(browser.calls.load(Ordering::SeqCst), 1);

    let results = h.progress.results(&handle.session_id).await.unwrap();
    let b = results.iter().find(|r| r.domain == "b.com").unwrap();
    assert_eq!(b.fetched_via, Some(FetchSource::Browser));
    let c = results.iter().find(|r| r.domain == "c.com").unwrap();
    assert_eq!(c.status, DomainStatus::Failed);
    assert!(c.error.as_deref().unwrap().contains("500"));

    // two successful domains, one record each, appended and delivered
    let records = h.sessions.records(&handle.session_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(h.delivery.delivered.load(Ordering::SeqCst), 2);

    // natural completion frees the slot for the next batch
    assert!(h.progress.active_session().await.unwrap().is_none());
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stop_skips_queued_domains() {
    let fetcher = Arc::new(GatedFetcher::new("a.com"));
    let h = harness(fetcher.clone(), 1);

    let handle = h
        .orchestrator
        .start_batch(domains(&["a.com", "b.com", "c.com"]), batch_config())
        .await
        .unwrap();
    fetcher.entered.notified().await;
    assert_eq!(
        h.progress
            .domain_status(&handle.session_id, "c.com")
            .await
            .unwrap(),
        Some(DomainStatus::Pending)
    );

    let report = h.orchestrator.stop_batch().await.unwrap();
    assert_eq!(report.session_id, handle.session_id);
    assert_eq!(report.revoked, 3);
    assert!(h.progress.is_cancelled().await.unwrap());

    fetcher.release.notify_one();
    h.orchestrator.wait_stopped().await;

    let status = h.orchestrator.get_status(Some(&handle.session_id)).await;
    assert_eq!(status.status, "stopped");
    assert_eq!(status.processed, 3);
    assert_eq!(status.skipped, 3);

    for domain in ["a.com", "b.com", "c.com"] {
        assert_eq!(
            h.progress
                .domain_status(&handle.session_id, domain)
                .await
                .unwrap(),
            Some(DomainStatus::Skipped),
            "{}",
            domain
        );
    }
    // a.com saw the flag after its fetch and never reached extraction
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);

    assert!(h.progress.active_session().await.unwrap().is_none());
    assert!(!h.progress.is_cancelled().await.unwrap());
    h.orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_from_another_orchestrator_waits_for_remote_queue() {
    let fetcher = Arc::new(GatedFetcher::new("shop0.fr"));
    let runner = harness(fetcher.clone(), 1);
    // shares the stores but owns none of the units
    let controller = orchestrator_over(
        runner.progress.clone(),
        runner.sessions.clone(),
        Arc::new(MixedFetcher),
        1,
    );

    let names: Vec<String> = (0..40).map(|i| format!("shop{}.fr", i)).collect();
    let handle = runner
        .orchestrator
        .start_batch(names.clone(), batch_config())
        .await
        .unwrap();
    fetcher.entered.notified().await;

    let report = controller.stop_batch().await.unwrap();
    assert_eq!(report.session_id, handle.session_id);
    assert_eq!(report.revoked, 0);

    // the runner still holds 39 queued units: the stop must hold
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(runner.progress.is_cancelled().await.unwrap());
    let active = runner.progress.active_session().await.unwrap().unwrap();
    assert_eq!(active.session_id, handle.session_id);
    assert_eq!(active.state, ControlState::Stopping);
    let err = runner
        .orchestrator
        .start_batch(domains(&["other.fr"]), batch_config())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(ref id) if *id == handle.session_id));

    fetcher.release.notify_one();
    controller.wait_stopped().await;

    let session = runner
        .sessions
        .get_session(&handle.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!((session.processed, session.skipped), (40, 40));
    assert_eq!(runner.extractor.calls.load(Ordering::SeqCst), 0);
    for name in &names {
        assert_eq!(
            runner
                .progress
                .domain_status(&handle.session_id, name)
                .await
                .unwrap(),
            Some(DomainStatus::Skipped),
            "{}",
            name
        );
    }
    assert!(runner.progress.active_session().await.unwrap().is_none());
    assert!(!runner.progress.is_cancelled().await.unwrap());

    controller.shutdown().await;
    runner.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_transient_progress_failure_is_retried() {
    let progress = Arc::new(FlakyProgress::default().failing(DomainStatus::Running, 1));
    let sessions = Arc::new(InMemorySessionStore::new());
    let orchestrator = orchestrator_over(
        progress.clone(),
        sessions.clone(),
        Arc::new(GatedFetcher::new("never.fr")),
        1,
    );

    let handle = orchestrator
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap();
    let status = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(status.status, "completed");
    assert_eq!((status.processed, status.successful), (1, 1));
    assert!(progress.active_session().await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_domain_that_cannot_start_is_counted_failed() {
    let progress = Arc::new(FlakyProgress::default().failing(DomainStatus::Running, 3));
    let sessions = Arc::new(InMemorySessionStore::new());
    let orchestrator = orchestrator_over(
        progress.clone(),
        sessions.clone(),
        Arc::new(GatedFetcher::new("never.fr")),
        1,
    );

    let handle = orchestrator
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap();
    let status = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(status.status, "completed");
    assert_eq!((status.processed, status.failed), (1, 1));

    let results = progress.results(&handle.session_id).await.unwrap();
    assert!(results[0].error.as_deref().unwrap().contains("could not start"));
    assert!(progress.active_session().await.unwrap().is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unrecordable_success_falls_back_to_failed() {
    let progress = Arc::new(FlakyProgress::default().failing(DomainStatus::Completed, 3));
    let sessions = Arc::new(InMemorySessionStore::new());
    let orchestrator = orchestrator_over(
        progress.clone(),
        sessions.clone(),
        Arc::new(GatedFetcher::new("never.fr")),
        1,
    );

    let handle = orchestrator
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap();
    let status = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!((status.processed, status.successful, status.failed), (1, 0, 1));
    assert_eq!(
        progress.domain_status(&handle.session_id, "a.com").await.unwrap(),
        Some(DomainStatus::Failed)
    );
    let results = progress.results(&handle.session_id).await.unwrap();
    assert!(results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("could not record completed"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unprepared_batch_releases_the_slot() {
    let progress = Arc::new(FlakyProgress::default().failing_seed());
    let sessions = Arc::new(InMemorySessionStore::new());
    let orchestrator = orchestrator_over(
        progress.clone(),
        sessions.clone(),
        Arc::new(GatedFetcher::new("never.fr")),
        1,
    );

    let err = orchestrator
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(_)));
    assert!(progress.active_session().await.unwrap().is_none());

    let listed = sessions.list_sessions(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionStatus::Failed);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_each_batch_installs_the_current_live_proxy() {
    let pool = Arc::new(ProxyRotator::new(vec![ProxyEndpoint::new("static.proxy", 8080, 1080)]));
    let services = Services {
        fetcher: Arc::new(GatedFetcher::new("never.fr")),
        extractor: Arc::new(OneRecordExtractor::default()),
        delivery: Arc::new(CountingDelivery::default()),
        progress: Arc::new(InMemoryProgressStore::new()),
        sessions: Arc::new(InMemorySessionStore::new()),
        proxies: Some(pool.clone()),
    };
    let orchestrator = TaskOrchestrator::new(services, options(1));
    let keys = || -> Vec<String> { pool.status().into_iter().map(|s| s.key).collect() };

    for (host, expected) in [
        (Some("old.proxy"), vec!["static.proxy:8080:1080", "old.proxy:8080:1080"]),
        (Some("new.proxy"), vec!["static.proxy:8080:1080", "new.proxy:8080:1080"]),
        (None, vec!["static.proxy:8080:1080"]),
    ] {
        let mut config = batch_config();
        config.proxy = host.map(|h| ProxyEndpoint::new(h, 8080, 1080));
        let handle = orchestrator
            .start_batch(domains(&["a.com"]), config)
            .await
            .unwrap();
        assert_eq!(keys(), expected);
        wait_terminal(&orchestrator, &handle.session_id).await;
        // the finishing unit clears the pointer just after the row settles
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.get_status(None).await.status != "idle" {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_second_start_is_refused_while_active() {
    let fetcher = Arc::new(GatedFetcher::new("a.com"));
    let h = harness(fetcher.clone(), 1);

    let first = h
        .orchestrator
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap();
    fetcher.entered.notified().await;

    let err = h
        .orchestrator
        .start_batch(domains(&["b.com"]), batch_config())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(ref id) if *id == first.session_id));

    fetcher.release.notify_one();
    wait_terminal(&h.orchestrator, &first.session_id).await;

    let second = h
        .orchestrator
        .start_batch(domains(&["b.com"]), batch_config())
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &second.session_id).await;
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let h = harness(Arc::new(MixedFetcher), 1);
    let err = h
        .orchestrator
        .start_batch(domains(&[" ", ""]), batch_config())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::EmptyBatch));
    assert!(h.progress.active_session().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_stay_consistent_under_concurrency() {
    let h = harness(Arc::new(MixedFetcher), 8);
    let names: Vec<String> = (0..60).map(|i| format!("shop{}.fr", i)).collect();
    let handle = h
        .orchestrator
        .start_batch(names.clone(), batch_config())
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(c) = h.progress.counters(&handle.session_id).await.unwrap() {
                assert_eq!(c.processed, c.successful + c.failed + c.skipped);
                assert!(c.processed <= c.total);
            }
            let session = h.sessions.get_session(&handle.session_id).await.unwrap().unwrap();
            assert_eq!(
                session.processed,
                session.successful + session.failed + session.skipped
            );
            assert!(session.processed <= session.total);
            if session.status.is_terminal() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(status.processed, 60);
    let statuses = h.progress.domains(&handle.session_id).await.unwrap();
    assert_eq!(statuses.len(), 60);
    assert!(statuses.iter().all(|(_, s)| s.is_terminal()));
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_status_idle_and_unknown() {
    let h = harness(Arc::new(MixedFetcher), 1);
    assert_eq!(h.orchestrator.get_status(None).await.status, "idle");
    assert_eq!(
        h.orchestrator.get_status(Some("missing")).await.status,
        "unknown"
    );

    let services = Services {
        fetcher: Arc::new(MixedFetcher),
        extractor: Arc::new(OneRecordExtractor::default()),
        delivery: Arc::new(CountingDelivery::default()),
        progress: Arc::new(InMemoryProgressStore::new()),
        sessions: Arc::new(DownSessionStore),
        proxies: None,
    };
    let down = TaskOrchestrator::new(services, options(1));
    let status = down.get_status(Some("s1")).await;
    assert_eq!(status.status, "unknown");
    assert_eq!(status.session_id.as_deref(), Some("s1"));
    assert_eq!((status.total, status.processed), (0, 0));

    let err = down
        .start_batch(domains(&["a.com"]), batch_config())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(_)));
    down.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_outcomes() {
    let h = harness(Arc::new(MixedFetcher), 1);
    assert_eq!(h.orchestrator.reconcile().await.unwrap(), ReconcileOutcome::Idle);

    // pointer without a durable row
    h.progress
        .set_active(&ActiveSession::running("ghost"))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.reconcile().await.unwrap(),
        ReconcileOutcome::Cleared {
            session_id: "ghost".into()
        }
    );
    assert!(h.progress.active_session().await.unwrap().is_none());

    // durable row agrees
    let session = h.sessions.create_session(5).await.unwrap();
    h.progress
        .set_active(&ActiveSession::running(&session.id))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.reconcile().await.unwrap(),
        ReconcileOutcome::Consistent {
            session_id: session.id.clone()
        }
    );

    // durable row is stopping, live pointer still says running
    h.sessions
        .set_status(&session.id, SessionStatus::Stopping)
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.reconcile().await.unwrap(),
        ReconcileOutcome::Reasserted {
            session_id: session.id.clone(),
            state: ControlState::Stopping
        }
    );
    assert_eq!(
        h.progress.active_session().await.unwrap().unwrap().state,
        ControlState::Stopping
    );
    assert!(h.progress.is_cancelled().await.unwrap());

    // durable row finished while the pointer lingered
    h.sessions
        .set_status(&session.id, SessionStatus::Stopped)
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.reconcile().await.unwrap(),
        ReconcileOutcome::Cleared {
            session_id: session.id.clone()
        }
    );
    assert!(h.progress.active_session().await.unwrap().is_none());
    assert!(!h.progress.is_cancelled().await.unwrap());
}

//! Service wiring and output helpers shared by CLI commands.

use std::sync::Arc;

use anyhow::Context;
use console::style;

use harvester::config::Settings;
use harvester::delivery::WebhookDelivery;
use harvester::extraction::GeminiExtractor;
use harvester::orchestrator::{BatchStatus, OrchestratorOptions, Services, TaskOrchestrator};
use harvester::progress::ProgressStore;
use harvester::proxy::ProxyRotator;
use harvester::runtime_config::ConfigStore;
use harvester::scheduler::{JobStore, Scheduler};
use harvester::scrapers::{BrowserFetcher, FetchPipeline, PageCache, ReqwestTransport};
use harvester::session::SessionStore;

/// Stores shared by every command.
pub struct Stores {
    pub progress: Arc<dyn ProgressStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub config: Arc<dyn ConfigStore>,
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<dyn PageCache>,
}

#[cfg(feature = "redis-backend")]
pub async fn open_stores(settings: &Settings) -> anyhow::Result<Stores> {
    use harvester::progress::RedisProgressStore;
    use harvester::runtime_config::RedisConfigStore;
    use harvester::scheduler::RedisJobStore;
    use harvester::scrapers::cache::RedisPageCache;
    use harvester::session::RedisSessionStore;

    let conn = harvester::store::connect(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;

    Ok(Stores {
        progress: Arc::new(RedisProgressStore::new(conn.clone())),
        sessions: Arc::new(RedisSessionStore::new(conn.clone())),
        config: Arc::new(RedisConfigStore::new(conn.clone())),
        jobs: Arc::new(RedisJobStore::new(conn.clone())),
        cache: Arc::new(RedisPageCache::new(conn)),
    })
}

#[cfg(not(feature = "redis-backend"))]
pub async fn open_stores(_settings: &Settings) -> anyhow::Result<Stores> {
    use harvester::progress::InMemoryProgressStore;
    use harvester::runtime_config::InMemoryConfigStore;
    use harvester::scheduler::InMemoryJobStore;
    use harvester::scrapers::InMemoryPageCache;
    use harvester::session::InMemorySessionStore;

    tracing::warn!("Built without redis-backend; state lives only in this process");
    Ok(Stores {
        progress: Arc::new(InMemoryProgressStore::new()),
        sessions: Arc::new(InMemorySessionStore::new()),
        config: Arc::new(InMemoryConfigStore::new()),
        jobs: Arc::new(InMemoryJobStore::new()),
        cache: Arc::new(InMemoryPageCache::new()),
    })
}

/// Build the orchestrator and start its worker pool.
pub fn build_orchestrator(settings: &Settings, stores: &Stores) -> Arc<TaskOrchestrator> {
    let proxies = Arc::new(ProxyRotator::new(settings.proxies.clone()));
    let pipeline = FetchPipeline::new(
        Arc::new(ReqwestTransport::new()),
        Arc::new(BrowserFetcher::new()),
        proxies.clone(),
    )
    .with_cache(stores.cache.clone());

    let services = Services {
        fetcher: Arc::new(pipeline),
        extractor: Arc::new(GeminiExtractor::new()),
        delivery: Arc::new(WebhookDelivery::new()),
        progress: stores.progress.clone(),
        sessions: stores.sessions.clone(),
        proxies: Some(proxies),
    };
    Arc::new(TaskOrchestrator::new(
        services,
        OrchestratorOptions::from_settings(settings),
    ))
}

/// Build a scheduler over the persisted jobs without starting its timer.
pub async fn build_scheduler(
    settings: &Settings,
    stores: &Stores,
    orchestrator: Arc<TaskOrchestrator>,
) -> anyhow::Result<Scheduler> {
    Scheduler::new(
        stores.jobs.clone(),
        orchestrator,
        stores.config.clone(),
        stores.sessions.clone(),
        settings.clone(),
    )
    .await
    .context("Failed to create scheduler")
}

pub fn styled_status(status: &str) -> String {
    match status {
        "completed" => style(status).green().to_string(),
        "running" => style(status).cyan().to_string(),
        "stopping" | "stopped" => style(status).yellow().to_string(),
        "failed" | "unknown" => style(status).red().to_string(),
        _ => style(status).dim().to_string(),
    }
}

pub fn print_status(status: &BatchStatus) {
    println!("\n{}", style("Batch Status").bold());
    println!("{}", "-".repeat(40));
    println!(
        "{:<14} {}",
        "Session:",
        status.session_id.as_deref().unwrap_or("-")
    );
    println!("{:<14} {}", "Status:", styled_status(&status.status));
    if status.status == "idle" {
        return;
    }
    println!("{:<14} {}/{}", "Processed:", status.processed, status.total);
    println!("{:<14} {}", "Successful:", style(status.successful).green());
    println!("{:<14} {}", "Failed:", style(status.failed).red());
    println!("{:<14} {}", "Skipped:", style(status.skipped).yellow());
    println!("{:<14} {}", "Running:", status.running);
    println!("{:<14} {:.2}/min", "Rate:", status.rate);
    if let Some(started) = status.started_at {
        println!(
            "{:<14} {}",
            "Started:",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

//! Scheduled job commands and the scheduler daemon.

use std::time::Duration;

use anyhow::Context;
use console::style;

use harvester::config::Settings;
use harvester::orchestrator::BatchLauncher;
use harvester::scheduler::{JobInfo, JobType, ScheduledJob, Scheduler};

use crate::cli::helpers::{build_orchestrator, build_scheduler, open_stores, truncate};

/// Scheduler loaded with the persisted jobs; its timer is not started.
async fn offline_scheduler(settings: &Settings) -> anyhow::Result<Scheduler> {
    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);
    let scheduler = build_scheduler(settings, &stores, orchestrator).await?;
    scheduler
        .restore()
        .await
        .context("Failed to load persisted jobs")?;
    Ok(scheduler)
}

fn print_jobs(jobs: &[JobInfo]) {
    if jobs.is_empty() {
        println!("{} No scheduled jobs.", style("!").yellow());
        return;
    }
    println!(
        "\n{:<20} {:<8} {:<16} {:>6} {:>8} {:<8} {}",
        style("ID").bold(),
        style("TYPE").bold(),
        style("TRIGGER").bold(),
        style("BATCH").bold(),
        style("DOMAINS").bold(),
        style("STATE").bold(),
        style("NEXT RUN").bold()
    );
    for job in jobs {
        let state = if job.paused {
            style("paused").yellow().to_string()
        } else {
            style("active").green().to_string()
        };
        println!(
            "{:<20} {:<8} {:<16} {:>6} {:>8} {:<8} {}",
            truncate(&job.id, 20),
            job.job_type,
            match job.interval_seconds {
                Some(secs) => format!("every {}s", secs),
                None => job.cron_expression.clone(),
            },
            job.batch_size
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
            if job.domains_count == 0 {
                "all".to_string()
            } else {
                job.domains_count.to_string()
            },
            state,
            job.next_run_time
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
}

fn restart_hint() {
    println!(
        "  {}",
        style("A running daemon picks this up on its next start.").dim()
    );
}

pub async fn cmd_jobs_list(settings: &Settings) -> anyhow::Result<()> {
    let scheduler = offline_scheduler(settings).await?;
    print_jobs(&scheduler.list_jobs().await);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_jobs_add(
    settings: &Settings,
    id: String,
    cron: Option<String>,
    every: Option<u64>,
    job_type: JobType,
    batch_size: Option<usize>,
    domains: Vec<String>,
    paused: bool,
) -> anyhow::Result<()> {
    let scheduler = offline_scheduler(settings).await?;
    let cron = cron.unwrap_or_default();
    let mut job = match job_type {
        JobType::Partial => ScheduledJob::partial(id, cron, domains, batch_size.unwrap_or(0)),
        _ => ScheduledJob::full(id, cron, domains),
    };
    if let Some(secs) = every {
        job = job.every(Duration::from_secs(secs));
    }
    job.paused = paused;
    let job_id = job.id.clone();

    scheduler
        .add_job(job)
        .await
        .with_context(|| format!("Failed to add job {}", job_id))?;
    println!("{} Added job {}", style("✓").green(), style(&job_id).bold());
    restart_hint();
    print_jobs(&scheduler.list_jobs().await);
    Ok(())
}

pub async fn cmd_jobs_remove(settings: &Settings, id: &str) -> anyhow::Result<()> {
    let scheduler = offline_scheduler(settings).await?;
    scheduler
        .remove_job(id)
        .await
        .with_context(|| format!("Failed to remove job {}", id))?;
    println!("{} Removed job {}", style("✓").green(), style(id).bold());
    restart_hint();
    Ok(())
}

pub async fn cmd_jobs_pause(settings: &Settings, id: &str) -> anyhow::Result<()> {
    let scheduler = offline_scheduler(settings).await?;
    scheduler
        .pause_job(id)
        .await
        .with_context(|| format!("Failed to pause job {}", id))?;
    println!("{} Paused job {}", style("✓").green(), style(id).bold());
    restart_hint();
    Ok(())
}

pub async fn cmd_jobs_resume(settings: &Settings, id: &str) -> anyhow::Result<()> {
    let scheduler = offline_scheduler(settings).await?;
    scheduler
        .resume_job(id)
        .await
        .with_context(|| format!("Failed to resume job {}", id))?;
    println!("{} Resumed job {}", style("✓").green(), style(id).bold());
    restart_hint();
    Ok(())
}

/// Run the scheduler and the worker pool until Ctrl-C.
pub async fn cmd_daemon(settings: &Settings) -> anyhow::Result<()> {
    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);
    let scheduler = build_scheduler(settings, &stores, orchestrator.clone()).await?;
    scheduler.start().await.context("Failed to start scheduler")?;

    println!(
        "{} Scheduler running with {} workers. Press Ctrl-C to stop.",
        style("→").cyan(),
        settings.worker_concurrency
    );
    print_jobs(&scheduler.list_jobs().await);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("\n{} Shutting down", style("!").yellow());

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown failed: {}", e);
    }

    // only drain a batch whose units this process owns
    let active = orchestrator.active_session().await.ok().flatten();
    if let (Some(active), Some(local)) = (active, orchestrator.local_session()) {
        if active.session_id == local {
            match orchestrator.stop_batch().await {
                Ok(report) => {
                    println!(
                        "  Stopping session {} ({} units revoked)",
                        report.session_id, report.revoked
                    );
                    orchestrator.wait_stopped().await;
                }
                Err(e) => tracing::warn!("Could not stop session {}: {}", local, e),
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

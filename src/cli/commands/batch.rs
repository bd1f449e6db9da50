//! Batch commands: run, status, stop, reconcile.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use console::style;

use harvester::config::{parse_domain_list, Settings};
use harvester::orchestrator::{OrchestratorError, ReconcileOutcome};
use harvester::runtime_config::RuntimeConfig;

use crate::cli::helpers::{build_orchestrator, open_stores, print_status, styled_status};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Start a batch and keep this process up while its units run.
pub async fn cmd_run(
    settings: &Settings,
    mut domains: Vec<String>,
    file: Option<&Path>,
    wait: bool,
) -> anyhow::Result<()> {
    if let Some(path) = file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read domain list {}", path.display()))?;
        domains.extend(parse_domain_list(&contents));
    }
    if domains.is_empty() {
        domains = settings
            .load_domains()
            .await
            .context("Failed to read configured domain list")?;
    }
    if domains.is_empty() {
        println!(
            "{} No domains given. Pass domains, --file, or set domains_file in the config.",
            style("!").yellow()
        );
        return Ok(());
    }

    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);
    let config = RuntimeConfig::resolve(stores.config.as_ref(), settings).await;

    let handle = match orchestrator.start_batch(domains, config).await {
        Ok(handle) => handle,
        Err(OrchestratorError::AlreadyRunning(session_id)) => {
            println!(
                "{} Session {} is already running; stop it first.",
                style("!").yellow(),
                session_id
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to start batch"),
    };
    println!(
        "{} Started session {} with {} domains",
        style("→").cyan(),
        style(&handle.session_id).bold(),
        handle.total
    );

    let session_id = handle.session_id.clone();
    let status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n{} Interrupted, stopping session {}", style("!").yellow(), session_id);
                let report = orchestrator.stop_batch().await.context("Failed to stop batch")?;
                println!("  {} units revoked", report.revoked);
                orchestrator.wait_stopped().await;
                break orchestrator.get_status(Some(&session_id)).await;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let status = orchestrator.get_status(Some(&session_id)).await;
                if status.is_terminal() {
                    break status;
                }
                if wait {
                    println!(
                        "  {} {}/{} processed ({} ok, {} failed, {} skipped, {} running)",
                        styled_status(&status.status),
                        status.processed,
                        status.total,
                        status.successful,
                        status.failed,
                        status.skipped,
                        status.running
                    );
                }
            }
        }
    };

    print_status(&status);
    orchestrator.shutdown().await;
    Ok(())
}

pub async fn cmd_status(settings: &Settings, session_id: Option<&str>) -> anyhow::Result<()> {
    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);
    let status = orchestrator.get_status(session_id).await;
    print_status(&status);
    orchestrator.shutdown().await;
    Ok(())
}

pub async fn cmd_stop(settings: &Settings) -> anyhow::Result<()> {
    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);

    let report = match orchestrator.stop_batch().await {
        Ok(report) => report,
        Err(OrchestratorError::NotRunning) => {
            println!("{} No batch is running.", style("!").yellow());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to stop batch"),
    };
    println!(
        "{} Stopping session {} ({} units revoked)",
        style("→").cyan(),
        style(&report.session_id).bold(),
        report.revoked
    );
    println!(
        "  {}",
        style("Waiting for the workers running this batch to skip their queued units...").dim()
    );

    orchestrator.wait_stopped().await;
    let status = orchestrator.get_status(Some(&report.session_id)).await;
    print_status(&status);
    orchestrator.shutdown().await;
    Ok(())
}

pub async fn cmd_reconcile(settings: &Settings) -> anyhow::Result<()> {
    let stores = open_stores(settings).await?;
    let orchestrator = build_orchestrator(settings, &stores);
    let outcome = orchestrator
        .reconcile()
        .await
        .context("Reconciliation failed")?;

    match outcome {
        ReconcileOutcome::Idle => println!("{} No active session.", style("✓").green()),
        ReconcileOutcome::Consistent { session_id } => println!(
            "{} Session {} is consistent.",
            style("✓").green(),
            session_id
        ),
        ReconcileOutcome::Cleared { session_id } => println!(
            "{} Cleared stale live state of session {}.",
            style("✓").yellow(),
            session_id
        ),
        ReconcileOutcome::Reasserted { session_id, state } => println!(
            "{} Reasserted session {} as {:?}.",
            style("✓").yellow(),
            session_id,
            state
        ),
    }
    orchestrator.shutdown().await;
    Ok(())
}

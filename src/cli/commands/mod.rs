//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod batch;
mod config_cmd;
mod jobs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use harvester::config::load_settings;
use harvester::scheduler::JobType;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Batch web fetch orchestration with scheduled runs")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch over the given domains in this process
    Run {
        /// Domains to fetch
        domains: Vec<String>,
        /// Read additional domains from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Print progress every 2 seconds until the batch finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the status of a session (defaults to the active one)
    Status {
        /// Session ID
        session_id: Option<String>,
    },

    /// Stop the active batch
    Stop,

    /// Repair live control state from the durable session record
    Reconcile,

    /// Run the scheduler and worker pool until interrupted
    Daemon,

    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },

    /// Manage live configuration values
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum JobsCommands {
    /// List persisted jobs
    List,

    /// Add or replace a job
    Add {
        /// Job ID
        id: String,
        /// Cron expression (minute hour day-of-month month day-of-week)
        #[arg(required_unless_present = "every")]
        cron: Option<String>,
        /// Fire every N seconds instead of on a cron schedule
        #[arg(long, value_name = "SECONDS", conflicts_with = "cron")]
        every: Option<u64>,
        /// Job type: full or partial
        #[arg(short = 't', long = "type", default_value = "full", value_parser = parse_job_type)]
        job_type: JobType,
        /// Domains sampled per fire (partial jobs)
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Comma-separated domains (defaults to the configured domain list)
        #[arg(short, long, value_delimiter = ',')]
        domains: Vec<String>,
        /// Add the job paused
        #[arg(long)]
        paused: bool,
    },

    /// Remove a job
    Remove {
        /// Job ID
        id: String,
    },

    /// Pause a job, keeping its definition
    Pause {
        /// Job ID
        id: String,
    },

    /// Resume a paused job
    Resume {
        /// Job ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show live configuration values
    Get {
        /// Key to show (all keys when omitted)
        key: Option<String>,
    },

    /// Set a live configuration value
    Set {
        /// Key
        key: String,
        /// Value
        value: String,
    },

    /// Remove a live configuration value
    Unset {
        /// Key
        key: String,
    },
}

fn parse_job_type(s: &str) -> Result<JobType, String> {
    match JobType::from_str(s) {
        Some(JobType::Cleanup) | None => Err(format!("unknown job type '{}' (full, partial)", s)),
        Some(t) => Ok(t),
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (settings, _config) = load_settings(cli.config.as_deref()).await;

    match cli.command {
        Commands::Run {
            domains,
            file,
            wait,
        } => batch::cmd_run(&settings, domains, file.as_deref(), wait).await,
        Commands::Status { session_id } => batch::cmd_status(&settings, session_id.as_deref()).await,
        Commands::Stop => batch::cmd_stop(&settings).await,
        Commands::Reconcile => batch::cmd_reconcile(&settings).await,
        Commands::Daemon => jobs::cmd_daemon(&settings).await,
        Commands::Jobs { command } => match command {
            JobsCommands::List => jobs::cmd_jobs_list(&settings).await,
            JobsCommands::Add {
                id,
                cron,
                every,
                job_type,
                batch_size,
                domains,
                paused,
            } => {
                jobs::cmd_jobs_add(
                    &settings, id, cron, every, job_type, batch_size, domains, paused,
                )
                .await
            }
            JobsCommands::Remove { id } => jobs::cmd_jobs_remove(&settings, &id).await,
            JobsCommands::Pause { id } => jobs::cmd_jobs_pause(&settings, &id).await,
            JobsCommands::Resume { id } => jobs::cmd_jobs_resume(&settings, &id).await,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => config_cmd::cmd_config_get(&settings, key.as_deref()).await,
            ConfigCommands::Set { key, value } => {
                config_cmd::cmd_config_set(&settings, &key, &value).await
            }
            ConfigCommands::Unset { key } => config_cmd::cmd_config_unset(&settings, &key).await,
        },
    }
}

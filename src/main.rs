use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bkmon::core::{BackupJob, JobStatus, Monitor};
use bkmon::{config, context, logging};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "bkmon")]
#[command(about = "Backup orchestration monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $BKMON_CONFIG, then ./bkmon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow all backup jobs until interrupted
    Watch,
    /// Start a backup for a client and follow it to completion
    Start {
        client_id: String,
        /// Return as soon as the backend accepted the start
        #[arg(long)]
        detach: bool,
    },
    /// List active jobs, or the recent jobs of one client
    Jobs {
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check SSH connectivity to a client
    TestSsh { client_id: String },
    /// Write a config file with default values
    InitConfig {
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    push_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::InitConfig { path, force } => {
            run_init_config(path.clone(), *force).context("Failed to write config")?
        }
        Commands::Watch => run_watch(load_context(&cli)?)
            .await
            .context("Watch failed")?,
        Commands::Start { client_id, detach } => run_start(load_context(&cli)?, client_id, *detach)
            .await
            .with_context(|| format!("Backup for {} did not succeed", client_id))?,
        Commands::Jobs { client, limit } => run_jobs(load_context(&cli)?, client.as_deref(), *limit)
            .await
            .context("Failed to list jobs")?,
        Commands::TestSsh { client_id } => run_test_ssh(load_context(&cli)?, client_id)
            .await
            .context("SSH test failed")?,
    }

    Ok(())
}

fn load_context(cli: &Cli) -> Result<context::AppContext> {
    let config = match &cli.config {
        Some(path) => config::AppConfig::load(path, Some(&cli.overrides))?,
        None => config::AppConfig::new(Some(&cli.overrides))?,
    };
    logging::init(logging::LogConfig::from(&config))?;
    context::AppContext::new(config).context("Failed to create API client")
}

async fn run_watch(ctx: context::AppContext) -> Result<()> {
    let monitor = ctx.monitor();
    monitor.start().await;

    let mut ticker = tokio::time::interval(ctx.config.poll_interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => print_jobs(&monitor.registry().list().await),
        }
    }

    monitor.shutdown();
    Ok(())
}

async fn run_start(ctx: context::AppContext, client_id: &str, detach: bool) -> Result<()> {
    let monitor = ctx.monitor();
    monitor.start().await;

    let started = monitor.start_backup(client_id).await?;
    match started.job_id {
        Some(job_id) => println!("Started job {} for {}", job_id, client_id),
        None => println!("Start accepted for {}, waiting for job id", client_id),
    }
    if detach {
        monitor.shutdown();
        return Ok(());
    }

    let outcome = follow(&monitor, client_id).await;
    monitor.shutdown();

    match outcome? {
        Some(job) if job.status == JobStatus::Failed => anyhow::bail!(
            "job {} failed: {}",
            job_id_label(&job),
            job.error_message.as_deref().unwrap_or("no error message")
        ),
        Some(job) => {
            println!("Job {} finished: {}", job_id_label(&job), job.status);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Print progress until the client's in-flight guard is released. Returns
/// `None` if interrupted.
async fn follow(monitor: &Monitor, client_id: &str) -> Result<Option<BackupJob>> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_progress = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(None),
            _ = ticker.tick() => {}
        }

        let latest = monitor.registry().latest_for_client(client_id).await;
        if let Some(job) = &latest {
            if job.progress_percentage != last_progress {
                last_progress = job.progress_percentage;
                println!(
                    "  {} {:>3}%  {}",
                    job.status,
                    job.progress_percentage.unwrap_or(0),
                    job.log_details.as_deref().unwrap_or("")
                );
            }
        }

        if !monitor.initiator().is_in_flight(client_id) {
            return Ok(latest);
        }
    }
}

async fn run_jobs(
    ctx: context::AppContext,
    client_id: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let jobs = match client_id {
        Some(client_id) => {
            let limit = limit.unwrap_or(ctx.config.history_limit);
            ctx.api.client_jobs(client_id, limit).await?
        }
        None => ctx.api.active_jobs().await?,
    };
    print_jobs(&jobs);
    Ok(())
}

async fn run_test_ssh(ctx: context::AppContext, client_id: &str) -> Result<()> {
    let result = ctx.api.test_ssh(client_id).await?;
    let message = result.message.as_deref().unwrap_or("");
    if !result.success {
        anyhow::bail!("connection to {} failed: {}", client_id, message);
    }
    println!("SSH connection to {} OK {}", client_id, message);
    Ok(())
}

fn run_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::AppConfig::default().write_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn job_id_label(job: &BackupJob) -> String {
    job.id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "(pending)".to_string())
}

fn print_jobs(jobs: &[BackupJob]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    println!(
        "{:<10} {:<20} {:<10} {:>5}  {:<25} {}",
        "JOB", "CLIENT", "STATUS", "PCT", "STARTED", "ERROR"
    );
    for job in jobs {
        println!(
            "{:<10} {:<20} {:<10} {:>4}%  {:<25} {}",
            job_id_label(job),
            job.client_id,
            job.status.as_str(),
            job.progress_percentage.unwrap_or(0),
            job.started_at
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            job.error_message.as_deref().unwrap_or("")
        );
    }
}

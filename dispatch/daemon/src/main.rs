//! Dispatch Daemon
//!
//! Loads the dispatch configuration, wires one HTTP envelope adapter per
//! backend, submits a file of jobs and prints one JSON line per event on
//! stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration and print the ladder table
//! dispatch-daemon check
//!
//! # Run a job file with an explicit config
//! dispatch-daemon --config ./dispatch.toml run --jobs jobs.jsonl
//!
//! # Verbose logging
//! RUST_LOG=debug dispatch-daemon run --jobs jobs.jsonl
//! ```
//!
//! # Environment Variables
//!
//! - `DISPATCH_CONFIG`: config file path (default `$XDG_CONFIG_HOME/job-dispatch/dispatch.toml`)
//! - `DISPATCH_WORKER_POOL_SIZE`, `DISPATCH_QUEUE_MAX_SIZE`,
//!   `DISPATCH_RESOURCE_POOL_SIZE`, `DISPATCH_JOB_BUDGET_SECS`: sizing overrides
//! - `RUST_LOG`: log filter
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop submitting, cancel outstanding jobs, shut down

mod http_adapter;
mod jobs;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use dispatch_core::{
    load_config, DispatchConfig, DispatchError, Dispatcher, JobId, JobReport, JobSpec,
    MetricsSnapshot, Submission,
};

/// Dispatch Daemon - admission control and backend routing for job pipelines
#[derive(Parser, Debug)]
#[command(name = "dispatch-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "DISPATCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DISPATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every job in FILE and report each outcome as a JSON line
    Run {
        /// JSON array or JSON-lines file of job specs
        #[arg(short = 'j', long, value_name = "FILE")]
        jobs: PathBuf,
    },

    /// Validate configuration and print the escalation ladders
    Check,
}

/// One line of stdout output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OutputLine<'a> {
    Submitted(&'a Submission),
    Rejected { index: usize, error: String },
    Finished(&'a JobReport),
    Summary(&'a MetricsSnapshot),
}

fn emit(line: &OutputLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Failed to serialize output line"),
    }
}

/// Initialize logging on stderr with the specified default level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "dispatch_daemon={level},dispatch_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Dispatch daemon starting");

    let config = load_config(args.config.clone()).context("Failed to load configuration")?;

    match args.command {
        Command::Check => {
            check(&config)?;
            Ok(())
        }
        Command::Run { jobs } => run(config, &jobs).await,
    }
}

/// Print backends and ladders of a validated config
fn check(config: &DispatchConfig) -> Result<()> {
    let table = config.ladder_table()?;

    println!(
        "workers={} queue_max={} resources={} job_budget={}s",
        config.worker_pool_size,
        config.queue_max_size,
        config.resource_pool_size,
        config.job_budget.as_secs()
    );
    for backend in &config.backends {
        println!(
            "backend {} provider={} tier={} unit_price={} limit={}/{}s threshold={} cooldown={}s",
            backend.id,
            backend.provider,
            backend.tier,
            backend.unit_price,
            backend.rate_limit.limit,
            backend.rate_limit.window.as_secs(),
            backend.breaker.failure_threshold,
            backend.breaker.cooldown.as_secs(),
        );
    }
    for ladder in table.sorted() {
        println!(
            "ladder {}/{}: {}",
            ladder.task_kind,
            ladder.complexity,
            ladder.backends().join(" -> ")
        );
    }
    info!(ladders = table.len(), "Configuration is valid");
    Ok(())
}

async fn run(config: DispatchConfig, jobs_path: &Path) -> Result<()> {
    let specs = jobs::load_jobs(jobs_path).await?;
    let adapters = http_adapter::adapters_for(&config)?;
    let dispatcher = Arc::new(Dispatcher::new(config, adapters)?);
    let mut reports = dispatcher.start().await?;

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler(Arc::clone(&shutdown));

    let mut pending: VecDeque<(usize, JobSpec)> = specs.into_iter().enumerate().collect();
    let mut outstanding: HashSet<JobId> = HashSet::new();
    let mut interrupted = false;

    loop {
        // Submit until the queue pushes back
        while let Some((index, spec)) = pending.front() {
            match dispatcher.submit(spec.clone()) {
                Ok(submission) => {
                    if !submission.duplicate {
                        outstanding.insert(submission.job_id.clone());
                    }
                    emit(&OutputLine::Submitted(&submission));
                    pending.pop_front();
                }
                Err(DispatchError::QueueFull { .. }) => break,
                Err(e) => {
                    emit(&OutputLine::Rejected {
                        index: *index,
                        error: e.to_string(),
                    });
                    pending.pop_front();
                }
            }
        }

        if pending.is_empty() && outstanding.is_empty() {
            break;
        }

        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { break };
                outstanding.remove(&report.job_id);
                emit(&OutputLine::Finished(&report));
            }
            () = shutdown.notified() => {
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        warn!(
            outstanding = outstanding.len(),
            unsubmitted = pending.len(),
            "Interrupted, cancelling outstanding jobs"
        );
        for id in &outstanding {
            dispatcher.cancel(id);
        }
    }

    dispatcher.shutdown().await?;

    // Workers are gone; whatever they reported is already buffered
    while let Ok(report) = reports.try_recv() {
        emit(&OutputLine::Finished(&report));
    }

    let metrics = dispatcher.metrics();
    emit(&OutputLine::Summary(&metrics));
    info!(
        succeeded = metrics.succeeded,
        failed = metrics.failed,
        cancelled = metrics.cancelled,
        "Dispatch daemon stopped"
    );
    Ok(())
}

fn spawn_signal_handler(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }
        shutdown.notify_one();
    });
}

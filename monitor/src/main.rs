//! Hivewatch Monitor - agent workspace activity monitor.
//!
//! This binary watches the configured sources and writes every notification
//! (file changes, commits, poll errors, source lifecycle) to stdout as one
//! JSON object per line. Logs go to stderr.
//!
//! # Commands
//!
//! - `hivewatch-monitor run`: Start monitoring the configured sources
//! - `hivewatch-monitor sources`: Show the configured sources
//!
//! # Environment Variables
//!
//! See the [`config`](hivewatch_monitor::config) module for available
//! configuration options.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hivewatch_monitor::config::Config;
use hivewatch_monitor::types::{CommitEvent, ErrorEvent, FileChangeEvent, WatchedSource};
use hivewatch_monitor::Monitor;

/// Default interval between snapshot log lines.
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;

/// Hivewatch Monitor - agent workspace activity monitor.
///
/// Watches working directories for file changes and new commits and streams
/// them as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "hivewatch-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    HIVEWATCH_SOURCES                  Comma-separated id=path entries
    HIVEWATCH_SOURCES_FILE             JSON source list (default: ~/.hivewatch/sources.json)
    HIVEWATCH_POLL_INTERVAL_MS         Filesystem poll interval (default: 5000)
    HIVEWATCH_COMMIT_POLL_INTERVAL_MS  Commit poll interval (default: 5000)
    HIVEWATCH_MAX_BACKOFF_SECS         Backoff cap after failures (default: 60)
    HIVEWATCH_COMMAND_TIMEOUT_SECS     git command timeout (default: 10)
    HIVEWATCH_BOOTSTRAP_COMMITS        Commits read on first poll (default: 20)
    HIVEWATCH_MAX_COMMIT_BATCH         Commits read per later poll (default: 200)
    HIVEWATCH_BUFFER_SIZE              Activity stream capacity (default: 100)
    HIVEWATCH_FRESHNESS_SECS           Active-source window (default: 300)
    HIVEWATCH_IGNORE                   Extra comma-separated ignore entries
    HIVEWATCH_GIT_BIN                  git binary (default: git)

EXAMPLES:
    # Watch two agent workspaces
    export HIVEWATCH_SOURCES=alpha=/work/alpha,beta=/work/beta
    hivewatch-monitor run

    # Structured logs, snapshot every 10 seconds
    hivewatch-monitor run --json-logs --snapshot-interval 10
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start monitoring the configured sources.
    ///
    /// Notifications are written to stdout as JSON lines.
    Run {
        /// Emit logs as JSON instead of human-readable text.
        #[arg(long)]
        json_logs: bool,

        /// Seconds between activity snapshot log lines.
        #[arg(long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL_SECS,
              value_parser = clap::value_parser!(u64).range(1..))]
        snapshot_interval: u64,
    },

    /// Show the configured sources and whether their roots exist.
    Sources,
}

/// One line of the notification stream.
#[derive(Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum Notification<'a> {
    FileChange(&'a FileChangeEvent),
    Commit(&'a CommitEvent),
    Error(&'a ErrorEvent),
    SourceAdded(&'a WatchedSource),
    SourceRemoved(&'a WatchedSource),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sources => run_sources(),
        Command::Run {
            json_logs,
            snapshot_interval,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_monitor(json_logs, Duration::from_secs(snapshot_interval)))
        }
    }
}

/// Prints the configured sources.
fn run_sources() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    if config.sources.is_empty() {
        eprintln!("No sources configured.");
        eprintln!("Set HIVEWATCH_SOURCES or HIVEWATCH_SOURCES_FILE.");
        return Ok(());
    }

    for spec in &config.sources {
        let status = if spec.root_path.is_dir() {
            "ok"
        } else {
            "missing"
        };
        println!(
            "{}\t{}\t{}\t{}",
            spec.id,
            spec.display_name(),
            spec.root_path.display(),
            status
        );
    }

    Ok(())
}

async fn run_monitor(json_logs: bool, snapshot_interval: Duration) -> Result<()> {
    init_logging(json_logs);

    info!("Starting Hivewatch Monitor");

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        sources = config.sources.len(),
        poll_interval_ms = config.monitor.poll_interval.as_millis() as u64,
        commit_poll_interval_ms = config.monitor.commit_poll_interval.as_millis() as u64,
        buffer_size = config.monitor.buffer_size,
        git_bin = %config.monitor.git_bin,
        "Configuration loaded"
    );

    let monitor = Monitor::new(config.monitor.clone());
    let lines = subscribe_lines(&monitor);
    let writer = tokio::spawn(forward_lines(lines, tokio::io::stdout()));

    for spec in &config.sources {
        if let Err(e) = monitor.add_source(&spec.id, &spec.root_path, Some(spec.display_name())) {
            warn!(
                source_id = %spec.id,
                root = %spec.root_path.display(),
                error = %e,
                "Skipping source"
            );
        }
    }

    if monitor.list_sources().is_empty() {
        warn!("No sources registered. Set HIVEWATCH_SOURCES or HIVEWATCH_SOURCES_FILE.");
    }

    info!("Monitor running. Press Ctrl+C to stop.");

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(snapshot_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => log_snapshot(&monitor),
        }
    }

    info!("Shutting down...");
    monitor.shutdown().await;
    log_snapshot(&monitor);

    // Dropping the monitor drops the senders, which lets the writer drain.
    drop(monitor);
    match writer.await {
        Ok(Ok(())) => debug!("Notification writer finished"),
        Ok(Err(e)) => warn!(error = %e, "Notification writer failed"),
        Err(e) => warn!(error = %e, "Notification writer task failed"),
    }

    Ok(())
}

/// Subscribes to every notification, serializing each to a JSON line.
///
/// Callbacks only enqueue, so a slow stdout never holds up delivery.
fn subscribe_lines(monitor: &Monitor) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    let sink = tx.clone();
    monitor.on_source_added(move |s| enqueue(&sink, &Notification::SourceAdded(s)));
    let sink = tx.clone();
    monitor.on_source_removed(move |s| enqueue(&sink, &Notification::SourceRemoved(s)));
    let sink = tx.clone();
    monitor.on_file_change(move |e| enqueue(&sink, &Notification::FileChange(e)));
    let sink = tx.clone();
    monitor.on_commit(move |e| enqueue(&sink, &Notification::Commit(e)));
    monitor.on_error(move |e| enqueue(&tx, &Notification::Error(e)));

    rx
}

fn enqueue(sink: &mpsc::UnboundedSender<String>, notification: &Notification<'_>) -> Result<()> {
    let line = serde_json::to_string(notification).context("Failed to serialize notification")?;
    sink.send(line)
        .map_err(|_| anyhow::anyhow!("Notification writer has stopped"))
}

/// Writes queued lines to `out` until every sender is gone.
async fn forward_lines<W>(mut lines: mpsc::UnboundedReceiver<String>, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        out.write_all(line.as_bytes())
            .await
            .context("Failed to write notification")?;
        out.write_all(b"\n")
            .await
            .context("Failed to write notification")?;
        out.flush().await.context("Failed to flush stdout")?;
    }
    Ok(())
}

fn log_snapshot(monitor: &Monitor) {
    let snapshot = monitor.snapshot();
    info!(
        total_sources = snapshot.total_sources,
        active_sources = snapshot.active_sources,
        total_commits = snapshot.total_commits,
        total_files_touched = snapshot.total_files_touched,
        recent = snapshot.recent_activity.len(),
        "Activity snapshot"
    );
}

/// Initializes the logging subsystem. Logs go to stderr so stdout carries
/// only notifications.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

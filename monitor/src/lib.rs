//! Hivewatch Monitor - activity monitoring core for agent workspaces.
//!
//! This crate watches a set of working directories ("sources") that coding
//! agents operate in and turns what happens inside them into structured
//! events.
//!
//! # Overview
//!
//! For every registered source the [`Monitor`] runs two independent poll
//! loops: a filesystem detector that reports added, modified and removed
//! files, and a commit ingester that reads new commits from the repository.
//! Events feed per-source counters, a bounded most-recent-first activity
//! stream, and any number of subscriber callbacks.
//!
//! ```no_run
//! use hivewatch_monitor::{Monitor, MonitorConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let monitor = Monitor::new(MonitorConfig::default());
//! monitor.on_commit(|commit| {
//!     println!("{} committed {}", commit.author, commit.commit_hash);
//!     Ok(())
//! });
//! monitor.add_source("alpha", "/work/alpha", Some("Alpha agent"))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Event and metrics types shared by every component
//! - [`monitor`]: The coordinator and its per-source poll loops
//! - [`registry`]: Registered sources and their cancellation handles
//! - [`watcher`]: Snapshot-based filesystem change detection
//! - [`git`]: Commit source abstraction, `git log` parsing, ingestion
//! - [`metrics`]: Per-source counters
//! - [`stream`]: Bounded activity feed
//! - [`broadcast`]: Subscriber fan-out with failure isolation
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations
//! - [`utils`]: Shared utilities (backoff)

pub mod broadcast;
pub mod config;
pub mod error;
pub mod git;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod stream;
pub mod types;
pub mod utils;
pub mod watcher;

pub use broadcast::SubscriptionId;
pub use config::{Config, MonitorConfig, SourceSpec};
pub use error::{MonitorError, PollError, RegistryError, Result};
pub use git::{CommitIngester, CommitQueryError, CommitSource, GitCli, ParseError};
pub use monitor::Monitor;
pub use stream::ActivityStream;
pub use types::{
    ActivityRecord, CommitEvent, CommitRecord, ErrorEvent, FileChangeEvent, FileChangeKind,
    PollErrorKind, SourceMetrics, SystemSnapshot, WatchedSource,
};
pub use utils::Backoff;
pub use watcher::{ChangeDetector, DetectorError, IgnoreList};

//! The monitoring coordinator.
//!
//! A [`Monitor`] owns the source registry, the metrics aggregator, the
//! activity stream and the subscriber topics. Registering a source spawns two
//! tokio tasks for it: a filesystem detector loop and a commit ingester loop.
//! Each loop runs one tick to completion, hands the results to the monitor,
//! then sleeps for its base interval (or its backoff delay after failures).
//!
//! # Delivery
//!
//! Every accepted event goes to the aggregator, then the stream, then the
//! subscribers, in the order it was observed. Deliveries are serialized
//! against `add_source`/`remove_source`, and each one re-checks that the
//! source is still registered under the token its loop was started with.
//! Once `remove_source` returns, no further events for that source reach
//! anyone, including results of polls that were already in flight.
//!
//! Subscriber callbacks run while deliveries are serialized, so they may
//! read from the monitor but must not call `add_source` or `remove_source`.
//! They also run on the polling task's thread with that lock held: a slow
//! callback delays every source's delivery and occupies a runtime worker.
//! Callbacks that do I/O should hand the event to a channel and return.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, SubscriptionId};
use crate::config::MonitorConfig;
use crate::error::{PollError, RegistryError};
use crate::git::{CommitIngester, CommitSource, GitCli};
use crate::metrics::MetricsAggregator;
use crate::registry::{self, SourceEntry, SourceRegistry};
use crate::stream::ActivityStream;
use crate::types::{
    ActivityRecord, CommitEvent, CommitRecord, ErrorEvent, FileChangeEvent, SourceMetrics,
    SystemSnapshot, WatchedSource,
};
use crate::utils::Backoff;
use crate::watcher::{ChangeDetector, IgnoreList};

/// How long [`Monitor::shutdown`] waits for each loop before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running monitor. Clones share the same state.
///
/// Dropping the last handle stops every poll loop.
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

struct Shared {
    config: MonitorConfig,
    ignore: Arc<IgnoreList>,
    ingester: CommitIngester,
    state: Mutex<State>,
    delivery: Mutex<()>,
    broadcaster: Broadcaster,
}

struct State {
    registry: SourceRegistry,
    metrics: MetricsAggregator,
    stream: ActivityStream,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("sources", &self.list_sources())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor that reads commits with the configured `git` binary.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let git = Arc::new(GitCli::new(config.git_bin.clone()));
        Self::with_commit_source(config, git)
    }

    /// Creates a monitor with a custom commit source.
    #[must_use]
    pub fn with_commit_source(config: MonitorConfig, commits: Arc<dyn CommitSource>) -> Self {
        let shared = Shared {
            ignore: Arc::new(IgnoreList::new(&config.ignore)),
            ingester: CommitIngester::new(commits, &config),
            state: Mutex::new(State {
                registry: SourceRegistry::new(),
                metrics: MetricsAggregator::new(),
                stream: ActivityStream::with_capacity(config.buffer_size),
            }),
            delivery: Mutex::new(()),
            broadcaster: Broadcaster::new(),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    /// Registers a source and starts watching it.
    ///
    /// The display name defaults to the id.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidSourceId`] if `id` is blank
    /// - [`RegistryError::PathNotFound`] if `root_path` is not a readable directory
    /// - [`RegistryError::SourceAlreadyRegistered`] if `id` is taken
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn add_source(
        &self,
        id: &str,
        root_path: impl AsRef<Path>,
        display_name: Option<&str>,
    ) -> Result<WatchedSource, RegistryError> {
        registry::validate_id(id)?;
        let root = registry::validate_root(root_path.as_ref())?;

        let shared = &self.shared;
        let _delivery = shared.lock_delivery();

        let source = WatchedSource::new(
            id.to_string(),
            display_name.unwrap_or(id).to_string(),
            root.clone(),
        );
        let (entry, cancelled) = SourceEntry::new(source.clone());
        let token = entry.token;

        {
            let mut guard = shared.lock_state();
            let state = &mut *guard;
            let entry = state.registry.insert(entry)?;
            state.metrics.register(id);

            let weak = Arc::downgrade(shared);
            let config = &shared.config;

            let detector = ChangeDetector::new(id, root.clone(), Arc::clone(&shared.ignore));
            entry.attach(tokio::spawn(detector_loop(
                weak.clone(),
                id.to_string(),
                token,
                detector,
                cancelled.clone(),
                Backoff::new(config.poll_interval, config.max_backoff),
            )));
            entry.attach(tokio::spawn(ingester_loop(
                weak,
                id.to_string(),
                token,
                shared.ingester.clone(),
                root,
                cancelled,
                Backoff::new(config.commit_poll_interval, config.max_backoff),
            )));
        }

        info!(
            source_id = %source.id,
            root = %source.root_path.display(),
            "Source added"
        );
        shared.broadcaster.source_added.publish(&source);

        Ok(source)
    }

    /// Unregisters a source and stops its loops.
    ///
    /// Loops are cancelled without waiting for in-flight polls; their results
    /// are discarded. The source's metrics are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotRegistered`] if `id` is unknown.
    pub fn remove_source(&self, id: &str) -> Result<WatchedSource, RegistryError> {
        let shared = &self.shared;
        let _delivery = shared.lock_delivery();

        let mut entry = {
            let mut state = shared.lock_state();
            let entry = state.registry.remove(id)?;
            state.metrics.unregister(id);
            entry
        };
        entry.abort();

        info!(source_id = %id, "Source removed");
        shared.broadcaster.source_removed.publish(&entry.source);

        Ok(entry.source)
    }

    /// Registered source ids in registration order.
    #[must_use]
    pub fn list_sources(&self) -> Vec<String> {
        self.shared.lock_state().registry.ids()
    }

    #[must_use]
    pub fn source(&self, id: &str) -> Option<WatchedSource> {
        self.shared
            .lock_state()
            .registry
            .get(id)
            .map(|e| e.source.clone())
    }

    /// All registered sources in registration order.
    #[must_use]
    pub fn sources(&self) -> Vec<WatchedSource> {
        self.shared.lock_state().registry.sources()
    }

    /// Current counters for one source.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotRegistered`] if `id` is unknown.
    pub fn get_metrics(&self, id: &str) -> Result<SourceMetrics, RegistryError> {
        self.shared
            .lock_state()
            .metrics
            .metrics(id)
            .ok_or_else(|| RegistryError::SourceNotRegistered(id.to_string()))
    }

    /// Counters for every source in registration order.
    #[must_use]
    pub fn get_all_metrics(&self) -> Vec<SourceMetrics> {
        self.shared.lock_state().metrics.all_metrics()
    }

    /// Up to `limit` activity records, most recent first.
    #[must_use]
    pub fn get_recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.shared.lock_state().stream.recent(limit)
    }

    /// System-wide totals plus the most recent activity.
    #[must_use]
    pub fn snapshot(&self) -> SystemSnapshot {
        let config = &self.shared.config;
        let state = self.shared.lock_state();

        SystemSnapshot {
            total_sources: state.registry.len(),
            active_sources: state
                .metrics
                .active_count(Utc::now(), config.freshness_window),
            total_commits: state.metrics.total_commits(),
            total_files_touched: state.metrics.total_files_touched(),
            recent_activity: state.stream.recent(config.snapshot_recent),
        }
    }

    pub fn on_file_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FileChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        broadcaster.subscribe(&broadcaster.file_changes, callback)
    }

    pub fn on_commit<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CommitEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        broadcaster.subscribe(&broadcaster.commits, callback)
    }

    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        broadcaster.subscribe(&broadcaster.errors, callback)
    }

    pub fn on_source_added<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&WatchedSource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        broadcaster.subscribe(&broadcaster.source_added, callback)
    }

    pub fn on_source_removed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&WatchedSource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let broadcaster = &self.shared.broadcaster;
        broadcaster.subscribe(&broadcaster.source_removed, callback)
    }

    /// Cancels a subscription. Returns `false` if it was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.broadcaster.unsubscribe(id)
    }

    /// Stops every poll loop and waits for them to exit.
    ///
    /// Sources stay registered but are no longer polled, and no
    /// `source_removed` notifications are sent. Loops still running after
    /// [`SHUTDOWN_GRACE`] are aborted.
    pub async fn shutdown(&self) {
        let tasks = self.shared.cancel_all();
        debug!(tasks = tasks.len(), "Waiting for poll loops to stop");

        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Poll loop did not stop in time, aborting");
                abort.abort();
            }
        }

        info!("Monitor stopped");
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let _delivery = self.lock_delivery();
        self.lock_state().registry.cancel_all()
    }

    /// Records a finished tick. Returns `false` if the registration is gone.
    fn touch(&self, source_id: &str, token: Uuid) -> bool {
        let mut state = self.lock_state();
        match state.registry.current_mut(source_id, token) {
            Some(entry) => {
                entry.source.last_poll_at = Some(Utc::now());
                true
            }
            None => {
                trace!(source_id, "Discarding result for removed source");
                false
            }
        }
    }

    fn last_seen(&self, source_id: &str, token: Uuid) -> Option<Option<String>> {
        let mut state = self.lock_state();
        state
            .registry
            .current_mut(source_id, token)
            .map(|e| e.source.last_seen_commit_hash.clone())
    }

    fn set_last_seen(&self, source_id: &str, token: Uuid, hash: String) {
        let mut state = self.lock_state();
        if let Some(entry) = state.registry.current_mut(source_id, token) {
            entry.source.last_seen_commit_hash = Some(hash);
        }
    }

    fn deliver_file_changes(
        &self,
        source_id: &str,
        token: Uuid,
        events: Vec<FileChangeEvent>,
    ) -> bool {
        let _delivery = self.lock_delivery();
        if !self.touch(source_id, token) {
            return false;
        }
        if !events.is_empty() {
            debug!(source_id, count = events.len(), "File changes detected");
        }

        for event in events {
            {
                let mut state = self.lock_state();
                state.metrics.record_file_change(&event);
                state.stream.push(ActivityRecord::from(event.clone()));
            }
            self.broadcaster.file_changes.publish(&event);
        }
        true
    }

    /// Delivers a batch oldest-first, then advances the source's last seen
    /// commit to the newest one.
    fn deliver_commits(&self, source_id: &str, token: Uuid, records: Vec<CommitRecord>) -> bool {
        let _delivery = self.lock_delivery();
        if !self.touch(source_id, token) {
            return false;
        }
        let Some(newest) = records.last().map(|r| r.hash.clone()) else {
            return true;
        };

        info!(source_id, count = records.len(), newest = %newest, "New commits ingested");

        for record in records {
            let event = record.into_event(source_id);
            {
                let mut state = self.lock_state();
                state.metrics.record_commit(&event);
                state.stream.push(ActivityRecord::from(event.clone()));
            }
            self.broadcaster.commits.publish(&event);
        }

        self.set_last_seen(source_id, token, newest);
        true
    }

    fn deliver_error(&self, source_id: &str, token: Uuid, error: &PollError) -> bool {
        let _delivery = self.lock_delivery();
        if !self.touch(source_id, token) {
            return false;
        }

        if let PollError::Parse {
            skip_to: Some(head),
            ..
        } = error
        {
            warn!(source_id, head = %head, "Skipping unparseable commits");
            self.set_last_seen(source_id, token, head.clone());
        }

        let event = ErrorEvent {
            source_id: source_id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            occurred_at: Utc::now(),
        };
        self.broadcaster.errors.publish(&event);
        true
    }
}

async fn detector_loop(
    shared: Weak<Shared>,
    source_id: String,
    token: Uuid,
    mut detector: ChangeDetector,
    mut cancelled: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    debug!(source_id = %source_id, root = %detector.root().display(), "Detector loop started");

    loop {
        let result = tokio::select! {
            _ = cancelled.changed() => break,
            result = detector.poll() => result,
        };

        let Some(monitor) = shared.upgrade() else {
            break;
        };
        let accepted = match result {
            Ok(events) => {
                backoff.record_success();
                trace!(
                    source_id = %source_id,
                    tracked = detector.tracked_file_count(),
                    "Filesystem poll finished"
                );
                monitor.deliver_file_changes(&source_id, token, events)
            }
            Err(e) => {
                backoff.record_failure();
                let error = PollError::from(e);
                warn!(
                    source_id = %source_id,
                    error = %error,
                    failures = backoff.failures(),
                    retry_in_ms = backoff.current().as_millis() as u64,
                    "Filesystem poll failed"
                );
                monitor.deliver_error(&source_id, token, &error)
            }
        };
        drop(monitor);

        if !accepted {
            break;
        }

        tokio::select! {
            _ = cancelled.changed() => break,
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    debug!(source_id = %source_id, "Detector loop stopped");
}

async fn ingester_loop(
    shared: Weak<Shared>,
    source_id: String,
    token: Uuid,
    ingester: CommitIngester,
    root: PathBuf,
    mut cancelled: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    debug!(source_id = %source_id, "Ingester loop started");

    loop {
        let Some(last_seen) = shared
            .upgrade()
            .and_then(|monitor| monitor.last_seen(&source_id, token))
        else {
            break;
        };

        let result = tokio::select! {
            _ = cancelled.changed() => break,
            result = ingester.poll(&root, last_seen.as_deref()) => result,
        };

        let Some(monitor) = shared.upgrade() else {
            break;
        };
        let accepted = match result {
            Ok(records) => {
                backoff.record_success();
                monitor.deliver_commits(&source_id, token, records)
            }
            Err(error) => {
                if error.is_transient() {
                    backoff.record_failure();
                }
                warn!(
                    source_id = %source_id,
                    error = %error,
                    failures = backoff.failures(),
                    "Commit poll failed"
                );
                monitor.deliver_error(&source_id, token, &error)
            }
        };
        drop(monitor);

        if !accepted {
            break;
        }

        tokio::select! {
            _ = cancelled.changed() => break,
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    debug!(source_id = %source_id, "Ingester loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::git::CommitQueryError;

    /// A repository that never has commits.
    struct NoCommits;

    impl CommitSource for NoCommits {
        fn list_commits_since<'a>(
            &'a self,
            _root: &'a Path,
            _since: Option<&'a str>,
            _skip: usize,
            _limit: usize,
        ) -> BoxFuture<'a, Result<Vec<CommitRecord>, CommitQueryError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn head<'a>(
            &'a self,
            _root: &'a Path,
        ) -> BoxFuture<'a, Result<Option<String>, CommitQueryError>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn monitor() -> Monitor {
        let config = MonitorConfig {
            poll_interval: Duration::from_secs(3600),
            commit_poll_interval: Duration::from_secs(3600),
            ..MonitorConfig::default()
        };
        Monitor::with_commit_source(config, Arc::new(NoCommits))
    }

    #[tokio::test]
    async fn test_add_source_validates_input() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();

        assert_eq!(
            monitor.add_source(" ", dir.path(), None).unwrap_err(),
            RegistryError::InvalidSourceId
        );
        assert_eq!(
            monitor.add_source("beta", "/does/not/exist", None).unwrap_err(),
            RegistryError::PathNotFound(PathBuf::from("/does/not/exist"))
        );
        assert!(monitor.list_sources().is_empty());
    }

    #[tokio::test]
    async fn test_add_source_defaults_and_order() {
        let monitor = monitor();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        let beta = monitor.add_source("beta", b.path(), Some("Beta Project")).unwrap();
        let alpha = monitor.add_source("alpha", a.path(), None).unwrap();

        assert_eq!(beta.display_name, "Beta Project");
        assert_eq!(alpha.display_name, "alpha");
        assert_eq!(alpha.root_path, std::fs::canonicalize(a.path()).unwrap());
        assert_eq!(monitor.list_sources(), vec!["beta", "alpha"]);
        assert_eq!(
            monitor.add_source("alpha", a.path(), None).unwrap_err(),
            RegistryError::SourceAlreadyRegistered("alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_metrics_follow_registration() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();

        assert_eq!(
            monitor.get_metrics("alpha").unwrap_err(),
            RegistryError::SourceNotRegistered("alpha".to_string())
        );

        monitor.add_source("alpha", dir.path(), None).unwrap();
        assert_eq!(monitor.get_metrics("alpha").unwrap().total_commits, 0);
        assert_eq!(monitor.get_all_metrics().len(), 1);

        monitor.remove_source("alpha").unwrap();
        assert!(monitor.get_metrics("alpha").is_err());
        assert_eq!(
            monitor.remove_source("alpha").unwrap_err(),
            RegistryError::SourceNotRegistered("alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_lifecycle_notifications() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let added = Arc::clone(&log);
        monitor.on_source_added(move |s: &WatchedSource| {
            added.lock().unwrap().push(format!("added:{}", s.id));
            Ok(())
        });
        let removed = Arc::clone(&log);
        monitor.on_source_removed(move |s: &WatchedSource| {
            removed.lock().unwrap().push(format!("removed:{}", s.id));
            Ok(())
        });

        monitor.add_source("alpha", dir.path(), None).unwrap();
        monitor.remove_source("alpha").unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["added:alpha", "removed:alpha"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let id = monitor.on_source_added(move |_: &WatchedSource| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        monitor.add_source("alpha", dir.path(), None).unwrap();
        assert!(monitor.unsubscribe(id));
        monitor.add_source("beta", dir.path(), None).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_of_idle_monitor() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();
        monitor.add_source("alpha", dir.path(), None).unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_sources, 1);
        assert_eq!(snapshot.active_sources, 0);
        assert_eq!(snapshot.total_commits, 0);
        assert!(snapshot.recent_activity.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_sources_listed() {
        let monitor = monitor();
        let dir = TempDir::new().unwrap();
        monitor.add_source("alpha", dir.path(), None).unwrap();

        tokio::time::timeout(Duration::from_secs(10), monitor.shutdown())
            .await
            .unwrap();

        assert_eq!(monitor.list_sources(), vec!["alpha"]);
    }
}

//! Per-source activity counters.
//!
//! Every event updates its source's counters in O(1). Counters exist only
//! while a source is registered; re-registering an id starts from zero.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{CommitEvent, FileChangeEvent, SourceMetrics};

#[derive(Debug)]
struct SourceCounters {
    metrics: SourceMetrics,
    touched: HashSet<String>,
}

impl SourceCounters {
    fn new(source_id: &str) -> Self {
        Self {
            metrics: SourceMetrics::empty(source_id),
            touched: HashSet::new(),
        }
    }

    /// `last_activity_at` only moves forward.
    fn advance(&mut self, at: DateTime<Utc>) {
        if self.metrics.last_activity_at.is_none_or(|last| at > last) {
            self.metrics.last_activity_at = Some(at);
        }
    }
}

/// Counters for every registered source, kept in registration order.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    order: Vec<String>,
    sources: HashMap<String, SourceCounters>,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts fresh counters for `source_id`, discarding any previous ones.
    pub fn register(&mut self, source_id: &str) {
        if self
            .sources
            .insert(source_id.to_string(), SourceCounters::new(source_id))
            .is_none()
        {
            self.order.push(source_id.to_string());
        }
    }

    /// Drops the counters for `source_id`, returning their final values.
    pub fn unregister(&mut self, source_id: &str) -> Option<SourceMetrics> {
        let counters = self.sources.remove(source_id)?;
        self.order.retain(|id| id != source_id);
        Some(counters.metrics)
    }

    /// Counts a file change. Returns `false` if the source is not registered.
    pub fn record_file_change(&mut self, event: &FileChangeEvent) -> bool {
        let Some(counters) = self.sources.get_mut(&event.source_id) else {
            return false;
        };

        if counters.touched.insert(event.relative_path.clone()) {
            counters.metrics.total_files_touched = counters.touched.len() as u64;
        }
        counters.advance(event.observed_at);
        true
    }

    /// Counts a commit. Returns `false` if the source is not registered.
    ///
    /// Commits are not deduplicated by hash: a commit ingested twice (after a
    /// history re-bootstrap) is counted twice.
    pub fn record_commit(&mut self, event: &CommitEvent) -> bool {
        let Some(counters) = self.sources.get_mut(&event.source_id) else {
            return false;
        };

        let metrics = &mut counters.metrics;
        metrics.total_commits += 1;
        metrics.lines_added += event.lines_added.unwrap_or(0);
        metrics.lines_removed += event.lines_removed.unwrap_or(0);
        counters.advance(event.committed_at);
        true
    }

    #[must_use]
    pub fn metrics(&self, source_id: &str) -> Option<SourceMetrics> {
        self.sources.get(source_id).map(|c| c.metrics.clone())
    }

    /// Metrics for all sources in registration order.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<SourceMetrics> {
        self.order
            .iter()
            .filter_map(|id| self.metrics(id))
            .collect()
    }

    #[must_use]
    pub fn total_commits(&self) -> u64 {
        self.sources.values().map(|c| c.metrics.total_commits).sum()
    }

    #[must_use]
    pub fn total_files_touched(&self) -> u64 {
        self.sources
            .values()
            .map(|c| c.metrics.total_files_touched)
            .sum()
    }

    /// Number of sources whose last activity is within `window` of `now`.
    #[must_use]
    pub fn active_count(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.sources
            .values()
            .filter(|c| c.metrics.last_activity_at.is_some_and(|at| at >= cutoff))
            .count()
    }
}

//! Bounded activity feed.
//!
//! Records are stored in arrival order and evicted FIFO, whatever their kind
//! or timestamp, so a freshly ingested commit with an old commit date still
//! shows up. Reads order by timestamp, most recent first; records with equal
//! timestamps come out newest arrival first, so one source's batch is never
//! shuffled.

use std::collections::VecDeque;

use tracing::trace;

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::types::ActivityRecord;

/// Fixed-capacity buffer of recent activity.
#[derive(Debug, Clone)]
pub struct ActivityStream {
    records: VecDeque<ActivityRecord>,
    capacity: usize,
}

impl Default for ActivityStream {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl ActivityStream {
    /// Creates an empty stream. A capacity of 0 is treated as 1.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a record, returning the earliest arrival if it had to be
    /// evicted to make room.
    pub fn push(&mut self, record: ActivityRecord) -> Option<ActivityRecord> {
        self.records.push_back(record);

        if self.records.len() > self.capacity {
            let evicted = self.records.pop_front();
            if let Some(evicted) = &evicted {
                trace!(
                    source_id = %evicted.source_id(),
                    timestamp = %evicted.timestamp(),
                    "Evicted earliest activity record"
                );
            }
            return evicted;
        }
        None
    }

    /// Up to `limit` records, most recent first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        let mut newest_first: Vec<&ActivityRecord> = self.records.iter().rev().collect();
        newest_first.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        newest_first.into_iter().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitEvent, FileChangeEvent, FileChangeKind};
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::PathBuf;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn file(path: &str, observed_at: DateTime<Utc>) -> ActivityRecord {
        FileChangeEvent {
            kind: FileChangeKind::Modified,
            source_id: "alpha".to_string(),
            absolute_path: PathBuf::from("/work/alpha").join(path),
            relative_path: path.to_string(),
            observed_at,
        }
        .into()
    }

    fn commit(hash: &str, committed_at: DateTime<Utc>) -> ActivityRecord {
        CommitEvent {
            source_id: "beta".to_string(),
            commit_hash: hash.to_string(),
            author: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            committed_at,
            message: "Work".to_string(),
            changed_files: Vec::new(),
            lines_added: None,
            lines_removed: None,
        }
        .into()
    }

    fn paths(records: &[ActivityRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| match r {
                ActivityRecord::FileChange(e) => e.relative_path.clone(),
                ActivityRecord::Commit(e) => e.commit_hash.clone(),
            })
            .collect()
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut stream = ActivityStream::with_capacity(3);
        for i in 0..10 {
            stream.push(file(&format!("f{i}"), at(i)));
            assert!(stream.len() <= 3);
        }
        assert_eq!(paths(&stream.recent(10)), vec!["f9", "f8", "f7"]);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut stream = ActivityStream::with_capacity(2);
        assert!(stream.push(file("a", at(0))).is_none());
        assert!(stream.push(file("b", at(1))).is_none());

        let evicted = stream.push(file("c", at(2))).unwrap();
        assert_eq!(paths(&[evicted]), vec!["a"]);
    }

    #[test]
    fn test_recent_is_most_recent_first_across_kinds() {
        let mut stream = ActivityStream::default();
        stream.push(file("a", at(10)));
        // A commit made earlier than the file change arrives later.
        stream.push(commit("c1", at(5)));
        stream.push(file("b", at(20)));

        let recent = stream.recent(10);
        assert_eq!(paths(&recent), vec!["b", "a", "c1"]);
        assert!(recent
            .windows(2)
            .all(|w| w[0].timestamp() >= w[1].timestamp()));
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut stream = ActivityStream::default();
        stream.push(file("first", at(1)));
        stream.push(file("second", at(1)));
        stream.push(file("third", at(1)));

        assert_eq!(paths(&stream.recent(3)), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_late_old_record_is_kept_and_evicts_earliest_arrival() {
        let mut stream = ActivityStream::with_capacity(2);
        stream.push(file("a", at(10)));
        stream.push(file("b", at(20)));

        // A commit dated before everything in the full buffer.
        let evicted = stream.push(commit("old", at(1))).unwrap();
        assert_eq!(paths(&[evicted]), vec!["a"]);
        assert_eq!(paths(&stream.recent(2)), vec!["b", "old"]);

        let evicted = stream.push(file("c", at(30))).unwrap();
        assert_eq!(paths(&[evicted]), vec!["b"]);
        assert_eq!(paths(&stream.recent(2)), vec!["c", "old"]);
    }

    #[test]
    fn test_recent_limit() {
        let mut stream = ActivityStream::default();
        assert!(stream.recent(5).is_empty());

        stream.push(file("a", at(0)));
        stream.push(file("b", at(1)));
        assert_eq!(stream.recent(1).len(), 1);
        assert!(stream.recent(0).is_empty());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let stream = ActivityStream::with_capacity(0);
        assert_eq!(stream.capacity(), 1);
        assert!(stream.is_empty());
    }
}

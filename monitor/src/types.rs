//! Domain types for Hivewatch activity monitoring.
//!
//! This module defines the event schema shared by the detectors, the metrics
//! aggregator, the activity stream, and any transport that republishes them.
//! All types serialize to camelCase JSON so they can be forwarded verbatim.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored working directory.
///
/// Owned by the registry; consumers only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedSource {
    /// Unique source identifier.
    pub id: String,

    /// Human-readable name shown by consumers.
    pub display_name: String,

    /// Canonical root directory being watched.
    pub root_path: PathBuf,

    /// When the source was registered.
    pub added_at: DateTime<Utc>,

    /// When either poll loop last ran a tick for this source.
    pub last_poll_at: Option<DateTime<Utc>>,

    /// Newest commit already emitted for this source.
    pub last_seen_commit_hash: Option<String>,
}

impl WatchedSource {
    /// Creates a freshly registered source with no poll history.
    #[must_use]
    pub fn new(id: String, display_name: String, root_path: PathBuf) -> Self {
        Self {
            id,
            display_name,
            root_path,
            added_at: Utc::now(),
            last_poll_at: None,
            last_seen_commit_hash: None,
        }
    }
}

/// Kind of filesystem change observed between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Modified,
    Removed,
}

/// A single file change detected by the filesystem poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    pub source_id: String,
    pub absolute_path: PathBuf,

    /// Path relative to the source root, always `/`-separated.
    pub relative_path: String,

    pub observed_at: DateTime<Utc>,
}

/// A commit as reported by the version-control system, before it is bound
/// to a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
    pub changed_files: Vec<String>,
    pub lines_added: Option<u64>,
    pub lines_removed: Option<u64>,
}

impl CommitRecord {
    /// Binds this record to a source, producing the event emitted downstream.
    #[must_use]
    pub fn into_event(self, source_id: &str) -> CommitEvent {
        CommitEvent {
            source_id: source_id.to_string(),
            commit_hash: self.hash,
            author: self.author,
            author_email: self.author_email,
            committed_at: self.committed_at,
            message: self.message,
            changed_files: self.changed_files,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
        }
    }
}

/// A new commit ingested for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub source_id: String,
    pub commit_hash: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
    pub changed_files: Vec<String>,

    /// Best-effort line counts; `None` when the VCS output carried none.
    pub lines_added: Option<u64>,
    pub lines_removed: Option<u64>,
}

/// Entry of the merged activity stream.
///
/// Uses serde's internally tagged representation, like the wire payloads
/// consumers already understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityRecord {
    FileChange(FileChangeEvent),
    Commit(CommitEvent),
}

impl ActivityRecord {
    /// The event's own time: `observed_at` for file changes, `committed_at`
    /// for commits.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::FileChange(event) => event.observed_at,
            Self::Commit(event) => event.committed_at,
        }
    }

    #[must_use]
    pub fn source_id(&self) -> &str {
        match self {
            Self::FileChange(event) => &event.source_id,
            Self::Commit(event) => &event.source_id,
        }
    }
}

impl From<FileChangeEvent> for ActivityRecord {
    fn from(event: FileChangeEvent) -> Self {
        Self::FileChange(event)
    }
}

impl From<CommitEvent> for ActivityRecord {
    fn from(event: CommitEvent) -> Self {
        Self::Commit(event)
    }
}

/// Derived per-source counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetrics {
    pub source_id: String,

    /// Number of distinct relative paths seen in file change events.
    pub total_files_touched: u64,

    pub total_commits: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl SourceMetrics {
    /// Zeroed counters for a newly registered source.
    #[must_use]
    pub fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            total_files_touched: 0,
            total_commits: 0,
            lines_added: 0,
            lines_removed: 0,
            last_activity_at: None,
        }
    }
}

/// System-wide view computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub total_sources: usize,

    /// Sources whose last activity falls inside the freshness window.
    pub active_sources: usize,

    pub total_commits: u64,
    pub total_files_touched: u64,

    /// Most-recent-first.
    pub recent_activity: Vec<ActivityRecord>,
}

/// Classification of a failed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollErrorKind {
    DetectorIo,
    IngesterCommand,
    Parse,
}

/// Error notification emitted when a poll cycle fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub source_id: String,
    pub kind: PollErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_commit() -> CommitRecord {
        CommitRecord {
            hash: "abc123".to_string(),
            author: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            committed_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            message: "Initial commit".to_string(),
            changed_files: vec!["README.md".to_string()],
            lines_added: Some(3),
            lines_removed: Some(0),
        }
    }

    #[test]
    fn file_change_kind_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&FileChangeKind::Added).unwrap(),
            "\"added\""
        );
        assert_eq!(
            serde_json::to_string(&FileChangeKind::Modified).unwrap(),
            "\"modified\""
        );
        assert_eq!(
            serde_json::to_string(&FileChangeKind::Removed).unwrap(),
            "\"removed\""
        );
    }

    #[test]
    fn commit_record_binds_to_source() {
        let event = sample_commit().into_event("alpha");
        assert_eq!(event.source_id, "alpha");
        assert_eq!(event.commit_hash, "abc123");
        assert_eq!(event.lines_added, Some(3));
    }

    #[test]
    fn activity_record_is_internally_tagged() {
        let record = ActivityRecord::from(sample_commit().into_event("alpha"));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "commit");
        assert_eq!(json["sourceId"], "alpha");
        assert_eq!(json["commitHash"], "abc123");
        assert_eq!(json["authorEmail"], "ada@example.com");
        assert!(json.get("source_id").is_none());
    }

    #[test]
    fn activity_record_timestamp_uses_event_time() {
        let commit = sample_commit().into_event("alpha");
        let committed_at = commit.committed_at;
        assert_eq!(ActivityRecord::Commit(commit).timestamp(), committed_at);

        let observed_at = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
        let change = FileChangeEvent {
            kind: FileChangeKind::Modified,
            source_id: "beta".to_string(),
            absolute_path: PathBuf::from("/tmp/beta/src/lib.rs"),
            relative_path: "src/lib.rs".to_string(),
            observed_at,
        };
        let record = ActivityRecord::FileChange(change);
        assert_eq!(record.timestamp(), observed_at);
        assert_eq!(record.source_id(), "beta");
    }

    #[test]
    fn error_event_serializes_kind() {
        let event = ErrorEvent {
            source_id: "alpha".to_string(),
            kind: PollErrorKind::IngesterCommand,
            message: "not a git repository".to_string(),
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "ingester_command");
        assert_eq!(json["sourceId"], "alpha");
    }

    #[test]
    fn watched_source_starts_without_poll_history() {
        let source = WatchedSource::new(
            "alpha".to_string(),
            "Alpha".to_string(),
            PathBuf::from("/work/alpha"),
        );
        assert!(source.last_poll_at.is_none());
        assert!(source.last_seen_commit_hash.is_none());
    }

    #[test]
    fn activity_record_roundtrip() {
        let original = ActivityRecord::Commit(sample_commit().into_event("alpha"));
        let json = serde_json::to_string(&original).unwrap();
        let decoded: ActivityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }
}

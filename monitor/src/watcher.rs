//! Filesystem change detector for watched sources.
//!
//! Each tick scans a source's directory tree into a snapshot of
//! `relative path -> (mtime, size)` and diffs it against the snapshot of the
//! previous tick:
//!
//! - a path present only in the new snapshot is [`FileChangeKind::Added`]
//! - a path whose mtime or size changed is [`FileChangeKind::Modified`]
//! - a path present only in the old snapshot is [`FileChangeKind::Removed`]
//!
//! Any number of writes to one path between two ticks collapse into a single
//! `Modified` event. The first tick diffs against an empty snapshot, so every
//! file already in the tree is reported as `Added`.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use hivewatch_monitor::watcher::{ChangeDetector, IgnoreList};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ignore = Arc::new(IgnoreList::new([".git", "target"]));
//!     let mut detector = ChangeDetector::new("alpha", PathBuf::from("/work/alpha"), ignore);
//!
//!     for event in detector.poll().await? {
//!         println!("{:?} {}", event.kind, event.relative_path);
//!     }
//!
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{FileChangeEvent, FileChangeKind};

/// Errors that can occur during a filesystem scan.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// The source root could not be listed.
    #[error("source root {root} is unavailable: {source}")]
    RootUnavailable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The blocking scan task did not complete.
    #[error("scan task failed: {0}")]
    ScanTask(String),
}

/// Result type for detector operations.
pub type Result<T> = std::result::Result<T, DetectorError>;

/// The part of a file's metadata that decides whether it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Scan result keyed by `/`-separated relative path.
pub type Snapshot = BTreeMap<String, FileState>;

/// Names and suffixes excluded from scans.
///
/// An entry matches any path component with exactly that name. Entries of the
/// form `*.ext` match file names ending in `.ext`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    names: HashSet<String>,
    suffixes: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix('*') {
                Some(suffix) if !suffix.is_empty() => list.suffixes.push(suffix.to_string()),
                _ => {
                    list.names.insert(entry.to_string());
                }
            }
        }
        list
    }

    /// Whether a directory entry with this name is skipped.
    #[must_use]
    pub fn is_ignored(&self, name: &str, is_dir: bool) -> bool {
        if self.names.contains(name) {
            return true;
        }
        !is_dir && self.suffixes.iter().any(|suffix| name.ends_with(suffix))
    }
}

/// Poll-based change detector for one source.
#[derive(Debug)]
pub struct ChangeDetector {
    source_id: String,
    root: PathBuf,
    ignore: Arc<IgnoreList>,
    snapshot: Snapshot,
}

impl ChangeDetector {
    /// Creates a detector with an empty baseline snapshot.
    pub fn new(source_id: impl Into<String>, root: PathBuf, ignore: Arc<IgnoreList>) -> Self {
        Self {
            source_id: source_id.into(),
            root,
            ignore,
            snapshot: Snapshot::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files in the last successful snapshot.
    #[must_use]
    pub fn tracked_file_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Runs one scan on the blocking pool and returns the changes since the
    /// previous successful scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be listed. The previous snapshot
    /// is kept, so a root that comes back does not replay its whole tree.
    pub async fn poll(&mut self) -> Result<Vec<FileChangeEvent>> {
        let root = self.root.clone();
        let ignore = Arc::clone(&self.ignore);

        let current = tokio::task::spawn_blocking(move || scan_tree(&root, &ignore))
            .await
            .map_err(|e| DetectorError::ScanTask(e.to_string()))??;

        let events = diff_snapshots(
            &self.source_id,
            &self.root,
            &self.snapshot,
            &current,
            Utc::now(),
        );

        debug!(
            source_id = %self.source_id,
            files = current.len(),
            changes = events.len(),
            "Filesystem scan complete"
        );

        self.snapshot = current;
        Ok(events)
    }
}

/// Scans a directory tree into a snapshot, skipping ignored entries.
///
/// # Errors
///
/// Fails only if the root itself cannot be listed. Unreadable subdirectories
/// and entries that vanish mid-scan are skipped.
pub fn scan_tree(root: &Path, ignore: &IgnoreList) -> Result<Snapshot> {
    let entries = fs::read_dir(root).map_err(|source| DetectorError::RootUnavailable {
        root: root.to_path_buf(),
        source,
    })?;

    let mut snapshot = Snapshot::new();
    scan_entries(root, entries, ignore, &mut snapshot);
    Ok(snapshot)
}

fn scan_directory_recursive(root: &Path, dir: &Path, ignore: &IgnoreList, snapshot: &mut Snapshot) {
    match fs::read_dir(dir) {
        Ok(entries) => scan_entries(root, entries, ignore, snapshot),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read directory, skipping");
        }
    }
}

fn scan_entries(root: &Path, entries: fs::ReadDir, ignore: &IgnoreList, snapshot: &mut Snapshot) {
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Entry vanished during scan");
                continue;
            }
        };

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if ignore.is_ignored(&name, file_type.is_dir()) {
            trace!(path = %path.display(), "Ignoring entry");
            continue;
        }

        if file_type.is_dir() {
            scan_directory_recursive(root, &path, ignore, snapshot);
            continue;
        }

        let Some(relative) = relative_path(root, &path) else {
            continue;
        };

        match entry.metadata() {
            Ok(meta) => {
                snapshot.insert(
                    relative,
                    FileState {
                        modified: meta.modified().ok(),
                        size: meta.len(),
                    },
                );
            }
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Failed to read metadata");
            }
        }
    }
}

/// `/`-separated path of `path` below `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Diffs two snapshots into change events ordered by relative path.
#[must_use]
pub fn diff_snapshots(
    source_id: &str,
    root: &Path,
    previous: &Snapshot,
    current: &Snapshot,
    observed_at: DateTime<Utc>,
) -> Vec<FileChangeEvent> {
    let mut changes: Vec<(&str, FileChangeKind)> = Vec::new();

    for (path, state) in current {
        match previous.get(path) {
            None => changes.push((path.as_str(), FileChangeKind::Added)),
            Some(old) if old != state => {
                changes.push((path.as_str(), FileChangeKind::Modified));
            }
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.push((path.as_str(), FileChangeKind::Removed));
        }
    }

    changes.sort_by(|a, b| a.0.cmp(b.0));

    changes
        .into_iter()
        .map(|(relative, kind)| FileChangeEvent {
            kind,
            source_id: source_id.to_string(),
            absolute_path: root.join(relative),
            relative_path: relative.to_string(),
            observed_at,
        })
        .collect()
}

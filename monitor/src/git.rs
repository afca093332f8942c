//! Commit ingestion for watched sources.
//!
//! The version-control system sits behind the narrow [`CommitSource`] trait so
//! the ingester, the aggregator, and the stream never see process handling or
//! output formats. [`GitCli`] implements it by running `git log`; tests swap in
//! scripted sources.
//!
//! # Output format
//!
//! `git log` is asked for one record per commit using control characters that
//! cannot appear in hashes, names, or dates:
//!
//! ```text
//! \x1e<hash>\x1f<author>\x1f<email>\x1f<committer date, ISO 8601>\x1f<raw body>\x1d
//! <added>\t<removed>\t<path>      (one --numstat line per changed file)
//! ```
//!
//! The body ends at `\x1d`, so multi-line commit messages cannot be mistaken
//! for numstat lines or for the next record.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::config::MonitorConfig;
use crate::error::PollError;
use crate::types::CommitRecord;

/// Separates commit records.
pub const RECORD_SEP: char = '\x1e';

/// Separates header fields within a record.
pub const FIELD_SEP: char = '\x1f';

/// Terminates the commit message.
pub const MESSAGE_END: char = '\x1d';

/// `--format` string producing the layout described in the module docs.
pub const LOG_FORMAT: &str = "%x1e%H%x1f%an%x1f%ae%x1f%cI%x1f%B%x1d";

/// Number of `\x1f`-separated header fields.
const HEADER_FIELDS: usize = 5;

/// Errors that can occur while parsing commit-log output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Output did not start with a record separator.
    #[error("unexpected output before the first commit record")]
    LeadingGarbage,

    /// A record had fewer header fields than expected.
    #[error("record {record}: expected 5 header fields, found {found}")]
    MissingFields { record: usize, found: usize },

    /// A record's message was never terminated.
    #[error("record {record}: missing message terminator")]
    Unterminated { record: usize },

    /// The hash field is not a hexadecimal object id.
    #[error("record {record}: invalid commit hash '{hash}'")]
    InvalidHash { record: usize, hash: String },

    /// The date field is not RFC 3339.
    #[error("record {record}: invalid commit date '{value}'")]
    InvalidTimestamp { record: usize, value: String },
}

/// Errors that can occur while querying commits.
#[derive(Error, Debug)]
pub enum CommitQueryError {
    /// The VCS binary could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The VCS command exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The `since` revision no longer exists in the repository history.
    #[error("revision {0} is not in the repository history")]
    UnknownRevision(String),

    /// The query did not finish within the configured timeout.
    #[error("commit query timed out after {0:?}")]
    Timeout(Duration),

    /// The command succeeded but its output was malformed.
    #[error("malformed commit log: {0}")]
    Parse(#[from] ParseError),
}

/// Narrow seam over a version-control system.
pub trait CommitSource: Send + Sync {
    /// Lists commits newer than `since` (or the latest ones when `since` is
    /// `None`), newest first, skipping the `skip` newest and returning at most
    /// `limit`.
    fn list_commits_since<'a>(
        &'a self,
        root: &'a Path,
        since: Option<&'a str>,
        skip: usize,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CommitRecord>, CommitQueryError>>;

    /// Current head commit, `None` for a repository without commits.
    fn head<'a>(&'a self, root: &'a Path) -> BoxFuture<'a, Result<Option<String>, CommitQueryError>>;
}

/// [`CommitSource`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs the binary in `root`. The child is killed if the returned future
    /// is dropped, which is how timeouts and cancellation stop it.
    async fn run(&self, root: &Path, args: &[String]) -> Result<RawOutput, CommitQueryError> {
        trace!(program = %self.program, ?args, root = %root.display(), "Running VCS command");

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommitQueryError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(RawOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn failed(&self, raw: RawOutput) -> CommitQueryError {
        CommitQueryError::CommandFailed {
            program: self.program.clone(),
            status: raw.status,
            stderr: raw.stderr,
        }
    }
}

struct RawOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl CommitSource for GitCli {
    fn list_commits_since<'a>(
        &'a self,
        root: &'a Path,
        since: Option<&'a str>,
        skip: usize,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CommitRecord>, CommitQueryError>> {
        Box::pin(async move {
            if since.is_none() && self.head(root).await?.is_none() {
                debug!(root = %root.display(), "Repository has no commits yet");
                return Ok(Vec::new());
            }

            let raw = self.run(root, &log_args(since, skip, limit)).await?;

            if !raw.success {
                if is_empty_repository(&raw.stderr) {
                    debug!(root = %root.display(), "Repository has no commits yet");
                    return Ok(Vec::new());
                }
                if let Some(rev) = since.filter(|_| is_unknown_revision(&raw.stderr)) {
                    return Err(CommitQueryError::UnknownRevision(rev.to_string()));
                }
                return Err(self.failed(raw));
            }

            Ok(parse_log_output(&raw.stdout)?)
        })
    }

    fn head<'a>(&'a self, root: &'a Path) -> BoxFuture<'a, Result<Option<String>, CommitQueryError>> {
        Box::pin(async move {
            let args = ["rev-parse", "--verify", "--quiet", "HEAD"].map(String::from);
            let raw = self.run(root, &args).await?;

            if !raw.success {
                // --quiet leaves stderr empty when HEAD is unborn.
                if raw.stderr.is_empty() {
                    return Ok(None);
                }
                return Err(self.failed(raw));
            }

            let head = raw.stdout.trim();
            Ok((!head.is_empty()).then(|| head.to_string()))
        })
    }
}

/// Arguments for the commit-log query.
#[must_use]
pub fn log_args(since: Option<&str>, skip: usize, limit: usize) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        "core.quotePath=false".to_string(),
        "log".to_string(),
        "--no-color".to_string(),
        "--no-renames".to_string(),
        "--numstat".to_string(),
        format!("--max-count={limit}"),
        format!("--format={LOG_FORMAT}"),
    ];
    if skip > 0 {
        args.push(format!("--skip={skip}"));
    }
    match since {
        Some(rev) => args.push(format!("{rev}..HEAD")),
        None => args.push("HEAD".to_string()),
    }
    args.push("--".to_string());
    args
}

fn is_empty_repository(stderr: &str) -> bool {
    stderr.contains("does not have any commits yet")
}

fn is_unknown_revision(stderr: &str) -> bool {
    ["bad revision", "unknown revision", "Invalid revision range", "bad object"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// Parses `git log` output produced with [`LOG_FORMAT`] and `--numstat`.
///
/// Records are returned in output order (newest first for `git log`).
///
/// # Errors
///
/// Returns the first [`ParseError`] encountered; no partial batch is returned.
pub fn parse_log_output(output: &str) -> Result<Vec<CommitRecord>, ParseError> {
    let mut chunks = output.split(RECORD_SEP);

    if chunks.next().is_some_and(|leading| !leading.trim().is_empty()) {
        return Err(ParseError::LeadingGarbage);
    }

    chunks
        .enumerate()
        .map(|(record, chunk)| parse_record(record, chunk))
        .collect()
}

fn parse_record(record: usize, chunk: &str) -> Result<CommitRecord, ParseError> {
    let (header, stats) = chunk
        .split_once(MESSAGE_END)
        .ok_or(ParseError::Unterminated { record })?;

    let fields: Vec<&str> = header.splitn(HEADER_FIELDS, FIELD_SEP).collect();
    if fields.len() != HEADER_FIELDS {
        return Err(ParseError::MissingFields {
            record,
            found: fields.len(),
        });
    }

    let hash = fields[0].trim();
    if hash.len() < 7 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidHash {
            record,
            hash: hash.to_string(),
        });
    }

    let date = fields[3].trim();
    let committed_at = DateTime::parse_from_rfc3339(date)
        .map_err(|_| ParseError::InvalidTimestamp {
            record,
            value: date.to_string(),
        })?
        .with_timezone(&Utc);

    let numstat = parse_numstat(stats);

    Ok(CommitRecord {
        hash: hash.to_string(),
        author: fields[1].trim().to_string(),
        author_email: fields[2].trim().to_string(),
        committed_at,
        message: fields[4].trim().to_string(),
        changed_files: numstat.files,
        lines_added: numstat.counted.then_some(numstat.added),
        lines_removed: numstat.counted.then_some(numstat.removed),
    })
}

#[derive(Debug, Default)]
struct Numstat {
    files: Vec<String>,
    added: u64,
    removed: u64,
    counted: bool,
}

/// Sums `--numstat` lines. Binary files report `-` and count as 0.
fn parse_numstat(block: &str) -> Numstat {
    let mut stats = Numstat::default();

    for line in block.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            trace!(line, "Skipping unrecognized numstat line");
            continue;
        };

        stats.added += added.trim().parse::<u64>().unwrap_or(0);
        stats.removed += removed.trim().parse::<u64>().unwrap_or(0);
        stats.files.push(path.to_string());
        stats.counted = true;
    }

    stats
}

/// Turns commit queries into oldest-first batches of unseen commits.
#[derive(Clone)]
pub struct CommitIngester {
    source: Arc<dyn CommitSource>,
    bootstrap_limit: usize,
    max_batch: usize,
    timeout: Duration,
}

impl std::fmt::Debug for CommitIngester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitIngester")
            .field("bootstrap_limit", &self.bootstrap_limit)
            .field("max_batch", &self.max_batch)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommitIngester {
    #[must_use]
    pub fn new(source: Arc<dyn CommitSource>, config: &MonitorConfig) -> Self {
        Self {
            source,
            bootstrap_limit: config.bootstrap_commits,
            max_batch: config.max_commit_batch,
            timeout: config.command_timeout,
        }
    }

    /// Fetches commits newer than `last_seen`, oldest first.
    ///
    /// With no `last_seen` this is a bootstrap capped at the bootstrap limit.
    /// Otherwise the range is read in pages of the batch size until it is
    /// exhausted, so no commit newer than `last_seen` is left behind.
    /// If `last_seen` vanished from history the poll falls back to a
    /// bootstrap, which may re-emit commits consumers have already seen.
    ///
    /// # Errors
    ///
    /// - [`PollError::IngesterCommand`] for spawn failures, non-zero exits and
    ///   timeouts
    /// - [`PollError::Parse`] for malformed output, carrying the current head
    ///   so the caller can skip past the batch
    pub async fn poll(
        &self,
        root: &Path,
        last_seen: Option<&str>,
    ) -> Result<Vec<CommitRecord>, PollError> {
        let result = match self.query(root, last_seen).await {
            Err(CommitQueryError::UnknownRevision(rev)) => {
                warn!(
                    root = %root.display(),
                    revision = %rev,
                    "Last seen commit is gone from history, re-bootstrapping"
                );
                self.query(root, None).await
            }
            other => other,
        };

        match result {
            Ok(mut records) => {
                records.reverse();
                if let Some(seen) = last_seen {
                    records.retain(|r| r.hash != seen);
                }
                Ok(records)
            }
            Err(CommitQueryError::Parse(source)) => {
                let skip_to = match tokio::time::timeout(self.timeout, self.source.head(root)).await
                {
                    Ok(Ok(head)) => head,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Could not read head after parse failure");
                        None
                    }
                    Err(_) => None,
                };
                Err(PollError::Parse { source, skip_to })
            }
            Err(e) => Err(PollError::IngesterCommand(e)),
        }
    }

    async fn query(
        &self,
        root: &Path,
        since: Option<&str>,
    ) -> Result<Vec<CommitRecord>, CommitQueryError> {
        let Some(rev) = since else {
            return self.page(root, None, 0, self.bootstrap_limit).await;
        };

        let mut records: Vec<CommitRecord> = Vec::new();
        let mut seen = HashSet::new();
        let mut skip = 0;

        loop {
            let page = self.page(root, Some(rev), skip, self.max_batch).await?;
            let full = page.len() >= self.max_batch;
            skip += page.len();

            // Commits landing between pages shift the offsets; drop repeats.
            records.extend(page.into_iter().filter(|r| seen.insert(r.hash.clone())));

            if !full || self.max_batch == 0 {
                break;
            }
            debug!(
                root = %root.display(),
                fetched = records.len(),
                "Commit range exceeds one batch, reading next page"
            );
        }

        Ok(records)
    }

    async fn page(
        &self,
        root: &Path,
        since: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<CommitRecord>, CommitQueryError> {
        tokio::time::timeout(
            self.timeout,
            self.source.list_commits_since(root, since, skip, limit),
        )
        .await
        .map_err(|_| CommitQueryError::Timeout(self.timeout))?
    }
}

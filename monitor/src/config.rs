//! Configuration module for Hivewatch Monitor.
//!
//! [`MonitorConfig`] holds the tunables of the monitoring core and has sensible
//! defaults for library use. [`Config::from_env`] builds it, plus the initial
//! source list, from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HIVEWATCH_SOURCES` | No | - | Comma-separated `id=path` entries |
//! | `HIVEWATCH_SOURCES_FILE` | No | `~/.hivewatch/sources.json` | JSON source list |
//! | `HIVEWATCH_POLL_INTERVAL_MS` | No | 5000 | Filesystem poll interval |
//! | `HIVEWATCH_COMMIT_POLL_INTERVAL_MS` | No | 5000 | Commit poll interval |
//! | `HIVEWATCH_MAX_BACKOFF_SECS` | No | 60 | Cap for error backoff |
//! | `HIVEWATCH_COMMAND_TIMEOUT_SECS` | No | 10 | Timeout for the commit-log command |
//! | `HIVEWATCH_BOOTSTRAP_COMMITS` | No | 20 | Commits ingested on first poll |
//! | `HIVEWATCH_MAX_COMMIT_BATCH` | No | 200 | Commits ingested per later poll |
//! | `HIVEWATCH_BUFFER_SIZE` | No | 100 | Activity stream capacity |
//! | `HIVEWATCH_FRESHNESS_SECS` | No | 300 | Window for counting a source as active |
//! | `HIVEWATCH_IGNORE` | No | - | Extra comma-separated ignore entries |
//! | `HIVEWATCH_GIT_BIN` | No | `git` | Version-control binary |
//!
//! # Example
//!
//! ```no_run
//! use hivewatch_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Sources: {}", config.sources.len());
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;

/// Default filesystem and commit poll interval.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default backoff cap in seconds.
const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;

/// Default timeout for one commit-log invocation.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;

/// Default number of commits ingested when a source is first polled.
const DEFAULT_BOOTSTRAP_COMMITS: usize = 20;

/// Default cap on commits ingested by one later poll.
const DEFAULT_MAX_COMMIT_BATCH: usize = 200;

/// Default activity stream capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Default freshness window in seconds.
const DEFAULT_FRESHNESS_SECS: u64 = 300;

/// Default sources file location relative to home.
const DEFAULT_SOURCES_FILE: &str = ".hivewatch/sources.json";

/// Version-control metadata and build-artifact directories skipped by default.
pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".venv",
    ".idea",
];

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The sources file could not be read.
    #[error("failed to read sources file {path}: {source}")]
    SourcesFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sources file is not a valid JSON source list.
    #[error("invalid sources file {path}: {source}")]
    SourcesFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A source to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub id: String,

    /// Falls back to the id when absent.
    #[serde(default)]
    pub display_name: Option<String>,

    pub root_path: PathBuf,
}

impl SourceSpec {
    /// The name consumers should display for this source.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Tunables of the monitoring core.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base interval of the filesystem detector loop.
    pub poll_interval: Duration,

    /// Base interval of the commit ingester loop.
    pub commit_poll_interval: Duration,

    /// Upper bound for backoff after consecutive failures.
    pub max_backoff: Duration,

    /// Timeout for one commit-log query.
    pub command_timeout: Duration,

    /// Commits ingested on a source's first poll.
    pub bootstrap_commits: usize,

    /// Commits ingested by one later poll.
    pub max_commit_batch: usize,

    /// Capacity of the activity stream.
    pub buffer_size: usize,

    /// A source is active in a snapshot if it saw activity within this window.
    pub freshness_window: Duration,

    /// Records included in [`SystemSnapshot::recent_activity`](crate::types::SystemSnapshot).
    pub snapshot_recent: usize,

    /// Path components (or `*.ext` suffixes) skipped while scanning.
    pub ignore: Vec<String>,

    /// Version-control binary.
    pub git_bin: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            commit_poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            bootstrap_commits: DEFAULT_BOOTSTRAP_COMMITS,
            max_commit_batch: DEFAULT_MAX_COMMIT_BATCH,
            buffer_size: DEFAULT_BUFFER_SIZE,
            freshness_window: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            snapshot_recent: DEFAULT_BUFFER_SIZE,
            ignore: DEFAULT_IGNORE.iter().map(|s| (*s).to_string()).collect(),
            git_bin: "git".to_string(),
        }
    }
}

/// Full configuration loaded at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub monitor: MonitorConfig,

    /// Initial source list, registered in order.
    pub sources: Vec<SourceSpec>,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a numeric variable is set but is not a positive integer
    /// - `HIVEWATCH_SOURCES` contains an entry that is not `id=path`
    /// - the sources file exists but cannot be read or parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = MonitorConfig::default();

        let poll_interval = Duration::from_millis(parse_positive(
            "HIVEWATCH_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let commit_poll_interval = Duration::from_millis(parse_positive(
            "HIVEWATCH_COMMIT_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let max_backoff = Duration::from_secs(parse_positive(
            "HIVEWATCH_MAX_BACKOFF_SECS",
            DEFAULT_MAX_BACKOFF_SECS,
        )?);
        let command_timeout = Duration::from_secs(parse_positive(
            "HIVEWATCH_COMMAND_TIMEOUT_SECS",
            DEFAULT_COMMAND_TIMEOUT_SECS,
        )?);
        let bootstrap_commits =
            parse_positive("HIVEWATCH_BOOTSTRAP_COMMITS", DEFAULT_BOOTSTRAP_COMMITS)?;
        let max_commit_batch =
            parse_positive("HIVEWATCH_MAX_COMMIT_BATCH", DEFAULT_MAX_COMMIT_BATCH)?;
        let buffer_size = parse_positive("HIVEWATCH_BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?;
        let freshness_window = Duration::from_secs(parse_positive(
            "HIVEWATCH_FRESHNESS_SECS",
            DEFAULT_FRESHNESS_SECS,
        )?);

        let mut ignore = defaults.ignore;
        if let Ok(val) = env::var("HIVEWATCH_IGNORE") {
            for entry in split_list(&val) {
                if !ignore.contains(&entry) {
                    ignore.push(entry);
                }
            }
        }

        let git_bin = env::var("HIVEWATCH_GIT_BIN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.git_bin);

        let mut sources = match env::var("HIVEWATCH_SOURCES") {
            Ok(val) => parse_source_list(&val)?,
            Err(_) => Vec::new(),
        };

        if let Some(path) = sources_file_path() {
            for spec in load_sources_file(&path)? {
                if !sources.iter().any(|s| s.id == spec.id) {
                    sources.push(spec);
                }
            }
        }

        Ok(Self {
            monitor: MonitorConfig {
                poll_interval,
                commit_poll_interval,
                max_backoff,
                command_timeout,
                bootstrap_commits,
                max_commit_batch,
                buffer_size,
                freshness_window,
                snapshot_recent: buffer_size,
                ignore,
                git_bin,
            },
            sources,
        })
    }
}

/// Parses an optional positive integer variable, falling back to `default`.
fn parse_positive<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    match env::var(key) {
        Ok(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
            if parsed == T::default() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "value must be greater than 0".to_string(),
                });
            }
            Ok(parsed)
        }
        Err(_) => Ok(default),
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `id=path[,id=path...]`.
fn parse_source_list(val: &str) -> Result<Vec<SourceSpec>, ConfigError> {
    split_list(val)
        .into_iter()
        .map(|entry| {
            let (id, path) = entry
                .split_once('=')
                .map(|(id, path)| (id.trim(), path.trim()))
                .filter(|(id, path)| !id.is_empty() && !path.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "HIVEWATCH_SOURCES".to_string(),
                    message: format!("expected 'id=path', got '{entry}'"),
                })?;
            Ok(SourceSpec {
                id: id.to_string(),
                display_name: None,
                root_path: PathBuf::from(path),
            })
        })
        .collect()
}

/// Resolves the sources file: explicit variable first, then the default
/// location if it exists.
fn sources_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("HIVEWATCH_SOURCES_FILE") {
        return Some(PathBuf::from(path));
    }

    let default = BaseDirs::new()?.home_dir().join(DEFAULT_SOURCES_FILE);
    default.exists().then_some(default)
}

/// Loads a JSON array of [`SourceSpec`]s.
pub fn load_sources_file(path: &Path) -> Result<Vec<SourceSpec>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::SourcesFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::SourcesFileParse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all HIVEWATCH_* vars before the test and restores them after.
    /// `HIVEWATCH_SOURCES_FILE` is pointed at a missing file so a real
    /// `~/.hivewatch/sources.json` cannot leak into the test.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("HIVEWATCH_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let missing = tempfile::tempdir().expect("Failed to create temp dir");
        env::set_var(
            "HIVEWATCH_SOURCES_FILE",
            missing.path().join("absent.json"),
        );

        let result = f();

        let leftover: Vec<String> = env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("HIVEWATCH_"))
            .collect();
        for key in leftover {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    fn test_default_monitor_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.bootstrap_commits, 20);
        assert_eq!(config.buffer_size, 100);
        assert!(config.ignore.iter().any(|s| s == ".git"));
        assert!(config.ignore.iter().any(|s| s == "node_modules"));
    }

    #[test]
    #[serial]
    fn test_missing_sources_file_is_an_error() {
        with_clean_env(|| {
            let result = Config::from_env();
            assert!(matches!(result, Err(ConfigError::SourcesFileRead { .. })));
        });
    }

    #[test]
    #[serial]
    fn test_minimal_config() {
        with_clean_env(|| {
            env::remove_var("HIVEWATCH_SOURCES_FILE");
            env::set_var("HIVEWATCH_SOURCES", "alpha=/work/alpha");

            let config = Config::from_env().expect("should parse minimal config");

            assert_eq!(config.monitor.buffer_size, DEFAULT_BUFFER_SIZE);
            assert_eq!(config.monitor.git_bin, "git");
            assert!(!config.sources.is_empty());
            assert_eq!(config.sources[0].id, "alpha");
            assert_eq!(config.sources[0].root_path, PathBuf::from("/work/alpha"));
            assert_eq!(config.sources[0].display_name(), "alpha");
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let file = dir.path().join("sources.json");
            fs::write(
                &file,
                r#"[
                    {"id": "beta", "displayName": "Beta Agent", "rootPath": "/work/beta"},
                    {"id": "alpha", "rootPath": "/elsewhere/alpha"}
                ]"#,
            )
            .unwrap();

            env::set_var("HIVEWATCH_SOURCES_FILE", &file);
            env::set_var("HIVEWATCH_SOURCES", "alpha=/work/alpha, gamma = /work/gamma");
            env::set_var("HIVEWATCH_POLL_INTERVAL_MS", "250");
            env::set_var("HIVEWATCH_COMMIT_POLL_INTERVAL_MS", "1000");
            env::set_var("HIVEWATCH_MAX_BACKOFF_SECS", "30");
            env::set_var("HIVEWATCH_COMMAND_TIMEOUT_SECS", "3");
            env::set_var("HIVEWATCH_BOOTSTRAP_COMMITS", "5");
            env::set_var("HIVEWATCH_MAX_COMMIT_BATCH", "50");
            env::set_var("HIVEWATCH_BUFFER_SIZE", "500");
            env::set_var("HIVEWATCH_FRESHNESS_SECS", "60");
            env::set_var("HIVEWATCH_IGNORE", "*.log, .cache");
            env::set_var("HIVEWATCH_GIT_BIN", "/usr/local/bin/git");

            let config = Config::from_env().expect("should parse full config");
            let monitor = &config.monitor;

            assert_eq!(monitor.poll_interval, Duration::from_millis(250));
            assert_eq!(monitor.commit_poll_interval, Duration::from_secs(1));
            assert_eq!(monitor.max_backoff, Duration::from_secs(30));
            assert_eq!(monitor.command_timeout, Duration::from_secs(3));
            assert_eq!(monitor.bootstrap_commits, 5);
            assert_eq!(monitor.max_commit_batch, 50);
            assert_eq!(monitor.buffer_size, 500);
            assert_eq!(monitor.freshness_window, Duration::from_secs(60));
            assert!(monitor.ignore.iter().any(|s| s == "*.log"));
            assert!(monitor.ignore.iter().any(|s| s == ".cache"));
            assert!(monitor.ignore.iter().any(|s| s == ".git"));
            assert_eq!(monitor.git_bin, "/usr/local/bin/git");

            // Environment entries win over file entries with the same id.
            let ids: Vec<&str> = config.sources.iter().map(|s| s.id.as_str()).collect();
            assert_eq!(ids, vec!["alpha", "gamma", "beta"]);
            assert_eq!(config.sources[0].root_path, PathBuf::from("/work/alpha"));
            assert_eq!(config.sources[2].display_name(), "Beta Agent");
        });
    }

    #[test]
    #[serial]
    fn test_invalid_buffer_size() {
        with_clean_env(|| {
            env::set_var("HIVEWATCH_BUFFER_SIZE", "not-a-number");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "HIVEWATCH_BUFFER_SIZE"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_interval_rejected() {
        with_clean_env(|| {
            env::set_var("HIVEWATCH_POLL_INTERVAL_MS", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "HIVEWATCH_POLL_INTERVAL_MS" && message.contains("greater than 0")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_malformed_source_entry_rejected() {
        with_clean_env(|| {
            env::set_var("HIVEWATCH_SOURCES", "alpha=/work/alpha,beta");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "HIVEWATCH_SOURCES" && message.contains("'beta'")
            ));
        });
    }

    #[test]
    fn test_invalid_sources_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = dir.path().join("sources.json");
        fs::write(&file, "{ not json").unwrap();

        let err = load_sources_file(&file).unwrap_err();
        assert!(matches!(err, ConfigError::SourcesFileParse { .. }));
    }

    #[test]
    fn test_split_list_filters_empty_entries() {
        assert_eq!(
            split_list(" a ,, b ,,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}

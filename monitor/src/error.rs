//! Error types for the Hivewatch Monitor.
//!
//! Registration errors are returned synchronously to the caller. Poll-cycle
//! errors never leave the scheduler: they are classified as [`PollError`] and
//! converted into [`ErrorEvent`](crate::types::ErrorEvent) notifications.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::git::{CommitQueryError, ParseError};
use crate::types::PollErrorKind;
use crate::watcher::DetectorError;

/// Errors that can occur during monitor operations.
///
/// This is the umbrella error type for the monitor crate.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Source registration or removal failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by source registration, removal, and per-source queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The root path is missing, not a directory, or unreadable.
    #[error("source root does not exist or is unreadable: {0}")]
    PathNotFound(PathBuf),

    /// A source with this id is already registered.
    #[error("source already registered: {0}")]
    SourceAlreadyRegistered(String),

    /// No source with this id is registered.
    #[error("source not registered: {0}")]
    SourceNotRegistered(String),

    /// Source ids must contain at least one non-whitespace character.
    #[error("source id cannot be empty")]
    InvalidSourceId,
}

/// A failed poll cycle, as seen by the scheduler.
#[derive(Error, Debug)]
pub enum PollError {
    /// The filesystem scan failed (root momentarily inaccessible, etc.).
    #[error("filesystem scan failed: {0}")]
    DetectorIo(#[from] DetectorError),

    /// The commit-log command failed, timed out, or could not be spawned.
    #[error("commit query failed: {0}")]
    IngesterCommand(#[from] CommitQueryError),

    /// The commit-log output could not be parsed.
    ///
    /// `skip_to` is the repository head at the time of failure, if it could be
    /// read; the batch up to it is skipped rather than retried.
    #[error("malformed commit log: {source}")]
    Parse {
        #[source]
        source: ParseError,
        skip_to: Option<String>,
    },
}

impl PollError {
    /// Classification used in emitted error events.
    #[must_use]
    pub fn kind(&self) -> PollErrorKind {
        match self {
            Self::DetectorIo(_) => PollErrorKind::DetectorIo,
            Self::IngesterCommand(_) => PollErrorKind::IngesterCommand,
            Self::Parse { .. } => PollErrorKind::Parse,
        }
    }

    /// Whether this failure should push the loop into backoff.
    ///
    /// A parse failure with a known head is skipped, not retried, so it does
    /// not back off. Without a head the same batch is retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Parse { skip_to: Some(_), .. })
    }
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn registry_error_path_not_found_display() {
        let err = RegistryError::PathNotFound(PathBuf::from("/does/not/exist"));
        assert_eq!(
            err.to_string(),
            "source root does not exist or is unreadable: /does/not/exist"
        );
    }

    #[test]
    fn registry_error_already_registered_display() {
        let err = RegistryError::SourceAlreadyRegistered("alpha".to_string());
        assert_eq!(err.to_string(), "source already registered: alpha");
    }

    #[test]
    fn registry_error_not_registered_display() {
        let err = RegistryError::SourceNotRegistered("beta".to_string());
        assert_eq!(err.to_string(), "source not registered: beta");
    }

    #[test]
    fn registry_error_to_monitor_error_conversion() {
        let err: MonitorError = RegistryError::InvalidSourceId.into();
        assert!(matches!(err, MonitorError::Registry(_)));
        assert_eq!(err.to_string(), "registry error: source id cannot be empty");
    }

    #[test]
    fn monitor_error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MonitorError = io_err.into();
        assert!(matches!(err, MonitorError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn config_error_to_monitor_error_conversion() {
        let config_err = ConfigError::InvalidValue {
            key: "HIVEWATCH_BUFFER_SIZE".to_string(),
            message: "expected positive integer".to_string(),
        };
        let err: MonitorError = config_err.into();
        assert_eq!(
            err.to_string(),
            "configuration error: invalid value for HIVEWATCH_BUFFER_SIZE: expected positive integer"
        );
    }

    #[test]
    fn poll_error_kinds() {
        let io = PollError::DetectorIo(DetectorError::RootUnavailable {
            root: PathBuf::from("/gone"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        });
        assert_eq!(io.kind(), PollErrorKind::DetectorIo);
        assert!(io.is_transient());

        let timeout = PollError::from(CommitQueryError::Timeout(Duration::from_secs(10)));
        assert_eq!(timeout.kind(), PollErrorKind::IngesterCommand);
        assert!(timeout.is_transient());

        let skipped = PollError::Parse {
            source: ParseError::MissingFields {
                record: 0,
                found: 2,
            },
            skip_to: Some("abc1234".to_string()),
        };
        assert_eq!(skipped.kind(), PollErrorKind::Parse);
        assert!(!skipped.is_transient());

        let stuck = PollError::Parse {
            source: ParseError::LeadingGarbage,
            skip_to: None,
        };
        assert!(stuck.is_transient());
    }

    #[test]
    fn poll_error_source_chain() {
        use std::error::Error;

        let err = PollError::from(CommitQueryError::Timeout(Duration::from_secs(10)));
        assert!(err.source().is_some());
    }
}

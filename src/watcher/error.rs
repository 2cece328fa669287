//! Error types for the watch subsystem.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Maximum number of watches ({max}) exceeded")]
    MaxWatchesExceeded { max: usize },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error(
        "Recursive watch of {root} failed at {failed} ({rolled_back} paths rolled back): {source}"
    )]
    PartialRegistration {
        root: PathBuf,
        failed: PathBuf,
        rolled_back: usize,
        #[source]
        source: Box<WatchError>,
    },

    #[error("Watch of {path} was cancelled while it was being registered")]
    Superseded { path: PathBuf },

    #[error("Failed to initialize watcher for {path}: {reason}")]
    InitFailed { path: PathBuf, reason: String },

    #[error("No tokio runtime available to run background tasks")]
    NoRuntime,
}

impl WatchError {
    /// True when the failure was caused by the admission cap, including
    /// when it aborted a multi-path registration.
    pub fn is_admission_denied(&self) -> bool {
        match self {
            WatchError::MaxWatchesExceeded { .. } => true,
            WatchError::PartialRegistration { source, .. } => source.is_admission_denied(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_denied_through_partial_registration() {
        let err = WatchError::PartialRegistration {
            root: PathBuf::from("/project"),
            failed: PathBuf::from("/project/c"),
            rolled_back: 2,
            source: Box::new(WatchError::MaxWatchesExceeded { max: 2 }),
        };

        assert!(err.is_admission_denied());
        assert!(err.to_string().contains("2 paths rolled back"));

        let err = WatchError::PathWatchFailed {
            path: PathBuf::from("/missing"),
            reason: "No such file or directory".to_string(),
        };
        assert!(!err.is_admission_denied());
    }
}

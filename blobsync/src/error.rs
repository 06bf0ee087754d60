//! Error types for download runs.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors that abort a download run.
///
/// Skips and checksum mismatches are outcomes, not errors; only faults that
/// would leave a local file looking complete when it is not end up here.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Listing a source failed.
    #[error("failed to list {source_path}: {reason}")]
    Listing { source_path: String, reason: String },

    /// Fetching a byte range from the remote failed.
    #[error("failed to fetch {location} [{start}, +{length}): {reason}")]
    Fetch {
        location: String,
        start: u64,
        length: u64,
        reason: String,
    },

    /// The remote returned fewer (or more) bytes than requested.
    #[error("short read from {location}: expected {expected} bytes, got {actual}")]
    ShortRead {
        location: String,
        expected: u64,
        actual: u64,
    },

    /// Decrypting a chunk failed.
    #[error("failed to decrypt chunk {chunk} of {}: {reason}", path.display())]
    Decrypt {
        path: PathBuf,
        chunk: u64,
        reason: String,
    },

    /// An encrypted entity was listed but no decryption key is configured.
    #[error("{location} is encrypted but no decryption key was provided")]
    MissingDecryptionKey { location: String },

    /// A remote name cannot be mapped to a path under the destination.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Local filesystem I/O failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// The operator interrupted the run.
    #[error("download interrupted")]
    Interrupted,

    /// A worker thread panicked.
    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),
}

impl DownloadError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error is an operator interrupt rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = DownloadError::Fetch {
            location: "cont/a.bin".to_string(),
            start: 16,
            length: 16,
            reason: "connection reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch cont/a.bin [16, +16): connection reset"
        );
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error;

        let err = DownloadError::io(
            Path::new("/tmp/x"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/x"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_is_interrupt() {
        assert!(DownloadError::Interrupted.is_interrupt());
        assert!(!DownloadError::InvalidPath("..".to_string()).is_interrupt());
    }
}

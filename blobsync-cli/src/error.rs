//! CLI error type and exit codes.

use std::fmt;

use blobsync::config::ConfigError;
use blobsync::DownloadError;

/// Exit code used when the operator interrupts a run.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Errors surfaced to the command line.
#[derive(Debug)]
pub enum CliError {
    /// Configuration could not be loaded, saved, or combined with arguments.
    Config(String),
    /// The download run failed.
    Download(DownloadError),
    /// Logging could not be initialized.
    Logging(String),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Download(e) if e.is_interrupt() => EXIT_INTERRUPTED,
            CliError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Download(e) => write!(f, "Download failed: {}", e),
            CliError::Logging(msg) => write!(f, "Logging error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Download(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DownloadError> for CliError {
    fn from(e: DownloadError) -> Self {
        CliError::Download(e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

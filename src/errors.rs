// panelbackup/src/errors.rs
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of the single "start backup" call against the control panel.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control panel answered with HTTP {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Control panel rejected the backup request: {0}")]
    Rejected(String),

    #[error("Invalid control panel response: {0}")]
    InvalidResponse(String),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Control panel client unavailable: {0}")]
    Setup(String),
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("No backup file matching '{pattern}' found in {}", .dir.display())]
    NotFound { dir: PathBuf, pattern: String },

    #[error("{} equally recent backup files match, refusing to guess: {:?}", .candidates.len(), .candidates)]
    Ambiguous { candidates: Vec<PathBuf> },

    #[error("Failed to list search directory {}: {source}", .dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact search cancelled")]
    Cancelled,
}

/// Per-destination transfer failure. Only transient variants are retried.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Destination answered HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Destination rejected the transfer: {0}")]
    Rejected(String),

    #[error("Verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Connection resets, timeouts, throttling and 5xx answers are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Transport(_) => true,
            TransferError::Http { status, .. } => *status == 429 || *status >= 500,
            TransferError::Rejected(_)
            | TransferError::VerificationMismatch(_)
            | TransferError::Cancelled
            | TransferError::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransferError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_builder() => TransferError::Rejected(err.to_string()),
            None => TransferError::Transport(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Refusing to delete {} outside of {}", .path.display(), .scope.display())]
    OutsideScope { path: PathBuf, scope: PathBuf },

    #[error("Failed to delete {}: {source}", .path.display())]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Conditions that abort a run before it reaches the transfer stage.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Backup request failed: {0}")]
    Request(#[from] RequestError),

    #[error("Backup job failed: {0}")]
    JobFailed(String),

    #[error("Backup job did not complete within {0:?}")]
    JobTimedOut(Duration),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("Run cancelled")]
    Cancelled,
}

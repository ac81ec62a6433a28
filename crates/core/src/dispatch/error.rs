//! Error types for storage dispatch.

use std::path::PathBuf;
use thiserror::Error;

use crate::retry::Retryable;

/// Errors that can occur while dispatching an artifact.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Staged file is gone.
    #[error("Source file not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// A different file already sits at the destination.
    #[error("Destination already exists with different content: {path}")]
    DestinationExists { path: PathBuf },

    #[error("Failed to create directory: {path}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy file from {source} to {destination}")]
    CopyFailed {
        source: PathBuf,
        destination: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to move file from {source} to {destination}")]
    MoveFailed {
        source: PathBuf,
        destination: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Copy did not reproduce the source bytes.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The sftp client could not be started.
    #[error("Failed to start {binary}: {source}")]
    RemoteSpawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sftp session exited non-zero.
    #[error("Remote transfer to {host} failed (exit {code:?}): {stderr}")]
    Remote {
        host: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Remote transfer to {host} timed out after {secs}s")]
    RemoteTimeout { host: String, secs: u64 },

    #[error("Storage not configured: {0}")]
    NotConfigured(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    pub fn copy_failed(source: PathBuf, destination: PathBuf, error: std::io::Error) -> Self {
        Self::CopyFailed {
            source,
            destination,
            error,
        }
    }

    pub fn move_failed(source: PathBuf, destination: PathBuf, error: std::io::Error) -> Self {
        Self::MoveFailed {
            source,
            destination,
            error,
        }
    }

    /// Whether this error is retryable.
    ///
    /// Local resource failures (disk full, permission denied) are final for the unit; only
    /// interrupted local I/O, bad copies and remote failures are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) | Self::CopyFailed { error: e, .. } | Self::MoveFailed { error: e, .. } => {
                is_transient_io(e)
            }
            Self::ChecksumMismatch { .. } | Self::Remote { .. } | Self::RemoteTimeout { .. } => {
                true
            }
            Self::SourceNotFound { .. }
            | Self::DestinationExists { .. }
            | Self::DirectoryCreationFailed { .. }
            | Self::RemoteSpawn { .. }
            | Self::NotConfigured(_) => false,
        }
    }

    /// Whether the failure points at the network rather than the local machine.
    pub fn is_transient_network(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::RemoteTimeout { .. })
    }
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        DispatchError::is_retryable(self)
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
    )
}

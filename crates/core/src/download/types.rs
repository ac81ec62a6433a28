//! Types for the download engine.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::provider::ProviderError;
use crate::retry::Retryable;

/// A fully downloaded and verified file in staging.
///
/// Owned by the download engine until handed to a storage dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadArtifact {
    pub image_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex MD5 of the written bytes.
    pub md5: String,
    /// Byte count and checksum matched what the provider declared.
    pub verified: bool,
}

impl DownloadArtifact {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Errors from the download engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Local filesystem failure (disk full, permission denied).
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download of {image_id} produced an empty file")]
    Empty { image_id: String },

    #[error("Length mismatch for {image_id}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        image_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Checksum mismatch for {image_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        image_id: String,
        expected: String,
        actual: String,
    },

    #[error("Download attempt timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error is retryable.
    ///
    /// Short or corrupted bodies are treated like interrupted transfers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Empty { .. }
            | Self::LengthMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Timeout { .. } => true,
            Self::Io { .. } | Self::Cancelled => false,
        }
    }

    /// Whether the failure came from the network rather than local resources or verification.
    pub fn is_transient_network(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_retryable()) || matches!(self, Self::Timeout { .. })
    }
}

impl Retryable for DownloadError {
    fn is_retryable(&self) -> bool {
        DownloadError::is_retryable(self)
    }
}

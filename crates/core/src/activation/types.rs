//! Types for asset activation.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::provider::ProviderError;

/// Activation state of one image's selected product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    /// Status not yet read.
    Unknown,
    /// Activation requested, waiting for the provider.
    Activating,
    /// Downloadable.
    Active,
    /// Gave up.
    Failed,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivationState::Unknown => "unknown",
            ActivationState::Activating => "activating",
            ActivationState::Active => "active",
            ActivationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An active product, ready to download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAsset {
    pub image_id: String,
    pub product_type: String,
    /// Download URL.
    pub location: String,
    /// Hex MD5 declared by the provider.
    pub md5_digest: Option<String>,
    /// Status polls issued after the activation request (0 when already active).
    pub polls: u32,
}

/// Errors from the activation state machine.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// None of the configured product types exist for this image. The image is skipped.
    #[error("No configured product type available for image {image_id}")]
    NoProduct { image_id: String },

    /// Polling bounds reached before the product became active.
    #[error("Activation of {image_id} timed out after {polls} polls ({waited_secs}s)")]
    Timeout {
        image_id: String,
        polls: u32,
        waited_secs: u64,
    },

    /// The provider response lacks a link needed to continue.
    #[error("Product {product_type} of {image_id} has no {link} link")]
    MissingLink {
        image_id: String,
        product_type: String,
        link: &'static str,
    },

    /// Provider errors exhausted the error budget, or a non-retryable provider error.
    #[error("Activation of {image_id} failed: {source}")]
    Failed {
        image_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("Activation of {image_id} cancelled")]
    Cancelled { image_id: String },
}

impl ActivationError {
    /// Whether the image should be counted as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::NoProduct { .. })
    }

    /// Whether the failure came from transient provider errors exhausting their budget.
    pub fn is_transient_exhausted(&self) -> bool {
        matches!(self, Self::Failed { source, .. } if source.is_retryable())
    }

    /// Metric label for this outcome.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::NoProduct { .. } => "no_product",
            Self::Timeout { .. } => "timeout",
            Self::MissingLink { .. } | Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let no_product = ActivationError::NoProduct {
            image_id: "a".into(),
        };
        assert!(no_product.is_skip());
        assert!(!no_product.is_transient_exhausted());

        let exhausted = ActivationError::Failed {
            image_id: "a".into(),
            source: ProviderError::Timeout,
        };
        assert!(exhausted.is_transient_exhausted());
        assert!(!exhausted.is_skip());

        let declared = ActivationError::Failed {
            image_id: "a".into(),
            source: ProviderError::Status {
                status: 403,
                body: "no access".into(),
            },
        };
        assert!(!declared.is_transient_exhausted());
    }
}

//! Types for the imagery provider.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use geojson::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::planner::TimeWindow;
use crate::retry::Retryable;

/// One filtered search for a (quadrant, window) pair.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub quadrant_id: String,
    pub geometry: Geometry,
    pub window: TimeWindow,
    /// Maximum cloud cover as a fraction in [0, 1].
    pub cloud_cover_max: f64,
    /// Minimum visible (clear) area as a fraction in [0, 1].
    pub visibility_min: f64,
}

/// An image returned by search, in provider rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    /// Provider image identifier.
    pub image_id: String,
    pub acquired: DateTime<Utc>,
    /// Cloud cover fraction in [0, 1].
    pub cloud_cover: f64,
    /// Visible area fraction in [0, 1].
    pub visibility: f64,
    /// Link to the per-image asset listing.
    pub assets_url: String,
}

/// Provider-reported status of one product of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Inactive,
    Activating,
    Active,
    #[serde(other)]
    Unknown,
}

impl AssetStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "inactive" => AssetStatus::Inactive,
            "activating" => AssetStatus::Activating,
            "active" => AssetStatus::Active,
            _ => AssetStatus::Unknown,
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetStatus::Inactive => "inactive",
            AssetStatus::Activating => "activating",
            AssetStatus::Active => "active",
            AssetStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One product entry from an image's asset listing.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    pub product_type: String,
    pub status: AssetStatus,
    /// Activation trigger link.
    pub activate_url: Option<String>,
    /// Download URL, present once the product is active.
    pub location: Option<String>,
    /// Hex MD5 of the product file, when the provider declares it.
    pub md5_digest: Option<String>,
}

/// Asset listing of one image, keyed by product type.
pub type AssetListing = HashMap<String, AssetInfo>;

/// A streaming download body.
pub struct DownloadStream {
    /// Declared body length, when the provider sends one.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, ProviderError>>,
}

impl fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Errors from the imagery provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider request timed out")]
    Timeout,

    #[error("Provider connection failed: {0}")]
    Connection(String),

    #[error("Provider stream interrupted: {0}")]
    Stream(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Provider client error: {0}")]
    Client(String),
}

impl ProviderError {
    /// Whether this error is retryable: transient network failures, rate limiting and a
    /// temporarily unavailable service.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Connection(_) | ProviderError::Stream(_) => {
                true
            }
            ProviderError::Status { status, .. } => matches!(status, 429 | 503),
            ProviderError::Parse(_) | ProviderError::Client(_) => false,
        }
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }
}

/// Trait for imagery provider backends.
#[async_trait]
pub trait ImageryProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Run one filtered search; candidates come back in provider rank order.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchCandidate>, ProviderError>;

    /// Asset listing URL for an image known only by id.
    fn item_assets_url(&self, image_id: &str) -> String;

    /// Fetch the asset listing at `assets_url`.
    async fn assets(&self, assets_url: &str) -> Result<AssetListing, ProviderError>;

    /// Trigger activation. The provider acknowledges without completing synchronously.
    async fn activate(&self, activate_url: &str) -> Result<(), ProviderError>;

    /// Open a streaming download of an active product.
    async fn open_download(&self, location: &str) -> Result<DownloadStream, ProviderError>;
}

//! Types for the acquisition registry.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planner::Season;

/// A persisted acquisition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    /// Internal sequence id.
    pub id: i64,
    /// Provider image id (unique).
    pub image_id: String,
    pub quadrant_id: String,
    /// Acquisition date of the image.
    pub acquired: NaiveDate,
    /// Cloud cover as reported at selection time.
    pub cloud_cover: f64,
    /// Visibility as reported at selection time.
    pub visibility: f64,
    /// Product type, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub season: Season,
    pub downloaded: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl AcquisitionRecord {
    pub fn year(&self) -> i32 {
        use chrono::Datelike;
        self.acquired.year()
    }
}

/// A record to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub image_id: String,
    pub quadrant_id: String,
    pub acquired: NaiveDate,
    pub cloud_cover: f64,
    pub visibility: f64,
    #[serde(default)]
    pub product_type: Option<String>,
    pub season: Season,
    /// Imported records may already be marked downloaded.
    #[serde(default)]
    pub downloaded: bool,
}

/// Fixed set of registry queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordQuery {
    /// All records of one quadrant.
    Quadrant(String),
    /// Records acquired on or after a date.
    AcquiredSince(NaiveDate),
    /// Records by download status.
    Downloaded(bool),
}

/// Result of `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new record was created with this id.
    Inserted { id: i64 },
    /// The image was already registered.
    AlreadyPresent { id: i64, downloaded: bool },
}

/// Result of `mark_downloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call flipped the flag.
    Marked,
    /// The record was already downloaded; nothing changed.
    AlreadyDownloaded,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_records: u64,
    pub downloaded: u64,
    pub pending: u64,
    pub quadrants: u64,
}

/// Errors from the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(String),

    /// Data-integrity condition: the image has no record.
    #[error("No record for image: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Database(e.to_string())
    }
}

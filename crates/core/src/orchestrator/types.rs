//! Types for the acquisition orchestrator.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::config::AcquisitionConfig;
use crate::quadrant::Quadrant;
use crate::registry::RegistryError;

/// Errors that stop a run before or outside its units of work.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Request parameters failed validation; nothing was started.
    #[error("invalid acquisition request: {0}")]
    InvalidRequest(String),

    /// Registry failure while planning the run.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Worker pool failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A fully resolved search-mode acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub quadrants: Vec<Quadrant>,
    pub year_start: i32,
    pub year_end: i32,
    pub seasonal: bool,
    /// Percent, 0-100.
    pub cloud_cover_max: f64,
    /// Percent, 0-100.
    pub visibility_min: f64,
}

impl AcquisitionRequest {
    /// Request for `quadrants` using the configured thresholds and year range.
    pub fn from_config(config: &AcquisitionConfig, quadrants: Vec<Quadrant>) -> Self {
        Self {
            quadrants,
            year_start: config.year_start,
            year_end: config.year_end,
            seasonal: config.seasonal,
            cloud_cover_max: config.cloud_cover_max,
            visibility_min: config.visibility_min,
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.year_start > self.year_end {
            return Err(OrchestratorError::InvalidRequest(format!(
                "year_start ({}) must not be after year_end ({})",
                self.year_start, self.year_end
            )));
        }
        for (name, value) in [
            ("cloud_cover_max", self.cloud_cover_max),
            ("visibility_min", self.visibility_min),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "{} must be within [0, 100], got {}",
                    name, value
                )));
            }
        }
        if let Some(q) = self.quadrants.iter().find(|q| q.id.trim().is_empty()) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "quadrant with empty id ({:?})",
                q.id
            )));
        }
        Ok(())
    }
}

/// Pipeline stage a unit failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Search,
    Activation,
    Download,
    Dispatch,
    Registry,
    Internal,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Search => "search",
            Self::Activation => "activation",
            Self::Download => "download",
            Self::Dispatch => "dispatch",
            Self::Registry => "registry",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// One failed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub quadrant_id: String,
    /// Window label, e.g. "2021 secas 2021-01-01..2021-05-31". None for pending-record units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub stage: FailureStage,
    pub error: String,
    /// Transient provider errors outlasted their retries (counts toward connectivity loss).
    pub transient: bool,
}

/// Why a unit was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A downloaded record already covers the window.
    WindowCovered,
    /// The selected image is already downloaded.
    AlreadyDownloaded,
    /// The selected image belongs to another quadrant.
    OtherQuadrant,
    /// Another unit is processing the same image.
    InFlight,
    /// None of the product types exist for the image.
    NoProduct,
}

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Acquired { image_id: String },
    Skipped(SkipReason),
    /// Search returned nothing.
    Empty,
    Failed(UnitFailure),
    Cancelled,
}

impl UnitOutcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acquired { .. } => "acquired",
            Self::Skipped(_) => "skipped",
            Self::Empty => "empty",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a run ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbortReason {
    /// Consecutive units failed on exhausted transient provider errors.
    ConnectivityLost { consecutive_failures: u32 },
    /// The caller cancelled the run.
    Cancelled,
}

/// Aggregate result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub acquired: u32,
    pub skipped: u32,
    pub empty: u32,
    pub failed: u32,
    /// Units not executed or interrupted because the run stopped.
    pub cancelled: u32,
    pub failures: Vec<UnitFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            acquired: 0,
            skipped: 0,
            empty: 0,
            failed: 0,
            cancelled: 0,
            failures: Vec::new(),
            aborted: None,
            duration_ms: 0,
        }
    }

    /// Units accounted for.
    pub fn total(&self) -> u32 {
        self.acquired + self.skipped + self.empty + self.failed + self.cancelled
    }

    pub fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Acquired { .. } => self.acquired += 1,
            UnitOutcome::Skipped(_) => self.skipped += 1,
            UnitOutcome::Empty => self.empty += 1,
            UnitOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
            UnitOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

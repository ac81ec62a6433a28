//! Acquisition orchestrator.
//!
//! Drives quadrants through the pipeline: plan windows, search, take the first candidate,
//! dedup, activate, download, dispatch, and only then mark the registry. Units of work run
//! concurrently on a bounded pool and never abort the run on their own failure.

mod runner;
mod types;

pub use runner::AcquisitionOrchestrator;
pub use types::{
    AbortReason, AcquisitionRequest, FailureStage, OrchestratorError, RunSummary, SkipReason,
    UnitFailure, UnitOutcome,
};

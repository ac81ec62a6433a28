//! Dedup registry - persistent bookkeeping of acquired imagery.
//!
//! One record per image, keyed by the provider image id and attached to one quadrant. The
//! registry answers "has this been downloaded" and "what is still pending", and guarantees a
//! record flips from not-downloaded to downloaded exactly once.

mod sqlite;
mod types;

pub use sqlite::SqliteRegistry;
pub use types::*;

use std::collections::BTreeSet;

use crate::planner::TimeWindow;

/// Trait for acquisition registry storage.
pub trait AcquisitionRegistry: Send + Sync {
    /// Whether any record exists for the quadrant.
    fn exists(&self, quadrant_id: &str) -> Result<bool, RegistryError>;

    /// The subset of `quadrant_ids` that still has undownloaded records.
    fn pending_for(&self, quadrant_ids: &[String]) -> Result<BTreeSet<String>, RegistryError>;

    /// Records matching a query, ordered by internal id.
    fn records_for(&self, query: &RecordQuery) -> Result<Vec<AcquisitionRecord>, RegistryError>;

    /// Undownloaded records of the given quadrants, ordered by internal id.
    fn pending_records(
        &self,
        quadrant_ids: &[String],
    ) -> Result<Vec<AcquisitionRecord>, RegistryError>;

    /// Record of an image, if registered.
    fn get(&self, image_id: &str) -> Result<Option<AcquisitionRecord>, RegistryError>;

    /// A downloaded record of `quadrant_id` acquired inside `window` with the window's season.
    fn covering(
        &self,
        quadrant_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<AcquisitionRecord>, RegistryError>;

    /// Register an image selected for acquisition. Existing records are left untouched.
    fn register(&self, record: &NewRecord) -> Result<RegisterOutcome, RegistryError>;

    /// Flip an image's record to downloaded.
    ///
    /// Compare-and-set: only one caller observes `Marked`. Unknown images are `NotFound`.
    fn mark_downloaded(&self, image_id: &str) -> Result<MarkOutcome, RegistryError>;

    /// Insert records whose image id is not yet present. Returns the number inserted.
    fn bulk_load(&self, records: &[NewRecord]) -> Result<u32, RegistryError>;

    /// Registry statistics.
    fn stats(&self) -> Result<RegistryStats, RegistryError>;
}

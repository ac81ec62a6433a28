//! Storage dispatcher trait.

use async_trait::async_trait;

use super::config::StorageMode;
use super::error::DispatchError;
use super::types::{DispatchRequest, DispatchResult};

/// Moves a verified artifact (and its sidecars) into durable storage.
///
/// On success the staged files no longer exist locally. On failure the
/// staged artifact is left in place so the dispatch can be retried.
#[async_trait]
pub trait StorageDispatcher: Send + Sync {
    fn mode(&self) -> StorageMode;

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError>;
}

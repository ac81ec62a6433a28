//! Storage dispatch - moves verified downloads to durable storage.
//!
//! Two backends share one layout, `<root>/<quadrant>/<year>/<season>/<file>`:
//! a local archive directory and a remote host reached with the system `sftp` client.
//! Sidecar files produced next to the artifact travel with it.

mod config;
mod error;
mod local;
mod sftp;
mod traits;
mod types;

pub use config::{RemoteStorageConfig, StorageConfig, StorageMode};
pub use error::DispatchError;
pub use local::LocalArchiveDispatcher;
pub use sftp::SftpDispatcher;
pub use traits::StorageDispatcher;
pub use types::{collect_sidecars, DispatchRequest, DispatchResult};

use std::sync::Arc;

/// Build the dispatcher selected by `config.mode`.
pub fn create_dispatcher(
    config: &StorageConfig,
) -> Result<Arc<dyn StorageDispatcher>, DispatchError> {
    match config.mode {
        StorageMode::Local => Ok(Arc::new(LocalArchiveDispatcher::new(
            config.archive_dir.clone(),
        ))),
        StorageMode::Remote => {
            let remote = config.remote.clone().ok_or_else(|| {
                DispatchError::NotConfigured("storage.remote section is missing".to_string())
            })?;
            Ok(Arc::new(SftpDispatcher::new(remote)))
        }
    }
}

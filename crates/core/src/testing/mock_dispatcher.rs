//! Mock storage dispatcher for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::dispatch::{
    DispatchError, DispatchRequest, DispatchResult, StorageDispatcher, StorageMode,
};

/// A recorded dispatch for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub request: DispatchRequest,
    pub success: bool,
}

/// Mock implementation of the StorageDispatcher trait.
///
/// A successful dispatch removes the staged files, like a real move would.
/// Failures leave them in place.
#[derive(Debug, Default)]
pub struct MockDispatcher {
    dispatches: Arc<RwLock<Vec<RecordedDispatch>>>,
    /// If set, the next dispatch fails with this error.
    next_error: Arc<RwLock<Option<DispatchError>>>,
    /// Every dispatch fails with a retryable remote error.
    fail_always: AtomicBool,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_dispatches(&self) -> Vec<RecordedDispatch> {
        self.dispatches.read().await.clone()
    }

    /// Number of successful dispatches.
    pub async fn dispatch_count(&self) -> usize {
        self.dispatches
            .read()
            .await
            .iter()
            .filter(|d| d.success)
            .count()
    }

    pub async fn set_next_error(&self, error: DispatchError) {
        *self.next_error.write().await = Some(error);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    async fn take_error(&self) -> Option<DispatchError> {
        if let Some(err) = self.next_error.write().await.take() {
            return Some(err);
        }
        self.fail_always.load(Ordering::SeqCst).then(|| DispatchError::Remote {
            host: "mock".to_string(),
            code: Some(255),
            stderr: "Connection refused".to_string(),
        })
    }
}

#[async_trait]
impl StorageDispatcher for MockDispatcher {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError> {
        if let Some(err) = self.take_error().await {
            self.dispatches.write().await.push(RecordedDispatch {
                request: request.clone(),
                success: false,
            });
            return Err(err);
        }

        let mut files = 0;
        for path in request.files() {
            let _ = tokio::fs::remove_file(path).await;
            files += 1;
        }

        self.dispatches.write().await.push(RecordedDispatch {
            request: request.clone(),
            success: true,
        });

        Ok(DispatchResult {
            mode: StorageMode::Local,
            destination: format!(
                "mock://{}/{}",
                request.relative_dir().display(),
                request.artifact.image_id
            ),
            files,
            bytes: request.artifact.bytes,
        })
    }
}

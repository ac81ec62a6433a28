//! Download engine implementation.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DownloadArtifact, DownloadConfig, DownloadError};
use crate::activation::ActiveAsset;
use crate::metrics;
use crate::provider::ImageryProvider;
use crate::retry::RetryConfig;

/// Streams active assets to staging with verification and bounded retry.
pub struct DownloadEngine {
    provider: Arc<dyn ImageryProvider>,
    config: DownloadConfig,
    retry: RetryConfig,
}

/// Removes the in-progress file unless disarmed.
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
    }
}

/// In-progress path for a destination: `<dest>.part`.
pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

impl DownloadEngine {
    pub fn new(
        provider: Arc<dyn ImageryProvider>,
        config: DownloadConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download `asset` to `dest`, retrying transient failures.
    ///
    /// On success `dest` holds the complete file. On every failure path, including
    /// cancellation, no partial file remains.
    pub async fn download(
        &self,
        asset: &ActiveAsset,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadArtifact, DownloadError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(DownloadError::Cancelled),
                r = tokio::time::timeout(self.config.timeout(), self.attempt(asset, dest)) => {
                    r.unwrap_or(Err(DownloadError::Timeout { secs: self.config.timeout_secs }))
                }
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(artifact) => {
                    metrics::DOWNLOADS_TOTAL.with_label_values(&["success"]).inc();
                    metrics::DOWNLOAD_DURATION
                        .with_label_values(&["success"])
                        .observe(elapsed);
                    return Ok(artifact);
                }
                Err(e) => {
                    // A dropped attempt may not have run its guard to completion.
                    remove_if_present(&part_path(dest)).await;

                    let label = if matches!(e, DownloadError::Cancelled) {
                        "cancelled"
                    } else {
                        "failed"
                    };
                    metrics::DOWNLOADS_TOTAL.with_label_values(&[label]).inc();
                    metrics::DOWNLOAD_DURATION
                        .with_label_values(&[label])
                        .observe(elapsed);

                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        image_id = %asset.image_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Download failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        asset: &ActiveAsset,
        dest: &Path,
    ) -> Result<DownloadArtifact, DownloadError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let stream = self.provider.open_download(&asset.location).await?;
        let declared_len = stream.content_length;

        let part = part_path(dest);
        let mut guard = PartFile::new(part.clone());
        let file = File::create(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        let mut writer = BufWriter::with_capacity(self.config.chunk_size, file);

        debug!(
            image_id = %asset.image_id,
            path = %part.display(),
            declared_len,
            "Downloading"
        );

        let mut context = md5::Context::new();
        let mut bytes = 0u64;
        let mut body = stream.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            context.consume(&chunk);
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(&part, e))?;
            bytes += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        metrics::DOWNLOAD_BYTES.inc_by(bytes);

        let md5 = format!("{:x}", context.compute());
        let verified = self.verify(asset, declared_len, bytes, &md5)?;

        fs::rename(&part, dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;
        guard.disarm();

        info!(
            image_id = %asset.image_id,
            path = %dest.display(),
            bytes,
            verified,
            "Download complete"
        );

        Ok(DownloadArtifact {
            image_id: asset.image_id.clone(),
            path: dest.to_path_buf(),
            bytes,
            md5,
            verified,
        })
    }

    /// Check completeness. Returns whether every declared property was confirmed.
    fn verify(
        &self,
        asset: &ActiveAsset,
        declared_len: Option<u64>,
        bytes: u64,
        md5: &str,
    ) -> Result<bool, DownloadError> {
        if bytes == 0 {
            return Err(DownloadError::Empty {
                image_id: asset.image_id.clone(),
            });
        }

        let mut verified = true;
        match declared_len {
            Some(expected) if expected != bytes => {
                return Err(DownloadError::LengthMismatch {
                    image_id: asset.image_id.clone(),
                    expected,
                    actual: bytes,
                });
            }
            Some(_) => {}
            None => verified = false,
        }

        match (&asset.md5_digest, self.config.verify_checksum) {
            (Some(expected), true) => {
                if !expected.eq_ignore_ascii_case(md5) {
                    return Err(DownloadError::ChecksumMismatch {
                        image_id: asset.image_id.clone(),
                        expected: expected.clone(),
                        actual: md5.to_string(),
                    });
                }
            }
            _ => verified = false,
        }

        Ok(verified)
    }
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

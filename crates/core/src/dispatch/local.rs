//! Local archive dispatcher.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use super::config::StorageMode;
use super::error::DispatchError;
use super::traits::StorageDispatcher;
use super::types::{DispatchRequest, DispatchResult};
use crate::metrics;

const COPY_BUFFER: usize = 256 * 1024;

/// Places artifacts under a local archive root.
pub struct LocalArchiveDispatcher {
    root: PathBuf,
}

impl LocalArchiveDispatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rename, or `Ok(false)` when source and destination are on different filesystems.
    async fn try_atomic_move(source: &Path, destination: &Path) -> Result<bool, std::io::Error> {
        match fs::rename(source, destination).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // EXDEV is 18 on Linux
                if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Copy `source` to `destination`, returning (bytes, sha256 of what was read).
    async fn copy_file(source: &Path, destination: &Path) -> Result<(u64, String), DispatchError> {
        let source_file = File::open(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DispatchError::SourceNotFound {
                    path: source.to_path_buf(),
                }
            } else {
                DispatchError::Io(e)
            }
        })?;
        let dest_file = File::create(destination).await.map_err(|e| {
            DispatchError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e)
        })?;

        let mut reader = BufReader::with_capacity(COPY_BUFFER, source_file);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER, dest_file);
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;
        let mut buffer = vec![0u8; COPY_BUFFER];

        loop {
            let bytes_read = reader.read(&mut buffer).await.map_err(|e| {
                DispatchError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e)
            })?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            writer.write_all(&buffer[..bytes_read]).await.map_err(|e| {
                DispatchError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e)
            })?;
            total_bytes += bytes_read as u64;
        }

        writer.flush().await.map_err(|e| {
            DispatchError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e)
        })?;
        writer.get_ref().sync_all().await.map_err(|e| {
            DispatchError::copy_failed(source.to_path_buf(), destination.to_path_buf(), e)
        })?;

        Ok((total_bytes, format!("{:x}", hasher.finalize())))
    }

    async fn sha256_of(path: &Path) -> Result<String, DispatchError> {
        let file = File::open(path).await?;
        let mut reader = BufReader::with_capacity(COPY_BUFFER, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn ensure_dir(path: &Path) -> Result<(), DispatchError> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| DispatchError::DirectoryCreationFailed {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Move one file into `dest_dir`. Returns the destination and its size.
    async fn place_file(source: &Path, dest_dir: &Path) -> Result<(PathBuf, u64), DispatchError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| DispatchError::SourceNotFound {
                path: source.to_path_buf(),
            })?;
        let destination = dest_dir.join(file_name);

        if fs::metadata(source).await.is_err() {
            return Err(DispatchError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }

        if fs::metadata(&destination).await.is_ok() {
            // A previous run may have placed the file and died before cleaning up staging.
            let existing = Self::sha256_of(&destination).await?;
            let incoming = Self::sha256_of(source).await?;
            if existing != incoming {
                return Err(DispatchError::DestinationExists { path: destination });
            }
            debug!(path = %destination.display(), "Identical file already archived");
            let size = fs::metadata(&destination).await?.len();
            Self::remove_source(source).await;
            return Ok((destination, size));
        }

        if Self::try_atomic_move(source, &destination)
            .await
            .map_err(|e| DispatchError::move_failed(source.to_path_buf(), destination.clone(), e))?
        {
            let size = fs::metadata(&destination).await?.len();
            return Ok((destination, size));
        }

        debug!(
            source = %source.display(),
            destination = %destination.display(),
            "Cross-device move, copying"
        );
        let (size, expected) = match Self::copy_file(source, &destination).await {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&destination).await;
                return Err(e);
            }
        };
        let actual = Self::sha256_of(&destination).await?;
        if actual != expected {
            let _ = fs::remove_file(&destination).await;
            return Err(DispatchError::ChecksumMismatch {
                path: destination,
                expected,
                actual,
            });
        }
        Self::remove_source(source).await;
        Ok((destination, size))
    }

    /// Size of a sidecar moved by an earlier attempt whose artifact move then failed.
    async fn already_placed(source: &Path, dest_dir: &Path) -> Option<u64> {
        if fs::metadata(source).await.is_ok() {
            return None;
        }
        let destination = dest_dir.join(source.file_name()?);
        let meta = fs::metadata(&destination).await.ok()?;
        debug!(path = %destination.display(), "Sidecar already archived");
        Some(meta.len())
    }

    async fn remove_source(source: &Path) {
        if let Err(e) = fs::remove_file(source).await {
            // Already placed; a stale staging file is harmless.
            warn!("Failed to remove staged file {}: {}", source.display(), e);
        }
    }

    async fn place(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError> {
        let dest_dir = self.root.join(request.relative_dir());
        Self::ensure_dir(&dest_dir).await?;

        let mut files = 0;
        let mut bytes = 0;

        // Sidecars first, so the artifact's arrival marks a complete placement.
        for sidecar in &request.sidecars {
            let size = match Self::already_placed(sidecar, &dest_dir).await {
                Some(size) => size,
                None => Self::place_file(sidecar, &dest_dir).await?.1,
            };
            files += 1;
            bytes += size;
        }
        let (destination, size) = Self::place_file(&request.artifact.path, &dest_dir).await?;
        files += 1;
        bytes += size;

        Ok(DispatchResult {
            mode: StorageMode::Local,
            destination: destination.display().to_string(),
            files,
            bytes,
        })
    }
}

#[async_trait]
impl StorageDispatcher for LocalArchiveDispatcher {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError> {
        match self.place(request).await {
            Ok(result) => {
                metrics::DISPATCHES_TOTAL
                    .with_label_values(&["local", "success"])
                    .inc();
                info!(
                    image_id = %request.artifact.image_id,
                    destination = %result.destination,
                    files = result.files,
                    "Archived locally"
                );
                Ok(result)
            }
            Err(e) => {
                metrics::DISPATCHES_TOTAL
                    .with_label_values(&["local", "failed"])
                    .inc();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadArtifact;
    use crate::planner::Season;
    use tempfile::TempDir;

    async fn staged(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).await.unwrap();
        path
    }

    fn request(path: PathBuf, image_id: &str) -> DispatchRequest {
        DispatchRequest::new(
            DownloadArtifact {
                image_id: image_id.to_string(),
                path,
                bytes: 0,
                md5: String::new(),
                verified: true,
            },
            "B27",
            2021,
            Season::Secas,
        )
    }

    #[tokio::test]
    async fn test_dispatch_moves_into_layout() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let path = staged(staging.path(), "img1.tif", b"raster").await;

        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let result = dispatcher.dispatch(&request(path.clone(), "img1")).await.unwrap();

        let expected = archive.path().join("B27/2021/secas/img1.tif");
        assert_eq!(result.mode, StorageMode::Local);
        assert_eq!(result.destination, expected.display().to_string());
        assert_eq!(result.files, 1);
        assert_eq!(result.bytes, 6);
        assert_eq!(fs::read(&expected).await.unwrap(), b"raster");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dispatch_moves_sidecars() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let path = staged(staging.path(), "img1.tif", b"raster").await;
        let xml = staged(staging.path(), "img1.xml", b"<meta/>").await;

        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let result = dispatcher
            .dispatch(&request(path, "img1").with_sidecars(vec![xml.clone()]))
            .await
            .unwrap();

        assert_eq!(result.files, 2);
        assert!(archive.path().join("B27/2021/secas/img1.xml").exists());
        assert!(!xml.exists());
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite_different_file() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let dest_dir = archive.path().join("B27/2021/secas");
        fs::create_dir_all(&dest_dir).await.unwrap();
        fs::write(dest_dir.join("img1.tif"), b"older").await.unwrap();
        let path = staged(staging.path(), "img1.tif", b"newer").await;

        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let err = dispatcher.dispatch(&request(path.clone(), "img1")).await.unwrap_err();

        assert!(matches!(err, DispatchError::DestinationExists { .. }));
        assert!(!err.is_retryable());
        assert!(path.exists());
        assert_eq!(fs::read(dest_dir.join("img1.tif")).await.unwrap(), b"older");
    }

    #[tokio::test]
    async fn test_identical_existing_file_is_accepted() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let dest_dir = archive.path().join("B27/2021/secas");
        fs::create_dir_all(&dest_dir).await.unwrap();
        fs::write(dest_dir.join("img1.tif"), b"same").await.unwrap();
        let path = staged(staging.path(), "img1.tif", b"same").await;

        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let result = dispatcher.dispatch(&request(path.clone(), "img1")).await.unwrap();

        assert_eq!(result.bytes, 4);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let archive = TempDir::new().unwrap();
        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let err = dispatcher
            .dispatch(&request(PathBuf::from("/nonexistent/img1.tif"), "img1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_copy_file_hashes_content() {
        let dir = TempDir::new().unwrap();
        let source = staged(dir.path(), "a.bin", b"hello").await;
        let dest = dir.path().join("b.bin");

        let (bytes, sha) = LocalArchiveDispatcher::copy_file(&source, &dest).await.unwrap();

        assert_eq!(bytes, 5);
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(LocalArchiveDispatcher::sha256_of(&dest).await.unwrap(), sha);
    }

    #[tokio::test]
    async fn test_retry_after_partial_placement_accepts_archived_sidecar() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let dest_dir = archive.path().join("B27/2021/secas");
        fs::create_dir_all(&dest_dir).await.unwrap();
        // The earlier attempt moved the sidecar, then failed on the artifact.
        fs::write(dest_dir.join("img1.xml"), b"<meta/>").await.unwrap();
        let path = staged(staging.path(), "img1.tif", b"raster").await;
        let xml = staging.path().join("img1.xml");

        let dispatcher = LocalArchiveDispatcher::new(archive.path());
        let result = dispatcher
            .dispatch(&request(path, "img1").with_sidecars(vec![xml]))
            .await
            .unwrap();

        assert_eq!(result.files, 2);
        assert_eq!(result.bytes, 13);
        assert_eq!(fs::read(dest_dir.join("img1.tif")).await.unwrap(), b"raster");
    }
}

//! Configuration for the download engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory for in-progress and verified downloads.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Write buffer size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Attempts per image, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single attempt in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Compare the provider's MD5 digest with the downloaded bytes.
    #[serde(default = "default_verify_checksum")]
    pub verify_checksum: bool,

    /// File extension of downloaded products.
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout() -> u64 {
    3600 // 1 hour
}

fn default_verify_checksum() -> bool {
    true
}

fn default_extension() -> String {
    "tif".to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout(),
            verify_checksum: default_verify_checksum(),
            extension: default_extension(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Staging destination for an image: `<staging>/<quadrant>/<image_id>.<ext>`.
    pub fn staging_path(&self, quadrant_id: &str, image_id: &str) -> PathBuf {
        staging_path_in(&self.staging_dir, quadrant_id, image_id, &self.extension)
    }
}

fn staging_path_in(root: &Path, quadrant_id: &str, image_id: &str, extension: &str) -> PathBuf {
    root.join(quadrant_id)
        .join(format!("{}.{}", image_id, extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.max_attempts, 3);
        assert!(config.verify_checksum);
    }

    #[test]
    fn test_staging_path() {
        let config = DownloadConfig {
            staging_dir: PathBuf::from("/tmp/staging"),
            ..Default::default()
        };
        assert_eq!(
            config.staging_path("B27", "20210304_170212_64_2262"),
            PathBuf::from("/tmp/staging/B27/20210304_170212_64_2262.tif")
        );
    }
}

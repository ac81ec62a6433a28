//! Configuration for storage dispatch.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where verified downloads end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Archive directory on this machine.
    #[default]
    Local,
    /// Remote host over SFTP.
    Remote,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::Remote => "remote",
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub mode: StorageMode,

    /// Local archive root.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Remote settings (required when mode = "remote").
    #[serde(default)]
    pub remote: Option<RemoteStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            archive_dir: default_archive_dir(),
            remote: None,
        }
    }
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("planet_images")
}

/// SFTP target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    /// Private key passed with `-i`. Password authentication is not supported in batch mode.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Remote archive root.
    pub remote_dir: String,

    /// Path to the sftp client.
    #[serde(default = "default_sftp_binary")]
    pub sftp_binary: PathBuf,

    /// Extra `-o` options, e.g. "StrictHostKeyChecking=accept-new".
    #[serde(default)]
    pub ssh_options: Vec<String>,

    /// Timeout for one transfer session in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_sftp_binary() -> PathBuf {
    PathBuf::from("sftp")
}

fn default_timeout() -> u64 {
    1800 // 30 minutes
}

impl RemoteStorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_storage_config() {
        let config = StorageConfig::default();
        assert_eq!(config.mode, StorageMode::Local);
        assert_eq!(config.archive_dir, PathBuf::from("planet_images"));
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_deserialize_remote_defaults() {
        let toml = r#"
host = "nas.local"
username = "planet"
remote_dir = "/srv/imagery"
"#;
        let remote: RemoteStorageConfig = toml::from_str(toml).unwrap();
        assert_eq!(remote.port, 22);
        assert_eq!(remote.sftp_binary, PathBuf::from("sftp"));
        assert!(remote.identity_file.is_none());
        assert!(remote.ssh_options.is_empty());
        assert_eq!(remote.timeout_secs, 1800);
    }
}

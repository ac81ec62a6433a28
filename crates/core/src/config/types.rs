use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::activation::ActivationConfig;
use crate::dispatch::{StorageConfig, StorageMode};
use crate::download::DownloadConfig;
use crate::provider::ProviderConfig;
use crate::retry::RetryConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Acquisition parameters shared by every run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcquisitionConfig {
    /// Minimum visible (clear) percentage, 0-100.
    #[serde(default = "default_visibility_min")]
    pub visibility_min: f64,
    /// Maximum cloud cover percentage, 0-100.
    #[serde(default = "default_cloud_cover_max")]
    pub cloud_cover_max: f64,
    #[serde(default = "default_year_start")]
    pub year_start: i32,
    #[serde(default = "default_year_end")]
    pub year_end: i32,
    /// Split each year into rainy/dry windows instead of one full-year window.
    #[serde(default)]
    pub seasonal: bool,
    /// Quadrant-window units processed concurrently.
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,
    /// Consecutive units failing on an exhausted transient provider error before the run aborts.
    #[serde(default = "default_connectivity_failure_threshold")]
    pub connectivity_failure_threshold: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            visibility_min: default_visibility_min(),
            cloud_cover_max: default_cloud_cover_max(),
            year_start: default_year_start(),
            year_end: default_year_end(),
            seasonal: false,
            max_concurrent_units: default_max_concurrent_units(),
            connectivity_failure_threshold: default_connectivity_failure_threshold(),
        }
    }
}

fn default_visibility_min() -> f64 {
    90.0
}

fn default_cloud_cover_max() -> f64 {
    10.0
}

fn default_year_start() -> i32 {
    2020
}

fn default_year_end() -> i32 {
    2023
}

fn default_max_concurrent_units() -> usize {
    4
}

fn default_connectivity_failure_threshold() -> u32 {
    5
}

/// Registry (SQLite) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("pathrow.db")
}

/// Metrics output for batch runs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Write the text exposition format here after each run.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Sanitized config for logging (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub provider: SanitizedProviderConfig,
    pub acquisition: AcquisitionConfig,
    pub activation: ActivationConfig,
    pub download: DownloadConfig,
    pub storage: SanitizedStorageConfig,
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
}

/// Provider config with the API key hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedProviderConfig {
    pub base_url: String,
    pub api_key_configured: bool,
    pub item_type: String,
    pub product_types: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedStorageConfig {
    pub mode: StorageMode,
    pub archive_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            provider: SanitizedProviderConfig {
                base_url: config.provider.base_url.clone(),
                api_key_configured: !config.provider.api_key.is_empty(),
                item_type: config.provider.item_type.clone(),
                product_types: config.provider.product_types.clone(),
                timeout_secs: config.provider.timeout_secs,
            },
            acquisition: config.acquisition.clone(),
            activation: config.activation.clone(),
            download: config.download.clone(),
            storage: SanitizedStorageConfig {
                mode: config.storage.mode,
                archive_dir: config.storage.archive_dir.clone(),
                remote_host: config.storage.remote.as_ref().map(|r| r.host.clone()),
                remote_dir: config.storage.remote.as_ref().map(|r| r.remote_dir.clone()),
            },
            registry: config.registry.clone(),
            retry: config.retry.clone(),
            metrics: config.metrics.clone(),
        }
    }
}

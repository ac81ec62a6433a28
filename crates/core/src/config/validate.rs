use super::{types::Config, ConfigError};
use crate::dispatch::StorageMode;

/// Validate configuration before any work starts.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let acq = &config.acquisition;

    if acq.year_start > acq.year_end {
        return Err(ConfigError::ValidationError(format!(
            "acquisition.year_start ({}) must not be after acquisition.year_end ({})",
            acq.year_start, acq.year_end
        )));
    }
    check_percentage("acquisition.visibility_min", acq.visibility_min)?;
    check_percentage("acquisition.cloud_cover_max", acq.cloud_cover_max)?;

    if acq.max_concurrent_units == 0 {
        return Err(ConfigError::ValidationError(
            "acquisition.max_concurrent_units cannot be 0".to_string(),
        ));
    }
    if acq.connectivity_failure_threshold == 0 {
        return Err(ConfigError::ValidationError(
            "acquisition.connectivity_failure_threshold cannot be 0".to_string(),
        ));
    }

    if config.provider.product_types.is_empty() {
        return Err(ConfigError::ValidationError(
            "provider.product_types must name at least one product type".to_string(),
        ));
    }
    if config.provider.base_url.is_empty() {
        return Err(ConfigError::ValidationError(
            "provider.base_url cannot be empty".to_string(),
        ));
    }

    if config.activation.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "activation.poll_interval_ms cannot be 0".to_string(),
        ));
    }
    if config.download.chunk_size == 0 {
        return Err(ConfigError::ValidationError(
            "download.chunk_size cannot be 0".to_string(),
        ));
    }
    if config.download.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "download.max_attempts cannot be 0".to_string(),
        ));
    }

    if config.storage.mode == StorageMode::Remote && config.storage.remote.is_none() {
        return Err(ConfigError::ValidationError(
            "storage.mode = \"remote\" requires a [storage.remote] section".to_string(),
        ));
    }

    Ok(())
}

fn check_percentage(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be within [0, 100], got {value}"
        )));
    }
    Ok(())
}

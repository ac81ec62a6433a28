use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Environment variable consulted when `provider.api_key` is not configured.
pub const API_KEY_ENV: &str = "PL_API_KEY";

/// Load configuration from file with environment variable overrides.
///
/// Nested keys use a double underscore, e.g. `PATHROW_ACQUISITION__YEAR_START=2021`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let mut config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("PATHROW_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    apply_api_key_fallback(&mut config, std::env::var(API_KEY_ENV).ok());
    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn apply_api_key_fallback(config: &mut Config, env_key: Option<String>) {
    if config.provider.api_key.is_empty() {
        if let Some(key) = env_key.filter(|k| !k.is_empty()) {
            config.provider.api_key = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[acquisition]
year_start = 2019
year_end = 2022

[registry]
path = "/tmp/registry.db"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.acquisition.year_start, 2019);
        assert_eq!(config.registry.path.to_str().unwrap(), "/tmp/registry.db");
    }

    #[test]
    fn test_load_config_from_str_bad_mode() {
        let toml = r#"
[storage]
mode = "ftp"
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/pathrow.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[provider]
api_key = "from-file"

[acquisition]
seasonal = true
cloud_cover_max = 20.0
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.provider.api_key, "from-file");
        assert!(config.acquisition.seasonal);
        assert_eq!(config.acquisition.cloud_cover_max, 20.0);
    }

    #[test]
    fn test_api_key_fallback_only_when_missing() {
        let mut config = Config::default();
        apply_api_key_fallback(&mut config, Some("from-env".to_string()));
        assert_eq!(config.provider.api_key, "from-env");

        config.provider.api_key = "configured".to_string();
        apply_api_key_fallback(&mut config, Some("from-env".to_string()));
        assert_eq!(config.provider.api_key, "configured");
    }

    #[test]
    fn test_api_key_fallback_ignores_empty_env() {
        let mut config = Config::default();
        apply_api_key_fallback(&mut config, Some(String::new()));
        assert!(config.provider.api_key.is_empty());
    }
}

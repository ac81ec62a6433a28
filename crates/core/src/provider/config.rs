//! Provider connection settings.

use serde::{Deserialize, Serialize};

/// Imagery provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Data API root (e.g., "https://api.planet.com/data/v1").
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key, sent as the basic-auth username. Falls back to `PL_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Item type searched (default: "PSScene").
    #[serde(default = "default_item_type")]
    pub item_type: String,
    /// Product (asset) types in priority order.
    #[serde(default = "default_product_types")]
    pub product_types: Vec<String>,
    /// Timeout for search, asset and activation requests in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            item_type: default_item_type(),
            product_types: default_product_types(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.planet.com/data/v1".to_string()
}

fn default_item_type() -> String {
    "PSScene".to_string()
}

fn default_product_types() -> Vec<String> {
    vec![
        "ortho_analytic_8b_sr".to_string(),
        "ortho_analytic_4b_sr".to_string(),
    ]
}

fn default_timeout() -> u64 {
    60
}

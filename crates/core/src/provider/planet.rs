//! Planet Data API backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{
    AssetInfo, AssetListing, AssetStatus, DownloadStream, ImageryProvider, ProviderConfig,
    ProviderError, SearchCandidate, SearchRequest,
};
use crate::metrics;

/// Planet Data API v1 client.
pub struct PlanetClient {
    client: Client,
    config: ProviderConfig,
}

impl PlanetClient {
    /// Create a new PlanetClient with the given configuration.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        // No overall timeout on the client: downloads can run for minutes and are bounded by the
        // download engine. Short requests get `timeout_secs` each.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.config.api_key, Some(""))
            .timeout(Duration::from_secs(self.config.timeout_secs))
    }

    /// Build the quick-search body.
    ///
    /// `clear_percent` is reported on a 0-100 scale while `cloud_cover` is a fraction.
    fn build_search_body(&self, request: &SearchRequest) -> Value {
        json!({
            "item_types": [self.config.item_type],
            "filter": {
                "type": "AndFilter",
                "config": [
                    {
                        "type": "GeometryFilter",
                        "field_name": "geometry",
                        "config": request.geometry,
                    },
                    {
                        "type": "DateRangeFilter",
                        "field_name": "acquired",
                        "config": {
                            "gte": request.window.start_rfc3339(),
                            "lte": request.window.end_rfc3339(),
                        }
                    },
                    {
                        "type": "RangeFilter",
                        "field_name": "cloud_cover",
                        "config": { "lte": request.cloud_cover_max }
                    },
                    {
                        "type": "RangeFilter",
                        "field_name": "clear_percent",
                        "config": { "gte": request.visibility_min * 100.0 }
                    }
                ]
            }
        })
    }

    async fn send(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response, ProviderError> {
        let result = builder.send().await.map_err(map_reqwest_error);
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                metrics::PROVIDER_REQUESTS
                    .with_label_values(&[endpoint, "error"])
                    .inc();
                return Err(e);
            }
        };

        if !response.status().is_success() {
            metrics::PROVIDER_REQUESTS
                .with_label_values(&[endpoint, "http_error"])
                .inc();
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status,
                body: body.chars().take(200).collect(),
            });
        }

        metrics::PROVIDER_REQUESTS
            .with_label_values(&[endpoint, "success"])
            .inc();
        Ok(response)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_connect() {
        ProviderError::Connection(e.to_string())
    } else if e.is_body() || e.is_decode() {
        ProviderError::Stream(e.to_string())
    } else if e.is_request() {
        ProviderError::Connection(e.to_string())
    } else {
        ProviderError::Client(e.to_string())
    }
}

#[async_trait]
impl ImageryProvider for PlanetClient {
    fn name(&self) -> &str {
        "planet"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchCandidate>, ProviderError> {
        let url = format!("{}/quick-search", self.base_url());
        debug!(
            quadrant = %request.quadrant_id,
            window = %request.window,
            "Searching Planet"
        );

        let builder = self.authed(self.client.post(&url)).json(&self.build_search_body(request));
        let response = self.send("search", builder).await?;

        // Only the first page is read; the pipeline consumes the top-ranked candidate.
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("Failed to parse search response: {}", e)))?;

        let candidates: Vec<SearchCandidate> =
            body.features.into_iter().map(SearchCandidate::from).collect();
        metrics::SEARCH_CANDIDATES.observe(candidates.len() as f64);

        debug!(
            quadrant = %request.quadrant_id,
            results = candidates.len(),
            "Planet search complete"
        );
        Ok(candidates)
    }

    fn item_assets_url(&self, image_id: &str) -> String {
        format!(
            "{}/item-types/{}/items/{}/assets/",
            self.base_url(),
            urlencoding::encode(&self.config.item_type),
            urlencoding::encode(image_id)
        )
    }

    async fn assets(&self, assets_url: &str) -> Result<AssetListing, ProviderError> {
        let response = self
            .send("assets", self.authed(self.client.get(assets_url)))
            .await?;
        let raw: HashMap<String, RawAsset> = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("Failed to parse asset listing: {}", e)))?;

        Ok(raw
            .into_iter()
            .map(|(product_type, asset)| {
                let info = AssetInfo {
                    product_type: product_type.clone(),
                    status: AssetStatus::parse(&asset.status),
                    activate_url: asset.links.activate,
                    location: asset.location,
                    md5_digest: asset.md5_digest,
                };
                (product_type, info)
            })
            .collect())
    }

    async fn activate(&self, activate_url: &str) -> Result<(), ProviderError> {
        // 202 on first trigger, 204 once already active; both are success.
        self.send("activate", self.authed(self.client.get(activate_url)))
            .await?;
        Ok(())
    }

    async fn open_download(&self, location: &str) -> Result<DownloadStream, ProviderError> {
        // The location is a signed URL; no credentials are attached.
        let response = self.send("download", self.client.get(location)).await?;
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProviderError::Stream(e.to_string())))
            .boxed();

        Ok(DownloadStream {
            content_length,
            body,
        })
    }
}

// Response types

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    features: Vec<SearchFeature>,
}

#[derive(Debug, Deserialize)]
struct SearchFeature {
    id: String,
    properties: FeatureProperties,
    #[serde(rename = "_links")]
    links: FeatureLinks,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    acquired: DateTime<Utc>,
    #[serde(default)]
    cloud_cover: f64,
    /// Percentage, 0-100.
    #[serde(default)]
    clear_percent: f64,
}

#[derive(Debug, Deserialize)]
struct FeatureLinks {
    assets: String,
}

impl From<SearchFeature> for SearchCandidate {
    fn from(f: SearchFeature) -> Self {
        Self {
            image_id: f.id,
            acquired: f.properties.acquired,
            cloud_cover: f.properties.cloud_cover,
            visibility: f.properties.clear_percent / 100.0,
            assets_url: f.links.assets,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    #[serde(default)]
    status: String,
    #[serde(rename = "_links", default)]
    links: RawAssetLinks,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    md5_digest: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAssetLinks {
    #[serde(default)]
    activate: Option<String>,
}

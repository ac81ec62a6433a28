//! Mock imagery provider for testing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::fixtures;
use crate::provider::{
    AssetInfo, AssetListing, AssetStatus, DownloadStream, ImageryProvider, ProviderError,
    SearchCandidate, SearchRequest,
};

const ASSETS_PREFIX: &str = "mock://assets/";
const ACTIVATE_PREFIX: &str = "mock://activate/";
const DOWNLOAD_PREFIX: &str = "mock://download/";
const CHUNK: usize = 1024;

#[derive(Debug, Default)]
struct MockImage {
    /// Listings served by successive asset reads; the last one repeats.
    script: VecDeque<AssetListing>,
    body: Bytes,
    reads: usize,
    /// Remaining downloads that fail half way.
    interrupts: u32,
    /// Downloads hang after the first chunk.
    stall: bool,
}

/// Mock implementation of the ImageryProvider trait.
///
/// Provides controllable behavior for testing:
/// - Canned search results per quadrant, filtered by the requested window
/// - Scripted asset status sequences per image
/// - Injected transient failures for search and asset reads
/// - Interrupted or stalled download streams
///
/// # Example
///
/// ```rust,ignore
/// use pathrow_core::testing::{fixtures, MockProvider};
///
/// let provider = MockProvider::new();
/// provider.add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")]).await;
/// provider.add_image("img-1", "ortho_analytic_8b_sr", b"raster").await;
/// ```
#[derive(Debug, Default)]
pub struct MockProvider {
    search_results: Arc<RwLock<HashMap<String, Vec<SearchCandidate>>>>,
    searches: Arc<RwLock<Vec<SearchRequest>>>,
    search_calls: AtomicUsize,
    search_failures: Arc<RwLock<VecDeque<ProviderError>>>,
    images: Arc<RwLock<HashMap<String, MockImage>>>,
    asset_failures: Arc<RwLock<VecDeque<ProviderError>>>,
    activations: Arc<RwLock<Vec<String>>>,
    downloads: Arc<RwLock<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates returned for a quadrant, in ranking order.
    pub async fn add_search_results(&self, quadrant_id: &str, candidates: Vec<SearchCandidate>) {
        self.search_results
            .write()
            .await
            .entry(quadrant_id.to_string())
            .or_default()
            .extend(candidates);
    }

    /// The next `count` searches fail with `error`.
    pub async fn fail_next_searches(&self, error: ProviderError, count: usize) {
        let mut failures = self.search_failures.write().await;
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    pub async fn recorded_searches(&self) -> Vec<SearchRequest> {
        self.searches.read().await.clone()
    }

    /// Number of search calls, failed ones included.
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// An image whose single product is already active.
    pub async fn add_image(&self, image_id: &str, product_type: &str, body: &[u8]) {
        self.add_image_with_statuses(image_id, product_type, &[AssetStatus::Active], body)
            .await;
    }

    /// An image whose product reports `statuses` on successive reads.
    pub async fn add_image_with_statuses(
        &self,
        image_id: &str,
        product_type: &str,
        statuses: &[AssetStatus],
        body: &[u8],
    ) {
        let script = statuses
            .iter()
            .map(|status| {
                let active = *status == AssetStatus::Active;
                fixtures::listing(vec![AssetInfo {
                    product_type: product_type.to_string(),
                    status: *status,
                    activate_url: Some(format!("{}{}/{}", ACTIVATE_PREFIX, image_id, product_type)),
                    location: active.then(|| format!("{}{}", DOWNLOAD_PREFIX, image_id)),
                    md5_digest: active.then(|| fixtures::md5_hex(body)),
                }])
            })
            .collect();
        let mut images = self.images.write().await;
        let image = images.entry(image_id.to_string()).or_default();
        image.script = script;
        image.body = Bytes::copy_from_slice(body);
    }

    /// Replace the listing script for an image.
    pub async fn set_listing(&self, image_id: &str, listings: Vec<AssetListing>) {
        let mut images = self.images.write().await;
        images.entry(image_id.to_string()).or_default().script = listings.into();
    }

    /// The next `count` asset reads fail with `error`.
    pub async fn fail_next_asset_reads(&self, error: ProviderError, count: usize) {
        let mut failures = self.asset_failures.write().await;
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Successful asset reads for an image.
    pub async fn asset_reads(&self, image_id: &str) -> usize {
        self.images
            .read()
            .await
            .get(image_id)
            .map(|i| i.reads)
            .unwrap_or(0)
    }

    /// Activation URLs requested, in order.
    pub async fn activation_requests(&self) -> Vec<String> {
        self.activations.read().await.clone()
    }

    /// The next `count` downloads of an image break off half way.
    pub async fn interrupt_downloads(&self, image_id: &str, count: u32) {
        let mut images = self.images.write().await;
        images.entry(image_id.to_string()).or_default().interrupts = count;
    }

    /// Downloads of an image deliver one chunk and then hang.
    pub async fn stall_downloads(&self, image_id: &str) {
        let mut images = self.images.write().await;
        images.entry(image_id.to_string()).or_default().stall = true;
    }

    /// Download locations opened, in order.
    pub async fn download_calls(&self) -> Vec<String> {
        self.downloads.read().await.clone()
    }
}

fn not_found(what: &str) -> ProviderError {
    ProviderError::Status {
        status: 404,
        body: format!("{} not found", what),
    }
}

#[async_trait]
impl ImageryProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchCandidate>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.searches.write().await.push(request.clone());

        if let Some(err) = self.search_failures.write().await.pop_front() {
            return Err(err);
        }

        let results = self.search_results.read().await;
        Ok(results
            .get(&request.quadrant_id)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|c| request.window.contains_date(c.acquired.date_naive()))
                    .filter(|c| c.cloud_cover <= request.cloud_cover_max)
                    .filter(|c| c.visibility >= request.visibility_min)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn item_assets_url(&self, image_id: &str) -> String {
        fixtures::assets_url(image_id)
    }

    async fn assets(&self, assets_url: &str) -> Result<AssetListing, ProviderError> {
        if let Some(err) = self.asset_failures.write().await.pop_front() {
            return Err(err);
        }

        let image_id = assets_url
            .strip_prefix(ASSETS_PREFIX)
            .ok_or_else(|| ProviderError::Client(format!("unexpected url {}", assets_url)))?;
        let mut images = self.images.write().await;
        let image = images.get_mut(image_id).ok_or_else(|| not_found(image_id))?;
        image.reads += 1;

        let listing = if image.script.len() > 1 {
            image.script.pop_front()
        } else {
            image.script.front().cloned()
        };
        Ok(listing.unwrap_or_default())
    }

    async fn activate(&self, activate_url: &str) -> Result<(), ProviderError> {
        self.activations.write().await.push(activate_url.to_string());
        Ok(())
    }

    async fn open_download(&self, location: &str) -> Result<DownloadStream, ProviderError> {
        self.downloads.write().await.push(location.to_string());

        let image_id = location
            .strip_prefix(DOWNLOAD_PREFIX)
            .ok_or_else(|| ProviderError::Client(format!("unexpected url {}", location)))?;
        let mut images = self.images.write().await;
        let image = images.get_mut(image_id).ok_or_else(|| not_found(image_id))?;

        let body = image.body.clone();
        let content_length = Some(body.len() as u64);
        let chunks: Vec<Result<Bytes, ProviderError>> = body
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let stream = if image.stall {
            stream::iter(chunks.into_iter().take(1))
                .chain(stream::pending())
                .boxed()
        } else if image.interrupts > 0 {
            image.interrupts -= 1;
            let half = chunks.len() / 2;
            stream::iter(chunks.into_iter().take(half))
                .chain(stream::once(async {
                    Err(ProviderError::Stream("connection reset by peer".to_string()))
                }))
                .boxed()
        } else {
            stream::iter(chunks).boxed()
        };

        Ok(DownloadStream {
            content_length,
            body: stream,
        })
    }
}

//! Search with bounded retry.

use std::sync::Arc;
use tracing::{debug, info};

use super::{ImageryProvider, ProviderError, SearchCandidate, SearchRequest};
use crate::planner::TimeWindow;
use crate::quadrant::Quadrant;
use crate::retry::{with_backoff, RetryConfig};

/// Issues one filtered search per (quadrant, window), retrying transient failures.
#[derive(Clone)]
pub struct SearchClient {
    provider: Arc<dyn ImageryProvider>,
    retry: RetryConfig,
}

impl SearchClient {
    pub fn new(provider: Arc<dyn ImageryProvider>, retry: RetryConfig) -> Self {
        Self { provider, retry }
    }

    /// Search `quadrant` within `window`.
    ///
    /// Thresholds are percentages in [0, 100] as configured. Candidates are returned in the
    /// provider's rank order.
    pub async fn search(
        &self,
        quadrant: &Quadrant,
        window: &TimeWindow,
        cloud_cover_max_pct: f64,
        visibility_min_pct: f64,
    ) -> Result<Vec<SearchCandidate>, ProviderError> {
        let request = SearchRequest {
            quadrant_id: quadrant.id.clone(),
            geometry: quadrant.geometry.clone(),
            window: window.clone(),
            cloud_cover_max: cloud_cover_max_pct / 100.0,
            visibility_min: visibility_min_pct / 100.0,
        };

        let provider = &self.provider;
        let request = &request;
        let candidates = with_backoff(&self.retry, "search", |_| async move {
            provider.search(request).await
        })
        .await?;

        if candidates.is_empty() {
            info!(
                quadrant = %quadrant.id,
                window = %window,
                "No images found"
            );
        } else {
            debug!(
                quadrant = %quadrant.id,
                window = %window,
                count = candidates.len(),
                "Images found"
            );
        }
        Ok(candidates)
    }

    /// The first-ranked candidate, if any. Later candidates are ignored.
    pub async fn first_candidate(
        &self,
        quadrant: &Quadrant,
        window: &TimeWindow,
        cloud_cover_max_pct: f64,
        visibility_min_pct: f64,
    ) -> Result<Option<SearchCandidate>, ProviderError> {
        Ok(self
            .search(quadrant, window, cloud_cover_max_pct, visibility_min_pct)
            .await?
            .into_iter()
            .next())
    }
}

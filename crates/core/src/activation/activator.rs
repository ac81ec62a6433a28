//! Activation state machine driver.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ActivationConfig, ActivationError, ActivationState, ActiveAsset};
use crate::metrics;
use crate::provider::{AssetInfo, AssetListing, AssetStatus, ImageryProvider, ProviderError};

/// Drives one image's product from unknown to active.
pub struct Activator {
    provider: Arc<dyn ImageryProvider>,
    config: ActivationConfig,
    /// Product types in priority order.
    product_types: Vec<String>,
}

/// Per-image bookkeeping for one activation.
struct Session<'a> {
    image_id: &'a str,
    state: ActivationState,
    started: Instant,
    consecutive_errors: u32,
}

impl Session<'_> {
    fn transition(&mut self, next: ActivationState) {
        if self.state != next {
            debug!(
                image_id = %self.image_id,
                from = %self.state,
                to = %next,
                "Activation state change"
            );
            self.state = next;
        }
    }
}

impl Activator {
    pub fn new(
        provider: Arc<dyn ImageryProvider>,
        config: ActivationConfig,
        product_types: Vec<String>,
    ) -> Self {
        Self {
            provider,
            config,
            product_types,
        }
    }

    /// Activate the best available product of `image_id` and wait until it is downloadable.
    pub async fn activate(
        &self,
        image_id: &str,
        assets_url: &str,
        cancel: &CancellationToken,
    ) -> Result<ActiveAsset, ActivationError> {
        let mut session = Session {
            image_id,
            state: ActivationState::Unknown,
            started: Instant::now(),
            consecutive_errors: 0,
        };

        let result = self.run(&mut session, assets_url, cancel).await;
        match &result {
            Ok(asset) => {
                session.transition(ActivationState::Active);
                metrics::ACTIVATIONS_TOTAL
                    .with_label_values(&["active"])
                    .inc();
                metrics::ACTIVATION_WAIT.observe(session.started.elapsed().as_secs_f64());
                info!(
                    image_id = %image_id,
                    product_type = %asset.product_type,
                    polls = asset.polls,
                    "Asset active"
                );
            }
            Err(e) => {
                if !e.is_skip() {
                    session.transition(ActivationState::Failed);
                }
                metrics::ACTIVATIONS_TOTAL
                    .with_label_values(&[e.outcome_label()])
                    .inc();
            }
        }
        result
    }

    async fn run(
        &self,
        session: &mut Session<'_>,
        assets_url: &str,
        cancel: &CancellationToken,
    ) -> Result<ActiveAsset, ActivationError> {
        let listing = self.read_listing(session, assets_url, cancel).await?;
        let asset = self.select_product(session.image_id, &listing)?;

        if let Some(active) = ready(session.image_id, &asset, 0) {
            return Ok(active);
        }

        let activate_url =
            asset
                .activate_url
                .clone()
                .ok_or_else(|| ActivationError::MissingLink {
                    image_id: session.image_id.to_string(),
                    product_type: asset.product_type.clone(),
                    link: "activate",
                })?;

        info!(
            image_id = %session.image_id,
            product_type = %asset.product_type,
            status = %asset.status,
            "Requesting activation"
        );
        self.request_activation(session, &activate_url, cancel)
            .await?;
        session.transition(ActivationState::Activating);

        let product_type = asset.product_type;
        let mut polls = 0u32;
        loop {
            let waited = session.started.elapsed();
            if polls >= self.config.max_polls || waited >= self.config.max_wait() {
                warn!(
                    image_id = %session.image_id,
                    polls,
                    waited_secs = waited.as_secs(),
                    "Activation timed out"
                );
                return Err(ActivationError::Timeout {
                    image_id: session.image_id.to_string(),
                    polls,
                    waited_secs: waited.as_secs(),
                });
            }

            let remaining = self.config.max_wait().saturating_sub(waited);
            self.pause(session.image_id, self.config.poll_interval().min(remaining), cancel)
                .await?;

            polls += 1;
            metrics::ACTIVATION_POLLS.inc();
            let listing = self.read_listing(session, assets_url, cancel).await?;
            let Some(current) = listing.get(&product_type) else {
                return Err(ActivationError::NoProduct {
                    image_id: session.image_id.to_string(),
                });
            };

            if let Some(active) = ready(session.image_id, current, polls) {
                return Ok(active);
            }
            debug!(
                image_id = %session.image_id,
                status = %current.status,
                polls,
                "Still activating"
            );
        }
    }

    /// First configured product type present in the listing.
    fn select_product(
        &self,
        image_id: &str,
        listing: &AssetListing,
    ) -> Result<AssetInfo, ActivationError> {
        for (rank, product_type) in self.product_types.iter().enumerate() {
            if let Some(asset) = listing.get(product_type) {
                if rank > 0 {
                    info!(
                        image_id = %image_id,
                        product_type = %product_type,
                        "Primary product unavailable, using fallback"
                    );
                }
                return Ok(asset.clone());
            }
        }
        info!(
            image_id = %image_id,
            wanted = ?self.product_types,
            "None of the product types is available, skipping image"
        );
        Err(ActivationError::NoProduct {
            image_id: image_id.to_string(),
        })
    }

    /// Fetch the listing, absorbing transient errors within the error budget.
    async fn read_listing(
        &self,
        session: &mut Session<'_>,
        assets_url: &str,
        cancel: &CancellationToken,
    ) -> Result<AssetListing, ActivationError> {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(session.image_id)),
                r = self.provider.assets(assets_url) => r,
            };
            match result {
                Ok(listing) => {
                    session.consecutive_errors = 0;
                    return Ok(listing);
                }
                Err(e) => self.absorb_error(session, e, cancel).await?,
            }
        }
    }

    async fn request_activation(
        &self,
        session: &mut Session<'_>,
        activate_url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ActivationError> {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(session.image_id)),
                r = self.provider.activate(activate_url) => r,
            };
            match result {
                Ok(()) => {
                    session.consecutive_errors = 0;
                    return Ok(());
                }
                Err(e) => self.absorb_error(session, e, cancel).await?,
            }
        }
    }

    /// Count a provider error against the budget; return `Err` when it is spent or permanent.
    async fn absorb_error(
        &self,
        session: &mut Session<'_>,
        error: ProviderError,
        cancel: &CancellationToken,
    ) -> Result<(), ActivationError> {
        session.consecutive_errors += 1;
        if !error.is_retryable() || session.consecutive_errors > self.config.error_budget {
            return Err(ActivationError::Failed {
                image_id: session.image_id.to_string(),
                source: error,
            });
        }
        warn!(
            image_id = %session.image_id,
            errors = session.consecutive_errors,
            budget = self.config.error_budget,
            error = %error,
            "Provider error during activation, retrying"
        );
        self.pause(session.image_id, self.config.poll_interval(), cancel)
            .await
    }

    async fn pause(
        &self,
        image_id: &str,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ActivationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled(image_id)),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn cancelled(image_id: &str) -> ActivationError {
    ActivationError::Cancelled {
        image_id: image_id.to_string(),
    }
}

/// The asset as `ActiveAsset` if it can be downloaded now.
fn ready(image_id: &str, asset: &AssetInfo, polls: u32) -> Option<ActiveAsset> {
    match (&asset.status, &asset.location) {
        (AssetStatus::Active, Some(location)) => Some(ActiveAsset {
            image_id: image_id.to_string(),
            product_type: asset.product_type.clone(),
            location: location.clone(),
            md5_digest: asset.md5_digest.clone(),
            polls,
        }),
        _ => None,
    }
}

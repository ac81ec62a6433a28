//! Testing utilities and mock implementations.
//!
//! Mocks for the two external seams of the pipeline, the imagery provider and
//! the storage dispatcher, so the whole flow can run without network or a
//! remote host.
//!
//! # Example
//!
//! ```rust,ignore
//! use pathrow_core::testing::{fixtures, MockDispatcher, MockProvider};
//!
//! let provider = MockProvider::new();
//! provider.add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")]).await;
//! provider.add_image("img-1", "ortho_analytic_8b_sr", &fixtures::image_bytes(2048)).await;
//!
//! let dispatcher = MockDispatcher::new();
//! dispatcher.set_fail_always(true);
//! ```

mod mock_dispatcher;
mod mock_provider;

pub use mock_dispatcher::{MockDispatcher, RecordedDispatch};
pub use mock_provider::MockProvider;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::NaiveDate;

    use crate::activation::ActiveAsset;
    use crate::provider::{AssetInfo, AssetListing, SearchCandidate};
    use crate::quadrant::Quadrant;

    /// Asset listing URL the mock provider understands.
    pub fn assets_url(image_id: &str) -> String {
        format!("mock://assets/{}", image_id)
    }

    /// A candidate acquired at 15:00 UTC on `date` (YYYY-MM-DD), well within default thresholds.
    pub fn candidate(image_id: &str, date: &str) -> SearchCandidate {
        let acquired = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .expect("fixture date must be YYYY-MM-DD")
            .and_hms_opt(15, 0, 0)
            .expect("valid time")
            .and_utc();
        SearchCandidate {
            image_id: image_id.to_string(),
            acquired,
            cloud_cover: 0.05,
            visibility: 0.95,
            assets_url: assets_url(image_id),
        }
    }

    /// A small quadrant around Mexico City.
    pub fn quadrant(id: &str) -> Quadrant {
        Quadrant::from_point(id, 19.43, -99.13).expect("valid fixture coordinates")
    }

    pub fn listing(assets: Vec<AssetInfo>) -> AssetListing {
        assets
            .into_iter()
            .map(|a| (a.product_type.clone(), a))
            .collect()
    }

    /// Deterministic non-trivial bytes.
    pub fn image_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    pub fn md5_hex(body: &[u8]) -> String {
        format!("{:x}", md5::compute(body))
    }

    /// The active asset the mock provider would hand out for `body`.
    pub fn active_asset(image_id: &str, product_type: &str, body: &[u8]) -> ActiveAsset {
        ActiveAsset {
            image_id: image_id.to_string(),
            product_type: product_type.to_string(),
            location: format!("mock://download/{}", image_id),
            md5_digest: Some(md5_hex(body)),
            polls: 0,
        }
    }
}

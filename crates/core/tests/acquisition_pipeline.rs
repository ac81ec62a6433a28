//! End-to-end acquisition runs against mock collaborators.
//!
//! The registry is a real SQLite file and local dispatch moves real files; only the imagery
//! provider (and, where failure injection is needed, the dispatcher) are mocked.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pathrow_core::activation::ActivationConfig;
use pathrow_core::orchestrator::FailureStage;
use pathrow_core::provider::{AssetStatus, ProviderError};
use pathrow_core::testing::{fixtures, MockDispatcher, MockProvider};
use pathrow_core::{
    AbortReason, AcquisitionOrchestrator, AcquisitionRegistry, AcquisitionRequest, Config,
    LocalArchiveDispatcher, NewRecord, RecordQuery, RetryConfig, Season, SqliteRegistry,
    StorageDispatcher,
};

const PRIMARY: &str = "ortho_analytic_8b_sr";
const FALLBACK: &str = "ortho_analytic_4b_sr";

struct TestHarness {
    provider: Arc<MockProvider>,
    registry: Arc<SqliteRegistry>,
    config: Config,
    temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let registry = Arc::new(
            SqliteRegistry::new(&temp_dir.path().join("registry.db"))
                .expect("Failed to create registry"),
        );

        let mut config = Config::default();
        config.download.staging_dir = temp_dir.path().join("staging");
        config.download.max_attempts = 3;
        config.activation = ActivationConfig {
            poll_interval_ms: 1,
            max_polls: 10,
            max_wait_secs: 30,
            error_budget: 2,
        };
        config.retry = RetryConfig::immediate(2);
        config.acquisition.max_concurrent_units = 2;
        config.acquisition.connectivity_failure_threshold = 3;

        Self {
            provider: Arc::new(MockProvider::new()),
            registry,
            config,
            temp_dir,
        }
    }

    fn archive_dir(&self) -> PathBuf {
        self.temp_dir.path().join("archive")
    }

    fn staging_dir(&self) -> PathBuf {
        self.temp_dir.path().join("staging")
    }

    fn local_dispatcher(&self) -> Arc<dyn StorageDispatcher> {
        Arc::new(LocalArchiveDispatcher::new(self.archive_dir()))
    }

    fn orchestrator(&self, dispatcher: Arc<dyn StorageDispatcher>) -> AcquisitionOrchestrator {
        AcquisitionOrchestrator::new(
            &self.config,
            Arc::clone(&self.provider) as _,
            Arc::clone(&self.registry) as Arc<dyn AcquisitionRegistry>,
            dispatcher,
        )
    }

    fn request(&self, quadrant_ids: &[&str], seasonal: bool) -> AcquisitionRequest {
        AcquisitionRequest {
            quadrants: quadrant_ids.iter().map(|id| fixtures::quadrant(id)).collect(),
            year_start: 2021,
            year_end: 2021,
            seasonal,
            cloud_cover_max: 10.0,
            visibility_min: 90.0,
        }
    }
}

/// Regular files under `dir`, recursively.
fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[tokio::test]
async fn test_first_candidate_is_acquired_and_second_ignored() {
    let h = TestHarness::new();
    let body = fixtures::image_bytes(10_000);
    h.provider
        .add_search_results(
            "B27",
            vec![
                fixtures::candidate("img-1", "2021-03-04"),
                fixtures::candidate("img-2", "2021-05-10"),
            ],
        )
        .await;
    h.provider.add_image("img-1", PRIMARY, &body).await;
    h.provider.add_image("img-2", PRIMARY, &body).await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.aborted.is_none());

    let records = h
        .registry
        .records_for(&RecordQuery::Quadrant("B27".into()))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].image_id, "img-1");
    assert!(records[0].downloaded);
    assert_eq!(records[0].season, Season::Completo);
    assert_eq!(records[0].product_type.as_deref(), Some(PRIMARY));
    assert!(h.registry.get("img-2").unwrap().is_none());

    let archived = h.archive_dir().join("B27/2021/completo/img-1.tif");
    assert_eq!(std::fs::read(&archived).unwrap(), body);
    assert!(files_under(&h.staging_dir()).is_empty());
    assert_eq!(
        h.provider.download_calls().await,
        vec!["mock://download/img-1".to_string()]
    );
}

#[tokio::test]
async fn test_activation_polls_until_active_then_downloads_once() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-08-20")])
        .await;
    h.provider
        .add_image_with_statuses(
            "img-1",
            PRIMARY,
            &[
                AssetStatus::Inactive,
                AssetStatus::Inactive,
                AssetStatus::Inactive,
                AssetStatus::Active,
            ],
            &fixtures::image_bytes(2048),
        )
        .await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    assert_eq!(h.provider.activation_requests().await.len(), 1);
    assert_eq!(h.provider.download_calls().await.len(), 1);
    assert!(h.registry.get("img-1").unwrap().unwrap().downloaded);
}

#[tokio::test]
async fn test_fallback_product_is_used() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", FALLBACK, &fixtures::image_bytes(512))
        .await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    let record = h.registry.get("img-1").unwrap().unwrap();
    assert_eq!(record.product_type.as_deref(), Some(FALLBACK));
}

#[tokio::test]
async fn test_image_without_products_is_skipped_and_not_registered() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", "ortho_visual", &fixtures::image_bytes(512))
        .await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert!(h.registry.get("img-1").unwrap().is_none());
    assert!(h.provider.download_calls().await.is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_leaves_record_pending_then_resumes() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", PRIMARY, &fixtures::image_bytes(4096))
        .await;

    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.set_fail_always(true);
    let orchestrator = h.orchestrator(dispatcher.clone());

    let summary = orchestrator
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Dispatch);
    assert_eq!(summary.failures[0].image_id.as_deref(), Some("img-1"));
    let record = h.registry.get("img-1").unwrap().unwrap();
    assert!(!record.downloaded);
    // Retried with backoff before giving up.
    assert_eq!(dispatcher.recorded_dispatches().await.len(), 2);
    assert!(!h.staging_dir().join("B27/img-1.tif").exists());
    assert!(files_under(&h.staging_dir()).is_empty());

    dispatcher.set_fail_always(false);
    let summary = orchestrator
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    assert!(h.registry.get("img-1").unwrap().unwrap().downloaded);
    assert_eq!(dispatcher.dispatch_count().await, 1);
    assert_eq!(h.provider.download_calls().await.len(), 2);
    assert!(files_under(&h.staging_dir()).is_empty());
}

#[tokio::test]
async fn test_rerun_makes_no_new_downloads_or_dispatches() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", PRIMARY, &fixtures::image_bytes(4096))
        .await;
    let dispatcher = Arc::new(MockDispatcher::new());
    let orchestrator = h.orchestrator(dispatcher.clone());

    let first = orchestrator
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.acquired, 1);
    let searches = h.provider.search_calls();

    let second = orchestrator
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.acquired, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.provider.download_calls().await.len(), 1);
    assert_eq!(dispatcher.recorded_dispatches().await.len(), 1);
    assert_eq!(h.provider.search_calls(), searches);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_interrupted_download_leaves_no_partial_file() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", PRIMARY, &fixtures::image_bytes(8192))
        .await;
    h.provider.interrupt_downloads("img-1", 10).await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Download);
    assert!(summary.failures[0].transient);
    assert_eq!(h.provider.download_calls().await.len(), 3);
    assert!(files_under(&h.staging_dir()).is_empty());
    assert!(files_under(&h.archive_dir()).is_empty());
    assert!(!h.registry.get("img-1").unwrap().unwrap().downloaded);
}

#[tokio::test]
async fn test_connectivity_loss_aborts_run() {
    let mut h = TestHarness::new();
    h.config.acquisition.max_concurrent_units = 1;
    h.provider
        .fail_next_searches(ProviderError::Connection("unreachable".into()), 1_000)
        .await;
    let ids = ["Q1", "Q2", "Q3", "Q4", "Q5", "Q6", "Q7", "Q8", "Q9", "Q10"];

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&ids, false), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        summary.aborted,
        Some(AbortReason::ConnectivityLost { .. })
    ));
    assert!(summary.failed >= 3);
    assert!(summary.failed < 10);
    assert!(summary.cancelled > 0);
    assert_eq!(summary.total(), 10);
    assert!(summary.failures.iter().all(|f| f.transient));
}

#[tokio::test]
async fn test_non_transient_failures_do_not_abort() {
    let mut h = TestHarness::new();
    h.config.acquisition.max_concurrent_units = 1;
    h.provider
        .fail_next_searches(
            ProviderError::Status {
                status: 400,
                body: "bad filter".into(),
            },
            1_000,
        )
        .await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["Q1", "Q2", "Q3", "Q4", "Q5"], false), CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.aborted.is_none());
    assert_eq!(summary.failed, 5);
    assert!(summary.failures.iter().all(|f| !f.transient));
}

#[tokio::test]
async fn test_run_pending_acquires_registered_records() {
    let h = TestHarness::new();
    let record = |id: &str, quadrant: &str, downloaded: bool| NewRecord {
        image_id: id.to_string(),
        quadrant_id: quadrant.to_string(),
        acquired: NaiveDate::from_ymd_opt(2020, 7, 14).unwrap(),
        cloud_cover: 0.02,
        visibility: 0.97,
        product_type: None,
        season: Season::Lluvias,
        downloaded,
    };
    let inserted = h
        .registry
        .bulk_load(&[
            record("img-a", "B27", false),
            record("img-b", "B27", true),
            record("img-c", "C10", false),
        ])
        .unwrap();
    assert_eq!(inserted, 3);
    let body = fixtures::image_bytes(3000);
    h.provider.add_image("img-a", PRIMARY, &body).await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run_pending(&["B27".to_string()], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    assert_eq!(summary.total(), 1);
    assert_eq!(
        h.provider.download_calls().await,
        vec!["mock://download/img-a".to_string()]
    );
    assert!(h.registry.get("img-a").unwrap().unwrap().downloaded);
    assert!(!h.registry.get("img-c").unwrap().unwrap().downloaded);
    assert_eq!(
        std::fs::read(h.archive_dir().join("B27/2020/lluvias/img-a.tif")).unwrap(),
        body
    );
    assert_eq!(h.provider.search_calls(), 0);
}

#[tokio::test]
async fn test_seasonal_run_searches_every_window() {
    let h = TestHarness::new();
    h.provider
        .add_search_results(
            "B27",
            vec![
                fixtures::candidate("img-wet", "2021-07-01"),
                fixtures::candidate("img-dry-early", "2021-03-01"),
                fixtures::candidate("img-dry-late", "2021-11-15"),
            ],
        )
        .await;
    for id in ["img-wet", "img-dry-early", "img-dry-late"] {
        h.provider
            .add_image(id, PRIMARY, &fixtures::image_bytes(1024))
            .await;
    }

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], true), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 3);
    let searches = h.provider.recorded_searches().await;
    assert_eq!(searches.len(), 3);
    let archive = h.archive_dir().join("B27/2021");
    assert!(archive.join("lluvias/img-wet.tif").exists());
    assert!(archive.join("secas/img-dry-early.tif").exists());
    assert!(archive.join("secas/img-dry-late.tif").exists());
}

#[tokio::test]
async fn test_image_shared_by_two_quadrants_is_acquired_once() {
    let mut h = TestHarness::new();
    h.config.acquisition.max_concurrent_units = 1;
    for quadrant in ["B27", "B28"] {
        h.provider
            .add_search_results(quadrant, vec![fixtures::candidate("img-1", "2021-03-04")])
            .await;
    }
    h.provider
        .add_image("img-1", PRIMARY, &fixtures::image_bytes(1024))
        .await;

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27", "B28"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.acquired, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(h.provider.download_calls().await.len(), 1);
    assert_eq!(h.registry.get("img-1").unwrap().unwrap().quadrant_id, "B27");
}

#[tokio::test]
async fn test_cancelled_run_does_no_work() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27", "B28"], false), cancel)
        .await
        .unwrap();

    assert_eq!(summary.aborted, Some(AbortReason::Cancelled));
    assert_eq!(summary.cancelled, 2);
    assert_eq!(h.provider.search_calls(), 0);
}

#[tokio::test]
async fn test_archive_conflict_fails_without_retry_and_clears_staging() {
    let h = TestHarness::new();
    h.provider
        .add_search_results("B27", vec![fixtures::candidate("img-1", "2021-03-04")])
        .await;
    h.provider
        .add_image("img-1", PRIMARY, &fixtures::image_bytes(2048))
        .await;
    let archived = h.archive_dir().join("B27/2021/completo/img-1.tif");
    std::fs::create_dir_all(archived.parent().unwrap()).unwrap();
    std::fs::write(&archived, b"someone else's file").unwrap();

    let summary = h
        .orchestrator(h.local_dispatcher())
        .run(&h.request(&["B27"], false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Dispatch);
    assert!(!summary.failures[0].transient);
    assert_eq!(std::fs::read(&archived).unwrap(), b"someone else's file");
    assert!(files_under(&h.staging_dir()).is_empty());
    assert!(!h.registry.get("img-1").unwrap().unwrap().downloaded);
}

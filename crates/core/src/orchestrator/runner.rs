//! Acquisition run driver.
//!
//! Each (quadrant, window) pair, or each pending registry record, is one unit of work.
//! Units run on a bounded pool; a unit never fails the run, it only lands in the summary.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::types::{
    AbortReason, AcquisitionRequest, FailureStage, OrchestratorError, RunSummary, SkipReason,
    UnitFailure, UnitOutcome,
};
use crate::activation::{ActivationError, Activator};
use crate::config::Config;
use crate::dispatch::{collect_sidecars, DispatchRequest, StorageDispatcher};
use crate::download::{DownloadEngine, DownloadError};
use crate::metrics;
use crate::planner::{Season, TimeWindow, TimeWindowPlanner};
use crate::provider::{ImageryProvider, SearchClient};
use crate::quadrant::Quadrant;
use crate::registry::{
    AcquisitionRecord, AcquisitionRegistry, MarkOutcome, NewRecord, RegisterOutcome,
};
use crate::retry::{with_backoff, RetryConfig};

/// Search thresholds in percent.
#[derive(Debug, Clone, Copy)]
struct Criteria {
    cloud_cover_max: f64,
    visibility_min: f64,
}

enum Unit {
    Window {
        quadrant: Arc<Quadrant>,
        window: TimeWindow,
        criteria: Criteria,
    },
    Pending(AcquisitionRecord),
}

/// Where a unit came from, for failure reports.
struct UnitContext {
    quadrant_id: String,
    window: Option<String>,
}

impl UnitContext {
    fn fail(
        &self,
        image_id: Option<&str>,
        stage: FailureStage,
        error: impl Display,
        transient: bool,
    ) -> UnitOutcome {
        UnitOutcome::Failed(UnitFailure {
            quadrant_id: self.quadrant_id.clone(),
            window: self.window.clone(),
            image_id: image_id.map(str::to_string),
            stage,
            error: error.to_string(),
            transient,
        })
    }
}

/// An image chosen for acquisition, from search or from the registry.
struct ImageJob {
    image_id: String,
    quadrant_id: String,
    assets_url: String,
    acquired: NaiveDate,
    cloud_cover: f64,
    visibility: f64,
    season: Season,
    year: i32,
    /// A record already exists; skip registration.
    registered: bool,
}

/// Removes an image from the in-flight set when the unit is done with it.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    image_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.image_id);
    }
}

/// Shared by every unit of a run.
struct Pipeline {
    provider: Arc<dyn ImageryProvider>,
    search: SearchClient,
    activator: Activator,
    downloader: DownloadEngine,
    dispatcher: Arc<dyn StorageDispatcher>,
    registry: Arc<dyn AcquisitionRegistry>,
    dispatch_retry: RetryConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl Pipeline {
    fn claim(&self, image_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(image_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            image_id: image_id.to_string(),
        })
    }

    async fn run_unit(&self, unit: Unit, cancel: CancellationToken) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::Cancelled;
        }
        match unit {
            Unit::Window {
                quadrant,
                window,
                criteria,
            } => self.run_window(&quadrant, &window, criteria, &cancel).await,
            Unit::Pending(record) => self.run_record(record, &cancel).await,
        }
    }

    async fn run_window(
        &self,
        quadrant: &Quadrant,
        window: &TimeWindow,
        criteria: Criteria,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let ctx = UnitContext {
            quadrant_id: quadrant.id.clone(),
            window: Some(format!("{} {}", window.year, window)),
        };

        match self.registry.covering(&quadrant.id, window) {
            Ok(Some(record)) => {
                debug!(
                    quadrant = %quadrant.id,
                    window = %window,
                    image_id = %record.image_id,
                    "Window already covered"
                );
                return UnitOutcome::Skipped(SkipReason::WindowCovered);
            }
            Ok(None) => {}
            Err(e) => return ctx.fail(None, FailureStage::Registry, e, false),
        }

        let searched = tokio::select! {
            _ = cancel.cancelled() => return UnitOutcome::Cancelled,
            r = self.search.first_candidate(
                quadrant,
                window,
                criteria.cloud_cover_max,
                criteria.visibility_min,
            ) => r,
        };
        let candidate = match searched {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return UnitOutcome::Empty,
            Err(e) => {
                let transient = e.is_retryable();
                return ctx.fail(None, FailureStage::Search, e, transient);
            }
        };
        info!(
            quadrant = %quadrant.id,
            window = %window,
            image_id = %candidate.image_id,
            cloud_cover = candidate.cloud_cover,
            visibility = candidate.visibility,
            "Selected image"
        );

        let registered = match self.registry.get(&candidate.image_id) {
            Ok(Some(record)) if record.downloaded => {
                info!(image_id = %candidate.image_id, "Image already downloaded, skipping");
                return UnitOutcome::Skipped(SkipReason::AlreadyDownloaded);
            }
            Ok(Some(record)) if record.quadrant_id != quadrant.id => {
                info!(
                    image_id = %candidate.image_id,
                    registered_quadrant = %record.quadrant_id,
                    "Image belongs to another quadrant, skipping"
                );
                return UnitOutcome::Skipped(SkipReason::OtherQuadrant);
            }
            Ok(Some(_)) => {
                info!(image_id = %candidate.image_id, "Resuming registered image");
                true
            }
            Ok(None) => false,
            Err(e) => {
                return ctx.fail(Some(&candidate.image_id), FailureStage::Registry, e, false)
            }
        };

        let job = ImageJob {
            quadrant_id: quadrant.id.clone(),
            acquired: candidate.acquired.date_naive(),
            cloud_cover: candidate.cloud_cover,
            visibility: candidate.visibility,
            season: window.season,
            year: window.year,
            registered,
            image_id: candidate.image_id,
            assets_url: candidate.assets_url,
        };
        self.acquire(job, &ctx, cancel).await
    }

    async fn run_record(&self, record: AcquisitionRecord, cancel: &CancellationToken) -> UnitOutcome {
        let ctx = UnitContext {
            quadrant_id: record.quadrant_id.clone(),
            window: None,
        };
        // Another unit may have finished it since the run was planned.
        match self.registry.get(&record.image_id) {
            Ok(Some(current)) if current.downloaded => {
                return UnitOutcome::Skipped(SkipReason::AlreadyDownloaded)
            }
            Ok(_) => {}
            Err(e) => return ctx.fail(Some(&record.image_id), FailureStage::Registry, e, false),
        }

        let job = ImageJob {
            assets_url: self.provider.item_assets_url(&record.image_id),
            year: record.year(),
            image_id: record.image_id,
            quadrant_id: record.quadrant_id,
            acquired: record.acquired,
            cloud_cover: record.cloud_cover,
            visibility: record.visibility,
            season: record.season,
            registered: true,
        };
        self.acquire(job, &ctx, cancel).await
    }

    /// Activate, register, download, dispatch, then mark downloaded.
    async fn acquire(
        &self,
        job: ImageJob,
        ctx: &UnitContext,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let image_id = job.image_id.as_str();
        let Some(_guard) = self.claim(image_id) else {
            debug!(image_id = %image_id, "Image already in flight");
            return UnitOutcome::Skipped(SkipReason::InFlight);
        };

        let asset = match self.activator.activate(image_id, &job.assets_url, cancel).await {
            Ok(asset) => asset,
            Err(ActivationError::Cancelled { .. }) => return UnitOutcome::Cancelled,
            Err(e) if e.is_skip() => return UnitOutcome::Skipped(SkipReason::NoProduct),
            Err(e) => {
                let transient = e.is_transient_exhausted();
                return ctx.fail(Some(image_id), FailureStage::Activation, e, transient);
            }
        };

        if !job.registered {
            let record = NewRecord {
                image_id: job.image_id.clone(),
                quadrant_id: job.quadrant_id.clone(),
                acquired: job.acquired,
                cloud_cover: job.cloud_cover,
                visibility: job.visibility,
                product_type: Some(asset.product_type.clone()),
                season: job.season,
                downloaded: false,
            };
            match self.registry.register(&record) {
                Ok(RegisterOutcome::AlreadyPresent {
                    downloaded: true, ..
                }) => return UnitOutcome::Skipped(SkipReason::AlreadyDownloaded),
                Ok(_) => {}
                Err(e) => return ctx.fail(Some(image_id), FailureStage::Registry, e, false),
            }
        }

        let dest = self
            .downloader
            .config()
            .staging_path(&job.quadrant_id, image_id);
        let artifact = match self.downloader.download(&asset, &dest, cancel).await {
            Ok(artifact) => artifact,
            Err(DownloadError::Cancelled) => return UnitOutcome::Cancelled,
            Err(e) => {
                let transient = e.is_transient_network();
                return ctx.fail(Some(image_id), FailureStage::Download, e, transient);
            }
        };

        let sidecars = match collect_sidecars(&artifact.path, image_id).await {
            Ok(sidecars) => sidecars,
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "Could not list sidecar files");
                Vec::new()
            }
        };
        let request = DispatchRequest::new(artifact, &job.quadrant_id, job.year, job.season)
            .with_sidecars(sidecars);
        let dispatcher = &self.dispatcher;
        let request = &request;
        let placed = match with_backoff(&self.dispatch_retry, "dispatch", |_| async move {
            dispatcher.dispatch(request).await
        })
        .await
        {
            Ok(placed) => placed,
            Err(e) => {
                error!(
                    image_id = %image_id,
                    error = %e,
                    "Dispatch failed, image stays pending"
                );
                // A resume downloads again; the staged copy would only go stale.
                discard_staged(&request.artifact.path).await;
                return ctx.fail(Some(image_id), FailureStage::Dispatch, e, false);
            }
        };

        match self.registry.mark_downloaded(image_id) {
            Ok(MarkOutcome::Marked) => {}
            Ok(MarkOutcome::AlreadyDownloaded) => {
                warn!(image_id = %image_id, "Image was already marked downloaded")
            }
            Err(e) => return ctx.fail(Some(image_id), FailureStage::Registry, e, false),
        }

        info!(
            quadrant = %job.quadrant_id,
            image_id = %image_id,
            product_type = %asset.product_type,
            destination = %placed.destination,
            "Image acquired"
        );
        UnitOutcome::Acquired {
            image_id: job.image_id.clone(),
        }
    }
}

async fn discard_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed undispatched artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged artifact"),
    }
}

/// Folds unit outcomes into the summary and watches for connectivity loss.
struct Tally {
    summary: RunSummary,
    threshold: u32,
    consecutive_transient: u32,
}

impl Tally {
    fn absorb(&mut self, done: Result<UnitOutcome, JoinError>, run_cancel: &CancellationToken) {
        let outcome = done.unwrap_or_else(|e| {
            error!(error = %e, "Unit task panicked");
            UnitOutcome::Failed(UnitFailure {
                quadrant_id: "unknown".to_string(),
                window: None,
                image_id: None,
                stage: FailureStage::Internal,
                error: e.to_string(),
                transient: false,
            })
        });
        metrics::UNITS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();

        match &outcome {
            UnitOutcome::Failed(failure) => {
                warn!(
                    quadrant = %failure.quadrant_id,
                    window = ?failure.window,
                    image_id = ?failure.image_id,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Unit failed"
                );
                if failure.transient {
                    self.consecutive_transient += 1;
                    if self.consecutive_transient >= self.threshold
                        && self.summary.aborted.is_none()
                    {
                        error!(
                            consecutive_failures = self.consecutive_transient,
                            "Provider unreachable, aborting run"
                        );
                        self.summary.aborted = Some(AbortReason::ConnectivityLost {
                            consecutive_failures: self.consecutive_transient,
                        });
                        run_cancel.cancel();
                    }
                } else {
                    self.consecutive_transient = 0;
                }
            }
            UnitOutcome::Cancelled => {}
            _ => self.consecutive_transient = 0,
        }
        self.summary.record(outcome);
    }
}

/// Drives acquisition runs over a bounded worker pool.
pub struct AcquisitionOrchestrator {
    pipeline: Arc<Pipeline>,
    max_concurrent_units: usize,
    connectivity_failure_threshold: u32,
}

impl AcquisitionOrchestrator {
    pub fn new(
        config: &Config,
        provider: Arc<dyn ImageryProvider>,
        registry: Arc<dyn AcquisitionRegistry>,
        dispatcher: Arc<dyn StorageDispatcher>,
    ) -> Self {
        let pipeline = Pipeline {
            search: SearchClient::new(provider.clone(), config.retry.clone()),
            activator: Activator::new(
                provider.clone(),
                config.activation.clone(),
                config.provider.product_types.clone(),
            ),
            downloader: DownloadEngine::new(
                provider.clone(),
                config.download.clone(),
                config.retry.clone(),
            ),
            provider,
            dispatcher,
            registry,
            dispatch_retry: config.retry.clone(),
            in_flight: Mutex::new(HashSet::new()),
        };
        Self {
            pipeline: Arc::new(pipeline),
            max_concurrent_units: config.acquisition.max_concurrent_units.max(1),
            connectivity_failure_threshold: config.acquisition.connectivity_failure_threshold.max(1),
        }
    }

    /// Search-mode run: every quadrant against every planned window.
    pub async fn run(
        &self,
        request: &AcquisitionRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        request.validate()?;

        let criteria = Criteria {
            cloud_cover_max: request.cloud_cover_max,
            visibility_min: request.visibility_min,
        };
        let planner = TimeWindowPlanner::new(request.year_start, request.year_end, request.seasonal);
        let years = (request.year_end - request.year_start + 1) as usize;
        let mut units =
            Vec::with_capacity(request.quadrants.len() * years * planner.windows_per_year());
        for quadrant in &request.quadrants {
            let quadrant = Arc::new(quadrant.clone());
            for window in planner.clone() {
                units.push(Unit::Window {
                    quadrant: quadrant.clone(),
                    window,
                    criteria,
                });
            }
        }
        self.execute("search", units, cancel).await
    }

    /// Catalog-mode run: acquire the registry's pending records for `quadrant_ids`.
    pub async fn run_pending(
        &self,
        quadrant_ids: &[String],
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        let records = self.pipeline.registry.pending_records(quadrant_ids)?;
        let units = records.into_iter().map(Unit::Pending).collect();
        self.execute("pending", units, cancel).await
    }

    async fn execute(
        &self,
        mode: &'static str,
        units: Vec<Unit>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("acquisition_run", run_id = %run_id, mode);
        self.drive(run_id, units, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        run_id: String,
        units: Vec<Unit>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        info!(
            units = units.len(),
            concurrency = self.max_concurrent_units,
            "Starting acquisition run"
        );

        let mut tally = Tally {
            summary: RunSummary::new(run_id),
            threshold: self.connectivity_failure_threshold,
            consecutive_transient: 0,
        };
        let run_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_units));
        let mut tasks = JoinSet::new();
        let mut queue = units.into_iter();

        while let Some(unit) = queue.next() {
            let permit = tokio::select! {
                _ = run_cancel.cancelled() => {
                    tally.summary.record(UnitOutcome::Cancelled);
                    break;
                }
                p = semaphore.clone().acquire_owned() => {
                    p.map_err(|e| OrchestratorError::Internal(e.to_string()))?
                }
            };
            while let Some(done) = tasks.try_join_next() {
                tally.absorb(done, &run_cancel);
            }
            if run_cancel.is_cancelled() {
                tally.summary.record(UnitOutcome::Cancelled);
                break;
            }

            let pipeline = self.pipeline.clone();
            let unit_cancel = run_cancel.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    pipeline.run_unit(unit, unit_cancel).await
                }
                .in_current_span(),
            );
        }
        for _ in queue {
            tally.summary.record(UnitOutcome::Cancelled);
        }
        while let Some(done) = tasks.join_next().await {
            tally.absorb(done, &run_cancel);
        }

        let mut summary = tally.summary;
        if summary.aborted.is_none() && cancel.is_cancelled() {
            summary.aborted = Some(AbortReason::Cancelled);
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        let result = if summary.aborted.is_some() {
            "aborted"
        } else {
            "completed"
        };
        metrics::RUNS_TOTAL.with_label_values(&[result]).inc();
        metrics::RUN_DURATION
            .with_label_values(&[result])
            .observe(started.elapsed().as_secs_f64());
        info!(
            acquired = summary.acquired,
            skipped = summary.skipped,
            empty = summary.empty,
            failed = summary.failed,
            cancelled = summary.cancelled,
            aborted = ?summary.aborted,
            duration_ms = summary.duration_ms,
            "Acquisition run finished"
        );
        Ok(summary)
    }
}

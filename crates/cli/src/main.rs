mod import;
mod metrics;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pathrow_core::{
    create_dispatcher, load_config, validate_config, AcquisitionOrchestrator, AcquisitionRegistry,
    AcquisitionRequest, Config, GeoJsonQuadrants, ImageryProvider, PlanetClient, Quadrant,
    RecordQuery, RunSummary, SanitizedConfig, SqliteRegistry,
};

/// Satellite imagery acquisition for pathrow quadrants.
#[derive(Debug, Parser)]
#[command(name = "pathrow", version, about)]
struct Cli {
    /// Configuration file (default: $PATHROW_CONFIG or ./config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search, activate, download and store imagery for quadrants.
    Run(RunArgs),
    /// Acquire images already registered but not yet downloaded.
    Pending(PendingArgs),
    /// Load a catalog CSV into the registry.
    Import {
        /// CSV file with id_planet, pathrow, fecha, nubosidad, visibilidad, tipo, temporada, descargada.
        csv: PathBuf,
    },
    /// List registry records.
    Query(QueryArgs),
    /// Registry totals.
    Stats,
}

#[derive(Debug, Args)]
struct QuadrantArgs {
    /// GeoJSON FeatureCollection of quadrants with a `pathrow` property.
    #[arg(long)]
    geojson: Option<PathBuf>,

    /// Single quadrant around a coordinate, as LAT,LON.
    #[arg(long, requires = "id", conflicts_with = "geojson", allow_hyphen_values = true)]
    point: Option<String>,

    /// Identifier for --point.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    quadrants: QuadrantArgs,

    #[arg(long)]
    year_start: Option<i32>,

    #[arg(long)]
    year_end: Option<i32>,

    /// Split years into lluvias/secas windows.
    #[arg(long)]
    seasonal: bool,

    /// Maximum cloud cover, percent.
    #[arg(long)]
    cloud_cover_max: Option<f64>,

    /// Minimum visibility, percent.
    #[arg(long)]
    visibility_min: Option<f64>,
}

#[derive(Debug, Args)]
struct PendingArgs {
    /// Quadrant ids to resume.
    quadrant_ids: Vec<String>,

    /// Take quadrant ids from a GeoJSON file instead.
    #[arg(long, conflicts_with = "quadrant_ids")]
    geojson: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long, conflicts_with_all = ["since", "downloaded"])]
    quadrant: Option<String>,

    /// Records acquired on or after this date (YYYY-MM-DD).
    #[arg(long, conflicts_with = "downloaded")]
    since: Option<NaiveDate>,

    #[arg(long)]
    downloaded: Option<bool>,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .or_else(|| std::env::var("PATHROW_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;
    info!(
        config = %serde_json::to_string(&SanitizedConfig::from(&config)).unwrap_or_default(),
        "Configuration loaded"
    );

    let registry: Arc<dyn AcquisitionRegistry> = Arc::new(
        SqliteRegistry::new(&config.registry.path).context("Failed to open registry")?,
    );
    info!("Registry opened at {:?}", config.registry.path);

    match cli.command {
        Command::Run(args) => run_search(&config, registry, args).await,
        Command::Pending(args) => run_pending(&config, registry, args).await,
        Command::Import { csv } => import_catalog(registry.as_ref(), &csv),
        Command::Query(args) => query(registry.as_ref(), args),
        Command::Stats => {
            let stats = registry.stats().context("Failed to read registry stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_quadrants(args: &QuadrantArgs) -> Result<Vec<Quadrant>> {
    if let Some(path) = &args.geojson {
        let quadrants = GeoJsonQuadrants::load(path)
            .with_context(|| format!("Failed to read quadrants from {:?}", path))?;
        info!("Loaded {} quadrants from {:?}", quadrants.len(), path);
        return Ok(quadrants);
    }
    if let (Some(point), Some(id)) = (&args.point, &args.id) {
        let (lat, lon) = parse_point(point)?;
        return Ok(vec![Quadrant::from_point(id.clone(), lat, lon)?]);
    }
    bail!("either --geojson or --point with --id is required")
}

fn parse_point(raw: &str) -> Result<(f64, f64)> {
    let (lat, lon) = raw
        .split_once(',')
        .with_context(|| format!("point must be LAT,LON, got {:?}", raw))?;
    let lat = lat.trim().parse().context("invalid latitude")?;
    let lon = lon.trim().parse().context("invalid longitude")?;
    Ok((lat, lon))
}

/// Provider, dispatcher and orchestrator for a run.
fn build_orchestrator(
    config: &Config,
    registry: Arc<dyn AcquisitionRegistry>,
) -> Result<AcquisitionOrchestrator> {
    if config.provider.api_key.is_empty() {
        bail!("no API key: set provider.api_key or {}", pathrow_core::config::API_KEY_ENV);
    }
    let provider: Arc<dyn ImageryProvider> = Arc::new(
        PlanetClient::new(config.provider.clone()).context("Failed to create provider client")?,
    );
    let dispatcher =
        create_dispatcher(&config.storage).context("Failed to create storage dispatcher")?;
    info!(
        provider = provider.name(),
        storage = config.storage.mode.as_str(),
        "Pipeline ready"
    );
    Ok(AcquisitionOrchestrator::new(
        config, provider, registry, dispatcher,
    ))
}

/// Cancel on Ctrl-C. In-flight downloads are cleaned up, pending records stay pending.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping run");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_search(
    config: &Config,
    registry: Arc<dyn AcquisitionRegistry>,
    args: RunArgs,
) -> Result<ExitCode> {
    let quadrants = load_quadrants(&args.quadrants)?;
    let mut request = AcquisitionRequest::from_config(&config.acquisition, quadrants);
    if let Some(year) = args.year_start {
        request.year_start = year;
    }
    if let Some(year) = args.year_end {
        request.year_end = year;
    }
    if args.seasonal {
        request.seasonal = true;
    }
    if let Some(v) = args.cloud_cover_max {
        request.cloud_cover_max = v;
    }
    if let Some(v) = args.visibility_min {
        request.visibility_min = v;
    }

    let orchestrator = build_orchestrator(config, registry)?;
    let summary = orchestrator.run(&request, cancel_on_interrupt()).await?;
    finish(config, &summary)
}

async fn run_pending(
    config: &Config,
    registry: Arc<dyn AcquisitionRegistry>,
    args: PendingArgs,
) -> Result<ExitCode> {
    let quadrant_ids = match &args.geojson {
        Some(path) => GeoJsonQuadrants::load(path)
            .with_context(|| format!("Failed to read quadrants from {:?}", path))?
            .into_iter()
            .map(|q| q.id)
            .collect(),
        None => args.quadrant_ids,
    };
    if quadrant_ids.is_empty() {
        bail!("no quadrant ids given");
    }

    let with_work = registry.pending_for(&quadrant_ids)?;
    info!(
        requested = quadrant_ids.len(),
        with_pending = with_work.len(),
        "Resuming pending records"
    );
    let quadrant_ids: Vec<String> = with_work.into_iter().collect();

    let orchestrator = build_orchestrator(config, registry)?;
    let summary = orchestrator
        .run_pending(&quadrant_ids, cancel_on_interrupt())
        .await?;
    finish(config, &summary)
}

/// Print the summary, export metrics, and pick the exit code.
fn finish(config: &Config, summary: &RunSummary) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(summary)?);

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = metrics::write_textfile(path) {
            warn!("Failed to write metrics: {:#}", e);
        }
    }

    Ok(if summary.aborted.is_some() {
        ExitCode::from(2)
    } else if summary.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn import_catalog(registry: &dyn AcquisitionRegistry, path: &Path) -> Result<ExitCode> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let records = import::read_catalog(file).with_context(|| format!("Invalid catalog {:?}", path))?;
    let inserted = registry
        .bulk_load(&records)
        .context("Failed to load records")?;
    info!(
        rows = records.len(),
        inserted,
        already_present = records.len() as u32 - inserted,
        "Catalog imported"
    );
    println!("{} of {} records inserted", inserted, records.len());
    Ok(ExitCode::SUCCESS)
}

fn query(registry: &dyn AcquisitionRegistry, args: QueryArgs) -> Result<ExitCode> {
    let query = match (args.quadrant, args.since, args.downloaded) {
        (Some(q), _, _) => RecordQuery::Quadrant(q),
        (_, Some(date), _) => RecordQuery::AcquiredSince(date),
        (_, _, Some(flag)) => RecordQuery::Downloaded(flag),
        _ => bail!("one of --quadrant, --since or --downloaded is required"),
    };
    let records = registry.records_for(&query).context("Query failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:>6}  {:<28} {:<10} {:<10} {:>6} {:>6}  {:<22} {:<9} {}",
        "id", "image_id", "quadrant", "acquired", "cloud", "vis", "product", "season", "downloaded"
    );
    for r in &records {
        println!(
            "{:>6}  {:<28} {:<10} {:<10} {:>6.2} {:>6.2}  {:<22} {:<9} {}",
            r.id,
            r.image_id,
            r.quadrant_id,
            r.acquired,
            r.cloud_cover,
            r.visibility,
            r.product_type.as_deref().unwrap_or("-"),
            r.season,
            r.downloaded
        );
    }
    println!("{} records", records.len());
    Ok(ExitCode::SUCCESS)
}

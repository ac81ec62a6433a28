pub mod activation;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod quadrant;
pub mod registry;
pub mod retry;
pub mod testing;

pub use activation::{ActivationConfig, ActivationError, ActivationState, ActiveAsset, Activator};
pub use config::{
    load_config, load_config_from_str, validate_config, AcquisitionConfig, Config, ConfigError,
    SanitizedConfig,
};
pub use dispatch::{
    create_dispatcher, DispatchError, DispatchRequest, DispatchResult, LocalArchiveDispatcher,
    SftpDispatcher, StorageConfig, StorageDispatcher, StorageMode,
};
pub use download::{DownloadArtifact, DownloadConfig, DownloadEngine, DownloadError};
pub use orchestrator::{
    AbortReason, AcquisitionOrchestrator, AcquisitionRequest, OrchestratorError, RunSummary,
    UnitFailure,
};
pub use planner::{Season, TimeWindow, TimeWindowPlanner};
pub use provider::{ImageryProvider, PlanetClient, ProviderConfig, ProviderError, SearchClient};
pub use quadrant::{GeoJsonQuadrants, Quadrant, QuadrantError};
pub use registry::{
    AcquisitionRecord, AcquisitionRegistry, NewRecord, RecordQuery, RegistryError, SqliteRegistry,
};
pub use retry::{RetryConfig, Retryable};

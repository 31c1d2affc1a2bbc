//! Error types for sluice using snafu.
//!
//! Errors fall into three groups:
//! - [`ItemError`]: a single item could not be processed. Isolated to that
//!   item, reported to the error sink, never fatal to a stage.
//! - [`SetupError`]: the pipeline was wired incorrectly. Returned from
//!   construction, the pipeline refuses to start.
//! - [`PipelineError`] and friends: errors surfaced by the CLI around
//!   configuration, metrics and dead-letter output.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Boxed error type returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============ Item Errors ============

/// Kind of per-item failure, used for metrics labels and failure stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Decode,
    Store,
    Transform,
    RateLimited,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Decode => "decode",
            FailureKind::Store => "store",
            FailureKind::Transform => "transform",
            FailureKind::RateLimited => "rate_limited",
        }
    }
}

/// A failure attributed to a single item.
///
/// `item` identifies the originating input (for example the URL a record was
/// fetched from) so the failure can be traced back after the run.
#[derive(Debug, Clone, PartialEq, Snafu, Serialize, Deserialize)]
#[snafu(visibility(pub))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemError {
    /// The fetch collaborator failed.
    #[snafu(display("Failed to fetch {item}: {message}"))]
    Fetch { item: String, message: String },

    /// The payload could not be decoded into a record.
    #[snafu(display("Failed to decode {item}: {message}"))]
    Decode { item: String, message: String },

    /// The persistence collaborator failed.
    #[snafu(display("Failed to store {item}: {message}"))]
    Store { item: String, message: String },

    /// A user-defined stage rejected the item.
    #[snafu(display("Failed to transform {item}: {message}"))]
    Transform { item: String, message: String },

    /// The rate limiter denied the item under a reject policy.
    #[snafu(display("Rate limit exceeded for {item}"))]
    RateLimited { item: String },
}

impl ItemError {
    /// Identifier of the item this failure is attributed to.
    pub fn item(&self) -> &str {
        match self {
            ItemError::Fetch { item, .. }
            | ItemError::Decode { item, .. }
            | ItemError::Store { item, .. }
            | ItemError::Transform { item, .. }
            | ItemError::RateLimited { item } => item,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ItemError::Fetch { .. } => FailureKind::Fetch,
            ItemError::Decode { .. } => FailureKind::Decode,
            ItemError::Store { .. } => FailureKind::Store,
            ItemError::Transform { .. } => FailureKind::Transform,
            ItemError::RateLimited { .. } => FailureKind::RateLimited,
        }
    }

    /// Build a transform failure from any displayable item and error.
    pub fn transform(item: impl ToString, message: impl ToString) -> Self {
        ItemError::Transform {
            item: item.to_string(),
            message: message.to_string(),
        }
    }
}

// ============ Setup Errors ============

/// Errors detected while wiring a pipeline, before anything runs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SetupError {
    /// A stage was configured with zero workers.
    #[snafu(display("Stage '{stage}' requires at least one worker"))]
    ZeroWorkers { stage: String },

    /// A stage was configured with a zero-capacity output channel.
    #[snafu(display("Stage '{stage}' requires a channel capacity of at least one"))]
    ZeroCapacity { stage: String },

    /// Token bucket refill rate must be positive.
    #[snafu(display("Rate limit must be positive, got {rate}"))]
    InvalidRate { rate: u32 },

    /// Token bucket refill period would round down to zero.
    #[snafu(display("Rate limit {rate} exceeds the maximum of {max} per second"))]
    RateTooHigh { rate: u32, max: u32 },

    /// Token bucket capacity must be able to hold one refill period's tokens.
    #[snafu(display("Rate limit capacity {capacity} is below rate {rate}"))]
    CapacityBelowRate { capacity: u32, rate: u32 },

    /// The token bucket refiller needs a tokio runtime.
    #[snafu(display("Token bucket requires a running tokio runtime"))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },

    /// Pipeline has no source.
    #[snafu(display("Pipeline '{pipeline}' has no source"))]
    MissingSource { pipeline: String },

    /// Pipeline has no stages.
    #[snafu(display("Pipeline '{pipeline}' has no stages"))]
    NoStages { pipeline: String },

    /// Several setup errors were found at once.
    #[snafu(display("Pipeline setup failed:\n{}", errors.join("\n")))]
    MultipleSetupErrors { errors: Vec<String> },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No pipelines were defined across all config sources.
    #[snafu(display("No pipelines configured"))]
    NoPipelines,

    /// A pipeline has an invalid setting.
    #[snafu(display("Pipeline '{pipeline}': {message}"))]
    InvalidPipeline { pipeline: String, message: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Duplicate pipeline keys found across config files.
    #[snafu(display("Duplicate pipeline keys: {}", keys.join(", ")))]
    DuplicatePipelines { keys: Vec<String> },

    /// Failed to read a source items file.
    #[snafu(display("Failed to read items file {}: {source}", path.display()))]
    ReadItems {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,
}

// ============ Dead Letter Errors ============

/// Errors that can occur while writing the dead-letter file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix avoids snafu selector conflicts with other Write/Serialize variants
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to serialize a failure record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to write to the DLQ file.
    #[snafu(display("Failed to write DLQ file {}", path.display()))]
    DlqWrite {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

// ============ Pipeline Errors ============

/// Top-level errors surfaced by the CLI.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Pipeline setup error.
    #[snafu(display("Setup error: {source}"))]
    Setup { source: SetupError },

    /// Failed to open a connector (output file, etc).
    #[snafu(display("Failed to open {}: {source}", path.display()))]
    Connector {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// DLQ error.
    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },

    /// Supervisor task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Maximum failures exceeded.
    #[snafu(display("Maximum failures exceeded: {count} failures"))]
    MaxFailures { count: usize },

    /// One or more workers panicked and lost the items they held.
    #[snafu(display("{count} worker task(s) panicked"))]
    WorkerPanicked { count: usize },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<SetupError> for PipelineError {
    fn from(source: SetupError) -> Self {
        PipelineError::Setup { source }
    }
}

impl From<DlqError> for PipelineError {
    fn from(source: DlqError) -> Self {
        PipelineError::Dlq { source }
    }
}

//! Configuration for the `sluice` binary.
//!
//! A config file declares one or more keyed pipelines plus process-wide
//! settings:
//!
//! ```yaml
//! global:
//!   start_jitter_secs: 2
//! metrics:
//!   address: 0.0.0.0:9090
//! pipelines:
//!   todos:
//!     source:
//!       items_file: ${DATA_DIR}/todos.txt
//!     fetch:
//!       workers: 4
//!     rate_limit:
//!       rate: 50
//!       on_reject: wait
//!     sink:
//!       path: out/todos.ndjson
//!       key_field: id
//!     error_handling:
//!       max_failures: 10
//!       dlq_path: out/failures
//! ```

mod key;
mod loader;
mod path;
mod vars;

pub use key::PipelineKey;
pub use loader::{load_dir, load_file, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::interpolate;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, InvalidPipelineSnafu, MultipleErrorsSnafu, NoPipelinesSnafu, ReadItemsSnafu,
};
use crate::rate_limit::{MAX_RATE, RejectPolicy};
use crate::stage::StageOptions;

/// Complete configuration: every pipeline plus global and metrics settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipelines: IndexMap<PipelineKey, PipelineConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Parse and validate YAML, after environment interpolation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config = loader::parse_unvalidated(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load, merge and validate every config source.
    pub fn load(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        load_from_paths(paths)
    }

    /// Merge `other` into `self`. Pipelines are combined and must not share
    /// keys; non-default global and metrics settings in `other` win.
    pub fn merge(&mut self, other: Config) -> Result<(), ConfigError> {
        loader::merge_pipelines(&mut self.pipelines, other.pipelines)?;
        self.global.merge_from(other.global);
        self.metrics.merge_from(other.metrics);
        Ok(())
    }

    /// Check every pipeline, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.pipelines.is_empty(), NoPipelinesSnafu);

        let mut errors: Vec<ConfigError> = self
            .pipelines
            .iter()
            .filter_map(|(key, pipeline)| pipeline.validate(key).err())
            .collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => MultipleErrorsSnafu {
                errors: errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }
            .fail(),
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// Upper bound of a random delay before each pipeline starts, so many
    /// pipelines do not hit their sources at the same instant.
    #[serde(default)]
    pub start_jitter_secs: u64,
    /// How long to wait for pipelines to stop after a shutdown signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            start_jitter_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl GlobalConfig {
    pub fn start_jitter(&self) -> Duration {
        Duration::from_secs(self.start_jitter_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn merge_from(&mut self, other: GlobalConfig) {
        let defaults = GlobalConfig::default();
        if other.start_jitter_secs != defaults.start_jitter_secs {
            self.start_jitter_secs = other.start_jitter_secs;
        }
        if other.shutdown_timeout_secs != defaults.shutdown_timeout_secs {
            self.shutdown_timeout_secs = other.shutdown_timeout_secs;
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    fn merge_from(&mut self, other: MetricsConfig) {
        let defaults = MetricsConfig::default();
        if other.enabled != defaults.enabled {
            self.enabled = other.enabled;
        }
        if other.address != defaults.address {
            self.address = other.address;
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// One fetch, decode, store pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: StageOptions,
    #[serde(default)]
    pub decode: StageOptions,
    #[serde(default)]
    pub store: StageOptions,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    /// Stop the pipeline after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PipelineConfig {
    fn validate(&self, key: &PipelineKey) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.source.items.is_empty() && self.source.items_file.is_none() {
            problems.push("source needs `items` or `items_file`".to_string());
        }
        if self.sink.path.as_os_str().is_empty() {
            problems.push("sink.path must not be empty".to_string());
        }
        if self.timeout_secs == Some(0) {
            problems.push("timeout_secs must be positive".to_string());
        }

        let mut setup = Vec::new();
        self.fetch.validate("fetch", &mut setup);
        self.decode.validate("decode", &mut setup);
        self.store.validate("store", &mut setup);
        problems.extend(setup.iter().map(ToString::to_string));

        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.rate == 0 {
                problems.push("rate_limit.rate must be positive".to_string());
            } else if rate_limit.rate > MAX_RATE {
                problems.push(format!("rate_limit.rate must be at most {MAX_RATE}"));
            } else if rate_limit.capacity() < rate_limit.rate {
                problems.push(format!(
                    "rate_limit.capacity {} is below rate {}",
                    rate_limit.capacity(),
                    rate_limit.rate
                ));
            }
        }

        ensure!(
            problems.is_empty(),
            InvalidPipelineSnafu {
                pipeline: key.to_string(),
                message: problems.join("; "),
            }
        );
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Where a pipeline's items come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Inline items: file paths or `file://` URLs.
    #[serde(default)]
    pub items: Vec<String>,
    /// A file with one item per line. Blank lines and `#` comments are skipped.
    #[serde(default)]
    pub items_file: Option<PathBuf>,
    /// Directory that relative items are resolved against.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl SourceConfig {
    /// Inline items followed by those from `items_file`.
    pub fn load_items(&self) -> Result<Vec<String>, ConfigError> {
        let mut items = self.items.clone();
        if let Some(path) = &self.items_file {
            items.extend(read_items_file(path)?);
        }
        Ok(items)
    }
}

fn read_items_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = std::fs::read_to_string(path).context(ReadItemsSnafu {
        path: path.to_path_buf(),
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Shared token bucket applied to the fetch and store stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Tokens per second.
    pub rate: u32,
    /// Bucket size; defaults to `rate`.
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub on_reject: RejectPolicy,
}

impl RateLimitConfig {
    pub fn capacity(&self) -> u32 {
        self.capacity.unwrap_or(self.rate)
    }
}

/// NDJSON output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub path: PathBuf,
    /// Field used to skip records already written.
    #[serde(default)]
    pub key_field: Option<String>,
}

/// Failure limits and dead-letter output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHandlingConfig {
    /// Failures before the pipeline aborts itself (0 = unlimited).
    #[serde(default)]
    pub max_failures: usize,
    /// Directory for the dead-letter NDJSON file.
    #[serde(default)]
    pub dlq_path: Option<PathBuf>,
}

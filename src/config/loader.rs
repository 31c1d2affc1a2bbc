//! Loading and merging configuration from files and directories.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use snafu::prelude::*;
use tracing::{debug, info};

use super::path::{ConfigPath, is_yaml_file};
use super::vars::interpolate;
use super::{Config, PipelineConfig, PipelineKey};
use crate::error::{
    ConfigError, DuplicatePipelinesSnafu, MultipleErrorsSnafu, ReadDirSnafu, ReadFileSnafu,
    UnsupportedFormatSnafu, YamlParseSnafu,
};

/// Load and merge configuration from every path, in order.
///
/// Pipelines from all sources are combined; a key defined twice is an error.
/// Global and metrics settings from later sources override earlier ones
/// field by field, when they differ from the defaults.
pub fn load_from_paths(paths: &[ConfigPath]) -> Result<Config, ConfigError> {
    let mut merged = Config::default();

    for config_path in paths {
        let config = match config_path {
            ConfigPath::File(path) => load_file(path)?,
            ConfigPath::Dir(path) => load_dir(path)?,
        };
        merged.merge(config)?;
    }

    merged.validate()?;
    info!(
        "Loaded {} pipeline(s) from {} config source(s)",
        merged.pipelines.len(),
        paths.len()
    );
    Ok(merged)
}

/// Parse a single YAML file without validating it.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );

    debug!("Reading config file {}", path.display());
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
    parse_unvalidated(&contents)
}

/// Parse every `.yaml`/`.yml` file in `dir`, sorted by file name, and merge
/// them. Errors from individual files are collected.
pub fn load_dir(dir: &Path) -> Result<Config, ConfigError> {
    let entries = std::fs::read_dir(dir).context(ReadDirSnafu {
        path: dir.to_path_buf(),
    })?;

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut merged = Config::default();
    let mut errors = Vec::new();
    for file in &files {
        match load_file(file).and_then(|config| merged.merge(config)) {
            Ok(()) => {}
            Err(e) => errors.push(format!("{}: {e}", file.display())),
        }
    }

    ensure!(errors.is_empty(), MultipleErrorsSnafu { errors });
    debug!("Loaded {} config file(s) from {}", files.len(), dir.display());
    Ok(merged)
}

pub(super) fn parse_unvalidated(yaml: &str) -> Result<Config, ConfigError> {
    let text = interpolate(yaml)?;
    serde_yaml::from_str(&text).context(YamlParseSnafu)
}

pub(super) fn merge_pipelines(
    into: &mut IndexMap<PipelineKey, PipelineConfig>,
    from: IndexMap<PipelineKey, PipelineConfig>,
) -> Result<(), ConfigError> {
    let existing: HashSet<_> = into.keys().cloned().collect();
    let duplicates: Vec<String> = from
        .keys()
        .filter(|key| existing.contains(*key))
        .map(|key| key.to_string())
        .collect();
    ensure!(
        duplicates.is_empty(),
        DuplicatePipelinesSnafu { keys: duplicates }
    );

    into.extend(from);
    Ok(())
}

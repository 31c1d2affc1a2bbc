//! Config locations and command-line arguments.

use clap::Parser;
use std::path::{Path, PathBuf};

/// Where configuration comes from: a single file or every YAML file in a
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigPath {
    File(PathBuf),
    Dir(PathBuf),
}

impl ConfigPath {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Dir(path.into())
    }

    pub fn path(&self) -> &Path {
        match self {
            ConfigPath::File(path) | ConfigPath::Dir(path) => path,
        }
    }
}

/// Whether `path` has a `.yaml` or `.yml` extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

#[derive(Parser, Debug)]
#[command(version, about = "Run concurrent fetch, decode and store pipelines")]
pub struct CliArgs {
    /// Path to a configuration file (repeatable)
    #[arg(short, long)]
    pub config: Vec<PathBuf>,

    /// Path to a directory of configuration files (repeatable)
    #[arg(short = 'C', long = "config-dir")]
    pub config_dirs: Vec<PathBuf>,
}

impl CliArgs {
    /// Files first, then directories, each in the order given.
    pub fn config_paths(&self) -> Vec<ConfigPath> {
        self.config
            .iter()
            .map(ConfigPath::file)
            .chain(self.config_dirs.iter().map(ConfigPath::dir))
            .collect()
    }
}

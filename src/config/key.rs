//! Pipeline identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Name of a pipeline in a multi-pipeline config.
///
/// Used as the map key under `pipelines:` and as the `pipeline` label on
/// logs and metrics.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineKey(String);

impl PipelineKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Derive a key from a file path or URL: the file stem of the last
    /// segment, or `default` if there is none.
    ///
    /// ```
    /// use sluice::config::PipelineKey;
    ///
    /// assert_eq!(PipelineKey::from_path("file:///data/todos.ndjson").id(), "todos");
    /// assert_eq!(PipelineKey::from_path("out/users/").id(), "users");
    /// assert_eq!(PipelineKey::from_path("").id(), "default");
    /// ```
    pub fn from_path(path: &str) -> Self {
        let path = path.find("://").map(|i| &path[i + 3..]).unwrap_or(path);
        let key = path
            .trim_end_matches('/')
            .rsplit('/')
            .find(|s| !s.is_empty())
            .and_then(|segment| Path::new(segment).file_stem())
            .and_then(|stem| stem.to_str())
            .unwrap_or("default");
        Self(key.to_string())
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PipelineKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PipelineKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

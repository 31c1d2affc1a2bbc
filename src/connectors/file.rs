use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::BoxError;
use crate::stages::Fetcher;

const FILE_SCHEME: &str = "file://";

/// Reads items from the local file system.
///
/// Items are plain paths or `file://` URLs. Relative paths resolve against
/// the configured root, or the working directory if there is none.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    root: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Path an item refers to.
    pub fn resolve(&self, item: &str) -> PathBuf {
        let path = Path::new(item.strip_prefix(FILE_SCHEME).unwrap_or(item));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    type Payload = Bytes;

    async fn fetch(&self, item: &str) -> Result<Bytes, BoxError> {
        let path = self.resolve(item);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        debug!("[fetch] Read {} bytes from {}", data.len(), path.display());
        Ok(Bytes::from(data))
    }
}

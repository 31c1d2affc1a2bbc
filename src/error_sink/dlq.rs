//! Dead-letter file output.
//!
//! Writes the failures collected by an [`ErrorSink`](super::ErrorSink) as
//! NDJSON so they can be inspected or replayed after the run. Each run
//! writes a new file with a timestamp suffix.

use chrono::Utc;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{DlqError, DlqSerializeSnafu, DlqWriteSnafu};

use super::types::{FailedItem, FailureStats};

/// NDJSON file receiving the failures of one pipeline run.
#[derive(Debug, Clone)]
pub struct DeadLetterFile {
    path: PathBuf,
}

impl DeadLetterFile {
    /// A dead-letter file under `dir`, named after the pipeline and the
    /// current time.
    pub fn in_dir(dir: impl AsRef<Path>, pipeline: &str) -> Self {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let filename = format!("{pipeline}-failures-{timestamp}.ndjson");
        Self {
            path: dir.as_ref().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize failures to NDJSON.
    pub fn encode(failures: &[FailedItem]) -> Result<String, DlqError> {
        let mut ndjson = String::new();
        for record in failures {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }
        Ok(ndjson)
    }

    /// Append `failures` to the file, creating it and its parent directory
    /// if needed. Writes nothing when there are no failures.
    pub async fn write(&self, failures: &[FailedItem]) -> Result<(), DlqError> {
        if failures.is_empty() {
            return Ok(());
        }

        let ndjson = Self::encode(failures)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(DlqWriteSnafu { path: parent })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(DlqWriteSnafu { path: &self.path })?;
        file.write_all(ndjson.as_bytes())
            .await
            .context(DlqWriteSnafu { path: &self.path })?;
        file.flush()
            .await
            .context(DlqWriteSnafu { path: &self.path })?;

        let stats = FailureStats::from_failures(failures);
        info!(
            "DLQ written to {}: {} total failures (fetch={}, decode={}, store={}, transform={}, rate_limited={})",
            self.path.display(),
            stats.total(),
            stats.fetch,
            stats.decode,
            stats.store,
            stats.transform,
            stats.rate_limited
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ItemError;

    fn failure(item: &str) -> FailedItem {
        FailedItem {
            error: ItemError::Decode {
                item: item.to_string(),
                message: "expected object".to_string(),
            },
            stage: "decode".to_string(),
            worker: Some(1),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_creates_ndjson_file() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterFile::in_dir(dir.path().join("dlq"), "todos");

        dlq.write(&[failure("u1"), failure("u2")]).await.unwrap();

        let contents = tokio::fs::read_to_string(dlq.path()).await.unwrap();
        let lines: Vec<FailedItem> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].item(), "u1");
        assert_eq!(lines[1].item(), "u2");
    }

    #[tokio::test]
    async fn test_write_skips_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterFile::in_dir(dir.path(), "todos");

        dlq.write(&[]).await.unwrap();
        assert!(!dlq.path().exists());
    }

    #[test]
    fn test_filename_includes_pipeline() {
        let dlq = DeadLetterFile::in_dir("/tmp", "todos");
        let name = dlq.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("todos-failures-"));
        assert!(name.ends_with(".ndjson"));
    }
}

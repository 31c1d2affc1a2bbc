use async_trait::async_trait;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::BoxError;
use crate::stages::Store;

use super::json::Record;

/// Appends records to an NDJSON file.
///
/// With a `key_field`, a record whose key has already been written (in this
/// run or a previous one) is accepted without writing it again.
pub struct NdjsonStore {
    path: PathBuf,
    key_field: Option<String>,
    state: Mutex<StoreState>,
}

struct StoreState {
    file: File,
    seen: HashSet<String>,
    written: usize,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

impl StoreState {
    /// Append `line`, cutting the file back to its previous length if the
    /// write fails partway.
    async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        let len = self.file.metadata().await?.len();
        let result = match self.file.write_all(line).await {
            Ok(()) => self.file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.rollback(len).await;
            return Err(e);
        }
        Ok(())
    }

    async fn rollback(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len).await {
            error!("[store] Failed to truncate after a partial write: {}", e);
            self.broken = true;
        }
    }
}

impl NdjsonStore {
    /// Open (or create) the file at `path`, loading the keys already in it.
    pub async fn open(path: impl AsRef<Path>, key_field: Option<String>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let seen = match &key_field {
            Some(field) => load_keys(&path, field).await?,
            None => HashSet::new(),
        };
        if !seen.is_empty() {
            info!("[store] Loaded {} existing keys from {}", seen.len(), path.display());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            key_field,
            state: Mutex::new(StoreState {
                file,
                seen,
                written: 0,
                broken: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written by this store (duplicates excluded).
    pub async fn written(&self) -> usize {
        self.state.lock().await.written
    }
}

async fn load_keys(path: &Path, field: &str) -> std::io::Result<HashSet<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e),
    };

    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str::<Record>(line).ok())
        .filter_map(|record| record_key(&record, field))
        .collect())
}

fn record_key(record: &Record, field: &str) -> Option<String> {
    record.get(field).map(|value| match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[async_trait]
impl Store for NdjsonStore {
    type Record = Record;

    async fn store(&self, record: &Record) -> Result<(), BoxError> {
        let key = match &self.key_field {
            Some(field) => Some(
                record_key(record, field)
                    .ok_or_else(|| format!("record has no '{field}' field"))?,
            ),
            None => None,
        };

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        if state.broken {
            return Err(format!("{} may hold a partial line", self.path.display()).into());
        }
        if let Some(key) = &key
            && state.seen.contains(key)
        {
            debug!("[store] Skipping duplicate key {}", key);
            return Ok(());
        }

        state.append(line.as_bytes()).await?;
        state.written += 1;
        if let Some(key) = key {
            state.seen.insert(key);
        }
        Ok(())
    }
}

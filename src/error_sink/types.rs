//! Failure record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, ItemError};

/// A failure as recorded by the error sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    /// The per-item error, including the originating item.
    pub error: ItemError,
    /// Stage that reported the failure.
    pub stage: String,
    /// Worker within the stage, if the failure came from a fanned-out worker.
    pub worker: Option<usize>,
    /// When the failure was reported.
    pub timestamp: DateTime<Utc>,
}

impl FailedItem {
    pub fn item(&self) -> &str {
        self.error.item()
    }

    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

/// Failure counts by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub fetch: usize,
    pub decode: usize,
    pub store: usize,
    pub transform: usize,
    pub rate_limited: usize,
}

impl FailureStats {
    pub fn from_failures(failures: &[FailedItem]) -> Self {
        let mut stats = Self::default();
        for failure in failures {
            stats.increment(failure.kind());
        }
        stats
    }

    pub fn increment(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Fetch => self.fetch += 1,
            FailureKind::Decode => self.decode += 1,
            FailureKind::Store => self.store += 1,
            FailureKind::Transform => self.transform += 1,
            FailureKind::RateLimited => self.rate_limited += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetch + self.decode + self.store + self.transform + self.rate_limited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(error: ItemError) -> FailedItem {
        FailedItem {
            error,
            stage: "fetch".to_string(),
            worker: Some(0),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_failure_stats_by_kind() {
        let failures = vec![
            failed(ItemError::Fetch {
                item: "a".into(),
                message: "timeout".into(),
            }),
            failed(ItemError::Fetch {
                item: "b".into(),
                message: "refused".into(),
            }),
            failed(ItemError::Decode {
                item: "c".into(),
                message: "bad json".into(),
            }),
        ];

        let stats = FailureStats::from_failures(&failures);
        assert_eq!(stats.fetch, 2);
        assert_eq!(stats.decode, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_failed_item_json_shape() {
        let item = failed(ItemError::Store {
            item: "u3".into(),
            message: "disk full".into(),
        });
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["error"]["kind"], "store");
        assert_eq!(json["error"]["item"], "u3");
        assert_eq!(json["stage"], "fetch");
        assert_eq!(json["worker"], 0);
    }
}

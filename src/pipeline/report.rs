//! What a finished pipeline hands back to its host.

use std::fmt;

use crate::error_sink::{FailedItem, FailureStats};
use crate::task::TaskFailure;

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The source was exhausted and every item reached the sink or the
    /// error sink.
    Completed,
    /// Cancelled by the host, a signal, or a timeout.
    Cancelled,
    /// Cancelled itself after reaching its failure limit.
    Aborted,
    /// A worker task panicked, so the items it held never reached either
    /// sink.
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Cancelled => "cancelled",
            Outcome::Aborted => "aborted",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Items the source handed to the first stage.
    pub emitted: usize,
    /// Successful items accepted by the sink.
    pub delivered: usize,
    /// Failures reported to the error sink.
    pub failed: usize,
    /// Items dropped because cancellation interrupted their processing or
    /// handoff.
    pub discarded: usize,
}

/// Result of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport<K> {
    pub name: String,
    /// The sink, returned so the host can inspect what it collected.
    pub sink: K,
    pub stats: PipelineStats,
    /// Every failure reported during the run, in report order.
    pub failures: Vec<FailedItem>,
    /// Tasks that panicked. Non-empty implies [`Outcome::Failed`] unless the
    /// run was aborted.
    pub task_failures: Vec<TaskFailure>,
    pub outcome: Outcome,
}

impl<K> PipelineReport<K> {
    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn failure_stats(&self) -> FailureStats {
        FailureStats::from_failures(&self.failures)
    }
}

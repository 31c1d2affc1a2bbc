//! Task bookkeeping for a pipeline run.
//!
//! Every task a pipeline spawns (source, stage workers, fan-in forwarders)
//! goes into one [`TaskSet`] under a [`TaskLabel`], so that a panicking
//! worker can be attributed by stage and worker index when the run is
//! joined.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tracing::error;

/// Identifies one spawned task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabel {
    /// Stage (or role, e.g. `source`, `fan_in`) the task belongs to.
    pub stage: Arc<str>,
    /// Worker index within the stage.
    pub worker: usize,
}

impl TaskLabel {
    pub fn new(stage: impl Into<Arc<str>>, worker: usize) -> Self {
        Self {
            stage: stage.into(),
            worker,
        }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.stage, self.worker)
    }
}

/// Counters a task returns when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Items the task finished handling and passed on.
    pub handled: usize,
    /// Items dropped because cancellation won a send.
    pub discarded: usize,
}

impl TaskStats {
    pub fn merge(&mut self, other: TaskStats) {
        self.handled += other.handled;
        self.discarded += other.discarded;
    }
}

/// A task that did not exit normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub stage: String,
    pub worker: usize,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.stage, self.worker, self.message)
    }
}

/// Result of joining every task in a [`TaskSet`].
#[derive(Debug, Default)]
pub struct JoinSummary {
    /// Stats summed per stage label.
    pub stats: HashMap<Arc<str>, TaskStats>,
    pub failures: Vec<TaskFailure>,
}

impl JoinSummary {
    /// Stats for one stage, zero if it never ran.
    pub fn stage(&self, stage: &str) -> TaskStats {
        self.stats.get(stage).copied().unwrap_or_default()
    }

    /// Sum of discards across every stage.
    pub fn discarded(&self) -> usize {
        self.stats.values().map(|s| s.discarded).sum()
    }
}

/// Labelled set of spawned tasks.
#[derive(Default)]
pub struct TaskSet {
    set: JoinSet<TaskStats>,
    labels: HashMap<Id, TaskLabel>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` on the current runtime under `label`.
    pub fn spawn<F>(&mut self, label: TaskLabel, future: F)
    where
        F: Future<Output = TaskStats> + Send + 'static,
    {
        let handle = self.set.spawn(future);
        self.labels.insert(handle.id(), label);
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every task, collecting stats and attributing panics.
    pub async fn join_all(mut self) -> JoinSummary {
        let mut summary = JoinSummary::default();

        while let Some(result) = self.set.join_next_with_id().await {
            match result {
                Ok((id, stats)) => {
                    if let Some(label) = self.labels.remove(&id) {
                        summary.stats.entry(label.stage).or_default().merge(stats);
                    }
                }
                Err(e) => {
                    let label = self
                        .labels
                        .remove(&e.id())
                        .unwrap_or_else(|| TaskLabel::new("unknown", 0));
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "task cancelled".to_string()
                    };
                    error!(task = %label, "Pipeline task failed: {}", message);
                    summary.failures.push(TaskFailure {
                        stage: label.stage.to_string(),
                        worker: label.worker,
                        message,
                    });
                }
            }
        }

        summary
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

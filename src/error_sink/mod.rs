//! Error aggregation across concurrent stages.
//!
//! Every stage worker holds an [`ErrorReporter`]; reporting is a
//! non-blocking append into an unbounded channel owned by the
//! [`ErrorSink`]. The sink only finishes draining once every reporter has
//! been dropped, so a write can never race with the sink closing.

mod dlq;
mod types;

pub use dlq::DeadLetterFile;
pub use types::{FailedItem, FailureStats};

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::emit;
use crate::error::ItemError;
use crate::metrics::events::ItemFailed;

/// Shared failure counter and limit.
#[derive(Debug)]
struct FailureBudget {
    count: AtomicUsize,
    /// Maximum failures before cancelling the pipeline (0 = unlimited).
    max_failures: usize,
}

/// Collects failures from every stage of one pipeline run.
pub struct ErrorSink {
    pipeline: Arc<str>,
    tx: mpsc::UnboundedSender<FailedItem>,
    rx: mpsc::UnboundedReceiver<FailedItem>,
    budget: Arc<FailureBudget>,
    shutdown: CancellationToken,
}

impl ErrorSink {
    /// Create a sink that cancels `shutdown` once `max_failures` failures
    /// have been reported. `max_failures == 0` disables the limit.
    pub fn new(
        pipeline: impl Into<Arc<str>>,
        max_failures: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pipeline: pipeline.into(),
            tx,
            rx,
            budget: Arc::new(FailureBudget {
                count: AtomicUsize::new(0),
                max_failures,
            }),
            shutdown,
        }
    }

    /// Create a writer handle for a stage.
    pub fn reporter(&self, stage: impl Into<Arc<str>>) -> ErrorReporter {
        ErrorReporter {
            pipeline: Arc::clone(&self.pipeline),
            stage: stage.into(),
            worker: None,
            tx: self.tx.clone(),
            budget: Arc::clone(&self.budget),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Failures reported so far.
    pub fn count(&self) -> usize {
        self.budget.count.load(Ordering::Acquire)
    }

    /// Whether the failure limit has been hit.
    pub fn limit_reached(&self) -> bool {
        self.budget.max_failures > 0 && self.count() >= self.budget.max_failures
    }

    /// Collect every reported failure.
    ///
    /// Waits until all reporters have been dropped, so call this after the
    /// pipeline's tasks have finished.
    pub async fn drain(self) -> Vec<FailedItem> {
        let Self { tx, mut rx, .. } = self;
        drop(tx);

        let mut failures = Vec::new();
        while let Some(failure) = rx.recv().await {
            failures.push(failure);
        }
        debug!(count = failures.len(), "Error sink drained");
        failures
    }
}

/// Cloneable writer into an [`ErrorSink`].
#[derive(Clone)]
pub struct ErrorReporter {
    pipeline: Arc<str>,
    stage: Arc<str>,
    worker: Option<usize>,
    tx: mpsc::UnboundedSender<FailedItem>,
    budget: Arc<FailureBudget>,
    shutdown: CancellationToken,
}

impl ErrorReporter {
    /// A copy of this reporter that attributes failures to `worker`.
    pub fn for_worker(&self, worker: usize) -> Self {
        Self {
            worker: Some(worker),
            ..self.clone()
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Record a failure. Never blocks.
    pub fn report(&self, error: ItemError) {
        warn!(
            pipeline = %self.pipeline,
            stage = %self.stage,
            item = error.item(),
            error = %error,
            "Item failed"
        );
        emit!(ItemFailed {
            kind: error.kind(),
            stage: self.stage.to_string(),
            pipeline: self.pipeline.to_string(),
        });

        let failed = FailedItem {
            error,
            stage: self.stage.to_string(),
            worker: self.worker,
            timestamp: Utc::now(),
        };
        if self.tx.send(failed).is_err() {
            error!(stage = %self.stage, "Error sink dropped before reporter, failure lost");
        }

        let count = self.budget.count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.budget.max_failures > 0 && count == self.budget.max_failures {
            error!(
                pipeline = %self.pipeline,
                "Max failures ({}) reached, cancelling pipeline", count
            );
            self.shutdown.cancel();
        }
    }
}

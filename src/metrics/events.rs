//! Internal events for sluice metrics emission.
//!
//! Each event struct represents a measurable occurrence in a running
//! pipeline. Events implement the `InternalEvent` trait which emits the
//! corresponding Prometheus metric.
//!
//! ## Labels
//!
//! Every event carries a `pipeline` label so several pipelines running in
//! one process can be told apart. Stage-level events add a `stage` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::error::FailureKind;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when the source hands an item to the first stage.
pub struct ItemsEmitted {
    pub count: u64,
    pub pipeline: String,
}

impl InternalEvent for ItemsEmitted {
    fn emit(self) {
        trace!(count = self.count, pipeline = %self.pipeline, "Items emitted");
        counter!("sluice_items_emitted_total", "pipeline" => self.pipeline).increment(self.count);
    }
}

/// Outcome of a stage processing one input.
#[derive(Debug, Clone, Copy)]
pub enum ItemStatus {
    Success,
    Failed,
    /// Upstream failure forwarded without processing.
    Skipped,
    /// Dropped because cancellation fired while it was being processed.
    Discarded,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Discarded => "discarded",
        }
    }
}

/// Event emitted when a stage worker finishes one input.
pub struct ItemProcessed {
    pub status: ItemStatus,
    pub stage: String,
    pub pipeline: String,
}

impl InternalEvent for ItemProcessed {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            stage = %self.stage,
            pipeline = %self.pipeline,
            "Item processed"
        );
        counter!(
            "sluice_items_processed_total",
            "status" => self.status.as_str(),
            "stage" => self.stage,
            "pipeline" => self.pipeline
        )
        .increment(1);
    }
}

/// Event emitted when a failure is reported to the error sink.
pub struct ItemFailed {
    pub kind: FailureKind,
    pub stage: String,
    pub pipeline: String,
}

impl InternalEvent for ItemFailed {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), stage = %self.stage, "Item failed");
        counter!(
            "sluice_items_failed_total",
            "kind" => self.kind.as_str(),
            "stage" => self.stage,
            "pipeline" => self.pipeline
        )
        .increment(1);
    }
}

/// Event emitted when the sink receives a successful item.
pub struct ItemsDelivered {
    pub count: u64,
    pub pipeline: String,
}

impl InternalEvent for ItemsDelivered {
    fn emit(self) {
        trace!(count = self.count, pipeline = %self.pipeline, "Items delivered");
        counter!("sluice_items_delivered_total", "pipeline" => self.pipeline)
            .increment(self.count);
    }
}

/// Gauge of workers currently running for a stage.
pub struct ActiveWorkers {
    pub count: usize,
    pub stage: String,
    pub pipeline: String,
}

impl InternalEvent for ActiveWorkers {
    fn emit(self) {
        trace!(count = self.count, stage = %self.stage, "Active workers");
        gauge!("sluice_active_workers", "stage" => self.stage, "pipeline" => self.pipeline)
            .set(self.count as f64);
    }
}

/// Event emitted when a stage finishes processing one input.
pub struct StageDuration {
    pub duration: Duration,
    pub stage: String,
    pub pipeline: String,
}

impl InternalEvent for StageDuration {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            stage = %self.stage,
            "Stage item completed"
        );
        histogram!(
            "sluice_stage_duration_seconds",
            "stage" => self.stage,
            "pipeline" => self.pipeline
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Decision taken by a throttle for one item.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitDecision {
    Granted,
    Rejected,
    Waited,
}

impl RateLimitDecision {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitDecision::Granted => "granted",
            RateLimitDecision::Rejected => "rejected",
            RateLimitDecision::Waited => "waited",
        }
    }
}

/// Event emitted for every rate limiter admission decision.
pub struct RateLimited {
    pub decision: RateLimitDecision,
}

impl InternalEvent for RateLimited {
    fn emit(self) {
        trace!(decision = self.decision.as_str(), "Rate limit decision");
        counter!("sluice_rate_limit_decisions_total", "decision" => self.decision.as_str())
            .increment(1);
    }
}

/// Event emitted when a pipeline changes state.
pub struct StateChanged {
    pub state: &'static str,
    pub pipeline: String,
}

impl InternalEvent for StateChanged {
    fn emit(self) {
        trace!(state = self.state, pipeline = %self.pipeline, "Pipeline state changed");
        counter!(
            "sluice_pipeline_transitions_total",
            "state" => self.state,
            "pipeline" => self.pipeline
        )
        .increment(1);
    }
}

//! The unit of pipeline work.
//!
//! A [`Stage`] turns one input into zero or more outputs, or a failure. The
//! coordination around it (reading the shared input, forwarding upstream
//! failures, reporting errors, honoring cancellation) lives in
//! [`StageWorker`], so stage implementations only deal with their own
//! collaborator calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::{SendOutcome, SharedReceiver, send_or_cancel};
use crate::context::PipelineContext;
use crate::emit;
use crate::error::{ItemError, SetupError, ZeroCapacitySnafu, ZeroWorkersSnafu};
use crate::error_sink::ErrorReporter;
use crate::metrics::events::{ActiveWorkers, ItemProcessed, ItemStatus, StageDuration};
use crate::task::TaskStats;

/// What flows between stages: a value, or the failure that replaced it.
pub type ItemResult<T> = Result<T, ItemError>;

/// A unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Name used for logs, metrics and failure attribution.
    fn name(&self) -> &str;

    /// Process one input.
    ///
    /// An `Err` is reported once and forwarded downstream in place of the
    /// outputs. Returning an empty vec drops the input without failing it.
    /// `shutdown` lets long waits inside the stage end early on cancellation.
    async fn process(
        &self,
        input: Self::Input,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Self::Output>, ItemError>;
}

/// A stage built from an async closure producing exactly one output.
pub struct FnStage<I, O, F> {
    name: String,
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Build a stage from `f`.
///
/// ```ignore
/// let double = sluice::stage::from_fn("double", |n: u64| async move { Ok(n * 2) });
/// ```
pub fn from_fn<I, O, F, Fut>(name: impl Into<String>, f: F) -> FnStage<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ItemError>> + Send + 'static,
{
    FnStage {
        name: name.into(),
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> Stage for FnStage<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ItemError>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, input: I, _: &CancellationToken) -> Result<Vec<O>, ItemError> {
        (self.f)(input).await.map(|output| vec![output])
    }
}

/// Default number of workers per stage.
pub const DEFAULT_WORKERS: usize = 1;

/// Default capacity of a stage's output channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Concurrency settings for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageOptions {
    /// Number of concurrent workers pulling from the stage's input.
    pub workers: usize,
    /// Capacity of each bounded output channel.
    pub channel_capacity: usize,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl StageOptions {
    pub fn new(workers: usize, channel_capacity: usize) -> Self {
        Self {
            workers,
            channel_capacity,
        }
    }

    /// Check the options, collecting every problem found.
    pub fn validate(&self, stage: &str, errors: &mut Vec<SetupError>) {
        if self.workers == 0 {
            errors.push(ZeroWorkersSnafu { stage }.build());
        }
        if self.channel_capacity == 0 {
            errors.push(ZeroCapacitySnafu { stage }.build());
        }
    }
}

/// One worker of a stage.
///
/// Pulls from the stage's shared input until it ends or cancellation fires,
/// then drops its output sender. The stage's output closes once every
/// worker has done so.
pub struct StageWorker<S: Stage> {
    stage: Arc<S>,
    worker: usize,
    input: SharedReceiver<ItemResult<S::Input>>,
    output: mpsc::Sender<ItemResult<S::Output>>,
    errors: ErrorReporter,
    ctx: PipelineContext,
    active: Arc<AtomicUsize>,
}

impl<S: Stage> StageWorker<S> {
    pub fn new(
        stage: Arc<S>,
        worker: usize,
        input: SharedReceiver<ItemResult<S::Input>>,
        output: mpsc::Sender<ItemResult<S::Output>>,
        errors: ErrorReporter,
        ctx: PipelineContext,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            stage,
            worker,
            input,
            output,
            errors: errors.for_worker(worker),
            ctx,
            active,
        }
    }

    pub async fn run(self) -> TaskStats {
        let _guard = self.ctx.enter_task();
        let stage = self.stage.name().to_string();
        let pipeline = self.ctx.name().to_string();
        let shutdown = self.ctx.shutdown().clone();
        let mut stats = TaskStats::default();

        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        emit!(ActiveWorkers {
            count,
            stage: stage.clone(),
            pipeline: pipeline.clone(),
        });
        debug!("[{}] Worker {} started", stage, self.worker);

        while let Some(next) = self.input.recv_or_cancel(&shutdown).await {
            let input = match next {
                Ok(input) => input,
                Err(upstream) => {
                    // Already reported where it originated.
                    trace!("[{}] Skipping failed item {}", stage, upstream.item());
                    emit!(ItemProcessed {
                        status: ItemStatus::Skipped,
                        stage: stage.clone(),
                        pipeline: pipeline.clone(),
                    });
                    match send_or_cancel(&self.output, Err(upstream), &shutdown).await {
                        SendOutcome::Sent => {
                            stats.handled += 1;
                            continue;
                        }
                        SendOutcome::Cancelled => stats.discarded += 1,
                        SendOutcome::Closed => {}
                    }
                    break;
                }
            };

            let start = Instant::now();
            let result = self.stage.process(input, &shutdown).await;
            emit!(StageDuration {
                duration: start.elapsed(),
                stage: stage.clone(),
                pipeline: pipeline.clone(),
            });

            let outputs: Vec<ItemResult<S::Output>> = match result {
                Ok(outputs) if outputs.is_empty() && shutdown.is_cancelled() => {
                    // Dropped by the stage while shutting down.
                    emit!(ItemProcessed {
                        status: ItemStatus::Discarded,
                        stage: stage.clone(),
                        pipeline: pipeline.clone(),
                    });
                    stats.discarded += 1;
                    break;
                }
                Ok(outputs) => {
                    emit!(ItemProcessed {
                        status: ItemStatus::Success,
                        stage: stage.clone(),
                        pipeline: pipeline.clone(),
                    });
                    outputs.into_iter().map(Ok).collect()
                }
                Err(e) => {
                    emit!(ItemProcessed {
                        status: ItemStatus::Failed,
                        stage: stage.clone(),
                        pipeline: pipeline.clone(),
                    });
                    self.errors.report(e.clone());
                    vec![Err(e)]
                }
            };

            if !self.send_all(outputs, &mut stats, &shutdown).await {
                break;
            }
        }

        let count = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        emit!(ActiveWorkers {
            count,
            stage: stage.clone(),
            pipeline,
        });
        debug!(
            "[{}] Worker {} finished: {} handled, {} discarded",
            stage, self.worker, stats.handled, stats.discarded
        );
        stats
    }

    /// Send every output. Returns false once the worker should stop.
    async fn send_all(
        &self,
        outputs: Vec<ItemResult<S::Output>>,
        stats: &mut TaskStats,
        shutdown: &CancellationToken,
    ) -> bool {
        let total = outputs.len();
        for (sent, output) in outputs.into_iter().enumerate() {
            match send_or_cancel(&self.output, output, shutdown).await {
                SendOutcome::Sent => stats.handled += 1,
                SendOutcome::Cancelled => {
                    stats.discarded += total - sent;
                    return false;
                }
                SendOutcome::Closed => return false,
            }
        }
        true
    }
}

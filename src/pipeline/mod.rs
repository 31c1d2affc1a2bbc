//! Pipeline composition and supervision.
//!
//! A [`Pipeline`] is a source, one or more (optionally fanned-out) stages,
//! and a sink. [`Pipeline::start`] spawns every task and a supervisor that
//! feeds the sink, tracks the state machine and, once everything has exited,
//! drains the error sink into a [`PipelineReport`].
//!
//! # State machine
//!
//! ```text
//! Created ──start──▶ Running ──source exhausted──▶ Draining ──▶ Terminated
//!                       │                             │             ▲
//!                       └──────cancel──▶ Cancelling ◀─┘             │
//!                                            └──────────────────────┘
//! ```

mod builder;
mod report;

pub use builder::{NoSource, PipelineBuilder, builder};
pub use report::{Outcome, PipelineReport, PipelineStats};

use snafu::prelude::*;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::{PipelineContext, PipelineState};
use crate::emit;
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::error_sink::ErrorSink;
use crate::metrics::events::ItemsDelivered;
use crate::sink::Sink;
use crate::stage::ItemResult;
use crate::task::TaskSet;

use builder::{Launch, Settings, Wiring};

/// A fully wired pipeline in the `Created` state.
pub struct Pipeline<T, K> {
    settings: Settings,
    stages: Vec<String>,
    launch: Launch<T>,
    sink: K,
}

impl<T: Send + 'static, K: Sink<T>> Pipeline<T, K> {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Stage names in pipeline order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Spawn every task and return a handle to the running pipeline.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self) -> PipelineHandle<K> {
        let Pipeline {
            settings,
            stages,
            launch,
            sink,
        } = self;

        let ctx = PipelineContext::new(settings.name.clone(), settings.shutdown.child_token());
        let errors = ErrorSink::new(
            settings.name.clone(),
            settings.max_failures,
            ctx.shutdown().clone(),
        );

        ctx.transition(PipelineState::Running);
        info!(
            pipeline = %ctx.name(),
            "Starting pipeline: source -> {} -> sink",
            stages.join(" -> ")
        );

        let mut wiring = Wiring {
            ctx: ctx.clone(),
            errors,
            tasks: TaskSet::new(),
        };
        let output = launch(&mut wiring);
        let Wiring { errors, tasks, .. } = wiring;
        debug!(pipeline = %ctx.name(), tasks = tasks.len(), "Pipeline tasks spawned");

        let supervisor = Supervisor {
            ctx: ctx.clone(),
            output,
            sink,
            tasks,
            errors,
            timeout: settings.timeout,
        };
        let handle = tokio::spawn(supervisor.run());

        PipelineHandle {
            ctx,
            supervisor: handle,
        }
    }

    /// Start the pipeline and wait for it to terminate.
    pub async fn run(self) -> Result<PipelineReport<K>, PipelineError> {
        self.start().wait().await
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle<K> {
    ctx: PipelineContext,
    supervisor: JoinHandle<PipelineReport<K>>,
}

impl<K> PipelineHandle<K> {
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Request cancellation. Callable any number of times.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Token that cancels this pipeline when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.shutdown().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.ctx.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.ctx.watch_state()
    }

    /// Tasks still running, including the supervisor.
    pub fn active_tasks(&self) -> usize {
        self.ctx.active_tasks()
    }

    /// Wait for the pipeline to terminate.
    ///
    /// Fails only if the supervisor itself panicked, which happens when the
    /// sink panics.
    pub async fn wait(self) -> Result<PipelineReport<K>, PipelineError> {
        self.supervisor.await.context(TaskJoinSnafu)
    }
}

/// Feeds the sink and tears the pipeline down.
struct Supervisor<T, K> {
    ctx: PipelineContext,
    output: mpsc::Receiver<ItemResult<T>>,
    sink: K,
    tasks: TaskSet,
    errors: ErrorSink,
    timeout: Option<Duration>,
}

impl<T: Send + 'static, K: Sink<T>> Supervisor<T, K> {
    async fn run(self) -> PipelineReport<K> {
        let Supervisor {
            ctx,
            mut output,
            mut sink,
            tasks,
            errors,
            timeout,
        } = self;

        let guard = ctx.enter_task();
        let shutdown = ctx.shutdown().clone();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut delivered = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(deadline) => {
                    warn!(pipeline = %ctx.name(), "Pipeline timed out, cancelling");
                    ctx.cancel();
                    break;
                }
                next = output.recv() => next,
            };

            match next {
                Some(Ok(item)) => {
                    sink.accept(item).await;
                    delivered += 1;
                    emit!(ItemsDelivered {
                        count: 1,
                        pipeline: ctx.name().to_string(),
                    });
                }
                Some(Err(e)) => {
                    trace!(pipeline = %ctx.name(), item = e.item(), "[sink] Skipping failed item");
                }
                None => break,
            }
        }

        if shutdown.is_cancelled() {
            info!(pipeline = %ctx.name(), "Pipeline cancelled, waiting for tasks to stop");
            ctx.transition(PipelineState::Cancelling);
        }
        sink.finish().await;

        let summary = tasks.join_all().await;

        // Buffered items the sink never read.
        let mut unread = 0;
        while output.try_recv().is_ok() {
            unread += 1;
        }
        drop(output);

        let aborted = errors.limit_reached();
        let failures = errors.drain().await;

        // Late cancellation (during the join) still counts.
        let cancelled = shutdown.is_cancelled();
        if cancelled {
            ctx.transition(PipelineState::Cancelling);
        }

        let outcome = if aborted {
            Outcome::Aborted
        } else if !summary.failures.is_empty() {
            Outcome::Failed
        } else if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Completed
        };

        let stats = PipelineStats {
            emitted: summary.stage("source").handled,
            delivered,
            failed: failures.len(),
            discarded: summary.discarded() + unread,
        };

        drop(guard);
        ctx.transition(PipelineState::Terminated);
        info!(
            pipeline = %ctx.name(),
            outcome = %outcome,
            "Pipeline terminated: {} emitted, {} delivered, {} failed, {} discarded",
            stats.emitted,
            stats.delivered,
            stats.failed,
            stats.discarded
        );

        PipelineReport {
            name: ctx.name().to_string(),
            sink,
            stats,
            failures,
            task_failures: summary.failures,
            outcome,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

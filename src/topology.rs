//! Running several keyed pipelines side by side.
//!
//! [`PipelineRunner`] spawns every pipeline with an optional random start
//! delay, shares one shutdown token between them and collects how each one
//! exited. After shutdown is requested, pipelines get a grace period to stop
//! before the remaining tasks are aborted.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A unit of work the runner can execute.
pub trait RunnablePipeline: Send + 'static {
    type Key: Clone + Display + Send + 'static;
    type Output: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn key(&self) -> &Self::Key;

    /// Run to completion. `shutdown` is cancelled when the process is asked
    /// to stop.
    fn run(
        self,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}

/// How one pipeline ended.
#[derive(Debug)]
pub enum PipelineExit<O, E> {
    Finished(O),
    Failed(E),
    /// Shutdown arrived before the pipeline started.
    Skipped,
    Panicked(String),
    /// Still running when the shutdown grace period ran out.
    Aborted,
}

impl<O, E> PipelineExit<O, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineExit::Finished(_) | PipelineExit::Skipped)
    }
}

type Exit<P> = PipelineExit<<P as RunnablePipeline>::Output, <P as RunnablePipeline>::Error>;

pub struct PipelineRunner<P: RunnablePipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    start_delay: StartDelay,
    shutdown_timeout: Duration,
}

/// How long each pipeline waits before starting.
#[derive(Debug, Clone, Copy)]
enum StartDelay {
    /// Uniform in `[0, max_secs)`, drawn per pipeline.
    Random { max_secs: u64 },
    Fixed(Duration),
}

impl StartDelay {
    fn draw(&self) -> Duration {
        match *self {
            StartDelay::Random { max_secs } => random_jitter(max_secs),
            StartDelay::Fixed(delay) => delay,
        }
    }
}

impl<P: RunnablePipeline> PipelineRunner<P> {
    pub fn new(pipelines: Vec<P>, shutdown: CancellationToken) -> Self {
        Self {
            pipelines,
            shutdown,
            start_delay: StartDelay::Fixed(Duration::ZERO),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Delay each pipeline's start by up to this many seconds.
    pub fn start_jitter_secs(mut self, secs: u64) -> Self {
        self.start_delay = StartDelay::Random { max_secs: secs };
        self
    }

    /// Delay every pipeline's start by exactly `delay`.
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = StartDelay::Fixed(delay);
        self
    }

    /// How long to wait for pipelines after shutdown before aborting them.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Run every pipeline and return how each one exited, in completion order.
    pub async fn run(self) -> Vec<(P::Key, Exit<P>)> {
        let mut handles: JoinSet<Exit<P>> = JoinSet::new();
        let mut keys: HashMap<Id, P::Key> = HashMap::new();

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = self.start_delay.draw();
            let task_key = key.clone();

            let handle = handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        pipeline = %task_key,
                        jitter_ms = start_jitter.as_millis() as u64,
                        "Delaying pipeline start"
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(pipeline = %task_key, "Shutdown requested during start delay");
                        return PipelineExit::Skipped;
                    }
                }

                match pipeline.run(shutdown).await {
                    Ok(output) => PipelineExit::Finished(output),
                    Err(e) => PipelineExit::Failed(e),
                }
            });
            keys.insert(handle.id(), key);
        }

        info!("Spawned {} pipeline(s)", handles.len());

        let mut exits = Vec::with_capacity(keys.len());
        let mut grace_deadline: Option<Instant> = None;
        let mut aborted = false;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if grace_deadline.is_none() => {
                    info!(
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Waiting for {} pipeline(s) to stop",
                        handles.len()
                    );
                    grace_deadline = Some(Instant::now() + self.shutdown_timeout);
                }
                _ = sleep_until(grace_deadline), if !aborted => {
                    warn!("{} pipeline(s) did not stop in time, aborting", handles.len());
                    handles.abort_all();
                    aborted = true;
                }
                joined = handles.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (id, exit) = match joined {
                        Ok((id, exit)) => (id, exit),
                        Err(e) if e.is_cancelled() => (e.id(), PipelineExit::Aborted),
                        Err(e) => {
                            let id = e.id();
                            (id, PipelineExit::Panicked(panic_message(e)))
                        }
                    };
                    let Some(key) = keys.remove(&id) else { continue };
                    log_exit(&key, &exit);
                    exits.push((key, exit));
                }
            }
        }

        info!("All pipelines complete");
        exits
    }
}

fn log_exit<K: Display, O, E: std::error::Error>(key: &K, exit: &PipelineExit<O, E>) {
    match exit {
        PipelineExit::Finished(_) => info!(pipeline = %key, "Pipeline completed"),
        PipelineExit::Skipped => info!(pipeline = %key, "Pipeline skipped"),
        PipelineExit::Failed(e) => error!(pipeline = %key, error = %e, "Pipeline failed"),
        PipelineExit::Panicked(msg) => error!(pipeline = %key, panic = %msg, "Pipeline panicked"),
        PipelineExit::Aborted => warn!(pipeline = %key, "Pipeline aborted"),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A random duration in `[0, max_secs)`, or zero.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs.saturating_mul(1000)))
    } else {
        Duration::ZERO
    }
}

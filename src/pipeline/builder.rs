//! Pipeline construction.
//!
//! The builder is typed by the item type currently flowing out of the last
//! stage, so a stage whose input does not match the previous output is a
//! compile error. Runtime setup errors (zero workers, zero capacity, missing
//! source, no stages) are collected and returned together from
//! [`PipelineBuilder::build`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::SharedReceiver;
use crate::context::PipelineContext;
use crate::error::{
    MissingSourceSnafu, MultipleSetupErrorsSnafu, NoStagesSnafu, SetupError, ZeroCapacitySnafu,
};
use crate::error_sink::ErrorSink;
use crate::fan::{fan_in, fan_out};
use crate::sink::Sink;
use crate::source::Source;
use crate::stage::{DEFAULT_CHANNEL_CAPACITY, ItemResult, Stage, StageOptions};
use crate::task::{TaskLabel, TaskSet};

use super::Pipeline;

/// Everything a pipeline spawns into while starting.
pub(super) struct Wiring {
    pub ctx: PipelineContext,
    pub errors: ErrorSink,
    pub tasks: TaskSet,
}

/// Spawns the pipeline up to some stage and returns that stage's output.
pub(super) type Launch<T> = Box<dyn FnOnce(&mut Wiring) -> mpsc::Receiver<ItemResult<T>> + Send>;

/// Marker for a builder that has no source yet.
#[derive(Debug)]
pub enum NoSource {}

/// Settings shared by every builder state.
#[derive(Debug, Clone)]
pub(super) struct Settings {
    pub name: Arc<str>,
    pub shutdown: CancellationToken,
    pub max_failures: usize,
    pub source_capacity: usize,
    pub timeout: Option<Duration>,
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder<T> {
    settings: Settings,
    stages: Vec<String>,
    errors: Vec<SetupError>,
    launch: Option<Launch<T>>,
}

/// Start building a pipeline called `name`.
pub fn builder(name: impl Into<Arc<str>>) -> PipelineBuilder<NoSource> {
    PipelineBuilder::new(name)
}

impl PipelineBuilder<NoSource> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            settings: Settings {
                name: name.into(),
                shutdown: CancellationToken::new(),
                max_failures: 0,
                source_capacity: DEFAULT_CHANNEL_CAPACITY,
                timeout: None,
            },
            stages: Vec::new(),
            errors: Vec::new(),
            launch: None,
        }
    }

    /// Set the items fed into the first stage.
    pub fn source<T: Send + 'static>(self, source: Source<T>) -> PipelineBuilder<T> {
        let capacity = self.settings.source_capacity;
        let launch: Launch<T> = Box::new(move |wiring: &mut Wiring| {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            wiring.tasks.spawn(
                TaskLabel::new("source", 0),
                source.run(tx, wiring.ctx.clone()),
            );
            rx
        });

        PipelineBuilder {
            settings: self.settings,
            stages: self.stages,
            errors: self.errors,
            launch: Some(launch),
        }
    }

    /// Capacity of the channel between the source and the first stage.
    pub fn source_capacity(mut self, capacity: usize) -> Self {
        if capacity == 0 {
            self.errors.push(ZeroCapacitySnafu { stage: "source" }.build());
        }
        self.settings.source_capacity = capacity;
        self
    }
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Cancel the pipeline when `token` is cancelled.
    ///
    /// The pipeline runs on a child of `token`, so cancelling one pipeline
    /// (or hitting its failure limit) never cancels the host.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.settings.shutdown = token;
        self
    }

    /// Cancel the pipeline after this many failures (0 = unlimited).
    pub fn max_failures(mut self, max_failures: usize) -> Self {
        self.settings.max_failures = max_failures;
        self
    }

    /// Cancel the pipeline if it is still running after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = Some(timeout);
        self
    }

    /// Append a stage running with `options`.
    pub fn stage<S>(mut self, stage: S, options: StageOptions) -> PipelineBuilder<S::Output>
    where
        S: Stage<Input = T>,
    {
        options.validate(stage.name(), &mut self.errors);
        self.stages.push(stage.name().to_string());

        let stage = Arc::new(stage);
        let launch = self.launch.map(|upstream| -> Launch<S::Output> {
            Box::new(move |wiring: &mut Wiring| {
                let input = SharedReceiver::new(upstream(wiring));
                let reporter = wiring.errors.reporter(stage.name());
                let outputs = fan_out(
                    Arc::clone(&stage),
                    options,
                    input,
                    &reporter,
                    &wiring.ctx,
                    &mut wiring.tasks,
                );
                fan_in(
                    outputs,
                    options.channel_capacity,
                    stage.name(),
                    &wiring.ctx,
                    &mut wiring.tasks,
                )
            })
        });

        PipelineBuilder {
            settings: self.settings,
            stages: self.stages,
            errors: self.errors,
            launch,
        }
    }

    /// Finish wiring with `sink` as the final consumer.
    pub fn build<K: Sink<T>>(self, sink: K) -> Result<Pipeline<T, K>, SetupError> {
        let mut errors = self.errors;
        if self.stages.is_empty() {
            errors.push(
                NoStagesSnafu {
                    pipeline: &*self.settings.name,
                }
                .build(),
            );
        }

        let launch = match self.launch {
            Some(launch) if errors.is_empty() => launch,
            Some(_) => return Err(collapse(errors)),
            None => {
                errors.insert(
                    0,
                    MissingSourceSnafu {
                        pipeline: &*self.settings.name,
                    }
                    .build(),
                );
                return Err(collapse(errors));
            }
        };

        Ok(Pipeline {
            settings: self.settings,
            stages: self.stages,
            launch,
            sink,
        })
    }
}

fn collapse(mut errors: Vec<SetupError>) -> SetupError {
    if errors.len() == 1
        && let Some(only) = errors.pop()
    {
        return only;
    }
    MultipleSetupErrorsSnafu {
        errors: errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
    }
    .build()
}

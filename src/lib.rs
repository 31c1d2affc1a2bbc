//! sluice: a concurrent pipeline execution engine.
//!
//! A pipeline pulls items from a [`Source`], pushes them through a chain of
//! [`Stage`]s, each fanned out over a pool of workers and merged back
//! together, and hands the survivors to a [`Sink`]. Items that fail are
//! reported once to the pipeline's [`ErrorSink`] and skipped downstream, so
//! one bad item never stops the others. Cancellation reaches every task
//! through a shared token, and a [`TokenBucket`] can throttle any stage.
//!
//! # Example
//!
//! ```no_run
//! use sluice::{Source, StageOptions, pipeline, stage, sink::VecSink};
//!
//! # async fn demo() -> Result<(), sluice::error::PipelineError> {
//! let double = stage::from_fn("double", |n: u64| async move { Ok(n * 2) });
//!
//! let report = pipeline::builder("numbers")
//!     .source(Source::from_iter(1..=5u64))
//!     .stage(double, StageOptions::new(4, 16))
//!     .build(VecSink::new())?
//!     .run()
//!     .await?;
//!
//! assert_eq!(report.stats.delivered, 5);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod channel;
pub mod config;
pub mod connectors;
pub mod context;
pub mod error;
pub mod error_sink;
pub mod fan;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod signal;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stages;
pub mod task;
pub mod topology;
pub mod tracing;

pub use context::{PipelineContext, PipelineState};
pub use error_sink::{ErrorReporter, ErrorSink, FailedItem, FailureStats};
pub use pipeline::{Outcome, Pipeline, PipelineBuilder, PipelineHandle, PipelineReport};
pub use rate_limit::{RejectPolicy, Throttle, TokenBucket};
pub use sink::Sink;
pub use source::Source;
pub use stage::{ItemResult, Stage, StageOptions};
pub use tracing::init_tracing;

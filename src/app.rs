//! The `sluice` binary's pipelines: read JSON files, store them as NDJSON.
//!
//! Each configured pipeline runs
//! `source -> fetch (FileFetcher) -> decode (JsonDecoder) -> store (NdjsonStore) -> sink`
//! with the fetch and store stages sharing one token bucket when a rate
//! limit is configured.

use std::sync::Arc;

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, PipelineConfig, PipelineKey};
use crate::connectors::{FileFetcher, JsonDecoder, NdjsonStore};
use crate::error::{
    AddressParseSnafu, ConnectorSnafu, MaxFailuresSnafu, MetricsSnafu, MissingSourceSnafu,
    PipelineError, WorkerPanickedSnafu,
};
use crate::error_sink::DeadLetterFile;
use crate::pipeline::{self, Outcome, PipelineStats};
use crate::rate_limit::{Throttle, TokenBucket};
use crate::signal::spawn_signal_handler;
use crate::sink::CountingSink;
use crate::source::Source;
use crate::stages::{DecodeStage, FetchStage, StoreStage};
use crate::topology::{PipelineExit, PipelineRunner, RunnablePipeline};

/// One configured file pipeline.
pub struct FilePipeline {
    key: PipelineKey,
    config: PipelineConfig,
}

impl FilePipeline {
    pub fn new(key: PipelineKey, config: PipelineConfig) -> Self {
        Self { key, config }
    }

    /// Build, run and report on the pipeline.
    pub async fn execute(self, shutdown: CancellationToken) -> Result<PipelineStats, PipelineError> {
        let FilePipeline { key, config } = self;

        let items = config.source.load_items()?;
        if items.is_empty() {
            return Err(MissingSourceSnafu {
                pipeline: key.to_string(),
            }
            .build()
            .into());
        }

        let fetcher = match &config.source.root {
            Some(root) => FileFetcher::with_root(root),
            None => FileFetcher::new(),
        };
        let store = NdjsonStore::open(&config.sink.path, config.sink.key_field.clone())
            .await
            .context(ConnectorSnafu {
                path: config.sink.path.clone(),
            })?;

        let mut fetch = FetchStage::new(fetcher);
        let mut persist = StoreStage::new(store);
        if let Some(rate_limit) = &config.rate_limit {
            let bucket = Arc::new(TokenBucket::new(rate_limit.rate, rate_limit.capacity())?);
            let throttle = Throttle::new(bucket, rate_limit.on_reject);
            fetch = fetch.with_throttle(throttle.clone());
            persist = persist.with_throttle(throttle);
        }

        let mut builder = pipeline::builder(key.id())
            .with_shutdown(shutdown)
            .max_failures(config.error_handling.max_failures);
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }

        debug!(pipeline = %key, items = items.len(), "Building pipeline");
        let report = builder
            .source(Source::from_iter(items))
            .stage(fetch, config.fetch)
            .stage(DecodeStage::new(JsonDecoder), config.decode)
            .stage(persist, config.store)
            .build(CountingSink::new())?
            .run()
            .await?;

        for failure in &report.task_failures {
            warn!(
                pipeline = %key,
                stage = %failure.stage,
                worker = failure.worker,
                "Worker panicked: {}",
                failure.message
            );
        }

        if let Some(dir) = &config.error_handling.dlq_path {
            let dlq = DeadLetterFile::in_dir(dir, key.id());
            dlq.write(&report.failures).await?;
        }

        info!(
            pipeline = %key,
            outcome = %report.outcome,
            "Stored {} record(s) in {}",
            report.sink.count(),
            config.sink.path.display()
        );

        ensure!(
            report.outcome != Outcome::Aborted,
            MaxFailuresSnafu {
                count: report.stats.failed
            }
        );
        ensure!(
            report.outcome != Outcome::Failed,
            WorkerPanickedSnafu {
                count: report.task_failures.len()
            }
        );
        Ok(report.stats)
    }
}

impl RunnablePipeline for FilePipeline {
    type Key = PipelineKey;
    type Output = PipelineStats;
    type Error = PipelineError;

    fn key(&self) -> &PipelineKey {
        &self.key
    }

    async fn run(self, shutdown: CancellationToken) -> Result<PipelineStats, PipelineError> {
        self.execute(shutdown).await
    }
}

/// Start metrics, install the signal handler and run every configured
/// pipeline. Returns whether all of them succeeded.
pub async fn run_pipelines(config: Config) -> Result<bool, PipelineError> {
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        crate::metrics::init_global(addr).context(MetricsSnafu)?;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let pipelines = config
        .pipelines
        .into_iter()
        .map(|(key, pipeline)| FilePipeline::new(key, pipeline))
        .collect();

    let exits = PipelineRunner::new(pipelines, shutdown)
        .start_jitter_secs(config.global.start_jitter_secs)
        .shutdown_timeout(config.global.shutdown_timeout())
        .run()
        .await;

    let failed = exits.iter().filter(|(_, exit)| !exit.is_success()).count();
    for (key, exit) in &exits {
        if let PipelineExit::Finished(stats) = exit {
            info!(
                pipeline = %key,
                "{} emitted, {} delivered, {} failed, {} discarded",
                stats.emitted,
                stats.delivered,
                stats.failed,
                stats.discarded
            );
        }
    }
    if failed > 0 {
        warn!("{failed} of {} pipeline(s) did not succeed", exits.len());
    }
    Ok(failed == 0)
}

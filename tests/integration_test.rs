//! Integration tests for sluice

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use sluice::connectors::{JsonDecoder, Record};
use sluice::error::{BoxError, FailureKind};
use sluice::sink::{CountingSink, VecSink};
use sluice::stages::{DecodeStage, FetchStage, Fetcher, Store, StoreStage, WorkItem};
use sluice::{Outcome, PipelineState, Source, StageOptions, pipeline, stage};

/// Serves canned payloads; unknown items fail like a refused connection.
struct MemoryFetcher {
    payloads: HashMap<String, Bytes>,
}

impl MemoryFetcher {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            payloads: entries
                .iter()
                .map(|(k, v)| (k.to_string(), Bytes::from(v.to_string())))
                .collect(),
        }
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    type Payload = Bytes;

    async fn fetch(&self, item: &str) -> Result<Bytes, BoxError> {
        self.payloads
            .get(item)
            .cloned()
            .ok_or_else(|| "connection refused".into())
    }
}

#[derive(Default, Clone)]
struct MemoryStore {
    records: Arc<Mutex<Vec<Record>>>,
}

#[async_trait]
impl Store for MemoryStore {
    type Record = Record;

    async fn store(&self, record: &Record) -> Result<(), BoxError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

fn todo_payload(id: u32) -> String {
    format!(r#"{{"id": {id}, "title": "todo {id}"}}"#)
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_one_failed_fetch_is_isolated() {
        let payloads: Vec<(String, String)> = [1, 2, 4, 5]
            .into_iter()
            .map(|n| (format!("u{n}"), todo_payload(n)))
            .collect();
        let entries: Vec<(&str, &str)> = payloads
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let store = MemoryStore::default();

        let report = pipeline::builder("todos")
            .source(Source::from_iter((1..=5).map(|n| format!("u{n}"))))
            .stage(
                FetchStage::new(MemoryFetcher::new(&entries)),
                StageOptions::new(3, 4),
            )
            .stage(DecodeStage::new(JsonDecoder), StageOptions::new(2, 4))
            .stage(StoreStage::new(store.clone()), StageOptions::new(2, 4))
            .build(VecSink::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.item(), "u3");
        assert_eq!(failure.kind(), FailureKind::Fetch);
        assert_eq!(failure.stage, "fetch");

        let mut origins: Vec<String> = report
            .sink
            .items()
            .iter()
            .map(|item: &WorkItem<Record>| item.origin().to_string())
            .collect();
        origins.sort();
        assert_eq!(origins, ["u1", "u2", "u4", "u5"]);
        assert_eq!(store.records.lock().await.len(), 4);

        assert_eq!(report.stats.emitted, 5);
        assert_eq!(report.stats.delivered, 4);
        assert_eq!(report.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_failed_decode_is_never_stored() {
        let entries = [("good", r#"{"id": 1}"#), ("bad", "{not json")];
        let store = MemoryStore::default();

        let report = pipeline::builder("decode")
            .source(Source::from_iter(["good".to_string(), "bad".to_string()]))
            .stage(FetchStage::new(MemoryFetcher::new(&entries)), StageOptions::default())
            .stage(DecodeStage::new(JsonDecoder), StageOptions::default())
            .stage(StoreStage::new(store.clone()), StageOptions::default())
            .build(CountingSink::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.sink.count(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind(), FailureKind::Decode);
        assert_eq!(report.failures[0].item(), "bad");
        assert_eq!(store.records.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fan_in_delivers_every_item_from_every_worker() {
        const WORKERS: usize = 6;
        const ITEMS: u64 = 1_000;

        let report = pipeline::builder("fan")
            .source(Source::from_iter(0..ITEMS))
            .stage(
                stage::from_fn("spread", |n: u64| async move {
                    if n % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                    Ok(n)
                }),
                StageOptions::new(WORKERS, 8),
            )
            .build(VecSink::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        let mut items = report.sink.into_items();
        items.sort();
        assert_eq!(items, (0..ITEMS).collect::<Vec<_>>());
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_terminates_every_stage() {
        let fetcher = MemoryFetcher::new(&[("item", r#"{"id": 1}"#)]);

        let handle = pipeline::builder("endless")
            .source(Source::repeat(vec!["item".to_string()]))
            .stage(FetchStage::new(fetcher), StageOptions::new(4, 2))
            .stage(DecodeStage::new(JsonDecoder), StageOptions::new(2, 2))
            .stage(
                stage::from_fn("slow", |item: WorkItem<Record>| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(item)
                }),
                StageOptions::new(3, 2),
            )
            .build(CountingSink::new())
            .unwrap()
            .start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.state(), PipelineState::Running);
        handle.cancel();

        let mut state = handle.watch_state();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(report.sink.count() > 0);
        assert!(report.task_failures.is_empty());
        assert_eq!(*state.borrow_and_update(), PipelineState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_host_token_stops_several_pipelines() {
        let host = CancellationToken::new();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                pipeline::builder(format!("p{i}"))
                    .with_shutdown(host.clone())
                    .source(Source::repeat_with(|| 1u32))
                    .stage(
                        stage::from_fn("tick", |n: u32| async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(n)
                        }),
                        StageOptions::new(2, 1),
                    )
                    .build(CountingSink::new())
                    .unwrap()
                    .start()
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        host.cancel();

        for handle in handles {
            let report = handle.wait().await.unwrap();
            assert_eq!(report.outcome, Outcome::Cancelled);
        }
    }
}

mod config_tests {
    use sluice::config::{Config, PipelineKey};
    use sluice::rate_limit::RejectPolicy;

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
global:
  start_jitter_secs: 1
  shutdown_timeout_secs: 10
metrics:
  address: 127.0.0.1:9100
pipelines:
  todos:
    source:
      items: ["file:///data/1.json", "/data/2.json"]
    fetch:
      workers: 8
    decode:
      workers: 2
    rate_limit:
      rate: 20
      capacity: 40
      on_reject: wait
    sink:
      path: out/todos.ndjson
      key_field: id
    error_handling:
      max_failures: 3
  users:
    source:
      items_file: users.txt
    sink:
      path: out/users.ndjson
"#;
        let config = Config::parse(yaml).unwrap();

        assert_eq!(config.pipelines.len(), 2);
        let todos = &config.pipelines[&PipelineKey::new("todos")];
        assert_eq!(todos.fetch.workers, 8);
        assert_eq!(todos.decode.workers, 2);
        assert_eq!(todos.store.workers, 1);
        let rate_limit = todos.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.capacity(), 40);
        assert_eq!(rate_limit.on_reject, RejectPolicy::Wait);
        assert_eq!(config.global.shutdown_timeout_secs, 10);
        assert_eq!(config.metrics.address, "127.0.0.1:9100");
    }

    #[test]
    fn test_config_requires_pipelines() {
        assert!(Config::parse("global: {}").is_err());
    }
}

mod app_tests {
    use super::*;
    use sluice::app::FilePipeline;
    use sluice::config::{Config, PipelineConfig, PipelineKey, RateLimitConfig};
    use sluice::error::PipelineError;
    use sluice::rate_limit::RejectPolicy;
    use std::path::Path;

    fn write_items(dir: &Path) {
        for n in [1, 2, 4, 5] {
            std::fs::write(dir.join(format!("u{n}.json")), todo_payload(n)).unwrap();
        }
        std::fs::write(dir.join("u3.json"), "[\"not an object\"]").unwrap();
    }

    fn file_pipeline(dir: &Path, configure: impl FnOnce(&mut PipelineConfig)) -> FilePipeline {
        let yaml = format!(
            r#"
pipelines:
  todos:
    source:
      items: [u1.json, u2.json, u3.json, u4.json, u5.json]
      root: {root}
    fetch:
      workers: 2
    sink:
      path: {root}/out/todos.ndjson
      key_field: id
    error_handling:
      dlq_path: {root}/failures
"#,
            root = dir.display()
        );
        let mut config = Config::parse(&yaml).unwrap();
        let (key, mut pipeline) = config.pipelines.shift_remove_index(0).unwrap();
        assert_eq!(key, PipelineKey::new("todos"));
        configure(&mut pipeline);
        FilePipeline::new(key, pipeline)
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[tokio::test]
    async fn test_files_are_stored_and_failures_dead_lettered() {
        let dir = tempfile::tempdir().unwrap();
        write_items(dir.path());

        let stats = file_pipeline(dir.path(), |_| {})
            .execute(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.emitted, 5);
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(line_count(&dir.path().join("out/todos.ndjson")), 4);

        let dlq_files: Vec<_> = std::fs::read_dir(dir.path().join("failures"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(dlq_files.len(), 1);
        let dlq = std::fs::read_to_string(&dlq_files[0]).unwrap();
        assert_eq!(dlq.lines().count(), 1);
        assert!(dlq.contains("u3.json"));
        assert!(dlq.contains("\"decode\""));
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate_records() {
        let dir = tempfile::tempdir().unwrap();
        write_items(dir.path());

        for _ in 0..2 {
            file_pipeline(dir.path(), |p| p.error_handling.dlq_path = None)
                .execute(CancellationToken::new())
                .await
                .unwrap();
        }
        assert_eq!(line_count(&dir.path().join("out/todos.ndjson")), 4);
    }

    #[tokio::test]
    async fn test_max_failures_aborts_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        write_items(dir.path());

        let pipeline = file_pipeline(dir.path(), |p| p.error_handling.max_failures = 1);
        let err = pipeline.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::MaxFailures { count: 1 }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_items_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("items.txt");
        std::fs::write(&empty, "# nothing yet\n").unwrap();

        let pipeline = file_pipeline(dir.path(), |p| {
            p.source.items.clear();
            p.source.items_file = Some(empty);
        });
        let err = pipeline.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Setup { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_pipeline_completes() {
        let dir = tempfile::tempdir().unwrap();
        write_items(dir.path());

        let stats = file_pipeline(dir.path(), |p| {
            p.rate_limit = Some(RateLimitConfig {
                rate: 2,
                capacity: None,
                on_reject: RejectPolicy::Wait,
            })
        })
        .execute(CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(stats.delivered, 4);
    }
}

//! Fan-out and fan-in.
//!
//! [`fan_out`] starts N workers of one stage pulling from a shared input,
//! each with its own bounded output. [`fan_in`] merges several receivers
//! into one, closing the merged output once every source is exhausted.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{SendOutcome, SharedReceiver, recv_or_cancel, send_or_cancel};
use crate::context::PipelineContext;
use crate::error_sink::ErrorReporter;
use crate::stage::{ItemResult, Stage, StageOptions, StageWorker};
use crate::task::{TaskLabel, TaskSet, TaskStats};

/// Start `options.workers` workers of `stage` on `input`.
///
/// Returns one output receiver per worker. Workers are registered in
/// `tasks` under the stage's name.
pub fn fan_out<S: Stage>(
    stage: Arc<S>,
    options: StageOptions,
    input: SharedReceiver<ItemResult<S::Input>>,
    errors: &ErrorReporter,
    ctx: &PipelineContext,
    tasks: &mut TaskSet,
) -> Vec<mpsc::Receiver<ItemResult<S::Output>>> {
    let name: Arc<str> = Arc::from(stage.name());
    let active = Arc::new(AtomicUsize::new(0));

    let outputs = (0..options.workers)
        .map(|worker| {
            let (tx, rx) = mpsc::channel(options.channel_capacity);
            let task = StageWorker::new(
                Arc::clone(&stage),
                worker,
                input.clone(),
                tx,
                errors.clone(),
                ctx.clone(),
                Arc::clone(&active),
            );
            tasks.spawn(TaskLabel::new(Arc::clone(&name), worker), task.run());
            rx
        })
        .collect();

    debug!("[{}] Fanned out to {} workers", name, options.workers);
    outputs
}

/// Merge `sources` into a single receiver.
///
/// One forwarder per source holds a clone of the merged sender; the
/// original is dropped here, so the merged output closes exactly when the
/// last forwarder exits. A single source is returned as is.
pub fn fan_in<T: Send + 'static>(
    mut sources: Vec<mpsc::Receiver<T>>,
    capacity: usize,
    label: &str,
    ctx: &PipelineContext,
    tasks: &mut TaskSet,
) -> mpsc::Receiver<T> {
    if sources.len() == 1
        && let Some(only) = sources.pop()
    {
        return only;
    }

    let (tx, rx) = mpsc::channel(capacity);
    let stage: Arc<str> = Arc::from(format!("{label}.fan_in"));

    for (index, source) in sources.into_iter().enumerate() {
        tasks.spawn(
            TaskLabel::new(Arc::clone(&stage), index),
            forward(source, tx.clone(), ctx.clone()),
        );
    }

    rx
}

async fn forward<T: Send + 'static>(
    mut source: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    ctx: PipelineContext,
) -> TaskStats {
    let _guard = ctx.enter_task();
    let shutdown = ctx.shutdown().clone();
    let mut stats = TaskStats::default();

    while let Some(item) = recv_or_cancel(&mut source, &shutdown).await {
        match send_or_cancel(&tx, item, &shutdown).await {
            SendOutcome::Sent => stats.handled += 1,
            SendOutcome::Cancelled => {
                stats.discarded += 1;
                break;
            }
            SendOutcome::Closed => break,
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_sink::ErrorSink;
    use crate::stage::from_fn;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn context() -> PipelineContext {
        PipelineContext::new("test", CancellationToken::new())
    }

    async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_fan_in_is_complete() {
        const SOURCES: usize = 6;
        const ITEMS: usize = 250;

        let ctx = context();
        let mut tasks = TaskSet::new();
        let mut receivers = Vec::new();
        let mut producers = Vec::new();

        for s in 0..SOURCES {
            let (tx, rx) = mpsc::channel(4);
            receivers.push(rx);
            producers.push(tokio::spawn(async move {
                for i in 0..ITEMS {
                    tx.send((s, i)).await.unwrap();
                }
            }));
        }

        let merged = fan_in(receivers, 8, "numbers", &ctx, &mut tasks);
        let mut items = collect(merged).await;

        for p in producers {
            p.await.unwrap();
        }
        let summary = tasks.join_all().await;

        assert_eq!(items.len(), SOURCES * ITEMS);
        items.sort();
        items.dedup();
        assert_eq!(items.len(), SOURCES * ITEMS);
        assert_eq!(summary.stage("numbers.fan_in").handled, SOURCES * ITEMS);
    }

    #[tokio::test]
    async fn test_fan_in_closes_once_and_stays_closed() {
        let ctx = context();
        let mut tasks = TaskSet::new();
        let (a_tx, a_rx) = mpsc::channel::<u8>(1);
        let (b_tx, b_rx) = mpsc::channel::<u8>(1);

        let mut merged = fan_in(vec![a_rx, b_rx], 2, "pair", &ctx, &mut tasks);
        drop(a_tx);
        b_tx.send(7).await.unwrap();
        drop(b_tx);

        assert_eq!(merged.recv().await, Some(7));
        assert_eq!(merged.recv().await, None);
        assert_eq!(merged.recv().await, None);
        assert!(tasks.join_all().await.failures.is_empty());
    }

    #[tokio::test]
    async fn test_fan_in_with_no_sources_is_closed() {
        let ctx = context();
        let mut tasks = TaskSet::new();
        let mut merged = fan_in(Vec::<mpsc::Receiver<u8>>::new(), 1, "empty", &ctx, &mut tasks);
        assert_eq!(merged.recv().await, None);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_single_source_passes_through() {
        let ctx = context();
        let mut tasks = TaskSet::new();
        let (tx, rx) = mpsc::channel(1);
        let mut merged = fan_in(vec![rx], 1, "single", &ctx, &mut tasks);
        assert!(tasks.is_empty());

        tx.send(1).await.unwrap();
        assert_eq!(merged.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_in_stops_on_cancel() {
        let ctx = context();
        let mut tasks = TaskSet::new();
        let (tx, rx) = mpsc::channel::<u32>(1);
        let (tx2, rx2) = mpsc::channel::<u32>(1);

        let merged = fan_in(vec![rx, rx2], 1, "stuck", &ctx, &mut tasks);
        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.cancel();

        // Sources are still open; cancellation alone ends the forwarders.
        assert!(collect(merged).await.is_empty());
        assert!(tasks.join_all().await.failures.is_empty());
        assert_eq!(ctx.active_tasks(), 0);
        drop((tx, tx2));
    }

    #[tokio::test]
    async fn test_fan_out_then_fan_in() {
        let ctx = context();
        let sink = ErrorSink::new("test", 0, ctx.shutdown().clone());
        let mut tasks = TaskSet::new();

        let (in_tx, in_rx) = mpsc::channel(8);
        let square = Arc::new(from_fn("square", |n: u64| async move {
            tokio::task::yield_now().await;
            Ok(n * n)
        }));

        let outputs = fan_out(
            square,
            StageOptions::new(4, 2),
            SharedReceiver::new(in_rx),
            &sink.reporter("square"),
            &ctx,
            &mut tasks,
        );
        assert_eq!(outputs.len(), 4);
        let merged = fan_in(outputs, 2, "square", &ctx, &mut tasks);

        let producer = tokio::spawn(async move {
            for n in 1..=100u64 {
                in_tx.send(Ok(n)).await.unwrap();
            }
        });

        let results = collect(merged).await;
        producer.await.unwrap();
        let summary = tasks.join_all().await;

        let sum: u64 = results.into_iter().map(|r| r.unwrap()).sum();
        assert_eq!(sum, (1..=100u64).map(|n| n * n).sum::<u64>());
        assert_eq!(summary.stage("square").handled, 100);
        assert!(sink.drain().await.is_empty());
    }
}

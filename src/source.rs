//! Pipeline sources.
//!
//! A [`Source`] wraps any stream of items. The constructors cover a literal
//! sequence, a lazy generator, an async stream, and the infinite generators
//! (`repeat`, `repeat_with`) that are only useful combined with
//! [`Source::take`] or cancellation.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::{SendOutcome, send_or_cancel};
use crate::context::{PipelineContext, PipelineState};
use crate::emit;
use crate::metrics::events::ItemsEmitted;
use crate::stage::ItemResult;
use crate::task::TaskStats;

/// The items a pipeline feeds into its first stage.
pub struct Source<T> {
    stream: BoxStream<'static, T>,
}

impl<T: Send + 'static> Source<T> {
    /// Lazy generator: items are produced on demand until `f` returns `None`.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut() -> Option<T> + Send + 'static,
    {
        Self::from_stream(stream::iter(std::iter::from_fn(f)))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Cycle through `values` forever. An empty `values` yields nothing.
    pub fn repeat(values: Vec<T>) -> Self
    where
        T: Clone,
    {
        Self::from_stream(stream::iter(values.into_iter().cycle()))
    }

    /// Call `f` forever.
    pub fn repeat_with<F>(f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::from_stream(stream::repeat_with(f))
    }

    /// Only the first `n` items.
    pub fn take(self, n: usize) -> Self {
        Self::from_stream(self.stream.take(n))
    }

    /// Apply `f` to every item.
    pub fn map<U, F>(self, f: F) -> Source<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Source::from_stream(self.stream.map(f))
    }

    /// Feed every item into `tx` until the stream ends or cancellation fires.
    ///
    /// Moves the pipeline to `Draining` when the stream is exhausted.
    pub(crate) async fn run(
        mut self,
        tx: mpsc::Sender<ItemResult<T>>,
        ctx: PipelineContext,
    ) -> TaskStats {
        let _guard = ctx.enter_task();
        let shutdown = ctx.shutdown().clone();
        let mut stats = TaskStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.stream.next() => next,
            };

            let Some(item) = next else {
                info!(
                    pipeline = %ctx.name(),
                    "[source] Exhausted after {} items, draining", stats.handled
                );
                ctx.transition(PipelineState::Draining);
                break;
            };

            match send_or_cancel(&tx, Ok(item), &shutdown).await {
                SendOutcome::Sent => {
                    stats.handled += 1;
                    emit!(ItemsEmitted {
                        count: 1,
                        pipeline: ctx.name().to_string(),
                    });
                }
                SendOutcome::Cancelled => {
                    stats.discarded += 1;
                    break;
                }
                SendOutcome::Closed => break,
            }
        }

        debug!(pipeline = %ctx.name(), "[source] Stopped");
        stats
    }
}

impl<T: Send + 'static> FromIterator<T> for Source<T> {
    /// Literal sequence, collected up front.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let items: Vec<T> = iter.into_iter().collect();
        Self::from_stream(stream::iter(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    async fn run_to_vec<T: Send + 'static>(source: Source<T>) -> (Vec<T>, PipelineContext) {
        let ctx = PipelineContext::new("test", CancellationToken::new());
        ctx.transition(PipelineState::Running);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(source.run(tx, ctx.clone()));

        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item.unwrap_or_else(|e| panic!("unexpected failure {e}")));
        }
        handle.await.unwrap();
        (items, ctx)
    }

    #[tokio::test]
    async fn test_from_iter_emits_in_order_then_drains() {
        let (items, ctx) = run_to_vec(Source::from_iter(["u1", "u2", "u3"])).await;
        assert_eq!(items, vec!["u1", "u2", "u3"]);
        assert_eq!(ctx.state(), PipelineState::Draining);
    }

    #[tokio::test]
    async fn test_from_fn_is_lazy() {
        let mut n = 0;
        let source = Source::from_fn(move || {
            n += 1;
            (n <= 3).then_some(n)
        });
        let (items, _) = run_to_vec(source).await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_repeat_take() {
        let (items, _) = run_to_vec(Source::repeat(vec![1, 2]).take(5)).await;
        assert_eq!(items, vec![1, 2, 1, 2, 1]);
    }

    #[tokio::test]
    async fn test_repeat_with_take_and_map() {
        let source = Source::repeat_with(|| 7).take(3).map(|n| n * 2);
        let (items, _) = run_to_vec(source).await;
        assert_eq!(items, vec![14, 14, 14]);
    }

    #[tokio::test]
    async fn test_empty_repeat_terminates() {
        let (items, _) = run_to_vec(Source::<u8>::repeat(Vec::new())).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_infinite_source_stops_on_cancel() {
        let ctx = PipelineContext::new("test", CancellationToken::new());
        ctx.transition(PipelineState::Running);
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(Source::repeat_with(|| 1u8).run(tx, ctx.clone()));

        for _ in 0..10 {
            assert!(rx.recv().await.is_some());
        }
        ctx.cancel();

        let stats = handle.await.unwrap();
        assert!(stats.handled >= 10);
        // Cancelled, not exhausted.
        assert_eq!(ctx.state(), PipelineState::Running);
        assert_eq!(ctx.active_tasks(), 0);
    }
}

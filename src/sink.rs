//! Pipeline sinks.
//!
//! The sink is the last consumer of a pipeline. It only sees successful
//! items; failures have already been reported to the error sink by the stage
//! that produced them.

use async_trait::async_trait;

/// Final consumer of a pipeline's successful items.
#[async_trait]
pub trait Sink<T>: Send + 'static {
    /// Accept one item.
    async fn accept(&mut self, item: T);

    /// Called once after the last item, including after cancellation.
    async fn finish(&mut self) {}
}

/// Collects every item in memory.
#[derive(Debug)]
pub struct VecSink<T> {
    items: Vec<T>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for VecSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for VecSink<T> {
    async fn accept(&mut self, item: T) {
        self.items.push(item);
    }
}

/// Counts items and discards them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountingSink {
    count: usize,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for CountingSink {
    async fn accept(&mut self, _item: T) {
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_sink_keeps_order() {
        let mut sink = VecSink::new();
        for i in 0..3 {
            sink.accept(i).await;
        }
        Sink::<i32>::finish(&mut sink).await;
        assert_eq!(sink.into_items(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_counting_sink() {
        let mut sink = CountingSink::new();
        sink.accept("a").await;
        sink.accept("b").await;
        assert_eq!(sink.count(), 2);
    }
}

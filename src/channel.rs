//! Cancellation-aware channel helpers.
//!
//! Every receive and send in a pipeline goes through these so that
//! cancellation is always checked first and a closed peer ends the caller
//! quietly instead of erroring.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Result of a cancellation-aware send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Cancellation fired first; the item was dropped.
    Cancelled,
    /// The receiver is gone; the item was dropped.
    Closed,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Send `item`, giving up if cancellation fires or the receiver is dropped.
pub async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    shutdown: &CancellationToken,
) -> SendOutcome {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => SendOutcome::Cancelled,
        result = tx.send(item) => match result {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Closed,
        },
    }
}

/// Receive the next item, or `None` if cancellation fires or the channel ends.
pub async fn recv_or_cancel<T>(
    rx: &mut mpsc::Receiver<T>,
    shutdown: &CancellationToken,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Forward everything from `input` until it ends or `shutdown` fires.
///
/// The returned receiver closes as soon as either happens, so consumers can
/// iterate it without checking cancellation themselves.
pub fn or_done<T: Send + 'static>(
    mut input: mpsc::Receiver<T>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(item) = recv_or_cancel(&mut input, &shutdown).await {
            if !send_or_cancel(&tx, item, &shutdown).await.is_sent() {
                break;
            }
        }
    });
    rx
}

/// A receiver shared by several workers.
///
/// Whichever worker is idle takes the next item, which gives work stealing
/// without any partitioning of the input.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next item, or `None` once the channel is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }

    /// Like [`recv`](Self::recv) but returns `None` as soon as cancellation
    /// fires, including while waiting for another worker to release the
    /// receiver.
    pub async fn recv_or_cancel(&self, shutdown: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            item = self.recv() => item,
        }
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

//! Stages for the fetch → decode → store flow.
//!
//! Each stage delegates its side effect to an injected collaborator
//! ([`Fetcher`], [`Decoder`], [`Store`]) and carries the originating item
//! alongside the payload in a [`WorkItem`], so a failure anywhere
//! downstream can still be attributed to the input that caused it.

mod decode;
mod fetch;
mod store;

pub use decode::{DecodeStage, Decoder};
pub use fetch::{FetchStage, Fetcher};
pub use store::{Store, StoreStage};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ItemError;
use crate::rate_limit::{Admission, Throttle};

/// A payload together with the source item it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem<T> {
    origin: Arc<str>,
    payload: T,
}

impl<T> WorkItem<T> {
    pub fn new(origin: impl Into<Arc<str>>, payload: T) -> Self {
        Self {
            origin: origin.into(),
            payload,
        }
    }

    /// The source item this payload came from.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Replace the payload, keeping the origin.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WorkItem<U> {
        WorkItem {
            origin: self.origin,
            payload: f(self.payload),
        }
    }
}

/// Ask `throttle` (if any) for a token on behalf of `item`.
///
/// `Ok(true)` means proceed, `Ok(false)` means cancellation fired while
/// waiting and the item should be dropped.
async fn admit(
    throttle: Option<&Throttle>,
    stage: &str,
    item: &str,
    shutdown: &CancellationToken,
) -> Result<bool, ItemError> {
    let Some(throttle) = throttle else {
        return Ok(true);
    };

    match throttle.admit(shutdown).await {
        Admission::Granted => Ok(true),
        Admission::Rejected => Err(ItemError::RateLimited {
            item: item.to_string(),
        }),
        Admission::Cancelled => {
            debug!("[{}] Cancelled while waiting for a token: {}", stage, item);
            Ok(false)
        }
    }
}

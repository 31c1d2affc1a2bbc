//! Fetch stage: turns a source item (URL, path, key) into a payload.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ItemError};
use crate::rate_limit::Throttle;
use crate::stage::Stage;

use super::{WorkItem, admit};

/// Remote or local transport for one item.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    type Payload: Send + 'static;

    async fn fetch(&self, item: &str) -> Result<Self::Payload, BoxError>;
}

/// Stage calling a [`Fetcher`] for every source item.
pub struct FetchStage<F> {
    name: String,
    fetcher: F,
    throttle: Option<Throttle>,
}

impl<F: Fetcher> FetchStage<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            name: "fetch".to_string(),
            fetcher,
            throttle: None,
        }
    }

    /// Rename the stage (for logs, metrics and failure attribution).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Take a token from `throttle` before every fetch.
    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }
}

#[async_trait]
impl<F: Fetcher> Stage for FetchStage<F> {
    type Input = String;
    type Output = WorkItem<F::Payload>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        item: String,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Self::Output>, ItemError> {
        if !admit(self.throttle.as_ref(), &self.name, &item, shutdown).await? {
            return Ok(Vec::new());
        }

        match self.fetcher.fetch(&item).await {
            Ok(payload) => Ok(vec![WorkItem::new(item, payload)]),
            Err(e) => Err(ItemError::Fetch {
                item,
                message: e.to_string(),
            }),
        }
    }
}

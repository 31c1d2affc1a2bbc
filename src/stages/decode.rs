//! Decode stage: parses fetched payloads into records.
//!
//! Decoding is CPU work, so it runs on tokio's blocking pool and never
//! stalls the async workers of other stages.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ItemError};
use crate::stage::Stage;

use super::WorkItem;

/// Parses one payload into one record.
pub trait Decoder: Send + Sync + 'static {
    type Payload: Send + 'static;
    type Record: Send + 'static;

    fn decode(&self, payload: Self::Payload) -> Result<Self::Record, BoxError>;
}

/// Stage running a [`Decoder`] on the blocking pool.
pub struct DecodeStage<D> {
    name: String,
    decoder: Arc<D>,
}

impl<D: Decoder> DecodeStage<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            name: "decode".to_string(),
            decoder: Arc::new(decoder),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<D: Decoder> Stage for DecodeStage<D> {
    type Input = WorkItem<D::Payload>;
    type Output = WorkItem<D::Record>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        input: Self::Input,
        _: &CancellationToken,
    ) -> Result<Vec<Self::Output>, ItemError> {
        let origin = input.origin().to_string();
        let decoder = Arc::clone(&self.decoder);

        let decoded = tokio::task::spawn_blocking(move || {
            let WorkItem { origin, payload } = input;
            decoder
                .decode(payload)
                .map(|record| WorkItem { origin, payload: record })
                .map_err(|e| e.to_string())
        })
        .await;

        match decoded {
            Ok(Ok(record)) => Ok(vec![record]),
            Ok(Err(message)) => Err(ItemError::Decode {
                item: origin,
                message,
            }),
            Err(e) => Err(ItemError::Decode {
                item: origin,
                message: format!("decoder task failed: {e}"),
            }),
        }
    }
}

//! Store stage: persists decoded records.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ItemError};
use crate::rate_limit::Throttle;
use crate::stage::Stage;

use super::{WorkItem, admit};

/// Persistence layer for records.
///
/// Idempotent-insert semantics, if wanted, are up to the implementation.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Record: Send + Sync + 'static;

    async fn store(&self, record: &Self::Record) -> Result<(), BoxError>;
}

/// Stage handing every record to a [`Store`]. Stored records are passed on
/// to the sink unchanged.
pub struct StoreStage<S> {
    name: String,
    store: S,
    throttle: Option<Throttle>,
}

impl<S: Store> StoreStage<S> {
    pub fn new(store: S) -> Self {
        Self {
            name: "store".to_string(),
            store,
            throttle: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Take a token from `throttle` before every write.
    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: Store> Stage for StoreStage<S> {
    type Input = WorkItem<S::Record>;
    type Output = WorkItem<S::Record>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        input: Self::Input,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Self::Output>, ItemError> {
        if !admit(self.throttle.as_ref(), &self.name, input.origin(), shutdown).await? {
            return Ok(Vec::new());
        }

        match self.store.store(input.payload()).await {
            Ok(()) => Ok(vec![input]),
            Err(e) => Err(ItemError::Store {
                item: input.origin().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Store for MemoryStore {
        type Record = u32;

        async fn store(&self, record: &u32) -> Result<(), BoxError> {
            if *record == 0 {
                return Err("constraint violation".into());
            }
            self.rows.lock().unwrap().push(*record);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_passes_record_on() {
        let stage = StoreStage::new(MemoryStore::default());
        let out = stage
            .process(WorkItem::new("u2", 2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![WorkItem::new("u2", 2)]);
        assert_eq!(*stage.store().rows.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_store_failure() {
        let stage = StoreStage::new(MemoryStore::default()).named("db");
        let err = stage
            .process(WorkItem::new("u0", 0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.item(), "u0");
        assert_eq!(err.to_string(), "Failed to store u0: constraint violation");
        assert_eq!(Stage::name(&stage), "db");
    }
}

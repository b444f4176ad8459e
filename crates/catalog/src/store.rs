//! Append-only product event streams.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use forgelist_core::{ExpectedVersion, ProductId};

use crate::product::ProductEvent;

/// A product event with its assigned stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProductEvent {
    pub event_id: Uuid,
    /// 1-based position in the product stream.
    pub sequence_number: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: ProductEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogStoreError {
    #[error("concurrency conflict on product {product_id}: expected {expected:?}, actual {actual}")]
    Concurrency {
        product_id: ProductId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("event for product {found} appended to stream {stream}")]
    StreamMismatch { stream: ProductId, found: ProductId },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Product event stream storage.
pub trait CatalogStore: Send + Sync {
    /// All events of one product, in stream order. Empty if unknown.
    fn load(&self, product_id: ProductId) -> Result<Vec<StoredProductEvent>, CatalogStoreError>;

    /// Append events atomically if the stream is at `expected`.
    fn append(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        events: Vec<ProductEvent>,
    ) -> Result<Vec<StoredProductEvent>, CatalogStoreError>;

    fn product_ids(&self) -> Result<Vec<ProductId>, CatalogStoreError>;
}

impl<S> CatalogStore for Arc<S>
where
    S: CatalogStore + ?Sized,
{
    fn load(&self, product_id: ProductId) -> Result<Vec<StoredProductEvent>, CatalogStoreError> {
        (**self).load(product_id)
    }

    fn append(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        events: Vec<ProductEvent>,
    ) -> Result<Vec<StoredProductEvent>, CatalogStoreError> {
        (**self).append(product_id, expected, events)
    }

    fn product_ids(&self) -> Result<Vec<ProductId>, CatalogStoreError> {
        (**self).product_ids()
    }
}

/// In-memory catalog store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    streams: RwLock<HashMap<ProductId, Vec<StoredProductEvent>>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn load(&self, product_id: ProductId) -> Result<Vec<StoredProductEvent>, CatalogStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| CatalogStoreError::Storage("catalog lock poisoned".into()))?;
        Ok(streams.get(&product_id).cloned().unwrap_or_default())
    }

    fn append(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        events: Vec<ProductEvent>,
    ) -> Result<Vec<StoredProductEvent>, CatalogStoreError> {
        if let Some(e) = events.iter().find(|e| e.product_id() != product_id) {
            return Err(CatalogStoreError::StreamMismatch {
                stream: product_id,
                found: e.product_id(),
            });
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| CatalogStoreError::Storage("catalog lock poisoned".into()))?;
        let stream = streams.entry(product_id).or_default();

        let actual = stream.len() as u64;
        if !expected.matches(actual) {
            return Err(CatalogStoreError::Concurrency {
                product_id,
                expected,
                actual,
            });
        }

        let recorded_at = Utc::now();
        let stored: Vec<StoredProductEvent> = events
            .into_iter()
            .enumerate()
            .map(|(idx, event)| StoredProductEvent {
                event_id: Uuid::now_v7(),
                sequence_number: actual + idx as u64 + 1,
                recorded_at,
                event,
            })
            .collect();

        stream.extend(stored.iter().cloned());
        Ok(stored)
    }

    fn product_ids(&self) -> Result<Vec<ProductId>, CatalogStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| CatalogStoreError::Storage("catalog lock poisoned".into()))?;
        let mut ids: Vec<_> = streams.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

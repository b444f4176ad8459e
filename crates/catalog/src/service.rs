//! Command execution for the canonical catalog.
//!
//! ```text
//! command → load stream → rehydrate → handle → append (optimistic) → publish
//! ```
//!
//! Publication happens only after a successful append. A failed publish is
//! reported to the caller; the facts are already stored.

use chrono::Utc;
use tracing::{debug, warn};

use forgelist_core::{Aggregate, AggregateRoot, DomainError, ExpectedVersion, Platform, ProductId};
use forgelist_events::{EventBus, EventEnvelope};

use crate::product::{Product, ProductCommand, ProductEvent, ProductStatus};
use crate::store::{CatalogStore, CatalogStoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(CatalogStoreError),
    /// Stored but not published; consumers will miss it until republished.
    #[error("publish failed after append: {0}")]
    Publish(String),
}

impl From<CatalogStoreError> for CatalogError {
    fn from(value: CatalogStoreError) -> Self {
        match value {
            CatalogStoreError::Concurrency { .. } => {
                CatalogError::Domain(DomainError::conflict(value.to_string()))
            }
            other => CatalogError::Store(other),
        }
    }
}

impl CatalogError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Domain(e) if e.is_conflict())
    }
}

/// Owning service layer of the canonical store.
pub struct CatalogService<S, B>
where
    S: CatalogStore,
    B: EventBus<EventEnvelope<ProductEvent>>,
{
    store: S,
    bus: B,
}

impl<S, B> CatalogService<S, B>
where
    S: CatalogStore,
    B: EventBus<EventEnvelope<ProductEvent>>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Current state of a product, or `None` if it was never created.
    pub fn get(&self, product_id: ProductId) -> Result<Option<Product>, CatalogError> {
        let product = self.rehydrate(product_id)?;
        Ok(product.is_created().then_some(product))
    }

    /// Execute a command against one product and publish what it produced.
    ///
    /// Returns the produced events; an empty vector means the command was a no-op.
    pub fn execute(
        &self,
        product_id: ProductId,
        command: ProductCommand,
    ) -> Result<Vec<ProductEvent>, CatalogError> {
        let product = self.rehydrate(product_id)?;
        let events = product.handle(&command)?;
        if events.is_empty() {
            return Ok(events);
        }

        let stored = self.store.append(
            product_id,
            ExpectedVersion::Exact(product.version()),
            events.clone(),
        )?;

        debug!(
            product_id = %product_id,
            count = stored.len(),
            "appended product events"
        );

        for s in stored {
            let envelope = EventEnvelope::new(s.event_id, product_id, s.sequence_number, s.event);
            if let Err(err) = self.bus.publish(envelope) {
                warn!(product_id = %product_id, error = ?err, "failed to publish product event");
                return Err(CatalogError::Publish(format!("{err:?}")));
            }
        }

        Ok(events)
    }

    /// Transition an active product to sold on `platform`.
    ///
    /// Exactly one caller wins a race: losers observe the winner through
    /// [`SaleOutcome::AlreadySold`] instead of an error.
    pub fn mark_sold(
        &self,
        product_id: ProductId,
        platform: Platform,
    ) -> Result<SaleOutcome, CatalogError> {
        let command = ProductCommand::MarkSold {
            sold_on: Some(platform),
            occurred_at: Utc::now(),
        };
        match self.execute(product_id, command) {
            Ok(_) => Ok(SaleOutcome::Transitioned),
            Err(err) if err.is_conflict() => {
                let product = self
                    .get(product_id)?
                    .ok_or(CatalogError::Domain(DomainError::NotFound))?;
                match product.status() {
                    ProductStatus::Sold => Ok(SaleOutcome::AlreadySold {
                        sold_on: product.sold_on(),
                    }),
                    // Lost a race with some other transition; the caller re-reads next pass.
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn rehydrate(&self, product_id: ProductId) -> Result<Product, CatalogError> {
        let history = self.store.load(product_id)?;
        let mut product = Product::empty(product_id);
        for stored in &history {
            product.apply(&stored.event);
        }
        Ok(product)
    }
}

/// Result of asking the catalog to record a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleOutcome {
    /// This call moved the product from active to sold.
    Transitioned,
    /// The product was already sold (possibly on another platform).
    AlreadySold { sold_on: Option<Platform> },
}

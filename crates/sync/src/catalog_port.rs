//! What the engine needs from the canonical catalog.
//!
//! The engine reads products and requests sale transitions; it never appends
//! product events itself.

use forgelist_catalog::{
    CatalogError, CatalogService, CatalogStore, ProductCommand, ProductEvent, ProductStatus,
    SaleOutcome,
};
use forgelist_core::{Platform, Price, ProductId};
use forgelist_events::{EventBus, EventEnvelope};

/// The fields of a product the reconciler diffs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSnapshot {
    pub product_id: ProductId,
    pub status: ProductStatus,
    pub price: Price,
    pub stock: u32,
    pub brand: String,
    pub model: String,
    pub sold_on: Option<Platform>,
}

pub trait CatalogPort: Send + Sync {
    fn product(&self, product_id: ProductId) -> Result<Option<ProductSnapshot>, CatalogError>;

    /// Transition an active product to sold; at most one caller transitions.
    fn mark_sold(
        &self,
        product_id: ProductId,
        platform: Platform,
    ) -> Result<SaleOutcome, CatalogError>;

    /// Move an existing sale to the platform that won a conflict.
    fn reattribute_sale(&self, product_id: ProductId, platform: Platform)
    -> Result<(), CatalogError>;
}

impl<S, B> CatalogPort for CatalogService<S, B>
where
    S: CatalogStore,
    B: EventBus<EventEnvelope<ProductEvent>>,
{
    fn product(&self, product_id: ProductId) -> Result<Option<ProductSnapshot>, CatalogError> {
        Ok(self.get(product_id)?.map(|p| ProductSnapshot {
            product_id,
            status: p.status(),
            price: p.price(),
            stock: p.stock(),
            brand: p.brand().to_string(),
            model: p.model().to_string(),
            sold_on: p.sold_on(),
        }))
    }

    fn mark_sold(
        &self,
        product_id: ProductId,
        platform: Platform,
    ) -> Result<SaleOutcome, CatalogError> {
        CatalogService::mark_sold(self, product_id, platform)
    }

    fn reattribute_sale(
        &self,
        product_id: ProductId,
        platform: Platform,
    ) -> Result<(), CatalogError> {
        self.execute(
            product_id,
            ProductCommand::ReattributeSale {
                platform,
                occurred_at: chrono::Utc::now(),
            },
        )
        .map(|_| ())
    }
}

//! Canonical product catalog (event-sourced).
//!
//! The catalog is the only writer of product state. It knows nothing about
//! marketplaces beyond the `Platform` tag: every change is published as a
//! `ProductEvent` and downstream consumers decide what to do with it.

pub mod product;
pub mod service;
pub mod store;

pub use product::{
    CreateProduct, ListingDraft, Product, ProductCommand, ProductCreated, ProductEvent,
    ProductStatus,
};
pub use service::{CatalogError, CatalogService, SaleOutcome};
pub use store::{CatalogStore, CatalogStoreError, InMemoryCatalogStore, StoredProductEvent};

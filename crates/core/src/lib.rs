//! `forgelist-core`: domain primitives shared by the catalog and the sync engine.
//!
//! Nothing in here performs IO.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod platform;
pub mod price;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AuditEntryId, ProductId, SyncEventId};
pub use platform::Platform;
pub use price::Price;
pub use value_object::ValueObject;

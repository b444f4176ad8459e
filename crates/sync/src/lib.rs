//! Marketplace listing sync and reconciliation engine.
//!
//! Canonical product changes become per-(product, platform) sync events,
//! which the dispatcher drains through platform adapters in strict per-pair
//! order. The reconciler compares marketplace snapshots against canonical
//! state and the platform links, and repairs drift.

pub mod adapter;
pub mod audit;
pub mod catalog_port;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod links;
pub mod model;
pub mod payload;
pub mod priority;
pub mod propagate;
pub mod reconciler;
pub mod retry;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod integration_tests;

pub use adapter::{
    AdapterFailure, AdapterKind, AdapterOutcome, AdapterRegistry, CallSlot, FailureClass,
    FailureReason, ListingState, ObservationSource, PlatformAdapter, Snapshot, SnapshotEntry,
    StatusChange,
};
pub use audit::{AuditEntry, AuditKind, LinkSource};
pub use catalog_port::{CatalogPort, ProductSnapshot};
pub use config::{ConfigError, DispatcherConfig, HeuristicConfig, ReconcilerConfig, SyncConfig};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats, Disposition};
pub use error::SyncError;
pub use guard::{GuardError, InMemoryLeaseGuard, Lease, LeaseGuard, SharedGuard, lease_expiry};
pub use model::{
    EventOrigin, LinkStatus, MatchKind, PairKey, PlatformLink, SyncEvent, SyncEventStatus,
    SyncOperation, SyncPayload,
};
pub use payload::{CategoryMap, PlatformListing};
pub use priority::PlatformPriority;
pub use propagate::{ChangePropagator, PropagatorHandle};
pub use reconciler::{ReconcileError, ReconcileReport, Reconciler, ReconcilerHandle};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use service::{PlatformSyncStatus, SyncRuntime, SyncService, SyncStatusSummary};
pub use store::{InMemorySyncStore, Resolution, SharedStore, StoreError, SyncStats, SyncStore};

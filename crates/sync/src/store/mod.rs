//! Sync event log, platform links and audit trail storage.
//!
//! The store enforces the dispatch invariants on its own, independently of
//! the lease guard: a claim fails when another event of the pair is in flight
//! or when an older event of the pair has not finished, and a resolution is
//! accepted only from the lease token that made the claim.

mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use forgelist_core::{Platform, ProductId, SyncEventId};

use crate::audit::AuditEntry;
use crate::model::{PairKey, PlatformLink, SyncEvent, SyncEventStatus};

pub use in_memory::InMemorySyncStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("sync event not found: {0}")]
    NotFound(SyncEventId),
    #[error("sync event already exists: {0}")]
    AlreadyExists(SyncEventId),
    /// Another event of the pair is in flight.
    #[error("pair busy: {0}")]
    PairBusy(PairKey),
    /// An older event of the pair must finish first.
    #[error("event {event} is behind {blocking} for {key}")]
    OutOfOrder {
        key: PairKey,
        event: SyncEventId,
        blocking: SyncEventId,
    },
    /// A pending event whose retry is scheduled later.
    #[error("event {0} is not due yet")]
    NotDue(SyncEventId),
    /// The caller's claim was replaced by a newer one.
    #[error("stale lease for event {0}")]
    StaleLease(SyncEventId),
    #[error("event {id} cannot {action} from {from}")]
    InvalidTransition {
        id: SyncEventId,
        from: SyncEventStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// How a claimed attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Partial,
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLetter {
        error: String,
    },
}

impl Resolution {
    pub fn status(&self) -> SyncEventStatus {
        match self {
            Resolution::Success => SyncEventStatus::Success,
            Resolution::Partial => SyncEventStatus::Partial,
            Resolution::Retry { .. } => SyncEventStatus::Pending,
            Resolution::DeadLetter { .. } => SyncEventStatus::DeadLetter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub pending: usize,
    pub in_flight: usize,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub links: usize,
}

impl SyncStats {
    pub fn count(&mut self, status: SyncEventStatus) {
        match status {
            SyncEventStatus::Pending => self.pending += 1,
            SyncEventStatus::InFlight => self.in_flight += 1,
            SyncEventStatus::Success => self.success += 1,
            SyncEventStatus::Partial => self.partial += 1,
            SyncEventStatus::Failed => self.failed += 1,
            SyncEventStatus::DeadLetter => self.dead_letter += 1,
        }
    }
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Append a pending event and assign its `seq`.
    ///
    /// Idempotent on `(causation_id, product_id, platform)`: a repeated append
    /// returns the stored event unchanged.
    async fn append_event(&self, event: SyncEvent) -> Result<SyncEvent, StoreError>;

    async fn get_event(&self, id: SyncEventId) -> Result<Option<SyncEvent>, StoreError>;

    /// Head event of every pair (its oldest non-terminal event) that is either
    /// pending and due, or in flight (whose lease may have expired). Ordered by `seq`.
    async fn dispatch_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StoreError>;

    /// Move a due head event to in flight under `lease_token`, counting one attempt.
    async fn claim_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError>;

    /// Record the result of a claimed attempt.
    async fn resolve_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError>;

    /// Mark pending events of the pair older than `before_seq` as failed.
    async fn supersede_pending(
        &self,
        key: PairKey,
        before_seq: i64,
        by: SyncEventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEventId>, StoreError>;

    /// All events of a pair, oldest first.
    async fn events_for_pair(&self, key: PairKey) -> Result<Vec<SyncEvent>, StoreError>;

    async fn events_for_product(&self, product_id: ProductId) -> Result<Vec<SyncEvent>, StoreError>;

    /// Dead-lettered events, most recent first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncEvent>, StoreError>;

    async fn get_link(&self, key: PairKey) -> Result<Option<PlatformLink>, StoreError>;

    async fn links_for_product(&self, product_id: ProductId) -> Result<Vec<PlatformLink>, StoreError>;

    async fn links_for_platform(&self, platform: Platform) -> Result<Vec<PlatformLink>, StoreError>;

    /// Upsert the link of its pair; returns what it replaced.
    async fn put_link(&self, link: PlatformLink) -> Result<Option<PlatformLink>, StoreError>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Audit entries of a product, oldest first.
    async fn audit_for_product(&self, product_id: ProductId) -> Result<Vec<AuditEntry>, StoreError>;

    async fn stats(&self) -> Result<SyncStats, StoreError>;
}

pub type SharedStore = Arc<dyn SyncStore>;

use forgelist_catalog::CatalogError;
use forgelist_core::{DomainError, Platform, SyncEventId};

use crate::guard::GuardError;
use crate::model::SyncEventStatus;
use crate::reconciler::ReconcileError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("no adapter registered for {0}")]
    NoAdapter(Platform),
    #[error("sync event not found: {0}")]
    EventNotFound(SyncEventId),
    #[error("event {id} is {status}, only dead-lettered events can be retried")]
    NotDeadLettered {
        id: SyncEventId,
        status: SyncEventStatus,
    },
}

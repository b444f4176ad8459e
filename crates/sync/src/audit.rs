//! Append-only audit trail of link transitions and reconciliation decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgelist_core::{AuditEntryId, Platform, ProductId, SyncEventId};

use crate::adapter::ListingState;
use crate::model::{LinkStatus, MatchKind, SyncOperation};

/// Which path committed a link change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum LinkSource {
    Dispatcher { event_id: SyncEventId },
    Reconciler,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    LinkTransition {
        from: Option<LinkStatus>,
        to: LinkStatus,
        external_id: Option<String>,
        match_kind: MatchKind,
        source: LinkSource,
        note: Option<String>,
    },
    HeuristicMatch {
        external_id: String,
        score: f64,
    },
    AmbiguousMatch {
        candidates: Vec<String>,
    },
    /// Two platforms (or a platform and an offline sale) both claim the sale.
    DriftConflict {
        reported_by: Platform,
        existing: Option<Platform>,
        /// `None` keeps an offline sale.
        winner: Option<Platform>,
    },
    DestructiveSignalSuppressed {
        external_id: Option<String>,
        /// `None` means the listing was missing from the snapshot.
        observed: Option<ListingState>,
        reason: String,
    },
    CorrectiveEvent {
        event_id: SyncEventId,
        operation: SyncOperation,
        reason: String,
    },
    AcceptedPending {
        event_id: SyncEventId,
        operation: SyncOperation,
        note: String,
    },
    SnapshotFailed {
        error: String,
    },
}

impl AuditKind {
    pub fn name(&self) -> &'static str {
        match self {
            AuditKind::LinkTransition { .. } => "link_transition",
            AuditKind::HeuristicMatch { .. } => "heuristic_match",
            AuditKind::AmbiguousMatch { .. } => "ambiguous_match",
            AuditKind::DriftConflict { .. } => "drift_conflict",
            AuditKind::DestructiveSignalSuppressed { .. } => "destructive_signal_suppressed",
            AuditKind::CorrectiveEvent { .. } => "corrective_event",
            AuditKind::AcceptedPending { .. } => "accepted_pending",
            AuditKind::SnapshotFailed { .. } => "snapshot_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub recorded_at: DateTime<Utc>,
    /// `None` for platform-wide entries (snapshot failures).
    pub product_id: Option<ProductId>,
    pub platform: Platform,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEntry {
    pub fn new(product_id: Option<ProductId>, platform: Platform, kind: AuditKind) -> Self {
        Self {
            id: AuditEntryId::new(),
            recorded_at: Utc::now(),
            product_id,
            platform,
            kind,
        }
    }

    pub fn for_product(product_id: ProductId, platform: Platform, kind: AuditKind) -> Self {
        Self::new(Some(product_id), platform, kind)
    }
}

//! Sync event and platform link records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgelist_catalog::ListingDraft;
use forgelist_core::{DomainError, Entity, Platform, Price, ProductId, SyncEventId};

use crate::adapter::ListingState;

/// Identity of one product's representation on one marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub product_id: ProductId,
    pub platform: Platform,
}

impl PairKey {
    pub fn new(product_id: ProductId, platform: Platform) -> Self {
        Self {
            product_id,
            platform,
        }
    }
}

impl core::fmt::Display for PairKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.product_id, self.platform)
    }
}

macro_rules! impl_str_enum {
    ($name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(DomainError::invalid_id(format!(
                        concat!(stringify!($name), ": unknown `{}`"),
                        other
                    ))),
                }
            }
        }
    };
}

/// The canonical operation a sync event asks a marketplace to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    UpdatePrice,
    UpdateStock,
    End,
    Relist,
}

impl_str_enum!(SyncOperation {
    Create => "create",
    UpdatePrice => "update_price",
    UpdateStock => "update_stock",
    End => "end",
    Relist => "relist",
});

/// Operation arguments. Must agree with the event's [`SyncOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncPayload {
    Create { draft: ListingDraft },
    UpdatePrice { price: Price },
    UpdateStock { quantity: u32 },
    End,
    Relist,
}

impl SyncOperation {
    /// Sets an absolute value, so a newer event of the same operation makes
    /// an older one redundant.
    pub fn is_value_update(&self) -> bool {
        matches!(self, SyncOperation::UpdatePrice | SyncOperation::UpdateStock)
    }
}

impl SyncPayload {
    pub fn operation(&self) -> SyncOperation {
        match self {
            SyncPayload::Create { .. } => SyncOperation::Create,
            SyncPayload::UpdatePrice { .. } => SyncOperation::UpdatePrice,
            SyncPayload::UpdateStock { .. } => SyncOperation::UpdateStock,
            SyncPayload::End => SyncOperation::End,
            SyncPayload::Relist => SyncOperation::Relist,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventStatus {
    Pending,
    InFlight,
    Success,
    /// Submitted but not confirmable; only the reconciler resolves it.
    Partial,
    /// Superseded or abandoned without reaching the marketplace.
    Failed,
    DeadLetter,
}

impl_str_enum!(SyncEventStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Success => "success",
    Partial => "partial",
    Failed => "failed",
    DeadLetter => "dead_letter",
});

impl SyncEventStatus {
    /// No further dispatch happens from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEventStatus::Success
                | SyncEventStatus::Partial
                | SyncEventStatus::Failed
                | SyncEventStatus::DeadLetter
        )
    }

    /// Retained for audit as-is; never rewritten.
    pub fn is_immutable(&self) -> bool {
        matches!(self, SyncEventStatus::Success | SyncEventStatus::DeadLetter)
    }
}

/// Who asked for a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Fanned out from a canonical product change.
    Canonical,
    /// Corrective event emitted for detected drift.
    Reconciler,
    /// Manual enqueue or dead-letter retry.
    Operator,
}

impl_str_enum!(EventOrigin {
    Canonical => "canonical",
    Reconciler => "reconciler",
    Operator => "operator",
});

/// An intended state transition for one (product, platform) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: SyncEventId,
    /// Creation order, assigned by the store on append.
    pub seq: i64,
    pub product_id: ProductId,
    pub platform: Platform,
    pub operation: SyncOperation,
    pub payload: SyncPayload,
    pub status: SyncEventStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Fencing token of the current claim while in flight.
    pub lease_token: Option<Uuid>,
    pub origin: EventOrigin,
    /// Upstream fact this event was derived from; appends are idempotent on it.
    pub causation_id: Option<Uuid>,
    /// Dead-lettered event this one retries.
    pub retry_of: Option<SyncEventId>,
}

impl SyncEvent {
    pub fn new(
        product_id: ProductId,
        platform: Platform,
        payload: SyncPayload,
        origin: EventOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SyncEventId::new(),
            seq: 0,
            product_id,
            platform,
            operation: payload.operation(),
            payload,
            status: SyncEventStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
            lease_token: None,
            origin,
            causation_id: None,
            retry_of: None,
        }
    }

    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn retrying(mut self, original: SyncEventId) -> Self {
        self.retry_of = Some(original);
        self
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(self.product_id, self.platform)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Reject payloads that disagree with the declared operation.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.payload.operation() != self.operation {
            return Err(DomainError::validation(format!(
                "payload for `{}` submitted as `{}`",
                self.payload.operation(),
                self.operation
            )));
        }
        if let SyncPayload::Create { draft } = &self.payload {
            if draft.sku.trim().is_empty() {
                return Err(DomainError::validation("listing draft has no sku"));
            }
        }
        Ok(())
    }
}

impl Entity for SyncEvent {
    type Id = SyncEventId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Last confirmed state of a listing on its marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Sold,
    Ended,
    Removed,
    PendingConfirmation,
}

impl_str_enum!(LinkStatus {
    Active => "active",
    Sold => "sold",
    Ended => "ended",
    Removed => "removed",
    PendingConfirmation => "pending_confirmation",
});

impl LinkStatus {
    /// The listing is (or may be) purchasable on the marketplace.
    pub fn is_live(&self) -> bool {
        matches!(self, LinkStatus::Active | LinkStatus::PendingConfirmation)
    }
}

impl From<ListingState> for LinkStatus {
    fn from(value: ListingState) -> Self {
        match value {
            ListingState::Active => LinkStatus::Active,
            ListingState::Sold => LinkStatus::Sold,
            ListingState::Ended => LinkStatus::Ended,
        }
    }
}

/// How the external id of a link was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Reported by the marketplace for our own call, or confirmed by an operator.
    Exact,
    /// Inferred by the reconciler from brand, model and price.
    Heuristic,
}

impl_str_enum!(MatchKind {
    Exact => "exact",
    Heuristic => "heuristic",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLink {
    pub product_id: ProductId,
    pub platform: Platform,
    pub external_id: Option<String>,
    pub confirmed_status: LinkStatus,
    pub match_kind: MatchKind,
    pub last_synced_at: DateTime<Utc>,
}

impl PlatformLink {
    pub fn key(&self) -> PairKey {
        PairKey::new(self.product_id, self.platform)
    }

    /// Heuristic links cannot drive destructive transitions on their own.
    pub fn needs_confirmation(&self) -> bool {
        self.match_kind == MatchKind::Heuristic
    }
}

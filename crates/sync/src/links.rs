//! The single write path for platform links.
//!
//! Dispatcher and reconciler both commit through [`commit_link`], so every
//! status change lands in the audit log with the path that caused it.

use chrono::Utc;
use tracing::info;

use crate::audit::{AuditEntry, AuditKind, LinkSource};
use crate::model::{LinkStatus, MatchKind, PairKey, PlatformLink};
use crate::store::{StoreError, SyncStore};

/// A confirmed fact about a link, ready to be committed.
#[derive(Debug, Clone)]
pub struct LinkUpdate {
    pub external_id: Option<String>,
    pub status: LinkStatus,
    pub match_kind: MatchKind,
    pub source: LinkSource,
    pub note: Option<String>,
}

impl LinkUpdate {
    pub fn new(status: LinkStatus, match_kind: MatchKind, source: LinkSource) -> Self {
        Self {
            external_id: None,
            status,
            match_kind,
            source,
            note: None,
        }
    }

    pub fn external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Apply `update` to the pair's link (creating it if absent), keeping a
/// known external id when the update carries none, and record the transition.
pub async fn commit_link(
    store: &dyn SyncStore,
    key: PairKey,
    current: Option<&PlatformLink>,
    update: LinkUpdate,
) -> Result<PlatformLink, StoreError> {
    let next = PlatformLink {
        product_id: key.product_id,
        platform: key.platform,
        external_id: update
            .external_id
            .or_else(|| current.and_then(|c| c.external_id.clone())),
        confirmed_status: update.status,
        match_kind: update.match_kind,
        last_synced_at: Utc::now(),
    };
    let previous = store.put_link(next.clone()).await?;
    record(store, previous.as_ref(), &next, update.source, update.note).await?;
    Ok(next)
}

async fn record(
    store: &dyn SyncStore,
    previous: Option<&PlatformLink>,
    next: &PlatformLink,
    source: LinkSource,
    note: Option<String>,
) -> Result<(), StoreError> {
    let changed = previous.is_none_or(|p| {
        p.confirmed_status != next.confirmed_status
            || p.external_id != next.external_id
            || p.match_kind != next.match_kind
    });
    if !changed {
        return Ok(());
    }

    info!(
        product_id = %next.product_id,
        platform = %next.platform,
        from = previous.map(|p| p.confirmed_status.as_str()).unwrap_or("none"),
        to = next.confirmed_status.as_str(),
        external_id = next.external_id.as_deref().unwrap_or(""),
        "platform link committed"
    );
    store
        .append_audit(AuditEntry::for_product(
            next.product_id,
            next.platform,
            AuditKind::LinkTransition {
                from: previous.map(|p| p.confirmed_status),
                to: next.confirmed_status,
                external_id: next.external_id.clone(),
                match_kind: next.match_kind,
                source,
                note,
            },
        ))
        .await
}

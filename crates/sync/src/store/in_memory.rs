use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use forgelist_core::{Platform, ProductId, SyncEventId};

use super::{Resolution, StoreError, SyncStats, SyncStore};
use crate::audit::AuditEntry;
use crate::model::{PairKey, PlatformLink, SyncEvent, SyncEventStatus};

#[derive(Debug, Default)]
struct State {
    next_seq: i64,
    events: HashMap<SyncEventId, SyncEvent>,
    /// Event ids per pair in `seq` order.
    pairs: HashMap<PairKey, Vec<SyncEventId>>,
    causations: HashMap<(Uuid, PairKey), SyncEventId>,
    links: HashMap<PairKey, PlatformLink>,
    audit: Vec<AuditEntry>,
}

impl State {
    fn pair_events(&self, key: &PairKey) -> impl Iterator<Item = &SyncEvent> {
        self.pairs
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.events.get(id))
    }

    fn head(&self, key: &PairKey) -> Option<&SyncEvent> {
        self.pair_events(key).find(|e| !e.status.is_terminal())
    }
}

/// In-memory sync store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    state: RwLock<State>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("sync store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("sync store lock poisoned".into()))
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn append_event(&self, mut event: SyncEvent) -> Result<SyncEvent, StoreError> {
        let mut state = self.write()?;
        let key = event.key();

        if let Some(causation_id) = event.causation_id {
            if let Some(existing) = state
                .causations
                .get(&(causation_id, key))
                .and_then(|id| state.events.get(id))
            {
                return Ok(existing.clone());
            }
        }
        if state.events.contains_key(&event.id) {
            return Err(StoreError::AlreadyExists(event.id));
        }

        state.next_seq += 1;
        event.seq = state.next_seq;
        event.status = SyncEventStatus::Pending;
        event.lease_token = None;
        event.attempt_count = 0;

        if let Some(causation_id) = event.causation_id {
            state.causations.insert((causation_id, key), event.id);
        }
        state.pairs.entry(key).or_default().push(event.id);
        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: SyncEventId) -> Result<Option<SyncEvent>, StoreError> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    async fn dispatch_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StoreError> {
        let state = self.read()?;
        let mut heads: Vec<SyncEvent> = state
            .pairs
            .keys()
            .filter_map(|key| state.head(key))
            .filter(|e| match e.status {
                SyncEventStatus::InFlight => true,
                SyncEventStatus::Pending => e.is_ready(now),
                _ => false,
            })
            .cloned()
            .collect();
        heads.sort_by_key(|e| e.seq);
        heads.truncate(limit);
        Ok(heads)
    }

    async fn claim_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        let mut state = self.write()?;
        let event = state.events.get(&id).ok_or(StoreError::NotFound(id))?;
        if !matches!(
            event.status,
            SyncEventStatus::Pending | SyncEventStatus::InFlight
        ) {
            return Err(StoreError::InvalidTransition {
                id,
                from: event.status,
                action: "claim",
            });
        }

        if event.status == SyncEventStatus::Pending && !event.is_ready(now) {
            return Err(StoreError::NotDue(id));
        }

        let key = event.key();
        let seq = event.seq;
        for other in state.pair_events(&key).filter(|e| e.id != id) {
            if other.status == SyncEventStatus::InFlight {
                return Err(StoreError::PairBusy(key));
            }
            if other.seq < seq && !other.status.is_terminal() {
                return Err(StoreError::OutOfOrder {
                    key,
                    event: id,
                    blocking: other.id,
                });
            }
        }

        let event = state.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        event.status = SyncEventStatus::InFlight;
        event.lease_token = Some(lease_token);
        event.attempt_count += 1;
        event.next_attempt_at = None;
        event.updated_at = now;
        Ok(event.clone())
    }

    async fn resolve_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        let mut state = self.write()?;
        let event = state.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if event.status != SyncEventStatus::InFlight {
            return Err(StoreError::InvalidTransition {
                id,
                from: event.status,
                action: "resolve",
            });
        }
        if event.lease_token != Some(lease_token) {
            return Err(StoreError::StaleLease(id));
        }

        event.status = resolution.status();
        event.lease_token = None;
        event.updated_at = now;
        match resolution {
            Resolution::Success | Resolution::Partial => {}
            Resolution::Retry {
                error,
                next_attempt_at,
            } => {
                event.last_error = Some(error);
                event.next_attempt_at = Some(next_attempt_at);
            }
            Resolution::DeadLetter { error } => event.last_error = Some(error),
        }
        Ok(event.clone())
    }

    async fn supersede_pending(
        &self,
        key: PairKey,
        before_seq: i64,
        by: SyncEventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEventId>, StoreError> {
        let mut state = self.write()?;
        let older: Vec<SyncEventId> = state
            .pair_events(&key)
            .filter(|e| e.seq < before_seq && e.status == SyncEventStatus::Pending)
            .map(|e| e.id)
            .collect();
        for id in &older {
            if let Some(event) = state.events.get_mut(id) {
                event.status = SyncEventStatus::Failed;
                event.last_error = Some(format!("superseded by {by}"));
                event.next_attempt_at = None;
                event.updated_at = now;
            }
        }
        Ok(older)
    }

    async fn events_for_pair(&self, key: PairKey) -> Result<Vec<SyncEvent>, StoreError> {
        Ok(self.read()?.pair_events(&key).cloned().collect())
    }

    async fn events_for_product(&self, product_id: ProductId) -> Result<Vec<SyncEvent>, StoreError> {
        let state = self.read()?;
        let mut events: Vec<SyncEvent> = state
            .events
            .values()
            .filter(|e| e.product_id == product_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncEvent>, StoreError> {
        let state = self.read()?;
        let mut dead: Vec<SyncEvent> = state
            .events
            .values()
            .filter(|e| e.status == SyncEventStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.seq.cmp(&a.seq)));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn get_link(&self, key: PairKey) -> Result<Option<PlatformLink>, StoreError> {
        Ok(self.read()?.links.get(&key).cloned())
    }

    async fn links_for_product(&self, product_id: ProductId) -> Result<Vec<PlatformLink>, StoreError> {
        let state = self.read()?;
        let mut links: Vec<PlatformLink> = state
            .links
            .values()
            .filter(|l| l.product_id == product_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.platform);
        Ok(links)
    }

    async fn links_for_platform(&self, platform: Platform) -> Result<Vec<PlatformLink>, StoreError> {
        let state = self.read()?;
        let mut links: Vec<PlatformLink> = state
            .links
            .values()
            .filter(|l| l.platform == platform)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.product_id);
        Ok(links)
    }

    async fn put_link(&self, link: PlatformLink) -> Result<Option<PlatformLink>, StoreError> {
        Ok(self.write()?.links.insert(link.key(), link))
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.write()?.audit.push(entry);
        Ok(())
    }

    async fn audit_for_product(&self, product_id: ProductId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .read()?
            .audit
            .iter()
            .filter(|a| a.product_id == Some(product_id))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<SyncStats, StoreError> {
        let state = self.read()?;
        let mut stats = SyncStats {
            links: state.links.len(),
            ..Default::default()
        };
        for event in state.events.values() {
            stats.count(event.status);
        }
        Ok(stats)
    }
}

//! The engine's outward surface.
//!
//! `SyncService` wires store, guard, adapters and catalog into a dispatcher,
//! a reconciler and a change propagator, and exposes the operator operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use forgelist_catalog::ProductEvent;
use forgelist_core::{Platform, ProductId, SyncEventId};
use forgelist_events::{EventEnvelope, Subscription};

use crate::adapter::{AdapterRegistry, SnapshotEntry};
use crate::audit::{AuditEntry, LinkSource};
use crate::catalog_port::CatalogPort;
use crate::config::SyncConfig;
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
use crate::error::SyncError;
use crate::guard::SharedGuard;
use crate::links::{LinkUpdate, commit_link};
use crate::model::{
    EventOrigin, LinkStatus, MatchKind, PairKey, PlatformLink, SyncEvent, SyncEventStatus,
    SyncOperation, SyncPayload,
};
use crate::propagate::{ChangePropagator, PropagatorHandle};
use crate::reconciler::{ReconcileReport, Reconciler, ReconcilerHandle};
use crate::store::{SharedStore, SyncStats};

/// Link and open events of one product on one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformSyncStatus {
    pub platform: Platform,
    pub link: Option<PlatformLink>,
    pub pending: Vec<SyncEvent>,
    pub in_flight: Vec<SyncEvent>,
    pub dead_lettered: Vec<SyncEvent>,
}

impl PlatformSyncStatus {
    fn new(platform: Platform) -> Self {
        Self {
            platform,
            link: None,
            pending: Vec::new(),
            in_flight: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }

    /// Nothing queued, nothing failed.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.dead_lettered.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusSummary {
    pub product_id: ProductId,
    pub platforms: Vec<PlatformSyncStatus>,
}

impl SyncStatusSummary {
    pub fn platform(&self, platform: Platform) -> Option<&PlatformSyncStatus> {
        self.platforms.iter().find(|p| p.platform == platform)
    }
}

pub struct SyncService {
    store: SharedStore,
    config: SyncConfig,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
    propagator: Arc<ChangePropagator>,
}

impl SyncService {
    pub fn new(
        store: SharedStore,
        guard: SharedGuard,
        adapters: Arc<AdapterRegistry>,
        catalog: Arc<dyn CatalogPort>,
        config: SyncConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            guard,
            Arc::clone(&adapters),
            config.dispatcher.clone(),
        ));
        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&store),
                catalog,
                adapters,
                config.reconciler.clone(),
            )
            .with_dispatch_wake(dispatcher.waker()),
        );
        let propagator = Arc::new(
            ChangePropagator::new(Arc::clone(&store)).with_dispatch_wake(dispatcher.waker()),
        );

        Self {
            store,
            config,
            dispatcher,
            reconciler,
            propagator,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn propagator(&self) -> &Arc<ChangePropagator> {
        &self.propagator
    }

    /// Append an event on behalf of the owning service.
    #[instrument(skip(self, payload), fields(product_id = %product_id, platform = %platform, operation = %operation))]
    pub async fn enqueue_sync_event(
        &self,
        product_id: ProductId,
        platform: Platform,
        operation: SyncOperation,
        payload: SyncPayload,
    ) -> Result<SyncEvent, SyncError> {
        let mut event = SyncEvent::new(product_id, platform, payload, EventOrigin::Canonical);
        event.operation = operation;
        event.validate()?;

        let stored = self.store.append_event(event).await?;
        self.dispatcher.wake();
        Ok(stored)
    }

    /// Per-platform link and open events of one product.
    pub async fn get_sync_status(
        &self,
        product_id: ProductId,
    ) -> Result<SyncStatusSummary, SyncError> {
        let mut platforms: BTreeMap<Platform, PlatformSyncStatus> = BTreeMap::new();

        for link in self.store.links_for_product(product_id).await? {
            let platform = link.platform;
            platforms
                .entry(platform)
                .or_insert_with(|| PlatformSyncStatus::new(platform))
                .link = Some(link);
        }
        for event in self.store.events_for_product(product_id).await? {
            let status = platforms
                .entry(event.platform)
                .or_insert_with(|| PlatformSyncStatus::new(event.platform));
            match event.status {
                SyncEventStatus::Pending => status.pending.push(event),
                SyncEventStatus::InFlight => status.in_flight.push(event),
                SyncEventStatus::DeadLetter => status.dead_lettered.push(event),
                SyncEventStatus::Success | SyncEventStatus::Partial | SyncEventStatus::Failed => {}
            }
        }

        Ok(SyncStatusSummary {
            product_id,
            platforms: platforms.into_values().collect(),
        })
    }

    /// Run a reconciliation pass now instead of waiting for the schedule.
    pub async fn force_reconcile(&self, platform: Platform) -> Result<ReconcileReport, SyncError> {
        Ok(self.reconciler.reconcile(platform).await?)
    }

    /// Newest dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncEvent>, SyncError> {
        Ok(self.store.dead_letters(limit).await?)
    }

    /// Enqueue a fresh attempt of a dead-lettered event. The original stays
    /// dead-lettered for the record.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn retry_dead_letter(&self, event_id: SyncEventId) -> Result<SyncEvent, SyncError> {
        let original = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(SyncError::EventNotFound(event_id))?;
        if original.status != SyncEventStatus::DeadLetter {
            return Err(SyncError::NotDeadLettered {
                id: event_id,
                status: original.status,
            });
        }

        let retry = SyncEvent::new(
            original.product_id,
            original.platform,
            original.payload.clone(),
            EventOrigin::Operator,
        )
        .retrying(original.id);
        let stored = self.store.append_event(retry).await?;
        info!(retry_id = %stored.id, pair = %stored.key(), "dead letter requeued");
        self.dispatcher.wake();
        Ok(stored)
    }

    /// Record an operator-verified external id. The link becomes an exact
    /// match; its status is left for the marketplace to confirm.
    #[instrument(skip(self, external_id), fields(product_id = %product_id, platform = %platform))]
    pub async fn confirm_link(
        &self,
        product_id: ProductId,
        platform: Platform,
        external_id: impl Into<String>,
    ) -> Result<PlatformLink, SyncError> {
        let key = PairKey::new(product_id, platform);
        let current = self.store.get_link(key).await?;
        let status = current
            .as_ref()
            .map_or(LinkStatus::PendingConfirmation, |l| l.confirmed_status);
        let update = LinkUpdate::new(status, MatchKind::Exact, LinkSource::Operator)
            .external_id(external_id)
            .note("confirmed by operator");

        Ok(commit_link(self.store.as_ref(), key, current.as_ref(), update).await?)
    }

    /// Buffer a pushed marketplace observation for the next pass of `platform`.
    pub fn observe(&self, platform: Platform, observation: SnapshotEntry) -> Result<(), SyncError> {
        Ok(self.reconciler.observe(platform, observation)?)
    }

    pub async fn audit_log(&self, product_id: ProductId) -> Result<Vec<AuditEntry>, SyncError> {
        Ok(self.store.audit_for_product(product_id).await?)
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        Ok(self.store.stats().await?)
    }

    /// Start the dispatcher, the reconciler schedule and, given a catalog
    /// subscription, the change propagator.
    pub fn start(
        &self,
        catalog_events: Option<Subscription<EventEnvelope<ProductEvent>>>,
    ) -> SyncRuntime {
        info!(
            dispatcher = %self.config.dispatcher.name,
            workers = self.config.dispatcher.max_workers,
            "starting sync engine"
        );
        SyncRuntime {
            dispatcher: Arc::clone(&self.dispatcher).spawn(),
            reconciler: Arc::clone(&self.reconciler).spawn(),
            propagator: catalog_events.map(|subscription| {
                Arc::clone(&self.propagator)
                    .spawn(subscription, self.config.dispatcher.poll_interval)
            }),
        }
    }
}

/// Background tasks of a started engine.
#[derive(Debug)]
pub struct SyncRuntime {
    dispatcher: DispatcherHandle,
    reconciler: ReconcilerHandle,
    propagator: Option<PropagatorHandle>,
}

impl SyncRuntime {
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Stop intake first, then scheduled passes, then let dispatch drain.
    pub async fn shutdown(self) {
        if let Some(propagator) = self.propagator {
            propagator.shutdown().await;
        }
        self.reconciler.shutdown().await;
        self.dispatcher.shutdown().await;
        info!("sync engine stopped");
    }
}

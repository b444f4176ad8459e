//! Scheduled drift detection against marketplace snapshots.
//!
//! One pass per platform at a time; passes for different platforms run
//! concurrently. A pass never writes canonical state except through
//! [`CatalogPort`], and never changes a link except through
//! [`commit_link`](crate::links::commit_link).
//!
//! A link confirmed after the pass started is newer than anything the
//! snapshot can say about it and is left for the next pass. Pushed
//! observations stay buffered until a pass has used them.

pub mod matching;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as PassLock, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use forgelist_catalog::{CatalogError, ProductStatus, SaleOutcome};
use forgelist_core::{Platform, ProductId, SyncEventId};

use crate::adapter::{
    AdapterFailure, AdapterRegistry, ListingState, ObservationSource, PlatformAdapter, Snapshot,
    SnapshotEntry,
};
use crate::audit::{AuditEntry, AuditKind, LinkSource};
use crate::catalog_port::{CatalogPort, ProductSnapshot};
use crate::config::ReconcilerConfig;
use crate::links::{LinkUpdate, commit_link};
use crate::model::{
    EventOrigin, LinkStatus, MatchKind, PairKey, PlatformLink, SyncEvent, SyncOperation,
    SyncPayload,
};
use crate::store::{SharedStore, StoreError};

use self::matching::{MatchResult, best_match};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("no adapter registered for {0}")]
    NoAdapter(Platform),
    #[error("snapshot of {platform} failed: {failure}")]
    Snapshot {
        platform: Platform,
        failure: AdapterFailure,
    },
    #[error("snapshot of {0} timed out")]
    SnapshotTimeout(Platform),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// What one pass found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub platform: Platform,
    pub complete_snapshot: bool,
    pub entries: usize,
    pub links_checked: usize,
    pub confirmed: usize,
    pub heuristic_matches: usize,
    pub ambiguous: usize,
    pub sales: usize,
    pub conflicts: usize,
    pub removed: usize,
    pub ended_by_sale: usize,
    pub suppressed: usize,
    /// Links confirmed after the snapshot was taken; checked next pass.
    pub deferred: usize,
    /// Snapshot entries no link claims.
    pub unmatched: usize,
    pub corrective_events: Vec<SyncEventId>,
}

impl ReconcileReport {
    fn new(platform: Platform, entries: usize, complete_snapshot: bool) -> Self {
        Self {
            platform,
            complete_snapshot,
            entries,
            links_checked: 0,
            confirmed: 0,
            heuristic_matches: 0,
            ambiguous: 0,
            sales: 0,
            conflicts: 0,
            removed: 0,
            ended_by_sale: 0,
            suppressed: 0,
            deferred: 0,
            unmatched: 0,
            corrective_events: Vec::new(),
        }
    }
}

/// Snapshot entries keyed by external id, with pushed observations merged in.
struct SnapshotView {
    entries: HashMap<String, SnapshotEntry>,
    complete: bool,
}

impl SnapshotView {
    fn merge(snapshot: Snapshot, observations: Vec<SnapshotEntry>) -> Self {
        let mut entries: HashMap<String, SnapshotEntry> = snapshot
            .entries
            .into_iter()
            .map(|e| (e.external_id.clone(), e))
            .collect();
        for observed in observations {
            let keep_current = entries.get(&observed.external_id).is_some_and(|current| {
                let pushed = current.source == ObservationSource::Webhook;
                current.observed_at > observed.observed_at && (pushed || current.state != observed.state)
            });
            if !keep_current {
                entries.insert(observed.external_id.clone(), observed);
            }
        }
        Self {
            entries,
            complete: snapshot.complete,
        }
    }

    fn get(&self, external_id: &str) -> Option<&SnapshotEntry> {
        self.entries.get(external_id)
    }
}

pub struct Reconciler {
    store: SharedStore,
    catalog: Arc<dyn CatalogPort>,
    adapters: Arc<AdapterRegistry>,
    config: ReconcilerConfig,
    passes: HashMap<Platform, Arc<PassLock<()>>>,
    observations: Mutex<HashMap<Platform, Vec<SnapshotEntry>>>,
    dispatch_wake: Option<Arc<Notify>>,
}

impl Reconciler {
    pub fn new(
        store: SharedStore,
        catalog: Arc<dyn CatalogPort>,
        adapters: Arc<AdapterRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            adapters,
            config,
            passes: Platform::ALL
                .into_iter()
                .map(|p| (p, Arc::new(PassLock::new(()))))
                .collect(),
            observations: Mutex::new(HashMap::new()),
            dispatch_wake: None,
        }
    }

    /// Wake the dispatcher whenever a pass emits corrective events.
    pub fn with_dispatch_wake(mut self, wake: Arc<Notify>) -> Self {
        self.dispatch_wake = Some(wake);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Buffer a pushed observation (webhook, import) for the platform's next
    /// pass. Platforms without an adapter are never reconciled and refuse it.
    pub fn observe(
        &self,
        platform: Platform,
        mut observation: SnapshotEntry,
    ) -> Result<(), ReconcileError> {
        if self.adapters.get(platform).is_none() {
            warn!(
                platform = %platform,
                external_id = %observation.external_id,
                "observation for a platform without an adapter"
            );
            return Err(ReconcileError::NoAdapter(platform));
        }
        observation.source = ObservationSource::Webhook;
        self.buffer(platform, vec![observation]);
        Ok(())
    }

    fn buffer(&self, platform: Platform, observations: Vec<SnapshotEntry>) {
        if observations.is_empty() {
            return;
        }
        if let Ok(mut buffered) = self.observations.lock() {
            buffered.entry(platform).or_default().extend(observations);
        }
    }

    fn drain_observations(&self, platform: Platform) -> Vec<SnapshotEntry> {
        self.observations
            .lock()
            .map(|mut buffered| buffered.remove(&platform).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Reconcile every registered platform concurrently.
    pub async fn reconcile_all(&self) -> Vec<(Platform, Result<ReconcileReport, ReconcileError>)> {
        let platforms = self.adapters.platforms();
        let passes = platforms.iter().map(|p| self.reconcile(*p));
        platforms
            .iter()
            .copied()
            .zip(futures::future::join_all(passes).await)
            .collect()
    }

    #[instrument(skip(self), fields(platform = %platform))]
    pub async fn reconcile(&self, platform: Platform) -> Result<ReconcileReport, ReconcileError> {
        let lock = self
            .passes
            .get(&platform)
            .cloned()
            .ok_or(ReconcileError::NoAdapter(platform))?;
        let _pass = lock.lock().await;
        let adapter = self
            .adapters
            .get(platform)
            .ok_or(ReconcileError::NoAdapter(platform))?;

        let started_at = Utc::now();
        let snapshot = self.fetch(platform, adapter.as_ref()).await?;
        let observations = self.drain_observations(platform);
        match self.diff(platform, snapshot, observations.clone(), started_at).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(error = %err, kept = observations.len(), "pass aborted, observations kept for the next pass");
                self.buffer(platform, observations);
                Err(err)
            }
        }
    }

    async fn diff(
        &self,
        platform: Platform,
        snapshot: Snapshot,
        observations: Vec<SnapshotEntry>,
        started_at: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let view = SnapshotView::merge(snapshot, observations);
        let mut report = ReconcileReport::new(platform, view.entries.len(), view.complete);

        let links = self.store.links_for_platform(platform).await?;
        let mut claimed: HashSet<String> =
            links.iter().filter_map(|l| l.external_id.clone()).collect();
        let mut held_back = Vec::new();

        for link in &links {
            if link.last_synced_at > started_at {
                debug!(pair = %link.key(), "link changed after the snapshot was taken");
                report.deferred += 1;
                held_back.extend(
                    link.external_id
                        .as_deref()
                        .and_then(|id| view.get(id))
                        .filter(|e| e.source == ObservationSource::Webhook)
                        .cloned(),
                );
                continue;
            }
            let product = match self.catalog.product(link.product_id) {
                Ok(Some(product)) => product,
                Ok(None) => {
                    warn!(product_id = %link.product_id, "link points at an unknown product");
                    continue;
                }
                Err(err) => {
                    warn!(product_id = %link.product_id, error = %err, "catalog read failed, skipping link");
                    continue;
                }
            };
            report.links_checked += 1;

            let result = match &link.external_id {
                Some(external_id) => {
                    self.reconcile_linked(link, external_id, &product, &view, &mut report)
                        .await
                }
                None => {
                    self.reconcile_unlinked(link, &product, &view, &mut claimed, &mut report)
                        .await
                }
            };
            match result {
                Ok(()) => {}
                // A catalog race for one product must not stall the platform.
                Err(ReconcileError::Catalog(err)) => {
                    warn!(product_id = %link.product_id, error = %err, "canonical transition rejected");
                }
                Err(err) => return Err(err),
            }
        }

        report.unmatched = view
            .entries
            .keys()
            .filter(|id| !claimed.contains(*id))
            .count();
        self.buffer(platform, held_back);

        info!(
            entries = report.entries,
            links = report.links_checked,
            sales = report.sales,
            conflicts = report.conflicts,
            corrective = report.corrective_events.len(),
            heuristic = report.heuristic_matches,
            deferred = report.deferred,
            "reconciliation pass finished"
        );
        if !report.corrective_events.is_empty() {
            if let Some(wake) = &self.dispatch_wake {
                wake.notify_one();
            }
        }
        Ok(report)
    }

    async fn fetch(
        &self,
        platform: Platform,
        adapter: &dyn PlatformAdapter,
    ) -> Result<Snapshot, ReconcileError> {
        let err = match tokio::time::timeout(self.config.snapshot_timeout, adapter.fetch_snapshot())
            .await
        {
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(failure)) => ReconcileError::Snapshot { platform, failure },
            Err(_) => ReconcileError::SnapshotTimeout(platform),
        };

        warn!(error = %err, "snapshot failed, no transitions this pass");
        self.store
            .append_audit(AuditEntry::new(
                None,
                platform,
                AuditKind::SnapshotFailed {
                    error: err.to_string(),
                },
            ))
            .await?;
        Err(err)
    }

    async fn reconcile_linked(
        &self,
        link: &PlatformLink,
        external_id: &str,
        product: &ProductSnapshot,
        view: &SnapshotView,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let Some(entry) = view.get(external_id) else {
            return self.listing_missing(link, product, view.complete, report).await;
        };
        let pushed = entry.source == ObservationSource::Webhook;
        let match_kind = if pushed { MatchKind::Exact } else { link.match_kind };

        match entry.state {
            ListingState::Active => {
                if link.confirmed_status != LinkStatus::Active || link.match_kind != match_kind {
                    self.commit(link, LinkStatus::Active, match_kind, None).await?;
                    report.confirmed += 1;
                }
                match product.status {
                    ProductStatus::Active => self.correct_metadata(link, product, entry, report).await,
                    ProductStatus::Sold | ProductStatus::Ended => {
                        let reason = format!("listing live while canonical is {}", product.status.as_str());
                        self.enqueue_corrective(link.key(), SyncPayload::End, reason, report)
                            .await
                    }
                    ProductStatus::Draft => Ok(()),
                }
            }
            ListingState::Sold | ListingState::Ended => {
                if link.needs_confirmation() && !pushed {
                    return self
                        .suppress(
                            link,
                            Some(entry.state),
                            "heuristic link awaiting a confirming signal",
                            report,
                        )
                        .await;
                }

                let status = LinkStatus::from(entry.state);
                let was_live = link.confirmed_status.is_live();
                let newly_reported = link.confirmed_status != status;
                if newly_reported || link.match_kind != match_kind {
                    self.commit(link, status, match_kind, None).await?;
                }
                if self.transition_in_progress(link.key()).await? {
                    debug!(pair = %link.key(), "listing transition in progress, not treated as drift");
                    return Ok(());
                }

                match product.status {
                    ProductStatus::Active
                        if (newly_reported && was_live) || entry.state == ListingState::Sold =>
                    {
                        self.record_sale(product.product_id, link.platform, report).await
                    }
                    ProductStatus::Sold
                        if newly_reported
                            && entry.state == ListingState::Sold
                            && product.sold_on != Some(link.platform) =>
                    {
                        self.resolve_conflict(product.product_id, product.sold_on, link.platform, report)
                            .await
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn listing_missing(
        &self,
        link: &PlatformLink,
        product: &ProductSnapshot,
        complete: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if !complete || !link.confirmed_status.is_live() {
            return Ok(());
        }
        if self.transition_in_progress(link.key()).await? {
            return Ok(());
        }
        if link.needs_confirmation() {
            return self
                .suppress(link, None, "heuristic link missing from snapshot", report)
                .await;
        }

        let priority = &self.config.priority;
        let sold_elsewhere = self
            .store
            .links_for_product(link.product_id)
            .await?
            .into_iter()
            .filter(|l| l.platform != link.platform && l.confirmed_status == LinkStatus::Sold)
            .map(|l| l.platform)
            .chain(product.sold_on)
            .filter(|p| priority.outranks(*p, link.platform))
            .min_by_key(|p| priority.rank(*p));

        match sold_elsewhere {
            Some(winner) => {
                let note = format!("missing from snapshot; sale on {winner} takes precedence");
                self.commit(link, LinkStatus::Ended, link.match_kind, Some(note))
                    .await?;
                report.ended_by_sale += 1;
            }
            None => {
                self.commit(
                    link,
                    LinkStatus::Removed,
                    link.match_kind,
                    Some("missing from snapshot".to_string()),
                )
                .await?;
                report.removed += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_unlinked(
        &self,
        link: &PlatformLink,
        product: &ProductSnapshot,
        view: &SnapshotView,
        claimed: &mut HashSet<String>,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if link.confirmed_status != LinkStatus::PendingConfirmation {
            return Ok(());
        }

        let candidates = view
            .entries
            .values()
            .filter(|e| !claimed.contains(&e.external_id));
        match best_match(product, candidates, &self.config.heuristic) {
            MatchResult::Matched { external_id, score } => {
                claimed.insert(external_id.clone());
                let state = view
                    .get(&external_id)
                    .map_or(ListingState::Active, |e| e.state);
                let status = match state {
                    ListingState::Active => LinkStatus::Active,
                    _ => LinkStatus::PendingConfirmation,
                };

                let update = LinkUpdate::new(status, MatchKind::Heuristic, LinkSource::Reconciler)
                    .external_id(external_id.clone())
                    .note(format!("heuristic match, score {score:.3}"));
                let linked = commit_link(self.store.as_ref(), link.key(), Some(link), update).await?;
                self.audit(link, AuditKind::HeuristicMatch {
                    external_id: external_id.clone(),
                    score,
                })
                .await?;
                report.heuristic_matches += 1;
                info!(product_id = %link.product_id, external_id = %external_id, score, "heuristic match");

                if state != ListingState::Active {
                    return self
                        .suppress(&linked, Some(state), "fresh heuristic match", report)
                        .await;
                }
                Ok(())
            }
            MatchResult::Ambiguous(candidates) => {
                warn!(product_id = %link.product_id, candidates = candidates.len(), "ambiguous heuristic match");
                self.audit(link, AuditKind::AmbiguousMatch { candidates }).await?;
                report.ambiguous += 1;
                Ok(())
            }
            MatchResult::NoMatch => {
                debug!(product_id = %link.product_id, "no snapshot entry matches yet");
                Ok(())
            }
        }
    }

    async fn record_sale(
        &self,
        product_id: ProductId,
        platform: Platform,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        match self.catalog.mark_sold(product_id, platform)? {
            SaleOutcome::Transitioned => {
                info!(product_id = %product_id, platform = %platform, "canonical product sold");
                report.sales += 1;
                self.end_other_links(product_id, platform, report).await
            }
            SaleOutcome::AlreadySold { sold_on } if sold_on == Some(platform) => {
                self.end_other_links(product_id, platform, report).await
            }
            SaleOutcome::AlreadySold { sold_on } => {
                self.resolve_conflict(product_id, sold_on, platform, report).await
            }
        }
    }

    /// Two sources claim the sale. The incumbent keeps it unless the reporter
    /// outranks it; an offline sale (`existing = None`) always stands.
    async fn resolve_conflict(
        &self,
        product_id: ProductId,
        existing: Option<Platform>,
        reported_by: Platform,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let winner = existing.map(|incumbent| self.config.priority.winner(incumbent, reported_by));
        warn!(
            product_id = %product_id,
            reported_by = %reported_by,
            existing = ?existing,
            winner = ?winner,
            "drift conflict: product sold on more than one platform"
        );
        self.store
            .append_audit(AuditEntry::for_product(
                product_id,
                reported_by,
                AuditKind::DriftConflict {
                    reported_by,
                    existing,
                    winner,
                },
            ))
            .await?;
        report.conflicts += 1;

        match winner {
            Some(winner) => {
                if Some(winner) != existing {
                    self.catalog.reattribute_sale(product_id, winner)?;
                }
                self.end_other_links(product_id, winner, report).await
            }
            None => self.end_other_links(product_id, reported_by, report).await,
        }
    }

    /// Ask every other live listing of the product to end. Safe to repeat.
    async fn end_other_links(
        &self,
        product_id: ProductId,
        sold_on: Platform,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        for other in self.store.links_for_product(product_id).await? {
            if other.platform == sold_on || !other.confirmed_status.is_live() {
                continue;
            }
            self.enqueue_corrective(
                other.key(),
                SyncPayload::End,
                format!("sold on {sold_on}"),
                report,
            )
            .await?;
        }
        Ok(())
    }

    async fn correct_metadata(
        &self,
        link: &PlatformLink,
        product: &ProductSnapshot,
        entry: &SnapshotEntry,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if let Some(observed) = entry.price.filter(|p| *p != product.price) {
            let reason = format!("price drift: platform {observed}, canonical {}", product.price);
            self.enqueue_corrective(
                link.key(),
                SyncPayload::UpdatePrice {
                    price: product.price,
                },
                reason,
                report,
            )
            .await?;
        }
        if let Some(observed) = entry.quantity.filter(|q| *q != product.stock) {
            let reason = format!("stock drift: platform {observed}, canonical {}", product.stock);
            self.enqueue_corrective(
                link.key(),
                SyncPayload::UpdateStock {
                    quantity: product.stock,
                },
                reason,
                report,
            )
            .await?;
        }
        Ok(())
    }

    /// Append a reconciler event unless one for the same operation is still open.
    async fn enqueue_corrective(
        &self,
        key: PairKey,
        payload: SyncPayload,
        reason: String,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let operation = payload.operation();
        if self.has_open(key, &[operation]).await? {
            debug!(pair = %key, operation = %operation, "corrective event already open");
            return Ok(());
        }

        let event = self
            .store
            .append_event(SyncEvent::new(
                key.product_id,
                key.platform,
                payload,
                EventOrigin::Reconciler,
            ))
            .await?;
        self.store
            .append_audit(AuditEntry::for_product(
                key.product_id,
                key.platform,
                AuditKind::CorrectiveEvent {
                    event_id: event.id,
                    operation,
                    reason: reason.clone(),
                },
            ))
            .await?;
        info!(pair = %key, operation = %operation, event_id = %event.id, reason = %reason, "corrective event emitted");
        report.corrective_events.push(event.id);
        Ok(())
    }

    async fn has_open(&self, key: PairKey, operations: &[SyncOperation]) -> Result<bool, StoreError> {
        Ok(self
            .store
            .events_for_pair(key)
            .await?
            .iter()
            .any(|e| !e.status.is_terminal() && operations.contains(&e.operation)))
    }

    /// A create or relist is still on its way; the snapshot may predate it.
    async fn transition_in_progress(&self, key: PairKey) -> Result<bool, StoreError> {
        self.has_open(key, &[SyncOperation::Create, SyncOperation::Relist])
            .await
    }

    async fn suppress(
        &self,
        link: &PlatformLink,
        observed: Option<ListingState>,
        reason: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        info!(pair = %link.key(), observed = ?observed, reason, "destructive signal suppressed");
        self.audit(
            link,
            AuditKind::DestructiveSignalSuppressed {
                external_id: link.external_id.clone(),
                observed,
                reason: reason.to_string(),
            },
        )
        .await?;
        report.suppressed += 1;
        Ok(())
    }

    async fn commit(
        &self,
        link: &PlatformLink,
        status: LinkStatus,
        match_kind: MatchKind,
        note: Option<String>,
    ) -> Result<PlatformLink, StoreError> {
        let mut update = LinkUpdate::new(status, match_kind, LinkSource::Reconciler);
        update.note = note;
        commit_link(self.store.as_ref(), link.key(), Some(link), update).await
    }

    async fn audit(&self, link: &PlatformLink, kind: AuditKind) -> Result<(), StoreError> {
        self.store
            .append_audit(AuditEntry::for_product(link.product_id, link.platform, kind))
            .await
    }

    /// One scheduled loop per registered platform.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = self
            .adapters
            .platforms()
            .into_iter()
            .map(|platform| {
                let reconciler = Arc::clone(&self);
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(reconciler.config.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = ticker.tick() => {
                                if let Err(err) = reconciler.reconcile(platform).await {
                                    warn!(platform = %platform, error = %err, "reconciliation pass failed");
                                }
                            }
                        }
                    }
                    debug!(platform = %platform, "reconciler loop stopped");
                })
            })
            .collect();

        ReconcilerHandle {
            shutdown: shutdown_tx,
            joins,
        }
    }
}

#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "reconciler task ended abnormally");
            }
        }
    }
}

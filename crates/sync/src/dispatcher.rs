//! Drains the sync event log through the platform adapters.
//!
//! ```text
//! candidates (pair heads) → worker slot → adapter capacity → pair lease
//!   → claim (fencing token) → plan from current link
//!   → adapter call (timeout, panic capture)
//!   → commit link on confirmed facts → resolve event → release lease
//! ```
//!
//! The store refuses a second in-flight event per pair and out-of-order
//! claims, so correctness does not depend on the lease alone.
//!
//! Adapter capacity (an API permit or a browser session) is reserved before
//! the claim and before the call timer starts. A saturated adapter leaves its
//! events for a later pass without holding a worker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use forgelist_core::SyncEventId;

use crate::adapter::{
    AdapterKind, AdapterOutcome, AdapterRegistry, CallSlot, FailureReason, ListingState,
    PlatformAdapter, StatusChange,
};
use crate::audit::{AuditEntry, AuditKind, LinkSource};
use crate::config::DispatcherConfig;
use crate::error::SyncError;
use crate::guard::{Lease, LeaseGuard, SharedGuard};
use crate::links::{LinkUpdate, commit_link};
use crate::model::{
    LinkStatus, MatchKind, PlatformLink, SyncEvent, SyncEventStatus, SyncOperation, SyncPayload,
};
use crate::store::{Resolution, SharedStore, StoreError, SyncStore};

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub passes: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub partial: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub superseded: u64,
    /// Results discarded because the claim had been taken over.
    pub stale: u64,
}

/// What became of one claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Partial,
    Retrying { next_attempt_at: DateTime<Utc> },
    DeadLettered { error: String },
    /// Failed in favour of a newer event of the same operation.
    Superseded { by: SyncEventId },
    Stale,
}

enum Plan {
    Call { external_id: Option<String> },
    /// The link already answers the operation; no adapter call.
    Known(AdapterOutcome),
    /// Nothing to do on the marketplace.
    Noop(&'static str),
}

/// Decide from the pair's current link whether the adapter must be called.
///
/// Re-running an event whose effect is already recorded must not repeat the
/// effect; this is what makes lease expiry and redelivery safe.
fn plan(event: &SyncEvent, link: Option<&PlatformLink>) -> Plan {
    let awaiting = || {
        Plan::Known(AdapterOutcome::failed(
            FailureReason::AwaitingConfirmation,
            format!("{} has no external id on {} yet", event.product_id, event.platform),
        ))
    };

    match event.operation {
        SyncOperation::Create => match link {
            Some(l) if l.confirmed_status == LinkStatus::Active && l.external_id.is_some() => {
                let external_id = l.external_id.clone().unwrap_or_default();
                Plan::Known(AdapterOutcome::confirmed(external_id, ListingState::Active))
            }
            Some(l) if l.confirmed_status.is_live() => Plan::Known(AdapterOutcome::AcceptedPending {
                note: "listing already submitted, awaiting confirmation".to_string(),
            }),
            _ => Plan::Call { external_id: None },
        },
        SyncOperation::UpdatePrice | SyncOperation::UpdateStock => match link {
            None => Plan::Known(AdapterOutcome::failed(
                FailureReason::InvalidState,
                format!("{} is not listed on {}", event.product_id, event.platform),
            )),
            Some(l) if !l.confirmed_status.is_live() => Plan::Known(AdapterOutcome::failed(
                FailureReason::InvalidState,
                format!("listing is {}", l.confirmed_status),
            )),
            Some(l) => match &l.external_id {
                Some(id) => Plan::Call {
                    external_id: Some(id.clone()),
                },
                None => awaiting(),
            },
        },
        SyncOperation::End => match link {
            None => Plan::Noop("nothing listed"),
            Some(l) if !l.confirmed_status.is_live() => Plan::Noop("listing already gone"),
            Some(l) => match &l.external_id {
                Some(id) => Plan::Call {
                    external_id: Some(id.clone()),
                },
                None => awaiting(),
            },
        },
        SyncOperation::Relist => match link {
            None => Plan::Known(AdapterOutcome::failed(
                FailureReason::InvalidState,
                format!("{} was never listed on {}", event.product_id, event.platform),
            )),
            Some(l) if l.confirmed_status == LinkStatus::Active => Plan::Noop("listing already active"),
            Some(l) => match &l.external_id {
                Some(id) => Plan::Call {
                    external_id: Some(id.clone()),
                },
                None => awaiting(),
            },
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked".to_string()
    }
}

pub struct Dispatcher {
    store: SharedStore,
    guard: SharedGuard,
    adapters: Arc<AdapterRegistry>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
    wake: Arc<Notify>,
    stats: Mutex<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        guard: SharedGuard,
        adapters: Arc<AdapterRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            store,
            guard,
            adapters,
            config,
            workers,
            wake: Arc::new(Notify::new()),
            stats: Mutex::new(DispatcherStats::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Shared handle that wakes the running loop early.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut DispatcherStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// One drain pass: dispatch every due pair head a worker slot is free for,
    /// and wait for those attempts to finish. Returns the number of attempts.
    #[instrument(skip(self), fields(dispatcher = %self.config.name))]
    pub async fn run_once(&self) -> Result<usize, SyncError> {
        self.bump(|s| s.passes += 1);
        let candidates = self
            .store
            .dispatch_candidates(Utc::now(), self.config.batch_size)
            .await?;

        let mut attempts = FuturesUnordered::new();
        // Claimed attempts always run to completion, even when a later claim fails.
        let mut failure: Option<SyncError> = None;
        for event in candidates {
            let Ok(slot) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let key = event.key();
            let capacity = match self.adapters.get(event.platform) {
                Some(adapter) => match self.adapters.reserve(adapter.as_ref()) {
                    Some(capacity) => capacity,
                    None => {
                        debug!(pair = %key, platform = %event.platform, "adapter saturated, left for a later pass");
                        continue;
                    }
                },
                None => CallSlot::default(),
            };
            let lease = match self
                .guard
                .try_acquire(key, &self.config.name, self.config.lease_ttl)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(pair = %key, "pair leased elsewhere");
                    continue;
                }
                Err(err) => {
                    failure = Some(err.into());
                    break;
                }
            };

            match self.store.claim_event(event.id, lease.token, Utc::now()).await {
                Ok(claimed) => {
                    debug!(
                        event_id = %claimed.id,
                        pair = %key,
                        operation = %claimed.operation,
                        attempt = claimed.attempt_count,
                        "claimed sync event"
                    );
                    attempts.push(async move {
                        let _slot = slot;
                        self.execute(claimed, lease, capacity).await
                    });
                }
                Err(
                    err @ (StoreError::PairBusy(_)
                    | StoreError::OutOfOrder { .. }
                    | StoreError::NotDue(_)
                    | StoreError::InvalidTransition { .. }),
                ) => {
                    debug!(event_id = %event.id, error = %err, "candidate no longer claimable");
                    self.release(&lease).await;
                }
                Err(err) => {
                    self.release(&lease).await;
                    failure = Some(err.into());
                    break;
                }
            }
        }

        let mut count = 0;
        while let Some(result) = attempts.next().await {
            count += 1;
            if let Err(err) = result {
                error!(error = %err, "sync attempt failed to record");
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(err) = self.guard.release(lease).await {
            warn!(pair = %lease.key, error = %err, "failed to release pair lease");
        }
    }

    async fn execute(
        &self,
        event: SyncEvent,
        lease: Lease,
        capacity: CallSlot,
    ) -> Result<Disposition, SyncError> {
        self.bump(|s| s.dispatched += 1);
        let result = self.attempt(&event, &lease, capacity).await;
        self.release(&lease).await;
        result
    }

    #[instrument(skip_all, fields(event_id = %event.id, pair = %event.key(), operation = %event.operation))]
    async fn attempt(
        &self,
        event: &SyncEvent,
        lease: &Lease,
        capacity: CallSlot,
    ) -> Result<Disposition, SyncError> {
        let link = self.store.get_link(event.key()).await?;

        let outcome = match plan(event, link.as_ref()) {
            Plan::Noop(reason) => {
                debug!(reason, "nothing to do on the marketplace");
                return self.finish(event, lease, Resolution::Success).await;
            }
            Plan::Known(outcome) => {
                debug!("resolved from the current link without calling the adapter");
                outcome
            }
            Plan::Call { external_id } => match self.adapters.get(event.platform) {
                Some(adapter) => {
                    self.invoke(adapter.as_ref(), event, external_id.as_deref(), capacity)
                        .await
                }
                None => AdapterOutcome::failed(
                    FailureReason::InvalidState,
                    format!("no adapter registered for {}", event.platform),
                ),
            },
        };

        self.apply(event, lease, link, outcome).await
    }

    async fn invoke(
        &self,
        adapter: &dyn PlatformAdapter,
        event: &SyncEvent,
        external_id: Option<&str>,
        capacity: CallSlot,
    ) -> AdapterOutcome {
        let call = capacity.run(async {
            match (&event.payload, external_id) {
                (SyncPayload::Create { draft }, _) => adapter.create_listing(draft, event.id).await,
                (SyncPayload::UpdatePrice { price }, Some(id)) => {
                    adapter.update_price(id, *price).await
                }
                (SyncPayload::UpdateStock { quantity }, Some(id)) => {
                    adapter.update_stock(id, *quantity).await
                }
                (SyncPayload::End, Some(id)) => adapter.update_status(id, StatusChange::End).await,
                (SyncPayload::Relist, Some(id)) => {
                    adapter.update_status(id, StatusChange::Relist).await
                }
                (_, None) => AdapterOutcome::failed(
                    FailureReason::AwaitingConfirmation,
                    "no external id to address",
                ),
            }
        });

        match tokio::time::timeout(self.config.call_timeout, AssertUnwindSafe(call).catch_unwind())
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                error!(panic = %panic_message(panic.as_ref()), "adapter panicked");
                AdapterOutcome::failed(FailureReason::Crashed, panic_message(panic.as_ref()))
            }
            // The session was already running when the timer started and
            // keeps going, so the form may still be submitted.
            Err(_)
                if adapter.kind() == AdapterKind::Browser
                    && event.operation == SyncOperation::Create =>
            {
                warn!(event_id = %event.id, pair = %event.key(), "browser create outlived the call timeout");
                AdapterOutcome::AcceptedPending {
                    note: format!(
                        "browser session still running after {:?}; awaiting reconciliation",
                        self.config.call_timeout
                    ),
                }
            }
            Err(_) => AdapterOutcome::failed(
                FailureReason::Timeout,
                format!("no answer within {:?}", self.config.call_timeout),
            ),
        }
    }

    async fn apply(
        &self,
        event: &SyncEvent,
        lease: &Lease,
        link: Option<PlatformLink>,
        outcome: AdapterOutcome,
    ) -> Result<Disposition, SyncError> {
        let key = event.key();
        let source = LinkSource::Dispatcher { event_id: event.id };

        match outcome {
            AdapterOutcome::Confirmed { external_id, state } => {
                // A marketplace answer for our own call settles any heuristic doubt.
                let update =
                    LinkUpdate::new(state.into(), MatchKind::Exact, source).external_id(external_id);
                commit_link(self.store.as_ref(), key, link.as_ref(), update).await?;
                self.finish(event, lease, Resolution::Success).await
            }
            AdapterOutcome::AcceptedPending { note } => {
                if event.operation == SyncOperation::Create {
                    let match_kind = link.as_ref().map_or(MatchKind::Exact, |l| l.match_kind);
                    let update = LinkUpdate::new(LinkStatus::PendingConfirmation, match_kind, source)
                        .note(note.clone());
                    commit_link(self.store.as_ref(), key, link.as_ref(), update).await?;
                }
                self.store
                    .append_audit(AuditEntry::for_product(
                        event.product_id,
                        event.platform,
                        AuditKind::AcceptedPending {
                            event_id: event.id,
                            operation: event.operation,
                            note,
                        },
                    ))
                    .await?;
                self.finish(event, lease, Resolution::Partial).await
            }
            AdapterOutcome::Failed(failure) => {
                let error = failure.to_string();
                if failure.is_transient() && self.config.retry.should_retry(event.attempt_count) {
                    let next_attempt_at = self
                        .config
                        .retry
                        .next_attempt_at(event.attempt_count, Utc::now());
                    debug!(error = %error, attempt = event.attempt_count, %next_attempt_at, "transient failure, retrying");
                    self.finish(
                        event,
                        lease,
                        Resolution::Retry {
                            error,
                            next_attempt_at,
                        },
                    )
                    .await
                } else {
                    warn!(
                        event_id = %event.id,
                        pair = %key,
                        attempts = event.attempt_count,
                        error = %error,
                        "sync event dead-lettered"
                    );
                    self.finish(event, lease, Resolution::DeadLetter { error }).await
                }
            }
        }
    }

    async fn finish(
        &self,
        event: &SyncEvent,
        lease: &Lease,
        resolution: Resolution,
    ) -> Result<Disposition, SyncError> {
        let disposition = match &resolution {
            Resolution::Success => Disposition::Succeeded,
            Resolution::Partial => Disposition::Partial,
            Resolution::Retry {
                next_attempt_at, ..
            } => Disposition::Retrying {
                next_attempt_at: *next_attempt_at,
            },
            Resolution::DeadLetter { error } => Disposition::DeadLettered {
                error: error.clone(),
            },
        };

        let resolved = match self
            .store
            .resolve_event(event.id, lease.token, resolution, Utc::now())
            .await
        {
            Ok(resolved) => resolved,
            Err(err @ (StoreError::StaleLease(_) | StoreError::InvalidTransition { .. })) => {
                warn!(event_id = %event.id, error = %err, "attempt result discarded, claim was taken over");
                self.bump(|s| s.stale += 1);
                return Ok(Disposition::Stale);
            }
            Err(err) => return Err(err.into()),
        };

        let disposition = match disposition {
            Disposition::Retrying { .. } => self
                .supersede_if_overtaken(&resolved)
                .await?
                .unwrap_or(disposition),
            other => other,
        };

        self.bump(|s| match &disposition {
            Disposition::Succeeded => s.succeeded += 1,
            Disposition::Partial => s.partial += 1,
            Disposition::Retrying { .. } => s.retried += 1,
            Disposition::DeadLettered { .. } => s.dead_lettered += 1,
            Disposition::Superseded { .. } => s.superseded += 1,
            Disposition::Stale => s.stale += 1,
        });
        Ok(disposition)
    }

    /// Fail a retrying value update once a newer one for the pair is queued,
    /// so the newer value goes out without waiting for the backoff.
    async fn supersede_if_overtaken(
        &self,
        resolved: &SyncEvent,
    ) -> Result<Option<Disposition>, SyncError> {
        if !resolved.operation.is_value_update() {
            return Ok(None);
        }
        let newer = self
            .store
            .events_for_pair(resolved.key())
            .await?
            .into_iter()
            .filter(|e| {
                e.seq > resolved.seq
                    && e.operation == resolved.operation
                    && e.status == SyncEventStatus::Pending
            })
            .max_by_key(|e| e.seq);
        let Some(newer) = newer else {
            return Ok(None);
        };

        // The resolved event is the pair head, so nothing older is still pending.
        let superseded = self
            .store
            .supersede_pending(resolved.key(), resolved.seq + 1, newer.id, Utc::now())
            .await?;
        if !superseded.contains(&resolved.id) {
            // Claimed again by another dispatcher in the meantime.
            return Ok(None);
        }
        info!(event_id = %resolved.id, by = %newer.id, "retrying event superseded by a newer one");
        Ok(Some(Disposition::Superseded { by: newer.id }))
    }

    /// Run drain passes in a background task until shut down.
    ///
    /// The loop drains until nothing is dispatchable, then sleeps for
    /// `poll_interval` or until [`Dispatcher::wake`] is called.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::clone(&self);

        let join = tokio::spawn(async move {
            info!(name = %dispatcher.config.name, "dispatcher started");
            loop {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    match dispatcher.run_once().await {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            error!(error = %err, "dispatch pass failed");
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = dispatcher.wake.notified() => {}
                    _ = tokio::time::sleep(dispatcher.config.poll_interval) => {}
                }
            }
            info!(name = %dispatcher.config.name, "dispatcher stopped");
        });

        DispatcherHandle {
            dispatcher: self,
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running dispatcher loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Stop after in-flight attempts finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "dispatcher task ended abnormally");
        }
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.config.name)
            .field("adapters", &self.adapters)
            .finish()
    }
}

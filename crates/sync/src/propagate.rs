//! Turns canonical product events into sync events.
//!
//! Each catalog event fans out to the product's links. Appends carry the
//! catalog event id as causation, so replaying a stream enqueues nothing new.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use forgelist_catalog::ProductEvent;
use forgelist_core::{Platform, ProductId};
use forgelist_events::{EventEnvelope, Subscription};

use crate::model::{EventOrigin, LinkStatus, PairKey, PlatformLink, SyncEvent, SyncPayload};
use crate::store::{SharedStore, StoreError};

pub struct ChangePropagator {
    store: SharedStore,
    dispatch_wake: Option<Arc<Notify>>,
}

impl ChangePropagator {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            dispatch_wake: None,
        }
    }

    pub fn with_dispatch_wake(mut self, wake: Arc<Notify>) -> Self {
        self.dispatch_wake = Some(wake);
        self
    }

    /// Enqueue the sync events one catalog event implies. Returns what was appended.
    pub async fn handle(
        &self,
        envelope: &EventEnvelope<ProductEvent>,
    ) -> Result<Vec<SyncEvent>, StoreError> {
        let product_id = envelope.product_id();
        let planned: Vec<(Platform, SyncPayload)> = match envelope.payload() {
            ProductEvent::ListingRequested {
                platform, draft, ..
            } => vec![(
                *platform,
                SyncPayload::Create {
                    draft: draft.clone(),
                },
            )],
            ProductEvent::PriceChanged { price, .. } => {
                self.fan_out(product_id, LinkStatus::is_live, || SyncPayload::UpdatePrice {
                    price: *price,
                })
                .await?
            }
            ProductEvent::StockAdjusted { stock, .. } => {
                self.fan_out(product_id, LinkStatus::is_live, || SyncPayload::UpdateStock {
                    quantity: *stock,
                })
                .await?
            }
            ProductEvent::ProductSold { sold_on, .. } => {
                let sold_on = *sold_on;
                self.fan_out(product_id, LinkStatus::is_live, || SyncPayload::End)
                    .await?
                    .into_iter()
                    .filter(|(platform, _)| Some(*platform) != sold_on)
                    .collect()
            }
            ProductEvent::ProductEnded { .. } => {
                self.fan_out(product_id, LinkStatus::is_live, || SyncPayload::End)
                    .await?
            }
            ProductEvent::ProductRelisted { .. } => {
                self.fan_out(
                    product_id,
                    |status| matches!(status, LinkStatus::Ended | LinkStatus::Sold),
                    || SyncPayload::Relist,
                )
                .await?
            }
            ProductEvent::ProductCreated(_)
            | ProductEvent::ProductActivated { .. }
            | ProductEvent::SaleReattributed { .. } => Vec::new(),
        };

        let mut appended = Vec::with_capacity(planned.len());
        for (platform, payload) in planned {
            let key = PairKey::new(product_id, platform);
            if matches!(payload, SyncPayload::End) && self.has_open_end(key).await? {
                debug!(pair = %key, "end already queued");
                continue;
            }
            let event = SyncEvent::new(product_id, platform, payload, EventOrigin::Canonical)
                .caused_by(envelope.event_id());
            let stored = self.store.append_event(event).await?;
            debug!(pair = %key, event_id = %stored.id, operation = %stored.operation, "sync event enqueued");
            appended.push(stored);
        }

        if !appended.is_empty() {
            if let Some(wake) = &self.dispatch_wake {
                wake.notify_one();
            }
        }
        Ok(appended)
    }

    async fn fan_out(
        &self,
        product_id: ProductId,
        eligible: impl Fn(&LinkStatus) -> bool,
        payload: impl Fn() -> SyncPayload,
    ) -> Result<Vec<(Platform, SyncPayload)>, StoreError> {
        let links: Vec<PlatformLink> = self.store.links_for_product(product_id).await?;
        Ok(links
            .into_iter()
            .filter(|link| eligible(&link.confirmed_status))
            .map(|link| (link.platform, payload()))
            .collect())
    }

    async fn has_open_end(&self, key: PairKey) -> Result<bool, StoreError> {
        Ok(self
            .store
            .events_for_pair(key)
            .await?
            .iter()
            .any(|e| !e.status.is_terminal() && matches!(e.payload, SyncPayload::End)))
    }

    /// Drain the subscription until shutdown or until the bus goes away.
    pub fn spawn(
        self: Arc<Self>,
        subscription: Subscription<EventEnvelope<ProductEvent>>,
        poll_interval: Duration,
    ) -> PropagatorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                match subscription.try_recv() {
                    Ok(envelope) => {
                        if let Err(err) = self.handle(&envelope).await {
                            warn!(
                                product_id = %envelope.product_id(),
                                event_id = %envelope.event_id(),
                                error = %err,
                                "failed to enqueue sync events"
                            );
                        }
                        continue;
                    }
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                        info!("catalog bus closed, propagator stopping");
                        break;
                    }
                    Err(std::sync::mpsc::TryRecvError::Empty) => {}
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });
        PropagatorHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct PropagatorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PropagatorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "propagator task ended abnormally");
        }
    }
}

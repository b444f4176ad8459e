//! Browser-automated marketplaces.
//!
//! Drivers are blocking and heavy (one headless browser session per call),
//! so every call runs on the blocking thread pool behind a [`BrowserPool`]
//! permit. The permit moves into the blocking closure: if the dispatcher
//! times out and drops the future, the session still counts against the
//! pool until the driver call actually returns.

use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use forgelist_catalog::ListingDraft;
use forgelist_core::{Platform, Price, SyncEventId};

use super::{
    AdapterFailure, AdapterKind, AdapterOutcome, FailureReason, ListingState, ObservationSource,
    PlatformAdapter, Snapshot, SnapshotEntry, StatusChange,
};
use crate::payload::{CategoryMap, PlatformListing};

/// A listing read back from the marketplace UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedListing {
    pub external_id: String,
    pub state: ListingState,
    pub title: String,
    pub brand: Option<String>,
    pub price: Option<Price>,
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("browser session crashed: {0}")]
    SessionCrashed(String),
    /// Page not in the expected shape (slow load, layout change).
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("login required")]
    LoginRequired,
    #[error("form rejected: {0}")]
    FormRejected(String),
    #[error("listing not found: {0}")]
    ListingNotFound(String),
    #[error("page load timed out")]
    Timeout,
}

impl From<DriverError> for AdapterFailure {
    fn from(value: DriverError) -> Self {
        let reason = match &value {
            DriverError::SessionCrashed(_) => FailureReason::Network,
            DriverError::ElementNotFound(_) => FailureReason::Network,
            DriverError::Timeout => FailureReason::Timeout,
            DriverError::LoginRequired => FailureReason::Unauthorized,
            DriverError::FormRejected(_) => FailureReason::Validation,
            DriverError::ListingNotFound(_) => FailureReason::NotFound,
        };
        AdapterFailure::new(reason, value.to_string())
    }
}

/// Blocking browser automation. Implemented outside this crate.
pub trait BrowserDriver: Send + Sync + 'static {
    /// Fill and submit the listing form. The marketplace shows no id on
    /// success, so nothing is returned.
    fn submit_listing(&self, listing: &PlatformListing) -> Result<(), DriverError>;

    fn edit_price(&self, external_id: &str, price: Price) -> Result<ScrapedListing, DriverError>;

    fn edit_quantity(&self, external_id: &str, quantity: u32)
    -> Result<ScrapedListing, DriverError>;

    fn end_listing(&self, external_id: &str) -> Result<ScrapedListing, DriverError>;

    fn relist(&self, external_id: &str) -> Result<ScrapedListing, DriverError>;

    /// Read every listing on the seller's page.
    fn scrape_listings(&self) -> Result<Vec<ScrapedListing>, DriverError>;
}

tokio::task_local! {
    static RESERVED_SESSION: Cell<Option<OwnedSemaphorePermit>>;
}

/// A session slot taken ahead of the call that will use it.
///
/// The first [`BrowserPool::run`] inside [`SessionReservation::scope`] starts
/// its session on this slot without waiting. An unused slot is freed when the
/// scope ends.
#[derive(Debug, Default)]
pub struct SessionReservation {
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionReservation {
    /// No slot held; calls in scope wait for the pool as usual.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }

    pub async fn scope<F: Future>(self, call: F) -> F::Output {
        match self.permit {
            Some(permit) => RESERVED_SESSION.scope(Cell::new(Some(permit)), call).await,
            None => call.await,
        }
    }
}

/// Hard bound on concurrent browser sessions.
#[derive(Debug, Clone)]
pub struct BrowserPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BrowserPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a session slot now, or `None` when every session is busy.
    pub fn try_reserve(&self) -> Option<SessionReservation> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionReservation {
                permit: Some(permit),
            })
    }

    /// Run `job` on the blocking pool once a session slot is free. Inside
    /// [`SessionReservation::scope`] the reserved slot is used instead.
    pub async fn run<T, F>(&self, job: F) -> Result<T, AdapterFailure>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let reserved = RESERVED_SESSION.try_with(Cell::take).ok().flatten();
        let permit = match reserved {
            Some(permit) => permit,
            None => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AdapterFailure::new(FailureReason::Network, "browser pool closed"))?,
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| AdapterFailure::new(FailureReason::Crashed, format!("browser session: {err}")))
    }
}

pub struct BrowserAdapter<D> {
    platform: Platform,
    driver: Arc<D>,
    pool: BrowserPool,
    categories: CategoryMap,
}

impl<D: BrowserDriver> BrowserAdapter<D> {
    pub fn new(platform: Platform, driver: D, pool: BrowserPool, categories: CategoryMap) -> Self {
        Self {
            platform,
            driver: Arc::new(driver),
            pool,
            categories,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    async fn edit<F>(&self, call: F) -> AdapterOutcome
    where
        F: FnOnce(&D) -> Result<ScrapedListing, DriverError> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        match self.pool.run(move || call(driver.as_ref())).await {
            Ok(Ok(scraped)) => AdapterOutcome::confirmed(scraped.external_id, scraped.state),
            Ok(Err(err)) => AdapterOutcome::Failed(err.into()),
            Err(failure) => AdapterOutcome::Failed(failure),
        }
    }
}

#[async_trait]
impl<D: BrowserDriver> PlatformAdapter for BrowserAdapter<D> {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Browser
    }

    fn reserve_session(&self) -> Option<SessionReservation> {
        self.pool.try_reserve()
    }

    /// The browser flow cannot report the new listing's id; the key is unused
    /// and the reconciler links the listing later.
    #[instrument(skip(self, draft, _idempotency_key), fields(platform = %self.platform, sku = %draft.sku))]
    async fn create_listing(
        &self,
        draft: &ListingDraft,
        _idempotency_key: SyncEventId,
    ) -> AdapterOutcome {
        let listing = match PlatformListing::translate(self.platform, draft, &self.categories) {
            Ok(listing) => listing,
            Err(failure) => return AdapterOutcome::Failed(failure),
        };
        let driver = Arc::clone(&self.driver);
        match self.pool.run(move || driver.submit_listing(&listing)).await {
            Ok(Ok(())) => {
                debug!("listing form submitted");
                AdapterOutcome::AcceptedPending {
                    note: format!("submitted {} via browser; awaiting reconciliation", draft.sku),
                }
            }
            Ok(Err(err)) => AdapterOutcome::Failed(err.into()),
            Err(failure) => AdapterOutcome::Failed(failure),
        }
    }

    async fn update_price(&self, external_id: &str, price: Price) -> AdapterOutcome {
        let id = external_id.to_string();
        self.edit(move |d| d.edit_price(&id, price)).await
    }

    async fn update_stock(&self, external_id: &str, quantity: u32) -> AdapterOutcome {
        let id = external_id.to_string();
        self.edit(move |d| d.edit_quantity(&id, quantity)).await
    }

    async fn update_status(&self, external_id: &str, change: StatusChange) -> AdapterOutcome {
        let id = external_id.to_string();
        match change {
            StatusChange::End => self.edit(move |d| d.end_listing(&id)).await,
            StatusChange::Relist => self.edit(move |d| d.relist(&id)).await,
        }
    }

    #[instrument(skip(self), fields(platform = %self.platform))]
    async fn fetch_snapshot(&self) -> Result<Snapshot, AdapterFailure> {
        let driver = Arc::clone(&self.driver);
        let scraped = self.pool.run(move || driver.scrape_listings()).await??;
        let observed_at = Utc::now();
        let entries = scraped
            .into_iter()
            .map(|s| SnapshotEntry {
                external_id: s.external_id,
                state: s.state,
                price: s.price,
                quantity: s.quantity,
                brand: s.brand,
                model: None,
                title: Some(s.title),
                observed_at,
                source: ObservationSource::Snapshot,
            })
            .collect();
        Ok(Snapshot::new(self.platform, entries))
    }
}

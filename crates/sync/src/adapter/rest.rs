//! API-backed marketplaces.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use forgelist_catalog::ListingDraft;
use forgelist_core::{Platform, Price, SyncEventId};

use super::{
    AdapterFailure, AdapterKind, AdapterOutcome, FailureReason, ListingState, PlatformAdapter,
    Snapshot, SnapshotEntry, StatusChange,
};
use crate::payload::{CategoryMap, PlatformListing};

/// A listing as a marketplace API returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteListing {
    pub external_id: String,
    pub state: ListingState,
    pub price: Option<Price>,
    pub quantity: Option<u32>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
}

impl RemoteListing {
    pub fn new(external_id: impl Into<String>, state: ListingState) -> Self {
        Self {
            external_id: external_id.into(),
            state,
            price: None,
            quantity: None,
            brand: None,
            model: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPage {
    pub listings: Vec<RemoteListing>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("network: {0}")]
    Network(String),
    /// The marketplace refused the document (4xx with a reason).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("listing not found: {0}")]
    NotFound(String),
}

impl From<ClientError> for AdapterFailure {
    fn from(value: ClientError) -> Self {
        let reason = match &value {
            ClientError::Timeout => FailureReason::Timeout,
            ClientError::RateLimited => FailureReason::RateLimited,
            ClientError::Network(_) => FailureReason::Network,
            ClientError::Rejected(_) => FailureReason::Validation,
            ClientError::Unauthorized => FailureReason::Unauthorized,
            ClientError::NotFound(_) => FailureReason::NotFound,
        };
        AdapterFailure::new(reason, value.to_string())
    }
}

/// Raw marketplace API client. Implemented outside this crate.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// Create a listing. Marketplaces that honour `idempotency_key` return the
    /// original listing for a repeated key instead of creating a second one.
    async fn create(
        &self,
        listing: &PlatformListing,
        idempotency_key: &str,
    ) -> Result<RemoteListing, ClientError>;

    async fn set_price(&self, external_id: &str, price: Price) -> Result<RemoteListing, ClientError>;

    async fn set_quantity(
        &self,
        external_id: &str,
        quantity: u32,
    ) -> Result<RemoteListing, ClientError>;

    async fn end(&self, external_id: &str) -> Result<RemoteListing, ClientError>;

    /// Some marketplaces assign a new id on relist; the returned listing carries it.
    async fn relist(&self, external_id: &str) -> Result<RemoteListing, ClientError>;

    async fn export_page(&self, cursor: Option<&str>) -> Result<ExportPage, ClientError>;
}

pub struct RestAdapter<C> {
    platform: Platform,
    client: C,
    categories: CategoryMap,
    max_snapshot_pages: usize,
}

impl<C: MarketplaceClient> RestAdapter<C> {
    pub fn new(platform: Platform, client: C, categories: CategoryMap) -> Self {
        Self {
            platform,
            client,
            categories,
            max_snapshot_pages: 200,
        }
    }

    pub fn with_max_snapshot_pages(mut self, pages: usize) -> Self {
        self.max_snapshot_pages = pages.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn confirm(result: Result<RemoteListing, ClientError>) -> AdapterOutcome {
        match result {
            Ok(remote) => AdapterOutcome::confirmed(remote.external_id, remote.state),
            Err(err) => AdapterOutcome::Failed(err.into()),
        }
    }
}

#[async_trait]
impl<C: MarketplaceClient> PlatformAdapter for RestAdapter<C> {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Api
    }

    #[instrument(skip(self, draft), fields(platform = %self.platform, sku = %draft.sku))]
    async fn create_listing(
        &self,
        draft: &ListingDraft,
        idempotency_key: SyncEventId,
    ) -> AdapterOutcome {
        let listing = match PlatformListing::translate(self.platform, draft, &self.categories) {
            Ok(listing) => listing,
            Err(failure) => return AdapterOutcome::Failed(failure),
        };
        Self::confirm(self.client.create(&listing, &idempotency_key.to_string()).await)
    }

    async fn update_price(&self, external_id: &str, price: Price) -> AdapterOutcome {
        Self::confirm(self.client.set_price(external_id, price).await)
    }

    async fn update_stock(&self, external_id: &str, quantity: u32) -> AdapterOutcome {
        Self::confirm(self.client.set_quantity(external_id, quantity).await)
    }

    async fn update_status(&self, external_id: &str, change: StatusChange) -> AdapterOutcome {
        match change {
            StatusChange::End => Self::confirm(self.client.end(external_id).await),
            StatusChange::Relist => Self::confirm(self.client.relist(external_id).await),
        }
    }

    #[instrument(skip(self), fields(platform = %self.platform))]
    async fn fetch_snapshot(&self) -> Result<Snapshot, AdapterFailure> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..self.max_snapshot_pages {
            let page = self.client.export_page(cursor.as_deref()).await?;
            let observed_at = Utc::now();
            entries.extend(page.listings.into_iter().map(|remote| SnapshotEntry {
                external_id: remote.external_id,
                state: remote.state,
                price: remote.price,
                quantity: remote.quantity,
                brand: remote.brand,
                model: remote.model,
                title: remote.title,
                observed_at,
                source: super::ObservationSource::Snapshot,
            }));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    debug!(pages = page_no + 1, entries = entries.len(), "export complete");
                    return Ok(Snapshot::new(self.platform, entries));
                }
            }
        }

        warn!(
            max_pages = self.max_snapshot_pages,
            entries = entries.len(),
            "export truncated at page limit"
        );
        Ok(Snapshot::new(self.platform, entries).truncated())
    }
}

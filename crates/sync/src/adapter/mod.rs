//! Marketplace adapter contract.
//!
//! Every marketplace is driven through [`PlatformAdapter`]. Adapters never
//! return errors: a failed call is an [`AdapterOutcome::Failed`] value with a
//! classification the dispatcher turns into a retry or a dead letter.

pub mod browser;
pub mod registry;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgelist_catalog::ListingDraft;
use forgelist_core::{Platform, Price, SyncEventId};

pub use browser::{
    BrowserAdapter, BrowserDriver, BrowserPool, DriverError, ScrapedListing, SessionReservation,
};
pub use registry::{AdapterRegistry, CallSlot};
pub use rest::{ClientError, ExportPage, MarketplaceClient, RemoteListing, RestAdapter};

/// Listing state as the marketplace reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingState {
    Active,
    Sold,
    Ended,
}

impl ListingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingState::Active => "active",
            ListingState::Sold => "sold",
            ListingState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Retrying cannot help; dead-letter now.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    RateLimited,
    Network,
    /// The adapter panicked mid-call.
    Crashed,
    /// The pair has no external id yet; waits for reconciliation.
    AwaitingConfirmation,
    Validation,
    CategoryMismatch,
    Unauthorized,
    NotFound,
    /// The link is in a state the operation cannot apply to.
    InvalidState,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::Timeout
            | FailureReason::RateLimited
            | FailureReason::Network
            | FailureReason::Crashed
            | FailureReason::AwaitingConfirmation => FailureClass::Transient,
            FailureReason::Validation
            | FailureReason::CategoryMismatch
            | FailureReason::Unauthorized
            | FailureReason::NotFound
            | FailureReason::InvalidState => FailureClass::Permanent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Network => "network",
            FailureReason::Crashed => "crashed",
            FailureReason::AwaitingConfirmation => "awaiting_confirmation",
            FailureReason::Validation => "validation",
            FailureReason::CategoryMismatch => "category_mismatch",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::NotFound => "not_found",
            FailureReason::InvalidState => "invalid_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl AdapterFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.reason.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

impl core::fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.message)
    }
}

/// Result of one adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// The marketplace acknowledged the change and reported the listing's state.
    Confirmed {
        external_id: String,
        state: ListingState,
    },
    /// Submitted, but the marketplace gives no synchronous confirmation.
    AcceptedPending { note: String },
    Failed(AdapterFailure),
}

impl AdapterOutcome {
    pub fn confirmed(external_id: impl Into<String>, state: ListingState) -> Self {
        Self::Confirmed {
            external_id: external_id.into(),
            state,
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self::Failed(AdapterFailure::new(reason, message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusChange {
    End,
    Relist,
}

/// API adapters share one concurrency ceiling; browser adapters bring their own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Api,
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    /// Pulled by the reconciler.
    Snapshot,
    /// Pushed by the marketplace (webhook, import). Counts as a confirming signal.
    Webhook,
}

/// One listing as observed on a marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub external_id: String,
    pub state: ListingState,
    pub price: Option<Price>,
    pub quantity: Option<u32>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub source: ObservationSource,
}

impl SnapshotEntry {
    pub fn new(external_id: impl Into<String>, state: ListingState) -> Self {
        Self {
            external_id: external_id.into(),
            state,
            price: None,
            quantity: None,
            brand: None,
            model: None,
            title: None,
            observed_at: Utc::now(),
            source: ObservationSource::Snapshot,
        }
    }

    pub fn with_price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_identity(
        mut self,
        brand: impl Into<String>,
        model: Option<String>,
        title: Option<String>,
    ) -> Self {
        self.brand = Some(brand.into());
        self.model = model;
        self.title = title;
        self
    }

    pub fn from_webhook(mut self) -> Self {
        self.source = ObservationSource::Webhook;
        self
    }
}

/// Full read of a marketplace's listings.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub platform: Platform,
    pub entries: Vec<SnapshotEntry>,
    pub fetched_at: DateTime<Utc>,
    /// False when the export was cut short; absence then proves nothing.
    pub complete: bool,
}

impl Snapshot {
    pub fn new(platform: Platform, entries: Vec<SnapshotEntry>) -> Self {
        Self {
            platform,
            entries,
            fetched_at: Utc::now(),
            complete: true,
        }
    }

    pub fn truncated(mut self) -> Self {
        self.complete = false;
        self
    }
}

/// Uniform capability set over one marketplace.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn kind(&self) -> AdapterKind;

    /// Take a session slot for one call without waiting; `None` when every
    /// session is busy. Adapters without sessions of their own never run out.
    fn reserve_session(&self) -> Option<SessionReservation> {
        Some(SessionReservation::unbounded())
    }

    /// `idempotency_key` is stable across retries of the same sync event.
    async fn create_listing(
        &self,
        draft: &ListingDraft,
        idempotency_key: SyncEventId,
    ) -> AdapterOutcome;

    async fn update_price(&self, external_id: &str, price: Price) -> AdapterOutcome;

    async fn update_stock(&self, external_id: &str, quantity: u32) -> AdapterOutcome;

    async fn update_status(&self, external_id: &str, change: StatusChange) -> AdapterOutcome;

    async fn fetch_snapshot(&self) -> Result<Snapshot, AdapterFailure>;
}

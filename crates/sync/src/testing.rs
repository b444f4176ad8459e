//! Scripted fakes for adapters, marketplace clients and browser drivers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use forgelist_catalog::ListingDraft;
use forgelist_core::{Platform, Price, ProductId, SyncEventId};

use crate::adapter::{
    AdapterFailure, AdapterKind, AdapterOutcome, ClientError, DriverError, ExportPage,
    FailureReason, ListingState, MarketplaceClient, PlatformAdapter, RemoteListing,
    ScrapedListing, Snapshot, SnapshotEntry, StatusChange,
};
use crate::adapter::BrowserDriver;
use crate::audit::AuditEntry;
use crate::model::{PairKey, PlatformLink, SyncEvent, SyncOperation};
use crate::payload::PlatformListing;
use crate::store::{InMemorySyncStore, Resolution, StoreError, SyncStats, SyncStore};

pub fn draft(sku: &str) -> ListingDraft {
    ListingDraft {
        sku: sku.to_string(),
        title: "Fujifilm X100V silver".into(),
        brand: "Fujifilm".into(),
        model: "X100V".into(),
        category: "cameras/compact".into(),
        media: vec!["https://img.example/x100v-front.jpg".into()],
        price: Price::from_major(1200),
        quantity: 1,
    }
}

/// One call seen by a [`ScriptedAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCall {
    pub operation: SyncOperation,
    /// External id, or the draft sku for creates.
    pub target: String,
    pub price: Option<Price>,
    pub quantity: Option<u32>,
    pub started: tokio::time::Instant,
    pub finished: tokio::time::Instant,
}

#[derive(Default)]
struct Script {
    outcomes: HashMap<SyncOperation, VecDeque<AdapterOutcome>>,
    delays: HashMap<SyncOperation, Duration>,
    panics: HashSet<SyncOperation>,
    listings: BTreeMap<String, SnapshotEntry>,
    created: HashMap<SyncEventId, String>,
    next_id: usize,
    calls: Vec<AdapterCall>,
    snapshot_failure: Option<AdapterFailure>,
    snapshot_delay: Option<Duration>,
    truncated: bool,
}

/// In-process marketplace with programmable outcomes.
///
/// Unscripted calls behave like a well-behaved API: creates are confirmed
/// (idempotent on the key), edits of unknown ids fail with `NotFound`.
pub struct ScriptedAdapter {
    platform: Platform,
    kind: AdapterKind,
    script: Mutex<Script>,
    active: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            kind: AdapterKind::Api,
            script: Mutex::new(Script::default()),
            active: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn with_kind(mut self, kind: AdapterKind) -> Self {
        self.kind = kind;
        self
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queue outcomes returned, in order, by the next calls of `operation`.
    pub fn script_outcomes(&self, operation: SyncOperation, outcomes: impl IntoIterator<Item = AdapterOutcome>) {
        self.script()
            .outcomes
            .entry(operation)
            .or_default()
            .extend(outcomes);
    }

    pub fn fail_times(&self, operation: SyncOperation, times: usize, reason: FailureReason) {
        self.script_outcomes(
            operation,
            (0..times).map(|n| AdapterOutcome::failed(reason, format!("scripted failure {n}"))),
        );
    }

    pub fn delay(&self, operation: SyncOperation, delay: Duration) {
        self.script().delays.insert(operation, delay);
    }

    pub fn panic_on(&self, operation: SyncOperation) {
        self.script().panics.insert(operation);
    }

    /// Put a listing on the marketplace, replacing one with the same id.
    pub fn put_listing(&self, entry: SnapshotEntry) {
        self.script().listings.insert(entry.external_id.clone(), entry);
    }

    pub fn set_state(&self, external_id: &str, state: ListingState) {
        if let Some(entry) = self.script().listings.get_mut(external_id) {
            entry.state = state;
        }
    }

    pub fn remove_listing(&self, external_id: &str) {
        self.script().listings.remove(external_id);
    }

    pub fn listing(&self, external_id: &str) -> Option<SnapshotEntry> {
        self.script().listings.get(external_id).cloned()
    }

    pub fn fail_snapshot(&self, failure: AdapterFailure) {
        self.script().snapshot_failure = Some(failure);
    }

    /// Hand snapshots over `delay` after reading the listings.
    pub fn delay_snapshot(&self, delay: Duration) {
        self.script().snapshot_delay = Some(delay);
    }

    pub fn truncate_snapshots(&self) {
        self.script().truncated = true;
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.script().calls.clone()
    }

    pub fn call_count(&self, operation: SyncOperation) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Calls that started while another call on the same target was running.
    pub fn overlapping_calls(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    async fn run<F>(
        &self,
        operation: SyncOperation,
        target: String,
        price: Option<Price>,
        quantity: Option<u32>,
        default: F,
    ) -> AdapterOutcome
    where
        F: FnOnce(&mut Script) -> AdapterOutcome,
    {
        let started = tokio::time::Instant::now();
        if !self.active.lock().unwrap().insert(target.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let (delay, panics) = {
            let script = self.script();
            (
                script.delays.get(&operation).copied(),
                script.panics.contains(&operation),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut script = self.script();
            let scripted = script
                .outcomes
                .get_mut(&operation)
                .and_then(|queue| queue.pop_front());
            let outcome = match scripted {
                Some(outcome) => outcome,
                None => default(&mut *script),
            };
            script.calls.push(AdapterCall {
                operation,
                target: target.clone(),
                price,
                quantity,
                started,
                finished: tokio::time::Instant::now(),
            });
            outcome
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.active.lock().unwrap().remove(&target);
        if panics {
            panic!("scripted panic during {operation}");
        }
        outcome
    }

    fn edit(script: &mut Script, external_id: &str, f: impl FnOnce(&mut SnapshotEntry)) -> AdapterOutcome {
        match script.listings.get_mut(external_id) {
            Some(entry) => {
                f(entry);
                entry.observed_at = Utc::now();
                AdapterOutcome::confirmed(entry.external_id.clone(), entry.state)
            }
            None => AdapterOutcome::failed(FailureReason::NotFound, format!("no listing {external_id}")),
        }
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn create_listing(&self, draft: &ListingDraft, idempotency_key: SyncEventId) -> AdapterOutcome {
        let platform = self.platform;
        let listed = draft.clone();
        self.run(SyncOperation::Create, draft.sku.clone(), Some(draft.price), Some(draft.quantity), move |script| {
            if let Some(id) = script.created.get(&idempotency_key) {
                return AdapterOutcome::confirmed(id.clone(), ListingState::Active);
            }
            script.next_id += 1;
            let id = format!("{}-{}", platform.as_str(), script.next_id);
            script.created.insert(idempotency_key, id.clone());
            script.listings.insert(
                id.clone(),
                SnapshotEntry::new(id.clone(), ListingState::Active)
                    .with_price(listed.price)
                    .with_quantity(listed.quantity)
                    .with_identity(listed.brand, Some(listed.model), Some(listed.title)),
            );
            AdapterOutcome::confirmed(id, ListingState::Active)
        })
        .await
    }

    async fn update_price(&self, external_id: &str, price: Price) -> AdapterOutcome {
        let id = external_id.to_string();
        self.run(SyncOperation::UpdatePrice, id.clone(), Some(price), None, move |script| {
            Self::edit(script, &id, |e| e.price = Some(price))
        })
        .await
    }

    async fn update_stock(&self, external_id: &str, quantity: u32) -> AdapterOutcome {
        let id = external_id.to_string();
        self.run(SyncOperation::UpdateStock, id.clone(), None, Some(quantity), move |script| {
            Self::edit(script, &id, |e| e.quantity = Some(quantity))
        })
        .await
    }

    async fn update_status(&self, external_id: &str, change: StatusChange) -> AdapterOutcome {
        let id = external_id.to_string();
        let (operation, state) = match change {
            StatusChange::End => (SyncOperation::End, ListingState::Ended),
            StatusChange::Relist => (SyncOperation::Relist, ListingState::Active),
        };
        self.run(operation, id.clone(), None, None, move |script| {
            Self::edit(script, &id, |e| e.state = state)
        })
        .await
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, AdapterFailure> {
        let (snapshot, delay) = {
            let script = self.script();
            if let Some(failure) = &script.snapshot_failure {
                return Err(failure.clone());
            }
            let snapshot = Snapshot::new(self.platform, script.listings.values().cloned().collect());
            let snapshot = if script.truncated { snapshot.truncated() } else { snapshot };
            (snapshot, script.snapshot_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }
}

#[derive(Default)]
struct Marketplace {
    prefix: String,
    next_id: usize,
    listings: BTreeMap<String, RemoteListing>,
    keys: HashMap<String, String>,
    failures: VecDeque<ClientError>,
    page_size: usize,
}

/// In-memory marketplace API. Clones share state.
#[derive(Clone)]
pub struct FakeMarketplace {
    inner: Arc<Mutex<Marketplace>>,
}

impl FakeMarketplace {
    pub fn new(prefix: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Marketplace {
                prefix: prefix.to_string(),
                page_size: 50,
                ..Marketplace::default()
            })),
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        self.inner.lock().unwrap().page_size = page_size.max(1);
        self
    }

    pub fn seed(&self, listing: RemoteListing) {
        self.inner
            .lock()
            .unwrap()
            .listings
            .insert(listing.external_id.clone(), listing);
    }

    /// Fail the next request with `err`.
    pub fn fail_next(&self, err: ClientError) {
        self.inner.lock().unwrap().failures.push_back(err);
    }

    pub fn listing_count(&self) -> usize {
        self.inner.lock().unwrap().listings.len()
    }

    pub fn listing(&self, external_id: &str) -> Option<RemoteListing> {
        self.inner.lock().unwrap().listings.get(external_id).cloned()
    }

    fn with_listing(
        &self,
        external_id: &str,
        f: impl FnOnce(&mut RemoteListing),
    ) -> Result<RemoteListing, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        let listing = inner
            .listings
            .get_mut(external_id)
            .ok_or_else(|| ClientError::NotFound(external_id.to_string()))?;
        f(listing);
        Ok(listing.clone())
    }
}

#[async_trait]
impl MarketplaceClient for FakeMarketplace {
    async fn create(
        &self,
        listing: &PlatformListing,
        idempotency_key: &str,
    ) -> Result<RemoteListing, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        if let Some(id) = inner.keys.get(idempotency_key).cloned() {
            return inner
                .listings
                .get(&id)
                .cloned()
                .ok_or(ClientError::NotFound(id));
        }

        inner.next_id += 1;
        let id = format!("{}-{}", inner.prefix, inner.next_id);
        let mut remote = RemoteListing::new(id.clone(), ListingState::Active);
        remote.title = Some(listing.title().to_string());
        inner.keys.insert(idempotency_key.to_string(), id.clone());
        inner.listings.insert(id, remote.clone());
        Ok(remote)
    }

    async fn set_price(&self, external_id: &str, price: Price) -> Result<RemoteListing, ClientError> {
        self.with_listing(external_id, |l| l.price = Some(price))
    }

    async fn set_quantity(&self, external_id: &str, quantity: u32) -> Result<RemoteListing, ClientError> {
        self.with_listing(external_id, |l| l.quantity = Some(quantity))
    }

    async fn end(&self, external_id: &str) -> Result<RemoteListing, ClientError> {
        self.with_listing(external_id, |l| l.state = ListingState::Ended)
    }

    async fn relist(&self, external_id: &str) -> Result<RemoteListing, ClientError> {
        self.with_listing(external_id, |l| l.state = ListingState::Active)
    }

    async fn export_page(&self, cursor: Option<&str>) -> Result<ExportPage, ClientError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = start + inner.page_size;
        let listings: Vec<RemoteListing> = inner
            .listings
            .values()
            .skip(start)
            .take(inner.page_size)
            .cloned()
            .collect();
        Ok(ExportPage {
            listings,
            next_cursor: (end < inner.listings.len()).then(|| end.to_string()),
        })
    }
}

/// Blocking browser driver over an in-memory seller page.
pub struct FakeBrowserDriver {
    page: Mutex<BTreeMap<String, ScrapedListing>>,
    submissions: Mutex<Vec<PlatformListing>>,
    latency: Duration,
    sessions: AtomicUsize,
    max_sessions: AtomicUsize,
}

impl FakeBrowserDriver {
    pub fn new() -> Self {
        Self {
            page: Mutex::new(BTreeMap::new()),
            submissions: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            sessions: AtomicUsize::new(0),
            max_sessions: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn seed(&self, listing: ScrapedListing) {
        self.page
            .lock()
            .unwrap()
            .insert(listing.external_id.clone(), listing);
    }

    pub fn set_state(&self, external_id: &str, state: ListingState) {
        if let Some(listing) = self.page.lock().unwrap().get_mut(external_id) {
            listing.state = state;
        }
    }

    pub fn submissions(&self) -> Vec<PlatformListing> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    fn session<T>(&self, f: impl FnOnce() -> T) -> T {
        let open = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sessions.fetch_max(open, Ordering::SeqCst);
        std::thread::sleep(self.latency);
        let result = f();
        self.sessions.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn edit(
        &self,
        external_id: &str,
        f: impl FnOnce(&mut ScrapedListing),
    ) -> Result<ScrapedListing, DriverError> {
        self.session(|| {
            let mut page = self.page.lock().unwrap();
            let listing = page
                .get_mut(external_id)
                .ok_or_else(|| DriverError::ListingNotFound(external_id.to_string()))?;
            f(listing);
            Ok(listing.clone())
        })
    }
}

impl BrowserDriver for FakeBrowserDriver {
    fn submit_listing(&self, listing: &PlatformListing) -> Result<(), DriverError> {
        self.session(|| {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(listing.clone());
            // The marketplace assigns an id the form never shows.
            let external_id = format!("pm-{}", submissions.len());
            let (brand, price, quantity) = match listing {
                PlatformListing::Poshmark(l) => (Some(l.brand.clone()), Some(l.price), Some(l.quantity)),
                _ => (None, None, None),
            };
            self.page.lock().unwrap().insert(
                external_id.clone(),
                ScrapedListing {
                    external_id,
                    state: ListingState::Active,
                    title: listing.title().to_string(),
                    brand,
                    price,
                    quantity,
                },
            );
            Ok(())
        })
    }

    fn edit_price(&self, external_id: &str, price: Price) -> Result<ScrapedListing, DriverError> {
        self.edit(external_id, |l| l.price = Some(price))
    }

    fn edit_quantity(&self, external_id: &str, quantity: u32) -> Result<ScrapedListing, DriverError> {
        self.edit(external_id, |l| l.quantity = Some(quantity))
    }

    fn end_listing(&self, external_id: &str) -> Result<ScrapedListing, DriverError> {
        self.edit(external_id, |l| l.state = ListingState::Ended)
    }

    fn relist(&self, external_id: &str) -> Result<ScrapedListing, DriverError> {
        self.edit(external_id, |l| l.state = ListingState::Active)
    }

    fn scrape_listings(&self) -> Result<Vec<ScrapedListing>, DriverError> {
        self.session(|| Ok(self.page.lock().unwrap().values().cloned().collect()))
    }
}

/// In-memory store whose link reads can be made to fail.
pub struct FlakyStore {
    inner: InMemorySyncStore,
    failing_link_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemorySyncStore::new(),
            failing_link_reads: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` platform link reads.
    pub fn fail_link_reads(&self, times: usize) {
        self.failing_link_reads.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncStore for FlakyStore {
    async fn append_event(&self, event: SyncEvent) -> Result<SyncEvent, StoreError> {
        self.inner.append_event(event).await
    }

    async fn get_event(&self, id: SyncEventId) -> Result<Option<SyncEvent>, StoreError> {
        self.inner.get_event(id).await
    }

    async fn dispatch_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StoreError> {
        self.inner.dispatch_candidates(now, limit).await
    }

    async fn claim_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        self.inner.claim_event(id, lease_token, now).await
    }

    async fn resolve_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        self.inner.resolve_event(id, lease_token, resolution, now).await
    }

    async fn supersede_pending(
        &self,
        key: PairKey,
        before_seq: i64,
        by: SyncEventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEventId>, StoreError> {
        self.inner.supersede_pending(key, before_seq, by, now).await
    }

    async fn events_for_pair(&self, key: PairKey) -> Result<Vec<SyncEvent>, StoreError> {
        self.inner.events_for_pair(key).await
    }

    async fn events_for_product(&self, product_id: ProductId) -> Result<Vec<SyncEvent>, StoreError> {
        self.inner.events_for_product(product_id).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncEvent>, StoreError> {
        self.inner.dead_letters(limit).await
    }

    async fn get_link(&self, key: PairKey) -> Result<Option<PlatformLink>, StoreError> {
        self.inner.get_link(key).await
    }

    async fn links_for_product(&self, product_id: ProductId) -> Result<Vec<PlatformLink>, StoreError> {
        self.inner.links_for_product(product_id).await
    }

    async fn links_for_platform(&self, platform: Platform) -> Result<Vec<PlatformLink>, StoreError> {
        let failing = self
            .failing_link_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Storage("connection reset".into()));
        }
        self.inner.links_for_platform(platform).await
    }

    async fn put_link(&self, link: PlatformLink) -> Result<Option<PlatformLink>, StoreError> {
        self.inner.put_link(link).await
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.inner.append_audit(entry).await
    }

    async fn audit_for_product(&self, product_id: ProductId) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.audit_for_product(product_id).await
    }

    async fn stats(&self) -> Result<SyncStats, StoreError> {
        self.inner.stats().await
    }
}

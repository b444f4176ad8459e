//! End-to-end scenarios: catalog → propagator → dispatcher → adapters,
//! and marketplace snapshots → reconciler → catalog.
//!
//! Verifies:
//! - One in-flight event per pair under concurrent dispatchers
//! - Per-pair ordering and independent per-platform retries
//! - Sale detection, cross-platform ends and conflict resolution
//! - Browser listings linked by heuristic match

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;

    use forgelist_catalog::{
        CatalogService, CreateProduct, InMemoryCatalogStore, ProductCommand, ProductEvent,
        ProductStatus,
    };
    use forgelist_core::{Platform, Price, ProductId};
    use forgelist_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};

    use crate::adapter::{
        AdapterRegistry, BrowserAdapter, BrowserPool, FailureReason, ListingState,
        PlatformAdapter, SnapshotEntry,
    };
    use crate::audit::{AuditKind, LinkSource};
    use crate::catalog_port::CatalogPort;
    use crate::config::{DispatcherConfig, SyncConfig};
    use crate::dispatcher::Dispatcher;
    use crate::error::SyncError;
    use crate::guard::{InMemoryLeaseGuard, SharedGuard};
    use crate::links::{LinkUpdate, commit_link};
    use crate::model::{
        EventOrigin, LinkStatus, MatchKind, PairKey, SyncEvent, SyncEventStatus, SyncOperation,
        SyncPayload,
    };
    use crate::payload::CategoryMap;
    use crate::reconciler::ReconcileError;
    use crate::retry::RetryPolicy;
    use crate::service::SyncService;
    use crate::store::{InMemorySyncStore, SharedStore};
    use crate::testing::{FakeBrowserDriver, FlakyStore, ScriptedAdapter};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<ProductEvent>>>;
    type Catalog = CatalogService<Arc<InMemoryCatalogStore>, Bus>;

    struct Harness {
        catalog: Arc<Catalog>,
        store: SharedStore,
        service: SyncService,
        catalog_events: Subscription<EventEnvelope<ProductEvent>>,
    }

    fn config() -> SyncConfig {
        SyncConfig::default().with_dispatcher(
            DispatcherConfig::default()
                .with_name("test-dispatcher")
                .with_call_timeout(Duration::from_secs(2))
                .with_lease_ttl(Duration::from_secs(5))
                .with_retry(RetryPolicy::fixed(3, Duration::ZERO)),
        )
    }

    impl Harness {
        fn new(adapters: Vec<Arc<dyn PlatformAdapter>>) -> Self {
            Self::with_store(adapters, Arc::new(InMemorySyncStore::new()))
        }

        fn with_store(adapters: Vec<Arc<dyn PlatformAdapter>>, store: SharedStore) -> Self {
            let _ = forgelist_observability::init_for_tests();
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let catalog_events = bus.subscribe();
            let catalog = Arc::new(CatalogService::new(Arc::new(InMemoryCatalogStore::new()), bus));
            let guard: SharedGuard = Arc::new(InMemoryLeaseGuard::new());

            let config = config();
            let mut registry = AdapterRegistry::new(config.api_concurrency);
            for adapter in adapters {
                registry.register(adapter);
            }
            let port: Arc<dyn CatalogPort> = catalog.clone();
            let service = SyncService::new(Arc::clone(&store), guard, Arc::new(registry), port, config);

            Self {
                catalog,
                store,
                service,
                catalog_events,
            }
        }

        fn scripted(platforms: &[Platform]) -> (Self, HashMap<Platform, Arc<ScriptedAdapter>>) {
            Self::scripted_on(platforms, Arc::new(InMemorySyncStore::new()))
        }

        fn scripted_on(
            platforms: &[Platform],
            store: SharedStore,
        ) -> (Self, HashMap<Platform, Arc<ScriptedAdapter>>) {
            let scripted: HashMap<Platform, Arc<ScriptedAdapter>> = platforms
                .iter()
                .map(|p| (*p, Arc::new(ScriptedAdapter::new(*p))))
                .collect();
            let adapters = scripted
                .values()
                .map(|a| Arc::clone(a) as Arc<dyn PlatformAdapter>)
                .collect();
            (Self::with_store(adapters, store), scripted)
        }

        fn create_product(&self, price: u64, stock: u32) -> ProductId {
            let product_id = ProductId::new();
            self.command(
                product_id,
                ProductCommand::CreateProduct(CreateProduct {
                    product_id,
                    sku: format!("CAM-{}", &product_id.to_string()[..8]),
                    title: "Fujifilm X100V silver".into(),
                    brand: "Fujifilm".into(),
                    model: "X100V".into(),
                    category: "cameras/compact".into(),
                    media: vec!["https://img.example/x100v-front.jpg".into()],
                    price: Price::from_major(price),
                    stock,
                    occurred_at: Utc::now(),
                }),
            );
            self.command(
                product_id,
                ProductCommand::ActivateProduct {
                    occurred_at: Utc::now(),
                },
            );
            product_id
        }

        fn command(&self, product_id: ProductId, command: ProductCommand) {
            self.catalog.execute(product_id, command).unwrap();
        }

        async fn list_on(&self, product_id: ProductId, platforms: &[Platform]) {
            for platform in platforms {
                self.command(
                    product_id,
                    ProductCommand::RequestListing {
                        platform: *platform,
                        occurred_at: Utc::now(),
                    },
                );
            }
            self.pump().await;
        }

        /// Forward catalog events, then drain the dispatcher until idle.
        async fn pump(&self) {
            self.forward().await;
            self.drain().await;
        }

        /// Turn pending catalog events into sync events without dispatching them.
        async fn forward(&self) {
            while let Ok(envelope) = self.catalog_events.try_recv() {
                self.service.propagator().handle(&envelope).await.unwrap();
            }
        }

        async fn drain(&self) {
            for _ in 0..50 {
                if self.service.dispatcher().run_once().await.unwrap() == 0 {
                    return;
                }
            }
            panic!("dispatcher did not go idle");
        }

        async fn link(&self, product_id: ProductId, platform: Platform) -> crate::model::PlatformLink {
            self.store
                .get_link(PairKey::new(product_id, platform))
                .await
                .unwrap()
                .expect("link exists")
        }

        async fn external_id(&self, product_id: ProductId, platform: Platform) -> String {
            self.link(product_id, platform)
                .await
                .external_id
                .expect("external id known")
        }

        async fn events(&self, product_id: ProductId, operation: SyncOperation) -> Vec<SyncEvent> {
            self.store
                .events_for_product(product_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|e| e.operation == operation)
                .collect()
        }

        fn status(&self, product_id: ProductId) -> (ProductStatus, Option<Platform>) {
            let product = self.catalog.get(product_id).unwrap().unwrap();
            (product.status(), product.sold_on())
        }
    }

    #[tokio::test]
    async fn requested_listings_become_active_links() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(1200, 1);

        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;

        for platform in [Platform::Ebay, Platform::Etsy] {
            let link = h.link(product_id, platform).await;
            assert_eq!(link.confirmed_status, LinkStatus::Active);
            assert_eq!(link.match_kind, MatchKind::Exact);
            assert_eq!(adapters[&platform].call_count(SyncOperation::Create), 1);
        }
        let creates = h.events(product_id, SyncOperation::Create).await;
        assert!(creates.iter().all(|e| e.status == SyncEventStatus::Success));
    }

    #[tokio::test]
    async fn repeated_create_does_not_list_twice() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay]).await;
        let first_id = h.external_id(product_id, Platform::Ebay).await;

        let draft = h.catalog.get(product_id).unwrap().unwrap().listing_draft();
        let again = h
            .service
            .enqueue_sync_event(
                product_id,
                Platform::Ebay,
                SyncOperation::Create,
                SyncPayload::Create { draft },
            )
            .await
            .unwrap();
        h.drain().await;

        let again = h.store.get_event(again.id).await.unwrap().unwrap();
        assert_eq!(again.status, SyncEventStatus::Success);
        assert_eq!(adapters[&Platform::Ebay].call_count(SyncOperation::Create), 1);
        assert_eq!(h.external_id(product_id, Platform::Ebay).await, first_id);
    }

    #[tokio::test]
    async fn mismatched_operation_is_rejected_on_enqueue() {
        let (h, _) = Harness::scripted(&[Platform::Ebay]);
        let err = h
            .service
            .enqueue_sync_event(
                ProductId::new(),
                Platform::Ebay,
                SyncOperation::UpdateStock,
                SyncPayload::UpdatePrice {
                    price: Price::from_major(10),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Domain(_)));
    }

    #[tokio::test]
    async fn sale_on_one_platform_ends_the_other_two() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy, Platform::Shopify]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy, Platform::Shopify])
            .await;

        let sold_id = h.external_id(product_id, Platform::Ebay).await;
        adapters[&Platform::Ebay].set_state(&sold_id, ListingState::Sold);
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();

        assert_eq!(report.sales, 1);
        assert_eq!(report.corrective_events.len(), 2);
        assert_eq!(h.status(product_id), (ProductStatus::Sold, Some(Platform::Ebay)));

        h.pump().await;

        let ends = h.events(product_id, SyncOperation::End).await;
        assert_eq!(ends.len(), 2);
        assert!(ends.iter().all(|e| e.origin == EventOrigin::Reconciler));
        assert!(ends.iter().all(|e| e.status == SyncEventStatus::Success));
        assert_eq!(h.link(product_id, Platform::Ebay).await.confirmed_status, LinkStatus::Sold);
        for platform in [Platform::Etsy, Platform::Shopify] {
            assert_eq!(h.link(product_id, platform).await.confirmed_status, LinkStatus::Ended);
            assert_eq!(adapters[&platform].call_count(SyncOperation::End), 1);
        }

        // A second pass sees nothing new.
        let again = h.service.force_reconcile(Platform::Ebay).await.unwrap();
        assert_eq!(again.sales, 0);
        assert!(again.corrective_events.is_empty());
    }

    #[tokio::test]
    async fn price_effect_lands_before_the_later_stock_effect() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay]).await;
        let adapter = &adapters[&Platform::Ebay];
        adapter.delay(SyncOperation::UpdatePrice, Duration::from_millis(50));

        h.command(
            product_id,
            ProductCommand::ChangePrice {
                price: Price::from_major(1100),
                occurred_at: Utc::now(),
            },
        );
        h.command(
            product_id,
            ProductCommand::AdjustStock {
                delta: 2,
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;

        let calls = adapter.calls();
        let price = calls
            .iter()
            .find(|c| c.operation == SyncOperation::UpdatePrice)
            .unwrap();
        let stock = calls
            .iter()
            .find(|c| c.operation == SyncOperation::UpdateStock)
            .unwrap();
        assert!(price.finished <= stock.started);
        assert_eq!(stock.quantity, Some(3));

        let listing = adapter.listing(&h.external_id(product_id, Platform::Ebay).await).unwrap();
        assert_eq!(listing.price, Some(Price::from_major(1100)));
        assert_eq!(listing.quantity, Some(3));
    }

    #[tokio::test]
    async fn transient_failures_retry_up_to_max_attempts() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay]).await;
        let adapter = &adapters[&Platform::Ebay];
        adapter.fail_times(SyncOperation::UpdatePrice, 10, FailureReason::Network);

        h.command(
            product_id,
            ProductCommand::ChangePrice {
                price: Price::from_major(1000),
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;

        assert_eq!(adapter.call_count(SyncOperation::UpdatePrice), 3);
        let event = h.events(product_id, SyncOperation::UpdatePrice).await.remove(0);
        assert_eq!(event.status, SyncEventStatus::DeadLetter);
        assert_eq!(event.attempt_count, 3);
        assert!(event.last_error.unwrap().contains("network"));
        assert_eq!(h.service.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_on_first_attempt() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay]).await;
        let adapter = &adapters[&Platform::Ebay];
        adapter.fail_times(SyncOperation::UpdateStock, 1, FailureReason::Validation);

        h.command(
            product_id,
            ProductCommand::AdjustStock {
                delta: 1,
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;

        assert_eq!(adapter.call_count(SyncOperation::UpdateStock), 1);
        let event = h.events(product_id, SyncOperation::UpdateStock).await.remove(0);
        assert_eq!(event.status, SyncEventStatus::DeadLetter);
        assert_eq!(event.attempt_count, 1);
    }

    #[tokio::test]
    async fn price_change_on_two_platforms_retries_independently() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(100, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;
        adapters[&Platform::Ebay].fail_times(SyncOperation::UpdatePrice, 1, FailureReason::Unauthorized);

        h.command(
            product_id,
            ProductCommand::ChangePrice {
                price: Price::from_major(90),
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;

        let events = h.events(product_id, SyncOperation::UpdatePrice).await;
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
        let ebay = events.iter().find(|e| e.platform == Platform::Ebay).unwrap();
        let etsy = events.iter().find(|e| e.platform == Platform::Etsy).unwrap();
        assert_eq!(ebay.status, SyncEventStatus::DeadLetter);
        assert_eq!(etsy.status, SyncEventStatus::Success);

        let retry = h.service.retry_dead_letter(ebay.id).await.unwrap();
        assert_eq!(retry.retry_of, Some(ebay.id));
        assert_eq!(retry.origin, EventOrigin::Operator);
        h.drain().await;

        let retry = h.store.get_event(retry.id).await.unwrap().unwrap();
        assert_eq!(retry.status, SyncEventStatus::Success);
        assert_eq!(adapters[&Platform::Etsy].call_count(SyncOperation::UpdatePrice), 1);
        let original = h.store.get_event(ebay.id).await.unwrap().unwrap();
        assert_eq!(original.status, SyncEventStatus::DeadLetter);

        let err = h.service.retry_dead_letter(etsy.id).await.unwrap_err();
        assert!(matches!(err, SyncError::NotDeadLettered { .. }));
    }

    #[tokio::test]
    async fn browser_listing_is_linked_by_heuristic_match() {
        let driver = FakeBrowserDriver::new();
        let browser = Arc::new(BrowserAdapter::new(
            Platform::Poshmark,
            driver,
            BrowserPool::new(1),
            CategoryMap::new().with("cameras", "Electronics/Cameras"),
        ));
        let h = Harness::new(vec![Arc::clone(&browser) as Arc<dyn PlatformAdapter>]);
        let product_id = h.create_product(1200, 1);

        h.list_on(product_id, &[Platform::Poshmark]).await;

        let link = h.link(product_id, Platform::Poshmark).await;
        assert_eq!(link.confirmed_status, LinkStatus::PendingConfirmation);
        assert_eq!(link.external_id, None);
        let create = h.events(product_id, SyncOperation::Create).await.remove(0);
        assert_eq!(create.status, SyncEventStatus::Partial);

        let report = h.service.force_reconcile(Platform::Poshmark).await.unwrap();
        assert_eq!(report.heuristic_matches, 1);

        let link = h.link(product_id, Platform::Poshmark).await;
        assert_eq!(link.confirmed_status, LinkStatus::Active);
        assert_eq!(link.external_id.as_deref(), Some("pm-1"));
        assert_eq!(link.match_kind, MatchKind::Heuristic);

        let audit = h.service.audit_log(product_id).await.unwrap();
        assert!(audit.iter().any(|a| matches!(
            &a.kind,
            AuditKind::HeuristicMatch { external_id, .. } if external_id == "pm-1"
        )));
        assert!(audit.iter().any(|a| matches!(
            &a.kind,
            AuditKind::LinkTransition {
                to: LinkStatus::Active,
                match_kind: MatchKind::Heuristic,
                source: LinkSource::Reconciler,
                ..
            }
        )));

        // A scraped sale on a heuristic link is not trusted on its own.
        browser.driver().set_state("pm-1", ListingState::Sold);
        let report = h.service.force_reconcile(Platform::Poshmark).await.unwrap();
        assert_eq!(report.suppressed, 1);
        assert_eq!(h.status(product_id).0, ProductStatus::Active);

        // A pushed notification confirms it.
        h.service
            .observe(Platform::Poshmark, SnapshotEntry::new("pm-1", ListingState::Sold))
            .unwrap();
        let report = h.service.force_reconcile(Platform::Poshmark).await.unwrap();
        assert_eq!(report.sales, 1);
        assert_eq!(h.status(product_id), (ProductStatus::Sold, Some(Platform::Poshmark)));
        let link = h.link(product_id, Platform::Poshmark).await;
        assert_eq!(link.confirmed_status, LinkStatus::Sold);
        assert_eq!(link.match_kind, MatchKind::Exact);
    }

    #[tokio::test]
    async fn operator_confirmation_makes_a_link_exact() {
        let (h, _) = Harness::scripted(&[Platform::Etsy]);
        let product_id = h.create_product(1200, 1);

        let link = h
            .service
            .confirm_link(product_id, Platform::Etsy, "ET-77")
            .await
            .unwrap();

        assert_eq!(link.external_id.as_deref(), Some("ET-77"));
        assert_eq!(link.match_kind, MatchKind::Exact);
        assert_eq!(link.confirmed_status, LinkStatus::PendingConfirmation);
        let audit = h.service.audit_log(product_id).await.unwrap();
        assert!(audit.iter().any(|a| matches!(
            a.kind,
            AuditKind::LinkTransition {
                source: LinkSource::Operator,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn later_sale_on_a_higher_priority_platform_takes_the_attribution() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;

        let etsy_id = h.external_id(product_id, Platform::Etsy).await;
        adapters[&Platform::Etsy].set_state(&etsy_id, ListingState::Sold);
        h.service.force_reconcile(Platform::Etsy).await.unwrap();
        assert_eq!(h.status(product_id), (ProductStatus::Sold, Some(Platform::Etsy)));

        let ebay_id = h.external_id(product_id, Platform::Ebay).await;
        adapters[&Platform::Ebay].set_state(&ebay_id, ListingState::Sold);
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(h.status(product_id), (ProductStatus::Sold, Some(Platform::Ebay)));
        let audit = h.service.audit_log(product_id).await.unwrap();
        assert!(audit.iter().any(|a| matches!(
            a.kind,
            AuditKind::DriftConflict {
                reported_by: Platform::Ebay,
                existing: Some(Platform::Etsy),
                winner: Some(Platform::Ebay),
            }
        )));

        // The queued end for the eBay listing finds it already sold.
        h.pump().await;
        assert_eq!(adapters[&Platform::Ebay].call_count(SyncOperation::End), 0);
        assert_eq!(h.link(product_id, Platform::Ebay).await.confirmed_status, LinkStatus::Sold);
    }

    #[tokio::test]
    async fn offline_sale_conflict_is_audited_without_a_winner() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;
        let etsy_id = h.external_id(product_id, Platform::Etsy).await;

        // Sold in the shop; the Etsy buyer checks out before the end lands.
        h.command(
            product_id,
            ProductCommand::MarkSold {
                sold_on: None,
                occurred_at: Utc::now(),
            },
        );
        adapters[&Platform::Etsy].set_state(&etsy_id, ListingState::Sold);
        let report = h.service.force_reconcile(Platform::Etsy).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(h.status(product_id), (ProductStatus::Sold, None));
        let audit = h.service.audit_log(product_id).await.unwrap();
        assert!(audit.iter().any(|a| matches!(
            a.kind,
            AuditKind::DriftConflict {
                existing: None,
                winner: None,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn vanished_listing_is_removed_unless_a_higher_priority_sale_explains_it() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let first = h.create_product(1200, 1);
        let second = h.create_product(800, 1);
        h.list_on(first, &[Platform::Ebay, Platform::Etsy]).await;
        h.list_on(second, &[Platform::Ebay, Platform::Etsy]).await;

        // `first`: gone from Etsy with no explanation.
        adapters[&Platform::Etsy].remove_listing(&h.external_id(first, Platform::Etsy).await);
        // `second`: sold on eBay, and Etsy pulled its listing before our end ran.
        adapters[&Platform::Ebay].set_state(&h.external_id(second, Platform::Ebay).await, ListingState::Sold);
        h.service.force_reconcile(Platform::Ebay).await.unwrap();
        adapters[&Platform::Etsy].remove_listing(&h.external_id(second, Platform::Etsy).await);

        let report = h.service.force_reconcile(Platform::Etsy).await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.ended_by_sale, 1);
        assert_eq!(h.link(first, Platform::Etsy).await.confirmed_status, LinkStatus::Removed);
        assert_eq!(h.link(second, Platform::Etsy).await.confirmed_status, LinkStatus::Ended);
    }

    #[tokio::test]
    async fn truncated_snapshot_proves_nothing_about_absence() {
        let (h, adapters) = Harness::scripted(&[Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Etsy]).await;
        let adapter = &adapters[&Platform::Etsy];
        adapter.remove_listing(&h.external_id(product_id, Platform::Etsy).await);
        adapter.truncate_snapshots();

        let report = h.service.force_reconcile(Platform::Etsy).await.unwrap();

        assert!(!report.complete_snapshot);
        assert_eq!(report.removed, 0);
        assert_eq!(h.link(product_id, Platform::Etsy).await.confirmed_status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn drifted_price_and_stock_are_corrected() {
        let (h, adapters) = Harness::scripted(&[Platform::Shopify]);
        let product_id = h.create_product(1200, 2);
        h.list_on(product_id, &[Platform::Shopify]).await;
        let adapter = &adapters[&Platform::Shopify];
        let external_id = h.external_id(product_id, Platform::Shopify).await;

        let edited = adapter
            .listing(&external_id)
            .unwrap()
            .with_price(Price::from_major(999))
            .with_quantity(7);
        adapter.put_listing(edited);

        let report = h.service.force_reconcile(Platform::Shopify).await.unwrap();
        assert_eq!(report.corrective_events.len(), 2);
        h.drain().await;

        let listing = adapter.listing(&external_id).unwrap();
        assert_eq!(listing.price, Some(Price::from_major(1200)));
        assert_eq!(listing.quantity, Some(2));
        let report = h.service.force_reconcile(Platform::Shopify).await.unwrap();
        assert!(report.corrective_events.is_empty());
    }

    #[tokio::test]
    async fn live_listing_of_an_ended_product_gets_ended() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay]).await;
        let external_id = h.external_id(product_id, Platform::Ebay).await;

        h.command(
            product_id,
            ProductCommand::EndProduct {
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;
        assert_eq!(h.link(product_id, Platform::Ebay).await.confirmed_status, LinkStatus::Ended);

        // Someone relists it by hand on the marketplace.
        adapters[&Platform::Ebay].set_state(&external_id, ListingState::Active);
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();
        assert_eq!(report.corrective_events.len(), 1);
        h.drain().await;

        assert_eq!(adapters[&Platform::Ebay].listing(&external_id).unwrap().state, ListingState::Ended);
        assert_eq!(h.status(product_id).0, ProductStatus::Ended);
    }

    #[tokio::test]
    async fn relisted_product_goes_live_again() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;
        h.command(product_id, ProductCommand::EndProduct { occurred_at: Utc::now() });
        h.pump().await;

        h.command(product_id, ProductCommand::RelistProduct { occurred_at: Utc::now() });
        h.pump().await;

        for platform in [Platform::Ebay, Platform::Etsy] {
            assert_eq!(h.link(product_id, platform).await.confirmed_status, LinkStatus::Active);
            assert_eq!(adapters[&platform].call_count(SyncOperation::Relist), 1);
        }
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();
        assert_eq!(report.sales, 0);
    }

    #[tokio::test]
    async fn snapshot_failure_changes_nothing() {
        let (h, adapters) = Harness::scripted(&[Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Etsy]).await;
        adapters[&Platform::Etsy].fail_snapshot(crate::adapter::AdapterFailure::new(
            FailureReason::Unauthorized,
            "token expired",
        ));

        let err = h.service.force_reconcile(Platform::Etsy).await.unwrap_err();

        assert!(matches!(err, SyncError::Reconcile(ReconcileError::Snapshot { .. })));
        assert_eq!(h.link(product_id, Platform::Etsy).await.confirmed_status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn link_confirmed_while_a_snapshot_is_in_transit_is_not_removed() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let adapter = &adapters[&Platform::Ebay];
        let product_id = h.create_product(1200, 1);
        h.command(
            product_id,
            ProductCommand::RequestListing {
                platform: Platform::Ebay,
                occurred_at: Utc::now(),
            },
        );
        h.forward().await;
        // The export is read before the listing exists and delivered after it does.
        adapter.delay_snapshot(Duration::from_millis(150));

        let (report, dispatched) = tokio::join!(h.service.force_reconcile(Platform::Ebay), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.service.dispatcher().run_once().await
        });
        let report = report.unwrap();

        assert_eq!(dispatched.unwrap(), 1);
        assert_eq!(report.removed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.link(product_id, Platform::Ebay).await.confirmed_status, LinkStatus::Active);
        assert_eq!(h.events(product_id, SyncOperation::Create).await.len(), 1);

        // The next pass sees the listing and confirms it as usual.
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();
        assert_eq!(report.deferred, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(report.links_checked, 1);
        assert_eq!(h.link(product_id, Platform::Ebay).await.confirmed_status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn observations_survive_an_aborted_pass() {
        let browser = Arc::new(BrowserAdapter::new(
            Platform::Poshmark,
            FakeBrowserDriver::new(),
            BrowserPool::new(1),
            CategoryMap::new().with("cameras", "Electronics/Cameras"),
        ));
        let store = Arc::new(FlakyStore::new());
        let h = Harness::with_store(vec![Arc::clone(&browser) as Arc<dyn PlatformAdapter>], store.clone());
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Poshmark]).await;
        h.service.force_reconcile(Platform::Poshmark).await.unwrap();
        assert_eq!(h.link(product_id, Platform::Poshmark).await.match_kind, MatchKind::Heuristic);

        // Only the pushed notification makes the scraped sale trustworthy.
        browser.driver().set_state("pm-1", ListingState::Sold);
        h.service
            .observe(Platform::Poshmark, SnapshotEntry::new("pm-1", ListingState::Sold))
            .unwrap();
        store.fail_link_reads(1);
        let err = h.service.force_reconcile(Platform::Poshmark).await.unwrap_err();
        assert!(matches!(err, SyncError::Reconcile(ReconcileError::Store(_))));
        assert_eq!(h.status(product_id).0, ProductStatus::Active);

        let report = h.service.force_reconcile(Platform::Poshmark).await.unwrap();
        assert_eq!(report.suppressed, 0);
        assert_eq!(report.sales, 1);
        assert_eq!(h.status(product_id), (ProductStatus::Sold, Some(Platform::Poshmark)));
    }

    #[tokio::test]
    async fn observations_for_platforms_without_an_adapter_are_refused() {
        let (h, _) = Harness::scripted(&[Platform::Ebay]);

        let err = h
            .service
            .observe(Platform::Shopify, SnapshotEntry::new("sh-1", ListingState::Sold))
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::Reconcile(ReconcileError::NoAdapter(Platform::Shopify))
        ));
        let report = h.service.force_reconcile(Platform::Ebay).await.unwrap();
        assert_eq!(report.entries, 0);
    }

    #[tokio::test]
    async fn status_summary_groups_open_events_per_platform() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay, Platform::Etsy]);
        let product_id = h.create_product(1200, 1);
        h.list_on(product_id, &[Platform::Ebay, Platform::Etsy]).await;
        adapters[&Platform::Etsy].fail_times(SyncOperation::UpdatePrice, 1, FailureReason::NotFound);
        h.command(
            product_id,
            ProductCommand::ChangePrice {
                price: Price::from_major(1150),
                occurred_at: Utc::now(),
            },
        );
        h.pump().await;
        h.command(
            product_id,
            ProductCommand::AdjustStock {
                delta: 1,
                occurred_at: Utc::now(),
            },
        );
        while let Ok(envelope) = h.catalog_events.try_recv() {
            h.service.propagator().handle(&envelope).await.unwrap();
        }

        let summary = h.service.get_sync_status(product_id).await.unwrap();

        let ebay = summary.platform(Platform::Ebay).unwrap();
        assert_eq!(ebay.pending.len(), 1);
        assert!(ebay.dead_lettered.is_empty());
        let etsy = summary.platform(Platform::Etsy).unwrap();
        assert_eq!(etsy.dead_lettered.len(), 1);
        assert_eq!(etsy.pending.len(), 1);
        assert_eq!(
            etsy.link.as_ref().map(|l| l.confirmed_status),
            Some(LinkStatus::Active)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn started_engine_syncs_in_the_background() {
        let (h, adapters) = Harness::scripted(&[Platform::Ebay]);
        let product_id = h.create_product(1200, 1);
        let Harness {
            catalog,
            service,
            catalog_events,
            ..
        } = h;

        let runtime = service.start(Some(catalog_events));
        catalog
            .execute(
                product_id,
                ProductCommand::RequestListing {
                    platform: Platform::Ebay,
                    occurred_at: Utc::now(),
                },
            )
            .unwrap();

        let mut linked = false;
        for _ in 0..100 {
            let status = service.get_sync_status(product_id).await.unwrap();
            if status
                .platform(Platform::Ebay)
                .and_then(|p| p.link.as_ref())
                .is_some_and(|l| l.confirmed_status == LinkStatus::Active)
            {
                linked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        runtime.shutdown().await;

        assert!(linked);
        assert_eq!(adapters[&Platform::Ebay].call_count(SyncOperation::Create), 1);
    }

    fn arb_ops() -> impl Strategy<Value = Vec<(usize, bool)>> {
        prop::collection::vec((0usize..3, any::<bool>()), 1..24)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn concurrent_dispatchers_keep_one_in_flight_event_per_pair(ops in arb_ops()) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let store: SharedStore = Arc::new(InMemorySyncStore::new());
                let guard: SharedGuard = Arc::new(InMemoryLeaseGuard::new());
                let adapter = Arc::new(ScriptedAdapter::new(Platform::Ebay));
                adapter.delay(SyncOperation::UpdatePrice, Duration::from_millis(2));
                adapter.delay(SyncOperation::UpdateStock, Duration::from_millis(1));
                let registry = Arc::new(
                    AdapterRegistry::new(16).with(Arc::clone(&adapter) as Arc<dyn PlatformAdapter>),
                );

                let products: Vec<ProductId> = (0..3).map(|_| ProductId::new()).collect();
                for (n, product_id) in products.iter().enumerate() {
                    let external_id = format!("EB-{n}");
                    adapter.put_listing(SnapshotEntry::new(external_id.clone(), ListingState::Active));
                    let update = LinkUpdate::new(LinkStatus::Active, MatchKind::Exact, LinkSource::Operator)
                        .external_id(external_id);
                    commit_link(store.as_ref(), PairKey::new(*product_id, Platform::Ebay), None, update)
                        .await
                        .unwrap();
                }

                let mut expected: HashMap<String, Vec<(Option<Price>, Option<u32>)>> = HashMap::new();
                for (n, (pair, is_price)) in ops.iter().enumerate() {
                    let payload = if *is_price {
                        SyncPayload::UpdatePrice { price: Price::from_major(n as u64 + 1) }
                    } else {
                        SyncPayload::UpdateStock { quantity: n as u32 }
                    };
                    let effect = match &payload {
                        SyncPayload::UpdatePrice { price } => (Some(*price), None),
                        SyncPayload::UpdateStock { quantity } => (None, Some(*quantity)),
                        _ => unreachable!(),
                    };
                    expected.entry(format!("EB-{pair}")).or_default().push(effect);
                    store
                        .append_event(SyncEvent::new(products[*pair], Platform::Ebay, payload, EventOrigin::Canonical))
                        .await
                        .unwrap();
                }

                let dispatchers: Vec<Arc<Dispatcher>> = (0..3)
                    .map(|n| {
                        Arc::new(Dispatcher::new(
                            Arc::clone(&store),
                            Arc::clone(&guard),
                            Arc::clone(&registry),
                            DispatcherConfig::default().with_name(format!("d{n}")).with_max_workers(2),
                        ))
                    })
                    .collect();

                for _ in 0..200 {
                    let passes = dispatchers.iter().map(|d| {
                        let d = Arc::clone(d);
                        tokio::spawn(async move { d.run_once().await.unwrap() })
                    });
                    futures::future::join_all(passes).await;
                    if store.stats().await.unwrap().pending == 0 {
                        break;
                    }
                }

                let stats = store.stats().await.unwrap();
                assert_eq!(stats.pending + stats.in_flight, 0);
                assert_eq!(stats.success, ops.len());
                assert_eq!(adapter.overlapping_calls(), 0);

                let mut observed: HashMap<String, Vec<(Option<Price>, Option<u32>)>> = HashMap::new();
                for call in adapter.calls() {
                    observed.entry(call.target).or_default().push((call.price, call.quantity));
                }
                assert_eq!(observed, expected);
            });
        }
    }
}

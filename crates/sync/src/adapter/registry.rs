//! Platform → adapter lookup and the shared API concurrency ceiling.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use forgelist_core::Platform;

use super::{AdapterKind, PlatformAdapter, SessionReservation};

/// Capacity for one adapter call, taken before the call is timed.
#[derive(Debug, Default)]
pub struct CallSlot {
    api: Option<OwnedSemaphorePermit>,
    session: Option<SessionReservation>,
}

impl CallSlot {
    /// Run one adapter call inside the reserved capacity.
    pub async fn run<F: Future>(self, call: F) -> F::Output {
        let _api = self.api;
        match self.session {
            Some(session) => session.scope(call).await,
            None => call.await,
        }
    }
}

pub struct AdapterRegistry {
    adapters: BTreeMap<Platform, Arc<dyn PlatformAdapter>>,
    api_permits: Arc<Semaphore>,
}

impl AdapterRegistry {
    /// `api_concurrency` bounds simultaneous calls across all API adapters.
    pub fn new(api_concurrency: usize) -> Self {
        Self {
            adapters: BTreeMap::new(),
            api_permits: Arc::new(Semaphore::new(api_concurrency.max(1))),
        }
    }

    /// Register an adapter, replacing any previous one for its platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.insert(adapter.platform(), adapter)
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.keys().copied().collect()
    }

    /// Reserve capacity for one call on `adapter` without waiting. `None`
    /// means the adapter is saturated and the call should wait for a later
    /// pass instead of holding a worker.
    pub fn reserve(&self, adapter: &dyn PlatformAdapter) -> Option<CallSlot> {
        match adapter.kind() {
            AdapterKind::Api => {
                let permit = self.api_permits.clone().try_acquire_owned().ok()?;
                Some(CallSlot {
                    api: Some(permit),
                    session: None,
                })
            }
            AdapterKind::Browser => adapter.reserve_session().map(|session| CallSlot {
                api: None,
                session: Some(session),
            }),
        }
    }
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .field("api_permits", &self.api_permits.available_permits())
            .finish()
    }
}

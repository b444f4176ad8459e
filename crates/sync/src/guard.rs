//! Per-pair lease locks.
//!
//! A lease gives one dispatcher worker exclusive use of a (product, platform)
//! pair until it is released or expires. Expiry is what lets a crashed
//! worker's in-flight event be picked up again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::PairKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: PairKey,
    /// Fencing token; installed on the claimed event.
    pub token: Uuid,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("lease ttl out of range: {0:?}")]
    InvalidTtl(Duration),
    #[error("lease storage error: {0}")]
    Storage(String),
}

/// `now + ttl`, for lease tables that stamp expiry themselves.
pub fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, GuardError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(GuardError::InvalidTtl(ttl))
}

#[async_trait]
pub trait LeaseGuard: Send + Sync {
    /// Take the pair's lease if it is free or expired.
    async fn try_acquire(
        &self,
        key: PairKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, GuardError>;

    /// Extend a lease still held under the same token.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, GuardError>;

    /// Give the lease up. Returns false if it had already been taken over.
    async fn release(&self, lease: &Lease) -> Result<bool, GuardError>;

    async fn is_held(&self, key: PairKey) -> Result<bool, GuardError>;
}

pub type SharedGuard = Arc<dyn LeaseGuard>;

/// Process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryLeaseGuard {
    leases: Mutex<HashMap<PairKey, Lease>>,
}

impl InMemoryLeaseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PairKey, Lease>>, GuardError> {
        self.leases
            .lock()
            .map_err(|_| GuardError::Storage("lease table lock poisoned".into()))
    }
}

#[async_trait]
impl LeaseGuard for InMemoryLeaseGuard {
    async fn try_acquire(
        &self,
        key: PairKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, GuardError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;
        let mut leases = self.lock()?;
        if leases.get(&key).is_some_and(|held| !held.is_expired(now)) {
            return Ok(None);
        }
        let lease = Lease {
            key,
            token: Uuid::now_v7(),
            holder: holder.to_string(),
            expires_at,
        };
        leases.insert(key, lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, GuardError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;
        let mut leases = self.lock()?;
        match leases.get_mut(&lease.key) {
            Some(held) if held.token == lease.token && !held.is_expired(now) => {
                held.expires_at = expires_at;
                Ok(Some(held.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool, GuardError> {
        let mut leases = self.lock()?;
        if leases.get(&lease.key).is_some_and(|held| held.token == lease.token) {
            leases.remove(&lease.key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn is_held(&self, key: PairKey) -> Result<bool, GuardError> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .get(&key)
            .is_some_and(|held| !held.is_expired(now)))
    }
}

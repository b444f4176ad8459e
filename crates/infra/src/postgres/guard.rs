//! Postgres-backed [`LeaseGuard`] over `sync_leases`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use forgelist_sync::{GuardError, Lease, LeaseGuard, PairKey, lease_expiry};

use super::describe;

fn guard_error(operation: &str) -> impl FnOnce(sqlx::Error) -> GuardError + '_ {
    move |err| GuardError::Storage(describe(operation, &err))
}

/// Pair leases shared by every dispatcher process on the database.
///
/// Acquisition is a single upsert that only overwrites an expired row, so the
/// database decides which of two racing workers gets the pair.
#[derive(Debug, Clone)]
pub struct PostgresLeaseGuard {
    pool: Arc<PgPool>,
}

impl PostgresLeaseGuard {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl LeaseGuard for PostgresLeaseGuard {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn try_acquire(
        &self,
        key: PairKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, GuardError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;
        let token = Uuid::now_v7();

        let acquired = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO sync_leases (product_id, platform, token, holder, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (product_id, platform) DO UPDATE
            SET token = EXCLUDED.token,
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE sync_leases.expires_at <= $6
            RETURNING token
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .bind(token)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(guard_error("try_acquire"))?;

        Ok(acquired.map(|token| Lease {
            key,
            token,
            holder: holder.to_string(),
            expires_at,
        }))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, GuardError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl)?;

        let renewed = sqlx::query(
            r#"
            UPDATE sync_leases
            SET expires_at = $4
            WHERE product_id = $1 AND platform = $2 AND token = $3 AND expires_at > $5
            "#,
        )
        .bind(lease.key.product_id.as_uuid())
        .bind(lease.key.platform.as_str())
        .bind(lease.token)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(guard_error("renew"))?;

        Ok((renewed.rows_affected() > 0).then(|| Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, GuardError> {
        let released = sqlx::query(
            "DELETE FROM sync_leases WHERE product_id = $1 AND platform = $2 AND token = $3",
        )
        .bind(lease.key.product_id.as_uuid())
        .bind(lease.key.platform.as_str())
        .bind(lease.token)
        .execute(&*self.pool)
        .await
        .map_err(guard_error("release"))?;
        Ok(released.rows_affected() > 0)
    }

    async fn is_held(&self, key: PairKey) -> Result<bool, GuardError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sync_leases
                WHERE product_id = $1 AND platform = $2 AND expires_at > $3
            )
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(guard_error("is_held"))
    }
}

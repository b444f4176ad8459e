//! Postgres-backed [`SyncStore`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, FromRow, PgPool, Postgres, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use forgelist_core::{DomainError, Platform, ProductId, SyncEventId};
use forgelist_sync::{
    AuditEntry, PairKey, PlatformLink, Resolution, StoreError, SyncEvent, SyncEventStatus,
    SyncStats, SyncStore,
};

use super::{describe, is_unique_violation};

const EVENT_COLUMNS: &str = "seq, id, product_id, platform, operation, payload, status, \
     attempt_count, created_at, updated_at, next_attempt_at, last_error, lease_token, \
     origin, causation_id, retry_of";

const LINK_COLUMNS: &str =
    "product_id, platform, external_id, confirmed_status, match_kind, last_synced_at";

/// Sync event log, links and audit trail in Postgres.
///
/// Every dispatch invariant the in-memory store enforces is enforced here in
/// SQL, so several dispatcher processes can share one database.
#[derive(Debug, Clone)]
pub struct PostgresSyncStore {
    pool: Arc<PgPool>,
}

impl PostgresSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_error(operation: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |err| StoreError::Storage(describe(operation, &err))
}

fn column<T>(name: &str, raw: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = DomainError>,
{
    raw.parse()
        .map_err(|err| StoreError::Storage(format!("bad `{name}` column `{raw}`: {err}")))
}

async fn load_event<'e, E>(executor: E, id: SyncEventId) -> Result<Option<SyncEvent>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM sync_events WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(store_error("get_event"))?;
    row.map(|row| decode_event(&row)).transpose()
}

fn decode_event(row: &PgRow) -> Result<SyncEvent, StoreError> {
    SyncEventRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to read sync event row: {e}")))?
        .try_into()
}

fn decode_events(rows: Vec<PgRow>) -> Result<Vec<SyncEvent>, StoreError> {
    rows.iter().map(decode_event).collect()
}

fn decode_link(row: &PgRow) -> Result<PlatformLink, StoreError> {
    LinkRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to read link row: {e}")))?
        .try_into()
}

#[async_trait]
impl SyncStore for PostgresSyncStore {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, product_id = %event.product_id, platform = %event.platform),
        err
    )]
    async fn append_event(&self, event: SyncEvent) -> Result<SyncEvent, StoreError> {
        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| StoreError::Storage(format!("failed to encode payload: {e}")))?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO sync_events (
                id, product_id, platform, operation, payload, status, attempt_count,
                created_at, updated_at, next_attempt_at, last_error, lease_token,
                origin, causation_id, retry_of
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9, NULL, $10, $11, $12)
            ON CONFLICT (causation_id, product_id, platform) WHERE causation_id IS NOT NULL
            DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id.as_uuid())
        .bind(event.product_id.as_uuid())
        .bind(event.platform.as_str())
        .bind(event.operation.as_str())
        .bind(payload)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.next_attempt_at)
        .bind(event.last_error.as_deref())
        .bind(event.origin.as_str())
        .bind(event.causation_id)
        .bind(event.retry_of.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await;

        match inserted {
            Ok(Some(row)) => decode_event(&row),
            // Causation already recorded for this pair: hand back the original.
            Ok(None) => {
                let row = sqlx::query(&format!(
                    r#"
                    SELECT {EVENT_COLUMNS} FROM sync_events
                    WHERE causation_id = $1 AND product_id = $2 AND platform = $3
                    "#
                ))
                .bind(event.causation_id)
                .bind(event.product_id.as_uuid())
                .bind(event.platform.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(store_error("append_event"))?;
                debug!(causation_id = ?event.causation_id, "sync event already recorded");
                decode_event(&row)
            }
            Err(err) if is_unique_violation(&err) => Err(StoreError::AlreadyExists(event.id)),
            Err(err) => Err(store_error("append_event")(err)),
        }
    }

    async fn get_event(&self, id: SyncEventId) -> Result<Option<SyncEvent>, StoreError> {
        load_event(&*self.pool, id).await
    }

    #[instrument(skip(self), err)]
    async fn dispatch_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM (
                SELECT DISTINCT ON (product_id, platform) {EVENT_COLUMNS}
                FROM sync_events
                WHERE status IN ('pending', 'in_flight')
                ORDER BY product_id, platform, seq
            ) heads
            WHERE status = 'in_flight' OR next_attempt_at IS NULL OR next_attempt_at <= $1
            ORDER BY seq
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("dispatch_candidates"))?;
        decode_events(rows)
    }

    #[instrument(skip(self, lease_token), fields(event_id = %id), err)]
    async fn claim_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error("claim_event"))?;

        let key = load_event(&mut *tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?
            .key();

        // Lock the pair's open events in seq order; concurrent claims queue here.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM sync_events
            WHERE product_id = $1 AND platform = $2 AND status IN ('pending', 'in_flight')
            ORDER BY seq
            FOR UPDATE
            "#
        ))
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error("claim_event"))?;
        let open = decode_events(rows)?;

        let Some(event) = open.iter().find(|e| e.id == id) else {
            let current = load_event(&mut *tx, id).await?.ok_or(StoreError::NotFound(id))?;
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                action: "claim",
            });
        };

        if event.status == SyncEventStatus::Pending && !event.is_ready(now) {
            return Err(StoreError::NotDue(id));
        }
        for other in open.iter().filter(|e| e.id != id) {
            if other.status == SyncEventStatus::InFlight {
                return Err(StoreError::PairBusy(key));
            }
            if other.seq < event.seq {
                return Err(StoreError::OutOfOrder {
                    key,
                    event: id,
                    blocking: other.id,
                });
            }
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_events
            SET status = 'in_flight',
                lease_token = $2,
                attempt_count = attempt_count + 1,
                next_attempt_at = NULL,
                updated_at = $3
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(lease_token)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::PairBusy(key)
            } else {
                store_error("claim_event")(err)
            }
        })?;
        let claimed = decode_event(&row)?;

        tx.commit().await.map_err(store_error("claim_event"))?;
        Ok(claimed)
    }

    #[instrument(skip(self, lease_token), fields(event_id = %id, to = %resolution.status()), err)]
    async fn resolve_event(
        &self,
        id: SyncEventId,
        lease_token: Uuid,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, StoreError> {
        let (error, next_attempt_at) = match &resolution {
            Resolution::Success | Resolution::Partial => (None, None),
            Resolution::Retry {
                error,
                next_attempt_at,
            } => (Some(error.as_str()), Some(*next_attempt_at)),
            Resolution::DeadLetter { error } => (Some(error.as_str()), None),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_events
            SET status = $3,
                lease_token = NULL,
                last_error = COALESCE($4, last_error),
                next_attempt_at = $5,
                updated_at = $6
            WHERE id = $1 AND status = 'in_flight' AND lease_token = $2
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(lease_token)
        .bind(resolution.status().as_str())
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(store_error("resolve_event"))?;

        if let Some(row) = row {
            return decode_event(&row);
        }
        match load_event(&*self.pool, id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(current) if current.status != SyncEventStatus::InFlight => {
                Err(StoreError::InvalidTransition {
                    id,
                    from: current.status,
                    action: "resolve",
                })
            }
            Some(_) => Err(StoreError::StaleLease(id)),
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn supersede_pending(
        &self,
        key: PairKey,
        before_seq: i64,
        by: SyncEventId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEventId>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH superseded AS (
                UPDATE sync_events
                SET status = 'failed',
                    last_error = $4,
                    next_attempt_at = NULL,
                    updated_at = $5
                WHERE product_id = $1 AND platform = $2 AND seq < $3 AND status = 'pending'
                RETURNING id, seq
            )
            SELECT id FROM superseded ORDER BY seq
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .bind(before_seq)
        .bind(format!("superseded by {by}"))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("supersede_pending"))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(SyncEventId::from_uuid)
                    .map_err(store_error("supersede_pending"))
            })
            .collect()
    }

    async fn events_for_pair(&self, key: PairKey) -> Result<Vec<SyncEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM sync_events
            WHERE product_id = $1 AND platform = $2
            ORDER BY seq
            "#
        ))
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("events_for_pair"))?;
        decode_events(rows)
    }

    async fn events_for_product(&self, product_id: ProductId) -> Result<Vec<SyncEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM sync_events WHERE product_id = $1 ORDER BY seq"
        ))
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("events_for_product"))?;
        decode_events(rows)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM sync_events
            WHERE status = 'dead_letter'
            ORDER BY updated_at DESC, seq DESC
            LIMIT $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("dead_letters"))?;
        decode_events(rows)
    }

    async fn get_link(&self, key: PairKey) -> Result<Option<PlatformLink>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM platform_links WHERE product_id = $1 AND platform = $2"
        ))
        .bind(key.product_id.as_uuid())
        .bind(key.platform.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(store_error("get_link"))?;
        row.as_ref().map(decode_link).transpose()
    }

    async fn links_for_product(&self, product_id: ProductId) -> Result<Vec<PlatformLink>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM platform_links WHERE product_id = $1"
        ))
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("links_for_product"))?;
        let mut links = rows.iter().map(decode_link).collect::<Result<Vec<_>, _>>()?;
        // Platform order is the enum's, not the text column's.
        links.sort_by_key(|l| l.platform);
        Ok(links)
    }

    async fn links_for_platform(&self, platform: Platform) -> Result<Vec<PlatformLink>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM platform_links WHERE platform = $1 ORDER BY product_id"
        ))
        .bind(platform.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("links_for_platform"))?;
        rows.iter().map(decode_link).collect()
    }

    #[instrument(skip(self, link), fields(key = %link.key(), to = %link.confirmed_status), err)]
    async fn put_link(&self, link: PlatformLink) -> Result<Option<PlatformLink>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error("put_link"))?;

        let previous = sqlx::query(&format!(
            r#"
            SELECT {LINK_COLUMNS} FROM platform_links
            WHERE product_id = $1 AND platform = $2
            FOR UPDATE
            "#
        ))
        .bind(link.product_id.as_uuid())
        .bind(link.platform.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error("put_link"))?;
        let previous = previous.as_ref().map(decode_link).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO platform_links (
                product_id, platform, external_id, confirmed_status, match_kind, last_synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (product_id, platform) DO UPDATE
            SET external_id = EXCLUDED.external_id,
                confirmed_status = EXCLUDED.confirmed_status,
                match_kind = EXCLUDED.match_kind,
                last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(link.product_id.as_uuid())
        .bind(link.platform.as_str())
        .bind(link.external_id.as_deref())
        .bind(link.confirmed_status.as_str())
        .bind(link.match_kind.as_str())
        .bind(link.last_synced_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error("put_link"))?;

        tx.commit().await.map_err(store_error("put_link"))?;
        Ok(previous)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let body = serde_json::to_value(&entry)
            .map_err(|e| StoreError::Storage(format!("failed to encode audit entry: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sync_audit (id, recorded_at, product_id, platform, kind, entry)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.recorded_at)
        .bind(entry.product_id.map(Uuid::from))
        .bind(entry.platform.as_str())
        .bind(entry.kind.name())
        .bind(body)
        .execute(&*self.pool)
        .await
        .map_err(store_error("append_audit"))?;
        Ok(())
    }

    async fn audit_for_product(&self, product_id: ProductId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT entry FROM sync_audit WHERE product_id = $1 ORDER BY recorded_at, id",
        )
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(store_error("audit_for_product"))?;

        rows.iter()
            .map(|row| {
                let body: serde_json::Value =
                    row.try_get("entry").map_err(store_error("audit_for_product"))?;
                serde_json::from_value(body)
                    .map_err(|e| StoreError::Storage(format!("failed to decode audit entry: {e}")))
            })
            .collect()
    }

    async fn stats(&self) -> Result<SyncStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(store_error("stats"))?;
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM platform_links")
            .fetch_one(&*self.pool)
            .await
            .map_err(store_error("stats"))?;

        let mut stats = SyncStats {
            links: links as usize,
            ..Default::default()
        };
        for row in rows {
            let status: String = row.try_get("status").map_err(store_error("stats"))?;
            let n: i64 = row.try_get("n").map_err(store_error("stats"))?;
            let n = n as usize;
            match column::<SyncEventStatus>("status", &status)? {
                SyncEventStatus::Pending => stats.pending = n,
                SyncEventStatus::InFlight => stats.in_flight = n,
                SyncEventStatus::Success => stats.success = n,
                SyncEventStatus::Partial => stats.partial = n,
                SyncEventStatus::Failed => stats.failed = n,
                SyncEventStatus::DeadLetter => stats.dead_letter = n,
            }
        }
        Ok(stats)
    }
}

// SQLx row types

#[derive(Debug)]
struct SyncEventRow {
    seq: i64,
    id: Uuid,
    product_id: Uuid,
    platform: String,
    operation: String,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    lease_token: Option<Uuid>,
    origin: String,
    causation_id: Option<Uuid>,
    retry_of: Option<Uuid>,
}

impl<'r> FromRow<'r, PgRow> for SyncEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SyncEventRow {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            platform: row.try_get("platform")?,
            operation: row.try_get("operation")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            lease_token: row.try_get("lease_token")?,
            origin: row.try_get("origin")?,
            causation_id: row.try_get("causation_id")?,
            retry_of: row.try_get("retry_of")?,
        })
    }
}

impl TryFrom<SyncEventRow> for SyncEvent {
    type Error = StoreError;

    fn try_from(row: SyncEventRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_value(row.payload)
            .map_err(|e| StoreError::Storage(format!("bad payload for event {}: {e}", row.id)))?;
        Ok(SyncEvent {
            id: SyncEventId::from_uuid(row.id),
            seq: row.seq,
            product_id: ProductId::from_uuid(row.product_id),
            platform: column("platform", &row.platform)?,
            operation: column("operation", &row.operation)?,
            payload,
            status: column("status", &row.status)?,
            attempt_count: row.attempt_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            lease_token: row.lease_token,
            origin: column("origin", &row.origin)?,
            causation_id: row.causation_id,
            retry_of: row.retry_of.map(SyncEventId::from_uuid),
        })
    }
}

#[derive(Debug)]
struct LinkRow {
    product_id: Uuid,
    platform: String,
    external_id: Option<String>,
    confirmed_status: String,
    match_kind: String,
    last_synced_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LinkRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LinkRow {
            product_id: row.try_get("product_id")?,
            platform: row.try_get("platform")?,
            external_id: row.try_get("external_id")?,
            confirmed_status: row.try_get("confirmed_status")?,
            match_kind: row.try_get("match_kind")?,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    }
}

impl TryFrom<LinkRow> for PlatformLink {
    type Error = StoreError;

    fn try_from(row: LinkRow) -> Result<Self, Self::Error> {
        Ok(PlatformLink {
            product_id: ProductId::from_uuid(row.product_id),
            platform: column("platform", &row.platform)?,
            external_id: row.external_id,
            confirmed_status: column("confirmed_status", &row.confirmed_status)?,
            match_kind: column("match_kind", &row.match_kind)?,
            last_synced_at: row.last_synced_at,
        })
    }
}

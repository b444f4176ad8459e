//! Postgres persistence for the sync engine.
//!
//! ## Schema
//!
//! `migrations/0001_sync.sql` creates four tables:
//! - `sync_events`: the event log. `seq` is a `BIGSERIAL`, so creation order
//!   is the insert order. A partial unique index allows at most one
//!   `in_flight` row per (product, platform) pair, and another makes appends
//!   idempotent on `(causation_id, product_id, platform)`.
//! - `platform_links`: one row per pair.
//! - `sync_audit`: append-only, the full entry kept as JSONB.
//! - `sync_leases`: pair leases with fencing tokens.
//!
//! ## Concurrency
//!
//! Claims lock the pair's open rows (`FOR UPDATE`, in `seq` order) before
//! checking ordering, so two dispatchers racing for one pair serialize in
//! the database. The in-flight index is the backstop.

mod guard;
mod store;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use guard::PostgresLeaseGuard;
pub use store::PostgresSyncStore;

const MIGRATION: &str = include_str!("../../migrations/0001_sync.sql");

#[derive(Debug, thiserror::Error)]
pub enum PgError {
    #[error("{0} is not set")]
    MissingVar(&'static str),
    #[error("{var}: cannot use `{value}`: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Connection settings, read from `DATABASE_URL` and `FORGELIST_DB_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_env() -> Result<Self, PgError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PgError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL").ok_or(PgError::MissingVar("DATABASE_URL"))?;
        let mut settings = Self::new(url);
        if let Some(n) = parse(&lookup, "FORGELIST_DB_MAX_CONNECTIONS")? {
            settings.max_connections = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "FORGELIST_DB_ACQUIRE_TIMEOUT_MS")? {
            settings.acquire_timeout = Duration::from_millis(ms);
        }
        Ok(settings)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, PgError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| PgError::InvalidVar {
                var,
                value: raw.clone(),
                reason: err.to_string(),
            }),
    }
}

/// Open a connection pool.
pub async fn connect(settings: &PgSettings) -> Result<PgPool, PgError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(&settings.url)
        .await
        .map_err(|source| PgError::Database {
            operation: "connect",
            source,
        })?;
    info!(max_connections = settings.max_connections, "connected to postgres");
    Ok(pool)
}

/// Create the sync tables if they do not exist yet.
pub async fn migrate(pool: &PgPool) -> Result<(), PgError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|source| PgError::Database {
            operation: "migrate",
            source,
        })?;
    Ok(())
}

fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {operation} ({code}): {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

//! Infrastructure adapters for the sync engine.
//!
//! Durable implementations of the storage seams defined in `forgelist-sync`:
//! the sync event log, platform links and audit trail, and the pair lease table.

/// Postgres-backed store and lease guard.
pub mod postgres;

pub use postgres::{PgError, PgSettings, PostgresLeaseGuard, PostgresSyncStore, connect, migrate};

//! # Postgres based CVR storage
//!
//! This postgres-based backend stores one Client View Record per client
//! group inside a dedicated `cvr` schema namespace and implements the
//! load / flush / catchup protocol on top of it.
//!
//! ## Design Decisions
//!
//! ### Single writer per client group
//!
//! Every flush transaction starts with `SELECT ... FOR UPDATE` on the
//! group's `instances` row and verifies both the expected version and the
//! recorded owner before writing anything else. Two tasks racing on the
//! same group therefore resolve to exactly one committed flush; the loser
//! observes a `ConcurrentModification` or `Ownership` error and reloads.
//! Ownership itself is handed over at load time: a task may take a group
//! whose previous grant predates the connecting client's `last_connect`,
//! and the takeover update is gated on `granted_at` so a concurrent peer
//! that won the race cannot be clobbered.
//!
//! ### Rows are decoupled from the instance
//!
//! The `rows` table intentionally carries **no** foreign key to
//! `instances`. Bulk row writes may be flushed outside the main CVR
//! transaction (see the deferred flush in [`row_cache`]), and an FK would
//! make every such write contend with the row lock held on the instance
//! row while the version advances. Consistency is recovered through the
//! separate `rows_version` table: `rows_version <= instances.version`
//! always holds, and a loader that observes them out of sync waits for the
//! row state to drain before serving the group.
//!
//! ### Timestamps
//!
//! Columns are `timestamptz`; the code handles them as naive UTC
//! (`chrono::NaiveDateTime`) under the assumption that the server runs in
//! UTC. Tests that build timestamps must construct aware values and
//! convert to UTC before comparing.
//!
//! ### Atomic Transactions
//!
//! Operations here never open connections themselves. Each receives a
//! `&mut AsyncPgConnection` that may or may not already be inside a
//! transactional context, which lets callers chain several operations into
//! a single transaction. The two exceptions hold a pool handle on purpose:
//! the deferred row flush (runs after the owning transaction committed)
//! and the best-effort ownership takeover (must not fail the load).

use diesel::result::DatabaseErrorKind;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use tracing::info;
use viewsync_core::error::CvrError;

pub(crate) mod key_columns;
pub mod migrations;
pub(crate) mod orm;
pub(crate) mod row_cache;
mod schema;
pub mod store;

/// Internal wrapper aligning diesel errors with the crate error type, so
/// `?` works inside diesel-async transaction closures.
pub(crate) struct PostgresError(pub CvrError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        let err = match &value {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                CvrError::ConcurrentModification {
                    expected: "serializable snapshot".to_string(),
                    actual: info.message().to_string(),
                }
            }
            _ => CvrError::Unexpected(format!("DieselError: {}", value)),
        };
        PostgresError(err)
    }
}

impl From<PostgresError> for CvrError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<CvrError> for PostgresError {
    fn from(value: CvrError) -> Self {
        PostgresError(value)
    }
}

/// Establishes a connection pool for the given database URL and brings the
/// CVR schema up to date.
///
/// Pool connections are created lazily; the migration run borrows one up
/// front so a misconfigured URL fails here rather than on first use.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, CvrError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(config)
        .build()
        .map_err(|err| CvrError::Unexpected(format!("{}", err)))?;
    let mut conn = pool
        .get()
        .await
        .map_err(|err| CvrError::Unexpected(format!("{}", err)))?;
    let version = migrations::run_migrations(&mut conn).await?;
    info!(schema_version = version, "CVR schema up to date");
    Ok(pool)
}

//! Linear, numbered migrations for the CVR schema.
//!
//! The registry is ordered by version; startup applies every migration
//! above the stored schema version, each inside its own transaction. A
//! migration may raise the stored `min_safe_version`, which refuses to
//! start older code against the migrated database when rolling back past
//! it would be unsafe.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{
    scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl,
    SimpleAsyncConnection,
};
use tracing::info;
use viewsync_core::error::CvrError;

use super::{schema::schema_versions, PostgresError};

/// The schema version this build of the code understands.
pub const SCHEMA_VERSION: i32 = 2;

#[async_trait]
trait Migration: Send + Sync {
    fn version(&self) -> i32;

    /// Raises the stored rollback gate; `None` keeps the previous value.
    fn min_safe_version(&self) -> Option<i32> {
        None
    }

    async fn migrate_schema(&self, conn: &mut AsyncPgConnection) -> Result<(), PostgresError>;

    async fn migrate_data(&self, _conn: &mut AsyncPgConnection) -> Result<(), PostgresError> {
        Ok(())
    }
}

fn registry() -> Vec<Box<dyn Migration>> {
    vec![Box::new(InitialSchema), Box::new(RowLookupIndexes)]
}

/// Creates the namespace and the version bookkeeping outside the registry,
/// so the gate can be evaluated before anything else runs.
const BOOTSTRAP: &str = r#"
    CREATE SCHEMA IF NOT EXISTS cvr;
    CREATE TABLE IF NOT EXISTS cvr.schema_versions (
        lock TEXT PRIMARY KEY DEFAULT 'v' CHECK (lock = 'v'),
        version INTEGER NOT NULL,
        min_safe_version INTEGER
    );
"#;

/// Brings the CVR schema up to [`SCHEMA_VERSION`].
///
/// Returns the resulting schema version. Fails without touching anything
/// when the stored `min_safe_version` says this build is too old.
pub async fn run_migrations(conn: &mut AsyncPgConnection) -> Result<i32, CvrError> {
    conn.batch_execute(BOOTSTRAP)
        .await
        .map_err(PostgresError::from)?;

    let stored: Option<(i32, Option<i32>)> = schema_versions::table
        .select((schema_versions::version, schema_versions::min_safe_version))
        .first(conn)
        .await
        .optional()
        .map_err(PostgresError::from)?;
    let (mut current, mut min_safe) = stored.unwrap_or((0, None));
    ensure_safe_to_run(current, min_safe)?;

    for migration in registry() {
        if migration.version() <= current {
            continue;
        }
        info!(
            from = current,
            to = migration.version(),
            "applying CVR schema migration"
        );
        let next_min_safe = match (min_safe, migration.min_safe_version()) {
            (stored, None) => stored,
            (None, raised) => raised,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
        conn.transaction::<_, PostgresError, _>(|conn| {
            let migration = &migration;
            async move {
                migration.migrate_schema(conn).await?;
                migration.migrate_data(conn).await?;
                diesel::insert_into(schema_versions::table)
                    .values((
                        schema_versions::lock.eq("v"),
                        schema_versions::version.eq(migration.version()),
                        schema_versions::min_safe_version.eq(next_min_safe),
                    ))
                    .on_conflict(schema_versions::lock)
                    .do_update()
                    .set((
                        schema_versions::version.eq(migration.version()),
                        schema_versions::min_safe_version.eq(next_min_safe),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(CvrError::from)?;
        current = migration.version();
        min_safe = next_min_safe;
    }
    Ok(current)
}

fn ensure_safe_to_run(stored_version: i32, stored_min_safe: Option<i32>) -> Result<(), CvrError> {
    match stored_min_safe {
        Some(min_safe) if min_safe > SCHEMA_VERSION => Err(CvrError::Unexpected(format!(
            "database schema v{stored_version} requires at least code schema v{min_safe}, \
             this build supports v{SCHEMA_VERSION}"
        ))),
        _ => Ok(()),
    }
}

/// v1: the six CVR tables.
struct InitialSchema;

#[async_trait]
impl Migration for InitialSchema {
    fn version(&self) -> i32 {
        1
    }

    async fn migrate_schema(&self, conn: &mut AsyncPgConnection) -> Result<(), PostgresError> {
        conn.batch_execute(
            r#"
            CREATE TABLE cvr.instances (
                client_group_id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                last_active TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0),
                replica_version TEXT,
                owner TEXT,
                granted_at TIMESTAMPTZ,
                client_schema JSONB
            );

            CREATE TABLE cvr.clients (
                client_group_id TEXT NOT NULL
                    REFERENCES cvr.instances (client_group_id) ON DELETE CASCADE,
                client_id TEXT NOT NULL,
                patch_version TEXT,
                deleted BOOL,
                PRIMARY KEY (client_group_id, client_id)
            );

            CREATE TABLE cvr.queries (
                client_group_id TEXT NOT NULL
                    REFERENCES cvr.instances (client_group_id) ON DELETE CASCADE,
                query_hash TEXT NOT NULL,
                client_ast JSONB,
                query_name TEXT,
                query_args JSONB,
                patch_version TEXT,
                transformation_hash TEXT,
                transformation_version TEXT,
                internal BOOL,
                deleted BOOL,
                PRIMARY KEY (client_group_id, query_hash)
            );

            CREATE TABLE cvr.desires (
                client_group_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                query_hash TEXT NOT NULL,
                patch_version TEXT NOT NULL,
                deleted BOOL,
                ttl INTERVAL,
                inactivated_at TIMESTAMPTZ,
                PRIMARY KEY (client_group_id, client_id, query_hash),
                FOREIGN KEY (client_group_id, query_hash)
                    REFERENCES cvr.queries (client_group_id, query_hash) ON DELETE CASCADE
            );

            -- No FK to cvr.instances: bulk row writes may commit outside
            -- the CVR transaction and must not contend with the row lock
            -- held on the instance row while the version advances.
            CREATE TABLE cvr.rows (
                client_group_id TEXT NOT NULL,
                row_schema TEXT NOT NULL,
                row_table TEXT NOT NULL,
                row_key JSONB NOT NULL,
                row_version TEXT NOT NULL,
                patch_version TEXT NOT NULL,
                ref_counts JSONB,
                PRIMARY KEY (client_group_id, row_schema, row_table, row_key)
            );

            CREATE TABLE cvr.rows_version (
                client_group_id TEXT PRIMARY KEY,
                version TEXT NOT NULL
            );
            "#,
        )
        .await?;
        Ok(())
    }
}

/// v2: lookup indexes for catchup scans and refcount-by-query filtering.
struct RowLookupIndexes;

#[async_trait]
impl Migration for RowLookupIndexes {
    fn version(&self) -> i32 {
        2
    }

    async fn migrate_schema(&self, conn: &mut AsyncPgConnection) -> Result<(), PostgresError> {
        conn.batch_execute(
            r#"
            CREATE INDEX rows_patch_version_idx
                ON cvr.rows (client_group_id, patch_version);
            CREATE INDEX rows_ref_counts_idx
                ON cvr.rows USING GIN (ref_counts);
            "#,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_is_linear_and_matches_schema_version() {
        let versions: Vec<i32> = registry().iter().map(|m| m.version()).collect();
        assert_eq!(versions, (1..=SCHEMA_VERSION).collect::<Vec<_>>());
    }

    #[test]
    fn min_safe_version_gate() {
        assert!(ensure_safe_to_run(0, None).is_ok());
        assert!(ensure_safe_to_run(SCHEMA_VERSION, Some(SCHEMA_VERSION)).is_ok());
        assert!(ensure_safe_to_run(SCHEMA_VERSION + 5, Some(SCHEMA_VERSION + 1)).is_err());
    }
}

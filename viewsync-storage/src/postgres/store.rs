//! Durable access to one client group's CVR.
//!
//! A `CvrStore` is created per task attach and mediates every read and
//! write of the group's CVR: the initial load (including the ownership
//! handshake), the staged write set that updaters fill, the flush
//! transaction that advances the instance version under the row lock, and
//! the catchup readers used to bring reconnecting clients up to date.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_stream::try_stream;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl,
};
use futures03::Stream;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};
use viewsync_core::{
    cvr::{ClientQueryState, ClientRecord, Cvr, CvrRowRecord, RowKey},
    error::CvrError,
    patch::{CvrPatch, PatchOp, PatchToVersion},
    version::CvrVersion,
    ClientGroupId, ClientId, QueryHash, TaskId,
};

use super::{
    orm::{self, ClientsRow, DesiresRow, InstanceRow, QueriesRow},
    row_cache::{
        execute_row_updates, RowRecordCache, RowRecords, RowUpdateMode, RowsFlushed,
        DEFAULT_DEFERRED_ROW_THRESHOLD,
    },
    schema::{clients, desires, instances, queries, rows, rows_version},
    PostgresError,
};

/// How often the loader retries while `rows_version` lags the instance.
const LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Retry budget before a lagging group is reported as `ClientNotFound`.
const MAX_LOAD_ATTEMPTS: usize = 10;
/// Default page size of the row catchup reader.
const DEFAULT_CATCHUP_BATCH_SIZE: i64 = 10_000;

/// Counters reported by a successful flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CvrFlushStats {
    pub instances: usize,
    pub clients: usize,
    pub queries: usize,
    pub desires: usize,
    pub rows: usize,
    /// Row writes were handed to the background writer instead of the
    /// flush transaction.
    pub rows_deferred: bool,
    pub statements: usize,
}

/// A staged CVR metadata write, executed inside the flush transaction.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Client(ClientsRow),
    Query(QueriesRow),
    Desire(DesiresRow),
    /// Hard-deletes the client row only. The client's desires are left
    /// behind (inactivated by the updater) so their TTLs keep driving
    /// eviction across reloads; query removal soft-deletes them later.
    DeleteClient(ClientId),
    /// Cascade-deletes the whole group across all six tables.
    DeleteGroup,
}

impl PendingWrite {
    async fn execute(
        &self,
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
        stats: &mut CvrFlushStats,
    ) -> Result<(), PostgresError> {
        match self {
            PendingWrite::Client(row) => {
                diesel::insert_into(clients::table)
                    .values(row)
                    .on_conflict((clients::client_group_id, clients::client_id))
                    .do_nothing()
                    .execute(conn)
                    .await?;
                stats.clients += 1;
                stats.statements += 1;
            }
            PendingWrite::Query(row) => {
                diesel::insert_into(queries::table)
                    .values(row)
                    .on_conflict((queries::client_group_id, queries::query_hash))
                    .do_update()
                    .set(row)
                    .execute(conn)
                    .await?;
                stats.queries += 1;
                stats.statements += 1;
            }
            PendingWrite::Desire(row) => {
                diesel::insert_into(desires::table)
                    .values(row)
                    .on_conflict((
                        desires::client_group_id,
                        desires::client_id,
                        desires::query_hash,
                    ))
                    .do_update()
                    .set(row)
                    .execute(conn)
                    .await?;
                stats.desires += 1;
                stats.statements += 1;
            }
            PendingWrite::DeleteClient(client_id) => {
                stats.clients += diesel::delete(clients::table)
                    .filter(clients::client_group_id.eq(cg))
                    .filter(clients::client_id.eq(client_id))
                    .execute(conn)
                    .await?;
                stats.statements += 1;
            }
            PendingWrite::DeleteGroup => {
                // deleting queries cascades over desires; instances over
                // clients and queries; rows carry no FK and go explicitly
                diesel::delete(instances::table)
                    .filter(instances::client_group_id.eq(cg))
                    .execute(conn)
                    .await?;
                diesel::delete(rows::table)
                    .filter(rows::client_group_id.eq(cg))
                    .execute(conn)
                    .await?;
                diesel::delete(rows_version::table)
                    .filter(rows_version::client_group_id.eq(cg))
                    .execute(conn)
                    .await?;
                stats.statements += 3;
            }
        }
        Ok(())
    }
}

enum LoadOutcome {
    Loaded { cvr: Cvr, needs_takeover: bool },
    RowsVersionBehind { cvr_version: String, rows_version: String },
}

pub struct CvrStore {
    pool: Pool<AsyncPgConnection>,
    client_group_id: ClientGroupId,
    task_id: TaskId,
    row_cache: Arc<RowRecordCache>,
    pending: Vec<PendingWrite>,
    pending_rows: HashMap<RowKey, CvrRowRecord>,
    deferred_row_threshold: usize,
    catchup_batch_size: i64,
}

impl CvrStore {
    pub fn new(
        pool: Pool<AsyncPgConnection>,
        client_group_id: impl Into<ClientGroupId>,
        task_id: impl Into<TaskId>,
    ) -> Self {
        let client_group_id = client_group_id.into();
        let row_cache = RowRecordCache::new(pool.clone(), client_group_id.clone());
        Self {
            pool,
            client_group_id,
            task_id: task_id.into(),
            row_cache,
            pending: Vec::new(),
            pending_rows: HashMap::new(),
            deferred_row_threshold: DEFAULT_DEFERRED_ROW_THRESHOLD,
            catchup_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
        }
    }

    pub fn with_deferred_row_threshold(mut self, threshold: usize) -> Self {
        self.deferred_row_threshold = threshold;
        self
    }

    pub fn with_catchup_batch_size(mut self, batch_size: i64) -> Self {
        self.catchup_batch_size = batch_size;
        self
    }

    pub fn client_group_id(&self) -> &ClientGroupId {
        &self.client_group_id
    }

    /// Loads the group's CVR, creating a zero-valued one on first attach.
    ///
    /// While `rows_version` lags the instance version (a deferred row flush
    /// has not drained yet) the load retries on a bounded budget and then
    /// reports the group as `ClientNotFound`.
    pub async fn load(
        &mut self,
        conn: &mut AsyncPgConnection,
        last_connect: NaiveDateTime,
    ) -> Result<Cvr, CvrError> {
        for _ in 0..MAX_LOAD_ATTEMPTS {
            match self.load_once(conn, last_connect).await? {
                LoadOutcome::Loaded { cvr, needs_takeover } => {
                    if needs_takeover {
                        self.spawn_ownership_takeover(last_connect);
                    }
                    return Ok(cvr);
                }
                LoadOutcome::RowsVersionBehind { cvr_version, rows_version } => {
                    warn!(
                        client_group = %self.client_group_id,
                        %cvr_version,
                        %rows_version,
                        "row state not drained yet, waiting"
                    );
                    sleep(LOAD_RETRY_INTERVAL).await;
                }
            }
        }
        Err(CvrError::ClientNotFound(self.client_group_id.clone()))
    }

    async fn load_once(
        &self,
        conn: &mut AsyncPgConnection,
        last_connect: NaiveDateTime,
    ) -> Result<LoadOutcome, CvrError> {
        let cg = self.client_group_id.clone();
        let task = self.task_id.clone();
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                let Some((instance, stored_rows_version)) =
                    InstanceRow::with_rows_version(&cg, conn).await?
                else {
                    let cvr = Cvr::new(cg.clone());
                    let row = InstanceRow {
                        client_group_id: cg.clone(),
                        version: cvr.version.to_string(),
                        last_active: cvr.last_active,
                        replica_version: None,
                        owner: Some(task.clone()),
                        granted_at: Some(last_connect),
                        client_schema: None,
                    };
                    diesel::insert_into(instances::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                    diesel::insert_into(rows_version::table)
                        .values((
                            rows_version::client_group_id.eq(&cg),
                            rows_version::version.eq(&row.version),
                        ))
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                    return Ok(LoadOutcome::Loaded { cvr, needs_takeover: false });
                };

                let owned = instance.owner.as_deref() == Some(task.as_str());
                if !owned {
                    if let Some(granted_at) = instance.granted_at {
                        if granted_at > last_connect {
                            return Err(CvrError::Ownership {
                                owner: instance.owner,
                                granted_at: Some(granted_at),
                            }
                            .into());
                        }
                    }
                }

                let rows_at = stored_rows_version
                    .unwrap_or_else(|| CvrVersion::empty().to_string());
                if instance.version != rows_at {
                    return Ok(LoadOutcome::RowsVersionBehind {
                        cvr_version: instance.version,
                        rows_version: rows_at,
                    });
                }

                let mut cvr = Cvr::new(cg.clone());
                cvr.version = orm::parse_version(&instance.version)?;
                cvr.last_active = instance.last_active;
                cvr.replica_version = instance.replica_version;
                cvr.client_schema = instance.client_schema;

                for client in ClientsRow::for_group(&cg, conn).await? {
                    cvr.clients
                        .insert(client.client_id, ClientRecord::default());
                }
                for query in QueriesRow::live_for_group(&cg, conn).await? {
                    let record = query.into_record()?;
                    cvr.queries.insert(record.hash.clone(), record);
                }
                for desire in DesiresRow::live_for_group(&cg, conn).await? {
                    let version = orm::parse_version(&desire.patch_version)?;
                    let ttl_ms = desire.ttl_ms();
                    let query = cvr.queries.get_mut(&desire.query_hash).ok_or_else(|| {
                        CvrError::InvariantViolation(format!(
                            "desire of client {} references missing query {}",
                            desire.client_id, desire.query_hash
                        ))
                    })?;
                    query.client_state.insert(
                        desire.client_id.clone(),
                        ClientQueryState {
                            version,
                            inactivated_at: desire.inactivated_at,
                            ttl_ms,
                        },
                    );
                    match cvr.clients.get_mut(&desire.client_id) {
                        Some(client) => {
                            client.desired_query_ids.insert(desire.query_hash);
                        }
                        // an inactive desire may outlive its deleted client;
                        // it lingers only to time the query's eviction
                        None if desire.inactivated_at.is_some() => {}
                        None => {
                            return Err(CvrError::InvariantViolation(format!(
                                "live desire for query {} references missing client {}",
                                desire.query_hash, desire.client_id
                            ))
                            .into())
                        }
                    }
                }
                Ok(LoadOutcome::Loaded { cvr, needs_takeover: !owned })
            }
            .scope_boxed()
        })
        .await
        .map_err(CvrError::from)
    }

    /// Claims ownership off the load path. Best effort: gated on
    /// `granted_at` so a peer that won the race keeps the group, and a
    /// failure only logs, since the flush transaction re-verifies
    /// ownership anyway.
    fn spawn_ownership_takeover(&self, last_connect: NaiveDateTime) {
        let pool = self.pool.clone();
        let cg = self.client_group_id.clone();
        let task = self.task_id.clone();
        tokio::spawn(async move {
            let result = async {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|err| CvrError::Unexpected(format!("{}", err)))?;
                InstanceRow::take_ownership(&cg, &task, last_connect, last_connect, &mut conn)
                    .await
                    .map_err(|err| CvrError::Unexpected(format!("{}", err)))
            }
            .await;
            match result {
                Ok(updated) => {
                    debug!(client_group = %cg, task = %task, updated, "ownership takeover")
                }
                Err(err) => {
                    warn!(client_group = %cg, task = %task, %err, "ownership takeover failed")
                }
            }
        });
    }

    // ---- staged writes -------------------------------------------------

    pub(crate) fn put_client(&mut self, row: ClientsRow) {
        self.pending.push(PendingWrite::Client(row));
    }

    pub(crate) fn put_query(&mut self, row: QueriesRow) {
        self.pending.push(PendingWrite::Query(row));
    }

    pub(crate) fn put_desire(&mut self, row: DesiresRow) {
        self.pending.push(PendingWrite::Desire(row));
    }

    /// Stages the hard deletion of a client row. Its desire rows are not
    /// touched; the updater inactivates them so the TTL eviction window
    /// survives a reload.
    pub(crate) fn delete_client(&mut self, client_id: &str) {
        self.pending
            .push(PendingWrite::DeleteClient(client_id.to_string()));
    }

    pub(crate) fn delete_client_group(&mut self) {
        self.pending.push(PendingWrite::DeleteGroup);
    }

    pub(crate) fn stage_row(&mut self, key: RowKey, record: CvrRowRecord) {
        self.pending_rows.insert(key, record);
    }

    pub(crate) fn staged_row(&self, key: &RowKey) -> Option<&CvrRowRecord> {
        self.pending_rows.get(key)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty() || !self.pending_rows.is_empty()
    }

    /// The current row record snapshot, rebuilt from storage when needed.
    pub(crate) async fn row_records(&self) -> Result<RowRecords, CvrError> {
        self.row_cache.get_row_records().await
    }

    /// Seeds the row cache without touching storage.
    #[cfg(test)]
    pub(crate) async fn preload_row_records(&self, records: HashMap<RowKey, CvrRowRecord>) {
        self.row_cache.preload(records).await;
    }

    #[cfg(test)]
    pub(crate) fn pending_writes(&self) -> &[PendingWrite] {
        &self.pending
    }

    #[cfg(test)]
    pub(crate) fn pending_row_map(&self) -> &HashMap<RowKey, CvrRowRecord> {
        &self.pending_rows
    }

    /// True while deferred row batches are still queued.
    pub fn has_pending_row_updates(&self) -> bool {
        self.row_cache.has_pending_updates()
    }

    /// Blocks until all deferred row batches have committed or failed.
    pub async fn rows_flushed(&self) -> Result<(), CvrError> {
        self.row_cache.flushed().await
    }

    // ---- flush ---------------------------------------------------------

    /// Commits the staged writes and the new snapshot in one transaction.
    ///
    /// The first statement takes the instance row lock; the expected
    /// version and the ownership are verified under it, making concurrent
    /// writers lose with `ConcurrentModification` / `Ownership` instead of
    /// clobbering each other. Row updates above the deferral threshold are
    /// buffered in the cache and written by the background writer after
    /// commit. Any failure clears the row cache (now stale) and discards
    /// the staged writes.
    pub async fn flush(
        &mut self,
        conn: &mut AsyncPgConnection,
        expected_version: &CvrVersion,
        cvr: &Cvr,
        last_connect: NaiveDateTime,
    ) -> Result<CvrFlushStats, CvrError> {
        let pending = std::mem::take(&mut self.pending);
        let pending_rows = std::mem::take(&mut self.pending_rows);
        let group_deleted = pending
            .iter()
            .any(|w| matches!(w, PendingWrite::DeleteGroup));
        match self
            .flush_inner(conn, expected_version, cvr, last_connect, &pending, &pending_rows)
            .await
        {
            Ok(mut stats) => {
                if group_deleted {
                    self.row_cache.clear().await;
                    return Ok(stats);
                }
                let deferred = stats.rows_deferred;
                stats.rows = pending_rows.len();
                self.row_cache
                    .apply(pending_rows, &cvr.version, !deferred)
                    .await;
                debug!(
                    client_group = %self.client_group_id,
                    version = %cvr.version,
                    ?stats,
                    "CVR flushed"
                );
                Ok(stats)
            }
            Err(err) => {
                self.row_cache.clear().await;
                Err(err)
            }
        }
    }

    async fn flush_inner(
        &self,
        conn: &mut AsyncPgConnection,
        expected_version: &CvrVersion,
        cvr: &Cvr,
        last_connect: NaiveDateTime,
        pending: &[PendingWrite],
        pending_rows: &HashMap<RowKey, CvrRowRecord>,
    ) -> Result<CvrFlushStats, CvrError> {
        let cg = self.client_group_id.clone();
        let task = self.task_id.clone();
        let expected = expected_version.to_string();
        let threshold = self.deferred_row_threshold;
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                let lock = InstanceRow::lock(&cg, conn)
                    .await?
                    .ok_or_else(|| CvrError::ConcurrentModification {
                        expected: expected.clone(),
                        actual: "<deleted>".to_string(),
                    })?;
                if lock.version != expected {
                    return Err(CvrError::ConcurrentModification {
                        expected: expected.clone(),
                        actual: lock.version,
                    }
                    .into());
                }
                let owned = lock.owner.as_deref() == Some(task.as_str());
                if !owned {
                    if let Some(granted_at) = lock.granted_at {
                        if granted_at > last_connect {
                            return Err(CvrError::Ownership {
                                owner: lock.owner,
                                granted_at: Some(granted_at),
                            }
                            .into());
                        }
                    }
                }
                let mut stats = CvrFlushStats::default();

                // a scheduled group delete supersedes every other write
                if pending
                    .iter()
                    .any(|w| matches!(w, PendingWrite::DeleteGroup))
                {
                    stats.statements += 1; // the lock
                    (&PendingWrite::DeleteGroup)
                        .execute(&cg, conn, &mut stats)
                        .await?;
                    return Ok(stats);
                }

                let granted_at = if owned {
                    lock.granted_at.unwrap_or(last_connect)
                } else {
                    last_connect
                };
                let instance = InstanceRow {
                    client_group_id: cg.clone(),
                    version: cvr.version.to_string(),
                    last_active: cvr.last_active,
                    replica_version: cvr.replica_version.clone(),
                    owner: Some(task.clone()),
                    granted_at: Some(granted_at),
                    client_schema: cvr.client_schema.clone(),
                };
                diesel::insert_into(instances::table)
                    .values(&instance)
                    .on_conflict(instances::client_group_id)
                    .do_update()
                    .set(&instance)
                    .execute(conn)
                    .await?;
                stats.instances += 1;
                stats.statements += 2; // lock + instance upsert

                for write in pending {
                    write.execute(&cg, conn, &mut stats).await?;
                }

                match execute_row_updates(
                    conn,
                    &cg,
                    &cvr.version,
                    pending_rows,
                    RowUpdateMode::AllowDefer,
                    threshold,
                )
                .await?
                {
                    RowsFlushed::Written { statements } => {
                        stats.statements += statements;
                    }
                    RowsFlushed::Deferred => {
                        stats.rows_deferred = true;
                    }
                }
                Ok(stats)
            }
            .scope_boxed()
        })
        .await
        .map_err(CvrError::from)
    }

    // ---- catchup -------------------------------------------------------

    /// Query and desire patches whose patch version lies in
    /// `(after, up_to]`, ordered by version with deletions after puts at
    /// the same version. Verifies the CVR is still at `current` first.
    pub async fn catchup_config_patches(
        &self,
        conn: &mut AsyncPgConnection,
        after: &CvrVersion,
        up_to: &CvrVersion,
        current: &CvrVersion,
    ) -> Result<Vec<PatchToVersion>, CvrError> {
        let cg = self.client_group_id.clone();
        let after = after.to_string();
        let up_to = up_to.to_string();
        let current = current.clone();
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                assert_version_unchanged(&cg, &current, conn).await?;

                let mut patches = Vec::new();
                for row in QueriesRow::in_patch_range(&cg, &after, &up_to, conn).await? {
                    if row.internal.unwrap_or(false) {
                        continue;
                    }
                    let version = orm::parse_version(
                        row.patch_version
                            .as_deref()
                            .expect("patch range filter excludes NULLs"),
                    )?;
                    let patch = if row.deleted.unwrap_or(false) {
                        CvrPatch::query_del(row.query_hash)
                    } else {
                        CvrPatch::query_put(row.query_hash)
                    };
                    patches.push(PatchToVersion::new(patch, version));
                }
                for row in DesiresRow::in_patch_range(&cg, &after, &up_to, conn).await? {
                    let version = orm::parse_version(&row.patch_version)?;
                    let patch = if row.deleted.unwrap_or(false) {
                        CvrPatch::desire_del(row.query_hash, row.client_id)
                    } else {
                        CvrPatch::desire_put(row.query_hash, row.client_id)
                    };
                    patches.push(PatchToVersion::new(patch, version));
                }
                // deletions win over puts at the same version
                patches.sort_by_key(|p| {
                    (p.to_version.clone(), matches!(p.patch.op(), PatchOp::Del))
                });
                Ok(patches)
            }
            .scope_boxed()
        })
        .await
        .map_err(CvrError::from)
    }

    /// Streams row records whose patch version lies in `(after, up_to]`,
    /// in batches ordered by patch version. Live rows referenced only by
    /// `exclude_queries` are skipped; tombstones are always delivered.
    ///
    /// The instance version is verified before the first and after the
    /// last page: with a single writer per group, any drift mid-catchup is
    /// a lost race and surfaces as `ConcurrentModification`.
    pub fn catchup_row_patches<'a>(
        &'a self,
        conn: &'a mut AsyncPgConnection,
        after: &CvrVersion,
        up_to: &CvrVersion,
        current: &CvrVersion,
        exclude_queries: &[QueryHash],
    ) -> impl Stream<Item = Result<Vec<CvrRowRecord>, CvrError>> + 'a {
        let cg = self.client_group_id.clone();
        let after = after.to_string();
        let up_to = up_to.to_string();
        let current = current.clone();
        let exclude: BTreeSet<QueryHash> = exclude_queries.iter().cloned().collect();
        let batch_size = self.catchup_batch_size;
        try_stream! {
            assert_version_unchanged(&cg, &current, conn).await?;
            let mut offset = 0i64;
            loop {
                let page =
                    orm::RowsRow::page_in_range(&cg, &after, &up_to, batch_size, offset, conn)
                        .await
                        .map_err(PostgresError::from)
                        .map_err(CvrError::from)?;
                let fetched = page.len();
                let mut records = Vec::with_capacity(fetched);
                for row in page {
                    let (_, record) = row.into_record()?;
                    if record.only_referenced_by(&exclude) {
                        continue;
                    }
                    records.push(record);
                }
                if !records.is_empty() {
                    yield records;
                }
                if (fetched as i64) < batch_size {
                    break;
                }
                offset += fetched as i64;
            }
            assert_version_unchanged(&cg, &current, conn).await?;
        }
    }
}

async fn assert_version_unchanged(
    cg: &ClientGroupId,
    current: &CvrVersion,
    conn: &mut AsyncPgConnection,
) -> Result<(), CvrError> {
    let stored = InstanceRow::version_of(cg, conn)
        .await
        .map_err(PostgresError::from)
        .map_err(CvrError::from)?;
    match stored {
        Some(version) if version == current.to_string() => Ok(()),
        other => Err(CvrError::ConcurrentModification {
            expected: current.to_string(),
            actual: other.unwrap_or_else(|| "<deleted>".to_string()),
        }),
    }
}

//! In-memory snapshot of a client group's row records and the deferred
//! flush engine behind it.
//!
//! The cache holds the last-flushed `rowID -> rowRecord` map, rebuilt
//! lazily on first read. Readers get an `Arc` snapshot, so a mutation that
//! lands while an iteration is in flight is invisible to that iteration.
//!
//! ## Deferred flush protocol
//!
//! CVR metadata commits in the main flush transaction. When the pending
//! row set exceeds the deferred-row threshold, the row bulk is instead
//! buffered here and written by a background task to the independent
//! `rows` and `rows_version` tables. In-process readers keep observing the
//! cache (always up to date); foreign readers that arrive before drainage
//! observe `rows_version < instances.version` and wait (load protocol).
//! A failed background flush leaves `rows_version` behind on purpose; the
//! cache is dropped as stale and the error is reported via [`flushed`].
//!
//! [`flushed`]: RowRecordCache::flushed

use std::{collections::HashMap, sync::Arc};

use diesel::{prelude::*, upsert::excluded};
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error};
use viewsync_core::{
    cvr::{CvrRowRecord, RowKey},
    error::CvrError,
    version::CvrVersion,
    ClientGroupId,
};

use super::{
    orm::{RowsRow, RowsVersionRow},
    schema::{rows, rows_version},
    PostgresError,
};

/// Upper bound on rows per upsert statement. Batches use power-of-two
/// sizes up to this cap so the set of prepared statement shapes stays
/// small while parameter counts stay bounded.
const ROW_BATCH_MAX: usize = 512;

/// How many pending row updates a flush may write inside the main CVR
/// transaction before deferring them to the background writer.
pub(crate) const DEFAULT_DEFERRED_ROW_THRESHOLD: usize = 500;

pub(crate) type RowRecords = Arc<HashMap<RowKey, CvrRowRecord>>;

#[derive(Clone, Copy, Debug)]
pub(crate) enum RowUpdateMode {
    /// Defer when the pending set exceeds the threshold.
    AllowDefer,
    /// Write unconditionally (the background path).
    Force,
}

#[derive(Debug, PartialEq)]
pub(crate) enum RowsFlushed {
    /// Nothing was written; the caller must hand the batch to
    /// [`RowRecordCache::apply`] with `synchronously_flushed = false`.
    Deferred,
    Written { statements: usize },
}

struct DeferredFlush {
    version: CvrVersion,
    updates: HashMap<RowKey, CvrRowRecord>,
}

pub(crate) struct RowRecordCache {
    client_group_id: ClientGroupId,
    pool: Pool<AsyncPgConnection>,
    cache: Mutex<Option<RowRecords>>,
    flush_tx: mpsc::UnboundedSender<DeferredFlush>,
    pending: Arc<watch::Sender<usize>>,
    pending_rx: watch::Receiver<usize>,
    last_error: Arc<std::sync::Mutex<Option<CvrError>>>,
}

impl RowRecordCache {
    /// Creates the cache and spawns its background writer. The pool serves
    /// the writer and the lazy rebuild; both run outside any caller
    /// transaction by design.
    pub fn new(pool: Pool<AsyncPgConnection>, client_group_id: ClientGroupId) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (pending, pending_rx) = watch::channel(0usize);
        let cache = Arc::new(Self {
            client_group_id,
            pool: pool.clone(),
            cache: Mutex::new(None),
            flush_tx,
            pending: Arc::new(pending),
            pending_rx,
            last_error: Arc::new(std::sync::Mutex::new(None)),
        });
        tokio::spawn(Self::background_writer(pool, Arc::clone(&cache), flush_rx));
        cache
    }

    /// Resolves the current row record map, rebuilding it from storage on
    /// first use. Waits for pending deferred batches before rebuilding so a
    /// rebuild can never observe rows older than what was applied.
    pub async fn get_row_records(&self) -> Result<RowRecords, CvrError> {
        loop {
            // The wait below must not hold the lock: the background writer
            // takes it in `clear` when a batch fails.
            {
                let mut guard = self.cache.lock().await;
                if let Some(records) = guard.as_ref() {
                    return Ok(Arc::clone(records));
                }
                if !self.has_pending_updates() {
                    if let Some(err) = self.last_error.lock().unwrap().clone() {
                        return Err(err);
                    }
                    let mut conn = self
                        .pool
                        .get()
                        .await
                        .map_err(|err| CvrError::Unexpected(format!("{}", err)))?;
                    let mut map = HashMap::new();
                    for row in RowsRow::all_for_group(&self.client_group_id, &mut conn)
                        .await
                        .map_err(PostgresError::from)
                        .map_err(CvrError::from)?
                    {
                        let (key, record) = row.into_record()?;
                        map.insert(key, record);
                    }
                    let records: RowRecords = Arc::new(map);
                    *guard = Some(Arc::clone(&records));
                    return Ok(records);
                }
            }
            self.flushed().await?;
        }
    }

    /// Merges `updates` into the cached snapshot. With
    /// `synchronously_flushed = false` the batch is additionally queued for
    /// the background writer.
    pub async fn apply(
        &self,
        updates: HashMap<RowKey, CvrRowRecord>,
        new_version: &CvrVersion,
        synchronously_flushed: bool,
    ) {
        {
            let mut guard = self.cache.lock().await;
            if let Some(records) = guard.as_mut() {
                let map = Arc::make_mut(records);
                for (key, record) in &updates {
                    map.insert(key.clone(), record.clone());
                }
            }
        }
        if !synchronously_flushed {
            self.pending.send_modify(|n| *n += 1);
            if self
                .flush_tx
                .send(DeferredFlush { version: new_version.clone(), updates })
                .is_err()
            {
                // only happens during shutdown; the loader waits it out
                error!(
                    client_group = %self.client_group_id,
                    "deferred row flush writer is gone; rows_version stays behind"
                );
            }
        }
    }

    /// Drops the snapshot; the next read rebuilds from storage. Called when
    /// a flush fails and the cache can no longer be trusted.
    pub async fn clear(&self) {
        *self.cache.lock().await = None;
    }

    /// Seeds the snapshot without touching storage.
    #[cfg(test)]
    pub async fn preload(&self, records: HashMap<RowKey, CvrRowRecord>) {
        *self.cache.lock().await = Some(Arc::new(records));
    }

    pub fn has_pending_updates(&self) -> bool {
        *self.pending_rx.borrow() > 0
    }

    /// Resolves once all queued deferred batches have committed or failed,
    /// surfacing the first failure.
    pub async fn flushed(&self) -> Result<(), CvrError> {
        let mut rx = self.pending_rx.clone();
        rx.wait_for(|pending| *pending == 0)
            .await
            .map_err(|_| CvrError::Unexpected("row flush writer terminated".to_string()))?;
        match self.last_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn background_writer(
        pool: Pool<AsyncPgConnection>,
        cache: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<DeferredFlush>,
    ) {
        while let Some(batch) = rx.recv().await {
            let result = Self::flush_deferred(&pool, &cache.client_group_id, &batch).await;
            match result {
                Ok(statements) => debug!(
                    client_group = %cache.client_group_id,
                    version = %batch.version,
                    rows = batch.updates.len(),
                    statements,
                    "deferred row flush committed"
                ),
                Err(err) => {
                    error!(
                        client_group = %cache.client_group_id,
                        version = %batch.version,
                        %err,
                        "deferred row flush failed; dropping cache"
                    );
                    *cache.last_error.lock().unwrap() = Some(err);
                    cache.clear().await;
                }
            }
            cache.pending.send_modify(|n| *n -= 1);
        }
    }

    async fn flush_deferred(
        pool: &Pool<AsyncPgConnection>,
        cg: &ClientGroupId,
        batch: &DeferredFlush,
    ) -> Result<usize, CvrError> {
        let mut conn = pool
            .get()
            .await
            .map_err(|err| CvrError::Unexpected(format!("{}", err)))?;
        let statements = conn
            .transaction::<_, PostgresError, _>(|conn| {
                async move {
                    match execute_row_updates(
                        conn,
                        cg,
                        &batch.version,
                        &batch.updates,
                        RowUpdateMode::Force,
                        0,
                    )
                    .await?
                    {
                        RowsFlushed::Written { statements } => Ok(statements),
                        RowsFlushed::Deferred => unreachable!("force mode never defers"),
                    }
                }
                .scope_boxed()
            })
            .await?;
        Ok(statements)
    }
}

/// Emits the SQL writes for a pending row set plus the `rows_version`
/// advance, or defers when allowed and the set is larger than
/// `deferred_threshold`.
pub(crate) async fn execute_row_updates(
    conn: &mut AsyncPgConnection,
    cg: &ClientGroupId,
    new_version: &CvrVersion,
    updates: &HashMap<RowKey, CvrRowRecord>,
    mode: RowUpdateMode,
    deferred_threshold: usize,
) -> Result<RowsFlushed, PostgresError> {
    if matches!(mode, RowUpdateMode::AllowDefer) && updates.len() > deferred_threshold {
        return Ok(RowsFlushed::Deferred);
    }
    let mut statements = 0;
    let records: Vec<RowsRow> = updates
        .values()
        .map(|record| RowsRow::from_record(cg, record))
        .collect();
    for chunk in pow2_chunks(&records, ROW_BATCH_MAX) {
        diesel::insert_into(rows::table)
            .values(chunk)
            .on_conflict((
                rows::client_group_id,
                rows::row_schema,
                rows::row_table,
                rows::row_key,
            ))
            .do_update()
            .set((
                rows::row_version.eq(excluded(rows::row_version)),
                rows::patch_version.eq(excluded(rows::patch_version)),
                rows::ref_counts.eq(excluded(rows::ref_counts)),
            ))
            .execute(conn)
            .await?;
        statements += 1;
    }
    let version_row =
        RowsVersionRow { client_group_id: cg.clone(), version: new_version.to_string() };
    diesel::insert_into(rows_version::table)
        .values(&version_row)
        .on_conflict(rows_version::client_group_id)
        .do_update()
        .set(rows_version::version.eq(excluded(rows_version::version)))
        .execute(conn)
        .await?;
    statements += 1;
    Ok(RowsFlushed::Written { statements })
}

/// Splits `items` into power-of-two sized chunks no larger than `max`.
fn pow2_chunks<T>(mut items: &[T], max: usize) -> Vec<&[T]> {
    debug_assert!(max.is_power_of_two());
    let mut chunks = Vec::new();
    let mut size = max;
    while !items.is_empty() {
        while size > items.len() && size > 1 {
            size /= 2;
        }
        let (head, tail) = items.split_at(size.min(items.len()));
        chunks.push(head);
        items = tail;
    }
    chunks
}

//! Applies query execution results to a CVR.
//!
//! One updater covers one round of (re)execution at a given state version:
//! `track_queries` records which queries ran or were removed, `received`
//! folds the produced refcount deltas and row contents into the row
//! records, `delete_unreferenced_rows` revokes the references of removed
//! or re-executed queries from rows that received no fresh delta, and
//! `flush` commits the round.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDateTime;
use diesel_async::AsyncPgConnection;
use serde_json::{Map, Value};
use viewsync_core::{
    cvr::{Cvr, CvrRowRecord, RowId, RowKey},
    error::CvrError,
    patch::{CvrPatch, PatchOp, PatchToVersion},
    version::CvrVersion,
    QueryHash,
};

use super::CvrUpdater;
use crate::postgres::{
    key_columns::KeyColumnTracker,
    orm::QueriesRow,
    store::{CvrFlushStats, CvrStore},
};

/// A query the pipeline engine (re)executed this round.
#[derive(Debug, Clone)]
pub struct ExecutedQuery {
    pub hash: QueryHash,
    /// Hash of the server-side transformed form; advances when auth or
    /// permission rewrites change the transformation.
    pub transformation_hash: String,
}

/// Accumulated effect of one round on one row.
#[derive(Debug, Clone, Default)]
pub struct RowUpdate {
    /// Upstream content version tag; absent for refcount-only updates.
    pub version: Option<String>,
    pub contents: Option<Map<String, Value>>,
    /// Signed per-query reference deltas.
    pub ref_counts: BTreeMap<QueryHash, i64>,
}

#[derive(Debug)]
struct LastRowPatch {
    op: PatchOp,
    row_version: Option<String>,
}

pub struct CvrQueryDrivenUpdater<'a> {
    base: CvrUpdater<'a>,
    target_state_version: String,
    state_adopted: bool,
    removed_or_executed: BTreeSet<QueryHash>,
    /// Last patch emitted per row this round, for dedupe. A put is
    /// suppressed only against an identical put; a put following a del is
    /// re-emitted even with an unchanged row version.
    last_patches: HashMap<RowKey, LastRowPatch>,
    key_tracker: Option<KeyColumnTracker>,
}

impl<'a> std::fmt::Debug for CvrQueryDrivenUpdater<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CvrQueryDrivenUpdater").finish_non_exhaustive()
    }
}

impl<'a> CvrQueryDrivenUpdater<'a> {
    /// Starts a round evaluated at `state_version` against
    /// `replica_version`. The state version may never move backwards.
    pub fn new(
        store: &'a mut CvrStore,
        cvr: &Cvr,
        state_version: &str,
        replica_version: &str,
    ) -> Result<Self, CvrError> {
        if *state_version < *cvr.version.state_version {
            return Err(CvrError::InvariantViolation(format!(
                "state version may not move backwards: {} < {}",
                state_version, cvr.version.state_version
            )));
        }
        let mut cvr = cvr.clone();
        cvr.replica_version = Some(replica_version.to_string());
        Ok(Self {
            base: CvrUpdater::new(store, cvr),
            target_state_version: state_version.to_string(),
            state_adopted: false,
            removed_or_executed: BTreeSet::new(),
            last_patches: HashMap::new(),
            key_tracker: None,
        })
    }

    pub fn cvr(&self) -> &Cvr {
        &self.base.cvr
    }

    /// The version this round's changes land at: the target state version,
    /// adopted on first use so an idle round never moves the CVR.
    fn updated_version(&mut self) -> CvrVersion {
        if !self.state_adopted {
            if self.target_state_version > self.base.cvr.version.state_version {
                self.base.cvr.version = CvrVersion::of_state(&self.target_state_version);
            }
            self.state_adopted = true;
        }
        self.base.cvr.version.clone()
    }

    /// Records executed and removed queries.
    ///
    /// An executed query whose transformation hash changed gets a new
    /// transformation version; a query that was merely desired transitions
    /// to "got" and emits a query-put patch. Removed queries are marked
    /// deleted together with their desires and emit a query-del patch.
    pub fn track_queries(
        &mut self,
        executed: &[ExecutedQuery],
        removed: &[QueryHash],
    ) -> Result<Vec<PatchToVersion>, CvrError> {
        let mut patches = Vec::new();
        for exec in executed {
            self.removed_or_executed.insert(exec.hash.clone());
            let query = self.base.cvr.queries.get(&exec.hash).ok_or_else(|| {
                CvrError::InvariantViolation(format!("executed query {} is not known", exec.hash))
            })?;
            let hash_changed =
                query.transformation_hash.as_deref() != Some(exec.transformation_hash.as_str());
            let newly_got = !query.is_internal() && query.patch_version.is_none();
            if !hash_changed && !newly_got {
                continue;
            }
            self.updated_version();
            let version = self.base.ensure_new_version();
            let query = self
                .base
                .cvr
                .queries
                .get_mut(&exec.hash)
                .expect("present above");
            if hash_changed {
                query.transformation_hash = Some(exec.transformation_hash.clone());
                query.transformation_version = Some(version.clone());
            }
            if newly_got {
                query.patch_version = Some(version.clone());
                patches.push(PatchToVersion::new(
                    CvrPatch::query_put(exec.hash.clone()),
                    version.clone(),
                ));
            }
            let row = QueriesRow::from_record(&self.base.cvr.id, query);
            self.base.store.put_query(row);
        }

        for hash in removed {
            self.removed_or_executed.insert(hash.clone());
            let Some(query) = self.base.cvr.queries.remove(hash) else {
                continue;
            };
            self.updated_version();
            let version = self.base.ensure_new_version();
            let mut row = QueriesRow::from_record(&self.base.cvr.id, &query);
            row.deleted = Some(true);
            row.patch_version = Some(version.to_string());
            self.base.store.put_query(row);
            // a reload must never find a live desire on a deleted query
            for client_id in query.client_state.keys() {
                self.base.store.put_desire(crate::postgres::orm::DesiresRow {
                    client_group_id: self.base.cvr.id.clone(),
                    client_id: client_id.clone(),
                    query_hash: hash.clone(),
                    patch_version: version.to_string(),
                    deleted: Some(true),
                    ttl: None,
                    inactivated_at: None,
                });
                if let Some(client) = self.base.cvr.clients.get_mut(client_id) {
                    client.desired_query_ids.remove(hash);
                }
            }
            if query.is_got() {
                patches.push(PatchToVersion::new(
                    CvrPatch::query_del(hash.clone()),
                    version,
                ));
            }
        }
        Ok(patches)
    }

    /// Folds received rows into the pending row set, emitting row patches.
    ///
    /// A row ID may appear multiple times; deltas accumulate against the
    /// in-call stage. The base for a first occurrence is the stored record
    /// minus the refcounts held by removed or executed queries; that
    /// subtraction is how a re-execution revokes its prior references.
    pub async fn received(
        &mut self,
        rows: Vec<(RowId, RowUpdate)>,
    ) -> Result<Vec<PatchToVersion>, CvrError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.base.store.row_records().await?;
        if self.key_tracker.is_none() {
            self.key_tracker = Some(KeyColumnTracker::build(records.values()));
        }
        let to_version = self.updated_version();
        let mut patches = Vec::new();

        for (id, update) in rows {
            let key = id.row_key();
            let staged = self.base.store.staged_row(&key).cloned();
            let existing = records.get(&key);

            // A put for an unknown row may be a known row under renamed key
            // columns; replace the old record and force both patches out.
            let mut forced_put = false;
            if staged.is_none() && existing.is_none() {
                if let Some(contents) = &update.contents {
                    let tracker = self.key_tracker.as_ref().expect("built above");
                    if let Some(old_id) = tracker.lookup_old_id(&id, contents, &records) {
                        let old_key = old_id.row_key();
                        let old_record = records.get(&old_key).expect("tracker hit");
                        self.base.store.stage_row(
                            old_key.clone(),
                            CvrRowRecord {
                                id: old_id.clone(),
                                row_version: old_record.row_version.clone(),
                                patch_version: to_version.clone(),
                                ref_counts: None,
                            },
                        );
                        patches.push(PatchToVersion::new(
                            CvrPatch::row_del(old_id),
                            to_version.clone(),
                        ));
                        self.last_patches
                            .insert(old_key, LastRowPatch { op: PatchOp::Del, row_version: None });
                        forced_put = true;
                    }
                }
            }

            let mut merged = match (&staged, existing) {
                (Some(stage), _) => stage.ref_counts.clone().unwrap_or_default(),
                (None, Some(record)) => {
                    let mut counts = record.ref_counts.clone().unwrap_or_default();
                    counts.retain(|q, _| !self.removed_or_executed.contains(q));
                    counts
                }
                (None, None) => BTreeMap::new(),
            };
            for (query, delta) in &update.ref_counts {
                *merged.entry(query.clone()).or_insert(0) += delta;
            }
            merged.retain(|_, count| *count > 0);
            let merged = (!merged.is_empty()).then_some(merged);

            if merged.is_none() && staged.is_none() && existing.is_none() && !forced_put {
                // added and cancelled within this round: nothing to store,
                // and a del only cancels a put that already went out
                if matches!(
                    self.last_patches.get(&key),
                    Some(LastRowPatch { op: PatchOp::Put, .. })
                ) {
                    patches.push(PatchToVersion::new(
                        CvrPatch::row_del(id),
                        to_version.clone(),
                    ));
                    self.last_patches
                        .insert(key, LastRowPatch { op: PatchOp::Del, row_version: None });
                }
                continue;
            }

            let prev = staged.as_ref().or(existing);
            let row_version = update
                .version
                .clone()
                .or_else(|| prev.map(|p| p.row_version.clone()))
                .unwrap_or_default();
            let (patch_version, emit) = if forced_put {
                (to_version.clone(), Some(PatchOp::Put))
            } else {
                match (&merged, prev) {
                    // still a tombstone: the client's view is unchanged
                    (None, Some(p)) if p.is_tombstone() => (p.patch_version.clone(), None),
                    (None, _) => (to_version.clone(), Some(PatchOp::Del)),
                    (Some(_), None) => (to_version.clone(), Some(PatchOp::Put)),
                    (Some(_), Some(p)) if p.is_tombstone() => {
                        (to_version.clone(), Some(PatchOp::Put))
                    }
                    (Some(_), Some(p)) => {
                        let content_changed = update
                            .version
                            .as_ref()
                            .is_some_and(|v| *v != p.row_version);
                        if content_changed {
                            (to_version.clone(), Some(PatchOp::Put))
                        } else {
                            // refcount-only adjustment keeps the old patch
                            // version; nothing new reaches the client
                            (p.patch_version.clone(), None)
                        }
                    }
                }
            };

            match emit {
                Some(PatchOp::Put) => {
                    let duplicate = matches!(
                        self.last_patches.get(&key),
                        Some(LastRowPatch { op: PatchOp::Put, row_version: Some(last) })
                            if *last == row_version
                    );
                    if !duplicate {
                        patches.push(PatchToVersion::new(
                            CvrPatch::row_put(id.clone(), update.contents.clone().unwrap_or_default()),
                            to_version.clone(),
                        ));
                        self.last_patches.insert(
                            key.clone(),
                            LastRowPatch {
                                op: PatchOp::Put,
                                row_version: Some(row_version.clone()),
                            },
                        );
                    }
                }
                Some(PatchOp::Del) => {
                    let duplicate = matches!(
                        self.last_patches.get(&key),
                        Some(LastRowPatch { op: PatchOp::Del, .. })
                    );
                    if !duplicate {
                        patches.push(PatchToVersion::new(
                            CvrPatch::row_del(id.clone()),
                            to_version.clone(),
                        ));
                        self.last_patches
                            .insert(key.clone(), LastRowPatch { op: PatchOp::Del, row_version: None });
                    }
                }
                None => {}
            }

            let record = CvrRowRecord { id, row_version, patch_version, ref_counts: merged };
            if staged.is_none() && existing == Some(&record) {
                // nothing changed at all; don't stage a rewrite
                continue;
            }
            self.key_tracker
                .as_mut()
                .expect("built above")
                .note(&record.id);
            self.base.store.stage_row(key, record);
        }
        Ok(patches)
    }

    /// Revokes the references of removed and re-executed queries from rows
    /// that received no fresh delta this round. Rows left unreferenced
    /// become tombstones at the new version and emit del patches; rows
    /// with remaining references are rewritten at their old patch version.
    pub async fn delete_unreferenced_rows(&mut self) -> Result<Vec<PatchToVersion>, CvrError> {
        if self.removed_or_executed.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.base.store.row_records().await?;
        let mut patches = Vec::new();
        for (key, record) in records.iter() {
            if self.base.store.staged_row(key).is_some() {
                continue;
            }
            let Some(counts) = &record.ref_counts else {
                continue;
            };
            if !counts
                .keys()
                .any(|q| self.removed_or_executed.contains(q))
            {
                continue;
            }
            let mut remaining = counts.clone();
            remaining.retain(|q, _| !self.removed_or_executed.contains(q));
            if remaining.is_empty() {
                let to_version = self.updated_version();
                self.base.store.stage_row(
                    key.clone(),
                    CvrRowRecord {
                        id: record.id.clone(),
                        row_version: record.row_version.clone(),
                        patch_version: to_version.clone(),
                        ref_counts: None,
                    },
                );
                patches.push(PatchToVersion::new(
                    CvrPatch::row_del(record.id.clone()),
                    to_version,
                ));
                self.last_patches
                    .insert(key.clone(), LastRowPatch { op: PatchOp::Del, row_version: None });
            } else {
                self.base.store.stage_row(
                    key.clone(),
                    CvrRowRecord {
                        id: record.id.clone(),
                        row_version: record.row_version.clone(),
                        patch_version: record.patch_version.clone(),
                        ref_counts: Some(remaining),
                    },
                );
            }
        }
        Ok(patches)
    }

    /// Commits the round; `None` when nothing changed.
    pub async fn flush(
        self,
        conn: &mut AsyncPgConnection,
        last_connect: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Option<(Cvr, CvrFlushStats)>, CvrError> {
        self.base.flush(conn, last_connect, now).await
    }
}

#[cfg(test)]
mod test {
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use viewsync_core::cvr::{ClientQueryState, ClientRecord, QueryDef, QueryRecord};

    use super::*;
    use crate::postgres::{store::PendingWrite, testing};

    fn new_store() -> CvrStore {
        CvrStore::new(testing::lazy_pool(), "g1", "task-1")
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn issues_row(id: &str) -> RowId {
        RowId::new("public", "issues", obj(json!({ "id": id })))
    }

    fn record(
        id: RowId,
        row_version: &str,
        patch_version: &str,
        ref_counts: Option<BTreeMap<QueryHash, i64>>,
    ) -> CvrRowRecord {
        CvrRowRecord {
            id,
            row_version: row_version.to_string(),
            patch_version: patch_version.parse().unwrap(),
            ref_counts,
        }
    }

    /// CVR at `1a9:01` with client `c1` desiring the not-yet-got query `q1`.
    fn base_cvr() -> Cvr {
        let mut cvr = Cvr::new("g1");
        cvr.version = "1a9:01".parse().unwrap();
        cvr.clients.insert(
            "c1".to_string(),
            ClientRecord { desired_query_ids: ["q1".to_string()].into() },
        );
        cvr.queries.insert(
            "q1".to_string(),
            QueryRecord {
                hash: "q1".to_string(),
                def: QueryDef::Ast(json!({"table": "issues"})),
                patch_version: None,
                transformation_hash: None,
                transformation_version: None,
                client_state: [(
                    "c1".to_string(),
                    ClientQueryState {
                        version: "1a9:01".parse().unwrap(),
                        inactivated_at: None,
                        ttl_ms: -1,
                    },
                )]
                .into(),
            },
        );
        cvr
    }

    fn executed(hash: &str, transformation_hash: &str) -> ExecutedQuery {
        ExecutedQuery {
            hash: hash.to_string(),
            transformation_hash: transformation_hash.to_string(),
        }
    }

    async fn preloaded(store: &CvrStore, records: Vec<CvrRowRecord>) {
        store
            .preload_row_records(records.into_iter().map(|r| (r.id.row_key(), r)).collect())
            .await;
    }

    #[tokio::test]
    async fn desired_query_transitions_to_got() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();

        let patches = updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();
        assert_eq!(
            patches,
            vec![PatchToVersion::new(
                CvrPatch::query_put("q1"),
                "1aa:01".parse().unwrap()
            )]
        );

        let contents = obj(json!({"id": "1"}));
        let patches = updater
            .received(vec![(
                issues_row("1"),
                RowUpdate {
                    version: Some("03".to_string()),
                    contents: Some(contents.clone()),
                    ref_counts: btreemap! {"q1".to_string() => 1},
                },
            )])
            .await
            .unwrap();
        assert_eq!(
            patches,
            vec![PatchToVersion::new(
                CvrPatch::row_put(issues_row("1"), contents),
                "1aa:01".parse().unwrap()
            )]
        );

        assert!(updater.delete_unreferenced_rows().await.unwrap().is_empty());

        let query = &updater.cvr().queries["q1"];
        assert_eq!(query.patch_version.as_ref().unwrap().to_string(), "1aa:01");
        assert_eq!(query.transformation_hash.as_deref(), Some("h1"));
        assert_eq!(
            query.transformation_version.as_ref().unwrap().to_string(),
            "1aa:01"
        );
        let staged = store.pending_row_map();
        assert_eq!(
            staged[&issues_row("1").row_key()],
            record(
                issues_row("1"),
                "03",
                "1aa:01",
                Some(btreemap! {"q1".to_string() => 1})
            )
        );
    }

    #[tokio::test]
    async fn transformation_hash_change_tombstones_dropped_rows() {
        let mut store = new_store();
        preloaded(
            &store,
            vec![record(
                issues_row("1"),
                "03",
                "1a8",
                Some(btreemap! {"q1".to_string() => 1}),
            )],
        )
        .await;
        let mut cvr = base_cvr();
        {
            let q1 = cvr.queries.get_mut("q1").unwrap();
            q1.patch_version = Some("1a8".parse().unwrap());
            q1.transformation_hash = Some("h1".to_string());
            q1.transformation_version = Some("1a8".parse().unwrap());
        }
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();

        // rerun with a new transformation; it no longer produces the row
        let patches = updater
            .track_queries(&[executed("q1", "h2")], &[])
            .unwrap();
        assert!(patches.is_empty()); // already got; only the transformation moved
        assert_eq!(
            updater.cvr().queries["q1"]
                .transformation_version
                .as_ref()
                .unwrap()
                .to_string(),
            "1aa:01"
        );

        let patches = updater.delete_unreferenced_rows().await.unwrap();
        assert_eq!(
            patches,
            vec![PatchToVersion::new(
                CvrPatch::row_del(issues_row("1")),
                "1aa:01".parse().unwrap()
            )]
        );
        let staged = &store.pending_row_map()[&issues_row("1").row_key()];
        assert!(staged.is_tombstone());
        assert_eq!(staged.patch_version.to_string(), "1aa:01");
    }

    #[tokio::test]
    async fn removed_query_is_marked_deleted_with_its_desires() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let mut cvr = base_cvr();
        cvr.queries.get_mut("q1").unwrap().patch_version = Some("1a8".parse().unwrap());

        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        let patches = updater
            .track_queries(&[], &["q1".to_string()])
            .unwrap();
        assert_eq!(
            patches,
            vec![PatchToVersion::new(
                CvrPatch::query_del("q1"),
                "1aa:01".parse().unwrap()
            )]
        );
        assert!(!updater.cvr().queries.contains_key("q1"));
        assert!(updater.cvr().clients["c1"].desired_query_ids.is_empty());

        let mut deleted_queries = 0;
        let mut deleted_desires = 0;
        for write in store.pending_writes() {
            match write {
                PendingWrite::Query(row) if row.deleted == Some(true) => deleted_queries += 1,
                PendingWrite::Desire(row) if row.deleted == Some(true) => deleted_desires += 1,
                other => panic!("unexpected write {other:?}"),
            }
        }
        assert_eq!((deleted_queries, deleted_desires), (1, 1));
    }

    #[tokio::test]
    async fn row_key_rename_replaces_the_old_record() {
        let mut store = new_store();
        preloaded(
            &store,
            vec![record(
                issues_row("1"),
                "03",
                "1a8",
                Some(btreemap! {"q1".to_string() => 1}),
            )],
        )
        .await;
        let mut cvr = base_cvr();
        cvr.queries.get_mut("q1").unwrap().patch_version = Some("1a8".parse().unwrap());
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h2")], &[])
            .unwrap();

        let new_id = RowId::new("public", "issues", obj(json!({"new_id": "1foo"})));
        let contents = obj(json!({"id": "1", "new_id": "1foo", "value": "foobar"}));
        let patches = updater
            .received(vec![(
                new_id.clone(),
                RowUpdate {
                    version: Some("04".to_string()),
                    contents: Some(contents.clone()),
                    ref_counts: btreemap! {"q1".to_string() => 1},
                },
            )])
            .await
            .unwrap();
        assert_eq!(
            patches,
            vec![
                PatchToVersion::new(CvrPatch::row_del(issues_row("1")), "1aa:01".parse().unwrap()),
                PatchToVersion::new(
                    CvrPatch::row_put(new_id.clone(), contents),
                    "1aa:01".parse().unwrap()
                ),
            ]
        );

        // the replaced row no longer counts as unreferenced
        assert!(updater.delete_unreferenced_rows().await.unwrap().is_empty());

        let staged = store.pending_row_map();
        assert!(staged[&issues_row("1").row_key()].is_tombstone());
        assert_eq!(
            staged[&new_id.row_key()].ref_counts,
            Some(btreemap! {"q1".to_string() => 1})
        );
    }

    #[tokio::test]
    async fn deltas_accumulate_within_a_round() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();

        let contents = obj(json!({"id": "1"}));
        let patches = updater
            .received(vec![
                (
                    issues_row("1"),
                    RowUpdate {
                        version: Some("03".to_string()),
                        contents: Some(contents.clone()),
                        ref_counts: btreemap! {"q1".to_string() => 1},
                    },
                ),
                (
                    issues_row("1"),
                    RowUpdate {
                        version: None,
                        contents: None,
                        ref_counts: btreemap! {"q1".to_string() => 1},
                    },
                ),
            ])
            .await
            .unwrap();
        // the second occurrence only adjusts refcounts; one patch suffices
        assert_eq!(patches.len(), 1);
        assert_eq!(
            store.pending_row_map()[&issues_row("1").row_key()].ref_counts,
            Some(btreemap! {"q1".to_string() => 2})
        );
    }

    #[tokio::test]
    async fn add_then_cancel_within_a_round_overrides_the_put() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();

        let patches = updater
            .received(vec![
                (
                    issues_row("1"),
                    RowUpdate {
                        version: Some("03".to_string()),
                        contents: Some(obj(json!({"id": "1"}))),
                        ref_counts: btreemap! {"q1".to_string() => 1},
                    },
                ),
                (
                    issues_row("1"),
                    RowUpdate {
                        version: None,
                        contents: None,
                        ref_counts: btreemap! {"q1".to_string() => -1},
                    },
                ),
            ])
            .await
            .unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].patch.op(), PatchOp::Put);
        assert_eq!(patches[1].patch, CvrPatch::row_del(issues_row("1")));
        assert!(store.pending_row_map()[&issues_row("1").row_key()].is_tombstone());
    }

    #[tokio::test]
    async fn a_put_after_a_del_is_reemitted_even_with_the_same_row_version() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();

        let contents = obj(json!({"id": "1"}));
        let add = |contents: &Map<String, Value>| RowUpdate {
            version: Some("03".to_string()),
            contents: Some(contents.clone()),
            ref_counts: btreemap! {"q1".to_string() => 1},
        };
        let patches = updater
            .received(vec![
                (issues_row("1"), add(&contents)),
                (
                    issues_row("1"),
                    RowUpdate {
                        version: None,
                        contents: None,
                        ref_counts: btreemap! {"q1".to_string() => -1},
                    },
                ),
                (issues_row("1"), add(&contents)),
            ])
            .await
            .unwrap();
        let ops: Vec<PatchOp> = patches.iter().map(|p| p.patch.op()).collect();
        assert_eq!(ops, vec![PatchOp::Put, PatchOp::Del, PatchOp::Put]);
        assert_eq!(
            store.pending_row_map()[&issues_row("1").row_key()].ref_counts,
            Some(btreemap! {"q1".to_string() => 1})
        );
    }

    #[tokio::test]
    async fn delete_of_a_never_added_row_is_suppressed() {
        let mut store = new_store();
        preloaded(&store, vec![]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();

        let patches = updater
            .received(vec![(
                issues_row("9"),
                RowUpdate {
                    version: None,
                    contents: None,
                    ref_counts: btreemap! {"q1".to_string() => -1},
                },
            )])
            .await
            .unwrap();
        assert!(patches.is_empty());
        assert!(store.pending_row_map().is_empty());
    }

    #[tokio::test]
    async fn reexecution_revokes_prior_references_before_applying_deltas() {
        let mut store = new_store();
        preloaded(
            &store,
            vec![record(
                issues_row("1"),
                "03",
                "1a8",
                Some(btreemap! {"q1".to_string() => 2, "q2".to_string() => 1}),
            )],
        )
        .await;
        let mut cvr = base_cvr();
        {
            let q1 = cvr.queries.get_mut("q1").unwrap();
            q1.patch_version = Some("1a8".parse().unwrap());
            q1.transformation_hash = Some("h1".to_string());
        }
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[executed("q1", "h1")], &[])
            .unwrap();

        // re-execution emits the row once; the old count of 2 must not leak
        let patches = updater
            .received(vec![(
                issues_row("1"),
                RowUpdate {
                    version: Some("03".to_string()),
                    contents: None,
                    ref_counts: btreemap! {"q1".to_string() => 1},
                },
            )])
            .await
            .unwrap();
        // contents unchanged: the client sees nothing
        assert!(patches.is_empty());
        let staged = &store.pending_row_map()[&issues_row("1").row_key()];
        assert_eq!(
            staged.ref_counts,
            Some(btreemap! {"q1".to_string() => 1, "q2".to_string() => 1})
        );
        // the client-visible patch version is untouched
        assert_eq!(staged.patch_version.to_string(), "1a8");
    }

    #[tokio::test]
    async fn unreferenced_rows_keep_their_patch_version_when_references_remain() {
        let mut store = new_store();
        preloaded(
            &store,
            vec![
                record(
                    issues_row("1"),
                    "03",
                    "1a8",
                    Some(btreemap! {"q1".to_string() => 1, "q2".to_string() => 1}),
                ),
                record(
                    issues_row("2"),
                    "05",
                    "1a8",
                    Some(btreemap! {"q2".to_string() => 1}),
                ),
            ],
        )
        .await;
        let mut cvr = base_cvr();
        cvr.queries.get_mut("q1").unwrap().patch_version = Some("1a8".parse().unwrap());
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();
        updater
            .track_queries(&[], &["q1".to_string()])
            .unwrap();

        let patches = updater.delete_unreferenced_rows().await.unwrap();
        assert!(patches.is_empty());
        let staged = store.pending_row_map();
        // row 1 lost q1 but keeps q2, at its old patch version
        assert_eq!(
            staged[&issues_row("1").row_key()].ref_counts,
            Some(btreemap! {"q2".to_string() => 1})
        );
        assert_eq!(staged[&issues_row("1").row_key()].patch_version.to_string(), "1a8");
        // row 2 references no removed query and is untouched
        assert!(!staged.contains_key(&issues_row("2").row_key()));
    }

    #[tokio::test]
    async fn state_version_may_not_move_backwards() {
        let mut store = new_store();
        let mut cvr = base_cvr();
        cvr.version = "1aa".parse().unwrap();
        let err = CvrQueryDrivenUpdater::new(&mut store, &cvr, "1a9", "r1").unwrap_err();
        assert!(matches!(err, CvrError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn unchanged_rows_are_not_rewritten() {
        let mut store = new_store();
        let existing = record(
            issues_row("1"),
            "03",
            "1a8",
            Some(btreemap! {"q2".to_string() => 1}),
        );
        preloaded(&store, vec![existing]).await;
        let cvr = base_cvr();
        let mut updater =
            CvrQueryDrivenUpdater::new(&mut store, &cvr, "1aa", "r1").unwrap();

        let patches = updater
            .received(vec![(
                issues_row("1"),
                RowUpdate {
                    version: Some("03".to_string()),
                    contents: None,
                    ref_counts: btreemap! {"q2".to_string() => 0},
                },
            )])
            .await
            .unwrap();
        assert!(patches.is_empty());
        assert!(store.pending_row_map().is_empty());
    }
}

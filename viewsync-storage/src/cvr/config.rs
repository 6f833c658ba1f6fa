//! Applies client connection and desired-query changes to a CVR.

use chrono::NaiveDateTime;
use diesel_async::AsyncPgConnection;
use serde_json::Value;
use viewsync_core::{
    cvr::{
        normalize_ttl, ClientQueryState, ClientRecord, Cvr, InactiveQuery, QueryDef, QueryRecord,
        TtlMs, LMIDS_QUERY_HASH,
    },
    error::CvrError,
    patch::{CvrPatch, PatchToVersion},
    QueryHash,
};

use super::CvrUpdater;
use crate::postgres::{
    orm::{ttl_to_interval, ClientsRow, DesiresRow, QueriesRow},
    store::{CvrFlushStats, CvrStore},
};

/// One entry of a client's `putDesiredQueries` request.
#[derive(Debug, Clone)]
pub struct DesiredQuery {
    pub hash: QueryHash,
    pub ast: Option<Value>,
    pub name: Option<String>,
    pub args: Option<Value>,
    pub ttl_ms: Option<TtlMs>,
}

/// Mutates a CVR in response to client messages: connections, schema
/// pinning, desired-query puts and removals, and client/group deletion.
pub struct CvrConfigDrivenUpdater<'a> {
    base: CvrUpdater<'a>,
}

impl<'a> CvrConfigDrivenUpdater<'a> {
    pub fn new(store: &'a mut CvrStore, cvr: &Cvr) -> Self {
        Self { base: CvrUpdater::new(store, cvr.clone()) }
    }

    pub fn cvr(&self) -> &Cvr {
        &self.base.cvr
    }

    /// Inserts the client if it is new; the first client of a group also
    /// installs the internal last-mutation-ID query.
    pub fn ensure_client(&mut self, client_id: &str) -> Vec<PatchToVersion> {
        if self.base.cvr.clients.contains_key(client_id) {
            return Vec::new();
        }
        let version = self.base.ensure_new_version();
        let first_client = self.base.cvr.clients.is_empty();
        self.base
            .cvr
            .clients
            .insert(client_id.to_string(), ClientRecord::default());
        self.base
            .store
            .put_client(ClientsRow::new(&self.base.cvr.id, client_id));
        if first_client {
            let lmids = QueryRecord::internal(LMIDS_QUERY_HASH, version.clone());
            self.base
                .store
                .put_query(QueriesRow::from_record(&self.base.cvr.id, &lmids));
            self.base
                .cvr
                .queries
                .insert(LMIDS_QUERY_HASH.to_string(), lmids);
        }
        vec![PatchToVersion::new(CvrPatch::client_put(client_id), version)]
    }

    /// Pins the group's client schema. Succeeds when none is stored yet or
    /// the given one is deep-equal to it; clients with different schemas
    /// may not share a CVR.
    pub fn set_client_schema(&mut self, schema: &Value) -> Result<(), CvrError> {
        match &self.base.cvr.client_schema {
            Some(existing) if existing == schema => Ok(()),
            Some(_) => Err(CvrError::InvalidConnectionRequest(
                "clientSchema differs from the schema of this client group".to_string(),
            )),
            None => {
                self.base.ensure_new_version();
                self.base.cvr.client_schema = Some(schema.clone());
                Ok(())
            }
        }
    }

    /// Adds or refreshes the client's desires. A desire is (re)put when the
    /// client has no live desire for the query or the new TTL outlasts the
    /// stored one; put patches are only emitted for newly added or
    /// reactivated desires.
    pub fn put_desired_queries(
        &mut self,
        client_id: &str,
        queries: &[DesiredQuery],
    ) -> Result<Vec<PatchToVersion>, CvrError> {
        if !self.base.cvr.clients.contains_key(client_id) {
            return Err(CvrError::InvariantViolation(format!(
                "putDesiredQueries for unknown client {client_id}"
            )));
        }
        let mut patches = Vec::new();
        for desired in queries {
            let ttl_ms = normalize_ttl(desired.ttl_ms);
            if !self.base.cvr.queries.contains_key(&desired.hash) {
                let record = new_client_query(desired)?;
                self.base
                    .store
                    .put_query(QueriesRow::from_record(&self.base.cvr.id, &record));
                self.base
                    .cvr
                    .queries
                    .insert(desired.hash.clone(), record);
            }
            let state = self.base.cvr.queries[&desired.hash]
                .client_state
                .get(client_id);
            let newly_desired = match state {
                Some(state) if state.inactivated_at.is_none() => {
                    if !ttl_extends(ttl_ms, state.ttl_ms) {
                        continue;
                    }
                    false
                }
                Some(_) => true, // reactivation
                None => true,
            };
            let version = self.base.ensure_new_version();
            let query = self
                .base
                .cvr
                .queries
                .get_mut(&desired.hash)
                .expect("inserted above");
            query.client_state.insert(
                client_id.to_string(),
                ClientQueryState { version: version.clone(), inactivated_at: None, ttl_ms },
            );
            self.base
                .cvr
                .clients
                .get_mut(client_id)
                .expect("checked above")
                .desired_query_ids
                .insert(desired.hash.clone());
            self.base.store.put_desire(DesiresRow {
                client_group_id: self.base.cvr.id.clone(),
                client_id: client_id.to_string(),
                query_hash: desired.hash.clone(),
                patch_version: version.to_string(),
                deleted: Some(false),
                ttl: ttl_to_interval(ttl_ms),
                inactivated_at: None,
            });
            if newly_desired {
                patches.push(PatchToVersion::new(
                    CvrPatch::desire_put(desired.hash.clone(), client_id),
                    version,
                ));
            }
        }
        Ok(patches)
    }

    /// Hard-removes the client's desires for the given queries.
    pub fn delete_desired_queries(
        &mut self,
        client_id: &str,
        hashes: &[QueryHash],
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        for hash in hashes {
            patches.extend(self.delete_desire(client_id, hash));
        }
        patches
    }

    /// Marks the client's desires inactive instead of removing them,
    /// preserving the TTL so the query can be evicted once it elapses.
    /// Emits no patches; inactivation happens when the client is gone.
    pub fn mark_desired_queries_as_inactive(
        &mut self,
        client_id: &str,
        hashes: &[QueryHash],
        now: NaiveDateTime,
    ) {
        for hash in hashes {
            let Some(query) = self.base.cvr.queries.get(hash) else {
                continue;
            };
            if !query.client_state.contains_key(client_id) {
                continue;
            }
            let version = self.base.ensure_new_version();
            let query = self
                .base
                .cvr
                .queries
                .get_mut(hash)
                .expect("present above");
            let state = query
                .client_state
                .get_mut(client_id)
                .expect("present above");
            state.inactivated_at = Some(now);
            state.version = version.clone();
            let ttl_ms = state.ttl_ms;
            self.base.store.put_desire(DesiresRow {
                client_group_id: self.base.cvr.id.clone(),
                client_id: client_id.to_string(),
                query_hash: hash.clone(),
                patch_version: version.to_string(),
                deleted: Some(false),
                ttl: ttl_to_interval(ttl_ms),
                inactivated_at: Some(now),
            });
        }
    }

    /// Hard-removes all of the client's desires.
    pub fn clear_desired_queries(&mut self, client_id: &str) -> Vec<PatchToVersion> {
        let hashes: Vec<QueryHash> = self
            .base
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.delete_desired_queries(client_id, &hashes)
    }

    /// Removes the client, leaving its desires inactive on the query
    /// records so their TTLs keep driving eviction.
    pub fn delete_client(&mut self, client_id: &str, now: NaiveDateTime) {
        let hashes: Vec<QueryHash> = self
            .base
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.mark_desired_queries_as_inactive(client_id, &hashes, now);
        if self.base.cvr.clients.remove(client_id).is_some() {
            self.base.ensure_new_version();
        }
        self.base.store.delete_client(client_id);
    }

    /// Schedules the cascade deletion of the whole client group.
    pub fn delete_client_group(&mut self) {
        self.base.cvr.clients.clear();
        self.base.cvr.queries.clear();
        self.base.store.delete_client_group();
    }

    /// Queries eligible for TTL-based eviction, oldest expiry first.
    pub fn get_inactive_queries(&self) -> Vec<InactiveQuery> {
        self.base.cvr.inactive_queries()
    }

    pub async fn flush(
        self,
        conn: &mut AsyncPgConnection,
        last_connect: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Option<(Cvr, CvrFlushStats)>, CvrError> {
        self.base.flush(conn, last_connect, now).await
    }

    fn delete_desire(&mut self, client_id: &str, hash: &QueryHash) -> Option<PatchToVersion> {
        let query = self.base.cvr.queries.get_mut(hash)?;
        query.client_state.remove(client_id)?;
        let version = self.base.ensure_new_version();
        if let Some(client) = self.base.cvr.clients.get_mut(client_id) {
            client.desired_query_ids.remove(hash);
        }
        self.base.store.put_desire(DesiresRow {
            client_group_id: self.base.cvr.id.clone(),
            client_id: client_id.to_string(),
            query_hash: hash.clone(),
            patch_version: version.to_string(),
            deleted: Some(true),
            ttl: None,
            inactivated_at: None,
        });
        Some(PatchToVersion::new(
            CvrPatch::desire_del(hash.clone(), client_id),
            version,
        ))
    }
}

fn new_client_query(desired: &DesiredQuery) -> Result<QueryRecord, CvrError> {
    let def = if let Some(ast) = &desired.ast {
        QueryDef::Ast(ast.clone())
    } else if let Some(name) = &desired.name {
        QueryDef::Custom {
            name: name.clone(),
            args: desired.args.clone().unwrap_or(Value::Null),
        }
    } else {
        return Err(CvrError::InvalidConnectionRequest(format!(
            "desired query {} carries neither an AST nor a name",
            desired.hash
        )));
    };
    Ok(QueryRecord {
        hash: desired.hash.clone(),
        def,
        patch_version: None,
        transformation_hash: None,
        transformation_version: None,
        client_state: Default::default(),
    })
}

/// `-1` ("no expiration") outlasts any finite TTL.
fn ttl_extends(new_ttl: TtlMs, old_ttl: TtlMs) -> bool {
    match (new_ttl < 0, old_ttl < 0) {
        (_, true) => false,
        (true, false) => true,
        (false, false) => new_ttl > old_ttl,
    }
}

//! The in-memory Client View Record model.
//!
//! A CVR snapshot is the authoritative answer to "what does each client of
//! this group currently hold, and what does it want". Updaters work on a
//! mutable copy of a loaded snapshot and commit it through the store; the
//! model here carries no database concerns.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{version::CvrVersion, ClientGroupId, ClientId, QueryHash};

/// Reserved hash of the internal query delivering per-client last-mutation
/// IDs. Installed once per client group and never tracked per-client.
pub const LMIDS_QUERY_HASH: &str = "lmids";

/// A TTL in milliseconds; negative values mean "no expiration".
pub type TtlMs = i64;

/// Clamps a client-provided TTL.
///
/// `0` is indistinguishable from "no expiration": clients that predate TTLs
/// send `0`, and evicting their queries immediately would churn the CVR.
pub fn normalize_ttl(ttl: Option<TtlMs>) -> TtlMs {
    match ttl {
        Some(ttl) if ttl > 0 => ttl,
        _ => -1,
    }
}

/// Identifies a row in the upstream schema, carrying the original key form.
///
/// Equality and map lookups must go through [`RowId::row_key`]: the
/// comparison key serializes the key columns in alphabetical order, while
/// this struct retains whatever column order the producer used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowId {
    pub schema: String,
    pub table: String,
    pub key: Map<String, Value>,
}

impl RowId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, key: Map<String, Value>) -> Self {
        Self { schema: schema.into(), table: table.into(), key }
    }

    /// The canonicalized lookup key for this row.
    pub fn row_key(&self) -> RowKey {
        RowKey {
            schema: self.schema.clone(),
            table: self.table.clone(),
            key_json: canonical_key_string(&self.key),
        }
    }

    /// The names of the key columns.
    pub fn key_columns(&self) -> BTreeSet<String> {
        self.key.keys().cloned().collect()
    }
}

/// Canonical JSON of a row key: columns serialized in alphabetical order.
pub fn canonical_key_string(key: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = key.iter().collect();
    serde_json::to_string(&sorted).expect("row keys are JSON objects")
}

/// Canonicalized row identity, usable as a map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub schema: String,
    pub table: String,
    pub key_json: String,
}

/// Per-row bookkeeping: which queries reference the row and at which CVR
/// version the client's view of it last changed.
///
/// `ref_counts = None` is a tombstone: the row was synced once and has since
/// been deleted; the record is retained so catching-up clients receive the
/// delete. A present map never contains non-positive counts.
#[derive(Clone, Debug, PartialEq)]
pub struct CvrRowRecord {
    pub id: RowId,
    pub row_version: String,
    pub patch_version: CvrVersion,
    pub ref_counts: Option<BTreeMap<QueryHash, i64>>,
}

impl CvrRowRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }

    /// True if every reference on this row comes from one of `queries`.
    pub fn only_referenced_by(&self, queries: &BTreeSet<QueryHash>) -> bool {
        match &self.ref_counts {
            Some(counts) => counts.keys().all(|q| queries.contains(q)),
            None => false,
        }
    }
}

/// What one client of the group has subscribed to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientRecord {
    pub desired_query_ids: BTreeSet<QueryHash>,
}

/// The definition side of a query record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryDef {
    /// Reserved internal query (currently only [`LMIDS_QUERY_HASH`]).
    Internal,
    /// A client query identified by the hash of its AST.
    Ast(Value),
    /// A named custom query with its arguments.
    Custom { name: String, args: Value },
}

/// Per-(query, client) desire state.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientQueryState {
    /// CVR version at which the desire was last put or refreshed.
    pub version: CvrVersion,
    /// Set when the client stopped desiring the query; cleared on re-desire.
    pub inactivated_at: Option<NaiveDateTime>,
    pub ttl_ms: TtlMs,
}

impl ClientQueryState {
    /// Epoch milliseconds at which this desire expires, `None` = never.
    /// Only meaningful once `inactivated_at` is set.
    fn expires_at_ms(&self) -> Option<i64> {
        if self.ttl_ms < 0 {
            return None;
        }
        self.inactivated_at
            .map(|at| at.and_utc().timestamp_millis() + self.ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryRecord {
    pub hash: QueryHash,
    pub def: QueryDef,
    /// Version at which the query transitioned to "got"; `None` while it is
    /// merely desired.
    pub patch_version: Option<CvrVersion>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
    /// Desire state per client. Always empty for internal queries.
    pub client_state: BTreeMap<ClientId, ClientQueryState>,
}

impl QueryRecord {
    pub fn internal(hash: impl Into<QueryHash>, got_at: CvrVersion) -> Self {
        Self {
            hash: hash.into(),
            def: QueryDef::Internal,
            patch_version: Some(got_at),
            transformation_hash: None,
            transformation_version: None,
            client_state: BTreeMap::new(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.def, QueryDef::Internal)
    }

    pub fn is_got(&self) -> bool {
        self.patch_version.is_some()
    }
}

/// A query eligible for TTL-based eviction.
#[derive(Clone, Debug, PartialEq)]
pub struct InactiveQuery {
    pub hash: QueryHash,
    pub inactivated_at: Option<NaiveDateTime>,
    pub ttl_ms: TtlMs,
}

/// One client group's CVR snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Cvr {
    pub id: ClientGroupId,
    pub version: CvrVersion,
    pub last_active: NaiveDateTime,
    /// Identifier of the upstream replica snapshot this CVR was built from.
    pub replica_version: Option<String>,
    /// Frozen schema descriptor shared by all clients of the group.
    pub client_schema: Option<Value>,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
}

impl Cvr {
    /// A zero-valued CVR for a group that has never synced.
    pub fn new(id: impl Into<ClientGroupId>) -> Self {
        Self {
            id: id.into(),
            version: CvrVersion::empty(),
            last_active: NaiveDateTime::default(),
            replica_version: None,
            client_schema: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
        }
    }

    /// Queries no connected client desires anymore, ordered by expire time
    /// (earliest first, "no expiration" entries last).
    ///
    /// A query qualifies once every desiring client has inactivated it; a
    /// query left with no desiring clients at all qualifies immediately.
    /// When several clients inactivated the same query, the entry reports
    /// the *latest* expire among them, since the query must stay alive as
    /// long as any client may still come back for it.
    pub fn inactive_queries(&self) -> Vec<InactiveQuery> {
        let mut out: Vec<InactiveQuery> = Vec::new();
        for query in self.queries.values() {
            if query.is_internal() {
                continue;
            }
            if query
                .client_state
                .values()
                .any(|s| s.inactivated_at.is_none())
            {
                continue;
            }
            let latest = query
                .client_state
                .values()
                .max_by_key(|s| sort_key(s.expires_at_ms()));
            out.push(match latest {
                Some(state) => InactiveQuery {
                    hash: query.hash.clone(),
                    inactivated_at: state.inactivated_at,
                    ttl_ms: state.ttl_ms,
                },
                // Orphaned by client deletion: evictable right away.
                None => InactiveQuery { hash: query.hash.clone(), inactivated_at: None, ttl_ms: 0 },
            });
        }
        out.sort_by_key(|q| {
            let expires = match q.inactivated_at {
                Some(at) if q.ttl_ms >= 0 => Some(at.and_utc().timestamp_millis() + q.ttl_ms),
                Some(_) => None,
                None => Some(i64::MIN),
            };
            (sort_key(expires), q.hash.clone())
        });
        out
    }
}

// "never expires" sorts after any finite expiry
fn sort_key(expires_at_ms: Option<i64>) -> (bool, i64) {
    match expires_at_ms {
        Some(ms) => (false, ms),
        None => (true, 0),
    }
}

#[cfg(test)]
mod test {
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn ms(epoch_ms: i64) -> NaiveDateTime {
        DateTime::from_timestamp_millis(epoch_ms)
            .unwrap()
            .naive_utc()
    }

    fn key(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn row_key_is_column_order_insensitive() {
        let a = RowId::new("public", "issues", key(json!({"id": "1", "org": "a"})));
        let b = RowId::new("public", "issues", key(json!({"org": "a", "id": "1"})));
        assert_eq!(a.row_key(), b.row_key());
        assert_eq!(a.row_key().key_json, r#"{"id":"1","org":"a"}"#);
        // the original form survives
        assert_eq!(b.key.keys().next().unwrap(), "org");
    }

    #[test]
    fn row_key_distinguishes_tables() {
        let a = RowId::new("public", "issues", key(json!({"id": "1"})));
        let b = RowId::new("public", "comments", key(json!({"id": "1"})));
        assert_ne!(a.row_key(), b.row_key());
    }

    #[rstest]
    #[case(None, -1)]
    #[case(Some(0), -1)]
    #[case(Some(-100), -1)]
    #[case(Some(10_000), 10_000)]
    fn ttl_normalization(#[case] ttl: Option<TtlMs>, #[case] expected: TtlMs) {
        assert_eq!(normalize_ttl(ttl), expected);
    }

    fn inactive_state(at: Option<i64>, ttl_ms: TtlMs) -> ClientQueryState {
        ClientQueryState {
            version: "1a0".parse().unwrap(),
            inactivated_at: at.map(ms),
            ttl_ms,
        }
    }

    fn query_with_state(
        hash: &str,
        states: Vec<(&str, ClientQueryState)>,
    ) -> (QueryHash, QueryRecord) {
        (
            hash.to_string(),
            QueryRecord {
                hash: hash.to_string(),
                def: QueryDef::Ast(json!({"table": hash})),
                patch_version: None,
                transformation_hash: None,
                transformation_version: None,
                client_state: states
                    .into_iter()
                    .map(|(c, s)| (c.to_string(), s))
                    .collect(),
            },
        )
    }

    #[test]
    fn inactive_queries_ordered_by_expiry() {
        let mut cvr = Cvr::new("g1");
        cvr.queries.extend([
            // expires at 1_000 + 500
            query_with_state("q-mid", vec![("c1", inactive_state(Some(1_000), 500))]),
            // still desired by c2
            query_with_state(
                "q-active",
                vec![
                    ("c1", inactive_state(Some(0), 10)),
                    ("c2", inactive_state(None, 10)),
                ],
            ),
            // never expires
            query_with_state("q-forever", vec![("c1", inactive_state(Some(0), -1))]),
            // expires at 100 + 10
            query_with_state("q-early", vec![("c1", inactive_state(Some(100), 10))]),
            // no desiring clients left at all
            query_with_state("q-orphan", vec![]),
        ]);
        cvr.queries
            .insert(LMIDS_QUERY_HASH.to_string(), QueryRecord::internal(LMIDS_QUERY_HASH, CvrVersion::empty()));

        let inactive = cvr.inactive_queries();
        let hashes: Vec<&str> = inactive.iter().map(|q| q.hash.as_str()).collect();
        assert_eq!(hashes, vec!["q-orphan", "q-early", "q-mid", "q-forever"]);
    }

    #[test]
    fn inactive_query_reports_latest_expire_among_clients() {
        let mut cvr = Cvr::new("g1");
        cvr.queries.extend([query_with_state(
            "q",
            vec![
                ("c1", inactive_state(Some(100), 10)),
                ("c2", inactive_state(Some(100), 5_000)),
                ("c3", inactive_state(Some(50), 20)),
            ],
        )]);
        let inactive = cvr.inactive_queries();
        assert_eq!(
            inactive,
            vec![InactiveQuery {
                hash: "q".to_string(),
                inactivated_at: Some(ms(100)),
                ttl_ms: 5_000,
            }]
        );
    }

    #[test]
    fn no_expiration_wins_among_clients() {
        let mut cvr = Cvr::new("g1");
        cvr.queries.extend([query_with_state(
            "q",
            vec![
                ("c1", inactive_state(Some(100), 10)),
                ("c2", inactive_state(Some(200), -1)),
            ],
        )]);
        let inactive = cvr.inactive_queries();
        assert_eq!(inactive[0].ttl_ms, -1);
    }

    #[test]
    fn tombstones_and_reference_checks() {
        let record = CvrRowRecord {
            id: RowId::new("public", "issues", key(json!({"id": "1"}))),
            row_version: "03".to_string(),
            patch_version: "1aa".parse().unwrap(),
            ref_counts: Some([("q1".to_string(), 1), ("q2".to_string(), 2)].into()),
        };
        assert!(!record.is_tombstone());
        let q1: BTreeSet<QueryHash> = ["q1".to_string()].into();
        let both: BTreeSet<QueryHash> = ["q1".to_string(), "q2".to_string()].into();
        assert!(!record.only_referenced_by(&q1));
        assert!(record.only_referenced_by(&both));

        let tombstone = CvrRowRecord { ref_counts: None, ..record };
        assert!(tombstone.is_tombstone());
        assert!(!tombstone.only_referenced_by(&both));
    }
}

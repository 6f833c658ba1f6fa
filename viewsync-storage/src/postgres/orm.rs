//! Row structs and query helpers for the CVR tables.
//!
//! Conversions between these rows and the in-memory model in
//! `viewsync_core::cvr` live here so the store only deals in domain types.

use chrono::NaiveDateTime;
use diesel::{pg::data_types::PgInterval, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use viewsync_core::{
    cvr::{CvrRowRecord, QueryDef, QueryRecord, RowId, RowKey, TtlMs},
    error::CvrError,
    version::CvrVersion,
    ClientGroupId,
};

use super::schema::{clients, desires, instances, queries, rows, rows_version};

/// Millisecond TTL to a stored interval; "no expiration" becomes NULL.
pub(crate) fn ttl_to_interval(ttl_ms: TtlMs) -> Option<PgInterval> {
    (ttl_ms >= 0).then(|| PgInterval::from_microseconds(ttl_ms * 1000))
}

/// Stored interval back to a millisecond TTL; NULL means "no expiration".
pub(crate) fn interval_to_ttl(interval: Option<PgInterval>) -> TtlMs {
    match interval {
        Some(iv) => {
            iv.microseconds / 1000
                + i64::from(iv.days) * 86_400_000
                + i64::from(iv.months) * 2_592_000_000
        }
        None => -1,
    }
}

pub(crate) fn parse_version(s: &str) -> Result<CvrVersion, CvrError> {
    s.parse()
        .map_err(|_| CvrError::InvariantViolation(format!("stored version {s:?} is malformed")))
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = instances)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InstanceRow {
    pub client_group_id: String,
    pub version: String,
    pub last_active: NaiveDateTime,
    pub replica_version: Option<String>,
    pub owner: Option<String>,
    pub granted_at: Option<NaiveDateTime>,
    pub client_schema: Option<Value>,
}

/// The slice of the instance row read under `FOR UPDATE` at flush time.
#[derive(Queryable, Debug)]
pub struct InstanceLock {
    pub version: String,
    pub owner: Option<String>,
    pub granted_at: Option<NaiveDateTime>,
}

impl InstanceRow {
    /// The instance joined with its independently advancing rows version.
    pub async fn with_rows_version(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<(InstanceRow, Option<String>)>> {
        instances::table
            .left_join(
                rows_version::table
                    .on(rows_version::client_group_id.eq(instances::client_group_id)),
            )
            .filter(instances::client_group_id.eq(cg))
            .select((InstanceRow::as_select(), rows_version::version.nullable()))
            .first(conn)
            .await
            .optional()
    }

    /// Acquires the per-instance row lock. Must be the first statement of a
    /// flush transaction.
    pub async fn lock(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<InstanceLock>> {
        instances::table
            .filter(instances::client_group_id.eq(cg))
            .select((instances::version, instances::owner, instances::granted_at))
            .for_update()
            .first(conn)
            .await
            .optional()
    }

    /// Plain version read used by the catchup entry points.
    pub async fn version_of(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<String>> {
        instances::table
            .filter(instances::client_group_id.eq(cg))
            .select(instances::version)
            .first(conn)
            .await
            .optional()
    }

    /// Best-effort ownership takeover, gated so a peer whose grant is newer
    /// than `last_connect` keeps the group.
    pub async fn take_ownership(
        cg: &ClientGroupId,
        task_id: &str,
        granted_at: NaiveDateTime,
        last_connect: NaiveDateTime,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<usize> {
        diesel::update(instances::table)
            .filter(instances::client_group_id.eq(cg))
            .filter(
                instances::granted_at
                    .is_null()
                    .or(instances::granted_at.le(last_connect)),
            )
            .set((
                instances::owner.eq(task_id),
                instances::granted_at.eq(granted_at),
            ))
            .execute(conn)
            .await
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = clients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ClientsRow {
    pub client_group_id: String,
    pub client_id: String,
    pub patch_version: Option<String>,
    pub deleted: Option<bool>,
}

impl ClientsRow {
    pub fn new(cg: &ClientGroupId, client_id: &str) -> Self {
        // the deprecated columns are written for backwards read only
        Self {
            client_group_id: cg.clone(),
            client_id: client_id.to_string(),
            patch_version: None,
            deleted: Some(false),
        }
    }

    pub async fn for_group(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<ClientsRow>> {
        clients::table
            .filter(clients::client_group_id.eq(cg))
            .select(ClientsRow::as_select())
            .load(conn)
            .await
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = queries)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct QueriesRow {
    pub client_group_id: String,
    pub query_hash: String,
    pub client_ast: Option<Value>,
    pub query_name: Option<String>,
    pub query_args: Option<Value>,
    pub patch_version: Option<String>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<String>,
    pub internal: Option<bool>,
    pub deleted: Option<bool>,
}

impl QueriesRow {
    pub async fn live_for_group(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<QueriesRow>> {
        queries::table
            .filter(queries::client_group_id.eq(cg))
            .filter(queries::deleted.is_distinct_from(true))
            .select(QueriesRow::as_select())
            .load(conn)
            .await
    }

    /// Query and desire rows whose patch version falls in `(after, up_to]`,
    /// deleted ones included; the raw material for config catchup.
    pub async fn in_patch_range(
        cg: &ClientGroupId,
        after: &str,
        up_to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<QueriesRow>> {
        queries::table
            .filter(queries::client_group_id.eq(cg))
            .filter(queries::patch_version.gt(after))
            .filter(queries::patch_version.le(up_to))
            .select(QueriesRow::as_select())
            .load(conn)
            .await
    }

    pub fn from_record(cg: &ClientGroupId, record: &QueryRecord) -> Self {
        let (client_ast, query_name, query_args, internal) = match &record.def {
            QueryDef::Internal => (None, None, None, Some(true)),
            QueryDef::Ast(ast) => (Some(ast.clone()), None, None, Some(false)),
            QueryDef::Custom { name, args } => {
                (None, Some(name.clone()), Some(args.clone()), Some(false))
            }
        };
        Self {
            client_group_id: cg.clone(),
            query_hash: record.hash.clone(),
            client_ast,
            query_name,
            query_args,
            patch_version: record.patch_version.as_ref().map(|v| v.to_string()),
            transformation_hash: record.transformation_hash.clone(),
            transformation_version: record
                .transformation_version
                .as_ref()
                .map(|v| v.to_string()),
            internal,
            deleted: Some(false),
        }
    }

    /// Rehydrates the query record; `client_state` is back-filled from the
    /// desires rows by the loader.
    pub fn into_record(self) -> Result<QueryRecord, CvrError> {
        let def = if self.internal.unwrap_or(false) {
            QueryDef::Internal
        } else if let Some(ast) = self.client_ast {
            QueryDef::Ast(ast)
        } else if let Some(name) = self.query_name {
            QueryDef::Custom { name, args: self.query_args.unwrap_or(Value::Null) }
        } else {
            return Err(CvrError::InvariantViolation(format!(
                "query {} has neither an AST nor a name",
                self.query_hash
            )));
        };
        Ok(QueryRecord {
            hash: self.query_hash,
            def,
            patch_version: self
                .patch_version
                .as_deref()
                .map(parse_version)
                .transpose()?,
            transformation_hash: self.transformation_hash,
            transformation_version: self
                .transformation_version
                .as_deref()
                .map(parse_version)
                .transpose()?,
            client_state: Default::default(),
        })
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = desires)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DesiresRow {
    pub client_group_id: String,
    pub client_id: String,
    pub query_hash: String,
    pub patch_version: String,
    pub deleted: Option<bool>,
    pub ttl: Option<PgInterval>,
    pub inactivated_at: Option<NaiveDateTime>,
}

impl DesiresRow {
    pub async fn live_for_group(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<DesiresRow>> {
        desires::table
            .filter(desires::client_group_id.eq(cg))
            .filter(desires::deleted.is_distinct_from(true))
            .select(DesiresRow::as_select())
            .load(conn)
            .await
    }

    pub async fn in_patch_range(
        cg: &ClientGroupId,
        after: &str,
        up_to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<DesiresRow>> {
        desires::table
            .filter(desires::client_group_id.eq(cg))
            .filter(desires::patch_version.gt(after))
            .filter(desires::patch_version.le(up_to))
            .select(DesiresRow::as_select())
            .load(conn)
            .await
    }

    pub fn ttl_ms(&self) -> TtlMs {
        interval_to_ttl(self.ttl.clone())
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = rows)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RowsRow {
    pub client_group_id: String,
    pub row_schema: String,
    pub row_table: String,
    pub row_key: Value,
    pub row_version: String,
    pub patch_version: String,
    pub ref_counts: Option<Value>,
}

impl RowsRow {
    pub async fn all_for_group(
        cg: &ClientGroupId,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<RowsRow>> {
        rows::table
            .filter(rows::client_group_id.eq(cg))
            .select(RowsRow::as_select())
            .load(conn)
            .await
    }

    /// One catchup page: rows in `(after, up_to]` ordered by patch version,
    /// with a stable tie-break so offset paging never straddles a version.
    pub async fn page_in_range(
        cg: &ClientGroupId,
        after: &str,
        up_to: &str,
        limit: i64,
        offset: i64,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<RowsRow>> {
        rows::table
            .filter(rows::client_group_id.eq(cg))
            .filter(rows::patch_version.gt(after))
            .filter(rows::patch_version.le(up_to))
            .order((
                rows::patch_version.asc(),
                rows::row_schema.asc(),
                rows::row_table.asc(),
                rows::row_key.asc(),
            ))
            .limit(limit)
            .offset(offset)
            .select(RowsRow::as_select())
            .load(conn)
            .await
    }

    pub fn from_record(cg: &ClientGroupId, record: &CvrRowRecord) -> Self {
        Self {
            client_group_id: cg.clone(),
            row_schema: record.id.schema.clone(),
            row_table: record.id.table.clone(),
            row_key: Value::Object(record.id.key.clone()),
            row_version: record.row_version.clone(),
            patch_version: record.patch_version.to_string(),
            ref_counts: record
                .ref_counts
                .as_ref()
                .map(|counts| serde_json::to_value(counts).expect("refcount maps are JSON")),
        }
    }

    pub fn into_record(self) -> Result<(RowKey, CvrRowRecord), CvrError> {
        let key = match self.row_key {
            Value::Object(map) => map,
            other => {
                return Err(CvrError::InvariantViolation(format!(
                    "row key of {}.{} is not an object: {other}",
                    self.row_schema, self.row_table
                )))
            }
        };
        let ref_counts = self
            .ref_counts
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| {
                CvrError::InvariantViolation(format!("stored refCounts are malformed: {err}"))
            })?;
        let id = RowId::new(self.row_schema, self.row_table, key);
        let record = CvrRowRecord {
            row_version: self.row_version,
            patch_version: parse_version(&self.patch_version)?,
            ref_counts,
            id,
        };
        Ok((record.id.row_key(), record))
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = rows_version)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RowsVersionRow {
    pub client_group_id: String,
    pub version: String,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(-1, None)]
    #[case(0, Some(0))]
    #[case(10_000, Some(10_000_000_000))]
    fn ttl_interval_round_trip(#[case] ttl_ms: TtlMs, #[case] micros: Option<i64>) {
        let interval = ttl_to_interval(ttl_ms);
        assert_eq!(interval.as_ref().map(|iv| iv.microseconds), micros);
        assert_eq!(interval_to_ttl(interval), ttl_ms);
    }

    #[test]
    fn query_row_round_trip() {
        let row = QueriesRow {
            client_group_id: "g1".into(),
            query_hash: "q1".into(),
            client_ast: Some(json!({"table": "issues"})),
            query_name: None,
            query_args: None,
            patch_version: Some("1aa:01".into()),
            transformation_hash: Some("h1".into()),
            transformation_version: Some("1aa:01".into()),
            internal: Some(false),
            deleted: Some(false),
        };
        let record = row.clone().into_record().unwrap();
        assert_eq!(record.def, QueryDef::Ast(json!({"table": "issues"})));
        assert_eq!(record.patch_version.as_ref().unwrap().to_string(), "1aa:01");
        let back = QueriesRow::from_record(&"g1".to_string(), &record);
        assert_eq!(back.client_ast, row.client_ast);
        assert_eq!(back.patch_version, row.patch_version);
        assert_eq!(back.transformation_hash, row.transformation_hash);
    }

    #[test]
    fn query_row_without_definition_is_rejected() {
        let row = QueriesRow {
            client_group_id: "g1".into(),
            query_hash: "q1".into(),
            client_ast: None,
            query_name: None,
            query_args: None,
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
            internal: Some(false),
            deleted: Some(false),
        };
        assert!(row.into_record().is_err());
    }

    #[test]
    fn rows_row_round_trip_preserves_tombstones() {
        let row = RowsRow {
            client_group_id: "g1".into(),
            row_schema: "public".into(),
            row_table: "issues".into(),
            row_key: json!({"id": "1"}),
            row_version: "03".into(),
            patch_version: "1aa".into(),
            ref_counts: None,
        };
        let (key, record) = row.into_record().unwrap();
        assert!(record.is_tombstone());
        assert_eq!(key.key_json, r#"{"id":"1"}"#);
        let back = RowsRow::from_record(&"g1".to_string(), &record);
        assert_eq!(back.ref_counts, None);
        assert_eq!(back.patch_version, "1aa");
    }
}

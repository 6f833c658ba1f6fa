//! Tracks which column sets have served as row keys per upstream table.
//!
//! When an upstream schema change alters a table's key columns, a put can
//! arrive for a row the cache only knows under its old key. The tracker
//! recognizes such puts by matching the put's contents against previously
//! seen key-column sets, so the updater can stage a replacement (delete
//! the old-keyed record, force-emit patches for both IDs) instead of
//! letting the client see the row briefly disappear.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use viewsync_core::cvr::{CvrRowRecord, RowId, RowKey};

#[derive(Debug, Default)]
pub(crate) struct KeyColumnTracker {
    /// Per (schema, table): every set of key columns observed so far.
    columns: HashMap<(String, String), BTreeSet<BTreeSet<String>>>,
}

impl KeyColumnTracker {
    /// Seeds the tracker from the stored row records.
    pub fn build<'a>(records: impl IntoIterator<Item = &'a CvrRowRecord>) -> Self {
        let mut tracker = Self::default();
        for record in records {
            tracker.note(&record.id);
        }
        tracker
    }

    /// Remembers the key columns of a (new) row record.
    pub fn note(&mut self, id: &RowId) {
        self.columns
            .entry((id.schema.clone(), id.table.clone()))
            .or_default()
            .insert(id.key_columns());
    }

    /// Finds the live record, if any, that `id` replaces under a legacy key.
    ///
    /// For every previously seen key-column set of the table that differs
    /// from the incoming one, the candidate old key is assembled from the
    /// put's contents; a candidate counts only when all of its columns are
    /// present and a non-tombstone record exists under it.
    pub fn lookup_old_id(
        &self,
        id: &RowId,
        contents: &Map<String, Value>,
        records: &HashMap<RowKey, CvrRowRecord>,
    ) -> Option<RowId> {
        let seen = self
            .columns
            .get(&(id.schema.clone(), id.table.clone()))?;
        let new_columns = id.key_columns();
        for columns in seen {
            if *columns == new_columns {
                continue;
            }
            let mut key = Map::new();
            for column in columns {
                match contents.get(column) {
                    Some(value) => {
                        key.insert(column.clone(), value.clone());
                    }
                    None => {
                        key.clear();
                        break;
                    }
                }
            }
            if key.len() != columns.len() {
                continue;
            }
            let candidate = RowId::new(id.schema.clone(), id.table.clone(), key);
            match records.get(&candidate.row_key()) {
                Some(record) if !record.is_tombstone() => return Some(candidate),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use viewsync_core::version::CvrVersion;

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn record(id: RowId, tombstone: bool) -> CvrRowRecord {
        CvrRowRecord {
            id,
            row_version: "01".to_string(),
            patch_version: CvrVersion::of_state("1a0"),
            ref_counts: (!tombstone).then(|| [("q1".to_string(), 1)].into()),
        }
    }

    fn records_of(entries: Vec<CvrRowRecord>) -> HashMap<RowKey, CvrRowRecord> {
        entries
            .into_iter()
            .map(|r| (r.id.row_key(), r))
            .collect()
    }

    #[test]
    fn finds_row_under_legacy_key_columns() {
        let old = RowId::new("public", "issues", obj(json!({"id": "1"})));
        let records = records_of(vec![record(old.clone(), false)]);
        let tracker = KeyColumnTracker::build(records.values());

        let new = RowId::new("public", "issues", obj(json!({"new_id": "1foo"})));
        let contents = obj(json!({"id": "1", "new_id": "1foo", "value": "foobar"}));
        assert_eq!(tracker.lookup_old_id(&new, &contents, &records), Some(old));
    }

    #[test]
    fn ignores_tombstones_and_missing_columns() {
        let old = RowId::new("public", "issues", obj(json!({"id": "1"})));
        let tracker = KeyColumnTracker::build([record(old.clone(), false)].iter());

        // contents lack the legacy key column
        let new = RowId::new("public", "issues", obj(json!({"new_id": "1foo"})));
        let contents = obj(json!({"new_id": "1foo"}));
        let records = records_of(vec![record(old.clone(), false)]);
        assert_eq!(tracker.lookup_old_id(&new, &contents, &records), None);

        // old record already deleted
        let records = records_of(vec![record(old, true)]);
        let contents = obj(json!({"id": "1", "new_id": "1foo"}));
        assert_eq!(tracker.lookup_old_id(&new, &contents, &records), None);
    }

    #[test]
    fn same_key_columns_never_match() {
        let a = RowId::new("public", "issues", obj(json!({"id": "1"})));
        let records = records_of(vec![record(a, false)]);
        let tracker = KeyColumnTracker::build(records.values());

        let b = RowId::new("public", "issues", obj(json!({"id": "2"})));
        let contents = obj(json!({"id": "1"}));
        assert_eq!(tracker.lookup_old_id(&b, &contents, &records), None);
    }

    #[test]
    fn tables_are_tracked_independently() {
        let issues = RowId::new("public", "issues", obj(json!({"id": "1"})));
        let records = records_of(vec![record(issues, false)]);
        let tracker = KeyColumnTracker::build(records.values());

        let comments = RowId::new("public", "comments", obj(json!({"new_id": "9"})));
        let contents = obj(json!({"id": "1", "new_id": "9"}));
        assert_eq!(tracker.lookup_old_id(&comments, &contents, &records), None);
    }
}

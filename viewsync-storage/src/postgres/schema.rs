//! Table definitions for the `cvr` schema namespace.
//!
//! Kept in lockstep with the DDL in [`super::migrations`].

diesel::table! {
    cvr.instances (client_group_id) {
        client_group_id -> Text,
        version -> Text,
        last_active -> Timestamptz,
        replica_version -> Nullable<Text>,
        owner -> Nullable<Text>,
        granted_at -> Nullable<Timestamptz>,
        client_schema -> Nullable<Jsonb>,
    }
}

diesel::table! {
    cvr.clients (client_group_id, client_id) {
        client_group_id -> Text,
        client_id -> Text,
        // deprecated, written for backwards read but not consulted
        patch_version -> Nullable<Text>,
        // deprecated
        deleted -> Nullable<Bool>,
    }
}

diesel::table! {
    cvr.queries (client_group_id, query_hash) {
        client_group_id -> Text,
        query_hash -> Text,
        client_ast -> Nullable<Jsonb>,
        query_name -> Nullable<Text>,
        query_args -> Nullable<Jsonb>,
        patch_version -> Nullable<Text>,
        transformation_hash -> Nullable<Text>,
        transformation_version -> Nullable<Text>,
        internal -> Nullable<Bool>,
        deleted -> Nullable<Bool>,
    }
}

diesel::table! {
    cvr.desires (client_group_id, client_id, query_hash) {
        client_group_id -> Text,
        client_id -> Text,
        query_hash -> Text,
        patch_version -> Text,
        deleted -> Nullable<Bool>,
        ttl -> Nullable<Interval>,
        inactivated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    cvr.rows (client_group_id, row_schema, row_table, row_key) {
        client_group_id -> Text,
        row_schema -> Text,
        row_table -> Text,
        row_key -> Jsonb,
        row_version -> Text,
        patch_version -> Text,
        ref_counts -> Nullable<Jsonb>,
    }
}

diesel::table! {
    cvr.rows_version (client_group_id) {
        client_group_id -> Text,
        version -> Text,
    }
}

diesel::table! {
    cvr.schema_versions (lock) {
        lock -> Text,
        version -> Integer,
        min_safe_version -> Nullable<Integer>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    instances,
    clients,
    queries,
    desires,
    rows,
    rows_version,
);

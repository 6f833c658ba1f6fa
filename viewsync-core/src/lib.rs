//! Domain types shared by the view-sync services.
//!
//! This crate is deliberately free of database dependencies: it defines the
//! version algebra, the in-memory Client View Record (CVR) model, the patch
//! types emitted towards per-client connections, and the error taxonomy.
//! The Postgres-backed store lives in `viewsync-storage`.

pub mod cvr;
pub mod error;
pub mod patch;
pub mod version;

/// Identifies the set of clients sharing one CVR.
pub type ClientGroupId = String;
/// Identifies a single client within a client group.
pub type ClientId = String;
/// Content hash of a query; uniquely identifies its AST (or name + args).
pub type QueryHash = String;
/// Identifies the task (process) currently owning a client group.
pub type TaskId = String;

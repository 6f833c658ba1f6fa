//! Patches describe incremental changes to a client's view.
//!
//! Updaters emit them tagged with the CVR version at which the change became
//! visible; per-client connections forward them in version order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{cvr::RowId, version::CvrVersion, ClientId, QueryHash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Put,
    Del,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CvrPatch {
    /// A client joined (put) or left (del) the group.
    Client { op: PatchOp, id: ClientId },
    /// A "got" query changed, or (with `client_id`) one client's desire.
    Query { op: PatchOp, id: QueryHash, client_id: Option<ClientId> },
    /// A row entered or left the synced view. Puts carry the row contents.
    Row { op: PatchOp, id: RowId, contents: Option<Map<String, Value>> },
}

impl CvrPatch {
    pub fn client_put(id: impl Into<ClientId>) -> Self {
        Self::Client { op: PatchOp::Put, id: id.into() }
    }

    pub fn query_put(id: impl Into<QueryHash>) -> Self {
        Self::Query { op: PatchOp::Put, id: id.into(), client_id: None }
    }

    pub fn query_del(id: impl Into<QueryHash>) -> Self {
        Self::Query { op: PatchOp::Del, id: id.into(), client_id: None }
    }

    pub fn desire_put(id: impl Into<QueryHash>, client_id: impl Into<ClientId>) -> Self {
        Self::Query { op: PatchOp::Put, id: id.into(), client_id: Some(client_id.into()) }
    }

    pub fn desire_del(id: impl Into<QueryHash>, client_id: impl Into<ClientId>) -> Self {
        Self::Query { op: PatchOp::Del, id: id.into(), client_id: Some(client_id.into()) }
    }

    pub fn row_put(id: RowId, contents: Map<String, Value>) -> Self {
        Self::Row { op: PatchOp::Put, id, contents: Some(contents) }
    }

    pub fn row_del(id: RowId) -> Self {
        Self::Row { op: PatchOp::Del, id, contents: None }
    }

    pub fn op(&self) -> PatchOp {
        match self {
            Self::Client { op, .. } | Self::Query { op, .. } | Self::Row { op, .. } => *op,
        }
    }
}

/// A patch together with the version the receiving client advances to.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchToVersion {
    pub patch: CvrPatch,
    pub to_version: CvrVersion,
}

impl PatchToVersion {
    pub fn new(patch: CvrPatch, to_version: CvrVersion) -> Self {
        Self { patch, to_version }
    }
}

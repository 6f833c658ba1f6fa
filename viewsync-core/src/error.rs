//! Error taxonomy of the CVR layer.
//!
//! Only three kinds ever cross the client boundary (see
//! [`CvrError::client_kind`]); everything else is server-internal and is
//! handled by reloading, retrying or tearing the group down.

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum CvrError {
    /// Another writer advanced the instance version under us. Recoverable:
    /// reload the CVR and reapply the logical operation.
    #[error("CVR concurrently modified: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: String, actual: String },

    /// Another task legitimately took ownership of the client group.
    #[error("client group owned by {owner:?} since {granted_at:?}")]
    Ownership { owner: Option<String>, granted_at: Option<NaiveDateTime> },

    /// The rows tables have not caught up to the CVR version yet. Transient;
    /// the loader retries with a bounded budget.
    #[error("row state at version {rows_version} is behind CVR version {cvr_version}")]
    RowsVersionBehind { cvr_version: String, rows_version: String },

    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Permanent for this connection; the client must reset local state.
    #[error("invalid connection request: {0}")]
    InvalidConnectionRequest(String),

    #[error("malformed version {0:?}")]
    InvalidVersion(String),

    /// Stored state contradicts the CVR invariants. Fatal; logged and
    /// surfaced.
    #[error("CVR invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// The error kinds a client may observe.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClientErrorKind {
    InvalidConnectionRequest,
    ClientNotFound,
    /// The group was rehomed to another task; the client should reconnect
    /// immediately (`max_backoff_ms = 0`) and will be routed there.
    Rehome { max_backoff_ms: u64 },
}

impl CvrError {
    /// Maps this error onto its client-visible kind, if it has one.
    pub fn client_kind(&self) -> Option<ClientErrorKind> {
        match self {
            Self::InvalidConnectionRequest(_) => Some(ClientErrorKind::InvalidConnectionRequest),
            Self::ClientNotFound(_) => Some(ClientErrorKind::ClientNotFound),
            Self::Ownership { .. } => Some(ClientErrorKind::Rehome { max_backoff_ms: 0 }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_boundary_kinds_are_client_visible() {
        assert_eq!(
            CvrError::Ownership { owner: Some("task-2".into()), granted_at: None }.client_kind(),
            Some(ClientErrorKind::Rehome { max_backoff_ms: 0 })
        );
        assert_eq!(
            CvrError::ClientNotFound("c1".into()).client_kind(),
            Some(ClientErrorKind::ClientNotFound)
        );
        assert!(CvrError::ConcurrentModification {
            expected: "1a0".into(),
            actual: "1a1".into()
        }
        .client_kind()
        .is_none());
        assert!(CvrError::RowsVersionBehind {
            cvr_version: "1a1".into(),
            rows_version: "1a0".into()
        }
        .client_kind()
        .is_none());
    }
}

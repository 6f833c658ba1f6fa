//! Updaters mutate a loaded CVR snapshot and commit it through the store.
//!
//! Both updaters follow the same shape: take a snapshot, apply synchronous
//! in-memory mutations that stage writes on the store and emit patches,
//! then flush once. Every mutation goes through `ensure_new_version`, which
//! bumps the minor version at most once per updater, so all patches of one
//! round share a single target version.

use chrono::NaiveDateTime;
use diesel_async::AsyncPgConnection;
use tracing::debug;
use viewsync_core::{cvr::Cvr, error::CvrError, version::CvrVersion};

use crate::postgres::store::{CvrFlushStats, CvrStore};

pub mod config;
pub mod query;

pub use config::CvrConfigDrivenUpdater;
pub use query::CvrQueryDrivenUpdater;

/// Shared base of the config-driven and query-driven updaters.
pub(crate) struct CvrUpdater<'a> {
    pub(crate) store: &'a mut CvrStore,
    pub(crate) cvr: Cvr,
    orig_version: CvrVersion,
    version_bumped: bool,
}

impl<'a> CvrUpdater<'a> {
    pub(crate) fn new(store: &'a mut CvrStore, cvr: Cvr) -> Self {
        let orig_version = cvr.version.clone();
        Self { store, cvr, orig_version, version_bumped: false }
    }

    /// Advances the CVR to the version mutations of this round land at.
    /// Idempotent: the first call bumps the minor version, further calls
    /// return the same version.
    pub(crate) fn ensure_new_version(&mut self) -> CvrVersion {
        if !self.version_bumped {
            self.cvr.version = self.cvr.version.one_after();
            self.version_bumped = true;
        }
        self.cvr.version.clone()
    }

    /// Commits the round. Returns `None` without touching storage when the
    /// version never moved and nothing is staged.
    pub(crate) async fn flush(
        mut self,
        conn: &mut AsyncPgConnection,
        last_connect: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Option<(Cvr, CvrFlushStats)>, CvrError> {
        if self.cvr.version == self.orig_version {
            if !self.store.has_pending_writes() {
                debug!(client_group = %self.cvr.id, "no-op flush skipped");
                return Ok(None);
            }
            // staged writes always ride a new version
            self.cvr.version = self.cvr.version.one_after();
        }
        let mut cvr = self.cvr;
        cvr.last_active = now;
        let stats = self
            .store
            .flush(conn, &self.orig_version, &cvr, last_connect)
            .await?;
        Ok(Some((cvr, stats)))
    }
}

//! Postgres-backed storage and update protocol for Client View Records.
//!
//! The [`postgres`] module owns the durable side: schema, migrations, the
//! row record cache and the [`postgres::store::CvrStore`]. The [`cvr`]
//! module implements the two updaters that mutate a loaded snapshot and
//! commit it through the store.

pub mod cvr;
pub mod postgres;

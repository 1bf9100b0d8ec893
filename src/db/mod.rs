//! Database access layer.
//!
//! This module owns everything that talks TDS:
//! - Bounded connection pool with lifecycle management
//! - Tiberius connection wrapper and factory
//! - Query executor (timeouts, row caps, transactional writes)
//! - Catalog introspection over `sys.*` views

pub mod catalog;
pub mod connection;
pub mod executor;
pub mod pool;

pub use connection::{MssqlConnection, MssqlFactory};
pub use executor::QueryExecutor;
pub use pool::{ConnectionFactory, PoolStats, PoolableConnection, PooledConnection, SqlPool};

/// Pool specialized to the tiberius-backed factory. Everything above the
/// db layer works in terms of these aliases.
pub type MssqlPool = SqlPool<MssqlFactory>;

/// Lease handed out by [`MssqlPool`].
pub type MssqlLease = PooledConnection<MssqlFactory>;

//! Database access layer.
//!
//! This module provides:
//! - Keyword connection string parsing
//! - Driver connections and the `DbConnection` seam
//! - Connection providers for named configuration entries
//! - Bounded per-connection-string connection pooling
//! - Transactional execution (async and blocking)
//! - Dynamic row materialization and parameter binding
//! - Database dispatch macros for reducing code duplication

pub mod connection;
pub mod connection_string;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod provider;
pub mod rows;

pub use connection::{DbConnection, DriverConnection, IsolationLevel, SqlConnection};
pub use executor::{BlockingExecutor, Invocation, TransactionalExecutor};
pub use macros::DatabaseType;
pub use params::QueryParam;
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use provider::{ConnectionProvider, NamedConnectionProvider};
pub use rows::DynamicRow;

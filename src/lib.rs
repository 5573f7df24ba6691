//! pooled-db library
//!
//! A data-access layer on top of sqlx (SQLite, PostgreSQL, MySQL): bounded
//! per-connection-string connection pooling, a transactional executor with
//! consistent commit/rollback, timeout and cancellation semantics, and a
//! sanitizer that trims string values in query results.

pub mod config;
pub mod db;
pub mod error;
pub mod sanitize;

pub use config::{Config, ConnectionEntry, ConnectionSettings, ExecutorOptions};
pub use db::{
    BlockingExecutor, ConnectionPool, ConnectionProvider, DynamicRow, IsolationLevel,
    NamedConnectionProvider, SqlConnection, TransactionalExecutor,
};
pub use error::{DbError, DbResult};
pub use sanitize::{Traversable, sanitize};

//! Driver dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate driver-specific
//! implementations while maintaining linear readability. The macros expand
//! at compile time with zero runtime overhead.

use crate::error::{DbError, DbResult};

/// Database backend selected by a connection entry's provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Resolve a provider name (case-insensitive) to a backend.
    pub fn from_provider_name(provider_name: &str) -> DbResult<Self> {
        match provider_name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "npgsql" => Ok(Self::Postgres),
            "mysql" | "mariadb" | "mysql.data.mysqlclient" => Ok(Self::MySql),
            "sqlite" | "system.data.sqlite" | "microsoft.data.sqlite" => Ok(Self::SQLite),
            other => Err(DbError::configuration(
                format!("No driver registered for provider '{}'", other),
                "Use one of: postgres, mysql, sqlite",
            )),
        }
    }

    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this backend.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Macro for generating driver dispatch match arms.
///
/// This macro generates match arms for `DriverConnection` variants, reducing the need
/// to manually write repetitive match statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(driver, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($driver:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $driver {
            $(
                $crate::db::connection::DriverConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;

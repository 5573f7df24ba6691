//! Connection providers.
//!
//! A provider turns a named connection entry into a raw, unopened connection
//! bound to one concrete connection string. The executor is generic over the
//! provider, so callers pick which configured database a call runs against.

use crate::config::{ConnectionEntry, ConnectionSettings};
use crate::db::DatabaseType;
use crate::db::connection::{DbConnection, SqlConnection};
use crate::db::connection_string;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use tracing::debug;

/// Strategy for creating connections for a named configuration entry.
pub trait ConnectionProvider: Send + Sync {
    type Connection: DbConnection;

    /// The configuration entry name this provider resolves.
    fn context_name(&self) -> &str;

    /// Create an unopened connection for the configured connection string.
    fn create_connection(&self) -> DbResult<Self::Connection>;

    /// Create an unopened connection with `$ServerName` replaced by `server_name`.
    fn create_connection_for_server(&self, server_name: &str) -> DbResult<Self::Connection>;
}

/// Provider backed by named connection settings.
#[derive(Debug, Clone)]
pub struct NamedConnectionProvider {
    context_name: String,
    settings: Arc<ConnectionSettings>,
}

impl NamedConnectionProvider {
    /// Create a provider for `context_name`. Empty names are rejected.
    pub fn new(
        context_name: impl Into<String>,
        settings: Arc<ConnectionSettings>,
    ) -> DbResult<Self> {
        let context_name = context_name.into();
        if context_name.trim().is_empty() {
            return Err(DbError::configuration(
                "Connection context name cannot be empty",
                "Pass the name of a configured connection entry",
            ));
        }
        Ok(Self {
            context_name,
            settings,
        })
    }

    fn entry(&self) -> DbResult<&ConnectionEntry> {
        self.settings.get(&self.context_name).ok_or_else(|| {
            DbError::configuration(
                format!("Unknown connection '{}'", self.context_name),
                format!("Configured connections: {:?}", self.settings.names()),
            )
        })
    }

    fn build(&self, entry: &ConnectionEntry, connection_string: String) -> DbResult<SqlConnection> {
        let db_type = DatabaseType::from_provider_name(&entry.provider_name)?;
        debug!(
            context = %self.context_name,
            db_type = %db_type,
            target = %connection_string::masked(&connection_string),
            "Creating connection"
        );
        SqlConnection::new(db_type, connection_string)
    }
}

impl ConnectionProvider for NamedConnectionProvider {
    type Connection = SqlConnection;

    fn context_name(&self) -> &str {
        &self.context_name
    }

    fn create_connection(&self) -> DbResult<SqlConnection> {
        let entry = self.entry()?;
        self.build(entry, entry.connection_string.clone())
    }

    fn create_connection_for_server(&self, server_name: &str) -> DbResult<SqlConnection> {
        let entry = self.entry()?;
        let resolved = connection_string::with_server_name(&entry.connection_string, server_name);
        self.build(entry, resolved)
    }
}

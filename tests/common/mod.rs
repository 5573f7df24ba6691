//! Shared fixtures: an in-memory connection that records its lifecycle.

#![allow(dead_code)]

use pooled_db::config::{ConnectionEntry, ConnectionSettings};
use pooled_db::db::connection_string::with_server_name;
use pooled_db::db::{
    ConnectionProvider, DbConnection, IsolationLevel, NamedConnectionProvider,
};
use pooled_db::error::{DbError, DbResult};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Ordered record of lifecycle events across all connections of a provider.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }
}

/// Which lifecycle steps should fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub open: bool,
    pub commit: bool,
    pub rollback: bool,
}

#[derive(Debug)]
pub struct MockConnection {
    connection_string: String,
    log: EventLog,
    failures: Failures,
    open: bool,
    in_transaction: bool,
}

impl MockConnection {
    /// Record an event from inside an action.
    pub fn record(&self, event: &str) {
        self.log.push(event);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl DbConnection for MockConnection {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn open(&mut self) -> DbResult<()> {
        self.log.push("open");
        if self.failures.open {
            return Err(DbError::execution("connection refused", None, ""));
        }
        self.open = true;
        Ok(())
    }

    async fn begin(&mut self, level: IsolationLevel) -> DbResult<()> {
        self.log.push(format!("begin:{}", level));
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.log.push("commit");
        self.in_transaction = false;
        if self.failures.commit {
            return Err(DbError::execution("serialization failure", Some("40001".into()), ""));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.log.push("rollback");
        self.in_transaction = false;
        if self.failures.rollback {
            return Err(DbError::execution("connection reset", None, ""));
        }
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.log.push("close");
        self.open = false;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockProvider {
    pub connection_string: String,
    pub log: EventLog,
    pub failures: Failures,
}

impl MockProvider {
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            log: EventLog::default(),
            failures: Failures::default(),
        }
    }

    pub fn failing(mut self, failures: Failures) -> Self {
        self.failures = failures;
        self
    }

    fn connection(&self, connection_string: String) -> MockConnection {
        MockConnection {
            connection_string,
            log: self.log.clone(),
            failures: self.failures,
            open: false,
            in_transaction: false,
        }
    }
}

impl ConnectionProvider for MockProvider {
    type Connection = MockConnection;

    fn context_name(&self) -> &str {
        "MOCK"
    }

    fn create_connection(&self) -> DbResult<MockConnection> {
        Ok(self.connection(self.connection_string.clone()))
    }

    fn create_connection_for_server(&self, server_name: &str) -> DbResult<MockConnection> {
        Ok(self.connection(with_server_name(&self.connection_string, server_name)))
    }
}

/// A SQLite file that outlives the test's temp handle.
pub fn sqlite_path() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// Provider for a named SQLite entry using `connection_string`.
pub fn sqlite_provider(connection_string: &str) -> NamedConnectionProvider {
    let settings = ConnectionSettings::new().with_entry(ConnectionEntry::new(
        "LOCAL",
        "sqlite",
        connection_string,
    ));
    NamedConnectionProvider::new("LOCAL", Arc::new(settings)).unwrap()
}

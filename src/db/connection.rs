//! Driver connections.
//!
//! A connection is created unopened from a keyword connection string and goes
//! through `open -> (begin -> commit | rollback)? -> close`. The [`DbConnection`]
//! trait is the seam the executor drives; [`SqlConnection`] is the sqlx-backed
//! implementation dispatching over MySQL, PostgreSQL and SQLite.

use crate::db::DatabaseType;
use crate::db::connection_string::{self, ConnectionKeywords};
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::rows::{DynamicRow, ToDynamicRow};
use crate::db::QueryParam;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use futures_util::future::{self, BoxFuture, FutureExt, TryFutureExt};
use sqlx::{ConnectOptions, Connection, Executor};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const HOST_KEYS: &[&str] = &["server", "host", "data source", "address"];
const DATABASE_KEYS: &[&str] = &["database", "initial catalog"];
const USER_KEYS: &[&str] = &["user id", "uid", "user", "username"];
const PASSWORD_KEYS: &[&str] = &["password", "pwd"];
const SQLITE_PATH_KEYS: &[&str] = &["data source", "filename"];
const COMMAND_TIMEOUT_KEY: &str = "command timeout";

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// Snapshot isolation (PostgreSQL's REPEATABLE READ).
    Snapshot,
}

impl IsolationLevel {
    /// Get the SQL name of this level, as used by `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "readuncommitted" => Ok(Self::ReadUncommitted),
            "readcommitted" => Ok(Self::ReadCommitted),
            "repeatableread" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(DbError::configuration(
                format!("Unknown isolation level '{}'", s),
                "Use one of: read-uncommitted, read-committed, repeatable-read, serializable, snapshot",
            )),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Statements that start a transaction at `level` on `db`.
pub fn begin_statements(db: DatabaseType, level: IsolationLevel) -> DbResult<Vec<String>> {
    match (db, level) {
        (DatabaseType::Postgres, IsolationLevel::Snapshot) => {
            Ok(vec!["BEGIN ISOLATION LEVEL REPEATABLE READ".to_string()])
        }
        (DatabaseType::Postgres, level) => {
            Ok(vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())])
        }
        (DatabaseType::MySql | DatabaseType::SQLite, IsolationLevel::Snapshot) => {
            Err(DbError::configuration(
                format!("{} does not support SNAPSHOT isolation", db),
                "Use REPEATABLE READ or SERIALIZABLE instead",
            ))
        }
        (DatabaseType::MySql, level) => Ok(vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            "START TRANSACTION".to_string(),
        ]),
        // SQLite transactions are serializable; IMMEDIATE takes the write lock up front.
        (DatabaseType::SQLite, IsolationLevel::Serializable) => {
            Ok(vec!["BEGIN IMMEDIATE".to_string()])
        }
        (DatabaseType::SQLite, _) => Ok(vec!["BEGIN DEFERRED".to_string()]),
    }
}

/// A connection the executor can open, run a transaction on, and close.
pub trait DbConnection: Send {
    /// The exact connection string this connection is bound to (the pool key).
    fn connection_string(&self) -> &str;

    fn open(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn begin(&mut self, level: IsolationLevel) -> impl Future<Output = DbResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the physical connection. Closing an unopened connection is a no-op.
    fn close(&mut self) -> impl Future<Output = DbResult<()>> + Send;
}

/// Driver options parsed from a keyword connection string.
#[derive(Debug, Clone)]
pub enum DriverOptions {
    MySql(MySqlConnectOptions),
    Postgres(PgConnectOptions),
    SQLite(SqliteConnectOptions),
}

impl DriverOptions {
    /// Build driver options from a keyword connection string.
    pub fn from_keywords(db_type: DatabaseType, connection_string: &str) -> DbResult<Self> {
        let keywords = ConnectionKeywords::parse(connection_string);
        let command_timeout = parse_command_timeout(&keywords)?;

        match db_type {
            DatabaseType::Postgres => {
                let (host, port) = host_and_port(&keywords, db_type)?;
                let mut options = PgConnectOptions::new().host(host).port(port);
                if let Some(database) = keywords.get_any(DATABASE_KEYS) {
                    options = options.database(database);
                }
                if let Some(user) = keywords.get_any(USER_KEYS) {
                    options = options.username(user);
                }
                if let Some(password) = keywords.get_any(PASSWORD_KEYS) {
                    options = options.password(password);
                }
                if let Some(name) = keywords.get("application name") {
                    options = options.application_name(name);
                }
                if let Some(timeout) = command_timeout {
                    let millis = timeout.as_millis().to_string();
                    options = options.options([("statement_timeout", millis.as_str())]);
                }
                Ok(Self::Postgres(options))
            }
            DatabaseType::MySql => {
                let (host, port) = host_and_port(&keywords, db_type)?;
                let mut options = MySqlConnectOptions::new()
                    .host(host)
                    .port(port)
                    .charset("utf8mb4");
                if let Some(database) = keywords.get_any(DATABASE_KEYS) {
                    options = options.database(database);
                }
                if let Some(user) = keywords.get_any(USER_KEYS) {
                    options = options.username(user);
                }
                if let Some(password) = keywords.get_any(PASSWORD_KEYS) {
                    options = options.password(password);
                }
                Ok(Self::MySql(options))
            }
            DatabaseType::SQLite => {
                let path = keywords.get_any(SQLITE_PATH_KEYS).ok_or_else(|| {
                    DbError::configuration(
                        "SQLite connection string has no Data Source",
                        "Add Data Source=path/to/db.sqlite (or :memory:)",
                    )
                })?;
                let read_only = keywords.get_bool("read only").unwrap_or(false);

                let mut options = if path == ":memory:" {
                    SqliteConnectOptions::from_str("sqlite::memory:")?
                } else {
                    SqliteConnectOptions::new()
                        .filename(path)
                        .create_if_missing(!read_only)
                };
                options = options.read_only(read_only);
                if let Some(timeout) = command_timeout {
                    options = options.busy_timeout(timeout);
                }
                Ok(Self::SQLite(options))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySql,
            Self::Postgres(_) => DatabaseType::Postgres,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn connect(&self) -> DbResult<DriverConnection> {
        Ok(match self {
            Self::MySql(options) => DriverConnection::MySql(options.connect().await?),
            Self::Postgres(options) => DriverConnection::Postgres(options.connect().await?),
            Self::SQLite(options) => DriverConnection::SQLite(options.connect().await?),
        })
    }
}

fn host_and_port(keywords: &ConnectionKeywords, db_type: DatabaseType) -> DbResult<(&str, u16)> {
    let host = keywords.get_any(HOST_KEYS).ok_or_else(|| {
        DbError::configuration(
            format!("{} connection string has no Server", db_type),
            "Add Server=<host> to the connection string",
        )
    })?;
    let port = match keywords.get("port") {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            DbError::configuration(
                format!("Invalid Port '{}'", raw),
                "Port must be a number between 1 and 65535",
            )
        })?,
        None => db_type.default_port().unwrap_or_default(),
    };
    Ok((host, port))
}

fn parse_command_timeout(keywords: &ConnectionKeywords) -> DbResult<Option<Duration>> {
    match keywords.get(COMMAND_TIMEOUT_KEY) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) => Ok(None),
            Ok(secs) => Ok(Some(Duration::from_secs(secs))),
            Err(_) => Err(DbError::configuration(
                format!("Invalid Command Timeout '{}'", raw),
                "Command Timeout is a whole number of seconds",
            )),
        },
    }
}

/// An open sqlx connection, one variant per driver.
#[derive(Debug)]
pub enum DriverConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// A sqlx-backed connection bound to one connection string.
#[derive(Debug)]
pub struct SqlConnection {
    connection_string: String,
    options: DriverOptions,
    driver: Option<DriverConnection>,
}

impl SqlConnection {
    /// Create an unopened connection. Fails if the keywords cannot become driver options.
    pub fn new(db_type: DatabaseType, connection_string: impl Into<String>) -> DbResult<Self> {
        let connection_string = connection_string.into();
        let options = DriverOptions::from_keywords(db_type, &connection_string)?;
        Ok(Self {
            connection_string,
            options,
            driver: None,
        })
    }

    pub fn database_type(&self) -> DatabaseType {
        self.options.database_type()
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    fn driver_mut(&mut self) -> DbResult<&mut DriverConnection> {
        self.driver.as_mut().ok_or_else(|| {
            DbError::execution(
                "Connection is not open",
                None,
                "Open the connection before issuing statements",
            )
        })
    }

    /// Run one statement through the simple query protocol (no parameters).
    ///
    /// Returns a boxed future so callers inside `Send` futures don't have to
    /// prove the driver's executor bounds for every lifetime.
    fn execute_raw<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, DbResult<()>> {
        let driver = match self.driver_mut() {
            Ok(driver) => driver,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        crate::impl_db_dispatch!(driver, {
            MySql(c) => Executor::execute(c, sqlx::raw_sql(sql))
                .map_ok(|_| ())
                .err_into()
                .boxed(),
            Postgres(c) => Executor::execute(c, sqlx::raw_sql(sql))
                .map_ok(|_| ())
                .err_into()
                .boxed(),
            SQLite(c) => Executor::execute(c, sqlx::raw_sql(sql))
                .map_ok(|_| ())
                .err_into()
                .boxed(),
        })
    }

    /// Run a parameterized statement and materialize all rows.
    pub async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<DynamicRow>> {
        let driver = self.driver_mut()?;
        let rows = crate::impl_db_dispatch!(driver, {
            MySql(c) => {
                let query = params.iter().fold(sqlx::query(sql), bind_mysql_param);
                let rows = query.fetch_all(&mut *c).await?;
                rows.iter().map(ToDynamicRow::to_dynamic_row).collect()
            },
            Postgres(c) => {
                let query = params.iter().fold(sqlx::query(sql), bind_postgres_param);
                let rows = query.fetch_all(&mut *c).await?;
                rows.iter().map(ToDynamicRow::to_dynamic_row).collect()
            },
            SQLite(c) => {
                let query = params.iter().fold(sqlx::query(sql), bind_sqlite_param);
                let rows = query.fetch_all(&mut *c).await?;
                rows.iter().map(ToDynamicRow::to_dynamic_row).collect()
            },
        });
        Ok(rows)
    }

    /// Run a parameterized statement and materialize the first row, if any.
    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<DynamicRow>> {
        Ok(self.fetch_rows(sql, params).await?.into_iter().next())
    }

    /// Run a parameterized statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let driver = self.driver_mut()?;
        let affected = crate::impl_db_dispatch!(driver, {
            MySql(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_mysql_param)
                .execute(&mut *c)
                .await?
                .rows_affected(),
            Postgres(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_postgres_param)
                .execute(&mut *c)
                .await?
                .rows_affected(),
            SQLite(c) => params
                .iter()
                .fold(sqlx::query(sql), bind_sqlite_param)
                .execute(&mut *c)
                .await?
                .rows_affected(),
        });
        Ok(affected)
    }
}

impl DbConnection for SqlConnection {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn open(&mut self) -> DbResult<()> {
        if self.driver.is_some() {
            return Ok(());
        }
        debug!(
            db_type = %self.database_type(),
            target = %connection_string::masked(&self.connection_string),
            "Opening connection"
        );
        self.driver = Some(self.options.connect().await?);
        Ok(())
    }

    async fn begin(&mut self, level: IsolationLevel) -> DbResult<()> {
        for statement in begin_statements(self.database_type(), level)? {
            self.execute_raw(&statement).await?;
        }
        debug!(isolation = %level, "Transaction begun");
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute_raw("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute_raw("ROLLBACK").await
    }

    async fn close(&mut self) -> DbResult<()> {
        let Some(driver) = self.driver.take() else {
            return Ok(());
        };
        crate::impl_db_dispatch!(driver, {
            MySql(c) => c.close().await?,
            Postgres(c) => c.close().await?,
            SQLite(c) => c.close().await?,
        });
        debug!("Connection closed");
        Ok(())
    }
}

//! Error types for the data-access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors are classified on conversion so that callers can tell a command
//! timeout apart from a generic execution failure and special-case their retries.

use thiserror::Error;

/// PostgreSQL `query_canceled`, raised when `statement_timeout` fires.
const PG_QUERY_CANCELED: &str = "57014";

/// MySQL error numbers reported for statement timeouts and interrupted queries.
const MYSQL_TIMEOUT_NUMBERS: &[u16] = &[3024, 1969, 1317];

/// SQLite primary result codes for `SQLITE_BUSY` (busy_timeout elapsed) and
/// `SQLITE_INTERRUPT`.
const SQLITE_TIMEOUT_CODES: &[i64] = &[5, 9];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Pool initialization failed: {message}")]
    PoolInitialization { message: String },

    #[error("Command timeout: {operation}{}", elapsed_suffix(.elapsed_ms))]
    CommandTimeout {
        operation: String,
        /// The executor's limit; `None` when the driver reported the timeout.
        elapsed_ms: Option<u64>,
    },

    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Rollback failed ({rollback}) after: {original}")]
    Rollback {
        original: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Cancelled while {stage}")]
    Cancelled { stage: String },
}

impl DbError {
    /// Create a configuration error with a helpful suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a pool initialization error.
    pub fn pool_initialization(message: impl Into<String>) -> Self {
        Self::PoolInitialization {
            message: message.into(),
        }
    }

    /// Create a command timeout error for the executor's own limit.
    pub fn command_timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::CommandTimeout {
            operation: operation.into(),
            elapsed_ms: Some(elapsed_ms),
        }
    }

    /// Create a command timeout error signalled by the driver.
    pub fn driver_timeout(message: impl Into<String>) -> Self {
        Self::CommandTimeout {
            operation: message.into(),
            elapsed_ms: None,
        }
    }

    /// Create an execution error with optional SQL state.
    pub fn execution(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Pair an action failure with the rollback failure that followed it.
    pub fn rollback(original: DbError, rollback: DbError) -> Self {
        Self::Rollback {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// The first error of the invocation.
    ///
    /// For `Rollback` this is the action or commit failure that triggered the
    /// rollback, for every other variant it is the error itself.
    pub fn original(&self) -> &DbError {
        match self {
            Self::Rollback { original, .. } => original.original(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::Execution { suggestion, .. } => Some(suggestion),
            Self::Rollback { original, .. } => original.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is a command timeout, looking through rollback failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self.original(), Self::CommandTimeout { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}

/// Whether a driver error carries the driver's timeout signal.
pub fn is_timeout_signal(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                return MYSQL_TIMEOUT_NUMBERS.contains(&mysql.number());
            }
            if db_err
                .try_downcast_ref::<sqlx::sqlite::SqliteError>()
                .is_some()
            {
                // Extended result codes keep the primary code in the low byte.
                return db_err
                    .code()
                    .and_then(|code| code.parse::<i64>().ok())
                    .is_some_and(|code| SQLITE_TIMEOUT_CODES.contains(&(code & 0xff)));
            }
            db_err.code().as_deref() == Some(PG_QUERY_CANCELED)
        }
        _ => false,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if is_timeout_signal(&err) {
            return DbError::driver_timeout(format!("driver reported {}", err));
        }

        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(
                msg.to_string(),
                "Check the connection string keywords and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::execution(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::execution(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolClosed => {
                DbError::execution("Connection is closed", None, "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::execution(
                format!("I/O error: {}", io_err),
                None,
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::execution(
                format!("TLS error: {}", tls_err),
                None,
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::execution(
                format!("Protocol error: {}", msg),
                None,
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::execution(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::execution(
                format!("Failed to decode column {}: {}", index, source),
                None,
                "Check that the column type matches the requested Rust type",
            ),
            sqlx::Error::Decode(source) => {
                DbError::execution(format!("Decode error: {}", source), None, "")
            }
            sqlx::Error::WorkerCrashed => {
                DbError::execution("Database worker crashed", None, "Reconnect to the database")
            }
            _ => DbError::execution(format!("Unknown database error: {}", err), None, ""),
        }
    }
}

fn elapsed_suffix(elapsed_ms: &Option<u64>) -> String {
    match elapsed_ms {
        Some(ms) => format!(" exceeded {}ms", ms),
        None => String::new(),
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::configuration("Unknown connection 'LOCAL'", "Check settings");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::execution(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::command_timeout("query", 30_000).is_retryable());
        assert!(!DbError::execution("err", None, "sugg").is_retryable());
        assert!(!DbError::configuration("missing", "add it").is_retryable());
    }

    #[test]
    fn test_rollback_keeps_original() {
        let err = DbError::rollback(
            DbError::execution("duplicate key", Some("23505".to_string()), "dedupe"),
            DbError::execution("connection reset", None, ""),
        );
        assert!(matches!(
            err.original(),
            DbError::Execution { sql_state: Some(code), .. } if code == "23505"
        ));
        assert_eq!(err.suggestion(), Some("dedupe"));
        assert!(err.to_string().contains("duplicate key"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_rollback_of_timeout_is_timeout() {
        let err = DbError::rollback(
            DbError::command_timeout("query", 100),
            DbError::execution("broken pipe", None, ""),
        );
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_pool_timed_out_is_timeout_signal() {
        assert!(is_timeout_signal(&sqlx::Error::PoolTimedOut));
        assert!(!is_timeout_signal(&sqlx::Error::RowNotFound));
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::CommandTimeout { elapsed_ms: None, .. }));
        assert!(!err.to_string().contains("exceeded"));
    }

    #[test]
    fn test_executor_timeout_message() {
        let err = DbError::command_timeout("action", 1500);
        assert_eq!(err.to_string(), "Command timeout: action exceeded 1500ms");
    }

    #[test]
    fn test_row_not_found_maps_to_execution() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Execution { .. }));
    }
}

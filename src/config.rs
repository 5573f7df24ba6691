//! Configuration handling for pooled-db.
//!
//! This module provides the named connection settings (JSON settings file or
//! `NAME=PROVIDER:CONNECTION_STRING` entries), executor options, and the CLI
//! configuration parsed from arguments and environment variables.

use crate::db::{IsolationLevel, QueryParam};
use crate::error::{DbError, DbResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONTEXT_NAME: &str = "LOCAL";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_ISOLATION: &str = "read-committed";

// Executor defaults
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 64;

/// Executor configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Upper bound in seconds for the action, and separately for the rollback
    /// after a failure (default: none). Slot wait, open and commit are not bounded.
    pub command_timeout_secs: Option<u64>,
    /// Isolation level for transactional calls that don't pick one (default: read committed)
    pub isolation_level: Option<IsolationLevel>,
    /// Minimum number of children before the sanitizer fans out (default: 64)
    pub parallel_threshold: Option<usize>,
}

impl ExecutorOptions {
    /// Get the command timeout, if one is configured.
    pub fn command_timeout_or_default(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// Get isolation_level with default value.
    pub fn isolation_level_or_default(&self) -> IsolationLevel {
        self.isolation_level.unwrap_or_default()
    }

    /// Get parallel_threshold with default value.
    pub fn parallel_threshold_or_default(&self) -> usize {
        self.parallel_threshold
            .unwrap_or(DEFAULT_PARALLEL_THRESHOLD)
    }

    /// Validate executor options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.command_timeout_secs == Some(0) {
            return Err("command_timeout_secs must be greater than 0".to_string());
        }
        if self.parallel_threshold == Some(0) {
            return Err("parallel_threshold must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// One named connection: provider name plus keyword connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub name: String,
    pub provider_name: String,
    /// Keyword connection string (sensitive - log it masked).
    pub connection_string: String,
}

impl ConnectionEntry {
    /// Create a new connection entry.
    pub fn new(
        name: impl Into<String>,
        provider_name: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider_name: provider_name.into(),
            connection_string: connection_string.into(),
        }
    }

    /// Parse a connection entry from a CLI argument.
    ///
    /// # Format
    ///
    /// `NAME=PROVIDER:CONNECTION_STRING`
    ///
    /// # Examples
    ///
    /// ```text
    /// LOCAL=sqlite:Data Source=app.db
    /// REMOTE=postgres:Server=$ServerName;Database=hr;User Id=app;Password=secret
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("Missing '=' in connection entry: {}", s))?;
        let name = name.trim();
        if name.is_empty() {
            return Err("Connection entry name cannot be empty".to_string());
        }

        let (provider_name, connection_string) = rest
            .split_once(':')
            .ok_or_else(|| format!("Missing 'PROVIDER:' in connection entry '{}'", name))?;
        let provider_name = provider_name.trim();
        if provider_name.is_empty() {
            return Err(format!("Connection entry '{}' has no provider", name));
        }

        Ok(Self::new(name, provider_name, connection_string.trim()))
    }
}

/// Named connection settings, as read from the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(default)]
    pub connection_strings: Vec<ConnectionEntry>,
}

impl ConnectionSettings {
    /// Create empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> DbResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            DbError::configuration(
                format!("Invalid settings document: {}", e),
                r#"Expected {"connectionStrings":[{"name":..,"providerName":..,"connectionString":..}]}"#,
            )
        })
    }

    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> DbResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(
                format!("Cannot read settings file {}: {}", path.display(), e),
                "Check the --settings path",
            )
        })?;
        Self::from_json(&json)
    }

    /// Add an entry, replacing any entry with the same name.
    pub fn insert(&mut self, entry: ConnectionEntry) {
        self.connection_strings
            .retain(|e| !e.name.eq_ignore_ascii_case(&entry.name));
        self.connection_strings.push(entry);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_entry(mut self, entry: ConnectionEntry) -> Self {
        self.insert(entry);
        self
    }

    /// Look up an entry by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&ConnectionEntry> {
        self.connection_strings
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Names of all configured entries.
    pub fn names(&self) -> Vec<&str> {
        self.connection_strings
            .iter()
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connection_strings.is_empty()
    }
}

/// Configuration for the pooled-db runner.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pooled-db",
    about = "Run one statement through the pooled transactional executor and print sanitized rows",
    version,
    author
)]
pub struct Config {
    /// JSON settings file with named connection strings.
    #[arg(long = "settings", value_name = "FILE", env = "POOLED_DB_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Named connection entries.
    /// Format: "NAME=PROVIDER:CONNECTION_STRING"
    /// Can be specified multiple times; entries override the settings file.
    #[arg(
        short = 'c',
        long = "connection",
        value_name = "ENTRY",
        env = "POOLED_DB_CONNECTION"
    )]
    pub connections: Vec<String>,

    /// Name of the connection entry to use
    #[arg(
        short,
        long,
        default_value = DEFAULT_CONTEXT_NAME,
        env = "POOLED_DB_NAME"
    )]
    pub name: String,

    /// Server name substituted for $ServerName in the connection string
    #[arg(long, env = "POOLED_DB_SERVER_NAME")]
    pub server_name: Option<String>,

    /// SQL statement to run
    #[arg(long)]
    pub sql: String,

    /// Statement parameter as a JSON scalar (repeatable, bound in order)
    #[arg(short, long = "param", value_name = "JSON")]
    pub params: Vec<String>,

    /// Run the statement inside a transaction
    #[arg(long)]
    pub transaction: bool,

    /// Transaction isolation level
    #[arg(long, default_value = DEFAULT_ISOLATION, env = "POOLED_DB_ISOLATION")]
    pub isolation: String,

    /// Command timeout in seconds
    #[arg(long, env = "POOLED_DB_COMMAND_TIMEOUT")]
    pub command_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "POOLED_DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "POOLED_DB_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            settings: None,
            connections: Vec::new(),
            name: DEFAULT_CONTEXT_NAME.to_string(),
            server_name: None,
            sql: String::new(),
            params: Vec::new(),
            transaction: false,
            isolation: DEFAULT_ISOLATION.to_string(),
            command_timeout: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }

    /// Build the connection settings: the settings file, then CLI entries on top.
    pub fn connection_settings(&self) -> DbResult<ConnectionSettings> {
        let mut settings = match &self.settings {
            Some(path) => ConnectionSettings::load(path)?,
            None => ConnectionSettings::new(),
        };
        for raw in &self.connections {
            let entry = ConnectionEntry::parse(raw).map_err(|e| {
                DbError::configuration(e, "Use NAME=PROVIDER:CONNECTION_STRING")
            })?;
            settings.insert(entry);
        }
        Ok(settings)
    }

    /// Parse the statement parameters.
    pub fn query_params(&self) -> DbResult<Vec<QueryParam>> {
        self.params
            .iter()
            .map(|raw| {
                serde_json::from_str::<QueryParam>(raw).map_err(|e| {
                    DbError::configuration(
                        format!("Invalid parameter {}: {}", raw, e),
                        "Parameters are JSON values, e.g. 42, \"text\", true, null",
                    )
                })
            })
            .collect()
    }

    /// Parse the isolation level.
    pub fn isolation_level(&self) -> DbResult<IsolationLevel> {
        self.isolation.parse()
    }

    /// Build validated executor options.
    pub fn executor_options(&self) -> DbResult<ExecutorOptions> {
        let options = ExecutorOptions {
            command_timeout_secs: self.command_timeout,
            isolation_level: Some(self.isolation_level()?),
            parallel_threshold: None,
        };
        options
            .validate()
            .map_err(|e| DbError::configuration(e, "Check --command-timeout"))?;
        Ok(options)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

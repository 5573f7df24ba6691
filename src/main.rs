//! pooled-db - Main entry point.
//!
//! Runs one statement through the pooled transactional executor against a
//! named connection and prints the sanitized rows as JSON.

use clap::Parser;
use pooled_db::config::Config;
use pooled_db::db::{
    ConnectionPool, Invocation, NamedConnectionProvider, QueryParam, TransactionalExecutor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout stays valid JSON
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let settings = config.connection_settings()?;
    if settings.is_empty() {
        eprintln!("Error: At least one connection must be configured.");
        eprintln!();
        eprintln!("Usage: pooled-db --settings <file.json> --name <NAME> --sql <SQL>");
        eprintln!("       pooled-db --connection <NAME>=<PROVIDER>:<CONNECTION_STRING> --sql <SQL>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  pooled-db -c 'LOCAL=sqlite:Data Source=app.db' --sql 'SELECT * FROM employees'");
        eprintln!(
            "  pooled-db -c 'REMOTE=postgres:Server=$ServerName;Database=hr;User Id=app;Password=secret' \\"
        );
        eprintln!("            --name REMOTE --server-name db-eu-1 --sql 'SELECT 1'");
        std::process::exit(1);
    }

    let options = config.executor_options()?;
    let params: Vec<QueryParam> = config.query_params()?;

    info!(
        name = %config.name,
        transaction = config.transaction,
        "Starting pooled-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let provider = NamedConnectionProvider::new(config.name.clone(), Arc::new(settings))?;
    let executor =
        TransactionalExecutor::with_pool(provider, ConnectionPool::global()).with_options(options);

    // Ctrl-C cancels the invocation; an open transaction is rolled back
    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            ctrl_c_token.cancel();
        }
    });

    let sql = config.sql.clone();
    let mut invocation = Invocation::new()
        .transaction_if(config.transaction, config.isolation_level()?)
        .cancel_with(token);
    if let Some(server_name) = &config.server_name {
        invocation = invocation.on_server(server_name.clone());
    }

    let result = executor
        .execute(invocation, move |conn| {
            Box::pin(async move { conn.fetch_rows(&sql, &params).await })
        })
        .await;

    match result {
        Ok(rows) => {
            info!(rows = rows.len(), "Statement completed");
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, suggestion = ?e.suggestion(), "Statement failed");
            Err(e.into())
        }
    }
}

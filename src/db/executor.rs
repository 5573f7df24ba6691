//! Transactional execution.
//!
//! Every call runs the same lifecycle on a dedicated connection:
//!
//! ```text
//! acquire slot -> open -> (begin)? -> action -> (commit | rollback)? -> close + release
//! ```
//!
//! The action receives the open connection. In transactional mode it is
//! committed when the action succeeds and rolled back when the action or the
//! commit fails; the caller always gets that first error back, paired with the
//! rollback error if rolling back failed too. Results are sanitized before they are returned.
//!
//! [`TransactionalExecutor`] is the async flavour. [`BlockingExecutor`] drives
//! the same lifecycle on its own current-thread runtime for synchronous callers.

use crate::config::ExecutorOptions;
use crate::db::connection::{DbConnection, IsolationLevel};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::provider::ConnectionProvider;
use crate::error::{DbError, DbResult};
use crate::sanitize::{SanitizeMode, Sanitizer, Traversable};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Per-call settings: target server, transaction, cancellation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    server_name: Option<String>,
    transaction: Option<IsolationLevel>,
    cancel: Option<CancellationToken>,
}

impl Invocation {
    /// Create a new invocation without a transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `$ServerName` with `server_name` before connecting.
    pub fn on_server(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Run the action inside a transaction at `level`.
    pub fn in_transaction(mut self, level: IsolationLevel) -> Self {
        self.transaction = Some(level);
        self
    }

    /// Run inside a transaction only when `use_transaction` is set.
    pub fn transaction_if(self, use_transaction: bool, level: IsolationLevel) -> Self {
        if use_transaction {
            self.in_transaction(level)
        } else {
            self
        }
    }

    /// Stop waiting, opening or running the action when `token` fires.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn transaction(&self) -> Option<IsolationLevel> {
        self.transaction
    }
}

/// Async transactional executor over a connection provider.
#[derive(Debug, Clone)]
pub struct TransactionalExecutor<P: ConnectionProvider> {
    provider: P,
    pool: Arc<ConnectionPool>,
    options: ExecutorOptions,
    sanitizer: Sanitizer,
}

impl<P: ConnectionProvider> TransactionalExecutor<P> {
    /// Create a new executor using the process-wide pool.
    pub fn new(provider: P) -> Self {
        Self::with_pool(provider, ConnectionPool::global())
    }

    /// Create a new executor using the given pool.
    pub fn with_pool(provider: P, pool: Arc<ConnectionPool>) -> Self {
        let options = ExecutorOptions::default();
        let sanitizer = Sanitizer::new(SanitizeMode::Concurrent)
            .with_parallel_threshold(options.parallel_threshold_or_default());
        Self {
            provider,
            pool,
            options,
            sanitizer,
        }
    }

    /// Replace the executor options.
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.sanitizer = Sanitizer::new(self.sanitizer.mode())
            .with_parallel_threshold(options.parallel_threshold_or_default());
        self.options = options;
        self
    }

    /// Choose how results are sanitized.
    pub fn with_sanitize_mode(mut self, mode: SanitizeMode) -> Self {
        self.sanitizer = Sanitizer::new(mode)
            .with_parallel_threshold(self.options.parallel_threshold_or_default());
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    // =========================================================================
    // Call shapes
    // =========================================================================

    /// Run `action` on an open connection without a transaction.
    pub async fn with_connection<T, F>(&self, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new(), action).await
    }

    /// Run `action` inside a transaction at `level`.
    pub async fn with_transaction<T, F>(&self, level: IsolationLevel, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new().in_transaction(level), action)
            .await
    }

    /// Run `action`, inside a transaction at the default level when `use_transaction` is set.
    pub async fn run<T, F>(&self, use_transaction: bool, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let level = self.options.isolation_level_or_default();
        self.execute(Invocation::new().transaction_if(use_transaction, level), action)
            .await
    }

    /// [`with_connection`](Self::with_connection) against a named server.
    pub async fn with_server_connection<T, F>(&self, server_name: &str, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new().on_server(server_name), action)
            .await
    }

    /// [`with_transaction`](Self::with_transaction) against a named server.
    pub async fn with_server_transaction<T, F>(
        &self,
        server_name: &str,
        level: IsolationLevel,
        action: F,
    ) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let invocation = Invocation::new()
            .on_server(server_name)
            .in_transaction(level);
        self.execute(invocation, action).await
    }

    /// [`run`](Self::run) against a named server.
    pub async fn run_on_server<T, F>(
        &self,
        server_name: &str,
        use_transaction: bool,
        action: F,
    ) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let level = self.options.isolation_level_or_default();
        let invocation = Invocation::new()
            .on_server(server_name)
            .transaction_if(use_transaction, level);
        self.execute(invocation, action).await
    }

    /// [`run`](Self::run) that stops when `token` is cancelled.
    ///
    /// Cancellation applies to the slot wait, the open and the action. A
    /// transaction that was already begun is rolled back before the
    /// connection is closed.
    pub async fn run_cancellable<T, F>(
        &self,
        token: CancellationToken,
        use_transaction: bool,
        action: F,
    ) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let level = self.options.isolation_level_or_default();
        let invocation = Invocation::new()
            .transaction_if(use_transaction, level)
            .cancel_with(token);
        self.execute(invocation, action).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run `action` with the settings in `invocation`. Every call shape ends up here.
    pub async fn execute<T, F>(&self, invocation: Invocation, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let invocation_id = Uuid::new_v4();
        let span = info_span!(
            "invocation",
            id = %invocation_id,
            context = %self.provider.context_name(),
            server = ?invocation.server_name(),
            transaction = ?invocation.transaction(),
        );
        self.execute_inner(invocation, action).instrument(span).await
    }

    async fn execute_inner<T, F>(&self, invocation: Invocation, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let start = Instant::now();
        let token = invocation.cancel.as_ref();
        let server_name = invocation.server_name();

        let mut conn = match token {
            Some(token) => {
                self.pool
                    .acquire_with_cancel(&self.provider, server_name, token)
                    .await?
            }
            None => self.pool.acquire(&self.provider, server_name).await?,
        };
        debug!("Connection slot acquired");

        let result = self
            .run_on(&mut conn, invocation.transaction, token, action)
            .await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close connection");
        }
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Connection released");

        let value = result?;
        self.sanitize(value).await
    }

    async fn run_on<T, F>(
        &self,
        conn: &mut PooledConnection<P::Connection>,
        transaction: Option<IsolationLevel>,
        token: Option<&CancellationToken>,
        action: F,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        cancellable(token, "opening the connection", conn.open()).await?;
        debug!("Connection opened");

        let Some(level) = transaction else {
            return self.run_action(conn, token, action).await;
        };

        cancellable(token, "beginning a transaction", conn.begin(level)).await?;

        let outcome = match self.run_action(conn, token, action).await {
            Ok(value) => conn.commit().await.map(|()| value),
            Err(e) => Err(e),
        };
        let original = match outcome {
            Ok(value) => {
                debug!("Transaction committed");
                return Ok(value);
            }
            Err(original) => original,
        };

        // A failed action or commit leaves the transaction open; roll it back.
        let limit = self.options.command_timeout_or_default();
        match with_command_timeout(limit, "rollback", conn.rollback()).await {
            Ok(()) => {
                warn!(error = %original, "Transaction rolled back");
                Err(original)
            }
            Err(rollback) => {
                error!(
                    error = %original,
                    rollback_error = %rollback,
                    "Rollback failed"
                );
                Err(DbError::rollback(original, rollback))
            }
        }
    }

    async fn run_action<T, F>(
        &self,
        conn: &mut PooledConnection<P::Connection>,
        token: Option<&CancellationToken>,
        action: F,
    ) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let connection: &mut P::Connection = conn;
        let future = action(connection);
        let limit = self.options.command_timeout_or_default();
        let future = with_command_timeout(limit, "action", future);
        cancellable(token, "running the action", future).await
    }

    async fn sanitize<T: Traversable + 'static>(&self, mut value: T) -> DbResult<T> {
        let sanitizer = self.sanitizer;
        if sanitizer.mode() == SanitizeMode::Sequential {
            let stats = sanitizer.run(&mut value);
            debug!(?stats, "Result sanitized");
            return Ok(value);
        }

        let (value, stats) = tokio::task::spawn_blocking(move || {
            let stats = sanitizer.run(&mut value);
            (value, stats)
        })
        .await
        .map_err(|e| DbError::execution(format!("Sanitizer task failed: {}", e), None, ""))?;
        debug!(?stats, "Result sanitized");
        Ok(value)
    }
}

/// Race `future` against `token`, if there is one.
async fn cancellable<R>(
    token: Option<&CancellationToken>,
    stage: &str,
    future: impl Future<Output = DbResult<R>>,
) -> DbResult<R> {
    let Some(token) = token else {
        return future.await;
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            info!(stage, "Invocation cancelled");
            Err(DbError::cancelled(stage))
        }
        result = future => result,
    }
}

/// Bound `future` by the command timeout, if one is configured.
async fn with_command_timeout<R>(
    limit: Option<Duration>,
    operation: &str,
    future: impl Future<Output = DbResult<R>>,
) -> DbResult<R> {
    let Some(limit) = limit else {
        return future.await;
    };
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(DbError::command_timeout(
            operation,
            limit.as_millis() as u64,
        )),
    }
}

/// Synchronous executor driving the async lifecycle on its own runtime.
///
/// Must not be used from inside an async runtime: blocking a runtime worker
/// on another runtime panics in tokio, so such calls return a configuration
/// error instead.
#[derive(Debug)]
pub struct BlockingExecutor<P: ConnectionProvider> {
    inner: TransactionalExecutor<P>,
    runtime: tokio::runtime::Runtime,
}

impl<P: ConnectionProvider> BlockingExecutor<P> {
    /// Create a new blocking executor using the process-wide pool.
    pub fn new(provider: P) -> DbResult<Self> {
        Self::from_async(TransactionalExecutor::new(provider))
    }

    /// Create a new blocking executor using the given pool.
    pub fn with_pool(provider: P, pool: Arc<ConnectionPool>) -> DbResult<Self> {
        Self::from_async(TransactionalExecutor::with_pool(provider, pool))
    }

    /// Wrap an async executor. Results are sanitized sequentially on the calling thread.
    pub fn from_async(executor: TransactionalExecutor<P>) -> DbResult<Self> {
        ensure_outside_runtime()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                DbError::configuration(
                    format!("Failed to start blocking runtime: {}", e),
                    "Check thread and file descriptor limits",
                )
            })?;
        Ok(Self {
            inner: executor.with_sanitize_mode(SanitizeMode::Sequential),
            runtime,
        })
    }

    pub fn executor(&self) -> &TransactionalExecutor<P> {
        &self.inner
    }

    /// Blocking [`TransactionalExecutor::with_connection`].
    pub fn with_connection<T, F>(&self, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new(), action)
    }

    /// Blocking [`TransactionalExecutor::with_transaction`].
    pub fn with_transaction<T, F>(&self, level: IsolationLevel, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new().in_transaction(level), action)
    }

    /// Blocking [`TransactionalExecutor::run`].
    pub fn run<T, F>(&self, use_transaction: bool, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let level = self.inner.options.isolation_level_or_default();
        self.execute(Invocation::new().transaction_if(use_transaction, level), action)
    }

    /// Blocking [`TransactionalExecutor::with_server_connection`].
    pub fn with_server_connection<T, F>(&self, server_name: &str, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.execute(Invocation::new().on_server(server_name), action)
    }

    /// Blocking [`TransactionalExecutor::with_server_transaction`].
    pub fn with_server_transaction<T, F>(
        &self,
        server_name: &str,
        level: IsolationLevel,
        action: F,
    ) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let invocation = Invocation::new()
            .on_server(server_name)
            .in_transaction(level);
        self.execute(invocation, action)
    }

    /// Blocking [`TransactionalExecutor::run_on_server`].
    pub fn run_on_server<T, F>(
        &self,
        server_name: &str,
        use_transaction: bool,
        action: F,
    ) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let level = self.inner.options.isolation_level_or_default();
        let invocation = Invocation::new()
            .on_server(server_name)
            .transaction_if(use_transaction, level);
        self.execute(invocation, action)
    }

    /// Blocking [`TransactionalExecutor::execute`].
    pub fn execute<T, F>(&self, invocation: Invocation, action: F) -> DbResult<T>
    where
        T: Traversable + 'static,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        ensure_outside_runtime()?;
        self.runtime
            .block_on(self.inner.execute(invocation, action))
    }
}

fn ensure_outside_runtime() -> DbResult<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(DbError::configuration(
            "BlockingExecutor called from inside an async runtime",
            "Use TransactionalExecutor from async code",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builders() {
        let invocation = Invocation::new()
            .on_server("db-1")
            .transaction_if(true, IsolationLevel::Serializable);
        assert_eq!(invocation.server_name(), Some("db-1"));
        assert_eq!(invocation.transaction(), Some(IsolationLevel::Serializable));

        let plain = Invocation::new().transaction_if(false, IsolationLevel::Serializable);
        assert_eq!(plain.transaction(), None);
    }

    #[tokio::test]
    async fn test_command_timeout_fires() {
        let result = with_command_timeout(Some(Duration::from_millis(10)), "action", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(DbError::CommandTimeout { elapsed_ms: Some(10), .. })
        ));
    }

    #[tokio::test]
    async fn test_no_command_timeout_passes_through() {
        let result = with_command_timeout(None, "action", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancellable_without_token() {
        let result = cancellable(None, "stage", async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_cancellable_with_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let result: DbResult<()> = cancellable(Some(&token), "opening", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DbError::Cancelled { stage }) if stage == "opening"));
    }

    #[tokio::test]
    async fn test_blocking_executor_rejected_inside_runtime() {
        assert!(matches!(
            ensure_outside_runtime(),
            Err(DbError::Configuration { .. })
        ));
    }

    #[test]
    fn test_outside_runtime_is_allowed() {
        assert!(ensure_outside_runtime().is_ok());
    }
}

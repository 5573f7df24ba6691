//! Connection pool management.
//!
//! The pool bounds how many connections may be open at once for each distinct
//! connection string. Each string gets a slot set (a counting semaphore) sized
//! from its own `Max Pool Size` keyword, created on first sight and kept for
//! the lifetime of the pool. Connections themselves are not reused: every
//! acquisition creates a fresh connection through the provider and holds one
//! slot until it is closed or dropped.

use crate::db::connection::DbConnection;
use crate::db::connection_string;
use crate::db::provider::ConnectionProvider;
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static GLOBAL_POOL: OnceLock<Arc<ConnectionPool>> = OnceLock::new();

/// Snapshot of one slot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    /// Maximum allowed connections.
    pub max: u32,
    /// Number of slots currently held.
    pub in_use: u32,
    /// Number of free slots.
    pub available: u32,
}

/// Bounded slot set for one connection string.
#[derive(Debug)]
struct SlotSet {
    max: u32,
    semaphore: Arc<Semaphore>,
}

impl SlotSet {
    fn new(max: u32) -> Self {
        Self {
            max,
            semaphore: Arc::new(Semaphore::new(max as usize)),
        }
    }

    fn status(&self) -> PoolStatus {
        let available = self.semaphore.available_permits() as u32;
        PoolStatus {
            max: self.max,
            in_use: self.max.saturating_sub(available),
            available,
        }
    }
}

/// Registry of slot sets keyed by the exact connection string.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    slots: RwLock<HashMap<String, Arc<SlotSet>>>,
}

impl ConnectionPool {
    /// Create a new, isolated pool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool registry.
    pub fn global() -> Arc<ConnectionPool> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Arc::new(ConnectionPool::new())))
    }

    /// Acquire a slot and a fresh connection from `provider`.
    ///
    /// With a server name, the provider substitutes it into the connection
    /// string first, so each server gets its own slot set.
    pub async fn acquire<P: ConnectionProvider>(
        &self,
        provider: &P,
        server_name: Option<&str>,
    ) -> DbResult<PooledConnection<P::Connection>> {
        let connection = Self::create(provider, server_name)?;
        let slots = self.slot_set(connection.connection_string())?;
        let permit = Arc::clone(&slots.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DbError::pool_initialization("Slot set was closed"))?;
        Ok(PooledConnection::new(connection, permit))
    }

    /// Like [`acquire`](Self::acquire), but gives up waiting for a slot when `token` fires.
    pub async fn acquire_with_cancel<P: ConnectionProvider>(
        &self,
        provider: &P,
        server_name: Option<&str>,
        token: &CancellationToken,
    ) -> DbResult<PooledConnection<P::Connection>> {
        if token.is_cancelled() {
            return Err(DbError::cancelled("waiting for a connection slot"));
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DbError::cancelled("waiting for a connection slot")),
            pooled = self.acquire(provider, server_name) => pooled,
        }
    }

    /// Status of the slot set for a connection string, if it has been seen.
    pub fn status(&self, connection_string: &str) -> Option<PoolStatus> {
        let slots = self.slots.read().ok()?;
        slots.get(connection_string).map(|s| s.status())
    }

    /// Number of distinct connection strings seen so far.
    pub fn pool_count(&self) -> usize {
        self.slots.read().map(|slots| slots.len()).unwrap_or(0)
    }

    fn create<P: ConnectionProvider>(
        provider: &P,
        server_name: Option<&str>,
    ) -> DbResult<P::Connection> {
        match server_name {
            Some(server_name) => provider.create_connection_for_server(server_name),
            None => provider.create_connection(),
        }
    }

    /// Get the slot set for `key`, creating it on first sight.
    fn slot_set(&self, key: &str) -> DbResult<Arc<SlotSet>> {
        {
            let slots = self.slots.read().map_err(|_| {
                DbError::pool_initialization("Failed to create new connection pool")
            })?;
            if let Some(existing) = slots.get(key) {
                return Ok(Arc::clone(existing));
            }
        } // Read lock released here

        let mut slots = self
            .slots
            .write()
            .map_err(|_| DbError::pool_initialization("Failed to create new connection pool"))?;
        // A concurrent first-time caller may have won the race; keep its set.
        let slot_set = slots.entry(key.to_string()).or_insert_with(|| {
            let max = connection_string::max_pool_size(key);
            info!(
                target = %connection_string::masked(key),
                max_pool_size = max,
                "Created connection pool"
            );
            Arc::new(SlotSet::new(max))
        });
        Ok(Arc::clone(slot_set))
    }
}

/// A connection holding one pool slot.
///
/// The slot is released exactly once: by [`close`](Self::close) or on drop,
/// whichever happens first.
#[derive(Debug)]
pub struct PooledConnection<C: DbConnection> {
    connection: C,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: DbConnection> PooledConnection<C> {
    fn new(connection: C, permit: OwnedSemaphorePermit) -> Self {
        Self {
            connection,
            permit: Some(permit),
        }
    }

    /// Close the physical connection and release the slot.
    ///
    /// The slot is released even if closing fails. Calling this again is a no-op.
    pub async fn close(&mut self) -> DbResult<()> {
        if self.permit.is_none() {
            return Ok(());
        }
        let result = self.connection.close().await;
        self.release();
        result
    }

    /// Whether the slot has already been given back.
    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }

    fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!("Released connection slot");
        }
    }
}

impl<C: DbConnection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C: DbConnection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}

impl<C: DbConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.release();
    }
}

//! Integration tests for per-connection-string slot sets.

mod common;

use common::MockProvider;
use futures_util::future::join_all;
use pooled_db::db::{ConnectionPool, DbConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_distinct_strings_get_distinct_slot_sets() {
    let pool = ConnectionPool::new();
    let small = MockProvider::new("Db=a;Max Pool Size=1");
    let large = MockProvider::new("Db=b;Max Pool Size=5");

    let _a = pool.acquire(&small, None).await.unwrap();
    let _b = pool.acquire(&large, None).await.unwrap();

    assert_eq!(pool.pool_count(), 2);
    let a = pool.status("Db=a;Max Pool Size=1").unwrap();
    let b = pool.status("Db=b;Max Pool Size=5").unwrap();
    assert_eq!((a.max, a.in_use, a.available), (1, 1, 0));
    assert_eq!((b.max, b.in_use, b.available), (5, 1, 4));
}

#[tokio::test]
async fn test_server_name_is_part_of_the_key() {
    let pool = ConnectionPool::new();
    let provider = MockProvider::new("Server=$ServerName;Max Pool Size=1");

    // Both slots are held at once: different servers never wait on each other.
    let eu = pool.acquire(&provider, Some("eu")).await.unwrap();
    let us = pool.acquire(&provider, Some("us")).await.unwrap();

    assert_eq!(eu.connection_string(), "Server=eu;Max Pool Size=1");
    assert_eq!(us.connection_string(), "Server=us;Max Pool Size=1");
    assert_eq!(pool.pool_count(), 2);
}

#[tokio::test]
async fn test_concurrent_first_acquisition_creates_one_slot_set() {
    let pool = Arc::new(ConnectionPool::new());
    let provider = MockProvider::new("Db=race;Max Pool Size=16");

    let acquisitions = (0..16).map(|_| {
        let pool = Arc::clone(&pool);
        let provider = provider.clone();
        tokio::spawn(async move { pool.acquire(&provider, None).await })
    });
    let held: Vec<_> = join_all(acquisitions)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(pool.pool_count(), 1);
    let status = pool.status("Db=race;Max Pool Size=16").unwrap();
    assert_eq!(status.in_use, 16);
    assert_eq!(status.available, 0);
    drop(held);
    assert_eq!(pool.status("Db=race;Max Pool Size=16").unwrap().available, 16);
}

#[tokio::test]
async fn test_acquire_waits_for_release() {
    let pool = Arc::new(ConnectionPool::new());
    let provider = MockProvider::new("Db=wait;Max Pool Size=1");

    let mut first = pool.acquire(&provider, None).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        let provider = provider.clone();
        tokio::spawn(async move { pool.acquire(&provider, None).await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    first.close().await.unwrap();
    assert!(first.is_released());
    // Closing twice is harmless and does not free a second slot.
    first.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let status = pool.status("Db=wait;Max Pool Size=1").unwrap();
    assert_eq!(status.available, 1);
}

#[tokio::test]
async fn test_cancel_stops_waiting() {
    let pool = ConnectionPool::new();
    let provider = MockProvider::new("Db=cancel;Max Pool Size=1");
    let _held = pool.acquire(&provider, None).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = pool.acquire_with_cancel(&provider, None, &token).await;
    assert!(result.is_err());
    assert_eq!(pool.status("Db=cancel;Max Pool Size=1").unwrap().in_use, 1);
}

#[tokio::test]
async fn test_malformed_or_missing_size_uses_default() {
    let pool = ConnectionPool::new();
    for cs in ["Db=x;Max Pool Size=lots", "Db=y;Max Pool Size=0", "Db=z"] {
        let provider = MockProvider::new(cs);
        let _conn = pool.acquire(&provider, None).await.unwrap();
        assert_eq!(pool.status(cs).unwrap().max, 100, "{}", cs);
    }
}

#[tokio::test]
async fn test_global_pool_is_shared() {
    let a = ConnectionPool::global();
    let b = ConnectionPool::global();
    assert!(Arc::ptr_eq(&a, &b));
}

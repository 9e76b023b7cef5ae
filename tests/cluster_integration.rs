//! Integration tests for cluster operations.
//!
//! These tests require a real cluster running on localhost.
//! All tests are marked with #[ignore] by default.
//!
//! Setup with Docker:
//! ```bash
//! docker run -d --name redis-cluster \
//!   -p 7000-7005:7000-7005 \
//!   grokzen/redis-cluster:latest
//! ```
//!
//! Run tests:
//! ```bash
//! cargo test --test cluster_integration -- --ignored
//! ```

#![cfg(feature = "cluster")]

use std::time::Duration;

use bytes::Bytes;
use shardis::cluster::{ClusterClient, Route};
use shardis::core::command;
use shardis::{key_slot, Error, Result};

const SEEDS: &str = "127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002";

/// Helper function to create a cluster client for testing.
async fn create_test_client() -> Result<ClusterClient> {
    ClusterClient::connect(SEEDS).await
}

#[tokio::test]
#[ignore]
async fn test_cluster_connect() {
    let client = create_test_client().await.expect("failed to connect");

    let node_count = client.node_count();
    assert!(node_count >= 3, "expected at least 3 primaries, got {}", node_count);
    assert!(client.is_fully_covered(), "cluster should cover all 16384 slots");

    client.ping_all().await.expect("PING on every primary failed");
}

#[tokio::test]
#[ignore]
async fn test_cluster_basic_operations() {
    let client = create_test_client().await.expect("failed to connect");

    let key = "integration:test:basic";
    let value = Bytes::from("Hello, Cluster!");

    client.set(key, value.clone()).await.expect("SET failed");
    let retrieved = client.get(key).await.expect("GET failed");
    assert_eq!(retrieved, Some(value), "retrieved value should match");

    assert!(client.exists(key).await.expect("EXISTS failed"));
    assert_eq!(client.del(key).await.expect("DEL failed"), 1);
    assert!(!client.exists(key).await.expect("EXISTS failed"));
}

#[tokio::test]
#[ignore]
async fn test_cluster_hash_tags() {
    let client = create_test_client().await.expect("failed to connect");

    let keys = ["user:{12345}:name", "user:{12345}:email", "user:{12345}:age"];
    let slot = key_slot(keys[0]);
    assert!(keys.iter().all(|key| key_slot(key) == slot));

    for (i, key) in keys.iter().enumerate() {
        client
            .set(*key, format!("value_{}", i))
            .await
            .expect("SET with hash tag failed");
    }

    let values = client.mget(keys).await.expect("MGET failed");
    for (i, value) in values.iter().enumerate() {
        assert_eq!(value.as_deref(), Some(format!("value_{}", i).as_bytes()));
    }

    for key in &keys {
        client.del(*key).await.expect("DEL failed");
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_cross_slot_rejected() {
    let client = create_test_client().await.expect("failed to connect");

    let err = client.mget(["foo", "bar"]).await.unwrap_err();
    assert!(matches!(err, Error::CrossSlot));
}

#[tokio::test]
#[ignore]
async fn test_cluster_topology_refresh() {
    let client = create_test_client().await.expect("failed to connect");

    let node_count_before = client.node_count();
    client.refresh_topology().await.expect("refresh failed");

    assert_eq!(node_count_before, client.node_count());
    assert!(client.is_fully_covered());
}

#[tokio::test]
#[ignore]
async fn test_cluster_slot_pinned_pipeline() {
    let client = create_test_client().await.expect("failed to connect");

    let mut conn = client
        .connection_for_key("{pipeline}")
        .await
        .expect("no connection for slot");
    let mut pipeline = conn.pipeline();
    pipeline.set("{pipeline}.a", "1");
    let counter = pipeline.incr("{pipeline}.counter");
    let a = pipeline.get("{pipeline}.a");
    pipeline.sync().await.expect("pipeline failed");

    assert!(counter.get().expect("INCR failed") >= 1);
    assert_eq!(a.get().expect("GET failed"), Some(Bytes::from("1")));
}

#[tokio::test]
#[ignore]
async fn test_cluster_generic_command() {
    let client = create_test_client().await.expect("failed to connect");

    let key = "integration:generic";
    client.set(key, "abc").await.expect("SET failed");
    let len: i64 = client
        .execute(Route::for_key(key), &command::Cmd::named("STRLEN").arg(key))
        .await
        .expect("STRLEN failed");
    assert_eq!(len, 3);
}

#[tokio::test]
#[ignore]
async fn test_cluster_concurrent_operations() {
    let client = create_test_client().await.expect("failed to connect");

    let mut handles = vec![];
    for i in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("concurrent:test:{}", i);
            let value = Bytes::from(format!("value_{}", i));

            client.set(key.clone(), value.clone()).await?;
            assert_eq!(client.get(key.clone()).await?, Some(value));
            assert_eq!(client.del(key).await?, 1);

            Ok::<_, Error>(())
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked").expect("operation failed");
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_expiry() {
    let client = create_test_client().await.expect("failed to connect");

    let key = "integration:expiry";
    client
        .set_with_expiry(key, "short-lived", Duration::from_secs(1))
        .await
        .expect("SET EX failed");
    assert!(client.exists(key).await.expect("EXISTS failed"));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!client.exists(key).await.expect("EXISTS failed"));
}

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - `MemoryTransport`, an in-process remote with fault injection
//! - `TestDb`, a `MemoryStore` on a temporary blob directory
//! - Replicator run helpers

#![allow(dead_code)]

pub mod memory_transport;

pub use memory_transport::*;

use doc_replication::{
    BlobStore, MemoryStore, ReplicationDirection, Replicator, ReplicatorConfig, ReplicatorStatus,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Install a subscriber once; `RUST_LOG=doc_replication=debug` shows the engine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A database on its own temporary directory.
pub struct TestDb {
    pub store: Arc<MemoryStore>,
    _dir: TempDir,
}

impl TestDb {
    pub fn new(name: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs = BlobStore::open(dir.path().join("blobs")).expect("blob store");
        let store = MemoryStore::new(blobs).with_uuid(format!("{name}-uuid"));
        Self {
            store: Arc::new(store),
            _dir: dir,
        }
    }

    pub fn with_store(store: MemoryStore, dir: TempDir) -> Self {
        Self {
            store: Arc::new(store),
            _dir: dir,
        }
    }
}

/// JSON object literal as a document body.
pub fn body(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object body")
}

pub fn config(direction: ReplicationDirection) -> ReplicatorConfig {
    ReplicatorConfig::for_testing("memory://remote", direction)
}

/// Run a one-shot replication to completion.
pub async fn replicate(
    config: ReplicatorConfig,
    local: &TestDb,
    transport: Arc<MemoryTransport>,
) -> ReplicatorStatus {
    let replicator = Replicator::new(config, Arc::clone(&local.store), transport);
    run_to_stop(&replicator).await
}

/// Start and wait for the replicator to stop on its own.
pub async fn run_to_stop(replicator: &Replicator<MemoryStore, MemoryTransport>) -> ReplicatorStatus {
    replicator.start().await.expect("start");
    tokio::time::timeout(Duration::from_secs(10), replicator.wait_until_stopped())
        .await
        .expect("replication did not stop")
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

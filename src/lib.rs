// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Document Replication
//!
//! Push/pull replication of revisioned JSON documents between a local store
//! and a remote database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               Replicator                                 │
//! │                                                                          │
//! │  ┌──────────┐   changes    ┌──────────────┐   force_insert   ┌────────┐  │
//! │  │          │─────────────►│ Puller       │─────────────────►│        │  │
//! │  │          │  bulk_get    │ (lanes +     │  (Batcher)       │ Local  │  │
//! │  │ Transport│─────────────►│  bulkhead)   │                  │ Store  │  │
//! │  │          │              └──────────────┘                  │        │  │
//! │  │          │  revs_diff   ┌──────────────┐   changes_since  │        │  │
//! │  │          │◄─────────────│ Pusher       │◄─────────────────│        │  │
//! │  │          │  bulk_docs   │ (purge queue)│                  │        │  │
//! │  └──────────┘              └──────────────┘                  └────────┘  │
//! │                                   │                              │       │
//! │                                   ▼                              ▼       │
//! │                   ┌────────────────────────────┐        ┌─────────────┐  │
//! │                   │ SequenceTracker→Checkpoint │        │ BlobStore   │  │
//! │                   │ (contiguous prefix only)   │        │ (SHA-1 keys)│  │
//! │                   └────────────────────────────┘        └─────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Deterministic winners**: every replica holding the same revisions
//!    picks the same winning revision, whatever order they arrived in.
//! 2. **Monotonic checkpoints**: a checkpoint never passes work that has not
//!    completed, so a crash or stop only re-does work.
//! 3. **Conflict tolerance**: pulled revisions are always inserted; conflicts
//!    are kept as extra leaves and optionally resolved locally.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replication::{BlobStore, MemoryStore, Replicator, ReplicatorConfig};
//! # use doc_replication::transport::Transport;
//! use std::sync::Arc;
//!
//! # async fn run<T: Transport>(transport: Arc<T>) -> doc_replication::Result<()> {
//! let blobs = BlobStore::open("/var/lib/notes/attachments")?;
//! let store = Arc::new(MemoryStore::new(blobs));
//!
//! let replicator = Replicator::new(ReplicatorConfig::new("https://db.example.com/notes"), store, transport);
//! replicator.start().await?;
//! let status = replicator.wait_until_stopped().await;
//! println!("replicated {} revisions", status.progress.completed);
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod blob_store;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod local_store;
pub mod metrics;
pub mod replicator;
pub mod resilience;
pub mod revision;
pub mod sequence_tracker;
pub mod transport;

// Re-exports for convenience
pub use batcher::Batcher;
pub use blob_store::{BlobKey, BlobStore, BlobStoreError, BlobWriter};
pub use checkpoint::{CheckpointDoc, Checkpointer, SqliteCheckpointStore};
pub use config::{ReplicationDirection, ReplicationSettings, ReplicatorConfig};
pub use error::{ErrorClass, ReplicationError, Result};
pub use local_store::{LocalStore, MemoryStore, StoreError};
pub use replicator::{
    ActivityLevel, Direction, DocumentReplication, Progress, Replicator, ReplicatorStatus,
};
pub use revision::{
    AttachmentMeta, ConflictResolver, DefaultResolver, Revision, RevisionId, RevisionTree,
};
pub use sequence_tracker::SequenceTracker;
pub use transport::{Authorizer, Transport, TransportError, TransportErrorKind};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store interface.
//!
//! Defines what the replicator needs from the embedded database it replicates:
//! 1. Insert replicated revisions with their history (`force_insert`)
//! 2. Report which revisions are missing (`find_missing`)
//! 3. Enumerate local changes by sequence (`changes_since`)
//! 4. Persist checkpoint documents (`get_checkpoint` / `set_checkpoint`)
//!
//! The storage engine itself is out of scope; [`MemoryStore`] implements the
//! interface on top of [`RevisionTree`](crate::revision::RevisionTree) so the
//! replicator can be exercised end to end.
//!
//! # Example
//!
//! ```rust,ignore
//! impl LocalStore for MyDatabase {
//!     fn local_uuid(&self) -> String {
//!         self.uuid.clone()
//!     }
//!
//!     fn force_insert(
//!         &self,
//!         rev: Revision,
//!         history: Vec<RevisionId>,
//!         allow_conflict: bool,
//!     ) -> StoreFuture<'_, InsertOutcome> {
//!         Box::pin(async move { self.engine.insert(rev, history, allow_conflict).await })
//!     }
//!     // ...
//! }
//! ```

mod memory;

pub use memory::{DocumentInfo, MemoryStore};

use crate::blob_store::BlobStore;
use crate::checkpoint::CheckpointDoc;
use crate::revision::{InsertOutcome, Revision, RevisionError, RevisionId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type for local store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed local store futures.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Predicate deciding whether a local revision is pushed.
pub type RevisionFilter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// Errors from the local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A local write's parent is not the current winner.
    #[error("Conflict writing {doc_id}")]
    Conflict { doc_id: String },

    #[error("Not found: {doc_id} {rev_id:?}")]
    NotFound {
        doc_id: String,
        rev_id: Option<String>,
    },

    /// The revision or its history is invalid.
    #[error("Malformed revision: {0}")]
    Malformed(RevisionError),

    /// The store cannot be used (closed, corrupt, out of space).
    #[error("Store unusable: {0}")]
    Unusable(String),

    /// Durable checkpoint storage failed.
    #[error("Checkpoint storage failed: {0}")]
    Checkpoint(#[from] sqlx::Error),
}

impl From<RevisionError> for StoreError {
    fn from(e: RevisionError) -> Self {
        match e {
            RevisionError::Conflict { doc_id, .. } => StoreError::Conflict { doc_id },
            other => StoreError::Malformed(other),
        }
    }
}

/// Answer to [`LocalStore::find_missing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingRevisions {
    /// Requested revisions the store has no content for.
    pub missing: Vec<RevisionId>,
    /// Local revisions that may be ancestors of the missing ones, newest first.
    pub possible_ancestors: Vec<RevisionId>,
}

/// One page of local changes.
#[derive(Debug, Clone, Default)]
pub struct LocalChanges {
    /// Leaf revisions changed in this page that passed the filter, by sequence.
    pub revisions: Vec<Revision>,
    /// Highest sequence examined; pass as `since` for the next page.
    pub last_sequence: i64,
}

/// What the replicator needs from the local database.
///
/// Implementations clone borrowed arguments into the returned future.
pub trait LocalStore: Send + Sync + 'static {
    /// Identity of this database; checkpoints written by another are ignored.
    fn local_uuid(&self) -> String;

    /// Attachment storage shared by everything using this database.
    fn blob_store(&self) -> &BlobStore;

    /// A revision (the current winner when `rev_id` is `None`).
    fn get_revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
    ) -> StoreFuture<'_, Option<Revision>>;

    /// Insert a revision with its ancestry (parent first).
    fn force_insert(
        &self,
        rev: Revision,
        history: Vec<RevisionId>,
        allow_conflict: bool,
    ) -> StoreFuture<'_, InsertOutcome>;

    /// Which of `rev_ids` are missing, plus up to `ancestor_limit` local
    /// revisions that could be their ancestors.
    fn find_missing(
        &self,
        doc_id: &str,
        rev_ids: &[RevisionId],
        ancestor_limit: usize,
    ) -> StoreFuture<'_, MissingRevisions>;

    /// Ancestors of a revision, parent first.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId)
        -> StoreFuture<'_, Vec<RevisionId>>;

    /// Up to `limit` changes after sequence `since`.
    fn changes_since(
        &self,
        since: i64,
        limit: usize,
        filter: Option<RevisionFilter>,
    ) -> StoreFuture<'_, LocalChanges>;

    /// Drop bodies of the ancestors of a pushed revision. Returns how many.
    fn purge_obsolete(&self, doc_id: &str, rev_id: &RevisionId) -> StoreFuture<'_, usize>;

    fn get_checkpoint(&self, key: &str) -> StoreFuture<'_, Option<CheckpointDoc>>;

    fn set_checkpoint(&self, key: &str, doc: CheckpointDoc) -> StoreFuture<'_, ()>;

    /// Notifications of newly assigned sequences, if supported.
    fn subscribe(&self) -> Option<broadcast::Receiver<i64>> {
        None
    }
}

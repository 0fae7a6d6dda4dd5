// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory local store.
//!
//! Documents are [`RevisionTree`]s in a map behind one lock; every mutation
//! is synchronous under that lock, so each insert is atomic. Sequences are
//! assigned from a single counter and broadcast to subscribers after the lock
//! is released.
//!
//! Checkpoints live in memory, or in a [`SqliteCheckpointStore`] when one is
//! attached so they survive a restart.

use super::{
    LocalChanges, LocalStore, MissingRevisions, RevisionFilter, StoreError, StoreFuture,
    StoreResult,
};
use crate::blob_store::{BlobKey, BlobStore};
use crate::checkpoint::{CheckpointDoc, SqliteCheckpointStore};
use crate::error::{ReplicationError, Result};
use crate::revision::{
    resolution_revisions, AttachmentMeta, ConflictResolver, InsertOutcome, InsertStatus,
    Revision, RevisionError, RevisionId, RevisionTree,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Summary of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub winner: RevisionId,
    pub deleted: bool,
    pub in_conflict: bool,
    /// Leaf IDs, greatest first.
    pub leaves: Vec<RevisionId>,
}

#[derive(Default)]
struct State {
    docs: HashMap<String, RevisionTree>,
    last_sequence: i64,
}

enum CheckpointBackend {
    Memory(Mutex<HashMap<String, CheckpointDoc>>),
    Sqlite(SqliteCheckpointStore),
}

/// [`LocalStore`] backed by in-memory revision trees.
pub struct MemoryStore {
    uuid: String,
    blobs: BlobStore,
    state: RwLock<State>,
    checkpoints: CheckpointBackend,
    resolver: Option<Arc<dyn ConflictResolver>>,
    changes: broadcast::Sender<i64>,
}

impl MemoryStore {
    pub fn new(blobs: BlobStore) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            blobs,
            state: RwLock::new(State::default()),
            checkpoints: CheckpointBackend::Memory(Mutex::new(HashMap::new())),
            resolver: None,
            changes,
        }
    }

    /// Use a fixed database identity (a reopened database keeps its UUID).
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Persist checkpoints in SQLite.
    pub fn with_checkpoint_store(mut self, store: SqliteCheckpointStore) -> Self {
        self.checkpoints = CheckpointBackend::Sqlite(store);
        self
    }

    /// Resolve conflicts as they appear.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Create or update a document. `parent` must be the current winner
    /// (or `None` for a new document).
    pub fn put(
        &self,
        doc_id: &str,
        body: Map<String, Value>,
        parent: Option<&RevisionId>,
    ) -> Result<Revision> {
        self.write(doc_id, Some(body), false, parent, Vec::new())
    }

    /// Delete a document by adding a tombstone on `parent`.
    pub fn delete(&self, doc_id: &str, parent: &RevisionId) -> Result<Revision> {
        self.write(doc_id, None, true, Some(parent), Vec::new())
    }

    /// Create or update a document with attachments `(name, bytes, content type)`.
    ///
    /// Bytes go to the blob store first; the revision only carries metadata.
    pub fn put_with_attachments(
        &self,
        doc_id: &str,
        body: Map<String, Value>,
        parent: Option<&RevisionId>,
        attachments: Vec<(String, Vec<u8>, Option<String>)>,
    ) -> Result<Revision> {
        let revpos = parent.map_or(1, |p| p.generation() + 1);
        let mut metas = Vec::with_capacity(attachments.len());
        for (name, data, content_type) in attachments {
            let key = self.blobs.store(&data)?;
            metas.push(AttachmentMeta::for_blob(
                name,
                &key,
                data.len() as u64,
                content_type,
                revpos,
            ));
        }
        self.write(doc_id, Some(body), false, parent, metas)
    }

    /// Write a new revision generated from its content.
    ///
    /// A stale `parent` is a conflict unless a resolver is attached and the
    /// parent is known, in which case the branch is created and resolved.
    pub fn write(
        &self,
        doc_id: &str,
        body: Option<Map<String, Value>>,
        deleted: bool,
        parent: Option<&RevisionId>,
        attachments: Vec<AttachmentMeta>,
    ) -> Result<Revision> {
        let rev_id = RevisionId::for_content(body.as_ref(), deleted, parent);
        let rev = if deleted {
            Revision::tombstone(doc_id, rev_id.clone())
        } else {
            Revision::new(doc_id, rev_id.clone(), body.unwrap_or_default())
        }
        .with_attachments(attachments);

        let (stored, first_seq, last_seq) = {
            let mut guard = self.state.write();
            let State {
                docs,
                last_sequence,
            } = &mut *guard;
            let before = *last_sequence;
            let tree = docs
                .entry(doc_id.to_string())
                .or_insert_with(|| RevisionTree::new(doc_id));

            let history = match parent {
                Some(p) => {
                    let mut history = vec![p.clone()];
                    history.extend(tree.history(p).unwrap_or_default());
                    history
                }
                None => Vec::new(),
            };
            let allow_conflict =
                self.resolver.is_some() && parent.is_some_and(|p| tree.contains(p));

            let result = insert_into(tree, last_sequence, rev, &history, allow_conflict);
            if tree.is_empty() {
                docs.remove(doc_id);
            }
            let outcome = result.map_err(StoreError::from)?;
            let tree = docs
                .get_mut(doc_id)
                .ok_or_else(|| ReplicationError::Internal(format!("{doc_id} vanished")))?;

            if outcome.in_conflict {
                if let Some(resolver) = &self.resolver {
                    resolve_conflicts(tree, last_sequence, resolver.as_ref())
                        .map_err(StoreError::from)?;
                }
            }
            let stored = tree.get(&rev_id).ok_or_else(|| StoreError::NotFound {
                doc_id: doc_id.to_string(),
                rev_id: Some(rev_id.to_string()),
            })?;
            (stored, before + 1, *last_sequence)
        };

        debug!(doc_id, rev_id = %stored.rev_id, sequence = stored.sequence(), "Local write");
        self.notify(first_seq, last_seq);
        Ok(stored)
    }

    fn notify(&self, first: i64, last: i64) {
        for seq in first..=last {
            // No subscribers is fine.
            let _ = self.changes.send(seq);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection and maintenance
    // ═══════════════════════════════════════════════════════════════════════

    pub fn document(&self, doc_id: &str) -> Option<DocumentInfo> {
        let state = self.state.read();
        let tree = state.docs.get(doc_id)?;
        Some(DocumentInfo {
            doc_id: doc_id.to_string(),
            winner: tree.winner_id()?.clone(),
            deleted: tree.is_deleted(),
            in_conflict: tree.in_conflict(),
            leaves: tree.leaf_ids(),
        })
    }

    /// Snapshot of a document's tree.
    pub fn tree(&self, doc_id: &str) -> Option<RevisionTree> {
        self.state.read().docs.get(doc_id).cloned()
    }

    /// Current winner's content.
    pub fn current(&self, doc_id: &str) -> Option<Revision> {
        self.state.read().docs.get(doc_id)?.current()
    }

    /// IDs of all documents, sorted.
    pub fn doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn doc_count(&self) -> usize {
        self.state.read().docs.len()
    }

    pub fn last_sequence(&self) -> i64 {
        self.state.read().last_sequence
    }

    /// Drop bodies of revisions more than `max_depth` generations above
    /// every leaf.
    pub fn compact(&self, max_depth: usize) -> usize {
        let mut state = self.state.write();
        let pruned: usize = state.docs.values_mut().map(|t| t.prune(max_depth)).sum();
        if pruned > 0 {
            info!(pruned, max_depth, "Compacted revision bodies");
        }
        pruned
    }

    /// Delete blobs no revision with a body references.
    pub fn collect_garbage(&self) -> Result<usize> {
        let keep: HashSet<BlobKey> = {
            let state = self.state.read();
            state
                .docs
                .values()
                .flat_map(|t| t.attachment_digests())
                .filter_map(|digest| BlobKey::from_digest_string(digest).ok())
                .collect()
        };
        Ok(self.blobs.delete_blobs_except(&keep)?)
    }

    fn insert(
        &self,
        rev: Revision,
        history: &[RevisionId],
        allow_conflict: bool,
    ) -> StoreResult<InsertOutcome> {
        let (outcome, first_seq, last_seq) = {
            let mut guard = self.state.write();
            let State {
                docs,
                last_sequence,
            } = &mut *guard;
            let before = *last_sequence;
            let doc_id = rev.doc_id.clone();
            let tree = docs
                .entry(doc_id.clone())
                .or_insert_with(|| RevisionTree::new(doc_id.clone()));

            let result = insert_into(tree, last_sequence, rev, history, allow_conflict);
            let mut outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    if tree.is_empty() {
                        docs.remove(&doc_id);
                    }
                    return Err(e.into());
                }
            };

            if outcome.in_conflict {
                if let Some(resolver) = &self.resolver {
                    resolve_conflicts(tree, last_sequence, resolver.as_ref())?;
                    if let Some(winner) = tree.winner_id() {
                        outcome.winner = winner.clone();
                    }
                    outcome.in_conflict = tree.in_conflict();
                }
            }
            (outcome, before + 1, *last_sequence)
        };
        self.notify(first_seq, last_seq);
        Ok(outcome)
    }

    fn changes_page(
        &self,
        since: i64,
        limit: usize,
        filter: Option<RevisionFilter>,
    ) -> LocalChanges {
        let mut candidates: Vec<(bool, Revision)> = {
            let state = self.state.read();
            state
                .docs
                .values()
                .flat_map(|tree| {
                    let leaves: HashSet<RevisionId> = tree.leaf_ids().into_iter().collect();
                    tree.revisions_since(since)
                        .map(move |rev| (leaves.contains(&rev.rev_id), rev))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        candidates.sort_by_key(|(_, rev)| rev.sequence());
        candidates.truncate(limit.max(1));

        let last_sequence = candidates.last().map_or(since, |(_, rev)| rev.sequence());
        let revisions = candidates
            .into_iter()
            .filter(|(leaf, _)| *leaf)
            .map(|(_, rev)| rev)
            .filter(|rev| filter.as_ref().map_or(true, |f| f(rev)))
            .collect();
        LocalChanges {
            revisions,
            last_sequence,
        }
    }
}

/// Insert with a freshly assigned sequence. Re-inserting a known revision
/// consumes no sequence.
fn insert_into(
    tree: &mut RevisionTree,
    last_sequence: &mut i64,
    rev: Revision,
    history: &[RevisionId],
    allow_conflict: bool,
) -> std::result::Result<InsertOutcome, RevisionError> {
    let mut rev = rev.without_sequence();
    let next = *last_sequence + 1;
    if !tree.contains(&rev.rev_id) {
        rev.assign_sequence(next)?;
    }
    let outcome = tree.force_insert(rev, history, allow_conflict)?;
    if outcome.status != InsertStatus::AlreadyPresent {
        *last_sequence = next;
    }
    Ok(outcome)
}

/// Apply the resolver until the document is out of conflict or the resolver
/// defers. Returns how many conflicts were resolved.
fn resolve_conflicts(
    tree: &mut RevisionTree,
    last_sequence: &mut i64,
    resolver: &dyn ConflictResolver,
) -> std::result::Result<usize, RevisionError> {
    let mut resolved_count = 0;
    let rounds = tree.leaf_ids().len();
    for _ in 0..rounds {
        let Some(conflict) = tree.conflict() else {
            break;
        };
        let Some(resolved) = resolver.resolve(&conflict) else {
            debug!(doc_id = %conflict.doc_id, "Resolver deferred conflict");
            break;
        };
        debug!(
            doc_id = %conflict.doc_id,
            mine = %conflict.mine.rev_id,
            theirs = %conflict.theirs.rev_id,
            "Resolving conflict"
        );
        for (rev, history) in resolution_revisions(&conflict, resolved) {
            insert_into(tree, last_sequence, rev, &history, true)?;
        }
        resolved_count += 1;
    }
    Ok(resolved_count)
}

impl LocalStore for MemoryStore {
    fn local_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    fn get_revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
    ) -> StoreFuture<'_, Option<Revision>> {
        let doc_id = doc_id.to_string();
        let rev_id = rev_id.cloned();
        Box::pin(async move {
            let state = self.state.read();
            let Some(tree) = state.docs.get(&doc_id) else {
                return Ok(None);
            };
            Ok(match rev_id {
                Some(rev_id) => tree.get(&rev_id),
                None => tree.current(),
            })
        })
    }

    fn force_insert(
        &self,
        rev: Revision,
        history: Vec<RevisionId>,
        allow_conflict: bool,
    ) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move { self.insert(rev, &history, allow_conflict) })
    }

    fn find_missing(
        &self,
        doc_id: &str,
        rev_ids: &[RevisionId],
        ancestor_limit: usize,
    ) -> StoreFuture<'_, MissingRevisions> {
        let doc_id = doc_id.to_string();
        let rev_ids = rev_ids.to_vec();
        Box::pin(async move {
            let state = self.state.read();
            let Some(tree) = state.docs.get(&doc_id) else {
                return Ok(MissingRevisions {
                    missing: rev_ids,
                    possible_ancestors: Vec::new(),
                });
            };
            let missing = tree.find_missing(&rev_ids);
            let possible_ancestors = missing
                .iter()
                .max()
                .map(|newest| tree.possible_ancestors(newest, ancestor_limit))
                .unwrap_or_default();
            Ok(MissingRevisions {
                missing,
                possible_ancestors,
            })
        })
    }

    fn revision_history(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> StoreFuture<'_, Vec<RevisionId>> {
        let doc_id = doc_id.to_string();
        let rev_id = rev_id.clone();
        Box::pin(async move {
            let state = self.state.read();
            state
                .docs
                .get(&doc_id)
                .and_then(|tree| tree.history(&rev_id))
                .ok_or_else(|| StoreError::NotFound {
                    doc_id,
                    rev_id: Some(rev_id.to_string()),
                })
        })
    }

    fn changes_since(
        &self,
        since: i64,
        limit: usize,
        filter: Option<RevisionFilter>,
    ) -> StoreFuture<'_, LocalChanges> {
        Box::pin(async move { Ok(self.changes_page(since, limit, filter)) })
    }

    fn purge_obsolete(&self, doc_id: &str, rev_id: &RevisionId) -> StoreFuture<'_, usize> {
        let doc_id = doc_id.to_string();
        let rev_id = rev_id.clone();
        Box::pin(async move {
            let mut state = self.state.write();
            Ok(state
                .docs
                .get_mut(&doc_id)
                .map_or(0, |tree| tree.strip_ancestors(&rev_id)))
        })
    }

    fn get_checkpoint(&self, key: &str) -> StoreFuture<'_, Option<CheckpointDoc>> {
        let key = key.to_string();
        Box::pin(async move {
            match &self.checkpoints {
                CheckpointBackend::Memory(map) => {
                    let doc = map.lock().get(&key).cloned();
                    Ok(doc)
                }
                CheckpointBackend::Sqlite(store) => store.get(&key).await.map_err(sqlite_error),
            }
        })
    }

    fn set_checkpoint(&self, key: &str, doc: CheckpointDoc) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            match &self.checkpoints {
                CheckpointBackend::Memory(map) => {
                    map.lock().insert(key, doc);
                    Ok(())
                }
                CheckpointBackend::Sqlite(store) => {
                    store.put(&key, &doc).await.map_err(sqlite_error)
                }
            }
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<i64>> {
        Some(self.changes.subscribe())
    }
}

fn sqlite_error(e: ReplicationError) -> StoreError {
    match e {
        ReplicationError::CheckpointStore(e) => StoreError::Checkpoint(e),
        other => StoreError::Unusable(other.to_string()),
    }
}

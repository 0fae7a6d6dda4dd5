// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint identity and debounced persistence.
//!
//! A checkpoint records how far one direction of one replication got, as a
//! document `{lastSequence, localUUID}` in the local store. Its key is derived
//! from everything that changes which revisions a replication would move, so
//! a replication with a different filter never resumes from another's
//! progress.
//!
//! # Debounced Writes
//!
//! - `set()` records the new frontier in memory and marks it dirty
//! - `flush()` writes the dirty value through the local store
//! - an autosave task flushes every save interval
//! - stop flushes once more, so a clean stop never loses progress
//!
//! A crash between `set()` and `flush()` loses at most one interval; the
//! re-fetched revisions are already present and are skipped.

mod sqlite;

pub use sqlite::SqliteCheckpointStore;

use crate::config::ReplicationDirection;
use crate::error::Result;
use crate::local_store::LocalStore;
use crate::sequence_tracker::SequenceTracker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persisted checkpoint document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    #[serde(rename = "lastSequence")]
    pub last_sequence: String,
    #[serde(rename = "localUUID")]
    pub local_uuid: String,
}

/// Stable checkpoint key: hex SHA-1 over the replication's identity.
///
/// Filter parameters are a `BTreeMap`, so their JSON encoding is canonical.
pub fn checkpoint_id(
    remote_id: &str,
    direction: ReplicationDirection,
    filter_name: Option<&str>,
    filter_params: &BTreeMap<String, Value>,
    doc_ids: Option<&[String]>,
) -> String {
    let mut doc_ids: Option<Vec<&String>> = doc_ids.map(|ids| ids.iter().collect());
    if let Some(ids) = doc_ids.as_mut() {
        ids.sort();
        ids.dedup();
    }
    let identity = serde_json::json!({
        "remote": remote_id,
        "direction": direction.to_string(),
        "filter": filter_name,
        "filterParams": filter_params,
        "docIDs": doc_ids,
    });
    let mut hasher = Sha1::new();
    hasher.update(identity.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default)]
struct CheckpointState {
    current: Option<String>,
    saved: Option<String>,
}

/// Debounced checkpoint writer for one direction.
pub struct Checkpointer<S: LocalStore> {
    store: Arc<S>,
    checkpoint_id: String,
    direction: &'static str,
    remote: String,
    state: Mutex<CheckpointState>,
}

impl<S: LocalStore> Checkpointer<S> {
    pub fn new(
        store: Arc<S>,
        checkpoint_id: String,
        direction: &'static str,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            store,
            checkpoint_id,
            direction,
            remote: remote.into(),
            state: Mutex::new(CheckpointState::default()),
        }
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Read the stored checkpoint.
    ///
    /// A checkpoint written by a different local database (the local store
    /// was replaced) is ignored and replication starts over.
    pub async fn load(&self) -> Result<Option<String>> {
        let stored = self.store.get_checkpoint(&self.checkpoint_id).await?;
        let local_uuid = self.store.local_uuid();
        let sequence = match stored {
            Some(doc) if doc.local_uuid == local_uuid => Some(doc.last_sequence),
            Some(doc) => {
                warn!(
                    checkpoint_id = %self.checkpoint_id,
                    stored_uuid = %doc.local_uuid,
                    local_uuid = %local_uuid,
                    "Checkpoint belongs to another local database, starting over"
                );
                None
            }
            None => None,
        };

        let mut state = self.state.lock();
        state.current = sequence.clone();
        state.saved = sequence.clone();
        info!(
            direction = self.direction,
            checkpoint = ?sequence,
            "Loaded checkpoint"
        );
        Ok(sequence)
    }

    /// Record a new frontier (persisted on the next flush).
    pub fn set(&self, sequence: String) {
        let mut state = self.state.lock();
        if state.current.as_ref() != Some(&sequence) {
            debug!(direction = self.direction, sequence = %sequence, "Checkpoint advanced (pending flush)");
            state.current = Some(sequence);
        }
    }

    /// Latest recorded frontier.
    pub fn current(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.current != state.saved
    }

    /// Persist the frontier if it changed. Returns whether anything was written.
    pub async fn flush(&self) -> Result<bool> {
        let pending = {
            let state = self.state.lock();
            match &state.current {
                Some(current) if state.saved.as_ref() != Some(current) => current.clone(),
                _ => return Ok(false),
            }
        };

        let doc = CheckpointDoc {
            last_sequence: pending.clone(),
            local_uuid: self.store.local_uuid(),
        };
        match self.store.set_checkpoint(&self.checkpoint_id, doc).await {
            Ok(()) => {
                crate::metrics::record_checkpoint_save(self.direction, true);
                if let Ok(numeric) = pending.parse::<u64>() {
                    crate::metrics::set_checkpoint_sequence(&self.remote, self.direction, numeric);
                }
                debug!(direction = self.direction, sequence = %pending, "Checkpoint saved");
                self.state.lock().saved = Some(pending);
                Ok(true)
            }
            Err(e) => {
                crate::metrics::record_checkpoint_save(self.direction, false);
                Err(e.into())
            }
        }
    }

    /// Flush every `interval` until `shutdown` flips to true.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let checkpointer = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = checkpointer.flush().await {
                            warn!(direction = checkpointer.direction, error = %e, "Failed to save checkpoint");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(direction = checkpointer.direction, "Checkpoint autosave stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Completion tracking for one session, feeding the checkpointer.
///
/// Each unit of work is registered with the sequence it resumes after; the
/// checkpoint advances to the last value whose predecessors are all done.
/// A unit may consist of several parts (the revisions of one change entry)
/// and only counts as done once every part completed.
pub(crate) struct Frontier<S: LocalStore> {
    state: Mutex<FrontierState>,
    checkpointer: Arc<Checkpointer<S>>,
}

#[derive(Default)]
struct FrontierState {
    tracker: SequenceTracker<String>,
    /// Outstanding parts of multi-part units.
    parts: HashMap<u64, usize>,
}

impl<S: LocalStore> Frontier<S> {
    pub(crate) fn new(checkpointer: Arc<Checkpointer<S>>) -> Self {
        Self {
            state: Mutex::new(FrontierState::default()),
            checkpointer,
        }
    }

    pub(crate) fn add(&self, sequence: String) -> u64 {
        self.add_parts(sequence, 1)
    }

    /// Register a unit that needs `parts` calls to [`complete`](Self::complete).
    pub(crate) fn add_parts(&self, sequence: String, parts: usize) -> u64 {
        let mut state = self.state.lock();
        let seq = state.tracker.add(sequence);
        if parts > 1 {
            state.parts.insert(seq, parts);
        }
        seq
    }

    /// Mark one part done and move the checkpoint if the frontier advanced.
    pub(crate) fn complete(&self, seq: u64) {
        let advanced = {
            let mut state = self.state.lock();
            if let Some(left) = state.parts.get_mut(&seq) {
                *left -= 1;
                if *left > 0 {
                    return;
                }
                state.parts.remove(&seq);
            }
            if !state.tracker.remove(seq) {
                return;
            }
            state.tracker.checkpointed_value().cloned()
        };
        if let Some(sequence) = advanced {
            self.checkpointer.set(sequence);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().tracker.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::BlobStore;
    use crate::local_store::MemoryStore;
    use tempfile::TempDir;

    fn memory_store() -> (TempDir, Arc<MemoryStore>) {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, Arc::new(MemoryStore::new(blobs)))
    }

    #[test]
    fn test_checkpoint_id_is_stable() {
        let params = BTreeMap::new();
        let a = checkpoint_id("remote", ReplicationDirection::Pull, None, &params, None);
        let b = checkpoint_id("remote", ReplicationDirection::Pull, None, &params, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checkpoint_id_depends_on_identity() {
        let empty = BTreeMap::new();
        let mut params = BTreeMap::new();
        params.insert("owner".to_string(), Value::String("ada".into()));
        let ids = vec!["b".to_string(), "a".to_string()];
        let sorted = vec!["a".to_string(), "b".to_string()];

        let base = checkpoint_id("remote", ReplicationDirection::Pull, None, &empty, None);
        let variants = [
            checkpoint_id("other", ReplicationDirection::Pull, None, &empty, None),
            checkpoint_id("remote", ReplicationDirection::Push, None, &empty, None),
            checkpoint_id("remote", ReplicationDirection::Pull, Some("f"), &empty, None),
            checkpoint_id("remote", ReplicationDirection::Pull, Some("f"), &params, None),
            checkpoint_id("remote", ReplicationDirection::Pull, None, &empty, Some(ids.as_slice())),
        ];
        for variant in &variants {
            assert_ne!(&base, variant);
        }
        // Doc ID order does not matter.
        assert_eq!(
            checkpoint_id("remote", ReplicationDirection::Pull, None, &empty, Some(ids.as_slice())),
            checkpoint_id("remote", ReplicationDirection::Pull, None, &empty, Some(sorted.as_slice())),
        );
    }

    #[test]
    fn test_checkpoint_doc_wire_names() {
        let doc = CheckpointDoc {
            last_sequence: "42".into(),
            local_uuid: "u-1".into(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["lastSequence"], "42");
        assert_eq!(json["localUUID"], "u-1");
    }

    #[tokio::test]
    async fn test_set_and_flush() {
        let (_dir, store) = memory_store();
        let cp = Checkpointer::new(Arc::clone(&store), "cp-1".into(), "pull", "remote");

        assert_eq!(cp.load().await.unwrap(), None);
        assert!(!cp.flush().await.unwrap());

        cp.set("7".into());
        assert!(cp.is_dirty());
        assert!(cp.flush().await.unwrap());
        assert!(!cp.is_dirty());
        assert!(!cp.flush().await.unwrap());

        let stored = store.get_checkpoint("cp-1").await.unwrap().unwrap();
        assert_eq!(stored.last_sequence, "7");
        assert_eq!(stored.local_uuid, store.local_uuid());
    }

    #[tokio::test]
    async fn test_load_ignores_foreign_uuid() {
        let (_dir, store) = memory_store();
        store
            .set_checkpoint(
                "cp-2",
                CheckpointDoc {
                    last_sequence: "99".into(),
                    local_uuid: "someone-else".into(),
                },
            )
            .await
            .unwrap();

        let cp = Checkpointer::new(Arc::clone(&store), "cp-2".into(), "pull", "remote");
        assert_eq!(cp.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_resumes() {
        let (_dir, store) = memory_store();
        let cp = Checkpointer::new(Arc::clone(&store), "cp-3".into(), "push", "remote");
        cp.set("12".into());
        cp.flush().await.unwrap();

        let again = Checkpointer::new(Arc::clone(&store), "cp-3".into(), "push", "remote");
        assert_eq!(again.load().await.unwrap(), Some("12".into()));
        assert!(!again.is_dirty());
    }

    #[tokio::test]
    async fn test_autosave_flushes() {
        let (_dir, store) = memory_store();
        let cp = Arc::new(Checkpointer::new(Arc::clone(&store), "cp-4".into(), "pull", "remote"));
        let (tx, rx) = watch::channel(false);
        let handle = cp.spawn_autosave(Duration::from_millis(5), rx);

        cp.set("3".into());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cp.is_dirty());

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(
            store.get_checkpoint("cp-4").await.unwrap().unwrap().last_sequence,
            "3"
        );
    }

    #[tokio::test]
    async fn test_frontier_resumes_after_outstanding_item() {
        let (_dir, store) = memory_store();
        let cp = Arc::new(Checkpointer::new(Arc::clone(&store), "cp-5".into(), "pull", "remote"));
        let frontier = Frontier::new(Arc::clone(&cp));

        let seqs: Vec<u64> = ["t1", "t2", "t3", "t4", "t5"]
            .iter()
            .map(|t| frontier.add(t.to_string()))
            .collect();
        for &i in &[0, 1, 3, 4] {
            frontier.complete(seqs[i]);
        }
        assert_eq!(cp.current().as_deref(), Some("t2"));
        assert_eq!(frontier.pending(), 1);

        frontier.complete(seqs[2]);
        assert_eq!(cp.current().as_deref(), Some("t5"));
    }

    #[tokio::test]
    async fn test_frontier_waits_for_every_part() {
        let (_dir, store) = memory_store();
        let cp = Arc::new(Checkpointer::new(Arc::clone(&store), "cp-6".into(), "pull", "remote"));
        let frontier = Frontier::new(Arc::clone(&cp));

        let first = frontier.add("4".into());
        let entry = frontier.add_parts("5".into(), 2);
        frontier.complete(first);
        frontier.complete(entry);
        assert_eq!(cp.current().as_deref(), Some("4"));
        assert_eq!(frontier.pending(), 1);

        frontier.complete(entry);
        assert_eq!(cp.current().as_deref(), Some("5"));
        assert_eq!(frontier.pending(), 0);

        // Extra completions of a finished unit change nothing.
        frontier.complete(entry);
        assert_eq!(cp.current().as_deref(), Some("5"));
    }
}

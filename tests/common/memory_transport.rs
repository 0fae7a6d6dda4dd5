// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote for replication tests.
//!
//! Serves a [`MemoryStore`] through the [`Transport`] trait and records every
//! call. Faults can be queued per operation or attached to documents.
//!
//! # Example
//! ```rust,ignore
//! let remote = TestDb::new("remote");
//! let transport = Arc::new(MemoryTransport::new(Arc::clone(&remote.store)));
//!
//! // Next two change-feed reads fail with a network error
//! transport.fail_next("changes", 2, TransportError::transient("reset"));
//!
//! // ...replicate...
//!
//! assert_eq!(transport.calls("changes"), 3);
//! ```

use doc_replication::local_store::{LocalStore, MemoryStore, StoreError};
use doc_replication::revision::{Revision, RevisionId};
use doc_replication::transport::{
    AttachmentStream, Authorizer, ChangeEntry, ChangesPage, ChangesRequest, FetchedRevision,
    RevisionRequest, Transport, TransportError, TransportFuture, TransportResult, UploadOutcome,
    UploadRevision,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Server-side filter function.
pub type RemoteFilter = Arc<dyn Fn(&Revision, &BTreeMap<String, Value>) -> bool + Send + Sync>;

/// Attachment bytes are streamed in chunks of this size.
const ATTACHMENT_CHUNK: usize = 4;

/// Remote database backed by a [`MemoryStore`].
pub struct MemoryTransport {
    store: Arc<MemoryStore>,
    bulk_get: bool,
    inline_attachments: bool,
    /// Pushed revisions whose parent is not the remote winner are refused.
    reject_conflicts: bool,
    /// One change entry per document listing every changed leaf.
    group_leaves: bool,
    exists: AtomicBool,
    required_token: Option<String>,
    authorizer: Mutex<Option<Arc<dyn Authorizer>>>,
    filters: HashMap<String, RemoteFilter>,
    faults: Mutex<HashMap<&'static str, VecDeque<TransportError>>>,
    doc_faults: Mutex<HashMap<String, TransportError>>,
    rev_faults: Mutex<HashMap<(String, String), TransportError>>,
    corrupt_docs: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    fetched: Mutex<Vec<String>>,
    uploaded: Mutex<Vec<UploadRevision>>,
}

impl MemoryTransport {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            bulk_get: true,
            inline_attachments: true,
            reject_conflicts: false,
            group_leaves: false,
            exists: AtomicBool::new(true),
            required_token: None,
            authorizer: Mutex::new(None),
            filters: HashMap::new(),
            faults: Mutex::new(HashMap::new()),
            doc_faults: Mutex::new(HashMap::new()),
            rev_faults: Mutex::new(HashMap::new()),
            corrupt_docs: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            fetched: Mutex::new(Vec::new()),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    /// Serve revisions one at a time only.
    pub fn without_bulk_get(mut self) -> Self {
        self.bulk_get = false;
        self
    }

    /// Send attachments as stubs so the client downloads them.
    pub fn with_attachment_stubs(mut self) -> Self {
        self.inline_attachments = false;
        self
    }

    /// Report all changed leaves of a document in a single change entry.
    pub fn grouping_leaves(mut self) -> Self {
        self.group_leaves = true;
        self
    }

    pub fn rejecting_conflicts(mut self) -> Self {
        self.reject_conflicts = true;
        self
    }

    /// Start without a database; `create_database` makes it exist.
    pub fn missing_database(self) -> Self {
        self.exists.store(false, Ordering::SeqCst);
        self
    }

    /// Refuse every call unless the authorizer yields `token`.
    pub fn requiring_token(mut self, token: &str) -> Self {
        self.required_token = Some(token.to_string());
        self
    }

    pub fn with_remote_filter<F>(mut self, name: &str, filter: F) -> Self
    where
        F: Fn(&Revision, &BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(filter));
        self
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: &'static str, times: usize, error: TransportError) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail every fetch of this document's revisions.
    pub fn fail_document(&self, doc_id: &str, error: TransportError) {
        self.doc_faults.lock().insert(doc_id.to_string(), error);
    }

    /// Fail every fetch of one revision.
    pub fn fail_revision(&self, doc_id: &str, rev_id: &str, error: TransportError) {
        self.rev_faults
            .lock()
            .insert((doc_id.to_string(), rev_id.to_string()), error);
    }

    /// Forget every queued, document and revision fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
        self.doc_faults.lock().clear();
        self.rev_faults.lock().clear();
    }

    /// Document IDs of fetched revisions, in the order they were served.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    /// Serve this document's inline attachments with the wrong bytes.
    pub fn corrupt_attachments(&self, doc_id: &str) {
        self.corrupt_docs.lock().insert(doc_id.to_string());
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn uploaded(&self) -> Vec<UploadRevision> {
        self.uploaded.lock().clone()
    }

    pub fn database_created(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    /// Count the call, then apply auth and queued faults.
    fn enter(&self, operation: &'static str) -> TransportResult<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        if let Some(required) = &self.required_token {
            let offered = self.authorizer.lock().as_ref().and_then(|a| a.credentials());
            if offered.as_deref() != Some(required.as_str()) {
                return Err(TransportError::auth("401 unauthorized"));
            }
        }
        if let Some(error) = self.faults.lock().get_mut(operation).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        Ok(())
    }

    async fn fetch(&self, request: RevisionRequest) -> TransportResult<FetchedRevision> {
        if let Some(error) = self.doc_faults.lock().get(&request.doc_id).cloned() {
            return Err(error);
        }
        let rev_key = (request.doc_id.clone(), request.rev_id.to_string());
        if let Some(error) = self.rev_faults.lock().get(&rev_key).cloned() {
            return Err(error);
        }
        self.fetched.lock().push(request.doc_id.clone());
        let revision = self
            .store
            .get_revision(&request.doc_id, Some(&request.rev_id))
            .await
            .map_err(|e| TransportError::malformed(e.to_string()))?
            .ok_or_else(|| TransportError::not_found(format!("{}/{}", request.doc_id, request.rev_id)))?;
        let history = self
            .store
            .revision_history(&request.doc_id, &request.rev_id)
            .await
            .map_err(|e| TransportError::malformed(e.to_string()))?;

        let corrupt = self.corrupt_docs.lock().contains(&request.doc_id);
        let mut attachments = Vec::with_capacity(revision.attachments.len());
        for mut att in revision.attachments.clone() {
            if self.inline_attachments {
                let key = att
                    .blob_key()
                    .map_err(|e| TransportError::malformed(e.to_string()))?;
                let mut data = self
                    .store
                    .blob_store()
                    .read(&key)
                    .map_err(|e| TransportError::not_found(e.to_string()))?;
                if corrupt {
                    data.push(0xff);
                }
                att.data = Some(data);
                att.stub = false;
            }
            attachments.push(att);
        }

        Ok(FetchedRevision {
            revision: revision.with_attachments(attachments),
            history,
        })
    }

    async fn upload(&self, upload: UploadRevision) -> UploadOutcome {
        let UploadRevision { revision, history } = upload;
        let mut attachments = Vec::with_capacity(revision.attachments.len());
        for mut att in revision.attachments.clone() {
            if let Some(data) = att.data.take() {
                match self.store.blob_store().store(&data) {
                    Ok(key) if key.digest_string() == att.digest => {}
                    Ok(_) => {
                        return UploadOutcome::Failed(TransportError::malformed("digest mismatch"))
                    }
                    Err(e) => return UploadOutcome::Failed(TransportError::transient(e.to_string())),
                }
            }
            attachments.push(att.into_stub());
        }
        let revision = revision.with_attachments(attachments);
        let rev_id = revision.rev_id.clone();
        match self
            .store
            .force_insert(revision, history, !self.reject_conflicts)
            .await
        {
            Ok(_) => UploadOutcome::Created,
            Err(StoreError::Conflict { .. }) => UploadOutcome::Conflict(format!("409 conflict on {rev_id}")),
            Err(e) => UploadOutcome::Failed(TransportError::malformed(e.to_string())),
        }
    }
}

/// Merge entries of the same document into its latest one.
fn group_by_document(entries: Vec<ChangeEntry>) -> Vec<ChangeEntry> {
    let mut grouped: Vec<ChangeEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match grouped.iter().position(|e| e.doc_id == entry.doc_id) {
            Some(pos) => {
                let mut merged = grouped.remove(pos);
                merged.rev_ids.extend(entry.rev_ids);
                merged.sequence = entry.sequence;
                merged.deleted &= entry.deleted;
                grouped.push(merged);
            }
            None => grouped.push(entry),
        }
    }
    grouped
}

impl Transport for MemoryTransport {
    fn authorize(&self, authorizer: Arc<dyn Authorizer>) {
        *self.authorizer.lock() = Some(authorizer);
    }

    fn database_exists(&self) -> TransportFuture<'_, bool> {
        Box::pin(async move {
            self.enter("database_exists")?;
            Ok(self.exists.load(Ordering::SeqCst))
        })
    }

    fn create_database(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.enter("create_database")?;
            self.exists.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn changes(&self, request: ChangesRequest) -> TransportFuture<'_, ChangesPage> {
        Box::pin(async move {
            self.enter("changes")?;
            if !self.exists.load(Ordering::SeqCst) {
                return Err(TransportError::not_found("no such database"));
            }
            let mut since: i64 = match &request.since {
                Some(text) => text
                    .parse()
                    .map_err(|_| TransportError::malformed(format!("bad since {text:?}")))?,
                None => 0,
            };

            let filter = match &request.filter_name {
                Some(name) => Some(
                    self.filters
                        .get(name)
                        .cloned()
                        .ok_or_else(|| TransportError::not_found(format!("no filter {name}")))?,
                ),
                None => None,
            };
            let doc_ids: Option<HashSet<String>> =
                request.doc_ids.as_ref().map(|ids| ids.iter().cloned().collect());
            let params = request.filter_params.clone();
            let predicate: doc_replication::local_store::RevisionFilter = Arc::new(move |rev: &Revision| {
                doc_ids.as_ref().map_or(true, |ids| ids.contains(&rev.doc_id))
                    && filter.as_ref().map_or(true, |f| f(rev, &params))
            });

            // Skip pages the filter emptied so an empty answer means caught up.
            loop {
                let page = self
                    .store
                    .changes_since(since, request.limit, Some(Arc::clone(&predicate)))
                    .await
                    .map_err(|e| TransportError::malformed(e.to_string()))?;
                if page.revisions.is_empty() && page.last_sequence > since {
                    since = page.last_sequence;
                    continue;
                }
                let mut entries: Vec<ChangeEntry> = page
                    .revisions
                    .into_iter()
                    .map(|rev| ChangeEntry {
                        sequence: rev.sequence().to_string(),
                        doc_id: rev.doc_id.clone(),
                        rev_ids: vec![rev.rev_id.clone()],
                        deleted: rev.deleted,
                    })
                    .collect();
                if self.group_leaves {
                    entries = group_by_document(entries);
                }
                return Ok(ChangesPage {
                    entries,
                    last_sequence: Some(page.last_sequence.to_string()),
                });
            }
        })
    }

    fn supports_bulk_get(&self) -> bool {
        self.bulk_get
    }

    fn bulk_get(
        &self,
        requests: Vec<RevisionRequest>,
    ) -> TransportFuture<'_, Vec<TransportResult<FetchedRevision>>> {
        Box::pin(async move {
            self.enter("bulk_get")?;
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.fetch(request).await);
            }
            Ok(results)
        })
    }

    fn get_revision(&self, request: RevisionRequest) -> TransportFuture<'_, FetchedRevision> {
        Box::pin(async move {
            self.enter("get_revision")?;
            self.fetch(request).await
        })
    }

    fn get_attachment(&self, doc_id: &str, digest: &str) -> TransportFuture<'_, AttachmentStream> {
        let doc_id = doc_id.to_string();
        let digest = digest.to_string();
        Box::pin(async move {
            self.enter("get_attachment")?;
            let key = doc_replication::BlobKey::from_digest_string(&digest)
                .map_err(|e| TransportError::malformed(e.to_string()))?;
            let data = self
                .store
                .blob_store()
                .read(&key)
                .map_err(|_| TransportError::not_found(format!("{doc_id}/{digest}")))?;
            let chunks: Vec<Vec<u8>> = data.chunks(ATTACHMENT_CHUNK).map(<[u8]>::to_vec).collect();
            let (tx, rx) = mpsc::channel(chunks.len().max(1));
            for chunk in chunks {
                let _ = tx.try_send(Ok(chunk));
            }
            Ok(rx)
        })
    }

    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<RevisionId>>,
    ) -> TransportFuture<'_, BTreeMap<String, Vec<RevisionId>>> {
        Box::pin(async move {
            self.enter("revs_diff")?;
            let mut missing = BTreeMap::new();
            for (doc_id, rev_ids) in revs {
                let answer = self
                    .store
                    .find_missing(&doc_id, &rev_ids, 0)
                    .await
                    .map_err(|e| TransportError::malformed(e.to_string()))?;
                if !answer.missing.is_empty() {
                    missing.insert(doc_id, answer.missing);
                }
            }
            Ok(missing)
        })
    }

    fn known_attachments(&self, digests: Vec<String>) -> TransportFuture<'_, HashSet<String>> {
        Box::pin(async move {
            self.enter("known_attachments")?;
            let blobs = self.store.blob_store();
            Ok(digests
                .into_iter()
                .filter(|d| {
                    doc_replication::BlobKey::from_digest_string(d).is_ok_and(|k| blobs.has(&k))
                })
                .collect())
        })
    }

    fn bulk_docs(&self, revisions: Vec<UploadRevision>) -> TransportFuture<'_, Vec<UploadOutcome>> {
        Box::pin(async move {
            self.enter("bulk_docs")?;
            if !self.exists.load(Ordering::SeqCst) {
                return Err(TransportError::not_found("no such database"));
            }
            self.uploaded.lock().extend(revisions.iter().cloned());
            let mut outcomes = Vec::with_capacity(revisions.len());
            for revision in revisions {
                outcomes.push(self.upload(revision).await);
            }
            Ok(outcomes)
        })
    }
}

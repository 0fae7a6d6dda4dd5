// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push direction: local changes onto the remote.
//!
//! Each page of local changes goes through `revs_diff`; only revisions the
//! remote lacks are uploaded, with their history and whichever attachments
//! the remote does not already hold. The checkpoint is a local sequence and
//! advances past a page once every revision on it has an outcome.
//!
//! A conflict reported by the remote is recorded and never re-sent: the
//! remote keeps its winner and the conflict comes back on the next pull.

use super::types::{ActivityLevel, Direction, DocumentReplication, ErrorInfo, Signals, StatusHub};
use super::{SessionEnd, SessionFuture, Worker};
use crate::batcher::Batcher;
use crate::checkpoint::{Checkpointer, Frontier};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::local_store::{LocalStore, RevisionFilter};
use crate::resilience::{with_retry, Bulkhead, RetryConfig};
use crate::revision::{Revision, RevisionId};
use crate::transport::{
    Transport, TransportError, TransportErrorKind, UploadOutcome, UploadRevision,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// A local revision on its way out, with its frontier sequence.
struct Outgoing {
    revision: Revision,
    seq: u64,
}

/// Pushed revision whose ancestors may be purged.
type PurgeItem = (String, RevisionId);

/// Push direction of a replicator.
pub(crate) struct Pusher<S: LocalStore, T: Transport> {
    store: Arc<S>,
    transport: Arc<T>,
    config: Arc<ReplicatorConfig>,
    retry: RetryConfig,
    bulkhead: Arc<Bulkhead>,
    filter: Option<RevisionFilter>,
    status: Arc<StatusHub>,
    checkpointer: Arc<Checkpointer<S>>,
    signals: Signals,
}

impl<S: LocalStore, T: Transport> Pusher<S, T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<S>,
        transport: Arc<T>,
        config: Arc<ReplicatorConfig>,
        bulkhead: Arc<Bulkhead>,
        filter: Option<RevisionFilter>,
        status: Arc<StatusHub>,
        checkpointer: Arc<Checkpointer<S>>,
        signals: Signals,
    ) -> Self {
        let retry = config.settings.retry.to_config();
        Self {
            store,
            transport,
            config,
            retry,
            bulkhead,
            filter,
            status,
            checkpointer,
            signals,
        }
    }

    /// Push filter combined with the document ID allow-list.
    fn effective_filter(&self) -> Option<RevisionFilter> {
        let doc_ids: Option<HashSet<String>> = self
            .config
            .doc_ids
            .as_ref()
            .map(|ids| ids.iter().cloned().collect());
        match (doc_ids, self.filter.clone()) {
            (None, filter) => filter,
            (Some(ids), None) => Some(Arc::new(move |rev: &Revision| ids.contains(&rev.doc_id))),
            (Some(ids), Some(filter)) => Some(Arc::new(move |rev: &Revision| {
                ids.contains(&rev.doc_id) && filter(rev)
            })),
        }
    }

    async fn ensure_target(&self) -> Result<()> {
        let transport = &self.transport;
        let exists = with_retry(&self.retry, "database_exists", || async move {
            transport
                .database_exists()
                .await
                .map_err(|e| ReplicationError::transport("database_exists", e))
        })
        .await?;
        if !exists {
            info!("Creating remote database");
            with_retry(&self.retry, "create_database", || async move {
                transport
                    .create_database()
                    .await
                    .map_err(|e| ReplicationError::transport("create_database", e))
            })
            .await?;
        }
        Ok(())
    }

    async fn run_session(&self) -> Result<SessionEnd> {
        self.status.set_activity(Direction::Push, ActivityLevel::Connecting);
        let mut signals = self.signals.clone();

        if self.config.create_target {
            match signals.guard(self.ensure_target()).await {
                Ok(result) => result?,
                Err(interrupt) => return Ok(interrupt.into()),
            }
        }

        let mut since = match self.checkpointer.load().await? {
            Some(value) => value.parse::<i64>().unwrap_or_else(|_| {
                warn!(checkpoint = %value, "Ignoring unreadable push checkpoint");
                0
            }),
            None => 0,
        };
        // Subscribe before the first read so no change slips between pages.
        let mut subscription = if self.config.continuous {
            self.store.subscribe()
        } else {
            None
        };

        let frontier = Frontier::new(Arc::clone(&self.checkpointer));
        let purger = self.config.settings.purge_pushed.then(|| {
            let store = Arc::clone(&self.store);
            Batcher::from_config("push_purge", &self.config.settings.batch, move |batch: Vec<PurgeItem>| {
                let store = Arc::clone(&store);
                async move { purge_batch(store.as_ref(), batch).await }
            })
        });
        let (autosave_stop, autosave_rx) = watch::channel(false);
        let autosave = self
            .checkpointer
            .spawn_autosave(self.config.settings.checkpoint.save_interval(), autosave_rx);

        let result = self
            .push_pages(&mut signals, &frontier, purger.as_ref(), &mut since, &mut subscription)
            .await;

        if let Some(purger) = &purger {
            purger.close().await;
        }
        let _ = autosave_stop.send(true);
        let _ = autosave.await;
        if let Err(e) = self.checkpointer.flush().await {
            warn!(error = %e, "Failed to save checkpoint at end of session");
        }
        debug!(pending = frontier.pending(), "Push session ended");
        result
    }

    async fn push_pages(
        &self,
        signals: &mut Signals,
        frontier: &Frontier<S>,
        purger: Option<&Batcher<PurgeItem>>,
        since: &mut i64,
        subscription: &mut Option<broadcast::Receiver<i64>>,
    ) -> Result<SessionEnd> {
        let filter = self.effective_filter();
        let limit = self.config.settings.fetch.changes_limit;
        let poll = self.config.settings.fetch.poll_interval_duration();

        loop {
            let page = self.store.changes_since(*since, limit, filter.clone()).await?;

            if page.revisions.is_empty() && page.last_sequence <= *since {
                if let Err(e) = self.checkpointer.flush().await {
                    warn!(error = %e, "Failed to save checkpoint");
                }
                if !self.config.continuous {
                    info!("Push caught up");
                    return Ok(SessionEnd::Finished);
                }
                self.status.set_activity(Direction::Push, ActivityLevel::Idle);
                let wake = async {
                    match subscription.as_mut() {
                        Some(rx) => {
                            let closed = matches!(
                                tokio::time::timeout(poll, rx.recv()).await,
                                Ok(Err(broadcast::error::RecvError::Closed))
                            );
                            if closed {
                                *subscription = None;
                            }
                        }
                        None => tokio::time::sleep(poll).await,
                    }
                };
                if let Err(interrupt) = signals.guard(wake).await {
                    return Ok(interrupt.into());
                }
                continue;
            }

            self.status.set_activity(Direction::Push, ActivityLevel::Busy);
            let outgoing: Vec<Outgoing> = page
                .revisions
                .into_iter()
                .map(|revision| {
                    let seq = frontier.add(revision.sequence().to_string());
                    Outgoing { revision, seq }
                })
                .collect();
            // Marks the end of the page so filtered-out sequences are passed too.
            let marker = frontier.add(page.last_sequence.to_string());
            frontier.complete(marker);
            self.status.add_total(Direction::Push, outgoing.len() as u64);

            match signals
                .guard(self.push_revisions(frontier, purger, outgoing))
                .await
            {
                Ok(result) => result?,
                Err(interrupt) => return Ok(interrupt.into()),
            }
            *since = page.last_sequence;
        }
    }

    /// Diff one page against the remote and upload what it lacks.
    async fn push_revisions(
        &self,
        frontier: &Frontier<S>,
        purger: Option<&Batcher<PurgeItem>>,
        outgoing: Vec<Outgoing>,
    ) -> Result<()> {
        if outgoing.is_empty() {
            return Ok(());
        }
        let mut by_doc: BTreeMap<String, Vec<RevisionId>> = BTreeMap::new();
        for item in &outgoing {
            by_doc
                .entry(item.revision.doc_id.clone())
                .or_default()
                .push(item.revision.rev_id.clone());
        }

        let transport = &self.transport;
        let started = Instant::now();
        let missing = with_retry(&self.retry, "revs_diff", || {
            let by_doc = by_doc.clone();
            async move {
                transport
                    .revs_diff(by_doc)
                    .await
                    .map_err(|e| ReplicationError::transport("revs_diff", e))
            }
        })
        .await?;
        crate::metrics::record_remote_latency(&self.config.remote_id, "revs_diff", started.elapsed());

        let mut wanted = Vec::new();
        for item in outgoing {
            let needed = missing
                .get(&item.revision.doc_id)
                .map_or(false, |revs| revs.contains(&item.revision.rev_id));
            if needed {
                wanted.push(item);
            } else {
                frontier.complete(item.seq);
                self.status.add_completed(Direction::Push, 1);
            }
        }

        let chunk = self.config.settings.batch.capacity.max(1);
        let mut wanted = wanted.into_iter().peekable();
        while wanted.peek().is_some() {
            let batch: Vec<Outgoing> = wanted.by_ref().take(chunk).collect();
            self.upload(frontier, purger, batch).await?;
        }
        Ok(())
    }

    /// Build uploads for one chunk and send them.
    async fn upload(
        &self,
        frontier: &Frontier<S>,
        purger: Option<&Batcher<PurgeItem>>,
        batch: Vec<Outgoing>,
    ) -> Result<()> {
        let transport = &self.transport;
        let digests: Vec<String> = batch
            .iter()
            .flat_map(|item| item.revision.attachments.iter().map(|a| a.digest.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let known = if digests.is_empty() {
            HashSet::new()
        } else {
            with_retry(&self.retry, "known_attachments", || {
                let digests = digests.clone();
                async move {
                    transport
                        .known_attachments(digests)
                        .await
                        .map_err(|e| ReplicationError::transport("known_attachments", e))
                }
            })
            .await?
        };

        let mut uploads = Vec::with_capacity(batch.len());
        let mut seqs = Vec::with_capacity(batch.len());
        for item in batch {
            match self.prepare(item.revision, &known).await {
                Ok(upload) => {
                    uploads.push(upload);
                    seqs.push(item.seq);
                }
                Err((doc_id, rev_id, error)) => {
                    if !error_is_per_revision(&error) {
                        return Err(error);
                    }
                    self.record_failure(&doc_id, &rev_id, &error);
                    frontier.complete(item.seq);
                    self.status.add_completed(Direction::Push, 1);
                }
            }
        }
        if uploads.is_empty() {
            return Ok(());
        }

        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))?;
        let started = Instant::now();
        let outcomes = with_retry(&self.retry, "bulk_docs", || {
            let uploads = uploads.clone();
            async move {
                transport
                    .bulk_docs(uploads)
                    .await
                    .map_err(|e| ReplicationError::transport("bulk_docs", e))
            }
        })
        .await?;
        crate::metrics::record_remote_latency(&self.config.remote_id, "bulk_docs", started.elapsed());

        let mut outcomes = outcomes.into_iter();
        let mut pushed = 0;
        let mut session_error = None;
        for (upload, seq) in uploads.into_iter().zip(seqs) {
            let doc_id = upload.revision.doc_id;
            let rev_id = upload.revision.rev_id;
            let outcome = outcomes.next().unwrap_or_else(|| {
                UploadOutcome::Failed(TransportError::malformed("revision missing from response"))
            });
            match outcome {
                UploadOutcome::Created => {
                    pushed += 1;
                    self.status.document(DocumentReplication {
                        direction: Direction::Push,
                        doc_id: doc_id.clone(),
                        rev_id: rev_id.clone(),
                        error: None,
                    });
                    if let Some(purger) = purger {
                        purger.queue((doc_id, rev_id));
                    }
                }
                UploadOutcome::Conflict(reason) => {
                    crate::metrics::record_conflict(&self.config.remote_id, "push");
                    let error =
                        ReplicationError::transport("bulk_docs", TransportError::conflict(reason));
                    self.record_failure(&doc_id, &rev_id, &error);
                }
                UploadOutcome::Failed(e)
                    if matches!(
                        e.kind,
                        TransportErrorKind::TransientNetwork | TransportErrorKind::PermanentAuth
                    ) =>
                {
                    // Left outstanding so the checkpoint stays behind it.
                    warn!(doc_id = %doc_id, rev_id = %rev_id, error = %e, "Upload failed");
                    session_error.get_or_insert(ReplicationError::transport("bulk_docs", e));
                    continue;
                }
                UploadOutcome::Failed(e) => {
                    let error = ReplicationError::transport("bulk_docs", e);
                    self.record_failure(&doc_id, &rev_id, &error);
                }
            }
            frontier.complete(seq);
            self.status.add_completed(Direction::Push, 1);
        }
        crate::metrics::record_revisions_pushed(&self.config.remote_id, pushed);

        match session_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Attach history and inline the attachments the remote lacks.
    async fn prepare(
        &self,
        mut revision: Revision,
        known: &HashSet<String>,
    ) -> std::result::Result<UploadRevision, (String, RevisionId, ReplicationError)> {
        let doc_id = revision.doc_id.clone();
        let rev_id = revision.rev_id.clone();
        let fail = |e: ReplicationError| (doc_id.clone(), rev_id.clone(), e);

        let history = self
            .store
            .revision_history(&doc_id, &rev_id)
            .await
            .map_err(|e| fail(e.into()))?;

        let blobs = self.store.blob_store();
        for att in revision.attachments.iter_mut() {
            if known.contains(&att.digest) {
                att.stub = true;
                att.data = None;
                continue;
            }
            let key = att.blob_key().map_err(|e| fail(e.into()))?;
            let data = blobs.read(&key).map_err(|e| fail(e.into()))?;
            att.data = Some(data);
            att.stub = false;
        }

        Ok(UploadRevision {
            revision: revision.without_sequence(),
            history,
        })
    }

    fn record_failure(&self, doc_id: &str, rev_id: &RevisionId, error: &ReplicationError) {
        let class = error.classify();
        warn!(doc_id, rev_id = %rev_id, class = %class, error = %error, "Revision not pushed");
        crate::metrics::record_revision_failed(&self.config.remote_id, "push", &class.to_string());
        self.status.document(DocumentReplication {
            direction: Direction::Push,
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            error: Some(ErrorInfo::from(error)),
        });
    }
}

/// Local problems with one revision: a missing blob or a pruned history.
fn error_is_per_revision(error: &ReplicationError) -> bool {
    match error {
        ReplicationError::Blob(e) => e.is_content_error(),
        ReplicationError::Store(_) | ReplicationError::Revision(_) => {
            error.classify() != crate::error::ErrorClass::Fatal
        }
        _ => false,
    }
}

async fn purge_batch<S: LocalStore>(store: &S, batch: Vec<PurgeItem>) {
    let mut purged = 0;
    for (doc_id, rev_id) in batch {
        match store.purge_obsolete(&doc_id, &rev_id).await {
            Ok(n) => purged += n,
            Err(e) => warn!(doc_id = %doc_id, rev_id = %rev_id, error = %e, "Failed to purge pushed revision"),
        }
    }
    if purged > 0 {
        crate::metrics::record_revisions_purged(purged);
        debug!(purged, "Purged obsolete revision bodies");
    }
}

impl<S: LocalStore, T: Transport> Worker for Pusher<S, T> {
    fn direction(&self) -> Direction {
        Direction::Push
    }

    fn signals(&mut self) -> &mut Signals {
        &mut self.signals
    }

    fn session(&mut self) -> SessionFuture<'_> {
        Box::pin(self.run_session())
    }
}

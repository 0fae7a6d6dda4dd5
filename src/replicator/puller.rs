// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull direction: remote change feed into the local store.
//!
//! # Pipeline
//!
//! ```text
//! changes(since) ──► classify ──┬── nothing missing ──► complete
//!                               │
//!                               ├── bulk lane ────────┐
//!                               ├── individual lane ──┼─► fetch (bulkhead) ──► attachments ──► insert batcher
//!                               └── deleted lane ─────┘                                           │
//!                                                                                                 ▼
//!                                                      force_insert(allow_conflict) ──► frontier ──► checkpoint
//! ```
//!
//! Each change entry is registered with the frontier once, under its remote
//! sequence, with one part per missing revision. The checkpoint only moves
//! past an entry once all of its revisions were inserted or dropped.
//!
//! # Failure handling
//!
//! - Malformed revisions (bad history, digest mismatch, missing on the
//!   remote) are dropped, counted and released so progress continues.
//! - Transient failures are retried inside each request; exhausting the
//!   attempts ends the session.
//! - Fatal failures (auth, missing database, unusable store) end the session
//!   with the error.

use super::types::{ActivityLevel, Direction, DocumentReplication, ErrorInfo, Signals, StatusHub};
use super::{SessionEnd, SessionFuture, Worker};
use crate::batcher::Batcher;
use crate::blob_store::{BlobStoreError, BlobWriter};
use crate::checkpoint::{Checkpointer, Frontier};
use crate::config::ReplicatorConfig;
use crate::error::{ErrorClass, ReplicationError, Result};
use crate::local_store::LocalStore;
use crate::resilience::{with_retry, Bulkhead, RateLimiter, RetryConfig};
use crate::revision::{Revision, RevisionId};
use crate::transport::{
    ChangeEntry, ChangesRequest, FetchedRevision, RevisionRequest, Transport, TransportError,
    TransportErrorKind,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A revision waiting for insertion.
struct PendingInsert {
    revision: Revision,
    history: Vec<RevisionId>,
    seq: u64,
}

/// A revision to fetch, with the frontier sequence of its change entry.
#[derive(Debug, Clone)]
struct FetchItem {
    request: RevisionRequest,
    seq: u64,
}

/// Fetch work for one change-feed page.
#[derive(Debug, Default)]
struct Lanes {
    bulk: Vec<FetchItem>,
    individual: Vec<FetchItem>,
    deleted: Vec<FetchItem>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.bulk.len() + self.individual.len() + self.deleted.len()
    }
}

/// Errors that concern a single revision rather than the whole session.
fn is_per_revision(error: &ReplicationError) -> bool {
    match error {
        ReplicationError::Transport { source, .. } => matches!(
            source.kind,
            TransportErrorKind::NotFound | TransportErrorKind::Malformed | TransportErrorKind::Conflict
        ),
        ReplicationError::Blob(e) => e.is_content_error(),
        ReplicationError::Store(_) | ReplicationError::Revision(_) => {
            error.classify() != ErrorClass::Fatal
        }
        _ => false,
    }
}

/// Check a finished writer against the digest it was announced with.
fn install_verified(writer: BlobWriter, digest: &str) -> Result<u64> {
    if !writer.verify_digest(digest) {
        let actual = writer.sha1_digest_string().unwrap_or_default();
        writer.cancel();
        return Err(BlobStoreError::DigestMismatch {
            expected: digest.to_string(),
            actual,
        }
        .into());
    }
    let length = writer.length();
    writer.install()?;
    Ok(length)
}

/// Shared by a session's fetch tasks and its insertion batcher.
struct PullContext<S: LocalStore, T: Transport> {
    store: Arc<S>,
    transport: Arc<T>,
    remote: String,
    retry: RetryConfig,
    bulkhead: Arc<Bulkhead>,
    status: Arc<StatusHub>,
    frontier: Frontier<S>,
    /// First insert failure that must end the session.
    failure: Mutex<Option<ReplicationError>>,
}

impl<S: LocalStore, T: Transport> PullContext<S, T> {
    /// Release a revision that will not be inserted.
    fn drop_revision(&self, doc_id: &str, rev_id: &RevisionId, seq: u64, error: &ReplicationError) {
        let class = error.classify();
        warn!(doc_id, rev_id = %rev_id, class = %class, error = %error, "Dropping pulled revision");
        crate::metrics::record_revision_failed(&self.remote, "pull", &class.to_string());
        self.status.document(DocumentReplication {
            direction: Direction::Pull,
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            error: Some(ErrorInfo::from(error)),
        });
        self.frontier.complete(seq);
        self.status.add_completed(Direction::Pull, 1);
    }

    async fn insert_batch(&self, batch: Vec<PendingInsert>) {
        let mut inserted = 0;
        for item in batch {
            let doc_id = item.revision.doc_id.clone();
            let rev_id = item.revision.rev_id.clone();
            match self.store.force_insert(item.revision, item.history, true).await {
                Ok(outcome) => {
                    inserted += 1;
                    if outcome.in_conflict {
                        crate::metrics::record_conflict(&self.remote, "pull");
                        debug!(doc_id = %doc_id, winner = %outcome.winner, "Pulled revision left the document in conflict");
                    }
                    self.status.document(DocumentReplication {
                        direction: Direction::Pull,
                        doc_id,
                        rev_id,
                        error: None,
                    });
                    self.frontier.complete(item.seq);
                    self.status.add_completed(Direction::Pull, 1);
                }
                Err(e) => {
                    let error = ReplicationError::from(e);
                    if is_per_revision(&error) {
                        self.drop_revision(&doc_id, &rev_id, item.seq, &error);
                        continue;
                    }
                    // Left outstanding so the checkpoint stays behind it.
                    warn!(doc_id = %doc_id, rev_id = %rev_id, error = %error, "Local insert failed, ending session");
                    self.failure.lock().get_or_insert(error);
                    break;
                }
            }
        }
        crate::metrics::record_revisions_pulled(&self.remote, inserted);
    }

    /// Surface an insert failure recorded by the batcher.
    fn check_failure(&self) -> Result<()> {
        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Fetch one chunk and hand the results to the inserter.
    ///
    /// Returns an error only when the session must end.
    async fn fetch(
        &self,
        items: Vec<FetchItem>,
        bulk: bool,
        inserter: &Batcher<PendingInsert>,
    ) -> Result<()> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))?;

        let started = Instant::now();
        let mut results: Vec<Result<FetchedRevision>> = Vec::with_capacity(items.len());
        if bulk {
            let requests: Vec<RevisionRequest> = items.iter().map(|i| i.request.clone()).collect();
            let fetched = with_retry(&self.retry, "bulk_get", || {
                let requests = requests.clone();
                async move {
                    self.transport
                        .bulk_get(requests)
                        .await
                        .map_err(|e| ReplicationError::transport("bulk_get", e))
                }
            })
            .await?;
            if fetched.len() != items.len() {
                warn!(
                    requested = items.len(),
                    received = fetched.len(),
                    "Remote returned a different number of revisions"
                );
            }
            results.extend(
                fetched
                    .into_iter()
                    .map(|r| r.map_err(|e| ReplicationError::transport("bulk_get", e))),
            );
        } else {
            for item in &items {
                let result = with_retry(&self.retry, "get_revision", || {
                    let request = item.request.clone();
                    async move {
                        self.transport
                            .get_revision(request)
                            .await
                            .map_err(|e| ReplicationError::transport("get_revision", e))
                    }
                })
                .await;
                match result {
                    Err(e) if !is_per_revision(&e) => return Err(e),
                    other => results.push(other),
                }
            }
        }
        crate::metrics::record_remote_latency(
            &self.remote,
            if bulk { "bulk_get" } else { "get_revision" },
            started.elapsed(),
        );

        let mut results = results.into_iter();
        for item in items {
            let fetched = results.next().unwrap_or_else(|| {
                Err(ReplicationError::transport(
                    "bulk_get",
                    TransportError::malformed("revision missing from response"),
                ))
            });
            let accepted = match fetched {
                Ok(fetched) => self.accept(&item.request, fetched).await,
                Err(e) => Err(e),
            };
            match accepted {
                Ok((revision, history)) => inserter.queue(PendingInsert {
                    revision,
                    history,
                    seq: item.seq,
                }),
                Err(e) if is_per_revision(&e) => {
                    self.drop_revision(&item.request.doc_id, &item.request.rev_id, item.seq, &e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Validate a fetched revision and store its attachments.
    async fn accept(
        &self,
        request: &RevisionRequest,
        fetched: FetchedRevision,
    ) -> Result<(Revision, Vec<RevisionId>)> {
        let FetchedRevision {
            mut revision,
            history,
        } = fetched;
        if revision.doc_id != request.doc_id || revision.rev_id != request.rev_id {
            return Err(ReplicationError::transport(
                "fetch",
                TransportError::malformed(format!(
                    "asked for {}/{}, got {}/{}",
                    request.doc_id, request.rev_id, revision.doc_id, revision.rev_id
                )),
            ));
        }

        let blobs = self.store.blob_store();
        let mut attachments = Vec::with_capacity(revision.attachments.len());
        for mut att in std::mem::take(&mut revision.attachments) {
            let key = att.blob_key()?;
            if let Some(data) = att.data.take() {
                let mut writer = blobs.writer()?;
                writer.append(&data)?;
                writer.finish()?;
                install_verified(writer, &att.digest)?;
            } else if !blobs.has(&key) {
                self.download(&revision.doc_id, &att.digest).await?;
            }
            attachments.push(att.into_stub());
        }
        revision.attachments = attachments;
        Ok((revision.without_sequence(), history))
    }

    /// Stream an attachment the local store lacks into the blob store.
    async fn download(&self, doc_id: &str, digest: &str) -> Result<()> {
        let mut stream = with_retry(&self.retry, "get_attachment", || async move {
            self.transport
                .get_attachment(doc_id, digest)
                .await
                .map_err(|e| ReplicationError::transport("get_attachment", e))
        })
        .await?;

        let mut writer = self.store.blob_store().writer()?;
        while let Some(chunk) = stream.recv().await {
            let chunk = chunk.map_err(|e| ReplicationError::transport("get_attachment", e))?;
            writer.append(&chunk)?;
        }
        writer.finish()?;
        let length = install_verified(writer, digest)?;
        crate::metrics::record_attachment_downloaded(&self.remote, length);
        debug!(doc_id, digest, length, "Downloaded attachment");
        Ok(())
    }
}

/// Pull direction of a replicator.
pub(crate) struct Puller<S: LocalStore, T: Transport> {
    store: Arc<S>,
    transport: Arc<T>,
    config: Arc<ReplicatorConfig>,
    retry: RetryConfig,
    bulkhead: Arc<Bulkhead>,
    rate_limiter: Option<Arc<RateLimiter>>,
    status: Arc<StatusHub>,
    checkpointer: Arc<Checkpointer<S>>,
    signals: Signals,
}

impl<S: LocalStore, T: Transport> Puller<S, T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<S>,
        transport: Arc<T>,
        config: Arc<ReplicatorConfig>,
        bulkhead: Arc<Bulkhead>,
        rate_limiter: Option<Arc<RateLimiter>>,
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
            rate_limiter,
            status,
            checkpointer,
            signals,
        }
    }

    async fn run_session(&self) -> Result<SessionEnd> {
        self.status.set_activity(Direction::Pull, ActivityLevel::Connecting);
        let mut since = self.checkpointer.load().await?;

        let context = Arc::new(PullContext {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            remote: self.config.remote_id.clone(),
            retry: self.retry.clone(),
            bulkhead: Arc::clone(&self.bulkhead),
            status: Arc::clone(&self.status),
            frontier: Frontier::new(Arc::clone(&self.checkpointer)),
            failure: Mutex::new(None),
        });
        let inserter = {
            let context = Arc::clone(&context);
            Arc::new(Batcher::from_config(
                "pull_insert",
                &self.config.settings.batch,
                move |batch: Vec<PendingInsert>| {
                    let context = Arc::clone(&context);
                    async move { context.insert_batch(batch).await }
                },
            ))
        };
        let (autosave_stop, autosave_rx) = watch::channel(false);
        let autosave = self
            .checkpointer
            .spawn_autosave(self.config.settings.checkpoint.save_interval(), autosave_rx);

        let result = self.pull_pages(&context, &inserter, &mut since).await;

        // Land whatever was already fetched, then persist the frontier.
        inserter.close().await;
        let result = result.and_then(|end| context.check_failure().map(|()| end));
        let _ = autosave_stop.send(true);
        let _ = autosave.await;
        if let Err(e) = self.checkpointer.flush().await {
            warn!(error = %e, "Failed to save checkpoint at end of session");
        }
        debug!(pending = context.frontier.pending(), "Pull session ended");
        result
    }

    async fn pull_pages(
        &self,
        context: &Arc<PullContext<S, T>>,
        inserter: &Arc<Batcher<PendingInsert>>,
        since: &mut Option<String>,
    ) -> Result<SessionEnd> {
        let mut signals = self.signals.clone();
        let fetch = &self.config.settings.fetch;
        let allowed: Option<HashSet<String>> = self
            .config
            .doc_ids
            .as_ref()
            .map(|ids| ids.iter().cloned().collect());

        loop {
            let request = ChangesRequest {
                since: since.clone(),
                limit: fetch.changes_limit,
                doc_ids: self.config.doc_ids.clone(),
                filter_name: self.config.filter_name.clone(),
                filter_params: self.config.filter_params.clone(),
            };
            let started = Instant::now();
            let page = match signals
                .guard(with_retry(&self.retry, "changes", || {
                    let request = request.clone();
                    async move {
                        self.transport
                            .changes(request)
                            .await
                            .map_err(|e| ReplicationError::transport("changes", e))
                    }
                }))
                .await
            {
                Ok(page) => page?,
                Err(interrupt) => return Ok(interrupt.into()),
            };
            crate::metrics::record_remote_latency(&self.config.remote_id, "changes", started.elapsed());

            if page.entries.is_empty() {
                // Caught up: land everything in flight before reporting it.
                inserter.flush_all().await;
                context.check_failure()?;
                if let Err(e) = self.checkpointer.flush().await {
                    warn!(error = %e, "Failed to save checkpoint");
                }
                if !self.config.continuous {
                    info!("Pull caught up");
                    return Ok(SessionEnd::Finished);
                }
                self.status.set_activity(Direction::Pull, ActivityLevel::Idle);
                if let Err(interrupt) = signals.sleep(fetch.poll_interval_duration()).await {
                    return Ok(interrupt.into());
                }
                continue;
            }

            self.status.set_activity(Direction::Pull, ActivityLevel::Busy);
            crate::metrics::record_changes_received(&self.config.remote_id, page.entries.len());
            debug!(entries = page.entries.len(), since = ?since, "Received changes");

            let lanes = match signals
                .guard(self.classify(context, page.entries, allowed.as_ref()))
                .await
            {
                Ok(lanes) => lanes?,
                Err(interrupt) => return Ok(interrupt.into()),
            };
            self.status.add_total(Direction::Pull, lanes.len() as u64);

            match signals.guard(self.fetch_lanes(context, inserter, lanes)).await {
                Ok(result) => result?,
                Err(interrupt) => return Ok(interrupt.into()),
            }
            context.check_failure()?;

            if page.last_sequence.is_some() {
                *since = page.last_sequence;
            }
        }
    }

    /// Split change entries into fetch lanes. Entries with nothing missing
    /// complete immediately.
    async fn classify(
        &self,
        context: &PullContext<S, T>,
        entries: Vec<ChangeEntry>,
        allowed: Option<&HashSet<String>>,
    ) -> Result<Lanes> {
        let atts_since_limit = self.config.settings.fetch.atts_since_limit;
        let bulk = self.transport.supports_bulk_get();
        let mut lanes = Lanes::default();

        for entry in entries {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            let wanted = allowed.map_or(true, |ids| ids.contains(&entry.doc_id));
            let missing = if wanted {
                self.store
                    .find_missing(&entry.doc_id, &entry.rev_ids, atts_since_limit)
                    .await?
            } else {
                Default::default()
            };

            if missing.missing.is_empty() {
                let seq = context.frontier.add(entry.sequence);
                context.frontier.complete(seq);
                continue;
            }

            let seq = context
                .frontier
                .add_parts(entry.sequence, missing.missing.len());
            for rev_id in missing.missing {
                let item = FetchItem {
                    request: RevisionRequest {
                        doc_id: entry.doc_id.clone(),
                        rev_id,
                        atts_since: missing.possible_ancestors.clone(),
                    },
                    seq,
                };
                if entry.deleted {
                    lanes.deleted.push(item);
                } else if bulk {
                    lanes.bulk.push(item);
                } else {
                    lanes.individual.push(item);
                }
            }
        }
        Ok(lanes)
    }

    /// Fetch all lanes with bounded concurrency. Deleted revisions go last.
    async fn fetch_lanes(
        &self,
        context: &Arc<PullContext<S, T>>,
        inserter: &Arc<Batcher<PendingInsert>>,
        lanes: Lanes,
    ) -> Result<()> {
        let chunk = self.config.settings.fetch.bulk_batch_size.max(1);
        let bulk = self.transport.supports_bulk_get();
        let Lanes {
            bulk: bulk_lane,
            individual,
            deleted,
        } = lanes;

        let mut primary: Vec<(Vec<FetchItem>, bool)> =
            bulk_lane.chunks(chunk).map(|c| (c.to_vec(), true)).collect();
        primary.extend(individual.into_iter().map(|item| (vec![item], false)));

        let deleted: Vec<(Vec<FetchItem>, bool)> = if bulk {
            deleted.chunks(chunk).map(|c| (c.to_vec(), true)).collect()
        } else {
            deleted.into_iter().map(|item| (vec![item], false)).collect()
        };

        for work in [primary, deleted] {
            let mut tasks = JoinSet::new();
            for (items, bulk) in work {
                let context = Arc::clone(context);
                let inserter = Arc::clone(inserter);
                tasks.spawn(async move { context.fetch(items, bulk, &inserter).await });
            }
            // Dropping the set on early return aborts the remaining fetches.
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        return Err(ReplicationError::Internal(format!("fetch task failed: {e}")))
                    }
                }
            }
        }
        Ok(())
    }
}

impl<S: LocalStore, T: Transport> Worker for Puller<S, T> {
    fn direction(&self) -> Direction {
        Direction::Pull
    }

    fn signals(&mut self) -> &mut Signals {
        &mut self.signals
    }

    fn session(&mut self) -> SessionFuture<'_> {
        Box::pin(self.run_session())
    }
}

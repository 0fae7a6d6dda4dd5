// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator lifecycle.
//!
//! A [`Replicator`] owns up to two directions, a puller and a pusher, each
//! running as its own tokio task against the same local store and transport.
//! They share:
//! - the connection bulkhead (bounded concurrent remote calls)
//! - the optional rate limiter
//! - the [`StatusHub`] that aggregates their activity into one status
//! - the shutdown and reachability signals
//!
//! # Sessions
//!
//! A direction runs in sessions. A session loads the checkpoint, works
//! through pages until caught up, interrupted or failed, and always drains
//! its batchers and saves the checkpoint before returning. Between sessions
//! the direction loop decides what happens next:
//!
//! | Session ended with        | One-shot        | Continuous                        |
//! |---------------------------|-----------------|-----------------------------------|
//! | caught up                 | stop            | (never ends, idles inside)        |
//! | remote went offline       | wait for online | wait for online                   |
//! | transient error exhausted | stop with error | offline, retry after the interval |
//! | fatal error               | stop with error | stop with error                   |
//!
//! A fatal error in either direction stops the whole replicator: the failing
//! direction raises the shared shutdown signal so the other one drains too.

mod puller;
mod pusher;
mod types;

pub use types::{ActivityLevel, Direction, DocumentReplication, ErrorInfo, Progress, ReplicatorStatus};

use crate::checkpoint::{checkpoint_id, Checkpointer};
use crate::config::{ReplicationDirection, ReplicatorConfig};
use crate::error::{ErrorClass, Result};
use crate::local_store::{LocalStore, RevisionFilter};
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::revision::Revision;
use crate::transport::{Authorizer, Transport};
use puller::Puller;
use pusher::Pusher;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use types::{Interrupt, Signals, StatusHub};

/// How long `stop()` waits for each direction to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a session returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Caught up in one-shot mode.
    Finished,
    Shutdown,
    Offline,
}

impl From<Interrupt> for SessionEnd {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Shutdown => SessionEnd::Shutdown,
            Interrupt::Offline => SessionEnd::Offline,
        }
    }
}

pub(crate) type SessionFuture<'a> = Pin<Box<dyn Future<Output = Result<SessionEnd>> + Send + 'a>>;

/// One replication direction.
pub(crate) trait Worker: Send {
    fn direction(&self) -> Direction;

    fn signals(&mut self) -> &mut Signals;

    /// Run one session.
    fn session(&mut self) -> SessionFuture<'_>;
}

/// Run sessions until stopped, finished or failed.
async fn run_direction<W: Worker>(
    mut worker: W,
    continuous: bool,
    retry: RetryConfig,
    status: Arc<StatusHub>,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let direction = worker.direction();
    let result = loop {
        if !worker.signals().is_online() {
            status.set_activity(direction, ActivityLevel::Offline);
            info!("Remote unreachable, waiting");
            if worker.signals().wait_online().await.is_err() {
                break Ok(());
            }
        }

        match worker.session().await {
            Ok(SessionEnd::Finished) | Ok(SessionEnd::Shutdown) => break Ok(()),
            Ok(SessionEnd::Offline) => continue,
            Err(e) if e.is_retryable() && continuous => {
                status.record_error(&e);
                status.set_activity(direction, ActivityLevel::Offline);
                warn!(
                    error = %e,
                    retry_in_ms = retry.offline_retry_interval.as_millis() as u64,
                    "Remote unavailable, going offline"
                );
                if let Err(Interrupt::Shutdown) =
                    worker.signals().sleep(retry.offline_retry_interval).await
                {
                    break Ok(());
                }
            }
            Err(e) => {
                status.record_error(&e);
                error!(error = %e, class = %e.classify(), "Replication stopped");
                if e.classify() == ErrorClass::Fatal {
                    shutdown.send_replace(true);
                }
                break Err(e);
            }
        }
    };
    status.set_activity(direction, ActivityLevel::Stopped);
    result
}

struct Running {
    shutdown_tx: Arc<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }
}

/// Replicates documents between a local store and one remote.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
///
/// # Example
///
/// ```rust,ignore
/// let config = ReplicatorConfig::new("https://db.example.com/notes");
/// let replicator = Replicator::new(config, store, transport)
///     .with_filter(|rev, _params| rev.property("type") != Some(&json!("private")));
///
/// replicator.start().await?;
/// let status = replicator.wait_until_stopped().await;
/// assert!(status.error.is_none());
/// ```
pub struct Replicator<S: LocalStore, T: Transport> {
    config: Arc<ReplicatorConfig>,
    store: Arc<S>,
    transport: Arc<T>,
    filter: Option<RevisionFilter>,
    authorizer: Option<Arc<dyn Authorizer>>,
    status: Arc<StatusHub>,
    bulkhead: Arc<Bulkhead>,
    rate_limiter: Option<Arc<RateLimiter>>,
    online_tx: watch::Sender<bool>,
    control: Mutex<Option<Running>>,
}

impl<S: LocalStore, T: Transport> Replicator<S, T> {
    pub fn new(config: ReplicatorConfig, store: Arc<S>, transport: Arc<T>) -> Self {
        let fetch = &config.settings.fetch;
        let bulkhead = Arc::new(Bulkhead::for_connections(fetch.max_connections));
        let rate_limiter = fetch.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.per_second,
                burst = cfg.burst,
                "Rate limiting enabled for change processing"
            );
            Arc::new(RateLimiter::new(cfg))
        });
        let (online_tx, _) = watch::channel(true);

        Self {
            status: Arc::new(StatusHub::new(config.remote_id.clone())),
            config: Arc::new(config),
            store,
            transport,
            filter: None,
            authorizer: None,
            bulkhead,
            rate_limiter,
            online_tx,
            control: Mutex::new(None),
        }
    }

    /// Only push revisions the predicate accepts. It receives the
    /// configured `filter_params`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Revision, &BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        let params = self.config.filter_params.clone();
        self.filter = Some(Arc::new(move |rev: &Revision| filter(rev, &params)));
        self
    }

    /// Credentials handed to the transport on every start.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn status(&self) -> ReplicatorStatus {
        self.status.status()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status.subscribe()
    }

    /// Per-document outcomes, including errors.
    pub fn document_events(&self) -> broadcast::Receiver<DocumentReplication> {
        self.status.events()
    }

    /// Key of the checkpoint document for one direction.
    pub fn checkpoint_id(&self, direction: Direction) -> String {
        let direction = match direction {
            Direction::Pull => ReplicationDirection::Pull,
            Direction::Push => ReplicationDirection::Push,
        };
        checkpoint_id(
            &self.config.remote_id,
            direction,
            self.config.filter_name.as_deref(),
            &self.config.filter_params,
            self.config.doc_ids.as_deref(),
        )
    }

    /// Start replicating. Calling it while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        let mut control = self.control.lock().await;
        if let Some(running) = control.as_ref() {
            if !running.is_finished() {
                debug!(remote = %self.config.remote_id, "Replicator already running");
                return Ok(());
            }
        }
        // Reap a previous run that ended on its own.
        if let Some(previous) = control.take() {
            for handle in previous.handles {
                let _ = handle.await;
            }
        }

        let direction = self.config.direction;
        info!(
            remote = %self.config.remote_id,
            direction = %direction,
            continuous = self.config.continuous,
            "Starting replicator"
        );
        if let Some(authorizer) = &self.authorizer {
            self.transport.authorize(Arc::clone(authorizer));
        }
        self.status.begin(direction.pulls(), direction.pushes());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let signals = Signals::new(shutdown_rx, self.online_tx.subscribe());
        let mut handles = Vec::with_capacity(2);

        if direction.pulls() {
            let checkpointer = Arc::new(Checkpointer::new(
                Arc::clone(&self.store),
                self.checkpoint_id(Direction::Pull),
                "pull",
                self.config.remote_id.clone(),
            ));
            let worker = Puller::new(
                Arc::clone(&self.store),
                Arc::clone(&self.transport),
                Arc::clone(&self.config),
                Arc::clone(&self.bulkhead),
                self.rate_limiter.clone(),
                Arc::clone(&self.status),
                checkpointer,
                signals.clone(),
            );
            handles.push(self.spawn(worker, Arc::clone(&shutdown_tx)));
        }

        if direction.pushes() {
            let checkpointer = Arc::new(Checkpointer::new(
                Arc::clone(&self.store),
                self.checkpoint_id(Direction::Push),
                "push",
                self.config.remote_id.clone(),
            ));
            let worker = Pusher::new(
                Arc::clone(&self.store),
                Arc::clone(&self.transport),
                Arc::clone(&self.config),
                Arc::clone(&self.bulkhead),
                self.filter.clone(),
                Arc::clone(&self.status),
                checkpointer,
                signals,
            );
            handles.push(self.spawn(worker, Arc::clone(&shutdown_tx)));
        }

        *control = Some(Running {
            shutdown_tx,
            handles,
        });
        Ok(())
    }

    fn spawn<W: Worker + 'static>(&self, worker: W, shutdown: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
        let direction = worker.direction();
        let span = info_span!("replicate", remote = %self.config.remote_id, direction = %direction);
        let continuous = self.config.continuous;
        let retry = self.config.settings.retry.to_config();
        let status = Arc::clone(&self.status);
        tokio::spawn(
            async move {
                // Errors are reported through the status.
                let _ = run_direction(worker, continuous, retry, status, shutdown).await;
                debug!("Direction finished");
            }
            .instrument(span),
        )
    }

    /// Stop gracefully: in-flight batches finish and checkpoints are saved.
    pub async fn stop(&self) {
        let running = self.control.lock().await.take();
        let Some(running) = running else {
            self.status.stop_all();
            return;
        };
        info!(remote = %self.config.remote_id, "Stopping replicator");
        let _ = running.shutdown_tx.send(true);

        for (i, handle) in running.handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Direction stopped gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Direction panicked during stop"),
                Err(_) => warn!(task = i + 1, "Direction timed out during stop"),
            }
        }
        self.status.stop_all();
        info!(remote = %self.config.remote_id, "Replicator stopped");
    }

    /// The remote became unreachable: cut current work short and wait.
    pub fn go_offline(&self) {
        info!(remote = %self.config.remote_id, "Remote marked offline");
        self.online_tx.send_replace(false);
    }

    /// The remote is reachable again: resume from the checkpoints.
    pub fn go_online(&self) {
        info!(remote = %self.config.remote_id, "Remote marked online");
        self.online_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.status().activity != ActivityLevel::Stopped
    }

    /// Wait until every direction has stopped and return the final status.
    pub async fn wait_until_stopped(&self) -> ReplicatorStatus {
        let mut rx = self.status.subscribe();
        let result = rx
            .wait_for(|status| status.activity == ActivityLevel::Stopped)
            .await
            .map(|status| status.clone());
        match result {
            Ok(status) => status,
            Err(_) => self.status.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::BlobStore;
    use crate::error::ReplicationError;
    use crate::local_store::MemoryStore;
    use crate::transport::{
        AttachmentStream, ChangesPage, ChangesRequest, FetchedRevision, RevisionRequest,
        TransportError, TransportFuture, TransportResult, UploadOutcome, UploadRevision,
    };
    use crate::revision::RevisionId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote with an empty feed that records authorization.
    #[derive(Default)]
    struct EmptyRemote {
        authorized: AtomicUsize,
        fail_changes: bool,
    }

    impl Transport for EmptyRemote {
        fn authorize(&self, _authorizer: Arc<dyn Authorizer>) {
            self.authorized.fetch_add(1, Ordering::SeqCst);
        }

        fn database_exists(&self) -> TransportFuture<'_, bool> {
            Box::pin(async { Ok(true) })
        }

        fn create_database(&self) -> TransportFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn changes(&self, _request: ChangesRequest) -> TransportFuture<'_, ChangesPage> {
            let fail = self.fail_changes;
            Box::pin(async move {
                if fail {
                    Err(TransportError::auth("401 unauthorized"))
                } else {
                    Ok(ChangesPage::default())
                }
            })
        }

        fn bulk_get(
            &self,
            _requests: Vec<RevisionRequest>,
        ) -> TransportFuture<'_, Vec<TransportResult<FetchedRevision>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn get_revision(&self, request: RevisionRequest) -> TransportFuture<'_, FetchedRevision> {
            Box::pin(async move { Err(TransportError::not_found(request.doc_id)) })
        }

        fn get_attachment(&self, _doc_id: &str, digest: &str) -> TransportFuture<'_, AttachmentStream> {
            let digest = digest.to_string();
            Box::pin(async move { Err(TransportError::not_found(digest)) })
        }

        fn revs_diff(
            &self,
            _revs: BTreeMap<String, Vec<RevisionId>>,
        ) -> TransportFuture<'_, BTreeMap<String, Vec<RevisionId>>> {
            Box::pin(async { Ok(BTreeMap::new()) })
        }

        fn known_attachments(&self, _digests: Vec<String>) -> TransportFuture<'_, HashSet<String>> {
            Box::pin(async { Ok(HashSet::new()) })
        }

        fn bulk_docs(&self, revisions: Vec<UploadRevision>) -> TransportFuture<'_, Vec<UploadOutcome>> {
            Box::pin(async move { Ok(vec![UploadOutcome::Created; revisions.len()]) })
        }
    }

    struct StaticToken;

    impl Authorizer for StaticToken {
        fn credentials(&self) -> Option<String> {
            Some("token".into())
        }
    }

    fn store() -> (tempfile::TempDir, Arc<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, Arc::new(MemoryStore::new(blobs)))
    }

    #[tokio::test]
    async fn test_one_shot_against_empty_remote_stops() {
        let (_dir, store) = store();
        let config = ReplicatorConfig::for_testing("remote", ReplicationDirection::PushAndPull);
        let replicator = Replicator::new(config, store, Arc::new(EmptyRemote::default()));
        assert!(!replicator.is_running());

        replicator.start().await.unwrap();
        let status = replicator.wait_until_stopped().await;
        assert_eq!(status.activity, ActivityLevel::Stopped);
        assert!(status.error.is_none());
        assert_eq!(status.progress, Progress::default());
    }

    #[tokio::test]
    async fn test_start_hands_authorizer_to_transport() {
        let (_dir, store) = store();
        let remote = Arc::new(EmptyRemote::default());
        let config = ReplicatorConfig::for_testing("remote", ReplicationDirection::Pull);
        let replicator =
            Replicator::new(config, store, Arc::clone(&remote)).with_authorizer(Arc::new(StaticToken));

        replicator.start().await.unwrap();
        replicator.wait_until_stopped().await;
        assert_eq!(remote.authorized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let (_dir, store) = store();
        let remote = Arc::new(EmptyRemote {
            fail_changes: true,
            ..Default::default()
        });
        let mut config = ReplicatorConfig::for_testing("remote", ReplicationDirection::Pull);
        config.continuous = true;
        let replicator = Replicator::new(config, store, remote);

        replicator.start().await.unwrap();
        let status = replicator.wait_until_stopped().await;
        let error = status.error.expect("error recorded");
        assert_eq!(error.class, crate::error::ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_fatal_pull_error_stops_continuous_push() {
        let (_dir, store) = store();
        let remote = Arc::new(EmptyRemote {
            fail_changes: true,
            ..Default::default()
        });
        let mut config = ReplicatorConfig::for_testing("remote", ReplicationDirection::PushAndPull);
        config.continuous = true;
        let replicator = Replicator::new(config, store, remote);

        replicator.start().await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), replicator.wait_until_stopped())
            .await
            .unwrap();
        assert_eq!(status.activity, ActivityLevel::Stopped);
        assert_eq!(status.error.map(|e| e.class), Some(crate::error::ErrorClass::Fatal));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_returns() {
        let (_dir, store) = store();
        let mut config = ReplicatorConfig::for_testing("remote", ReplicationDirection::Pull);
        config.continuous = true;
        let replicator = Replicator::new(config, store, Arc::new(EmptyRemote::default()));

        replicator.start().await.unwrap();
        replicator.start().await.unwrap();
        assert!(replicator.is_running());

        replicator.stop().await;
        assert_eq!(replicator.status().activity, ActivityLevel::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (_dir, store) = store();
        let config = ReplicatorConfig::for_testing("", ReplicationDirection::Pull);
        let replicator = Replicator::new(config, store, Arc::new(EmptyRemote::default()));
        assert!(matches!(replicator.start().await, Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_checkpoint_ids_differ_by_direction() {
        let (_dir, store) = store();
        let config = ReplicatorConfig::for_testing("remote", ReplicationDirection::PushAndPull);
        let replicator = Replicator::new(config, store, Arc::new(EmptyRemote::default()));
        assert_ne!(
            replicator.checkpoint_id(Direction::Pull),
            replicator.checkpoint_id(Direction::Push)
        );
    }
}

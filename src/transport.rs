// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote transport interface.
//!
//! The replicator talks to the remote database only through [`Transport`].
//! Wire encoding, connection management and authentication handshakes belong
//! to the implementation; the replicator sees typed requests and a small
//! error taxonomy that drives retry decisions.
//!
//! # Error kinds
//!
//! | Kind               | Replicator reaction                              |
//! |--------------------|--------------------------------------------------|
//! | `TransientNetwork` | Retry with backoff, then go offline              |
//! | `PermanentAuth`    | Stop and report                                  |
//! | `Conflict`         | Surface per revision, never re-sent              |
//! | `NotFound`         | Stop (missing database) or skip (missing item)   |
//! | `Malformed`        | Drop the item, log, continue                     |
//!
//! # Example
//!
//! ```rust,ignore
//! impl Transport for MyHttpTransport {
//!     fn changes(&self, request: ChangesRequest) -> TransportFuture<'_, ChangesPage> {
//!         Box::pin(async move {
//!             let response = self.client.get_changes(&request).await?;
//!             Ok(response.into())
//!         })
//!     }
//!     // ...
//! }
//! ```

use crate::revision::{Revision, RevisionId};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Type alias for boxed transport futures.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Classification of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Connection refused, reset, timed out, 5xx.
    TransientNetwork,
    /// 401/403: credentials rejected.
    PermanentAuth,
    /// 409/412: revision conflicts with the remote's tree.
    Conflict,
    /// 404: database or item does not exist.
    NotFound,
    /// The remote sent something that cannot be decoded.
    Malformed,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientNetwork => write!(f, "transient network"),
            Self::PermanentAuth => write!(f, "permanent auth"),
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not found"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// A failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::TransientNetwork, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::PermanentAuth, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Malformed, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::TransientNetwork
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change feed
// ═══════════════════════════════════════════════════════════════════════════════

/// One document's entry in the remote change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Opaque remote sequence; only the remote can order these.
    pub sequence: String,
    pub doc_id: String,
    /// Leaf revisions of the document at this point in the feed.
    pub rev_ids: Vec<RevisionId>,
    /// The winning revision is a tombstone.
    pub deleted: bool,
}

/// Parameters for one change-feed page.
#[derive(Debug, Clone, Default)]
pub struct ChangesRequest {
    /// Exclusive start; `None` reads from the beginning.
    pub since: Option<String>,
    pub limit: usize,
    /// Only report these documents.
    pub doc_ids: Option<Vec<String>>,
    /// Remote-side filter function, evaluated by the remote.
    pub filter_name: Option<String>,
    pub filter_params: BTreeMap<String, Value>,
}

/// One page of the change feed. An empty page means caught up.
#[derive(Debug, Clone, Default)]
pub struct ChangesPage {
    pub entries: Vec<ChangeEntry>,
    /// Sequence to pass as `since` for the next page.
    pub last_sequence: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Revision transfer
// ═══════════════════════════════════════════════════════════════════════════════

/// Request for one revision's body.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionRequest {
    pub doc_id: String,
    pub rev_id: RevisionId,
    /// Local revisions that may be ancestors. Attachments unchanged since
    /// one of these can be sent as stubs.
    pub atts_since: Vec<RevisionId>,
}

/// A revision downloaded from the remote.
#[derive(Debug, Clone)]
pub struct FetchedRevision {
    /// Attachments are inline (`data` set) or stubs.
    pub revision: Revision,
    /// Ancestors, parent first.
    pub history: Vec<RevisionId>,
}

/// A revision to send to the remote.
#[derive(Debug, Clone)]
pub struct UploadRevision {
    /// Attachments the remote lacks carry `data`; others are stubs.
    pub revision: Revision,
    /// Ancestors, parent first.
    pub history: Vec<RevisionId>,
}

/// What happened to one uploaded revision.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Created,
    /// The remote refused the revision (409/412).
    Conflict(String),
    Failed(TransportError),
}

/// Streamed attachment bytes.
pub type AttachmentStream = mpsc::Receiver<TransportResult<Vec<u8>>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque credential source.
///
/// The replicator hands the authorizer to the transport once per start and
/// never inspects it.
pub trait Authorizer: Send + Sync + 'static {
    /// Credential to attach to requests, if any.
    fn credentials(&self) -> Option<String>;
}

/// Connection to one remote database.
///
/// Implementations clone borrowed arguments into the returned future.
pub trait Transport: Send + Sync + 'static {
    /// Install credentials for subsequent requests.
    fn authorize(&self, _authorizer: Arc<dyn Authorizer>) {}

    fn database_exists(&self) -> TransportFuture<'_, bool>;

    fn create_database(&self) -> TransportFuture<'_, ()>;

    /// One page of the change feed.
    fn changes(&self, request: ChangesRequest) -> TransportFuture<'_, ChangesPage>;

    /// Whether [`bulk_get`](Self::bulk_get) is available.
    fn supports_bulk_get(&self) -> bool {
        false
    }

    /// Fetch several revisions in one request. One result per request, in order.
    fn bulk_get(
        &self,
        requests: Vec<RevisionRequest>,
    ) -> TransportFuture<'_, Vec<TransportResult<FetchedRevision>>>;

    /// Fetch one revision.
    fn get_revision(&self, request: RevisionRequest) -> TransportFuture<'_, FetchedRevision>;

    /// Stream an attachment's bytes by digest.
    fn get_attachment(&self, doc_id: &str, digest: &str) -> TransportFuture<'_, AttachmentStream>;

    /// Which of the given revisions the remote lacks, per document.
    fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<RevisionId>>,
    ) -> TransportFuture<'_, BTreeMap<String, Vec<RevisionId>>>;

    /// Which of the given attachment digests the remote already stores.
    fn known_attachments(&self, digests: Vec<String>) -> TransportFuture<'_, HashSet<String>>;

    /// Upload revisions. One outcome per revision, in order.
    fn bulk_docs(&self, revisions: Vec<UploadRevision>) -> TransportFuture<'_, Vec<UploadOutcome>>;
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Every failure is classified into one of four categories, and the
//! replication state machines decide what to do from the class alone:
//!
//! # Error Categories
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | `Transient` | network drop, timeout, 5xx | retry with exponential backoff, then go offline |
//! | `Conflict` | 409 / 412 on upload, local write on a stale parent | surfaced per revision, never re-sent |
//! | `Malformed` | bad revID, digest mismatch, missing history | revision dropped and logged, batch continues |
//! | `Fatal` | auth refused, remote database missing, checkpoint store broken | replication stops and reports |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should go through the retry loop in [`crate::resilience`].

use crate::blob_store::BlobStoreError;
use crate::local_store::StoreError;
use crate::revision::RevisionError;
use crate::transport::{TransportError, TransportErrorKind};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// How the replicator reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; exhausting the attempts takes the direction offline.
    Transient,
    /// Per-revision conflict; recorded and not retried.
    Conflict,
    /// Per-revision bad data; dropped and logged.
    Malformed,
    /// Stops the replication.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Conflict => write!(f, "conflict"),
            Self::Malformed => write!(f, "malformed"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A call to the remote failed.
    ///
    /// The class follows the transport's own error kind.
    #[error("Transport error ({operation}): {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// The local store rejected an operation.
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    /// Attachment storage failed.
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobStoreError),

    /// A revision or revision ID was malformed.
    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    /// SQLite error while persisting checkpoints.
    ///
    /// Never retried; the local disk or file needs attention.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Rejected by [`ReplicatorConfig::validate`](crate::config::ReplicatorConfig::validate) or an unusable path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A network operation did not complete in time.
    #[error("Timed out after {millis}ms ({operation})")]
    Timeout { operation: String, millis: u64 },

    /// Replicator state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The replicator is stopping.
    #[error("Shutdown in progress")]
    Shutdown,

    /// A broken invariant inside the engine.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a transport error with the operation that produced it.
    pub fn transport(operation: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            operation: operation.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Transport { source, .. } => match source.kind {
                TransportErrorKind::TransientNetwork => ErrorClass::Transient,
                TransportErrorKind::Conflict => ErrorClass::Conflict,
                TransportErrorKind::Malformed => ErrorClass::Malformed,
                TransportErrorKind::PermanentAuth | TransportErrorKind::NotFound => {
                    ErrorClass::Fatal
                }
            },
            Self::Store(e) => match e {
                StoreError::Conflict { .. } => ErrorClass::Conflict,
                StoreError::NotFound { .. } | StoreError::Malformed(_) => ErrorClass::Malformed,
                StoreError::Unusable(_) | StoreError::Checkpoint(_) => ErrorClass::Fatal,
            },
            Self::Blob(e) => {
                if e.is_content_error() {
                    ErrorClass::Malformed
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Revision(_) => ErrorClass::Malformed,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::CheckpointStore(_)
            | Self::Config(_)
            | Self::InvalidState { .. }
            | Self::Shutdown
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Worth another attempt against the remote.
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document revision model.
//!
//! - [`RevisionId`]: generation + digest, totally ordered
//! - [`Revision`] and [`AttachmentMeta`]: one version of a document
//! - [`RevisionTree`]: per-document branch structure, winner and conflicts
//! - [`ConflictResolver`]: optional hook that merges conflicting leaves

mod model;
mod resolver;
mod rev_id;
mod tree;

pub use model::{AttachmentMeta, Revision};
pub use resolver::{
    resolution_revisions, Conflict, ConflictResolver, DefaultResolver, ResolvedRevision,
};
pub use rev_id::{validate_ancestry, RevIdForm, RevisionHistory, RevisionId};
pub use tree::{InsertOutcome, InsertStatus, RevisionTree};

use thiserror::Error;

/// Errors from the revision model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    #[error("Malformed revision ID: {0:?}")]
    MalformedRevId(String),

    #[error("Invalid revision history at {rev_id}: {reason}")]
    InvalidHistory { rev_id: String, reason: String },

    #[error("Revision {rev_id} already has sequence {existing}")]
    SequenceAlreadyAssigned { rev_id: String, existing: i64 },

    #[error("Revision belongs to {actual}, not {expected}")]
    DocumentMismatch { expected: String, actual: String },

    /// Local write whose parent is not the current winner.
    #[error("Conflict in {doc_id} (parent {parent:?})")]
    Conflict {
        doc_id: String,
        parent: Option<String>,
    },
}

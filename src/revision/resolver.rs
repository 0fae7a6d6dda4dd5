// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution hook.
//!
//! A resolver sees the current winner (`mine`), the best competing live leaf
//! (`theirs`) and their common ancestor, and either returns merged content or
//! defers. Applying a resolution adds two revisions: the merged content as a
//! child of `mine`, and a tombstone closing the `theirs` branch. Both IDs are
//! content-derived, so replicas resolving the same conflict the same way
//! converge on identical revisions.

use super::{AttachmentMeta, Revision, RevisionId};
use serde_json::{Map, Value};

/// A conflict between two live leaves of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub doc_id: String,
    /// Current winner.
    pub mine: Revision,
    /// Strongest losing live leaf.
    pub theirs: Revision,
    pub common_ancestor: Option<Revision>,
}

/// Content chosen by a resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRevision {
    pub body: Option<Map<String, Value>>,
    pub deleted: bool,
    pub attachments: Vec<AttachmentMeta>,
}

impl ResolvedRevision {
    /// Keep a revision's content as-is.
    pub fn from_revision(rev: &Revision) -> Self {
        Self {
            body: rev.body.clone(),
            deleted: rev.deleted,
            attachments: rev.attachments.clone(),
        }
    }
}

/// Custom conflict resolution.
pub trait ConflictResolver: Send + Sync + 'static {
    /// Return merged content, or `None` to leave the document in conflict.
    fn resolve(&self, conflict: &Conflict) -> Option<ResolvedRevision>;
}

/// Keeps whichever leaf the winner rule prefers: live over deleted, then the
/// greater revision ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &Conflict) -> Option<ResolvedRevision> {
        let rank = |r: &Revision| (!r.deleted, r.rev_id.clone());
        let chosen = if rank(&conflict.theirs) > rank(&conflict.mine) {
            &conflict.theirs
        } else {
            &conflict.mine
        };
        Some(ResolvedRevision::from_revision(chosen))
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Option<ResolvedRevision> + Send + Sync + 'static,
{
    fn resolve(&self, conflict: &Conflict) -> Option<ResolvedRevision> {
        self(conflict)
    }
}

/// Revisions that apply `resolved` to `conflict`, each with its parent as
/// history. Insert them with conflicts allowed.
pub fn resolution_revisions(
    conflict: &Conflict,
    resolved: ResolvedRevision,
) -> Vec<(Revision, Vec<RevisionId>)> {
    let mine = &conflict.mine.rev_id;
    let merged_id = RevisionId::for_content(resolved.body.as_ref(), resolved.deleted, Some(mine));
    let merged = if resolved.deleted {
        Revision::tombstone(conflict.doc_id.clone(), merged_id)
    } else {
        Revision::new(
            conflict.doc_id.clone(),
            merged_id,
            resolved.body.unwrap_or_default(),
        )
        .with_attachments(resolved.attachments)
    };

    let theirs = &conflict.theirs.rev_id;
    let closing = Revision::tombstone(
        conflict.doc_id.clone(),
        RevisionId::for_content(None, true, Some(theirs)),
    );

    vec![
        (merged, vec![mine.clone()]),
        (closing, vec![theirs.clone()]),
    ]
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-document revision tree.
//!
//! Revisions live in an arena (`Vec<RevNode>`) with parent indices and a
//! `RevisionId -> index` map. Ancestors named in a revision's history that
//! are not known locally become *phantoms*: nodes with an ID and a parent
//! link but no content.
//!
//! # Winner
//!
//! Among the leaves, a live leaf beats a deleted one; ties go to the greater
//! [`RevisionId`]. The rule depends only on the set of leaves, so every
//! replica that has the same revisions picks the same winner whatever order
//! they arrived in.
//!
//! A document is in conflict when it has more than one live leaf.

use super::{
    validate_ancestry, AttachmentMeta, Conflict, Revision, RevisionError, RevisionId,
};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct RevNode {
    rev_id: RevisionId,
    parent: Option<usize>,
    deleted: bool,
    body: Option<Map<String, Value>>,
    attachments: Vec<AttachmentMeta>,
    sequence: i64,
    phantom: bool,
    leaf: bool,
}

impl RevNode {
    fn phantom(rev_id: RevisionId, parent: Option<usize>) -> Self {
        Self {
            rev_id,
            parent,
            deleted: false,
            body: None,
            attachments: Vec::new(),
            sequence: 0,
            phantom: true,
            leaf: false,
        }
    }

    fn to_revision(&self, doc_id: &str) -> Revision {
        Revision::stored(
            doc_id,
            self.rev_id.clone(),
            self.deleted,
            self.body.clone(),
            self.attachments.clone(),
            self.sequence,
        )
    }
}

/// What [`RevisionTree::force_insert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// A new node was added.
    Created,
    /// An existing phantom received its content.
    FilledPhantom,
    /// The revision was already present; nothing changed.
    AlreadyPresent,
}

/// Result of an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub status: InsertStatus,
    pub winner: RevisionId,
    pub in_conflict: bool,
    pub phantoms_created: usize,
}

/// All revisions of one document.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    doc_id: String,
    nodes: Vec<RevNode>,
    index: HashMap<RevisionId, usize>,
    leaves: Vec<usize>,
    winner: Option<usize>,
}

impl RevisionTree {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            leaves: Vec::new(),
            winner: None,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Number of nodes, phantoms included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a revision with its ancestry.
    ///
    /// `history` lists ancestors newest first, starting at the parent. It may
    /// be truncated; unknown ancestors become phantoms. With
    /// `allow_conflict == false` (local writes) the parent must be the current
    /// winner, or the tree must be empty and the revision a root.
    pub fn force_insert(
        &mut self,
        rev: Revision,
        history: &[RevisionId],
        allow_conflict: bool,
    ) -> Result<InsertOutcome, RevisionError> {
        if rev.doc_id != self.doc_id {
            return Err(RevisionError::DocumentMismatch {
                expected: self.doc_id.clone(),
                actual: rev.doc_id,
            });
        }
        validate_ancestry(rev.generation(), history)?;

        if let Some(&idx) = self.index.get(&rev.rev_id) {
            if !self.nodes[idx].phantom {
                return Ok(self.outcome(InsertStatus::AlreadyPresent, 0));
            }
            let before = self.nodes.len();
            if self.nodes[idx].parent.is_none() {
                let parent = self.link_ancestors(history);
                self.nodes[idx].parent = parent;
                self.adopt(parent);
            }
            self.fill(idx, rev);
            self.recompute_winner();
            return Ok(self.outcome(InsertStatus::FilledPhantom, self.nodes.len() - before));
        }

        if !allow_conflict {
            let parent = history.first();
            let accepted = match (self.winner_id(), parent) {
                (None, None) => self.nodes.is_empty(),
                (Some(winner), Some(parent)) => winner == parent,
                _ => false,
            };
            if !accepted {
                return Err(RevisionError::Conflict {
                    doc_id: self.doc_id.clone(),
                    parent: parent.map(ToString::to_string),
                });
            }
        }

        let before = self.nodes.len();
        let parent = self.link_ancestors(history);
        let phantoms = self.nodes.len() - before;

        let idx = self.push_node(
            RevNode {
                rev_id: rev.rev_id.clone(),
                parent,
                deleted: false,
                body: None,
                attachments: Vec::new(),
                sequence: 0,
                phantom: true,
                leaf: true,
            },
            parent,
        );
        self.fill(idx, rev);
        self.leaves.push(idx);
        self.recompute_winner();

        Ok(self.outcome(InsertStatus::Created, phantoms))
    }

    /// Create phantoms for unknown ancestors; returns the parent index.
    fn link_ancestors(&mut self, history: &[RevisionId]) -> Option<usize> {
        if history.is_empty() {
            return None;
        }
        let known = history.iter().position(|h| self.index.contains_key(h));
        let (mut parent, unknown) = match known {
            Some(k) => (self.index.get(&history[k]).copied(), &history[..k]),
            None => (None, history),
        };
        for ancestor in unknown.iter().rev() {
            let idx = self.push_node(RevNode::phantom(ancestor.clone(), parent), parent);
            parent = Some(idx);
        }
        parent
    }

    fn push_node(&mut self, node: RevNode, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.index.insert(node.rev_id.clone(), idx);
        self.nodes.push(node);
        self.adopt(parent);
        idx
    }

    /// A node that gains a child stops being a leaf.
    fn adopt(&mut self, parent: Option<usize>) {
        if let Some(p) = parent {
            if self.nodes[p].leaf {
                self.nodes[p].leaf = false;
                self.leaves.retain(|&l| l != p);
            }
        }
    }

    fn fill(&mut self, idx: usize, rev: Revision) {
        let node = &mut self.nodes[idx];
        node.deleted = rev.deleted;
        node.sequence = rev.sequence();
        node.body = rev.body;
        node.attachments = rev.attachments;
        node.phantom = false;
    }

    fn outcome(&self, status: InsertStatus, phantoms_created: usize) -> InsertOutcome {
        InsertOutcome {
            status,
            winner: self
                .winner_id()
                .cloned()
                .unwrap_or_else(|| self.nodes[self.nodes.len() - 1].rev_id.clone()),
            in_conflict: self.in_conflict(),
            phantoms_created,
        }
    }

    fn leaf_order(&self, a: usize, b: usize) -> Ordering {
        let (a, b) = (&self.nodes[a], &self.nodes[b]);
        (!a.deleted)
            .cmp(&!b.deleted)
            .then_with(|| a.rev_id.cmp(&b.rev_id))
    }

    fn recompute_winner(&mut self) {
        self.winner = self
            .leaves
            .iter()
            .copied()
            .max_by(|&a, &b| self.leaf_order(a, b));
    }

    /// Current winning revision ID.
    pub fn winner_id(&self) -> Option<&RevisionId> {
        self.winner.map(|i| &self.nodes[i].rev_id)
    }

    /// Current winning revision.
    pub fn current(&self) -> Option<Revision> {
        self.winner.map(|i| self.nodes[i].to_revision(&self.doc_id))
    }

    /// Whether the winner is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.winner.is_some_and(|i| self.nodes[i].deleted)
    }

    pub fn in_conflict(&self) -> bool {
        self.leaves
            .iter()
            .filter(|&&i| !self.nodes[i].deleted)
            .count()
            > 1
    }

    /// Leaf IDs, greatest first.
    pub fn leaf_ids(&self) -> Vec<RevisionId> {
        let mut leaves: Vec<usize> = self.leaves.clone();
        leaves.sort_by(|&a, &b| self.leaf_order(b, a));
        leaves.into_iter().map(|i| self.nodes[i].rev_id.clone()).collect()
    }

    /// Live leaves other than the winner.
    pub fn conflicting_ids(&self) -> Vec<RevisionId> {
        self.leaf_ids()
            .into_iter()
            .skip(1)
            .filter(|id| self.index.get(id).is_some_and(|&i| !self.nodes[i].deleted))
            .collect()
    }

    /// Revision with content; `None` for unknown IDs and phantoms.
    pub fn get(&self, rev_id: &RevisionId) -> Option<Revision> {
        let idx = *self.index.get(rev_id)?;
        let node = &self.nodes[idx];
        (!node.phantom).then(|| node.to_revision(&self.doc_id))
    }

    /// Known with content.
    pub fn contains(&self, rev_id: &RevisionId) -> bool {
        self.index
            .get(rev_id)
            .is_some_and(|&i| !self.nodes[i].phantom)
    }

    /// Ancestor IDs of `rev_id`, parent first. `None` for unknown IDs.
    pub fn history(&self, rev_id: &RevisionId) -> Option<Vec<RevisionId>> {
        let mut cursor = self.nodes[*self.index.get(rev_id)?].parent;
        let mut ancestors = Vec::new();
        while let Some(idx) = cursor {
            ancestors.push(self.nodes[idx].rev_id.clone());
            cursor = self.nodes[idx].parent;
        }
        Some(ancestors)
    }

    /// Which of `rev_ids` this tree lacks content for.
    pub fn find_missing(&self, rev_ids: &[RevisionId]) -> Vec<RevisionId> {
        rev_ids
            .iter()
            .filter(|r| !self.contains(r))
            .cloned()
            .collect()
    }

    /// Local revisions older than `rev_id` that still have bodies, newest
    /// first. A remote can use them to send attachments as stubs.
    pub fn possible_ancestors(&self, rev_id: &RevisionId, limit: usize) -> Vec<RevisionId> {
        let mut candidates: Vec<&RevNode> = self
            .nodes
            .iter()
            .filter(|n| {
                !n.phantom && n.body.is_some() && n.rev_id.generation() < rev_id.generation()
            })
            .collect();
        candidates.sort_by(|a, b| b.rev_id.cmp(&a.rev_id));
        candidates
            .into_iter()
            .take(limit)
            .map(|n| n.rev_id.clone())
            .collect()
    }

    /// Most recent ancestor shared by `a` and `b` (either may be the other's
    /// ancestor).
    pub fn common_ancestor(&self, a: &RevisionId, b: &RevisionId) -> Option<RevisionId> {
        let mut seen = HashSet::new();
        let mut cursor = self.index.get(a).copied();
        while let Some(idx) = cursor {
            seen.insert(idx);
            cursor = self.nodes[idx].parent;
        }
        let mut cursor = self.index.get(b).copied();
        while let Some(idx) = cursor {
            if seen.contains(&idx) {
                return Some(self.nodes[idx].rev_id.clone());
            }
            cursor = self.nodes[idx].parent;
        }
        None
    }

    /// The winner and its strongest competing live leaf.
    pub fn conflict(&self) -> Option<Conflict> {
        if !self.in_conflict() {
            return None;
        }
        let mine = self.current()?;
        let theirs_id = self.conflicting_ids().into_iter().next()?;
        let theirs = self.get(&theirs_id)?;
        let common_ancestor = self
            .common_ancestor(&mine.rev_id, &theirs.rev_id)
            .and_then(|id| self.get(&id));
        Some(Conflict {
            doc_id: self.doc_id.clone(),
            mine,
            theirs,
            common_ancestor,
        })
    }

    /// Non-phantom revisions with a sequence greater than `since`.
    pub fn revisions_since(&self, since: i64) -> impl Iterator<Item = Revision> + '_ {
        self.nodes
            .iter()
            .filter(move |n| !n.phantom && n.sequence > since)
            .map(|n| n.to_revision(&self.doc_id))
    }

    /// Drop bodies of every ancestor of `rev_id`. Returns how many were
    /// stripped.
    pub fn strip_ancestors(&mut self, rev_id: &RevisionId) -> usize {
        let Some(&idx) = self.index.get(rev_id) else {
            return 0;
        };
        let mut stripped = 0;
        let mut cursor = self.nodes[idx].parent;
        while let Some(i) = cursor {
            stripped += self.strip(i);
            cursor = self.nodes[i].parent;
        }
        stripped
    }

    /// Drop bodies of non-leaf revisions more than `max_depth` generations
    /// above every leaf.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        let mut min_distance = vec![usize::MAX; self.nodes.len()];
        for &leaf in &self.leaves {
            let mut cursor = Some(leaf);
            let mut distance = 0;
            while let Some(i) = cursor {
                if min_distance[i] <= distance {
                    break;
                }
                min_distance[i] = distance;
                distance += 1;
                cursor = self.nodes[i].parent;
            }
        }
        (0..self.nodes.len())
            .filter(|&i| min_distance[i] != usize::MAX && min_distance[i] > max_depth)
            .map(|i| self.strip(i))
            .sum()
    }

    fn strip(&mut self, idx: usize) -> usize {
        let node = &mut self.nodes[idx];
        if node.leaf || node.body.is_none() {
            return 0;
        }
        node.body = None;
        node.attachments.clear();
        1
    }

    /// Digests of attachments referenced by revisions that still have bodies.
    pub fn attachment_digests(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes
            .iter()
            .filter(|n| !n.phantom)
            .flat_map(|n| n.attachments.iter().map(|a| a.digest.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    fn live(rev: &str) -> Revision {
        Revision::new("doc", rid(rev), json!({ "rev": rev }).as_object().cloned().unwrap())
    }

    fn history(ids: &[&str]) -> Vec<RevisionId> {
        ids.iter().map(|s| rid(s)).collect()
    }

    /// The `1-a` / `2-b` / `2-c` scenario.
    fn branched() -> RevisionTree {
        let mut tree = RevisionTree::new("doc");
        tree.force_insert(live("1-a"), &[], true).unwrap();
        tree.force_insert(live("2-b"), &history(&["1-a"]), true).unwrap();
        tree.force_insert(live("2-c"), &history(&["1-a"]), true).unwrap();
        tree
    }

    #[test]
    fn test_conflict_scenario() {
        let tree = branched();
        assert_eq!(tree.winner_id(), Some(&rid("2-c")));
        assert!(tree.in_conflict());
        assert_eq!(tree.leaf_ids(), history(&["2-c", "2-b"]));
        assert_eq!(tree.conflicting_ids(), history(&["2-b"]));
    }

    #[test]
    fn test_deleting_loser_clears_conflict() {
        let mut tree = branched();
        tree.force_insert(Revision::tombstone("doc", rid("3-x")), &history(&["2-b", "1-a"]), true)
            .unwrap();
        assert_eq!(tree.winner_id(), Some(&rid("2-c")));
        assert!(!tree.in_conflict());
    }

    #[test]
    fn test_deleting_winner_promotes_live_leaf() {
        let mut tree = branched();
        tree.force_insert(Revision::tombstone("doc", rid("3-z")), &history(&["2-c"]), true)
            .unwrap();
        assert_eq!(tree.winner_id(), Some(&rid("2-b")));
        assert!(!tree.is_deleted());
        assert!(!tree.in_conflict());
    }

    #[test]
    fn test_all_leaves_deleted() {
        let mut tree = RevisionTree::new("doc");
        tree.force_insert(live("1-a"), &[], true).unwrap();
        tree.force_insert(Revision::tombstone("doc", rid("2-b")), &history(&["1-a"]), true)
            .unwrap();
        assert!(tree.is_deleted());
        assert!(!tree.in_conflict());
        assert_eq!(tree.current().unwrap().rev_id, rid("2-b"));
    }

    #[test]
    fn test_phantom_ancestors() {
        let mut tree = RevisionTree::new("doc");
        let outcome = tree
            .force_insert(live("3-c"), &history(&["2-b", "1-a"]), true)
            .unwrap();
        assert_eq!(outcome.status, InsertStatus::Created);
        assert_eq!(outcome.phantoms_created, 2);
        assert_eq!(tree.len(), 3);
        assert!(tree.get(&rid("2-b")).is_none());
        assert!(!tree.contains(&rid("1-a")));
        assert_eq!(tree.history(&rid("3-c")).unwrap(), history(&["2-b", "1-a"]));
        assert_eq!(tree.find_missing(&history(&["3-c", "2-b", "9-z"])), history(&["2-b", "9-z"]));

        let outcome = tree.force_insert(live("2-b"), &history(&["1-a"]), true).unwrap();
        assert_eq!(outcome.status, InsertStatus::FilledPhantom);
        assert!(tree.contains(&rid("2-b")));
        assert_eq!(tree.winner_id(), Some(&rid("3-c")));
    }

    #[test]
    fn test_truncated_history_links_later() {
        let mut tree = RevisionTree::new("doc");
        tree.force_insert(live("3-c"), &history(&["2-b"]), true).unwrap();
        assert_eq!(tree.history(&rid("3-c")).unwrap(), history(&["2-b"]));

        tree.force_insert(live("2-b"), &history(&["1-a"]), true).unwrap();
        assert_eq!(tree.history(&rid("3-c")).unwrap(), history(&["2-b", "1-a"]));
    }

    #[test]
    fn test_already_present_is_noop() {
        let mut tree = branched();
        let outcome = tree.force_insert(live("2-b"), &history(&["1-a"]), true).unwrap();
        assert_eq!(outcome.status, InsertStatus::AlreadyPresent);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_local_write_requires_winner_parent() {
        let mut tree = branched();
        let err = tree
            .force_insert(live("3-d"), &history(&["2-b", "1-a"]), false)
            .unwrap_err();
        assert!(matches!(err, RevisionError::Conflict { .. }));

        tree.force_insert(live("3-d"), &history(&["2-c", "1-a"]), false)
            .unwrap();
        assert_eq!(tree.winner_id(), Some(&rid("3-d")));

        let mut empty = RevisionTree::new("doc");
        assert!(empty.force_insert(live("1-a"), &[], false).is_ok());
        assert!(empty.force_insert(live("1-b"), &[], false).is_err());
    }

    #[test]
    fn test_rejects_broken_history() {
        let mut tree = RevisionTree::new("doc");
        let err = tree.force_insert(live("3-c"), &history(&["1-a"]), true).unwrap_err();
        assert!(matches!(err, RevisionError::InvalidHistory { .. }));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_rejects_other_document() {
        let mut tree = RevisionTree::new("other");
        assert!(matches!(
            tree.force_insert(live("1-a"), &[], true),
            Err(RevisionError::DocumentMismatch { .. })
        ));
    }

    #[test]
    fn test_common_ancestor() {
        let mut tree = branched();
        tree.force_insert(live("3-d"), &history(&["2-c", "1-a"]), true).unwrap();
        assert_eq!(tree.common_ancestor(&rid("3-d"), &rid("2-b")), Some(rid("1-a")));
        assert_eq!(tree.common_ancestor(&rid("3-d"), &rid("2-c")), Some(rid("2-c")));
        assert_eq!(tree.common_ancestor(&rid("3-d"), &rid("9-z")), None);
    }

    #[test]
    fn test_conflict_description() {
        let tree = branched();
        let conflict = tree.conflict().unwrap();
        assert_eq!(conflict.mine.rev_id, rid("2-c"));
        assert_eq!(conflict.theirs.rev_id, rid("2-b"));
        assert_eq!(conflict.common_ancestor.unwrap().rev_id, rid("1-a"));
    }

    #[test]
    fn test_strip_and_prune() {
        let mut tree = RevisionTree::new("doc");
        tree.force_insert(live("1-a"), &[], true).unwrap();
        tree.force_insert(live("2-b"), &history(&["1-a"]), true).unwrap();
        tree.force_insert(live("3-c"), &history(&["2-b", "1-a"]), true).unwrap();
        tree.force_insert(live("4-d"), &history(&["3-c", "2-b", "1-a"]), true).unwrap();

        assert_eq!(tree.prune(2), 1);
        assert!(tree.get(&rid("1-a")).unwrap().body.is_none());
        assert!(tree.get(&rid("2-b")).unwrap().body.is_some());

        assert_eq!(tree.strip_ancestors(&rid("4-d")), 2);
        assert!(tree.get(&rid("4-d")).unwrap().body.is_some());
        assert_eq!(tree.strip_ancestors(&rid("4-d")), 0);
    }

    #[test]
    fn test_possible_ancestors() {
        let tree = branched();
        assert_eq!(
            tree.possible_ancestors(&rid("3-x"), 10),
            history(&["2-c", "2-b", "1-a"])
        );
        assert_eq!(tree.possible_ancestors(&rid("3-x"), 1), history(&["2-c"]));
        assert!(tree.possible_ancestors(&rid("1-x"), 10).is_empty());
    }

    #[test]
    fn test_revisions_since() {
        let mut tree = RevisionTree::new("doc");
        let mut first = live("1-a");
        first.assign_sequence(1).unwrap();
        let mut second = live("2-b");
        second.assign_sequence(5).unwrap();
        tree.force_insert(first, &[], true).unwrap();
        tree.force_insert(second, &history(&["1-a"]), true).unwrap();

        let since: Vec<_> = tree.revisions_since(1).map(|r| r.rev_id).collect();
        assert_eq!(since, history(&["2-b"]));
        assert_eq!(tree.revisions_since(0).count(), 2);
    }

    #[test]
    fn test_read_back_keeps_sequence() {
        let mut tree = RevisionTree::new("doc");
        let mut first = live("1-a");
        first.assign_sequence(3).unwrap();
        tree.force_insert(first, &[], true).unwrap();
        let mut tombstone = Revision::tombstone("doc", rid("2-b"));
        tombstone.assign_sequence(7).unwrap();
        tree.force_insert(tombstone, &history(&["1-a"]), true).unwrap();

        let stored = tree.get(&rid("1-a")).unwrap();
        assert_eq!(stored.sequence(), 3);
        assert!(!stored.deleted);
        assert!(stored.body.is_some());

        let current = tree.current().unwrap();
        assert_eq!(current.sequence(), 7);
        assert!(current.deleted);

        // The sequence stays fixed once assigned.
        let mut copy = stored;
        assert!(copy.assign_sequence(9).is_err());
        assert!(copy.assign_sequence(3).is_ok());
    }
}

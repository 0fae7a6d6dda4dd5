//! Fuzz target for inserting revisions with arbitrary ancestry.
//!
//! Malformed histories must be rejected with an error, and whatever is
//! accepted must leave the tree with a winner among its leaves.

#![no_main]

use doc_replication::{Revision, RevisionId, RevisionTree};
use libfuzzer_sys::fuzz_target;
use serde_json::Map;

fuzz_target!(|data: Vec<(String, Vec<String>, bool)>| {
    let mut tree = RevisionTree::new("doc");

    for (rev, history, deleted) in data.iter().take(32) {
        let Ok(rev_id) = RevisionId::parse(rev) else {
            continue;
        };
        let history: Vec<RevisionId> = history
            .iter()
            .take(16)
            .filter_map(|h| RevisionId::parse(h).ok())
            .collect();
        let revision = if *deleted {
            Revision::tombstone("doc", rev_id)
        } else {
            Revision::new("doc", rev_id, Map::new())
        };
        let _ = tree.force_insert(revision, &history, true);
    }

    if let Some(winner) = tree.winner_id() {
        assert!(tree.leaf_ids().contains(winner));
    }
});

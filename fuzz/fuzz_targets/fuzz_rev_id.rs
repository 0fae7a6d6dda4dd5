//! Fuzz target for revision ID parsing and ordering.
//!
//! Parsing must never panic, and any ID that parses must print back to
//! text that parses to the same ID.

#![no_main]

use doc_replication::RevisionId;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let (Ok(a), Ok(b)) = (RevisionId::parse(a), RevisionId::parse(b)) else {
        return;
    };

    assert_eq!(RevisionId::parse(&a.to_string()).ok().as_ref(), Some(&a));
    assert!(a.generation() > 0);

    // Total order
    assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
    assert_eq!(a.cmp(&a), Ordering::Equal);
    if a.generation() != b.generation() {
        assert_eq!(a.cmp(&b), a.generation().cmp(&b.generation()));
    }
});

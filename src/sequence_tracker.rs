// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint frontier over out-of-order completions.
//!
//! Work items are registered in arrival order and complete in any order. The
//! tracker reports the greatest position below which everything is done, and
//! the caller-supplied value associated with that position (typically the
//! remote's opaque sequence token).
//!
//! ```text
//! add:       1  2  3  4  5
//! remove:       2     4
//! pending:   1     3     5    checkpointed_sequence = 0
//! remove 1:        3     5    checkpointed_sequence = 2
//! ```

use std::collections::{BTreeSet, VecDeque};

/// Tracks which sequences are still in flight.
#[derive(Debug)]
pub struct SequenceTracker<V> {
    last_sequence: u64,
    pending: BTreeSet<u64>,
    /// Values for sequences `first_value_seq..=last_sequence`.
    values: VecDeque<V>,
    first_value_seq: u64,
}

impl<V> Default for SequenceTracker<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SequenceTracker<V> {
    pub fn new() -> Self {
        Self {
            last_sequence: 0,
            pending: BTreeSet::new(),
            values: VecDeque::new(),
            first_value_seq: 1,
        }
    }

    /// Register a new pending item and return its sequence (starting at 1).
    pub fn add(&mut self, value: V) -> u64 {
        self.last_sequence += 1;
        self.pending.insert(self.last_sequence);
        self.values.push_back(value);
        self.last_sequence
    }

    /// Mark a sequence complete. Returns false if it was not pending.
    pub fn remove(&mut self, seq: u64) -> bool {
        self.pending.remove(&seq)
    }

    /// Greatest sequence with nothing pending at or below it.
    pub fn checkpointed_sequence(&self) -> u64 {
        match self.pending.first() {
            Some(&oldest) => oldest - 1,
            None => self.last_sequence,
        }
    }

    /// Value registered with [`checkpointed_sequence`](Self::checkpointed_sequence).
    ///
    /// Values older than the frontier are released.
    pub fn checkpointed_value(&mut self) -> Option<&V> {
        let seq = self.checkpointed_sequence();
        if seq == 0 {
            return None;
        }
        while self.first_value_seq < seq && !self.values.is_empty() {
            self.values.pop_front();
            self.first_value_seq += 1;
        }
        self.values.front()
    }

    /// Nothing pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending sequences.
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// Last sequence handed out.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker() {
        let mut tracker: SequenceTracker<&str> = SequenceTracker::new();
        assert!(tracker.is_empty());
        assert_eq!(tracker.checkpointed_sequence(), 0);
        assert!(tracker.checkpointed_value().is_none());
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut tracker = SequenceTracker::new();
        let seqs: Vec<u64> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|v| tracker.add(v))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        assert!(tracker.remove(2));
        assert!(tracker.remove(4));
        assert_eq!(tracker.checkpointed_sequence(), 0);
        assert_eq!(tracker.count(), 3);

        assert!(tracker.remove(1));
        assert_eq!(tracker.checkpointed_sequence(), 2);
        assert_eq!(tracker.checkpointed_value(), Some(&"b"));

        assert!(tracker.remove(3));
        assert_eq!(tracker.checkpointed_sequence(), 4);
        assert_eq!(tracker.checkpointed_value(), Some(&"d"));

        assert!(tracker.remove(5));
        assert!(tracker.is_empty());
        assert_eq!(tracker.checkpointed_sequence(), 5);
        assert_eq!(tracker.checkpointed_value(), Some(&"e"));
    }

    #[test]
    fn test_remove_unknown_is_false() {
        let mut tracker = SequenceTracker::new();
        tracker.add(1u32);
        assert!(!tracker.remove(7));
        assert!(tracker.remove(1));
        assert!(!tracker.remove(1));
    }

    #[test]
    fn test_frontier_never_regresses() {
        let mut tracker = SequenceTracker::new();
        tracker.add(10);
        tracker.add(20);
        tracker.remove(1);
        tracker.remove(2);
        assert_eq!(tracker.checkpointed_value(), Some(&20));

        // New work after the frontier does not move it back.
        tracker.add(30);
        assert_eq!(tracker.checkpointed_sequence(), 2);
        assert_eq!(tracker.checkpointed_value(), Some(&20));
        tracker.remove(3);
        assert_eq!(tracker.checkpointed_value(), Some(&30));
    }

    #[test]
    fn test_values_are_released() {
        let mut tracker = SequenceTracker::new();
        for i in 0..100 {
            let seq = tracker.add(i);
            tracker.remove(seq);
        }
        assert_eq!(tracker.checkpointed_value(), Some(&99));
        assert_eq!(tracker.values.len(), 1);
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change feed and revision transfer (pulled, pushed, failed)
//! - Attachment downloads
//! - Conflicts surfaced per direction
//! - Checkpoint persistence
//! - Batching and retry behaviour
//! - Replicator activity state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replication::metrics;
//! use std::time::Duration;
//!
//! // In the puller after a change-feed page arrives
//! metrics::record_changes_received("peer-1", 42);
//!
//! // After a remote call completes
//! metrics::record_remote_latency("peer-1", "bulk_get", Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Transfer
// ═══════════════════════════════════════════════════════════════════════════════

/// Record change-feed entries received from the remote.
pub fn record_changes_received(remote: &str, count: usize) {
    counter!("replication_changes_received_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record revisions inserted locally after a pull.
pub fn record_revisions_pulled(remote: &str, count: usize) {
    counter!("replication_revisions_pulled_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record revisions accepted by the remote.
pub fn record_revisions_pushed(remote: &str, count: usize) {
    counter!("replication_revisions_pushed_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record a revision that was skipped after an error.
pub fn record_revision_failed(remote: &str, direction: &str, reason: &str) {
    counter!(
        "replication_revisions_failed_total",
        "remote" => remote.to_string(),
        "direction" => direction.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a conflict detected while replicating.
pub fn record_conflict(remote: &str, direction: &str) {
    counter!(
        "replication_conflicts_total",
        "remote" => remote.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

/// Record an attachment download.
pub fn record_attachment_downloaded(remote: &str, bytes: u64) {
    counter!("replication_attachments_downloaded_total", "remote" => remote.to_string())
        .increment(1);
    counter!("replication_attachment_bytes_total", "remote" => remote.to_string())
        .increment(bytes);
}

/// Record remote call latency by operation type.
pub fn record_remote_latency(remote: &str, operation: &str, duration: Duration) {
    histogram!(
        "replication_remote_operation_duration_seconds",
        "remote" => remote.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record ancestor bodies purged after a push.
pub fn record_revisions_purged(count: usize) {
    counter!("replication_revisions_purged_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a checkpoint save.
pub fn record_checkpoint_save(direction: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_saves_total",
        "direction" => direction.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record the checkpointed sequence for a direction.
pub fn set_checkpoint_sequence(remote: &str, direction: &str, sequence: u64) {
    gauge!(
        "replication_checkpoint_sequence",
        "remote" => remote.to_string(),
        "direction" => direction.to_string()
    )
    .set(sequence as f64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batching and retries
// ═══════════════════════════════════════════════════════════════════════════════

/// Record the size of a batch handed to a processor.
pub fn record_batch_size(batcher: &str, size: usize) {
    histogram!("replication_batch_size", "batcher" => batcher.to_string()).record(size as f64);
    counter!("replication_batches_total", "batcher" => batcher.to_string()).increment(1);
}

/// Record a retried remote operation.
pub fn record_retry(operation: &str) {
    counter!("replication_retries_total", "operation" => operation.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════════════

/// Set replicator activity as a numeric gauge.
pub fn set_replicator_state(remote: &str, state: &str) {
    let value = match state {
        "stopped" => 0.0,
        "offline" => 1.0,
        "connecting" => 2.0,
        "idle" => 3.0,
        "busy" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_replicator_state", "remote" => remote.to_string()).set(value);
}

/// Record progress counters for a replicator.
pub fn set_progress(remote: &str, completed: u64, total: u64) {
    gauge!("replication_progress_completed", "remote" => remote.to_string())
        .set(completed as f64);
    gauge!("replication_progress_total", "remote" => remote.to_string()).set(total as f64);
}

/// Record an error by classification.
pub fn record_error(remote: &str, class: &str) {
    counter!(
        "replication_errors_total",
        "remote" => remote.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

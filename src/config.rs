// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replication.
//!
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! The executable filter is attached at runtime with
//! [`Replicator::with_filter`](crate::Replicator::with_filter); only its name
//! and parameters live here (they feed the checkpoint identity).
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replication::config::{ReplicatorConfig, ReplicationDirection};
//!
//! let config = ReplicatorConfig {
//!     direction: ReplicationDirection::Pull,
//!     continuous: true,
//!     ..ReplicatorConfig::new("https://db.example.com/notes")
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── remote_id: String            # Remote database identity
//! ├── direction: push | pull | push_and_pull
//! ├── continuous: bool             # Keep running after catching up
//! ├── create_target: bool          # Push creates the remote database
//! ├── doc_ids / filter_name / filter_params
//! └── settings: ReplicationSettings
//!     ├── batch: BatcherConfig     # Insertion/upload batching
//!     ├── fetch: FetchConfig       # Concurrency, page sizes, polling
//!     ├── checkpoint: CheckpointConfig
//!     ├── retry: default | continuous | testing
//!     └── purge_pushed: bool
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote_id: "https://db.example.com/notes"
//! direction: pull
//! continuous: true
//! settings:
//!   fetch:
//!     max_connections: 4
//!     poll_interval: "2s"
//!   checkpoint:
//!     save_interval_ms: 5000
//!   retry: continuous
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryPreset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Which way documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDirection {
    Push,
    Pull,
    #[default]
    PushAndPull,
}

impl ReplicationDirection {
    pub fn pulls(self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }

    pub fn pushes(self) -> bool {
        matches!(self, Self::Push | Self::PushAndPull)
    }
}

impl std::fmt::Display for ReplicationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
            Self::PushAndPull => write!(f, "push_and_pull"),
        }
    }
}

/// Everything that defines one replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Identity of the remote database (URL or peer ID).
    pub remote_id: String,

    #[serde(default)]
    pub direction: ReplicationDirection,

    /// Keep running and follow new changes after catching up.
    #[serde(default)]
    pub continuous: bool,

    /// Create the remote database before pushing if it does not exist.
    #[serde(default)]
    pub create_target: bool,

    /// Only replicate these documents.
    #[serde(default)]
    pub doc_ids: Option<Vec<String>>,

    /// Name of the filter attached at runtime.
    #[serde(default)]
    pub filter_name: Option<String>,

    /// Parameters handed to the filter.
    #[serde(default)]
    pub filter_params: BTreeMap<String, Value>,

    #[serde(default)]
    pub settings: ReplicationSettings,
}

impl ReplicatorConfig {
    /// One-shot push-and-pull with default settings.
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            direction: ReplicationDirection::default(),
            continuous: false,
            create_target: false,
            doc_ids: None,
            filter_name: None,
            filter_params: BTreeMap::new(),
            settings: ReplicationSettings::default(),
        }
    }

    /// Create a fast-cycling config for tests.
    pub fn for_testing(remote_id: &str, direction: ReplicationDirection) -> Self {
        Self {
            direction,
            settings: ReplicationSettings::for_testing(),
            ..Self::new(remote_id)
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.remote_id.trim().is_empty() {
            return Err(ReplicationError::Config("remote_id must not be empty".into()));
        }
        if self.settings.batch.capacity == 0 {
            return Err(ReplicationError::Config("batch.capacity must be positive".into()));
        }
        if self.settings.fetch.max_connections == 0 {
            return Err(ReplicationError::Config(
                "fetch.max_connections must be positive".into(),
            ));
        }
        if self.settings.fetch.changes_limit == 0 {
            return Err(ReplicationError::Config("fetch.changes_limit must be positive".into()));
        }
        if self.doc_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Err(ReplicationError::Config("doc_ids must not be empty when set".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub batch: BatcherConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryPreset,
    /// Strip bodies of ancestors once a descendant has been pushed.
    #[serde(default = "default_false")]
    pub purge_pushed: bool,
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            batch: BatcherConfig::testing(),
            fetch: FetchConfig::testing(),
            checkpoint: CheckpointConfig::testing(),
            retry: RetryPreset::Testing,
            purge_pushed: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatcherConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Batching of downloaded revisions (insertion) and uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Items that force an immediate flush.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Delay from the first queued item to the scheduled flush.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_capacity() -> usize {
    100
}

fn default_delay_ms() -> u64 {
    250
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            delay_ms: 250,
        }
    }
}

impl BatcherConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            capacity: 10,
            delay_ms: 5,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FetchConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Change-feed paging and download concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum concurrent requests to the remote.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Revisions per bulk-get request.
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,

    /// Entries per change-feed page (and local changes per push page).
    #[serde(default = "default_changes_limit")]
    pub changes_limit: usize,

    /// Known local ancestors sent with a fetch so attachments can come as stubs.
    #[serde(default = "default_atts_since_limit")]
    pub atts_since_limit: usize,

    /// Wait between polls once caught up in continuous mode (e.g. "1s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────
    /// Throttle change-entry processing.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum entries per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_connections() -> usize {
    4
}

fn default_bulk_batch_size() -> usize {
    50
}

fn default_changes_limit() -> usize {
    100
}

fn default_atts_since_limit() -> usize {
    10
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_false() -> bool {
    false
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            bulk_batch_size: 50,
            changes_limit: 100,
            atts_since_limit: 10,
            poll_interval: "1s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl FetchConfig {
    pub fn testing() -> Self {
        Self {
            changes_limit: 10,
            bulk_batch_size: 5,
            poll_interval: "20ms".to_string(),
            ..Self::default()
        }
    }

    /// Parse `poll_interval`, falling back to one second.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst: self.rate_limit_burst,
            per_second: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Minimum time between checkpoint writes while the frontier advances.
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
}

fn default_save_interval_ms() -> u64 {
    5000
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 5000,
        }
    }
}

impl CheckpointConfig {
    pub fn testing() -> Self {
        Self {
            save_interval_ms: 20,
        }
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

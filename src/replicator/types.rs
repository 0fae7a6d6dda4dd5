// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator state types.
//!
//! Each direction runs its own state machine; the replicator reports the
//! aggregate.
//!
//! # State Transitions (per direction)
//!
//! ```text
//!            start()
//! Stopped ───────────→ Connecting ───→ Busy ⇄ Idle (continuous)
//!    ↑                     │            │
//!    │                     │ transient  │ caught up (one-shot)
//!    │                     ↓ failure    ↓
//!    │                  Offline ──→ Connecting (after retry interval
//!    │                                          or go_online())
//!    └──────────── stop() / fatal error / one-shot complete
//! ```
//!
//! # Aggregation
//!
//! The replicator's activity is the highest-precedence activity among its
//! directions: Busy > Connecting > Offline > Idle > Stopped. Progress counts
//! are summed.

use crate::error::{ErrorClass, ReplicationError};
use crate::revision::RevisionId;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Activity of a replicator or one of its directions.
///
/// Variants are declared in aggregation precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityLevel {
    /// Not running.
    Stopped,
    /// Caught up and waiting for changes (continuous only).
    Idle,
    /// The remote is unreachable; waiting to retry.
    Offline,
    /// Loading the checkpoint and opening the change feed.
    Connecting,
    /// Transferring revisions.
    Busy,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Busy => "busy",
        }
    }
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One direction of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Pull,
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revisions completed out of revisions discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

/// Error summary kept in the status (errors themselves are not `Clone`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&ReplicationError> for ErrorInfo {
    fn from(e: &ReplicationError) -> Self {
        Self {
            class: e.classify(),
            message: e.to_string(),
        }
    }
}

/// Snapshot of a replicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    pub activity: ActivityLevel,
    pub progress: Progress,
    /// Most recent error, cleared on the next successful start.
    pub error: Option<ErrorInfo>,
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        Self {
            activity: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// Outcome of replicating one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReplication {
    pub direction: Direction,
    pub doc_id: String,
    pub rev_id: RevisionId,
    /// `None` on success.
    pub error: Option<ErrorInfo>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status hub
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct DirectionState {
    enabled: bool,
    activity: Option<ActivityLevel>,
    progress: Progress,
}

#[derive(Debug, Default)]
struct HubState {
    pull: DirectionState,
    push: DirectionState,
    error: Option<ErrorInfo>,
}

impl HubState {
    fn direction(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Pull => &mut self.pull,
            Direction::Push => &mut self.push,
        }
    }

    fn aggregate(&self) -> ReplicatorStatus {
        let directions = [&self.pull, &self.push];
        let activity = directions
            .iter()
            .filter(|d| d.enabled)
            .filter_map(|d| d.activity)
            .max()
            .unwrap_or(ActivityLevel::Stopped);
        let progress = directions.iter().fold(Progress::default(), |acc, d| Progress {
            completed: acc.completed + d.progress.completed,
            total: acc.total + d.progress.total,
        });
        ReplicatorStatus {
            activity,
            progress,
            error: self.error.clone(),
        }
    }
}

/// Collects per-direction state and publishes the aggregate.
pub(crate) struct StatusHub {
    remote: String,
    state: Mutex<HubState>,
    status_tx: watch::Sender<ReplicatorStatus>,
    events_tx: broadcast::Sender<DocumentReplication>,
}

impl StatusHub {
    pub(crate) fn new(remote: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(ReplicatorStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            remote: remote.into(),
            state: Mutex::new(HubState::default()),
            status_tx,
            events_tx,
        }
    }

    pub(crate) fn status(&self) -> ReplicatorStatus {
        self.status_tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<DocumentReplication> {
        self.events_tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut HubState)) {
        let status = {
            let mut state = self.state.lock();
            f(&mut state);
            state.aggregate()
        };
        let activity = status.activity;
        let progress = status.progress;
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            crate::metrics::set_replicator_state(&self.remote, activity.as_str());
            crate::metrics::set_progress(&self.remote, progress.completed, progress.total);
        }
    }

    /// Begin a run: mark the given directions as connecting and clear the
    /// previous error.
    pub(crate) fn begin(&self, pull: bool, push: bool) {
        self.update(|state| {
            state.error = None;
            for (direction, enabled) in [(Direction::Pull, pull), (Direction::Push, push)] {
                let d = state.direction(direction);
                d.enabled = enabled;
                d.activity = enabled.then_some(ActivityLevel::Connecting);
            }
        });
    }

    pub(crate) fn set_activity(&self, direction: Direction, activity: ActivityLevel) {
        self.update(|state| state.direction(direction).activity = Some(activity));
    }

    pub(crate) fn add_total(&self, direction: Direction, n: u64) {
        if n > 0 {
            self.update(|state| state.direction(direction).progress.total += n);
        }
    }

    pub(crate) fn add_completed(&self, direction: Direction, n: u64) {
        if n > 0 {
            self.update(|state| state.direction(direction).progress.completed += n);
        }
    }

    pub(crate) fn record_error(&self, error: &ReplicationError) {
        let info = ErrorInfo::from(error);
        crate::metrics::record_error(&self.remote, &info.class.to_string());
        self.update(|state| state.error = Some(info));
    }

    pub(crate) fn document(&self, event: DocumentReplication) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Stop every direction.
    pub(crate) fn stop_all(&self) {
        self.update(|state| {
            state.pull.activity = state.pull.enabled.then_some(ActivityLevel::Stopped);
            state.push.activity = state.push.enabled.then_some(ActivityLevel::Stopped);
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control signals
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a direction's work was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Shutdown,
    Offline,
}

/// Stop and reachability signals observed by one direction.
#[derive(Clone)]
pub(crate) struct Signals {
    shutdown: watch::Receiver<bool>,
    online: watch::Receiver<bool>,
}

impl Signals {
    pub(crate) fn new(shutdown: watch::Receiver<bool>, online: watch::Receiver<bool>) -> Self {
        Self { shutdown, online }
    }

    fn check(&mut self) -> Option<Interrupt> {
        if *self.shutdown.borrow_and_update() {
            return Some(Interrupt::Shutdown);
        }
        if !*self.online.borrow_and_update() {
            return Some(Interrupt::Offline);
        }
        None
    }

    pub(crate) fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Resolves once the direction must stop or the remote became unreachable.
    pub(crate) async fn interrupted(&mut self) -> Interrupt {
        loop {
            if let Some(interrupt) = self.check() {
                return interrupt;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Interrupt::Shutdown;
                    }
                }
                changed = self.online.changed() => {
                    if changed.is_err() {
                        return Interrupt::Shutdown;
                    }
                }
            }
        }
    }

    /// Run `fut` unless interrupted first.
    pub(crate) async fn guard<F: std::future::Future>(
        &mut self,
        fut: F,
    ) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            output = fut => Ok(output),
        }
    }

    /// Sleep unless interrupted first.
    pub(crate) async fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.guard(tokio::time::sleep(duration)).await
    }

    /// Wait for the remote to become reachable again. Fails only on shutdown.
    pub(crate) async fn wait_online(&mut self) -> Result<(), Interrupt> {
        loop {
            if *self.shutdown.borrow_and_update() {
                return Err(Interrupt::Shutdown);
            }
            if *self.online.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Err(Interrupt::Shutdown);
                    }
                }
                changed = self.online.changed() => {
                    if changed.is_err() {
                        return Err(Interrupt::Shutdown);
                    }
                }
            }
        }
    }
}

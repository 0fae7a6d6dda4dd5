// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure handling around the remote: backoff retries, a change throttle and
//! a cap on concurrent connections.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), doc_replication::resilience::BulkheadFull> {
//! use doc_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let throttle = RateLimiter::new(RateLimitConfig::default());
//! throttle.acquire().await;
//!
//! let pool = Bulkhead::for_connections(4);
//! let _connection = pool.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Retry behavior for requests to the remote.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per operation before the error is surfaced and the
    /// direction goes offline.
    pub max_attempts: usize,
    pub first_backoff: Duration,
    pub backoff_cap: Duration,
    pub backoff_multiplier: f64,
    /// Bound on each request. Expiry counts as transient.
    pub request_timeout: Duration,
    /// How long an offline direction waits before starting a new session.
    pub offline_retry_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            first_backoff: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            request_timeout: Duration::from_secs(60),
            offline_retry_interval: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Patient retry for continuous replications: 1s, 2s, 4s ... capped at
    /// five minutes, ten attempts, then offline with a fresh session every
    /// minute.
    pub fn continuous() -> Self {
        Self {
            max_attempts: 10,
            first_backoff: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            request_timeout: Duration::from_secs(60),
            offline_retry_interval: Duration::from_secs(60),
        }
    }

    /// Short timings so tests see retries and offline transitions quickly.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            first_backoff: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            request_timeout: Duration::from_millis(500),
            offline_retry_interval: Duration::from_millis(50),
        }
    }

    /// Backoff after failed attempt `attempt`, counting from one.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.first_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.backoff_cap.as_secs_f64() {
            return self.backoff_cap;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Named retry preset, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    #[default]
    Default,
    Continuous,
    Testing,
}

impl RetryPreset {
    pub fn to_config(self) -> RetryConfig {
        match self {
            Self::Default => RetryConfig::default(),
            Self::Continuous => RetryConfig::continuous(),
            Self::Testing => RetryConfig::testing(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or runs out
/// of attempts. Each attempt is bounded by the request timeout.
///
/// Cancel-safe: dropping the future abandons the current attempt.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::Timeout {
                operation: operation.to_string(),
                millis: config.request_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                crate::metrics::record_retry(operation);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Change-processing throttle: `per_second` sustained, `burst` at once.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 100,
            per_second: 1000,
        }
    }
}

type DirectLimiter = GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Gates how fast the puller hands changes to its fetch workers.
pub struct RateLimiter {
    inner: DirectLimiter,
    settings: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("settings", &self.settings).finish()
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(settings.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(settings.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: GovLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            settings,
        }
    }

    /// Wait for the next slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

/// The connection pool was closed while waiting for a slot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection pool closed ({limit} connections)")]
pub struct BulkheadFull {
    pub limit: usize,
}

/// Caps how many requests one replication has in flight against its remote.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    /// A zero limit is raised to one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn for_connections(max_connections: usize) -> Self {
        Self::new(max_connections)
    }

    /// Wait for a free connection. The slot is returned when the permit drops.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull { limit: self.limit })
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

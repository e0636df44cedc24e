//! Named retry policies.
//!
//! - [`ConflictRetry`]: bounded in-process attempts of a read-modify-write
//!   that lost an optimistic concurrency race.
//! - [`RequeueBackoff`]: delay before the controller runtime retries a failed
//!   reconciliation, growing with consecutive failures of the same object.
//!   The same shape paces reconnects of the cache event listener.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::controller::error::{Error, Result};

/// Retry a closure while it fails with a conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictRetry {
    pub max_attempts: u32,
}

/// Policy for listener updates of existing Cache resources.
pub const LISTENER_UPDATE_RETRY: ConflictRetry = ConflictRetry { max_attempts: 5 };

impl ConflictRetry {
    /// Run `attempt` until it succeeds, fails with a non-conflict error, or
    /// the attempts are exhausted. The closure receives the 1-based attempt
    /// number and must re-read state on every call.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() && n < self.max_attempts => {
                    debug!(operation = %operation, attempt = n, error = %e, "Conflict, retrying");
                    n += 1;
                }
                Err(e) if e.is_conflict() => {
                    return Err(Error::Permanent(format!(
                        "{operation}: still conflicting after {} attempts: {e}",
                        self.max_attempts
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential requeue delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequeueBackoff {
    pub base: Duration,
    pub max: Duration,
}

/// Policy for transient reconciliation failures.
pub const RECONCILE_BACKOFF: RequeueBackoff = RequeueBackoff {
    base: Duration::from_secs(5),
    max: Duration::from_secs(300),
};

/// Policy for reopening a dropped server event stream.
pub const LISTENER_RECONNECT_BACKOFF: RequeueBackoff = RequeueBackoff {
    base: Duration::from_secs(1),
    max: Duration::from_secs(60),
};

impl RequeueBackoff {
    /// Delay after `consecutive_failures` failures (1 for the first).
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Consecutive failure counts per object key.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the new consecutive count.
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget failures after a successful reconciliation.
    pub fn reset(&self, key: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        counts.remove(key);
    }
}

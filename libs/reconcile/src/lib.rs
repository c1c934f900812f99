//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconciliation loops that converge stored state toward a desired spec.
//! Key concepts:
//!
//! - **Trigger**: Anything that asks for a key to be reconciled (a change
//!   notification, a resync tick, a requeue).
//! - **Result**: Whether and when the same key should be looked at again.
//! - **Serialization**: At most one reconcile in flight per key.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Errors never abort the loop; they become requeues

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification of the stored record).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A pluggable policy hook failed.
    #[error("policy error: {0}")]
    Policy(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Returns true if the error is a write race that should be retried
    /// immediately, without backoff.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if the resource is gone and the key can be forgotten.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if retrying with backoff can make progress.
    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }
}

/// Outcome of a successful reconcile as seen by the trigger layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    /// Re-check the key after this delay even if nothing changes.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing further to do until the next change.
    #[must_use]
    pub const fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Re-check after the given delay.
    #[must_use]
    pub const fn after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Combine two results, keeping the earliest requeue.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Self::after(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Self::after(a),
            (None, None) => Self::done(),
        }
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a spec's content has actually changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Compute a spec hash from any serializable value.
    pub fn of<T: serde::Serialize>(value: &T) -> Result<Self, ReconcileError> {
        let json = serde_json::to_value(value)
            .map_err(|e| ReconcileError::Internal(format!("spec is not serializable: {e}")))?;
        Ok(Self::from_json(&json))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<_, _> = map.iter().collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Retry tracker for failed reconciles.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    /// Maximum retries per key before the key is reported as exhausted.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: HashMap<K, (u32, Instant)>,
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns the number of consecutive failures inside the current window,
    /// starting at 1.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Number of failures currently recorded for a key.
    pub fn attempts(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Check if retries are exhausted for a key.
    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Per-key async locks.
///
/// Guarantees that at most one holder exists per key while letting
/// different keys proceed in parallel.
#[derive(Debug)]
pub struct KeyLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to a key.
    pub async fn lock(&self, key: &K) -> tokio::sync::OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Take exclusive access to a key if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop table entries that nobody holds or waits on.
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default interval for re-listing every key.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before re-checking a request that waits on advisors.
pub const DEFAULT_ADVISOR_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay before retrying a request whose candidates were degraded.
pub const DEFAULT_GENERATION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default retry limit per key before failures are escalated in logs.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

//! Reconciliation loop primitives.
//!
//! This library provides the pieces shared by the controller and its
//! scheduler driver:
//!
//! - **Directive**: what a reconciliation attempt tells its scheduler to do
//!   next (done, retry later, give up).
//! - **Spec hash**: a deterministic digest of a spec, used to tell whether
//!   the copy already on a member is up to date.
//! - **Retry tracking**: per-resource exponential backoff for retryable
//!   failures.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from reconciliation helpers.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A value could not be serialized for hashing.
    #[error("failed to serialize spec: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one reconciliation attempt, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// The attempt completed. The next attempt runs on the regular resync.
    Success,

    /// The attempt failed in a retryable way (conflict, store unavailable).
    RetryAfter(Duration),

    /// The attempt cannot succeed until the object changes.
    TerminalFailure(String),
}

impl Directive {
    /// Returns true if the scheduler should re-run the attempt early.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryAfter(_))
    }

    /// Returns true if the attempt should not be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TerminalFailure(_))
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetryAfter(after) => write!(f, "retry after {after:?}"),
            Self::TerminalFailure(reason) => write!(f, "terminal failure: {reason}"),
        }
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when the classifier copy on a member is out of date.
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

    /// Compute the hash of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, ReconcileError> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
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

impl From<SpecHash> for String {
    fn from(hash: SpecHash) -> Self {
        hash.0
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // Serializing a plain string cannot fail.
    serde_json::to_string(s).unwrap_or_default()
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            max: DEFAULT_RETRY_MAX,
        }
    }
}

impl Backoff {
    /// Delay before the `failures`-th retry (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Retry tracker for failed attempts, keyed by resource name.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    backoff: Backoff,

    /// Consecutive failures per resource.
    failures: BTreeMap<String, u32>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns the delay to wait before the next attempt. `hint` is the delay
    /// the attempt itself asked for; the longer of the two wins.
    pub fn record_failure(&mut self, resource_key: &str, hint: Option<Duration>) -> Duration {
        let count = self.failures.entry(resource_key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let delay = self.backoff.delay(*count);
        hint.map_or(delay, |h| h.max(delay))
    }

    /// Consecutive failures recorded for a resource.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Drop tracking for resources not in `live`.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, live: F) {
        self.failures.retain(|k, _| live(k));
    }
}

/// Default interval between full resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for one remote operation against one member.
pub const DEFAULT_MEMBER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a whole reconciliation attempt.
pub const DEFAULT_ATTEMPT_DEADLINE: Duration = Duration::from_secs(60);

/// Default number of conditional writes tried per commit.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 4;

/// Delay requested after a commit conflict or store failure.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// First backoff step.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "q\"uote"}});
        let json2 = serde_json::json!({"a": {"x": "q\"uote", "y": [1, 2]}, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let a = SpecHash::from_json(&serde_json::json!({"selector": "env=prod"}));
        let b = SpecHash::from_json(&serde_json::json!({"selector": "env=dev"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_spec_hash_of_serializable() {
        #[derive(Serialize)]
        struct Spec {
            rules: Vec<&'static str>,
        }
        let hash = SpecHash::of(&Spec { rules: vec!["a"] }).unwrap();
        assert_eq!(hash, SpecHash::from_json(&serde_json::json!({"rules": ["a"]})));
    }

    #[rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(2, Duration::from_secs(2))]
    #[case(4, Duration::from_secs(8))]
    #[case(20, DEFAULT_RETRY_MAX)]
    fn test_backoff_delay(#[case] failures: u32, #[case] expected: Duration) {
        assert_eq!(Backoff::default().delay(failures), expected);
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::default();

        assert_eq!(tracker.record_failure("prod", None), Duration::from_secs(1));
        assert_eq!(tracker.record_failure("prod", None), Duration::from_secs(2));
        assert_eq!(
            tracker.record_failure("prod", Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(tracker.failures("prod"), 3);
        assert_eq!(tracker.failures("dev"), 0);

        tracker.clear("prod");
        assert_eq!(tracker.failures("prod"), 0);
    }

    #[test]
    fn test_retry_tracker_retain() {
        let mut tracker = RetryTracker::default();
        tracker.record_failure("a", None);
        tracker.record_failure("b", None);
        tracker.retain(|k| k == "a");
        assert_eq!(tracker.failures("a"), 1);
        assert_eq!(tracker.failures("b"), 0);
    }

    #[test]
    fn test_directive_helpers() {
        assert!(Directive::RetryAfter(Duration::from_secs(1)).is_retry());
        assert!(Directive::TerminalFailure("bad selector".into()).is_terminal());
        assert!(!Directive::Success.is_retry());
        assert_eq!(Directive::Success.to_string(), "success");
    }
}

//! Expectation tracking for the pool controller.
//!
//! After the controller creates or deletes a pod, the next reconcile may fire
//! before the watch cache reflects the change. Expectations record the
//! outstanding own-events per pool key; a controller must refuse to scale
//! while its expectations are unsatisfied, otherwise it double-actuates.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Expectations older than this are stale: the event was likely lost, the
/// record is cleared, and the controller requeues.
pub const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct ScaleRecord {
    creates: HashSet<String>,
    deletes: HashSet<String>,
    since: Option<Instant>,
}

impl ScaleRecord {
    fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Outcome of a satisfaction check, including what is still outstanding.
#[derive(Debug, Clone, Default)]
pub struct ScaleExpectationDetail {
    pub satisfied: bool,
    /// How long the oldest outstanding expectation has gone unobserved.
    pub unsatisfied_for: Duration,
    /// Pod names expected to appear but not yet observed.
    pub pending_creates: Vec<String>,
    /// Pod names expected to disappear but not yet observed.
    pub pending_deletes: Vec<String>,
}

/// Tracks pod create/delete events each pool still expects to observe.
#[derive(Debug, Default)]
pub struct ScaleExpectations {
    records: Mutex<HashMap<String, ScaleRecord>>,
}

impl ScaleExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record pod names the controller is about to create for `key`.
    pub fn expect_creations<I>(&self, key: &str, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(key.to_string()).or_default();
        record.creates.extend(names);
        record.since.get_or_insert_with(Instant::now);
    }

    /// Record pod names the controller is about to delete for `key`.
    pub fn expect_deletions<I>(&self, key: &str, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(key.to_string()).or_default();
        record.deletes.extend(names);
        record.since.get_or_insert_with(Instant::now);
    }

    /// Observe a created pod back through the cache.
    pub fn observe_creation(&self, key: &str, name: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(key) {
            record.creates.remove(name);
            if record.is_empty() {
                records.remove(key);
            }
        }
    }

    /// Observe a deleted pod back through the cache.
    pub fn observe_deletion(&self, key: &str, name: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(key) {
            record.deletes.remove(name);
            if record.is_empty() {
                records.remove(key);
            }
        }
    }

    /// Whether all expectations for `key` have been observed.
    pub fn satisfied(&self, key: &str) -> bool {
        self.satisfied_detail(key).satisfied
    }

    /// Satisfaction plus the outstanding items and how long they have been
    /// pending. Stale records are forcibly cleared and report satisfied.
    pub fn satisfied_detail(&self, key: &str) -> ScaleExpectationDetail {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get(key) else {
            return ScaleExpectationDetail {
                satisfied: true,
                ..Default::default()
            };
        };
        if record.is_empty() {
            records.remove(key);
            return ScaleExpectationDetail {
                satisfied: true,
                ..Default::default()
            };
        }

        let unsatisfied_for = record.since.map(|s| s.elapsed()).unwrap_or_default();
        if unsatisfied_for >= EXPECTATION_TIMEOUT {
            warn!(
                key,
                ?unsatisfied_for,
                pending_creates = record.creates.len(),
                pending_deletes = record.deletes.len(),
                "clearing stale scale expectations"
            );
            records.remove(key);
            return ScaleExpectationDetail {
                satisfied: true,
                unsatisfied_for,
                ..Default::default()
            };
        }

        let mut pending_creates: Vec<String> = record.creates.iter().cloned().collect();
        let mut pending_deletes: Vec<String> = record.deletes.iter().cloned().collect();
        pending_creates.sort();
        pending_deletes.sort();
        ScaleExpectationDetail {
            satisfied: false,
            unsatisfied_for,
            pending_creates,
            pending_deletes,
        }
    }

    /// Drop all expectations for `key` (pool deleted).
    pub fn forget(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }
}

/// Tracks the pool resourceVersion the controller expects to observe back
/// after its own annotation writes. Writes are refused until the cached
/// object has caught up with the last write.
#[derive(Debug, Default)]
pub struct RevisionExpectations {
    expected: Mutex<HashMap<String, RevisionRecord>>,
}

#[derive(Debug)]
struct RevisionRecord {
    expected: String,
    observed: Option<String>,
    since: Instant,
}

impl RevisionExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the resourceVersion a successful write produced.
    pub fn expect(&self, key: &str, resource_version: String) {
        self.expected.lock().unwrap().insert(
            key.to_string(),
            RevisionRecord {
                expected: resource_version,
                observed: None,
                since: Instant::now(),
            },
        );
    }

    /// Record the resourceVersion the reconcile just observed for `key`.
    pub fn observe(&self, key: &str, resource_version: &str) {
        if let Some(record) = self.expected.lock().unwrap().get_mut(key) {
            record.observed = Some(resource_version.to_string());
        }
    }

    /// Whether the observed resourceVersion has caught up with the expected
    /// one. Stale records are cleared and report satisfied.
    pub fn satisfied(&self, key: &str) -> bool {
        let mut expected = self.expected.lock().unwrap();
        let Some(record) = expected.get(key) else {
            return true;
        };
        if record.since.elapsed() >= EXPECTATION_TIMEOUT {
            warn!(key, "clearing stale resource-version expectation");
            expected.remove(key);
            return true;
        }
        let Some(observed) = record.observed.as_deref() else {
            return false;
        };
        if at_or_past(observed, &record.expected) {
            expected.remove(key);
            true
        } else {
            false
        }
    }

    /// Drop the expectation for `key` (pool deleted).
    pub fn forget(&self, key: &str) {
        self.expected.lock().unwrap().remove(key);
    }
}

// resourceVersions are opaque but numeric on every mainstream apiserver;
// compare numerically when possible, by equality otherwise.
fn at_or_past(observed: &str, expected: &str) -> bool {
    match (observed.parse::<u64>(), expected.parse::<u64>()) {
        (Ok(o), Ok(e)) => o >= e,
        _ => observed == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_record_is_satisfied() {
        let exp = ScaleExpectations::new();
        assert!(exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_creations_block_until_observed() {
        let exp = ScaleExpectations::new();
        exp.expect_creations("ns/pool-a", ["pod-1".to_string(), "pod-2".to_string()]);
        assert!(!exp.satisfied("ns/pool-a"));

        exp.observe_creation("ns/pool-a", "pod-1");
        let detail = exp.satisfied_detail("ns/pool-a");
        assert!(!detail.satisfied);
        assert_eq!(detail.pending_creates, vec!["pod-2".to_string()]);
        assert!(detail.pending_deletes.is_empty());

        exp.observe_creation("ns/pool-a", "pod-2");
        assert!(exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_deletions_block_until_observed() {
        let exp = ScaleExpectations::new();
        exp.expect_deletions("ns/pool-a", ["pod-1".to_string()]);
        assert!(!exp.satisfied("ns/pool-a"));
        exp.observe_deletion("ns/pool-a", "pod-1");
        assert!(exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_keys_are_independent() {
        let exp = ScaleExpectations::new();
        exp.expect_creations("ns/pool-a", ["pod-1".to_string()]);
        assert!(exp.satisfied("ns/pool-b"));
        assert!(!exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_forget_clears_pending() {
        let exp = ScaleExpectations::new();
        exp.expect_deletions("ns/pool-a", ["pod-1".to_string()]);
        exp.forget("ns/pool-a");
        assert!(exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_unobserved_unrelated_names_are_ignored() {
        let exp = ScaleExpectations::new();
        exp.expect_creations("ns/pool-a", ["pod-1".to_string()]);
        exp.observe_creation("ns/pool-a", "pod-other");
        assert!(!exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_revision_expectation_flow() {
        let exp = RevisionExpectations::new();
        assert!(exp.satisfied("ns/pool-a"));

        exp.expect("ns/pool-a", "42".to_string());
        assert!(!exp.satisfied("ns/pool-a"));

        exp.observe("ns/pool-a", "41");
        assert!(!exp.satisfied("ns/pool-a"));

        exp.observe("ns/pool-a", "43");
        assert!(exp.satisfied("ns/pool-a"));
        // Satisfied expectations are dropped.
        assert!(exp.satisfied("ns/pool-a"));
    }

    #[test]
    fn test_revision_non_numeric_falls_back_to_equality() {
        let exp = RevisionExpectations::new();
        exp.expect("ns/pool-a", "abc".to_string());
        exp.observe("ns/pool-a", "abd");
        assert!(!exp.satisfied("ns/pool-a"));
        exp.observe("ns/pool-a", "abc");
        assert!(exp.satisfied("ns/pool-a"));
    }
}

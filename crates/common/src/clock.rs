//! Logical clocks: Lamport scalar clock and per-origin version vector.
//!
//! Every replicated write is stamped with a Lamport timestamp; nodes running
//! in vector mode additionally carry a version vector so concurrent writes
//! can be detected instead of silently ordered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Lamport clock
// ---------------------------------------------------------------------------

/// A monotonic per-node Lamport clock.
///
/// `tick` advances local time; `update` folds in a remote timestamp so local
/// time stays ahead of everything the node has observed.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a clock from a persisted value.
    pub fn starting_at(value: u64) -> Self {
        Self {
            counter: AtomicU64::new(value),
        }
    }

    /// Increment and return the new timestamp.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Observe a remote timestamp: self becomes `max(self, remote) + 1`.
    /// Returns the new local time.
    pub fn update(&self, remote: u64) -> u64 {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(remote) + 1;
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current time without advancing it.
    pub fn now(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Version vector
// ---------------------------------------------------------------------------

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    Equal,
    /// Self has seen strictly more than the other.
    Dominates,
    /// The other has seen strictly more than self.
    DominatedBy,
    /// Neither dominates: concurrent updates.
    Concurrent,
}

/// A version vector: origin node id (hex) → monotonic counter.
///
/// Doubles as the `last_seen` vector replicas exchange during
/// `FetchUpdates`: each entry is the highest per-origin sequence applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: HashMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: HashMap<String, u64>) -> Self {
        Self { entries }
    }

    /// Counter for an origin (0 if absent).
    pub fn get(&self, origin: &str) -> u64 {
        self.entries.get(origin).copied().unwrap_or(0)
    }

    /// Return a copy with `origin` incremented.
    pub fn increment(&self, origin: &str) -> Self {
        let mut next = self.clone();
        *next.entries.entry(origin.to_string()).or_insert(0) += 1;
        next
    }

    /// Raise `origin` to at least `seq`. `last_seen[origin]` is
    /// non-decreasing; a lower value is ignored.
    pub fn observe(&mut self, origin: &str, seq: u64) {
        let entry = self.entries.entry(origin.to_string()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Element-wise max merge.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.entries.clone();
        for (k, &v) in &other.entries {
            let entry = merged.entry(k.clone()).or_insert(0);
            *entry = (*entry).max(v);
        }
        Self { entries: merged }
    }

    /// Partial-order comparison.
    pub fn compare(&self, other: &Self) -> ClockOrder {
        let mut self_gte = true;
        let mut other_gte = true;

        for (k, &sv) in &self.entries {
            let ov = other.get(k);
            if sv < ov {
                self_gte = false;
            }
            if ov < sv {
                other_gte = false;
            }
        }
        for (k, &ov) in &other.entries {
            if !self.entries.contains_key(k) && ov > 0 {
                self_gte = false;
            }
        }

        match (self_gte, other_gte) {
            (true, true) => ClockOrder::Equal,
            (true, false) => ClockOrder::Dominates,
            (false, true) => ClockOrder::DominatedBy,
            (false, false) => ClockOrder::Concurrent,
        }
    }

    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrder::Dominates
    }

    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrder::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &HashMap<String, u64> {
        &self.entries
    }

    pub fn into_map(self) -> HashMap<String, u64> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(entries: &[(&str, u64)]) -> VersionVector {
        VersionVector::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[test]
    fn test_lamport_tick_monotonic() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(clock.now(), b);
    }

    #[test]
    fn test_lamport_update_jumps_ahead() {
        let clock = LamportClock::new();
        clock.tick(); // 1
        let t = clock.update(100);
        assert_eq!(t, 101);
        assert!(clock.tick() > 101);
    }

    #[test]
    fn test_lamport_update_with_stale_remote() {
        let clock = LamportClock::starting_at(50);
        let t = clock.update(3);
        assert_eq!(t, 51, "stale remote still advances local time by one");
    }

    #[test]
    fn test_vector_increment() {
        let v = VersionVector::new();
        let v1 = v.increment("a");
        assert_eq!(v1.get("a"), 1);
        let v2 = v1.increment("a").increment("b");
        assert_eq!(v2.get("a"), 2);
        assert_eq!(v2.get("b"), 1);
    }

    #[test]
    fn test_vector_observe_is_monotonic() {
        let mut v = VersionVector::new();
        v.observe("a", 5);
        v.observe("a", 3); // ignored
        assert_eq!(v.get("a"), 5);
        v.observe("a", 9);
        assert_eq!(v.get("a"), 9);
    }

    #[test]
    fn test_vector_merge() {
        let a = vv(&[("n1", 3), ("n2", 1)]);
        let b = vv(&[("n1", 1), ("n2", 5), ("n3", 2)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get("n1"), 3);
        assert_eq!(merged.get("n2"), 5);
        assert_eq!(merged.get("n3"), 2);
    }

    #[test]
    fn test_vector_compare_all_orders() {
        assert_eq!(
            vv(&[("n1", 1)]).compare(&vv(&[("n1", 1)])),
            ClockOrder::Equal
        );
        assert_eq!(
            vv(&[("n1", 2)]).compare(&vv(&[("n1", 1)])),
            ClockOrder::Dominates
        );
        assert_eq!(
            vv(&[("n1", 1)]).compare(&vv(&[("n1", 2)])),
            ClockOrder::DominatedBy
        );
        assert_eq!(
            vv(&[("n1", 2), ("n2", 1)]).compare(&vv(&[("n1", 1), ("n2", 2)])),
            ClockOrder::Concurrent
        );
    }

    #[test]
    fn test_vector_compare_missing_keys() {
        assert!(vv(&[("n1", 1)]).is_concurrent(&vv(&[("n2", 1)])));
        assert!(vv(&[("n1", 1), ("n2", 1)]).dominates(&vv(&[("n1", 1)])));
    }

    #[test]
    fn test_merge_is_idempotent_and_commutative() {
        let a = vv(&[("n1", 4), ("n2", 2)]);
        let b = vv(&[("n2", 7)]);
        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&a), a);
    }
}

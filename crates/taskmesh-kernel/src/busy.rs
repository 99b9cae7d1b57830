//! Busy-worker membership set.
//!
//! Tracks which workers currently hold a dispatched subtask.  The
//! at-most-one-inflight rule makes false negatives unacceptable, so the
//! authoritative store is an exact hash set; a small cuckoo filter sits
//! in front of it as a cheap negative fast path.  A filter insert that
//! fails (table saturated) flips the set into degraded mode, after
//! which only the exact set is consulted.
//!
//! All operations are idempotent: inserting a present ID or removing an
//! absent one is a no-op.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Cuckoo filter
// ---------------------------------------------------------------------------

const BUCKET_SLOTS: usize = 4;
const BUCKET_COUNT: usize = 1024; // power of two covering ~1000 workers
const MAX_KICKS: usize = 500;

fn hash_of(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// One-byte-fingerprint cuckoo filter with 4-slot buckets.
#[derive(Debug)]
struct CuckooFilter {
    buckets: Vec<[u8; BUCKET_SLOTS]>,
    /// Deterministic state driving eviction choices.
    kick_state: u64,
}

impl CuckooFilter {
    fn new() -> Self {
        Self {
            buckets: vec![[0u8; BUCKET_SLOTS]; BUCKET_COUNT],
            kick_state: 0x6b75_636b,
        }
    }

    /// Fingerprints are 1..=255; zero marks an empty slot.
    fn fingerprint(item: &str) -> u8 {
        let fp = (hash_of(&item) >> 32) as u8;
        if fp == 0 { 1 } else { fp }
    }

    fn index(item: &str) -> usize {
        hash_of(&item) as usize % BUCKET_COUNT
    }

    fn alt_index(index: usize, fingerprint: u8) -> usize {
        (index ^ hash_of(&fingerprint) as usize) % BUCKET_COUNT
    }

    fn slot(&mut self, index: usize) -> &mut [u8; BUCKET_SLOTS] {
        &mut self.buckets[index]
    }

    fn try_place(&mut self, index: usize, fingerprint: u8) -> bool {
        let bucket = self.slot(index);
        for slot in bucket.iter_mut() {
            if *slot == 0 {
                *slot = fingerprint;
                return true;
            }
        }
        false
    }

    /// Insert; returns false when the table is saturated.
    fn insert(&mut self, item: &str) -> bool {
        let mut fingerprint = Self::fingerprint(item);
        let i1 = Self::index(item);
        let i2 = Self::alt_index(i1, fingerprint);
        if self.try_place(i1, fingerprint) || self.try_place(i2, fingerprint) {
            return true;
        }

        let mut index = i1;
        for _ in 0..MAX_KICKS {
            self.kick_state = self
                .kick_state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let victim = (self.kick_state >> 59) as usize % BUCKET_SLOTS;
            let bucket = self.slot(index);
            std::mem::swap(&mut bucket[victim], &mut fingerprint);
            index = Self::alt_index(index, fingerprint);
            if self.try_place(index, fingerprint) {
                return true;
            }
        }
        false
    }

    fn contains(&self, item: &str) -> bool {
        let fingerprint = Self::fingerprint(item);
        let i1 = Self::index(item);
        let i2 = Self::alt_index(i1, fingerprint);
        self.buckets[i1].contains(&fingerprint) || self.buckets[i2].contains(&fingerprint)
    }

    fn remove(&mut self, item: &str) {
        let fingerprint = Self::fingerprint(item);
        let i1 = Self::index(item);
        let i2 = Self::alt_index(i1, fingerprint);
        for index in [i1, i2] {
            let bucket = self.slot(index);
            if let Some(slot) = bucket.iter_mut().find(|s| **s == fingerprint) {
                *slot = 0;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BusySet
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BusyInner {
    exact: HashSet<String>,
    filter: CuckooFilter,
    degraded: bool,
}

/// Exact busy-worker set with an approximate negative fast path.
#[derive(Debug)]
pub struct BusySet {
    inner: Mutex<BusyInner>,
}

impl BusySet {
    /// Create an empty busy set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusyInner {
                exact: HashSet::new(),
                filter: CuckooFilter::new(),
                degraded: false,
            }),
        }
    }

    /// Mark a worker busy.  Idempotent.
    pub fn insert(&self, worker_id: &str) {
        let mut inner = self.inner.lock().expect("busy set lock poisoned");
        if inner.exact.insert(worker_id.to_string()) && !inner.filter.insert(worker_id) {
            tracing::warn!(worker_id, "busy filter saturated, falling back to exact set");
            inner.degraded = true;
        }
    }

    /// Clear a worker's busy mark.  Idempotent.
    pub fn remove(&self, worker_id: &str) {
        let mut inner = self.inner.lock().expect("busy set lock poisoned");
        if inner.exact.remove(worker_id) {
            inner.filter.remove(worker_id);
        }
    }

    /// Whether the worker currently holds a dispatched subtask.
    pub fn contains(&self, worker_id: &str) -> bool {
        let inner = self.inner.lock().expect("busy set lock poisoned");
        if !inner.degraded && !inner.filter.contains(worker_id) {
            return false;
        }
        inner.exact.contains(worker_id)
    }

    /// Number of busy workers.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("busy set lock poisoned").exact.len()
    }

    /// Whether no worker is busy.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BusySet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_contains_remove() {
        let busy = BusySet::new();
        assert!(!busy.contains("w1"));

        busy.insert("w1");
        assert!(busy.contains("w1"));
        assert_eq!(busy.len(), 1);

        busy.remove("w1");
        assert!(!busy.contains("w1"));
        assert!(busy.is_empty());
    }

    #[test]
    fn insert_is_idempotent() {
        let busy = BusySet::new();
        busy.insert("w1");
        busy.insert("w1");
        busy.insert("w1");
        assert_eq!(busy.len(), 1);

        busy.remove("w1");
        assert!(!busy.contains("w1"));
    }

    #[test]
    fn remove_is_idempotent() {
        let busy = BusySet::new();
        busy.remove("ghost");
        busy.insert("w1");
        busy.remove("w1");
        busy.remove("w1");
        assert!(!busy.contains("w1"));
    }

    #[test]
    fn many_workers_no_false_negatives() {
        let busy = BusySet::new();
        let ids: Vec<String> = (0..800).map(|i| format!("worker-{i}")).collect();
        for id in &ids {
            busy.insert(id);
        }
        // No false negatives: every inserted worker must read busy.
        for id in &ids {
            assert!(busy.contains(id), "{id} lost");
        }
        for id in &ids {
            busy.remove(id);
        }
        for id in &ids {
            assert!(!busy.contains(id), "{id} stuck busy");
        }
    }

    proptest! {
        /// For any interleaving of inserts and removes, membership
        /// matches a reference set exactly -- a worker is busy iff its
        /// last edge was an insert.
        #[test]
        fn matches_reference_set(ops in proptest::collection::vec(
            (0u8..8, any::<bool>()),
            0..200,
        )) {
            let busy = BusySet::new();
            let mut reference = std::collections::HashSet::new();
            for (id, is_insert) in ops {
                let worker = format!("w{id}");
                if is_insert {
                    busy.insert(&worker);
                    reference.insert(worker);
                } else {
                    busy.remove(&worker);
                    reference.remove(&worker);
                }
            }
            for id in 0u8..8 {
                let worker = format!("w{id}");
                prop_assert_eq!(busy.contains(&worker), reference.contains(&worker));
            }
        }
    }
}

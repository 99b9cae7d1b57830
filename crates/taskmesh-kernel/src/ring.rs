//! Consistent-hash ring.
//!
//! Maps arbitrary key strings onto a set of node IDs with per-node
//! virtual replicas, so that adding or removing one node reassigns only
//! an `O(1/n)` slice of the key space.  Virtual node positions are the
//! MD5 of `"{node_id}-{i}"` interpreted as a 128-bit big-endian integer;
//! a key is owned by the node whose smallest virtual position is ≥ the
//! key's hash, wrapping past the top of the space.

use std::collections::{BTreeMap, HashMap};

/// Default number of virtual replicas per node.
pub const DEFAULT_REPLICAS: u32 = 10;

/// Hash a key string onto the 128-bit ring space.
fn ring_hash(key: &str) -> u128 {
    u128::from_be_bytes(md5::compute(key.as_bytes()).0)
}

/// A consistent-hash ring over string node IDs.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Virtual position → node ID, sorted by position.
    ring: BTreeMap<u128, String>,
    /// Replica count each node was added with, so removal can reverse
    /// exactly the positions that were inserted.
    replicas: HashMap<String, u32>,
}

impl HashRing {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the given number of virtual replicas.
    ///
    /// Re-adding a node first removes its previous virtual positions, so
    /// the replica count can change across registrations.  Two virtual
    /// positions colliding (astronomically unlikely at 128 bits) resolve
    /// to the lexicographically smaller node ID.
    pub fn add(&mut self, node_id: &str, replicas: u32) {
        if self.replicas.contains_key(node_id) {
            self.remove(node_id);
        }
        for i in 0..replicas {
            let position = ring_hash(&format!("{node_id}-{i}"));
            match self.ring.get(&position) {
                Some(existing) if existing.as_str() <= node_id => {}
                _ => {
                    self.ring.insert(position, node_id.to_string());
                }
            }
        }
        self.replicas.insert(node_id.to_string(), replicas);
    }

    /// Remove a node and every virtual position it was added with.
    pub fn remove(&mut self, node_id: &str) {
        let Some(replicas) = self.replicas.remove(node_id) else {
            return;
        };
        for i in 0..replicas {
            let position = ring_hash(&format!("{node_id}-{i}"));
            if self.ring.get(&position).is_some_and(|n| n == node_id) {
                self.ring.remove(&position);
            }
        }
    }

    /// The node responsible for a key: smallest virtual position ≥ the
    /// key's hash, wrapping to the first position past the top.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = ring_hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Deterministic successor walk: the first node after `key`'s
    /// position that is not `last`, skipping every virtual position
    /// mapped to `last`.
    pub fn next_after(&self, key: &str, last: &str) -> Option<&str> {
        self.walk(key).into_iter().find(|&node| node != last)
    }

    /// All distinct nodes in ring order starting at `key`'s position --
    /// one full lap.  The first entry equals [`HashRing::get`].
    pub fn walk(&self, key: &str) -> Vec<&str> {
        let hash = ring_hash(key);
        let mut seen: Vec<&str> = Vec::with_capacity(self.replicas.len());
        for (_, node) in self.ring.range(hash..).chain(self.ring.range(..hash)) {
            if !seen.contains(&node.as_str()) {
                seen.push(node.as_str());
            }
        }
        seen
    }

    /// Whether the node is currently on the ring.
    pub fn contains(&self, node_id: &str) -> bool {
        self.replicas.contains_key(node_id)
    }

    /// IDs of every node on the ring.
    pub fn nodes(&self) -> Vec<&str> {
        self.replicas.keys().map(String::as_str).collect()
    }

    /// Number of distinct nodes.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_ring_is_none() {
        let ring = HashRing::new();
        assert!(ring.get("anything").is_none());
    }

    #[test]
    fn single_node_owns_everything() {
        let mut ring = HashRing::new();
        ring.add("w1", DEFAULT_REPLICAS);
        for key in ["1", "2", "zebra", "", "task-99"] {
            assert_eq!(ring.get(key), Some("w1"));
        }
    }

    #[test]
    fn remove_restores_prior_ownership() {
        let mut ring = HashRing::new();
        ring.add("w1", DEFAULT_REPLICAS);
        ring.add("w2", DEFAULT_REPLICAS);

        let before: Vec<Option<String>> = (0..50)
            .map(|i| ring.get(&i.to_string()).map(str::to_string))
            .collect();

        ring.add("w3", DEFAULT_REPLICAS);
        ring.remove("w3");

        let after: Vec<Option<String>> = (0..50)
            .map(|i| ring.get(&i.to_string()).map(str::to_string))
            .collect();
        assert_eq!(before, after);
        assert!(!ring.contains("w3"));
    }

    #[test]
    fn readd_with_fewer_replicas_drops_old_positions() {
        let mut ring = HashRing::new();
        ring.add("w1", 8);
        ring.add("w1", 2);
        ring.remove("w1");
        assert!(ring.is_empty());
        assert_eq!(ring.ring.len(), 0);
    }

    #[test]
    fn walk_starts_at_owner_and_covers_all_nodes() {
        let mut ring = HashRing::new();
        ring.add("w1", 5);
        ring.add("w2", 5);
        ring.add("w3", 5);

        let walk = ring.walk("task-7");
        assert_eq!(walk.first().copied(), ring.get("task-7"));
        assert_eq!(walk.len(), 3);
        let mut sorted = walk.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn next_after_skips_the_named_node() {
        let mut ring = HashRing::new();
        ring.add("w1", 5);
        ring.add("w2", 5);

        let owner = ring.get("42").unwrap().to_string();
        let successor = ring.next_after("42", &owner).unwrap();
        assert_ne!(successor, owner);
    }

    #[test]
    fn next_after_on_single_node_ring_is_none() {
        let mut ring = HashRing::new();
        ring.add("only", DEFAULT_REPLICAS);
        assert!(ring.next_after("42", "only").is_none());
    }

    #[test]
    fn adding_a_node_moves_keys_only_to_it() {
        let mut ring = HashRing::new();
        for w in ["w1", "w2", "w3", "w4"] {
            ring.add(w, DEFAULT_REPLICAS);
        }

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.get(k).unwrap().to_string())
            .collect();

        ring.add("w5", DEFAULT_REPLICAS);

        let mut moved = 0usize;
        for (key, old_owner) in keys.iter().zip(&before) {
            let new_owner = ring.get(key).unwrap();
            if new_owner != old_owner {
                // A reassigned key may only move to the new node.
                assert_eq!(new_owner, "w5");
                moved += 1;
            }
        }

        // Expected share ≈ 1/(N+1) = 0.2; allow a generous constant
        // factor for hash variance at 10 replicas.
        let fraction = moved as f64 / keys.len() as f64;
        assert!(fraction > 0.02, "implausibly few keys moved: {fraction}");
        assert!(fraction < 0.5, "implausibly many keys moved: {fraction}");
    }

    #[test]
    fn lookup_is_deterministic() {
        let build = || {
            let mut ring = HashRing::new();
            ring.add("a", 3);
            ring.add("b", 7);
            ring
        };
        let r1 = build();
        let r2 = build();
        for i in 0..100 {
            let key = i.to_string();
            assert_eq!(r1.get(&key), r2.get(&key));
        }
    }
}

//! Worker registry and capability index.
//!
//! The registry is the authoritative table of live workers.  For each
//! capability it also maintains a consistent-hash ring as a secondary
//! index; rings reference workers by ID only, and every mutation touches
//! rings and records inside one critical section so the dispatcher
//! always observes a consistent snapshot.
//!
//! A worker advertising `|C|` capabilities joins each of its rings with
//! `max(1, 10 - |C|)` virtual replicas -- generalists spread thin,
//! specialists weigh heavy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use taskmesh_kernel::bus::Bus;
use taskmesh_kernel::envelope::{Envelope, RegisterPayload, WorkerStatus};
use taskmesh_kernel::ring::HashRing;
use taskmesh_kernel::{BusySet, REGISTER_SUBJECT};

use crate::error::Result;

/// Virtual-replica budget a single-capability specialist receives.
const REPLICA_BUDGET: u32 = 10;

/// Replica count for a worker advertising `capability_count` tags.
pub fn replicas_for(capability_count: usize) -> u32 {
    REPLICA_BUDGET.saturating_sub(capability_count as u32).max(1)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A live worker as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Stable worker identifier.
    pub worker_id: String,
    /// Capability tags the worker advertised.
    pub capabilities: Vec<String>,
    /// Subject the worker receives dispatches on.
    pub inbound_subject: String,
    /// Availability advertised at registration.
    pub status: WorkerStatus,
}

/// Outcome of a selection attempt for one capability.
#[derive(Debug)]
pub enum Selection {
    /// A worker was chosen and atomically marked busy.
    Claimed(WorkerRecord),
    /// No live worker advertises the capability.
    NoCapableWorker,
    /// Every capable worker is busy; one full ring lap was exhausted.
    AllBusy,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    workers: HashMap<String, WorkerRecord>,
    rings: HashMap<String, HashRing>,
}

/// Concurrent worker registry.  Cheaply cloneable (`Arc`-backed).
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    /// Install or replace a worker record from a registration payload.
    ///
    /// The worker is first pulled off every ring it is on (capabilities
    /// may have changed), then re-indexed under its new capability set.
    pub fn apply_register(&self, payload: &RegisterPayload) {
        let capabilities = payload.capability_list();
        let mut inner = self.lock();

        for ring in inner.rings.values_mut() {
            ring.remove(&payload.agent_id);
        }

        let replicas = replicas_for(capabilities.len());
        for capability in &capabilities {
            inner
                .rings
                .entry(capability.clone())
                .or_default()
                .add(&payload.agent_id, replicas);
        }

        inner.workers.insert(
            payload.agent_id.clone(),
            WorkerRecord {
                worker_id: payload.agent_id.clone(),
                capabilities: capabilities.clone(),
                inbound_subject: payload.listen_channel.clone(),
                status: payload.status,
            },
        );

        tracing::info!(
            worker_id = %payload.agent_id,
            capabilities = %payload.capabilities,
            replicas,
            "worker registered"
        );
    }

    /// Remove a worker: rings first, then the record, in one critical
    /// section.
    pub fn apply_unregister(&self, worker_id: &str) {
        let mut inner = self.lock();
        if let Some(record) = inner.workers.remove(worker_id) {
            for capability in &record.capabilities {
                if let Some(ring) = inner.rings.get_mut(capability) {
                    ring.remove(worker_id);
                }
            }
            tracing::info!(worker_id, "worker unregistered");
        } else {
            tracing::debug!(worker_id, "unregister for unknown worker ignored");
        }
    }

    /// Pick a worker for `capability`, keyed by the task ID, skipping
    /// busy workers around the ring, and mark the winner busy -- all
    /// under one registry snapshot.
    ///
    /// The busy insert happens before the lock is released so a
    /// concurrent scan cannot double-claim the same worker.
    pub fn claim(&self, capability: &str, task_id: u64, busy: &BusySet) -> Selection {
        let inner = self.lock();
        let Some(ring) = inner.rings.get(capability).filter(|r| !r.is_empty()) else {
            return Selection::NoCapableWorker;
        };

        for candidate in ring.walk(&task_id.to_string()) {
            if busy.contains(candidate) {
                continue;
            }
            let Some(record) = inner.workers.get(candidate) else {
                // Ring/record divergence would be a bug; fail safe by
                // skipping the orphan entry.
                tracing::error!(candidate, capability, "ring references unknown worker");
                continue;
            };
            busy.insert(candidate);
            return Selection::Claimed(record.clone());
        }
        Selection::AllBusy
    }

    /// Snapshot of a single worker.
    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.lock().workers.get(worker_id).cloned()
    }

    /// Snapshot of every live worker.
    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.lock().workers.values().cloned().collect()
    }

    /// Worker IDs on the ring for a capability (empty when no ring).
    pub fn capability_members(&self, capability: &str) -> Vec<String> {
        self.lock()
            .rings
            .get(capability)
            .map(|ring| ring.nodes().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().workers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Consume the registration subject until the bus closes, applying
/// register/unregister events to the registry.
///
/// Malformed messages are logged and acked so a poison pill cannot
/// stall registration.
pub async fn run_registry_listener(bus: Arc<dyn Bus>, registry: WorkerRegistry) -> Result<()> {
    let mut subscription = bus.subscribe(REGISTER_SUBJECT).await?;
    tracing::debug!(subject = REGISTER_SUBJECT, "registry listener started");

    while let Some(message) = subscription.next().await {
        match Envelope::parse(&message.payload) {
            Ok(Envelope::Register(payload)) => registry.apply_register(&payload),
            Ok(Envelope::Unregister(payload)) => registry.apply_unregister(&payload.agent_id),
            Ok(other) => {
                tracing::warn!(?other, "unexpected envelope on register subject, dropped");
            }
            Err(error) => {
                tracing::warn!(%error, "malformed registration message dropped");
            }
        }
        message.ack();
    }

    tracing::debug!("registry listener stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &WorkerRegistry, id: &str, capabilities: &str) {
        registry.apply_register(&RegisterPayload {
            agent_id: id.into(),
            capabilities: capabilities.into(),
            listen_channel: format!("{id}.in"),
            status: WorkerStatus::Idle,
        });
    }

    #[test]
    fn replicas_shrink_with_breadth() {
        assert_eq!(replicas_for(1), 9);
        assert_eq!(replicas_for(4), 6);
        assert_eq!(replicas_for(9), 1);
        assert_eq!(replicas_for(10), 1);
        assert_eq!(replicas_for(25), 1);
    }

    #[test]
    fn register_indexes_every_capability() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1", "text-generation,analysis-summary");

        assert_eq!(registry.capability_members("text-generation"), vec!["w1"]);
        assert_eq!(registry.capability_members("analysis-summary"), vec!["w1"]);
        assert!(registry.capability_members("math-reasoning").is_empty());
    }

    #[test]
    fn reregistration_replaces_capabilities() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1", "text-generation");
        register(&registry, "w1", "grammar-polish");

        assert!(registry.capability_members("text-generation").is_empty());
        assert_eq!(registry.capability_members("grammar-polish"), vec!["w1"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_clears_rings_and_record() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1", "text-generation");
        registry.apply_unregister("w1");

        assert!(registry.is_empty());
        assert!(registry.capability_members("text-generation").is_empty());
    }

    #[test]
    fn ring_membership_matches_registrations() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1", "a,b");
        register(&registry, "w2", "b,c");
        register(&registry, "w3", "c");
        registry.apply_unregister("w2");

        let mut b = registry.capability_members("b");
        b.sort_unstable();
        assert_eq!(b, vec!["w1"]);
        let mut c = registry.capability_members("c");
        c.sort_unstable();
        assert_eq!(c, vec!["w3"]);
    }

    #[test]
    fn claim_marks_winner_busy() {
        let registry = WorkerRegistry::new();
        let busy = BusySet::new();
        register(&registry, "w1", "text-generation");

        match registry.claim("text-generation", 1, &busy) {
            Selection::Claimed(record) => {
                assert_eq!(record.worker_id, "w1");
                assert!(busy.contains("w1"));
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[test]
    fn claim_skips_busy_workers() {
        let registry = WorkerRegistry::new();
        let busy = BusySet::new();
        register(&registry, "w1", "analysis-summary");
        register(&registry, "w2", "analysis-summary");

        let first = match registry.claim("analysis-summary", 7, &busy) {
            Selection::Claimed(r) => r.worker_id,
            other => panic!("expected claim, got {other:?}"),
        };
        let second = match registry.claim("analysis-summary", 7, &busy) {
            Selection::Claimed(r) => r.worker_id,
            other => panic!("expected claim, got {other:?}"),
        };
        assert_ne!(first, second);

        assert!(matches!(
            registry.claim("analysis-summary", 7, &busy),
            Selection::AllBusy
        ));
    }

    #[test]
    fn claim_without_ring_reports_no_worker() {
        let registry = WorkerRegistry::new();
        let busy = BusySet::new();
        assert!(matches!(
            registry.claim("math-reasoning", 1, &busy),
            Selection::NoCapableWorker
        ));
    }

    #[tokio::test]
    async fn listener_applies_and_acks() {
        use taskmesh_kernel::MemoryBus;

        let bus = MemoryBus::new();
        let registry = WorkerRegistry::new();
        let handle = tokio::spawn(run_registry_listener(
            Arc::new(bus.clone()),
            registry.clone(),
        ));

        let register_msg = Envelope::Register(RegisterPayload {
            agent_id: "w1".into(),
            capabilities: "text-generation".into(),
            listen_channel: "w1.in".into(),
            status: WorkerStatus::Idle,
        })
        .encode()
        .unwrap();
        bus.publish(REGISTER_SUBJECT, register_msg).await.unwrap();
        bus.publish(REGISTER_SUBJECT, b"{broken".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 1);
        // Both the valid and the malformed message were acked.
        assert_eq!(bus.acked_count(REGISTER_SUBJECT), 2);

        bus.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}

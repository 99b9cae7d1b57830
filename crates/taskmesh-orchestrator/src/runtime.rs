//! Orchestrator runtime.
//!
//! Owns the shared state (registry, busy set, tracker), spawns the bus
//! listeners, and drives the dispatch scan loop until every task
//! finishes, then broadcasts shutdown and closes the bus.
//!
//! All state mutation happens in the listeners and the scan loop, each
//! yielding only at bus boundaries; the shared structures serialize
//! access internally so the dispatcher's claim-and-mark step is atomic
//! with respect to the collector's release-and-advance step.

use std::sync::Arc;

use tokio::task::JoinHandle;

use taskmesh_kernel::BusySet;
use taskmesh_kernel::bus::Bus;
use taskmesh_kernel::envelope::Envelope;
use taskmesh_sync::RatelessCodec;

use crate::capability::DEFAULT_VOCABULARY;
use crate::collector::run_result_collector;
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::planner::{Planner, fallback_pipeline};
use crate::registry::{WorkerRegistry, run_registry_listener};
use crate::tracker::{PipelineTracker, RawTask};

/// The meta-orchestrator: registry, tracker, busy set, and the loop
/// that connects them.
pub struct Orchestrator {
    bus: Arc<dyn Bus>,
    registry: WorkerRegistry,
    busy: Arc<BusySet>,
    tracker: PipelineTracker,
    planner: Arc<dyn Planner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Assemble an orchestrator over a connected bus.
    pub fn new(bus: Arc<dyn Bus>, planner: Arc<dyn Planner>, config: OrchestratorConfig) -> Self {
        Self {
            bus,
            registry: WorkerRegistry::new(),
            busy: Arc::new(BusySet::new()),
            tracker: PipelineTracker::new(),
            planner,
            config,
        }
    }

    /// The worker registry handle.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// The pipeline tracker handle.
    pub fn tracker(&self) -> &PipelineTracker {
        &self.tracker
    }

    /// The busy-set handle.
    pub fn busy(&self) -> &Arc<BusySet> {
        &self.busy
    }

    /// Decompose every raw task and install it in the tracker.
    ///
    /// Planner failure or an empty split falls back to a single-stage
    /// text-generation pipeline -- a task is never abandoned at planning
    /// time.
    pub async fn plan_tasks(&self, tasks: Vec<RawTask>) {
        for task in tasks {
            let subtasks = match self.planner.plan(&task.content, &DEFAULT_VOCABULARY).await {
                Ok(subtasks) if !subtasks.is_empty() => subtasks,
                Ok(_) => {
                    tracing::warn!(task_id = task.id, "planner returned no subtasks, using fallback pipeline");
                    fallback_pipeline(&task.content)
                }
                Err(error) => {
                    tracing::warn!(task_id = task.id, %error, "planning failed, using fallback pipeline");
                    fallback_pipeline(&task.content)
                }
            };
            tracing::info!(
                task_id = task.id,
                stages = subtasks.len(),
                pipeline = ?subtasks.iter().map(|s| s.required_capability.as_str()).collect::<Vec<_>>(),
                "task planned"
            );
            self.tracker
                .insert(task.id, task.content, subtasks, task.context);
        }
    }

    /// Run to completion: plan, listen, dispatch until every task is
    /// finished, broadcast shutdown, close the bus.
    pub async fn run(&self, tasks: Vec<RawTask>) -> Result<()> {
        let registry_handle = tokio::spawn(run_registry_listener(
            Arc::clone(&self.bus),
            self.registry.clone(),
        ));

        self.plan_tasks(tasks).await;

        let mut collector_handles: Vec<JoinHandle<Result<()>>> = Vec::new();
        for task_id in self.tracker.task_ids() {
            collector_handles.push(tokio::spawn(run_result_collector(
                Arc::clone(&self.bus),
                self.tracker.clone(),
                Arc::clone(&self.busy),
                task_id,
            )));
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.bus),
            self.registry.clone(),
            Arc::clone(&self.busy),
            self.tracker.clone(),
            RatelessCodec::new(),
        );

        tracing::info!(tasks = self.tracker.len(), "orchestrator main loop started");
        while !self.tracker.all_finished() {
            dispatcher.dispatch_ready().await;

            if let Some(timeout) = self.config.dispatch_timeout {
                for (task_id, worker_id) in self.tracker.expire_pending(timeout) {
                    self.busy.remove(&worker_id);
                    tracing::info!(task_id, worker_id = %worker_id, "busy mark released after timeout");
                }
            }

            if self.tracker.all_finished() {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        tracing::info!("all tasks finished");

        self.broadcast_shutdown().await;
        self.bus.close().await?;

        // Listeners end once the bus closes.
        let _ = registry_handle.await;
        for handle in collector_handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Publish one shutdown envelope on every registered worker's
    /// inbound subject.  Send failures are logged, not fatal.
    pub async fn broadcast_shutdown(&self) {
        let workers = self.registry.workers();
        tracing::info!(workers = workers.len(), "broadcasting shutdown");
        for worker in workers {
            let Ok(payload) = Envelope::Shutdown.encode() else {
                continue;
            };
            match self.bus.publish(&worker.inbound_subject, payload).await {
                Ok(()) => {
                    tracing::debug!(worker_id = %worker.worker_id, subject = %worker.inbound_subject, "shutdown sent")
                }
                Err(error) => {
                    tracing::warn!(worker_id = %worker.worker_id, %error, "shutdown publish failed")
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Subtask dispatch.
//!
//! For every ready stage the dispatcher claims one capable, non-busy
//! worker off the capability ring, encodes the task's authoritative
//! context into a rateless batch, and publishes the dispatch envelope on
//! the worker's inbound subject.  Publish failure rolls the claim back
//! (busy mark and pending flag) so the stage is offered again next
//! scan.

use std::sync::Arc;
use std::time::Duration;

use taskmesh_kernel::bus::Bus;
use taskmesh_kernel::envelope::{DispatchPayload, Envelope};
use taskmesh_kernel::{BusySet, KernelError};
use taskmesh_sync::RatelessCodec;

use crate::error::Result;
use crate::registry::{Selection, WorkerRegistry};
use crate::tracker::{PipelineTracker, ReadyStage};

/// Attempts per publish before giving the stage back to the scan.
const PUBLISH_ATTEMPTS: u32 = 3;

/// Backoff between publish attempts.
const PUBLISH_BACKOFF: Duration = Duration::from_millis(100);

/// Stateless dispatch engine over shared orchestrator state.
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    registry: WorkerRegistry,
    busy: Arc<BusySet>,
    tracker: PipelineTracker,
    codec: RatelessCodec,
}

impl Dispatcher {
    /// Wire a dispatcher over the shared state handles.
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: WorkerRegistry,
        busy: Arc<BusySet>,
        tracker: PipelineTracker,
        codec: RatelessCodec,
    ) -> Self {
        Self {
            bus,
            registry,
            busy,
            tracker,
            codec,
        }
    }

    /// One scan: try to dispatch every ready stage.  Returns how many
    /// dispatches were published.
    pub async fn dispatch_ready(&self) -> usize {
        let mut dispatched = 0;
        for ready in self.tracker.ready_stages() {
            match self.dispatch_stage(&ready).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        task_id = ready.task_id,
                        stage = ready.stage,
                        %error,
                        "dispatch failed, stage stays ready"
                    );
                }
            }
        }
        dispatched
    }

    /// Dispatch one stage.  `Ok(false)` means no worker was available
    /// this tick; the stage is retried on a later scan.
    async fn dispatch_stage(&self, ready: &ReadyStage) -> Result<bool> {
        let capability = ready.subtask.required_capability.as_str();
        let worker = match self.registry.claim(capability, ready.task_id, &self.busy) {
            Selection::Claimed(worker) => worker,
            Selection::NoCapableWorker => {
                tracing::debug!(
                    task_id = ready.task_id,
                    stage = ready.stage,
                    capability,
                    "no live worker for capability, will retry"
                );
                return Ok(false);
            }
            Selection::AllBusy => {
                tracing::debug!(
                    task_id = ready.task_id,
                    stage = ready.stage,
                    capability,
                    "all capable workers busy, will retry"
                );
                return Ok(false);
            }
        };

        self.tracker
            .mark_pending(ready.task_id, ready.stage, &worker.worker_id);

        let iblt_data = if ready.context.is_empty() {
            None
        } else {
            Some(hex::encode(self.codec.encode(&ready.context)?))
        };
        let envelope = Envelope::Subtask(DispatchPayload {
            task_id: ready.task_id,
            query: build_query(ready),
            iblt_data,
        });

        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(error) => {
                self.rollback(ready.task_id, &worker.worker_id);
                return Err(error.into());
            }
        };
        if let Err(error) = self
            .publish_with_retry(&worker.inbound_subject, payload)
            .await
        {
            self.rollback(ready.task_id, &worker.worker_id);
            return Err(error.into());
        }

        tracing::info!(
            task_id = ready.task_id,
            stage = ready.stage,
            capability,
            worker_id = %worker.worker_id,
            subject = %worker.inbound_subject,
            "subtask dispatched"
        );
        Ok(true)
    }

    async fn publish_with_retry(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), KernelError> {
        let mut last_error = None;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.bus.publish(subject, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!(subject, attempt, %error, "publish attempt failed");
                    last_error = Some(error);
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(PUBLISH_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(KernelError::PublishFailed {
            subject: subject.to_string(),
            reason: "no attempts made".into(),
        }))
    }

    fn rollback(&self, task_id: u64, worker_id: &str) {
        self.busy.remove(worker_id);
        self.tracker.clear_pending(task_id);
    }
}

/// Build the worker prompt: the subtask, the overall task for context,
/// and the results of prerequisite stages.
fn build_query(ready: &ReadyStage) -> String {
    let dependency_results = if ready.stage == 0 {
        String::new()
    } else {
        ready.prior_results.join("\n")
    };
    format!(
        r#"We are solving a complex task, and we have split the task into several subtasks.
You need to process one given task. Don't assume that the problem is unsolvable. The answer does exist. If you can't solve the task, please describe the reason and the result you have achieved in detail.
The content of the task that you need to do is:
<task>
{subtask}
</task>
Here is the overall task for reference, which contains some helpful information that can help you solve the task:
<overall_task>
{overall_task}
</overall_task>
Here are results of some prerequisite results that you can refer to (empty if there are no prerequisite results):
<dependency_results_info>
{dependency_results}
</dependency_results_info>
Here are some additional information about the task (only for reference, and may be empty):
<additional_info>
None
</additional_info>
Now please fully leverage the information above, try your best to leverage the existing results and your available tools to solve the current task.
"#,
        subtask = ready.subtask.prompt,
        overall_task = ready.source,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

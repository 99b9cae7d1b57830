//! Simulated capability workers.
//!
//! A [`SimWorker`] registers on the bus, listens on its inbound subject,
//! reconciles the context batch attached to each dispatch against its
//! local copy, answers with a canned result, and stops on shutdown.
//! They make a taskmesh run self-contained: every scenario the
//! orchestrator supports can be exercised without external worker
//! processes.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskmesh_kernel::bus::Bus;
use taskmesh_kernel::envelope::{
    Envelope, RegisterPayload, ResultPayload, ResultValue, WorkerStatus, task_result_subject,
};
use taskmesh_kernel::REGISTER_SUBJECT;
use taskmesh_sync::{Context, RatelessCodec};

/// An in-process worker simulating one member of the agent population.
pub struct SimWorker {
    id: String,
    capabilities: String,
    inbound_subject: String,
    bus: Arc<dyn Bus>,
    codec: RatelessCodec,
    /// The worker's possibly-stale view of each task's context.
    local_context: Context,
}

impl SimWorker {
    /// Create a worker advertising the given comma-joined capabilities.
    pub fn new(bus: Arc<dyn Bus>, id: impl Into<String>, capabilities: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            inbound_subject: format!("worker.{id}.in"),
            id,
            capabilities: capabilities.into(),
            bus,
            codec: RatelessCodec::new(),
            local_context: Context::new(),
        }
    }

    /// Subscribe, register, and spawn the worker loop.
    pub async fn spawn(mut self) -> Result<JoinHandle<()>> {
        let mut inbox = self
            .bus
            .subscribe(&self.inbound_subject)
            .await
            .context("worker subscribe failed")?;

        let register = Envelope::Register(RegisterPayload {
            agent_id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            listen_channel: self.inbound_subject.clone(),
            status: WorkerStatus::Idle,
        });
        self.bus
            .publish(REGISTER_SUBJECT, register.encode()?)
            .await
            .context("worker registration failed")?;
        info!(worker_id = %self.id, capabilities = %self.capabilities, "worker registered");

        Ok(tokio::spawn(async move {
            while let Some(message) = inbox.next().await {
                match Envelope::parse(&message.payload) {
                    Ok(Envelope::Subtask(payload)) => {
                        self.handle_subtask(payload.task_id, payload.iblt_data.as_deref())
                            .await;
                    }
                    Ok(Envelope::Shutdown) => {
                        info!(worker_id = %self.id, "worker shutting down");
                        message.ack();
                        break;
                    }
                    Ok(other) => {
                        debug!(worker_id = %self.id, ?other, "ignoring unexpected envelope");
                    }
                    Err(error) => {
                        warn!(worker_id = %self.id, %error, "malformed dispatch dropped");
                    }
                }
                message.ack();
            }
        }))
    }

    async fn handle_subtask(&mut self, task_id: u64, iblt_data: Option<&str>) {
        let synced_docs = match iblt_data {
            Some(batch_hex) => self.reconcile_context(batch_hex),
            None => 0,
        };

        let result = Envelope::SubtaskResult(ResultPayload {
            task_id: Some(task_id),
            agent_id: Some(self.id.clone()),
            result: ResultValue::Text(format!(
                "[{worker}] completed a {caps} subtask of task {task_id} ({docs} context docs in view)",
                worker = self.id,
                caps = self.capabilities,
                docs = synced_docs,
            )),
        });
        let Ok(payload) = result.encode() else {
            warn!(worker_id = %self.id, task_id, "result serialization failed");
            return;
        };
        if let Err(error) = self
            .bus
            .publish(&task_result_subject(task_id), payload)
            .await
        {
            warn!(worker_id = %self.id, task_id, %error, "result publish failed");
        }
    }

    /// Decode the attached batch against the local view and apply the
    /// delta.  Returns the number of documents now held.
    fn reconcile_context(&mut self, batch_hex: &str) -> usize {
        let batch = match hex::decode(batch_hex) {
            Ok(batch) => batch,
            Err(error) => {
                warn!(worker_id = %self.id, %error, "undecodable context batch");
                return self.local_context.len();
            }
        };
        match self.codec.decode(&batch, &self.local_context) {
            Ok(delta) => {
                debug!(
                    worker_id = %self.id,
                    added = delta.added.len(),
                    removed = delta.removed.len(),
                    updated = delta.updated.len(),
                    "context reconciled"
                );
                delta.apply_to(&mut self.local_context);
            }
            Err(error) => {
                warn!(worker_id = %self.id, %error, "context reconciliation failed");
            }
        }
        self.local_context.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_kernel::MemoryBus;
    use taskmesh_kernel::envelope::DispatchPayload;

    #[tokio::test]
    async fn worker_registers_and_answers() {
        let bus = Arc::new(MemoryBus::new());
        let mut register_sub = bus.subscribe(REGISTER_SUBJECT).await.unwrap();
        let mut result_sub = bus.subscribe(&task_result_subject(5)).await.unwrap();

        let worker = SimWorker::new(bus.clone(), "sim1", "text-generation");
        let handle = worker.spawn().await.unwrap();

        let registration = register_sub.next().await.unwrap();
        match Envelope::parse(&registration.payload).unwrap() {
            Envelope::Register(p) => {
                assert_eq!(p.agent_id, "sim1");
                assert_eq!(p.listen_channel, "worker.sim1.in");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        let mut context = Context::new();
        context.insert("doc".into(), b"body".to_vec());
        let batch = RatelessCodec::new().encode(&context).unwrap();
        let dispatch = Envelope::Subtask(DispatchPayload {
            task_id: 5,
            query: "work".into(),
            iblt_data: Some(hex::encode(batch)),
        });
        bus.publish("worker.sim1.in", dispatch.encode().unwrap())
            .await
            .unwrap();

        let result = result_sub.next().await.unwrap();
        match Envelope::parse(&result.payload).unwrap() {
            Envelope::SubtaskResult(p) => {
                assert_eq!(p.task_id, Some(5));
                assert_eq!(p.agent_id.as_deref(), Some("sim1"));
                assert!(p.result.join().contains("1 context docs"));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        bus.publish("worker.sim1.in", Envelope::Shutdown.encode().unwrap())
            .await
            .unwrap();
        handle.await.unwrap();
    }
}

//! Result collection.
//!
//! One subscription per active task on its `TASK_{id}_RESULT` subject.
//! Each arriving result is applied to the tracker (append, advance,
//! release pending), the reporting worker's busy mark is cleared, and
//! the bus message is acked last -- at-least-once semantics, with
//! redeliveries detected and dropped by the tracker.

use std::sync::Arc;

use taskmesh_kernel::BusySet;
use taskmesh_kernel::bus::Bus;
use taskmesh_kernel::envelope::{Envelope, task_result_subject};

use crate::error::Result;
use crate::tracker::{AdvanceOutcome, PipelineTracker};

/// Consume one task's result subject until the bus closes.
pub async fn run_result_collector(
    bus: Arc<dyn Bus>,
    tracker: PipelineTracker,
    busy: Arc<BusySet>,
    task_id: u64,
) -> Result<()> {
    let subject = task_result_subject(task_id);
    let mut subscription = bus.subscribe(&subject).await?;
    tracing::debug!(subject = %subject, "result collector started");

    while let Some(message) = subscription.next().await {
        match Envelope::parse(&message.payload) {
            Ok(Envelope::SubtaskResult(payload)) => {
                if payload.task_id.is_some_and(|id| id != task_id) {
                    tracing::warn!(
                        subject = %subject,
                        payload_task = ?payload.task_id,
                        "result payload names a different task, dropped"
                    );
                    message.ack();
                    continue;
                }
                let agent_id = payload.agent_id.clone();
                let result = payload.result.join();

                match tracker.advance(task_id, result) {
                    AdvanceOutcome::Advanced {
                        stage,
                        finished,
                        worker_id,
                    } => {
                        // Trust the dispatch record; the payload's agent
                        // field is a cross-check only.
                        if agent_id.as_deref().is_some_and(|a| a != worker_id) {
                            tracing::warn!(
                                task_id,
                                stage,
                                expected = %worker_id,
                                reported = ?agent_id,
                                "result reported by unexpected worker"
                            );
                        }
                        busy.remove(&worker_id);
                        tracing::info!(task_id, stage, worker_id = %worker_id, finished, "stage completed");
                    }
                    AdvanceOutcome::UnknownTask => {
                        tracing::warn!(task_id, "result for unknown task dropped");
                    }
                    AdvanceOutcome::AlreadyFinished => {
                        tracing::debug!(task_id, "result for finished task dropped");
                    }
                    AdvanceOutcome::Duplicate => {
                        tracing::debug!(task_id, "duplicate result dropped");
                        // The original delivery already released the
                        // worker; a straggler from an expired dispatch
                        // must not leave its sender marked busy.
                        if let Some(agent) = agent_id.as_deref() {
                            busy.remove(agent);
                        }
                    }
                }
            }
            Ok(other) => {
                tracing::warn!(subject = %subject, ?other, "unexpected envelope on result subject, dropped");
            }
            Err(error) => {
                tracing::warn!(subject = %subject, %error, "malformed result message dropped");
            }
        }
        // Ack last: a crash before this point lets the bus redeliver.
        message.ack();
    }

    tracing::debug!(subject = %subject, "result collector stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_kernel::MemoryBus;
    use taskmesh_kernel::envelope::{ResultPayload, ResultValue};
    use taskmesh_sync::Context;

    use crate::tracker::Subtask;

    async fn publish_result(bus: &MemoryBus, task_id: u64, agent: &str, result: ResultValue) {
        let envelope = Envelope::SubtaskResult(ResultPayload {
            task_id: Some(task_id),
            agent_id: Some(agent.into()),
            result,
        });
        bus.publish(&task_result_subject(task_id), envelope.encode().unwrap())
            .await
            .unwrap();
    }

    fn tracked_task(tracker: &PipelineTracker, id: u64, capabilities: &[&str]) {
        tracker.insert(
            id,
            "task".into(),
            capabilities
                .iter()
                .map(|c| Subtask {
                    prompt: "p".into(),
                    required_capability: c.to_string(),
                })
                .collect(),
            Context::new(),
        );
    }

    #[tokio::test]
    async fn result_advances_and_releases_worker() {
        let bus = MemoryBus::new();
        let tracker = PipelineTracker::new();
        let busy = Arc::new(BusySet::new());

        tracked_task(&tracker, 1, &["text-generation"]);
        tracker.mark_pending(1, 0, "w1");
        busy.insert("w1");

        let handle = tokio::spawn(run_result_collector(
            Arc::new(bus.clone()),
            tracker.clone(),
            busy.clone(),
            1,
        ));

        publish_result(&bus, 1, "w1", ResultValue::Text("hi".into())).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = tracker.get(1).unwrap();
        assert!(snapshot.finished);
        assert_eq!(snapshot.results, vec!["hi"]);
        assert!(!busy.contains("w1"));
        assert_eq!(bus.acked_count(&task_result_subject(1)), 1);

        bus.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_results_are_joined() {
        let bus = MemoryBus::new();
        let tracker = PipelineTracker::new();
        let busy = Arc::new(BusySet::new());

        tracked_task(&tracker, 2, &["analysis-summary"]);
        tracker.mark_pending(2, 0, "w1");

        let handle = tokio::spawn(run_result_collector(
            Arc::new(bus.clone()),
            tracker.clone(),
            busy.clone(),
            2,
        ));

        publish_result(
            &bus,
            2,
            "w1",
            ResultValue::Lines(vec!["part one".into(), "part two".into()]),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(tracker.get(2).unwrap().results, vec!["part one\npart two"]);

        bus.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn redelivered_result_is_dropped_and_acked() {
        let bus = MemoryBus::new();
        let tracker = PipelineTracker::new();
        let busy = Arc::new(BusySet::new());

        tracked_task(&tracker, 3, &["text-generation", "grammar-polish"]);
        tracker.mark_pending(3, 0, "w1");

        let handle = tokio::spawn(run_result_collector(
            Arc::new(bus.clone()),
            tracker.clone(),
            busy.clone(),
            3,
        ));

        publish_result(&bus, 3, "w1", ResultValue::Text("once".into())).await;
        // At-least-once redelivery of the same stage result.
        publish_result(&bus, 3, "w1", ResultValue::Text("once".into())).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = tracker.get(3).unwrap();
        assert_eq!(snapshot.results, vec!["once"]);
        assert_eq!(snapshot.current_stage, 1);
        assert_eq!(bus.acked_count(&task_result_subject(3)), 2);

        bus.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_result_is_acked_not_fatal() {
        let bus = MemoryBus::new();
        let tracker = PipelineTracker::new();
        let busy = Arc::new(BusySet::new());

        tracked_task(&tracker, 4, &["text-generation"]);

        let handle = tokio::spawn(run_result_collector(
            Arc::new(bus.clone()),
            tracker.clone(),
            busy.clone(),
            4,
        ));

        bus.publish(&task_result_subject(4), b"garbage".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(bus.acked_count(&task_result_subject(4)), 1);
        assert_eq!(tracker.get(4).unwrap().current_stage, 0);

        bus.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}

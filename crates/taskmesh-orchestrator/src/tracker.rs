//! Per-task pipeline state.
//!
//! Every task is an ordered pipeline of capability-tagged subtasks.  The
//! tracker owns all task records and enforces the pipeline invariants:
//! results and stage index move in lock-step, `finished` is monotonic,
//! and a stage with an outstanding dispatch (`pending`) is never offered
//! for dispatch again until its result arrives or the dispatch times
//! out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Deserialize;
use taskmesh_sync::Context;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One stage of a task pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    /// What the worker must do.
    pub prompt: String,
    /// Capability the stage requires.
    pub required_capability: String,
}

/// A task as provided to the orchestrator, before planning.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTask {
    /// Unique task identifier.
    pub id: u64,
    /// Natural-language task text.
    pub content: String,
    /// Authoritative context snapshot, keyed by document name.
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Clone)]
struct PendingDispatch {
    worker_id: String,
    dispatched_at: Instant,
}

#[derive(Debug)]
struct TaskRecord {
    id: u64,
    source: String,
    subtasks: Vec<Subtask>,
    results: Vec<String>,
    current_stage: usize,
    finished: bool,
    context: Context,
    pending: Option<PendingDispatch>,
}

/// Read-only view of a task's progress.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: u64,
    pub source: String,
    pub subtasks: Vec<Subtask>,
    pub results: Vec<String>,
    pub current_stage: usize,
    pub finished: bool,
}

/// Everything the dispatcher needs to send one stage.
#[derive(Debug, Clone)]
pub struct ReadyStage {
    pub task_id: u64,
    pub stage: usize,
    pub subtask: Subtask,
    /// Original task text, for the worker prompt.
    pub source: String,
    /// Results of prior stages, for the worker prompt.
    pub prior_results: Vec<String>,
    /// Authoritative context snapshot to encode.
    pub context: Context,
}

/// What happened when a result was applied.
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// The stage completed; `worker_id` may now be released.
    Advanced {
        stage: usize,
        finished: bool,
        worker_id: String,
    },
    /// No such task is tracked.
    UnknownTask,
    /// The task had already finished.
    AlreadyFinished,
    /// No dispatch was outstanding -- an at-least-once redelivery.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owner of all active task records.  Cheaply cloneable (`Arc`-backed).
#[derive(Debug, Clone, Default)]
pub struct PipelineTracker {
    inner: Arc<Mutex<BTreeMap<u64, TaskRecord>>>,
}

impl PipelineTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, TaskRecord>> {
        self.inner.lock().expect("tracker lock poisoned")
    }

    /// Register a planned task.  An empty pipeline is finished at birth.
    pub fn insert(&self, id: u64, source: String, subtasks: Vec<Subtask>, context: Context) {
        let finished = subtasks.is_empty();
        self.lock().insert(
            id,
            TaskRecord {
                id,
                source,
                subtasks,
                results: Vec::new(),
                current_stage: 0,
                finished,
                context,
                pending: None,
            },
        );
    }

    /// All stages currently eligible for dispatch, in task-ID order.
    ///
    /// A stage is ready when its task is unfinished, has stages left,
    /// and has no dispatch outstanding.
    pub fn ready_stages(&self) -> Vec<ReadyStage> {
        self.lock()
            .values()
            .filter(|t| !t.finished && t.pending.is_none() && t.current_stage < t.subtasks.len())
            .map(|t| ReadyStage {
                task_id: t.id,
                stage: t.current_stage,
                subtask: t.subtasks[t.current_stage].clone(),
                source: t.source.clone(),
                prior_results: t.results.clone(),
                context: t.context.clone(),
            })
            .collect()
    }

    /// The first ready stage, if any.
    pub fn next_ready(&self) -> Option<ReadyStage> {
        self.ready_stages().into_iter().next()
    }

    /// Record an outstanding dispatch for the task's current stage.
    pub fn mark_pending(&self, task_id: u64, stage: usize, worker_id: &str) {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return;
        };
        debug_assert_eq!(task.current_stage, stage);
        task.pending = Some(PendingDispatch {
            worker_id: worker_id.to_string(),
            dispatched_at: Instant::now(),
        });
    }

    /// Roll back an outstanding dispatch (publish failed).
    pub fn clear_pending(&self, task_id: u64) {
        if let Some(task) = self.lock().get_mut(&task_id) {
            task.pending = None;
        }
    }

    /// Apply a stage result: append, advance, release the pending mark.
    ///
    /// Safe under at-least-once redelivery -- a result with no dispatch
    /// outstanding is reported as [`AdvanceOutcome::Duplicate`] and
    /// leaves the record untouched.
    pub fn advance(&self, task_id: u64, result: String) -> AdvanceOutcome {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return AdvanceOutcome::UnknownTask;
        };
        if task.finished {
            return AdvanceOutcome::AlreadyFinished;
        }
        let Some(pending) = task.pending.take() else {
            return AdvanceOutcome::Duplicate;
        };

        let stage = task.current_stage;
        task.results.push(result);
        task.current_stage += 1;
        if task.current_stage == task.subtasks.len() {
            task.finished = true;
        }
        debug_assert_eq!(task.results.len(), task.current_stage);

        AdvanceOutcome::Advanced {
            stage,
            finished: task.finished,
            worker_id: pending.worker_id,
        }
    }

    /// Release every dispatch older than `timeout`, returning the
    /// affected `(task_id, worker_id)` pairs so busy marks can be
    /// cleared.  The stages become ready again on the next scan.
    pub fn expire_pending(&self, timeout: Duration) -> Vec<(u64, String)> {
        let mut expired = Vec::new();
        let now = Instant::now();
        for task in self.lock().values_mut() {
            let timed_out = task
                .pending
                .take_if(|p| now.duration_since(p.dispatched_at) >= timeout);
            if let Some(pending) = timed_out {
                tracing::warn!(
                    task_id = task.id,
                    stage = task.current_stage,
                    worker_id = %pending.worker_id,
                    "dispatch timed out, stage released for re-dispatch"
                );
                expired.push((task.id, pending.worker_id));
            }
        }
        expired
    }

    /// Whether every tracked task has finished.
    pub fn all_finished(&self) -> bool {
        self.lock().values().all(|t| t.finished)
    }

    /// Snapshot one task.
    pub fn get(&self, task_id: u64) -> Option<TaskSnapshot> {
        self.lock().get(&task_id).map(|t| TaskSnapshot {
            id: t.id,
            source: t.source.clone(),
            subtasks: t.subtasks.clone(),
            results: t.results.clone(),
            current_stage: t.current_stage,
            finished: t.finished,
        })
    }

    /// IDs of all tracked tasks.
    pub fn task_ids(&self) -> Vec<u64> {
        self.lock().keys().copied().collect()
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no tasks are tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

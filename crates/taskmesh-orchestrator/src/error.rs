//! Orchestrator error types.

use taskmesh_kernel::KernelError;
use taskmesh_sync::SyncError;

/// Unified error type for the taskmesh orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The planner could not produce a subtask pipeline.
    #[error("planning failed: {reason}")]
    PlanningFailed { reason: String },

    /// A referenced task is not tracked.
    #[error("unknown task: {task_id}")]
    UnknownTask { task_id: u64 },

    /// A tracker mutation named a stage that is not the task's current
    /// one.
    #[error("invalid stage {stage} for task {task_id}: {reason}")]
    InvalidStage {
        task_id: u64,
        stage: usize,
        reason: String,
    },

    /// A kernel primitive (bus, envelope) failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Context encoding or decoding failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Convenience alias used throughout the orchestrator crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

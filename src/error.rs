//! Typed errors crossing the repository and scheduler seams.
//!
//! Everything else in the crate (binaries, configuration, process handling) reports through
//! `anyhow`, the same way the rest of the code base does.

use thiserror::Error;

use crate::model::RunId;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("run {0} not found")]
    RunNotFound(RunId),
    /// The task does not exist, is no longer active, or belongs to another worker.
    #[error("StaleTask: task {task_id} of run {run_id} is no longer active for this worker")]
    StaleTask { run_id: RunId, task_id: usize },
    #[error("{0}")]
    Forbidden(String),
    #[error("invalid run: {0}")]
    InvalidRun(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("run {0} is already approved")]
    AlreadyApproved(RunId),
    #[error("run {0} cannot be approved by its submitter")]
    SelfApproval(RunId),
    #[error("too much contention on run {0}, giving up")]
    Contention(RunId),
    #[error("invalid username or password")]
    Unauthorized,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl SchedulerError {
    /// Map a repository miss on `run_id` to the scheduler's own not-found error.
    pub(crate) fn from_repository(run_id: RunId, err: RepositoryError) -> SchedulerError {
        match err {
            RepositoryError::NotFound(_) => SchedulerError::RunNotFound(run_id),
            other => SchedulerError::Repository(other),
        }
    }

    pub fn is_stale_task(&self) -> bool {
        matches!(self, SchedulerError::StaleTask { .. })
    }
}

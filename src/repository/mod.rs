//! Persistence contract for runs, the action log and uploaded PGN files.
//!
//! Writers never hold a lock across their own computation: they read a [`Versioned`] run,
//! mutate a copy and write it back with [`RunRepository::compare_and_swap`], which only succeeds
//! if nobody else wrote in between.

mod memory;

use time::OffsetDateTime;

pub use memory::InMemoryRepository;

use crate::{
    action_log::{Action, ActionFilter},
    error::RepositoryError,
    model::{Run, RunArgs, RunId},
};

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Page { skip: 0, limit: 50 }
    }
}

/// Selects finished runs when listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub username: Option<String>,
    pub green_only: bool,
    pub yellow_only: bool,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.username
            .as_ref()
            .map_or(true, |u| *u == run.args.username)
            && (!self.green_only || run.is_green)
            && (!self.yellow_only || run.is_yellow)
    }
}

/// Storage backend of the scheduler.
pub trait RunRepository: Send + Sync {
    /// Store a new run (unapproved, no tasks) and return its id.
    fn create(&self, args: RunArgs, now: OffsetDateTime) -> Result<RunId, RepositoryError>;

    fn get(&self, id: RunId) -> Result<Versioned<Run>, RepositoryError>;

    /// Replace the stored run if its version is still `expected_version`.
    /// Returns `false` on a version conflict.
    fn compare_and_swap(&self, run: Run, expected_version: u64) -> Result<bool, RepositoryError>;

    fn append_action(&self, action: Action) -> Result<(), RepositoryError>;

    /// Most recent first.
    fn list_actions(&self, filter: &ActionFilter, page: Page) -> Result<Vec<Action>, RepositoryError>;

    /// Runs not finished yet, including unapproved ones.
    fn list_unfinished(&self) -> Result<Vec<Versioned<Run>>, RepositoryError>;

    /// Finished, non-deleted runs, most recently updated first, with the total match count.
    fn list_finished(&self, filter: &RunFilter, page: Page) -> Result<(Vec<Run>, usize), RepositoryError>;

    /// Returns `false` if a PGN was already stored for this task.
    fn store_pgn(&self, run_id: RunId, task_id: usize, pgn: Vec<u8>) -> Result<bool, RepositoryError>;

    fn get_pgn(&self, run_id: RunId, task_id: usize) -> Result<Option<Vec<u8>>, RepositoryError>;
}

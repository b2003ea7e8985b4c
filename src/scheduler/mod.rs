//! The task scheduler: hands tasks to workers, folds their results into runs and applies the
//! stopping rules.
//!
//! Every mutation goes through [`TaskScheduler::edit`]: the run is read with its version, a
//! closure edits a private copy, and the copy is written back with compare-and-swap. On a
//! conflict the closure runs again on the fresh run. The closure may therefore run several
//! times and must not have side effects besides the run it is given.

mod admin;
pub mod purge;
pub mod selection;
pub mod submission;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

pub use purge::PurgeOutcome;
pub use submission::{RunModification, RunRequest, StopRuleRequest};

use crate::{
    action_log::{Action, ActionFilter, ActionLog},
    error::SchedulerError,
    model::{Run, RunId, Stats, StopRule, WorkerInfo},
    repository::{Page, RunFilter, RunRepository, Versioned},
    stats::{elo, spsa::SpsaBatch, EloEstimate, SprtDecision},
};

/// Conflicting writes tolerated before an edit gives up.
const MAX_EDIT_ATTEMPTS: usize = 16;
pub const DEFAULT_DEAD_TASK_TIMEOUT: Duration = Duration::from_secs(360);

/// Outcome of an edit closure: write the run back, or leave it untouched.
pub enum Edit<T> {
    Commit(T),
    Discard(T),
}

/// Authenticated user on whose behalf an administrative operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub username: String,
    pub can_approve: bool,
}

impl Caller {
    pub fn user(username: &str) -> Caller {
        Caller {
            username: username.to_string(),
            can_approve: false,
        }
    }

    pub fn approver(username: &str) -> Caller {
        Caller {
            username: username.to_string(),
            can_approve: true,
        }
    }

    pub fn can_modify(&self, run: &Run) -> bool {
        self.can_approve || self.username == run.args.username
    }
}

/// What a worker receives from `request_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// The run, without its task list.
    pub run: Run,
    pub task_id: usize,
    pub num_games: u32,
    pub threads: u32,
    pub start: u32,
}

impl TaskAssignment {
    fn new(run: &Run, task_id: usize) -> TaskAssignment {
        let task = &run.tasks[task_id];
        TaskAssignment {
            run: run.without_tasks(),
            task_id,
            num_games: task.num_games,
            threads: task.threads,
            start: task.start,
        }
    }
}

/// Result of one SPSA batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpsaResult {
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub num_games: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// `false` once the worker should stop playing this task.
    pub task_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprtReport {
    pub llr: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub elo0: f64,
    pub elo1: f64,
    pub state: Option<SprtDecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloReport {
    pub run_id: RunId,
    pub results: Stats,
    pub elo: Option<EloEstimate>,
    pub sprt: Option<SprtReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub username: String,
    pub new_tag: String,
    pub base_tag: String,
    pub tc: String,
    pub threads: u32,
    pub priority: i32,
    pub approved: bool,
    pub stop_rule: String,
    pub num_games: u32,
    pub results: Stats,
    pub elo: Option<EloEstimate>,
    pub llr: Option<f64>,
    pub spsa_iter: Option<u64>,
    pub active_tasks: usize,
    pub cores: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub username: String,
    pub unique_key: String,
    pub concurrency: u32,
    pub run_id: RunId,
    pub task_id: usize,
    pub nps: f64,
}

/// Snapshot of the unfinished runs and of the busy machines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub runs: Vec<RunSummary>,
    pub machines: Vec<MachineSummary>,
    pub cores: u32,
    pub pending_games: u64,
}

/// Stop condition of the run's rule is met.
fn completion_reached(run: &Run) -> bool {
    match &run.args.stop_rule {
        StopRule::Sprt(sprt) if sprt.state.is_some() => true,
        StopRule::Spsa(spsa) if spsa.is_finished() => true,
        _ => run.all_games_done(),
    }
}

/// Deactivate tasks that are dead or still held by a worker asking for new work.
fn release_tasks(run: &mut Run, worker: &WorkerInfo, now: OffsetDateTime, timeout: Duration) -> bool {
    let deadline = now - timeout;
    let mut changed = false;
    for (task_id, task) in run.tasks.iter_mut().enumerate().filter(|(_, t)| t.active) {
        let dead = task.last_updated < deadline;
        if dead || task.worker_info.unique_key == worker.unique_key {
            info!(run = %run.id, task_id, holder = %task.worker_info.unique_key, dead, "Releasing task");
            task.active = false;
            task.spsa = None;
            changed = true;
        }
    }
    changed
}

fn needs_release(run: &Run, worker: &WorkerInfo, now: OffsetDateTime, timeout: Duration) -> bool {
    let deadline = now - timeout;
    run.tasks.iter().any(|task| {
        task.active && (task.last_updated < deadline || task.worker_info.unique_key == worker.unique_key)
    })
}

pub struct TaskScheduler<R: RunRepository> {
    repository: Arc<R>,
    actions: ActionLog<R>,
    dead_task_timeout: Duration,
    rng: Mutex<StdRng>,
}

impl<R: RunRepository> TaskScheduler<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            actions: ActionLog::new(Arc::clone(&repository)),
            repository,
            dead_task_timeout: DEFAULT_DEAD_TASK_TIMEOUT,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    #[must_use]
    pub fn with_dead_task_timeout(self, dead_task_timeout: Duration) -> Self {
        Self {
            dead_task_timeout,
            ..self
        }
    }

    /// Seed the SPSA perturbations, for reproducible runs.
    #[must_use]
    pub fn with_rng_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn action_log(&self) -> &ActionLog<R> {
        &self.actions
    }

    /// Optimistic read-modify-write of one run.
    pub fn edit<T, F>(&self, run_id: RunId, mut apply: F) -> Result<T, SchedulerError>
    where
        F: FnMut(&mut Run) -> Result<Edit<T>, SchedulerError>,
    {
        for attempt in 0..MAX_EDIT_ATTEMPTS {
            let Versioned { version, value: mut run } = self
                .repository
                .get(run_id)
                .map_err(|e| SchedulerError::from_repository(run_id, e))?;
            match apply(&mut run)? {
                Edit::Discard(value) => return Ok(value),
                Edit::Commit(value) => {
                    if self.repository.compare_and_swap(run, version)? {
                        return Ok(value);
                    }
                    debug!(%run_id, attempt, "Concurrent update, retrying");
                }
            }
        }
        warn!(%run_id, "Giving up after {MAX_EDIT_ATTEMPTS} conflicting writes");
        Err(SchedulerError::Contention(run_id))
    }

    /// Pick the best eligible run for `worker` and give it a task, or `None` if nothing fits.
    #[instrument(skip_all, fields(worker = %worker.unique_key))]
    pub fn request_task(&self, worker: &WorkerInfo) -> Result<Option<TaskAssignment>, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let timeout = self.dead_task_timeout;
        let mut runs = self.repository.list_unfinished()?;

        let stale: Vec<RunId> = runs
            .iter()
            .filter(|v| needs_release(&v.value, worker, now, timeout))
            .map(|v| v.value.id)
            .collect();
        for run_id in &stale {
            self.edit(*run_id, |run| {
                Ok(match release_tasks(run, worker, now, timeout) {
                    true => Edit::Commit(()),
                    false => Edit::Discard(()),
                })
            })?;
        }
        if !stale.is_empty() {
            runs = self.repository.list_unfinished()?;
        }

        let mut candidates: Vec<Run> = runs
            .into_iter()
            .map(|v| v.value)
            .filter(|run| selection::is_eligible(run, worker))
            .collect();
        candidates.sort_by(selection::priority_order);

        for candidate in &candidates {
            let claimed = self.edit(candidate.id, |run| {
                if !selection::is_eligible(run, worker) {
                    return Ok(Edit::Discard(None));
                }
                Ok(match selection::claim_task(run, worker, now) {
                    Some(task_id) => Edit::Commit(Some(TaskAssignment::new(run, task_id))),
                    None => Edit::Discard(None),
                })
            });
            match claimed {
                Ok(Some(assignment)) => {
                    info!(
                        run = %assignment.run.id,
                        task_id = assignment.task_id,
                        games = assignment.num_games,
                        "Task assigned"
                    );
                    return Ok(Some(assignment));
                }
                Ok(None) => {}
                Err(SchedulerError::Contention(run_id)) => warn!(%run_id, "Skipping contended run"),
                Err(err) => return Err(err),
            }
        }
        debug!("No task available");
        Ok(None)
    }

    /// Record the cumulative results of a task and advance the run's stopping rule.
    #[instrument(skip_all, fields(run = %run_id, task_id, worker = %worker.unique_key))]
    pub fn update_task(
        &self,
        run_id: RunId,
        task_id: usize,
        worker: &WorkerInfo,
        stats: Stats,
        spsa: Option<SpsaResult>,
    ) -> Result<TaskStatus, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let (status, finished) = self.edit(run_id, |run| {
            if run.finished || run.deleted {
                return Err(SchedulerError::StaleTask { run_id, task_id });
            }
            let task = match run.tasks.get_mut(task_id) {
                Some(task) if task.is_held_by(&worker.unique_key) => task,
                _ => return Err(SchedulerError::StaleTask { run_id, task_id }),
            };
            if stats.regressed_from(&task.stats) {
                return Err(SchedulerError::InvalidUpdate(format!(
                    "results went backwards: {} after {}",
                    stats, task.stats
                )));
            }
            if stats.games() > task.num_games {
                return Err(SchedulerError::InvalidUpdate(format!(
                    "{} games reported for a task of {}",
                    stats.games(),
                    task.num_games
                )));
            }
            task.stats = stats;
            task.last_updated = now;
            task.worker_info.nps = worker.nps;
            if stats.games() == task.num_games {
                task.active = false;
                task.pending = false;
            }
            let perturbation = if spsa.is_some() { task.spsa.take() } else { None };
            let task_alive = task.active;

            run.last_updated = now;
            let totals = run.results();
            match &mut run.args.stop_rule {
                StopRule::Sprt(sprt) => {
                    if let Some(decision) = sprt.update(&totals) {
                        info!(?decision, llr = sprt.llr, "SPRT decided");
                    }
                }
                StopRule::Spsa(state) => match (spsa, perturbation) {
                    (Some(result), Some(perturbation)) => {
                        state.apply_result(&perturbation, result.wins, result.losses, result.num_games)
                    }
                    (Some(_), None) => warn!("SPSA result without a pending perturbation, ignored"),
                    (None, _) => {}
                },
                StopRule::FixedGames => {}
            }

            if completion_reached(run) {
                self.finish_run(run, now);
            }
            // an auto-purge may have reopened the run and retired this task
            let task_alive = task_alive && !run.finished && run.tasks.get(task_id).is_some_and(|t| t.active);
            Ok(Edit::Commit((TaskStatus { task_alive }, run.finished)))
        })?;
        if finished {
            info!("Run finished");
        }
        Ok(status)
    }

    /// The worker gave up on its task. Unknown, inactive or foreign tasks are ignored, so
    /// repeating the call is harmless.
    #[instrument(skip_all, fields(run = %run_id, task_id, worker = %worker.unique_key))]
    pub fn failed_task(
        &self,
        run_id: RunId,
        task_id: usize,
        worker: &WorkerInfo,
        message: &str,
    ) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let failed = self.edit(run_id, |run| {
            let Some(task) = run.tasks.get_mut(task_id) else {
                return Ok(Edit::Discard(false));
            };
            if !task.is_held_by(&worker.unique_key) {
                return Ok(Edit::Discard(false));
            }
            task.active = false;
            task.failure = Some(message.to_string());
            task.spsa = None;
            task.last_updated = now;
            Ok(Edit::Commit(true))
        })?;
        if failed {
            warn!(message, "Task failed");
        } else {
            debug!("Ignoring failure of a task not held by this worker");
        }
        Ok(())
    }

    /// The worker found the run itself broken (e.g. the engine does not build): the run is
    /// finished as failed.
    #[instrument(skip_all, fields(run = %run_id, task_id, worker = %worker.unique_key))]
    pub fn worker_stop_run(
        &self,
        run_id: RunId,
        task_id: usize,
        worker: &WorkerInfo,
        message: &str,
    ) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let stopped = self.edit(run_id, |run| {
            let held = run
                .tasks
                .get(task_id)
                .is_some_and(|task| task.is_held_by(&worker.unique_key));
            if !held || run.finished {
                return Err(SchedulerError::StaleTask { run_id, task_id });
            }
            run.tasks[task_id].failure = Some(message.to_string());
            run.failed = true;
            run.failure_reason = Some(message.to_string());
            self.finish_run(run, now);
            Ok(Edit::Commit(run.clone()))
        })?;
        warn!(message, "Run stopped by worker");
        self.actions
            .stop_run(&worker.username, &stopped, Some(message.to_string()))?;
        Ok(())
    }

    /// Heartbeat: refresh the task's timestamp if `worker` still holds it.
    pub fn beat(&self, run_id: RunId, task_id: usize, worker: &WorkerInfo) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        self.edit(run_id, |run| match run.tasks.get_mut(task_id) {
            Some(task) if task.is_held_by(&worker.unique_key) => {
                task.last_updated = now;
                Ok(Edit::Commit(()))
            }
            _ => Ok(Edit::Discard(())),
        })
    }

    /// Draw the SPSA perturbation of the next batch and remember it in the task.
    #[instrument(skip_all, fields(run = %run_id, task_id, worker = %worker.unique_key))]
    pub fn request_spsa(
        &self,
        run_id: RunId,
        task_id: usize,
        worker: &WorkerInfo,
    ) -> Result<SpsaBatch, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        self.edit(run_id, |run| {
            if run.finished {
                return Err(SchedulerError::StaleTask { run_id, task_id });
            }
            let Run { args, tasks, .. } = run;
            let task = tasks
                .get_mut(task_id)
                .filter(|task| task.is_held_by(&worker.unique_key))
                .ok_or(SchedulerError::StaleTask { run_id, task_id })?;
            let StopRule::Spsa(spsa) = &args.stop_rule else {
                return Err(SchedulerError::InvalidUpdate(format!("run {run_id} is not an SPSA run")));
            };
            let (perturbation, batch) = {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                spsa.perturb(&mut *rng)
            };
            task.spsa = Some(perturbation);
            task.last_updated = now;
            Ok(Edit::Commit(batch))
        })
    }

    /// Deactivate every task whose worker went silent. Returns the number of runs touched.
    pub fn scavenge(&self) -> Result<usize, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let deadline = now - self.dead_task_timeout;
        let mut touched = 0;
        for versioned in self.repository.list_unfinished()? {
            let run_id = versioned.value.id;
            let has_dead = |run: &Run| run.tasks.iter().any(|t| t.active && t.last_updated < deadline);
            if !has_dead(&versioned.value) {
                continue;
            }
            let released = self.edit(run_id, |run| {
                let mut released = false;
                for task in run.tasks.iter_mut().filter(|t| t.active && t.last_updated < deadline) {
                    task.active = false;
                    task.spsa = None;
                    released = true;
                }
                Ok(if released { Edit::Commit(true) } else { Edit::Discard(false) })
            })?;
            if released {
                info!(%run_id, "Released dead tasks");
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Mark `run` finished: tasks stop, outcome flags are set and, if asked for, the run is
    /// purged. A purge that undoes the stop condition revives the run.
    fn finish_run(&self, run: &mut Run, now: OffsetDateTime) {
        for task in &mut run.tasks {
            task.active = false;
            task.pending = false;
            task.spsa = None;
        }
        run.finished = true;
        run.last_updated = now;
        run.refresh_outcome_flags();

        if run.failed || !run.args.auto_purge || run.args.stop_rule.spsa().is_some() {
            return;
        }
        match purge::purge(run, purge::AUTO_PURGE_P, purge::AUTO_PURGE_RESIDUAL, now) {
            PurgeOutcome::Purged { bad_tasks } if !completion_reached(run) => {
                info!(run = %run.id, bad_tasks, "Auto-purge reopened the run");
                run.finished = false;
                run.is_green = false;
                run.is_yellow = false;
            }
            PurgeOutcome::Purged { bad_tasks } => info!(run = %run.id, bad_tasks, "Auto-purged"),
            PurgeOutcome::Declined(reason) => debug!(run = %run.id, reason, "Nothing to auto-purge"),
        }
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Run, SchedulerError> {
        self.repository
            .get(run_id)
            .map(|v| v.value)
            .map_err(|e| SchedulerError::from_repository(run_id, e))
    }

    pub fn get_elo(&self, run_id: RunId) -> Result<EloReport, SchedulerError> {
        let run = self.get_run(run_id)?;
        let results = run.results();
        let sprt = run.args.stop_rule.sprt().map(|sprt| SprtReport {
            llr: sprt.llr,
            lower_bound: sprt.lower_bound(),
            upper_bound: sprt.upper_bound(),
            elo0: sprt.elo0,
            elo1: sprt.elo1,
            state: sprt.state,
        });
        Ok(EloReport {
            run_id,
            results,
            elo: elo::estimate(&results),
            sprt,
        })
    }

    pub fn finished_runs(&self, filter: &RunFilter, page: Page) -> Result<(Vec<Run>, usize), SchedulerError> {
        Ok(self.repository.list_finished(filter, page)?)
    }

    pub fn actions(&self, filter: &ActionFilter, page: Page) -> Result<Vec<Action>, SchedulerError> {
        Ok(self.actions.list(filter, page)?)
    }

    /// Summary of the unfinished runs, in scheduling order.
    pub fn summarize(&self) -> Result<FleetSummary, SchedulerError> {
        let mut runs: Vec<Run> = self
            .repository
            .list_unfinished()?
            .into_iter()
            .map(|v| v.value)
            .collect();
        runs.sort_by(selection::priority_order);

        let mut summary = FleetSummary::default();
        for run in &runs {
            let results = run.results();
            let active: Vec<(usize, &crate::model::Task)> =
                run.tasks.iter().enumerate().filter(|(_, t)| t.active).collect();
            summary.machines.extend(active.iter().map(|(task_id, task)| MachineSummary {
                username: task.worker_info.username.clone(),
                unique_key: task.worker_info.unique_key.clone(),
                concurrency: task.worker_info.concurrency,
                run_id: run.id,
                task_id: *task_id,
                nps: task.worker_info.nps,
            }));
            let cores = run.active_cores();
            summary.cores += cores;
            if run.approved {
                summary.pending_games += u64::from(run.args.num_games.saturating_sub(results.games()));
            }
            summary.runs.push(RunSummary {
                id: run.id,
                username: run.args.username.clone(),
                new_tag: run.args.new_tag.clone(),
                base_tag: run.args.base_tag.clone(),
                tc: run.args.tc.clone(),
                threads: run.args.threads,
                priority: run.args.priority,
                approved: run.approved,
                stop_rule: run.args.stop_rule.name().to_string(),
                num_games: run.args.num_games,
                results,
                elo: elo::estimate(&results),
                llr: run.args.stop_rule.sprt().map(|sprt| sprt.llr),
                spsa_iter: run.args.stop_rule.spsa().map(|spsa| spsa.iter),
                active_tasks: active.len(),
                cores,
            });
        }
        Ok(summary)
    }
}

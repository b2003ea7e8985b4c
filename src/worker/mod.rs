//! # Worker
//!
//! The agent running on every benchmark machine. It polls the scheduler for a task, plays it
//! in batches through a [`GameRunner`], reports the results after each batch and goes back
//! to polling.
//!
//! Two threads share a [`SharedState`]:
//! - the main loop, which owns the current task;
//! - the heartbeat, which tells the scheduler every [`HEARTBEAT_INTERVAL`] that the current
//!   task is still being worked on.
//!
//! Failures are classified by [`Severity`]: a broken run is stopped, a local problem gives
//! the task back and waits with an exponential [`Backoff`], and anything fatal or
//! unexplained stops the worker. In fleet mode the first failure stops the worker too.
//!
//! The worker stops with exit code 0 only when the file [`STOP_FILE`] appears in its
//! directory.

mod backoff;
pub mod client;
pub mod config;
mod error;
pub mod expression;
mod lock;
mod process;
pub mod runner;
mod state;
pub mod system;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error, info, instrument, warn};

pub use backoff::Backoff;
pub use client::{ClientError, HttpSchedulerClient, SchedulerClient};
pub use error::{Severity, WorkerError};
pub use lock::LockFile;
pub use process::{ManagedProcess, ProcessOutcome};
pub use runner::{Batch, BatchOutcome, GameRunner, ProcessGameRunner};
pub use state::{CurrentTask, SharedState};

use crate::{
    model::{RateLimit, RunId, Stats, WorkerInfo},
    scheduler::{SpsaResult, TaskAssignment},
};

/// Protocol version spoken by this worker.
pub const WORKER_VERSION: u32 = 1;
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const INITIAL_RETRY: Duration = Duration::from_secs(15);
pub const MAX_RETRY: Duration = Duration::from_secs(900);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(15);
pub const STOP_FILE: &str = "gauntlet.exit";
pub const LOCK_FILE: &str = "worker.lock";

/// Reported when the GitHub quota cannot be fetched.
const UNKNOWN_RATE: RateLimit = RateLimit {
    remaining: 0,
    limit: 5000,
};

/// Why the worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    StopFile,
    Interrupted,
    Fatal(String),
    /// Fleet mode gave up on the first failure.
    Fleet(String),
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::StopFile => 0,
            _ => 1,
        }
    }
}

/// Installs a newer worker.
pub trait Updater: Send {
    /// `Ok(true)` when this process now speaks `version`, `Ok(false)` when a restart is
    /// needed to pick it up.
    fn update(&mut self, version: u32) -> anyhow::Result<bool>;
}

/// For deployments where the fleet tooling replaces the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpdater;

impl Updater for NoUpdater {
    fn update(&mut self, version: u32) -> anyhow::Result<bool> {
        info!(version, "A newer worker is available");
        Ok(false)
    }
}

enum Iteration {
    Success,
    /// Non-fatal failure: wait, or give up in fleet mode.
    Retry(String),
    Stop(ExitReason),
}

pub fn build_worker_info(config: &config::WorkerConfig, unique_key: String) -> WorkerInfo {
    WorkerInfo {
        unique_key,
        username: config.username.clone(),
        concurrency: config.concurrency,
        max_memory: config.max_memory,
        min_threads: config.min_threads,
        version: WORKER_VERSION,
        compiler: config.compiler.name.clone(),
        compiler_version: config.compiler.version,
        uname: system::uname(),
        architecture: system::architecture(),
        ..WorkerInfo::default()
    }
}

/// Confirms the credentials with the scheduler. Only a rejection is an error: when the
/// scheduler cannot be reached the main loop will retry anyway.
pub fn verify_credentials<C: SchedulerClient + ?Sized>(client: &C, worker: &WorkerInfo) -> Result<(), WorkerError> {
    info!(username = %worker.username, "Confirming credentials");
    match client.request_version(worker) {
        Ok(_) => Ok(()),
        Err(ClientError::Transport(e)) => {
            warn!("Unable to confirm the credentials: {e}");
            Ok(())
        }
        Err(e) => Err(WorkerError::fatal(format!("Invalid credentials: {e}"))),
    }
}

/// Games per batch: whole SPRT batches (or game pairs), one per `threads` cores.
pub fn batch_games(assignment: &TaskAssignment, concurrency: u32) -> u32 {
    let unit = assignment
        .run
        .args
        .stop_rule
        .sprt()
        .map_or(2, |sprt| 2 * sprt.batch_size.max(1));
    let slots = (concurrency / assignment.threads.max(1)).max(1);
    unit * slots
}

pub struct WorkerAgent<C, G> {
    client: Arc<C>,
    runner: G,
    worker_info: WorkerInfo,
    state: Arc<SharedState>,
    worker_dir: PathBuf,
    fleet: bool,
    backoff: Backoff,
    updater: Box<dyn Updater>,
    lock: Option<LockFile>,
    heartbeat_interval: Duration,
}

impl<C: SchedulerClient + 'static, G: GameRunner> WorkerAgent<C, G> {
    pub fn new(client: Arc<C>, runner: G, worker_info: WorkerInfo, worker_dir: &Path) -> Self {
        WorkerAgent {
            client,
            runner,
            worker_info,
            state: Arc::new(SharedState::new()),
            worker_dir: worker_dir.to_path_buf(),
            fleet: false,
            backoff: Backoff::default(),
            updater: Box::new(NoUpdater),
            lock: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_fleet(mut self, fleet: bool) -> Self {
        self.fleet = fleet;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The worker stops as soon as this lock no longer names it.
    pub fn with_lock(mut self, lock: LockFile) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_updater(mut self, updater: Box<dyn Updater>) -> Self {
        self.updater = updater;
        self
    }

    pub fn with_state(mut self, state: Arc<SharedState>) -> Self {
        self.state = state;
        self
    }

    /// Handle for whoever needs to stop the worker, e.g. a signal handler.
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    #[instrument(skip_all, fields(unique_key = %self.worker_info.unique_key))]
    pub fn run(mut self) -> ExitReason {
        info!(dir = %self.worker_dir.display(), concurrency = self.worker_info.concurrency, "Worker started");
        let heartbeat = match self.spawn_heartbeat() {
            Ok(handle) => handle,
            Err(e) => return ExitReason::Fatal(format!("{e:#}")),
        };
        let reason = self.main_loop();
        self.state.stop();
        debug!("Waiting for the heartbeat thread to finish");
        join_with_timeout(heartbeat, THREAD_JOIN_TIMEOUT);
        info!(?reason, "Worker stopped");
        reason
    }

    fn spawn_heartbeat(&self) -> anyhow::Result<JoinHandle<()>> {
        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        let worker = self.worker_info.clone();
        let interval = self.heartbeat_interval;
        std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat(client.as_ref(), &worker, &state, interval))
            .context("could not start the heartbeat thread")
    }

    fn main_loop(&mut self) -> ExitReason {
        loop {
            if self.worker_dir.join(STOP_FILE).exists() {
                info!("Stopped by '{STOP_FILE}' file");
                return ExitReason::StopFile;
            }
            if !self.state.is_alive() {
                return ExitReason::Interrupted;
            }
            match self.iteration() {
                Iteration::Success => self.backoff.reset(),
                Iteration::Retry(why) => {
                    if !self.state.is_alive() {
                        return ExitReason::Interrupted;
                    }
                    if self.fleet {
                        warn!("Exiting since fleet mode is on and an error occurred: {why}");
                        return ExitReason::Fleet(why);
                    }
                    let delay = self.backoff.next_delay();
                    info!("{why}. Waiting {} seconds before retrying", delay.as_secs());
                    if !self.state.sleep(delay) {
                        return ExitReason::Interrupted;
                    }
                }
                Iteration::Stop(reason) => return reason,
            }
        }
    }

    fn fatal(&self, message: String) -> Iteration {
        error!("{message}");
        self.state.stop();
        Iteration::Stop(ExitReason::Fatal(message))
    }

    fn iteration(&mut self) -> Iteration {
        if self.lock.as_ref().is_some_and(|lock| !lock.held_by_us()) {
            return self.fatal("Another worker is running in this directory".to_string());
        }

        let rate = match self.client.rate_limit() {
            Ok(rate) if rate.near_worker_limit() => {
                return Iteration::Retry(format!(
                    "Near API limit ({} of {} calls left)",
                    rate.remaining, rate.limit
                ))
            }
            Ok(rate) => rate,
            Err(e) => {
                warn!("Could not fetch the API rate limit: {e}");
                UNKNOWN_RATE
            }
        };
        self.worker_info.rate = Some(rate);

        match self.client.request_version(&self.worker_info) {
            Ok(version) if version > self.worker_info.version => match self.updater.update(version) {
                Ok(true) => {
                    info!(version, "Worker updated");
                    self.worker_info.version = version;
                }
                Ok(false) => return self.fatal(format!("Worker version {version} is required, restart needed")),
                Err(e) => return self.fatal(format!("Update to version {version} failed: {e:#}")),
            },
            Ok(_) => {}
            Err(ClientError::Transport(e)) => return Iteration::Retry(format!("Scheduler unreachable: {e}")),
            Err(e) => return self.fatal(format!("Version check refused: {e}")),
        }

        let assignment = match self.client.request_task(&self.worker_info) {
            Ok(Some(assignment)) => assignment,
            Ok(None) => return Iteration::Retry("No tasks available at this time".to_string()),
            Err(e) => return Iteration::Retry(format!("Could not fetch a task: {e}")),
        };
        self.handle_task(assignment)
    }

    #[instrument(skip_all, fields(run = %assignment.run.id, task = assignment.task_id))]
    fn handle_task(&mut self, assignment: TaskAssignment) -> Iteration {
        let run_id = assignment.run.id;
        let task_id = assignment.task_id;
        let args = &assignment.run.args;
        info!(
            games = assignment.num_games,
            tc = %args.tc,
            threads = args.threads,
            rule = args.stop_rule.name(),
            "Running {} vs {}",
            args.new_tag,
            args.base_tag
        );
        self.state.set_task(run_id, task_id);
        let mut pgn = String::new();
        let result = self.play_task(&assignment, &mut pgn);
        self.state.clear_task();

        let outcome = match result {
            Ok(()) => Iteration::Success,
            Err(err) => self.report_failure(run_id, task_id, err),
        };

        if !pgn.is_empty() && assignment.run.args.stop_rule.spsa().is_none() {
            info!(bytes = pgn.len(), "Uploading PGN");
            if let Err(e) = self.client.upload_pgn(&self.worker_info, run_id, task_id, &pgn) {
                warn!("PGN upload failed: {e}");
            }
        }
        outcome
    }

    fn play_task(&mut self, assignment: &TaskAssignment, pgn: &mut String) -> Result<(), WorkerError> {
        let run_id = assignment.run.id;
        let task_id = assignment.task_id;
        let is_spsa = assignment.run.args.stop_rule.spsa().is_some();
        let per_batch = batch_games(assignment, self.worker_info.concurrency);
        self.runner.prepare(assignment)?;

        let mut totals = Stats::default();
        while totals.games() < assignment.num_games {
            if !self.state.is_alive() {
                return Err(WorkerError::fatal("Interrupted"));
            }
            let spsa = if is_spsa {
                match self.client.request_spsa(&self.worker_info, run_id, task_id) {
                    Ok(batch) => Some(batch),
                    Err(ClientError::StaleTask(message)) => {
                        info!("Task taken away: {message}");
                        return Ok(());
                    }
                    Err(e) => return Err(WorkerError::worker_failure(format!("request_spsa failed: {e}"))),
                }
            } else {
                None
            };

            let batch = Batch {
                assignment,
                games: per_batch.min(assignment.num_games - totals.games()),
                concurrency: self.worker_info.concurrency,
                spsa: spsa.as_ref(),
            };
            let outcome = self.runner.play_batch(&batch, &self.state)?;
            if outcome.stats.games() == 0 {
                return Err(WorkerError::worker_failure("The batch produced no games"));
            }
            totals.add(&outcome.stats);
            pgn.push_str(&outcome.pgn);

            let spsa_result = spsa.map(|_| SpsaResult {
                wins: outcome.stats.wins,
                losses: outcome.stats.losses,
                draws: outcome.stats.draws,
                num_games: outcome.stats.games(),
            });
            match self
                .client
                .update_task(&self.worker_info, run_id, task_id, totals, spsa_result)
            {
                Ok(status) if !status.task_alive => {
                    info!(%totals, "Task done");
                    return Ok(());
                }
                Ok(_) => debug!(%totals, "Task updated"),
                Err(ClientError::StaleTask(message)) => {
                    info!("Task taken away: {message}");
                    return Ok(());
                }
                Err(e) => return Err(WorkerError::worker_failure(format!("update_task failed: {e}"))),
            }
        }
        Ok(())
    }

    fn report_failure(&mut self, run_id: RunId, task_id: usize, err: WorkerError) -> Iteration {
        let interrupted = !self.state.is_alive();
        error!(severity = ?err.severity, "Task failed: {err}");
        let reported = match err.severity {
            Severity::RunFailure => self.client.stop_run(&self.worker_info, run_id, task_id, &err.message),
            Severity::Fatal | Severity::WorkerFailure | Severity::Unclassified => {
                self.client
                    .failed_task(&self.worker_info, run_id, task_id, &err.message)
            }
        };
        if let Err(e) = reported {
            warn!("Could not inform the scheduler: {e}");
        }
        if !err.stops_worker() {
            return Iteration::Retry(err.message);
        }
        self.state.stop();
        Iteration::Stop(if interrupted {
            ExitReason::Interrupted
        } else {
            ExitReason::Fatal(err.message)
        })
    }
}

/// Beats for the current task every `interval` until the worker stops. Errors are logged
/// and otherwise ignored.
fn heartbeat<C: SchedulerClient + ?Sized>(client: &C, worker: &WorkerInfo, state: &SharedState, interval: Duration) {
    debug!("Heartbeat started");
    while state.sleep(interval) {
        let Some(task) = state.current_task() else {
            debug!("No task, skipping heartbeat");
            continue;
        };
        match client.beat(worker, task.run_id, task.task_id) {
            Ok(()) => debug!(run = %task.run_id, task = task.task_id, "Heartbeat sent"),
            Err(e) => warn!("Heartbeat failed: {e}"),
        }
    }
    debug!("Heartbeat stopped");
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Heartbeat thread did not stop in time");
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if handle.join().is_err() {
        warn!("Heartbeat thread panicked");
    }
}

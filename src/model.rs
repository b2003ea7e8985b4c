//! Runs, tasks and the worker descriptor shared by the scheduler, the HTTP API and the worker.
//!
//! A [`Run`] compares a *new* program variant against a *base* variant. Its games are split
//! into [`Task`]s, each claimed by one worker at a time. The stopping rule of a run is carried
//! by [`StopRule`]: exactly one of fixed games, SPRT or SPSA is active, and the type system
//! enforces it.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::stats::{
    elo,
    spsa::{Perturbation, SpsaRun},
    sprt::{SprtDecision, SprtState},
};

/// Upper bound on the number of games a run may request.
pub const MAX_GAMES: u32 = 3_200_000;

/// Identifier of a run, allocated by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(RunId)
    }
}

/// Game counters of a task (or of a whole run once summed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    #[serde(default)]
    pub crashes: u32,
    #[serde(default)]
    pub time_losses: u32,
}

impl Stats {
    pub fn new(wins: u32, losses: u32, draws: u32) -> Stats {
        Stats {
            wins,
            losses,
            draws,
            ..Stats::default()
        }
    }

    /// Number of games played.
    pub fn games(&self) -> u32 {
        self.wins + self.losses + self.draws
    }

    pub fn add(&mut self, other: &Stats) {
        self.wins += other.wins;
        self.losses += other.losses;
        self.draws += other.draws;
        self.crashes += other.crashes;
        self.time_losses += other.time_losses;
    }

    /// True if any counter is lower than in `previous`.
    pub fn regressed_from(&self, previous: &Stats) -> bool {
        self.wins < previous.wins
            || self.losses < previous.losses
            || self.draws < previous.draws
            || self.crashes < previous.crashes
            || self.time_losses < previous.time_losses
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}-L{}-D{}", self.wins, self.losses, self.draws)
    }
}

/// The stopping rule of a run. Exactly one is active per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StopRule {
    /// Play `args.num_games` and stop.
    FixedGames,
    /// Stop as soon as the sequential test reaches a decision.
    Sprt(SprtState),
    /// Online parameter tuning, stops after `num_iter` iterations.
    Spsa(SpsaRun),
}

impl StopRule {
    pub fn name(&self) -> &'static str {
        match self {
            StopRule::FixedGames => "num_games",
            StopRule::Sprt(_) => "sprt",
            StopRule::Spsa(_) => "spsa",
        }
    }

    pub fn sprt(&self) -> Option<&SprtState> {
        match self {
            StopRule::Sprt(sprt) => Some(sprt),
            _ => None,
        }
    }

    pub fn spsa(&self) -> Option<&SpsaRun> {
        match self {
            StopRule::Spsa(spsa) => Some(spsa),
            _ => None,
        }
    }
}

/// Immutable description of a run, fixed at submission (except for the few fields
/// `modify_run` may change: game count, priority, throughput and auto-purge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    pub base_tag: String,
    pub new_tag: String,
    pub resolved_base: String,
    pub resolved_new: String,
    pub base_signature: String,
    pub new_signature: String,
    pub base_options: String,
    pub new_options: String,
    pub tc: String,
    pub new_tc: String,
    pub book: String,
    pub book_depth: u32,
    pub threads: u32,
    pub priority: i32,
    pub throughput: u32,
    pub num_games: u32,
    pub username: String,
    pub tests_repo: String,
    pub info: String,
    pub auto_purge: bool,
    pub adjudication: bool,
    pub stop_rule: StopRule,
}

/// Per-connection description of a worker. Rebuilt by the worker on every poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub unique_key: String,
    pub username: String,
    pub concurrency: u32,
    /// MiB the worker may use for engine hash tables.
    pub max_memory: u64,
    pub min_threads: u32,
    pub version: u32,
    #[serde(default)]
    pub compiler: String,
    #[serde(default)]
    pub compiler_version: (u32, u32, u32),
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub rate: Option<RateLimit>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub nps: f64,
}

/// Snapshot of the worker's GitHub API quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub remaining: u32,
    pub limit: u32,
}

impl RateLimit {
    /// Threshold used by the worker itself before polling for work.
    pub fn near_worker_limit(&self) -> bool {
        f64::from(self.remaining) < f64::from(self.limit).sqrt()
    }

    /// Threshold used by the scheduler: such workers only get runs they already have sources for.
    pub fn near_scheduler_limit(&self) -> bool {
        f64::from(self.remaining) <= 2.0 * f64::from(self.limit).sqrt()
    }
}

/// A bounded slice of a run's games.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub num_games: u32,
    pub threads: u32,
    /// Index of the first game of this task within the run (used for opening selection).
    pub start: u32,
    pub active: bool,
    /// Games are still owed for this task.
    pub pending: bool,
    #[serde(default)]
    pub bad: bool,
    pub worker_info: WorkerInfo,
    pub stats: Stats,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub failure: Option<String>,
    /// SPSA perturbation handed out to the current holder, consumed by its next update.
    #[serde(default)]
    pub spsa: Option<Perturbation>,
}

impl Task {
    pub fn new(
        num_games: u32,
        threads: u32,
        start: u32,
        worker_info: WorkerInfo,
        now: OffsetDateTime,
    ) -> Task {
        Task {
            num_games,
            threads,
            start,
            active: true,
            pending: true,
            bad: false,
            worker_info,
            stats: Stats::default(),
            last_updated: now,
            failure: None,
            spsa: None,
        }
    }

    /// The task is active and claimed by the worker with this key.
    pub fn is_held_by(&self, unique_key: &str) -> bool {
        self.active && self.pending && self.worker_info.unique_key == unique_key
    }

    /// Inactive but still owing games: can be handed to another worker.
    pub fn is_reassignable(&self) -> bool {
        !self.active && self.pending && !self.bad
    }
}

/// A task removed by purge, kept for the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgedTask {
    pub task_id: usize,
    pub task: Task,
}

/// Lifecycle of a run, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Submitted, waiting for approval.
    Pending,
    Running,
    FinishedSuccess,
    FinishedFailure,
    FinishedFixed,
    Deleted,
}

/// One benchmark campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub args: RunArgs,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub approved: bool,
    #[serde(default)]
    pub approver: Option<String>,
    pub finished: bool,
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub deleted: bool,
    pub is_green: bool,
    pub is_yellow: bool,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub bad_tasks: Vec<PurgedTask>,
}

impl Run {
    pub fn new(id: RunId, args: RunArgs, now: OffsetDateTime) -> Run {
        Run {
            id,
            args,
            start_time: now,
            last_updated: now,
            approved: false,
            approver: None,
            finished: false,
            failed: false,
            failure_reason: None,
            deleted: false,
            is_green: false,
            is_yellow: false,
            tasks: vec![],
            bad_tasks: vec![],
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.deleted {
            return RunStatus::Deleted;
        }
        if !self.finished {
            return if self.approved {
                RunStatus::Running
            } else {
                RunStatus::Pending
            };
        }
        if self.failed {
            return RunStatus::FinishedFailure;
        }
        match self.args.stop_rule.sprt().and_then(|sprt| sprt.state) {
            Some(SprtDecision::Accepted) => RunStatus::FinishedSuccess,
            Some(SprtDecision::Rejected) => RunStatus::FinishedFailure,
            None => RunStatus::FinishedFixed,
        }
    }

    /// Aggregate results of all tasks that were not purged.
    pub fn results(&self) -> Stats {
        let mut total = Stats::default();
        for task in self.tasks.iter().filter(|t| !t.bad) {
            total.add(&task.stats);
        }
        total
    }

    /// Games handed out to tasks so far. Games of purged tasks go back to the pool.
    pub fn allocated_games(&self) -> u32 {
        self.tasks.iter().filter(|t| !t.bad).map(|t| t.num_games).sum()
    }

    /// Opening offset of the next task: past every task ever carved, purged ones included.
    pub fn next_start(&self) -> u32 {
        self.tasks.iter().map(|t| t.start + t.num_games).max().unwrap_or(0)
    }

    pub fn unallocated_games(&self) -> u32 {
        self.args.num_games.saturating_sub(self.allocated_games())
    }

    /// Cores currently busy on this run.
    pub fn active_cores(&self) -> u32 {
        self.tasks
            .iter()
            .filter(|t| t.active)
            .map(|t| t.worker_info.concurrency)
            .sum()
    }

    /// Every game was allocated and no task is running or owed.
    pub fn all_games_done(&self) -> bool {
        self.unallocated_games() == 0 && !self.tasks.iter().any(|t| t.active || t.pending)
    }

    /// Copy of the run without its task list, as stored in the audit trail.
    pub fn without_tasks(&self) -> Run {
        Run {
            tasks: vec![],
            bad_tasks: vec![],
            ..self.clone()
        }
    }

    /// Recompute `is_green` / `is_yellow` from the current results.
    pub fn refresh_outcome_flags(&mut self) {
        self.is_green = false;
        self.is_yellow = false;
        let results = self.results();
        match &self.args.stop_rule {
            StopRule::Sprt(sprt) => match sprt.state {
                Some(SprtDecision::Accepted) => self.is_green = true,
                Some(SprtDecision::Rejected) => self.is_yellow = results.wins > results.losses,
                None => {}
            },
            StopRule::FixedGames => {
                if let Some(estimate) = elo::estimate(&results) {
                    if estimate.elo - estimate.margin > 0.0 {
                        self.is_green = true;
                    } else if estimate.elo > 0.0 {
                        self.is_yellow = true;
                    }
                }
            }
            StopRule::Spsa(_) => {}
        }
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    pub(crate) fn args(stop_rule: StopRule) -> RunArgs {
        RunArgs {
            base_tag: "master".into(),
            new_tag: "patch".into(),
            resolved_base: "aaaa".into(),
            resolved_new: "bbbb".into(),
            base_signature: "123".into(),
            new_signature: "456".into(),
            base_options: "Hash=16".into(),
            new_options: "Hash=16".into(),
            tc: "10+0.1".into(),
            new_tc: "10+0.1".into(),
            book: "book.epd".into(),
            book_depth: 8,
            threads: 1,
            priority: 0,
            throughput: 100,
            num_games: 1000,
            username: "alice".into(),
            tests_repo: "https://example.org/repo".into(),
            info: "test".into(),
            auto_purge: false,
            adjudication: true,
            stop_rule,
        }
    }

    #[test]
    fn test_results_skip_bad_tasks() {
        let now = OffsetDateTime::now_utc();
        let mut run = Run::new(RunId(1), args(StopRule::FixedGames), now);
        let mut good = Task::new(100, 1, 0, WorkerInfo::default(), now);
        good.stats = Stats::new(10, 5, 5);
        let mut bad = Task::new(100, 1, 100, WorkerInfo::default(), now);
        bad.stats = Stats::new(50, 0, 0);
        bad.bad = true;
        run.tasks = vec![good, bad];

        assert_eq!(run.results(), Stats::new(10, 5, 5));
        assert_eq!(run.allocated_games(), 100);
        assert_eq!(run.unallocated_games(), 900);
        assert_eq!(run.next_start(), 200);
    }

    #[test]
    fn test_status_transitions() {
        let now = OffsetDateTime::now_utc();
        let mut run = Run::new(RunId(1), args(StopRule::FixedGames), now);
        assert_eq!(run.status(), RunStatus::Pending);
        run.approved = true;
        assert_eq!(run.status(), RunStatus::Running);
        run.finished = true;
        assert_eq!(run.status(), RunStatus::FinishedFixed);
        run.deleted = true;
        assert_eq!(run.status(), RunStatus::Deleted);
    }

    #[test]
    fn test_stats_regression() {
        let before = Stats::new(3, 2, 1);
        assert!(!Stats::new(3, 2, 2).regressed_from(&before));
        assert!(Stats::new(2, 3, 3).regressed_from(&before));
    }

    #[test]
    fn test_rate_limit_thresholds() {
        let rate = RateLimit {
            remaining: 100,
            limit: 5000,
        };
        // sqrt(5000) ~ 70.7
        assert!(!rate.near_worker_limit());
        assert!(rate.near_scheduler_limit());
    }
}

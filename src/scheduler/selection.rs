//! Which run a worker gets, and how many games it is handed.

use std::cmp::Ordering;

use time::OffsetDateTime;

use crate::model::{Run, StopRule, Task, WorkerInfo, MAX_GAMES};

/// Wall-clock seconds a task should keep one slot busy.
const TASK_SECONDS: f64 = 30.0 * 60.0;
/// Moves per game used for the duration estimate.
const MOVES_PER_GAME: f64 = 68.0;
/// Slowdown of the workers relative to the nominal time control.
const TIME_SCALE: f64 = 2.0 * 0.92;
/// Fallback when a time control cannot be parsed.
const DEFAULT_GAME_SECONDS: f64 = 60.0;
const SPSA_CORE_BUDGET: f64 = 40_000.0;

/// Estimated wall-clock seconds of one game at time control `tc`
/// (`moves/base+increment`, `base+increment`, or `mm:ss` base).
pub fn estimate_game_duration(tc: &str) -> Option<f64> {
    let clock = tc.rsplit('/').next()?;
    let (base, increment) = match clock.split_once('+') {
        Some((base, increment)) => (base, increment.parse::<f64>().ok()?),
        None => (clock, 0.0),
    };
    let base = match base.split_once(':') {
        Some((minutes, seconds)) => minutes.parse::<f64>().ok()? * 60.0 + seconds.parse::<f64>().ok()?,
        None => base.parse::<f64>().ok()?,
    };
    Some((base + increment * MOVES_PER_GAME) * TIME_SCALE)
}

/// Game count unit of a run: tasks and worker batches are multiples of it.
pub fn batch_games(run: &Run) -> u32 {
    match &run.args.stop_rule {
        StopRule::Sprt(sprt) => sprt.batch_games(),
        _ => 2,
    }
}

/// Games to hand a worker for a new task of `run`, before capping at the unallocated games.
/// A clock too short to estimate yields `MAX_GAMES` games per slot.
pub fn worker_cap(run: &Run, worker: &WorkerInfo) -> u64 {
    let slots = u64::from((worker.concurrency / run.args.threads.max(1)).max(1));
    let duration = estimate_game_duration(&run.args.tc).unwrap_or(DEFAULT_GAME_SECONDS);
    let per_slot = (TASK_SECONDS / duration).floor().clamp(1.0, f64::from(MAX_GAMES)) as u64;
    let unit = u64::from(batch_games(run));
    slots.saturating_mul(per_slot).div_ceil(unit).saturating_mul(unit)
}

/// MiB of hash the value of `Hash=<n>` in an option string asks for.
fn hash_option(options: &str) -> u64 {
    options
        .split_whitespace()
        .filter_map(|option| option.strip_prefix("Hash="))
        .find_map(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Hash memory a worker needs to run `run` on all its slots.
pub fn memory_need(run: &Run, worker: &WorkerInfo) -> u64 {
    let slots = u64::from((worker.concurrency / run.args.threads.max(1)).max(1));
    (hash_option(&run.args.new_options) + hash_option(&run.args.base_options)) * slots
}

/// Whether `run` can hand work to `worker` right now.
pub fn is_eligible(run: &Run, worker: &WorkerInfo) -> bool {
    if run.finished || run.deleted || !run.approved {
        return false;
    }
    if run.args.threads > worker.concurrency || run.args.threads < worker.min_threads {
        return false;
    }
    if memory_need(run, worker) > worker.max_memory {
        return false;
    }
    let has_work = run.unallocated_games() > 0 || run.tasks.iter().any(Task::is_reassignable);
    if !has_work {
        return false;
    }
    if let StopRule::Spsa(spsa) = &run.args.stop_rule {
        let cap = SPSA_CORE_BUDGET / (spsa.params.len().max(1) as f64).sqrt();
        if f64::from(run.active_cores()) > cap {
            return false;
        }
    }
    // sources of runs already worked on are cached by the worker
    if worker.rate.is_some_and(|rate| rate.near_scheduler_limit()) {
        return run
            .tasks
            .iter()
            .any(|task| task.worker_info.unique_key == worker.unique_key);
    }
    true
}

/// Scheduling order: higher priority first, then the least loaded run relative to its
/// throughput, then the oldest, then the smallest id.
pub fn priority_order(a: &Run, b: &Run) -> Ordering {
    let load = |run: &Run, other: &Run| {
        u64::from(run.active_cores()) * u64::from(other.args.throughput.max(1))
    };
    b.args
        .priority
        .cmp(&a.args.priority)
        .then_with(|| load(a, b).cmp(&load(b, a)))
        .then_with(|| a.start_time.cmp(&b.start_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// Give `worker` a task of `run`: reuse an abandoned pending task or carve a new one out of
/// the unallocated games. Returns the task index.
pub fn claim_task(run: &mut Run, worker: &WorkerInfo, now: OffsetDateTime) -> Option<usize> {
    if let Some(task_id) = run.tasks.iter().position(Task::is_reassignable) {
        let task = &mut run.tasks[task_id];
        // the new holder replays the task from scratch
        task.active = true;
        task.worker_info = worker.clone();
        task.stats = Default::default();
        task.failure = None;
        task.spsa = None;
        task.last_updated = now;
        return Some(task_id);
    }
    let remaining = run.unallocated_games();
    if remaining == 0 {
        return None;
    }
    let num_games = u32::try_from(worker_cap(run, worker).min(u64::from(remaining))).unwrap_or(remaining);
    let start = run.next_start();
    run.tasks.push(Task::new(
        num_games,
        run.args.threads,
        start,
        worker.clone(),
        now,
    ));
    Some(run.tasks.len() - 1)
}

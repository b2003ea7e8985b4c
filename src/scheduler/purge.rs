//! Removal of statistically suspicious results from a finished run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::{
    model::{PurgedTask, Run, StopRule, Task},
    stats::chi2,
};

/// Thresholds used when a run with `auto_purge` finishes.
pub const AUTO_PURGE_P: f64 = 0.001;
pub const AUTO_PURGE_RESIDUAL: f64 = 7.0;
/// Relaxed thresholds of a purge requested by an approver.
pub const MANUAL_PURGE_P: f64 = 0.01;
pub const MANUAL_PURGE_RESIDUAL: f64 = 4.5;

/// Share of crashes and time losses above which a task is discarded outright.
const MAX_CRASH_RATE: f64 = 0.03;
const MAX_AGE: Duration = Duration::days(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeOutcome {
    Purged { bad_tasks: usize },
    Declined(String),
}

fn crashed_or_timed_out(task: &Task) -> bool {
    let games = task.stats.games();
    games > 0 && f64::from(task.stats.crashes + task.stats.time_losses) / f64::from(games) > MAX_CRASH_RATE
}

/// Worker whose results stand out the most, provided the run's W/L/D table is not
/// homogeneous across workers (`p < p_threshold`) and that worker's largest adjusted
/// residual exceeds `residual_threshold`.
fn find_bad_worker(
    tasks: &[Task],
    excluded: &BTreeSet<usize>,
    p_threshold: f64,
    residual_threshold: f64,
) -> Option<String> {
    let mut table: BTreeMap<String, [f64; 3]> = BTreeMap::new();
    for (task_id, task) in tasks.iter().enumerate() {
        if task.bad || excluded.contains(&task_id) {
            continue;
        }
        let row = table.entry(task.worker_info.unique_key.clone()).or_default();
        row[0] += f64::from(task.stats.wins);
        row[1] += f64::from(task.stats.losses);
        row[2] += f64::from(task.stats.draws);
    }
    let report = chi2::independence_test(&table);
    let (worker, residual) = report.worst()?;
    if report.p >= p_threshold || residual <= residual_threshold {
        return None;
    }
    info!(%worker, residual, p = report.p, "Bad worker found");
    Some(worker.to_string())
}

/// Flag the outlying tasks of a finished run as bad and recompute its statistics.
/// `finished` is left as it is.
pub fn purge(run: &mut Run, p_threshold: f64, residual_threshold: f64, now: OffsetDateTime) -> PurgeOutcome {
    if !run.finished {
        return PurgeOutcome::Declined("Can only purge completed run".to_string());
    }
    if run.failed {
        return PurgeOutcome::Declined("You cannot purge a failed run".to_string());
    }
    if now - run.start_time > MAX_AGE {
        return PurgeOutcome::Declined("Run too old to be purged".to_string());
    }

    let mut bad: BTreeSet<usize> = run
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| !task.bad && crashed_or_timed_out(task))
        .map(|(task_id, _)| task_id)
        .collect();
    // each removal changes the table, so the test is repeated on what is left
    while let Some(worker) = find_bad_worker(&run.tasks, &bad, p_threshold, residual_threshold) {
        bad.extend(
            run.tasks
                .iter()
                .enumerate()
                .filter(|(_, task)| !task.bad && task.worker_info.unique_key == worker)
                .map(|(task_id, _)| task_id),
        );
    }
    if bad.is_empty() {
        return PurgeOutcome::Declined("No bad workers".to_string());
    }

    for &task_id in &bad {
        let task = &mut run.tasks[task_id];
        let mut record = task.clone();
        record.bad = true;
        run.bad_tasks.push(PurgedTask { task_id, task: record });
        task.bad = true;
        task.active = false;
        task.pending = false;
        task.stats = Default::default();
    }

    let results = run.results();
    if let StopRule::Sprt(sprt) = &mut run.args.stop_rule {
        sprt.reevaluate(&results);
    }
    run.refresh_outcome_flags();
    run.last_updated = now;
    info!(run = %run.id, bad_tasks = bad.len(), "Run purged");
    PurgeOutcome::Purged { bad_tasks: bad.len() }
}

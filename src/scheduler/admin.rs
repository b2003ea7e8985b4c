//! Operations performed by users and approvers rather than workers.

use time::OffsetDateTime;
use tracing::{info, instrument};

use super::{
    purge::{self, PurgeOutcome},
    submission::{self, RunModification, RunRequest},
    Caller, Edit, TaskScheduler,
};
use crate::{
    error::SchedulerError,
    model::{Run, RunId, StopRule, MAX_GAMES},
    repository::RunRepository,
};

fn forbidden(run: &Run) -> SchedulerError {
    SchedulerError::Forbidden(format!("Unable to modify another user's run {}", run.id))
}

impl<R: RunRepository> TaskScheduler<R> {
    /// Validate and store a new run. It waits for approval before receiving workers.
    #[instrument(skip_all, fields(user = %caller.username))]
    pub fn submit_run(&self, request: RunRequest, caller: &Caller) -> Result<RunId, SchedulerError> {
        let args = submission::validate(request, &caller.username)?;
        let run_id = self.repository.create(args, OffsetDateTime::now_utc())?;
        let run = self.get_run(run_id)?;
        self.actions.new_run(&caller.username, &run)?;
        info!(%run_id, "Run submitted");
        Ok(run_id)
    }

    #[instrument(skip_all, fields(run = %run_id, approver = %caller.username))]
    pub fn approve_run(&self, run_id: RunId, caller: &Caller) -> Result<(), SchedulerError> {
        if !caller.can_approve {
            return Err(SchedulerError::Forbidden("Please login as approver".to_string()));
        }
        let run = self.edit(run_id, |run| {
            if run.approved {
                return Err(SchedulerError::AlreadyApproved(run_id));
            }
            if run.args.username == caller.username {
                return Err(SchedulerError::SelfApproval(run_id));
            }
            run.approved = true;
            run.approver = Some(caller.username.clone());
            Ok(Edit::Commit(run.clone()))
        })?;
        self.actions.approve_run(&caller.username, &run)?;
        Ok(())
    }

    /// Change the game budget, priority, throughput or auto-purge flag of a run. A finished
    /// run is reopened, and its incomplete tasks are owed again.
    #[instrument(skip_all, fields(run = %run_id, user = %caller.username))]
    pub fn modify_run(
        &self,
        run_id: RunId,
        caller: &Caller,
        changes: RunModification,
    ) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let (before, after) = self.edit(run_id, |run| {
            if !caller.can_modify(run) {
                return Err(forbidden(run));
            }
            if run.deleted {
                return Err(SchedulerError::InvalidRun("Deleted runs cannot be modified".to_string()));
            }
            if changes.num_games == 0 || changes.num_games > MAX_GAMES {
                return Err(SchedulerError::InvalidRun(format!(
                    "Number of games must be in 1..={MAX_GAMES}"
                )));
            }
            if changes.throughput == 0 {
                return Err(SchedulerError::InvalidRun("Throughput must be >= 1".to_string()));
            }
            if matches!(run.args.stop_rule, StopRule::FixedGames) && changes.num_games > run.args.num_games {
                return Err(SchedulerError::InvalidRun(
                    "Unable to modify number of games in a fixed game test".to_string(),
                ));
            }
            if changes.num_games < run.allocated_games() {
                return Err(SchedulerError::InvalidRun(format!(
                    "{} games are already handed out",
                    run.allocated_games()
                )));
            }
            let before = run.without_tasks();

            for task in run.tasks.iter_mut().filter(|t| !t.bad && !t.active) {
                if task.stats.games() < task.num_games {
                    task.pending = true;
                }
            }
            run.finished = false;
            run.failed = false;
            run.failure_reason = None;
            run.is_green = false;
            run.is_yellow = false;
            run.last_updated = now;
            run.args.num_games = changes.num_games;
            run.args.priority = changes.priority;
            run.args.throughput = changes.throughput;
            run.args.auto_purge = changes.auto_purge;
            match &mut run.args.stop_rule {
                StopRule::Sprt(sprt) => sprt.reset_decision(),
                StopRule::Spsa(spsa) => spsa.num_iter = u64::from(changes.num_games / 2),
                StopRule::FixedGames => {}
            }
            Ok(Edit::Commit((before, run.without_tasks())))
        })?;
        self.actions.modify_run(&caller.username, &before, &after)?;
        Ok(())
    }

    /// Stop a run on behalf of its owner or an approver. Stopping a finished run is a no-op.
    #[instrument(skip_all, fields(run = %run_id, user = %caller.username))]
    pub fn stop_run(&self, run_id: RunId, caller: &Caller) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let stopped = self.edit(run_id, |run| {
            if !caller.can_modify(run) {
                return Err(forbidden(run));
            }
            if run.finished {
                return Ok(Edit::Discard(None));
            }
            self.finish_run(run, now);
            // an auto-purge may reopen the run, a manual stop is final
            run.finished = true;
            Ok(Edit::Commit(Some(run.clone())))
        })?;
        if let Some(run) = stopped {
            self.actions.stop_run(&caller.username, &run, None)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(run = %run_id, user = %caller.username))]
    pub fn delete_run(&self, run_id: RunId, caller: &Caller) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let deleted = self.edit(run_id, |run| {
            if !caller.can_modify(run) {
                return Err(forbidden(run));
            }
            if run.deleted {
                return Ok(Edit::Discard(None));
            }
            run.deleted = true;
            run.finished = true;
            run.last_updated = now;
            for task in &mut run.tasks {
                task.active = false;
            }
            Ok(Edit::Commit(Some(run.clone())))
        })?;
        if let Some(run) = deleted {
            self.actions.delete_run(&caller.username, &run)?;
        }
        Ok(())
    }

    /// Manual purge with the relaxed thresholds.
    pub fn purge_run(&self, run_id: RunId, caller: &Caller) -> Result<PurgeOutcome, SchedulerError> {
        self.purge_run_with(
            run_id,
            caller,
            purge::MANUAL_PURGE_P,
            purge::MANUAL_PURGE_RESIDUAL,
        )
    }

    #[instrument(skip_all, fields(run = %run_id, user = %caller.username))]
    pub fn purge_run_with(
        &self,
        run_id: RunId,
        caller: &Caller,
        p_value: f64,
        residual: f64,
    ) -> Result<PurgeOutcome, SchedulerError> {
        if !caller.can_approve {
            return Err(SchedulerError::Forbidden("Please login as approver".to_string()));
        }
        let now = OffsetDateTime::now_utc();
        let (outcome, run) = self.edit(run_id, |run| {
            match purge::purge(run, p_value, residual, now) {
                outcome @ PurgeOutcome::Purged { .. } => Ok(Edit::Commit((outcome, Some(run.clone())))),
                outcome @ PurgeOutcome::Declined(_) => Ok(Edit::Discard((outcome, None))),
            }
        })?;
        if let (PurgeOutcome::Purged { bad_tasks }, Some(run)) = (&outcome, run) {
            self.actions
                .purge_run(&caller.username, &run, Some(format!("{bad_tasks} bad tasks")))?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod admin_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        action_log::{ActionFilter, ActionKind},
        model::{RunStatus, Stats, WorkerInfo},
        repository::{InMemoryRepository, Page},
        scheduler::submission::StopRuleRequest,
    };

    fn request(num_games: u32) -> RunRequest {
        RunRequest {
            base_tag: "master".into(),
            new_tag: "patch".into(),
            resolved_base: "aaaa".into(),
            resolved_new: "bbbb".into(),
            base_signature: "111".into(),
            new_signature: "222".into(),
            base_options: String::new(),
            new_options: String::new(),
            tc: "10+0.1".into(),
            new_tc: None,
            book: String::new(),
            book_depth: 8,
            threads: 1,
            priority: 0,
            throughput: 100,
            tests_repo: "https://example.org/repo".into(),
            info: "info".into(),
            auto_purge: false,
            adjudication: true,
            stop_rule: StopRuleRequest::FixedGames { num_games },
        }
    }

    fn scheduler() -> TaskScheduler<InMemoryRepository> {
        TaskScheduler::new(Arc::new(InMemoryRepository::new()))
    }

    fn kinds(scheduler: &TaskScheduler<InMemoryRepository>) -> Vec<ActionKind> {
        scheduler
            .actions(&ActionFilter::default(), Page::default())
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect()
    }

    #[test]
    fn test_approval_rules() {
        let scheduler = scheduler();
        let id = scheduler.submit_run(request(100), &Caller::user("alice")).unwrap();
        assert_eq!(scheduler.get_run(id).unwrap().status(), RunStatus::Pending);

        assert!(matches!(
            scheduler.approve_run(id, &Caller::user("bob")),
            Err(SchedulerError::Forbidden(_))
        ));
        assert!(matches!(
            scheduler.approve_run(id, &Caller::approver("alice")),
            Err(SchedulerError::SelfApproval(_))
        ));
        scheduler.approve_run(id, &Caller::approver("carol")).unwrap();
        assert!(matches!(
            scheduler.approve_run(id, &Caller::approver("carol")),
            Err(SchedulerError::AlreadyApproved(_))
        ));
        let run = scheduler.get_run(id).unwrap();
        assert_eq!(run.approver.as_deref(), Some("carol"));
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(kinds(&scheduler), vec![ActionKind::ApproveRun, ActionKind::NewRun]);
    }

    #[test]
    fn test_only_owner_or_approver_may_modify() {
        let scheduler = scheduler();
        let id = scheduler.submit_run(request(100), &Caller::user("alice")).unwrap();
        assert!(matches!(
            scheduler.stop_run(id, &Caller::user("mallory")),
            Err(SchedulerError::Forbidden(_))
        ));
        assert!(matches!(
            scheduler.delete_run(id, &Caller::user("mallory")),
            Err(SchedulerError::Forbidden(_))
        ));
        scheduler.stop_run(id, &Caller::approver("carol")).unwrap();
        let run = scheduler.get_run(id).unwrap();
        assert!(run.finished);
        // idempotent
        scheduler.stop_run(id, &Caller::user("alice")).unwrap();
        assert_eq!(
            kinds(&scheduler),
            vec![ActionKind::StopRun, ActionKind::NewRun]
        );
    }

    #[test]
    fn test_modify_reopens_and_repends() {
        let scheduler = scheduler();
        let alice = Caller::user("alice");
        let id = scheduler.submit_run(request(200), &alice).unwrap();
        scheduler.approve_run(id, &Caller::approver("carol")).unwrap();
        let worker = WorkerInfo {
            unique_key: "w1".into(),
            username: "bob".into(),
            concurrency: 1,
            max_memory: 1024,
            min_threads: 1,
            ..WorkerInfo::default()
        };
        let assignment = scheduler.request_task(&worker).unwrap().unwrap();
        scheduler
            .update_task(id, assignment.task_id, &worker, Stats::new(5, 5, 0), None)
            .unwrap();
        scheduler.stop_run(id, &alice).unwrap();
        assert!(!scheduler.get_run(id).unwrap().tasks[0].pending);

        let fixed_grow = RunModification {
            num_games: 400,
            priority: 1,
            throughput: 50,
            auto_purge: false,
        };
        assert!(matches!(
            scheduler.modify_run(id, &alice, fixed_grow),
            Err(SchedulerError::InvalidRun(_))
        ));
        let changes = RunModification {
            num_games: 200,
            priority: 1,
            throughput: 50,
            auto_purge: false,
        };
        scheduler.modify_run(id, &alice, changes).unwrap();
        let run = scheduler.get_run(id).unwrap();
        assert!(!run.finished);
        assert!(run.tasks[0].pending);
        assert_eq!(run.args.priority, 1);
        assert_eq!(kinds(&scheduler)[0], ActionKind::ModifyRun);
    }

    #[test]
    fn test_delete_hides_run() {
        let scheduler = scheduler();
        let id = scheduler.submit_run(request(100), &Caller::user("alice")).unwrap();
        scheduler.delete_run(id, &Caller::user("alice")).unwrap();
        let run = scheduler.get_run(id).unwrap();
        assert_eq!(run.status(), RunStatus::Deleted);
        assert!(scheduler.repository().list_unfinished().unwrap().is_empty());
    }

    #[test]
    fn test_purge_requires_approver() {
        let scheduler = scheduler();
        let id = scheduler.submit_run(request(100), &Caller::user("alice")).unwrap();
        assert!(matches!(
            scheduler.purge_run(id, &Caller::user("alice")),
            Err(SchedulerError::Forbidden(_))
        ));
        assert_eq!(
            scheduler.purge_run(id, &Caller::approver("carol")).unwrap(),
            PurgeOutcome::Declined("Can only purge completed run".to_string())
        );
    }
}

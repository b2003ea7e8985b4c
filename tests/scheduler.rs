use std::sync::{Arc, Mutex};

use gauntlet::{
    action_log::{ActionFilter, ActionKind},
    error::SchedulerError,
    model::{RunId, Stats, WorkerInfo},
    prelude::*,
    repository::Page,
    scheduler::{SpsaResult, StopRuleRequest},
    stats::SprtDecision,
};

fn request(stop_rule: StopRuleRequest) -> RunRequest {
    RunRequest {
        base_tag: "master".into(),
        new_tag: "faster-movegen".into(),
        resolved_base: "0123abcd".into(),
        resolved_new: "4567ef01".into(),
        base_signature: "1234567".into(),
        new_signature: "1234599".into(),
        base_options: "Hash=16".into(),
        new_options: "Hash=16".into(),
        tc: "10+0.1".into(),
        new_tc: None,
        book: "openings.epd".into(),
        book_depth: 8,
        threads: 1,
        priority: 0,
        throughput: 100,
        tests_repo: "https://example.org/engine".into(),
        info: "integration".into(),
        auto_purge: false,
        adjudication: true,
        stop_rule,
    }
}

fn worker(key: &str) -> WorkerInfo {
    WorkerInfo {
        unique_key: key.into(),
        username: "bob".into(),
        concurrency: 4,
        max_memory: 4096,
        min_threads: 1,
        ..WorkerInfo::default()
    }
}

fn scheduler() -> TaskScheduler<InMemoryRepository> {
    TaskScheduler::new(Arc::new(InMemoryRepository::new())).with_rng_seed(7)
}

fn submit_approved(scheduler: &TaskScheduler<InMemoryRepository>, stop_rule: StopRuleRequest) -> RunId {
    let id = scheduler
        .submit_run(request(stop_rule), &Caller::user("alice"))
        .unwrap();
    scheduler.approve_run(id, &Caller::approver("carol")).unwrap();
    id
}

#[test]
fn test_unapproved_runs_get_no_workers() {
    let scheduler = scheduler();
    let id = scheduler
        .submit_run(
            request(StopRuleRequest::FixedGames { num_games: 100 }),
            &Caller::user("alice"),
        )
        .unwrap();
    assert!(scheduler.request_task(&worker("w1")).unwrap().is_none());

    scheduler.approve_run(id, &Caller::approver("carol")).unwrap();
    let assignment = scheduler.request_task(&worker("w1")).unwrap().unwrap();
    assert_eq!(assignment.run.id, id);
}

#[test]
fn test_sprt_run_is_accepted() {
    let scheduler = scheduler();
    let id = submit_approved(
        &scheduler,
        StopRuleRequest::Sprt {
            elo0: 0.0,
            elo1: 2.0,
            elo_model: "normalized".into(),
            alpha: 0.05,
            beta: 0.05,
        },
    );
    let w = worker("w1");
    let assignment = scheduler.request_task(&w).unwrap().unwrap();
    assert_eq!(assignment.num_games % 8, 0, "tasks hold whole SPRT batches");

    let games = assignment.num_games;
    let losses = games / 10;
    let draws = games / 10;
    let wins = games - losses - draws;
    let status = scheduler
        .update_task(id, assignment.task_id, &w, Stats::new(wins, losses, draws), None)
        .unwrap();
    assert!(!status.task_alive);

    let run = scheduler.get_run(id).unwrap();
    assert!(run.finished);
    assert!(run.is_green);
    let report = scheduler.get_elo(id).unwrap();
    let sprt = report.sprt.unwrap();
    assert_eq!(sprt.state, Some(SprtDecision::Accepted));
    assert!(sprt.llr >= sprt.upper_bound);
    assert!(scheduler.request_task(&w).unwrap().is_none());
}

#[test]
fn test_spsa_run_advances_until_done() {
    let scheduler = scheduler();
    let id = submit_approved(
        &scheduler,
        StopRuleRequest::Spsa {
            num_games: 20,
            a_offset: 5.0,
            alpha: 0.602,
            gamma: 0.101,
            raw_params: "Tempo,100,0,200,10,0.002".into(),
            clipping: String::new(),
            rounding: String::new(),
        },
    );
    let w = worker("w1");
    let assignment = scheduler.request_task(&w).unwrap().unwrap();
    assert_eq!(assignment.num_games, 20);

    let mut totals = Stats::default();
    let mut alive = true;
    let mut batches = 0;
    while alive {
        let batch = scheduler.request_spsa(id, assignment.task_id, &w).unwrap();
        assert_eq!(batch.w_params.len(), 1);
        assert_eq!(batch.w_params[0].name, "Tempo");
        assert_ne!(batch.w_params[0].value, batch.b_params[0].value);

        totals.add(&Stats::new(3, 1, 0));
        let result = SpsaResult {
            wins: 3,
            losses: 1,
            draws: 0,
            num_games: 4,
        };
        alive = scheduler
            .update_task(id, assignment.task_id, &w, totals, Some(result))
            .unwrap()
            .task_alive;
        batches += 1;
    }
    assert_eq!(batches, 5);

    let run = scheduler.get_run(id).unwrap();
    assert!(run.finished);
    let spsa = run.args.stop_rule.spsa().unwrap();
    assert_eq!(spsa.iter, spsa.num_iter);
    let theta = spsa.theta()[0].value;
    assert!((0.0..=200.0).contains(&theta));
    assert!(scheduler.request_spsa(id, assignment.task_id, &w).unwrap_err().is_stale_task());
}

#[test]
fn test_failed_task_goes_to_another_worker() {
    let scheduler = scheduler();
    let id = submit_approved(&scheduler, StopRuleRequest::FixedGames { num_games: 40 });
    let first = worker("w1");
    let assignment = scheduler.request_task(&first).unwrap().unwrap();
    scheduler
        .update_task(id, assignment.task_id, &first, Stats::new(2, 2, 0), None)
        .unwrap();
    scheduler
        .failed_task(id, assignment.task_id, &first, "engine binary vanished")
        .unwrap();
    // repeating the report is harmless
    scheduler
        .failed_task(id, assignment.task_id, &first, "engine binary vanished")
        .unwrap();

    let second = worker("w2");
    let retry = scheduler.request_task(&second).unwrap().unwrap();
    assert_eq!(retry.task_id, assignment.task_id);
    let run = scheduler.get_run(id).unwrap();
    assert_eq!(run.tasks[retry.task_id].worker_info.unique_key, "w2");
    assert_eq!(run.tasks[retry.task_id].stats, Stats::default());
    assert!(scheduler
        .update_task(id, assignment.task_id, &first, Stats::new(3, 2, 0), None)
        .unwrap_err()
        .is_stale_task());
}

#[test]
fn test_worker_can_stop_a_broken_run() {
    let scheduler = scheduler();
    let id = submit_approved(&scheduler, StopRuleRequest::FixedGames { num_games: 100 });
    let w = worker("w1");
    let assignment = scheduler.request_task(&w).unwrap().unwrap();
    scheduler
        .worker_stop_run(id, assignment.task_id, &w, "the new version does not build")
        .unwrap();

    let run = scheduler.get_run(id).unwrap();
    assert!(run.finished);
    assert!(run.failed);
    assert_eq!(run.failure_reason.as_deref(), Some("the new version does not build"));
    assert!(scheduler
        .worker_stop_run(id, assignment.task_id, &w, "again")
        .unwrap_err()
        .is_stale_task());

    let kinds: Vec<ActionKind> = scheduler
        .actions(
            &ActionFilter {
                run_id: Some(id),
                ..ActionFilter::default()
            },
            Page::default(),
        )
        .unwrap()
        .into_iter()
        .map(|action| action.kind)
        .collect();
    for kind in [ActionKind::NewRun, ActionKind::ApproveRun, ActionKind::StopRun] {
        assert!(kinds.contains(&kind), "{kind:?} missing from {kinds:?}");
    }
}

#[test]
fn test_workers_share_a_run() {
    let scheduler = scheduler();
    let id = submit_approved(&scheduler, StopRuleRequest::FixedGames { num_games: 1000 });
    let a = scheduler.request_task(&worker("w1")).unwrap().unwrap();
    let b = scheduler.request_task(&worker("w2")).unwrap().unwrap();
    assert_eq!((a.run.id, b.run.id), (id, id));
    assert_ne!(a.task_id, b.task_id);
    assert_eq!(b.start, a.start + a.num_games);

    // asking again releases the task held so far
    let again = scheduler.request_task(&worker("w1")).unwrap().unwrap();
    assert_eq!(again.task_id, a.task_id);
    let run = scheduler.get_run(id).unwrap();
    assert_eq!(
        run.tasks.iter().filter(|task| task.is_held_by("w1")).count(),
        1
    );
}

/// Repeat a call the scheduler gave up on because of write contention.
fn settle<T>(mut call: impl FnMut() -> Result<T, SchedulerError>) -> T {
    loop {
        match call() {
            Err(SchedulerError::Contention(_)) => continue,
            other => return other.unwrap(),
        }
    }
}

#[test]
fn test_concurrent_workers_never_share_a_task() {
    let scheduler = scheduler();
    let id = submit_approved(&scheduler, StopRuleRequest::FixedGames { num_games: 20_000 });
    let completed = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for i in 0..8 {
            let scheduler = &scheduler;
            let completed = &completed;
            scope.spawn(move || {
                let w = worker(&format!("w{i}"));
                for round in 0.. {
                    let Some(assignment) = settle(|| scheduler.request_task(&w)) else {
                        break;
                    };
                    let task_id = assignment.task_id;
                    // a task handed to two workers would make one of these updates stale
                    settle(|| scheduler.update_task(id, task_id, &w, Stats::new(1, 1, 0), None));
                    if round % 4 == 1 {
                        settle(|| scheduler.failed_task(id, task_id, &w, "lost the engine"));
                        continue;
                    }
                    let half = assignment.num_games / 2;
                    let status = settle(|| scheduler.update_task(id, task_id, &w, Stats::new(half, half, 0), None));
                    assert!(!status.task_alive);
                    completed.lock().unwrap().push(task_id);
                }
            });
        }
    });

    // contention may have sent a worker home early, so finish what is left
    let last = worker("closer");
    while let Some(assignment) = settle(|| scheduler.request_task(&last)) {
        let half = assignment.num_games / 2;
        settle(|| scheduler.update_task(id, assignment.task_id, &last, Stats::new(half, half, 0), None));
        completed.lock().unwrap().push(assignment.task_id);
    }

    let mut completed = completed.into_inner().unwrap();
    completed.sort_unstable();
    let played = completed.len();
    completed.dedup();
    assert_eq!(completed.len(), played, "a task was completed twice");

    let run = scheduler.get_run(id).unwrap();
    assert!(run.finished);
    assert!(run.allocated_games() <= run.args.num_games);
    assert_eq!(run.results().games(), run.args.num_games);
    assert_eq!(completed.len(), run.tasks.len());

    let mut tasks: Vec<_> = run.tasks.iter().collect();
    tasks.sort_by_key(|task| task.start);
    let mut next = 0;
    for task in tasks {
        assert_eq!(task.start, next, "tasks overlap or leave a gap");
        assert!(!task.active);
        next = task.start + task.num_games;
    }
    assert_eq!(next, run.args.num_games);
}

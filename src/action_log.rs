//! Append-only audit trail of administrative actions on runs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    error::RepositoryError,
    model::{Run, RunId},
    repository::{Page, RunRepository},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    NewRun,
    ModifyRun,
    StopRun,
    ApproveRun,
    PurgeRun,
    DeleteRun,
}

/// Run snapshot(s) attached to an action. Snapshots never contain the task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionPayload {
    Modify { before: Box<Run>, after: Box<Run> },
    Snapshot(Box<Run>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub username: String,
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub payload: ActionPayload,
    #[serde(default)]
    pub message: Option<String>,
}

/// Selects actions when listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionFilter {
    pub username: Option<String>,
    pub run_id: Option<RunId>,
    pub kind: Option<ActionKind>,
}

impl ActionFilter {
    pub fn matches(&self, action: &Action) -> bool {
        self.username.as_ref().map_or(true, |u| *u == action.username)
            && self.run_id.map_or(true, |id| id == action.run_id)
            && self.kind.map_or(true, |k| k == action.kind)
    }
}

/// Records actions through the repository.
pub struct ActionLog<R: RunRepository> {
    repository: Arc<R>,
}

impl<R: RunRepository> ActionLog<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    fn record(
        &self,
        kind: ActionKind,
        username: &str,
        run_id: RunId,
        payload: ActionPayload,
        message: Option<String>,
    ) -> Result<(), RepositoryError> {
        info!(?kind, username, %run_id, "Recording action");
        self.repository.append_action(Action {
            kind,
            username: username.to_string(),
            run_id,
            time: OffsetDateTime::now_utc(),
            payload,
            message,
        })
    }

    fn snapshot(run: &Run) -> ActionPayload {
        ActionPayload::Snapshot(Box::new(run.without_tasks()))
    }

    pub fn new_run(&self, username: &str, run: &Run) -> Result<(), RepositoryError> {
        self.record(ActionKind::NewRun, username, run.id, Self::snapshot(run), None)
    }

    pub fn modify_run(&self, username: &str, before: &Run, after: &Run) -> Result<(), RepositoryError> {
        let payload = ActionPayload::Modify {
            before: Box::new(before.without_tasks()),
            after: Box::new(after.without_tasks()),
        };
        self.record(ActionKind::ModifyRun, username, after.id, payload, None)
    }

    pub fn stop_run(&self, username: &str, run: &Run, message: Option<String>) -> Result<(), RepositoryError> {
        self.record(ActionKind::StopRun, username, run.id, Self::snapshot(run), message)
    }

    pub fn approve_run(&self, username: &str, run: &Run) -> Result<(), RepositoryError> {
        self.record(ActionKind::ApproveRun, username, run.id, Self::snapshot(run), None)
    }

    pub fn purge_run(&self, username: &str, run: &Run, message: Option<String>) -> Result<(), RepositoryError> {
        self.record(ActionKind::PurgeRun, username, run.id, Self::snapshot(run), message)
    }

    pub fn delete_run(&self, username: &str, run: &Run) -> Result<(), RepositoryError> {
        self.record(ActionKind::DeleteRun, username, run.id, Self::snapshot(run), None)
    }

    /// Most recent first.
    pub fn list(&self, filter: &ActionFilter, page: Page) -> Result<Vec<Action>, RepositoryError> {
        self.repository.list_actions(filter, page)
    }
}

impl<R: RunRepository> Clone for ActionLog<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

#[cfg(test)]
mod action_log_tests {
    use super::*;
    use crate::{
        model::{RunArgs, StopRule},
        repository::InMemoryRepository,
    };

    fn stored_run(repository: &InMemoryRepository) -> Run {
        let args = RunArgs {
            base_tag: "master".into(),
            new_tag: "patch".into(),
            resolved_base: "aaaa".into(),
            resolved_new: "bbbb".into(),
            base_signature: "1".into(),
            new_signature: "2".into(),
            base_options: String::new(),
            new_options: String::new(),
            tc: "10+0.1".into(),
            new_tc: "10+0.1".into(),
            book: String::new(),
            book_depth: 8,
            threads: 1,
            priority: 0,
            throughput: 100,
            num_games: 100,
            username: "alice".into(),
            tests_repo: String::new(),
            info: String::new(),
            auto_purge: false,
            adjudication: true,
            stop_rule: StopRule::FixedGames,
        };
        let id = repository.create(args, OffsetDateTime::now_utc()).unwrap();
        repository.get(id).unwrap().value
    }

    #[test]
    fn test_listing_is_newest_first_and_filtered() {
        let repository = Arc::new(InMemoryRepository::new());
        let log = ActionLog::new(Arc::clone(&repository));
        let run = stored_run(&repository);
        let other = stored_run(&repository);

        log.new_run("alice", &run).unwrap();
        log.approve_run("carol", &run).unwrap();
        log.new_run("alice", &other).unwrap();
        log.stop_run("carol", &run, Some("bad patch".into())).unwrap();

        let all = log.list(&ActionFilter::default(), Page::default()).unwrap();
        let kinds: Vec<_> = all.iter().map(|action| action.kind).collect();
        assert_eq!(
            kinds,
            [ActionKind::StopRun, ActionKind::NewRun, ActionKind::ApproveRun, ActionKind::NewRun]
        );
        assert_eq!(all[0].message.as_deref(), Some("bad patch"));

        let by_carol = ActionFilter {
            username: Some("carol".into()),
            run_id: Some(run.id),
            ..ActionFilter::default()
        };
        assert_eq!(log.list(&by_carol, Page::default()).unwrap().len(), 2);

        let second_page = log.list(&ActionFilter::default(), Page { skip: 3, limit: 10 }).unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].kind, ActionKind::NewRun);
        assert_eq!(second_page[0].run_id, run.id);
    }

    #[test]
    fn test_snapshots_drop_the_task_list() {
        let repository = Arc::new(InMemoryRepository::new());
        let log = ActionLog::new(Arc::clone(&repository));
        let before = stored_run(&repository);
        let mut after = before.clone();
        after.args.priority = 3;

        log.modify_run("carol", &before, &after).unwrap();
        let actions = log.list(&ActionFilter::default(), Page::default()).unwrap();
        match &actions[0].payload {
            ActionPayload::Modify { before, after } => {
                assert!(before.tasks.is_empty() && after.tasks.is_empty());
                assert_eq!(after.args.priority, 3);
            }
            payload => panic!("unexpected payload {payload:?}"),
        }
    }
}

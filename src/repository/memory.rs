use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
};

use time::OffsetDateTime;
use tracing::debug;

use super::{Page, RunFilter, RunRepository, Versioned};
use crate::{
    action_log::{Action, ActionFilter},
    error::RepositoryError,
    model::{Run, RunArgs, RunId},
};

/// Process-local repository. Versions start at 1 and grow by one per successful write.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    runs: RwLock<BTreeMap<RunId, Versioned<Run>>>,
    actions: RwLock<Vec<Action>>,
    pgns: Mutex<HashMap<(RunId, usize), Vec<u8>>>,
    last_id: AtomicU64,
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Backend("lock poisoned".to_string())
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRepository {
    fn create(&self, args: RunArgs, now: OffsetDateTime) -> Result<RunId, RepositoryError> {
        let id = RunId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1);
        let run = Run::new(id, args, now);
        self.runs
            .write()
            .map_err(poisoned)?
            .insert(id, Versioned { version: 1, value: run });
        debug!(%id, "Run created");
        Ok(id)
    }

    fn get(&self, id: RunId) -> Result<Versioned<Run>, RepositoryError> {
        self.runs
            .read()
            .map_err(poisoned)?
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound(id))
    }

    fn compare_and_swap(&self, run: Run, expected_version: u64) -> Result<bool, RepositoryError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let stored = runs.get_mut(&run.id).ok_or(RepositoryError::NotFound(run.id))?;
        if stored.version != expected_version {
            debug!(id = %run.id, expected_version, actual = stored.version, "Version conflict");
            return Ok(false);
        }
        stored.version += 1;
        stored.value = run;
        Ok(true)
    }

    fn append_action(&self, action: Action) -> Result<(), RepositoryError> {
        self.actions.write().map_err(poisoned)?.push(action);
        Ok(())
    }

    fn list_actions(&self, filter: &ActionFilter, page: Page) -> Result<Vec<Action>, RepositoryError> {
        Ok(self
            .actions
            .read()
            .map_err(poisoned)?
            .iter()
            .rev()
            .filter(|action| filter.matches(action))
            .skip(page.skip)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn list_unfinished(&self) -> Result<Vec<Versioned<Run>>, RepositoryError> {
        Ok(self
            .runs
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|v| !v.value.finished && !v.value.deleted)
            .cloned()
            .collect())
    }

    fn list_finished(&self, filter: &RunFilter, page: Page) -> Result<(Vec<Run>, usize), RepositoryError> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut finished: Vec<&Run> = runs
            .values()
            .map(|v| &v.value)
            .filter(|run| run.finished && !run.deleted && filter.matches(run))
            .collect();
        finished.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then(b.id.cmp(&a.id)));
        let total = finished.len();
        let page = finished
            .into_iter()
            .skip(page.skip)
            .take(page.limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    fn store_pgn(&self, run_id: RunId, task_id: usize, pgn: Vec<u8>) -> Result<bool, RepositoryError> {
        let mut pgns = self.pgns.lock().map_err(poisoned)?;
        if pgns.contains_key(&(run_id, task_id)) {
            return Ok(false);
        }
        pgns.insert((run_id, task_id), pgn);
        Ok(true)
    }

    fn get_pgn(&self, run_id: RunId, task_id: usize) -> Result<Option<Vec<u8>>, RepositoryError> {
        Ok(self.pgns.lock().map_err(poisoned)?.get(&(run_id, task_id)).cloned())
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use crate::model::{RunArgs, StopRule};

    fn args() -> RunArgs {
        RunArgs {
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
        }
    }

    #[test]
    fn test_compare_and_swap_detects_conflicts() {
        let repository = InMemoryRepository::new();
        let id = repository.create(args(), OffsetDateTime::now_utc()).unwrap();
        let first = repository.get(id).unwrap();
        let second = repository.get(id).unwrap();
        assert_eq!(first.version, 1);

        let mut run = first.value.clone();
        run.approved = true;
        assert!(repository.compare_and_swap(run, first.version).unwrap());

        let mut stale = second.value.clone();
        stale.args.priority = 5;
        assert!(!repository.compare_and_swap(stale, second.version).unwrap());

        let current = repository.get(id).unwrap();
        assert_eq!(current.version, 2);
        assert!(current.value.approved);
        assert_eq!(current.value.args.priority, 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let repository = InMemoryRepository::new();
        let a = repository.create(args(), OffsetDateTime::now_utc()).unwrap();
        let b = repository.create(args(), OffsetDateTime::now_utc()).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            repository.get(RunId(99)),
            Err(RepositoryError::NotFound(RunId(99)))
        ));
    }

    #[test]
    fn test_finished_listing_and_pgn() {
        let repository = InMemoryRepository::new();
        let id = repository.create(args(), OffsetDateTime::now_utc()).unwrap();
        assert_eq!(repository.list_unfinished().unwrap().len(), 1);

        let current = repository.get(id).unwrap();
        let mut run = current.value;
        run.finished = true;
        run.is_green = true;
        repository.compare_and_swap(run, current.version).unwrap();
        assert!(repository.list_unfinished().unwrap().is_empty());

        let filter = RunFilter {
            green_only: true,
            ..RunFilter::default()
        };
        let (runs, total) = repository.list_finished(&filter, Page::default()).unwrap();
        assert_eq!((runs.len(), total), (1, 1));

        assert!(repository.store_pgn(id, 0, b"1. e4".to_vec()).unwrap());
        assert!(!repository.store_pgn(id, 0, b"1. d4".to_vec()).unwrap());
        assert_eq!(repository.get_pgn(id, 0).unwrap(), Some(b"1. e4".to_vec()));
    }
}

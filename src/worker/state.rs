//! State shared by the main loop, the heartbeat and the signal handler.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::model::RunId;

/// The task the main loop is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTask {
    pub run_id: RunId,
    pub task_id: usize,
}

#[derive(Debug)]
struct Inner {
    alive: bool,
    current: Option<CurrentTask>,
}

/// Only the main loop sets the current task. Anyone may clear `alive`, which wakes every
/// sleeper.
#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            inner: Mutex::new(Inner {
                alive: true,
                current: None,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    pub fn stop(&self) {
        self.lock().alive = false;
        self.wake.notify_all();
    }

    pub fn current_task(&self) -> Option<CurrentTask> {
        self.lock().current
    }

    pub fn set_task(&self, run_id: RunId, task_id: usize) {
        self.lock().current = Some(CurrentTask { run_id, task_id });
    }

    pub fn clear_task(&self) {
        self.lock().current = None;
    }

    /// Sleep for `duration` or until stopped. Returns whether the worker is still alive.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |inner| inner.alive)
            .unwrap_or_else(PoisonError::into_inner);
        guard.alive
    }
}

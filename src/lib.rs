//! # Gauntlet
//!
//! A distributed benchmark fleet: users submit runs comparing two versions of a program, a
//! central scheduler splits every run into tasks, and workers on many machines play the
//! games and report the results until a stopping rule decides the run.
//!
//! It provides:
//! - Sequential stopping rules: SPRT for pass/fail tests and SPSA for parameter tuning
//!   (see [`stats`])
//! - A [`TaskScheduler`](crate::scheduler::TaskScheduler) assigning tasks, aggregating results
//!   and finishing runs, on top of any [`RunRepository`](crate::repository::RunRepository)
//!   with compare-and-swap writes
//! - An audit trail of user and worker actions ([`action_log`])
//! - A JSON over HTTP front-end for workers and users ([`server`], wire types in [`api`])
//! - The worker agent itself, with heartbeat, exponential backoff, single instance lock and
//!   failure classification ([`worker`])
//!
//! Two binaries wrap the library: `gauntlet-server` and `gauntlet-worker`.
//!
//! # Documentation Overview
//!
//! - For the life of a run (submission, approval, task assignment, result aggregation,
//!   purge), see the [`scheduler`] module.
//! - For server settings, see [`Configuration`](crate::configuration::Configuration).
//! - For the worker's polling loop and its settings file, see [`worker`] and
//!   [`worker::config`].
//!
//! # Usage Example
//!
//! A scheduler serving an in-memory repository:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gauntlet::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env();
//!     let repository = Arc::new(InMemoryRepository::new());
//!     let scheduler = TaskScheduler::new(repository).with_dead_task_timeout(config.dead_task_timeout());
//!     let users = UserTable::new().with_user("alice", "secret", true);
//!     let service = Arc::new(ApiService::new(scheduler, users).with_configuration(&config));
//!
//!     let handle = gauntlet::server::spawn(service, &config)?;
//!     println!("listening on {}", handle.addr());
//!     handle.join()
//! }
//! ```
//!
//! And a worker polling it:
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//! use gauntlet::prelude::*;
//! use gauntlet::model::WorkerInfo;
//!
//! fn main() -> anyhow::Result<()> {
//!     let dir = Path::new("/var/lib/gauntlet");
//!     let client = Arc::new(HttpSchedulerClient::new("http://localhost:6543", "secret")?);
//!     let runner = ProcessGameRunner::new("match-runner", &dir.join("games"));
//!     let info = WorkerInfo {
//!         unique_key: "5c2f0c8e-9d4e-4d0e-8f43-8d3b7a0f6c11".into(),
//!         username: "alice".into(),
//!         concurrency: 4,
//!         max_memory: 8192,
//!         min_threads: 1,
//!         version: gauntlet::worker::WORKER_VERSION,
//!         ..WorkerInfo::default()
//!     };
//!     let reason = WorkerAgent::new(client, runner, info, dir).run();
//!     std::process::exit(reason.exit_code())
//! }
//! ```

pub use anyhow;

pub mod action_log;
pub mod api;
pub mod cache;
pub mod configuration;
pub mod error;
pub mod logger;
pub mod model;
pub mod repository;
pub mod scheduler;
pub mod server;
pub mod signal;
pub mod stats;
pub mod worker;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use gauntlet::prelude::*;
/// ```
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::repository::{InMemoryRepository, RunRepository};
    pub use crate::scheduler::{Caller, RunRequest, TaskScheduler};
    pub use crate::server::{ApiService, Authenticator, OpenAccess, UserTable};
    pub use crate::worker::{
        ExitReason, GameRunner, HttpSchedulerClient, ProcessGameRunner, SchedulerClient, SharedState,
        WorkerAgent,
    };
}

//! Config of the scheduler server
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Unset or unparsable values fall back to the default.
//!
//! - `GAUNTLET_BIND`: Address the HTTP front-end listens on (default: `127.0.0.1:6543`)
//! - `GAUNTLET_WORKER_VERSION`: Worker protocol version served by `request_version`
//!   (default: [`WORKER_VERSION`](crate::worker::WORKER_VERSION))
//! - `GAUNTLET_DEAD_TASK_SECS`: Seconds without news after which a task is released (default: `360`)
//! - `GAUNTLET_SUMMARY_TTL_SECS`: Lifetime of the active runs summary (default: `2`)
//! - `GAUNTLET_HTTP_THREADS`: Request handling threads (default: number of CPUs)
//! - `GAUNTLET_USERS`: TOML user table (default: none, any non-empty credentials are accepted)
//! - `GAUNTLET_LOG_DIR`: Write logs to a file in this directory instead of stderr
//! - `GAUNTLET_LOG_LEVEL`: `trace`, `debug`, `info`, `warn` or `error` (default: `info`)

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use tracing::Level;

use crate::{logger::LogTarget, scheduler::DEFAULT_DEAD_TASK_TIMEOUT, worker::WORKER_VERSION};

/// Configuration of the scheduler server.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) bind: SocketAddr,
    pub(crate) worker_version: u32,
    pub(crate) dead_task_timeout: Duration,
    pub(crate) summary_ttl: Duration,
    pub(crate) http_threads: usize,
    pub(crate) users_file: Option<PathBuf>,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) log_level: Level,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    pub fn new() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6543)),
            worker_version: WORKER_VERSION,
            dead_task_timeout: DEFAULT_DEAD_TASK_TIMEOUT,
            summary_ttl: Duration::from_secs(2),
            http_threads: num_cpus::get().max(1),
            users_file: None,
            log_dir: None,
            log_level: Level::INFO,
        }
    }

    /// Create configuration from environment variables (see module documentation).
    pub fn from_env() -> Self {
        fn get_env<T: FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok().and_then(|val| val.trim().parse().ok())
        }

        let defaults = Self::new();
        Self {
            bind: get_env("GAUNTLET_BIND").unwrap_or(defaults.bind),
            worker_version: get_env("GAUNTLET_WORKER_VERSION").unwrap_or(defaults.worker_version),
            dead_task_timeout: get_env("GAUNTLET_DEAD_TASK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dead_task_timeout),
            summary_ttl: get_env("GAUNTLET_SUMMARY_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.summary_ttl),
            http_threads: get_env::<usize>("GAUNTLET_HTTP_THREADS")
                .filter(|&threads| threads > 0)
                .unwrap_or(defaults.http_threads),
            users_file: get_env("GAUNTLET_USERS"),
            log_dir: get_env("GAUNTLET_LOG_DIR"),
            // `Level` parses case-insensitively
            log_level: get_env("GAUNTLET_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn with_bind(mut self, value: SocketAddr) -> Self {
        self.bind = value;
        self
    }

    pub fn with_worker_version(mut self, value: u32) -> Self {
        self.worker_version = value;
        self
    }

    /// Silence after which a task is considered dead and handed to another worker.
    pub fn with_dead_task_timeout(mut self, value: Duration) -> Self {
        self.dead_task_timeout = value;
        self
    }

    pub fn with_summary_ttl(mut self, value: Duration) -> Self {
        self.summary_ttl = value;
        self
    }

    pub fn with_http_threads(mut self, value: usize) -> Self {
        self.http_threads = value.max(1);
        self
    }

    pub fn with_users_file(mut self, value: Option<PathBuf>) -> Self {
        self.users_file = value;
        self
    }

    /// Log to a file in `value` instead of stderr.
    pub fn with_log_dir(mut self, value: Option<PathBuf>) -> Self {
        self.log_dir = value;
        self
    }

    pub fn with_log_level(mut self, value: Level) -> Self {
        self.log_level = value;
        self
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    pub fn dead_task_timeout(&self) -> Duration {
        self.dead_task_timeout
    }

    pub fn users_file(&self) -> Option<&PathBuf> {
        self.users_file.as_ref()
    }

    pub fn log_level(&self) -> Level {
        self.log_level
    }

    pub fn log_target(&self) -> LogTarget {
        match &self.log_dir {
            Some(dir) => LogTarget::Directory(dir.clone()),
            None => LogTarget::Stderr,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod configuration_tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = Configuration::new()
            .with_bind("0.0.0.0:8080".parse().unwrap())
            .with_http_threads(0)
            .with_log_dir(Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.bind().port(), 8080);
        assert_eq!(config.http_threads, 1);
        assert_eq!(config.log_target(), LogTarget::Directory(PathBuf::from("/tmp/logs")));
        assert_eq!(Configuration::default().log_target(), LogTarget::Stderr);
        assert_eq!(Configuration::default().dead_task_timeout, Duration::from_secs(360));
    }
}

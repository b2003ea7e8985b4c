use thiserror::Error;

/// How a failed task is reported, and whether the worker keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The worker must stop (bad version handshake, interrupted, credentials rejected).
    Fatal,
    /// The run itself is broken: stop it, then keep polling.
    RunFailure,
    /// Local or transient trouble: give the task back, then keep polling.
    WorkerFailure,
    /// Origin unknown: give the task back and stop.
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub severity: Severity,
    pub message: String,
}

impl WorkerError {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        WorkerError {
            severity,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    pub fn run_failure(message: impl Into<String>) -> Self {
        Self::new(Severity::RunFailure, message)
    }

    pub fn worker_failure(message: impl Into<String>) -> Self {
        Self::new(Severity::WorkerFailure, message)
    }

    /// The worker cannot go on after this error.
    pub fn stops_worker(&self) -> bool {
        matches!(self.severity, Severity::Fatal | Severity::Unclassified)
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(Severity::Unclassified, format!("{err:#}"))
    }
}

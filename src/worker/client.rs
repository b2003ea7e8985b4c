//! The worker's side of the scheduler API.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use super::HTTP_TIMEOUT;
use crate::{
    api::{
        self, TaskMessageRequest, TaskRef, TaskResponse, UpdateTaskRequest, UploadPgnRequest,
        VersionResponse, WorkerRequest, STALE_TASK,
    },
    model::{RateLimit, RunId, Stats, WorkerInfo},
    scheduler::{SpsaResult, TaskAssignment, TaskStatus},
    stats::SpsaBatch,
};

const GITHUB_RATE_LIMIT_URL: &str = "https://api.github.com/rate_limit";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The task was taken away from this worker.
    #[error("{0}")]
    StaleTask(String),
    /// The scheduler answered with an error.
    #[error("scheduler error: {0}")]
    Rejected(String),
    /// No usable answer: network failure, timeout, garbled body.
    #[error("transport error: {0}")]
    Transport(String),
}

pub trait SchedulerClient: Send + Sync {
    /// Remaining GitHub API quota of this machine.
    fn rate_limit(&self) -> Result<RateLimit, ClientError>;

    fn request_version(&self, worker: &WorkerInfo) -> Result<u32, ClientError>;

    /// `None` when no task is available.
    fn request_task(&self, worker: &WorkerInfo) -> Result<Option<TaskAssignment>, ClientError>;

    fn update_task(
        &self,
        worker: &WorkerInfo,
        run_id: RunId,
        task_id: usize,
        stats: Stats,
        spsa: Option<SpsaResult>,
    ) -> Result<TaskStatus, ClientError>;

    fn failed_task(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, message: &str) -> Result<(), ClientError>;

    fn stop_run(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, message: &str) -> Result<(), ClientError>;

    fn beat(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize) -> Result<(), ClientError>;

    fn request_spsa(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize) -> Result<SpsaBatch, ClientError>;

    fn upload_pgn(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, pgn: &str) -> Result<(), ClientError>;
}

/// Any `error` key turns the response into a failure, whatever the HTTP status.
pub(crate) fn decode_response<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ClientError::Transport(format!("invalid JSON response: {e}")))?;
    if let Some(error) = value.get("error") {
        let message = error.as_str().map_or_else(|| error.to_string(), str::to_string);
        return Err(if message.starts_with(STALE_TASK) {
            ClientError::StaleTask(message)
        } else {
            ClientError::Rejected(message)
        });
    }
    serde_json::from_value(value).map_err(|e| ClientError::Transport(format!("unexpected response: {e}")))
}

#[derive(Debug, Deserialize)]
struct GithubRateLimit {
    resources: GithubResources,
}

#[derive(Debug, Deserialize)]
struct GithubResources {
    core: RateLimit,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Blocking HTTP client. Every request is bounded by [`HTTP_TIMEOUT`].
pub struct HttpSchedulerClient {
    base_url: String,
    password: String,
    http: reqwest::blocking::Client,
}

impl HttpSchedulerClient {
    pub fn new(base_url: &str, password: &str) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("gauntlet-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpSchedulerClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            password: password.to_string(),
            http,
        })
    }

    #[instrument(skip(self, body))]
    fn post<B: Serialize, T: DeserializeOwned>(&self, endpoint: &str, body: &B) -> Result<T, ClientError> {
        let url = format!("{}/api/{endpoint}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        debug!(%status, bytes = text.len(), "Response received");
        decode_response(&text)
    }

    fn task_ref(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize) -> TaskRef {
        TaskRef {
            worker_info: worker.clone(),
            password: self.password.clone(),
            run_id,
            task_id,
        }
    }

    fn worker_request(&self, worker: &WorkerInfo) -> WorkerRequest {
        WorkerRequest {
            worker_info: worker.clone(),
            password: self.password.clone(),
        }
    }
}

impl SchedulerClient for HttpSchedulerClient {
    fn rate_limit(&self) -> Result<RateLimit, ClientError> {
        let response = self
            .http
            .get(GITHUB_RATE_LIMIT_URL)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let rate: GithubRateLimit = response
            .json()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(rate.resources.core)
    }

    fn request_version(&self, worker: &WorkerInfo) -> Result<u32, ClientError> {
        let response: VersionResponse = self.post("request_version", &self.worker_request(worker))?;
        Ok(response.version)
    }

    fn request_task(&self, worker: &WorkerInfo) -> Result<Option<TaskAssignment>, ClientError> {
        match self.post("request_task", &self.worker_request(worker))? {
            TaskResponse::Assigned(assignment) => Ok(Some(assignment)),
            TaskResponse::Waiting { .. } => Ok(None),
        }
    }

    fn update_task(
        &self,
        worker: &WorkerInfo,
        run_id: RunId,
        task_id: usize,
        stats: Stats,
        spsa: Option<SpsaResult>,
    ) -> Result<TaskStatus, ClientError> {
        let request = UpdateTaskRequest {
            task: self.task_ref(worker, run_id, task_id),
            stats,
            spsa,
        };
        self.post("update_task", &request)
    }

    fn failed_task(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, message: &str) -> Result<(), ClientError> {
        let request = TaskMessageRequest {
            task: self.task_ref(worker, run_id, task_id),
            message: message.to_string(),
        };
        self.post::<_, Empty>("failed_task", &request).map(|_| ())
    }

    fn stop_run(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, message: &str) -> Result<(), ClientError> {
        let request = TaskMessageRequest {
            task: self.task_ref(worker, run_id, task_id),
            message: message.to_string(),
        };
        self.post::<_, Empty>("stop_run", &request).map(|_| ())
    }

    fn beat(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize) -> Result<(), ClientError> {
        self.post::<_, Empty>("beat", &self.task_ref(worker, run_id, task_id))
            .map(|_| ())
    }

    fn request_spsa(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize) -> Result<SpsaBatch, ClientError> {
        self.post("request_spsa", &self.task_ref(worker, run_id, task_id))
    }

    fn upload_pgn(&self, worker: &WorkerInfo, run_id: RunId, task_id: usize, pgn: &str) -> Result<(), ClientError> {
        let request = UploadPgnRequest {
            task: self.task_ref(worker, run_id, task_id),
            pgn: api::encode_pgn(pgn).map_err(|e| ClientError::Transport(format!("{e:#}")))?,
        };
        self.post::<_, Empty>("upload_pgn", &request).map(|_| ())
    }
}

//! JSON bodies exchanged between workers, users and the scheduler's HTTP front-end.
//!
//! Every response is a JSON object. A response carrying an `error` key is a failure,
//! whatever the HTTP status. Errors about a task the worker no longer holds start with
//! [`STALE_TASK`] so the worker can tell them apart from other rejections.

use std::io::{Read, Write};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{
    model::{RunId, Stats, WorkerInfo},
    scheduler::{PurgeOutcome, RunModification, RunRequest, SpsaResult, TaskAssignment},
};

/// Prefix of the error message of a stale task.
pub const STALE_TASK: &str = "StaleTask";

/// Body of `request_version` and `request_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker_info: WorkerInfo,
    pub password: String,
}

/// A worker request about one of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub worker_info: WorkerInfo,
    pub password: String,
    pub run_id: RunId,
    pub task_id: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(flatten)]
    pub task: TaskRef,
    /// Cumulative counters of the task since it was handed out.
    pub stats: Stats,
    #[serde(default)]
    pub spsa: Option<SpsaResult>,
}

/// Body of `failed_task` and `stop_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessageRequest {
    #[serde(flatten)]
    pub task: TaskRef,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPgnRequest {
    #[serde(flatten)]
    pub task: TaskRef,
    /// base64 of the zlib-compressed PGN text.
    pub pgn: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResponse {
    Assigned(TaskAssignment),
    Waiting { task_waiting: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Credentials of a user acting on runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub run: RunRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRunResponse {
    pub run_id: RunId,
}

/// Body of `approve_run`, `stop_run`, `delete_run` and `purge_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunActionRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyRunRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub run_id: RunId,
    #[serde(flatten)]
    pub changes: RunModification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub outcome: PurgeOutcome,
}

/// Compress and encode a PGN for `upload_pgn`.
pub fn encode_pgn(pgn: &str) -> anyhow::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(pgn.as_bytes())?;
    let compressed = encoder.finish().context("could not compress PGN")?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_pgn(payload: &str) -> anyhow::Result<String> {
    let compressed = STANDARD
        .decode(payload.trim())
        .context("PGN payload is not valid base64")?;
    let mut pgn = String::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_string(&mut pgn)
        .context("PGN payload is not valid zlib-compressed UTF-8")?;
    Ok(pgn)
}

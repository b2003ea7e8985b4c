//! HTTP front-end of the scheduler.
//!
//! [`ApiService`] maps an endpoint and a JSON body to a JSON response and holds no transport
//! code, so it can be driven directly from tests. [`spawn`] puts it behind a `tiny_http`
//! server with a pool of request threads and a background scavenger releasing dead tasks.
//!
//! Worker endpoints (`POST`, body carries `worker_info` and `password`):
//! `/api/request_version`, `/api/request_task`, `/api/update_task`, `/api/failed_task`,
//! `/api/stop_run`, `/api/beat`, `/api/request_spsa`, `/api/upload_pgn`.
//!
//! User endpoints (`POST`, body carries `username` and `password`):
//! `/api/admin/submit_run`, `/api/admin/approve_run`, `/api/admin/modify_run`,
//! `/api/admin/stop_run`, `/api/admin/delete_run`, `/api/admin/purge_run`.
//!
//! Read endpoints (`GET`): `/api/active_runs`, `/api/finished_runs`, `/api/get_run/<id>`,
//! `/api/get_elo/<id>`, `/api/actions`, `/api/pgn/<run id>/<task id>`.

pub mod auth;

use std::{
    io::Read,
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub use auth::{Authenticator, OpenAccess, UserTable};

use crate::{
    action_log::{ActionFilter, ActionKind},
    api::{
        self, ModifyRunRequest, PurgeResponse, RunActionRequest, SubmitRunRequest, SubmitRunResponse,
        TaskMessageRequest, TaskRef, TaskResponse, UpdateTaskRequest, UploadPgnRequest,
        VersionResponse, WorkerRequest,
    },
    cache::{SummaryCache, UploadGate},
    configuration::Configuration,
    error::SchedulerError,
    model::{RunId, WorkerInfo},
    repository::{Page, RunFilter, RunRepository},
    scheduler::{Caller, FleetSummary, TaskScheduler},
};

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            ApiError::Scheduler(err) => match err {
                SchedulerError::Unauthorized => 401,
                SchedulerError::Forbidden(_) | SchedulerError::SelfApproval(_) => 403,
                SchedulerError::RunNotFound(_) => 404,
                SchedulerError::StaleTask { .. }
                | SchedulerError::AlreadyApproved(_) => 409,
                SchedulerError::InvalidRun(_) | SchedulerError::InvalidUpdate(_) => 400,
                SchedulerError::Contention(_) => 503,
                SchedulerError::Repository(_) => 500,
            },
            ApiError::Malformed(_) | ApiError::BadRequest(_) => 400,
            ApiError::UnknownEndpoint(_) => 404,
            ApiError::Internal(_) => 500,
        }
    }
}

type ApiResult = Result<Value, ApiError>;

/// A JSON response and its HTTP status.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_error(&self) -> bool {
        self.body.get("error").is_some()
    }
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    Ok(serde_json::from_str(body)?)
}

fn to_json<T: Serialize>(value: &T) -> ApiResult {
    Ok(serde_json::to_value(value)?)
}

fn empty() -> ApiResult {
    Ok(json!({}))
}

/// `key=value` pairs of a query string. Values are taken verbatim.
fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn page_from_query(query: &str) -> Result<Page, ApiError> {
    let mut page = Page::default();
    for (key, value) in query_pairs(query) {
        let parse_count = |value: &str| {
            value
                .parse::<usize>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {key}: {value}")))
        };
        match key {
            "skip" => page.skip = parse_count(value)?,
            "limit" => page.limit = parse_count(value)?,
            _ => {}
        }
    }
    Ok(page)
}

fn run_id_from(segment: &str) -> Result<RunId, ApiError> {
    segment
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid run id: {segment}")))
}

/// Endpoint dispatch of the scheduler API.
pub struct ApiService<R: RunRepository, A: Authenticator> {
    scheduler: TaskScheduler<R>,
    auth: A,
    worker_version: u32,
    summary: SummaryCache<FleetSummary>,
    uploads: UploadGate,
}

impl<R: RunRepository, A: Authenticator> ApiService<R, A> {
    pub fn new(scheduler: TaskScheduler<R>, auth: A) -> Self {
        let config = Configuration::new();
        Self {
            scheduler,
            auth,
            worker_version: config.worker_version,
            summary: SummaryCache::new(config.summary_ttl),
            uploads: UploadGate::new(),
        }
    }

    /// Use the version and cache settings of `config`.
    #[must_use]
    pub fn with_configuration(self, config: &Configuration) -> Self {
        Self {
            worker_version: config.worker_version,
            summary: SummaryCache::new(config.summary_ttl),
            ..self
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler<R> {
        &self.scheduler
    }

    /// Answer one request. `path` may carry a query string.
    #[instrument(skip(self, body, remote_addr), fields(remote = remote_addr.unwrap_or("-")))]
    pub fn handle(&self, method: &str, path: &str, body: &str, remote_addr: Option<&str>) -> ApiResponse {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let result = match method {
            "POST" => self.handle_post(route, body, remote_addr),
            "GET" => self.handle_get(route, query),
            _ => Err(ApiError::UnknownEndpoint(format!("{method} {route}"))),
        };
        match result {
            Ok(body) => ApiResponse { status: 200, body },
            Err(err) => {
                let status = err.status();
                if status >= 500 {
                    error!(%route, "{err}");
                } else {
                    debug!(%route, status, "{err}");
                }
                ApiResponse {
                    status,
                    body: json!({ "error": err.to_string() }),
                }
            }
        }
    }

    fn handle_post(&self, route: &str, body: &str, remote_addr: Option<&str>) -> ApiResult {
        match route {
            "/api/request_version" => {
                let request: WorkerRequest = parse(body)?;
                self.worker(request.worker_info, &request.password, remote_addr)?;
                to_json(&VersionResponse {
                    version: self.worker_version,
                })
            }
            "/api/request_task" => {
                let request: WorkerRequest = parse(body)?;
                let worker = self.worker(request.worker_info, &request.password, remote_addr)?;
                if worker.version < self.worker_version {
                    return Err(ApiError::BadRequest(format!(
                        "worker version {} is too old, {} is required",
                        worker.version, self.worker_version
                    )));
                }
                let response = match self.scheduler.request_task(&worker)? {
                    Some(assignment) => TaskResponse::Assigned(assignment),
                    None => TaskResponse::Waiting { task_waiting: true },
                };
                to_json(&response)
            }
            "/api/update_task" => {
                let request: UpdateTaskRequest = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request.task, remote_addr)?;
                let status = self
                    .scheduler
                    .update_task(run_id, task_id, &worker, request.stats, request.spsa)?;
                to_json(&status)
            }
            "/api/failed_task" => {
                let request: TaskMessageRequest = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request.task, remote_addr)?;
                self.scheduler
                    .failed_task(run_id, task_id, &worker, &request.message)?;
                empty()
            }
            "/api/stop_run" => {
                let request: TaskMessageRequest = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request.task, remote_addr)?;
                self.scheduler
                    .worker_stop_run(run_id, task_id, &worker, &request.message)?;
                self.summary.invalidate();
                empty()
            }
            "/api/beat" => {
                let request: TaskRef = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request, remote_addr)?;
                self.scheduler.beat(run_id, task_id, &worker)?;
                empty()
            }
            "/api/request_spsa" => {
                let request: TaskRef = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request, remote_addr)?;
                to_json(&self.scheduler.request_spsa(run_id, task_id, &worker)?)
            }
            "/api/upload_pgn" => {
                let request: UploadPgnRequest = parse(body)?;
                let (worker, run_id, task_id) = self.task_ref(request.task, remote_addr)?;
                self.uploads
                    .run(|| self.store_pgn(run_id, task_id, &worker, &request.pgn))?;
                empty()
            }
            route => match route.strip_prefix("/api/admin/") {
                Some(action) => {
                    let result = self.handle_admin(action, body);
                    self.summary.invalidate();
                    result
                }
                None => Err(ApiError::UnknownEndpoint(format!("POST {route}"))),
            },
        }
    }

    fn handle_admin(&self, action: &str, body: &str) -> ApiResult {
        match action {
            "submit_run" => {
                let request: SubmitRunRequest = parse(body)?;
                let caller = self.user(&request.credentials.username, &request.credentials.password)?;
                let run_id = self.scheduler.submit_run(request.run, &caller)?;
                to_json(&SubmitRunResponse { run_id })
            }
            "modify_run" => {
                let request: ModifyRunRequest = parse(body)?;
                let caller = self.user(&request.credentials.username, &request.credentials.password)?;
                self.scheduler
                    .modify_run(request.run_id, &caller, request.changes)?;
                empty()
            }
            "approve_run" | "stop_run" | "delete_run" | "purge_run" => {
                let request: RunActionRequest = parse(body)?;
                let caller = self.user(&request.credentials.username, &request.credentials.password)?;
                let run_id = request.run_id;
                match action {
                    "approve_run" => self.scheduler.approve_run(run_id, &caller)?,
                    "stop_run" => self.scheduler.stop_run(run_id, &caller)?,
                    "delete_run" => self.scheduler.delete_run(run_id, &caller)?,
                    _ => {
                        let outcome = self.scheduler.purge_run(run_id, &caller)?;
                        return to_json(&PurgeResponse { outcome });
                    }
                }
                empty()
            }
            other => Err(ApiError::UnknownEndpoint(format!("POST /api/admin/{other}"))),
        }
    }

    fn handle_get(&self, route: &str, query: &str) -> ApiResult {
        let segments: Vec<&str> = route.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["api", "active_runs"] => {
                let cached = self
                    .summary
                    .get_or_refresh(|| Ok(self.scheduler.summarize()?))
                    .map_err(ApiError::Internal)?;
                let mut body = to_json(&*cached.value)?;
                body["generation"] = json!(cached.generation);
                Ok(body)
            }
            ["api", "finished_runs"] => {
                let mut filter = RunFilter::default();
                for (key, value) in query_pairs(query) {
                    match key {
                        "username" => filter.username = Some(value.to_string()),
                        "green" => filter.green_only = value == "true",
                        "yellow" => filter.yellow_only = value == "true",
                        _ => {}
                    }
                }
                let (runs, total) = self
                    .scheduler
                    .finished_runs(&filter, page_from_query(query)?)?;
                let runs: Vec<_> = runs.iter().map(|run| run.without_tasks()).collect();
                Ok(json!({ "runs": runs, "total": total }))
            }
            ["api", "get_run", id] => to_json(&self.scheduler.get_run(run_id_from(id)?)?),
            ["api", "get_elo", id] => to_json(&self.scheduler.get_elo(run_id_from(id)?)?),
            ["api", "actions"] => {
                let mut filter = ActionFilter::default();
                for (key, value) in query_pairs(query) {
                    match key {
                        "username" => filter.username = Some(value.to_string()),
                        "run_id" => filter.run_id = Some(run_id_from(value)?),
                        "action" => {
                            let kind: ActionKind = serde_json::from_value(json!(value))
                                .map_err(|_| ApiError::BadRequest(format!("unknown action {value}")))?;
                            filter.kind = Some(kind);
                        }
                        _ => {}
                    }
                }
                to_json(&self.scheduler.actions(&filter, page_from_query(query)?)?)
            }
            ["api", "pgn", run_id, task_id] => {
                let run_id = run_id_from(run_id)?;
                let task_id: usize = task_id
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid task id: {task_id}")))?;
                let pgn = self
                    .scheduler
                    .repository()
                    .get_pgn(run_id, task_id)
                    .map_err(SchedulerError::from)?
                    .ok_or_else(|| ApiError::BadRequest(format!("no PGN for task {task_id} of run {run_id}")))?;
                Ok(json!({ "pgn": String::from_utf8_lossy(&pgn) }))
            }
            _ => Err(ApiError::UnknownEndpoint(format!("GET {route}"))),
        }
    }

    fn user(&self, username: &str, password: &str) -> Result<Caller, ApiError> {
        self.auth
            .authenticate(username, password)
            .ok_or(ApiError::Scheduler(SchedulerError::Unauthorized))
    }

    /// Check the worker's credentials and stamp its address.
    fn worker(
        &self,
        mut worker_info: WorkerInfo,
        password: &str,
        remote_addr: Option<&str>,
    ) -> Result<WorkerInfo, ApiError> {
        self.user(&worker_info.username, password)?;
        worker_info.remote_addr = remote_addr.map(str::to_string);
        Ok(worker_info)
    }

    fn task_ref(&self, task: TaskRef, remote_addr: Option<&str>) -> Result<(WorkerInfo, RunId, usize), ApiError> {
        let worker = self.worker(task.worker_info, &task.password, remote_addr)?;
        Ok((worker, task.run_id, task.task_id))
    }

    /// Only the worker that played the task may upload its games, once.
    fn store_pgn(&self, run_id: RunId, task_id: usize, worker: &WorkerInfo, payload: &str) -> Result<(), ApiError> {
        let run = self.scheduler.get_run(run_id)?;
        let owned = run
            .tasks
            .get(task_id)
            .is_some_and(|task| task.worker_info.unique_key == worker.unique_key);
        if !owned {
            return Err(SchedulerError::StaleTask { run_id, task_id }.into());
        }
        let pgn = api::decode_pgn(payload).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
        let stored = self
            .scheduler
            .repository()
            .store_pgn(run_id, task_id, pgn.into_bytes())
            .map_err(SchedulerError::from)?;
        if stored {
            info!(%run_id, task_id, "PGN stored");
        } else {
            debug!(%run_id, task_id, "Duplicate PGN upload ignored");
        }
        Ok(())
    }
}

/// Stop signal shared by the server threads.
#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn trigger(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` once shutdown was requested.
    fn sleep(&self, duration: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

/// A running server. Dropping it does not stop the threads; call [`ServerHandle::shutdown`].
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<Shutdown>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ask every thread to stop without waiting for them.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Stop and wait for every thread.
    pub fn shutdown(self) -> anyhow::Result<()> {
        self.stop();
        self.join()
    }

    /// Wait until the server is stopped from another thread.
    pub fn join(self) -> anyhow::Result<()> {
        for thread in self.threads {
            thread
                .join()
                .map_err(|_| anyhow!("a server thread panicked"))?;
        }
        Ok(())
    }

    /// Handle that stops this server from another thread.
    pub fn stopper(&self) -> impl Fn() + Send + Sync + 'static {
        let shutdown = Arc::clone(&self.shutdown);
        move || shutdown.trigger()
    }
}

const RECV_TIMEOUT: Duration = Duration::from_millis(200);

fn serve_requests<R: RunRepository, A: Authenticator>(
    server: &tiny_http::Server,
    service: &ApiService<R, A>,
    shutdown: &Shutdown,
) {
    while !shutdown.is_triggered() {
        let mut request = match server.recv_timeout(RECV_TIMEOUT) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!("Could not receive request: {e}");
                continue;
            }
        };
        let mut body = String::new();
        let response = match request.as_reader().read_to_string(&mut body) {
            Ok(_) => {
                let remote = request.remote_addr().map(|addr| addr.ip().to_string());
                service.handle(
                    request.method().as_str(),
                    request.url(),
                    &body,
                    remote.as_deref(),
                )
            }
            Err(e) => ApiResponse {
                status: 400,
                body: json!({ "error": format!("could not read body: {e}") }),
            },
        };
        let mut http_response =
            tiny_http::Response::from_string(response.body.to_string()).with_status_code(response.status);
        if let Ok(header) = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            http_response.add_header(header);
        }
        if let Err(e) = request.respond(http_response) {
            debug!("Could not send response: {e}");
        }
    }
}

/// Listen on the configured address with `http_threads` request threads, plus one thread
/// releasing dead tasks every quarter of the dead task timeout.
pub fn spawn<R, A>(service: Arc<ApiService<R, A>>, config: &Configuration) -> anyhow::Result<ServerHandle>
where
    R: RunRepository + 'static,
    A: Authenticator + 'static,
{
    let server = tiny_http::Server::http(config.bind)
        .map_err(|e| anyhow!("could not listen on {}: {e}", config.bind))?;
    let addr = server
        .server_addr()
        .to_ip()
        .context("server is not bound to an IP address")?;
    let server = Arc::new(server);
    let shutdown = Arc::new(Shutdown::default());

    let mut threads = Vec::with_capacity(config.http_threads + 1);
    for i in 0..config.http_threads {
        let (server, service, shutdown) = (Arc::clone(&server), Arc::clone(&service), Arc::clone(&shutdown));
        let thread = std::thread::Builder::new()
            .name(format!("http-{i}"))
            .spawn(move || serve_requests(&server, &service, &shutdown))
            .context("could not spawn request thread")?;
        threads.push(thread);
    }

    let period = (config.dead_task_timeout / 4).max(Duration::from_secs(1));
    let (scavenger_service, scavenger_shutdown) = (Arc::clone(&service), Arc::clone(&shutdown));
    let scavenger = std::thread::Builder::new()
        .name("scavenger".to_string())
        .spawn(move || {
            while scavenger_shutdown.sleep(period) {
                match scavenger_service.scheduler().scavenge() {
                    Ok(0) => {}
                    Ok(runs) => {
                        info!(runs, "Dead tasks released");
                        scavenger_service.summary.invalidate();
                    }
                    Err(e) => warn!("Scavenging failed: {e}"),
                }
            }
        })
        .context("could not spawn scavenger thread")?;
    threads.push(scavenger);

    info!(%addr, threads = config.http_threads, "Scheduler listening");
    Ok(ServerHandle {
        addr,
        shutdown,
        threads,
    })
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn service() -> ApiService<InMemoryRepository, UserTable> {
        let users = UserTable::new()
            .with_user("alice", "a", false)
            .with_user("carol", "c", true)
            .with_user("bob", "b", false);
        ApiService::new(TaskScheduler::new(Arc::new(InMemoryRepository::new())), users)
    }

    #[test]
    fn test_errors_are_json_objects() {
        let service = service();
        let response = service.handle("POST", "/api/nowhere", "{}", None);
        assert_eq!(response.status, 404);
        assert!(response.is_error());

        let response = service.handle("POST", "/api/request_version", "not json", None);
        assert_eq!(response.status, 400);
        assert!(response.is_error());

        let body = json!({ "worker_info": WorkerInfo { username: "bob".into(), ..WorkerInfo::default() }, "password": "wrong" });
        let response = service.handle("POST", "/api/request_version", &body.to_string(), None);
        assert_eq!(response.status, 401);
        assert!(response.is_error());
    }

    #[test]
    fn test_request_version() {
        let service = service();
        let body = json!({ "worker_info": WorkerInfo { username: "bob".into(), ..WorkerInfo::default() }, "password": "b" });
        let response = service.handle("POST", "/api/request_version", &body.to_string(), Some("10.0.0.1"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({ "version": crate::worker::WORKER_VERSION }));
    }

    #[test]
    fn test_query_parsing() {
        let page = page_from_query("skip=10&limit=5&username=alice").unwrap();
        assert_eq!((page.skip, page.limit), (10, 5));
        assert!(page_from_query("limit=many").is_err());
        assert_eq!(page_from_query("").unwrap(), Page::default());
    }

    #[test]
    fn test_read_endpoints() {
        let service = service();
        let response = service.handle("GET", "/api/active_runs", "", None);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["runs"], json!([]));
        assert_eq!(service.handle("GET", "/api/get_run/12", "", None).status, 404);
        assert_eq!(service.handle("GET", "/api/get_run/abc", "", None).status, 400);
        let response = service.handle("GET", "/api/actions?username=alice", "", None);
        assert_eq!(response.body, json!([]));
        let response = service.handle("GET", "/api/finished_runs?green=true", "", None);
        assert_eq!(response.body["total"], json!(0));
    }
}

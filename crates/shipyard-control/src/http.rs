//! JSON + WebSocket API.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shipyard_job::{DeployMode, DomainSpec, Job, JobId, LogEvent, Runtime, RuntimeSpec};
use tracing::Instrument;

use crate::broker::Subscription;
use crate::error::DeployError;
use crate::lifecycle::AppView;
use crate::supervisor::ServiceState;
use crate::queue::{DeployRequest, RequestSource};
use crate::security;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub field_errors: BTreeMap<String, String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            field_errors: BTreeMap::new(),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::Validation { .. } => StatusCode::BAD_REQUEST,
            DeployError::NotFound { .. } => StatusCode::NOT_FOUND,
            DeployError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DeployError::Store(_) | DeployError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        let code = err.code();
        match err {
            DeployError::Validation {
                message,
                field_errors,
            } => Self {
                status,
                code: code.to_string(),
                message,
                field_errors,
            },
            other => Self::new(status, code, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct Accepted {
    job_id: JobId,
    message: String,
}

fn accepted(job_id: JobId, message: String) -> Response {
    (StatusCode::ACCEPTED, Json(Accepted { job_id, message })).into_response()
}

fn parse_runtime(raw: &str) -> ApiResult<Runtime> {
    raw.parse::<Runtime>().map_err(|e| {
        DeployError::validation("runtime", format!("{e}; expected node, python or bun")).into()
    })
}

#[derive(Debug, Deserialize)]
struct GitDeployBody {
    app_name: String,
    repository: String,
    #[serde(default = "default_branch")]
    branch: String,
    runtime: String,
    #[serde(default)]
    install_command: String,
    #[serde(default)]
    build_command: Option<String>,
    start_command: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    domains: Vec<DomainSpec>,
}

fn default_branch() -> String {
    "main".to_string()
}

async fn deploy_git(
    State(state): State<AppState>,
    Json(body): Json<GitDeployBody>,
) -> ApiResult<Response> {
    let runtime = parse_runtime(&body.runtime)?;
    let app_name = body.app_name.trim().to_string();
    let id = state
        .queue
        .enqueue(DeployRequest {
            app_name: app_name.clone(),
            mode: DeployMode::Create,
            source: RequestSource::Git {
                repository: body.repository,
                branch: body.branch,
            },
            runtime: RuntimeSpec {
                runtime,
                install_command: body.install_command,
                build_command: body.build_command,
                start_command: body.start_command,
                env: body.env,
            },
            domains: body.domains,
        })
        .await?;
    Ok(accepted(id, format!("deployment of {app_name} queued")))
}

/// Query parameters of a raw zip upload.
#[derive(Debug, Deserialize)]
struct FileDeployQuery {
    app_name: String,
    runtime: String,
    #[serde(default)]
    install_command: String,
    #[serde(default)]
    build_command: Option<String>,
    start_command: String,
    /// JSON object of environment variables.
    #[serde(default)]
    env: Option<String>,
    /// Comma-separated domains.
    #[serde(default)]
    domains: Option<String>,
    #[serde(default)]
    tls: bool,
}

async fn deploy_file(
    State(state): State<AppState>,
    Query(q): Query<FileDeployQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let runtime = parse_runtime(&q.runtime)?;
    let env: BTreeMap<String, String> = match q.env.as_deref().map(str::trim) {
        None | Some("") => BTreeMap::new(),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            ApiError::from(DeployError::validation(
                "env",
                format!("expected a JSON object of strings: {e}"),
            ))
        })?,
    };
    let domains = q
        .domains
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| DomainSpec {
            domain: d.to_string(),
            tls: q.tls,
        })
        .collect();

    let app_name = q.app_name.trim().to_string();
    let id = state
        .queue
        .enqueue(DeployRequest {
            app_name: app_name.clone(),
            mode: DeployMode::Create,
            source: RequestSource::Archive(body.to_vec()),
            runtime: RuntimeSpec {
                runtime,
                install_command: q.install_command,
                build_command: q.build_command,
                start_command: q.start_command,
                env,
            },
            domains,
        })
        .await?;
    Ok(accepted(id, format!("deployment of {app_name} queued")))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.queue.list_all().await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.status(JobId(id)).await?))
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    // Resolve before upgrading so unknown jobs get a plain 404.
    let sub = state.queue.subscribe(JobId(id)).await?;
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, sub)))
}

async fn stream_logs(socket: WebSocket, mut sub: Subscription) {
    let span = tracing::info_span!("job_logs", job_id = %sub.job_id(), subscriber = sub.id());
    async move {
        let (mut sender, mut receiver) = socket.split();
        loop {
            tokio::select! {
                event = sub.next() => {
                    let Some(event) = event else { break };
                    let msg = match &event {
                        LogEvent::Chunk { text } => Message::Text(text.clone()),
                        LogEvent::End { .. } => match serde_json::to_string(&event) {
                            Ok(json) => Message::Text(json),
                            Err(_) => break,
                        },
                    };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                    if matches!(event, LogEvent::End { .. }) {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
        tracing::debug!("log stream closed");
    }
    .instrument(span)
    .await
}

async fn get_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AppView>> {
    Ok(Json(state.lifecycle.view(&name).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn app_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.queue.history(&name, q.limit).await?))
}

async fn redeploy_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let id = state.lifecycle.redeploy(&name).await?;
    Ok(accepted(id, format!("redeployment of {name} queued")))
}

#[derive(Debug, Deserialize)]
struct DomainsBody {
    domains: Vec<DomainSpec>,
}

async fn set_domains(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DomainsBody>,
) -> ApiResult<Response> {
    let id = state.lifecycle.set_domains(&name, body.domains).await?;
    Ok(accepted(id, format!("domain update of {name} queued")))
}

async fn add_domain(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DomainSpec>,
) -> ApiResult<Response> {
    let domain = body.domain.clone();
    let id = state.lifecycle.add_domain(&name, body).await?;
    Ok(accepted(id, format!("adding {domain} to {name}")))
}

async fn remove_domain(
    State(state): State<AppState>,
    Path((name, domain)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = state.lifecycle.remove_domain(&name, &domain).await?;
    Ok(accepted(id, format!("removing {domain} from {name}")))
}

#[derive(Debug, Serialize)]
struct ServiceResponse {
    app: String,
    service: ServiceState,
}

async fn start_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = state.lifecycle.start(&name).await?;
    Ok(Json(ServiceResponse { app: name, service }))
}

async fn stop_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = state.lifecycle.stop(&name).await?;
    Ok(Json(ServiceResponse { app: name, service }))
}

async fn restart_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = state.lifecycle.restart(&name).await?;
    Ok(Json(ServiceResponse { app: name, service }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_lines() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct ServiceLogs {
    app: String,
    lines: Vec<String>,
}

async fn service_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<ServiceLogs>> {
    let lines = state.lifecycle.service_logs(&name, q.lines).await?;
    Ok(Json(ServiceLogs { app: name, lines }))
}

#[derive(Debug, Serialize)]
struct Deleted {
    message: String,
}

async fn delete_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Deleted>> {
    state.lifecycle.delete(&name).await?;
    Ok(Json(Deleted {
        message: format!("{name} deleted"),
    }))
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    read_only: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        read_only: state.config.read_only,
    })
}

pub fn router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);

    let api = Router::new()
        .route("/deployments/git", post(deploy_git))
        .route(
            "/deployments/file",
            post(deploy_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/logs", get(job_logs))
        .route("/apps/:name", get(get_app).delete(delete_app))
        .route("/apps/:name/history", get(app_history))
        .route("/apps/:name/redeploy", post(redeploy_app))
        .route("/apps/:name/start", post(start_app))
        .route("/apps/:name/stop", post(stop_app))
        .route("/apps/:name/restart", post(restart_app))
        .route("/apps/:name/logs", get(service_logs))
        .route("/apps/:name/domains", post(add_domain).put(set_domains))
        .route("/apps/:name/domains/:domain", delete(remove_domain))
        .layer(middleware::from_fn_with_state(state.clone(), security::guard));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .with_state(state)
}

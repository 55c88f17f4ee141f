//! Submission & result API: the narrow JSON surface the dashboard layer
//! calls.
//!
//! Session handling and HTML live in the dashboard, outside this crate; it
//! authenticates its users and passes the acting user id in the `x-user-id`
//! header. All handlers are synchronous over the store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{CreditPolicy, LimitsConfig};
use crate::error::GridError;
use crate::protocol::JobDemands;
use crate::registry::WorkerRegistry;
use crate::scheduler::matcher::job_cost;
use crate::store::{
    ArtifactMeta, JobRow, JobStatus, LedgerKind, NewJob, Role, Store, WorkerRow,
};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub registry: Arc<WorkerRegistry>,
    pub policy: CreditPolicy,
    pub limits: LimitsConfig,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/users", post(create_user_handler))
        .route("/api/users/:id/balance", get(balance_handler))
        .route("/api/users/:id/ledger", get(ledger_handler))
        .route("/api/jobs", post(submit_job_handler).get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/admin/grant", post(grant_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/leaderboard", get(leaderboard_handler))
        .route("/api/cost", post(cost_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the token is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, cancel: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "API server listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "API server failed");
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: GridError) -> Response {
    let status = match &e {
        GridError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        GridError::Forbidden => StatusCode::FORBIDDEN,
        GridError::UserNotFound(_) | GridError::JobNotFound(_) | GridError::WorkerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        GridError::NotPending(_) | GridError::NotRunning(_) => StatusCode::CONFLICT,
        GridError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!(error = %e, "API request failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: "service unavailable".to_string(),
                }),
            )
                .into_response();
        }
    };
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

fn requester(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|s| !s.is_empty())
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "missing x-user-id".to_string(),
        }),
    )
        .into_response()
}

// ==== users ====

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    role: Option<Role>,
}

#[derive(Serialize)]
struct CreateUserResponse {
    user_id: String,
    balance: i64,
}

async fn create_user_handler(
    State(state): State<ApiState>,
    Json(req): Json<CreateUserRequest>,
) -> Response {
    if req.username.is_empty() || req.password.is_empty() {
        return error_response(GridError::Invalid(
            "username and password are required".to_string(),
        ));
    }
    let role = req.role.unwrap_or(Role::Submitter);
    match state
        .store
        .create_user(
            &req.username,
            &req.password,
            role,
            state.policy.starting_balance,
        )
        .await
    {
        Ok(user) => (
            StatusCode::CREATED,
            Json(CreateUserResponse {
                user_id: user.id,
                balance: user.credits,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: i64,
}

async fn balance_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.balance(&id).await {
        Ok(balance) => Json(BalanceResponse {
            user_id: id,
            balance,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct LedgerEntryView {
    delta: i64,
    kind: String,
    job_id: Option<String>,
    note: Option<String>,
    at: chrono::DateTime<chrono::Utc>,
}

async fn ledger_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.ledger_for_user(&id).await {
        Ok(rows) => {
            let entries: Vec<LedgerEntryView> = rows
                .into_iter()
                .map(|r| LedgerEntryView {
                    delta: r.delta,
                    kind: r.kind.to_string(),
                    job_id: r.job_id,
                    note: r.note,
                    at: r.at,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ==== jobs ====

#[derive(Deserialize)]
struct SubmitJobRequest {
    title: String,
    code: String,
    requirements: Option<String>,
    demands: JobDemands,
    priority: Option<i64>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: String,
    cost: i64,
    balance: i64,
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SubmitJobRequest>,
) -> Response {
    let Some(submitter) = requester(&headers) else {
        return unauthenticated();
    };
    if let Err(e) = validate_demands(&req.demands, &state.limits) {
        return error_response(e);
    }
    if req.title.is_empty() || req.code.is_empty() {
        return error_response(GridError::Invalid("title and code are required".to_string()));
    }

    let cost = job_cost(&req.demands);
    let new_job = NewJob {
        title: req.title,
        code: req.code,
        requirements: req.requirements,
        demands: req.demands,
        priority: req.priority.unwrap_or(5),
        cost,
        reward: cost,
    };

    match state.store.enqueue_job(&submitter, new_job).await {
        Ok(job) => {
            let balance = match state.store.balance(&submitter).await {
                Ok(b) => b,
                Err(e) => return error_response(e),
            };
            tracing::info!(job_id = %job.id, %submitter, cost, "Job submitted");
            (
                StatusCode::CREATED,
                Json(SubmitJobResponse {
                    job_id: job.id,
                    cost,
                    balance,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

fn validate_demands(demands: &JobDemands, limits: &LimitsConfig) -> Result<(), GridError> {
    if demands.cpu_cores == 0 {
        return Err(GridError::Invalid("cpu_cores must be positive".to_string()));
    }
    if demands.ram_gb <= 0.0 || !demands.ram_gb.is_finite() {
        return Err(GridError::Invalid("ram_gb must be positive".to_string()));
    }
    if demands.timeout_seconds == 0 {
        return Err(GridError::Invalid(
            "timeout_seconds must be positive".to_string(),
        ));
    }
    if demands.timeout_seconds > limits.max_timeout_seconds {
        return Err(GridError::Invalid(format!(
            "timeout_seconds exceeds the maximum of {}",
            limits.max_timeout_seconds
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct JobView {
    id: String,
    title: String,
    status: JobStatus,
    priority: i64,
    submitter_id: String,
    worker_id: Option<String>,
    demands: JobDemands,
    credit_cost: i64,
    credit_reward: i64,
    code: String,
    requirements: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    error_reason: Option<String>,
    artifacts: Vec<ArtifactMeta>,
    ran_sandboxed: Option<bool>,
    submitted_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl JobView {
    fn from_row(job: JobRow) -> Self {
        let artifacts = job
            .artifacts
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        Self {
            demands: job.demands(),
            id: job.id,
            title: job.title,
            status: job.status,
            priority: job.priority,
            submitter_id: job.submitter_id,
            worker_id: job.worker_id,
            credit_cost: job.credit_cost,
            credit_reward: job.credit_reward,
            code: job.code,
            requirements: job.requirements,
            stdout: job.stdout,
            stderr: job.stderr,
            error_reason: job.error_reason,
            artifacts,
            ran_sandboxed: job.ran_sandboxed,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

async fn get_job_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(requester_id) = requester(&headers) else {
        return unauthenticated();
    };
    let job = match state.store.get_job(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return error_response(GridError::JobNotFound(id)),
        Err(e) => return error_response(e),
    };

    // Visible to the submitter and the coordinator only.
    if job.submitter_id != requester_id {
        match state.store.user_by_id(&requester_id).await {
            Ok(Some(user)) if user.role == Role::Coordinator => {}
            Ok(_) => return error_response(GridError::Forbidden),
            Err(e) => return error_response(e),
        }
    }

    Json(JobView::from_row(job)).into_response()
}

async fn list_jobs_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let Some(requester_id) = requester(&headers) else {
        return unauthenticated();
    };
    match state.store.jobs_for_user(&requester_id, 50).await {
        Ok(jobs) => {
            let views: Vec<JobView> = jobs.into_iter().map(JobView::from_row).collect();
            Json(views).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct CancelJobResponse {
    job_id: String,
    status: JobStatus,
    balance: i64,
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(requester_id) = requester(&headers) else {
        return unauthenticated();
    };
    match state.store.cancel_pending(&id, &requester_id).await {
        Ok(job) => {
            let balance = match state.store.balance(&requester_id).await {
                Ok(b) => b,
                Err(e) => return error_response(e),
            };
            tracing::info!(job_id = %job.id, "Job cancelled");
            Json(CancelJobResponse {
                job_id: job.id,
                status: job.status,
                balance,
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ==== workers ====

#[derive(Serialize)]
struct OwnedWorkerView {
    id: String,
    name: String,
    status: String,
    cpu_cores: i64,
    ram_gb: f64,
    gpu_name: Option<String>,
    docker_available: bool,
    jobs_completed: i64,
    credits_earned: i64,
    last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    connected: bool,
}

/// What a submitter sees: capacity currently on the network, nothing
/// identifying.
#[derive(Serialize)]
struct PublicWorkerView {
    name: String,
    status: String,
    cpu_cores: u32,
    ram_gb: f64,
    gpu_name: Option<String>,
}

async fn list_workers_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let Some(requester_id) = requester(&headers) else {
        return unauthenticated();
    };
    let role = match state.store.user_by_id(&requester_id).await {
        Ok(Some(user)) => user.role,
        Ok(None) => return error_response(GridError::UserNotFound(requester_id)),
        Err(e) => return error_response(e),
    };

    match role {
        Role::Coordinator => match state.store.list_workers().await {
            Ok(rows) => owned_views(state, rows).await,
            Err(e) => error_response(e),
        },
        Role::WorkerOwner => match state.store.workers_for_owner(&requester_id).await {
            Ok(rows) => owned_views(state, rows).await,
            Err(e) => error_response(e),
        },
        Role::Submitter => {
            let views: Vec<PublicWorkerView> = state
                .registry
                .snapshot()
                .await
                .into_iter()
                .map(|w| PublicWorkerView {
                    name: w.name,
                    status: w.status.to_string(),
                    cpu_cores: w.specs.cpu_cores,
                    ram_gb: w.specs.ram_gb,
                    gpu_name: w.specs.gpu_name,
                })
                .collect();
            Json(views).into_response()
        }
    }
}

async fn owned_views(state: ApiState, rows: Vec<WorkerRow>) -> Response {
    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let connected = state.registry.contains(&row.id).await;
        views.push(OwnedWorkerView {
            id: row.id,
            name: row.name,
            status: row.status.to_string(),
            cpu_cores: row.cpu_cores,
            ram_gb: row.ram_gb,
            gpu_name: row.gpu_name,
            docker_available: row.docker_available,
            jobs_completed: row.jobs_completed,
            credits_earned: row.credits_earned,
            last_heartbeat_at: row.last_heartbeat_at,
            connected,
        });
    }
    Json(views).into_response()
}

// ==== admin & misc ====

#[derive(Deserialize)]
struct GrantRequest {
    user_id: String,
    delta: i64,
    reason: String,
}

#[derive(Serialize)]
struct GrantResponse {
    user_id: String,
    balance: i64,
}

async fn grant_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<GrantRequest>,
) -> Response {
    let Some(requester_id) = requester(&headers) else {
        return unauthenticated();
    };
    match state.store.user_by_id(&requester_id).await {
        Ok(Some(user)) if user.role == Role::Coordinator => {}
        Ok(_) => return error_response(GridError::Forbidden),
        Err(e) => return error_response(e),
    }

    match state
        .store
        .adjust_credits(
            &req.user_id,
            req.delta,
            LedgerKind::AdminAdjust,
            None,
            Some(&req.reason),
        )
        .await
    {
        Ok(balance) => {
            tracing::info!(user_id = %req.user_id, delta = req.delta, "Admin credit adjustment");
            Json(GrantResponse {
                user_id: req.user_id,
                balance,
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stats_handler(State(state): State<ApiState>) -> Response {
    match state.store.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn leaderboard_handler(State(state): State<ApiState>) -> Response {
    match state.store.leaderboard(10).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CostRequest {
    demands: JobDemands,
}

#[derive(Serialize)]
struct CostResponse {
    cost: i64,
}

async fn cost_handler(State(state): State<ApiState>, Json(req): Json<CostRequest>) -> Response {
    if let Err(e) = validate_demands(&req.demands, &state.limits) {
        return error_response(e);
    }
    Json(CostResponse {
        cost: job_cost(&req.demands),
    })
    .into_response()
}

use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use axum::response::Html;
use gator_db::models::{AgentEvent, Invariant, Plan, Task};
use gator_db::queries::tasks::PlanProgress;
use gator_db::queries::{
    agent_events,
    gate_results::{self, GateResultWithName},
    invariants as invariant_db, plans as plan_db, tasks as task_db,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub pending: i64,
    pub assigned: i64,
    pub running: i64,
    pub checking: i64,
    pub passed: i64,
    pub failed: i64,
    pub escalated: i64,
    pub total: i64,
}

impl From<PlanProgress> for ProgressResponse {
    fn from(p: PlanProgress) -> Self {
        Self {
            pending: p.pending,
            assigned: p.assigned,
            running: p.running,
            checking: p.checking,
            passed: p.passed,
            failed: p.failed,
            escalated: p.escalated,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenUsageResponse {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize)]
pub struct PlanSummaryResponse {
    #[serde(flatten)]
    pub plan: Plan,
    pub progress: ProgressResponse,
}

#[derive(Debug, Serialize)]
pub struct PlanDetailResponse {
    #[serde(flatten)]
    pub plan: Plan,
    pub progress: ProgressResponse,
    pub token_usage: TokenUsageResponse,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub dependencies: Vec<Uuid>,
    pub invariants: Vec<Invariant>,
    pub events: Vec<AgentEvent>,
    pub gate_results: Vec<GateResultWithName>,
    pub token_usage: TokenUsageResponse,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: PgPool) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/plans", get(list_plans))
        .route("/api/plans/{id}", get(get_plan_detail))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/invariants", get(list_invariants_handler))
        .layer(CorsLayer::permissive())
        .with_state(pool)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("gator serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gator serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(pool): State<PgPool>) -> Result<axum::response::Response, AppError> {
    let plans = plan_db::list_plans(&pool)
        .await
        .map_err(AppError::internal)?;

    let rows = if plans.is_empty() {
        "<tr><td colspan=\"3\">No plans found.</td></tr>".to_string()
    } else {
        plans
            .iter()
            .map(|p| {
                format!(
                    "<tr><td><a href=\"/api/plans/{id}\">{name}</a></td><td>{status}</td><td>{id}</td></tr>",
                    id = p.id,
                    name = p.name,
                    status = p.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>gator</title></head><body>\
<h1>gator</h1>\
<p><a href=\"/api/plans\">/api/plans</a> | <a href=\"/api/invariants\">/api/invariants</a></p>\
<table><tr><th>Plan</th><th>Status</th><th>ID</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_plans(State(pool): State<PgPool>) -> Result<axum::response::Response, AppError> {
    let plans = plan_db::list_plans(&pool)
        .await
        .map_err(AppError::internal)?;

    let mut results = Vec::with_capacity(plans.len());
    for plan in plans {
        let progress = task_db::get_plan_progress(&pool, plan.id)
            .await
            .map_err(AppError::internal)?;
        results.push(PlanSummaryResponse {
            plan,
            progress: progress.into(),
        });
    }

    Ok(Json(results).into_response())
}

async fn get_plan_detail(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let plan = plan_db::get_plan(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("plan {id} not found")))?;

    let progress = task_db::get_plan_progress(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let tasks = task_db::list_tasks_for_plan(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let (input_tokens, output_tokens) = agent_events::get_token_usage_for_plan(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(PlanDetailResponse {
        plan,
        progress: progress.into(),
        token_usage: TokenUsageResponse {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
        tasks,
    })
    .into_response())
}

async fn get_task_detail(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let dependencies = task_db::get_task_dependencies(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let invariants = invariant_db::get_invariants_for_task(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let events = agent_events::list_all_events_for_task(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let gate_results = gate_results::get_latest_gate_results(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let (input_tokens, output_tokens) = agent_events::get_token_usage_for_task(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskDetailResponse {
        task,
        dependencies,
        invariants,
        events,
        gate_results,
        token_usage: TokenUsageResponse {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
    })
    .into_response())
}

async fn list_invariants_handler(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let invariants = invariant_db::list_invariants(&pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(invariants).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

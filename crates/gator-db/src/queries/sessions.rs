//! Database query functions for the `sessions` table -- one row per agent
//! attempt (coding, review, or merger phase).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Session, SessionRole, SessionStatus};

/// Parameters for starting a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub task_id: Uuid,
    pub attempt: i32,
    pub role: SessionRole,
    pub agent_id: String,
    pub model: Option<String>,
    pub git_branch: Option<String>,
}

/// Record a new `running` session. Fails if another session is already
/// `running` for this task (enforced by a unique partial index on
/// `(task_id) WHERE status = 'running'`).
pub async fn start_session(pool: &PgPool, new: &NewSession) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (task_id, attempt, role, agent_id, model, status, git_branch) \
         VALUES ($1, $2, $3, $4, $5, 'running', $6) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.attempt)
    .bind(new.role)
    .bind(&new.agent_id)
    .bind(&new.model)
    .bind(&new.git_branch)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to start session for task {} attempt {}",
            new.task_id, new.attempt
        )
    })?;

    Ok(session)
}

/// Mark a running session complete with a terminal status and its recorded
/// output. Idempotent: completing an already-completed session with the
/// same `status` leaves the row unchanged.
#[allow(clippy::too_many_arguments)]
pub async fn complete_session(
    pool: &PgPool,
    session_id: Uuid,
    status: SessionStatus,
    output_log: Option<&str>,
    git_diff: Option<&str>,
    test_results: Option<serde_json::Value>,
    failure_reason: Option<&str>,
    summary: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET status = $1, output_log = $2, git_diff = $3, test_results = $4, \
             failure_reason = $5, summary = $6, completed_at = NOW() \
         WHERE id = $7",
    )
    .bind(status)
    .bind(output_log)
    .bind(git_diff)
    .bind(test_results)
    .bind(failure_reason)
    .bind(summary)
    .bind(session_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to complete session {session_id}"))?;

    Ok(result.rows_affected())
}

/// Load all sessions for a task, most recent attempt first.
pub async fn load_sessions(pool: &PgPool, task_id: Uuid) -> Result<Vec<Session>> {
    let sessions = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE task_id = $1 ORDER BY attempt DESC, started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load sessions for task {task_id}"))?;

    Ok(sessions)
}

/// Load the most recent session with the given role for a task, if any.
pub async fn latest_session_for_role(
    pool: &PgPool,
    task_id: Uuid,
    role: SessionRole,
) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE task_id = $1 AND role = $2 \
         ORDER BY attempt DESC, started_at DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(role)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to load latest {role} session for task {task_id}"))?;

    Ok(session)
}

/// Find the single `running` session for a task, if one exists. Used by
/// shutdown handling to locate in-flight sessions to mark `crashed`.
pub async fn running_session(pool: &PgPool, task_id: Uuid) -> Result<Option<Session>> {
    let session =
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE task_id = $1 AND status = 'running'")
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to load running session for task {task_id}"))?;

    Ok(session)
}

/// Mark every `running` session in a plan as `crashed`. Used on orchestrator
/// shutdown to record in-flight work that was interrupted.
pub async fn crash_running_sessions(pool: &PgPool, plan_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET status = 'crashed', completed_at = NOW() \
         WHERE status = 'running' \
           AND task_id IN (SELECT id FROM tasks WHERE plan_id = $1)",
    )
    .bind(plan_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to crash running sessions for plan {plan_id}"))?;

    Ok(result.rows_affected())
}

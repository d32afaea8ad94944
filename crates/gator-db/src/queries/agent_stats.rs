//! Database query functions for the `agent_stats` table -- per-attempt
//! outcome history used by the retry & escalation engine.
//!
//! Capped at 500 rows per plan, LRU by insertion order: the oldest row is
//! deleted whenever an insert would push a plan over the cap.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AgentOutcome;

/// The maximum number of agent-stat rows retained per plan.
pub const MAX_ROWS_PER_PLAN: i64 = 500;

/// Parameters for recording a completed attempt.
#[derive(Debug, Clone)]
pub struct NewAgentStat {
    pub plan_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub model: Option<String>,
    pub attempt: i32,
    pub outcome: AgentOutcome,
    pub duration_ms: Option<i64>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Record one attempt's outcome, then evict the oldest row for the plan if
/// the cap has been exceeded.
pub async fn record_stat(pool: &PgPool, new: &NewAgentStat) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query(
        "INSERT INTO agent_stats \
         (plan_id, task_id, agent_id, model, attempt, outcome, duration_ms, started_at, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())",
    )
    .bind(new.plan_id)
    .bind(new.task_id)
    .bind(&new.agent_id)
    .bind(&new.model)
    .bind(new.attempt)
    .bind(new.outcome)
    .bind(new.duration_ms)
    .bind(new.started_at)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("failed to record agent stat for task {}", new.task_id))?;

    sqlx::query(
        "DELETE FROM agent_stats \
         WHERE id IN ( \
             SELECT id FROM agent_stats \
             WHERE plan_id = $1 \
             ORDER BY id ASC \
             OFFSET $2 \
         )",
    )
    .bind(new.plan_id)
    .bind(MAX_ROWS_PER_PLAN)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("failed to evict old agent stats for plan {}", new.plan_id))?;

    tx.commit().await.context("failed to commit agent stat insert")?;
    Ok(())
}

/// Load attempt history for a task, most recent attempt first. Used by the
/// retry engine to compute the same-failure-type streak.
pub async fn load_history_for_task(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Vec<crate::models::AgentStat>> {
    let rows = sqlx::query_as::<_, crate::models::AgentStat>(
        "SELECT * FROM agent_stats WHERE task_id = $1 ORDER BY attempt DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load agent stat history for task {task_id}"))?;

    Ok(rows)
}

/// Load the most recent N stat rows for a plan (newest first), for
/// dashboards/reporting.
pub async fn load_stats(
    pool: &PgPool,
    plan_id: Uuid,
    limit: i64,
) -> Result<Vec<crate::models::AgentStat>> {
    let rows = sqlx::query_as::<_, crate::models::AgentStat>(
        "SELECT * FROM agent_stats WHERE plan_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(plan_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load agent stats for plan {plan_id}"))?;

    Ok(rows)
}

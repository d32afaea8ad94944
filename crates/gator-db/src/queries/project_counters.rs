//! Database query functions for the `project_counters` table -- a single
//! upserted row per plan, refreshed after every terminal task transition.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ProjectCounters;

/// Fetch the counters row for a plan, defaulting to zeros if none exists yet.
pub async fn get_counters(pool: &PgPool, plan_id: Uuid) -> Result<ProjectCounters> {
    let row = sqlx::query_as::<_, ProjectCounters>(
        "SELECT * FROM project_counters WHERE plan_id = $1",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch counters for plan {plan_id}"))?;

    Ok(row.unwrap_or(ProjectCounters {
        plan_id,
        total_done: 0,
        total_failed: 0,
        queue_depth: 0,
        updated_at: chrono::Utc::now(),
    }))
}

/// Increment `total_done` and recompute `queue_depth` from the current task
/// counts for the plan.
pub async fn record_done(pool: &PgPool, plan_id: Uuid) -> Result<()> {
    upsert_delta(pool, plan_id, 1, 0).await
}

/// Increment `total_failed` (a task reaching `blocked`) and recompute
/// `queue_depth`.
pub async fn record_blocked(pool: &PgPool, plan_id: Uuid) -> Result<()> {
    upsert_delta(pool, plan_id, 0, 1).await
}

async fn upsert_delta(pool: &PgPool, plan_id: Uuid, done_delta: i64, failed_delta: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO project_counters (plan_id, total_done, total_failed, queue_depth, updated_at) \
         VALUES ($1, $2, $3, ( \
             SELECT COUNT(*) FROM tasks WHERE plan_id = $1 AND status = 'pending' \
         ), NOW()) \
         ON CONFLICT (plan_id) DO UPDATE SET \
             total_done = project_counters.total_done + $2, \
             total_failed = project_counters.total_failed + $3, \
             queue_depth = ( \
                 SELECT COUNT(*) FROM tasks WHERE plan_id = $1 AND status = 'pending' \
             ), \
             updated_at = NOW()",
    )
    .bind(plan_id)
    .bind(done_delta)
    .bind(failed_delta)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert counters for plan {plan_id}"))?;

    Ok(())
}

//! Database query functions for the `event_log` table -- the append-only
//! record written by the Event Bus's persistence subscriber.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::EventLogEntry;

/// Append one event-log row.
pub async fn append_event(
    pool: &PgPool,
    plan_id: Uuid,
    task_id: Option<Uuid>,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<EventLogEntry> {
    let entry = sqlx::query_as::<_, EventLogEntry>(
        "INSERT INTO event_log (plan_id, task_id, event_type, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(plan_id)
    .bind(task_id)
    .bind(event_type)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to append event log entry")?;

    Ok(entry)
}

/// Load the most recent N events for a plan, oldest first (chronological
/// order for display).
pub async fn load_recent(pool: &PgPool, plan_id: Uuid, limit: i64) -> Result<Vec<EventLogEntry>> {
    let rows = sqlx::query_as::<_, EventLogEntry>(
        "SELECT * FROM ( \
             SELECT * FROM event_log WHERE plan_id = $1 ORDER BY id DESC LIMIT $2 \
         ) recent ORDER BY id ASC",
    )
    .bind(plan_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load event log for plan {plan_id}"))?;

    Ok(rows)
}

/// Load every event recorded for a single task, oldest first.
pub async fn load_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<EventLogEntry>> {
    let rows = sqlx::query_as::<_, EventLogEntry>(
        "SELECT * FROM event_log WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load event log for task {task_id}"))?;

    Ok(rows)
}

//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::TaskStatus;
use gator_db::queries::tasks as task_db;

use super::TaskStateMachine;

/// Assign a task to a harness and worktree.
///
/// Validates that all dependencies are `passed`, sets metadata,
/// and transitions `pending -> assigned`.
pub async fn assign_task(
    pool: &PgPool,
    task_id: Uuid,
    harness: &str,
    worktree_path: &Path,
) -> Result<()> {
    TaskStateMachine::assign_task(pool, task_id, harness, worktree_path).await
}

/// Start a task: transition `assigned -> running`.
///
/// Sets `started_at` to the current timestamp.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Assigned, TaskStatus::Running).await
}

/// Begin checking a task's invariants: transition `running -> checking`.
pub async fn begin_checking(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Checking).await
}

/// Mark a task as passed: transition `checking -> passed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn pass_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Mark a task as failed: transition `checking -> failed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Enter the review phase: transition `checking -> in_review`.
///
/// Called when the gate has passed and this attempt's `review_mode`
/// requires a review-phase agent before the task can be considered done.
pub async fn enter_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::InReview).await
}

/// Record a review approval: transition `in_review -> passed`.
pub async fn approve_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::InReview, TaskStatus::Passed).await
}

/// Record a review rejection: transition `in_review -> failed`.
///
/// The task is handled like any other gate failure from here: the
/// orchestrator's retry/escalation path picks it up on the next tick.
pub async fn reject_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::InReview, TaskStatus::Failed).await
}

/// Retry a failed task: transition `failed -> assigned`.
///
/// Increments the attempt counter. Fails if `attempt >= retry_max`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Assigned).await
}

/// Escalate a failed task: transition `failed -> escalated`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn escalate_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Escalated).await
}

/// Block a task with a reason, from any non-terminal status.
pub async fn block_task(pool: &PgPool, task_id: Uuid, reason: &str) -> Result<()> {
    TaskStateMachine::block_task(pool, task_id, reason).await
}

/// Unblock a task back to `pending`, optionally resetting its attempt
/// counter to 1.
pub async fn unblock_task(pool: &PgPool, task_id: Uuid, reset_attempts: bool) -> Result<()> {
    TaskStateMachine::unblock_task(pool, task_id, reset_attempts).await
}

/// Operator approval for a task awaiting human review.
///
/// A task can be awaiting review in two places: `checking` (the gate
/// passed but the task's `gate_policy` requires human sign-off before
/// `passed`) or `in_review` (the review-phase agent hasn't run, or isn't
/// configured, and a human is standing in for it).
pub async fn approve_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Checking => pass_task(pool, task_id).await,
        TaskStatus::InReview => approve_review(pool, task_id).await,
        other => bail!(
            "cannot approve task {}: status is {}, expected checking or in_review",
            task_id,
            other
        ),
    }
}

/// Operator rejection for a task awaiting human review: sends it to
/// `failed` for the normal retry/escalation path to pick up.
pub async fn reject_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Checking => fail_task(pool, task_id).await,
        TaskStatus::InReview => reject_review(pool, task_id).await,
        other => bail!(
            "cannot reject task {}: status is {}, expected checking or in_review",
            task_id,
            other
        ),
    }
}

/// Operator override to retry a `failed`, `escalated`, or `blocked` task.
///
/// For `failed`, `force` bypasses the `attempt >= retry_max` limit. For
/// `blocked`, `force` also resets the attempt counter to 1 (mirroring
/// `gator_db::queries::tasks::unblock_task`'s `reset_attempts` flag).
pub async fn operator_retry_task(pool: &PgPool, task_id: Uuid, force: bool) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Escalated => {
            let rows = task_db::retry_escalated_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!("optimistic lock failed retrying escalated task {}", task_id);
            }
            Ok(())
        }
        TaskStatus::Failed => {
            if !force && task.attempt >= task.retry_max {
                bail!(
                    "task {} has exhausted retries (attempt {} >= retry_max {}); use --force to override",
                    task_id,
                    task.attempt,
                    task.retry_max
                );
            }
            let rows = task_db::retry_task_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!("optimistic lock failed retrying failed task {}", task_id);
            }
            Ok(())
        }
        TaskStatus::Blocked => unblock_task(pool, task_id, force).await,
        other => bail!(
            "cannot retry task {}: status is {}, expected failed, escalated, or blocked",
            task_id,
            other
        ),
    }
}

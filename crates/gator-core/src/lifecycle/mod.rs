//! Agent lifecycle manager: runs a single agent task from assignment through
//! gate evaluation.
//!
//! The lifecycle function manages the full sequence: create workspace,
//! assemble context, spawn agent, collect events, read the result artifact,
//! run the gate, evaluate verdict.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use sqlx::PgPool;
use tracing;
use uuid::Uuid;

use gator_db::models::{AgentOutcome, GatePolicy, ReviewMode, SessionRole, SessionStatus, Task};
use gator_db::queries::agent_events::{self, NewAgentEvent};
use gator_db::queries::agent_stats::{self, NewAgentStat};
use gator_db::queries::invariants as inv_db;
use gator_db::queries::sessions as session_db;
use gator_db::queries::tasks as task_db;

use crate::context::assembler::{self, Phase, PhaseExtras};
use crate::gate::{GateRunner, GateVerdict};
use crate::gate::evaluator::{GateAction, evaluate_verdict};
use crate::harness::{AgentEvent, Harness, MaterializedTask, ProcessRegistry, RunOutcome};
use crate::isolation::Isolation;
use crate::state::dispatch;
use crate::worktree::WorktreeManager;

/// Result of running an agent through its full lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleResult {
    /// All invariants passed.
    Passed,
    /// Invariants failed but the task is eligible for retry.
    FailedCanRetry,
    /// Invariants failed and no retries remain.
    FailedNoRetry,
    /// The task's gate policy requires human intervention.
    HumanRequired,
    /// The agent timed out.
    TimedOut,
}

/// Configuration for the agent lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum wall time for the agent to complete.
    pub timeout: Duration,
    /// Model tier for this attempt, set by the retry engine after repeated
    /// same-type failures. Passed to the coding agent via `ANTHROPIC_MODEL`;
    /// `None` means use the harness's own default.
    pub model_override: Option<String>,
}

/// Run the full lifecycle for a single agent task.
///
/// Steps:
/// 1. Create workspace via the configured isolation backend.
/// 2. Assemble the active context directory (config.json, prompt.md, deps).
/// 3. Assign task (pending -> assigned).
/// 4. Spawn agent, write its prompt to stdin.
/// 5. Start task (assigned -> running).
/// 6. Collect events with timeout.
/// 7. Read back `result.json`.
/// 8. Run the gate on the workspace.
/// 9. Evaluate verdict -> `LifecycleResult`, overriding a reported success
///    with `test_failure` when the gate disagrees.
#[allow(clippy::too_many_arguments)]
pub async fn run_agent_lifecycle(
    pool: &PgPool,
    task: &Task,
    plan_name: &str,
    harness: &dyn Harness,
    isolation: &dyn Isolation,
    worktree_mgr: &WorktreeManager,
    processes: &ProcessRegistry,
    config: &LifecycleConfig,
) -> Result<LifecycleResult> {
    let task_id = task.id;
    let attempt = task.attempt;
    let started_at = chrono::Utc::now();

    tracing::info!(
        task_id = %task_id,
        task_name = %task.name,
        attempt = attempt,
        model_override = ?config.model_override,
        "starting agent lifecycle"
    );

    // 1. Create workspace via isolation backend.
    let workspace = isolation
        .create_workspace(plan_name, &task.name)
        .await
        .with_context(|| format!("failed to create workspace for task {}", task.name))?;

    let branch = workspace
        .branch
        .clone()
        .unwrap_or_else(|| WorktreeManager::branch_name(plan_name, &task.name));

    // 2. Assemble context: config.json, prompt.md, context/deps/*.
    let staged = assembler::assemble(
        pool,
        worktree_mgr,
        task,
        &branch,
        Phase::Coding,
        &PhaseExtras::default(),
    )
    .await
    .with_context(|| format!("failed to assemble context for task {}", task.name))?;

    let prompt = tokio::fs::read_to_string(&staged.prompt_path)
        .await
        .with_context(|| format!("failed to read prompt for task {}", task.name))?;

    let invariants = inv_db::get_invariants_for_task(pool, task_id).await?;
    let invariant_commands: Vec<String> = invariants
        .iter()
        .map(|inv| {
            if inv.args.is_empty() {
                inv.command.clone()
            } else {
                format!("{} {}", inv.command, inv.args.join(" "))
            }
        })
        .collect();

    let mut env_vars = std::collections::HashMap::new();
    if let Some(model) = &config.model_override {
        env_vars.insert("ANTHROPIC_MODEL".to_string(), model.clone());
    }

    let materialized = MaterializedTask {
        task_id,
        name: task.name.clone(),
        description: prompt,
        invariant_commands,
        working_dir: workspace.path.clone(),
        env_vars,
    };

    // 3. Assign task (pending -> assigned).
    dispatch::assign_task(pool, task_id, harness.name(), &workspace.path)
        .await
        .with_context(|| format!("failed to assign task {}", task.name))?;

    // 4. Spawn agent.
    let mut handle = harness
        .spawn(&materialized)
        .await
        .with_context(|| format!("failed to spawn agent for task {}", task.name))?;
    processes.register(handle.pid).await;

    if let Some(mut stdin) = handle.stdin.take() {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = stdin.write_all(materialized.description.as_bytes()).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to write prompt to agent stdin");
        }
        drop(stdin);
    }

    // 5. Start task (assigned -> running).
    dispatch::start_task(pool, task_id)
        .await
        .with_context(|| format!("failed to start task {}", task.name))?;

    // 6. Collect events with timeout.
    let event_stream = harness.events(&handle);
    let collect_result = tokio::time::timeout(
        config.timeout,
        collect_events(pool, task_id, task.attempt, event_stream),
    )
    .await;

    let run_outcome = match collect_result {
        Ok(Ok(())) => {
            tracing::info!(task_id = %task_id, "agent completed normally");
            RunOutcome::Exit(0)
        }
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task_id, error = %e, "error collecting events");
            RunOutcome::Exit(0)
        }
        Err(_elapsed) => {
            tracing::warn!(task_id = %task_id, "agent timed out");
            if let Err(e) = harness.kill(&handle).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to kill timed-out agent");
            }
            RunOutcome::Timeout
        }
    };
    processes.unregister(handle.pid).await;

    if run_outcome == RunOutcome::Timeout {
        dispatch::begin_checking(pool, task_id).await?;
        dispatch::fail_task(pool, task_id).await?;
        return Ok(LifecycleResult::TimedOut);
    }

    // 7. Read back result.json.
    let agent_result = assembler::read_result(&staged).await?;
    let outcome = crate::harness::derive_outcome(run_outcome, Phase::Coding, agent_result.as_ref())
        .unwrap_or(AgentOutcome::NoResult);

    tracing::info!(task_id = %task_id, outcome = %outcome, "agent completed");

    // Record this attempt's outcome for the retry engine's history-based
    // escalation decisions on the next failure.
    if let Err(e) = agent_stats::record_stat(
        pool,
        &NewAgentStat {
            plan_id: task.plan_id,
            task_id,
            agent_id: harness.name().to_string(),
            model: config.model_override.clone(),
            attempt,
            outcome,
            duration_ms: Some((chrono::Utc::now() - started_at).num_milliseconds()),
            started_at,
        },
    )
    .await
    {
        tracing::warn!(task_id = %task_id, error = %e, "failed to record agent stat (non-fatal)");
    }

    // 8. Commit agent work so the gate can inspect the worktree and `gator
    //    merge` can find it later, regardless of reported status.
    match commit_agent_work(&workspace.path, &task.name, attempt) {
        Ok(true) => tracing::info!(task_id = %task_id, "committed agent work to branch"),
        Ok(false) => tracing::info!(task_id = %task_id, "no changes to commit"),
        Err(e) => tracing::warn!(task_id = %task_id, error = %e, "failed to commit agent work (non-fatal)"),
    }

    // 9. Run the gate and evaluate the verdict.
    let gate_runner = GateRunner::new(pool);
    let verdict = gate_runner
        .run_gate(task_id)
        .await
        .with_context(|| format!("gate check failed for task {}", task.name))?;

    // Coding reporting success does not override a failing gate run: the
    // gate is authoritative over the agent's own report.
    let gate_failed_despite_success =
        outcome == AgentOutcome::Success && matches!(verdict, GateVerdict::Failed { .. });

    // A passing `auto`-gated attempt may still owe a review-phase pass
    // before it's eligible to merge. `evaluate_verdict` would otherwise
    // transition it straight to `passed`, so intercept before calling it.
    if matches!(verdict, GateVerdict::Passed)
        && task.gate_policy == GatePolicy::Auto
        && review_is_due(pool, task_id, task.review_mode).await?
    {
        let result = run_review_phase(
            pool,
            task,
            harness,
            worktree_mgr,
            processes,
            config,
            &workspace.path,
            &branch,
        )
        .await?;

        tracing::info!(
            task_id = %task_id,
            task_name = %task.name,
            result = ?result,
            "agent lifecycle completed (via review)"
        );

        return Ok(result);
    }

    let action = evaluate_verdict(pool, task_id, &verdict)
        .await
        .with_context(|| format!("failed to evaluate verdict for task {}", task.name))?;

    let result = match action {
        GateAction::AutoPassed => LifecycleResult::Passed,
        GateAction::AutoFailed { can_retry: true } => {
            if gate_failed_despite_success {
                tracing::info!(task_id = %task_id, "agent reported success but the gate disagreed");
            }
            LifecycleResult::FailedCanRetry
        }
        GateAction::AutoFailed { can_retry: false } => LifecycleResult::FailedNoRetry,
        GateAction::HumanRequired => LifecycleResult::HumanRequired,
    };

    tracing::info!(
        task_id = %task_id,
        task_name = %task.name,
        result = ?result,
        "agent lifecycle completed"
    );

    Ok(result)
}

/// Whether a passing attempt owes a review-phase pass before it can be
/// considered done, per the task's `review_mode`.
async fn review_is_due(pool: &PgPool, task_id: Uuid, mode: ReviewMode) -> Result<bool> {
    match mode {
        ReviewMode::Never => Ok(false),
        ReviewMode::Always => Ok(true),
        ReviewMode::OnFailureOnly => {
            let prior = session_db::latest_session_for_role(pool, task_id, SessionRole::Review)
                .await
                .with_context(|| format!("failed to look up prior review session for task {task_id}"))?;
            Ok(matches!(prior, Some(s) if s.status == SessionStatus::Rejected))
        }
    }
}

/// Run the review phase for a task whose coding attempt just passed its
/// gate: stage `implementation.diff`, spawn a review-phase agent in the
/// same workspace, and record an `approved`/`rejected` session.
///
/// On rejection the task returns to `failed` for the normal retry path
/// (`dispatch::reject_review`), carrying the same retry-eligibility check
/// a regular gate failure would.
#[allow(clippy::too_many_arguments)]
async fn run_review_phase(
    pool: &PgPool,
    task: &Task,
    harness: &dyn Harness,
    worktree_mgr: &WorktreeManager,
    processes: &ProcessRegistry,
    config: &LifecycleConfig,
    workspace_path: &std::path::Path,
    branch: &str,
) -> Result<LifecycleResult> {
    let task_id = task.id;

    dispatch::enter_review(pool, task_id)
        .await
        .with_context(|| format!("failed to enter review for task {}", task.name))?;

    let staged = assembler::assemble(
        pool,
        worktree_mgr,
        task,
        branch,
        Phase::Review,
        &PhaseExtras::default(),
    )
    .await
    .with_context(|| format!("failed to assemble review context for task {}", task.name))?;

    let prompt = tokio::fs::read_to_string(&staged.prompt_path)
        .await
        .with_context(|| format!("failed to read review prompt for task {}", task.name))?;

    let session = session_db::start_session(
        pool,
        &session_db::NewSession {
            task_id,
            attempt: task.attempt,
            role: SessionRole::Review,
            agent_id: harness.name().to_string(),
            model: None,
            git_branch: Some(branch.to_string()),
        },
    )
    .await
    .with_context(|| format!("failed to start review session for task {}", task.name))?;

    let materialized = MaterializedTask {
        task_id,
        name: format!("{} (review)", task.name),
        description: prompt,
        invariant_commands: Vec::new(),
        working_dir: workspace_path.to_path_buf(),
        env_vars: std::collections::HashMap::new(),
    };

    let mut handle = harness
        .spawn(&materialized)
        .await
        .with_context(|| format!("failed to spawn review agent for task {}", task.name))?;
    processes.register(handle.pid).await;

    if let Some(mut stdin) = handle.stdin.take() {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = stdin.write_all(materialized.description.as_bytes()).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to write review prompt to agent stdin");
        }
        drop(stdin);
    }

    let event_stream = harness.events(&handle);
    let collect_result = tokio::time::timeout(
        config.timeout,
        collect_events(pool, task_id, task.attempt, event_stream),
    )
    .await;

    let run_outcome = match collect_result {
        Ok(Ok(())) => RunOutcome::Exit(0),
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task_id, error = %e, "error collecting review events");
            RunOutcome::Exit(0)
        }
        Err(_elapsed) => {
            tracing::warn!(task_id = %task_id, "review agent timed out");
            if let Err(e) = harness.kill(&handle).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to kill timed-out review agent");
            }
            RunOutcome::Timeout
        }
    };
    processes.unregister(handle.pid).await;

    if run_outcome == RunOutcome::Timeout {
        session_db::complete_session(
            pool,
            session.id,
            SessionStatus::Crashed,
            None,
            None,
            None,
            Some("review agent timed out"),
            None,
        )
        .await?;
        dispatch::reject_review(pool, task_id).await?;
        return Ok(LifecycleResult::TimedOut);
    }

    let agent_result = assembler::read_result(&staged).await?;
    let outcome = crate::harness::derive_outcome(run_outcome, Phase::Review, agent_result.as_ref())
        .unwrap_or(AgentOutcome::NoResult);

    let approved = matches!(outcome, AgentOutcome::Success);
    let summary = agent_result.as_ref().map(|r| r.summary.clone());
    let issues = agent_result
        .as_ref()
        .map(|r| r.issues.join("; "))
        .filter(|s| !s.is_empty());

    session_db::complete_session(
        pool,
        session.id,
        if approved {
            SessionStatus::Approved
        } else {
            SessionStatus::Rejected
        },
        None,
        None,
        None,
        issues.as_deref(),
        summary.as_deref(),
    )
    .await?;

    if approved {
        dispatch::approve_review(pool, task_id).await?;
        tracing::info!(task_id = %task_id, "review approved");
        Ok(LifecycleResult::Passed)
    } else {
        dispatch::reject_review(pool, task_id).await?;
        tracing::info!(task_id = %task_id, "review rejected, task returns to failed for retry");

        let refreshed = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found after review rejection"))?;
        if refreshed.attempt < refreshed.retry_max {
            Ok(LifecycleResult::FailedCanRetry)
        } else {
            Ok(LifecycleResult::FailedNoRetry)
        }
    }
}

/// Commit all agent work in a worktree (git add -A + git commit).
///
/// Returns `Ok(true)` if a commit was created, `Ok(false)` if there was
/// nothing to commit, or `Err` if the git commands failed.
fn commit_agent_work(worktree_path: &std::path::Path, task_name: &str, attempt: i32) -> Result<bool> {
    use std::process::Command;

    let _ = Command::new("git")
        .args(["config", "user.email", "gator@localhost"])
        .current_dir(worktree_path)
        .output();
    let _ = Command::new("git")
        .args(["config", "user.name", "gator"])
        .current_dir(worktree_path)
        .output();

    let output = Command::new("git")
        .args(["add", "-A"])
        .current_dir(worktree_path)
        .output()
        .with_context(|| "failed to run git add -A")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git add -A failed: {stderr}");
    }

    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(worktree_path)
        .output()
        .with_context(|| "failed to run git status")?;

    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        return Ok(false);
    }

    let message = format!("gator: {task_name} (attempt {attempt})");
    let output = Command::new("git")
        .args(["commit", "-m", &message])
        .current_dir(worktree_path)
        .output()
        .with_context(|| "failed to run git commit")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git commit failed: {stderr}");
    }

    Ok(true)
}

/// Collect events from an agent's event stream and persist them to the DB.
///
/// Events are inserted best-effort; a failure to persist one event does not
/// stop the collection. The function returns when the stream yields
/// `AgentEvent::Completed` or the stream ends.
async fn collect_events(
    pool: &PgPool,
    task_id: Uuid,
    attempt: i32,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = AgentEvent> + Send>>,
) -> Result<()> {
    while let Some(event) = stream.next().await {
        let is_completed = matches!(event, AgentEvent::Completed);

        let (event_type, payload) = serialize_agent_event(&event);
        let new_event = NewAgentEvent {
            task_id,
            attempt,
            event_type,
            payload,
        };

        if let Err(e) = agent_events::insert_agent_event(pool, &new_event).await {
            tracing::warn!(
                task_id = %task_id,
                error = %e,
                "failed to persist agent event (best-effort)"
            );
        }

        if is_completed {
            break;
        }
    }

    Ok(())
}

/// Serialize an AgentEvent into (event_type, payload) for DB storage.
fn serialize_agent_event(event: &AgentEvent) -> (String, serde_json::Value) {
    match event {
        AgentEvent::Message { role, content } => (
            "message".to_string(),
            serde_json::json!({"role": role, "content": content}),
        ),
        AgentEvent::ToolCall { tool, input } => (
            "tool_call".to_string(),
            serde_json::json!({"tool": tool, "input": input}),
        ),
        AgentEvent::ToolResult { tool, output } => (
            "tool_result".to_string(),
            serde_json::json!({"tool": tool, "output": output}),
        ),
        AgentEvent::TokenUsage {
            input_tokens,
            output_tokens,
        } => (
            "token_usage".to_string(),
            serde_json::json!({"input_tokens": input_tokens, "output_tokens": output_tokens}),
        ),
        AgentEvent::Error { message } => {
            ("error".to_string(), serde_json::json!({"message": message}))
        }
        AgentEvent::Completed => ("completed".to_string(), serde_json::json!({})),
    }
}

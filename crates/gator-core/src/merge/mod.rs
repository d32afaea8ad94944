//! Merge Coordinator: serializes task completions into a race-free
//! merge-to-main pipeline, with push/rebase fallback and a merger-agent
//! handoff when the merge itself conflicts.
//!
//! Merge is globally serialized per (plan, repo) pair via a mutex held only
//! for the duration of git subprocess calls -- the merger agent, when
//! needed, runs with the mutex released so other merges aren't blocked on
//! its wall-clock time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gator_db::models::{AgentOutcome, Plan, Task};
use gator_db::queries::{plans as plan_queries, tasks as task_queries};

use crate::context::assembler::{self, Phase, PhaseExtras};
use crate::harness::{self, ProcessRegistry, RunRequest};
use crate::worktree::{MergeResult, PushResult, WorktreeManager};

const MERGER_TIMEOUT: Duration = Duration::from_secs(600);
const RECENT_MERGES_WINDOW: i64 = 5;

/// Outcome of handing a task's branch to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged and pushed; the feature branch has been deleted.
    Merged,
    /// Could not be merged; the task should transition to `blocked`.
    Blocked { reason: String },
}

/// Callbacks the coordinator needs back into the orchestrator. Kept as a
/// trait instead of a back-pointer so the two modules aren't cyclically
/// dependent -- the orchestrator implements this and passes itself by
/// reference.
#[async_trait]
pub trait Host: Send + Sync {
    /// Record the task's terminal transition for this merge attempt.
    async fn transition(&self, task_id: Uuid, outcome: &MergeOutcome) -> Result<()>;
    /// Persist plan-level counters (e.g. `total_done`) after a successful merge.
    async fn persist_counters(&self, plan_id: Uuid) -> Result<()>;
    /// Wake the scheduler loop so it re-evaluates ready tasks and slots.
    fn nudge(&self);
}

/// Serializes merges per plan. One coordinator is shared across all of a
/// plan's worker tasks; a separate mutex per plan id means merges for
/// unrelated plans never block on each other.
#[derive(Clone, Default)]
pub struct MergeCoordinator {
    mutexes: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl MergeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutex_for(&self, plan_id: Uuid) -> Arc<Mutex<()>> {
        let mut mutexes = self.mutexes.lock().await;
        mutexes.entry(plan_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Merge a task's branch into the plan's base branch, per §4.6: merge,
    /// push with rebase fallback, and -- on conflict -- a merger-agent
    /// handoff in the repo's main working tree.
    pub async fn merge_task(
        &self,
        pool: &PgPool,
        task: &Task,
        plan_name: &str,
        worktree_mgr: &WorktreeManager,
        processes: &ProcessRegistry,
        merger_binary: &str,
        host: &dyn Host,
    ) -> Result<MergeOutcome> {
        let plan = plan_queries::get_plan(pool, task.plan_id)
            .await?
            .with_context(|| format!("plan {} not found", task.plan_id))?;

        let branch = WorktreeManager::branch_name(plan_name, &task.name);
        let plan_mutex = self.mutex_for(task.plan_id).await;

        let staged_outcome = {
            let _guard = plan_mutex.lock().await;

            worktree_mgr
                .checkout(&plan.base_branch)
                .with_context(|| format!("failed to checkout {}", plan.base_branch))?;

            match worktree_mgr.merge_branch_leave_conflict(&branch) {
                Ok(MergeResult::Success) => {
                    OutcomeOrDetails::Outcome(self.push_and_finish(&task.id, &plan, &branch, worktree_mgr, host).await?)
                }
                Ok(MergeResult::Conflict { details }) => {
                    // The merger agent runs with the plan mutex released --
                    // it doesn't touch git state other slots need, and its
                    // wall-clock time shouldn't stall unrelated merges. The
                    // guard drops at the end of this block; `resolve_conflict`
                    // re-acquires it only around the final commit/push.
                    OutcomeOrDetails::Details(details)
                }
                Err(e) => return Err(e.into()),
            }
        };

        let outcome = match staged_outcome {
            OutcomeOrDetails::Outcome(outcome) => outcome,
            OutcomeOrDetails::Details(details) => {
                self.resolve_conflict(pool, task, &plan, &branch, worktree_mgr, processes, merger_binary, &details, &plan_mutex, host)
                    .await?
            }
        };

        host.transition(task.id, &outcome).await?;
        host.nudge();
        Ok(outcome)
    }

    async fn push_and_finish(
        &self,
        task_id: &Uuid,
        plan: &Plan,
        branch: &str,
        worktree_mgr: &WorktreeManager,
        host: &dyn Host,
    ) -> Result<MergeOutcome> {
        match worktree_mgr.push_main(&plan.base_branch) {
            Ok(PushResult::Success) | Ok(PushResult::RebasedAndPushed) => {
                // Re-verify the branch is actually merged before deleting it.
                if worktree_mgr.branch_exists(branch).unwrap_or(false) {
                    if let Err(e) = worktree_mgr.delete_branch(branch) {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to delete merged branch (non-fatal)");
                    }
                }
                host.persist_counters(plan.id).await?;
                Ok(MergeOutcome::Merged)
            }
            Ok(PushResult::RebaseConflict { details }) => Ok(MergeOutcome::Blocked {
                reason: format!("merge_conflict: rebase conflict: {details}"),
            }),
            Err(e) => Ok(MergeOutcome::Blocked {
                reason: format!("merge_conflict: push failed: {e}"),
            }),
        }
    }

    /// Stage a merger prompt, spawn the merger agent in the main working
    /// tree, and resolve the merge based on its `merge-result.json`.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_conflict(
        &self,
        pool: &PgPool,
        task: &Task,
        plan: &Plan,
        branch: &str,
        worktree_mgr: &WorktreeManager,
        processes: &ProcessRegistry,
        merger_binary: &str,
        details: &str,
        plan_mutex: &Arc<Mutex<()>>,
        host: &dyn Host,
    ) -> Result<MergeOutcome> {
        let conflict_files: Vec<String> = details
            .lines()
            .filter(|l| l.starts_with("CONFLICT"))
            .map(|l| l.trim().to_string())
            .collect();

        let recent_merges = task_queries::recent_merged_task_names(pool, task.plan_id, RECENT_MERGES_WINDOW)
            .await
            .unwrap_or_default();

        let extras = PhaseExtras {
            conflict_diff: Some(details.to_string()),
            conflict_files,
            recent_merges,
            ..Default::default()
        };

        let staged = assembler::assemble(pool, worktree_mgr, task, branch, Phase::Merger, &extras).await?;
        let prompt = tokio::fs::read_to_string(&staged.prompt_path)
            .await
            .with_context(|| "failed to read staged merger prompt")?;

        let request = RunRequest {
            command: merger_binary.to_string(),
            args: vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()],
            env: HashMap::new(),
            cwd: worktree_mgr.repo_path().to_path_buf(),
            timeout: MERGER_TIMEOUT,
            stdin: Some(prompt),
        };

        let cancel = CancellationToken::new();
        let (run_outcome, _output) = harness::runner::run(request, processes, &cancel).await;

        let merger_result = assembler::read_result(&staged).await?;
        let agent_outcome = harness::derive_outcome(run_outcome, Phase::Merger, merger_result.as_ref());

        let _guard = plan_mutex.lock().await;

        if matches!(agent_outcome, Some(AgentOutcome::Success)) {
            match worktree_mgr.commit_resolved_merge() {
                Ok(()) => self.push_and_finish(&task.id, plan, branch, worktree_mgr, host).await,
                Err(e) => {
                    worktree_mgr.abort_merge().ok();
                    Ok(MergeOutcome::Blocked {
                        reason: format!("merge_conflict: merger agent succeeded but commit failed: {e}"),
                    })
                }
            }
        } else {
            // Merger failure or timeout: abort and block, per §4.6 policy 4
            // -- the feature branch is left intact for manual inspection,
            // never auto-deleted.
            worktree_mgr.abort_merge().ok();
            Ok(MergeOutcome::Blocked {
                reason: "merge_conflict".to_string(),
            })
        }
    }
}

/// Distinguishes the two things `merge_task`'s first block can produce: an
/// already-resolved outcome, or a conflict that still needs the merger agent.
enum OutcomeOrDetails {
    Outcome(MergeOutcome),
    Details(String),
}

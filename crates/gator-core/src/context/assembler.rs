//! Builds `<repo>/.gator/active/<task_id>/` for a task attempt ahead of an
//! agent invocation, and reads back the result artifact the agent writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gator_db::models::Task;
use gator_db::queries::{
    gate_results, invariants as inv_queries, plans as plan_queries, sessions as session_queries,
    tasks as task_queries,
};
use sqlx::PgPool;

use crate::worktree::WorktreeManager;

use super::{active_dir, atomic_read, atomic_write, prompt};

/// Which role is about to run against this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Coding,
    Review,
    Merger,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Coding => "coding",
            Phase::Review => "review",
            Phase::Merger => "merger",
        }
    }
}

/// `config.json` written for the agent, per §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub task_id: String,
    pub phase: String,
    pub branch: String,
    pub test_command: Option<String>,
    pub use_existing_branch: bool,
    pub attempt: i32,
    pub previous_failure: Option<String>,
    pub previous_test_output: Option<String>,
    pub review_feedback: Option<String>,
    pub repo_path: String,
}

/// Extra inputs needed only for a specific phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseExtras {
    pub review_feedback: Option<String>,
    pub conflict_files: Vec<String>,
    pub conflict_diff: Option<String>,
    pub recent_merges: Vec<String>,
}

/// Paths into the staged active directory that the rest of the system reads.
#[derive(Debug, Clone)]
pub struct StagedContext {
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub prompt_path: PathBuf,
    pub result_path: PathBuf,
}

/// Assemble the active directory for a task/attempt/phase.
pub async fn assemble(
    pool: &PgPool,
    worktree_mgr: &WorktreeManager,
    task: &Task,
    branch: &str,
    phase: Phase,
    extras: &PhaseExtras,
) -> Result<StagedContext> {
    let repo_path = worktree_mgr.repo_path();
    let dir = active_dir(repo_path, task.id);
    let context_dir = dir.join("context");

    let plan = plan_queries::get_plan(pool, task.plan_id)
        .await?
        .with_context(|| format!("plan {} not found", task.plan_id))?;

    // context/plan.md: the owning plan's excerpted markdown.
    atomic_write(&context_dir.join("plan.md"), &excerpt_plan_markdown(&plan.project_path)).await?;

    // context/deps/<dep_name>.{diff,summary.md}
    let dep_names = task_queries::get_task_dependency_names(pool, task.id).await?;
    let mut dependencies_md = String::new();
    for dep_name in &dep_names {
        let status = dependency_status(pool, task.plan_id, dep_name).await?;
        dependencies_md.push_str(&format!("- **{dep_name}**: {status}\n"));

        let dep_branch = WorktreeManager::branch_name(&plan.name, dep_name);
        let live_diff = worktree_mgr.get_diff(&plan.base_branch, &dep_branch).ok();
        let diff = match live_diff.filter(|d| !d.is_empty()) {
            Some(d) => Some(d),
            None => latest_approved_diff(pool, task.plan_id, dep_name).await?,
        };

        if let Some(diff) = diff {
            atomic_write(&context_dir.join("deps").join(format!("{dep_name}.diff")), &diff).await?;
        }
        let summary = format!("# {dep_name}\n\nStatus: {status}\n");
        atomic_write(
            &context_dir.join("deps").join(format!("{dep_name}.summary.md")),
            &summary,
        )
        .await?;
    }

    // Previous-attempt feedback (coding phase only, attempt > 1).
    let mut previous_failure = None;
    let mut previous_test_output = None;
    let mut previous_feedback_md = String::new();
    if phase == Phase::Coding && task.attempt > 1 {
        let prev_attempt = task.attempt - 1;
        let prev_results = gate_results::get_gate_results(pool, task.id, prev_attempt).await?;
        let failures: Vec<_> = prev_results.iter().filter(|r| !r.passed).collect();

        if !failures.is_empty() {
            let mut md = String::from("## Previous Attempt Feedback\n\n");
            let mut stderr_all = String::new();
            for failure in &failures {
                let inv_name = match inv_queries::get_invariant(pool, failure.invariant_id).await? {
                    Some(inv) => inv.name,
                    None => format!("unknown ({})", failure.invariant_id),
                };
                let stderr = failure.stderr.as_deref().unwrap_or("");
                let truncated = truncate(stderr, 5000);
                md.push_str(&format!("### {inv_name}\n\n```\n{truncated}\n```\n\n"));
                stderr_all.push_str(&truncated);
                stderr_all.push('\n');
            }
            previous_failure = Some(format!(
                "attempt {prev_attempt} failed {} invariant(s)",
                failures.len()
            ));
            previous_test_output = Some(truncate(&stderr_all, 5000));
            previous_feedback_md = md;
        }
    }

    // context/implementation.diff (review phase).
    if phase == Phase::Review {
        if let Ok(diff) = worktree_mgr.get_diff(&plan.base_branch, branch) {
            if !diff.is_empty() {
                atomic_write(&context_dir.join("implementation.diff"), &diff).await?;
            }
        }
    }

    // context/conflict.diff, conflict_files.txt (merger phase).
    if phase == Phase::Merger {
        if let Some(ref diff) = extras.conflict_diff {
            atomic_write(&context_dir.join("conflict.diff"), &truncate(diff, 20_000)).await?;
        }
        atomic_write(
            &context_dir.join("conflict_files.txt"),
            &extras.conflict_files.join("\n"),
        )
        .await?;
    }

    // config.json
    let config = AgentConfig {
        task_id: task.id.to_string(),
        phase: phase.as_str().to_string(),
        branch: branch.to_string(),
        test_command: None,
        use_existing_branch: task.attempt > 1,
        attempt: task.attempt,
        previous_failure,
        previous_test_output,
        review_feedback: extras.review_feedback.clone(),
        repo_path: repo_path.to_string_lossy().to_string(),
    };
    let config_json = serde_json::to_string_pretty(&config).context("failed to serialize config.json")?;
    let config_path = dir.join("config.json");
    atomic_write(&config_path, &config_json).await?;

    // prompt.md
    //
    // The merger phase is the one exception to "result lives in the task's
    // active directory": a merge is not scoped to one task, so the merger
    // agent writes to a single repo-level `merge-result.json` instead.
    let result_path = match phase {
        Phase::Merger => repo_path.join(".gator").join("merge-result.json"),
        Phase::Coding | Phase::Review => dir.join("result.json"),
    };
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("task_name", task.name.clone());
    vars.insert("description", task.description.clone());
    vars.insert("previous_feedback", previous_feedback_md);
    vars.insert("dependencies", dependencies_md);
    vars.insert("repo_path", repo_path.to_string_lossy().to_string());
    vars.insert("branch", branch.to_string());
    vars.insert("base_branch", plan.base_branch.clone());
    vars.insert("result_path", result_path.to_string_lossy().to_string());
    vars.insert("conflict_files", extras.conflict_files.join("\n"));
    vars.insert(
        "conflict_diff",
        extras.conflict_diff.as_deref().map(|d| truncate(d, 20_000)).unwrap_or_default(),
    );
    vars.insert("recent_merges", extras.recent_merges.join("\n"));

    let rendered = match phase {
        Phase::Coding => prompt::render_coding(&vars),
        Phase::Review => prompt::render_review(&vars),
        Phase::Merger => prompt::render_merger(&vars),
    };
    let prompt_path = dir.join("prompt.md");
    atomic_write(&prompt_path, &rendered).await?;

    Ok(StagedContext {
        dir,
        config_path,
        prompt_path,
        result_path,
    })
}

/// Read back `result.json` (or `merge-result.json` for the merger phase)
/// written by the agent. Returns `None` if the file is absent or the
/// outcome should be treated as `no_result`.
pub async fn read_result(staged: &StagedContext) -> Result<Option<AgentResult>> {
    let Some(contents) = atomic_read(&staged.result_path).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&contents) {
        Ok(result) => Ok(Some(result)),
        Err(e) => {
            tracing::warn!(error = %e, "result.json did not match expected schema");
            Ok(None)
        }
    }
}

/// The agent-to-core result artifact, shared across all three phases (the
/// exact fields populated differ, but a single permissive shape covers all
/// of them per §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub open_questions: Vec<OpenQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenQuestion {
    pub id: String,
    pub text: String,
}

async fn dependency_status(pool: &PgPool, plan_id: Uuid, task_name: &str) -> Result<String> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status::text FROM tasks WHERE plan_id = $1 AND name = $2")
            .bind(plan_id)
            .bind(task_name)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to look up dependency status for {task_name:?}"))?;
    Ok(row.map(|(s,)| s).unwrap_or_else(|| "unknown".to_string()))
}

async fn latest_approved_diff(pool: &PgPool, plan_id: Uuid, dep_name: &str) -> Result<Option<String>> {
    let dep_task = task_queries::get_task_by_name(pool, plan_id, dep_name).await?;
    let Some(dep_task) = dep_task else {
        return Ok(None);
    };
    let session = session_queries::latest_session_for_role(
        pool,
        dep_task.id,
        gator_db::models::SessionRole::Coding,
    )
    .await?;
    Ok(session.and_then(|s| s.git_diff))
}

/// Excerpt the Acceptance Criteria / Technical Approach sections from a
/// plan document on disk, if present. `project_path` is the repo root; the
/// plan document itself (if any) lives alongside it and is read-only to
/// the core.
fn excerpt_plan_markdown(project_path: &str) -> String {
    let candidate = Path::new(project_path).join("PLAN.md");
    let Ok(full) = std::fs::read_to_string(&candidate) else {
        return String::new();
    };
    excerpt_sections(&full, &["## Acceptance Criteria", "## Technical Approach"])
}

fn excerpt_sections(markdown: &str, headings: &[&str]) -> String {
    let mut out = String::new();
    let lines: Vec<&str> = markdown.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        if headings.iter().any(|h| lines[i].trim() == *h) {
            out.push_str(lines[i]);
            out.push('\n');
            i += 1;
            while i < lines.len() && !lines[i].starts_with("## ") {
                out.push_str(lines[i]);
                out.push('\n');
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    out
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

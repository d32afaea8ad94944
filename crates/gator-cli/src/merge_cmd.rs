//! `gator merge <plan-id>` command: merge passed task branches into the base branch.
//!
//! Delegates to the same [`gator_core::merge::MergeCoordinator`] the
//! orchestrator uses inline after each task passes -- this command exists
//! for branches left unmerged by an interrupted or crashed dispatch run.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use gator_core::harness::ProcessRegistry;
use gator_core::merge::{Host, MergeCoordinator, MergeOutcome};
use gator_core::orchestrator::MERGER_BINARY;
use gator_core::state::dispatch;
use gator_core::worktree::WorktreeManager;
use gator_db::models::{PlanStatus, TaskStatus};
use gator_db::queries::plans as plan_db;
use gator_db::queries::project_counters;
use gator_db::queries::tasks as task_db;

/// Callbacks the Merge Coordinator needs back into this command: task
/// transition on a blocked merge, plan-level counters on a merged one.
struct CliHost {
    pool: PgPool,
    plan_id: Uuid,
}

#[async_trait]
impl Host for CliHost {
    async fn transition(&self, task_id: Uuid, outcome: &MergeOutcome) -> Result<()> {
        match outcome {
            MergeOutcome::Merged => Ok(()),
            MergeOutcome::Blocked { reason } => {
                dispatch::block_task(&self.pool, task_id, reason).await?;
                project_counters::record_blocked(&self.pool, self.plan_id).await
            }
        }
    }

    async fn persist_counters(&self, plan_id: Uuid) -> Result<()> {
        project_counters::record_done(&self.pool, plan_id).await
    }

    fn nudge(&self) {
        // No scheduler loop running alongside this one-shot command.
    }
}

/// Run the merge command.
pub async fn run_merge(pool: &PgPool, plan_id_str: &str, dry_run: bool) -> Result<()> {
    let plan_id =
        Uuid::parse_str(plan_id_str).with_context(|| format!("invalid plan ID: {plan_id_str}"))?;

    let plan = plan_db::get_plan(pool, plan_id)
        .await?
        .with_context(|| format!("plan {plan_id} not found"))?;

    if plan.status != PlanStatus::Completed {
        bail!(
            "plan {} is {} -- all tasks must pass before merging (expected completed)",
            plan_id,
            plan.status
        );
    }

    let worktree_manager =
        WorktreeManager::new(&plan.project_path, None).map_err(|e| anyhow::anyhow!("{e}"))?;
    let processes = ProcessRegistry::new();
    let merge_coordinator = MergeCoordinator::new();

    let tasks = task_db::list_tasks_for_plan(pool, plan_id).await?;

    // Build dependency-ordered list using topological sort.
    let deps = build_dependency_map(pool, &tasks).await?;
    let ordered = topological_sort(&tasks, &deps)?;

    let to_merge: Vec<_> = ordered
        .into_iter()
        .filter(|t| t.status == TaskStatus::Passed)
        .collect();

    println!(
        "Merging {} task branch(es) into {}",
        to_merge.len(),
        plan.base_branch
    );

    if dry_run {
        for task in &to_merge {
            let branch = WorktreeManager::branch_name(&plan.name, &task.name);
            println!("  Would merge: {branch}");
        }
        println!(
            "\nDry run complete: {} branch(es) would be merged.",
            to_merge.len()
        );
        return Ok(());
    }

    let host = CliHost {
        pool: pool.clone(),
        plan_id,
    };

    let mut merged = 0;
    for task in &to_merge {
        let branch = WorktreeManager::branch_name(&plan.name, &task.name);
        print!("  Merging {branch}...");

        let outcome = merge_coordinator
            .merge_task(
                pool,
                task,
                &plan.name,
                &worktree_manager,
                &processes,
                MERGER_BINARY,
                &host,
            )
            .await?;

        match outcome {
            MergeOutcome::Merged => {
                println!(" ok");
                merged += 1;
            }
            MergeOutcome::Blocked { reason } => {
                println!(" BLOCKED");
                eprintln!("\n{reason}");
                eprintln!("\nStopping. Task blocked for manual resolution; re-run after fixing.");
                bail!("merge blocked on branch {branch}: {reason}");
            }
        }
    }

    println!(
        "\nMerge complete: {merged} branch(es) merged into {}.",
        plan.base_branch
    );

    Ok(())
}

/// Build a map of task_id -> list of dependency task_ids.
async fn build_dependency_map(
    pool: &PgPool,
    tasks: &[gator_db::models::Task],
) -> Result<std::collections::HashMap<Uuid, Vec<Uuid>>> {
    let mut deps = std::collections::HashMap::new();
    for task in tasks {
        let task_deps = task_db::get_task_dependencies(pool, task.id).await?;
        deps.insert(task.id, task_deps);
    }
    Ok(deps)
}

/// Topological sort of tasks based on dependencies.
fn topological_sort(
    tasks: &[gator_db::models::Task],
    deps: &std::collections::HashMap<Uuid, Vec<Uuid>>,
) -> Result<Vec<gator_db::models::Task>> {
    use std::collections::{HashMap, HashSet, VecDeque};

    let task_map: HashMap<Uuid, &gator_db::models::Task> =
        tasks.iter().map(|t| (t.id, t)).collect();

    // Compute in-degree (only counting edges within this task set).
    let task_ids: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
    let mut in_degree: HashMap<Uuid, usize> = tasks.iter().map(|t| (t.id, 0)).collect();

    for task in tasks {
        if let Some(task_deps) = deps.get(&task.id) {
            for dep_id in task_deps {
                if task_ids.contains(dep_id) {
                    *in_degree.entry(task.id).or_default() += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<Uuid> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    // Stable sort: process in creation order when degrees are equal.
    let mut sorted_queue: Vec<Uuid> = queue.drain(..).collect();
    sorted_queue.sort_by_key(|id| task_map[id].created_at);
    queue.extend(sorted_queue);

    let mut result = Vec::with_capacity(tasks.len());

    // Build reverse adjacency: for each dep, which tasks depend on it.
    let mut reverse: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for task in tasks {
        if let Some(task_deps) = deps.get(&task.id) {
            for dep_id in task_deps {
                if task_ids.contains(dep_id) {
                    reverse.entry(*dep_id).or_default().push(task.id);
                }
            }
        }
    }

    while let Some(id) = queue.pop_front() {
        result.push(task_map[&id].clone());
        if let Some(dependents) = reverse.get(&id) {
            for dep in dependents {
                let deg = in_degree.get_mut(dep).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*dep);
                }
            }
        }
    }

    if result.len() != tasks.len() {
        bail!("dependency cycle detected in task graph");
    }

    Ok(result)
}

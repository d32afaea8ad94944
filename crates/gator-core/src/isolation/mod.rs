//! Workspace isolation abstraction.
//!
//! Decouples workspace creation from `WorktreeManager` so that the two
//! configured `git_working_mode`s (`worktree`, `branches`) can be used
//! interchangeably by the orchestrator.

pub mod branches;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Information about a created workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    /// Filesystem path the agent should run in.
    pub path: PathBuf,
    /// Git branch checked out for this task, if any.
    pub branch: Option<String>,
}

/// Trait for workspace isolation backends.
#[async_trait]
pub trait Isolation: Send + Sync {
    /// Human-readable name of the isolation backend ("worktree" or "branches").
    fn name(&self) -> &str;

    /// Create an isolated workspace for a task.
    async fn create_workspace(&self, plan_name: &str, task_name: &str) -> Result<WorkspaceInfo>;

    /// Remove a previously created workspace.
    async fn remove_workspace(&self, info: &WorkspaceInfo) -> Result<()>;

    /// Whether this backend forces single-coder concurrency. `branches` mode
    /// checks out directly in the shared main tree, so only one coding
    /// session may run at a time regardless of the configured slot count.
    fn forces_single_coder(&self) -> bool {
        false
    }
}

/// Factory function: create an isolation backend from a `git_working_mode` string.
pub fn create_isolation(mode: &str, repo_path: &Path) -> Result<Arc<dyn Isolation>> {
    match mode {
        "worktree" => {
            let mgr = crate::worktree::WorktreeManager::new(repo_path, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Arc::new(worktree::WorktreeIsolation::new(mgr)))
        }
        "branches" => {
            let mgr = crate::worktree::WorktreeManager::new(repo_path, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Arc::new(branches::BranchesIsolation::new(mgr)))
        }
        other => {
            bail!("unknown git_working_mode: {other:?} (expected \"worktree\" or \"branches\")")
        }
    }
}

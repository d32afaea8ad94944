//! Branch-only isolation backend.
//!
//! In `branches` mode the agent runs directly in the main repo working
//! tree: no worktree is allocated, `create_workspace` checks out the task's
//! feature branch in place and returns the repo root. Because only one
//! working tree exists, at most one coding session may be active at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Isolation, WorkspaceInfo};
use crate::worktree::WorktreeManager;

/// Isolation backend that checks out task branches directly in the main
/// repository working tree instead of allocating a worktree.
#[derive(Debug)]
pub struct BranchesIsolation {
    manager: WorktreeManager,
}

impl BranchesIsolation {
    /// Create a new `BranchesIsolation` from an existing `WorktreeManager`.
    pub fn new(manager: WorktreeManager) -> Self {
        Self { manager }
    }

    /// Access the underlying `WorktreeManager`.
    pub fn manager(&self) -> &WorktreeManager {
        &self.manager
    }
}

#[async_trait]
impl Isolation for BranchesIsolation {
    fn name(&self) -> &str {
        "branches"
    }

    fn forces_single_coder(&self) -> bool {
        true
    }

    async fn create_workspace(&self, plan_name: &str, task_name: &str) -> Result<WorkspaceInfo> {
        let branch_name = WorktreeManager::branch_name(plan_name, task_name);

        self.manager
            .checkout_or_create_branch(&branch_name)
            .with_context(|| {
                format!("failed to check out branch {branch_name} for {plan_name}/{task_name}")
            })?;

        Ok(WorkspaceInfo {
            path: self.manager.repo_path().to_path_buf(),
            branch: Some(branch_name),
        })
    }

    async fn remove_workspace(&self, info: &WorkspaceInfo) -> Result<()> {
        // Nothing to remove: the branch itself is cleaned up by the Merge
        // Coordinator (on success) or left in place (on failure, per the
        // never-auto-delete decision for fatal merge failures).
        let _ = info;
        Ok(())
    }
}

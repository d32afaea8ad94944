//! Context Assembler: stages the per-task active directory an agent reads
//! from and writes its result into.
//!
//! Supersedes the agent-facing half of the old plan materialization code:
//! the dependency-status lookup and previous-attempt-feedback logic is the
//! same, but it now writes files under `.gator/active/<task_id>/` instead of
//! returning one markdown string.

pub mod assembler;
pub mod prompt;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

/// Directory layout root for a task's active context, rooted at the repo.
pub fn active_dir(repo_path: &Path, task_id: uuid::Uuid) -> PathBuf {
    repo_path.join(".gator").join("active").join(task_id.to_string())
}

/// Write `contents` to `path` atomically: write to a sibling temp file, then
/// rename. A reader can never observe a partial write.
pub async fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("out"),
        std::process::id()
    ));

    fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;

    Ok(())
}

/// Read a file, returning `None` if it is absent rather than erroring.
pub async fn atomic_read(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn atomic_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("result.json");

        atomic_write(&path, "{\"status\":\"success\"}").await.unwrap();

        let read_back = atomic_read(&path).await.unwrap();
        assert_eq!(read_back.as_deref(), Some("{\"status\":\"success\"}"));
    }

    #[tokio::test]
    async fn atomic_read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        assert!(atomic_read(&path).await.unwrap().is_none());
    }
}

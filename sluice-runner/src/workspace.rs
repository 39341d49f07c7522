//! Working trees for runs
//!
//! A run's steps share one working tree. `GitCheckout` materializes the
//! triggering commit; `LocalWorkspace` reuses a directory the caller already
//! has (the CLI's `--workdir`).

use async_trait::async_trait;
use sluice_core::domain::run::Run;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Returns the directory the run's steps execute in
    async fn prepare(&self, run: &Run) -> Result<PathBuf, ExecutionError>;

    /// Called once the run no longer needs its directory, including when
    /// `prepare` failed or was interrupted part way
    async fn release(&self, run: &Run);
}

/// Shallow-fetches the run's commit into `<base>/<run id>`
#[derive(Debug, Clone)]
pub struct GitCheckout {
    url: String,
    base: PathBuf,
}

impl GitCheckout {
    pub fn new(url: impl Into<String>, base: PathBuf) -> Self {
        Self {
            url: url.into(),
            base,
        }
    }

    fn dir_for(&self, run: &Run) -> PathBuf {
        self.base.join(run.id.to_string())
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<(), ExecutionError> {
        debug!("git {} (in {})", args.join(" "), dir.display());
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::Workspace(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(ExecutionError::Workspace(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvider for GitCheckout {
    async fn prepare(&self, run: &Run) -> Result<PathBuf, ExecutionError> {
        let dir = self.dir_for(run);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ExecutionError::Workspace(format!("cannot create {}: {}", dir.display(), e))
        })?;

        info!(
            "Checking out {} at {} into {}",
            self.url,
            run.commit_sha,
            dir.display()
        );
        self.git(&dir, &["init", "--quiet"]).await?;
        self.git(
            &dir,
            &["fetch", "--quiet", "--depth", "1", &self.url, &run.commit_sha],
        )
        .await?;
        self.git(&dir, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
            .await?;

        Ok(dir)
    }

    async fn release(&self, run: &Run) {
        let dir = self.dir_for(run);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed workspace {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove workspace {} of run {}: {}",
                dir.display(),
                run.id,
                e
            ),
        }
    }
}

/// Uses an existing directory as is; never deletes it
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    dir: PathBuf,
}

impl LocalWorkspace {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspace {
    async fn prepare(&self, _run: &Run) -> Result<PathBuf, ExecutionError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(self.dir.clone()),
            Ok(_) => Err(ExecutionError::Workspace(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(e) => Err(ExecutionError::Workspace(format!(
                "{}: {}",
                self.dir.display(),
                e
            ))),
        }
    }

    async fn release(&self, _run: &Run) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = LocalWorkspace::new(dir.path().to_path_buf());
        let run = Run::new("Tests", "abc", "refs/heads/main", 1);

        let path = workspace.prepare(&run).await.unwrap();
        assert_eq!(path, dir.path());

        workspace.release(&run).await;
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_local_workspace_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = LocalWorkspace::new(dir.path().join("missing"));
        let run = Run::new("Tests", "abc", "refs/heads/main", 1);

        let err = workspace.prepare(&run).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Workspace(_)));
    }

    #[tokio::test]
    async fn test_git_checkout_failure_is_workspace_error() {
        let base = tempfile::tempdir().unwrap();
        let missing_repo = base.path().join("no-such-repo");
        let checkout = GitCheckout::new(
            missing_repo.display().to_string(),
            base.path().join("workspaces"),
        );
        let run = Run::new("Tests", "0000000000000000000000000000000000000000", "refs/heads/main", 1);

        let err = checkout.prepare(&run).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Workspace(_)));

        let dir = base.path().join("workspaces").join(run.id.to_string());
        assert!(dir.exists());
        checkout.release(&run).await;
        assert!(!dir.exists());
    }
}

//! Working-copy provisioning
//!
//! Each workstream gets its own checkout under `<repo>/.goose-worktrees/<name>`
//! on a dedicated `goose/<name>` branch, so concurrent agents never edit the
//! same tree.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::commands::{current_branch, git_command, git_command_checked, is_git_repository};
use crate::error::Result;

/// Diffs larger than this are reported as empty rather than shipped to observers.
const MAX_DIFF_BYTES: usize = 10 * 1024 * 1024;

/// A provisioned working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the working copy
    pub path: PathBuf,
    /// Branch the copy is checked out on
    pub branch: String,
    /// Commit hash at HEAD when the copy was created or listed
    pub commit: String,
}

/// Configuration for WorktreeProvider
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Directory (relative to the repo root) holding managed copies
    pub worktree_dir: PathBuf,
    /// Prefix for workstream branch names
    pub branch_prefix: String,
    /// Branch to fall back to when the repo's current branch cannot be resolved
    pub fallback_branch: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(".goose-worktrees"),
            branch_prefix: "goose/".to_string(),
            fallback_branch: "main".to_string(),
        }
    }
}

/// Provisions and reclaims isolated working copies of a source repository
#[derive(Debug)]
pub struct WorktreeProvider {
    repo_root: PathBuf,
    config: WorktreeConfig,
}

impl WorktreeProvider {
    /// Create a provider for the given repository root
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            config: WorktreeConfig::default(),
        }
    }

    /// Create a provider with custom configuration
    pub fn with_config(repo_root: impl Into<PathBuf>, config: WorktreeConfig) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
        }
    }

    /// The repository root
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Directory holding all managed copies
    pub fn worktree_dir(&self) -> PathBuf {
        self.repo_root.join(&self.config.worktree_dir)
    }

    /// Branch name for a workstream name
    pub fn branch_name(&self, name: &str) -> String {
        format!("{}{}", self.config.branch_prefix, name)
    }

    /// Whether the repo root is a managed git repository
    pub async fn is_available(&self) -> bool {
        is_git_repository(&self.repo_root).await
    }

    /// Create the managed directory and add it to the repo's ignore file.
    ///
    /// The ignore-file append is best-effort and not atomic across processes.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.worktree_dir()).await?;

        let entry = format!("{}/", self.config.worktree_dir.display());
        let gitignore = self.repo_root.join(".gitignore");
        let existing = tokio::fs::read_to_string(&gitignore)
            .await
            .unwrap_or_default();

        if !existing.lines().any(|line| line.trim() == entry) {
            let mut contents = existing;
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&entry);
            contents.push('\n');
            tokio::fs::write(&gitignore, contents).await?;
            debug!("Added {} to {:?}", entry, gitignore);
        }

        Ok(())
    }

    /// Create a working copy for `name`, recreating it if one already exists.
    ///
    /// The branch is `goose/<name>`, based on `base_branch` when given,
    /// otherwise the repo's current branch (fallback `main`). Branch creation
    /// failure is ignored: an existing branch is simply checked out again.
    pub async fn create(&self, name: &str, base_branch: Option<&str>) -> Result<WorktreeInfo> {
        self.ensure().await?;

        let branch = self.branch_name(name);
        let path = self.worktree_dir().join(name);
        let path_str = path.to_string_lossy().to_string();

        if path.exists() {
            info!("Recreating existing worktree for {}", name);
            let _ = git_command(
                &self.repo_root,
                &["worktree", "remove", "--force", &path_str],
            )
            .await;
            let _ = tokio::fs::remove_dir_all(&path).await;
            let _ = git_command(&self.repo_root, &["worktree", "prune"]).await;
        }

        let base = match base_branch {
            Some(b) => b.to_string(),
            None => current_branch(&self.repo_root)
                .await
                .unwrap_or_else(|| self.config.fallback_branch.clone()),
        };

        // Fails when the branch already exists; the add below reuses it.
        let _ = git_command(&self.repo_root, &["branch", &branch, &base]).await;

        info!("Creating worktree at {:?} on branch {}", path, branch);
        git_command_checked(&self.repo_root, &["worktree", "add", &path_str, &branch]).await?;

        let commit = git_command_checked(&path, &["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();

        Ok(WorktreeInfo {
            path,
            branch,
            commit,
        })
    }

    /// Remove the working copy for `name` and delete its branch.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.worktree_dir().join(name);
        let path_str = path.to_string_lossy().to_string();

        info!("Removing worktree at {:?}", path);
        git_command_checked(
            &self.repo_root,
            &["worktree", "remove", "--force", &path_str],
        )
        .await?;

        let branch = self.branch_name(name);
        if let Err(e) = git_command_checked(&self.repo_root, &["branch", "-D", &branch]).await {
            warn!("Failed to delete branch {}: {}", branch, e);
        }
        let _ = git_command(&self.repo_root, &["worktree", "prune"]).await;

        Ok(())
    }

    /// List managed working copies.
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let output =
            git_command_checked(&self.repo_root, &["worktree", "list", "--porcelain"]).await?;

        let managed_root = self.worktree_dir();
        let mut worktrees = Vec::new();
        let mut current: Option<WorktreeInfo> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(info) = current.take() {
                    worktrees.push(info);
                }
                current = Some(WorktreeInfo {
                    path: PathBuf::from(path),
                    branch: String::new(),
                    commit: String::new(),
                });
            } else if let Some(info) = current.as_mut() {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    info.commit = head.to_string();
                } else if let Some(branch) = line.strip_prefix("branch ") {
                    info.branch = branch.trim_start_matches("refs/heads/").to_string();
                }
            }
        }
        if let Some(info) = current {
            worktrees.push(info);
        }

        // The main checkout appears first in porcelain output; only managed
        // copies are reported.
        worktrees.retain(|w| w.path.starts_with(&managed_root));

        Ok(worktrees)
    }

    /// Diff of uncommitted changes in a working copy.
    ///
    /// Returns an empty string on failure or when the diff exceeds 10 MiB.
    pub async fn diff(&self, path: &Path) -> String {
        match git_command(path, &["diff", "HEAD"]).await {
            Ok(output) if output.success => {
                if output.stdout.len() > MAX_DIFF_BYTES {
                    warn!(
                        "Diff for {:?} is {} bytes, over the capture bound",
                        path,
                        output.stdout.len()
                    );
                    String::new()
                } else {
                    output.stdout
                }
            }
            _ => String::new(),
        }
    }

    /// Porcelain status of a working copy, empty string on failure.
    pub async fn status(&self, path: &Path) -> String {
        match git_command(path, &["status", "--porcelain"]).await {
            Ok(output) if output.success => output.stdout,
            _ => String::new(),
        }
    }

    /// Stage and commit all changes in a working copy.
    ///
    /// Returns false on failure, including when there is nothing to commit.
    pub async fn commit(&self, path: &Path, message: &str) -> bool {
        match git_command(path, &["add", "-A"]).await {
            Ok(output) if output.success => {}
            _ => return false,
        }
        match git_command(path, &["commit", "-m", message]).await {
            Ok(output) => output.success,
            Err(_) => false,
        }
    }
}

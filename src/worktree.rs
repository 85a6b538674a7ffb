//! Git worktree lifecycle for development runs.
//!
//! Every development run gets its own worktree on a fresh branch derived from
//! the card title. A worktree moves through
//! `Absent -> Fetching -> Created -> InUse -> Removed`; cleanup is attempted
//! from any state, so a half-created tree from a failed run is torn down too.
//! Branch names are locked for the lifetime of a [`Worktree`] so two runs
//! can never share one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{CommandSpec, ProcessRunner};

/// Longest sanitized title used in a branch name.
pub const MAX_BRANCH_SLUG: usize = 50;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const ADD_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a card title into a branch-safe slug.
///
/// Lower-cases, collapses every run of characters outside `[a-z0-9]`
/// (existing dashes included) into a single `-`, trims dashes from both ends
/// and truncates to [`MAX_BRANCH_SLUG`] characters.
pub fn sanitize_branch_name(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    let truncated: String = slug.chars().take(MAX_BRANCH_SLUG).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Full development branch name: `<namespace>/<slug>`.
///
/// Titles with no usable characters fall back to `card-<card id>`.
pub fn dev_branch_name(namespace: &str, title: &str, card_id: &str) -> String {
    let slug = sanitize_branch_name(title);
    if slug.is_empty() {
        format!("{}/card-{}", namespace, sanitize_branch_name(card_id))
    } else {
        format!("{}/{}", namespace, slug)
    }
}

/// Where a worktree is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeState {
    Absent,
    Fetching,
    Created,
    InUse,
    Removed,
}

/// Branch names currently owned by a run.
#[derive(Debug, Clone, Default)]
pub struct BranchLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `branch`, failing if another run holds it.
    pub fn acquire(&self, branch: &str) -> Result<BranchGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::Worktree("branch lock poisoned".to_string()))?;
        if !held.insert(branch.to_string()) {
            return Err(Error::Worktree(format!(
                "branch {} is already in use by another run",
                branch
            )));
        }
        Ok(BranchGuard {
            locks: self.clone(),
            branch: branch.to_string(),
        })
    }

    /// Returns true if the branch is currently claimed.
    pub fn is_held(&self, branch: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(branch))
            .unwrap_or(false)
    }
}

/// Releases its branch name when dropped.
#[derive(Debug)]
pub struct BranchGuard {
    locks: BranchLocks,
    branch: String,
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.branch);
        }
    }
}

/// A worktree bound to one card for the duration of a run.
#[derive(Debug)]
pub struct Worktree {
    dir: PathBuf,
    branch: String,
    state: WorktreeState,
    _guard: BranchGuard,
}

impl Worktree {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn state(&self) -> WorktreeState {
        self.state
    }

    /// Marks the tree as handed to the agent.
    pub fn mark_in_use(&mut self) {
        if self.state == WorktreeState::Created {
            self.state = WorktreeState::InUse;
        }
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        if self.state != WorktreeState::Absent && self.state != WorktreeState::Removed {
            tracing::warn!(
                path = ?self.dir,
                branch = %self.branch,
                "worktree dropped without cleanup, it will be replaced on the next run"
            );
        }
    }
}

/// Creates and removes worktrees of the primary checkout.
pub struct WorktreeManager<R: ProcessRunner + ?Sized> {
    runner: Arc<R>,
    repo_dir: PathBuf,
    base_dir: PathBuf,
    remote: String,
    base_branch: String,
    locks: BranchLocks,
}

impl<R: ProcessRunner + ?Sized> WorktreeManager<R> {
    /// Creates a manager for worktrees of `repo_dir` placed under `base_dir`.
    pub fn new(
        runner: Arc<R>,
        repo_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        remote: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            repo_dir: repo_dir.into(),
            base_dir: base_dir.into(),
            remote: remote.into(),
            base_branch: base_branch.into(),
            locks: BranchLocks::new(),
        }
    }

    pub fn locks(&self) -> &BranchLocks {
        &self.locks
    }

    /// Claims the branch and returns an `Absent` worktree for the card.
    ///
    /// The directory is made absolute since git runs from the primary checkout.
    pub fn reserve(&self, card_id: &str, branch: &str) -> Result<Worktree> {
        let dir = std::path::absolute(self.base_dir.join(card_id))?;
        let guard = self.locks.acquire(branch)?;
        Ok(Worktree {
            dir,
            branch: branch.to_string(),
            state: WorktreeState::Absent,
            _guard: guard,
        })
    }

    /// Fetches the remote and creates the worktree on a fresh branch.
    ///
    /// A worktree directory or local branch of the same name left behind by
    /// an earlier run is removed first.
    pub async fn create(&self, worktree: &mut Worktree) -> Result<()> {
        worktree.state = WorktreeState::Fetching;
        self.git(["fetch", self.remote.as_str()], FETCH_TIMEOUT)
            .await
            .map_err(|e| Error::Git(format!("fetch {} failed: {}", self.remote, e)))?;

        if tokio::fs::try_exists(&worktree.dir).await.unwrap_or(false) {
            tracing::info!(path = ?worktree.dir, "removing stale worktree");
            self.remove_dir(&worktree.dir).await?;
        }
        // Registrations whose directory vanished still pin their branch.
        if let Err(e) = self.git(["worktree", "prune"], LOCAL_GIT_TIMEOUT).await {
            tracing::debug!(error = %e, "worktree prune failed");
        }

        match self
            .git(["branch", "-D", worktree.branch.as_str()], LOCAL_GIT_TIMEOUT)
            .await
        {
            Ok(()) => tracing::info!(branch = %worktree.branch, "deleted stale branch"),
            Err(e) => tracing::debug!(branch = %worktree.branch, error = %e, "no stale branch to delete"),
        }

        if let Some(parent) = worktree.dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dir = worktree.dir.display().to_string();
        let start_point = format!("{}/{}", self.remote, self.base_branch);
        self.git(
            [
                "worktree",
                "add",
                "-b",
                worktree.branch.as_str(),
                dir.as_str(),
                start_point.as_str(),
            ],
            ADD_TIMEOUT,
        )
        .await
        .map_err(|e| Error::Worktree(format!("git worktree add failed: {}", e)))?;

        worktree.state = WorktreeState::Created;
        tracing::info!(path = ?worktree.dir, branch = %worktree.branch, "created worktree");
        Ok(())
    }

    /// Removes the worktree and deletes its branch.
    ///
    /// Falls back to a recursive delete plus `git worktree prune` when git
    /// refuses the removal. A branch that is already gone is fine.
    pub async fn cleanup(&self, mut worktree: Worktree) -> Result<()> {
        let result = self.remove_dir(&worktree.dir).await;

        if let Err(e) = self
            .git(["branch", "-D", worktree.branch.as_str()], LOCAL_GIT_TIMEOUT)
            .await
        {
            tracing::debug!(branch = %worktree.branch, error = %e, "branch already gone");
        }

        worktree.state = WorktreeState::Removed;
        tracing::info!(path = ?worktree.dir, "cleaned up worktree");
        result
    }

    /// `git worktree remove --force`, or `rm -rf` plus `git worktree prune`
    /// when git refuses.
    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let dir = path.display().to_string();
        let Err(e) = self
            .git(["worktree", "remove", "--force", dir.as_str()], LOCAL_GIT_TIMEOUT)
            .await
        else {
            return Ok(());
        };

        tracing::debug!(path = ?path, error = %e, "worktree remove failed, forcing");
        let forced = async {
            self.run(CommandSpec::new(
                "rm",
                ["-rf", dir.as_str()],
                &self.repo_dir,
                LOCAL_GIT_TIMEOUT,
            ))
            .await?;
            self.git(["worktree", "prune"], LOCAL_GIT_TIMEOUT).await
        };
        forced.await.map_err(|e| {
            tracing::error!(path = ?path, error = %e, "failed to clean up worktree");
            Error::Cleanup {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }

    async fn git<const N: usize>(&self, args: [&str; N], timeout: Duration) -> Result<()> {
        self.run(CommandSpec::git(args, &self.repo_dir, timeout)).await
    }

    async fn run(&self, spec: CommandSpec) -> Result<()> {
        self.runner.run(spec).await.map(|_| ())
    }
}

//! Committing worktree changes and opening pull requests.
//!
//! All git and gh commands go through the [`ProcessRunner`], so they run as
//! the restricted identity with `GITHUB_TOKEN` in their environment.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::process::{CommandSpec, ProcessRunner};

const LOCAL_GIT_TIMEOUT: Duration = Duration::from_secs(30);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// A pull request opened for a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR number, when the URL ends in one.
    pub number: Option<u64>,
    pub url: String,
    pub title: String,
    pub base_branch: String,
    pub head_branch: String,
}

/// Commits, pushes and opens draft PRs from development worktrees.
pub struct PRManager<R: ProcessRunner + ?Sized> {
    runner: Arc<R>,
    remote: String,
    base_branch: String,
    author: String,
}

impl<R: ProcessRunner + ?Sized> PRManager<R> {
    /// `author` is the `Name <email>` commits are attributed to.
    pub fn new(
        runner: Arc<R>,
        remote: impl Into<String>,
        base_branch: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            remote: remote.into(),
            base_branch: base_branch.into(),
            author: author.into(),
        }
    }

    /// Stages everything and commits it.
    ///
    /// Returns `false` without committing when nothing is staged.
    pub async fn commit_changes(&self, worktree: &Path, message: &str) -> Result<bool> {
        self.git(worktree, &["add", "-A"], LOCAL_GIT_TIMEOUT)
            .await
            .map_err(|e| Error::Git(format!("failed to stage changes: {}", e)))?;

        let staged = self
            .git(worktree, &["diff", "--cached", "--name-only"], LOCAL_GIT_TIMEOUT)
            .await?;
        if staged.trim().is_empty() {
            tracing::info!(path = ?worktree, "no file changes to commit");
            return Ok(false);
        }

        let author = format!("--author={}", self.author);
        self.git(
            worktree,
            &["commit", author.as_str(), "-m", message],
            LOCAL_GIT_TIMEOUT,
        )
        .await
        .map_err(|e| Error::Git(format!("failed to commit: {}", e)))?;

        tracing::info!(
            path = ?worktree,
            files = staged.lines().filter(|l| !l.is_empty()).count(),
            "committed changes"
        );
        Ok(true)
    }

    /// Pushes the branch to the configured remote.
    pub async fn push_branch(&self, worktree: &Path, branch: &str) -> Result<()> {
        self.git(
            worktree,
            &["push", "-u", self.remote.as_str(), branch],
            REMOTE_TIMEOUT,
        )
        .await
        .map_err(|e| Error::Git(format!("failed to push branch: {}", e)))?;
        tracing::info!(branch = %branch, remote = %self.remote, "pushed branch");
        Ok(())
    }

    /// Opens a draft pull request against the base branch.
    pub async fn create_pr(
        &self,
        worktree: &Path,
        title: &str,
        body: &str,
        head_branch: &str,
    ) -> Result<PullRequest> {
        let spec = CommandSpec::new(
            "gh",
            [
                "pr",
                "create",
                "--draft",
                "--base",
                self.base_branch.as_str(),
                "--head",
                head_branch,
                "--title",
                title,
                "--body",
                body,
            ],
            worktree,
            REMOTE_TIMEOUT,
        );
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| Error::Git(format!("failed to create PR: {}", e)))?;

        let url = output.stdout.trim().to_string();
        let number = url.rsplit('/').next().and_then(|s| s.parse().ok());
        tracing::info!(url = %url, "created pull request");

        Ok(PullRequest {
            number,
            url,
            title: title.to_string(),
            base_branch: self.base_branch.clone(),
            head_branch: head_branch.to_string(),
        })
    }

    async fn git(&self, worktree: &Path, args: &[&str], timeout: Duration) -> Result<String> {
        let output = self
            .runner
            .run(CommandSpec::git(args.iter().copied(), worktree, timeout))
            .await?;
        Ok(output.stdout)
    }
}

/// Commit message for a card.
pub fn commit_message(card_title: &str) -> String {
    format!("feat: {}", card_title)
}

/// PR body linking back to the card.
pub fn pr_body(card_url: &str) -> String {
    format!("Trello: {}", card_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExecIdentity, SandboxedRunner};
    use std::process::Command;
    use tempfile::TempDir;

    fn create_test_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to run git");
            assert!(output.status.success(), "git {:?} failed", args);
        };

        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test User"]);
        run(&["config", "commit.gpgsign", "false"]);
        std::fs::write(temp_dir.path().join("README.md"), "# Test Repo").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);
        temp_dir
    }

    fn manager() -> PRManager<SandboxedRunner> {
        PRManager::new(
            Arc::new(SandboxedRunner::new(ExecIdentity::current())),
            "origin",
            "main",
            "Sergio AI <sergio-ai@noreply>",
        )
    }

    fn last_commit(dir: &Path, format: &str) -> String {
        let output = Command::new("git")
            .args(["log", "-1", &format!("--format={}", format)])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn commits_changes_under_bot_author() {
        let repo = create_test_repo();
        std::fs::write(repo.path().join("feature.rs"), "fn main() {}").unwrap();

        let committed = manager()
            .commit_changes(repo.path(), &commit_message("Add feature"))
            .await
            .unwrap();

        assert!(committed);
        assert_eq!(last_commit(repo.path(), "%s"), "feat: Add feature");
        assert_eq!(last_commit(repo.path(), "%an <%ae>"), "Sergio AI <sergio-ai@noreply>");
    }

    #[tokio::test]
    async fn nothing_staged_means_no_commit() {
        let repo = create_test_repo();

        let committed = manager()
            .commit_changes(repo.path(), "feat: nothing")
            .await
            .unwrap();

        assert!(!committed);
        assert_eq!(last_commit(repo.path(), "%s"), "Initial commit");
    }

    #[tokio::test]
    async fn push_without_remote_is_a_git_error() {
        let repo = create_test_repo();
        let err = manager()
            .push_branch(repo.path(), "sergio-dev/x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Git(_)), "got {:?}", err);
    }

    #[test]
    fn message_and_body_formats() {
        assert_eq!(commit_message("Fix bug"), "feat: Fix bug");
        assert_eq!(pr_body("https://trello.com/c/1"), "Trello: https://trello.com/c/1");
    }
}

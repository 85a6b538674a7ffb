//! Development pipeline: the agent implements a card in its own worktree,
//! verification commands run against the result and the changes are opened
//! as a draft pull request.

use std::path::Path;

use crate::board::Card;
use crate::context::{self, CardContext, DocumentHeader, ScratchDir};
use crate::error::Result;
use crate::ledger::{CardLedger, LedgerFiles};
use crate::pr::{commit_message, pr_body, PRManager};
use crate::process::{CommandSpec, ProcessRunner};
use crate::worktree::{dev_branch_name, Worktree, WorktreeManager};

use super::{fit_comment, handle_failure, PipelineColumns, PipelineDeps, RunOutcome};

const OUTPUT_TRUNCATED: &str = "\n\n... (output truncated)";

pub struct DevelopmentPipeline {
    deps: PipelineDeps,
    ledger: CardLedger,
    columns: PipelineColumns,
    worktrees: WorktreeManager<dyn ProcessRunner>,
    prs: PRManager<dyn ProcessRunner>,
}

impl DevelopmentPipeline {
    /// Opens the development ledger under the data directory.
    pub async fn open(deps: PipelineDeps) -> Result<Self> {
        let config = deps.config.clone();
        let ledger = CardLedger::open(&config.data_dir, &LedgerFiles::DEVELOPMENT).await?;
        let worktrees = WorktreeManager::new(
            deps.runner.clone(),
            &config.repo_dir,
            &config.worktree_base_dir,
            &config.git.base_remote,
            &config.git.base_branch,
        );
        let prs = PRManager::new(
            deps.runner.clone(),
            &config.git.base_remote,
            &config.git.base_branch,
            config.commit_author(),
        );
        Ok(Self {
            columns: PipelineColumns::development(&config),
            deps,
            ledger,
            worktrees,
            prs,
        })
    }

    pub fn ledger(&self) -> &CardLedger {
        &self.ledger
    }

    /// Flushes and releases the ledger.
    pub async fn close(self) -> Result<()> {
        self.ledger.close().await
    }

    /// One poll cycle: takes at most the first new card of the source column.
    pub async fn poll(&mut self) -> Result<Option<RunOutcome>> {
        let cards = self.deps.board.list_cards(&self.columns.source).await?;

        for card in &cards {
            if self.ledger.is_processed(&card.id) {
                tracing::info!(card_id = %card.id, title = %card.title, "dev card moved back, re-processing");
                self.ledger.unmark_processed(&card.id).await?;
            }
        }

        let pending = cards.iter().filter(|c| !self.ledger.is_processed(&c.id)).count();
        let Some(card) = cards.iter().find(|c| !self.ledger.is_processed(&c.id)) else {
            tracing::debug!("no new dev cards");
            return Ok(None);
        };
        tracing::info!(count = pending, "found dev cards, taking the first");

        Ok(Some(self.process_card(card).await))
    }

    /// Runs one card to completion. Failures are handled, never returned.
    ///
    /// The worktree and the scratch directory are removed whatever happens.
    pub async fn process_card(&mut self, card: &Card) -> RunOutcome {
        let branch = dev_branch_name(
            &self.deps.config.branch_namespace(),
            &card.title,
            &card.id,
        );
        tracing::info!(card_id = %card.id, title = %card.title, branch = %branch, "developing card");

        let scratch = ScratchDir::for_card(&self.deps.bot_prefix(), &card.id);
        let mut worktree = None;
        let result = self.run(card, &branch, &scratch, &mut worktree).await;

        if let Some(worktree) = worktree {
            if let Err(e) = self.worktrees.cleanup(worktree).await {
                tracing::error!(card_id = %card.id, error = %e, "worktree cleanup failed");
            }
        }
        scratch.cleanup().await;

        match result {
            Ok(outcome) => {
                tracing::info!(card_id = %card.id, outcome = ?outcome, "development done");
                outcome
            }
            Err(e) => handle_failure(&self.deps, &mut self.ledger, &self.columns, card, &e).await,
        }
    }

    async fn run(
        &mut self,
        card: &Card,
        branch: &str,
        scratch: &ScratchDir,
        slot: &mut Option<Worktree>,
    ) -> Result<RunOutcome> {
        let deps = self.deps.clone();
        let config = &deps.config;

        deps.board.move_card(&card.id, &self.columns.working).await?;

        let ctx = context::gather(
            deps.board.as_ref(),
            card,
            scratch,
            config.limits.max_attachment_bytes,
        )
        .await?;
        let document = context::render_card_document(&ctx, &DocumentHeader::Development);

        let worktree = slot.insert(self.worktrees.reserve(&card.id, branch)?);
        self.worktrees.create(worktree).await?;
        worktree.mark_in_use();
        let dir = worktree.dir().to_path_buf();

        let output = deps
            .agent
            .invoke(
                &config.prompts.development_template,
                &document,
                &dir,
                config.timeouts.development(),
            )
            .await?;
        tracing::info!(card_id = %card.id, chars = output.len(), "agent finished");

        let comment = format!(
            "**{} Dev Output:**\n\n{}",
            config.bot_name,
            fit_comment(&output, config.limits.comment_ceiling, OUTPUT_TRUNCATED)
        );
        deps.board.add_comment(&card.id, &comment).await?;

        self.verify(&dir).await?;

        let outcome = self.publish(&ctx, branch, &dir).await?;

        deps.board.move_card(&card.id, &self.columns.done).await?;
        self.ledger.mark_processed(&card.id).await?;
        self.ledger.clear_attempts(&card.id).await?;
        Ok(outcome)
    }

    /// Runs the verification commands, inside a dev server scope if one is configured.
    async fn verify(&self, dir: &Path) -> Result<()> {
        let config = &self.deps.config;
        let Some((command, marker)) = config.pipeline.dev_server() else {
            return self.run_test_commands(dir).await;
        };

        tracing::info!(command = %command, "starting dev server");
        let mut server = self
            .deps
            .runner
            .spawn_service(CommandSpec::shell(command, dir, config.timeouts.dev_server()))
            .await?;

        let result = match server.wait_ready(marker, config.timeouts.dev_server()).await {
            Ok(()) => self.run_test_commands(dir).await,
            Err(e) => Err(e),
        };
        server.stop(config.timeouts.dev_server_grace()).await;
        result
    }

    /// Runs each test command in order, stopping at the first failure.
    async fn run_test_commands(&self, dir: &Path) -> Result<()> {
        let config = &self.deps.config;
        if config.pipeline.test_commands.is_empty() {
            tracing::info!("no test commands configured, skipping tests");
            return Ok(());
        }
        for command in &config.pipeline.test_commands {
            tracing::info!(command = %command, "running test command");
            self.deps
                .runner
                .run(CommandSpec::shell(command, dir, config.timeouts.test()))
                .await?;
            tracing::info!(command = %command, "test command passed");
        }
        Ok(())
    }

    /// Commits, pushes and opens the PR, or reports that nothing changed.
    async fn publish(&self, ctx: &CardContext, branch: &str, dir: &Path) -> Result<RunOutcome> {
        let card = &ctx.card;
        let board = &self.deps.board;

        if !self.prs.commit_changes(dir, &commit_message(&card.title)).await? {
            board
                .add_comment(
                    &card.id,
                    &format!(
                        "**{}: no code changes detected**\n\nThe agent completed the run but did not produce file changes to commit.",
                        self.deps.config.bot_name
                    ),
                )
                .await?;
            tracing::info!(card_id = %card.id, "posted no-op result comment");
            return Ok(RunOutcome::NoOp);
        }

        self.prs.push_branch(dir, branch).await?;
        let pr = self
            .prs
            .create_pr(dir, &card.title, &pr_body(&card.url), branch)
            .await?;
        board.attach_url(&card.id, &pr.url, "Pull Request").await?;
        tracing::info!(card_id = %card.id, url = %pr.url, "attached pull request to card");

        Ok(RunOutcome::Success {
            artifacts: vec![pr.url],
        })
    }
}

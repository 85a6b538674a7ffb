//! Analysis pipeline: the agent reads a card against the repository and
//! answers with an implementation plan.

use crate::board::Card;
use crate::card_update::parse_card_update;
use crate::context::{self, DocumentHeader, ScratchDir};
use crate::error::Result;
use crate::ledger::{CardLedger, LedgerFiles};

use super::{handle_failure, PipelineColumns, PipelineDeps, RunOutcome};

pub struct AnalysisPipeline {
    deps: PipelineDeps,
    ledger: CardLedger,
    columns: PipelineColumns,
}

impl AnalysisPipeline {
    /// Opens the analysis ledger under the data directory.
    pub async fn open(deps: PipelineDeps) -> Result<Self> {
        let ledger = CardLedger::open(&deps.config.data_dir, &LedgerFiles::ANALYSIS).await?;
        let columns = PipelineColumns::analysis(&deps.config);
        Ok(Self {
            deps,
            ledger,
            columns,
        })
    }

    pub fn ledger(&self) -> &CardLedger {
        &self.ledger
    }

    /// Flushes and releases the ledger.
    pub async fn close(self) -> Result<()> {
        self.ledger.close().await
    }

    /// One poll cycle: handles every new card in the source column, in order.
    ///
    /// Cards still in the source column but recorded as processed were moved
    /// back by a human and are handled again.
    pub async fn poll(&mut self) -> Result<Vec<RunOutcome>> {
        let cards = self.deps.board.list_cards(&self.columns.source).await?;

        for card in &cards {
            if self.ledger.is_processed(&card.id) {
                tracing::info!(card_id = %card.id, title = %card.title, "card moved back for revision, re-processing");
                self.ledger.unmark_processed(&card.id).await?;
            }
        }

        let new_cards: Vec<&Card> = cards
            .iter()
            .filter(|c| !self.ledger.is_processed(&c.id))
            .collect();
        if new_cards.is_empty() {
            tracing::debug!("no new cards awaiting analysis");
            return Ok(Vec::new());
        }
        tracing::info!(count = new_cards.len(), "found cards awaiting analysis");

        let mut outcomes = Vec::with_capacity(new_cards.len());
        for card in new_cards {
            outcomes.push(self.process_card(card).await);
        }
        Ok(outcomes)
    }

    /// Runs one card to completion. Failures are handled, never returned.
    pub async fn process_card(&mut self, card: &Card) -> RunOutcome {
        tracing::info!(card_id = %card.id, title = %card.title, "analysing card");

        let scratch = ScratchDir::for_card(&self.deps.bot_prefix(), &card.id);
        let result = self.run(card, &scratch).await;
        scratch.cleanup().await;

        match result {
            Ok(outcome) => {
                tracing::info!(card_id = %card.id, "analysis done");
                outcome
            }
            Err(e) => handle_failure(&self.deps, &mut self.ledger, &self.columns, card, &e).await,
        }
    }

    async fn run(&mut self, card: &Card, scratch: &ScratchDir) -> Result<RunOutcome> {
        let deps = &self.deps;
        let config = &deps.config;

        deps.board.move_card(&card.id, &self.columns.working).await?;

        let ctx = context::gather(
            deps.board.as_ref(),
            card,
            scratch,
            config.limits.max_attachment_bytes,
        )
        .await?;
        let header = DocumentHeader::Analysis {
            board_id: config.board.board_id.clone(),
            source_column: self.columns.source.clone(),
            destination_column: self.columns.done.clone(),
        };
        let document = context::render_card_document(&ctx, &header);
        let log_path = context::write_card_log(&config.logs_dir, card, &document).await?;
        tracing::debug!(card_id = %card.id, path = ?log_path, "wrote card document");

        let output = deps
            .agent
            .invoke(
                &config.prompts.revision_template,
                &document,
                &config.repo_dir,
                config.timeouts.analysis(),
            )
            .await?;
        tracing::info!(card_id = %card.id, chars = output.len(), "agent produced plan");

        let parsed = parse_card_update(&output);
        if let Some(update) = &parsed.update {
            deps.board.update_card(&card.id, update).await?;
            tracing::info!(
                card_id = %card.id,
                title = update.title.is_some(),
                description = update.description.is_some(),
                "applied card update"
            );
        }

        if parsed.comment.trim().is_empty() {
            tracing::info!(card_id = %card.id, "agent output has no comment text, skipping comment");
        } else {
            let comment = self.fit_comment(card, &parsed.comment).await?;
            deps.board.add_comment(&card.id, &comment).await?;
        }
        deps.board.move_card(&card.id, &self.columns.done).await?;

        self.ledger.mark_processed(&card.id).await?;
        self.ledger.clear_attempts(&card.id).await?;
        Ok(RunOutcome::Success {
            artifacts: vec![log_path.display().to_string()],
        })
    }

    /// Keeps the comment under the ceiling, saving the full text beside the card log.
    async fn fit_comment(&self, card: &Card, comment: &str) -> Result<String> {
        let config = &self.deps.config;
        let ceiling = config.limits.comment_ceiling;
        if comment.chars().count() <= ceiling {
            return Ok(comment.to_string());
        }

        let path = config.logs_dir.join(format!(
            "{}-{}-plan.md",
            card.id,
            context::sanitize_filename(&card.title)
        ));
        tokio::fs::create_dir_all(&config.logs_dir).await?;
        tokio::fs::write(&path, comment).await?;
        tracing::info!(card_id = %card.id, path = ?path, "plan exceeds comment limit, saved full text");

        let suffix = format!(
            "\n\n... (output truncated, full text saved to {})",
            path.display()
        );
        Ok(super::fit_comment(comment, ceiling, &suffix))
    }
}

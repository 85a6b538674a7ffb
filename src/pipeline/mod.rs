//! Card pipelines.
//!
//! Both pipelines move a card `source -> working -> done`, invoking the agent
//! in between. Any failure inside a run is caught once, in
//! [`handle_failure`]: the card gets an error comment, its attempt counter is
//! bumped and the retry policy decides whether it goes back to the source
//! column or into the failed column.

pub mod analysis;
pub mod development;

use std::sync::Arc;

use crate::agent::AgentInvoker;
use crate::board::{BoardApi, Card};
use crate::config::Config;
use crate::error::{truncate_chars, Error};
use crate::ledger::CardLedger;
use crate::policy::{escalate, Escalation};
use crate::process::ProcessRunner;
use crate::secrets::{SecretsManager, AGENT_API_KEY};

pub use analysis::AnalysisPipeline;
pub use development::DevelopmentPipeline;

/// Longest error message posted to a card.
pub const ERROR_COMMENT_CHARS: usize = 5000;

/// How a single card run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The card reached its done column. `artifacts` holds references such as PR URLs.
    Success { artifacts: Vec<String> },
    /// The run completed but the agent produced no code changes.
    NoOp,
    /// The run failed and was handed to the retry policy.
    Failure { error: String, run_id: String },
}

/// The columns one pipeline moves cards between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineColumns {
    pub source: String,
    pub working: String,
    pub done: String,
    pub failed: Option<String>,
}

impl PipelineColumns {
    /// `task_revision -> reviewing -> todo_reviewed`.
    pub fn analysis(config: &Config) -> Self {
        let columns = &config.board.columns;
        Self {
            source: columns.task_revision.clone(),
            working: columns.reviewing.clone(),
            done: columns.todo_reviewed.clone(),
            failed: columns.failed_column().map(str::to_string),
        }
    }

    /// `task_development -> developing -> task_developed`.
    pub fn development(config: &Config) -> Self {
        let columns = &config.board.columns;
        Self {
            source: columns.task_development.clone(),
            working: columns.developing.clone(),
            done: columns.task_developed.clone(),
            failed: columns.failed_column().map(str::to_string),
        }
    }
}

/// Collaborators shared by both pipelines.
#[derive(Clone)]
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub board: Arc<dyn BoardApi>,
    pub runner: Arc<dyn ProcessRunner>,
    pub agent: Arc<AgentInvoker<dyn ProcessRunner>>,
    pub secrets: Arc<SecretsManager>,
}

impl PipelineDeps {
    /// Wires the collaborators; the agent receives `ANTHROPIC_API_KEY` only.
    pub fn new(
        config: Arc<Config>,
        board: Arc<dyn BoardApi>,
        runner: Arc<dyn ProcessRunner>,
        secrets: Arc<SecretsManager>,
    ) -> Self {
        let agent = AgentInvoker::new(
            runner.clone(),
            &config,
            secrets.environment_for(&[AGENT_API_KEY]),
        );
        Self {
            config,
            board,
            runner,
            agent: Arc::new(agent),
            secrets,
        }
    }

    /// Lower-cased bot name, used as a prefix for scratch files.
    pub fn bot_prefix(&self) -> String {
        self.config.bot_name.to_lowercase()
    }
}

/// Identifier quoted in error comments: `<unix millis>-<card id>`.
pub fn run_id(card_id: &str) -> String {
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), card_id)
}

/// Cuts `text` to at most `ceiling` characters, ending with `suffix` when cut.
pub fn fit_comment(text: &str, ceiling: usize, suffix: &str) -> String {
    if text.chars().count() <= ceiling {
        return text.to_string();
    }
    let room = ceiling.saturating_sub(suffix.chars().count());
    format!("{}{}", truncate_chars(text, room), suffix)
}

/// Reports a failed run and routes the card. Never fails itself.
///
/// Comment and move failures are logged; a ledger failure counts as zero
/// attempts.
pub(crate) async fn handle_failure(
    deps: &PipelineDeps,
    ledger: &mut CardLedger,
    columns: &PipelineColumns,
    card: &Card,
    error: &Error,
) -> RunOutcome {
    let run_id = run_id(&card.id);
    let message = deps.secrets.redact(&error.to_string());
    let message = truncate_chars(&message, ERROR_COMMENT_CHARS).to_string();

    tracing::error!(card_id = %card.id, run_id = %run_id, error = %message, "card run failed");

    let comment = format!(
        "**{} error (run {}):**\n\n{}",
        deps.config.bot_name, run_id, message
    );
    if let Err(e) = deps.board.add_comment(&card.id, &comment).await {
        tracing::error!(card_id = %card.id, error = %e, "failed to post error comment");
    }

    let attempts = match ledger.increment_attempts(&card.id).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(card_id = %card.id, error = %e, "failed to record attempt");
            0
        }
    };

    let failed_column = columns.failed.as_deref();
    let target = match escalate(
        attempts,
        deps.config.max_card_attempts,
        failed_column.is_some(),
    ) {
        Escalation::Escalate => {
            tracing::error!(
                card_id = %card.id,
                attempts,
                "card exhausted its attempts, moving to failed column"
            );
            failed_column.unwrap_or(columns.source.as_str())
        }
        Escalation::Retry => {
            tracing::info!(card_id = %card.id, attempts, "moving card back for retry");
            columns.source.as_str()
        }
    };
    if let Err(e) = deps.board.move_card(&card.id, target).await {
        tracing::error!(card_id = %card.id, column = %target, error = %e, "failed to move card");
    }

    RunOutcome::Failure {
        error: message,
        run_id,
    }
}

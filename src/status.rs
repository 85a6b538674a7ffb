//! Status report for the `status` subcommand.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::board::BoardApi;
use crate::config::Config;
use crate::error::Result;
use crate::ledger::{CardLedger, LedgerFiles};

/// Number of log lines shown.
pub const RECENT_LOG_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnStatus {
    pub id: String,
    pub name: String,
    pub cards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerStatus {
    pub processed: usize,
    pub failing: Vec<(String, u32)>,
}

impl LedgerStatus {
    fn from_ledger(ledger: &CardLedger) -> Self {
        Self {
            processed: ledger.processed_count(),
            failing: ledger
                .failing_cards()
                .map(|(id, n)| (id.to_string(), n))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub bot_name: String,
    pub columns: Vec<ColumnStatus>,
    pub analysis: LedgerStatus,
    pub development: LedgerStatus,
    pub recent_logs: Vec<String>,
}

impl StatusReport {
    pub fn total_cards(&self) -> usize {
        self.columns.iter().map(|c| c.cards.len()).sum()
    }
}

/// Collects card counts per configured column, ledger sizes and recent log lines.
pub async fn collect(board: &dyn BoardApi, config: &Config) -> Result<StatusReport> {
    let names: HashMap<String, String> = board
        .list_columns(&config.board.board_id)
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();

    let c = &config.board.columns;
    let ids: [&str; 7] = [
        &c.todo,
        &c.task_revision,
        &c.reviewing,
        &c.todo_reviewed,
        &c.task_development,
        &c.developing,
        &c.task_developed,
    ];
    let mut columns = Vec::new();
    for id in ids.into_iter().chain(c.failed_column()) {
        if id.is_empty() {
            continue;
        }
        let cards = board.list_cards(id).await?;
        columns.push(ColumnStatus {
            id: id.to_string(),
            name: names.get(id).cloned().unwrap_or_else(|| id.to_string()),
            cards: cards.into_iter().map(|card| card.title).collect(),
        });
    }

    let analysis = CardLedger::open(&config.data_dir, &LedgerFiles::ANALYSIS).await?;
    let development = CardLedger::open(&config.data_dir, &LedgerFiles::DEVELOPMENT).await?;

    Ok(StatusReport {
        bot_name: config.bot_name.clone(),
        columns,
        analysis: LedgerStatus::from_ledger(&analysis),
        development: LedgerStatus::from_ledger(&development),
        recent_logs: read_recent_logs(
            &config.logs_dir.join(config.log_file_name()),
            RECENT_LOG_LINES,
        )
        .await,
    })
}

/// The last `n` lines of the log file, or nothing if it does not exist.
pub async fn read_recent_logs(path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} status", self.bot_name.to_uppercase())?;

        writeln!(f, "\n-- Board --")?;
        for column in &self.columns {
            write!(f, "  {:>3}  {}", column.cards.len(), column.name)?;
            if !column.cards.is_empty() {
                write!(f, "  {}", column.cards.join(", "))?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "\n  Total: {} card(s) across {} lists",
            self.total_cards(),
            self.columns.len()
        )?;

        writeln!(f, "\n-- Ledger --")?;
        for (label, ledger) in [("analysis", &self.analysis), ("development", &self.development)] {
            writeln!(f, "  {}: {} processed", label, ledger.processed)?;
            for (card, attempts) in &ledger.failing {
                writeln!(f, "    {} failed {} time(s)", card, attempts)?;
            }
        }

        writeln!(f, "\n-- Recent Activity --")?;
        if self.recent_logs.is_empty() {
            writeln!(f, "  No log file found")?;
        }
        for line in &self.recent_logs {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}

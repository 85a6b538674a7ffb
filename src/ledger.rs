//! Persistent card ledger.
//!
//! Records which cards a pipeline has already handled and how many
//! consecutive times each card has failed. Both stores are small JSON
//! documents under the data directory. Every mutation rewrites the whole
//! document (write to a temporary sibling, then rename) before returning, so a
//! crash loses at most the latest mutation and never leaves a mixed file.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// File names of one pipeline's two stores.
#[derive(Debug, Clone)]
pub struct LedgerFiles {
    /// JSON array of processed card ids.
    pub processed: &'static str,
    /// JSON object of card id to consecutive failure count.
    pub attempts: &'static str,
}

impl LedgerFiles {
    /// Stores used by the analysis pipeline.
    pub const ANALYSIS: LedgerFiles = LedgerFiles {
        processed: "processed-cards.json",
        attempts: "failed-attempts.json",
    };

    /// Stores used by the development pipeline.
    pub const DEVELOPMENT: LedgerFiles = LedgerFiles {
        processed: "dev-processed-cards.json",
        attempts: "dev-failed-attempts.json",
    };
}

/// Durable processed-set and attempt counters for one pipeline.
///
/// Instances are independent: tests open them against temporary directories.
#[derive(Debug)]
pub struct CardLedger {
    processed_path: PathBuf,
    attempts_path: PathBuf,
    processed: BTreeSet<String>,
    attempts: BTreeMap<String, u32>,
}

impl CardLedger {
    /// Opens the ledger, restoring both stores from `data_dir`.
    ///
    /// A missing store is an empty one; any other read or parse failure is fatal.
    pub async fn open(data_dir: &Path, files: &LedgerFiles) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let processed_path = data_dir.join(files.processed);
        let attempts_path = data_dir.join(files.attempts);

        let processed: BTreeSet<String> = match read_store::<Vec<String>>(&processed_path).await? {
            Some(ids) => {
                tracing::info!(
                    count = ids.len(),
                    path = ?processed_path,
                    "loaded processed card ids"
                );
                ids.into_iter().collect()
            }
            None => {
                tracing::info!(path = ?processed_path, "no existing state file, starting fresh");
                BTreeSet::new()
            }
        };

        let attempts = read_store::<BTreeMap<String, u32>>(&attempts_path)
            .await?
            .unwrap_or_default();

        Ok(Self {
            processed_path,
            attempts_path,
            processed,
            attempts,
        })
    }

    /// Flushes both stores and releases the ledger.
    pub async fn close(self) -> Result<()> {
        self.save_processed().await?;
        self.save_attempts().await
    }

    /// Returns true if the card has been handled and should be skipped.
    pub fn is_processed(&self, card_id: &str) -> bool {
        self.processed.contains(card_id)
    }

    /// Marks the card as handled. Idempotent.
    pub async fn mark_processed(&mut self, card_id: &str) -> Result<()> {
        self.processed.insert(card_id.to_string());
        self.save_processed().await
    }

    /// Forgets that the card was handled, so the next poll picks it up again.
    pub async fn unmark_processed(&mut self, card_id: &str) -> Result<()> {
        self.processed.remove(card_id);
        self.save_processed().await
    }

    /// Returns the consecutive failure count for the card (0 when unknown).
    pub fn attempts(&self, card_id: &str) -> u32 {
        self.attempts.get(card_id).copied().unwrap_or(0)
    }

    /// Increments and persists the failure count, returning the new value.
    pub async fn increment_attempts(&mut self, card_id: &str) -> Result<u32> {
        let count = self.attempts(card_id).saturating_add(1);
        self.attempts.insert(card_id.to_string(), count);
        self.save_attempts().await?;
        Ok(count)
    }

    /// Resets the failure count of the card.
    pub async fn clear_attempts(&mut self, card_id: &str) -> Result<()> {
        self.attempts.remove(card_id);
        self.save_attempts().await
    }

    /// Number of processed cards.
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Cards with a non-zero failure count.
    pub fn failing_cards(&self) -> impl Iterator<Item = (&str, u32)> {
        self.attempts.iter().map(|(id, n)| (id.as_str(), *n))
    }

    async fn save_processed(&self) -> Result<()> {
        let ids: Vec<&String> = self.processed.iter().collect();
        write_store(&self.processed_path, &ids).await
    }

    async fn save_attempts(&self) -> Result<()> {
        write_store(&self.attempts_path, &self.attempts).await
    }
}

async fn read_store<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_store<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

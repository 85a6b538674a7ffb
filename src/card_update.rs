//! Structured card updates embedded in agent output.
//!
//! The analysis agent may rewrite the card it was given by emitting a fenced
//! block:
//!
//! ````text
//! ```CARD_UPDATE
//! TITLE: Fix bug
//! DESCRIPTION:
//! Steps to reproduce...
//! ```
//! ````
//!
//! The description runs to the end of the block. Everything outside the
//! block is the comment body.

use std::sync::LazyLock;

use regex::Regex;

use crate::board::CardUpdate;
use crate::error::{Error, Result};

static CARD_UPDATE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```CARD_UPDATE[ \t]*\r?\n(.*?)```").unwrap());

/// Agent output split into the optional update and the comment to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub update: Option<CardUpdate>,
    pub comment: String,
}

/// Extracts the first `CARD_UPDATE` block from `output`.
///
/// A missing or malformed block means "no metadata change"; the comment is
/// then the whole output.
pub fn parse_card_update(output: &str) -> ParsedOutput {
    let Some(caps) = CARD_UPDATE_BLOCK.captures(output) else {
        return ParsedOutput {
            update: None,
            comment: output.to_string(),
        };
    };

    match parse_block(&caps[1]) {
        Ok(update) => {
            let (start, end) = caps
                .get(0)
                .map(|m| (m.start(), m.end()))
                .unwrap_or((0, 0));
            let before = output[..start].trim_end();
            let after = output[end..].trim_start();
            let comment = match (before.is_empty(), after.is_empty()) {
                (false, false) => format!("{}\n\n{}", before, after),
                (false, true) => before.to_string(),
                (true, _) => after.to_string(),
            };
            ParsedOutput {
                update: Some(update),
                comment,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed card update block");
            ParsedOutput {
                update: None,
                comment: output.to_string(),
            }
        }
    }
}

fn parse_block(body: &str) -> Result<CardUpdate> {
    let mut update = CardUpdate::default();
    let mut lines = body.lines();

    while let Some(line) = lines.next() {
        if let Some(title) = line.trim_start().strip_prefix("TITLE:") {
            let title = title.trim();
            if !title.is_empty() {
                update.title = Some(title.to_string());
            }
        } else if let Some(first) = line.trim_start().strip_prefix("DESCRIPTION:") {
            let mut description = vec![first.trim_start()];
            description.extend(lines.by_ref());
            let description = description.join("\n").trim().to_string();
            if !description.is_empty() {
                update.description = Some(description);
            }
        }
    }

    if update.is_empty() {
        return Err(Error::Validation(
            "CARD_UPDATE block has neither TITLE nor DESCRIPTION".to_string(),
        ));
    }
    Ok(update)
}

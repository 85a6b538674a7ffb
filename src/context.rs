//! Per-run card context.
//!
//! Gathers a card's comments and attachments, downloads uploaded files into a
//! scratch directory and renders the plain-text card document the agent
//! reads. A failed download degrades that one attachment to a link.

use std::path::{Path, PathBuf};

use crate::board::{Attachment, BoardApi, Card, Comment};
use crate::error::Result;

/// An uploaded attachment saved to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAttachment {
    pub name: String,
    pub local_path: PathBuf,
    pub mime_type: Option<String>,
}

/// An attachment the agent only sees as a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAttachment {
    pub name: String,
    pub url: String,
}

/// Either a local copy or the link fallback.
pub type AttachmentOutcome = std::result::Result<DownloadedAttachment, LinkAttachment>;

/// Everything the agent is told about a card. Built fresh for every run.
#[derive(Debug, Clone)]
pub struct CardContext {
    pub card: Card,
    pub comments: Vec<Comment>,
    pub attachments: Vec<AttachmentOutcome>,
}

impl CardContext {
    pub fn downloaded(&self) -> impl Iterator<Item = &DownloadedAttachment> {
        self.attachments.iter().filter_map(|a| a.as_ref().ok())
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkAttachment> {
        self.attachments.iter().filter_map(|a| a.as_ref().err())
    }
}

/// What precedes the description in the card document.
#[derive(Debug, Clone)]
pub enum DocumentHeader {
    /// Card id, title and URL plus the board and column ids.
    Analysis {
        board_id: String,
        source_column: String,
        destination_column: String,
    },
    /// Card title and URL.
    Development,
}

/// Directory holding one run's downloaded attachments.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Scratch directory for a card under the system temp dir.
    pub fn for_card(prefix: &str, card_id: &str) -> Self {
        Self::at(std::env::temp_dir().join(format!("{}-att-{}", prefix, card_id)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory. Failures are logged.
    pub async fn cleanup(self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!(path = ?self.path, "removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "failed to clean up scratch directory")
            }
        }
    }
}

/// Fetches comments and attachments and downloads uploaded files.
pub async fn gather<B: BoardApi + ?Sized>(
    board: &B,
    card: &Card,
    scratch: &ScratchDir,
    max_bytes: u64,
) -> Result<CardContext> {
    let (comments, attachments) = tokio::try_join!(
        board.card_comments(&card.id),
        board.card_attachments(&card.id)
    )?;

    let attachments = download_attachments(board, attachments, scratch.path(), max_bytes).await?;
    let downloaded = attachments.iter().filter(|a| a.is_ok()).count();
    if downloaded > 0 {
        tracing::info!(card_id = %card.id, count = downloaded, "downloaded attachments");
    }

    Ok(CardContext {
        card: card.clone(),
        comments,
        attachments,
    })
}

async fn download_attachments<B: BoardApi + ?Sized>(
    board: &B,
    attachments: Vec<Attachment>,
    dir: &Path,
    max_bytes: u64,
) -> Result<Vec<AttachmentOutcome>> {
    if attachments.iter().any(|a| a.is_upload) {
        tokio::fs::create_dir_all(dir).await?;
        set_mode(dir, 0o755).await;
    }

    let mut outcomes = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let link = LinkAttachment {
            name: attachment.name.clone(),
            url: attachment.url.clone(),
        };
        if !attachment.is_upload {
            outcomes.push(Err(link));
            continue;
        }

        let local_path = dir.join(local_file_name(&attachment));
        match download_one(board, &attachment, &local_path, max_bytes).await {
            Ok(()) => {
                tracing::info!(
                    name = %attachment.name,
                    bytes = ?attachment.bytes,
                    "downloaded attachment"
                );
                outcomes.push(Ok(DownloadedAttachment {
                    name: attachment.name,
                    local_path,
                    mime_type: attachment.mime_type,
                }));
            }
            Err(e) => {
                tracing::warn!(name = %attachment.name, error = %e, "attachment download failed, using link");
                outcomes.push(Err(link));
            }
        }
    }
    Ok(outcomes)
}

async fn download_one<B: BoardApi + ?Sized>(
    board: &B,
    attachment: &Attachment,
    local_path: &Path,
    max_bytes: u64,
) -> Result<()> {
    let data = board.download_attachment(&attachment.url, max_bytes).await?;
    tokio::fs::write(local_path, data).await?;
    // Readable by the restricted agent user.
    set_mode(local_path, 0o644).await;
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        tracing::debug!(path = ?path, error = %e, "failed to set permissions");
    }
}

/// `<attachment id><original extension>`, so names never collide.
fn local_file_name(attachment: &Attachment) -> String {
    match Path::new(&attachment.name).extension() {
        Some(ext) => format!("{}.{}", attachment.id, ext.to_string_lossy()),
        None => attachment.id.clone(),
    }
}

/// Renders the card document handed to the agent.
pub fn render_card_document(ctx: &CardContext, header: &DocumentHeader) -> String {
    let card = &ctx.card;
    let mut lines: Vec<String> = Vec::new();

    if let DocumentHeader::Analysis { .. } = header {
        lines.push(format!("Card ID: {}", card.id));
    }
    lines.push(format!("Card: {}", card.title));
    lines.push(format!("URL: {}", card.url));
    if let DocumentHeader::Analysis {
        board_id,
        source_column,
        destination_column,
    } = header
    {
        lines.push(format!("Board ID: {}", board_id));
        lines.push(format!("Source List ID: {}", source_column));
        lines.push(format!("Destination List ID: {}", destination_column));
    }
    lines.push(String::new());

    lines.push("--- Description ---".to_string());
    if card.description.is_empty() {
        lines.push("(no description)".to_string());
    } else {
        lines.push(card.description.clone());
    }
    lines.push(String::new());

    lines.push("--- Comments ---".to_string());
    if ctx.comments.is_empty() {
        lines.push("(no comments)".to_string());
    } else {
        for comment in &ctx.comments {
            lines.push(format!("[{}] {}:", comment.date, comment.author));
            lines.push(comment.text.clone());
            lines.push(String::new());
        }
    }

    lines.push("--- Attachments ---".to_string());
    if ctx.attachments.is_empty() {
        lines.push("(no attachments)".to_string());
    } else {
        for file in ctx.downloaded() {
            let mime = file
                .mime_type
                .as_deref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default();
            lines.push(format!("{}{}: {}", file.name, mime, file.local_path.display()));
            lines.push(
                "  ^ This file has been downloaded locally. Use the Read tool to view it."
                    .to_string(),
            );
        }
        for link in ctx.links() {
            lines.push(format!("{} [link]: {}", link.name, link.url));
        }
    }

    lines.join("\n")
}

/// Replaces anything outside `[A-Za-z0-9_-]` with `_` and caps the length at 80.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect()
}

/// Writes the card document to `<logs_dir>/<card id>-<title>.txt`.
pub async fn write_card_log(logs_dir: &Path, card: &Card, document: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(logs_dir).await?;
    let path = logs_dir.join(format!("{}-{}.txt", card.id, sanitize_filename(&card.title)));
    tokio::fs::write(&path, document).await?;
    Ok(path)
}

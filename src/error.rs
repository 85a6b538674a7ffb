//! Error types for the kanban autopilot.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Maximum number of characters of a child's stderr kept in a [`Error::Process`].
pub const DIAGNOSTIC_EXCERPT_CHARS: usize = 1000;

/// Top-level error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A command could not be started at all.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A command exceeded its deadline and was terminated.
    #[error("{command} timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// A command exited with a non-zero status.
    #[error("{command} exited with code {}: {stderr}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Process {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A board API call failed after the client's own retries.
    #[error("board API error: {0}")]
    Api(String),

    /// Structured agent output could not be interpreted.
    #[error("invalid agent output: {0}")]
    Validation(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Working-tree lifecycle violation (e.g. branch already in use).
    #[error("worktree error: {0}")]
    Worktree(String),

    /// Failed to clean up a scratch or worktree directory.
    #[error("failed to clean up {}: {reason}", path.display())]
    Cleanup { path: PathBuf, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Builds a [`Error::Process`] with the stderr cut down to a diagnostic excerpt.
    pub fn process(command: impl Into<String>, exit_code: Option<i32>, stderr: &str) -> Self {
        Error::Process {
            command: command.into(),
            exit_code,
            stderr: truncate_chars(stderr.trim(), DIAGNOSTIC_EXCERPT_CHARS).to_string(),
        }
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn process_error_keeps_only_an_excerpt() {
        let stderr = "x".repeat(DIAGNOSTIC_EXCERPT_CHARS * 2);
        let err = Error::process("git push", Some(1), &stderr);
        match err {
            Error::Process {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr.len(), DIAGNOSTIC_EXCERPT_CHARS);
            }
            other => panic!("expected Process, got {:?}", other),
        }
    }

    #[test]
    fn process_error_display_mentions_exit_code() {
        let err = Error::process("npm test", Some(2), "boom\n");
        assert_eq!(err.to_string(), "npm test exited with code 2: boom");

        let killed = Error::process("npm test", None, "");
        assert!(killed.to_string().contains("code none"));
    }

    #[test]
    fn timeout_display_uses_seconds() {
        let err = Error::Timeout {
            command: "claude".to_string(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "claude timed out after 300s");
        assert!(err.is_timeout());
    }
}

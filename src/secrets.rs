//! Secret management for sandboxed child processes.
//!
//! Secrets are resolved from the environment at startup, forwarded to the
//! child processes that need them, and redacted from any text that leaves the
//! process (board comments, logs of command lines).

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};

/// Environment variable holding the board API key.
pub const BOARD_API_KEY: &str = "TRELLO_API_KEY";
/// Environment variable holding the board API token.
pub const BOARD_TOKEN: &str = "TRELLO_TOKEN";
/// Environment variable forwarded to the agent only.
pub const AGENT_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Environment variable forwarded to every sandboxed child (git push, gh).
pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// A reference to a secret that should be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the secret (used as env var name for children).
    pub name: String,
    /// Source of the secret value.
    pub source: SecretSource,
    /// Whether a missing value is an error.
    pub required: bool,
}

impl SecretRef {
    /// A required secret read from the env var of the same name.
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: SecretSource::EnvVar(name.to_string()),
            required: true,
        }
    }

    /// An optional secret read from the env var of the same name.
    pub fn optional(name: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }
}

/// Source from which to retrieve a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretSource {
    /// Read from an environment variable.
    EnvVar(String),
    /// Provided directly (for testing only).
    Direct(String),
}

/// Holds resolved secrets.
#[derive(Debug, Clone, Default)]
pub struct SecretsManager {
    /// Resolved secrets (name -> value).
    secrets: BTreeMap<String, String>,
}

impl SecretsManager {
    /// Creates an empty secrets manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the secrets the autopilot needs from the process environment.
    pub fn from_env() -> Result<Self, SecretError> {
        let mut manager = Self::new();
        for secret in [
            SecretRef::required(BOARD_API_KEY),
            SecretRef::required(BOARD_TOKEN),
            SecretRef::optional(AGENT_API_KEY),
            SecretRef::optional(GITHUB_TOKEN),
        ] {
            manager.load_secret(&secret)?;
        }
        Ok(manager)
    }

    /// Resolves and loads a secret from its source.
    ///
    /// Missing optional secrets are skipped silently.
    pub fn load_secret(&mut self, secret_ref: &SecretRef) -> Result<(), SecretError> {
        let value = match &secret_ref.source {
            SecretSource::EnvVar(var_name) => match env::var(var_name) {
                Ok(value) if !value.is_empty() => value,
                _ if secret_ref.required => {
                    return Err(SecretError::NotFound(format!(
                        "environment variable '{}' not set",
                        var_name
                    )))
                }
                _ => return Ok(()),
            },
            SecretSource::Direct(value) => value.clone(),
        };

        self.secrets.insert(secret_ref.name.clone(), value);
        Ok(())
    }

    /// Returns a secret value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    /// Returns the subset of secrets with the given names, for a child environment.
    pub fn environment_for(&self, names: &[&str]) -> Vec<(String, String)> {
        names
            .iter()
            .filter_map(|name| {
                self.secrets
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect()
    }

    /// Redacts all known secret values from a string.
    ///
    /// Longer values are replaced first so overlapping secrets are fully hidden.
    pub fn redact(&self, text: &str) -> String {
        let mut pairs: Vec<(&String, &String)> = self
            .secrets
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut result = text.to_string();
        for (name, value) in pairs {
            result = result.replace(value.as_str(), &format!("[REDACTED:{}]", name));
        }
        result
    }

    /// Returns the number of loaded secrets.
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }
}

/// Error type for secret operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// Secret source could not be found or read.
    NotFound(String),
}

impl std::fmt::Display for SecretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretError::NotFound(msg) => write!(f, "secret not found: {}", msg),
        }
    }
}

impl std::error::Error for SecretError {}

impl From<SecretError> for crate::error::Error {
    fn from(err: SecretError) -> Self {
        crate::error::Error::Config(err.to_string())
    }
}

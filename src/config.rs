//! Configuration for the autopilot.
//!
//! The configuration lives in a TOML file. Every field has a default so a
//! minimal file only needs the board and column identifiers. Secrets are not
//! part of this file; see [`crate::secrets`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "autopilot.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Board column identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnsConfig {
    #[serde(default)]
    pub todo: String,
    /// Source column of the analysis pipeline.
    #[serde(default)]
    pub task_revision: String,
    #[serde(default)]
    pub reviewing: String,
    /// Destination column of the analysis pipeline.
    #[serde(default)]
    pub todo_reviewed: String,
    /// Source column of the development pipeline.
    #[serde(default)]
    pub task_development: String,
    #[serde(default)]
    pub developing: String,
    /// Destination column of the development pipeline.
    #[serde(default)]
    pub task_developed: String,
    /// Cards that exhausted their attempts land here. Without it, retries are unbounded.
    #[serde(default)]
    pub failed: Option<String>,
}

impl ColumnsConfig {
    /// Returns true when all three development columns are configured.
    pub fn development_enabled(&self) -> bool {
        !self.task_development.is_empty()
            && !self.developing.is_empty()
            && !self.task_developed.is_empty()
    }

    /// The failed column, treating an empty string as unset.
    pub fn failed_column(&self) -> Option<&str> {
        self.failed.as_deref().filter(|id| !id.is_empty())
    }
}

/// Board connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default)]
    pub board_id: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub columns: ColumnsConfig,
}

fn default_api_base_url() -> String {
    "https://api.trello.com/1".to_string()
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            board_id: String::new(),
            api_base_url: default_api_base_url(),
            columns: ColumnsConfig::default(),
        }
    }
}

/// Git remote settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_base_remote")]
    pub base_remote: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_base_remote() -> String {
    "origin".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            base_remote: default_base_remote(),
        }
    }
}

/// Prompt template locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_revision_template")]
    pub revision_template: PathBuf,
    #[serde(default = "default_development_template")]
    pub development_template: PathBuf,
}

fn default_revision_template() -> PathBuf {
    PathBuf::from("prompts/revision.md")
}

fn default_development_template() -> PathBuf {
    PathBuf::from("prompts/development.md")
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            revision_template: default_revision_template(),
            development_template: default_development_template(),
        }
    }
}

/// Dev server and verification commands run inside the working tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Long-lived dev server, run through `bash -c`.
    #[serde(default)]
    pub dev_command: Option<String>,
    /// Text in the dev server's output that signals readiness.
    #[serde(default)]
    pub dev_ready_pattern: Option<String>,
    /// Verification commands, run sequentially through `bash -c`.
    #[serde(default)]
    pub test_commands: Vec<String>,
}

impl PipelineConfig {
    /// The dev server command and its readiness marker, if a dev server is configured.
    pub fn dev_server(&self) -> Option<(&str, &str)> {
        let command = self.dev_command.as_deref().filter(|c| !c.trim().is_empty())?;
        let marker = self.dev_ready_pattern.as_deref().filter(|p| !p.is_empty())?;
        Some((command, marker))
    }
}

/// Per-stage timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_analysis_secs")]
    pub analysis_secs: u64,
    #[serde(default = "default_development_secs")]
    pub development_secs: u64,
    #[serde(default = "default_dev_server_secs")]
    pub dev_server_secs: u64,
    #[serde(default = "default_test_secs")]
    pub test_secs: u64,
    /// Time between the graceful and the forced stop of the dev server.
    #[serde(default = "default_dev_server_grace_secs")]
    pub dev_server_grace_secs: u64,
}

fn default_analysis_secs() -> u64 {
    300
}

fn default_development_secs() -> u64 {
    1200
}

fn default_dev_server_secs() -> u64 {
    600
}

fn default_test_secs() -> u64 {
    600
}

fn default_dev_server_grace_secs() -> u64 {
    2
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            analysis_secs: default_analysis_secs(),
            development_secs: default_development_secs(),
            dev_server_secs: default_dev_server_secs(),
            test_secs: default_test_secs(),
            dev_server_grace_secs: default_dev_server_grace_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn analysis(&self) -> Duration {
        Duration::from_secs(self.analysis_secs)
    }

    pub fn development(&self) -> Duration {
        Duration::from_secs(self.development_secs)
    }

    pub fn dev_server(&self) -> Duration {
        Duration::from_secs(self.dev_server_secs)
    }

    pub fn test(&self) -> Duration {
        Duration::from_secs(self.test_secs)
    }

    pub fn dev_server_grace(&self) -> Duration {
        Duration::from_secs(self.dev_server_grace_secs)
    }
}

/// An MCP server entry handed to the agent through its auxiliary config file.
///
/// String fields may contain `${VAR}` placeholders resolved from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// How the external agent is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            mcp_servers: BTreeMap::new(),
        }
    }
}

/// The restricted identity child processes run as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sandbox_user")]
    pub user: String,
}

fn default_true() -> bool {
    true
}

fn default_sandbox_user() -> String {
    "claudeuser".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user: default_sandbox_user(),
        }
    }
}

impl SandboxConfig {
    /// The user to drop to, or `None` to run as the current identity.
    pub fn user(&self) -> Option<&str> {
        if self.enabled && !self.user.is_empty() {
            Some(&self.user)
        } else {
            None
        }
    }
}

/// Size ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-file ceiling for downloaded attachments.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    /// Longest comment posted to the board, in characters.
    #[serde(default = "default_comment_ceiling")]
    pub comment_ceiling: usize,
}

fn default_max_attachment_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_comment_ceiling() -> usize {
    15_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes: default_max_attachment_bytes(),
            comment_ceiling: default_comment_ceiling(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub git: GitConfig,
    /// Primary checkout the analysis agent reads and worktrees are created from.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default = "default_worktree_base_dir")]
    pub worktree_base_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_max_card_attempts")]
    pub max_card_attempts: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub url_allow_list: Vec<String>,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_bot_name() -> String {
    "Sergio".to_string()
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_worktree_base_dir() -> PathBuf {
    PathBuf::from("../worktrees")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_max_card_attempts() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            board: BoardConfig::default(),
            git: GitConfig::default(),
            repo_dir: default_repo_dir(),
            worktree_base_dir: default_worktree_base_dir(),
            data_dir: default_data_dir(),
            logs_dir: default_logs_dir(),
            max_card_attempts: default_max_card_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            url_allow_list: Vec::new(),
            prompts: PromptsConfig::default(),
            pipeline: PipelineConfig::default(),
            timeouts: TimeoutsConfig::default(),
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Parses a configuration document and expands `~/` in path fields.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.repo_dir = expand_tilde(&config.repo_dir);
        config.worktree_base_dir = expand_tilde(&config.worktree_base_dir);
        config.data_dir = expand_tilde(&config.data_dir);
        config.logs_dir = expand_tilde(&config.logs_dir);
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// The poll interval of the driver.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Namespace under which development branches are created.
    pub fn branch_namespace(&self) -> String {
        format!("{}-dev", self.bot_name.to_lowercase())
    }

    /// Author used for commits made on behalf of the bot.
    pub fn commit_author(&self) -> String {
        format!(
            "{} AI <{}-ai@noreply>",
            self.bot_name,
            self.bot_name.to_lowercase()
        )
    }

    /// File the log appender writes to.
    pub fn log_file_name(&self) -> String {
        format!("{}.log", self.bot_name.to_lowercase())
    }
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.bot_name.trim().is_empty() {
            result.add_error("bot_name cannot be empty");
        }

        if self.board.board_id.is_empty() {
            result.add_error("board.board_id is required");
        }

        let columns = &self.board.columns;
        for (key, value) in [
            ("todo", &columns.todo),
            ("task_revision", &columns.task_revision),
            ("reviewing", &columns.reviewing),
            ("todo_reviewed", &columns.todo_reviewed),
        ] {
            if value.is_empty() {
                result.add_error(format!("board.columns.{} is required", key));
            }
        }

        if !columns.development_enabled() {
            result.add_warning(
                "development columns are incomplete, the development pipeline is disabled",
            );
        }

        if columns.failed_column().is_none() {
            result.add_warning("no failed column configured, failing cards are retried forever");
        }

        if !self.repo_dir.exists() {
            result.add_error(format!(
                "repo_dir does not exist: {}",
                self.repo_dir.display()
            ));
        }

        for (key, path) in [
            ("revision_template", &self.prompts.revision_template),
            ("development_template", &self.prompts.development_template),
        ] {
            if !path.exists() {
                result.add_error(format!(
                    "prompts.{} not found: {}",
                    key,
                    path.display()
                ));
            }
        }

        let has_dev_command = self
            .pipeline
            .dev_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        let has_ready_pattern = self
            .pipeline
            .dev_ready_pattern
            .as_deref()
            .is_some_and(|p| !p.is_empty());
        if has_dev_command && !has_ready_pattern {
            result.add_error("pipeline.dev_ready_pattern is required when pipeline.dev_command is set");
        }

        let t = &self.timeouts;
        if [
            t.analysis_secs,
            t.development_secs,
            t.dev_server_secs,
            t.test_secs,
        ]
        .contains(&0)
        {
            result.add_error("all timeout values must be positive");
        }

        if self.max_card_attempts == 0 {
            result.add_error("max_card_attempts must be at least 1");
        }

        if self.poll_interval_secs == 0 {
            result.add_error("poll_interval_secs must be positive");
        }

        if self.sandbox.user().is_none() {
            result.add_warning(
                "sandbox is disabled, the agent runs with the orchestrator's own identity",
            );
        }

        for name in crate::agent::collect_placeholders(&self.agent.mcp_servers) {
            if std::env::var(&name).is_err() {
                result.add_warning(format!(
                    "MCP config references ${{{}}} but it is not set",
                    name
                ));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> Config {
        let prompts = dir.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("revision.md"), "{{cardContent}}").unwrap();
        std::fs::write(prompts.join("development.md"), "{{cardContent}}").unwrap();

        let mut config = Config::default();
        config.repo_dir = dir.path().to_path_buf();
        config.prompts.revision_template = prompts.join("revision.md");
        config.prompts.development_template = prompts.join("development.md");
        config.board.board_id = "board".to_string();
        config.board.columns = ColumnsConfig {
            todo: "todo".to_string(),
            task_revision: "rev".to_string(),
            reviewing: "reviewing".to_string(),
            todo_reviewed: "reviewed".to_string(),
            task_development: "dev".to_string(),
            developing: "developing".to_string(),
            task_developed: "developed".to_string(),
            failed: Some("failed".to_string()),
        };
        config
    }

    #[test]
    fn config_has_sensible_defaults() {
        let config = Config::from_toml("").expect("empty config parses");

        assert_eq!(config.bot_name, "Sergio");
        assert_eq!(config.git.base_branch, "main");
        assert_eq!(config.git.base_remote, "origin");
        assert_eq!(config.max_card_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.timeouts.analysis(), Duration::from_secs(300));
        assert_eq!(config.timeouts.development(), Duration::from_secs(1200));
        assert_eq!(config.limits.comment_ceiling, 15_000);
        assert_eq!(config.sandbox.user(), Some("claudeuser"));
        assert!(config.pipeline.dev_server().is_none());
        assert!(config.board.columns.failed_column().is_none());
    }

    #[test]
    fn config_parses_nested_tables() {
        let toml = r#"
bot_name = "Ada"
max_card_attempts = 5

[board]
board_id = "b1"

[board.columns]
task_revision = "l1"
failed = "l9"

[pipeline]
dev_command = "npm run dev"
dev_ready_pattern = "ready on"
test_commands = ["npm test", "npm run lint"]

[timeouts]
test_secs = 30

[agent.mcp_servers.docs]
command = "npx"
args = ["-y", "docs-mcp"]
env = { TOKEN = "${DOCS_TOKEN}" }
"#;
        let config = Config::from_toml(toml).expect("config parses");

        assert_eq!(config.bot_name, "Ada");
        assert_eq!(config.branch_namespace(), "ada-dev");
        assert_eq!(config.commit_author(), "Ada AI <ada-ai@noreply>");
        assert_eq!(config.max_card_attempts, 5);
        assert_eq!(config.board.columns.failed_column(), Some("l9"));
        assert_eq!(
            config.pipeline.dev_server(),
            Some(("npm run dev", "ready on"))
        );
        assert_eq!(config.pipeline.test_commands.len(), 2);
        assert_eq!(config.timeouts.test(), Duration::from_secs(30));
        assert_eq!(config.timeouts.analysis_secs, 300);
        let docs = &config.agent.mcp_servers["docs"];
        assert_eq!(docs.command.as_deref(), Some("npx"));
        assert_eq!(docs.env["TOKEN"], "${DOCS_TOKEN}");
    }

    #[test]
    fn empty_failed_column_counts_as_unset() {
        let config = Config::from_toml("[board.columns]\nfailed = \"\"\n").unwrap();
        assert!(config.board.columns.failed_column().is_none());
    }

    #[test]
    fn expand_tilde_uses_home_directory() {
        let expanded = expand_tilde(Path::new("~/repos/app"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("repos/app"));
        }
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn valid_config_passes_validation() {
        let dir = TempDir::new().unwrap();
        let config = valid_config(&dir);
        let result = config.validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn validation_rejects_dev_command_without_ready_pattern() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.pipeline.dev_command = Some("npm run dev".to_string());

        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("dev_ready_pattern")));
    }

    #[test]
    fn validation_rejects_missing_board_and_columns() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.board.board_id.clear();
        config.board.columns.reviewing.clear();

        let errors = config.validate().errors;
        assert!(errors.iter().any(|e| e.contains("board_id")));
        assert!(errors.iter().any(|e| e.contains("columns.reviewing")));
    }

    #[test]
    fn validation_rejects_zero_timeouts_and_attempts() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.timeouts.test_secs = 0;
        config.max_card_attempts = 0;

        let errors = config.validate().errors;
        assert!(errors.iter().any(|e| e.contains("timeout")));
        assert!(errors.iter().any(|e| e.contains("max_card_attempts")));
    }

    #[test]
    fn validation_warns_when_development_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.board.columns.developing.clear();

        let result = config.validate();
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("development pipeline is disabled")));
    }

    #[test]
    fn into_result_joins_errors() {
        let mut result = ValidationResult::default();
        result.add_error("a");
        result.add_error("b");
        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: a; b");
    }
}

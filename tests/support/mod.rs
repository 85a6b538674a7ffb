//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use kanban_autopilot::board::{Attachment, BoardApi, Card, CardUpdate, Column, Comment};
use kanban_autopilot::config::{ColumnsConfig, Config};
use kanban_autopilot::devserver::DevServer;
use kanban_autopilot::error::{Error, Result};
use kanban_autopilot::pipeline::PipelineDeps;
use kanban_autopilot::process::{
    CommandOutput, CommandSpec, ExecIdentity, ProcessRunner, SandboxedRunner,
};
use kanban_autopilot::secrets::{SecretRef, SecretSource, SecretsManager};

pub const TODO: &str = "col-todo";
pub const TASK_REVISION: &str = "col-task-revision";
pub const REVIEWING: &str = "col-reviewing";
pub const TODO_REVIEWED: &str = "col-todo-reviewed";
pub const TASK_DEVELOPMENT: &str = "col-task-development";
pub const DEVELOPING: &str = "col-developing";
pub const TASK_DEVELOPED: &str = "col-task-developed";
pub const FAILED: &str = "col-failed";

/// One recorded board call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardCall {
    Move { card: String, column: String },
    Comment { card: String, text: String },
    Update { card: String, update: CardUpdate },
    AttachUrl { card: String, url: String, name: String },
}

#[derive(Default)]
struct BoardState {
    /// column id -> cards, in list order
    columns: HashMap<String, Vec<Card>>,
    comments: HashMap<String, Vec<Comment>>,
    attachments: HashMap<String, Vec<Attachment>>,
    downloads: HashMap<String, Vec<u8>>,
    calls: Vec<BoardCall>,
    failing: Vec<&'static str>,
}

/// In-memory board. Moving a card relocates it between columns.
#[derive(Default)]
pub struct FakeBoard {
    state: Mutex<BoardState>,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_card(&self, column: &str, card: Card) {
        let mut state = self.state.lock().unwrap();
        state.columns.entry(column.to_string()).or_default().push(card);
    }

    pub fn add_comment_fixture(&self, card_id: &str, author: &str, text: &str) {
        let mut state = self.state.lock().unwrap();
        let comments = state.comments.entry(card_id.to_string()).or_default();
        comments.push(Comment {
            id: format!("cm{}", comments.len() + 1),
            date: "2026-01-01T00:00:00.000Z".to_string(),
            author: author.to_string(),
            text: text.to_string(),
        });
    }

    pub fn add_attachment(&self, card_id: &str, attachment: Attachment, content: Option<&[u8]>) {
        let mut state = self.state.lock().unwrap();
        if let Some(content) = content {
            state
                .downloads
                .insert(attachment.url.clone(), content.to_vec());
        }
        state
            .attachments
            .entry(card_id.to_string())
            .or_default()
            .push(attachment);
    }

    /// Makes every call of the named method fail, e.g. `"add_comment"`.
    pub fn fail_on(&self, method: &'static str) {
        self.state.lock().unwrap().failing.push(method);
    }

    pub fn calls(&self) -> Vec<BoardCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn comments_posted(&self, card_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BoardCall::Comment { card, text } if card == card_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn moves(&self, card_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BoardCall::Move { card, column } if card == card_id => Some(column),
                _ => None,
            })
            .collect()
    }

    /// The column currently holding the card.
    pub fn column_of(&self, card_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .columns
            .iter()
            .find(|(_, cards)| cards.iter().any(|c| c.id == card_id))
            .map(|(column, _)| column.clone())
    }

    pub fn card(&self, card_id: &str) -> Option<Card> {
        let state = self.state.lock().unwrap();
        state
            .columns
            .values()
            .flatten()
            .find(|c| c.id == card_id)
            .cloned()
    }

    fn check(&self, method: &'static str) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(&method) {
            return Err(Error::Api(format!("{} failed: HTTP 500", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl BoardApi for FakeBoard {
    async fn list_columns(&self, _board_id: &str) -> Result<Vec<Column>> {
        self.check("list_columns")?;
        let state = self.state.lock().unwrap();
        let mut columns: Vec<Column> = state
            .columns
            .keys()
            .map(|id| Column {
                id: id.clone(),
                name: id.trim_start_matches("col-").replace('-', " "),
            })
            .collect();
        columns.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(columns)
    }

    async fn list_cards(&self, column_id: &str) -> Result<Vec<Card>> {
        self.check("list_cards")?;
        let state = self.state.lock().unwrap();
        Ok(state.columns.get(column_id).cloned().unwrap_or_default())
    }

    async fn card_comments(&self, card_id: &str) -> Result<Vec<Comment>> {
        self.check("card_comments")?;
        let state = self.state.lock().unwrap();
        Ok(state.comments.get(card_id).cloned().unwrap_or_default())
    }

    async fn card_attachments(&self, card_id: &str) -> Result<Vec<Attachment>> {
        self.check("card_attachments")?;
        let state = self.state.lock().unwrap();
        Ok(state.attachments.get(card_id).cloned().unwrap_or_default())
    }

    async fn move_card(&self, card_id: &str, column_id: &str) -> Result<()> {
        self.check("move_card")?;
        let mut state = self.state.lock().unwrap();
        let mut moved = None;
        for cards in state.columns.values_mut() {
            if let Some(pos) = cards.iter().position(|c| c.id == card_id) {
                moved = Some(cards.remove(pos));
            }
        }
        let card = moved.ok_or_else(|| Error::Api(format!("no such card: {}", card_id)))?;
        state
            .columns
            .entry(column_id.to_string())
            .or_default()
            .push(card);
        state.calls.push(BoardCall::Move {
            card: card_id.to_string(),
            column: column_id.to_string(),
        });
        Ok(())
    }

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()> {
        self.check("add_comment")?;
        self.state.lock().unwrap().calls.push(BoardCall::Comment {
            card: card_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn update_card(&self, card_id: &str, update: &CardUpdate) -> Result<()> {
        self.check("update_card")?;
        let mut state = self.state.lock().unwrap();
        for card in state.columns.values_mut().flatten() {
            if card.id == card_id {
                if let Some(title) = &update.title {
                    card.title = title.clone();
                }
                if let Some(description) = &update.description {
                    card.description = description.clone();
                }
            }
        }
        state.calls.push(BoardCall::Update {
            card: card_id.to_string(),
            update: update.clone(),
        });
        Ok(())
    }

    async fn attach_url(&self, card_id: &str, url: &str, name: &str) -> Result<()> {
        self.check("attach_url")?;
        self.state.lock().unwrap().calls.push(BoardCall::AttachUrl {
            card: card_id.to_string(),
            url: url.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn download_attachment(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>> {
        self.check("download_attachment")?;
        let state = self.state.lock().unwrap();
        let data = state
            .downloads
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Api(format!("download failed: {}", url)))?;
        if data.len() as u64 > max_bytes {
            return Err(Error::Api(format!(
                "attachment exceeds {} bytes",
                max_bytes
            )));
        }
        Ok(data)
    }
}

type Handler = Arc<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// Runs real commands as the current user, except those whose label starts
/// with a scripted prefix. Every spec is recorded.
pub struct ScriptedRunner {
    real: SandboxedRunner,
    handlers: Mutex<Vec<(String, Handler)>>,
    specs: Mutex<Vec<CommandSpec>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            real: SandboxedRunner::new(ExecIdentity::current()),
            handlers: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Answers commands whose label starts with `prefix` with `handler`.
    pub fn script<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .push((prefix.to_string(), Arc::new(handler)));
    }

    /// Answers commands starting with `prefix` with fixed stdout.
    pub fn script_stdout(&self, prefix: &str, stdout: &str) {
        let stdout = stdout.to_string();
        self.script(prefix, move |_| {
            Ok(CommandOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
            })
        });
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.specs().iter().map(CommandSpec::label).collect()
    }

    /// Stdin of the first command whose label starts with `prefix`.
    pub fn stdin_of(&self, prefix: &str) -> Option<String> {
        self.specs()
            .into_iter()
            .find(|s| s.label().starts_with(prefix))
            .and_then(|s| s.stdin)
    }

    fn handler_for(&self, label: &str) -> Option<Handler> {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| label.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.specs.lock().unwrap().push(spec.clone());
        match self.handler_for(&spec.label()) {
            Some(handler) => handler(&spec),
            None => self.real.run(spec).await,
        }
    }

    async fn spawn_service(&self, spec: CommandSpec) -> Result<DevServer> {
        self.specs.lock().unwrap().push(spec.clone());
        self.real.spawn_service(spec).await
    }
}

pub fn card(id: &str, title: &str) -> Card {
    Card {
        id: id.to_string(),
        title: title.to_string(),
        description: String::new(),
        url: format!("https://trello.com/c/{}", id),
    }
}

/// A unique card id, so concurrent tests never share scratch directories.
pub fn unique_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A scratch workspace: checkout with a bare `origin`, prompt templates and
/// data and log directories.
pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let work = root.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        git(&work, &["init"]);
        git(&work, &["config", "user.email", "test@test.com"]);
        git(&work, &["config", "user.name", "Test User"]);
        git(&work, &["config", "commit.gpgsign", "false"]);
        std::fs::write(work.join("README.md"), "# Test Repo").unwrap();
        git(&work, &["add", "."]);
        git(&work, &["commit", "-m", "Initial commit"]);
        git(&work, &["branch", "-M", "main"]);
        git(root.path(), &["clone", "--bare", "work", "remote.git"]);
        let remote = root.path().join("remote.git");
        git(&work, &["remote", "add", "origin", &remote.display().to_string()]);

        let prompts = root.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(
            prompts.join("revision.md"),
            "You are {{botName}}. Plan this card:\n\n{{cardContent}}",
        )
        .unwrap();
        std::fs::write(
            prompts.join("development.md"),
            "You are {{botName}}. Implement this card on top of {{baseRemote}}/{{baseBranch}}:\n\n{{cardContent}}",
        )
        .unwrap();

        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.path().join("work")
    }

    pub fn worktree_base(&self) -> PathBuf {
        self.path().join("worktrees")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path().join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path().join("logs")
    }

    /// Branches present in the bare remote.
    pub fn remote_branches(&self) -> String {
        git(&self.path().join("remote.git"), &["branch", "--list"])
    }

    /// Branches present in the checkout.
    pub fn local_branches(&self) -> String {
        git(&self.repo_dir(), &["branch", "--list"])
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.bot_name = "Sergio".to_string();
        config.repo_dir = self.repo_dir();
        config.worktree_base_dir = self.worktree_base();
        config.data_dir = self.data_dir();
        config.logs_dir = self.logs_dir();
        config.prompts.revision_template = self.path().join("prompts/revision.md");
        config.prompts.development_template = self.path().join("prompts/development.md");
        config.board.board_id = "board-1".to_string();
        config.board.columns = ColumnsConfig {
            todo: TODO.to_string(),
            task_revision: TASK_REVISION.to_string(),
            reviewing: REVIEWING.to_string(),
            todo_reviewed: TODO_REVIEWED.to_string(),
            task_development: TASK_DEVELOPMENT.to_string(),
            developing: DEVELOPING.to_string(),
            task_developed: TASK_DEVELOPED.to_string(),
            failed: Some(FAILED.to_string()),
        };
        config.sandbox.enabled = false;
        config.agent.args = vec!["-p".to_string()];
        config
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Secrets with a known board token, for redaction checks.
pub fn secrets() -> SecretsManager {
    let mut secrets = SecretsManager::new();
    for (name, value) in [
        ("TRELLO_API_KEY", "fake-board-key-123"),
        ("TRELLO_TOKEN", "fake-board-token-456"),
        ("ANTHROPIC_API_KEY", "fake-agent-key-789"),
    ] {
        secrets
            .load_secret(&SecretRef {
                name: name.to_string(),
                source: SecretSource::Direct(value.to_string()),
                required: true,
            })
            .unwrap();
    }
    secrets
}

pub fn deps(config: Config, board: Arc<FakeBoard>, runner: Arc<ScriptedRunner>) -> PipelineDeps {
    PipelineDeps::new(Arc::new(config), board, runner, Arc::new(secrets()))
}

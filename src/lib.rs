//! Kanban Autopilot - board-driven pipelines for sandboxed coding agents
//!
//! This library polls a Trello board, hands cards to an external coding agent
//! running as a restricted user, and moves the cards along as the agent
//! analyses them or implements them in isolated git worktrees.

pub mod agent;
pub mod backoff;
pub mod board;
pub mod card_update;
pub mod config;
pub mod context;
pub mod devserver;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod pr;
pub mod process;
pub mod secrets;
pub mod status;
pub mod worktree;

pub use agent::{AgentInvoker, EphemeralConfig};
pub use backoff::ExponentialBackoff;
pub use board::{Attachment, BoardApi, Card, CardUpdate, Column, Comment, TrelloClient};
pub use card_update::{parse_card_update, ParsedOutput};
pub use config::{Config, Validate, ValidationResult, DEFAULT_CONFIG_FILE};
pub use context::{CardContext, DocumentHeader, ScratchDir};
pub use devserver::DevServer;
pub use driver::{shutdown_signal, Driver};
pub use error::{Error, Result};
pub use ledger::{CardLedger, LedgerFiles};
pub use pipeline::{AnalysisPipeline, DevelopmentPipeline, PipelineDeps, RunOutcome};
pub use policy::{escalate, Escalation};
pub use pr::{PRManager, PullRequest};
pub use process::{CommandOutput, CommandSpec, ExecIdentity, ProcessRunner, SandboxedRunner};
pub use secrets::{SecretError, SecretRef, SecretSource, SecretsManager};
pub use status::StatusReport;
pub use worktree::{BranchLocks, Worktree, WorktreeManager, WorktreeState};

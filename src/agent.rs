//! Agent invocation.
//!
//! Renders the prompt for a pipeline from its template, writes the optional
//! MCP configuration to an ephemeral file owned by the restricted user, runs
//! the agent CLI through the [`ProcessRunner`] and removes the file again on
//! every exit path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use crate::config::{AgentConfig, Config, McpServerConfig};
use crate::error::Result;
use crate::process::{CommandSpec, ProcessRunner};

static TEMPLATE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").unwrap());

/// Deadline for writing and removing the ephemeral config file.
const EPHEMERAL_FILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Replaces `{{name}}` placeholders. Unknown names are left verbatim.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Access policy listing the only URLs the agent may fetch.
///
/// An empty allow-list yields an empty string.
pub fn build_url_policy(urls: &[String]) -> String {
    if urls.is_empty() {
        return String::new();
    }
    let list = urls
        .iter()
        .map(|url| format!("- {}", url))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "URL ACCESS POLICY: You are ONLY permitted to access these URLs:\n{}\nDo NOT fetch, read, or access any URL not on this list.",
        list
    )
}

/// Replaces `${VAR}` with `lookup(VAR)`, or the empty string when unset.
pub fn resolve_placeholders<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn resolve_server<F>(server: &McpServerConfig, lookup: &F) -> McpServerConfig
where
    F: Fn(&str) -> Option<String>,
{
    let resolve = |s: &String| resolve_placeholders(s, lookup);
    McpServerConfig {
        command: server.command.as_ref().map(resolve),
        args: server.args.iter().map(resolve).collect(),
        env: server
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolve(v)))
            .collect(),
        transport: server.transport.as_ref().map(resolve),
        url: server.url.as_ref().map(resolve),
    }
}

/// Builds the `{"mcpServers": {...}}` document, or `None` with no servers.
pub fn build_mcp_payload<F>(
    servers: &BTreeMap<String, McpServerConfig>,
    lookup: F,
) -> Result<Option<Value>>
where
    F: Fn(&str) -> Option<String>,
{
    if servers.is_empty() {
        return Ok(None);
    }
    let resolved: BTreeMap<&str, McpServerConfig> = servers
        .iter()
        .map(|(name, server)| (name.as_str(), resolve_server(server, &lookup)))
        .collect();
    Ok(Some(json!({ "mcpServers": serde_json::to_value(resolved)? })))
}

/// Names of all `${VAR}` placeholders referenced by the servers, sorted and unique.
pub fn collect_placeholders(servers: &BTreeMap<String, McpServerConfig>) -> Vec<String> {
    let mut names = std::collections::BTreeSet::new();
    for server in servers.values() {
        let fields = server
            .command
            .iter()
            .chain(server.args.iter())
            .chain(server.env.values())
            .chain(server.transport.iter())
            .chain(server.url.iter());
        for field in fields {
            for caps in ENV_PLACEHOLDER.captures_iter(field) {
                names.insert(caps[1].to_string());
            }
        }
    }
    names.into_iter().collect()
}

/// A config file that exists only for the duration of one agent run.
///
/// The file is created by the restricted identity with `umask 077`, so only
/// that user can read it.
#[derive(Debug)]
pub struct EphemeralConfig {
    path: PathBuf,
}

impl EphemeralConfig {
    /// Writes `contents` to a uniquely named file in `dir`.
    pub async fn write<R: ProcessRunner + ?Sized>(
        runner: &R,
        dir: &Path,
        prefix: &str,
        contents: &str,
    ) -> Result<Self> {
        let path = dir.join(format!("{}-mcp-{}.json", prefix, uuid::Uuid::new_v4()));
        let script = r#"umask 077 && cat > "$1""#;
        let spec = CommandSpec::new(
            "sh",
            [
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                path.display().to_string(),
            ],
            dir,
            EPHEMERAL_FILE_TIMEOUT,
        )
        .with_stdin(contents);
        runner.run(spec).await?;
        tracing::debug!(path = ?path, "wrote ephemeral agent config");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file. Failures are logged and otherwise ignored.
    pub async fn remove<R: ProcessRunner + ?Sized>(self, runner: &R) {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let spec = CommandSpec::new(
            "rm",
            ["-f".to_string(), self.path.display().to_string()],
            dir,
            EPHEMERAL_FILE_TIMEOUT,
        );
        if let Err(e) = runner.run(spec).await {
            tracing::warn!(path = ?self.path, error = %e, "failed to remove ephemeral agent config");
        }
    }
}

/// Invokes the agent CLI for both pipelines.
pub struct AgentInvoker<R: ProcessRunner + ?Sized> {
    runner: Arc<R>,
    agent: AgentConfig,
    bot_name: String,
    base_branch: String,
    base_remote: String,
    url_allow_list: Vec<String>,
    env: Vec<(String, String)>,
    scratch_dir: PathBuf,
}

impl<R: ProcessRunner + ?Sized> AgentInvoker<R> {
    /// Creates an invoker from the configuration.
    ///
    /// `env` is forwarded to the agent only (its API key).
    pub fn new(runner: Arc<R>, config: &Config, env: Vec<(String, String)>) -> Self {
        Self {
            runner,
            agent: config.agent.clone(),
            bot_name: config.bot_name.clone(),
            base_branch: config.git.base_branch.clone(),
            base_remote: config.git.base_remote.clone(),
            url_allow_list: config.url_allow_list.clone(),
            env,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory the ephemeral MCP config is written to.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Renders a template for the given card document.
    ///
    /// When a URL policy exists but the template has no `{{urlPolicy}}`
    /// placeholder, the policy is prepended.
    pub fn build_prompt(&self, template: &str, card_content: &str) -> String {
        let url_policy = build_url_policy(&self.url_allow_list);
        let vars = BTreeMap::from([
            ("botName", self.bot_name.clone()),
            ("cardContent", card_content.to_string()),
            ("urlPolicy", url_policy.clone()),
            ("baseBranch", self.base_branch.clone()),
            ("baseRemote", self.base_remote.clone()),
        ]);
        let rendered = render_template(template, &vars);
        if url_policy.is_empty() || template.contains("{{urlPolicy}}") {
            rendered
        } else {
            format!("{}\n\n{}", url_policy, rendered)
        }
    }

    /// Runs the agent on the rendered template and returns its trimmed output.
    pub async fn invoke(
        &self,
        template_path: &Path,
        card_content: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<String> {
        let template = tokio::fs::read_to_string(template_path).await?;
        let prompt = self.build_prompt(&template, card_content);

        let payload = build_mcp_payload(&self.agent.mcp_servers, |name| std::env::var(name).ok())?;
        let ephemeral = match payload {
            Some(payload) => Some(
                EphemeralConfig::write(
                    self.runner.as_ref(),
                    &self.scratch_dir,
                    &self.bot_name.to_lowercase(),
                    &serde_json::to_string_pretty(&payload)?,
                )
                .await?,
            ),
            None => None,
        };

        let mut args = self.agent.args.clone();
        if let Some(file) = &ephemeral {
            args.push("--mcp-config".to_string());
            args.push(file.path().display().to_string());
        }

        let spec = CommandSpec::new(self.agent.command.clone(), args, cwd, timeout)
            .with_stdin(prompt)
            .with_env(self.env.clone());

        tracing::info!(
            cwd = ?cwd,
            timeout_secs = timeout.as_secs(),
            mcp = ephemeral.is_some(),
            "invoking agent"
        );
        let result = self.runner.run(spec).await;

        if let Some(file) = ephemeral {
            file.remove(self.runner.as_ref()).await;
        }

        let output = result?;
        Ok(output.stdout.trim().to_string())
    }
}

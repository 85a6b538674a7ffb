//! Sandboxed process runner.
//!
//! Every external command (the agent, git, gh, verification commands and the
//! dev server) goes through a [`ProcessRunner`]. The production runner,
//! [`SandboxedRunner`], drops to a restricted user with `sudo -u <user>`,
//! starts the child in its own process group so a timeout can signal the whole
//! tree, and captures stdout and stderr separately.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::devserver::DevServer;
use crate::error::{truncate_chars, Error, Result};

/// Longest command label used in errors and logs.
const LABEL_CHARS: usize = 100;

/// A single command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Argument vector, without the program.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Text forwarded to the child's stdin, which is closed afterwards.
    pub stdin: Option<String>,
    /// Extra environment for the child (usually secrets).
    pub env: Vec<(String, String)>,
    /// Deadline for the whole invocation.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates a spec with no stdin and no extra environment.
    pub fn new<I, S>(program: impl Into<String>, args: I, cwd: impl Into<PathBuf>, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            stdin: None,
            env: Vec::new(),
            timeout,
        }
    }

    /// Shorthand for a git command.
    pub fn git<I, S>(args: I, cwd: impl Into<PathBuf>, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("git", args, cwd, timeout)
    }

    /// Shorthand for an operator-supplied shell snippet, run through `bash -c`.
    pub fn shell(script: &str, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new("bash", ["-c", script], cwd, timeout)
    }

    /// Sets the text piped into stdin.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Adds environment variables.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Short human-readable form of the command line (no environment).
    pub fn label(&self) -> String {
        let full = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        truncate_chars(&full, LABEL_CHARS).to_string()
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands on behalf of the pipelines.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the command to completion.
    ///
    /// Resolves with the captured output on exit code 0; fails with
    /// [`Error::Process`] on a non-zero exit, [`Error::Timeout`] when the
    /// deadline elapses (the process group is signalled) and
    /// [`Error::Spawn`] when the command cannot be started.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;

    /// Starts a long-lived command (the dev server) and returns its handle.
    ///
    /// `spec.timeout` is not applied here; the caller bounds readiness.
    async fn spawn_service(&self, spec: CommandSpec) -> Result<DevServer>;
}

/// The identity child processes run under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecIdentity {
    user: Option<String>,
}

impl ExecIdentity {
    /// Run children as the given unprivileged user.
    pub fn restricted(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }

    /// Run children as the current user.
    pub fn current() -> Self {
        Self { user: None }
    }

    /// The restricted user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Builds the program and argument vector that run `spec` under this identity.
    ///
    /// With a restricted user, the environment is passed through `env` after
    /// `sudo` so it survives sudo's environment reset.
    pub fn argv(&self, spec: &CommandSpec) -> (String, Vec<String>) {
        match &self.user {
            Some(user) => {
                let mut args = vec![
                    "-u".to_string(),
                    user.clone(),
                    "--".to_string(),
                    "env".to_string(),
                ];
                args.extend(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)));
                args.push(spec.program.clone());
                args.extend(spec.args.iter().cloned());
                ("sudo".to_string(), args)
            }
            None => (spec.program.clone(), spec.args.clone()),
        }
    }

    /// Builds a tokio command for `spec`: own process group, killed on drop.
    pub fn command(&self, spec: &CommandSpec) -> Command {
        let (program, args) = self.argv(spec);
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&spec.cwd).kill_on_drop(true);
        if self.user.is_none() {
            cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        cmd.process_group(0);
        cmd
    }
}

/// Sends `signal` to the process group led by `pid`.
///
/// Errors (typically "no such process" after the group already exited) are
/// logged at debug level.
pub fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        tracing::debug!(pid, ?signal, error = %e, "failed to signal process group");
    }
}

/// Time a timed-out command gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

async fn read_pipe<P: AsyncRead + Unpin>(pipe: Option<P>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "failed to read child output");
        }
    }
    buf
}

/// SIGTERM to the group while the child is still owned, SIGKILL after
/// [`TERM_GRACE`], then reap.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    signal_group(pid, Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
        // Group members that outlived the leader.
        signal_group(pid, Signal::SIGKILL);
        return;
    }
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.kill().await {
        tracing::debug!(pid, error = %e, "failed to kill timed out command");
    }
}

/// Production runner: restricted identity, shared secret environment.
#[derive(Debug, Clone, Default)]
pub struct SandboxedRunner {
    identity: ExecIdentity,
    base_env: Vec<(String, String)>,
}

impl SandboxedRunner {
    /// Creates a runner that executes everything as `identity`.
    pub fn new(identity: ExecIdentity) -> Self {
        Self {
            identity,
            base_env: Vec::new(),
        }
    }

    /// Environment added to every command (e.g. `GITHUB_TOKEN` for push and gh).
    pub fn with_base_env(mut self, env: Vec<(String, String)>) -> Self {
        self.base_env = env;
        self
    }

    /// The identity commands run under.
    pub fn identity(&self) -> &ExecIdentity {
        &self.identity
    }

    fn prepare(&self, mut spec: CommandSpec) -> CommandSpec {
        let mut env = self.base_env.clone();
        env.append(&mut spec.env);
        spec.env = env;
        spec
    }
}

#[async_trait]
impl ProcessRunner for SandboxedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let spec = self.prepare(spec);
        let label = spec.label();

        let mut cmd = self.identity.command(&spec);
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        tracing::debug!(command = %label, cwd = ?spec.cwd, "running command");

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: label.clone(),
            source,
        })?;
        let pid = child.id();

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            });
        }
        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(
                    command = %label,
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, terminating process group"
                );
                terminate(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Timeout {
                    command: label,
                    timeout: spec.timeout,
                });
            }
        };
        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(Error::process(label, status.code(), &stderr))
        }
    }

    async fn spawn_service(&self, spec: CommandSpec) -> Result<DevServer> {
        let spec = self.prepare(spec);
        let label = spec.label();

        let mut cmd = self.identity.command(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: label.clone(),
            source,
        })?;

        tracing::info!(command = %label, pid = ?child.id(), "started long-lived process");
        Ok(DevServer::new(child, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn runner() -> SandboxedRunner {
        SandboxedRunner::new(ExecIdentity::current())
    }

    fn spec(program: &str, args: &[&str], dir: &TempDir) -> CommandSpec {
        CommandSpec::new(
            program,
            args.iter().copied(),
            dir.path(),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn restricted_identity_wraps_in_sudo_and_env() {
        let identity = ExecIdentity::restricted("claudeuser");
        let spec = CommandSpec::new("claude", ["-p"], "/tmp", Duration::from_secs(1))
            .with_env(vec![("TOKEN".to_string(), "t".to_string())]);

        let (program, args) = identity.argv(&spec);
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            vec!["-u", "claudeuser", "--", "env", "TOKEN=t", "claude", "-p"]
        );
    }

    #[test]
    fn current_identity_runs_program_directly() {
        let spec = CommandSpec::git(["status"], "/tmp", Duration::from_secs(1));
        let (program, args) = ExecIdentity::current().argv(&spec);
        assert_eq!(program, "git");
        assert_eq!(args, vec!["status"]);
    }

    #[test]
    fn label_is_bounded() {
        let long = "x".repeat(500);
        let spec = CommandSpec::new("echo", [long.as_str()], "/tmp", Duration::from_secs(1));
        assert_eq!(spec.label().chars().count(), LABEL_CHARS);
    }

    #[tokio::test]
    async fn run_captures_stdout_and_stderr_separately() {
        let dir = TempDir::new().unwrap();
        let output = runner()
            .run(spec("sh", &["-c", "echo out; echo err >&2"], &dir))
            .await
            .expect("command should succeed");

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_forwards_stdin() {
        let dir = TempDir::new().unwrap();
        let output = runner()
            .run(spec("cat", &[], &dir).with_stdin("hello prompt"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello prompt");
    }

    #[tokio::test]
    async fn run_uses_working_directory_and_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let output = runner()
            .with_base_env(vec![("BASE_VAR".to_string(), "base".to_string())])
            .run(
                spec("sh", &["-c", "cat marker.txt; echo \" $BASE_VAR $EXTRA_VAR\""], &dir)
                    .with_env(vec![("EXTRA_VAR".to_string(), "extra".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "here base extra\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_process_error() {
        let dir = TempDir::new().unwrap();
        let err = runner()
            .run(spec("sh", &["-c", "echo broken >&2; exit 3"], &dir))
            .await
            .unwrap_err();

        match err {
            Error::Process {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected Process error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let err = runner()
            .run(spec("definitely-not-a-real-binary-xyz", &[], &dir))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn deadline_terminates_the_command() {
        let dir = TempDir::new().unwrap();
        let mut slow = spec("sleep", &["30"], &dir);
        slow.timeout = Duration::from_millis(200);

        let start = Instant::now();
        let err = runner().run(slow).await.unwrap_err();

        assert!(err.is_timeout(), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_sends_sigterm_before_killing() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("terminated");
        let script = format!(
            "trap 'echo term > {}; exit 0' TERM; sleep 30 & wait",
            marker.display()
        );
        let mut slow = spec("bash", &["-c", &script], &dir);
        slow.timeout = Duration::from_millis(300);

        let start = Instant::now();
        let err = runner().run(slow).await.unwrap_err();

        assert!(err.is_timeout(), "got {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "term");
    }
}

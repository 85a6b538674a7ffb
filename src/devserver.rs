//! Long-lived dev server used while running verification commands.
//!
//! The server is started through [`crate::process::ProcessRunner::spawn_service`].
//! Its combined stdout and stderr are scanned for a readiness marker; once
//! ready the output keeps being drained so the server never blocks on a full
//! pipe. Stopping sends SIGTERM to the process group, waits a grace window and
//! then forces SIGKILL. Dropping an unstopped server kills it outright.

use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::process::signal_group;

/// Most recent output kept for error messages.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Handle to a running dev server.
pub struct DevServer {
    child: Child,
    label: String,
    output_rx: mpsc::UnboundedReceiver<String>,
    stopped: bool,
}

impl DevServer {
    /// Wraps a spawned child whose stdout and stderr are piped.
    pub fn new(mut child: Child, label: String) -> Self {
        let (tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, tx));
        }
        Self {
            child,
            label,
            output_rx,
            stopped: false,
        }
    }

    /// The command this server was started with.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits until the combined output contains `marker`.
    ///
    /// Fails with [`Error::Timeout`] if the marker does not show up within
    /// `timeout`, or with [`Error::Process`] if the server exits first.
    pub async fn wait_ready(&mut self, marker: &str, timeout: Duration) -> Result<()> {
        let mut seen = String::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = self.output_rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            seen.push_str(&chunk);
                            if seen.contains(marker) {
                                tracing::info!(command = %self.label, "dev server is ready");
                                return Ok(());
                            }
                            keep_tail(&mut seen, marker.len());
                        }
                        // Both pipes closed: the server is exiting.
                        None => {
                            let status = self.child.wait().await?;
                            return Err(Error::process(
                                format!("dev server `{}` exited before becoming ready", self.label),
                                status.code(),
                                &seen,
                            ));
                        }
                    }
                }
                status = self.child.wait() => {
                    let status = status?;
                    while let Ok(chunk) = self.output_rx.try_recv() {
                        seen.push_str(&chunk);
                    }
                    if seen.contains(marker) {
                        tracing::warn!(command = %self.label, "dev server printed its marker and exited");
                    }
                    return Err(Error::process(
                        format!("dev server `{}` exited before becoming ready", self.label),
                        status.code(),
                        &seen,
                    ));
                }
                _ = &mut deadline => {
                    return Err(Error::Timeout {
                        command: format!("dev server `{}` readiness", self.label),
                        timeout,
                    });
                }
            }
        }
    }

    /// Stops the server: SIGTERM to the group, then SIGKILL after `grace`.
    pub async fn stop(mut self, grace: Duration) {
        self.stopped = true;

        let Some(pid) = self.child.id() else {
            // Already reaped.
            return;
        };

        signal_group(pid, Signal::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(command = %self.label, "dev server ignored SIGTERM, killing");
                signal_group(pid, Signal::SIGKILL);
                if let Err(e) = self.child.kill().await {
                    tracing::debug!(error = %e, "dev server already gone");
                }
            }
        }
        tracing::info!(command = %self.label, "dev server stopped");
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        if let Some(pid) = self.child.id() {
            tracing::warn!(command = %self.label, "dev server dropped without stop, killing");
            signal_group(pid, Signal::SIGKILL);
        }
    }
}

/// Reads a stream to EOF, forwarding chunks while anyone listens.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
            }
            Err(e) => {
                tracing::debug!(error = %e, "dev server output stream closed");
                break;
            }
        }
    }
}

/// Keeps only the tail of the buffer, enough for a marker split across chunks
/// and for a useful error excerpt.
fn keep_tail(seen: &mut String, marker_len: usize) {
    let keep = OUTPUT_TAIL_CHARS.max(marker_len);
    let len = seen.chars().count();
    if len > keep * 2 {
        let cut = seen
            .char_indices()
            .nth(len - keep)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        seen.drain(..cut);
    }
}

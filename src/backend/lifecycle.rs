//! Provider process lifecycle.
//!
//! Spawning, stderr capture, and exit observation for provider child
//! processes. The JSON-RPC session on top lives in `transport`; the state
//! machine lives in `connection`.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use super::errors::BackendError;
use super::types::ProviderSpec;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum length of the stderr suffix appended to error messages.
const STDERR_SUFFIX_MAX: usize = 2000;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// A freshly spawned provider process, stdio detached for the transport.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr_tail: StderrTail,
}

/// Spawn the provider process described by `spec`.
pub fn spawn_process(spec: &ProviderSpec) -> Result<SpawnedProcess, BackendError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(dir) = spec.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let launch_error = |reason: String| BackendError::Launch {
        provider: spec.name.clone(),
        reason,
    };

    let mut child = cmd
        .spawn()
        .map_err(|e| launch_error(format!("{}: {e}", spec.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| launch_error("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error("failed to capture stdout".into()))?;

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(spec.name.clone(), stderr, stderr_tail.clone()));
    }

    tracing::info!(
        provider = %spec.name,
        command = %spec.command,
        pid = child.id().unwrap_or_default(),
        "provider process spawned"
    );

    Ok(SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr_tail,
    })
}

// ─── Stderr ─────────────────────────────────────────────────────────────────

/// The last few stderr lines of a provider, for diagnostics on failure.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Suffix for error messages (empty string if no stderr was captured).
    pub fn suffix(&self) -> String {
        let lines = self.lines.lock();
        if lines.is_empty() {
            return String::new();
        }
        let mut joined = lines.iter().cloned().collect::<Vec<_>>().join(" | ");
        if joined.len() > STDERR_SUFFIX_MAX {
            let mut cut = STDERR_SUFFIX_MAX;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        format!(" | stderr: {joined}")
    }
}

/// Log each stderr line of a provider and keep the tail.
async fn forward_stderr(provider: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(provider = %provider, line = %line, "provider stderr");
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "provider stderr unreadable");
                break;
            }
        }
    }
}

// ─── Exit Observation ───────────────────────────────────────────────────────

/// How a provider process ended.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// Exit status 0.
    pub success: bool,
    /// The proxy asked the process to stop.
    pub requested: bool,
    pub description: String,
}

impl ProcessExit {
    fn from_wait(result: std::io::Result<ExitStatus>, requested: bool) -> Self {
        match result {
            Ok(status) => Self {
                success: status.success(),
                requested,
                description: status.to_string(),
            },
            Err(e) => Self {
                success: false,
                requested,
                description: format!("wait failed: {e}"),
            },
        }
    }
}

/// Take ownership of `child` and report its exit.
///
/// Firing (or dropping) `shutdown_rx` asks the process to stop: it gets
/// `SHUTDOWN_TIMEOUT` to exit on its own, then it is killed.
pub fn watch_exit(
    provider: String,
    mut child: Child,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> oneshot::Receiver<ProcessExit> {
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit = tokio::select! {
            status = child.wait() => ProcessExit::from_wait(status, false),
            _ = &mut shutdown_rx => {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                    Ok(status) => ProcessExit::from_wait(status, true),
                    Err(_) => {
                        tracing::warn!(provider = %provider, "provider ignored shutdown, killing");
                        if let Err(e) = child.kill().await {
                            tracing::warn!(provider = %provider, error = %e, "kill failed");
                        }
                        ProcessExit::from_wait(child.wait().await, true)
                    }
                }
            }
        };

        tracing::info!(
            provider = %provider,
            status = %exit.description,
            requested = exit.requested,
            "provider process exited"
        );
        let _ = exit_tx.send(exit);
    });

    exit_rx
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Generic agent process runner.
//!
//! Spawns a command in its own session (so it becomes its own process
//! group leader on Unix), captures stdout+stderr into a bounded ring
//! buffer, and resolves to one of a small set of outcomes independent of
//! which agent binary was run. Harness adapters sit on top of this to add
//! binary-specific argument building and live-event translation.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process_registry::ProcessRegistry;

const RING_BUFFER_MAX_LINES: usize = 5000;
const RING_BUFFER_MAX_BYTES: usize = 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How a spawned agent process resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exit(i32),
    Timeout,
    Cancelled,
    SpawnError,
}

/// Everything needed to spawn one agent invocation.
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Text to write to stdin and close, e.g. the rendered prompt.
    pub stdin: Option<String>,
}

/// A bounded buffer of captured stdout+stderr lines; whichever of line
/// count or byte size is hit first caps it, dropping the oldest lines.
#[derive(Debug, Default)]
struct RingBuffer {
    lines: VecDeque<String>,
    bytes: usize,
}

impl RingBuffer {
    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.lines.len() > RING_BUFFER_MAX_LINES || self.bytes > RING_BUFFER_MAX_BYTES {
            let Some(dropped) = self.lines.pop_front() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(dropped.len() + 1);
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Run a single agent invocation to completion, timeout, or cancellation.
///
/// Returns the outcome plus the captured ring-buffer contents, which the
/// caller persists as the session's output log.
pub async fn run(request: RunRequest, registry: &ProcessRegistry, cancel: &CancellationToken) -> (RunOutcome, String) {
    let mut cmd = Command::new(&request.command);
    cmd.args(&request.args)
        .current_dir(&request.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid() is async-signal-safe and only affects the
        // child, which has not yet exec'd.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %request.command, error = %e, "failed to spawn agent process");
            return (RunOutcome::SpawnError, String::new());
        }
    };

    let Some(pid) = child.id() else {
        return (RunOutcome::SpawnError, String::new());
    };
    registry.register(pid).await;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(text) = &request.stdin {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                warn!(pid, error = %e, "failed to write stdin to agent process");
            }
        }
        drop(stdin);
    }

    let buffer = Arc::new(Mutex::new(RingBuffer::default()));

    let stdout_task = child.stdout.take().map(|stdout| {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().await.push(line);
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().await.push(line);
            }
        })
    });

    let wait_fut = child.wait();
    tokio::pin!(wait_fut);
    let sleep_fut = tokio::time::sleep(request.timeout);
    tokio::pin!(sleep_fut);

    let outcome = tokio::select! {
        status = &mut wait_fut => {
            match status {
                Ok(status) => RunOutcome::Exit(status.code().unwrap_or(-1)),
                Err(e) => {
                    warn!(pid, error = %e, "error waiting for agent process");
                    RunOutcome::Exit(-1)
                }
            }
        }
        _ = &mut sleep_fut => {
            kill_process_group(pid).await;
            let _ = tokio::time::timeout(KILL_GRACE, &mut wait_fut).await;
            RunOutcome::Timeout
        }
        _ = cancel.cancelled() => {
            kill_process_group(pid).await;
            let _ = tokio::time::timeout(KILL_GRACE, &mut wait_fut).await;
            RunOutcome::Cancelled
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    registry.unregister(pid).await;

    let output = buffer.lock().await.render();
    info!(pid, outcome = ?outcome, "agent process completed");
    (outcome, output)
}

async fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        // Negative pid targets the whole process group under setsid().
        if unsafe { libc::kill(-(pid as i32), libc::SIGTERM) } != 0 {
            warn!(pid, "SIGTERM to process group failed");
        }
        tokio::time::sleep(KILL_GRACE).await;
        let _ = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    }
}

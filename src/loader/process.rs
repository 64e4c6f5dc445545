//! Child process ownership for subprocess-backed servers.
//!
//! A [`ProcessHandle`] owns the child, the tasks draining its output and the
//! rolling buffer those tasks fill. Termination is idempotent.
//!
//! In MCP mode stdout is piped through a filter task: JSON lines go to the
//! rmcp transport, anything else is treated as log output and buffered.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, ReadHalf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

/// Lines of output kept per process.
const OUTPUT_CAPACITY: usize = 200;

/// How long output drains may run after exit before they are abandoned.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Rolling buffer of a process's stdout/stderr lines, for diagnostics.
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    /// Buffered lines joined with newlines.
    pub fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipes {
    /// stdout and stderr are drained into the output buffer; stdin is closed.
    Drain,
    /// stdin/stdout carry MCP JSON-RPC; stderr is drained.
    Mcp,
}

/// rmcp transport halves for a child speaking MCP over stdio.
pub type McpPipes = (ReadHalf<DuplexStream>, ChildStdin);

/// A spawned child process and the tasks attached to it.
pub struct ProcessHandle {
    server_id: String,
    command_line: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    exit_status: Mutex<Option<ExitStatus>>,
    cancel: CancellationToken,
    output: Arc<Mutex<OutputBuffer>>,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessHandle {
    /// Spawn `cmd` with its streams wired per `pipes`.
    ///
    /// The child is killed if the handle is dropped without being terminated.
    pub fn spawn(
        server_id: &str,
        command_line: String,
        mut cmd: Command,
        pipes: Pipes,
    ) -> std::io::Result<(Arc<Self>, Option<McpPipes>)> {
        cmd.kill_on_drop(true);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(match pipes {
            Pipes::Mcp => std::process::Stdio::piped(),
            Pipes::Drain => std::process::Stdio::null(),
        });

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let cancel = CancellationToken::new();
        let output = Arc::new(Mutex::new(OutputBuffer::new(OUTPUT_CAPACITY)));
        let mut drains = Vec::new();

        if let Some(stderr) = child.stderr.take() {
            drains.push(start_drain(
                stderr,
                server_id.to_string(),
                "stderr",
                output.clone(),
                cancel.clone(),
            ));
        }

        let mut transport = None;
        if let Some(stdout) = child.stdout.take() {
            match pipes {
                Pipes::Drain => drains.push(start_drain(
                    stdout,
                    server_id.to_string(),
                    "stdout",
                    output.clone(),
                    cancel.clone(),
                )),
                Pipes::Mcp => {
                    let (reader, task) = start_stdout_filter(
                        stdout,
                        server_id.to_string(),
                        output.clone(),
                        cancel.clone(),
                    );
                    drains.push(task);
                    if let Some(stdin) = child.stdin.take() {
                        transport = Some((reader, stdin));
                    }
                }
            }
        }

        tracing::info!(server = %server_id, pid = ?pid, command = %command_line, "spawned process");

        let handle = Arc::new(Self {
            server_id: server_id.to_string(),
            command_line,
            pid,
            child: Mutex::new(Some(child)),
            exit_status: Mutex::new(None),
            cancel,
            output,
            drains: Mutex::new(drains),
        });
        Ok((handle, transport))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Token cancelled when the process is terminated.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking exit check. Records the status on first observation.
    pub async fn try_exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;
        if let Some(c) = child.as_mut() {
            if let Ok(Some(status)) = c.try_wait() {
                *self.exit_status.lock().await = Some(status);
            }
        }
        *self.exit_status.lock().await
    }

    pub async fn is_alive(&self) -> bool {
        if self.try_exit_status().await.is_some() {
            return false;
        }
        self.child.lock().await.is_some()
    }

    /// Resolve once the process has exited or been terminated.
    ///
    /// Polls instead of holding the child lock so that `terminate` stays
    /// available while readiness races exit.
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        loop {
            if let Some(status) = self.try_exit_status().await {
                return Some(status);
            }
            if self.child.lock().await.is_none() {
                return *self.exit_status.lock().await;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    /// Let output drains finish reading what the process wrote, bounded by a
    /// short grace period.
    pub async fn settle_output(&self) {
        let drains: Vec<JoinHandle<()>> = self.drains.lock().await.drain(..).collect();
        for mut drain in drains {
            if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
                drain.abort();
            }
        }
    }

    /// Buffered output, newest last.
    pub async fn output(&self) -> String {
        self.output.lock().await.joined()
    }

    /// Kill the process, reap it and stop I/O tasks. Calls after the first
    /// are no-ops.
    pub async fn terminate(&self) -> crate::Result<()> {
        let child = self.child.lock().await.take();
        let mut failure = None;

        if let Some(mut child) = child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    *self.exit_status.lock().await = Some(status);
                }
                _ => {
                    tracing::info!(server = %self.server_id, pid = ?self.pid, "terminating process");
                    if let Err(e) = child.start_kill() {
                        failure = Some(e.to_string());
                    }
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(Ok(status)) => *self.exit_status.lock().await = Some(status),
                        Ok(Err(e)) => failure = Some(e.to_string()),
                        Err(_) => {
                            failure = Some(format!(
                                "process did not exit within {}s of kill",
                                KILL_GRACE.as_secs()
                            ))
                        }
                    }
                }
            }
        }

        self.cancel.cancel();
        self.settle_output().await;

        match failure {
            Some(e) => Err(HubError::Cleanup(self.server_id.clone(), e)),
            None => Ok(()),
        }
    }
}

/// Drain one stream line by line into the output buffer.
fn start_drain<R>(
    stream: R,
    server_id: String,
    label: &'static str,
    output: Arc<Mutex<OutputBuffer>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %server_id, stream = label, line = %line, "process output");
                            output.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// Filter the child's stdout: JSON lines are forwarded to the returned reader
/// for rmcp, other lines go to the output buffer.
fn start_stdout_filter(
    child_stdout: ChildStdout,
    server_id: String,
    output: Arc<Mutex<OutputBuffer>>,
    cancel: CancellationToken,
) -> (ReadHalf<DuplexStream>, JoinHandle<()>) {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _client_writer) = tokio::io::split(client_side);
    let (_server_reader, mut writer) = tokio::io::split(server_side);

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                                let with_newline = format!("{}\n", line);
                                if writer.write_all(with_newline.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(server = %server_id, line = %line, "non-JSON stdout line");
                                output.lock().await.push(line);
                            }
                        }
                        // EOF: dropping the writer signals EOF to the reader
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    (reader, task)
}

//! JSON-RPC over a child process's stdio.
//!
//! - Requests are written to stdin, one JSON object per line
//! - A reader task parses stdout lines and routes responses by id
//! - stderr is drained into the log; the last lines are kept for error reports

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{extract_result, next_request_id, PendingRequests};
use crate::mcp_client::config::ServerConfig;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    initialize_params, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// A spawned server process and the tasks servicing it.
struct RunningProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_drain: Option<JoinHandle<()>>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    process: tokio::sync::Mutex<Option<RunningProcess>>,
    pending: Arc<PendingRequests>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    pub fn new(server_id: &str, command: &str, config: &ServerConfig) -> Self {
        Self {
            server_id: server_id.to_string(),
            command: command.to_string(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            process: tokio::sync::Mutex::new(None),
            pending: Arc::new(PendingRequests::default()),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Spawn the process and perform the MCP initialization handshake.
    pub async fn start(&self) -> Result<InitializeResult, McpError> {
        {
            let mut guard = self.process.lock().await;
            if guard.is_some() {
                return Ok(InitializeResult::default());
            }
            *guard = Some(self.spawn()?);
        }

        match self.handshake().await {
            Ok(init) => {
                tracing::info!(
                    server = %self.server_id,
                    command = %self.command,
                    server_name = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
                    "stdio server started"
                );
                Ok(init)
            }
            Err(e) => {
                let stderr_ctx = self.stderr_tail_text();
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        server = %self.server_id,
                        stderr = %stderr_ctx,
                        "server stderr captured on failure"
                    );
                }
                Err(match e {
                    McpError::ConnectionClosed { .. } | McpError::TransportError { .. } => {
                        McpError::SpawnFailed {
                            name: self.server_id.clone(),
                            reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
                        }
                    }
                    other => other,
                })
            }
        }
    }

    fn spawn(&self) -> Result<RunningProcess, McpError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.server_id.clone(),
            reason: format!("{}: {e}", self.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.server_id.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.server_id.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        self.pending.reopen();
        let reader = tokio::spawn(read_responses(
            self.server_id.clone(),
            stdout,
            self.pending.clone(),
        ));
        let stderr_drain = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(
                self.server_id.clone(),
                stderr,
                self.stderr_tail.clone(),
            ))
        });

        tracing::debug!(
            server = %self.server_id,
            command = %self.command,
            pid = ?child.id(),
            "spawned stdio server"
        );

        Ok(RunningProcess {
            child,
            stdin,
            reader,
            stderr_drain,
        })
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let result = self.request("initialize", Some(initialize_params())).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let slot = self.pending.register(id, &self.server_id)?;

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(|e| {
            McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;
        self.write_line(line).await?;

        extract_result(slot.wait().await?)
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(line).await
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');

        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(McpError::ConnectionClosed {
            server: self.server_id.clone(),
        })?;

        process
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        process
            .stdin
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    /// Close stdin, give the process a moment to exit, then kill it.
    pub async fn close(&self) {
        let Some(process) = self.process.lock().await.take() else {
            return;
        };
        let RunningProcess {
            mut child,
            mut stdin,
            reader,
            stderr_drain,
        } = process;

        // Best-effort shutdown notification; the server may already be gone.
        if let Ok(mut line) = serde_json::to_string(&JsonRpcNotification::new("shutdown", None)) {
            line.push('\n');
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.flush().await;
        }
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_id, %status, "stdio server exited");
            }
            _ => {
                tracing::debug!(server = %self.server_id, "stdio server did not exit, killing");
                let _ = child.kill().await;
            }
        }

        reader.abort();
        if let Some(drain) = stderr_drain {
            drain.abort();
        }
        self.pending.fail_all();
    }

    fn stderr_tail_text(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Route stdout lines to pending requests until the stream closes.
async fn read_responses(server_id: String, stdout: ChildStdout, pending: Arc<PendingRequests>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) if resp.id.is_some() => {
                        if !pending.resolve(resp) {
                            tracing::debug!(server = %server_id, "response for unknown request id");
                        }
                    }
                    // Server-initiated notification
                    Ok(_) => tracing::trace!(server = %server_id, "ignoring server notification"),
                    // Not JSON-RPC: probably log output on stdout
                    Err(_) => tracing::trace!(server = %server_id, line = trimmed, "non-JSON stdout line"),
                }
            }
            Ok(None) => {
                tracing::warn!(server = %server_id, "server stdout closed (process may have exited)");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "failed to read server stdout");
                break;
            }
        }
    }

    pending.fail_all();
}

async fn drain_stderr(server_id: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server_id, stderr = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[tokio::test]
    async fn test_close_without_start_is_noop() {
        let cfg = ServerConfig::stdio("cat", &[]);
        let transport = StdioTransport::new("idle", "cat", &cfg);
        transport.close().await;
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_without_handshake_fails_start() {
        // `true` exits immediately, closing stdout before any response.
        let cfg = ServerConfig::stdio("true", &[]);
        let transport = StdioTransport::new("quitter", "true", &cfg);
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }), "got {err:?}");
        transport.close().await;
    }
}

//! Subprocess stdio transport.
//!
//! Spawns a child process and speaks line-delimited JSON-RPC 2.0 over its
//! stdin/stdout. Concurrent requests are correlated through a pending map
//! keyed by request id; teardown resolves every waiter with an error so no
//! caller is left hanging.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mg_types::{AppResult, GatewayError};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<RwLock<HashMap<String, oneshot::Sender<AppResult<JsonRpcResponse>>>>>;

/// Line-delimited JSON-RPC over a child process's stdio.
#[derive(Debug)]
pub struct StdioTransport {
    child: Arc<RwLock<Option<Child>>>,

    /// Mutex (not RwLock) so a whole line is written and flushed atomically
    /// under concurrent senders.
    stdin: Arc<Mutex<Option<ChildStdin>>>,

    /// In-flight requests waiting for a response, keyed by request id.
    pending: PendingMap,

    next_id: AtomicU64,

    closed: Arc<RwLock<bool>>,
}

impl StdioTransport {
    /// Spawn the backend process and start the stdout reader.
    pub async fn spawn(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> AppResult<Self> {
        tracing::info!("Spawning MCP stdio process: {} {:?}", command, args);

        let mut child = Command::new(&command)
            .args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::UpstreamUnavailable(format!(
                    "failed to spawn process '{command}': {e}"
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::Internal("failed to capture stdin of spawned process".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::Internal("failed to capture stdout of spawned process".to_string())
        })?;
        let stderr = child.stderr.take();

        let transport = Self {
            child: Arc::new(RwLock::new(Some(child))),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pending: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: Arc::new(RwLock::new(false)),
        };

        transport.start_stdout_reader(stdout);
        if let Some(stderr) = stderr {
            start_stderr_logger(stderr);
        }

        Ok(transport)
    }

    /// Background task: read stdout lines, dispatch responses to waiters.
    fn start_stdout_reader(&self, stdout: ChildStdout) {
        let pending = self.pending.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::info!("MCP stdio process stdout closed");
                        *closed.write() = true;
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                let id_str = pending_key(&response.id);
                                if let Some(sender) = pending.write().remove(&id_str) {
                                    let _ = sender.send(Ok(response));
                                } else {
                                    tracing::warn!(
                                        "Received response for unknown request id: {}",
                                        id_str
                                    );
                                }
                            }
                            Ok(JsonRpcMessage::Notification(n)) => {
                                tracing::debug!("Backend notification: {}", n.method);
                            }
                            Ok(JsonRpcMessage::Request(_)) => {
                                // Server-initiated requests (sampling etc.) are
                                // not bridged; the process keeps running.
                                tracing::debug!("Ignoring server-initiated request");
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Failed to parse backend message: {}\nLine: {}",
                                    e,
                                    trimmed
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error reading backend stdout: {}", e);
                        *closed.write() = true;
                        break;
                    }
                }
            }

            drain_pending(&pending, "backend process closed its stdout");
        });
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_alive(&self) -> bool {
        if *self.closed.read() {
            return false;
        }
        let mut child = self.child.write();
        if let Some(ref mut process) = *child {
            match process.try_wait() {
                Ok(Some(_status)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!("Error checking process status: {}", e);
                    false
                }
            }
        } else {
            false
        }
    }

    async fn kill(&self) -> AppResult<()> {
        *self.closed.write() = true;

        // Take the child out before awaiting so the lock isn't held across it.
        let child_process = self.child.write().take();
        if let Some(mut process) = child_process {
            process
                .kill()
                .await
                .map_err(|e| GatewayError::Internal(format!("failed to kill process: {e}")))?;
        }

        drain_pending(&self.pending, "connection closed");
        Ok(())
    }
}

/// Pending-map key for a wire id. String ids map to their raw contents so a
/// backend echoing our numeric id back as a JSON string still correlates.
fn pending_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every waiter with an error instead of leaving it to time out.
fn drain_pending(pending: &PendingMap, reason: &str) {
    let mut pending = pending.write();
    for (id, sender) in pending.drain() {
        tracing::debug!("Resolving request {} after teardown", id);
        let _ = sender.send(Err(GatewayError::UpstreamUnavailable(reason.to_string())));
    }
}

fn start_stderr_logger(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while let Ok(n) = reader.read_line(&mut line).await {
            if n == 0 {
                break;
            }
            tracing::debug!("backend stderr: {}", line.trim_end());
            line.clear();
        }
    });
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(&self, mut request: JsonRpcRequest) -> AppResult<JsonRpcResponse> {
        if *self.closed.read() {
            return Err(GatewayError::UpstreamUnavailable(
                "transport is closed".to_string(),
            ));
        }

        // Always assign a fresh id so concurrent callers can't collide.
        let request_id = {
            let id = self.next_request_id();
            request.id = Some(Value::Number(id.into()));
            id.to_string()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(request_id.clone(), tx);

        let mut json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                self.pending.write().remove(&request_id);
                return Err(e.into());
            }
        };
        json.push('\n');

        {
            let mut stdin_guard = self.stdin.lock().await;
            let stdin = match stdin_guard.as_mut() {
                Some(stdin) => stdin,
                None => {
                    self.pending.write().remove(&request_id);
                    return Err(GatewayError::UpstreamUnavailable(
                        "stdin not available".to_string(),
                    ));
                }
            };
            let write = async {
                stdin.write_all(json.as_bytes()).await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                self.pending.write().remove(&request_id);
                return Err(GatewayError::UpstreamUnavailable(format!(
                    "failed to write to backend stdin: {e}"
                )));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving; teardown normally resolves
            // explicitly, so treat this as the connection going away.
            Ok(Err(_)) => Err(GatewayError::UpstreamUnavailable(
                "connection closed before response".to_string(),
            )),
            Err(_) => {
                self.pending.write().remove(&request_id);
                Err(GatewayError::UpstreamUnavailable(format!(
                    "request {request_id} timed out"
                )))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.is_alive()
    }

    async fn close(&self) -> AppResult<()> {
        self.kill().await
    }
}

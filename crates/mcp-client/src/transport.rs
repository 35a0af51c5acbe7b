//! Tool-server transports.
//!
//! A transport moves JSON-RPC lines to and from one server. Stdio spawns
//! the server as a child process; SSE is a stub kept for config
//! compatibility.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use mx_domain::config::McpServerConfig;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// How long a single request may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-JSON stdout lines tolerated before the server is declared broken.
const MAX_NOISE_LINES: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool-server process has exited")]
    ProcessExited,

    #[error("timed out waiting for tool-server response")]
    Timeout,

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

/// One server connection's wire layer.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Send a request and wait for its matching response.
    async fn request(&self, method: &str, params: Option<Value>)
        -> Result<JsonRpcResponse, TransportError>;

    /// Send a fire-and-forget notification.
    async fn notify(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Child process speaking newline-delimited JSON over stdin/stdout.
///
/// `cycle_lock` serializes whole request/response cycles; without it two
/// concurrent callers could consume each other's responses.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    cycle_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn the configured server process.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdout")
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            cycle_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON line, tolerating log noise on stdout.
    async fn read_json_line(&self) -> Result<String, TransportError> {
        let mut stdout = self.stdout.lock().await;
        let mut noise = 0usize;
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).await?;
            if n == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_owned());
            }
            if trimmed.is_empty() {
                continue;
            }
            noise += 1;
            tracing::debug!(line = %trimmed, "skipping non-JSON tool-server output");
            if noise >= MAX_NOISE_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tool server flooded stdout with non-JSON output",
                )));
            }
        }
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _cycle = self.cycle_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(id, method, "tool-server request");
        self.write_line(&json).await?;

        // Servers may interleave notifications; read until our id comes back.
        tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let line = self.read_json_line().await?;
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) if resp.id == id => return Ok(resp),
                    Ok(resp) => {
                        tracing::debug!(expected = id, got = resp.id, "out-of-order response");
                    }
                    Err(_) => {
                        tracing::debug!(line = %line, "skipping non-response message");
                    }
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "tool-server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for tool-server process"),
            Err(_) => {
                tracing::warn!("tool server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE (stub)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SseTransport;

#[async_trait]
impl ToolTransport for SseTransport {
    async fn request(
        &self,
        _method: &str,
        _params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        Err(TransportError::Unsupported("SSE transport".into()))
    }

    async fn notify(&self, _method: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("SSE transport".into()))
    }

    fn is_alive(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}

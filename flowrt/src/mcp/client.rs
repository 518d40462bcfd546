//! MCP Stdio Client
//!
//! JSON-RPC 2.0 over line-delimited stdio. The call path is half-duplex: one request
//! line is written and its response is read while the channel lock is held. The
//! server must answer every request once, in order, and send nothing unsolicited.
//!
//! A caller may drop `request` at any await point (deadlines do). A half-read line
//! stays buffered in the channel, and replies to abandoned requests carry a lower id
//! than the current one and are discarded. A half-written request cannot be repaired,
//! so it marks the client broken and later requests fail until it is replaced.

use super::types::{
    tool_result_text, JsonRpcRequest, JsonRpcResponse, McpTool, PARSE_ERROR, PROTOCOL_VERSION,
};
use flowlang::{RuntimeError, RuntimeResult};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Channel {
    reader: Reader,
    writer: Option<Writer>,
    next_id: u64,
    /// Bytes of a response line not yet terminated by `\n`.
    partial: Vec<u8>,
}

pub struct McpClient {
    name: String,
    channel: Mutex<Channel>,
    broken: AtomicBool,
    child: std::sync::Mutex<Option<Child>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient").field("name", &self.name).finish()
    }
}

impl McpClient {
    /// Spawn a server process and talk to it over its stdin/stdout.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> RuntimeResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::RequestFailed(format!(
                    "Failed to spawn MCP server '{}' ({}): {}",
                    name, command, e
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RuntimeError::RequestFailed(format!("MCP server '{}' has no stdin", name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::RequestFailed(format!("MCP server '{}' has no stdout", name))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line);
                }
            });
        }

        let mut client = Self::from_streams(name, stdout, stdin);
        client.child = std::sync::Mutex::new(Some(child));
        Ok(client)
    }

    /// Client over arbitrary streams: `reader` carries responses, `writer` requests.
    pub fn from_streams<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            name: name.to_string(),
            channel: Mutex::new(Channel {
                reader: BufReader::new(reader),
                writer: Some(Box::new(writer)),
                next_id: 1,
                partial: Vec::new(),
            }),
            broken: AtomicBool::new(false),
            child: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn write_line(writer: &mut Writer, message: &JsonRpcRequest) -> RuntimeResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// True once a request was abandoned halfway through its write.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn broken_error(&self) -> RuntimeError {
        RuntimeError::RequestFailed(format!(
            "MCP server '{}' is out of sync after an interrupted request",
            self.name
        ))
    }

    /// Read one complete line. Bytes read before a cancellation remain in `partial`.
    async fn read_line(&self, channel: &mut Channel) -> RuntimeResult<String> {
        loop {
            let Channel { reader, partial, .. } = &mut *channel;
            if reader.read_until(b'\n', partial).await? == 0 {
                return Err(RuntimeError::RequestFailed(format!(
                    "MCP server '{}' closed its output",
                    self.name
                )));
            }
            if partial.ends_with(b"\n") {
                let line = std::mem::take(partial);
                return Ok(String::from_utf8_lossy(&line).trim().to_string());
            }
        }
    }

    /// Send one request and read its response.
    pub async fn request(&self, method: &str, params: JsonValue) -> RuntimeResult<JsonValue> {
        let mut channel = self.channel.lock().await;
        if self.is_broken() {
            return Err(self.broken_error());
        }
        let id = channel.next_id;
        channel.next_id += 1;

        let request = JsonRpcRequest::new(id, method, params);
        let writer = channel.writer.as_mut().ok_or_else(|| {
            RuntimeError::RequestFailed(format!("MCP server '{}' is closed", self.name))
        })?;
        self.broken.store(true, Ordering::Release);
        Self::write_line(writer, &request).await?;
        self.broken.store(false, Ordering::Release);

        let response = loop {
            let line = self.read_line(&mut channel).await?;
            let response: JsonRpcResponse =
                serde_json::from_str(&line).map_err(|e| RuntimeError::McpProtocol {
                    code: PARSE_ERROR,
                    message: format!("invalid response from '{}': {}", self.name, e),
                })?;
            match response.id.as_ref().and_then(JsonValue::as_u64) {
                Some(seen) if seen == id => break response,
                Some(seen) if seen < id => {
                    debug!(
                        server = %self.name,
                        id = seen,
                        "discarding reply to abandoned request"
                    );
                }
                _ => {
                    warn!(
                        server = %self.name,
                        expected = id,
                        received = ?response.id,
                        "MCP response id mismatch"
                    );
                    return Err(RuntimeError::McpProtocol {
                        code: PARSE_ERROR,
                        message: format!(
                            "response from '{}' has id {:?}, expected {}",
                            self.name, response.id, id
                        ),
                    });
                }
            }
        };
        drop(channel);

        if let Some(error) = response.error {
            return Err(RuntimeError::McpProtocol {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(JsonValue::Null))
    }

    /// Write-only message; no response is read.
    pub async fn notify(&self, method: &str) -> RuntimeResult<()> {
        let mut channel = self.channel.lock().await;
        let writer = channel.writer.as_mut().ok_or_else(|| {
            RuntimeError::RequestFailed(format!("MCP server '{}' is closed", self.name))
        })?;
        self.broken.store(true, Ordering::Release);
        Self::write_line(writer, &JsonRpcRequest::notification(method)).await?;
        self.broken.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn initialize(&self) -> RuntimeResult<JsonValue> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "flowrt",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        self.notify("notifications/initialized").await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> RuntimeResult<Vec<McpTool>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| RuntimeError::McpProtocol {
            code: PARSE_ERROR,
            message: format!("invalid tools/list result: {}", e),
        })
    }

    pub async fn call_tool(&self, tool: &str, arguments: JsonValue) -> RuntimeResult<JsonValue> {
        self.request(
            "tools/call",
            json!({ "name": tool, "arguments": arguments }),
        )
        .await
    }

    /// `call_tool` reduced to its text content.
    pub async fn call_tool_text(&self, tool: &str, arguments: JsonValue) -> RuntimeResult<String> {
        let result = self.call_tool(tool, arguments).await?;
        Ok(tool_result_text(&result))
    }

    /// Close stdin and wait for the server to exit.
    pub async fn close(&self) -> RuntimeResult<()> {
        {
            let mut channel = self.channel.lock().await;
            if let Some(mut writer) = channel.writer.take() {
                let _ = writer.shutdown().await;
            }
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut child) = child {
            let status = child.wait().await?;
            debug!(server = %self.name, %status, "MCP server exited");
        }
        Ok(())
    }
}

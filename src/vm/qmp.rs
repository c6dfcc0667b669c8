//! QEMU Machine Protocol client
//!
//! QMP is line-delimited JSON over a Unix socket. After the greeting the
//! client must negotiate capabilities before any other command; responses
//! carry either `return` or `error`, and asynchronous `event` lines may be
//! interleaved at any point.

use std::path::Path;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use super::VmError;

/// Client for a QEMU QMP socket
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect, read the greeting and leave capabilities negotiation mode
    pub async fn connect(socket_path: &Path) -> Result<Self, VmError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(VmError::Qmp(format!("unexpected greeting: {}", greeting)));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<Value, VmError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(VmError::Qmp("connection closed".into()));
        }
        serde_json::from_str(&line).map_err(|e| VmError::Qmp(format!("invalid message: {}", e)))
    }

    /// Run a command and return its `return` payload
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, VmError> {
        let mut request = json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let message = self.read_message().await?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(error) = message.get("error") {
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(VmError::Qmp(format!("{} failed: {}", command, desc)));
            }
            if let Some(event) = message.get("event") {
                debug!(event = %event, "QMP event");
            }
        }
    }

    /// Pause vCPUs
    pub async fn stop(&mut self) -> Result<(), VmError> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Resume vCPUs
    pub async fn cont(&mut self) -> Result<(), VmError> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Ask QEMU to exit
    pub async fn quit(&mut self) -> Result<(), VmError> {
        self.execute("quit", None).await.map(|_| ())
    }

    /// Current run state, e.g. "running" or "paused"
    pub async fn query_status(&mut self) -> Result<String, VmError> {
        let status = self.execute("query-status", None).await?;
        Ok(status
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

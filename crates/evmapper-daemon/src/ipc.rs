//! IPC server and protocol
//!
//! A Unix domain socket carrying newline-delimited JSON, one request and
//! one response per connection. The CLI and the GUI editor both speak this
//! protocol; the payload shapes are stable.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use nix::libc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub const SOCKET_NAME: &str = "evmapper.sock";

// ============================================================================
// Protocol
// ============================================================================

/// Requests sent by the CLI or other control tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Health probe; the daemon answers with `Hello`.
    Hello,
    /// Enumerate device groups.
    ListGroups,
    StartInjection {
        group_key: String,
        preset_name: String,
    },
    StopInjection {
        group_key: String,
    },
    /// Start every `(group, preset)` pair from the autoload configuration,
    /// optionally from a different configuration directory.
    Autoload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_dir: Option<PathBuf>,
    },
    SetConfigDir {
        path: PathBuf,
    },
}

/// One device group in a `ListGroups` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub group_key: String,
    pub human_name: String,
    pub sub_device_paths: Vec<PathBuf>,
    /// Status of the group's injection, if any.
    pub status: String,
}

/// Responses sent back by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Hello,
    Groups {
        groups: Vec<GroupSummary>,
    },
    Accepted,
    Rejected {
        reason: String,
    },
    Ok,
    Error {
        message: String,
    },
}

/// The socket path: `$XDG_RUNTIME_DIR/evmapper.sock`, falling back to
/// `/tmp/evmapper-$UID.sock`.
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(SOCKET_NAME);
    }
    tracing::warn!("XDG_RUNTIME_DIR not set, using fallback socket path in /tmp");
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/evmapper-{uid}.sock"))
}

// ============================================================================
// Server
// ============================================================================

/// Listening side of the control socket. The socket file is removed again
/// when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    pub fn new() -> Result<Self> {
        Self::bind(socket_path())
    }

    pub fn bind(socket_path: PathBuf) -> Result<Self> {
        if socket_path.exists() {
            tracing::debug!("removing stale socket file {}", socket_path.display());
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("failed to remove stale socket {}", socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        tracing::info!("IPC server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("failed to accept IPC connection")?;
        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(error) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!("failed to remove socket file on shutdown: {error}");
            }
        }
    }
}

/// Read the single request of a connection. `None` if the peer hung up
/// without sending anything.
pub async fn read_request(stream: &mut UnixStream) -> Result<Option<IpcRequest>> {
    let (reader, _) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read IPC request")?;
    if bytes == 0 {
        return Ok(None);
    }
    let request = serde_json::from_str(line.trim()).context("malformed IPC request")?;
    Ok(Some(request))
}

pub async fn write_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<()> {
    let mut payload = serde_json::to_string(response).context("failed to encode response")?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .await
        .context("failed to write IPC response")?;
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

/// One request/response round trip, used by the CLI.
pub async fn request(socket: &Path, request: &IpcRequest) -> Result<IpcResponse> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {} (is the daemon running?)", socket.display()))?;

    let mut payload = serde_json::to_string(request).context("failed to encode request")?;
    payload.push('\n');
    stream.write_all(payload.as_bytes()).await?;

    let (reader, _) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    serde_json::from_str(line.trim()).context("malformed IPC response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_have_stable_shapes() {
        let request = IpcRequest::StartInjection {
            group_key: "My Keyboard".to_string(),
            preset_name: "gaming".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"type":"start_injection","group_key":"My Keyboard","preset_name":"gaming"}"#
        );

        let hello: IpcRequest = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(hello, IpcRequest::Hello);
    }

    #[test]
    fn responses_round_trip() {
        let response = IpcResponse::Rejected {
            reason: "no devices".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, back);
    }

    #[tokio::test]
    async fn server_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let server = IpcServer::bind(path.clone()).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move { request(&path, &IpcRequest::Hello).await.unwrap() }
        });

        let mut stream = server.accept().await.unwrap();
        let received = read_request(&mut stream).await.unwrap().unwrap();
        assert_eq!(received, IpcRequest::Hello);
        write_response(&mut stream, &IpcResponse::Hello).await.unwrap();

        assert_eq!(client.await.unwrap(), IpcResponse::Hello);
        drop(server);
        assert!(!path.exists());
    }
}

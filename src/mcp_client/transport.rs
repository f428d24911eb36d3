//! JSON-RPC over stdio transport.
//!
//! Line-delimited JSON: one request per line on the server's stdin, one
//! response per line on its stdout. A request and its response are exchanged
//! under a single lock, so commands to the same server are serialized.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Channel {
    /// `None` once the channel has been closed for shutdown.
    writer: Option<BoxedWriter>,
    reader: BoxedReader,
}

/// Bi-directional JSON-RPC transport over a pair of byte streams
/// (normally a child process's stdin/stdout).
pub struct StdioTransport {
    server_name: String,
    channel: Mutex<Channel>,
}

impl StdioTransport {
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            channel: Mutex::new(Channel {
                writer: Some(Box::new(writer)),
                reader: BufReader::new(reader),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Send a request and wait for the response with the matching `id`.
    ///
    /// Lines that are not JSON-RPC (server log output, including bytes that
    /// are not valid UTF-8), server-initiated requests and responses for
    /// other ids are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let line = self.encode(&req)?;

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await?;

        let mut line_buf = Vec::new();
        loop {
            line_buf.clear();
            let bytes_read = channel
                .reader
                .read_until(b'\n', &mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let text = String::from_utf8_lossy(&line_buf);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.is_server_request() => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = resp.method.as_deref().unwrap_or_default(),
                        "ignoring server-initiated request"
                    );
                }
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = %trimmed, "non-JSON-RPC output");
                }
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = self.encode(&notification)?;

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await
    }

    /// Close the write half. A well-behaved stdio server exits on EOF.
    pub async fn close(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(mut writer) = channel.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, channel: &mut Channel, line: &str) -> Result<(), McpError> {
        let writer = channel
            .writer
            .as_mut()
            .ok_or_else(|| self.transport_error("channel already closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Wire a transport to an in-memory peer; returns the peer's halves.
    fn paired() -> (
        StdioTransport,
        BufReader<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    ) {
        let (client_out, server_in) = duplex(4096);
        let (server_out, client_in) = duplex(4096);
        let transport = StdioTransport::new("fake", client_out, client_in);
        (transport, BufReader::new(server_in), server_out)
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_foreign_ids() {
        let (transport, mut server_in, mut server_out) = paired();

        let peer = tokio::spawn(async move {
            let mut line = String::new();
            server_in.read_line(&mut line).await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();
            assert_eq!(req["method"], "tools/list");

            server_out.write_all(b"starting up...\n").await.unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":999999999,\"result\":{}}\n")
                .await
                .unwrap();
            let reply = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"tools\":[]}}}}\n");
            server_out.write_all(reply.as_bytes()).await.unwrap();
        });

        let resp = transport.request("tools/list", None).await.unwrap();
        assert!(resp.result.unwrap()["tools"].as_array().unwrap().is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_tolerates_invalid_utf8_noise() {
        let (transport, mut server_in, mut server_out) = paired();

        let peer = tokio::spawn(async move {
            let mut line = String::new();
            server_in.read_line(&mut line).await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();

            server_out.write_all(b"log \xff\xfe latin1 noise\n").await.unwrap();
            let reply = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"tools\":[]}}}}\n");
            server_out.write_all(reply.as_bytes()).await.unwrap();
        });

        let resp = transport.request("tools/list", None).await.unwrap();
        assert!(resp.result.unwrap()["tools"].as_array().unwrap().is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_skips_server_request_with_same_id() {
        let (transport, mut server_in, mut server_out) = paired();

        let peer = tokio::spawn(async move {
            let mut line = String::new();
            server_in.read_line(&mut line).await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();

            let ping = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"method\":\"ping\"}}\n");
            server_out.write_all(ping.as_bytes()).await.unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{}}\n")
                .await
                .unwrap();
            let reply = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"tools\":[]}}}}\n");
            server_out.write_all(reply.as_bytes()).await.unwrap();
        });

        let resp = transport.request("tools/list", None).await.unwrap();
        assert!(resp.method.is_none());
        assert!(resp.error.is_none());
        assert!(resp.result.unwrap()["tools"].as_array().unwrap().is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reports_closed_stdout() {
        let (transport, server_in, server_out) = paired();
        drop(server_out);
        // Keep the read side open so the write succeeds.
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        assert!(err.is_session_fatal());
        drop(server_in);
    }

    #[tokio::test]
    async fn test_request_after_close_fails() {
        let (transport, _server_in, _server_out) = paired();
        transport.close().await;
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_notify_omits_id() {
        let (transport, mut server_in, _server_out) = paired();
        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        let mut line = String::new();
        server_in.read_line(&mut line).await.unwrap();
        let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(msg["method"], "notifications/initialized");
        assert!(msg.get("id").is_none());
        assert!(msg.get("params").is_none());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: 1,
            method: None,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: None,
            id: 1,
            method: None,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }
}

//! Transports: how requests reach a tool server.
//!
//! [`Transport`] is a closed set of variants selected by the server's
//! `type`. Every variant exposes the same `start` / `close` / `request`
//! contract, and [`Transport::request`] applies one timeout policy to all of
//! them, so the manager never needs to know which wire protocol is in use.

mod http;
mod sse;
mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::config::{ServerConfig, TransportType};
use super::errors::McpError;
use super::types::{InitializeResult, JsonRpcResponse};

pub use http::HttpTransport;
pub use sse::{SseEvent, SseEventDecoder, SseTransport};
pub use stdio::StdioTransport;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A connection to one tool server.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Sse(SseTransport),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("server", &self.server_id())
            .finish()
    }
}

impl Transport {
    /// Build the transport for `config.type`. Nothing is opened yet.
    pub fn from_config(server_id: &str, config: &ServerConfig) -> Result<Self, McpError> {
        match config.transport {
            TransportType::Stdio => {
                let command = config.command.as_deref().ok_or(McpError::SpawnFailed {
                    name: server_id.to_string(),
                    reason: "stdio server has no command".into(),
                })?;
                Ok(Transport::Stdio(StdioTransport::new(server_id, command, config)))
            }
            TransportType::Http => {
                let url = require_url(server_id, config)?;
                Ok(Transport::Http(HttpTransport::new(
                    server_id,
                    url,
                    &config.headers,
                )?))
            }
            TransportType::Sse => {
                let url = require_url(server_id, config)?;
                Ok(Transport::Sse(SseTransport::new(
                    server_id,
                    url,
                    &config.headers,
                )?))
            }
        }
    }

    pub fn kind(&self) -> TransportType {
        match self {
            Transport::Stdio(_) => TransportType::Stdio,
            Transport::Http(_) => TransportType::Http,
            Transport::Sse(_) => TransportType::Sse,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            Transport::Stdio(t) => t.server_id(),
            Transport::Http(t) => t.server_id(),
            Transport::Sse(t) => t.server_id(),
        }
    }

    /// Open the connection and complete any protocol handshake.
    ///
    /// Bounded by `timeout_ms`; on failure the transport is closed again.
    pub async fn start(&self, timeout_ms: u64) -> Result<InitializeResult, McpError> {
        let started = async {
            match self {
                Transport::Stdio(t) => t.start().await,
                Transport::Http(t) => t.start().await,
                Transport::Sse(t) => t.start().await,
            }
        };

        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), started).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.server_id().to_string(),
                method: "initialize".into(),
                timeout_ms,
            }),
        };

        if result.is_err() {
            self.close().await;
        }
        result
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn close(&self) {
        match self {
            Transport::Stdio(t) => t.close().await,
            Transport::Http(t) => t.close().await,
            Transport::Sse(t) => t.close().await,
        }
    }

    /// Send one request and return its decoded `result`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, McpError> {
        let call = async {
            match self {
                Transport::Stdio(t) => t.request(method, params).await,
                Transport::Http(t) => t.request(method, params).await,
                Transport::Sse(t) => t.request(method, params).await,
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.server_id().to_string(),
                method: method.to_string(),
                timeout_ms,
            }),
        }
    }
}

fn require_url<'a>(server_id: &str, config: &'a ServerConfig) -> Result<&'a str, McpError> {
    config.url.as_deref().ok_or(McpError::TransportError {
        server: server_id.to_string(),
        reason: format!("{} server has no url", config.transport),
    })
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub(crate) fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// Requests awaiting a response on a shared stream (stdio stdout, SSE events).
///
/// A background reader calls [`resolve`](Self::resolve) for every response
/// it decodes. When the stream ends it calls [`fail_all`](Self::fail_all), which
/// wakes every waiter with `ConnectionClosed` and rejects new registrations
/// until [`reopen`](Self::reopen).
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    closed: AtomicBool,
}

impl PendingRequests {
    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Reserve a slot for request `id`. The slot removes itself when dropped,
    /// so a timed-out request does not leak its waiter.
    pub(crate) fn register<'a>(
        &'a self,
        id: u64,
        server: &str,
    ) -> Result<PendingSlot<'a>, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed {
                server: server.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        Ok(PendingSlot {
            pending: self,
            id,
            rx: Some(rx),
            server: server.to_string(),
        })
    }

    /// Hand a response to its waiter. Returns `false` if nobody was waiting.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        match self.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// One outstanding request registered with [`PendingRequests`].
pub(crate) struct PendingSlot<'a> {
    pending: &'a PendingRequests,
    id: u64,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
    server: String,
}

impl PendingSlot<'_> {
    pub(crate) async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        let closed = McpError::ConnectionClosed {
            server: self.server.clone(),
        };
        match self.rx.take() {
            Some(rx) => rx.await.map_err(|_| closed),
            None => Err(closed),
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let result = extract_result(response(1, serde_json::json!({"text": "hello"}))).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: Some(1),
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
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_pending_resolve_routes_by_id() {
        let pending = PendingRequests::default();
        let slot_a = pending.register(10, "s").unwrap();
        let slot_b = pending.register(11, "s").unwrap();

        assert!(pending.resolve(response(11, serde_json::json!("b"))));
        assert!(pending.resolve(response(10, serde_json::json!("a"))));
        assert!(!pending.resolve(response(12, serde_json::json!("nobody"))));

        assert_eq!(slot_a.wait().await.unwrap().result.unwrap(), "a");
        assert_eq!(slot_b.wait().await.unwrap().result.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_pending_fail_all_closes() {
        let pending = PendingRequests::default();
        let slot = pending.register(1, "s").unwrap();
        pending.fail_all();

        assert!(matches!(
            slot.wait().await.unwrap_err(),
            McpError::ConnectionClosed { .. }
        ));
        assert!(pending.register(2, "s").is_err());

        pending.reopen();
        assert!(pending.register(3, "s").is_ok());
    }

    #[test]
    fn test_dropped_slot_unregisters() {
        let pending = PendingRequests::default();
        {
            let _slot = pending.register(1, "s").unwrap();
            assert_eq!(pending.len(), 1);
        }
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_from_config_selects_variant() {
        let stdio = Transport::from_config("fs", &ServerConfig::stdio("npx", &["server"])).unwrap();
        assert_eq!(stdio.kind(), TransportType::Stdio);
        assert_eq!(stdio.server_id(), "fs");

        let http = Transport::from_config("api", &ServerConfig::http("http://localhost:1/mcp")).unwrap();
        assert_eq!(http.kind(), TransportType::Http);

        let sse = Transport::from_config("ev", &ServerConfig::sse("http://localhost:1/sse")).unwrap();
        assert_eq!(sse.kind(), TransportType::Sse);
    }

    #[test]
    fn test_from_config_requires_url() {
        let mut cfg = ServerConfig::http("http://localhost:1/mcp");
        cfg.url = None;
        assert!(Transport::from_config("api", &cfg).is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_from_start() {
        let cfg = ServerConfig::stdio("/definitely/not/a/real/binary-hydra", &[]);
        let transport = Transport::from_config("ghost", &cfg).unwrap();
        let err = transport.start(2_000).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }), "got {err:?}");
        // close after a failed start is harmless
        transport.close().await;
    }

    #[tokio::test]
    async fn test_request_before_start_fails_fast() {
        let cfg = ServerConfig::stdio("cat", &[]);
        let transport = Transport::from_config("idle", &cfg).unwrap();
        let err = transport.request("tools/list", None, 1_000).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }), "got {err:?}");
    }
}

//! Streamable-HTTP transport.
//!
//! Every request is an independent POST. Servers may answer with a plain JSON
//! body or with a short event-stream body carrying the response as `data:`.
//! A session id handed out by the server is echoed on subsequent requests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;

use super::sse::SseEventDecoder;
use super::{extract_result, next_request_id};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{InitializeResult, JsonRpcRequest, JsonRpcResponse};

/// Timeout for establishing a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session header used by streamable-HTTP servers.
const SESSION_HEADER: &str = "mcp-session-id";

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpTransport {
    server_id: String,
    url: String,
    http: HttpClient,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(build_headers(server_id, headers)?)
            .build()
            .map_err(|e| McpError::TransportError {
                server: server_id.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            http,
            session_id: Mutex::new(None),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Nothing to open: each request is its own connection.
    pub async fn start(&self) -> Result<InitializeResult, McpError> {
        tracing::debug!(server = %self.server_id, url = %self.url, "http transport ready");
        Ok(InitializeResult::default())
    }

    pub async fn close(&self) {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let body = JsonRpcRequest::new(next_request_id(), method, params);

        let mut req = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(session) = self.current_session() {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req.send().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("request failed: {e}"),
        })?;

        let status = resp.status();
        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.remember_session(session);
        }
        let is_event_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = resp.text().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(McpError::HttpError {
                server: self.server_id.clone(),
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY),
            });
        }

        let response = if is_event_stream {
            self.response_from_event_stream(&text)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).map_err(|e| {
                McpError::TransportError {
                    server: self.server_id.clone(),
                    reason: format!("invalid JSON-RPC response: {e}"),
                }
            })?
        };

        extract_result(response)
    }

    /// First event whose data parses as a JSON-RPC response.
    fn response_from_event_stream(&self, body: &str) -> Result<JsonRpcResponse, McpError> {
        let mut decoder = SseEventDecoder::default();
        let mut events = decoder.push(body);
        events.extend(decoder.finish());

        events
            .iter()
            .filter_map(|ev| serde_json::from_str::<JsonRpcResponse>(&ev.data).ok())
            .find(|resp| resp.result.is_some() || resp.error.is_some())
            .ok_or(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "event stream contained no JSON-RPC response".into(),
            })
    }

    fn current_session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember_session(&self, session: &str) {
        let mut guard = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_deref() != Some(session) {
            tracing::debug!(server = %self.server_id, "http session established");
            *guard = Some(session.to_string());
        }
    }
}

/// Turn configured headers into a `HeaderMap`, rejecting invalid names/values.
pub(super) fn build_headers(
    server_id: &str,
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let invalid = |what: &str| McpError::TransportError {
            server: server_id.to_string(),
            reason: format!("invalid header {what} for '{name}'"),
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid("name"))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid("value"))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

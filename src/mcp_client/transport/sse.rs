//! Legacy HTTP+SSE transport.
//!
//! The client opens a long-lived GET event stream. The server's first
//! `endpoint` event names the URL to POST requests to; responses come back
//! asynchronously as `message` events on the stream and are routed by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::http::build_headers;
use super::{extract_result, next_request_id, PendingRequests};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    initialize_params, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Event Decoder ───────────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Feed it chunks as they arrive; it buffers raw bytes across chunk
/// boundaries and yields every event completed by a blank line. Bytes are
/// only decoded as UTF-8 once a whole event is buffered, so a character split
/// between two chunks survives intact.
#[derive(Debug, Default)]
pub struct SseEventDecoder {
    buffer: Vec<u8>,
}

impl SseEventDecoder {
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk.as_ref());
        if self.buffer.contains(&b'\r') {
            strip_carriage_returns(&mut self.buffer);
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event(String::from_utf8_lossy(&rest).trim_end())
    }
}

/// `\r\n` → `\n`. A trailing `\r` is kept until its `\n` arrives.
fn strip_carriage_returns(buffer: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(buffer.len());
    let mut bytes = buffer.iter().peekable();
    while let Some(&b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    *buffer = out;
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            // id / retry carry nothing we use
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub struct SseTransport {
    server_id: String,
    url: String,
    http: HttpClient,
    endpoint: Mutex<Option<Url>>,
    pending: Arc<PendingRequests>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
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
            endpoint: Mutex::new(None),
            pending: Arc::new(PendingRequests::default()),
            reader: Mutex::new(None),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Open the event stream, wait for the POST endpoint, then handshake.
    pub async fn start(&self) -> Result<InitializeResult, McpError> {
        let base = Url::parse(&self.url).map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("invalid url '{}': {e}", self.url),
        })?;

        let resp = self
            .http
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to open event stream: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::HttpError {
                server: self.server_id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        self.pending.reopen();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(
            self.server_id.clone(),
            base,
            resp,
            endpoint_tx,
            self.pending.clone(),
        ));
        if let Some(old) = self.lock_reader().replace(reader) {
            old.abort();
        }

        let endpoint = endpoint_rx.await.map_err(|_| McpError::ConnectionClosed {
            server: self.server_id.clone(),
        })?;
        tracing::debug!(server = %self.server_id, endpoint = %endpoint, "sse endpoint received");
        *self.lock_endpoint() = Some(endpoint);

        let result = self.request("initialize", Some(initialize_params())).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        self.post(&JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        tracing::info!(server = %self.server_id, url = %self.url, "sse server connected");
        Ok(init)
    }

    pub async fn close(&self) {
        if let Some(reader) = self.lock_reader().take() {
            reader.abort();
        }
        self.lock_endpoint().take();
        self.pending.fail_all();
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let slot = self.pending.register(id, &self.server_id)?;

        let body = self.post(&JsonRpcRequest::new(id, method, params)).await?;
        // Some servers answer inline instead of on the stream.
        if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&body) {
            if resp.id == Some(id) {
                drop(slot);
                return extract_result(resp);
            }
        }

        extract_result(slot.wait().await?)
    }

    /// POST a message to the endpoint and return the response body.
    async fn post<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let endpoint = self
            .lock_endpoint()
            .clone()
            .ok_or(McpError::ConnectionClosed {
                server: self.server_id.clone(),
            })?;

        let resp = self
            .http
            .post(endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("request failed: {e}"),
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(McpError::HttpError {
                server: self.server_id.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn lock_endpoint(&self) -> std::sync::MutexGuard<'_, Option<Url>> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consume the event stream until it ends.
async fn read_events(
    server_id: String,
    base: Url,
    resp: reqwest::Response,
    endpoint_tx: oneshot::Sender<Url>,
    pending: Arc<PendingRequests>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseEventDecoder::default();
    let mut stream = resp.bytes_stream();

    loop {
        let events = match stream.next().await {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => {
                tracing::warn!(server = %server_id, error = %e, "event stream read error");
                break;
            }
            None => {
                let tail: Vec<SseEvent> = decoder.finish().into_iter().collect();
                dispatch(&server_id, &base, tail, &mut endpoint_tx, &pending);
                tracing::warn!(server = %server_id, "event stream closed");
                break;
            }
        };
        dispatch(&server_id, &base, events, &mut endpoint_tx, &pending);
    }

    pending.fail_all();
}

fn dispatch(
    server_id: &str,
    base: &Url,
    events: Vec<SseEvent>,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
    pending: &PendingRequests,
) {
    for event in events {
        match event.kind() {
            "endpoint" => match base.join(event.data.trim()) {
                Ok(url) => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(url);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "invalid endpoint event");
                }
            },
            "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(resp) if resp.id.is_some() => {
                    pending.resolve(resp);
                }
                Ok(_) => tracing::trace!(server = %server_id, "ignoring server notification"),
                Err(e) => {
                    tracing::debug!(server = %server_id, error = %e, "unparseable message event");
                }
            },
            other => tracing::trace!(server = %server_id, event = other, "ignoring event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_decoder_splits_across_chunks() {
        let mut decoder = SseEventDecoder::default();
        assert!(decoder.push("event: endpoint\nda").is_empty());
        let events = decoder.push("ta: /messages?session=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
    }

    #[test]
    fn test_decoder_crlf_and_multiline_data() {
        let mut decoder = SseEventDecoder::default();
        let events = decoder.push("data: line1\r\ndata: line2\r\n\r\n: keepalive\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].kind(), "message");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_decoder_ignores_id_and_retry() {
        let mut decoder = SseEventDecoder::default();
        let events = decoder.push("id: 4\nretry: 1000\n\nevent: message\nid: 5\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_decoder_keeps_multibyte_char_split_across_chunks() {
        let payload = "data: {\"text\":\"café\"}\n\n".as_bytes();
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseEventDecoder::default();
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"café\"}");
    }

    #[test]
    fn test_decoder_crlf_split_across_chunks() {
        let mut decoder = SseEventDecoder::default();
        assert!(decoder.push("data: a\r").is_empty());
        assert!(decoder.push("\n\r").is_empty());
        let events = decoder.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
    }

    #[test]
    fn test_decoder_finish_flushes_tail() {
        let mut decoder = SseEventDecoder::default();
        assert!(decoder.push("data: tail").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_dispatch_resolves_relative_endpoint() {
        let base = Url::parse("http://localhost:9000/sse").unwrap();
        let pending = PendingRequests::default();
        let (tx, mut rx) = oneshot::channel();
        let mut tx = Some(tx);
        let events = vec![SseEvent {
            event: Some("endpoint".into()),
            data: "/messages?sessionId=42".into(),
        }];

        dispatch("s", &base, events, &mut tx, &pending);
        let url = rx.try_recv().unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/messages?sessionId=42");
        assert!(tx.is_none());
    }

    #[tokio::test]
    async fn test_stream_without_endpoint_fails_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(": hello\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = SseTransport::new("ev", &server.uri(), &HashMap::new()).unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }), "got {err:?}");
        transport.close().await;
    }

    #[tokio::test]
    async fn test_stream_rejected_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = SseTransport::new("ev", &server.uri(), &HashMap::new()).unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, McpError::HttpError { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_request_before_start_is_connection_closed() {
        let transport =
            SseTransport::new("ev", "http://127.0.0.1:1/sse", &HashMap::new()).unwrap();
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }
}

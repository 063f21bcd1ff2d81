//! MCP Client error types.
//!
//! One enum covers every failure the connection manager can surface. The
//! variants fall into four groups (see [`ErrorCategory`]): config-time,
//! invariant violations, availability, and transport failures.

use thiserror::Error;

/// Coarse classification of an [`McpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration could not be loaded. Fatal to `initialize()`.
    Config,
    /// Caller misuse or registry/transport desynchronization.
    Invariant,
    /// Expected runtime condition (server not connected or disabled).
    Availability,
    /// Connection refused, timeout, protocol error.
    Transport,
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The configuration file does not exist.
    #[error("config file not found: {path}")]
    ConfigNotFound { path: String },

    /// The configuration file could not be parsed.
    #[error("failed to parse config {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    /// The configuration violates the schema. Each message is path-qualified
    /// (e.g. `servers.test.type: ...`).
    #[error("invalid config: {}", errors.join("; "))]
    ConfigValidation { errors: Vec<String> },

    /// Any other I/O failure while reading configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The server id is not in the registry.
    #[error("Server not registered: {id}")]
    ServerNotRegistered { id: String },

    /// The server id is already in the registry.
    #[error("Server already registered: {id}")]
    AlreadyRegistered { id: String },

    /// The server is not connected or is disabled.
    #[error("Server not available: {id}")]
    ServerNotAvailable { id: String },

    /// The entry is CONNECTED but has no transport attached.
    #[error("No transport for server: {id}")]
    NoTransport { id: String },

    /// A qualified tool id did not match `mcp__{server}__{tool}`.
    #[error("Invalid tool ID format: {tool_id}")]
    InvalidToolId { tool_id: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The underlying connection closed while a request was pending.
    #[error("connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    /// Non-2xx HTTP response from an http/sse server.
    #[error("HTTP {status} from server '{server}': {body}")]
    HttpError {
        server: String,
        status: u16,
        body: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete within its timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
}

impl McpError {
    /// Which group of the error taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            McpError::ConfigNotFound { .. }
            | McpError::ConfigParse { .. }
            | McpError::ConfigValidation { .. }
            | McpError::ConfigError { .. } => ErrorCategory::Config,
            McpError::ServerNotRegistered { .. }
            | McpError::AlreadyRegistered { .. }
            | McpError::NoTransport { .. }
            | McpError::InvalidToolId { .. } => ErrorCategory::Invariant,
            McpError::ServerNotAvailable { .. } => ErrorCategory::Availability,
            McpError::SpawnFailed { .. }
            | McpError::TransportError { .. }
            | McpError::ConnectionClosed { .. }
            | McpError::HttpError { .. }
            | McpError::ServerError { .. }
            | McpError::Timeout { .. } => ErrorCategory::Transport,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. }
                | McpError::ConnectionClosed { .. }
                | McpError::TransportError { .. }
                | McpError::SpawnFailed { .. }
        ) || matches!(self, McpError::HttpError { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_match_public_wording() {
        let err = McpError::ServerNotRegistered { id: "fs".into() };
        assert_eq!(err.to_string(), "Server not registered: fs");

        let err = McpError::InvalidToolId {
            tool_id: "not-a-valid-id".into(),
        };
        assert!(err.to_string().starts_with("Invalid tool ID format"));

        let err = McpError::ServerNotAvailable { id: "fs".into() };
        assert!(err.to_string().contains("Server not available"));
    }

    #[test]
    fn test_validation_message_joins_paths() {
        let err = McpError::ConfigValidation {
            errors: vec![
                "servers.a.type: required".into(),
                "servers.b.url: required".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("servers.a.type"));
        assert!(msg.contains("servers.b.url"));
    }

    #[test]
    fn test_category() {
        assert_eq!(
            McpError::ConfigNotFound { path: "x".into() }.category(),
            ErrorCategory::Config
        );
        assert_eq!(
            McpError::NoTransport { id: "x".into() }.category(),
            ErrorCategory::Invariant
        );
        assert_eq!(
            McpError::ServerNotAvailable { id: "x".into() }.category(),
            ErrorCategory::Availability
        );
        assert_eq!(
            McpError::Timeout {
                server: "x".into(),
                method: "tools/call".into(),
                timeout_ms: 10,
            }
            .category(),
            ErrorCategory::Transport
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(McpError::ConnectionClosed { server: "s".into() }.is_transient());
        assert!(McpError::HttpError {
            server: "s".into(),
            status: 503,
            body: String::new(),
        }
        .is_transient());
        assert!(!McpError::HttpError {
            server: "s".into(),
            status: 404,
            body: String::new(),
        }
        .is_transient());
        assert!(!McpError::InvalidToolId {
            tool_id: "x".into()
        }
        .is_transient());
    }
}

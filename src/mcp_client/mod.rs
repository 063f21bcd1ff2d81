//! MCP Client: connection manager for external tool servers.
//!
//! This module handles:
//! - Loading, validating and hot-reloading the server config file
//! - Connecting to servers over stdio, streamable HTTP or legacy SSE
//! - Tool discovery and routing by qualified id (`mcp__{server}__{tool}`)
//! - Health probing, call statistics and lifecycle events
//!
//! [`McpClientManager`] is the entry point; everything else is exposed for
//! callers that need finer control or richer status.

pub mod config;
pub mod errors;
pub mod events;
pub mod global;
pub mod health;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigLoader, McpConfig, ServerConfig, TransportType};
pub use errors::{ErrorCategory, McpError};
pub use events::{EventBus, McpEvent};
pub use global::{get_mcp_client_manager, initialize_mcp_client_manager, reset_mcp_client_manager};
pub use health::{HealthChecker, HealthResult, HealthStatus, HealthSummary};
pub use manager::{ConnectAllResult, ManagerOptions, McpClientManager};
pub use registry::{RegisteredTool, RegistryStats, ServerRegistry, ServerState, ServerStatus};
pub use transport::Transport;
pub use types::McpToolDefinition;

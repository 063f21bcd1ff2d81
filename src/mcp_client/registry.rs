//! Server registry: one entry per configured server.
//!
//! Provides:
//! - The connection state machine (`update_state` is the only mutator)
//! - Tool lookup by qualified id (`mcp__{server}__{tool}`)
//! - Per-server call statistics with a bounded error history
//!
//! The registry does no I/O. The manager holds it behind a lock and never
//! keeps that lock across a transport call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::{ServerConfig, TransportType};
use super::errors::McpError;
use super::events::{EventBus, McpEvent};
use super::health::HealthResult;
use super::transport::Transport;
use super::types::{McpPrompt, McpResource, McpToolDefinition};

/// Prefix of every qualified tool id.
pub const TOOL_ID_PREFIX: &str = "mcp__";

/// Separator between server id and tool name in a qualified id.
pub const TOOL_ID_SEPARATOR: &str = "__";

/// Errors retained per server.
pub const MAX_RECENT_ERRORS: usize = 10;

// ─── Qualified Tool IDs ──────────────────────────────────────────────────────

/// Build the qualified id for a server-local tool name.
pub fn qualified_tool_id(server_id: &str, tool_name: &str) -> String {
    format!("{TOOL_ID_PREFIX}{server_id}{TOOL_ID_SEPARATOR}{tool_name}")
}

/// Split `mcp__{server}__{tool}` into `(server, tool)`.
///
/// Server ids cannot contain `__`, so the first separator after the prefix
/// is the boundary. Tool names may contain `__`.
pub fn parse_qualified_tool_id(tool_id: &str) -> Option<(&str, &str)> {
    let rest = tool_id.strip_prefix(TOOL_ID_PREFIX)?;
    let (server, tool) = rest.split_once(TOOL_ID_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Connection state of a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Disconnected => "DISCONNECTED",
            ServerState::Connecting => "CONNECTING",
            ServerState::Connected => "CONNECTED",
            ServerState::Reconnecting => "RECONNECTING",
            ServerState::Error => "ERROR",
        };
        f.pad(s)
    }
}

/// Optional side data for [`ServerRegistry::update_state`].
#[derive(Debug, Default)]
pub struct StateUpdate {
    /// Stored as the entry's `last_error`.
    pub error: Option<String>,
    /// Attached to the entry. Without one, any state but `Connected` drops
    /// the current transport.
    pub transport: Option<Arc<Transport>>,
}

impl StateUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            transport: None,
        }
    }

    pub fn transport(transport: Arc<Transport>) -> Self {
        Self {
            error: None,
            transport: Some(transport),
        }
    }
}

// ─── Statistics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Fixed-capacity error history; the oldest record is evicted first.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ErrorRing {
    records: VecDeque<ErrorRecord>,
}

impl ErrorRing {
    pub fn push(&mut self, message: &str) {
        if self.records.len() == MAX_RECENT_ERRORS {
            self.records.pop_front();
        }
        self.records.push_back(ErrorRecord {
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_latency_ms: u64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub recent_errors: ErrorRing,
}

// ─── ServerEntry ─────────────────────────────────────────────────────────────

/// Everything the manager knows about one server.
#[derive(Debug)]
pub struct ServerEntry {
    pub id: String,
    pub config: ServerConfig,
    pub state: ServerState,
    pub transport: Option<Arc<Transport>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_result: Option<HealthResult>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub tools: Vec<McpToolDefinition>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
    pub stats: ServerStats,
}

impl ServerEntry {
    fn new(id: &str, config: ServerConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            state: ServerState::Disconnected,
            transport: None,
            connected_at: None,
            last_health_check: None,
            health_result: None,
            last_error: None,
            reconnect_attempts: 0,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            stats: ServerStats::default(),
        }
    }

    /// Connected and enabled.
    pub fn is_available(&self) -> bool {
        self.state == ServerState::Connected && self.config.enabled
    }

    /// Mean latency of successful calls in ms; 0 when there are none.
    pub fn average_latency(&self) -> f64 {
        if self.stats.successful_calls == 0 {
            return 0.0;
        }
        self.stats.total_latency_ms as f64 / self.stats.successful_calls as f64
    }

    /// Percentage of successful calls; 100 when no calls were made.
    pub fn success_rate(&self) -> f64 {
        if self.stats.total_calls == 0 {
            return 100.0;
        }
        self.stats.successful_calls as f64 / self.stats.total_calls as f64 * 100.0
    }

    pub fn record_success(&mut self, latency_ms: u64) {
        self.stats.total_calls += 1;
        self.stats.successful_calls += 1;
        self.stats.total_latency_ms += latency_ms;
        self.stats.last_call_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &str) {
        self.stats.total_calls += 1;
        self.stats.failed_calls += 1;
        self.stats.last_call_at = Some(Utc::now());
        self.stats.recent_errors.push(error);
    }

    pub fn record_health(&mut self, result: HealthResult) {
        self.last_health_check = Some(result.checked_at);
        self.health_result = Some(result);
    }

    /// Serializable snapshot for status reporting.
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.id.clone(),
            state: self.state,
            transport: self.config.transport,
            enabled: self.config.enabled,
            description: self.config.description.clone(),
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            tool_count: self.tools.len(),
            resource_count: self.resources.len(),
            prompt_count: self.prompts.len(),
            health: self.health_result.clone(),
            success_rate: self.success_rate(),
            average_latency_ms: self.average_latency(),
            stats: self.stats.clone(),
        }
    }
}

/// Point-in-time view of a [`ServerEntry`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub id: String,
    pub state: ServerState,
    pub transport: TransportType,
    pub enabled: bool,
    pub description: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub health: Option<HealthResult>,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub stats: ServerStats,
}

/// A tool together with the server that provides it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    pub qualified_id: String,
    pub server_id: String,
    #[serde(flatten)]
    pub tool: McpToolDefinition,
}

/// Counts per state plus the number of indexed tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub disconnected: usize,
    pub connecting: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub error: usize,
    pub tools: usize,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ServerRegistry {
    entries: HashMap<String, ServerEntry>,
    /// `qualified tool id → server id`.
    tool_index: HashMap<String, String>,
    default_id: Option<String>,
    events: EventBus,
}

impl ServerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: HashMap::new(),
            tool_index: HashMap::new(),
            default_id: None,
            events,
        }
    }

    /// Add a server in the `Disconnected` state.
    ///
    /// The first registered server becomes the default unless a later
    /// registration passes `is_default`.
    pub fn register(
        &mut self,
        id: &str,
        config: ServerConfig,
        is_default: bool,
    ) -> Result<(), McpError> {
        if self.entries.contains_key(id) {
            return Err(McpError::AlreadyRegistered { id: id.to_string() });
        }

        self.entries.insert(id.to_string(), ServerEntry::new(id, config));
        if is_default || self.default_id.is_none() {
            self.default_id = Some(id.to_string());
        }

        tracing::debug!(server = %id, is_default, "registered server");
        self.events.emit(McpEvent::ServerRegistered { id: id.to_string() });
        Ok(())
    }

    /// Remove a server and its tool mappings. Returns `false` if unknown.
    pub fn unregister(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        self.tool_index.retain(|_, server| server != id);

        if self.default_id.as_deref() == Some(id) {
            self.default_id = self.entries.keys().min().cloned();
        }

        tracing::debug!(server = %id, "unregistered server");
        self.events
            .emit(McpEvent::ServerUnregistered { id: id.to_string() });
        true
    }

    /// Move a server to `state`. The only way an entry's state changes.
    pub fn update_state(
        &mut self,
        id: &str,
        state: ServerState,
        update: StateUpdate,
    ) -> Result<(), McpError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| McpError::ServerNotRegistered { id: id.to_string() })?;

        let previous = entry.state;
        entry.state = state;

        match state {
            ServerState::Connected => {
                entry.connected_at = Some(Utc::now());
                entry.reconnect_attempts = 0;
                entry.last_error = None;
            }
            ServerState::Reconnecting => entry.reconnect_attempts += 1,
            _ => {}
        }

        if let Some(error) = update.error {
            entry.last_error = Some(error);
        }
        match update.transport {
            Some(transport) => entry.transport = Some(transport),
            None if state != ServerState::Connected => {
                entry.transport = None;
                entry.connected_at = None;
            }
            None => {}
        }

        if previous != state {
            tracing::info!(server = %id, from = %previous, to = %state, "server state changed");
        }
        self.events.emit(McpEvent::ServerStateChanged {
            id: id.to_string(),
            previous,
            current: state,
        });
        Ok(())
    }

    /// Detach and return the entry's transport without changing its state.
    pub fn take_transport(&mut self, id: &str) -> Option<Arc<Transport>> {
        self.entries.get_mut(id).and_then(|e| e.transport.take())
    }

    /// Replace the server's tools and rebuild its index entries.
    pub fn register_tools(
        &mut self,
        id: &str,
        tools: Vec<McpToolDefinition>,
    ) -> Result<(), McpError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| McpError::ServerNotRegistered { id: id.to_string() })?;

        self.tool_index.retain(|_, server| server != id);
        for tool in &tools {
            self.tool_index
                .insert(qualified_tool_id(id, &tool.name), id.to_string());
        }

        let count = tools.len();
        entry.tools = tools;

        tracing::debug!(server = %id, count, "registered tools");
        self.events.emit(McpEvent::ToolsDiscovered {
            id: id.to_string(),
            count,
        });
        Ok(())
    }

    pub fn register_resources(
        &mut self,
        id: &str,
        resources: Vec<McpResource>,
    ) -> Result<(), McpError> {
        self.entry_mut(id)?.resources = resources;
        Ok(())
    }

    pub fn register_prompts(&mut self, id: &str, prompts: Vec<McpPrompt>) -> Result<(), McpError> {
        self.entry_mut(id)?.prompts = prompts;
        Ok(())
    }

    /// Server owning a qualified tool id.
    pub fn find_server_for_tool(&self, qualified_id: &str) -> Option<&ServerEntry> {
        self.tool_index
            .get(qualified_id)
            .and_then(|id| self.entries.get(id))
    }

    /// Every registered tool, optionally restricted to available servers.
    /// Sorted by qualified id.
    pub fn all_tools(&self, only_available: bool) -> Vec<RegisteredTool> {
        let mut tools: Vec<RegisteredTool> = self
            .entries
            .values()
            .filter(|e| !only_available || e.is_available())
            .flat_map(|e| {
                e.tools.iter().map(|tool| RegisteredTool {
                    qualified_id: qualified_tool_id(&e.id, &tool.name),
                    server_id: e.id.clone(),
                    tool: tool.clone(),
                })
            })
            .collect();
        tools.sort_by(|a, b| a.qualified_id.cmp(&b.qualified_id));
        tools
    }

    pub fn by_tag(&self, tag: &str) -> Vec<&ServerEntry> {
        self.sorted(|e| e.config.has_tag(tag))
    }

    pub fn by_state(&self, state: ServerState) -> Vec<&ServerEntry> {
        self.sorted(|e| e.state == state)
    }

    /// All entries sorted by id.
    pub fn list(&self) -> Vec<&ServerEntry> {
        self.sorted(|_| true)
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|e| e.id.clone()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.entries.len(),
            tools: self.tool_index.len(),
            ..RegistryStats::default()
        };
        for entry in self.entries.values() {
            match entry.state {
                ServerState::Disconnected => stats.disconnected += 1,
                ServerState::Connecting => stats.connecting += 1,
                ServerState::Connected => stats.connected += 1,
                ServerState::Reconnecting => stats.reconnecting += 1,
                ServerState::Error => stats.error += 1,
            }
        }
        stats
    }

    pub fn get(&self, id: &str) -> Option<&ServerEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServerEntry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_server(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    pub fn set_default(&mut self, id: &str) -> Result<(), McpError> {
        if !self.entries.contains_key(id) {
            return Err(McpError::ServerNotRegistered { id: id.to_string() });
        }
        self.default_id = Some(id.to_string());
        Ok(())
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), McpError> {
        self.entry_mut(id)?.config.enabled = enabled;
        Ok(())
    }

    /// Swap in a new config. State and transport are left alone.
    pub fn update_config(&mut self, id: &str, config: ServerConfig) -> Result<(), McpError> {
        self.entry_mut(id)?.config = config;
        Ok(())
    }

    pub fn record_health(&mut self, id: &str, result: HealthResult) -> Result<(), McpError> {
        self.entry_mut(id)?.record_health(result);
        Ok(())
    }

    /// Remove every entry. Used when the manager is torn down.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.unregister(&id);
        }
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut ServerEntry, McpError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| McpError::ServerNotRegistered { id: id.to_string() })
    }

    fn sorted(&self, keep: impl Fn(&ServerEntry) -> bool) -> Vec<&ServerEntry> {
        let mut entries: Vec<&ServerEntry> = self.entries.values().filter(|e| keep(e)).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Connection manager: the public face of the crate.
//!
//! Owns the config loader, the server registry, the health checker and the
//! event bus, and drives servers through their lifecycle:
//!
//! ```text
//! initialize → register all → connect_all (optional)
//! connect    → CONNECTING → start → CONNECTED → tools/list → monitor
//! failure    → close transport → ERROR (last_error recorded)
//! ```
//!
//! Locks on the registry and loader are never held across transport I/O.
//! Tool calls clone the entry's `Arc<Transport>` and release the lock before
//! sending.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use super::config::{default_config_path, ConfigLoader, McpConfig, ServerConfig};
use super::errors::McpError;
use super::events::{EventBus, McpEvent};
use super::health::{HealthChecker, HealthResult, HealthSummary};
use super::registry::{
    parse_qualified_tool_id, RegisteredTool, RegistryStats, ServerRegistry, ServerState,
    ServerStatus, StateUpdate,
};
use super::transport::Transport;
use super::types::{ListPromptsResult, ListResourcesResult, ListToolsResult, McpToolDefinition};

/// Quiet period after a file-change signal before reloading, so that an
/// editor's burst of writes triggers one reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

// ─── Options & Results ───────────────────────────────────────────────────────

/// Construction options for [`McpClientManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Config file; `None` uses [`default_config_path`].
    pub config_path: Option<PathBuf>,
    /// Connect every enabled server during `initialize()`.
    pub auto_connect: bool,
    /// Reload and reconcile when the config file changes.
    pub watch_config: bool,
    /// Server to mark as default instead of the first registered one.
    pub default_server: Option<String>,
    /// Consulted before the process environment during `${VAR}` interpolation.
    pub env_overrides: HashMap<String, String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            auto_connect: true,
            watch_config: false,
            default_server: None,
            env_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of [`McpClientManager::connect_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectAllResult {
    pub connected: Vec<String>,
    pub failed: Vec<ConnectFailure>,
}

// ─── McpClientManager ────────────────────────────────────────────────────────

struct ManagerInner {
    options: ManagerOptions,
    events: EventBus,
    loader: RwLock<ConfigLoader>,
    registry: RwLock<ServerRegistry>,
    health: HealthChecker,
    initialized: AtomicBool,
    /// Serializes `initialize` and `shutdown`.
    lifecycle: tokio::sync::Mutex<()>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a connection manager. Clones share the same state.
#[derive(Clone)]
pub struct McpClientManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for McpClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClientManager")
            .field("config_path", &self.inner.options.config_path)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl McpClientManager {
    pub fn new(mut options: ManagerOptions) -> Self {
        let path = options
            .config_path
            .get_or_insert_with(default_config_path)
            .clone();
        let events = EventBus::new();
        let loader = ConfigLoader::new(path, events.clone())
            .with_env_overrides(options.env_overrides.clone());

        Self {
            inner: Arc::new(ManagerInner {
                registry: RwLock::new(ServerRegistry::new(events.clone())),
                loader: RwLock::new(loader),
                health: HealthChecker::new(),
                events,
                options,
                initialized: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// Whether two handles refer to the same manager.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn config_path(&self) -> &Path {
        self.inner
            .options
            .config_path
            .as_deref()
            .unwrap_or_else(|| Path::new(""))
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.inner.events.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Load config and register servers. Idempotent.
    ///
    /// Config errors are fatal. Connection failures during auto-connect are
    /// not: they are logged and left in the `Error` state.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let config = self.inner.loader.write().await.load().await?;
        {
            let mut registry = self.inner.registry.write().await;
            for (id, server) in &config.servers {
                if registry.contains(id) {
                    continue;
                }
                registry.register(id, server.clone(), false)?;
            }
            if let Some(default) = self.inner.options.default_server.as_deref() {
                if let Err(e) = registry.set_default(default) {
                    tracing::warn!(server = %default, error = %e, "default server not in config");
                }
            }
        }
        self.inner.initialized.store(true, Ordering::SeqCst);

        if self.inner.options.watch_config {
            if let Err(e) = self.start_watching().await {
                tracing::warn!(error = %e, "config watching unavailable");
            }
        }

        if self.inner.options.auto_connect {
            let result = self.connect_all().await;
            tracing::info!(
                connected = result.connected.len(),
                failed = result.failed.len(),
                "auto-connect finished"
            );
        }

        let server_count = config.servers.len();
        tracing::info!(servers = server_count, "MCP client manager initialized");
        self.inner
            .events
            .emit(McpEvent::Initialized { server_count });
        Ok(())
    }

    /// Stop watching and monitoring, disconnect everything and forget all
    /// servers. `initialize()` may be called again afterwards.
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.inner.loader.write().await.stop_watching();
        if let Some(task) = self.watch_task().take() {
            task.abort();
        }
        self.inner.health.stop_all_monitoring();

        let ids = self.inner.registry.read().await.ids();
        futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
        self.inner.registry.write().await.clear();

        self.inner.initialized.store(false, Ordering::SeqCst);
        tracing::info!("MCP client manager shut down");
        self.inner.events.emit(McpEvent::Shutdown);
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Connect one server and discover its tools.
    ///
    /// Disabled servers and servers already connected or connecting are left
    /// alone. On failure the transport is closed, the entry moves to `Error`
    /// and the error is returned.
    pub async fn connect(&self, id: &str) -> Result<(), McpError> {
        let config = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get(id)
                .ok_or_else(|| McpError::ServerNotRegistered { id: id.to_string() })?;
            if !entry.config.enabled {
                tracing::debug!(server = %id, "skipping disabled server");
                return Ok(());
            }
            match entry.state {
                ServerState::Connected => return Ok(()),
                ServerState::Connecting => {
                    tracing::debug!(server = %id, "connect already in progress");
                    return Ok(());
                }
                _ => {}
            }
            let config = entry.config.clone();
            registry.update_state(id, ServerState::Connecting, StateUpdate::default())?;
            config
        };

        let transport = match Transport::from_config(id, &config) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.mark_failed(id, &e).await;
                return Err(e);
            }
        };

        match self.establish(id, &transport, &config).await {
            Ok(tool_count) => {
                if config.health_check.enabled {
                    let weak = Arc::downgrade(&self.inner);
                    let server_id = id.to_string();
                    self.inner.health.start_monitoring(
                        id,
                        transport.clone(),
                        config.health_check.clone(),
                        move |result| {
                            let weak = weak.clone();
                            let server_id = server_id.clone();
                            async move {
                                let Some(inner) = weak.upgrade() else {
                                    return;
                                };
                                let mut registry = inner.registry.write().await;
                                if registry.contains(&server_id) {
                                    let _ = registry.record_health(&server_id, result);
                                }
                            }
                        },
                    );
                }
                tracing::info!(
                    server = %id,
                    transport = %config.transport,
                    tools = tool_count,
                    "connected to MCP server"
                );
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                self.mark_failed(id, &e).await;
                Err(e)
            }
        }
    }

    /// Start the transport, mark the entry connected and discover tools.
    async fn establish(
        &self,
        id: &str,
        transport: &Arc<Transport>,
        config: &ServerConfig,
    ) -> Result<usize, McpError> {
        let init = transport.start(config.timeout).await?;

        self.inner.registry.write().await.update_state(
            id,
            ServerState::Connected,
            StateUpdate::transport(transport.clone()),
        )?;

        let tools = transport
            .request("tools/list", None, config.timeout)
            .await
            .and_then(|v| decode::<ListToolsResult>(id, "tools/list", v))?
            .tools;
        let tool_count = tools.len();
        self.inner.registry.write().await.register_tools(id, tools)?;

        if init.advertises("resources") {
            match transport
                .request("resources/list", None, config.timeout)
                .await
                .and_then(|v| decode::<ListResourcesResult>(id, "resources/list", v))
            {
                Ok(list) => {
                    self.inner
                        .registry
                        .write()
                        .await
                        .register_resources(id, list.resources)?;
                }
                Err(e) => tracing::debug!(server = %id, error = %e, "resources/list failed"),
            }
        }
        if init.advertises("prompts") {
            match transport
                .request("prompts/list", None, config.timeout)
                .await
                .and_then(|v| decode::<ListPromptsResult>(id, "prompts/list", v))
            {
                Ok(list) => {
                    self.inner
                        .registry
                        .write()
                        .await
                        .register_prompts(id, list.prompts)?;
                }
                Err(e) => tracing::debug!(server = %id, error = %e, "prompts/list failed"),
            }
        }

        Ok(tool_count)
    }

    async fn mark_failed(&self, id: &str, error: &McpError) {
        tracing::warn!(server = %id, error = %error, "failed to connect to MCP server");
        let mut registry = self.inner.registry.write().await;
        if registry.contains(id) {
            let _ = registry.update_state(id, ServerState::Error, StateUpdate::error(error.to_string()));
        }
    }

    /// Connect every enabled server that is not already connected,
    /// concurrently. One server failing never affects the others.
    pub async fn connect_all(&self) -> ConnectAllResult {
        let targets: Vec<String> = {
            let registry = self.inner.registry.read().await;
            registry
                .list()
                .into_iter()
                .filter(|e| e.config.enabled && e.state != ServerState::Connected)
                .map(|e| e.id.clone())
                .collect()
        };

        let outcomes =
            futures::future::join_all(targets.iter().map(|id| self.connect(id))).await;

        let mut result = ConnectAllResult::default();
        for (id, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => result.connected.push(id),
                Err(e) => result.failed.push(ConnectFailure {
                    id,
                    error: e.to_string(),
                }),
            }
        }
        result
    }

    /// Close the server's transport and move it to `Disconnected`.
    /// Unknown ids are ignored.
    pub async fn disconnect(&self, id: &str) {
        self.inner.health.stop_monitoring(id);
        self.inner.health.clear(id);

        let transport = {
            let mut registry = self.inner.registry.write().await;
            let Some(entry) = registry.get(id) else {
                return;
            };
            if entry.state == ServerState::Disconnected && entry.transport.is_none() {
                return;
            }
            registry.take_transport(id)
        };

        if let Some(transport) = transport {
            transport.close().await;
        }

        let mut registry = self.inner.registry.write().await;
        if registry.contains(id) {
            let _ = registry.update_state(id, ServerState::Disconnected, StateUpdate::default());
            tracing::info!(server = %id, "disconnected from MCP server");
        }
    }

    /// Caller-driven reconnection with the server's retry backoff.
    ///
    /// Each attempt moves the entry to `Reconnecting`, waits
    /// `min(baseDelay × multiplier^attempt, maxDelay)` and connects. Returns
    /// the last error once `maxRetries` attempts have failed.
    pub async fn reconnect(&self, id: &str) -> Result<(), McpError> {
        let retry = {
            let registry = self.inner.registry.read().await;
            let entry = registry
                .get(id)
                .ok_or_else(|| McpError::ServerNotRegistered { id: id.to_string() })?;
            if !entry.config.enabled {
                return Err(McpError::ServerNotAvailable { id: id.to_string() });
            }
            entry.config.retry.clone()
        };

        self.disconnect(id).await;

        let mut last_error = None;
        for attempt in 0..retry.max_retries.max(1) {
            self.inner.registry.write().await.update_state(
                id,
                ServerState::Reconnecting,
                StateUpdate::default(),
            )?;
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;

            match self.connect(id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(server = %id, attempt = attempt + 1, error = %e, "reconnect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| McpError::ServerNotAvailable { id: id.to_string() }))
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call `tools/call` on one server. Statistics are updated either way;
    /// the server's state is not changed by a failed call.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let (transport, timeout_ms) = {
            let registry = self.inner.registry.read().await;
            let entry = registry.get(server_id).ok_or_else(|| McpError::ServerNotRegistered {
                id: server_id.to_string(),
            })?;
            if !entry.is_available() {
                return Err(McpError::ServerNotAvailable {
                    id: server_id.to_string(),
                });
            }
            let transport = entry.transport.clone().ok_or_else(|| McpError::NoTransport {
                id: server_id.to_string(),
            })?;
            (transport, entry.config.timeout)
        };

        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let started = Instant::now();
        let result = transport
            .request("tools/call", Some(params), timeout_ms)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        {
            let mut registry = self.inner.registry.write().await;
            if let Some(entry) = registry.get_mut(server_id) {
                match &result {
                    Ok(_) => entry.record_success(latency_ms),
                    Err(e) => entry.record_failure(&e.to_string()),
                }
            }
        }

        match &result {
            Ok(_) => tracing::debug!(server = %server_id, tool = %tool_name, latency_ms, "tool call succeeded"),
            Err(e) => tracing::warn!(server = %server_id, tool = %tool_name, error = %e, "tool call failed"),
        }
        result
    }

    /// [`execute_tool`](Self::execute_tool) addressed by `mcp__{server}__{tool}`.
    pub async fn execute_tool_by_id(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let (server_id, tool_name) =
            parse_qualified_tool_id(tool_id).ok_or_else(|| McpError::InvalidToolId {
                tool_id: tool_id.to_string(),
            })?;
        self.execute_tool(server_id, tool_name, arguments).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Tools of every available server, sorted by qualified id.
    pub async fn list_tools(&self) -> Vec<RegisteredTool> {
        self.inner.registry.read().await.all_tools(true)
    }

    /// Tools discovered on `id`. Empty for unknown servers.
    pub async fn server_tools(&self, id: &str) -> Vec<McpToolDefinition> {
        self.inner
            .registry
            .read()
            .await
            .get(id)
            .map(|e| e.tools.clone())
            .unwrap_or_default()
    }

    /// Probe a server (or return its cached result) and record it on the
    /// entry. `None` for unknown servers.
    pub async fn check_health(&self, id: &str, force_refresh: bool) -> Option<HealthResult> {
        let (transport, config) = {
            let registry = self.inner.registry.read().await;
            let entry = registry.get(id)?;
            (entry.transport.clone(), entry.config.health_check.clone())
        };

        let health = &self.inner.health;
        let result = if force_refresh {
            health.refresh(id, transport.as_ref(), &config).await
        } else {
            health.check(id, transport.as_ref(), &config).await
        };

        let mut registry = self.inner.registry.write().await;
        if registry.contains(id) {
            let _ = registry.record_health(id, result.clone());
        }
        Some(result)
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.inner.health.summary()
    }

    pub async fn server_status(&self, id: &str) -> Option<ServerStatus> {
        let registry = self.inner.registry.read().await;
        registry.get(id).map(|e| self.with_latest_health(e.status()))
    }

    /// Status of every registered server, sorted by id.
    pub async fn servers(&self) -> Vec<ServerStatus> {
        let registry = self.inner.registry.read().await;
        registry
            .list()
            .into_iter()
            .map(|e| self.with_latest_health(e.status()))
            .collect()
    }

    /// Ids of the servers carrying `tag`.
    pub async fn servers_by_tag(&self, tag: &str) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        registry.by_tag(tag).into_iter().map(|e| e.id.clone()).collect()
    }

    /// Ids listed in config group `name` that exist. Empty if no such group.
    pub async fn servers_in_group(&self, name: &str) -> Vec<String> {
        let loader = self.inner.loader.read().await;
        loader
            .servers_by_group(name)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.read().await.stats()
    }

    pub async fn default_server(&self) -> Option<String> {
        self.inner
            .registry
            .read()
            .await
            .default_server()
            .map(str::to_string)
    }

    /// The configuration currently in effect.
    pub async fn config(&self) -> Option<Arc<McpConfig>> {
        self.inner.loader.read().await.config()
    }

    fn with_latest_health(&self, mut status: ServerStatus) -> ServerStatus {
        if let Some(latest) = self.inner.health.cached(&status.id) {
            status.health = Some(latest);
        }
        status
    }

    // ─── Hot Reload ──────────────────────────────────────────────────────

    /// Re-read the config file and reconcile the registry with it.
    ///
    /// On a bad file the previous config stays in effect and the error is
    /// returned (a `ConfigError` event is emitted as well).
    pub async fn reload_config(&self) -> Result<(), McpError> {
        let current = self.inner.loader.write().await.reload().await?;
        self.reconcile(&current).await;
        Ok(())
    }

    /// Bring the registry in line with `config`:
    /// - servers no longer present are disconnected and unregistered
    /// - new servers are registered (and connected when auto-connect is on)
    /// - the rest get their config replaced; live transports are kept
    async fn reconcile(&self, config: &McpConfig) {
        let existing: BTreeSet<String> = self.inner.registry.read().await.ids().into_iter().collect();

        let removed: Vec<&String> = existing
            .iter()
            .filter(|id| !config.servers.contains_key(id.as_str()))
            .collect();
        for id in removed {
            self.disconnect(id).await;
            self.inner.registry.write().await.unregister(id);
            tracing::info!(server = %id, "server removed from config");
        }

        let mut added = Vec::new();
        {
            let mut registry = self.inner.registry.write().await;
            for (id, server) in &config.servers {
                if existing.contains(id) {
                    let _ = registry.update_config(id, server.clone());
                    continue;
                }
                match registry.register(id, server.clone(), self.is_default(id)) {
                    Ok(()) => {
                        tracing::info!(server = %id, "server added from config");
                        added.push(id.clone());
                    }
                    Err(e) => tracing::warn!(server = %id, error = %e, "failed to register server"),
                }
            }
        }

        if self.inner.options.auto_connect {
            let connects = added.iter().map(|id| self.connect(id));
            for (id, outcome) in added.iter().zip(futures::future::join_all(connects).await) {
                if let Err(e) = outcome {
                    tracing::warn!(server = %id, error = %e, "new server failed to connect");
                }
            }
        }
    }

    async fn start_watching(&self) -> Result<(), McpError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.loader.write().await.start_watching(tx)?;

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = McpClientManager { inner };
                if let Err(e) = manager.reload_config().await {
                    tracing::warn!(error = %e, "config reload rejected");
                }
            }
        });

        if let Some(old) = self.watch_task().replace(task) {
            old.abort();
        }
        Ok(())
    }

    fn watch_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_default(&self, id: &str) -> bool {
        self.inner.options.default_server.as_deref() == Some(id)
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    server: &str,
    method: &str,
    value: serde_json::Value,
) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("invalid {method} result: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

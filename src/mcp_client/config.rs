//! Server configuration loading, validation and hot-reload.
//!
//! Reads `mcp-servers.json` (or `.yaml`), interpolates `${VAR}` placeholders,
//! merges the `defaults` block into every server, validates the result and
//! deserializes it into [`McpConfig`]. The loader keeps the last good config
//! across failed reloads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::errors::McpError;
use super::events::{EventBus, McpEvent};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable that overrides the default config path.
pub const CONFIG_PATH_ENV: &str = "HYDRA_MCP_CONFIG";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 60_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HEALTH_CACHE_TTL_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const MAX_RETRIES_LIMIT: u64 = 10;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Nested objects in `defaults` that merge field-by-field instead of wholesale.
const FIELD_MERGED_KEYS: &[&str] = &["healthCheck", "retry"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Wire protocol used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportType::Stdio => "stdio",
            TransportType::Http => "http",
            TransportType::Sse => "sse",
        };
        f.pad(s)
    }
}

/// Per-server liveness probing settings. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_cache_ttl", rename = "cacheTTL")]
    pub cache_ttl: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEALTH_INTERVAL_MS,
            timeout: DEFAULT_HEALTH_TIMEOUT_MS,
            cache_ttl: DEFAULT_HEALTH_CACHE_TTL_MS,
        }
    }
}

/// Reconnection backoff parameters. The core never retries on its own; these
/// drive [`McpClientManager::reconnect`](super::manager::McpClientManager::reconnect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay as f64)
        } else {
            self.max_delay as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY_MS,
            max_delay: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// One tool server's configuration, after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(rename = "type")]
    pub transport: TransportType,
    /// Executable for stdio servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child process (inherits the parent's).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Endpoint for http/sse servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ServerConfig {
    fn with_transport(transport: TransportType) -> Self {
        Self {
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT_MS,
            enabled: true,
            tags: BTreeSet::new(),
            description: None,
            health_check: HealthCheckConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// A stdio server running `command` with default settings.
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        let mut cfg = Self::with_transport(TransportType::Stdio);
        cfg.command = Some(command.to_string());
        cfg.args = args.iter().map(|a| a.to_string()).collect();
        cfg
    }

    /// An http server at `url` with default settings.
    pub fn http(url: &str) -> Self {
        let mut cfg = Self::with_transport(TransportType::Http);
        cfg.url = Some(url.to_string());
        cfg
    }

    /// An sse server at `url` with default settings.
    pub fn sse(url: &str) -> Self {
        let mut cfg = Self::with_transport(TransportType::Sse);
        cfg.url = Some(url.to_string());
        cfg
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Top-level configuration file (mirrors `mcp-servers.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// The raw `defaults` block, kept for inspection. Already merged into `servers`.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

impl McpConfig {
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.get(id)
    }

    pub fn enabled_servers(&self) -> Vec<(String, ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(id, cfg)| (id.clone(), cfg.clone()))
            .collect()
    }

    pub fn servers_by_tag(&self, tag: &str) -> Vec<(String, ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, cfg)| cfg.has_tag(tag))
            .map(|(id, cfg)| (id.clone(), cfg.clone()))
            .collect()
    }

    /// Servers listed in a group, in group order. Ids that do not name a
    /// configured server are skipped.
    pub fn servers_by_group(&self, group: &str) -> Vec<(String, ServerConfig)> {
        let Some(members) = self.groups.get(group) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| self.servers.get(id).map(|cfg| (id.clone(), cfg.clone())))
            .collect()
    }
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}
fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}
fn default_health_cache_ttl() -> u64 {
    DEFAULT_HEALTH_CACHE_TTL_MS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_version() -> String {
    "1.0".to_string()
}

// ─── Paths ───────────────────────────────────────────────────────────────────

/// Resolve the config path: `HYDRA_MCP_CONFIG`, else `~/.hydra/mcp-servers.json`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hydra")
        .join("mcp-servers.json")
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Run the full pipeline over raw file contents: parse, interpolate, merge
/// defaults, validate, deserialize.
///
/// `path` only selects the format (by extension) and labels errors.
pub fn parse_config_str(
    path: &Path,
    raw: &str,
    env_overrides: &HashMap<String, String>,
) -> Result<McpConfig, McpError> {
    let document = parse_document(path, raw)?;

    let lookup = |name: &str| {
        env_overrides
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    };
    let mut document = interpolate_value(&document, &lookup);

    apply_defaults(&mut document);

    let errors = validate_document(&document);
    if !errors.is_empty() {
        return Err(McpError::ConfigValidation { errors });
    }

    serde_json::from_value(document).map_err(|e| McpError::ConfigValidation {
        errors: vec![e.to_string()],
    })
}

/// Parse JSON, or YAML when the file extension says so.
fn parse_document(path: &Path, raw: &str) -> Result<Value, McpError> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed = if is_yaml {
        serde_yaml::from_str::<Value>(raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Value>(raw).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| McpError::ConfigParse {
        path: path.display().to_string(),
        reason,
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Interpolate every string inside a JSON value. Object keys are left alone.
pub fn interpolate_value(value: &Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(s, lookup)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, lookup))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in a string. Unknown variables
/// without a default become the empty string. An unterminated `${` is kept
/// literally.
pub fn interpolate_str(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end], lookup));
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        lookup(var_name).unwrap_or_else(|| expand_tilde(default))
    } else {
        lookup(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Merge the document's `defaults` block into each server in place.
///
/// A field present on the server always wins. `healthCheck` and `retry` are
/// merged one level deeper, field by field.
fn apply_defaults(document: &mut Value) {
    let Some(defaults) = document
        .get("defaults")
        .and_then(Value::as_object)
        .cloned()
    else {
        return;
    };

    let Some(servers) = document.get_mut("servers").and_then(Value::as_object_mut) else {
        return;
    };

    for server in servers.values_mut() {
        if let Some(server) = server.as_object_mut() {
            merge_defaults(server, &defaults);
        }
    }
}

fn merge_defaults(server: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    for (key, default_value) in defaults {
        match server.get_mut(key) {
            None => {
                server.insert(key.clone(), default_value.clone());
            }
            Some(existing) if FIELD_MERGED_KEYS.contains(&key.as_str()) => {
                if let (Some(target), Some(source)) =
                    (existing.as_object_mut(), default_value.as_object())
                {
                    for (field, value) in source {
                        target.entry(field.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
            Some(_) => {}
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Check the document against the config schema. Returns one path-qualified
/// message per violation; empty means valid.
pub fn validate_document(document: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(root) = document.as_object() else {
        errors.push("(root): expected an object".to_string());
        return errors;
    };

    if let Some(version) = root.get("version") {
        if !version.is_string() {
            errors.push("version: expected a string".to_string());
        }
    }
    if let Some(schema) = root.get("$schema") {
        if !schema.is_string() {
            errors.push("$schema: expected a string".to_string());
        }
    }

    match root.get("servers") {
        None => errors.push("servers: required".to_string()),
        Some(Value::Object(servers)) => {
            for (id, server) in servers {
                let path = format!("servers.{id}");
                if id.trim().is_empty() {
                    errors.push(format!("{path}: server id must not be empty"));
                }
                if id.contains("__") {
                    errors.push(format!("{path}: server id must not contain \"__\""));
                }
                match server.as_object() {
                    Some(obj) => validate_server(&path, obj, false, &mut errors),
                    None => errors.push(format!("{path}: expected an object")),
                }
            }
        }
        Some(_) => errors.push("servers: expected an object".to_string()),
    }

    if let Some(groups) = root.get("groups") {
        match groups.as_object() {
            Some(groups) => {
                for (name, members) in groups {
                    check_string_array(&format!("groups.{name}"), Some(members), &mut errors);
                }
            }
            None => errors.push("groups: expected an object".to_string()),
        }
    }

    if let Some(defaults) = root.get("defaults") {
        match defaults.as_object() {
            Some(obj) => validate_server("defaults", obj, true, &mut errors),
            None => errors.push("defaults: expected an object".to_string()),
        }
    }

    errors
}

/// Validate one server object. `partial` relaxes required fields (for `defaults`).
fn validate_server(path: &str, obj: &Map<String, Value>, partial: bool, errors: &mut Vec<String>) {
    let transport = match obj.get("type") {
        None => {
            if !partial {
                errors.push(format!("{path}.type: required"));
            }
            None
        }
        Some(Value::String(t)) => match t.as_str() {
            "stdio" => Some(TransportType::Stdio),
            "http" => Some(TransportType::Http),
            "sse" => Some(TransportType::Sse),
            other => {
                errors.push(format!(
                    "{path}.type: expected one of stdio, http, sse (got \"{other}\")"
                ));
                None
            }
        },
        Some(_) => {
            errors.push(format!("{path}.type: expected a string"));
            None
        }
    };

    match obj.get("command") {
        Some(Value::String(cmd)) if cmd.trim().is_empty() => {
            errors.push(format!("{path}.command: must not be empty"));
        }
        Some(Value::String(_)) => {}
        Some(_) => errors.push(format!("{path}.command: expected a string")),
        None if !partial && transport == Some(TransportType::Stdio) => {
            errors.push(format!("{path}.command: required for stdio servers"));
        }
        None => {}
    }

    match obj.get("url") {
        Some(Value::String(url)) => match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(format!(
                "{path}.url: unsupported scheme \"{}\"",
                parsed.scheme()
            )),
            Err(e) => errors.push(format!("{path}.url: invalid URL ({e})")),
        },
        Some(_) => errors.push(format!("{path}.url: expected a string")),
        None if !partial
            && matches!(transport, Some(TransportType::Http) | Some(TransportType::Sse)) =>
        {
            errors.push(format!("{path}.url: required for http and sse servers"));
        }
        None => {}
    }

    check_string_array(&format!("{path}.args"), obj.get("args"), errors);
    check_string_array(&format!("{path}.tags"), obj.get("tags"), errors);
    check_string_map(&format!("{path}.env"), obj.get("env"), errors);
    check_string_map(&format!("{path}.headers"), obj.get("headers"), errors);
    check_positive_int(&format!("{path}.timeout"), obj.get("timeout"), errors);
    check_bool(&format!("{path}.enabled"), obj.get("enabled"), errors);
    check_string(&format!("{path}.cwd"), obj.get("cwd"), errors);
    check_string(&format!("{path}.description"), obj.get("description"), errors);

    if let Some(health) = obj.get("healthCheck") {
        let hc_path = format!("{path}.healthCheck");
        match health.as_object() {
            Some(hc) => {
                check_bool(&format!("{hc_path}.enabled"), hc.get("enabled"), errors);
                for field in ["interval", "timeout", "cacheTTL"] {
                    check_positive_int(&format!("{hc_path}.{field}"), hc.get(field), errors);
                }
            }
            None => errors.push(format!("{hc_path}: expected an object")),
        }
    }

    if let Some(retry) = obj.get("retry") {
        let retry_path = format!("{path}.retry");
        match retry.as_object() {
            Some(r) => {
                if let Some(max) = r.get("maxRetries") {
                    match max.as_u64() {
                        Some(n) if n <= MAX_RETRIES_LIMIT => {}
                        Some(_) => errors.push(format!(
                            "{retry_path}.maxRetries: must be at most {MAX_RETRIES_LIMIT}"
                        )),
                        None => errors.push(format!(
                            "{retry_path}.maxRetries: expected a non-negative integer"
                        )),
                    }
                }
                for field in ["baseDelay", "maxDelay"] {
                    check_positive_int(&format!("{retry_path}.{field}"), r.get(field), errors);
                }
                if let Some(mult) = r.get("backoffMultiplier") {
                    match mult.as_f64() {
                        Some(m) if m >= 1.0 => {}
                        _ => errors.push(format!(
                            "{retry_path}.backoffMultiplier: expected a number >= 1"
                        )),
                    }
                }
            }
            None => errors.push(format!("{retry_path}: expected an object")),
        }
    }
}

fn check_positive_int(path: &str, value: Option<&Value>, errors: &mut Vec<String>) {
    if let Some(v) = value {
        if !matches!(v.as_u64(), Some(n) if n > 0) {
            errors.push(format!("{path}: expected a positive integer"));
        }
    }
}

fn check_bool(path: &str, value: Option<&Value>, errors: &mut Vec<String>) {
    if let Some(v) = value {
        if !v.is_boolean() {
            errors.push(format!("{path}: expected a boolean"));
        }
    }
}

fn check_string(path: &str, value: Option<&Value>, errors: &mut Vec<String>) {
    if let Some(v) = value {
        if !v.is_string() {
            errors.push(format!("{path}: expected a string"));
        }
    }
}

fn check_string_array(path: &str, value: Option<&Value>, errors: &mut Vec<String>) {
    let Some(v) = value else { return };
    match v.as_array() {
        Some(items) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    errors.push(format!("{path}.{i}: expected a string"));
                }
            }
        }
        None => errors.push(format!("{path}: expected an array of strings")),
    }
}

fn check_string_map(path: &str, value: Option<&Value>, errors: &mut Vec<String>) {
    let Some(v) = value else { return };
    match v.as_object() {
        Some(map) => {
            for (key, item) in map {
                if !item.is_string() {
                    errors.push(format!("{path}.{key}: expected a string"));
                }
            }
        }
        None => errors.push(format!("{path}: expected an object of strings")),
    }
}

// ─── ConfigLoader ────────────────────────────────────────────────────────────

/// Owns the current configuration and the optional file watcher.
pub struct ConfigLoader {
    path: PathBuf,
    env_overrides: HashMap<String, String>,
    config: Option<Arc<McpConfig>>,
    events: EventBus,
    watcher: Option<notify::RecommendedWatcher>,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            path: path.into(),
            env_overrides: HashMap::new(),
            config: None,
            events,
            watcher: None,
        }
    }

    /// Variables consulted before the process environment during interpolation.
    pub fn with_env_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.env_overrides = overrides;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and store the configuration. Emits `ConfigLoaded`.
    pub async fn load(&mut self) -> Result<Arc<McpConfig>, McpError> {
        let config = Arc::new(self.read_and_parse().await?);
        self.config = Some(config.clone());

        tracing::info!(
            path = %self.path.display(),
            servers = config.servers.len(),
            groups = config.groups.len(),
            "loaded MCP server config"
        );
        self.events.emit(McpEvent::ConfigLoaded {
            server_count: config.servers.len(),
        });

        Ok(config)
    }

    /// Re-run the pipeline. On failure the previous config stays in effect,
    /// `ConfigError` is emitted, and the error is returned.
    pub async fn reload(&mut self) -> Result<Arc<McpConfig>, McpError> {
        match self.read_and_parse().await {
            Ok(config) => {
                let current = Arc::new(config);
                let previous = self.config.replace(current.clone());
                tracing::info!(
                    path = %self.path.display(),
                    servers = current.servers.len(),
                    "reloaded MCP server config"
                );
                self.events.emit(McpEvent::ConfigReloaded {
                    previous,
                    current: current.clone(),
                });
                Ok(current)
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "config reload failed, keeping previous config"
                );
                self.events.emit(McpEvent::ConfigError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn read_and_parse(&self) -> Result<McpConfig, McpError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => McpError::ConfigNotFound {
                    path: self.path.display().to_string(),
                },
                _ => McpError::ConfigError {
                    reason: format!("failed to read {}: {e}", self.path.display()),
                },
            })?;

        parse_config_str(&self.path, &raw, &self.env_overrides)
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> Option<Arc<McpConfig>> {
        self.config.clone()
    }

    pub fn server(&self, id: &str) -> Option<ServerConfig> {
        self.config.as_ref().and_then(|c| c.server(id).cloned())
    }

    pub fn enabled_servers(&self) -> Vec<(String, ServerConfig)> {
        self.config
            .as_ref()
            .map(|c| c.enabled_servers())
            .unwrap_or_default()
    }

    pub fn servers_by_tag(&self, tag: &str) -> Vec<(String, ServerConfig)> {
        self.config
            .as_ref()
            .map(|c| c.servers_by_tag(tag))
            .unwrap_or_default()
    }

    pub fn servers_by_group(&self, group: &str) -> Vec<(String, ServerConfig)> {
        self.config
            .as_ref()
            .map(|c| c.servers_by_group(group))
            .unwrap_or_default()
    }

    // ─── Watching ────────────────────────────────────────────────────────

    /// Watch the config file and send `()` on `on_change` whenever it is
    /// written or replaced. Replaces any existing watch.
    ///
    /// The parent directory is watched so that editors which save by
    /// rename-over are still picked up.
    pub fn start_watching(&mut self, on_change: mpsc::UnboundedSender<()>) -> Result<(), McpError> {
        use notify::Watcher;

        self.stop_watching();

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_config {
                    let _ = on_change.send(());
                }
            })
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to create config watcher: {e}"),
            })?;

        watcher
            .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to watch {}: {e}", watch_dir.display()),
            })?;

        tracing::debug!(path = %self.path.display(), "watching MCP server config");
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Drop the file watch. Safe to call when not watching.
    pub fn stop_watching(&mut self) {
        if self.watcher.take().is_some() {
            tracing::debug!(path = %self.path.display(), "stopped watching MCP server config");
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse(json: &str) -> Result<McpConfig, McpError> {
        parse_config_str(Path::new("mcp-servers.json"), json, &HashMap::new())
    }

    fn validation_errors(json: &str) -> Vec<String> {
        match parse(json) {
            Err(McpError::ConfigValidation { errors }) => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_interpolate_with_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("HOST".to_string(), "localhost".to_string());
        overrides.insert("PORT".to_string(), "8080".to_string());
        let lookup = |name: &str| overrides.get(name).cloned();

        assert_eq!(
            interpolate_str("http://${HOST}:${PORT}", &lookup),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_interpolate_missing_var_is_empty() {
        assert_eq!(
            interpolate_str("${__HYDRA_TEST_UNDEFINED_VAR__}", &no_env),
            ""
        );
        assert_eq!(interpolate_str("a-${__NOPE__}-b", &no_env), "a--b");
    }

    #[test]
    fn test_interpolate_default_and_literal() {
        assert_eq!(interpolate_str("${MISSING:-fallback}", &no_env), "fallback");
        assert_eq!(interpolate_str("plain text", &no_env), "plain text");
        assert_eq!(interpolate_str("cost: $5 ${unterminated", &no_env), "cost: $5 ${unterminated");
    }

    #[test]
    fn test_interpolate_recurses_into_arrays_and_objects() {
        let lookup = |name: &str| (name == "TOKEN").then(|| "secret".to_string());
        let input = serde_json::json!({
            "args": ["--token", "${TOKEN}"],
            "headers": {"Authorization": "Bearer ${TOKEN}"},
            "timeout": 100
        });
        let out = interpolate_value(&input, &lookup);
        assert_eq!(out["args"][1], "secret");
        assert_eq!(out["headers"]["Authorization"], "Bearer secret");
        assert_eq!(out["timeout"], 100);
    }

    #[test]
    fn test_env_overrides_apply_during_parse() {
        let mut overrides = HashMap::new();
        overrides.insert("API_HOST".to_string(), "localhost".to_string());
        let json = r#"{"servers": {"api": {"type": "http", "url": "http://${API_HOST}:9000/mcp"}}}"#;
        let cfg = parse_config_str(Path::new("c.json"), json, &overrides).unwrap();
        assert_eq!(
            cfg.servers["api"].url.as_deref(),
            Some("http://localhost:9000/mcp")
        );
    }

    #[test]
    fn test_defaults_applied_to_omitted_fields() {
        let cfg = parse(r#"{"servers": {"fs": {"type": "stdio", "command": "npx"}}}"#).unwrap();
        let fs = &cfg.servers["fs"];
        assert_eq!(cfg.version, "1.0");
        assert_eq!(fs.timeout, 30_000);
        assert!(fs.enabled);
        assert!(fs.health_check.enabled);
        assert_eq!(fs.health_check.interval, 60_000);
        assert_eq!(fs.health_check.timeout, 5_000);
        assert_eq!(fs.health_check.cache_ttl, 30_000);
        assert_eq!(fs.retry.max_retries, 3);
        assert_eq!(fs.retry.base_delay, 1_000);
        assert_eq!(fs.retry.max_delay, 30_000);
        assert_eq!(fs.retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_defaults_block_server_value_wins() {
        let cfg = parse(
            r#"{
                "defaults": {
                    "timeout": 10000,
                    "tags": ["default"],
                    "healthCheck": {"interval": 15000, "timeout": 2000},
                    "retry": {"maxRetries": 5}
                },
                "servers": {
                    "a": {"type": "stdio", "command": "a", "timeout": 500,
                          "healthCheck": {"interval": 1000}},
                    "b": {"type": "http", "url": "http://localhost:1/mcp"}
                }
            }"#,
        )
        .unwrap();

        let a = &cfg.servers["a"];
        assert_eq!(a.timeout, 500);
        assert!(a.has_tag("default"));
        // healthCheck merges field-by-field: own interval, default timeout.
        assert_eq!(a.health_check.interval, 1000);
        assert_eq!(a.health_check.timeout, 2000);
        assert_eq!(a.retry.max_retries, 5);

        let b = &cfg.servers["b"];
        assert_eq!(b.timeout, 10000);
        assert_eq!(b.health_check.interval, 15000);
    }

    #[test]
    fn test_defaults_tags_are_not_unioned() {
        let cfg = parse(
            r#"{
                "defaults": {"tags": ["default"]},
                "servers": {"a": {"type": "stdio", "command": "a", "tags": ["own"]}}
            }"#,
        )
        .unwrap();
        let a = &cfg.servers["a"];
        assert!(a.has_tag("own"));
        assert!(!a.has_tag("default"));
    }

    #[test]
    fn test_validation_reports_qualified_paths() {
        let errors = validation_errors(r#"{"servers": {"test": {"type": "websocket"}}}"#);
        assert!(errors.iter().any(|e| e.starts_with("servers.test.type")));
    }

    #[test]
    fn test_validation_requires_command_and_url() {
        let errors = validation_errors(
            r#"{"servers": {
                "local": {"type": "stdio"},
                "remote": {"type": "http"},
                "stream": {"type": "sse", "url": "not a url"}
            }}"#,
        );
        assert!(errors.iter().any(|e| e.starts_with("servers.local.command")));
        assert!(errors.iter().any(|e| e.starts_with("servers.remote.url")));
        assert!(errors.iter().any(|e| e.starts_with("servers.stream.url")));
    }

    #[test]
    fn test_validation_retry_bounds() {
        let errors = validation_errors(
            r#"{"servers": {"a": {"type": "stdio", "command": "x",
                "retry": {"maxRetries": 11, "backoffMultiplier": 0.5}}}}"#,
        );
        assert!(errors.iter().any(|e| e.starts_with("servers.a.retry.maxRetries")));
        assert!(errors
            .iter()
            .any(|e| e.starts_with("servers.a.retry.backoffMultiplier")));
    }

    #[test]
    fn test_validation_rejects_double_underscore_ids() {
        let errors = validation_errors(r#"{"servers": {"a__b": {"type": "stdio", "command": "x"}}}"#);
        assert!(errors.iter().any(|e| e.starts_with("servers.a__b")));
    }

    #[test]
    fn test_validation_missing_servers() {
        let errors = validation_errors(r#"{"version": "1.0"}"#);
        assert_eq!(errors, vec!["servers: required".to_string()]);
    }

    #[test]
    fn test_parse_error_is_distinct() {
        let err = parse("{ not json").unwrap_err();
        assert!(matches!(err, McpError::ConfigParse { .. }));
    }

    #[test]
    fn test_yaml_by_extension() {
        let yaml = "servers:\n  fs:\n    type: stdio\n    command: npx\n    tags: [files]\n";
        let cfg = parse_config_str(Path::new("mcp.yaml"), yaml, &HashMap::new()).unwrap();
        assert!(cfg.servers["fs"].has_tag("files"));
    }

    #[test]
    fn test_group_skips_unknown_ids() {
        let cfg = parse(
            r#"{
                "servers": {"real": {"type": "stdio", "command": "x"}},
                "groups": {"g": ["real", "ghost"]}
            }"#,
        )
        .unwrap();
        let members = cfg.servers_by_group("g");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, "real");
        assert!(cfg.servers_by_group("nope").is_empty());
    }

    #[test]
    fn test_enabled_and_tag_accessors() {
        let cfg = parse(
            r#"{"servers": {
                "a": {"type": "stdio", "command": "x", "tags": ["fs"]},
                "b": {"type": "stdio", "command": "y", "enabled": false, "tags": ["fs", "web"]}
            }}"#,
        )
        .unwrap();
        let enabled: Vec<String> = cfg.enabled_servers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(enabled, vec!["a"]);
        assert_eq!(cfg.servers_by_tag("fs").len(), 2);
        assert_eq!(cfg.servers_by_tag("web").len(), 1);
    }

    #[test]
    fn test_retry_delay_formula() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(8_000));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(30_000));
        assert_eq!(retry.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_loader_accessors_empty_before_load() {
        let loader = ConfigLoader::new("/nonexistent/mcp.json", EventBus::new());
        assert!(loader.config().is_none());
        assert!(loader.server("x").is_none());
        assert!(loader.enabled_servers().is_empty());
        assert!(loader.servers_by_tag("t").is_empty());
        assert!(loader.servers_by_group("g").is_empty());
    }

    #[tokio::test]
    async fn test_loader_missing_file() {
        let tmp = TempDir::new().unwrap();
        let mut loader = ConfigLoader::new(tmp.path().join("missing.json"), EventBus::new());
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, McpError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_loader_load_emits_event() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp.json");
        std::fs::write(&path, r#"{"servers": {"a": {"type": "stdio", "command": "x"}}}"#).unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut loader = ConfigLoader::new(&path, bus);
        let cfg = loader.load().await.unwrap();
        assert_eq!(cfg.servers.len(), 1);
        assert!(loader.server("a").is_some());

        match rx.recv().await.unwrap() {
            McpEvent::ConfigLoaded { server_count } => assert_eq!(server_count, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp.json");
        std::fs::write(&path, r#"{"servers": {"a": {"type": "stdio", "command": "x"}}}"#).unwrap();

        let bus = EventBus::new();
        let mut loader = ConfigLoader::new(&path, bus.clone());
        loader.load().await.unwrap();

        let mut rx = bus.subscribe();
        std::fs::write(&path, "{ broken").unwrap();
        let err = loader.reload().await.unwrap_err();
        assert!(matches!(err, McpError::ConfigParse { .. }));
        assert!(loader.server("a").is_some(), "previous config must survive");
        assert!(matches!(rx.recv().await.unwrap(), McpEvent::ConfigError { .. }));

        std::fs::write(
            &path,
            r#"{"servers": {"a": {"type": "stdio", "command": "x"}, "b": {"type": "stdio", "command": "y"}}}"#,
        )
        .unwrap();
        loader.reload().await.unwrap();
        match rx.recv().await.unwrap() {
            McpEvent::ConfigReloaded { previous, current } => {
                assert_eq!(previous.unwrap().servers.len(), 1);
                assert_eq!(current.servers.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_stop_watching_is_idempotent() {
        let mut loader = ConfigLoader::new("/tmp/mcp.json", EventBus::new());
        loader.stop_watching();
        loader.stop_watching();
        assert!(!loader.is_watching());
    }

    #[tokio::test]
    async fn test_start_watching_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp.json");
        std::fs::write(&path, r#"{"servers": {}}"#).unwrap();

        let mut loader = ConfigLoader::new(&path, EventBus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        loader.start_watching(tx).unwrap();
        assert!(loader.is_watching());
        loader.stop_watching();
        assert!(!loader.is_watching());
    }

    #[test]
    #[serial]
    fn test_default_config_path_env_override() {
        std::env::set_var(CONFIG_PATH_ENV, "/etc/hydra/servers.yaml");
        assert_eq!(default_config_path(), PathBuf::from("/etc/hydra/servers.yaml"));

        std::env::remove_var(CONFIG_PATH_ENV);
        assert!(default_config_path().ends_with(".hydra/mcp-servers.json"));
    }
}

//! Health probing for connected servers.
//!
//! A probe is a `tools/list` request bounded by the server's health timeout.
//! Results are cached per server for `cacheTTL` ms. Monitoring runs one
//! interval task per server; the first probe runs immediately and every tick
//! refreshes the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::config::HealthCheckConfig;
use super::transport::Transport;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.pad(s)
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthResult {
    fn unknown(reason: &str) -> Self {
        Self {
            status: HealthStatus::Unknown,
            response_time_ms: None,
            error: Some(reason.to_string()),
            checked_at: Utc::now(),
        }
    }
}

/// Status counts over monitored servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

// ─── HealthChecker ───────────────────────────────────────────────────────────

#[derive(Default)]
struct CheckerState {
    cache: Mutex<HashMap<String, (HealthResult, Instant)>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Cheap to clone; clones share cache and monitors.
#[derive(Clone, Default)]
pub struct HealthChecker {
    state: Arc<CheckerState>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result if younger than `cache_ttl`, otherwise a fresh probe.
    pub async fn check(
        &self,
        id: &str,
        transport: Option<&Arc<Transport>>,
        config: &HealthCheckConfig,
    ) -> HealthResult {
        let ttl = Duration::from_millis(config.cache_ttl);
        let fresh = self
            .cache()
            .get(id)
            .filter(|(_, at)| at.elapsed() < ttl)
            .map(|(result, _)| result.clone());
        match fresh {
            Some(result) => result,
            None => self.refresh(id, transport, config).await,
        }
    }

    /// Probe now, ignoring the cache, and cache the result.
    pub async fn refresh(
        &self,
        id: &str,
        transport: Option<&Arc<Transport>>,
        config: &HealthCheckConfig,
    ) -> HealthResult {
        let result = match transport {
            Some(transport) => probe(transport, config.timeout).await,
            None => HealthResult::unknown("no transport"),
        };
        self.cache()
            .insert(id.to_string(), (result.clone(), Instant::now()));
        result
    }

    /// Last result for `id`, regardless of age.
    pub fn cached(&self, id: &str) -> Option<HealthResult> {
        self.cache().get(id).map(|(result, _)| result.clone())
    }

    pub fn clear(&self, id: &str) {
        self.cache().remove(id);
    }

    /// Probe `id` now and then every `config.interval` ms until stopped.
    /// Each result is cached and handed to `on_result`. Replaces any
    /// existing monitor for the same server.
    pub fn start_monitoring<F, Fut>(
        &self,
        id: &str,
        transport: Arc<Transport>,
        config: HealthCheckConfig,
        on_result: F,
    ) where
        F: Fn(HealthResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if !config.enabled {
            return;
        }

        let weak: Weak<CheckerState> = Arc::downgrade(&self.state);
        let server_id = id.to_string();
        let interval_ms = config.interval;
        let period = Duration::from_millis(interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut last_status = HealthStatus::Unknown;
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                let checker = HealthChecker { state };
                let result = checker
                    .refresh(&server_id, Some(&transport), &config)
                    .await;
                drop(checker);

                if result.status != last_status {
                    match result.status {
                        HealthStatus::Unhealthy => tracing::warn!(
                            server = %server_id,
                            error = result.error.as_deref().unwrap_or(""),
                            "health check failed"
                        ),
                        _ => tracing::debug!(
                            server = %server_id,
                            status = %result.status,
                            "health status changed"
                        ),
                    }
                    last_status = result.status;
                }
                on_result(result).await;
            }
        });

        if let Some(old) = self.monitors().insert(id.to_string(), handle) {
            old.abort();
        }
        tracing::debug!(server = %id, interval_ms, "health monitoring started");
    }

    pub fn stop_monitoring(&self, id: &str) {
        if let Some(handle) = self.monitors().remove(id) {
            handle.abort();
            tracing::debug!(server = %id, "health monitoring stopped");
        }
    }

    pub fn stop_all_monitoring(&self) {
        for (_, handle) in self.monitors().drain() {
            handle.abort();
        }
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.monitors().contains_key(id)
    }

    /// Counts by the latest cached status of each monitored server.
    pub fn summary(&self) -> HealthSummary {
        let ids: Vec<String> = self.monitors().keys().cloned().collect();
        let cache = self.cache();

        let mut summary = HealthSummary {
            total: ids.len(),
            ..HealthSummary::default()
        };
        for id in &ids {
            match cache.get(id).map(|(r, _)| r.status) {
                Some(HealthStatus::Healthy) => summary.healthy += 1,
                Some(HealthStatus::Unhealthy) => summary.unhealthy += 1,
                Some(HealthStatus::Unknown) | None => summary.unknown += 1,
            }
        }
        summary
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, (HealthResult, Instant)>> {
        self.state.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.state
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn probe(transport: &Transport, timeout_ms: u64) -> HealthResult {
    let started = Instant::now();
    let outcome = transport.request("tools/list", None, timeout_ms).await;
    let elapsed = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(_) => HealthResult {
            status: HealthStatus::Healthy,
            response_time_ms: Some(elapsed),
            error: None,
            checked_at: Utc::now(),
        },
        Err(e) => HealthResult {
            status: HealthStatus::Unhealthy,
            response_time_ms: Some(elapsed),
            error: Some(e.to_string()),
            checked_at: Utc::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::ServerConfig;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn healthy_server(expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
            })))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    async fn ignore(_: HealthResult) {}

    fn http_transport(url: &str) -> Arc<Transport> {
        Arc::new(Transport::from_config("api", &ServerConfig::http(url)).unwrap())
    }

    #[tokio::test]
    async fn test_no_transport_is_unknown() {
        let checker = HealthChecker::new();
        let result = checker
            .check("fs", None, &HealthCheckConfig::default())
            .await;
        assert_eq!(result.status, HealthStatus::Unknown);
        assert!(checker.cached("fs").is_some());
    }

    #[tokio::test]
    async fn test_check_uses_cache_within_ttl() {
        let server = healthy_server(1).await;
        let transport = http_transport(&server.uri());
        let checker = HealthChecker::new();
        let config = HealthCheckConfig::default();

        let first = checker.check("api", Some(&transport), &config).await;
        let second = checker.check("api", Some(&transport), &config).await;
        assert_eq!(first.status, HealthStatus::Healthy);
        assert_eq!(first.checked_at, second.checked_at);
        assert!(first.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let server = healthy_server(2).await;
        let transport = http_transport(&server.uri());
        let checker = HealthChecker::new();
        let config = HealthCheckConfig::default();

        checker.check("api", Some(&transport), &config).await;
        let fresh = checker.refresh("api", Some(&transport), &config).await;
        assert_eq!(fresh.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        let transport = http_transport("http://127.0.0.1:1/mcp");
        let checker = HealthChecker::new();
        let result = checker
            .check("down", Some(&transport), &HealthCheckConfig::default())
            .await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.is_some());

        checker.clear("down");
        assert!(checker.cached("down").is_none());
    }

    #[tokio::test]
    async fn test_monitoring_lifecycle_and_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
            })))
            .mount(&server)
            .await;

        let checker = HealthChecker::new();
        let config = HealthCheckConfig {
            interval: 20,
            ..HealthCheckConfig::default()
        };
        checker.start_monitoring("api", http_transport(&server.uri()), config.clone(), ignore);
        checker.start_monitoring("other", http_transport("http://127.0.0.1:1"), config, ignore);
        assert!(checker.is_monitoring("api"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let summary = checker.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy + summary.unknown, 1);

        checker.stop_monitoring("api");
        assert!(!checker.is_monitoring("api"));
        checker.stop_all_monitoring();
        assert_eq!(checker.summary(), HealthSummary::default());
    }

    #[tokio::test]
    async fn test_disabled_health_check_does_not_monitor() {
        let checker = HealthChecker::new();
        let config = HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        };
        checker.start_monitoring("api", http_transport("http://127.0.0.1:1"), config, ignore);
        assert!(!checker.is_monitoring("api"));
    }

    #[tokio::test]
    async fn test_monitoring_probes_immediately_and_reports() {
        let server = healthy_server(1).await;
        let checker = HealthChecker::new();
        let config = HealthCheckConfig {
            interval: 60_000,
            ..HealthCheckConfig::default()
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        checker.start_monitoring("api", http_transport(&server.uri()), config, move |result| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(result);
            }
        });

        let reported = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported.status, HealthStatus::Healthy);
        assert_eq!(checker.summary().healthy, 1);
        checker.stop_all_monitoring();
    }
}

//! Typed event channel shared by the loader, registry and manager.
//!
//! Each manager owns one [`EventBus`]; components get a clone of it at
//! construction. Subscribers receive every event emitted after they
//! subscribed. Slow subscribers lag rather than block emitters.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::config::McpConfig;
use super::registry::ServerState;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the connection manager reports to the rest of the application.
#[derive(Debug, Clone)]
pub enum McpEvent {
    /// `initialize()` completed.
    Initialized { server_count: usize },
    /// `shutdown()` completed.
    Shutdown,
    ServerRegistered { id: String },
    ServerUnregistered { id: String },
    ServerStateChanged {
        id: String,
        previous: ServerState,
        current: ServerState,
    },
    ToolsDiscovered { id: String, count: usize },
    ConfigLoaded { server_count: usize },
    ConfigReloaded {
        previous: Option<Arc<McpConfig>>,
        current: Arc<McpConfig>,
    },
    /// A reload failed; the previous config is still in effect.
    ConfigError { message: String },
}

impl McpEvent {
    /// Stable event name, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            McpEvent::Initialized { .. } => "initialized",
            McpEvent::Shutdown => "shutdown",
            McpEvent::ServerRegistered { .. } => "serverRegistered",
            McpEvent::ServerUnregistered { .. } => "serverUnregistered",
            McpEvent::ServerStateChanged { .. } => "serverStateChanged",
            McpEvent::ToolsDiscovered { .. } => "toolsDiscovered",
            McpEvent::ConfigLoaded { .. } => "configLoaded",
            McpEvent::ConfigReloaded { .. } => "configReloaded",
            McpEvent::ConfigError { .. } => "configError",
        }
    }
}

/// Cloneable sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<McpEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: McpEvent) {
        tracing::trace!(event = event.name(), "mcp event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(McpEvent::Shutdown);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(McpEvent::ServerRegistered { id: "a".into() });
        bus.emit(McpEvent::Shutdown);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, McpEvent::ServerRegistered { ref id } if id == "a"));
        assert_eq!(rx.recv().await.unwrap().name(), "shutdown");
    }
}

//! Process-wide default manager.
//!
//! Most code should construct and pass an [`McpClientManager`] explicitly;
//! these helpers exist for call sites that have no way to receive one.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::errors::McpError;
use super::manager::{ManagerOptions, McpClientManager};

static DEFAULT_MANAGER: Mutex<Option<McpClientManager>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<McpClientManager>> {
    DEFAULT_MANAGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// The shared manager, created with default options on first use.
pub fn get_mcp_client_manager() -> McpClientManager {
    slot()
        .get_or_insert_with(|| McpClientManager::new(ManagerOptions::default()))
        .clone()
}

/// Create the shared manager with `options` (if it does not exist yet) and
/// initialize it. Options are ignored when the manager already exists.
pub async fn initialize_mcp_client_manager(
    options: ManagerOptions,
) -> Result<McpClientManager, McpError> {
    let manager = {
        let mut slot = slot();
        if slot.is_some() {
            tracing::debug!("shared MCP client manager already exists, ignoring options");
        }
        slot.get_or_insert_with(|| McpClientManager::new(options))
            .clone()
    };
    manager.initialize().await?;
    Ok(manager)
}

/// Shut the shared manager down and forget it. The next
/// [`get_mcp_client_manager`] call creates a fresh one.
pub async fn reset_mcp_client_manager() {
    let previous = slot().take();
    if let Some(manager) = previous {
        manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    #[serial]
    async fn test_get_returns_same_instance() {
        reset_mcp_client_manager().await;
        let a = get_mcp_client_manager();
        let b = get_mcp_client_manager();
        assert!(McpClientManager::ptr_eq(&a, &b));
        reset_mcp_client_manager().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_reset_creates_new_instance() {
        reset_mcp_client_manager().await;
        let before = get_mcp_client_manager();
        reset_mcp_client_manager().await;
        let after = get_mcp_client_manager();
        assert!(!McpClientManager::ptr_eq(&before, &after));
        reset_mcp_client_manager().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_initialize_shared_manager() {
        reset_mcp_client_manager().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp-servers.json");
        std::fs::write(
            &path,
            r#"{"servers": {"fs": {"type": "stdio", "command": "npx"}}}"#,
        )
        .unwrap();

        let manager = initialize_mcp_client_manager(ManagerOptions {
            config_path: Some(path),
            auto_connect: false,
            ..ManagerOptions::default()
        })
        .await
        .unwrap();
        assert!(manager.is_initialized());
        assert!(McpClientManager::ptr_eq(&manager, &get_mcp_client_manager()));
        assert_eq!(manager.registry_stats().await.total, 1);

        reset_mcp_client_manager().await;
        assert!(!manager.is_initialized());
    }
}

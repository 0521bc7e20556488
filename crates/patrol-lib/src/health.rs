//! Component health tracking
//!
//! Tracks per-component health for the daemon's liveness and readiness
//! endpoints. The engine reports itself healthy when its last run succeeded
//! without errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health of one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Failed,
}

/// Component names tracked by the patrol daemon
pub mod components {
    pub const ENGINE: &str = "engine";
    pub const TRIGGERS: &str = "triggers";
    pub const ANALYZER: &str = "analyzer";
    pub const PERSISTENCE: &str = "persistence";
}

/// A component's status with an optional message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: i64,
}

impl ComponentHealth {
    pub fn ok() -> Self {
        Self {
            status: ComponentStatus::Ok,
            message: None,
            checked_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            checked_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Failed,
            message: Some(message.into()),
            checked_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Aggregate health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub ready: bool,
    pub components: HashMap<String, ComponentHealth>,
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, name: &str, health: ComponentHealth) {
        let mut inner = self.inner.write().await;
        inner.components.insert(name.to_string(), health);
    }

    pub async fn set_ok(&self, name: &str) {
        self.set(name, ComponentHealth::ok()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_failed(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentHealth::failed(message)).await;
    }

    /// Ready means initialized and no failed component
    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }

    pub async fn report(&self) -> HealthReport {
        let inner = self.inner.read().await;
        let mut status = ComponentStatus::Ok;
        for health in inner.components.values() {
            match health.status {
                ComponentStatus::Failed => {
                    status = ComponentStatus::Failed;
                    break;
                }
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Ok => {}
            }
        }
        HealthReport {
            status,
            ready: inner.ready && status != ComponentStatus::Failed,
            components: inner.components.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_ok_not_ready() {
        let registry = HealthRegistry::new();
        let report = registry.report().await;
        assert_eq!(report.status, ComponentStatus::Ok);
        assert!(!report.ready);
    }

    #[tokio::test]
    async fn test_degraded_component_degrades_overall() {
        let registry = HealthRegistry::new();
        registry.set_ok(components::ENGINE).await;
        registry.set_degraded(components::PERSISTENCE, "save failing").await;
        registry.set_ready(true).await;

        let report = registry.report().await;
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert!(report.ready);
    }

    #[tokio::test]
    async fn test_failed_component_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.set_failed(components::ENGINE, "no provider").await;

        let report = registry.report().await;
        assert_eq!(report.status, ComponentStatus::Failed);
        assert!(!report.ready);
    }
}

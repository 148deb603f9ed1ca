//! Health tracking for the node daemon
//!
//! The control loop, the RPC listener and cgroup access report their state
//! here; `/healthz` and `/readyz` are served from this registry.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Parts of the daemon that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ControlLoop,
    RpcServer,
    Cgroup,
}

/// Ordered from best to worst, so the daemon's status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    /// Still controlling, but late or partially resolved
    Degraded,
    Unhealthy,
}

impl Status {
    pub fn is_operational(&self) -> bool {
        *self != Status::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix time of the last report
    pub reported_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Status,
    pub components: BTreeMap<Component, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Share of late ticks above which the control loop reports degraded
pub const LATE_TICK_DEGRADED_RATIO: f64 = 0.1;

#[derive(Debug, Default)]
struct State {
    components: BTreeMap<Component, ComponentHealth>,
    listening: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, component: Component) {
        self.report(component, Status::Healthy, None).await;
    }

    async fn report(&self, component: Component, status: Status, message: Option<String>) {
        let health = ComponentHealth {
            status,
            message,
            reported_at: chrono::Utc::now().timestamp(),
        };
        self.state.write().await.components.insert(component, health);
    }

    pub async fn set_healthy(&self, component: Component) {
        self.report(component, Status::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.report(component, Status::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.report(component, Status::Unhealthy, Some(message.into()))
            .await;
    }

    /// Report control loop timing at the end of a session
    pub async fn report_tick_lateness(&self, late_ticks: u64, ticks: u64) {
        if ticks > 0 && late_ticks as f64 / ticks as f64 > LATE_TICK_DEGRADED_RATIO {
            self.set_degraded(
                Component::ControlLoop,
                format!("{} of {} ticks missed the 100ms boundary", late_ticks, ticks),
            )
            .await;
        } else {
            self.set_healthy(Component::ControlLoop).await;
        }
    }

    /// Set once the RPC listener is bound, cleared on shutdown
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.listening = ready;
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(Status::Healthy);
        HealthReport {
            status,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let listening = self.state.read().await.listening;
        let reason = if !listening {
            Some("RPC listener not bound")
        } else if !self.health().await.status.is_operational() {
            Some("component unhealthy")
        } else {
            None
        };
        Readiness {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let health = HealthRegistry::new().health().await;
        assert_eq!(health.status, Status::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(Component::ControlLoop).await;
        registry.register(Component::RpcServer).await;
        registry.register(Component::Cgroup).await;

        registry
            .set_degraded(Component::Cgroup, "pod resolution failed")
            .await;
        assert_eq!(registry.health().await.status, Status::Degraded);

        registry
            .set_unhealthy(Component::ControlLoop, "quota write failed")
            .await;
        assert_eq!(registry.health().await.status, Status::Unhealthy);

        registry.set_healthy(Component::ControlLoop).await;
        assert_eq!(registry.health().await.status, Status::Degraded);
    }

    #[tokio::test]
    async fn test_report_serializes_component_names() {
        let registry = HealthRegistry::new();
        registry.register(Component::RpcServer).await;
        let value = serde_json::to_value(registry.health().await).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["components"]["rpc_server"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_requires_listener_and_operational_components() {
        let registry = HealthRegistry::new();
        registry.register(Component::Cgroup).await;
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_degraded(Component::Cgroup, "slow").await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(Component::Cgroup, "cgroup root missing")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason, Some("component unhealthy"));
    }

    #[tokio::test]
    async fn test_tick_lateness_degrades_control_loop() {
        let registry = HealthRegistry::new();
        registry.register(Component::ControlLoop).await;

        registry.report_tick_lateness(5, 100).await;
        assert_eq!(registry.health().await.status, Status::Healthy);

        registry.report_tick_lateness(30, 100).await;
        let health = registry.health().await;
        assert_eq!(health.status, Status::Degraded);
        assert!(health.components[&Component::ControlLoop]
            .message
            .as_deref()
            .unwrap()
            .contains("30 of 100"));
    }
}

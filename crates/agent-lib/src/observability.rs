//! Observability infrastructure for the node daemon
//!
//! Provides:
//! - Prometheus metrics (tick latency, late ticks, cgroup I/O, applied limits)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds); the tick budget is 100ms
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    tick_latency_seconds: Histogram,
    late_ticks: IntCounter,
    counter_read_errors: IntCounter,
    cgroup_writes: IntCounter,
    managed_components: IntGauge,
    active_sessions: IntGauge,
    component_limit_cores: GaugeVec,
    captain_margin: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "autothrottle_tick_latency_seconds",
                "Time spent reading counters, ticking scalers and actuating per control tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            late_ticks: register_int_counter!(
                "autothrottle_late_ticks_total",
                "Control ticks that finished after their 100ms boundary"
            )
            .expect("Failed to register late_ticks"),

            counter_read_errors: register_int_counter!(
                "autothrottle_counter_read_errors_total",
                "Failed reads of cgroup CPU counters"
            )
            .expect("Failed to register counter_read_errors"),

            cgroup_writes: register_int_counter!(
                "autothrottle_cgroup_writes_total",
                "CPU quota writes issued to cgroups"
            )
            .expect("Failed to register cgroup_writes"),

            managed_components: register_int_gauge!(
                "autothrottle_managed_components",
                "Number of components managed by the active session"
            )
            .expect("Failed to register managed_components"),

            active_sessions: register_int_gauge!(
                "autothrottle_active_sessions",
                "Number of running control sessions"
            )
            .expect("Failed to register active_sessions"),

            component_limit_cores: register_gauge_vec!(
                "autothrottle_component_limit_cores",
                "CPU limit currently applied to a component",
                &["component"]
            )
            .expect("Failed to register component_limit_cores"),

            captain_margin: register_gauge_vec!(
                "autothrottle_captain_margin",
                "Margin integrator of the throttling-driven scaler",
                &["component"]
            )
            .expect("Failed to register captain_margin"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_late_ticks(&self) {
        self.inner().late_ticks.inc();
    }

    pub fn inc_counter_read_errors(&self) {
        self.inner().counter_read_errors.inc();
    }

    pub fn inc_cgroup_writes(&self) {
        self.inner().cgroup_writes.inc();
    }

    pub fn set_managed_components(&self, count: i64) {
        self.inner().managed_components.set(count);
    }

    pub fn session_started(&self) {
        self.inner().active_sessions.inc();
    }

    /// Drop per-component series along with the session
    pub fn session_ended(&self) {
        self.inner().active_sessions.dec();
        self.inner().managed_components.set(0);
        self.inner().component_limit_cores.reset();
        self.inner().captain_margin.reset();
    }

    /// Record the applied limit; unlimited is exported as -1
    pub fn set_component_limit(&self, component: &str, limit: Option<f64>) {
        self.inner()
            .component_limit_cores
            .with_label_values(&[component])
            .set(limit.unwrap_or(-1.0));
    }

    pub fn set_captain_margin(&self, component: &str, margin: f64) {
        self.inner()
            .captain_margin
            .with_label_values(&[component])
            .set(margin);
    }
}

/// Structured logger for daemon events
///
/// Every event carries the node name so that logs from all nodes of a run
/// can be merged.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_session_started(&self, namespace: &str, requested: usize, resolved: usize) {
        if resolved < requested {
            warn!(
                event = "session_started",
                node = %self.node_name,
                namespace = %namespace,
                requested = requested,
                resolved = resolved,
                "Control session started with unresolved components"
            );
        } else {
            info!(
                event = "session_started",
                node = %self.node_name,
                namespace = %namespace,
                components = resolved,
                "Control session started"
            );
        }
    }

    pub fn log_session_stopped(&self, ticks: u64, late_ticks: u64, reason: &str) {
        info!(
            event = "session_stopped",
            node = %self.node_name,
            ticks = ticks,
            late_ticks = late_ticks,
            reason = %reason,
            "Control session stopped"
        );
    }

    pub fn log_targets_updated(&self, components: usize) {
        info!(
            event = "targets_updated",
            node = %self.node_name,
            components = components,
            "Staged scaler target updates"
        );
    }

    pub fn log_actuation_failed(&self, component: &str, limit: Option<f64>, error: &str) {
        warn!(
            event = "actuation_failed",
            node = %self.node_name,
            component = %component,
            limit = ?limit,
            error = %error,
            "Failed to apply CPU limit, ending control loop"
        );
    }

    pub fn log_counter_read_failed(&self, component: &str, error: &str) {
        warn!(
            event = "counter_read_failed",
            node = %self.node_name,
            component = %component,
            error = %error,
            "Failed to read CPU counters, skipping component this tick"
        );
    }

    pub fn log_startup(&self, version: &str, listen_port: u16) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            listen_port = listen_port,
            "Autothrottle node daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Autothrottle node daemon shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_creation() {
        // Metrics live in the global registry; handles share one instance.
        let metrics = AgentMetrics::new();
        let other = metrics.clone();

        metrics.observe_tick_latency(0.003);
        metrics.inc_late_ticks();
        metrics.inc_cgroup_writes();
        other.set_component_limit("frontend", Some(0.5));
        other.set_component_limit("cache", None);
        other.set_captain_margin("frontend", 1.5);
        metrics.set_managed_components(2);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name(), "test-node");
    }
}

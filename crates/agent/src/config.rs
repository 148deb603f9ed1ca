//! Daemon configuration

use agent_lib::daemon::DEFAULT_LISTEN_PORT;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Control protocol port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// kubectl binary used for pod discovery
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_api_port() -> u16 {
    8080
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            listen_port: default_listen_port(),
            api_port: default_api_port(),
            cgroup_root: default_cgroup_root(),
            kubectl: default_kubectl(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        config
            .try_deserialize()
            .context("invalid AGENT_* configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_port, 12198);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.kubectl, "kubectl");
    }

    #[test]
    fn test_overrides() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"listen_port": 13000, "cgroup_root": "/tmp/cg"}"#).unwrap();
        assert_eq!(config.listen_port, 13000);
        assert_eq!(config.cgroup_root, PathBuf::from("/tmp/cg"));
    }
}

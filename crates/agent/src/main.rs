//! Autothrottle node daemon
//!
//! Runs on every worker node, samples the CPU counters of the pods it is
//! asked to manage and rewrites their CFS quotas every 100ms.

use agent_lib::{
    cgroup::{create_driver, CgroupVersion, KubectlResolver},
    daemon::NodeServer,
    health::{Component, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting autothrottle-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        cgroup_root = %config.cgroup_root.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(Component::ControlLoop).await;
    health_registry.register(Component::RpcServer).await;
    health_registry.register(Component::Cgroup).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.listen_port);

    let driver = create_driver(&config.cgroup_root).await;
    let slice_root = match driver.version() {
        CgroupVersion::V1 => config.cgroup_root.join("cpu"),
        _ => config.cgroup_root.clone(),
    };
    let resolver = Arc::new(KubectlResolver::new(config.kubectl.clone(), slice_root));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.listen_port))?;
    health_registry.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = NodeServer::new(driver, resolver, health_registry.clone(), logger.clone());
    let server_handle = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Control endpoint failed"),
        Err(e) => error!(error = %e, "Control endpoint task panicked"),
    }
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}

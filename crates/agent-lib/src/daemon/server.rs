//! TCP control endpoint
//!
//! Serves one client at a time. A connection's first request must be
//! `start`; the session ends on `stop`, end of stream, or any protocol error,
//! and the control loop is always joined before the socket is released.

use super::control_loop::{ControlLoop, LoopSummary};
use super::protocol::{Request, Response};
use super::session::{SessionState, SharedSession};
use crate::cgroup::{CgroupDriver, PodResolver};
use crate::error::{AgentError, Result};
use crate::health::{Component, HealthRegistry};
use crate::models::ScalerConfig;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::scaler::{build_scaler, Scaler};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Well-known control port
pub const DEFAULT_LISTEN_PORT: u16 = 12198;

/// A running control loop and its shared state
struct ActiveSession {
    state: SharedSession,
    handle: JoinHandle<LoopSummary>,
}

impl ActiveSession {
    /// Raise the stop flag and join the loop
    async fn stop(self) -> (SharedSession, LoopSummary) {
        self.state.lock().await.stop = true;
        let summary = match self.handle.await {
            Ok(summary) => summary,
            Err(e) => LoopSummary {
                failure: Some(format!("control loop task failed: {}", e)),
                ..Default::default()
            },
        };
        (self.state, summary)
    }
}

pub struct NodeServer {
    driver: Arc<dyn CgroupDriver>,
    resolver: Arc<dyn PodResolver>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl NodeServer {
    pub fn new(
        driver: Arc<dyn CgroupDriver>,
        resolver: Arc<dyn PodResolver>,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            driver,
            resolver,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Accept connections sequentially until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Control endpoint listening");
        self.health.set_healthy(Component::RpcServer).await;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    info!(peer = %peer, "Client connected");
                    match self.handle_connection(stream, &mut shutdown).await {
                        Ok(()) => info!(peer = %peer, "Client disconnected"),
                        Err(AgentError::ShuttingDown) => {
                            info!(peer = %peer, "Session aborted by shutdown");
                            break;
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Connection ended with error"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down control endpoint");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serve one client from `start` to `stop`
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let (namespace, component_names, scalers) = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Start {
                namespace,
                components,
                scalers,
            }) => (namespace, components, scalers),
            Ok(other) => {
                let message = format!("expected start, got {}", other.method());
                write_response(&mut writer, &Response::error(&message)).await?;
                return Err(AgentError::Protocol(message));
            }
            Err(e) => {
                write_response(&mut writer, &Response::error(e.to_string())).await?;
                return Err(AgentError::Protocol(format!("malformed request: {}", e)));
            }
        };

        let session = match self
            .start_session(&namespace, &component_names, &scalers)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                write_response(&mut writer, &Response::error(e.to_string())).await?;
                return Err(e);
            }
        };
        write_response(&mut writer, &Response::ok()).await?;

        let mut session = Some(session);
        let outcome = self
            .request_loop(&mut lines, &mut writer, &mut session, shutdown)
            .await;

        // anything but a clean stop still joins the loop
        if let Some(active) = session.take() {
            let (_, summary) = active.stop().await;
            let reason = match &outcome {
                Ok(()) => "connection closed".to_string(),
                Err(e) => e.to_string(),
            };
            self.finish_session(&summary, &reason).await;
        }
        outcome
    }

    async fn request_loop(
        &self,
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: &mut OwnedWriteHalf,
        session: &mut Option<ActiveSession>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = shutdown.recv() => return Err(AgentError::ShuttingDown),
            };
            let Some(line) = line else {
                return Ok(());
            };
            let request = serde_json::from_str::<Request>(&line)
                .map_err(|e| AgentError::Protocol(format!("malformed request: {}", e)))?;
            debug!(method = request.method(), "Request received");

            let Some(active) = session.as_ref() else {
                return Ok(());
            };
            match request {
                Request::Start { .. } => {
                    return Err(AgentError::Protocol("session already started".into()));
                }
                Request::Update { update } => {
                    let response = {
                        let mut state = active.state.lock().await;
                        if let Some(failure) = state.failure.clone() {
                            Response::error(failure)
                        } else {
                            let count = update.len();
                            state.stage_updates(update);
                            self.logger.log_targets_updated(count);
                            Response::ok()
                        }
                    };
                    write_response(writer, &response).await?;
                    if !response.ok {
                        return Err(AgentError::Protocol("control loop failed".into()));
                    }
                }
                Request::Stats => {
                    let response = {
                        let mut state = active.state.lock().await;
                        if let Some(failure) = state.failure.clone() {
                            Response::error(failure)
                        } else {
                            Response::with_stats(state.drain_current())
                        }
                    };
                    write_response(writer, &response).await?;
                    if !response.ok {
                        return Err(AgentError::Protocol("control loop failed".into()));
                    }
                }
                Request::Stop => {
                    let Some(active) = session.take() else {
                        return Ok(());
                    };
                    let (state, summary) = active.stop().await;
                    let history = state.lock().await.take_history();
                    let response = match &summary.failure {
                        Some(failure) => Response {
                            ok: false,
                            stats: Some(history),
                            error: Some(failure.clone()),
                        },
                        None => Response::with_stats(history),
                    };
                    self.finish_session(&summary, "stop requested").await;
                    write_response(writer, &response).await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn start_session(
        &self,
        namespace: &str,
        component_names: &[String],
        configs: &BTreeMap<String, ScalerConfig>,
    ) -> Result<ActiveSession> {
        for name in configs.keys() {
            if !component_names.contains(name) {
                return Err(AgentError::UnknownComponent(name.clone()));
            }
        }
        let scalers = configs
            .iter()
            .map(|(name, config)| Ok((name.clone(), build_scaler(config)?)))
            .collect::<Result<BTreeMap<String, Box<dyn Scaler>>>>()?;

        let pods = match self.resolver.resolve(namespace, component_names).await {
            Ok(pods) => pods,
            Err(e) => {
                self.health
                    .set_degraded(Component::Cgroup, format!("pod resolution failed: {}", e))
                    .await;
                return Err(e);
            }
        };
        self.logger
            .log_session_started(namespace, component_names.len(), pods.len());

        let state = SessionState::shared();
        let mut control = ControlLoop::new(
            Arc::clone(&self.driver),
            pods,
            scalers,
            Arc::clone(&state),
            self.logger.clone(),
        );
        if let Err(e) = control.reset_limits().await {
            self.health
                .set_unhealthy(Component::Cgroup, format!("quota reset failed: {}", e))
                .await;
            return Err(e);
        }
        self.health.set_healthy(Component::Cgroup).await;

        let handle = tokio::spawn(control.run());
        self.metrics.session_started();
        Ok(ActiveSession { state, handle })
    }

    async fn finish_session(&self, summary: &LoopSummary, reason: &str) {
        self.metrics.session_ended();
        match &summary.failure {
            Some(failure) => {
                self.health
                    .set_unhealthy(Component::ControlLoop, failure.clone())
                    .await;
            }
            None => {
                self.health
                    .report_tick_lateness(summary.late_ticks, summary.ticks)
                    .await;
            }
        }
        self.logger
            .log_session_stopped(summary.ticks, summary.late_ticks, reason);
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

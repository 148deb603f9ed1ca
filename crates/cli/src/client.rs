//! Client side of the node daemon control protocol
//!
//! Requests to different nodes overlap: a request is written to every node
//! before any response is read, and every node must answer `ok` before the
//! orchestrator moves on.

use crate::config::NodeAssignment;
use agent_lib::daemon::{Request, Response};
use agent_lib::models::{ScalerConfig, StatsMap, TargetUpdates};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("failed to connect to node {node}: {source}")]
    Connect {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to node {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("node {node} closed the connection")]
    Disconnected { node: String },

    #[error("node {node} sent an invalid response: {source}")]
    InvalidResponse {
        node: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("node {node} rejected {method}: {reason}")]
    Rejected {
        node: String,
        method: &'static str,
        reason: String,
    },

    #[error("component {component} reported by more than one node")]
    DuplicateComponent { component: String },
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// One open control connection
pub struct NodeClient {
    node: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl NodeClient {
    pub async fn connect(host: &str, port: u16) -> NodeResult<Self> {
        let node = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&node)
            .await
            .map_err(|source| NodeError::Connect {
                node: node.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            node,
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, request: &Request) -> NodeResult<()> {
        let mut line = serde_json::to_vec(request).map_err(NodeError::Encode)?;
        line.push(b'\n');
        debug!(node = %self.node, method = request.method(), "Sending request");
        self.writer
            .write_all(&line)
            .await
            .map_err(|source| NodeError::Io {
                node: self.node.clone(),
                source,
            })
    }

    /// Read one response; anything but `ok` is an error
    pub async fn receive(&mut self, method: &'static str) -> NodeResult<Response> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|source| NodeError::Io {
                node: self.node.clone(),
                source,
            })?
            .ok_or_else(|| NodeError::Disconnected {
                node: self.node.clone(),
            })?;
        let response: Response =
            serde_json::from_str(&line).map_err(|source| NodeError::InvalidResponse {
                node: self.node.clone(),
                source,
            })?;
        if !response.ok {
            return Err(NodeError::Rejected {
                node: self.node.clone(),
                method,
                reason: response
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        Ok(response)
    }
}

/// Connections to every node of the run
pub struct NodePool {
    clients: Vec<NodeClient>,
}

impl NodePool {
    pub async fn connect(nodes: &[NodeAssignment], port: u16) -> NodeResult<Self> {
        let mut clients = Vec::with_capacity(nodes.len());
        for node in nodes {
            clients.push(NodeClient::connect(&node.host, port).await?);
        }
        Ok(Self { clients })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Send one request per node, then wait for every response
    async fn broadcast(&mut self, requests: Vec<Request>) -> NodeResult<Vec<Response>> {
        let mut methods = Vec::with_capacity(requests.len());
        for (client, request) in self.clients.iter_mut().zip(requests.iter()) {
            client.send(request).await?;
            methods.push(request.method());
        }
        let mut responses = Vec::with_capacity(self.clients.len());
        for (client, method) in self.clients.iter_mut().zip(methods) {
            responses.push(client.receive(method).await?);
        }
        Ok(responses)
    }

    /// Start every node with its components and the scalers among them
    pub async fn start(
        &mut self,
        namespace: &str,
        nodes: &[NodeAssignment],
        scalers: &BTreeMap<String, ScalerConfig>,
    ) -> NodeResult<()> {
        let requests = nodes
            .iter()
            .map(|node| Request::Start {
                namespace: namespace.to_string(),
                components: node.components.clone(),
                scalers: node
                    .components
                    .iter()
                    .filter_map(|c| scalers.get(c).map(|s| (c.clone(), s.clone())))
                    .collect(),
            })
            .collect();
        self.broadcast(requests).await?;
        Ok(())
    }

    pub async fn update(&mut self, update: &TargetUpdates) -> NodeResult<()> {
        let requests = (0..self.clients.len())
            .map(|_| Request::Update {
                update: update.clone(),
            })
            .collect();
        self.broadcast(requests).await?;
        Ok(())
    }

    /// Records drained from every node since the previous poll
    pub async fn stats(&mut self) -> NodeResult<StatsMap> {
        let requests = (0..self.clients.len()).map(|_| Request::Stats).collect();
        let responses = self.broadcast(requests).await?;
        Ok(responses
            .into_iter()
            .flat_map(|response| response.stats.unwrap_or_default())
            .collect())
    }

    /// Stop every node and merge their full histories
    pub async fn stop(&mut self) -> NodeResult<StatsMap> {
        let requests = (0..self.clients.len()).map(|_| Request::Stop).collect();
        let responses = self.broadcast(requests).await?;
        let mut merged = StatsMap::new();
        for response in responses {
            for (component, records) in response.stats.unwrap_or_default() {
                if merged.contains_key(&component) {
                    return Err(NodeError::DuplicateComponent { component });
                }
                merged.insert(component, records);
            }
        }
        Ok(merged)
    }
}

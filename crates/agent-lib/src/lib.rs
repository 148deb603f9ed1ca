//! Autothrottle core library
//!
//! This crate provides the core functionality for:
//! - Per-component CPU limit controllers (scalers)
//! - cgroup v1/v2 counter reads and quota actuation
//! - The node daemon's control loop and line-oriented RPC endpoint
//! - Tuning towers that steer scaler targets from SLO feedback
//! - Health checks and observability

pub mod cgroup;
pub mod daemon;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod scaler;
pub mod tower;

pub use error::{AgentError, Result};
pub use health::{Component, HealthRegistry, HealthReport, Readiness, Status};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};

//! Agent error types.

use thiserror::Error;

/// Errors raised by the node daemon, its scalers and the cgroup drivers.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A computed quota falls below the kernel's 1ms granularity.
    #[error("cpu quota {quota_us}us is below the 1000us minimum (limit {limit} cores)")]
    QuotaBelowMinimum { limit: f64, quota_us: i64 },

    #[error("cpu period {0}us is outside 1000..=1000000")]
    InvalidPeriod(u64),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("invalid params for {kind} scaler: {reason}")]
    InvalidScalerParams { kind: &'static str, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("daemon shutting down")]
    ShuttingDown,

    #[error("failed to parse {file}: {reason}")]
    CounterParse { file: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

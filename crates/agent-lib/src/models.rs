//! Core data models shared by the node daemon and the orchestrator

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw cumulative CPU counters of one component, normalized to seconds and counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuCounters {
    /// Cumulative CPU time consumed (seconds)
    pub usage: f64,
    /// Cumulative number of enforcement periods
    pub nr_periods: u64,
    /// Cumulative number of periods in which the group was throttled
    pub nr_throttled: u64,
    /// Cumulative time spent throttled (seconds)
    pub throttled_time: f64,
}

/// One per-component sample, as recorded every tick and shipped over the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    #[serde(rename = "cpu_usage")]
    pub cpu_usage: f64,
    #[serde(rename = "cpu_stat.nr_periods")]
    pub nr_periods: u64,
    #[serde(rename = "cpu_stat.nr_throttled")]
    pub nr_throttled: u64,
    #[serde(rename = "cpu_stat.throttled_time")]
    pub throttled_time: f64,
    /// Applied limit in cores, `None` while unlimited
    #[serde(rename = "scaler.limit", default)]
    pub limit: Option<f64>,
    #[serde(
        rename = "captain.margin",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub margin: Option<f64>,
}

impl From<CpuCounters> for StatRecord {
    fn from(counters: CpuCounters) -> Self {
        Self {
            cpu_usage: counters.usage,
            nr_periods: counters.nr_periods,
            nr_throttled: counters.nr_throttled,
            throttled_time: counters.throttled_time,
            limit: None,
            margin: None,
        }
    }
}

/// A stat record stamped with wall-clock seconds, serialized as `[t, record]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedRecord(pub f64, pub StatRecord);

/// Per-component ordered records
pub type StatsMap = BTreeMap<String, Vec<TimedRecord>>;

/// Positional target arguments per component, e.g. `{"frontend": [0.1]}`
pub type TargetUpdates = BTreeMap<String, Vec<f64>>;

/// Scaler algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalerKind {
    #[serde(rename = "const")]
    Const,
    #[serde(rename = "k8s-cpu")]
    K8sCpu,
    #[serde(rename = "k8s-cpu-fast")]
    K8sCpuFast,
    #[serde(rename = "captain")]
    Captain,
}

impl ScalerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalerKind::Const => "const",
            ScalerKind::K8sCpu => "k8s-cpu",
            ScalerKind::K8sCpuFast => "k8s-cpu-fast",
            ScalerKind::Captain => "captain",
        }
    }
}

/// Scaler configuration record (`{"type": ..., "params": [...]}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerConfig {
    #[serde(rename = "type")]
    pub kind: ScalerKind,
    #[serde(default)]
    pub params: Vec<f64>,
}

impl ScalerConfig {
    pub fn new(kind: ScalerKind, params: Vec<f64>) -> Self {
        Self { kind, params }
    }
}

/// The orchestrator-level `_tower` record for one tick.
///
/// Holds the load generator's live numbers plus whatever the orchestrator and
/// the tower add while processing the tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TowerStats {
    #[serde(default)]
    pub rps: f64,
    #[serde(default)]
    pub p99_latency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explore: Option<usize>,
    /// Remaining percentiles and per-endpoint request rates
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
}

/// One (context, action, outcome) observation used to train the tower
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TowerSample {
    pub rps: f64,
    pub action: usize,
    pub action_p: f64,
    pub latency: f64,
    pub allocation: f64,
}

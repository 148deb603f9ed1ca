//! Experiment configuration
//!
//! One file describes one application under test: where its components run,
//! how the load generator is driven, the SLO and the tower's target grid.
//! Any key can be overridden through `AUTOTHROTTLE_*` environment variables
//! (`AUTOTHROTTLE_SLO=0.25`, `AUTOTHROTTLE_LOADGEN__WORKERS=4`).

use agent_lib::daemon::DEFAULT_LISTEN_PORT;
use agent_lib::models::{ScalerConfig, ScalerKind};
use agent_lib::tower::ActionGrid;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Components managed by the daemon on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub host: String,
    pub components: Vec<String>,
}

/// Load generator command line and file locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadGenConfig {
    #[serde(default = "default_loadgen_program")]
    pub program: String,
    pub locustfile: PathBuf,
    pub url: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Prefix of the CSV files written into the run directory
    #[serde(default = "default_csv_prefix")]
    pub csv_prefix: String,
    /// Per-request log appended by the load generator, in the working directory
    #[serde(default = "default_request_log")]
    pub request_log: PathBuf,
    /// Per-second request rates read by the load shape
    #[serde(default = "default_rps_file")]
    pub rps_file: PathBuf,
    /// Clock behind the `time` field of request log lines
    #[serde(default)]
    pub request_clock: RequestClock,
}

/// Clock a load generator stamps its request log with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClock {
    /// `CLOCK_MONOTONIC` seconds, what `time.perf_counter()` returns on Linux
    #[default]
    Monotonic,
    /// Unix epoch seconds
    Wall,
}

/// Shell commands bringing the application up and down
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub apply: Vec<String>,
    #[serde(default)]
    pub delete: Vec<String>,
    /// Wait until this many pods of the namespace are running after `apply`
    #[serde(default)]
    pub pod_count: Option<usize>,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

/// Baseline scaler swept over fixed targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub scaler: ScalerKind,
    pub targets: Vec<f64>,
}

/// One evaluated workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    /// One integer request rate per line
    #[serde(default)]
    pub trace: Option<PathBuf>,
    /// Constant request rate for an hour, used instead of `trace`
    #[serde(default)]
    pub constant_rps: Option<u64>,
    #[serde(default)]
    pub baselines: Vec<Baseline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Trace driving the warm-up runs
    pub warmup_trace: PathBuf,
    #[serde(default = "default_warmup_runs")]
    pub explore_runs: usize,
    #[serde(default = "default_warmup_runs")]
    pub bandit_runs: usize,
    #[serde(default = "default_bandit_explore")]
    pub bandit_explore: f64,
    /// Explore rate of the evaluated run
    #[serde(default)]
    pub final_explore: f64,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_result_file")]
    pub result_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Application name, also the default namespace
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub nodes: Vec<NodeAssignment>,
    #[serde(default = "default_node_port")]
    pub node_port: u16,
    #[serde(default)]
    pub target1_components: Vec<String>,
    /// p99 latency objective (seconds)
    pub slo: f64,
    #[serde(default = "default_targets")]
    pub targets: Vec<f64>,
    #[serde(default = "default_aggregate_samples")]
    pub aggregate_samples: f64,
    #[serde(default = "default_explore")]
    pub explore: f64,
    #[serde(default = "default_warmup_minutes")]
    pub warmup_minutes: usize,
    #[serde(default = "default_initial_limit")]
    pub initial_limit: f64,
    #[serde(default = "default_trace_multiplier")]
    pub trace_multiplier: f64,
    /// Directory runs are staged in before being renamed into place
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    pub loadgen: LoadGenConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub campaign: Option<CampaignConfig>,
}

fn default_loadgen_program() -> String {
    "locust".to_string()
}

fn default_workers() -> usize {
    8
}

fn default_csv_prefix() -> String {
    "locust".to_string()
}

fn default_request_log() -> PathBuf {
    PathBuf::from("request.log")
}

fn default_rps_file() -> PathBuf {
    PathBuf::from("rps.txt")
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_warmup_runs() -> usize {
    6
}

fn default_bandit_explore() -> f64 {
    0.5
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log.json")
}

fn default_result_file() -> PathBuf {
    PathBuf::from("result.csv")
}

fn default_node_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_targets() -> Vec<f64> {
    vec![0.0, 0.02, 0.04, 0.06, 0.1, 0.15, 0.2, 0.25, 0.3]
}

fn default_aggregate_samples() -> f64 {
    20.0
}

fn default_explore() -> f64 {
    0.1
}

fn default_warmup_minutes() -> usize {
    3
}

fn default_initial_limit() -> f64 {
    32.0
}

fn default_trace_multiplier() -> f64 {
    1.0
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("tmp")
}

impl ExperimentConfig {
    /// Load from a TOML/JSON/YAML file layered with `AUTOTHROTTLE_*` overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("AUTOTHROTTLE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read experiment config {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse experiment config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("no nodes configured");
        }
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            for component in &node.components {
                if !seen.insert(component.as_str()) {
                    bail!("component {} is assigned to more than one node", component);
                }
            }
        }
        for component in &self.target1_components {
            if !seen.contains(component.as_str()) {
                bail!("target1 component {} is not assigned to any node", component);
            }
        }
        if self.slo <= 0.0 {
            bail!("slo must be positive (got {})", self.slo);
        }
        if self.targets.is_empty() {
            bail!("target grid is empty");
        }
        if self.aggregate_samples <= 0.0 {
            bail!("aggregate_samples must be positive");
        }
        if !(0.0..=1.0).contains(&self.explore) {
            bail!("explore must be in [0, 1] (got {})", self.explore);
        }
        if self.loadgen.workers == 0 {
            bail!("load generator needs at least one worker");
        }
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }

    /// Every managed component, sorted
    pub fn components(&self) -> Vec<String> {
        let mut components: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|node| node.components.iter().cloned())
            .collect();
        components.sort();
        components
    }

    pub fn warmup_seconds(&self) -> usize {
        self.warmup_minutes * 60
    }

    /// The same scaler with `(target, initial_limit)` for every component
    pub fn uniform_scalers(&self, kind: ScalerKind, target: f64) -> BTreeMap<String, ScalerConfig> {
        self.components()
            .into_iter()
            .map(|component| {
                let params = match kind {
                    ScalerKind::Const => vec![target],
                    _ => vec![target, self.initial_limit],
                };
                (component, ScalerConfig::new(kind, params))
            })
            .collect()
    }

    pub fn action_grid(&self, kind: ScalerKind) -> Result<ActionGrid> {
        Ok(ActionGrid::new(
            kind,
            self.targets.clone(),
            self.target1_components.iter().cloned(),
        )?)
    }
}

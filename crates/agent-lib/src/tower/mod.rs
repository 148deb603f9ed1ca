//! Tuning policies that steer scaler targets from end-to-end observations
//!
//! A tower is invoked once per orchestrator tick with the aggregated
//! load/latency/allocation record and answers with target updates for the
//! scalers it tunes. Actions index an `N x N` grid of `(target1, target2)`
//! pairs: `target1` goes to the flagged components, `target2` to the rest.

mod bandit;
mod cost;
mod dummy;
mod explore;
mod learner;

pub use bandit::{VwTower, TRAINING_RESAMPLES};
pub use cost::{aggregate, median, shape_costs, CostedSample};
pub use dummy::DummyTower;
pub use explore::ExploreTower;
pub use learner::{ContextualBandit, RegressionBandit};

use crate::error::{AgentError, Result};
use crate::models::{ScalerConfig, ScalerKind, TargetUpdates, TowerSample, TowerStats};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Tuning policy contract
pub trait Tower: Send {
    /// Decide target updates for this tick; an empty map keeps every target.
    ///
    /// Towers record their bookkeeping (`action`, `action_p`, ...) into `stats`.
    fn decide(
        &mut self,
        now: f64,
        stats: &mut TowerStats,
        scalers: &BTreeMap<String, ScalerConfig>,
    ) -> TargetUpdates;

    fn name(&self) -> &'static str;
}

/// Candidate target grid for one scaler kind
#[derive(Debug, Clone, PartialEq)]
pub struct ActionGrid {
    scaler: ScalerKind,
    targets: Vec<f64>,
    target1_components: BTreeSet<String>,
}

impl ActionGrid {
    pub fn new(
        scaler: ScalerKind,
        targets: Vec<f64>,
        target1_components: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(AgentError::InvalidScalerParams {
                kind: scaler.as_str(),
                reason: "target grid is empty".into(),
            });
        }
        Ok(Self {
            scaler,
            targets,
            target1_components: target1_components.into_iter().collect(),
        })
    }

    /// Number of target levels per dimension
    pub fn levels(&self) -> usize {
        self.targets.len()
    }

    /// Number of actions, `N^2`
    pub fn actions(&self) -> usize {
        self.targets.len() * self.targets.len()
    }

    pub fn uniform_probability(&self) -> f64 {
        1.0 / self.actions() as f64
    }

    pub fn decode(&self, action: usize) -> (f64, f64) {
        let n = self.levels();
        (self.targets[action / n], self.targets[action % n])
    }

    /// Grid-adjacent actions (±1 in each dimension, clipped at the edges)
    pub fn neighbors(&self, action: usize) -> Vec<usize> {
        let n = self.levels();
        let (x, y) = (action / n, action % n);
        let mut neighbors = Vec::with_capacity(4);
        if x >= 1 {
            neighbors.push(action - n);
        }
        if x + 1 < n {
            neighbors.push(action + n);
        }
        if y >= 1 {
            neighbors.push(action - 1);
        }
        if y + 1 < n {
            neighbors.push(action + 1);
        }
        neighbors
    }

    /// Target updates for every scaler of the tuned kind
    pub fn updates(&self, action: usize, scalers: &BTreeMap<String, ScalerConfig>) -> TargetUpdates {
        let (target1, target2) = self.decode(action);
        scalers
            .iter()
            .filter(|(_, config)| config.kind == self.scaler)
            .map(|(name, _)| {
                let target = if self.target1_components.contains(name) {
                    target1
                } else {
                    target2
                };
                (name.clone(), vec![target])
            })
            .collect()
    }
}

fn default_explore() -> f64 {
    0.1
}

fn default_aggregate_samples() -> f64 {
    20.0
}

/// Tower selection as it appears in experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TowerConfig {
    Dummy,
    Explore {
        /// No-op ticks before exploring
        #[serde(default)]
        warmup: usize,
    },
    Vw {
        /// p99 latency objective (seconds)
        slo: f64,
        #[serde(default = "default_explore")]
        explore: f64,
        /// Observations discarded before sample capture starts
        #[serde(default)]
        drop_samples: usize,
        /// Request-rate bucket width used for aggregation
        #[serde(default = "default_aggregate_samples")]
        aggregate_samples: f64,
    },
}

impl TowerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            TowerConfig::Dummy => "dummy",
            TowerConfig::Explore { .. } => "explore",
            TowerConfig::Vw { .. } => "vw",
        }
    }
}

/// Build a tower; `seed` makes its random choices reproducible
pub fn build_tower(
    config: &TowerConfig,
    grid: ActionGrid,
    samples: Vec<TowerSample>,
    seed: Option<u64>,
) -> Result<Box<dyn Tower>> {
    let rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let tower: Box<dyn Tower> = match *config {
        TowerConfig::Dummy => Box::new(DummyTower),
        TowerConfig::Explore { warmup } => {
            Box::new(ExploreTower::new(grid, &samples, warmup, rng)?)
        }
        TowerConfig::Vw {
            slo,
            explore,
            drop_samples,
            aggregate_samples,
        } => {
            if !(0.0..=1.0).contains(&explore) || aggregate_samples <= 0.0 {
                return Err(AgentError::InvalidScalerParams {
                    kind: "vw",
                    reason: format!(
                        "explore must be in [0, 1] and aggregate_samples positive (got {}, {})",
                        explore, aggregate_samples
                    ),
                });
            }
            Box::new(VwTower::new(
                grid,
                slo,
                samples,
                explore,
                drop_samples,
                aggregate_samples,
                rng,
            ))
        }
    };
    Ok(tower)
}

//! Online contextual-bandit tower
//!
//! Every tick the learner is rebuilt from scratch: samples are cost-shaped
//! against the SLO, aggregated per (action, rps bucket), resampled and
//! replayed into a fresh learner, which then picks the next action for the
//! current request rate.

use super::cost::{aggregate, shape_costs};
use super::learner::{ContextualBandit, RegressionBandit};
use super::{ActionGrid, Tower};
use crate::models::{ScalerConfig, TargetUpdates, TowerSample, TowerStats};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Training examples drawn (with replacement) from the aggregated set per tick
pub const TRAINING_RESAMPLES: usize = 10_000;

const LEARNING_RATE: f64 = 0.5;

/// Action chosen on the previous tick, awaiting its observed outcome
#[derive(Debug, Clone, Copy)]
struct PendingAction {
    rps: f64,
    action: usize,
    probability: f64,
}

pub struct VwTower {
    grid: ActionGrid,
    slo: f64,
    samples: Vec<TowerSample>,
    explore: f64,
    drop_samples: usize,
    aggregate_samples: f64,
    pending: Option<PendingAction>,
    rng: SmallRng,
}

impl VwTower {
    pub fn new(
        grid: ActionGrid,
        slo: f64,
        samples: Vec<TowerSample>,
        explore: f64,
        drop_samples: usize,
        aggregate_samples: f64,
        rng: SmallRng,
    ) -> Self {
        Self {
            grid,
            slo,
            samples,
            explore,
            drop_samples,
            aggregate_samples,
            pending: None,
            rng,
        }
    }

    pub fn samples(&self) -> &[TowerSample] {
        &self.samples
    }

    /// Pair the previous action with the outcome observed this tick
    fn capture(&mut self, stats: &TowerStats) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if self.drop_samples > 0 {
            self.drop_samples -= 1;
            return;
        }
        let Some(allocation) = stats.allocation else {
            warn!("Tower record without allocation, sample discarded");
            return;
        };
        self.samples.push(TowerSample {
            rps: pending.rps,
            action: pending.action,
            action_p: pending.probability,
            latency: stats.p99_latency,
            allocation,
        });
    }

    fn train(&mut self) -> RegressionBandit {
        let actions = self.grid.actions();
        let costed = shape_costs(&self.samples, self.slo);
        let aggregated = aggregate(&costed, self.aggregate_samples, actions);

        let mut learner = RegressionBandit::new(actions, LEARNING_RATE, 0.0);
        if !aggregated.is_empty() {
            for _ in 0..TRAINING_RESAMPLES {
                let example = aggregated[self.rng.gen_range(0..aggregated.len())];
                learner.learn(example.rps, example.action, example.cost, example.probability);
            }
        }
        debug!(
            samples = self.samples.len(),
            aggregated = aggregated.len(),
            "Retrained bandit learner"
        );
        learner
    }

    fn sample(&mut self, distribution: &[f64]) -> usize {
        match WeightedIndex::new(distribution) {
            Ok(index) => index.sample(&mut self.rng),
            Err(e) => {
                warn!(error = %e, "Degenerate action distribution, taking the most likely action");
                distribution
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(action, _)| action)
                    .unwrap_or(0)
            }
        }
    }

    /// Mix the exploited action with its grid neighbours
    fn explore_distribution(&self, action: usize) -> Vec<f64> {
        let mut distribution = vec![0.0; self.grid.actions()];
        let neighbors = self.grid.neighbors(action);
        if neighbors.is_empty() {
            distribution[action] = 1.0;
            return distribution;
        }
        distribution[action] = 1.0 - self.explore;
        for neighbor in &neighbors {
            distribution[*neighbor] += self.explore / neighbors.len() as f64;
        }
        distribution
    }
}

impl Tower for VwTower {
    fn decide(
        &mut self,
        _now: f64,
        stats: &mut TowerStats,
        scalers: &BTreeMap<String, ScalerConfig>,
    ) -> TargetUpdates {
        self.capture(stats);
        let learner = self.train();

        let rps = stats.rps;
        let distribution = learner.predict(rps);
        let mut action = self.sample(&distribution);
        let mut probability = distribution[action];

        if probability >= 1.0 {
            stats.explore = Some(action);
            let distribution = self.explore_distribution(action);
            action = self.sample(&distribution);
            probability = distribution[action];
        }

        stats.action = Some(action);
        stats.action_p = Some(probability);
        self.pending = Some(PendingAction {
            rps,
            action,
            probability,
        });
        self.grid.updates(action, scalers)
    }

    fn name(&self) -> &'static str {
        "vw"
    }
}

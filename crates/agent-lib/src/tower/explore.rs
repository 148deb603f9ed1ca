//! Uniform data collection over the action grid
//!
//! Each round spans two ticks: the first applies a least-visited action, the
//! second records that action against the interval it governed.

use super::{ActionGrid, Tower};
use crate::error::{AgentError, Result};
use crate::models::{ScalerConfig, TargetUpdates, TowerSample, TowerStats};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Remaining no-op ticks before the first round
    Warmup(usize),
    Apply,
    Record(usize),
}

pub struct ExploreTower {
    grid: ActionGrid,
    visits: Vec<u64>,
    stage: Stage,
    rng: SmallRng,
}

impl ExploreTower {
    /// Visit counts are seeded from `samples`
    pub fn new(
        grid: ActionGrid,
        samples: &[TowerSample],
        warmup: usize,
        rng: SmallRng,
    ) -> Result<Self> {
        let mut visits = vec![0; grid.actions()];
        for sample in samples {
            let slot = visits.get_mut(sample.action).ok_or_else(|| {
                AgentError::Protocol(format!(
                    "sample action {} outside grid of {} actions",
                    sample.action,
                    grid.actions()
                ))
            })?;
            *slot += 1;
        }
        Ok(Self {
            grid,
            visits,
            stage: Stage::Warmup(warmup + 1),
            rng,
        })
    }

    pub fn visits(&self) -> &[u64] {
        &self.visits
    }

    fn pick_least_visited(&mut self) -> usize {
        let min = self.visits.iter().copied().min().unwrap_or(0);
        let candidates: Vec<usize> = self
            .visits
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == min)
            .map(|(action, _)| action)
            .collect();
        debug!(min_visits = min, candidates = candidates.len(), "Exploring");
        candidates.choose(&mut self.rng).copied().unwrap_or(0)
    }
}

impl Tower for ExploreTower {
    fn decide(
        &mut self,
        _now: f64,
        stats: &mut TowerStats,
        scalers: &BTreeMap<String, ScalerConfig>,
    ) -> TargetUpdates {
        match self.stage {
            Stage::Warmup(remaining) => {
                self.stage = if remaining > 1 {
                    Stage::Warmup(remaining - 1)
                } else {
                    Stage::Apply
                };
                TargetUpdates::new()
            }
            Stage::Apply => {
                let action = self.pick_least_visited();
                self.visits[action] += 1;
                self.stage = Stage::Record(action);
                self.grid.updates(action, scalers)
            }
            Stage::Record(action) => {
                stats.action = Some(action);
                stats.action_p = Some(self.grid.uniform_probability());
                self.stage = Stage::Apply;
                TargetUpdates::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "explore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScalerKind;
    use rand::SeedableRng;

    fn tower(samples: &[TowerSample], warmup: usize) -> ExploreTower {
        let grid = ActionGrid::new(
            ScalerKind::Captain,
            vec![0.0, 0.1, 0.2],
            vec!["a".to_string()],
        )
        .unwrap();
        ExploreTower::new(grid, samples, warmup, SmallRng::seed_from_u64(7)).unwrap()
    }

    fn scalers() -> BTreeMap<String, ScalerConfig> {
        BTreeMap::from([
            ("a".to_string(), ScalerConfig::new(ScalerKind::Captain, vec![0.1])),
            ("b".to_string(), ScalerConfig::new(ScalerKind::Captain, vec![0.1])),
        ])
    }

    #[test]
    fn test_warmup_ticks_are_noops() {
        let mut tower = tower(&[], 3);
        let scalers = scalers();
        for _ in 0..4 {
            let mut stats = TowerStats::default();
            assert!(tower.decide(0.0, &mut stats, &scalers).is_empty());
            assert!(stats.action.is_none());
        }
        let mut stats = TowerStats::default();
        assert_eq!(tower.decide(0.0, &mut stats, &scalers).len(), 2);
    }

    #[test]
    fn test_two_tick_rounds_record_action() {
        let mut tower = tower(&[], 0);
        let scalers = scalers();
        tower.decide(0.0, &mut TowerStats::default(), &scalers);

        let mut stats = TowerStats::default();
        let updates = tower.decide(1.0, &mut stats, &scalers);
        assert_eq!(updates.len(), 2);
        assert!(stats.action.is_none());

        let mut stats = TowerStats::default();
        assert!(tower.decide(2.0, &mut stats, &scalers).is_empty());
        let action = stats.action.unwrap();
        assert_eq!(stats.action_p, Some(1.0 / 9.0));
        let (target1, target2) = tower.grid.decode(action);
        assert_eq!(updates["a"], vec![target1]);
        assert_eq!(updates["b"], vec![target2]);
    }

    #[test]
    fn test_balanced_coverage() {
        let mut tower = tower(&[], 0);
        let scalers = scalers();
        tower.decide(0.0, &mut TowerStats::default(), &scalers);
        for round in 0..50 {
            tower.decide(0.0, &mut TowerStats::default(), &scalers);
            tower.decide(0.0, &mut TowerStats::default(), &scalers);
            let max = *tower.visits().iter().max().unwrap();
            let min = *tower.visits().iter().min().unwrap();
            assert!(max - min <= 1, "round {}: {:?}", round, tower.visits());
            assert!(min >= (round as u64 + 1) / 9);
        }
    }

    #[test]
    fn test_seeded_counts_prefer_unvisited() {
        let samples: Vec<TowerSample> = (0..8)
            .map(|action| TowerSample {
                rps: 100.0,
                action,
                action_p: 1.0 / 9.0,
                latency: 0.1,
                allocation: 1.0,
            })
            .collect();
        let mut tower = tower(&samples, 0);
        let scalers = scalers();
        tower.decide(0.0, &mut TowerStats::default(), &scalers);
        tower.decide(0.0, &mut TowerStats::default(), &scalers);
        let mut stats = TowerStats::default();
        tower.decide(0.0, &mut stats, &scalers);
        assert_eq!(stats.action, Some(8));
    }

    #[test]
    fn test_sample_outside_grid_rejected() {
        let grid = ActionGrid::new(ScalerKind::Captain, vec![0.1], Vec::new()).unwrap();
        let sample = TowerSample {
            rps: 1.0,
            action: 3,
            action_p: 1.0,
            latency: 0.1,
            allocation: 1.0,
        };
        assert!(ExploreTower::new(grid, &[sample], 0, SmallRng::seed_from_u64(1)).is_err());
    }
}

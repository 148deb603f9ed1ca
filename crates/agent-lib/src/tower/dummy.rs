use super::Tower;
use crate::models::{ScalerConfig, TargetUpdates, TowerStats};
use std::collections::BTreeMap;

/// Leaves every target untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyTower;

impl Tower for DummyTower {
    fn decide(
        &mut self,
        _now: f64,
        _stats: &mut TowerStats,
        _scalers: &BTreeMap<String, ScalerConfig>,
    ) -> TargetUpdates {
        TargetUpdates::new()
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

//! Usage-ratio scalers modelled on the Kubernetes autoscaler
//!
//! Every `period` the instantaneous usage rate is divided by the target
//! utilization and pushed into a stabilization window; the limit is the
//! maximum recommendation in that window, so scale-down only happens once a
//! high recommendation has aged out.

use super::Scaler;
use crate::error::{AgentError, Result};
use crate::models::{ScalerKind, StatRecord};
use std::collections::VecDeque;

/// Tolerance when comparing tick times against the decision period
const PERIOD_EPSILON: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct K8sCpuScaler {
    kind: ScalerKind,
    period: f64,
    target: f64,
    limit: f64,
    recommend_len: usize,
    recommendations: VecDeque<f64>,
    /// Time and cumulative usage at the last decision
    last: Option<(f64, f64)>,
}

impl K8sCpuScaler {
    /// Standard variant: 15s period, 300s stabilization window
    pub fn standard(target: f64, initial_limit: f64) -> Result<Self> {
        Self::new(ScalerKind::K8sCpu, 15.0, 300.0, target, initial_limit)
    }

    /// Fast variant: 1s period, 20s stabilization window
    pub fn fast(target: f64, initial_limit: f64) -> Result<Self> {
        Self::new(ScalerKind::K8sCpuFast, 1.0, 20.0, target, initial_limit)
    }

    fn new(
        kind: ScalerKind,
        period: f64,
        stabilization: f64,
        target: f64,
        initial_limit: f64,
    ) -> Result<Self> {
        validate_target(kind, target)?;
        let recommend_len = ((stabilization / period).floor() as usize).max(1);
        Ok(Self {
            kind,
            period,
            target,
            limit: initial_limit,
            recommend_len,
            recommendations: VecDeque::with_capacity(recommend_len + 1),
            last: None,
        })
    }

    pub fn window_len(&self) -> usize {
        self.recommend_len
    }

    fn scale(&mut self, usage: f64) {
        self.recommendations.push_back(usage / self.target);
        while self.recommendations.len() > self.recommend_len {
            self.recommendations.pop_front();
        }
        self.limit = self
            .recommendations
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
    }
}

fn validate_target(kind: ScalerKind, target: f64) -> Result<()> {
    if target.is_finite() && target > 0.0 {
        Ok(())
    } else {
        Err(AgentError::InvalidScalerParams {
            kind: kind.as_str(),
            reason: format!("target utilization must be positive, got {}", target),
        })
    }
}

impl Scaler for K8sCpuScaler {
    fn tick(&mut self, now: f64, stats: &mut StatRecord) -> Option<f64> {
        let Some((last_t, last_usage)) = self.last else {
            self.last = Some((now, stats.cpu_usage));
            return Some(self.limit);
        };
        if now < last_t + self.period - PERIOD_EPSILON {
            return None;
        }

        let usage = (stats.cpu_usage - last_usage) / (now - last_t);
        self.scale(usage);
        self.last = Some((now, stats.cpu_usage));
        Some(self.limit)
    }

    fn update(&mut self, target: f64) -> Result<()> {
        validate_target(self.kind, target)?;
        self.target = target;
        Ok(())
    }

    fn limit(&self) -> f64 {
        self.limit
    }

    fn kind(&self) -> ScalerKind {
        self.kind
    }
}

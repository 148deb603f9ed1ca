//! Fixed-limit scaler

use super::Scaler;
use crate::error::{AgentError, Result};
use crate::models::{ScalerKind, StatRecord};

/// Holds a fixed limit until explicitly replaced.
#[derive(Debug, Clone)]
pub struct ConstScaler {
    limit: f64,
}

impl ConstScaler {
    pub fn new(limit: f64) -> Result<Self> {
        validate_limit(limit)?;
        Ok(Self { limit })
    }
}

fn validate_limit(limit: f64) -> Result<()> {
    if limit.is_finite() && limit > 0.0 {
        Ok(())
    } else {
        Err(AgentError::InvalidScalerParams {
            kind: ScalerKind::Const.as_str(),
            reason: format!("limit must be a positive core count, got {}", limit),
        })
    }
}

impl Scaler for ConstScaler {
    fn tick(&mut self, _now: f64, _stats: &mut StatRecord) -> Option<f64> {
        Some(self.limit)
    }

    fn update(&mut self, limit: f64) -> Result<()> {
        validate_limit(limit)?;
        self.limit = limit;
        Ok(())
    }

    fn limit(&self) -> f64 {
        self.limit
    }

    fn kind(&self) -> ScalerKind {
        ScalerKind::Const
    }
}

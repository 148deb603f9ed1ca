//! Per-component CPU limit controllers
//!
//! Each managed component owns one scaler. The node daemon invokes `tick`
//! once per 100ms sample; `update` swaps the setpoint, which the scaler
//! honours at its own next decision point.

mod captain;
mod constant;
mod k8s_cpu;
mod window;

pub use captain::{CaptainScaler, MIN_LIMIT};
pub use constant::ConstScaler;
pub use k8s_cpu::K8sCpuScaler;
pub use window::SlidingWindow;

use crate::error::{AgentError, Result};
use crate::models::{ScalerConfig, ScalerKind, StatRecord};

/// Initial limit used when a config record omits it (cores)
pub const DEFAULT_INITIAL_LIMIT: f64 = 1.0;

/// Control algorithm contract
pub trait Scaler: Send + Sync {
    /// Feed one sample taken at `now` (seconds).
    ///
    /// Returns the new limit in cores, or `None` to keep the previous one.
    /// Scalers may annotate `stats` with their own observables.
    fn tick(&mut self, now: f64, stats: &mut StatRecord) -> Option<f64>;

    /// Replace the setpoint
    fn update(&mut self, target: f64) -> Result<()>;

    /// Most recently computed limit
    fn limit(&self) -> f64;

    fn kind(&self) -> ScalerKind;

    /// Integrator state, for controllers that keep one
    fn margin(&self) -> Option<f64> {
        None
    }
}

/// Build a scaler from its `{type, params}` record
pub fn build_scaler(config: &ScalerConfig) -> Result<Box<dyn Scaler>> {
    let params = &config.params;
    let first = |name: &str| {
        params
            .first()
            .copied()
            .ok_or_else(|| AgentError::InvalidScalerParams {
                kind: config.kind.as_str(),
                reason: format!("missing {}", name),
            })
    };
    let initial_limit = params.get(1).copied().unwrap_or(DEFAULT_INITIAL_LIMIT);
    if params.len() > 2 {
        return Err(AgentError::InvalidScalerParams {
            kind: config.kind.as_str(),
            reason: format!("expected at most 2 params, got {}", params.len()),
        });
    }

    let scaler: Box<dyn Scaler> = match config.kind {
        ScalerKind::Const => Box::new(ConstScaler::new(first("limit")?)?),
        ScalerKind::K8sCpu => Box::new(K8sCpuScaler::standard(first("target")?, initial_limit)?),
        ScalerKind::K8sCpuFast => Box::new(K8sCpuScaler::fast(first("target")?, initial_limit)?),
        ScalerKind::Captain => Box::new(CaptainScaler::new(first("target")?, initial_limit)?),
    };
    Ok(scaler)
}

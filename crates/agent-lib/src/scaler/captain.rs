//! Throttling-driven feedback controller
//!
//! Samples at the daemon's 100ms cadence and makes its main decision once
//! per `period`. Two windows are kept: per-tick `nr_throttled` deltas over the
//! last second and per-tick usage rates over the last five seconds.
//!
//! Main decision (every period):
//! - `margin += throttled_rate - target`, floored at zero
//! - heavy throttling (`> 3 * target`) scales up proportionally to the excess
//! - otherwise the limit drops towards `usage_max + usage_std * margin`,
//!   at most halving per decision
//!
//! Between decisions, a throttle spike right after a scale-down reflects the
//! limit back across its pre-scale-down value.

use super::window::SlidingWindow;
use super::Scaler;
use crate::error::{AgentError, Result};
use crate::models::{ScalerKind, StatRecord};

/// Decision period in seconds
const DECISION_PERIOD: f64 = 1.0;

/// Samples per second at the fixed 100ms granularity
const TICKS_PER_SECOND: usize = 10;

/// Usage history length (five seconds of ticks)
const USAGE_WINDOW: usize = 50;

const INITIAL_MARGIN: f64 = 3.0;

/// Lowest limit the controller will hand out (cores)
pub const MIN_LIMIT: f64 = 0.01;

/// Tolerance when comparing tick times against the decision period
const PERIOD_EPSILON: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct CaptainScaler {
    target: f64,
    period: f64,

    limit: f64,
    last_limit: f64,
    throttled_history: SlidingWindow,
    usage_history: SlidingWindow,
    margin: f64,
    /// Never incremented; the cooldown check always passes.
    scale_down_cd: u32,
    last_scale_down: bool,

    /// Time, cumulative usage and cumulative throttled count of the previous tick
    last: Option<(f64, f64, u64)>,
    last_scale_t: f64,
}

impl CaptainScaler {
    pub fn new(target: f64, initial_limit: f64) -> Result<Self> {
        validate_target(target)?;
        Ok(Self {
            target,
            period: DECISION_PERIOD,
            limit: initial_limit,
            last_limit: initial_limit,
            throttled_history: SlidingWindow::zeroed(TICKS_PER_SECOND * DECISION_PERIOD as usize),
            usage_history: SlidingWindow::zeroed(USAGE_WINDOW),
            margin: INITIAL_MARGIN,
            scale_down_cd: 0,
            last_scale_down: false,
            last: None,
            last_scale_t: 0.0,
        })
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    /// Undo a scale-down that caused heavy throttling before the next decision
    fn roll_back_scale_down(&mut self, throttled_rate: f64) -> bool {
        if !(throttled_rate > 3.0 * self.target && self.last_scale_down) {
            return false;
        }
        self.limit = 2.0 * self.last_limit - self.limit;
        self.margin += throttled_rate - self.target;
        self.throttled_history.reset();
        self.last_scale_down = false;
        true
    }

    fn decide(&mut self) {
        self.last_limit = self.limit;
        let throttled_rate = self.throttled_history.mean();
        let usage_max = self.usage_history.max();
        let usage_std = self.usage_history.std_dev();

        self.margin = (self.margin + throttled_rate - self.target).max(0.0);
        self.last_scale_down = false;
        if throttled_rate > 3.0 * self.target {
            self.limit *= 1.0 + (throttled_rate - 3.0 * self.target);
        } else {
            let usage_ceiling = usage_max + usage_std * self.margin;
            if usage_ceiling <= self.limit * 0.9 && self.scale_down_cd == 0 {
                self.limit = (self.limit * 0.5).max(usage_ceiling);
                self.last_scale_down = true;
            }
        }
        self.throttled_history.reset();
        self.limit = self.limit.max(MIN_LIMIT);
    }
}

fn validate_target(target: f64) -> Result<()> {
    if target.is_finite() && target >= 0.0 {
        Ok(())
    } else {
        Err(AgentError::InvalidScalerParams {
            kind: ScalerKind::Captain.as_str(),
            reason: format!("throttled-rate target must be non-negative, got {}", target),
        })
    }
}

impl Scaler for CaptainScaler {
    fn tick(&mut self, now: f64, stats: &mut StatRecord) -> Option<f64> {
        let Some((last_t, last_usage, last_throttled)) = self.last else {
            self.last = Some((now, stats.cpu_usage, stats.nr_throttled));
            self.last_scale_t = now;
            return Some(self.limit);
        };

        let new_throttled = stats.nr_throttled.saturating_sub(last_throttled) as f64;
        self.throttled_history.push(new_throttled);
        let elapsed = now - last_t;
        let new_usage = if elapsed > 0.0 {
            (stats.cpu_usage - last_usage) / elapsed
        } else {
            0.0
        };
        self.usage_history.push(new_usage);
        self.last = Some((now, stats.cpu_usage, stats.nr_throttled));

        let rolled_back = self.roll_back_scale_down(self.throttled_history.mean());

        if now < self.last_scale_t + self.period - PERIOD_EPSILON {
            return rolled_back.then_some(self.limit);
        }

        self.decide();
        self.last_scale_t = now;
        stats.margin = Some(self.margin);
        Some(self.limit)
    }

    fn update(&mut self, target: f64) -> Result<()> {
        validate_target(target)?;
        self.target = target;
        Ok(())
    }

    fn limit(&self) -> f64 {
        self.limit
    }

    fn kind(&self) -> ScalerKind {
        ScalerKind::Captain
    }

    fn margin(&self) -> Option<f64> {
        Some(self.margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a scaler with 100ms ticks from synthetic counters
    struct Driver {
        scaler: CaptainScaler,
        tick: u64,
        usage: f64,
        throttled: u64,
    }

    impl Driver {
        fn new(target: f64, initial_limit: f64) -> Self {
            let mut scaler = CaptainScaler::new(target, initial_limit).unwrap();
            let mut stats = StatRecord::default();
            scaler.tick(0.0, &mut stats);
            Self {
                scaler,
                tick: 0,
                usage: 0.0,
                throttled: 0,
            }
        }

        /// One 100ms step with the given usage rate and throttled-period count
        fn step(&mut self, usage_rate: f64, throttled: u64) -> (Option<f64>, StatRecord) {
            self.tick += 1;
            self.usage += usage_rate * 0.1;
            self.throttled += throttled;
            let mut stats = StatRecord {
                cpu_usage: self.usage,
                nr_throttled: self.throttled,
                ..Default::default()
            };
            let limit = self.scaler.tick(self.tick as f64 / 10.0, &mut stats);
            (limit, stats)
        }
    }

    #[test]
    fn test_first_tick_initializes_limit() {
        let mut scaler = CaptainScaler::new(0.1, 2.0).unwrap();
        assert_eq!(scaler.tick(5.0, &mut StatRecord::default()), Some(2.0));
    }

    #[test]
    fn test_intermediate_ticks_keep_limit() {
        let mut driver = Driver::new(0.1, 2.0);
        for _ in 0..9 {
            let (limit, stats) = driver.step(0.5, 0);
            assert_eq!(limit, None);
            assert!(stats.margin.is_none());
        }
        let (limit, stats) = driver.step(0.5, 0);
        assert!(limit.is_some());
        assert!(stats.margin.is_some());
    }

    #[test]
    fn test_limit_never_below_floor() {
        let mut driver = Driver::new(0.0, 4.0);
        for _ in 0..600 {
            driver.step(0.0, 0);
            assert!(driver.scaler.limit() >= MIN_LIMIT);
        }
        assert!((driver.scaler.limit() - MIN_LIMIT).abs() < 1e-12);
    }

    #[test]
    fn test_idle_component_scales_down_to_usage_max() {
        let mut driver = Driver::new(0.1, 4.0);
        let mut last_margin = driver.scaler.margin();
        for _ in 0..600 {
            let (_, stats) = driver.step(0.5, 0);
            if let Some(margin) = stats.margin {
                assert!(margin <= last_margin);
                last_margin = margin;
            }
        }
        assert_eq!(driver.scaler.margin(), 0.0);
        // settles within the 10% scale-down hysteresis above usage_max
        let limit = driver.scaler.limit();
        assert!(limit >= 0.5 - 1e-9, "limit {}", limit);
        assert!(limit <= 0.5 / 0.9 + 1e-9, "limit {}", limit);
    }

    #[test]
    fn test_sustained_throttling_raises_margin_and_limit() {
        let mut driver = Driver::new(0.1, 1.0);
        let mut last_margin = driver.scaler.margin();
        let mut last_limit = driver.scaler.limit();
        for _ in 0..50 {
            let (limit, stats) = driver.step(1.0, 1);
            if let Some(margin) = stats.margin {
                assert!(margin > last_margin);
                last_margin = margin;
                let limit = limit.unwrap();
                assert!(limit > last_limit);
                last_limit = limit;
            }
        }
    }

    #[test]
    fn test_throttle_spike_rolls_back_scale_down() {
        let mut driver = Driver::new(0.1, 4.0);
        let mut scaled_down = None;
        for _ in 0..10 {
            let (limit, _) = driver.step(0.5, 0);
            if let Some(limit) = limit {
                scaled_down = Some(limit);
            }
        }
        let limit_at_t = scaled_down.unwrap();
        assert!(driver.scaler.last_scale_down);
        let last_limit_at_t = driver.scaler.last_limit;
        assert!(limit_at_t < last_limit_at_t);
        let margin_at_t = driver.scaler.margin();

        // throttled in every period; the window mean crosses 3x target on the 4th sample
        let mut rolled = None;
        for _ in 0..4 {
            let (limit, _) = driver.step(0.5, 1);
            if limit.is_some() {
                rolled = limit;
            }
        }
        let rolled = rolled.expect("rollback should fire mid-period");
        assert_eq!(rolled, 2.0 * last_limit_at_t - limit_at_t);
        assert!(!driver.scaler.last_scale_down);
        assert!((driver.scaler.margin() - (margin_at_t + 0.4 - 0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_update_applies_at_next_decision() {
        let mut driver = Driver::new(0.1, 1.0);
        for _ in 0..10 {
            driver.step(0.2, 0);
        }
        let margin = driver.scaler.margin();
        driver.scaler.update(0.5).unwrap();
        for _ in 0..10 {
            driver.step(0.2, 0);
        }
        assert!((driver.scaler.margin() - (margin - 0.5).max(0.0)).abs() < 1e-9);
        assert!(driver.scaler.update(-0.1).is_err());
    }
}

//! The 100ms sample-decide-actuate loop
//!
//! Ticks are phase-aligned to 97ms past each 100ms wall-clock boundary so
//! that reads, scaler decisions and quota writes finish before the kernel's
//! next enforcement period starts.

use super::session::SharedSession;
use crate::cgroup::{CgroupDriver, CpuQuota, PodCgroup, DEFAULT_PERIOD_US};
use crate::error::Result;
use crate::models::{StatRecord, TargetUpdates};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::scaler::{Scaler, MIN_LIMIT};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sampling interval in seconds
pub const TICK_INTERVAL: f64 = 0.1;

/// Offset of each tick within its 100ms slot
pub const TICK_PHASE: f64 = 0.097;

/// Limit changes smaller than this are not written
pub const LIMIT_EPSILON: f64 = 1e-5;

/// Delay from `now` until the next tick phase (seconds, in `[0, 0.1)`)
pub fn next_tick_delay(now: f64) -> f64 {
    ((TICK_PHASE - now) * 1000.0).rem_euclid(TICK_INTERVAL * 1000.0) / 1000.0
}

/// The 100ms boundary following `t`
pub fn tick_deadline(t: f64) -> f64 {
    t + (-t * 1000.0).rem_euclid(TICK_INTERVAL * 1000.0) / 1000.0
}

/// Wall-clock seconds derived from a monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    base_instant: Instant,
    base_wall: f64,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: chrono::Utc::now().timestamp_micros() as f64 / 1e6,
        }
    }

    pub fn now(&self) -> f64 {
        self.base_wall + self.base_instant.elapsed().as_secs_f64()
    }

    /// Monotonic instant corresponding to wall time `t`
    pub fn instant_at(&self, t: f64) -> Instant {
        let offset = (t - self.base_wall).max(0.0);
        self.base_instant + Duration::from_secs_f64(offset)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One resolved component; `scaler` is `None` for monitor-only components
struct ManagedComponent {
    name: String,
    pod: PodCgroup,
    scaler: Option<Box<dyn Scaler>>,
    /// Limit currently written to the cgroup (`None` = unlimited)
    applied: Option<f64>,
}

/// Outcome of a finished control loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub late_ticks: u64,
    pub failure: Option<String>,
}

pub struct ControlLoop {
    driver: Arc<dyn CgroupDriver>,
    components: Vec<ManagedComponent>,
    session: SharedSession,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    clock: WallClock,
    ticks: u64,
    late_ticks: u64,
}

impl ControlLoop {
    /// Scalers for components missing from `pods` are dropped
    pub fn new(
        driver: Arc<dyn CgroupDriver>,
        pods: BTreeMap<String, PodCgroup>,
        mut scalers: BTreeMap<String, Box<dyn Scaler>>,
        session: SharedSession,
        logger: StructuredLogger,
    ) -> Self {
        let components = pods
            .into_iter()
            .map(|(name, pod)| ManagedComponent {
                scaler: scalers.remove(&name),
                name,
                pod,
                applied: None,
            })
            .collect();
        for name in scalers.keys() {
            warn!(component = %name, "No cgroup resolved, scaler disabled");
        }

        Self {
            driver,
            components,
            session,
            metrics: AgentMetrics::new(),
            logger,
            clock: WallClock::new(),
            ticks: 0,
            late_ticks: 0,
        }
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.name.clone()).collect()
    }

    /// Lift every managed quota before the first tick
    pub async fn reset_limits(&mut self) -> Result<()> {
        for component in &mut self.components {
            self.driver
                .write_quota(&component.pod, CpuQuota::unlimited())
                .await?;
            component.applied = None;
            self.metrics.inc_cgroup_writes();
        }
        let names = self.component_names();
        self.session.lock().await.register_components(&names);
        self.metrics.set_managed_components(names.len() as i64);
        Ok(())
    }

    /// Run until the session's stop flag is seen or actuation fails
    pub async fn run(mut self) -> LoopSummary {
        info!(components = self.components.len(), "Starting control loop");

        let failure = loop {
            let now = self.clock.now();
            let t = now + next_tick_delay(now);
            tokio::time::sleep_until(self.clock.instant_at(t)).await;
            if self.session.lock().await.stop {
                break None;
            }

            let started = Instant::now();
            let result = self.tick(t).await;
            self.metrics
                .observe_tick_latency(started.elapsed().as_secs_f64());

            match result {
                Ok(records) => {
                    self.ticks += 1;
                    self.session.lock().await.record(t, records);
                }
                Err(message) => {
                    self.session.lock().await.failure = Some(message.clone());
                    break Some(message);
                }
            }
        };

        if self.late_ticks > 0 {
            warn!(late_ticks = self.late_ticks, ticks = self.ticks, "Control loop ran late");
        }
        LoopSummary {
            ticks: self.ticks,
            late_ticks: self.late_ticks,
            failure,
        }
    }

    /// One sample-decide-actuate pass; `Err` carries the actuation failure
    async fn tick(&mut self, t: f64) -> std::result::Result<BTreeMap<String, StatRecord>, String> {
        let mut records = BTreeMap::new();
        for component in &self.components {
            match self.driver.read_counters(&component.pod).await {
                Ok(counters) => {
                    records.insert(component.name.clone(), StatRecord::from(counters));
                }
                Err(e) => {
                    self.metrics.inc_counter_read_errors();
                    self.logger
                        .log_counter_read_failed(&component.name, &e.to_string());
                }
            }
        }

        if self.clock.now() > tick_deadline(t) {
            self.late_ticks += 1;
            self.metrics.inc_late_ticks();
        }

        let updates = self.session.lock().await.take_updates();
        if !updates.is_empty() {
            self.apply_updates(updates);
        }

        for component in &mut self.components {
            let Some(stats) = records.get_mut(&component.name) else {
                continue;
            };
            if let Some(scaler) = component.scaler.as_mut() {
                if let Some(limit) = scaler.tick(t, stats) {
                    let mut limit = limit.max(MIN_LIMIT);
                    if let Some(applied) = component.applied {
                        if (limit - applied).abs() < LIMIT_EPSILON {
                            limit = applied;
                        }
                    }
                    if component.applied != Some(limit) {
                        let written = match CpuQuota::from_limit(Some(limit), DEFAULT_PERIOD_US) {
                            Ok(quota) => self.driver.write_quota(&component.pod, quota).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            self.logger.log_actuation_failed(
                                &component.name,
                                Some(limit),
                                &e.to_string(),
                            );
                            return Err(format!("{}: {}", component.name, e));
                        }
                        self.metrics.inc_cgroup_writes();
                        self.metrics
                            .set_component_limit(&component.name, Some(limit));
                        component.applied = Some(limit);
                    }
                }
                if let Some(margin) = scaler.margin() {
                    self.metrics.set_captain_margin(&component.name, margin);
                }
            }
            stats.limit = component.applied;
        }

        Ok(records)
    }

    fn apply_updates(&mut self, updates: TargetUpdates) {
        for (name, args) in updates {
            let Some(scaler) = self
                .components
                .iter_mut()
                .find(|c| c.name == name)
                .and_then(|c| c.scaler.as_mut())
            else {
                debug!(component = %name, "Ignoring update for component without scaler");
                continue;
            };
            let Some(&target) = args.first() else {
                warn!(component = %name, "Ignoring update without arguments");
                continue;
            };
            if let Err(e) = scaler.update(target) {
                warn!(component = %name, error = %e, "Rejected scaler update");
            }
        }
    }
}

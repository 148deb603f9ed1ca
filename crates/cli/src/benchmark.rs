//! One closed-loop benchmark run
//!
//! Deploys the application, starts the node daemons, replays the load trace
//! and feeds the tower once per new load generator sample until the load
//! generator exits. The run directory only appears once everything has been
//! persisted; teardown always runs.

use crate::client::NodePool;
use crate::config::{ExperimentConfig, RequestClock};
use crate::deploy::Deployment;
use crate::history::{self, RunHistory, RunSummary};
use crate::loadgen::{LiveStats, LoadGenerator};
use crate::output;
use agent_lib::models::{ScalerConfig, StatsMap, TowerStats};
use agent_lib::tower::Tower;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_secs(1);

pub const SUMMARY_FILE: &str = "summary.json";

/// Current wall-clock time in seconds
fn wall_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// `CLOCK_MONOTONIC` in seconds
fn monotonic_now() -> Result<f64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes through the valid pointer
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return Err(std::io::Error::last_os_error()).context("clock_gettime(CLOCK_MONOTONIC)");
    }
    Ok(ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9)
}

/// Offset taking request log times to seconds since the run start.
///
/// `monotonic_base` is wall time minus monotonic time, sampled together.
pub fn request_time_shift(clock: RequestClock, time_base: f64, monotonic_base: f64) -> f64 {
    match clock {
        RequestClock::Monotonic => monotonic_base - time_base,
        RequestClock::Wall => -time_base,
    }
}

/// Ask every node to stop after a failed run; the error that ended the run wins
async fn stop_after_failure(pool: &mut NodePool) {
    if let Err(e) = pool.stop().await {
        warn!(error = %e, "Failed to stop nodes after control failure");
    }
}

/// Sum of each scaled component's mean limit since the previous poll.
///
/// `None` when a scaled component reported no limited samples.
pub fn allocation(local: &StatsMap, scalers: &BTreeMap<String, ScalerConfig>) -> Option<f64> {
    let mut total = 0.0;
    for component in scalers.keys() {
        let limits: Vec<f64> = local
            .get(component)
            .into_iter()
            .flatten()
            .filter_map(|record| record.1.limit)
            .collect();
        if limits.is_empty() {
            warn!(component = %component, "No samples since last poll");
            return None;
        }
        total += limits.iter().sum::<f64>() / limits.len() as f64;
    }
    Some(total)
}

struct Run<'a> {
    config: &'a ExperimentConfig,
    scalers: &'a BTreeMap<String, ScalerConfig>,
    staging: PathBuf,
}

impl Run<'_> {
    /// Poll, decide and update until the load generator exits
    async fn control(
        &self,
        pool: &mut NodePool,
        loadgen: &mut LoadGenerator,
        tower: &mut dyn Tower,
    ) -> Result<Vec<(f64, TowerStats)>> {
        let mut live = LiveStats::new(&self.staging, &self.config.loadgen.csv_prefix);
        let mut records = Vec::new();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if loadgen.finished()? {
                break;
            }
            let t = wall_now();

            let mut stats = match live.poll().await {
                Ok(Some(stats)) => stats,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to parse load generator stats");
                    continue;
                }
            };

            let local = pool.stats().await.context("Failed to fetch node stats")?;
            stats.allocation = allocation(&local, self.scalers);
            if stats.allocation.is_some() {
                let updates = tower.decide(t, &mut stats, self.scalers);
                if !updates.is_empty() {
                    debug!(components = updates.len(), "Pushing tower update");
                    pool.update(&updates)
                        .await
                        .context("Failed to push tower update")?;
                }
            }

            output::print_tick(&stats);
            records.push((t, stats));
        }
        Ok(records)
    }

    /// Everything between deploy and teardown
    async fn execute(&self, output_dir: &Path, tower: &mut dyn Tower) -> Result<RunSummary> {
        let mut pool = NodePool::connect(&self.config.nodes, self.config.node_port).await?;
        pool.start(self.config.namespace(), &self.config.nodes, self.scalers)
            .await?;
        info!(nodes = pool.len(), "All nodes started");

        tokio::fs::create_dir_all(&self.staging)
            .await
            .with_context(|| format!("Failed to create {}", self.staging.display()))?;
        tokio::time::sleep(TICK).await;

        let mut loadgen = LoadGenerator::launch(&self.config.loadgen, &self.staging).await?;
        let time_base = wall_now();
        let monotonic_base = time_base - monotonic_now()?;
        let tower_records = match self.control(&mut pool, &mut loadgen, tower).await {
            Ok(records) => records,
            Err(e) => {
                loadgen.kill().await;
                stop_after_failure(&mut pool).await;
                return Err(e);
            }
        };

        let components = pool.stop().await.context("Failed to stop nodes")?;
        loadgen.wait().await?;

        let history = RunHistory {
            tower: tower_records,
            components,
        }
        .relative_to(time_base);
        history.save(&self.staging).await?;
        let shift = request_time_shift(
            self.config.loadgen.request_clock,
            time_base,
            monotonic_base,
        );
        history::archive_request_log(&self.config.loadgen.request_log, &self.staging, shift)
            .await?;

        let requests = history::load_request_log(&self.staging).await?;
        let summary = history::summarize(
            &history,
            &requests,
            self.config.warmup_seconds() as f64,
            self.config.slo,
        );
        if let Ok(summary) = &summary {
            tokio::fs::write(
                self.staging.join(SUMMARY_FILE),
                serde_json::to_vec_pretty(summary)?,
            )
            .await?;
        }

        if let Some(parent) = output_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.staging, output_dir)
            .await
            .with_context(|| format!("Failed to move run into {}", output_dir.display()))?;
        // the recorded run is kept even when it cannot be judged
        summary.with_context(|| format!("No SLO verdict for {}", output_dir.display()))
    }
}

/// Run one benchmark into `output_dir`; `None` when it already exists
pub async fn run_benchmark(
    config: &ExperimentConfig,
    output_dir: &Path,
    scalers: &BTreeMap<String, ScalerConfig>,
    tower: &mut dyn Tower,
) -> Result<Option<RunSummary>> {
    if output_dir.exists() {
        output::print_warning(&format!("skipped: {}", output_dir.display()));
        return Ok(None);
    }
    output::print_info(&format!("start: {} ({} tower)", output_dir.display(), tower.name()));

    match tokio::fs::remove_file(&config.loadgen.request_log).await {
        Ok(()) => debug!("Removed stale request log"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Failed to remove stale request log"),
    }

    let deployment = Deployment::new(config.deploy.clone(), config.namespace());
    let run = Run {
        config,
        scalers,
        staging: config
            .staging_dir
            .join(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    };

    let result = match deployment.apply().await {
        Ok(()) => run.execute(output_dir, tower).await,
        Err(e) => Err(e.context("Deploy failed")),
    };

    if result.is_err() && run.staging.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&run.staging).await {
            warn!(error = %e, path = %run.staging.display(), "Failed to remove staging directory");
        }
    }
    if let Err(e) = deployment.teardown().await {
        error!(error = %e, "Teardown failed");
        if result.is_ok() {
            return Err(e.context("Teardown failed"));
        }
    }

    let summary = result?;
    output::print_success(&format!("finished: {}", output_dir.display()));
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_lib::models::{ScalerKind, StatRecord, TimedRecord};

    fn limited(t: f64, limit: Option<f64>) -> TimedRecord {
        TimedRecord(
            t,
            StatRecord {
                limit,
                ..Default::default()
            },
        )
    }

    fn scalers(names: &[&str]) -> BTreeMap<String, ScalerConfig> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    ScalerConfig::new(ScalerKind::Captain, vec![0.0, 32.0]),
                )
            })
            .collect()
    }

    #[test]
    fn test_allocation_sums_component_means() {
        let local = StatsMap::from([
            (
                "frontend".to_string(),
                vec![limited(0.0, Some(1.0)), limited(0.1, Some(2.0))],
            ),
            ("geo".to_string(), vec![limited(0.0, Some(0.5))]),
            // monitored only, not part of the allocation
            ("jaeger".to_string(), vec![limited(0.0, None)]),
        ]);
        let allocation = allocation(&local, &scalers(&["frontend", "geo"])).unwrap();
        assert!((allocation - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_allocation_missing_component_skips_tick() {
        let local = StatsMap::from([
            ("frontend".to_string(), vec![limited(0.0, Some(1.0))]),
            ("geo".to_string(), Vec::new()),
        ]);
        assert!(allocation(&local, &scalers(&["frontend", "geo"])).is_none());
        assert!(allocation(&StatsMap::new(), &scalers(&["frontend"])).is_none());
    }

    #[test]
    fn test_request_time_shift_by_clock() {
        // perf_counter 5000.0 was sampled at wall time 1_700_000_000.0
        let monotonic_base = 1_700_000_000.0 - 5000.0;
        let time_base = 1_700_000_010.0;

        let shift = request_time_shift(RequestClock::Monotonic, time_base, monotonic_base);
        assert!((5250.0 + shift - 240.0).abs() < 1e-6);

        let shift = request_time_shift(RequestClock::Wall, time_base, monotonic_base);
        assert!((1_700_000_250.0 + shift - 240.0).abs() < 1e-6);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now().unwrap();
        let b = monotonic_now().unwrap();
        assert!(a > 0.0);
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_stop_after_failure_reaches_every_node() {
        use agent_lib::daemon::Response;

        let (port, handle) = crate::client::tests::fake_node(vec![
            Response::ok(),
            Response::error("control loop failed"),
        ])
        .await;
        let config = crate::config::tests::sample_config();
        let mut nodes = config.nodes.clone();
        nodes.truncate(1);
        nodes[0].host = "127.0.0.1".to_string();

        let mut pool = NodePool::connect(&nodes, port).await.unwrap();
        pool.start("hotel", &nodes, &scalers(&["frontend"]))
            .await
            .unwrap();
        // a rejected stop is logged, not raised
        stop_after_failure(&mut pool).await;

        let received = handle.await.unwrap();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[1], agent_lib::daemon::Request::Stop));
    }

    #[tokio::test]
    async fn test_existing_output_dir_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::tests::sample_config();
        let mut tower = agent_lib::tower::DummyTower;

        let outcome = run_benchmark(&config, dir.path(), &scalers(&["frontend"]), &mut tower)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_failed_deploy_leaves_no_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("torn-down");
        let mut config = crate::config::tests::sample_config();
        config.staging_dir = dir.path().join("tmp");
        config.loadgen.request_log = dir.path().join("request.log");
        config.deploy.apply = vec!["exit 1".to_string()];
        config.deploy.delete = vec![format!("touch {}", marker.display())];
        let output_dir = dir.path().join("data/run");
        let mut tower = agent_lib::tower::DummyTower;

        let result = run_benchmark(&config, &output_dir, &scalers(&["frontend"]), &mut tower).await;
        assert!(result.is_err());
        assert!(!output_dir.exists());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_unreachable_node_tears_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("torn-down");
        let mut config = crate::config::tests::sample_config();
        config.nodes[0].host = "127.0.0.1".to_string();
        config.nodes.truncate(1);
        // nothing listens on a freshly released port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.node_port = listener.local_addr().unwrap().port();
        drop(listener);
        config.staging_dir = dir.path().join("tmp");
        config.loadgen.request_log = dir.path().join("request.log");
        config.deploy.delete = vec![format!("touch {}", marker.display())];
        let output_dir = dir.path().join("data/run");
        let mut tower = agent_lib::tower::DummyTower;

        let result = run_benchmark(&config, &output_dir, &scalers(&["frontend"]), &mut tower).await;
        assert!(result.is_err());
        assert!(!output_dir.exists());
        assert!(marker.exists());
    }
}

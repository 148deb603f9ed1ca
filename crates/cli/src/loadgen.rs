//! Load generator driver and live statistics parsing
//!
//! The load generator runs as one master and several worker processes and
//! appends a row per endpoint per second to `<prefix>_stats_history.csv`.

use crate::config::LoadGenConfig;
use agent_lib::models::TowerStats;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Columns before the percentile block
const LEADING_COLUMNS: usize = 6;
/// Columns after the percentile block
const TRAILING_COLUMNS: usize = 7;

/// Running load generator processes
pub struct LoadGenerator {
    master: Child,
    workers: Vec<Child>,
}

impl LoadGenerator {
    /// Launch workers, then the headless master writing CSV history into `run_dir`
    pub async fn launch(config: &LoadGenConfig, run_dir: &Path) -> Result<Self> {
        let mut workers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let worker = Command::new(&config.program)
                .arg("--worker")
                .arg("-f")
                .arg(&config.locustfile)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Failed to spawn {} worker", config.program))?;
            workers.push(worker);
        }

        let master = Command::new(&config.program)
            .arg("--master")
            .arg("--expect-workers")
            .arg(config.workers.to_string())
            .arg("--headless")
            .arg("-f")
            .arg(&config.locustfile)
            .arg("-H")
            .arg(&config.url)
            .arg("--csv")
            .arg(run_dir.join(&config.csv_prefix))
            .arg("--csv-full-history")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} master", config.program))?;

        info!(workers = config.workers, "Load generator started");
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(Self { master, workers })
    }

    /// True once the master process has exited
    pub fn finished(&mut self) -> Result<bool> {
        Ok(self
            .master
            .try_wait()
            .context("Failed to poll load generator")?
            .is_some())
    }

    /// Wait for the workers after a normal finish
    pub async fn wait(mut self) -> Result<()> {
        let status = self.master.wait().await?;
        debug!(status = %status, "Load generator master exited");
        for worker in &mut self.workers {
            worker.wait().await?;
        }
        Ok(())
    }

    /// Kill every process after a failed run
    pub async fn kill(mut self) {
        if let Err(e) = self.master.kill().await {
            warn!(error = %e, "Failed to kill load generator master");
        }
        for worker in &mut self.workers {
            if let Err(e) = worker.kill().await {
                warn!(error = %e, "Failed to kill load generator worker");
            }
        }
    }
}

fn latency_key(header: &str) -> String {
    format!("p{}_latency", header.trim().trim_end_matches('%'))
}

fn parse_number(value: &str, line: usize) -> Result<f64> {
    let value = value.trim();
    if value == "N/A" {
        return Ok(0.0);
    }
    value
        .parse()
        .with_context(|| format!("line {}: invalid number {:?}", line, value))
}

/// Parse the full CSV history into one record per timestamp.
///
/// The `Aggregated` row feeds `rps` and the percentile latencies (converted
/// from milliseconds to seconds); every other row becomes `rps-<type>-<name>`.
pub fn parse_stats_history(content: &str) -> Result<Vec<(i64, TowerStats)>> {
    let mut lines = content.lines();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<&str> = header.split(',').collect();
    if headers.len() < LEADING_COLUMNS + TRAILING_COLUMNS {
        bail!("stats history header has only {} columns", headers.len());
    }
    let percentile_keys: Vec<String> = headers[LEADING_COLUMNS..headers.len() - TRAILING_COLUMNS]
        .iter()
        .map(|h| latency_key(h))
        .collect();

    let mut result: Vec<(i64, TowerStats)> = Vec::new();
    for (index, line) in lines.enumerate() {
        let line_no = index + 2;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != headers.len() {
            bail!(
                "line {}: expected {} columns, found {}",
                line_no,
                headers.len(),
                fields.len()
            );
        }
        let timestamp: i64 = fields[0]
            .trim()
            .parse()
            .with_context(|| format!("line {}: invalid timestamp", line_no))?;
        if result.last().map(|(t, _)| *t) != Some(timestamp) {
            result.push((timestamp, TowerStats::default()));
        }
        let Some((_, stats)) = result.last_mut() else {
            continue;
        };

        let (kind, name) = (fields[2], fields[3]);
        let rps = parse_number(fields[4], line_no)?;
        if kind.is_empty() && name == "Aggregated" {
            let percentiles = &fields[LEADING_COLUMNS..fields.len() - TRAILING_COLUMNS];
            for (key, value) in percentile_keys.iter().zip(percentiles) {
                let latency = parse_number(value, line_no)? / 1e3;
                if key == "p99_latency" {
                    stats.p99_latency = latency;
                } else {
                    stats.extra.insert(key.clone(), latency);
                }
            }
            stats.rps = rps;
        } else {
            stats.extra.insert(format!("rps-{}-{}", kind, name), rps);
        }
    }
    Ok(result)
}

/// Polls the history file and yields each new timestamp once
pub struct LiveStats {
    path: PathBuf,
    last_timestamp: Option<i64>,
}

impl LiveStats {
    pub fn new(run_dir: &Path, csv_prefix: &str) -> Self {
        Self {
            path: run_dir.join(format!("{}_stats_history.csv", csv_prefix)),
            last_timestamp: None,
        }
    }

    /// The latest record if its timestamp has not been seen yet
    pub async fn poll(&mut self) -> Result<Option<TowerStats>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        self.latest(&content)
    }

    fn latest(&mut self, content: &str) -> Result<Option<TowerStats>> {
        let Some((timestamp, stats)) = parse_stats_history(content)?.pop() else {
            return Ok(None);
        };
        if self.last_timestamp == Some(timestamp) {
            return Ok(None);
        }
        self.last_timestamp = Some(timestamp);
        Ok(Some(stats))
    }
}

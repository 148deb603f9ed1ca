//! Run history persistence
//!
//! A finished run directory holds `stats.json.zst`, mapping every component
//! (plus `_tower`) to its `[t, record]` list with times relative to the start
//! of the run, and `request.log.zst`, one JSON request outcome per line.

use crate::series::{self, Series};
use agent_lib::models::{StatsMap, TowerSample, TowerStats};
use anyhow::{anyhow, bail, Context, Result};
use ruzstd::decoding::StreamingDecoder;
use ruzstd::encoding::{compress_to_vec, CompressionLevel};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

pub const STATS_FILE: &str = "stats.json.zst";
pub const REQUEST_LOG_FILE: &str = "request.log.zst";

/// Everything recorded during one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    #[serde(rename = "_tower", default)]
    pub tower: Vec<(f64, TowerStats)>,
    #[serde(flatten)]
    pub components: StatsMap,
}

/// One request outcome written by the load generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub time: f64,
    pub latency: f64,
    #[serde(flatten)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Time-averaged total CPU limit after warm-up (cores)
    pub allocation: f64,
    /// p99 latency of requests after warm-up (seconds)
    pub p99_latency: f64,
    pub average_rps: f64,
    pub slo_met: bool,
}

fn compress(data: &[u8]) -> Vec<u8> {
    compress_to_vec(data, CompressionLevel::Fastest)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut source = data;
    let mut decoder =
        StreamingDecoder::new(&mut source).map_err(|e| anyhow!("invalid zstd frame: {}", e))?;
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("Failed to decompress")?;
    Ok(out)
}

impl RunHistory {
    /// Shift every timestamp so that `base` becomes zero
    pub fn relative_to(mut self, base: f64) -> Self {
        for (t, _) in &mut self.tower {
            *t -= base;
        }
        for records in self.components.values_mut() {
            for record in records {
                record.0 -= base;
            }
        }
        self
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize run history")?;
        let path = dir.join(STATS_FILE);
        tokio::fs::write(&path, compress(&json))
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATS_FILE);
        let compressed = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let json = decompress(&compressed)?;
        serde_json::from_slice(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Reconstruct tower samples: every record carrying an action is paired
    /// with the latency and allocation of the record that follows it.
    pub fn tower_samples(&self) -> Vec<TowerSample> {
        let mut samples = Vec::new();
        let mut pending: Option<(f64, usize, f64)> = None;
        for (_, stats) in &self.tower {
            if let Some((rps, action, action_p)) = pending.take() {
                match stats.allocation {
                    Some(allocation) => samples.push(TowerSample {
                        rps,
                        action,
                        action_p,
                        latency: stats.p99_latency,
                        allocation,
                    }),
                    None => tracing::debug!("Tower record without allocation, no sample"),
                }
            }
            if let (Some(action), Some(action_p)) = (stats.action, stats.action_p) {
                pending = Some((stats.rps, action, action_p));
            }
        }
        samples
    }

    /// Applied limit series of every component, unlimited records skipped
    pub fn limit_series(&self) -> Vec<Series> {
        self.components
            .values()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| record.1.limit.map(|limit| (record.0, limit)))
                    .collect::<Series>()
            })
            .filter(|series| !series.is_empty())
            .collect()
    }
}

/// Tower samples stored in a finished run directory
pub async fn load_samples(dir: &Path) -> Result<Vec<TowerSample>> {
    Ok(RunHistory::load(dir).await?.tower_samples())
}

/// Parse a plain request log, shifting times by `shift`
pub fn parse_request_log(content: &str, shift: f64) -> Result<Vec<RequestLogEntry>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let mut entry: RequestLogEntry = serde_json::from_str(line)
                .with_context(|| format!("request log line {}", i + 1))?;
            entry.time += shift;
            Ok(entry)
        })
        .collect()
}

/// Compress the load generator's request log into the run directory
pub async fn archive_request_log(source: &Path, dir: &Path, shift: f64) -> Result<()> {
    let content = match tokio::fs::read_to_string(source).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %source.display(), "No request log written");
            String::new()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", source.display()));
        }
    };

    let mut out = Vec::with_capacity(content.len());
    for entry in parse_request_log(&content, shift)? {
        serde_json::to_writer(&mut out, &entry)?;
        out.push(b'\n');
    }
    let path = dir.join(REQUEST_LOG_FILE);
    tokio::fs::write(&path, compress(&out))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    if !content.is_empty() {
        tokio::fs::remove_file(source).await?;
    }
    Ok(())
}

pub async fn load_request_log(dir: &Path) -> Result<Vec<RequestLogEntry>> {
    let path = dir.join(REQUEST_LOG_FILE);
    let compressed = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let content = String::from_utf8(decompress(&compressed)?)
        .with_context(|| format!("{} is not UTF-8", path.display()))?;
    let mut entries = parse_request_log(&content, 0.0)?;
    entries.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(entries)
}

/// Allocation and latency of a run after its warm-up phase.
///
/// Fails when no request completed after warm-up, so that a run without
/// latency data is never reported as meeting the SLO.
pub fn summarize(
    history: &RunHistory,
    requests: &[RequestLogEntry],
    warmup_seconds: f64,
    slo: f64,
) -> Result<RunSummary> {
    let total = series::zip_sum(&history.limit_series());
    let minutes = series::time_weighted_average(&total, 60.0);
    let allocation =
        series::average(&series::slice(&minutes, warmup_seconds + 30.0, f64::INFINITY))
            .unwrap_or(0.0);

    let latencies: Vec<f64> = requests
        .iter()
        .filter(|r| r.time >= warmup_seconds)
        .map(|r| r.latency)
        .collect();
    let Some(p99_latency) = series::percentile(&latencies, 99) else {
        bail!(
            "no requests logged after the {}s warm-up ({} in total)",
            warmup_seconds,
            requests.len()
        );
    };

    let measured = requests
        .iter()
        .map(|r| r.time)
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |m| m.max(t))))
        .map(|last| last - warmup_seconds)
        .filter(|d| *d > 0.0);
    let average_rps = measured.map_or(0.0, |d| latencies.len() as f64 / d);

    Ok(RunSummary {
        allocation,
        p99_latency,
        average_rps,
        slo_met: p99_latency <= slo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_lib::models::{StatRecord, TimedRecord};

    fn tower_record(rps: f64, latency: f64, allocation: Option<f64>, action: Option<usize>) -> TowerStats {
        TowerStats {
            rps,
            p99_latency: latency,
            allocation,
            action,
            action_p: action.map(|_| 0.25),
            ..Default::default()
        }
    }

    fn limit_records(limit: f64, until: usize) -> Vec<TimedRecord> {
        (0..until)
            .map(|i| {
                TimedRecord(
                    i as f64,
                    StatRecord {
                        limit: Some(limit),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_samples_pair_action_with_next_outcome() {
        let history = RunHistory {
            tower: vec![
                (0.0, tower_record(100.0, 0.3, Some(4.0), Some(2))),
                (1.0, tower_record(110.0, 0.1, Some(3.0), Some(5))),
                (2.0, tower_record(120.0, 0.2, Some(2.5), None)),
                (3.0, tower_record(130.0, 0.4, Some(2.0), Some(1))),
            ],
            components: StatsMap::new(),
        };

        let samples = history.tower_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].rps, 100.0);
        assert_eq!(samples[0].action, 2);
        assert_eq!(samples[0].latency, 0.1);
        assert_eq!(samples[0].allocation, 3.0);
        assert_eq!(samples[1].action, 5);
        assert_eq!(samples[1].latency, 0.2);
    }

    #[test]
    fn test_history_wire_shape_has_tower_key() {
        let history = RunHistory {
            tower: vec![(1.0, tower_record(10.0, 0.1, Some(1.0), Some(0)))],
            components: StatsMap::from([("frontend".to_string(), limit_records(0.5, 1))]),
        };
        let value = serde_json::to_value(&history).unwrap();
        assert_eq!(value["_tower"][0][1]["rps"], 10.0);
        assert_eq!(value["frontend"][0][1]["scaler.limit"], 0.5);
    }

    #[tokio::test]
    async fn test_save_and_load_samples() {
        let dir = tempfile::TempDir::new().unwrap();
        let history = RunHistory {
            tower: vec![
                (100.0, tower_record(50.0, 0.2, None, Some(3))),
                (101.0, tower_record(55.0, 0.15, Some(6.0), None)),
            ],
            components: StatsMap::from([("frontend".to_string(), limit_records(1.0, 3))]),
        }
        .relative_to(100.0);

        history.save(dir.path()).await.unwrap();
        let loaded = RunHistory::load(dir.path()).await.unwrap();
        assert_eq!(loaded.tower[1].0, 1.0);
        assert_eq!(loaded.components["frontend"].len(), 3);

        let samples = load_samples(dir.path()).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].allocation, 6.0);
    }

    #[tokio::test]
    async fn test_archive_request_log_shifts_times() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("request.log");
        tokio::fs::write(
            &source,
            "{\"time\": 1000.5, \"latency\": 0.02, \"context\": \"GET /\"}\n\
             {\"time\": 1000.0, \"latency\": 0.05, \"context\": \"POST /\"}\n",
        )
        .await
        .unwrap();

        archive_request_log(&source, dir.path(), -1000.0).await.unwrap();
        assert!(!source.exists());

        let entries = load_request_log(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].time, 0.0);
        assert_eq!(entries[0].context["context"], "POST /");
        assert_eq!(entries[1].time, 0.5);
    }

    #[test]
    fn test_summary_after_warmup() {
        let history = RunHistory {
            tower: Vec::new(),
            components: StatsMap::from([
                ("a".to_string(), limit_records(1.0, 400)),
                ("b".to_string(), limit_records(2.0, 400)),
            ]),
        };
        let requests: Vec<RequestLogEntry> = (0..300)
            .map(|i| RequestLogEntry {
                time: i as f64,
                latency: if i < 100 { 1.0 } else { 0.05 },
                context: serde_json::Map::new(),
            })
            .collect();

        let summary = summarize(&history, &requests, 100.0, 0.1).unwrap();
        assert!((summary.allocation - 3.0).abs() < 1e-9);
        assert_eq!(summary.p99_latency, 0.05);
        assert!(summary.slo_met);
        assert!((summary.average_rps - 200.0 / 199.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_without_requests_after_warmup_fails() {
        assert!(summarize(&RunHistory::default(), &[], 300.0, 0.2).is_err());

        let early: Vec<RequestLogEntry> = (0..50)
            .map(|i| RequestLogEntry {
                time: i as f64,
                latency: 0.01,
                context: serde_json::Map::new(),
            })
            .collect();
        assert!(summarize(&RunHistory::default(), &early, 300.0, 0.2).is_err());
    }

    #[tokio::test]
    async fn test_monotonic_request_times_land_after_warmup() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("request.log");
        // perf_counter-style stamps from a host booted ~5000s before the run
        let mut log = String::new();
        for i in 0..1000 {
            let t = 5000.0 + i as f64 * 0.6;
            log.push_str(&format!("{{\"time\": {}, \"latency\": 5.0}}\n", t));
        }
        tokio::fs::write(&source, log).await.unwrap();

        let time_base = 1_700_000_000.0;
        let monotonic_base = time_base - 5000.0;
        let shift = crate::benchmark::request_time_shift(
            crate::config::RequestClock::Monotonic,
            time_base,
            monotonic_base,
        );
        archive_request_log(&source, dir.path(), shift).await.unwrap();
        let requests = load_request_log(dir.path()).await.unwrap();
        assert_eq!(requests[0].time, 0.0);

        let summary = summarize(&RunHistory::default(), &requests, 300.0, 0.2).unwrap();
        assert_eq!(summary.p99_latency, 5.0);
        assert!(!summary.slo_met);
    }
}

//! Evaluation campaign for one application
//!
//! Warm-up runs explore the target grid and then train the bandit with a high
//! exploration rate; every workload is then evaluated once with the bandit
//! and once per baseline target. Finished runs are skipped, so an interrupted
//! campaign resumes where it stopped.

use crate::benchmark::run_benchmark;
use crate::config::{CampaignConfig, ExperimentConfig, Workload};
use crate::history::{load_samples, RunSummary};
use crate::output;
use crate::trace;
use agent_lib::models::{ScalerKind, TowerSample};
use agent_lib::tower::{build_tower, TowerConfig};
use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Length of a constant-rate workload (seconds)
const CONSTANT_WORKLOAD_SECONDS: usize = 3600;

/// One line of `log.json`
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub time: String,
    pub path: String,
    pub application: String,
    pub trace: String,
    pub scaler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    pub allocation: f64,
    pub p99_latency: f64,
    pub average_rps: f64,
}

/// `result.csv` lines for one evaluated run
pub fn result_lines(
    application: &str,
    workload: &str,
    scaler: &str,
    summary: &RunSummary,
    slo: f64,
    path: &Path,
) -> String {
    if summary.slo_met {
        return format!(
            "{},{},{},{:.2}\n",
            application, workload, scaler, summary.allocation
        );
    }
    format!(
        "{},{},{},N/A\n# ^ SLO not met. P99 latency = {:.0} ms. SLO = {:.0} ms. Delete this path to run again: {}\n",
        application,
        workload,
        scaler,
        summary.p99_latency * 1e3,
        slo * 1e3,
        path.display()
    )
}

async fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(content.as_bytes()).await?;
    Ok(())
}

pub struct Campaign<'a> {
    config: &'a ExperimentConfig,
    campaign: &'a CampaignConfig,
    seed: Option<u64>,
    runs: u64,
}

impl<'a> Campaign<'a> {
    pub fn new(config: &'a ExperimentConfig, seed: Option<u64>) -> Result<Self> {
        let campaign = config
            .campaign
            .as_ref()
            .context("experiment config has no [campaign] section")?;
        Ok(Self {
            config,
            campaign,
            seed,
            runs: 0,
        })
    }

    fn app_dir(&self) -> PathBuf {
        self.campaign.data_dir.join(&self.config.name)
    }

    fn next_seed(&mut self) -> Option<u64> {
        self.runs += 1;
        self.seed.map(|seed| seed.wrapping_add(self.runs))
    }

    fn vw(&self, explore: f64) -> TowerConfig {
        TowerConfig::Vw {
            slo: self.config.slo,
            explore,
            drop_samples: self.config.warmup_minutes,
            aggregate_samples: self.config.aggregate_samples,
        }
    }

    /// Scale the trace, prepend the warm-up ramp and publish it to the load shape
    async fn publish_trace(&self, base: Vec<u64>) -> Result<()> {
        let trace = trace::with_warmup(&base, self.config.warmup_seconds());
        trace::dump_trace(&trace, &self.config.loadgen.rps_file).await
    }

    async fn workload_trace(&self, workload: &Workload) -> Result<Vec<u64>> {
        match (workload.constant_rps, &workload.trace) {
            (Some(rps), _) => Ok(vec![rps; CONSTANT_WORKLOAD_SECONDS]),
            (None, Some(path)) => Ok(trace::scale(
                &trace::load_trace(path).await?,
                self.config.trace_multiplier,
            )),
            (None, None) => bail!("workload {} has neither a trace nor a constant rate", workload.name),
        }
    }

    async fn run(
        &mut self,
        path: &Path,
        scaler: ScalerKind,
        target: f64,
        tower: &TowerConfig,
        samples: Vec<TowerSample>,
    ) -> Result<Option<RunSummary>> {
        let scalers = self.config.uniform_scalers(scaler, target);
        let grid = self.config.action_grid(ScalerKind::Captain)?;
        let mut tower = build_tower(tower, grid, samples, self.next_seed())?;
        let summary = run_benchmark(self.config, path, &scalers, tower.as_mut()).await?;
        if let Some(summary) = &summary {
            output::print_summary(path, summary, self.config.slo);
        }
        Ok(summary)
    }

    async fn log(&self, entry: LogEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        append(&self.campaign.log_file, &line).await
    }

    fn entry(&self, path: &Path, trace: &str, scaler: &str, summary: &RunSummary) -> LogEntry {
        LogEntry {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            path: path.display().to_string(),
            application: self.config.name.clone(),
            trace: trace.to_string(),
            scaler: scaler.to_string(),
            warmup: None,
            target: None,
            allocation: summary.allocation,
            p99_latency: summary.p99_latency,
            average_rps: summary.average_rps,
        }
    }

    async fn record_result(
        &self,
        workload: &str,
        scaler: &str,
        summary: &RunSummary,
        path: &Path,
    ) -> Result<()> {
        let lines = result_lines(
            &self.config.name,
            workload,
            scaler,
            summary,
            self.config.slo,
            path,
        );
        append(&self.campaign.result_file, &lines).await
    }

    /// Explore and bandit warm-up runs; returns the accumulated samples
    async fn warmup(&mut self) -> Result<Vec<TowerSample>> {
        let base = trace::scale(
            &trace::load_trace(&self.campaign.warmup_trace).await?,
            self.config.trace_multiplier,
        );
        self.publish_trace(base).await?;
        let trace_name = self
            .campaign
            .warmup_trace
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let warmup_dir = self.app_dir().join("autothrottle-warmup");
        let mut samples = Vec::new();

        let explore = TowerConfig::Explore {
            warmup: self.config.warmup_minutes,
        };
        for i in 1..=self.campaign.explore_runs {
            let label = format!("a{}", i);
            let path = warmup_dir.join(&label);
            if let Some(summary) = self
                .run(&path, ScalerKind::Captain, 0.0, &explore, Vec::new())
                .await?
            {
                let mut entry = self.entry(&path, &trace_name, "autothrottle", &summary);
                entry.warmup = Some(label);
                self.log(entry).await?;
            }
            samples.extend(load_samples(&path).await?);
        }

        let bandit = self.vw(self.campaign.bandit_explore);
        for i in 1..=self.campaign.bandit_runs {
            let label = format!("b{}", i);
            let path = warmup_dir.join(&label);
            if let Some(summary) = self
                .run(&path, ScalerKind::Captain, 0.0, &bandit, samples.clone())
                .await?
            {
                let mut entry = self.entry(&path, &trace_name, "autothrottle", &summary);
                entry.warmup = Some(label);
                self.log(entry).await?;
            }
            samples.extend(
                load_samples(&path)
                    .await?
                    .into_iter()
                    .skip(self.config.warmup_minutes),
            );
        }
        Ok(samples)
    }

    async fn evaluate(&mut self, workload: &Workload, samples: &[TowerSample]) -> Result<()> {
        let base = self.workload_trace(workload).await?;
        self.publish_trace(base).await?;
        let workload_dir = self.app_dir().join(&workload.name);

        let path = workload_dir.join("autothrottle");
        let tower = self.vw(self.campaign.final_explore);
        if let Some(summary) = self
            .run(&path, ScalerKind::Captain, 0.0, &tower, samples.to_vec())
            .await?
        {
            self.log(self.entry(&path, &workload.name, "autothrottle", &summary))
                .await?;
            self.record_result(&workload.name, "autothrottle", &summary, &path)
                .await?;
        }

        for baseline in &workload.baselines {
            let scaler = baseline.scaler.as_str();
            for &target in &baseline.targets {
                let path = workload_dir.join(scaler).join(target.to_string());
                if let Some(summary) = self
                    .run(&path, baseline.scaler, target, &TowerConfig::Dummy, Vec::new())
                    .await?
                {
                    let mut entry = self.entry(&path, &workload.name, scaler, &summary);
                    entry.target = Some(target);
                    self.log(entry).await?;
                    self.record_result(&workload.name, scaler, &summary, &path)
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn run_all(&mut self) -> Result<()> {
        let samples = self.warmup().await?;
        output::print_info(&format!("warm-up finished with {} samples", samples.len()));
        let campaign = self.campaign;
        for workload in &campaign.workloads {
            self.evaluate(workload, &samples).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(slo_met: bool) -> RunSummary {
        RunSummary {
            allocation: 12.3456,
            p99_latency: 0.1234,
            average_rps: 300.0,
            slo_met,
        }
    }

    #[test]
    fn test_result_line_when_slo_met() {
        let line = result_lines(
            "hotel-reservation",
            "diurnal",
            "captain",
            &summary(true),
            0.2,
            Path::new("data/x"),
        );
        assert_eq!(line, "hotel-reservation,diurnal,captain,12.35\n");
    }

    #[test]
    fn test_result_line_when_slo_missed() {
        let line = result_lines(
            "hotel-reservation",
            "diurnal",
            "k8s-cpu",
            &summary(false),
            0.1,
            Path::new("data/hotel-reservation/diurnal/k8s-cpu/0.5"),
        );
        let mut lines = line.lines();
        assert_eq!(lines.next(), Some("hotel-reservation,diurnal,k8s-cpu,N/A"));
        let detail = lines.next().unwrap();
        assert!(detail.starts_with("# ^ SLO not met. P99 latency = 123 ms. SLO = 100 ms."));
        assert!(detail.ends_with("k8s-cpu/0.5"));
    }

    #[test]
    fn test_log_entry_omits_unset_fields() {
        let entry = LogEntry {
            time: "2024-01-01T00:00:00Z".to_string(),
            path: "data/a".to_string(),
            application: "app".to_string(),
            trace: "diurnal".to_string(),
            scaler: "autothrottle".to_string(),
            warmup: Some("a1".to_string()),
            target: None,
            allocation: 1.0,
            p99_latency: 0.1,
            average_rps: 10.0,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["warmup"], "a1");
        assert!(value.get("target").is_none());
    }

    #[tokio::test]
    async fn test_campaign_requires_section() {
        let config = crate::config::tests::sample_config();
        assert!(Campaign::new(&config, None).is_err());
    }

    #[tokio::test]
    async fn test_constant_workload_trace() {
        let mut config = crate::config::tests::sample_config();
        config.campaign = Some(CampaignConfig {
            data_dir: PathBuf::from("data"),
            warmup_trace: PathBuf::from("traces/diurnal.txt"),
            explore_runs: 0,
            bandit_runs: 0,
            bandit_explore: 0.5,
            final_explore: 0.0,
            workloads: Vec::new(),
            log_file: PathBuf::from("log.json"),
            result_file: PathBuf::from("result.csv"),
        });
        let campaign = Campaign::new(&config, Some(7)).unwrap();
        let workload = Workload {
            name: "constant".to_string(),
            trace: None,
            constant_rps: Some(250),
            baselines: Vec::new(),
        };
        let trace = campaign.workload_trace(&workload).await.unwrap();
        assert_eq!(trace.len(), 3600);
        assert!(trace.iter().all(|&rps| rps == 250));
    }
}

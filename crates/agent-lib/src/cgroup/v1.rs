//! cgroup v1 CPU driver
//!
//! Reads and writes the legacy per-controller hierarchy:
//! - cpuacct controller for cumulative usage (`cpuacct.usage`, nanoseconds)
//! - cpu controller for throttling stats and the CFS quota/period files

use super::{CgroupDriver, CgroupVersion, CpuQuota, PodCgroup};
use crate::error::{AgentError, Result};
use crate::models::CpuCounters;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Driver for the legacy cgroup v1 hierarchy
pub struct CgroupV1Driver {
    /// Root path for cgroup v1 controllers (typically /sys/fs/cgroup)
    cgroup_root: PathBuf,
}

impl CgroupV1Driver {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
        }
    }

    /// Full path of a controller file for a pod, e.g. `cpu/<slice>/cpu.stat`
    pub fn controller_path(&self, controller: &str, pod: &PodCgroup, file: &str) -> PathBuf {
        self.cgroup_root.join(controller).join(&pod.slice).join(file)
    }

    /// Parse `cpuacct.usage` (nanoseconds) into seconds
    pub fn parse_usage(content: &str) -> Result<f64> {
        content
            .trim()
            .parse::<u64>()
            .map(|ns| ns as f64 / 1e9)
            .map_err(|e| AgentError::CounterParse {
                file: "cpuacct.usage".into(),
                reason: e.to_string(),
            })
    }

    /// Parse v1 `cpu.stat`; returns (nr_periods, nr_throttled, throttled_time seconds)
    pub fn parse_cpu_stat(content: &str) -> Result<(u64, u64, f64)> {
        let mut nr_periods = None;
        let mut nr_throttled = None;
        let mut throttled_ns = None;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            let slot = match parts[0] {
                "nr_periods" => &mut nr_periods,
                "nr_throttled" => &mut nr_throttled,
                "throttled_time" => &mut throttled_ns,
                _ => continue,
            };
            *slot = Some(parts[1].parse::<u64>().map_err(|e| AgentError::CounterParse {
                file: "cpu.stat".into(),
                reason: format!("{}: {}", parts[0], e),
            })?);
        }

        match (nr_periods, nr_throttled, throttled_ns) {
            (Some(p), Some(t), Some(ns)) => Ok((p, t, ns as f64 / 1e9)),
            _ => Err(AgentError::CounterParse {
                file: "cpu.stat".into(),
                reason: "missing nr_periods, nr_throttled or throttled_time".into(),
            }),
        }
    }

    async fn read(path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path).await?)
    }
}

#[async_trait]
impl CgroupDriver for CgroupV1Driver {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    async fn read_counters(&self, pod: &PodCgroup) -> Result<CpuCounters> {
        let usage = Self::read(&self.controller_path("cpuacct", pod, "cpuacct.usage")).await?;
        let stat = Self::read(&self.controller_path("cpu", pod, "cpu.stat")).await?;

        let usage = Self::parse_usage(&usage)?;
        let (nr_periods, nr_throttled, throttled_time) = Self::parse_cpu_stat(&stat)?;
        Ok(CpuCounters {
            usage,
            nr_periods,
            nr_throttled,
            throttled_time,
        })
    }

    async fn write_quota(&self, pod: &PodCgroup, quota: CpuQuota) -> Result<()> {
        fs::write(
            self.controller_path("cpu", pod, "cpu.cfs_period_us"),
            quota.period_us.to_string(),
        )
        .await?;
        fs::write(
            self.controller_path("cpu", pod, "cpu.cfs_quota_us"),
            quota.quota_us.unwrap_or(-1).to_string(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_stat() {
        let content = r#"nr_periods 1000
nr_throttled 50
throttled_time 5000000000"#;

        let (periods, throttled, time) = CgroupV1Driver::parse_cpu_stat(content).unwrap();
        assert_eq!(periods, 1000);
        assert_eq!(throttled, 50);
        assert!((time - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_cpu_stat_missing_field() {
        assert!(CgroupV1Driver::parse_cpu_stat("nr_periods 3\n").is_err());
        assert!(CgroupV1Driver::parse_cpu_stat("nr_periods x\nnr_throttled 1\n").is_err());
    }

    #[test]
    fn test_parse_usage_nanoseconds() {
        assert!((CgroupV1Driver::parse_usage("2500000000\n").unwrap() - 2.5).abs() < 1e-12);
        assert!(CgroupV1Driver::parse_usage("").is_err());
    }

    #[test]
    fn test_controller_path_layout() {
        let driver = CgroupV1Driver::new("/sys/fs/cgroup");
        let pod = PodCgroup::kubepods("burstable", "1234-abcd");
        assert_eq!(
            driver.controller_path("cpu", &pod, "cpu.stat"),
            PathBuf::from("/sys/fs/cgroup/cpu/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod1234_abcd.slice/cpu.stat")
        );
    }
}

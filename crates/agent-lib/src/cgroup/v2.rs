//! cgroup v2 CPU driver
//!
//! Reads and writes the unified hierarchy:
//! - cpu.stat for usage and throttling (microseconds)
//! - cpu.max for the quota/period pair (`"<quota|max> <period>"`)

use super::{CgroupDriver, CgroupVersion, CpuQuota, PodCgroup};
use crate::error::{AgentError, Result};
use crate::models::CpuCounters;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// Driver for the cgroup v2 unified hierarchy
pub struct CgroupV2Driver {
    cgroup_root: PathBuf,
}

impl CgroupV2Driver {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
        }
    }

    pub fn pod_path(&self, pod: &PodCgroup, file: &str) -> PathBuf {
        self.cgroup_root.join(&pod.slice).join(file)
    }

    /// Parse v2 `cpu.stat` into normalized counters
    pub fn parse_cpu_stat(content: &str) -> Result<CpuCounters> {
        let mut usage_usec = None;
        let mut nr_periods = None;
        let mut nr_throttled = None;
        let mut throttled_usec = None;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            let slot = match parts[0] {
                "usage_usec" => &mut usage_usec,
                "nr_periods" => &mut nr_periods,
                "nr_throttled" => &mut nr_throttled,
                "throttled_usec" => &mut throttled_usec,
                _ => continue,
            };
            *slot = Some(parts[1].parse::<u64>().map_err(|e| AgentError::CounterParse {
                file: "cpu.stat".into(),
                reason: format!("{}: {}", parts[0], e),
            })?);
        }

        match (usage_usec, nr_periods, nr_throttled, throttled_usec) {
            (Some(usage), Some(periods), Some(throttled), Some(throttled_us)) => Ok(CpuCounters {
                usage: usage as f64 / 1e6,
                nr_periods: periods,
                nr_throttled: throttled,
                throttled_time: throttled_us as f64 / 1e6,
            }),
            _ => Err(AgentError::CounterParse {
                file: "cpu.stat".into(),
                reason: "missing usage_usec or throttling fields".into(),
            }),
        }
    }

    /// Render the `cpu.max` line for a quota
    pub fn format_cpu_max(quota: &CpuQuota) -> String {
        match quota.quota_us {
            Some(quota_us) => format!("{} {}", quota_us, quota.period_us),
            None => format!("max {}", quota.period_us),
        }
    }
}

#[async_trait]
impl CgroupDriver for CgroupV2Driver {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    async fn read_counters(&self, pod: &PodCgroup) -> Result<CpuCounters> {
        let content = fs::read_to_string(self.pod_path(pod, "cpu.stat")).await?;
        Self::parse_cpu_stat(&content)
    }

    async fn write_quota(&self, pod: &PodCgroup, quota: CpuQuota) -> Result<()> {
        fs::write(self.pod_path(pod, "cpu.max"), Self::format_cpu_max(&quota)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_stat() {
        let content = r#"usage_usec 5000000
user_usec 3000000
system_usec 2000000
nr_periods 100
nr_throttled 5
throttled_usec 50000
"#;
        let counters = CgroupV2Driver::parse_cpu_stat(content).unwrap();
        assert!((counters.usage - 5.0).abs() < 1e-12);
        assert_eq!(counters.nr_periods, 100);
        assert_eq!(counters.nr_throttled, 5);
        assert!((counters.throttled_time - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_parse_cpu_stat_without_cpu_controller() {
        // groups without the cpu controller only report usage
        let content = "usage_usec 10\nuser_usec 5\nsystem_usec 5\n";
        assert!(CgroupV2Driver::parse_cpu_stat(content).is_err());
    }

    #[test]
    fn test_format_cpu_max() {
        let limited = CpuQuota::from_limit(Some(0.25), 100_000).unwrap();
        assert_eq!(CgroupV2Driver::format_cpu_max(&limited), "25000 100000");
        assert_eq!(
            CgroupV2Driver::format_cpu_max(&CpuQuota::unlimited()),
            "max 100000"
        );
    }
}

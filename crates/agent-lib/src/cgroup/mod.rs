//! CPU cgroup access for managed pods
//!
//! Drivers read cumulative CPU counters and write CFS quotas for pod slices.
//! Both cgroup v2 (unified hierarchy) and cgroup v1 (per-controller
//! hierarchy) are supported, with automatic detection.

mod discovery;
mod quota;
mod v1;
mod v2;


pub use discovery::{
    parse_pod_listing, parse_pod_slice_name, KubectlResolver, PodResolver, StaticResolver,
    QOS_CLASSES,
};
pub use quota::{CpuQuota, DEFAULT_PERIOD_US, MIN_QUOTA_US};
pub use v1::CgroupV1Driver;
pub use v2::CgroupV2Driver;

use crate::error::Result;
use crate::models::CpuCounters;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

pub use async_trait::async_trait;

/// Location of a pod's cgroup, relative to the hierarchy (or controller) root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodCgroup {
    pub slice: PathBuf,
}

impl PodCgroup {
    pub fn new(slice: impl Into<PathBuf>) -> Self {
        Self {
            slice: slice.into(),
        }
    }

    /// Kubelet systemd layout for a pod of the given QoS class.
    ///
    /// Dashes in the pod UID become underscores in the slice name.
    pub fn kubepods(qos: &str, uid: &str) -> Self {
        let uid = uid.replace('-', "_");
        Self::new(
            PathBuf::from("kubepods.slice")
                .join(format!("kubepods-{}.slice", qos))
                .join(format!("kubepods-{}-pod{}.slice", qos, uid)),
        )
    }
}

/// Read counters and write quotas for pod cgroups
#[async_trait]
pub trait CgroupDriver: Send + Sync {
    fn version(&self) -> CgroupVersion;

    /// Cumulative counters, normalized to seconds
    async fn read_counters(&self, pod: &PodCgroup) -> Result<CpuCounters>;

    /// Install a quota; the period is written before the quota
    async fn write_quota(&self, pod: &PodCgroup, quota: CpuQuota) -> Result<()>;
}

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

/// Detect which cgroup version is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    if fs::metadata(cgroup_root.join("cgroup.controllers")).await.is_ok() {
        return CgroupVersion::V2;
    }

    let v1_cpu = cgroup_root.join("cpu");
    let v1_cpuacct = cgroup_root.join("cpuacct");
    if fs::metadata(&v1_cpu).await.is_ok() && fs::metadata(&v1_cpuacct).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

/// Create the appropriate driver based on detected cgroup version
pub async fn create_driver(cgroup_root: &Path) -> Arc<dyn CgroupDriver> {
    match detect_cgroup_version(cgroup_root).await {
        CgroupVersion::V2 => {
            tracing::info!("Detected cgroup v2, using unified hierarchy driver");
            Arc::new(CgroupV2Driver::new(cgroup_root))
        }
        CgroupVersion::V1 => {
            tracing::info!("Detected cgroup v1, using legacy hierarchy driver");
            Arc::new(CgroupV1Driver::new(cgroup_root))
        }
        CgroupVersion::Unknown => {
            tracing::warn!("Could not detect cgroup version, defaulting to v2");
            Arc::new(CgroupV2Driver::new(cgroup_root))
        }
    }
}

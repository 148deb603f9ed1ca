//! Conversion from fractional-core limits to CFS quota/period pairs

use crate::error::{AgentError, Result};

/// Enforcement period used for every managed component (100ms)
pub const DEFAULT_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts
pub const MIN_QUOTA_US: i64 = 1_000;

const MIN_PERIOD_US: u64 = 1_000;
const MAX_PERIOD_US: u64 = 1_000_000;

/// A quota/period pair ready to be written to a cgroup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuota {
    pub period_us: u64,
    /// `None` means unlimited
    pub quota_us: Option<i64>,
}

impl CpuQuota {
    /// Convert a limit in cores (`None` = unlimited) into a quota over `period_us`.
    ///
    /// Fails instead of truncating when the quota would fall below 1ms.
    pub fn from_limit(limit: Option<f64>, period_us: u64) -> Result<Self> {
        if !(MIN_PERIOD_US..=MAX_PERIOD_US).contains(&period_us) {
            return Err(AgentError::InvalidPeriod(period_us));
        }
        let quota_us = match limit {
            None => None,
            Some(limit) => {
                let quota_us = (limit * period_us as f64).round();
                if !quota_us.is_finite() || quota_us < MIN_QUOTA_US as f64 {
                    return Err(AgentError::QuotaBelowMinimum {
                        limit,
                        quota_us: if quota_us.is_finite() { quota_us as i64 } else { 0 },
                    });
                }
                Some(quota_us as i64)
            }
        };
        Ok(Self {
            period_us,
            quota_us,
        })
    }

    pub fn unlimited() -> Self {
        Self {
            period_us: DEFAULT_PERIOD_US,
            quota_us: None,
        }
    }
}

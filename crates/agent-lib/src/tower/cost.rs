//! Cost shaping and aggregation of tower samples
//!
//! SLO-compliant samples cost `[0, 1]` (normalized allocation); violating
//! samples cost `[2, 3]` (normalized latency), so any violation is worse than
//! any compliant outcome.

use crate::models::TowerSample;
use std::collections::BTreeMap;

/// Cost of a degenerate compliant range
const COMPLIANT_MIDPOINT: f64 = 0.5;

/// Offset and degenerate midpoint of the violating range
const VIOLATION_BASE: f64 = 2.0;
const VIOLATION_MIDPOINT: f64 = 2.5;

/// A training example for the bandit learner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostedSample {
    pub rps: f64,
    pub action: usize,
    pub probability: f64,
    pub cost: f64,
}

fn min_max(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

fn normalize(value: f64, range: Option<(f64, f64)>, degenerate: f64) -> f64 {
    match range {
        Some((lo, hi)) if hi > lo => (value - lo) / (hi - lo),
        _ => degenerate,
    }
}

/// Assign each sample its cost against the SLO
pub fn shape_costs(samples: &[TowerSample], slo: f64) -> Vec<CostedSample> {
    let allocation_range = min_max(
        samples
            .iter()
            .filter(|s| s.latency <= slo)
            .map(|s| s.allocation),
    );
    let latency_range = min_max(samples.iter().filter(|s| s.latency > slo).map(|s| s.latency));

    samples
        .iter()
        .map(|s| {
            let cost = if s.latency <= slo {
                normalize(s.allocation, allocation_range, COMPLIANT_MIDPOINT)
            } else {
                VIOLATION_BASE
                    + normalize(
                        s.latency,
                        latency_range,
                        VIOLATION_MIDPOINT - VIOLATION_BASE,
                    )
            };
            CostedSample {
                rps: s.rps,
                action: s.action,
                probability: s.action_p,
                cost,
            }
        })
        .collect()
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    })
}

/// Group by (action, rps rounded to the nearest `bucket`) and reduce each
/// group to its median cost.
///
/// Aggregated examples carry the uniform probability `1 / actions`.
pub fn aggregate(samples: &[CostedSample], bucket: f64, actions: usize) -> Vec<CostedSample> {
    let mut groups: BTreeMap<(usize, i64), Vec<f64>> = BTreeMap::new();
    for sample in samples {
        let key = (sample.action, (sample.rps / bucket).round() as i64);
        groups.entry(key).or_default().push(sample.cost);
    }

    let probability = 1.0 / actions as f64;
    groups
        .into_iter()
        .filter_map(|((action, rps_bucket), mut costs)| {
            median(&mut costs).map(|cost| CostedSample {
                rps: rps_bucket as f64 * bucket,
                action,
                probability,
                cost,
            })
        })
        .collect()
}

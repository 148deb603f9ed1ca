//! Request-rate traces
//!
//! A trace is one integer request rate per second, one per line. The load
//! shape replays whatever was last written to the rps file.

use anyhow::{Context, Result};
use std::path::Path;

/// Ramp growth per step of the warm-up prefix
const RAMP_FACTOR: f64 = 1.1;
/// Seconds per ramp step
const RAMP_STEP_SECONDS: f64 = 5.0;

pub fn parse_trace(content: &str) -> Result<Vec<u64>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            line.trim()
                .parse()
                .with_context(|| format!("trace line {}: invalid rate {:?}", i + 1, line))
        })
        .collect()
}

pub async fn load_trace(path: &Path) -> Result<Vec<u64>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read trace {}", path.display()))?;
    parse_trace(&content)
}

pub async fn dump_trace(trace: &[u64], path: &Path) -> Result<()> {
    let mut content = String::with_capacity(trace.len() * 4);
    for rps in trace {
        content.push_str(&rps.to_string());
        content.push('\n');
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn scale(trace: &[u64], multiplier: f64) -> Vec<u64> {
    trace
        .iter()
        .map(|&rps| (rps as f64 * multiplier).round() as u64)
        .collect()
}

/// Prepend a warm-up ramp growing ×1.1 every 5 seconds up to the first rate
pub fn with_warmup(trace: &[u64], warmup_seconds: usize) -> Vec<u64> {
    let first = trace.first().copied().unwrap_or(1) as f64;
    let mut out = Vec::with_capacity(warmup_seconds + trace.len());
    for i in 0..warmup_seconds {
        let exponent = (i as f64 - warmup_seconds as f64) / RAMP_STEP_SECONDS;
        let rps = (first * RAMP_FACTOR.powf(exponent)).round();
        out.push(rps.max(1.0) as u64);
    }
    out.extend_from_slice(trace);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramp() {
        let trace = with_warmup(&[500, 600], 180);
        assert_eq!(trace.len(), 182);
        // 500 * 1.1^-36
        assert_eq!(trace[0], 16);
        // 500 * 1.1^-0.2
        assert_eq!(trace[179], 491);
        assert_eq!(&trace[180..], &[500, 600]);
        assert!(trace.windows(2).take(179).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_warmup_floor_is_one() {
        let trace = with_warmup(&[3], 100);
        assert_eq!(trace[0], 1);
    }

    #[test]
    fn test_scale_rounds() {
        assert_eq!(scale(&[10, 15], 0.5), vec![5, 8]);
    }

    #[tokio::test]
    async fn test_dump_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rps.txt");
        dump_trace(&[1, 2, 30], &path).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "1\n2\n30\n");
        assert_eq!(load_trace(&path).await.unwrap(), vec![1, 2, 30]);
    }

    #[test]
    fn test_invalid_line() {
        assert!(parse_trace("1\nabc\n").is_err());
    }
}

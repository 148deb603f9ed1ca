//! Fixed-length sliding window over per-tick samples

use std::collections::VecDeque;

/// Sliding window holding exactly `len` samples, oldest first.
///
/// The window starts zero-filled, so statistics are defined from the first
/// tick on.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f64>,
    len: usize,
}

impl SlidingWindow {
    pub fn zeroed(len: usize) -> Self {
        Self {
            samples: std::iter::repeat(0.0).take(len).collect(),
            len,
        }
    }

    /// Append a sample, evicting the oldest one
    pub fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        while self.samples.len() > self.len {
            self.samples.pop_front();
        }
    }

    /// Refill the window with zeros
    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Sample standard deviation (Bessel's correction)
    pub fn std_dev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        variance.sqrt()
    }
}

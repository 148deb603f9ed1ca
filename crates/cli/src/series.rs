//! Time-series helpers used by run summaries
//!
//! Series are `(t, value)` pairs sorted by time.

pub type Series = Vec<(f64, f64)>;

/// Sum several step series: a point is emitted at every event once all
/// inputs have produced a value.
pub fn zip_sum(inputs: &[Series]) -> Series {
    let mut events: Vec<(f64, usize, f64)> = inputs
        .iter()
        .enumerate()
        .flat_map(|(i, series)| series.iter().map(move |&(t, v)| (t, i, v)))
        .collect();
    events.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut state: Vec<Option<f64>> = vec![None; inputs.len()];
    let mut out = Vec::new();
    for (t, i, v) in events {
        state[i] = Some(v);
        if state.iter().all(Option::is_some) {
            out.push((t, state.iter().flatten().sum()));
        }
    }
    out
}

/// Time-weighted average of a step series over consecutive `interval` windows.
///
/// The first window starts at the first interval boundary after the first
/// sample; windows not fully covered by the series are dropped.
pub fn time_weighted_average(series: &[(f64, f64)], interval: f64) -> Series {
    let (Some(&(first_t, _)), Some(&(last_t, _))) = (series.first(), series.last()) else {
        return Vec::new();
    };

    let mut window_start = (first_t / interval).floor() * interval + interval;
    let mut idx = 0;
    let mut current = series[0].1;
    while idx < series.len() && series[idx].0 <= window_start {
        current = series[idx].1;
        idx += 1;
    }

    let mut out = Vec::new();
    let mut window_end = window_start + interval;
    while window_end < last_t {
        let mut integral = 0.0;
        let mut t = window_start;
        while idx < series.len() && series[idx].0 <= window_end {
            integral += current * (series[idx].0 - t);
            t = series[idx].0;
            current = series[idx].1;
            idx += 1;
        }
        integral += current * (window_end - t);
        out.push((window_end, integral / interval));
        window_start = window_end;
        window_end += interval;
    }
    out
}

pub fn slice(series: &[(f64, f64)], start: f64, stop: f64) -> Series {
    series
        .iter()
        .copied()
        .filter(|&(t, _)| start <= t && t < stop)
        .collect()
}

pub fn average(series: &[(f64, f64)]) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    Some(series.iter().map(|(_, v)| v).sum::<f64>() / series.len() as f64)
}

/// Smallest value at or above `percentage`% of the values
pub fn percentile(values: &[f64], percentage: usize) -> Option<f64> {
    if values.is_empty() || percentage > 100 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (sorted.len() * percentage).saturating_sub(1) / 100;
    sorted.get(rank).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_sum_waits_for_every_input() {
        let a = vec![(1.0, 1.0), (3.0, 2.0)];
        let b = vec![(2.0, 10.0), (4.0, 20.0)];
        assert_eq!(zip_sum(&[a, b]), vec![(2.0, 11.0), (3.0, 12.0), (4.0, 22.0)]);
    }

    #[test]
    fn test_time_weighted_average_of_step() {
        // 1.0 until t=90, then 3.0
        let series = vec![(5.0, 1.0), (90.0, 3.0), (200.0, 3.0)];
        let averaged = time_weighted_average(&series, 60.0);
        assert_eq!(averaged.len(), 2);
        assert_eq!(averaged[0].0, 120.0);
        assert!((averaged[0].1 - 2.0).abs() < 1e-12);
        assert!((averaged[1].1 - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 99), Some(99.0));
        assert_eq!(percentile(&values, 100), Some(100.0));
        assert_eq!(percentile(&[0.3], 99), Some(0.3));
        assert_eq!(percentile(&[], 99), None);
    }

    #[test]
    fn test_slice_and_average() {
        let series = vec![(0.0, 1.0), (1.0, 2.0), (2.0, 3.0)];
        assert_eq!(average(&slice(&series, 1.0, 10.0)), Some(2.5));
        assert_eq!(average(&slice(&series, 5.0, 10.0)), None);
    }
}

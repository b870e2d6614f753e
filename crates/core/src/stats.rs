use serde::{Deserialize, Serialize};

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatencySummary {
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

impl LatencySummary {
    /// Sorts `samples` in place. The sort is stable, so equal latencies keep
    /// the order they were recorded in.
    pub fn from_samples(samples: &mut [u64]) -> Self {
        samples.sort();
        Self {
            p50_ns: percentile(samples, 0.50),
            p95_ns: percentile(samples, 0.95),
            p99_ns: percentile(samples, 0.99),
            max_ns: samples.last().copied().unwrap_or_default(),
        }
    }
}

pub fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_monotonic_and_bounded() {
        let mut samples = vec![90, 10, 40, 30, 20, 80, 70, 50, 60, 100, 5];
        let summary = LatencySummary::from_samples(&mut samples);
        assert!(summary.p50_ns <= summary.p95_ns);
        assert!(summary.p95_ns <= summary.p99_ns);
        assert!(summary.p99_ns <= summary.max_ns);
        assert_eq!(summary.max_ns, 100);
        assert_eq!(summary.p50_ns, 50);
    }

    #[test]
    fn single_and_empty_samples() {
        let mut one = vec![7];
        let summary = LatencySummary::from_samples(&mut one);
        assert_eq!(summary.p50_ns, 7);
        assert_eq!(summary.p99_ns, 7);
        assert_eq!(LatencySummary::from_samples(&mut []), LatencySummary::default());
    }

    #[test]
    fn ratio_handles_zero() {
        assert_eq!(ratio(1, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}

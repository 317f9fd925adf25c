//! Small statistics helpers shared by the analyzers.

/// The `p`th percentile of `sorted` (ascending order required): the
/// element at index `floor(p * n / 100)`, clamped to the last element.
/// Callers must not pass an empty slice.
pub fn percentile(sorted: &[f64], p: usize) -> f64 {
    let ix = (p * sorted.len() / 100).min(sorted.len() - 1);
    sorted[ix]
}

/// Distribution summary of a sample list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
    pub avg: f64,
}

/// Summarize `samples`; None when there are no samples (callers report
/// "no data" instead of zeros).
pub fn summarize(samples: &[f64]) -> Option<Summary> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(Summary {
        min: sorted[0],
        p50: percentile(&sorted, 50),
        p90: percentile(&sorted, 90),
        p99: percentile(&sorted, 99),
        max: *sorted.last().unwrap(),
        avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
    })
}

/// Throughput in Gbps for `bytes` transferred over `micros` microseconds.
pub fn gbps(bytes: u64, micros: f64) -> f64 {
    bytes as f64 * 8e-3 / micros
}

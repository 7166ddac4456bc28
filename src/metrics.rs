//! Baseline-relative and derived metrics.
//!
//! Subtractions are never clamped: counter noise can make a net value negative
//! and that is passed through as measured.

use std::ops::Sub;

const KB_PER_GIB: f64 = 1024.0 * 1024.0;

/// `combined - baseline`.
pub fn net<T: Sub<Output = T>>(combined: T, baseline: T) -> T {
    combined - baseline
}

/// Algorithm-attributable memory in GiB, from two kilobyte figures.
pub fn net_memory_gib(max_rss_kb: u64, dataset_kb: u64) -> f64 {
    net(max_rss_kb as f64, dataset_kb as f64) / KB_PER_GIB
}

/// Algorithm-attributable cache misses.
pub fn net_cache_misses(total: u64, baseline: u64) -> i64 {
    net(total as i128, baseline as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// `t1 / tn`; `None` when `tn` is not a positive time.
pub fn speedup(t1: f64, tn: f64) -> Option<f64> {
    (tn > 0.0 && t1.is_finite()).then(|| t1 / tn)
}

/// Speedup divided by thread count.
pub fn parallel_efficiency(t1: f64, tn: f64, threads: usize) -> Option<f64> {
    if threads == 0 {
        return None;
    }
    speedup(t1, tn).map(|s| s / threads as f64)
}

//! Robust statistics: median, median absolute deviation, robust Z-score.
//!
//! These are total functions: an empty input has median 0 so callers stay
//! branch-free. Spread guarding (`mad > MAD_EPSILON`) is the caller's job.

use spikewatch_core::constants::ROBUST_Z_SCALE;
use spikewatch_core::types::Baseline;

/// Median of `xs`. Returns 0 for empty input.
///
/// Sorts a copy; the input order is irrelevant.
///
/// # Examples
///
/// ```
/// use spikewatch_detect::stats::median;
/// assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
/// assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
/// assert_eq!(median(&[]), 0.0);
/// ```
pub fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Median absolute deviation of `xs` around `median`.
pub fn mad(xs: &[f64], median_value: f64) -> f64 {
    let deviations: Vec<f64> = xs.iter().map(|x| (x - median_value).abs()).collect();
    median(&deviations)
}

/// Robust Z-score: `0.6745 * (x - median) / mad`.
///
/// `mad` must be above `MAD_EPSILON`; a zero spread yields a non-finite result.
pub fn robust_z(x: f64, median_value: f64, mad_value: f64) -> f64 {
    ROBUST_Z_SCALE * (x - median_value) / mad_value
}

/// Compute the robust baseline of a set of listener counts.
pub fn baseline_of<I>(counts: I) -> Baseline
where
    I: IntoIterator<Item = u32>,
{
    let values: Vec<f64> = counts.into_iter().map(f64::from).collect();
    let m = median(&values);
    Baseline {
        median: m,
        mad: mad(&values, m),
        sample_count: values.len(),
    }
}

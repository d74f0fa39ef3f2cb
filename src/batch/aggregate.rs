//! # Statistics Aggregation
//!
//! Pure reduction from a list of `ItemResult`s plus the batch wall time into
//! `BatchStatistics`. The aggregator only knows how to count, sum, average
//! and divide. Everything domain-specific comes from a `MetricExtractor`
//! supplied by the caller.
//!
//! ## Zero Guards:
//! Every division goes through `safe_ratio`, which returns `0.0` when the
//! denominator is zero or the result would not be finite. An empty batch, an
//! all-failed batch and a zero-length duration all produce plain zeros.

use crate::batch::types::{BatchStatistics, ItemResult, Metrics};
use std::time::Duration;

/// Divide, returning `0.0` instead of NaN or infinity.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        let value = numerator / denominator;
        if value.is_finite() {
            return value;
        }
    }
    0.0
}

/// A batch-level quantity that can appear on either side of a `Ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantity {
    /// Sum of an extracted metric over successful items
    Sum(&'static str),
    /// Batch wall-clock duration in seconds
    Duration,
    /// Number of items in the batch
    Total,
}

/// A derived domain metric, e.g. `total_summary_length / total_original_length`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ratio {
    pub name: &'static str,
    pub numerator: Quantity,
    pub denominator: Quantity,
}

impl Ratio {
    pub const fn new(name: &'static str, numerator: Quantity, denominator: Quantity) -> Self {
        Self { name, numerator, denominator }
    }
}

/// Per-domain metric extraction, applied to successful outputs only.
///
/// ## Contract:
/// - `extract` returns named numbers for a single output. The aggregator
///   reports `total_<name>` (sum over successes) and `average_<name>`
///   (mean over successes) for each of them.
/// - `metric_names` lists the names `extract` produces so the keys are
///   present (as zeros) even when no item succeeded.
/// - `ratios` declares derived values computed from the summed totals.
///
/// Any `Fn(&O) -> Metrics` closure is an extractor with no declared names
/// and no ratios.
pub trait MetricExtractor<O> {
    fn extract(&self, output: &O) -> Metrics;

    fn metric_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn ratios(&self) -> Vec<Ratio> {
        Vec::new()
    }
}

impl<O, F> MetricExtractor<O> for F
where
    F: Fn(&O) -> Metrics,
{
    fn extract(&self, output: &O) -> Metrics {
        self(output)
    }
}

/// Extractor for batches that have no domain metrics.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

#[cfg(test)]
impl<O> MetricExtractor<O> for NoMetrics {
    fn extract(&self, _output: &O) -> Metrics {
        Metrics::new()
    }
}

/// Reduce per-item results into batch statistics.
///
/// ## Parameters:
/// - **results**: item outcomes, in any order
/// - **extractor**: domain metric extractor, applied to successes only
/// - **duration**: wall-clock span of the whole batch
///
/// ## Guarantees:
/// - Never panics, whatever the input
/// - `total == successful + failed`
/// - Same input always gives the same output
pub fn aggregate<O, E>(results: &[ItemResult<O>], extractor: &E, duration: Duration) -> BatchStatistics
where
    E: MetricExtractor<O> + ?Sized,
{
    let total = results.len();
    let seconds = duration.as_secs_f64();

    let mut successful = 0usize;
    let mut item_time_sum = 0.0f64;
    let mut sums = Metrics::new();
    for name in extractor.metric_names() {
        sums.insert(name.to_string(), 0.0);
    }

    for result in results {
        if let ItemResult::Success { output, processing_time_seconds, .. } = result {
            successful += 1;
            item_time_sum += processing_time_seconds;
            for (name, value) in extractor.extract(output) {
                *sums.entry(name).or_insert(0.0) += value;
            }
        }
    }

    let failed = total - successful;
    let mut domain = Metrics::new();

    for (name, sum) in &sums {
        domain.insert(format!("total_{}", name), *sum);
        domain.insert(format!("average_{}", name), safe_ratio(*sum, successful as f64));
    }
    domain.insert(
        "average_item_processing_time_seconds".to_string(),
        safe_ratio(item_time_sum, successful as f64),
    );

    let resolve = |quantity: Quantity| -> f64 {
        match quantity {
            Quantity::Sum(name) => sums.get(name).copied().unwrap_or(0.0),
            Quantity::Duration => seconds,
            Quantity::Total => total as f64,
        }
    };
    for ratio in extractor.ratios() {
        let value = safe_ratio(resolve(ratio.numerator), resolve(ratio.denominator));
        domain.insert(ratio.name.to_string(), value);
    }

    BatchStatistics {
        total,
        successful,
        failed,
        total_processing_time_seconds: seconds,
        average_processing_time: safe_ratio(seconds, total as f64),
        items_per_second: safe_ratio(total as f64, seconds),
        domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LengthExtractor;

    impl MetricExtractor<(usize, usize)> for LengthExtractor {
        fn extract(&self, output: &(usize, usize)) -> Metrics {
            let mut metrics = Metrics::new();
            metrics.insert("original_length".to_string(), output.0 as f64);
            metrics.insert("summary_length".to_string(), output.1 as f64);
            metrics
        }

        fn metric_names(&self) -> Vec<&'static str> {
            vec!["original_length", "summary_length"]
        }

        fn ratios(&self) -> Vec<Ratio> {
            vec![Ratio::new(
                "average_compression_ratio",
                Quantity::Sum("summary_length"),
                Quantity::Sum("original_length"),
            )]
        }
    }

    fn success(index: usize, output: (usize, usize)) -> ItemResult<(usize, usize)> {
        ItemResult::Success { index, output, processing_time_seconds: 0.25 }
    }

    fn failure(index: usize) -> ItemResult<(usize, usize)> {
        ItemResult::Failure { index, error_message: "boom".to_string() }
    }

    #[test]
    fn test_safe_ratio_guards() {
        assert_eq!(safe_ratio(10.0, 0.0), 0.0);
        assert_eq!(safe_ratio(10.0, -1.0), 0.0);
        assert_eq!(safe_ratio(f64::INFINITY, 1.0), 0.0);
        assert_eq!(safe_ratio(10.0, 4.0), 2.5);
    }

    #[test]
    fn test_empty_batch_is_all_zero() {
        let stats = aggregate::<(usize, usize), _>(&[], &LengthExtractor, Duration::ZERO);

        assert_eq!(stats.total, 0);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_processing_time_seconds, 0.0);
        assert_eq!(stats.average_processing_time, 0.0);
        assert_eq!(stats.items_per_second, 0.0);
        assert!(stats.domain.values().all(|v| *v == 0.0));
        assert!(stats.domain.contains_key("average_compression_ratio"));
    }

    #[test]
    fn test_all_failures_have_finite_zero_averages() {
        let results: Vec<_> = (0..5).map(failure).collect();
        let stats = aggregate(&results, &LengthExtractor, Duration::from_secs(5));

        assert_eq!(stats.total, 5);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.average_processing_time, 1.0);
        assert_eq!(stats.items_per_second, 1.0);
        assert_eq!(stats.domain["average_compression_ratio"], 0.0);
        assert_eq!(stats.domain["average_original_length"], 0.0);
        assert!(stats.domain.values().all(|v| v.is_finite()));
    }

    #[test]
    fn test_domain_metrics_only_count_successes() {
        let results = vec![success(0, (100, 20)), failure(1), success(2, (300, 60))];
        let stats = aggregate(&results, &LengthExtractor, Duration::from_secs(2));

        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.domain["total_original_length"], 400.0);
        assert_eq!(stats.domain["total_summary_length"], 80.0);
        assert_eq!(stats.domain["average_original_length"], 200.0);
        assert_eq!(stats.domain["average_compression_ratio"], 0.2);
        assert_eq!(stats.domain["average_item_processing_time_seconds"], 0.25);
        assert_eq!(stats.items_per_second, 1.5);
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let results = vec![success(0, (10, 3)), failure(1), success(2, (7, 2))];
        let first = aggregate(&results, &LengthExtractor, Duration::from_millis(1500));
        let second = aggregate(&results, &LengthExtractor, Duration::from_millis(1500));
        assert_eq!(first, second);
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |output: &(usize, usize)| {
            let mut metrics = Metrics::new();
            metrics.insert("pixels".to_string(), (output.0 * output.1) as f64);
            metrics
        };
        let results = vec![success(0, (4, 5)), success(1, (2, 2))];
        let stats = aggregate(&results, &extractor, Duration::from_secs(1));
        assert_eq!(stats.domain["total_pixels"], 24.0);
    }
}

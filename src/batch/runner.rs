//! # Bounded Batch Runner
//!
//! Runs N independent async processor calls with at most K in flight,
//! isolating each item's failure from its siblings.
//!
//! ## How it works:
//! 1. Record the batch start time
//! 2. Create a `Semaphore` with `max_concurrency` permits (the admission gate)
//! 3. Build one future per `WorkUnit`: acquire a permit, call the processor,
//!    turn its outcome (error or even panic) into an `ItemResult`
//! 4. `join_all` drives every future to completion on the caller's task
//! 5. Sort results by index, record the end time
//!
//! ## Key Rust Concepts Used:
//! - **RAII permits**: `SemaphorePermit` releases its slot when dropped, so a
//!   failing or panicking processor can never leak a slot
//! - **Cooperative concurrency**: nothing is spawned; all item futures are
//!   multiplexed on the task that called `run`, which also means processors
//!   do not need to be `Send`
//! - **catch_unwind**: a panicking processor is reported as a failure instead
//!   of tearing down the whole batch

use crate::batch::aggregate::{aggregate, MetricExtractor};
use crate::batch::types::{BatchOutcome, ItemResult, WorkUnit};
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, FutureExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Errors that stop a batch before any item runs.
///
/// Per-item problems are never reported here; they become
/// `ItemResult::Failure` entries instead.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchError {
    InvalidArgument(String),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for BatchError {}

/// Raw result of a batch run, before aggregation.
#[derive(Debug)]
pub struct BatchRun<O> {
    /// One result per input unit, sorted by index
    pub results: Vec<ItemResult<O>>,
    /// Wall-clock span of the whole batch
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

impl<O> BatchRun<O> {
    /// Aggregate statistics with a domain extractor and build the outcome.
    pub fn into_outcome<E>(self, extractor: &E) -> BatchOutcome<O>
    where
        E: MetricExtractor<O> + ?Sized,
    {
        let statistics = aggregate(&self.results, extractor, self.duration);
        BatchOutcome {
            results: self.results,
            statistics,
            completed_at: self.completed_at,
        }
    }
}

/// Semaphore-gated fan-out over `WorkUnit`s.
///
/// ## Usage Example:
/// ```rust
/// let runner = BoundedBatchRunner::new(4)?;
/// let run = runner.run(units, |text, options| summarize(text, options)).await;
/// let outcome = run.into_outcome(&TextMetrics);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BoundedBatchRunner {
    max_concurrency: usize,
}

impl BoundedBatchRunner {
    /// Create a runner admitting at most `max_concurrency` items at once.
    ///
    /// Fails with `BatchError::InvalidArgument` when the limit is below one
    /// or larger than the semaphore can represent.
    pub fn new(max_concurrency: usize) -> Result<Self, BatchError> {
        if max_concurrency < 1 {
            return Err(BatchError::InvalidArgument(format!(
                "max_concurrency must be at least 1, got {}",
                max_concurrency
            )));
        }
        if max_concurrency > Semaphore::MAX_PERMITS {
            return Err(BatchError::InvalidArgument(format!(
                "max_concurrency must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                max_concurrency
            )));
        }
        Ok(Self { max_concurrency })
    }

    /// Process every unit and return index-ordered results.
    ///
    /// The processor is called exactly once per unit, only after that unit
    /// holds a permit. Its error (or panic) becomes a `Failure` for that
    /// index and never affects other units. The call returns only after
    /// every unit has resolved.
    pub async fn run<P, A, O, E, F, Fut>(&self, units: Vec<WorkUnit<P, A>>, processor: F) -> BatchRun<O>
    where
        F: Fn(P, A) -> Fut,
        Fut: Future<Output = Result<O, E>>,
        E: fmt::Display,
    {
        if units.is_empty() {
            debug!("Empty batch, nothing to run");
            return BatchRun {
                results: Vec::new(),
                duration: Duration::ZERO,
                completed_at: Utc::now(),
            };
        }

        let item_count = units.len();
        info!(items = item_count, max_concurrency = self.max_concurrency, "Batch started");

        let started = Instant::now();
        let gate = Semaphore::new(self.max_concurrency);
        let gate = &gate;
        let processor = &processor;

        let tasks = units.into_iter().map(|unit| async move {
            let WorkUnit { index, payload, params } = unit;

            let _permit = match gate.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    return ItemResult::Failure {
                        index,
                        error_message: format!("Concurrency gate unavailable: {}", e),
                    }
                }
            };

            let item_started = Instant::now();
            let outcome = AssertUnwindSafe(processor(payload, params)).catch_unwind().await;
            let processing_time_seconds = item_started.elapsed().as_secs_f64();

            match outcome {
                Ok(Ok(output)) => ItemResult::Success { index, output, processing_time_seconds },
                Ok(Err(err)) => {
                    let mut error_message = format!("{:#}", err);
                    if error_message.is_empty() {
                        error_message = "Item processing failed".to_string();
                    }
                    warn!(index, error = %error_message, "Batch item failed");
                    ItemResult::Failure { index, error_message }
                }
                Err(panic) => {
                    let error_message = format!("Processor panicked: {}", panic_message(&panic));
                    warn!(index, error = %error_message, "Batch item panicked");
                    ItemResult::Failure { index, error_message }
                }
            }
        });

        let mut results = join_all(tasks).await;
        results.sort_by_key(ItemResult::index);

        let duration = started.elapsed();
        let successful = results.iter().filter(|r| r.is_success()).count();
        info!(
            items = item_count,
            successful,
            failed = item_count - successful,
            duration_ms = duration.as_millis() as u64,
            "Batch completed"
        );

        BatchRun {
            results,
            duration,
            completed_at: Utc::now(),
        }
    }
}

/// Run a batch with a fresh runner. Fails only on an invalid concurrency limit.
pub async fn run_batch<P, A, O, E, F, Fut>(
    units: Vec<WorkUnit<P, A>>,
    processor: F,
    max_concurrency: usize,
) -> Result<BatchRun<O>, BatchError>
where
    F: Fn(P, A) -> Fut,
    Fut: Future<Output = Result<O, E>>,
    E: fmt::Display,
{
    let runner = BoundedBatchRunner::new(max_concurrency)?;
    Ok(runner.run(units, processor).await)
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::aggregate::NoMetrics;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn indices<O>(results: &[ItemResult<O>]) -> Vec<usize> {
        results.iter().map(ItemResult::index).collect()
    }

    #[tokio::test]
    async fn test_three_texts_all_succeed_in_order() {
        let units = WorkUnit::from_payloads(
            vec!["first text".to_string(), "second".to_string(), "third one".to_string()],
            &(),
        );

        let outcome = run_batch(
            units,
            |text: String, _: ()| async move { Ok::<_, anyhow::Error>(text.len()) },
            2,
        )
        .await
        .unwrap()
        .into_outcome(&NoMetrics);

        assert_eq!(outcome.statistics.successful, 3);
        assert_eq!(outcome.statistics.failed, 0);
        assert_eq!(indices(&outcome.results), vec![0, 1, 2]);
        assert_eq!(outcome.results[1].output(), Some(&6));
    }

    #[tokio::test]
    async fn test_corrupt_item_fails_alone() {
        let payloads: Vec<Vec<u8>> = vec![b"RIFFgood".to_vec(), b"garbage".to_vec(), b"RIFFalso".to_vec()];
        let units = WorkUnit::from_payloads(payloads, &());

        let outcome = run_batch(
            units,
            |bytes: Vec<u8>, _: ()| async move {
                if !bytes.starts_with(b"RIFF") {
                    return Err(anyhow!("unsupported audio encoding"));
                }
                Ok(bytes.len())
            },
            3,
        )
        .await
        .unwrap()
        .into_outcome(&NoMetrics);

        assert!(outcome.results[0].is_success());
        assert!(!outcome.results[1].is_success());
        assert!(outcome.results[2].is_success());
        assert!(!outcome.results[1].error_message().unwrap().is_empty());
        assert_eq!(outcome.failed_indices(), vec![1]);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_zero_statistics() {
        let units: Vec<WorkUnit<String, ()>> = Vec::new();
        let outcome = run_batch(units, |_: String, _: ()| async { Ok::<usize, anyhow::Error>(0) }, 4)
            .await
            .unwrap()
            .into_outcome(&NoMetrics);

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.statistics.total, 0);
        assert_eq!(outcome.statistics.total_processing_time_seconds, 0.0);
        assert_eq!(outcome.statistics.items_per_second, 0.0);
        assert_eq!(outcome.statistics.average_processing_time, 0.0);
    }

    #[tokio::test]
    async fn test_serial_and_parallel_results_match() {
        let make_units = || WorkUnit::from_payloads((0u64..10).collect::<Vec<_>>(), &());
        let processor = |seed: u64, _: ()| async move {
            tokio::time::sleep(Duration::from_millis((10 - seed) * 2)).await;
            Ok::<_, anyhow::Error>(seed * seed + 1)
        };

        let serial = run_batch(make_units(), processor, 1).await.unwrap();
        let parallel = run_batch(make_units(), processor, 10).await.unwrap();

        let strip = |run: &BatchRun<u64>| -> Vec<(usize, Option<u64>)> {
            run.results.iter().map(|r| (r.index(), r.output().copied())).collect()
        };
        assert_eq!(strip(&serial), strip(&parallel));
        assert_eq!(indices(&serial.results), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_concurrency_is_invalid_argument() {
        let err = BoundedBatchRunner::new(0).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_zero_concurrency_never_calls_processor() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let units = WorkUnit::from_payloads(vec![1, 2, 3], &());

        let result = run_batch(
            units,
            move |n: i32, _: ()| async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(n)
            },
            0,
        )
        .await;

        assert!(matches!(result, Err(BatchError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_failures_still_report_throughput() {
        let units = WorkUnit::from_payloads(vec![(); 5], &());
        let outcome = run_batch(
            units,
            |_: (), _: ()| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<(), _>(anyhow!("model unavailable"))
            },
            2,
        )
        .await
        .unwrap()
        .into_outcome(&NoMetrics);

        let stats = &outcome.statistics;
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 5);
        assert!(stats.total_processing_time_seconds > 0.0);
        assert!(stats.items_per_second > 0.0);
        assert!(stats.items_per_second.is_finite());
        assert!(stats.average_processing_time > 0.0);
    }

    #[tokio::test]
    async fn test_results_are_complete_and_ordered_despite_completion_order() {
        let n = 25u64;
        let units = WorkUnit::from_payloads((0..n).collect::<Vec<_>>(), &());
        let run = run_batch(
            units,
            |i: u64, _: ()| async move {
                // later indices finish first
                tokio::time::sleep(Duration::from_millis((n - i) * 2)).await;
                if i % 7 == 3 {
                    Err(anyhow!("item {} rejected", i))
                } else {
                    Ok(i)
                }
            },
            8,
        )
        .await
        .unwrap();

        assert_eq!(run.results.len(), n as usize);
        for (position, result) in run.results.iter().enumerate() {
            assert_eq!(result.index(), position);
            assert_eq!(result.is_success(), position % 7 != 3);
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        for limit in [1usize, 2, 3, 5, 16] {
            let in_flight = AtomicUsize::new(0);
            let peak = AtomicUsize::new(0);
            let in_flight = &in_flight;
            let peak = &peak;

            let units = WorkUnit::from_payloads((0u64..12).collect::<Vec<_>>(), &());
            let run = run_batch(
                units,
                move |i: u64, _: ()| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1 + i % 4)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(i)
                },
                limit,
            )
            .await
            .unwrap();

            assert_eq!(run.results.len(), 12);
            assert!(peak.load(Ordering::SeqCst) <= limit);
            assert!(peak.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test]
    async fn test_panicking_processor_is_isolated() {
        let units = WorkUnit::from_payloads(vec![1, 2, 3], &());
        let run = run_batch(
            units,
            |n: i32, _: ()| async move {
                if n == 2 {
                    panic!("decoder exploded");
                }
                Ok::<_, anyhow::Error>(n * 10)
            },
            1,
        )
        .await
        .unwrap();

        assert_eq!(run.results[0].output(), Some(&10));
        assert!(run.results[1].error_message().unwrap().contains("decoder exploded"));
        assert_eq!(run.results[2].output(), Some(&30));
    }

    #[tokio::test]
    async fn test_params_reach_processor() {
        let units = vec![
            WorkUnit::new(0, "a".to_string(), 3usize),
            WorkUnit::new(1, "b".to_string(), 1usize),
        ];
        let run = run_batch(
            units,
            |s: String, times: usize| async move { Ok::<_, anyhow::Error>(s.repeat(times)) },
            2,
        )
        .await
        .unwrap();

        assert_eq!(run.results[0].output().map(String::as_str), Some("aaa"));
        assert_eq!(run.results[1].output().map(String::as_str), Some("b"));
    }
}

//! # Service Statistics
//!
//! Cross-request counters for one processing service. Every field is an
//! atomic, so concurrent handlers update them without a lock and a snapshot
//! never blocks a request.
//!
//! ## Usage:
//! ```rust
//! let timer = stats.start();
//! match do_work().await {
//!     Ok(out) => { timer.success(out.len() as u64); Ok(out) }
//!     Err(e) => { timer.failure(); Err(e) }
//! }
//! ```
//! A timer that is dropped without either call counts as a failure.

use crate::batch::safe_ratio;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for one service.
///
/// `total_input_units` is domain-defined: characters for text, images for
/// image captioning, milliseconds of audio for transcription.
#[derive(Debug, Default)]
pub struct ServiceStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_input_units: AtomicU64,
    total_processing_micros: AtomicU64,
}

/// Point-in-time copy of a `ServiceStats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub in_flight_requests: u64,
    pub total_input_units: u64,
    pub total_processing_time_seconds: f64,
    pub average_processing_time_seconds: f64,
    pub average_input_units: f64,
    pub success_rate: f64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new request and start timing it.
    pub fn start(&self) -> RequestTimer<'_> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        RequestTimer {
            stats: self,
            started: Instant::now(),
            finished: false,
        }
    }

    fn record_success(&self, input_units: u64, micros: u64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_input_units.fetch_add(input_units, Ordering::Relaxed);
        self.total_processing_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let units = self.total_input_units.load(Ordering::Relaxed);
        let seconds = self.total_processing_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        ServiceStatsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            in_flight_requests: total.saturating_sub(successful + failed),
            total_input_units: units,
            total_processing_time_seconds: seconds,
            average_processing_time_seconds: safe_ratio(seconds, successful as f64),
            average_input_units: safe_ratio(units as f64, successful as f64),
            success_rate: safe_ratio(successful as f64, (successful + failed) as f64),
        }
    }
}

/// In-progress measurement of one request.
#[must_use = "finish the timer with success() or failure()"]
pub struct RequestTimer<'a> {
    stats: &'a ServiceStats,
    started: Instant,
    finished: bool,
}

impl RequestTimer<'_> {
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Record a successful request and return its duration in seconds.
    pub fn success(mut self, input_units: u64) -> f64 {
        let elapsed = self.started.elapsed();
        self.stats.record_success(input_units, elapsed.as_micros() as u64);
        self.finished = true;
        elapsed.as_secs_f64()
    }

    pub fn failure(mut self) {
        self.stats.record_failure();
        self.finished = true;
    }
}

impl Drop for RequestTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.record_failure();
        }
    }
}

//! # Batch Data Model
//!
//! Plain value types shared by the runner and the aggregator. None of them
//! are mutated once created: a `WorkUnit` is consumed by the runner and an
//! `ItemResult` is only ever read after it has been recorded.
//!
//! ## Key Rust Concepts Used:
//! - **Generics**: `WorkUnit<P, A>` and `ItemResult<O>` know nothing about
//!   text, images or audio. Each domain plugs in its own payload, params and
//!   output types.
//! - **Tagged enums**: `ItemResult` is either a success or a failure, never
//!   both, which is exactly the "one result per input" invariant.
//! - **serde tagging**: `#[serde(tag = "status")]` produces the
//!   `{"status": "success", ...}` / `{"status": "failed", ...}` JSON shape.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Named numeric values produced by a metric extractor or the aggregator.
///
/// `BTreeMap` keeps keys sorted, so serialized statistics are stable.
pub type Metrics = BTreeMap<String, f64>;

/// One discrete item of a batch request.
///
/// ## Fields:
/// - `index`: position in the caller's input sequence, used to restore order
/// - `payload`: the domain input (text, encoded image bytes, encoded audio)
/// - `params`: per-item processing options (length bounds, language, adapter)
#[derive(Debug, Clone)]
pub struct WorkUnit<P, A> {
    pub index: usize,
    pub payload: P,
    pub params: A,
}

impl<P, A> WorkUnit<P, A> {
    pub fn new(index: usize, payload: P, params: A) -> Self {
        Self { index, payload, params }
    }
}

impl<P, A: Clone> WorkUnit<P, A> {
    /// Build index-tagged units from payloads that all share one set of params.
    pub fn from_payloads(payloads: impl IntoIterator<Item = P>, params: &A) -> Vec<Self> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Self::new(index, payload, params.clone()))
            .collect()
    }
}

/// Outcome of processing a single `WorkUnit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum ItemResult<O> {
    #[serde(rename = "success")]
    Success {
        index: usize,
        output: O,
        /// Wall time of this item's processor call, measured by the runner
        processing_time_seconds: f64,
    },
    #[serde(rename = "failed")]
    Failure { index: usize, error_message: String },
}

impl<O> ItemResult<O> {
    pub fn index(&self) -> usize {
        match self {
            ItemResult::Success { index, .. } | ItemResult::Failure { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemResult::Success { .. })
    }

    #[cfg(test)]
    pub fn output(&self) -> Option<&O> {
        match self {
            ItemResult::Success { output, .. } => Some(output),
            ItemResult::Failure { .. } => None,
        }
    }

    #[cfg(test)]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ItemResult::Failure { error_message, .. } => Some(error_message),
            ItemResult::Success { .. } => None,
        }
    }
}

/// Summary of a batch.
///
/// `total_processing_time_seconds` is the wall-clock span of the whole
/// batch, not the sum of per-item times. Every ratio is zero when its
/// denominator is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct BatchStatistics {
    #[serde(rename = "total_count")]
    pub total: usize,
    #[serde(rename = "successful_count")]
    pub successful: usize,
    #[serde(rename = "failed_count")]
    pub failed: usize,
    pub total_processing_time_seconds: f64,
    pub average_processing_time: f64,
    pub items_per_second: f64,
    /// Domain aggregates computed over successful items only
    pub domain: Metrics,
}

/// Everything a batch call returns: ordered results plus statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome<O> {
    /// Sorted by `index`, one entry per input unit
    pub results: Vec<ItemResult<O>>,
    pub statistics: BatchStatistics,
    pub completed_at: DateTime<Utc>,
}

impl<O> BatchOutcome<O> {
    /// Indices of the items that failed, in ascending order.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(ItemResult::index)
            .collect()
    }
}

//! # Batch Processing Core
//!
//! One generic implementation of "process N items with at most K in flight,
//! keep going when some fail, then summarize". The text, image and audio
//! services all run their batch endpoints through it, each supplying a
//! processor closure and a metric extractor.
//!
//! ## Module Organization:
//! - **types**: `WorkUnit`, `ItemResult`, `BatchStatistics`, `BatchOutcome`
//! - **runner**: `BoundedBatchRunner` and the `run_batch` entry point
//! - **aggregate**: the pure `aggregate` function and `MetricExtractor`

pub mod aggregate;
pub mod runner;
pub mod types;

pub use aggregate::{safe_ratio, MetricExtractor, Quantity, Ratio};
pub use runner::{run_batch, BatchError};
pub use types::{BatchOutcome, Metrics, WorkUnit};

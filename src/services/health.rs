//! # Service Health Checks
//!
//! A health check runs one tiny inference against the loaded provider and
//! reports whether it came back. It does not touch the service statistics,
//! so polling it leaves the request counters alone.

use crate::models::{ModelKind, ModelUnavailable};
use crate::services::{round2, run_blocking};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Loaded, but the test inference failed
    Unhealthy,
    /// No provider loaded
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthState,
    pub model_loaded: bool,
    pub test_successful: bool,
    /// Length of the test output, in characters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_output_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Run `check` on the blocking pool, or report the model as unavailable when
/// there is nothing to check. `check` returns the output length.
pub(crate) async fn run_check<F>(kind: ModelKind, check: Option<F>) -> ServiceHealth
where
    F: FnOnce() -> anyhow::Result<usize> + Send + 'static,
{
    let started = Instant::now();
    let (status, model_loaded, outcome) = match check {
        None => (HealthState::Unavailable, false, Err(ModelUnavailable(kind).to_string())),
        Some(check) => match run_blocking(check).await {
            Ok(length) => (HealthState::Healthy, true, Ok(length)),
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(model = %kind, error = %message, "Health check inference failed");
                (HealthState::Unhealthy, true, Err(message))
            }
        },
    };

    ServiceHealth {
        status,
        model_loaded,
        test_successful: outcome.is_ok(),
        test_output_length: outcome.as_ref().ok().copied(),
        error: outcome.err(),
        duration_seconds: round2(started.elapsed().as_secs_f64()),
        timestamp: Utc::now(),
    }
}

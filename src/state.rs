//! # Application State Management
//!
//! Shared state that every HTTP handler can reach through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the runtime configuration, replaceable through `PUT /config`
//! - **metrics**: per-endpoint HTTP counters, written by `MetricsMiddleware`
//! - **loader**: the `ModelLoader` holding the three inference providers
//! - **services**: text, image and audio services, each with its own statistics
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every actix worker hold the same loader and services
//! - **Cloning**: `AppState::clone()` only bumps reference counts
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many handlers read the config at once; `PUT /config` writes it
//! - **Snapshots**: handlers call `get_config()` once per request and work on
//!   that copy, so a concurrent update never changes limits halfway through
//!   a batch
//!
//! ### Poisoned locks
//! A panic while holding a `std::sync::RwLock` poisons it. The data here is
//! plain counters and config values that stay consistent on their own, so a
//! poisoned lock is recovered with `into_inner()` instead of panicking.

use crate::config::AppConfig;
use crate::models::ModelLoader;
use crate::services::audio::AudioService;
use crate::services::image::ImageService;
use crate::services::text::TextService;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Owner of the loaded models
    pub loader: Arc<ModelLoader>,

    pub text_service: Arc<TextService>,
    pub image_service: Arc<ImageService>,
    pub audio_service: Arc<AudioService>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Responses with a 4xx/5xx status, plus requests that errored out
    pub error_count: u64,

    /// Key: "METHOD /path", e.g. "POST /api/v1/text/summarize"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the state and the three services around a model loader.
    pub fn new(config: AppConfig, loader: Arc<ModelLoader>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            text_service: Arc::new(TextService::new(loader.clone())),
            image_service: Arc::new(ImageService::new(loader.clone())),
            audio_service: Arc::new(AudioService::new(loader.clone())),
            loader,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record one finished request for an endpoint.
    ///
    /// The first request to an endpoint creates its entry with `or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot of current metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        crate::batch::safe_ratio(self.total_duration_ms as f64, self.request_count as f64)
    }

    /// Share of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        crate::batch::safe_ratio(self.error_count as f64, self.request_count as f64)
    }
}

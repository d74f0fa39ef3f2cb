//! # HTTP Handlers
//!
//! Every route lives under `/api/v1`; [`configure_routes`] registers them so
//! `main` and the handler tests build the same application.
//!
//! ## Module Organization:
//! - **config**: runtime configuration read/update
//! - **models**: model registry and memory summary
//! - **text**, **image**, **audio**: one module per domain service
//! - **multipart**: shared form reading for the upload endpoints

pub mod audio;
pub mod config;
pub mod image;
pub mod models;
pub mod multipart;
pub mod text;

use crate::batch::BatchOutcome;
use crate::error::{AppError, AppResult};
use crate::health;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// Upper bound for JSON request bodies (a full batch of long texts fits).
pub const JSON_LIMIT_BYTES: usize = 8 * 1024 * 1024;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health/ping", web::get().to(health::ping))
            .route("/health/status", web::get().to(health::health_status))
            .route("/health/ready", web::get().to(health::readiness))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(config::get_config))
            .route("/config", web::put().to(config::update_config))
            .route("/models", web::get().to(models::list_models))
            .service(
                web::scope("/text")
                    .route("/summarize", web::post().to(text::summarize))
                    .route("/batch-summarize", web::post().to(text::batch_summarize))
                    .route("/model-info", web::get().to(text::model_info))
                    .route("/stats", web::get().to(text::stats)),
            )
            .service(
                web::scope("/image")
                    .route("/upload", web::post().to(image::upload))
                    .route("/caption", web::post().to(image::caption))
                    .route("/describe", web::post().to(image::describe))
                    .route("/batch-caption", web::post().to(image::batch_caption))
                    .route("/model-info", web::get().to(image::model_info))
                    .route("/stats", web::get().to(image::stats)),
            )
            .service(
                web::scope("/audio")
                    .route("/upload", web::post().to(audio::upload))
                    .route("/speech-to-text", web::post().to(audio::speech_to_text))
                    .route("/translate", web::post().to(audio::translate))
                    .route("/batch-transcribe", web::post().to(audio::batch_transcribe))
                    .route("/supported-languages", web::get().to(audio::supported_languages))
                    .route("/model-info", web::get().to(audio::model_info))
                    .route("/stats", web::get().to(audio::stats)),
            ),
    );
}

/// JSON extractor settings. Malformed bodies get the usual error envelope
/// instead of actix's plain-text 400.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(JSON_LIMIT_BYTES)
        .error_handler(|err, _req| AppError::BadRequest(format!("Invalid JSON body: {}", err)).into())
}

/// Reject empty batches and batches over `max_batch_size`.
pub(crate) fn check_batch_size(len: usize, max_batch_size: usize) -> AppResult<()> {
    if len == 0 {
        return Err(AppError::ValidationError("Batch must contain at least one item".to_string()));
    }
    if len > max_batch_size {
        return Err(AppError::ValidationError(format!(
            "Batch size {} exceeds maximum of {}",
            len, max_batch_size
        )));
    }
    Ok(())
}

/// Batch body: results, statistics, completion time and the failed indices.
/// Partial failure is still a 200.
pub(crate) fn batch_response<O: Serialize>(outcome: BatchOutcome<O>) -> HttpResponse {
    let failed_indices = outcome.failed_indices();
    HttpResponse::Ok().json(json!({
        "results": outcome.results,
        "statistics": outcome.statistics,
        "completed_at": outcome.completed_at,
        "failed_indices": failed_indices
    }))
}

/// Service counters as returned by every `/stats` route.
pub(crate) fn stats_response(service: &str, stats: &crate::services::ServiceStats) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": service,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stats": stats.snapshot()
    }))
}

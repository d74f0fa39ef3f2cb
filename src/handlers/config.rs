//! # Runtime Configuration Endpoints
//!
//! - `GET /config`: the full current configuration
//! - `PUT /config`: partial JSON update, e.g. `{"performance": {"max_batch_size": 10}}`
//!
//! Updates are validated before they replace the stored config. Batch size
//! and concurrency changes apply from the next request on; server host/port
//! and model ids only take effect after a restart.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config()
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(format!("{:#}", e)))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;
    info!(
        max_batch_size = current_config.performance.max_batch_size,
        max_concurrent_requests = current_config.performance.max_concurrent_requests,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

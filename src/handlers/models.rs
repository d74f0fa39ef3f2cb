//! # Model Registry Endpoint
//!
//! `GET /models` lists the three model slots with their configured ids,
//! adapters and load status, plus the memory they hold against the
//! `max_model_memory_mb` budget.
//!
//! ## Response:
//! ```json
//! {
//!   "device": "cpu",
//!   "all_loaded": false,
//!   "models": [
//!     { "kind": "text_summarizer", "model_id": "google-t5/t5-small",
//!       "status": { "state": "loaded", "loaded_at": 1735689600, "memory_usage_bytes": 242000000 } }
//!   ],
//!   "memory": { "total_mb": 230.79, "budget_mb": 4096, "within_budget": true }
//! }
//! ```

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let models = state.loader.list_models().await;
    let all_loaded = models.iter().all(|m| m.status.is_loaded());

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "device": state.loader.device_name(),
        "all_loaded": all_loaded,
        "models": models,
        "memory": state.loader.memory_usage().await
    })))
}

#[cfg(test)]
mod tests {
    use crate::handlers::test_support::{body_json, loaded_state, test_app, unloaded_state};
    use actix_web::test;

    #[actix_web::test]
    async fn test_list_models_before_loading() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["all_loaded"], false);
        assert_eq!(body["models"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["memory"]["total_bytes"], 0);
    }

    #[actix_web::test]
    async fn test_list_models_reports_memory() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["all_loaded"], true);
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["memory"]["total_bytes"], 3 * 1024 * 1024);
        assert_eq!(body["memory"]["within_budget"], true);
        assert!(body["models"]
            .as_array()
            .is_some_and(|models| models.iter().all(|m| m["status"]["state"] == "loaded")));
    }
}

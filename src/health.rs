//! # Health and Metrics Endpoints
//!
//! - `GET /health/ping`: liveness, no dependencies touched
//! - `GET /health/status`: process memory, uptime, request totals, device and models.
//!   With `?deep=true` each service also runs a small test inference
//!   and reports its result under `services`
//! - `GET /health/ready`: 200 once every model is loaded, 503 before that
//! - `GET /metrics`: per-endpoint request counters

use crate::batch::safe_ratio;
use crate::device::DeviceManager;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::process;

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "message": "EnnovateX AI backend is running"
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Run each service's test inference
    #[serde(default)]
    pub deep: bool,
}

pub async fn health_status(state: web::Data<AppState>, query: web::Query<StatusQuery>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let models = state.loader.list_models().await;
    let mut healthy = models.iter().all(|m| m.status.is_loaded());

    let services = if query.deep {
        let (text, image, audio) = tokio::join!(
            state.text_service.health_check(),
            state.image_service.health_check(),
            state.audio_service.health_check()
        );
        healthy &= text.is_healthy() && image.is_healthy() && audio.is_healthy();
        Some(json!({ "text": text, "image": image, "audio": audio }))
    } else {
        None
    };

    let mut body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": safe_ratio(metrics.error_count as f64, metrics.request_count as f64)
        },
        "memory": get_memory_info(),
        "model_memory": state.loader.memory_usage().await,
        "device": DeviceManager::get_summary(state.loader.device()),
        "models": models
    });
    if let Some(services) = services {
        body["services"] = services;
    }
    HttpResponse::Ok().json(body)
}

/// Readiness probe. Each model reports its own check so a load balancer log
/// shows which one is holding the service back.
pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let models = state.loader.list_models().await;
    let checks: Vec<_> = models
        .iter()
        .map(|entry| {
            json!({
                "model": entry.kind,
                "model_id": entry.model_id,
                "ready": entry.status.is_loaded(),
                "detail": entry.status.description()
            })
        })
        .collect();

    let ready = models.iter().all(|m| m.status.is_loaded());
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "checks": checks
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics.endpoint_metrics.iter().collect();
    endpoint_stats.sort_by(|a, b| a.0.cmp(b.0));
    let endpoint_stats: Vec<_> = endpoint_stats
        .into_iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": safe_ratio(metrics.error_count as f64, metrics.request_count as f64),
            "requests_per_second": safe_ratio(metrics.request_count as f64, uptime_seconds as f64)
        },
        "endpoints": endpoint_stats,
        "services": {
            "text": state.text_service.stats().snapshot(),
            "image": state.image_service.stats().snapshot(),
            "audio": state.audio_service.stats().snapshot()
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_requests": config.performance.max_concurrent_requests,
            "max_batch_size": config.performance.max_batch_size,
            "max_model_memory_mb": config.performance.max_model_memory_mb
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let (vm_rss, vm_size) = parse_proc_status(&status);
            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {} on this platform", process::id())
    })
}

/// Pull VmRSS and VmSize (reported in kB) out of `/proc/<pid>/status`.
fn parse_proc_status(status: &str) -> (u64, u64) {
    let mut vm_rss = 0;
    let mut vm_size = 0;

    for line in status.lines() {
        let target = if line.starts_with("VmRSS:") {
            &mut vm_rss
        } else if line.starts_with("VmSize:") {
            &mut vm_size
        } else {
            continue;
        };
        if let Some(kb_str) = line.split_whitespace().nth(1) {
            *target = kb_str.parse::<u64>().unwrap_or(0) * 1024;
        }
    }

    (vm_rss, vm_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{body_json, loaded_state, test_app, unloaded_state};
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn test_parse_proc_status() {
        let status = "Name:\tennovatex\nVmSize:\t  2048 kB\nVmRSS:\t   512 kB\nThreads:\t4\n";
        assert_eq!(parse_proc_status(status), (512 * 1024, 2048 * 1024));
        assert_eq!(parse_proc_status(""), (0, 0));
    }

    #[actix_web::test]
    async fn test_ping() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let req = test::TestRequest::get().uri("/api/v1/health/ping").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
    }

    #[actix_web::test]
    async fn test_ready_reports_missing_models() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let req = test::TestRequest::get().uri("/api/v1/health/ready").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(resp).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["checks"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["checks"][0]["ready"], false);
    }

    #[actix_web::test]
    async fn test_ready_when_all_loaded() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let req = test::TestRequest::get().uri("/api/v1/health/ready").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ready");
    }

    #[actix_web::test]
    async fn test_status_lists_models_and_device() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let req = test::TestRequest::get().uri("/api/v1/health/status").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["device"]["current_device"], "cpu");
        assert_eq!(body["models"].as_array().map(Vec::len), Some(3));
    }

    #[actix_web::test]
    async fn test_deep_status_runs_service_checks() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let req = test::TestRequest::get().uri("/api/v1/health/status?deep=true").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["status"], "healthy");
        for service in ["text", "image", "audio"] {
            assert_eq!(body["services"][service]["status"], "healthy");
            assert_eq!(body["services"][service]["test_successful"], true);
        }

        let req = test::TestRequest::get().uri("/api/v1/health/status").to_request();
        let body = body_json(test::call_service(&app, req).await).await;
        assert!(body.get("services").is_none());
    }

    #[actix_web::test]
    async fn test_deep_status_without_models() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let req = test::TestRequest::get().uri("/api/v1/health/status?deep=true").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["image"]["status"], "unavailable");
        assert_eq!(body["services"]["audio"]["model_loaded"], false);
    }

    #[actix_web::test]
    async fn test_metrics_counts_requests() {
        let app = test::init_service(test_app(unloaded_state())).await;
        for _ in 0..2 {
            let req = test::TestRequest::get().uri("/api/v1/health/ping").to_request();
            test::call_service(&app, req).await;
        }
        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body = body_json(test::call_service(&app, req).await).await;

        let endpoints = body["endpoints"].as_array().cloned().unwrap_or_default();
        let ping = endpoints
            .iter()
            .find(|e| e["endpoint"] == "GET /api/v1/health/ping")
            .unwrap();
        assert_eq!(ping["request_count"], 2);
        assert_eq!(ping["error_count"], 0);
    }
}

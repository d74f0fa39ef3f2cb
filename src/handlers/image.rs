//! # Image Captioning Endpoints
//!
//! - `POST /image/upload`: multipart `file`, validated and decoded, no caption
//! - `POST /image/caption`: multipart `file` plus option fields
//! - `POST /image/describe`: like caption, always with the image properties
//! - `POST /image/batch-caption`: repeated `files` parts plus the same fields
//! - `GET /image/model-info`, `GET /image/stats`
//!
//! ## Option fields:
//! `max_length` (5..=100, default 50), `min_length` (1..=50, default 10),
//! `detail_level` (basic | medium | detailed), `include_analysis`,
//! `use_lora`, `lora_adapter`, `enhance` (default true).

use crate::error::{AppError, AppResult};
use crate::handlers::multipart::{read_multipart, MultipartForm};
use crate::handlers::{batch_response, check_batch_size, stats_response};
use crate::models::{ModelKind, ModelUnavailable};
use crate::services::image::{CaptionParams, DetailLevel};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use serde_json::json;

fn caption_params(form: &MultipartForm) -> AppResult<CaptionParams> {
    let defaults = CaptionParams::default();
    let max_length = form.number_in("max_length", defaults.max_length, 5..=100)?;
    let min_length = form.number_in("min_length", defaults.min_length, 1..=50)?;
    if min_length > max_length {
        return Err(AppError::ValidationError(format!(
            "min_length ({}) cannot be greater than max_length ({})",
            min_length, max_length
        )));
    }

    Ok(CaptionParams {
        max_length,
        min_length,
        detail_level: form.parse_or("detail_level", DetailLevel::default())?,
        include_analysis: form.flag("include_analysis", defaults.include_analysis)?,
        use_lora: form.flag("use_lora", defaults.use_lora)?,
        lora_adapter: form.text("lora_adapter").map(str::to_string),
        enhance: form.flag("enhance", defaults.enhance)?,
    })
}

pub async fn upload(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let mut form = read_multipart(payload, &["file"], 1, config.limits.max_file_size).await?;
    let upload = form.single_file("file")?;

    let info = state.image_service.inspect_upload(upload, &config.limits).await?;
    Ok(HttpResponse::Ok().json(info))
}

pub async fn describe(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let mut form = read_multipart(payload, &["file"], 1, config.limits.max_file_size).await?;
    let params = caption_params(&form)?;
    let upload = form.single_file("file")?;

    let result = state.image_service.describe(upload, &params, &config.limits).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn caption(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let mut form = read_multipart(payload, &["file"], 1, config.limits.max_file_size).await?;
    let params = caption_params(&form)?;
    let upload = form.single_file("file")?;

    let result = state
        .image_service
        .enhanced_caption(upload, &params, &config.limits)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn batch_caption(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let form = read_multipart(
        payload,
        &["files"],
        config.performance.max_batch_size,
        config.limits.max_file_size,
    )
    .await?;
    check_batch_size(form.files.len(), config.performance.max_batch_size)?;
    let params = caption_params(&form)?;

    let outcome = state
        .image_service
        .batch_caption(form.files, &params, &config.limits, config.performance.max_concurrent_requests)
        .await?;
    Ok(batch_response(outcome))
}

pub async fn model_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let info = state
        .image_service
        .model_info()
        .await
        .ok_or_else(|| AppError::ServiceUnavailable(ModelUnavailable(ModelKind::ImageCaptioner).to_string()))?;
    let limits = state.get_config().limits;

    Ok(HttpResponse::Ok().json(json!({
        "model": info,
        "detail_levels": ["basic", "medium", "detailed"],
        "limits": {
            "max_file_size": limits.max_file_size,
            "max_caption_length": limits.max_caption_length,
            "allowed_types": limits.allowed_image_types
        }
    })))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    stats_response("image", state.image_service.stats())
}

#[cfg(test)]
mod tests {
    use crate::handlers::test_support::{
        body_json, loaded_state, multipart_body, png_bytes, test_app, unloaded_state, Part,
    };
    use actix_web::{http::StatusCode, test};
    use serde_json::json;

    fn png_part<'a>(name: &'a str, filename: &'a str) -> Part<'a> {
        Part::File { name, filename, content_type: "image/png", data: png_bytes(32, 24) }
    }

    #[actix_web::test]
    async fn test_caption() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![
            png_part("file", "square.png"),
            Part::Text("detail_level", "detailed"),
            Part::Text("include_analysis", "true"),
        ]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["filename"], "square.png");
        assert_eq!(body["detail_level"], "detailed");
        assert_eq!(body["image_width"], 32);
        assert_eq!(body["image_analysis"]["orientation"], "landscape");
        assert!(body["caption"].as_str().is_some_and(|c| c.ends_with('.')));
    }

    #[actix_web::test]
    async fn test_upload_reports_image_info() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let (content_type, body) = multipart_body(vec![png_part("file", "square.png")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/upload")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["filename"], "square.png");
        assert_eq!(body["width"], 32);
        assert_eq!(body["height"], 24);
        assert_eq!(body["format"], "PNG");

        let (content_type, body) = multipart_body(vec![png_part("file", "a.png"), png_part("file", "b.png")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/upload")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_describe() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) =
            multipart_body(vec![png_part("file", "square.png"), Part::Text("detail_level", "basic")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/describe")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["description_type"], "basic");
        assert_eq!(body["content_type"], "image/png");
        assert_eq!(body["image_properties"]["width"], 32);
        assert_eq!(body["image_properties"]["dominant_color_rgb"], json!([200, 30, 30]));
        assert!(body["description"].as_str().is_some_and(|d| d.ends_with('.')));
    }

    #[actix_web::test]
    async fn test_caption_rejects_bad_uploads() {
        let state = loaded_state().await;
        let mut config = state.get_config();
        config.limits.max_file_size = 16;
        state.update_config(config).unwrap();
        let app = test::init_service(test_app(state)).await;

        let (content_type, body) = multipart_body(vec![Part::File {
            name: "file",
            filename: "notes.txt",
            content_type: "text/plain",
            data: b"hello".to_vec(),
        }]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let (content_type, body) = multipart_body(vec![png_part("file", "big.png")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let (content_type, body) = multipart_body(vec![Part::Text("detail_level", "basic")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_caption_unavailable_model() {
        let app = test::init_service(test_app(unloaded_state())).await;
        let (content_type, body) = multipart_body(vec![png_part("file", "square.png")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"]["type"], "service_unavailable");
    }

    #[actix_web::test]
    async fn test_batch_caption_with_corrupt_image() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![
            png_part("files", "a.png"),
            Part::File { name: "files", filename: "broken.png", content_type: "image/png", data: vec![0, 1, 2, 3] },
            png_part("files", "c.png"),
            Part::Text("detail_level", "basic"),
        ]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/batch-caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["failed_indices"], json!([1]));
        assert_eq!(body["statistics"]["successful_count"], 2);
        assert_eq!(body["results"][2]["output"]["filename"], "c.png");
        assert!(body["results"][1]["error_message"].as_str().is_some_and(|m| m.contains("decode")));
    }

    #[actix_web::test]
    async fn test_batch_over_the_size_limit_rejected() {
        let state = loaded_state().await;
        let mut config = state.get_config();
        config.performance.max_batch_size = 2;
        state.update_config(config).unwrap();
        let app = test::init_service(test_app(state)).await;

        let (content_type, body) =
            multipart_body(vec![png_part("files", "a.png"), png_part("files", "b.png"), png_part("files", "c.png")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/batch-caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"]["message"].as_str().is_some_and(|m| m.contains("maximum is 2")));
    }

    #[actix_web::test]
    async fn test_empty_batch_rejected() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![Part::Text("detail_level", "basic")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/image/batch-caption")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}

//! # Speech Endpoints
//!
//! - `POST /audio/upload`: multipart `file`, validated and inspected, no transcription
//! - `POST /audio/speech-to-text`: multipart `file`, transcribed in its own language
//! - `POST /audio/translate`: same fields, output translated to English
//! - `POST /audio/batch-transcribe`: repeated `files` parts plus `language` and `task`
//! - `GET /audio/supported-languages`, `GET /audio/model-info`, `GET /audio/stats`
//!
//! ## Option fields:
//! `language` (ISO 639-1, detected when absent), `include_analysis`,
//! `chunk_length` (1..=30 seconds, default 30), `return_timestamps`.

use crate::error::{AppError, AppResult};
use crate::handlers::multipart::{read_multipart, MultipartForm};
use crate::handlers::{batch_response, check_batch_size, stats_response};
use crate::models::whisper::CHUNK_LENGTH;
use crate::models::{ModelKind, ModelUnavailable, SpeechTask};
use crate::services::audio::TranscribeParams;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use serde_json::json;

fn transcribe_params(form: &MultipartForm, task: SpeechTask) -> AppResult<TranscribeParams> {
    let defaults = TranscribeParams::default();
    Ok(TranscribeParams {
        language: form.text("language").map(|l| l.to_lowercase()),
        task,
        include_analysis: form.flag("include_analysis", defaults.include_analysis)?,
        chunk_length: form.number_in("chunk_length", defaults.chunk_length, 1..=CHUNK_LENGTH)?,
        return_timestamps: form.flag("return_timestamps", defaults.return_timestamps)?,
    })
}

pub async fn upload(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let mut form = read_multipart(payload, &["file"], 1, config.limits.max_file_size).await?;
    let upload = form.single_file("file")?;

    let info = state.audio_service.inspect_upload(upload, &config.limits).await?;
    Ok(HttpResponse::Ok().json(info))
}

async fn transcribe_single(state: &AppState, payload: Multipart, task: SpeechTask) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let mut form = read_multipart(payload, &["file"], 1, config.limits.max_file_size).await?;
    let params = transcribe_params(&form, task)?;
    let upload = form.single_file("file")?;

    let result = state
        .audio_service
        .enhanced_transcription(upload, &params, &config.limits)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn speech_to_text(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    transcribe_single(&state, payload, SpeechTask::Transcribe).await
}

pub async fn translate(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    transcribe_single(&state, payload, SpeechTask::Translate).await
}

pub async fn batch_transcribe(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let form = read_multipart(
        payload,
        &["files"],
        config.performance.max_batch_size,
        config.limits.max_file_size,
    )
    .await?;
    check_batch_size(form.files.len(), config.performance.max_batch_size)?;
    let task = form.parse_or("task", SpeechTask::Transcribe)?;
    let params = transcribe_params(&form, task)?;

    let outcome = state
        .audio_service
        .batch_transcribe(form.files, &params, &config.limits, config.performance.max_concurrent_requests)
        .await?;
    Ok(batch_response(outcome))
}

pub async fn supported_languages(state: web::Data<AppState>) -> HttpResponse {
    let languages = state.audio_service.get_supported_languages();
    HttpResponse::Ok().json(json!({
        "count": languages.len(),
        "languages": languages,
        "auto_detect": true
    }))
}

pub async fn model_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let info = state
        .audio_service
        .model_info()
        .await
        .ok_or_else(|| AppError::ServiceUnavailable(ModelUnavailable(ModelKind::AudioAsr).to_string()))?;
    let limits = state.get_config().limits;

    Ok(HttpResponse::Ok().json(json!({
        "model": info,
        "tasks": ["transcribe", "translate"],
        "max_chunk_length_seconds": CHUNK_LENGTH,
        "limits": {
            "max_file_size": limits.max_file_size,
            "allowed_types": limits.allowed_audio_types
        }
    })))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    stats_response("audio", state.audio_service.stats())
}

#[cfg(test)]
mod tests {
    use crate::handlers::test_support::{body_json, loaded_state, multipart_body, pcm_bytes, test_app, Part};
    use actix_web::{http::StatusCode, test};
    use serde_json::json;

    fn pcm_part<'a>(name: &'a str, filename: &'a str, seconds: usize) -> Part<'a> {
        Part::File { name, filename, content_type: "audio/pcm", data: pcm_bytes(seconds) }
    }

    #[actix_web::test]
    async fn test_upload() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![pcm_part("file", "clip.pcm", 3)]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/upload")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["filename"], "clip.pcm");
        assert_eq!(body["size_bytes"], 3 * 16_000 * 2);
        assert_eq!(body["decodable"], true);
        assert_eq!(body["duration_seconds"], 3.0);

        let (content_type, body) = multipart_body(vec![Part::File {
            name: "file",
            filename: "notes.txt",
            content_type: "text/plain",
            data: b"hello".to_vec(),
        }]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/upload")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_speech_to_text() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![
            pcm_part("file", "clip.pcm", 2),
            Part::Text("return_timestamps", "true"),
            Part::Text("include_analysis", "true"),
        ]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/speech-to-text")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["task"], "transcribe");
        assert_eq!(body["text"], "hola a todos bienvenidos");
        assert_eq!(body["word_count"], 4);
        assert_eq!(body["language_detected"], "es");
        assert_eq!(body["audio_duration_seconds"], 2.0);
        assert_eq!(body["segments"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["audio_analysis"]["sample_rate"], 16000);
    }

    #[actix_web::test]
    async fn test_translate() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![pcm_part("file", "clip.pcm", 1), Part::Text("language", "ES")]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/translate")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let body = body_json(test::call_service(&app, req).await).await;
        assert_eq!(body["task"], "translate");
        assert_eq!(body["language_requested"], "es");
        assert_eq!(body["text"], "hello everyone and welcome");
        assert_eq!(body["segments"], json!([]));
    }

    #[actix_web::test]
    async fn test_rejects_bad_options() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        for field in [("language", "klingon"), ("chunk_length", "45")] {
            let (content_type, body) =
                multipart_body(vec![pcm_part("file", "clip.pcm", 1), Part::Text(field.0, field.1)]);
            let req = test::TestRequest::post()
                .uri("/api/v1/audio/speech-to-text")
                .insert_header(("content-type", content_type))
                .set_payload(body)
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[actix_web::test]
    async fn test_batch_transcribe() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let (content_type, body) = multipart_body(vec![
            pcm_part("files", "a.pcm", 1),
            Part::File { name: "files", filename: "odd.pcm", content_type: "audio/pcm", data: vec![1, 2, 3] },
            pcm_part("files", "c.pcm", 3),
            Part::Text("task", "translate"),
        ]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/batch-transcribe")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["failed_indices"], json!([1]));
        assert_eq!(body["results"][0]["output"]["task"], "translate");
        assert_eq!(body["statistics"]["domain"]["total_audio_duration_seconds"], 4.0);
    }

    #[actix_web::test]
    async fn test_oversized_file_fails_only_its_item() {
        let state = loaded_state().await;
        let mut config = state.get_config();
        config.limits.max_file_size = 50_000;
        state.update_config(config).unwrap();
        let app = test::init_service(test_app(state)).await;

        let (content_type, body) = multipart_body(vec![pcm_part("files", "short.pcm", 1), pcm_part("files", "long.pcm", 3)]);
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/batch-transcribe")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["failed_indices"], json!([1]));
        assert!(body["results"][1]["error_message"]
            .as_str()
            .is_some_and(|m| m.contains("maximum file size")));
    }

    #[actix_web::test]
    async fn test_supported_languages() {
        let app = test::init_service(test_app(loaded_state().await)).await;
        let req = test::TestRequest::get().uri("/api/v1/audio/supported-languages").to_request();
        let body = body_json(test::call_service(&app, req).await).await;
        assert_eq!(body["count"], 15);
        assert!(body["languages"]
            .as_array()
            .is_some_and(|langs| langs.iter().any(|l| l["code"] == "en")));
    }
}

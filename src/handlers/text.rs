//! # Text Summarization Endpoints
//!
//! - `POST /text/summarize`: one text, JSON body
//! - `POST /text/batch-summarize`: `texts` array plus the same options
//! - `GET /text/model-info`, `GET /text/stats`
//!
//! ## Example request:
//! ```json
//! {
//!   "text": "Long article ...",
//!   "max_length": 120,
//!   "min_length": 20,
//!   "summary_type": "abstractive",
//!   "include_analysis": true
//! }
//! ```

use crate::error::{AppError, AppResult};
use crate::handlers::multipart::check_range;
use crate::handlers::{batch_response, check_batch_size, stats_response};
use crate::models::{ModelKind, ModelUnavailable};
use crate::services::text::{SummarizeParams, SummaryType};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::ops::RangeInclusive;

const MAX_LENGTH_RANGE: RangeInclusive<usize> = 10..=500;
const MIN_LENGTH_RANGE: RangeInclusive<usize> = 5..=200;

/// Options shared by the single and batch routes.
#[derive(Debug, Deserialize)]
pub struct SummaryOptions {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default)]
    pub summary_type: SummaryType,
    #[serde(default)]
    pub include_analysis: bool,
    #[serde(default)]
    pub use_lora: bool,
    pub lora_adapter: Option<String>,
}

fn default_max_length() -> usize {
    150
}

fn default_min_length() -> usize {
    30
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub text: String,
    #[serde(flatten)]
    pub options: SummaryOptions,
}

#[derive(Debug, Deserialize)]
pub struct BatchSummarizeRequest {
    pub texts: Vec<String>,
    #[serde(flatten)]
    pub options: SummaryOptions,
}

impl SummaryOptions {
    fn into_params(self) -> AppResult<SummarizeParams> {
        check_range("max_length", self.max_length, &MAX_LENGTH_RANGE)?;
        check_range("min_length", self.min_length, &MIN_LENGTH_RANGE)?;
        if self.min_length > self.max_length {
            return Err(AppError::ValidationError(format!(
                "min_length ({}) cannot be greater than max_length ({})",
                self.min_length, self.max_length
            )));
        }
        Ok(SummarizeParams {
            max_length: self.max_length,
            min_length: self.min_length,
            summary_type: self.summary_type,
            include_analysis: self.include_analysis,
            use_lora: self.use_lora,
            lora_adapter: self.lora_adapter,
        })
    }
}

pub async fn summarize(state: web::Data<AppState>, body: web::Json<SummarizeRequest>) -> AppResult<HttpResponse> {
    let SummarizeRequest { text, options } = body.into_inner();
    let params = options.into_params()?;
    let config = state.get_config();

    let result = state
        .text_service
        .enhanced_summarization(&text, &params, &config.limits)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn batch_summarize(
    state: web::Data<AppState>,
    body: web::Json<BatchSummarizeRequest>,
) -> AppResult<HttpResponse> {
    let BatchSummarizeRequest { texts, options } = body.into_inner();
    let config = state.get_config();
    check_batch_size(texts.len(), config.performance.max_batch_size)?;
    let params = options.into_params()?;

    let outcome = state
        .text_service
        .batch_summarization(texts, &params, &config.limits, config.performance.max_concurrent_requests)
        .await?;
    Ok(batch_response(outcome))
}

pub async fn model_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let info = state
        .text_service
        .model_info()
        .await
        .ok_or_else(|| AppError::ServiceUnavailable(ModelUnavailable(ModelKind::TextSummarizer).to_string()))?;
    let limits = state.get_config().limits;

    Ok(HttpResponse::Ok().json(json!({
        "model": info,
        "summary_types": ["abstractive", "extractive"],
        "limits": {
            "max_text_length": limits.max_text_length,
            "max_summary_length": limits.max_summary_length,
            "max_length_range": [MAX_LENGTH_RANGE.start(), MAX_LENGTH_RANGE.end()],
            "min_length_range": [MIN_LENGTH_RANGE.start(), MIN_LENGTH_RANGE.end()]
        }
    })))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    stats_response("text", state.text_service.stats())
}

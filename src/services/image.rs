//! # Image Service
//!
//! Captioning for uploaded images: upload checks, decoding and
//! preprocessing, the captioning provider, caption cleanup and optional
//! image property analysis. Batches go through the shared bounded runner,
//! so a bad file only fails its own item.
//!
//! `describe` is a caption that always carries the property analysis, and
//! `inspect_upload` validates and decodes a file without captioning it.
//!
//! ## Key Rust Concepts Used:
//! - **Owned payloads**: `FileUpload` owns its bytes, so each item can be
//!   moved into `spawn_blocking` for decoding and inference without a copy
//! - **FromStr**: `DetailLevel` parses straight out of a multipart text field

use crate::batch::{run_batch, BatchError, BatchOutcome, MetricExtractor, Metrics, Quantity, Ratio, WorkUnit};
use crate::config::LimitsConfig;
use crate::models::{GenerationOptions, ModelKind, ModelLoader, ProviderInfo};
use crate::services::text::capitalize_first;
use crate::services::health::run_check;
use crate::services::{
    check_adapter, round2, run_blocking, unavailable, FileUpload, InputError, ServiceHealth, ServiceStats,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Images are shrunk to fit this box before captioning.
const MAX_DIMENSION: u32 = 1024;

/// Contrast boost in percent (a 1.1 factor).
const CONTRAST_BOOST: f32 = 10.0;

/// Edge response above which a pixel counts towards complexity.
const EDGE_THRESHOLD: u8 = 50;

/// 3x3 Laplacian edge kernel.
const EDGE_KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];

const REDUNDANT_PHRASES: &[&str] = &[
    "a picture of",
    "an image of",
    "a photo of",
    "this image shows",
    "the image contains",
    "in this image",
    "the picture shows",
];

/// How much the caption should say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Basic,
    #[default]
    Medium,
    Detailed,
}

impl DetailLevel {
    /// Token budget for this level, derived from the requested bounds.
    pub fn generation_options(&self, max_length: usize, min_length: usize) -> GenerationOptions {
        match self {
            DetailLevel::Basic => {
                let max_length = max_length.min(20);
                GenerationOptions { max_length, min_length: min_length.min(max_length) }
            }
            DetailLevel::Medium => GenerationOptions { max_length, min_length },
            DetailLevel::Detailed => GenerationOptions { max_length: max_length.max(100), min_length },
        }
    }
}

impl std::str::FromStr for DetailLevel {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(DetailLevel::Basic),
            "medium" => Ok(DetailLevel::Medium),
            "detailed" => Ok(DetailLevel::Detailed),
            other => Err(InputError::Invalid(format!(
                "Invalid detail_level '{}', expected basic, medium or detailed",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionParams {
    pub max_length: usize,
    pub min_length: usize,
    pub detail_level: DetailLevel,
    pub include_analysis: bool,
    pub use_lora: bool,
    pub lora_adapter: Option<String>,
    /// Apply the contrast and sharpening pass before captioning
    pub enhance: bool,
}

impl Default for CaptionParams {
    fn default() -> Self {
        Self {
            max_length: 50,
            min_length: 10,
            detail_level: DetailLevel::Medium,
            include_analysis: false,
            use_lora: false,
            lora_adapter: None,
            enhance: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageAnalysis {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub orientation: Orientation,
    /// Share of pixels on an edge, 0.0 to 1.0
    pub complexity_score: f64,
    pub dominant_color_rgb: [u8; 3],
    pub file_size_estimate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptionResult {
    pub caption: String,
    pub original_caption: String,
    pub detail_level: DetailLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub image_width: u32,
    pub image_height: u32,
    pub processed_width: u32,
    pub processed_height: u32,
    pub caption_length: usize,
    pub processing_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_analysis: Option<ImageAnalysis>,
}

/// A detailed description: the caption plus the image's properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptionResult {
    pub description: String,
    pub description_type: DetailLevel,
    pub description_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub processing_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_adapter: Option<String>,
    pub image_properties: ImageAnalysis,
}

/// What an uploaded image turned out to be.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUploadInfo {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: usize,
    pub width: u32,
    pub height: u32,
    /// Format sniffed from the bytes, e.g. `PNG`
    pub format: String,
    /// Pixel layout, e.g. `Rgba8`
    pub color_type: String,
    pub message: String,
}

/// Batch metrics: pixel totals and image throughput.
pub struct CaptionMetrics;

impl MetricExtractor<CaptionResult> for CaptionMetrics {
    fn extract(&self, output: &CaptionResult) -> Metrics {
        let pixels = output.image_width as f64 * output.image_height as f64;
        Metrics::from([("pixels_processed".to_string(), pixels)])
    }

    fn metric_names(&self) -> Vec<&'static str> {
        vec!["pixels_processed"]
    }

    fn ratios(&self) -> Vec<Ratio> {
        vec![Ratio::new("throughput_images_per_second", Quantity::Total, Quantity::Duration)]
    }
}

pub struct ImageService {
    loader: Arc<ModelLoader>,
    stats: ServiceStats,
}

impl ImageService {
    pub fn new(loader: Arc<ModelLoader>) -> Self {
        Self {
            loader,
            stats: ServiceStats::new(),
        }
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub async fn model_info(&self) -> Option<ProviderInfo> {
        self.loader.captioner().await.map(|p| p.info())
    }

    /// Caption one uploaded image.
    pub async fn enhanced_caption(
        &self,
        upload: FileUpload,
        params: &CaptionParams,
        limits: &LimitsConfig,
    ) -> Result<CaptionResult> {
        let timer = self.stats.start();
        validate_upload(&upload, limits)?;
        if params.min_length > params.max_length {
            return Err(InputError::Invalid(format!(
                "min_length ({}) cannot be greater than max_length ({})",
                params.min_length, params.max_length
            ))
            .into());
        }

        let provider = self
            .loader
            .captioner()
            .await
            .ok_or_else(|| unavailable(ModelKind::ImageCaptioner))?;
        let adapter = check_adapter(
            ModelKind::ImageCaptioner,
            params.use_lora,
            params.lora_adapter.as_deref(),
            provider.info().adapter.as_deref(),
        )?;

        let options = params.detail_level.generation_options(params.max_length, params.min_length);
        let enhance = params.enhance;
        let include_analysis = params.include_analysis;
        let FileUpload { filename, data, .. } = upload;

        let (raw_caption, original, processed, analysis) = run_blocking(move || {
            let image = decode_image(&data)?;
            let processed = preprocess_image(&image, enhance);
            let caption = provider.caption(&processed, &options)?;
            let analysis = include_analysis.then(|| analyze_image_properties(&image));
            Ok((caption, image.dimensions(), processed.dimensions(), analysis))
        })
        .await?;

        let caption = postprocess_caption(&raw_caption, limits.max_caption_length);
        let processing_time_seconds = timer.success(1);
        info!(
            width = original.0,
            height = original.1,
            detail_level = ?params.detail_level,
            seconds = processing_time_seconds,
            "Captioning completed"
        );

        Ok(CaptionResult {
            caption_length: caption.chars().count(),
            caption,
            original_caption: raw_caption,
            detail_level: params.detail_level,
            filename,
            image_width: original.0,
            image_height: original.1,
            processed_width: processed.0,
            processed_height: processed.1,
            processing_time_seconds,
            timestamp: Utc::now(),
            lora_adapter: adapter,
            image_analysis: analysis,
        })
    }

    /// Caption at `params.detail_level` and always include the analysis.
    pub async fn describe(
        &self,
        upload: FileUpload,
        params: &CaptionParams,
        limits: &LimitsConfig,
    ) -> Result<DescriptionResult> {
        let content_type = upload.mime();
        let params = CaptionParams { include_analysis: true, ..params.clone() };
        let caption = self.enhanced_caption(upload, &params, limits).await?;
        let image_properties = caption
            .image_analysis
            .ok_or_else(|| anyhow!("Image analysis missing from the caption result"))?;

        Ok(DescriptionResult {
            description_length: caption.caption_length,
            description: caption.caption,
            description_type: caption.detail_level,
            filename: caption.filename,
            content_type,
            processing_time_seconds: caption.processing_time_seconds,
            timestamp: caption.timestamp,
            lora_adapter: caption.lora_adapter,
            image_properties,
        })
    }

    /// Check and decode an upload without captioning it.
    pub async fn inspect_upload(&self, upload: FileUpload, limits: &LimitsConfig) -> Result<ImageUploadInfo> {
        validate_upload(&upload, limits)?;
        let content_type = upload.mime();
        let size_bytes = upload.data.len();
        let FileUpload { filename, data, .. } = upload;

        let (format, (width, height), color_type) = run_blocking(move || {
            let format = image::guess_format(&data)
                .ok()
                .and_then(|f| f.extensions_str().first().copied())
                .unwrap_or("unknown")
                .to_uppercase();
            let image = decode_image(&data)?;
            Ok((format, image.dimensions(), format!("{:?}", image.color())))
        })
        .await?;
        info!(?filename, width, height, format = %format, "Image upload validated");

        Ok(ImageUploadInfo {
            filename,
            content_type,
            size_bytes,
            width,
            height,
            format,
            color_type,
            message: "Image uploaded and validated successfully".to_string(),
        })
    }

    /// Caption a plain 100x100 red square with a short budget.
    pub async fn health_check(&self) -> ServiceHealth {
        let check = self.loader.captioner().await.map(|provider| {
            move || {
                let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb([255, 0, 0])));
                let options = GenerationOptions { max_length: 20, min_length: 5 };
                provider.caption(&image, &options).map(|c| c.chars().count())
            }
        });
        run_check(ModelKind::ImageCaptioner, check).await
    }

    /// Caption many images with at most `max_concurrency` in flight.
    pub async fn batch_caption(
        &self,
        uploads: Vec<FileUpload>,
        params: &CaptionParams,
        limits: &LimitsConfig,
        max_concurrency: usize,
    ) -> Result<BatchOutcome<CaptionResult>, BatchError> {
        debug!(images = uploads.len(), "Batch captioning requested");
        let units = WorkUnit::from_payloads(uploads, params);
        let run = run_batch(
            units,
            |upload: FileUpload, params: CaptionParams| async move {
                self.enhanced_caption(upload, &params, limits).await
            },
            max_concurrency,
        )
        .await?;
        Ok(run.into_outcome(&CaptionMetrics))
    }
}

/// Allowed type and size, checked before any decoding.
pub fn validate_upload(upload: &FileUpload, limits: &LimitsConfig) -> Result<(), InputError> {
    upload.check(&limits.allowed_image_types, limits.max_file_size, "image")
}

pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data)
        .map_err(|e| InputError::Invalid(format!("Invalid image data: {}", e)))
        .context("Failed to decode image")
}

/// RGB, fit within 1024x1024, optional contrast and sharpening.
pub fn preprocess_image(image: &DynamicImage, enhance: bool) -> DynamicImage {
    let mut processed = DynamicImage::ImageRgb8(image.to_rgb8());

    let (width, height) = processed.dimensions();
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        processed = processed.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3);
    }

    if enhance {
        processed = processed.adjust_contrast(CONTRAST_BOOST).unsharpen(1.0, 2);
    }
    processed
}

/// Tidy a generated caption.
pub fn postprocess_caption(caption: &str, max_length: usize) -> String {
    let mut caption = caption.trim().to_string();

    for phrase in REDUNDANT_PHRASES {
        let matches = caption
            .get(..phrase.len())
            .map(|head| head.eq_ignore_ascii_case(phrase))
            .unwrap_or(false);
        if matches {
            caption = caption[phrase.len()..].trim().to_string();
            break;
        }
    }

    let mut caption = capitalize_first(&caption);
    if !caption.is_empty() && !caption.ends_with(['.', '!', '?']) {
        caption.push('.');
    }

    if caption.chars().count() > max_length {
        caption = caption.chars().take(max_length).collect::<String>().trim_end().to_string();
    }
    caption
}

/// Size, orientation, edge complexity and dominant color of an image.
pub fn analyze_image_properties(image: &DynamicImage) -> ImageAnalysis {
    let (width, height) = image.dimensions();
    let aspect_ratio = crate::batch::safe_ratio(width as f64, height as f64);

    let orientation = if aspect_ratio > 1.3 {
        Orientation::Landscape
    } else if aspect_ratio < 0.7 {
        Orientation::Portrait
    } else {
        Orientation::Square
    };

    let gray = image.to_luma8();
    let edges: image::GrayImage = image::imageops::filter3x3(&gray, &EDGE_KERNEL);
    let edge_pixels = edges.pixels().filter(|p| p.0[0] > EDGE_THRESHOLD).count();
    let total_pixels = width as u64 * height as u64;
    let complexity = crate::batch::safe_ratio(edge_pixels as f64, total_pixels as f64);

    ImageAnalysis {
        width,
        height,
        aspect_ratio: round2(aspect_ratio),
        orientation,
        complexity_score: (complexity * 1000.0).round() / 1000.0,
        dominant_color_rgb: dominant_color(image),
        file_size_estimate: total_pixels * 3,
    }
}

/// Most frequent exact RGB value; ties go to the lowest value.
fn dominant_color(image: &DynamicImage) -> [u8; 3] {
    let mut counts: HashMap<[u8; 3], usize> = HashMap::new();
    for pixel in image.to_rgb8().pixels() {
        *counts.entry(pixel.0).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(color, _)| color)
        .unwrap_or([128, 128, 128])
}

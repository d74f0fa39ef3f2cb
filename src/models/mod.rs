//! # Model Providers and Lifecycle
//!
//! Everything that touches model weights lives here. The rest of the
//! application only sees three provider traits and the `ModelLoader` that
//! hands out `Arc<dyn Trait>` handles to whatever is currently loaded.
//!
//! ## Module Organization:
//! - **loader**: `ModelLoader`, startup initialization, cleanup, memory budget
//! - **registry**: per-model status tracking (Loading, Loaded, Error, ...)
//! - **hub**: HuggingFace hub downloads through `hf-hub`
//! - **lora**: PEFT LoRA adapter parsing and weight merging
//! - **summarizer**: T5 seq2seq summarizer plus the extractive fallback
//! - **captioner**: BLIP image captioner
//! - **whisper**: Whisper speech recognizer and its log-mel front-end
//!
//! ## Why synchronous traits:
//! Inference is CPU/GPU bound. Providers expose plain blocking methods and
//! the services call them through `tokio::task::spawn_blocking`, so a long
//! decode never stalls the actix worker that is driving a batch.

pub mod captioner;
pub mod hub;
pub mod loader;
pub mod lora;
pub mod registry;
pub mod summarizer;
pub mod whisper;

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use loader::ModelLoader;

/// The three model slots the service manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    TextSummarizer,
    ImageCaptioner,
    AudioAsr,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::TextSummarizer, ModelKind::ImageCaptioner, ModelKind::AudioAsr];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::TextSummarizer => "text_summarizer",
            ModelKind::ImageCaptioner => "image_captioner",
            ModelKind::AudioAsr => "audio_asr",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a service needs a model that is not loaded.
///
/// Kept as a concrete type so the HTTP layer can downcast it out of an
/// `anyhow::Error` and answer 503 instead of 500.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUnavailable(pub ModelKind);

impl fmt::Display for ModelUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model '{}' is not loaded", self.0)
    }
}

impl std::error::Error for ModelUnavailable {}

/// Descriptive metadata a provider reports about itself.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderInfo {
    pub kind: ModelKind,
    pub model_id: String,
    pub revision: String,
    pub backend: String,
    pub device: String,
    /// Name of the merged LoRA adapter, if any
    pub adapter: Option<String>,
    /// Size of the weight files, used as the memory estimate
    pub memory_bytes: u64,
}

/// Length bounds for generated text, in tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_length: usize,
    pub min_length: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_length: 150, min_length: 30 }
    }
}

/// Whisper task: keep the spoken language or translate into English.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeechTask {
    #[default]
    Transcribe,
    Translate,
}

impl std::str::FromStr for SpeechTask {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "transcribe" => Ok(SpeechTask::Transcribe),
            "translate" => Ok(SpeechTask::Translate),
            other => Err(anyhow::anyhow!("Unknown task '{}', expected 'transcribe' or 'translate'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    /// ISO 639-1 code; detected from the audio when `None`
    pub language: Option<String>,
    pub task: SpeechTask,
    /// Window length in seconds, 1..=30
    pub chunk_seconds: usize,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            task: SpeechTask::Transcribe,
            chunk_seconds: 30,
        }
    }
}

/// One decoded window of audio.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

/// Abstractive text summarization.
pub trait TextSummarizer: Send + Sync {
    fn summarize(&self, text: &str, options: &GenerationOptions) -> Result<String>;
    fn info(&self) -> ProviderInfo;
}

/// Image-to-text captioning.
pub trait ImageCaptioner: Send + Sync {
    fn caption(&self, image: &DynamicImage, options: &GenerationOptions) -> Result<String>;
    fn info(&self) -> ProviderInfo;
}

/// Speech recognition over 16 kHz mono samples in [-1.0, 1.0].
pub trait SpeechRecognizer: Send + Sync {
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript>;
    fn info(&self) -> ProviderInfo;
}

/// Pick the highest-scoring token id, skipping any id in `banned`.
pub(crate) fn argmax_excluding(logits: &[f32], banned: &[u32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .filter(|(id, value)| !banned.contains(&(*id as u32)) && value.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(id, _)| id as u32)
}

//! # Configuration Management
//!
//! This module loads and manages application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables with the `APP_` prefix (`__` separates sections)
//! - Flat deployment variables such as `PORT`, `DEVICE` or `TEXT_SUMMARIZER_MODEL`
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are serialized into the `config` crate's
//!   defaults layer and deserialized back out of the merged result
//! - **Option<T>**: optional settings (LoRA adapters) are `None` unless set
//! - **Result<T, E>**: loading and validation report problems instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Flat deployment variables (`HOST`, `PORT`, `MAX_BATCH_SIZE`, ...)
//! 2. Prefixed variables (`APP_PERFORMANCE__MAX_CONCURRENT_REQUESTS=8`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where the HTTP server listens
/// - `models`: which models to load, on which device, with which adapters
/// - `performance`: batch concurrency and size limits, model memory budget
/// - `limits`: request validation limits (lengths, file sizes, MIME types)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub performance: PerformanceConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost
/// - `host = "0.0.0.0"`: Accept connections from any interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model selection and loading settings.
///
/// Model ids are HuggingFace repository names. The `*_revision` fields pick
/// a branch or ref inside that repository. LoRA adapters are either a local
/// directory or a hub repository holding `adapter_config.json` and
/// `adapter_model.safetensors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsConfig {
    pub text_summarizer_model: String,
    pub text_summarizer_revision: String,
    pub text_summarizer_lora: Option<String>,
    pub image_caption_model: String,
    pub image_caption_revision: String,
    pub image_caption_lora: Option<String>,
    pub audio_asr_model: String,
    pub audio_asr_revision: String,
    /// "auto", "cpu", "cuda" or "mps"/"metal"
    pub device: String,
    pub cache_dir: String,
    /// Load every model before the server starts accepting requests
    pub load_on_startup: bool,
    /// Refuse to start when any model fails to load
    pub require_all: bool,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - `max_concurrent_requests` is the number of batch items admitted at once.
///   Inference on one model is serialized, so raising it mostly overlaps
///   decoding and preprocessing with inference.
/// - `max_batch_size` caps how many items a single batch request may carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    pub max_concurrent_requests: usize,
    pub max_batch_size: usize,
    pub max_model_memory_mb: usize,
}

/// Request validation limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum characters accepted for a single text
    pub max_text_length: usize,
    /// Upper bound for a summary's `max_length` (in tokens/words)
    pub max_summary_length: usize,
    /// Captions longer than this many characters are truncated
    pub max_caption_length: usize,
    /// Maximum upload size in bytes, per file
    pub max_file_size: usize,
    pub allowed_image_types: Vec<String>,
    pub allowed_audio_types: Vec<String>,
}

/// Flat environment variables commonly set by deployment platforms, mapped
/// onto their configuration keys.
const FLAT_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("DEVICE", "models.device"),
    ("MODEL_CACHE_DIR", "models.cache_dir"),
    ("TEXT_SUMMARIZER_MODEL", "models.text_summarizer_model"),
    ("TEXT_SUMMARIZER_LORA", "models.text_summarizer_lora"),
    ("IMAGE_CAPTION_MODEL", "models.image_caption_model"),
    ("IMAGE_CAPTION_LORA", "models.image_caption_lora"),
    ("AUDIO_ASR_MODEL", "models.audio_asr_model"),
    ("MAX_CONCURRENT_REQUESTS", "performance.max_concurrent_requests"),
    ("MAX_BATCH_SIZE", "performance.max_batch_size"),
    ("MAX_MODEL_MEMORY", "performance.max_model_memory_mb"),
    ("MAX_FILE_SIZE", "limits.max_file_size"),
    ("MAX_TEXT_LENGTH", "limits.max_text_length"),
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                text_summarizer_model: "google-t5/t5-small".to_string(),
                text_summarizer_revision: "main".to_string(),
                text_summarizer_lora: None,
                image_caption_model: "Salesforce/blip-image-captioning-large".to_string(),
                image_caption_revision: "refs/pr/18".to_string(),
                image_caption_lora: None,
                audio_asr_model: "openai/whisper-base".to_string(),
                audio_asr_revision: "main".to_string(),
                device: "auto".to_string(),
                cache_dir: "./models".to_string(),
                load_on_startup: true,
                require_all: false,
            },
            performance: PerformanceConfig {
                max_concurrent_requests: 4,
                max_batch_size: 50,
                max_model_memory_mb: 4096,
            },
            limits: LimitsConfig {
                max_text_length: 10_000,
                max_summary_length: 500,
                max_caption_length: 200,
                max_file_size: 10 * 1024 * 1024,
                allowed_image_types: ["image/jpeg", "image/png", "image/webp", "image/bmp"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                allowed_audio_types: [
                    "audio/wav",
                    "audio/x-wav",
                    "audio/wave",
                    "audio/mp3",
                    "audio/flac",
                    "audio/ogg",
                    "audio/pcm",
                    "audio/l16",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__AUDIO_ASR_MODEL=openai/whisper-small`: Override the ASR model
    /// - `MAX_CONCURRENT_REQUESTS=8`: Flat deployment override
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in FLAT_ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("Max concurrent requests must be greater than 0"));
        }

        if self.performance.max_batch_size == 0 {
            return Err(anyhow::anyhow!("Max batch size must be greater than 0"));
        }

        let model_ids = [
            ("text_summarizer_model", &self.models.text_summarizer_model),
            ("image_caption_model", &self.models.image_caption_model),
            ("audio_asr_model", &self.models.audio_asr_model),
        ];
        for (name, id) in model_ids {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("Model id '{}' cannot be empty", name));
            }
        }

        if self.limits.max_summary_length == 0 || self.limits.max_text_length == 0 {
            return Err(anyhow::anyhow!("Text length limits must be greater than 0"));
        }

        if self.limits.max_file_size == 0 {
            return Err(anyhow::anyhow!("Max file size must be greater than 0"));
        }

        if self.limits.allowed_image_types.is_empty() || self.limits.allowed_audio_types.is_empty() {
            return Err(anyhow::anyhow!("Allowed upload type lists cannot be empty"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used for runtime config updates).
    ///
    /// The current configuration is turned into JSON, the update is merged
    /// into it key by key, and the result is deserialized and validated. So
    /// `{"performance": {"max_batch_size": 10}}` changes only that one value,
    /// and a value of the wrong type is rejected without touching `self`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge; anything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

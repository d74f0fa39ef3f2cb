//! # Model Loader
//!
//! Central owner of the three inference providers. At startup it downloads
//! and builds the summarizer, captioner and recognizer concurrently, tracks
//! each one in the [`ModelRegistry`], and afterwards hands out cheap
//! `Arc<dyn Trait>` handles to the services.
//!
//! ## Failure policy:
//! A model that fails to load is logged and recorded as `Error`; the other
//! models still serve requests and the affected endpoints answer 503. With
//! `models.require_all = true` any failure aborts startup instead.
//!
//! ## Key Rust Concepts Used:
//! - **tokio::join!**: the three loads run concurrently on the current task
//! - **spawn_blocking**: weight loading is CPU and disk bound, so it runs on
//!   tokio's blocking pool instead of stalling the runtime
//! - **RwLock<Option<Arc<dyn T>>>**: readers clone the Arc and release the
//!   lock immediately; cleanup swaps the slot to `None`

use crate::config::{AppConfig, ModelsConfig};
use crate::device::{create_device_from_string, device_name};
use crate::models::captioner::BlipCaptioner;
use crate::models::hub::{AdapterFiles, HubClient};
use crate::models::lora::LoraAdapter;
use crate::models::registry::{ModelEntry, ModelRegistry};
use crate::models::summarizer::T5Summarizer;
use crate::models::whisper::WhisperRecognizer;
use crate::models::{ImageCaptioner, ModelKind, SpeechRecognizer, TextSummarizer};
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Summary of the memory held by loaded models.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub total_mb: f64,
    pub budget_mb: usize,
    pub within_budget: bool,
    pub per_model: Vec<ModelMemory>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelMemory {
    pub kind: ModelKind,
    pub bytes: u64,
}

pub struct ModelLoader {
    config: ModelsConfig,
    max_model_memory_mb: usize,
    device: Device,
    registry: ModelRegistry,
    summarizer: RwLock<Option<Arc<dyn TextSummarizer>>>,
    captioner: RwLock<Option<Arc<dyn ImageCaptioner>>>,
    recognizer: RwLock<Option<Arc<dyn SpeechRecognizer>>>,
}

impl ModelLoader {
    /// Create a loader with every slot empty. Nothing is downloaded yet.
    pub fn new(config: &AppConfig) -> Self {
        let device = create_device_from_string(&config.models.device);
        Self::with_device(config, device)
    }

    pub fn with_device(config: &AppConfig, device: Device) -> Self {
        let models = &config.models;
        let registry = ModelRegistry::new(vec![
            (
                ModelKind::TextSummarizer,
                models.text_summarizer_model.clone(),
                models.text_summarizer_revision.clone(),
                models.text_summarizer_lora.clone(),
            ),
            (
                ModelKind::ImageCaptioner,
                models.image_caption_model.clone(),
                models.image_caption_revision.clone(),
                models.image_caption_lora.clone(),
            ),
            (
                ModelKind::AudioAsr,
                models.audio_asr_model.clone(),
                models.audio_asr_revision.clone(),
                None,
            ),
        ]);

        Self {
            config: models.clone(),
            max_model_memory_mb: config.performance.max_model_memory_mb,
            device,
            registry,
            summarizer: RwLock::new(None),
            captioner: RwLock::new(None),
            recognizer: RwLock::new(None),
        }
    }

    /// Load all three models concurrently.
    ///
    /// Returns an error only when `require_all` is set and something failed.
    pub async fn initialize_models(&self) -> Result<()> {
        info!(device = device_name(&self.device), "Initializing models");
        let started = Instant::now();

        let hub = match HubClient::new(&self.config.cache_dir) {
            Ok(hub) => hub,
            Err(e) => {
                for kind in ModelKind::ALL {
                    self.registry.mark_error(kind, format!("{:#}", e)).await;
                }
                return self.finish_initialization(vec![(ModelKind::TextSummarizer, e)]);
            }
        };

        let (text, image, audio) = tokio::join!(
            self.track(ModelKind::TextSummarizer, self.load_summarizer(&hub)),
            self.track(ModelKind::ImageCaptioner, self.load_captioner(&hub)),
            self.track(ModelKind::AudioAsr, self.load_recognizer(&hub)),
        );

        let failures: Vec<(ModelKind, anyhow::Error)> = [
            (ModelKind::TextSummarizer, text),
            (ModelKind::ImageCaptioner, image),
            (ModelKind::AudioAsr, audio),
        ]
        .into_iter()
        .filter_map(|(kind, result)| result.err().map(|e| (kind, e)))
        .collect();

        let usage = self.memory_usage().await;
        if !usage.within_budget {
            warn!(
                total_mb = usage.total_mb,
                budget_mb = usage.budget_mb,
                "Loaded models exceed the configured memory budget"
            );
        }
        info!(
            loaded = ModelKind::ALL.len() - failures.len(),
            failed = failures.len(),
            seconds = started.elapsed().as_secs_f64(),
            "Model initialization finished"
        );

        self.finish_initialization(failures)
    }

    fn finish_initialization(&self, failures: Vec<(ModelKind, anyhow::Error)>) -> Result<()> {
        if failures.is_empty() || !self.config.require_all {
            return Ok(());
        }
        let summary = failures
            .iter()
            .map(|(kind, e)| format!("{}: {:#}", kind, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow!("Required models failed to load: {}", summary))
    }

    /// Record Loading, run the load, record Error on failure.
    async fn track<F>(&self, kind: ModelKind, load: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.registry.mark_loading(kind).await;
        let started = Instant::now();
        match load.await {
            Ok(()) => {
                info!(model = %kind, seconds = started.elapsed().as_secs_f64(), "Model loaded");
                Ok(())
            }
            Err(e) => {
                error!(model = %kind, "Failed to load model: {:#}", e);
                self.registry.mark_error(kind, format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    async fn fetch_adapter(&self, hub: &HubClient, adapter: Option<&String>) -> Result<Option<AdapterFiles>> {
        match adapter {
            Some(adapter) => Ok(Some(hub.fetch_adapter(adapter).await?)),
            None => Ok(None),
        }
    }

    async fn load_summarizer(&self, hub: &HubClient) -> Result<()> {
        let model_id = self.config.text_summarizer_model.clone();
        let revision = self.config.text_summarizer_revision.clone();
        let files = hub.fetch_model(&model_id, &revision).await?;
        let adapter_files = self.fetch_adapter(hub, self.config.text_summarizer_lora.as_ref()).await?;
        let device = self.device.clone();

        let summarizer = tokio::task::spawn_blocking(move || {
            let adapter = adapter_files.map(|f| LoraAdapter::load(&f, &device)).transpose()?;
            T5Summarizer::load(&model_id, &revision, &files, adapter.as_ref(), &device)
        })
        .await
        .context("Summarizer loading task failed")??;

        self.install_summarizer(Arc::new(summarizer)).await;
        Ok(())
    }

    async fn load_captioner(&self, hub: &HubClient) -> Result<()> {
        let model_id = self.config.image_caption_model.clone();
        let revision = self.config.image_caption_revision.clone();
        let files = hub.fetch_model(&model_id, &revision).await?;
        let adapter_files = self.fetch_adapter(hub, self.config.image_caption_lora.as_ref()).await?;
        let device = self.device.clone();

        let captioner = tokio::task::spawn_blocking(move || {
            let adapter = adapter_files.map(|f| LoraAdapter::load(&f, &device)).transpose()?;
            BlipCaptioner::load(&model_id, &revision, &files, adapter.as_ref(), &device)
        })
        .await
        .context("Captioner loading task failed")??;

        self.install_captioner(Arc::new(captioner)).await;
        Ok(())
    }

    async fn load_recognizer(&self, hub: &HubClient) -> Result<()> {
        let model_id = self.config.audio_asr_model.clone();
        let revision = self.config.audio_asr_revision.clone();
        let files = hub.fetch_model(&model_id, &revision).await?;
        let device = self.device.clone();

        let recognizer =
            tokio::task::spawn_blocking(move || WhisperRecognizer::load(&model_id, &revision, &files, &device))
                .await
                .context("Recognizer loading task failed")??;

        self.install_recognizer(Arc::new(recognizer)).await;
        Ok(())
    }

    /// Put a summarizer in its slot and mark it loaded.
    pub async fn install_summarizer(&self, provider: Arc<dyn TextSummarizer>) {
        let bytes = provider.info().memory_bytes;
        *self.summarizer.write().await = Some(provider);
        self.registry.mark_loaded(ModelKind::TextSummarizer, bytes).await;
    }

    pub async fn install_captioner(&self, provider: Arc<dyn ImageCaptioner>) {
        let bytes = provider.info().memory_bytes;
        *self.captioner.write().await = Some(provider);
        self.registry.mark_loaded(ModelKind::ImageCaptioner, bytes).await;
    }

    pub async fn install_recognizer(&self, provider: Arc<dyn SpeechRecognizer>) {
        let bytes = provider.info().memory_bytes;
        *self.recognizer.write().await = Some(provider);
        self.registry.mark_loaded(ModelKind::AudioAsr, bytes).await;
    }

    pub async fn summarizer(&self) -> Option<Arc<dyn TextSummarizer>> {
        self.summarizer.read().await.clone()
    }

    pub async fn captioner(&self) -> Option<Arc<dyn ImageCaptioner>> {
        self.captioner.read().await.clone()
    }

    pub async fn recognizer(&self) -> Option<Arc<dyn SpeechRecognizer>> {
        self.recognizer.read().await.clone()
    }

    /// Drop every provider and mark loaded slots as unloaded.
    pub async fn cleanup(&self) {
        info!("Releasing loaded models");
        self.summarizer.write().await.take();
        self.captioner.write().await.take();
        self.recognizer.write().await.take();
        for kind in ModelKind::ALL {
            self.registry.mark_unloaded(kind).await;
        }
    }

    pub async fn memory_usage(&self) -> MemoryUsage {
        let mut per_model = Vec::new();
        for entry in self.registry.list_models().await {
            per_model.push(ModelMemory {
                kind: entry.kind,
                bytes: entry.status.memory_usage_bytes(),
            });
        }
        let total_bytes: u64 = per_model.iter().map(|m| m.bytes).sum();
        let total_mb = total_bytes as f64 / (1024.0 * 1024.0);

        MemoryUsage {
            total_bytes,
            total_mb: (total_mb * 100.0).round() / 100.0,
            budget_mb: self.max_model_memory_mb,
            within_budget: total_mb <= self.max_model_memory_mb as f64,
            per_model,
        }
    }

    pub async fn list_models(&self) -> Vec<ModelEntry> {
        self.registry.list_models().await
    }

    pub async fn all_loaded(&self) -> bool {
        self.registry.all_loaded().await
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_name(&self) -> &'static str {
        device_name(&self.device)
    }
}

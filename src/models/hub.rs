//! # HuggingFace Hub Access
//!
//! Thin wrapper over the `hf-hub` tokio API. Files are cached under
//! `models.cache_dir`, so only the first start downloads anything.
//!
//! ## Environment Variables:
//! - `HF_TOKEN`: access token for gated or private repositories
//! - `HF_HUB_OFFLINE`: logged for debugging; hf-hub honours its own cache

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Files needed to build one model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Size of the weight file, used as the model's memory estimate.
    pub fn weights_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.weights).map(|m| m.len()).unwrap_or(0)
    }
}

/// Files that make up a PEFT LoRA adapter.
#[derive(Debug, Clone)]
pub struct AdapterFiles {
    pub name: String,
    pub config: PathBuf,
    pub weights: PathBuf,
}

pub struct HubClient {
    api: Api,
}

impl HubClient {
    pub fn new(cache_dir: &str) -> Result<Self> {
        debug!("HF_HUB_OFFLINE: {:?}", std::env::var("HF_HUB_OFFLINE"));
        debug!("HF_TOKEN: {:?}", std::env::var("HF_TOKEN").map(|_| "***SET***"));

        let token = std::env::var("HF_TOKEN").ok();
        let api = ApiBuilder::new()
            .with_token(token)
            .with_cache_dir(PathBuf::from(cache_dir))
            .with_progress(false)
            .build()
            .context("Failed to create HuggingFace API client")?;

        Ok(Self { api })
    }

    /// Download (or reuse from cache) one file of a model repository.
    pub async fn fetch(&self, model_id: &str, revision: &str, file: &str) -> Result<PathBuf> {
        let repo = self
            .api
            .repo(Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string()));
        let path = repo
            .get(file)
            .await
            .with_context(|| format!("Failed to fetch {} from {}@{}", file, model_id, revision))?;
        debug!(model = model_id, file, path = ?path, "Fetched model file");
        Ok(path)
    }

    /// Fetch the config, tokenizer and safetensors weights of a model.
    pub async fn fetch_model(&self, model_id: &str, revision: &str) -> Result<ModelFiles> {
        info!(model = model_id, revision, "Fetching model files");
        let config = self.fetch(model_id, revision, "config.json").await?;
        let tokenizer = self.fetch(model_id, revision, "tokenizer.json").await?;
        let weights = self.fetch(model_id, revision, "model.safetensors").await?;
        Ok(ModelFiles { config, tokenizer, weights })
    }

    /// Resolve a LoRA adapter from a local directory or a hub repository.
    pub async fn fetch_adapter(&self, adapter: &str) -> Result<AdapterFiles> {
        let local = Path::new(adapter);
        if local.is_dir() {
            let files = AdapterFiles {
                name: adapter_name(adapter),
                config: local.join("adapter_config.json"),
                weights: local.join("adapter_model.safetensors"),
            };
            if !files.config.is_file() || !files.weights.is_file() {
                anyhow::bail!(
                    "Adapter directory '{}' must contain adapter_config.json and adapter_model.safetensors",
                    adapter
                );
            }
            return Ok(files);
        }

        info!(adapter, "Fetching LoRA adapter from hub");
        Ok(AdapterFiles {
            name: adapter_name(adapter),
            config: self.fetch(adapter, "main", "adapter_config.json").await?,
            weights: self.fetch(adapter, "main", "adapter_model.safetensors").await?,
        })
    }
}

/// Short adapter name: the last path or repository component.
pub fn adapter_name(adapter: &str) -> String {
    adapter
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(adapter)
        .to_string()
}

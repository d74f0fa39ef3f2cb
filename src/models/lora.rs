//! # LoRA Adapters
//!
//! Reads PEFT-format LoRA adapters and merges them into base weights before
//! the model is built. After merging the adapter costs nothing at inference.
//!
//! ## Merge rule:
//! For every adapted linear layer `W` (shape `out × in`) the adapter stores
//! `lora_A` (`r × in`) and `lora_B` (`out × r`). The merged weight is
//! `W + (lora_alpha / r) · B·A`.
//!
//! ## Key naming:
//! PEFT prefixes every key with `base_model.model.` and some versions keep
//! the adapter name (`.default`) before `.weight`. Both are stripped so
//! `base_model.model.encoder.block.0.layer.0.SelfAttention.q.lora_A.weight`
//! maps onto the base key `encoder.block.0.layer.0.SelfAttention.q.weight`.

use crate::models::hub::AdapterFiles;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

const PEFT_PREFIX: &str = "base_model.model.";

/// The fields of `adapter_config.json` that matter for merging.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: TargetModules,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

/// PEFT writes `target_modules` either as a list or as a single regex string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoraPart {
    A,
    B,
}

/// A loaded adapter: its config plus the raw `lora_A`/`lora_B` tensors.
pub struct LoraAdapter {
    pub name: String,
    pub config: LoraConfig,
    tensors: HashMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn load(files: &AdapterFiles, device: &Device) -> Result<Self> {
        let config: LoraConfig = serde_json::from_reader(std::fs::File::open(&files.config)?)
            .with_context(|| format!("Invalid adapter config {:?}", files.config))?;
        let tensors = candle_core::safetensors::load(&files.weights, device)
            .with_context(|| format!("Failed to read adapter weights {:?}", files.weights))?;

        info!(
            adapter = %files.name,
            rank = config.r,
            alpha = config.lora_alpha,
            tensors = tensors.len(),
            "Loaded LoRA adapter"
        );
        Self::from_parts(files.name.clone(), config, tensors)
    }

    pub fn from_parts(name: String, config: LoraConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        if config.r == 0 {
            return Err(anyhow!("Adapter '{}' has rank 0", name));
        }
        Ok(Self { name, config, tensors })
    }

    pub fn scale(&self) -> f64 {
        self.config.lora_alpha / self.config.r as f64
    }

    /// Group the adapter tensors into `(base key, A, B)` triples.
    fn pairs(&self) -> Result<Vec<(String, &Tensor, &Tensor)>> {
        let mut a_parts: HashMap<String, &Tensor> = HashMap::new();
        let mut b_parts: HashMap<String, &Tensor> = HashMap::new();

        for (key, tensor) in &self.tensors {
            match base_weight_key(key) {
                Some((base, LoraPart::A)) => {
                    a_parts.insert(base, tensor);
                }
                Some((base, LoraPart::B)) => {
                    b_parts.insert(base, tensor);
                }
                None => debug!(key = %key, "Skipping non-LoRA adapter tensor"),
            }
        }

        let mut pairs = Vec::with_capacity(a_parts.len());
        for (base, a) in a_parts {
            let b = b_parts
                .remove(&base)
                .ok_or_else(|| anyhow!("Adapter '{}' has lora_A without lora_B for {}", self.name, base))?;
            pairs.push((base, a, b));
        }
        if let Some(base) = b_parts.keys().next() {
            return Err(anyhow!("Adapter '{}' has lora_B without lora_A for {}", self.name, base));
        }
        pairs.sort_by(|x, y| x.0.cmp(&y.0));
        Ok(pairs)
    }

    /// Merge every adapted layer into `weights` in place. Returns the number
    /// of layers changed.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        let scale = self.scale();
        let pairs = self.pairs()?;

        for (base, a, b) in &pairs {
            let weight = weights
                .get(base)
                .ok_or_else(|| anyhow!("Adapter '{}' targets unknown weight '{}'", self.name, base))?;
            let dtype = weight.dtype();
            let device = weight.device().clone();

            let a = a.to_device(&device)?.to_dtype(DType::F32)?;
            let b = b.to_device(&device)?.to_dtype(DType::F32)?;
            let delta = (b.matmul(&a)? * scale)?;
            if delta.dims() != weight.dims() {
                return Err(anyhow!(
                    "Adapter '{}' shape {:?} does not match weight '{}' {:?}",
                    self.name,
                    delta.dims(),
                    base,
                    weight.dims()
                ));
            }

            let merged = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?;
            weights.insert(base.clone(), merged);
        }

        info!(adapter = %self.name, layers = pairs.len(), scale, "Merged LoRA adapter");
        Ok(pairs.len())
    }
}

/// Map a PEFT key onto the base weight it adapts.
fn base_weight_key(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let (module, part) = if let Some(idx) = key.find(".lora_A") {
        (&key[..idx], LoraPart::A)
    } else if let Some(idx) = key.find(".lora_B") {
        (&key[..idx], LoraPart::B)
    } else {
        return None;
    };
    Some((format!("{}.weight", module), part))
}

/// Build a `VarBuilder` over a safetensors file, merging `adapter` first
/// when one is given.
pub fn var_builder(
    weights: &Path,
    adapter: Option<&LoraAdapter>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    match adapter {
        None => {
            // SAFETY: the weight file is not modified while the model is alive
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
            Ok(vb)
        }
        Some(adapter) => {
            let mut tensors = candle_core::safetensors::load(weights, device)
                .with_context(|| format!("Failed to read weights {:?}", weights))?;
            adapter.merge_into(&mut tensors)?;
            Ok(VarBuilder::from_tensors(tensors, dtype, device))
        }
    }
}

//! # BLIP Image Captioner
//!
//! Candle's BLIP conditional-generation model. The vision transformer embeds
//! the image once, then the BERT-style text decoder generates greedily from
//! the `[DEC]` start token until `[SEP]`.

use crate::models::hub::ModelFiles;
use crate::models::lora::{self, LoraAdapter};
use crate::models::{argmax_excluding, GenerationOptions, ImageCaptioner, ModelKind, ProviderInfo};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::blip;
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::warn;

/// Input resolution of the BLIP vision encoder.
pub const IMAGE_SIZE: u32 = 384;

const START_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct BlipCaptioner {
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    info: ProviderInfo,
}

impl BlipCaptioner {
    pub fn load(
        model_id: &str,
        revision: &str,
        files: &ModelFiles,
        adapter: Option<&LoraAdapter>,
        device: &Device,
    ) -> Result<Self> {
        if !model_id.contains("large") {
            warn!(model = model_id, "Only the large BLIP captioning layout is supported; loading with that config");
        }
        let config = blip::Config::image_captioning_large();
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = lora::var_builder(&files.weights, adapter, DType::F32, device)?;
        let model = blip::BlipForConditionalGeneration::new(&config, vb).context("Failed to build BLIP model")?;

        let info = ProviderInfo {
            kind: ModelKind::ImageCaptioner,
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            backend: "candle-blip".to_string(),
            device: format!("{:?}", device),
            adapter: adapter.map(|a| a.name.clone()),
            memory_bytes: files.weights_size_bytes(),
        };

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device: device.clone(),
            info,
        })
    }
}

impl ImageCaptioner for BlipCaptioner {
    fn caption(&self, image: &DynamicImage, options: &GenerationOptions) -> Result<String> {
        let pixels = image_to_tensor(image, &self.device)?;

        let mut model = self.model.lock().map_err(|_| anyhow!("Captioner model lock poisoned"))?;
        model.reset_kv_cache();
        let image_embeds = pixels.unsqueeze(0)?.apply(model.vision_model())?;

        let mut token_ids = vec![START_TOKEN_ID];
        for step in 0..options.max_length {
            let context = if step > 0 { &token_ids[token_ids.len() - 1..] } else { &token_ids[..] };
            let input_ids = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?.squeeze(0)?;
            let last = logits.i(logits.dim(0)? - 1)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;

            let banned: &[u32] = if step < options.min_length { &[SEP_TOKEN_ID] } else { &[] };
            let next = argmax_excluding(&last, banned).ok_or_else(|| anyhow!("Decoder produced no usable logits"))?;
            if next == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(next);
        }
        model.reset_kv_cache();
        drop(model);

        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(caption.trim().to_string())
    }

    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }
}

/// Resize to 384×384 and normalize with the CLIP mean/std into a
/// `(3, 384, 384)` tensor.
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let resized = image.resize_to_fill(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle).to_rgb8();
    let size = IMAGE_SIZE as usize;
    let data = Tensor::from_vec(resized.into_raw(), (size, size, 3), device)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, device)?.reshape((3, 1, 1))?;
    let normalized = (data.to_dtype(DType::F32)? / 255.)?.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(normalized)
}

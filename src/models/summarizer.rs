//! # Summarization Providers
//!
//! Two implementations of [`TextSummarizer`]:
//! - [`T5Summarizer`]: abstractive, a candle T5 encoder-decoder with greedy decoding
//! - [`ExtractiveSummarizer`]: picks the highest-scoring sentences, no weights needed
//!
//! ## Key Rust Concepts Used:
//! - **Mutex<T>**: candle's T5 keeps a KV cache and needs `&mut self` to
//!   decode, so concurrent requests take turns on the one model
//! - **Trait objects**: both types sit behind `Arc<dyn TextSummarizer>`

use crate::models::hub::ModelFiles;
use crate::models::lora::{self, LoraAdapter};
use crate::models::{argmax_excluding, GenerationOptions, ModelKind, ProviderInfo, TextSummarizer};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::t5;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::debug;

/// T5 expects a task prefix on its input.
const TASK_PREFIX: &str = "summarize: ";

/// Inputs longer than this are truncated before encoding.
const MAX_INPUT_TOKENS: usize = 512;

pub struct T5Summarizer {
    model: Mutex<t5::T5ForConditionalGeneration>,
    config: t5::Config,
    tokenizer: Tokenizer,
    device: Device,
    info: ProviderInfo,
}

impl T5Summarizer {
    pub fn load(
        model_id: &str,
        revision: &str,
        files: &ModelFiles,
        adapter: Option<&LoraAdapter>,
        device: &Device,
    ) -> Result<Self> {
        let config: t5::Config = serde_json::from_reader(std::fs::File::open(&files.config)?)
            .context("Invalid T5 config.json")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = lora::var_builder(&files.weights, adapter, DType::F32, device)?;
        let model = t5::T5ForConditionalGeneration::load(vb, &config).context("Failed to build T5 model")?;

        let info = ProviderInfo {
            kind: ModelKind::TextSummarizer,
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            backend: "candle-t5".to_string(),
            device: format!("{:?}", device),
            adapter: adapter.map(|a| a.name.clone()),
            memory_bytes: files.weights_size_bytes(),
        };

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            device: device.clone(),
            info,
        })
    }

    fn encode_input(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(format!("{}{}", TASK_PREFIX, text), true)
            .map_err(|e| anyhow!("Tokenizer encode error: {}", e))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > MAX_INPUT_TOKENS {
            debug!(tokens = ids.len(), "Truncating summarizer input");
            ids.truncate(MAX_INPUT_TOKENS - 1);
            ids.push(self.config.eos_token_id as u32);
        }
        Ok(ids)
    }
}

impl TextSummarizer for T5Summarizer {
    fn summarize(&self, text: &str, options: &GenerationOptions) -> Result<String> {
        let input_ids = self.encode_input(text)?;
        let eos = self.config.eos_token_id as u32;
        let start = self.config.decoder_start_token_id.unwrap_or(self.config.pad_token_id) as u32;

        let mut model = self.model.lock().map_err(|_| anyhow!("Summarizer model lock poisoned"))?;
        model.clear_kv_cache();

        let input = Tensor::new(input_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let encoder_output = model.encode(&input)?;

        let mut output = vec![start];
        for step in 0..options.max_length {
            let context = if self.config.use_cache && step > 0 {
                &output[output.len() - 1..]
            } else {
                &output[..]
            };
            let decoder_input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model
                .decode(&decoder_input, &encoder_output)?
                .squeeze(0)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?;

            let banned: &[u32] = if step < options.min_length { &[eos] } else { &[] };
            let next = argmax_excluding(&logits, banned).ok_or_else(|| anyhow!("Decoder produced no usable logits"))?;
            if next == eos {
                break;
            }
            output.push(next);
        }
        model.clear_kv_cache();
        drop(model);

        let summary = self
            .tokenizer
            .decode(&output[1..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(summary.trim().to_string())
    }

    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }
}

/// Frequency-scored sentence selection.
///
/// Each sentence scores the mean corpus frequency of its content words.
/// The best sentences are taken until `max_length` words are used, then
/// emitted in their original order.
#[derive(Debug, Default, Clone)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str, max_words: usize) -> String {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return String::new();
        }

        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for word in content_words(text) {
            *frequencies.entry(word).or_insert(0) += 1;
        }

        let mut ranked: Vec<(usize, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(i, sentence)| {
                let words = content_words(sentence);
                let score = if words.is_empty() {
                    0.0
                } else {
                    words.iter().map(|w| frequencies.get(w).copied().unwrap_or(0) as f64).sum::<f64>() / words.len() as f64
                };
                (i, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut chosen = HashSet::new();
        let mut used = 0;
        for (i, _) in &ranked {
            let words = sentences[*i].split_whitespace().count();
            if used + words > max_words && !chosen.is_empty() {
                continue;
            }
            chosen.insert(*i);
            used += words;
            if used >= max_words {
                break;
            }
        }

        let mut picked: Vec<usize> = chosen.into_iter().collect();
        picked.sort_unstable();
        let summary = picked.iter().map(|i| sentences[*i].as_str()).collect::<Vec<_>>().join(" ");

        // A single sentence longer than the budget is cut at the word limit
        let words: Vec<&str> = summary.split_whitespace().collect();
        if words.len() > max_words {
            words[..max_words].join(" ")
        } else {
            summary
        }
    }
}

impl TextSummarizer for ExtractiveSummarizer {
    fn summarize(&self, text: &str, options: &GenerationOptions) -> Result<String> {
        Ok(self.extract(text, options.max_length.max(1)))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ModelKind::TextSummarizer,
            model_id: "extractive".to_string(),
            revision: "builtin".to_string(),
            backend: "frequency-scoring".to_string(),
            device: "Cpu".to_string(),
            adapter: None,
            memory_bytes: 0,
        }
    }
}

pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "being", "but", "by", "can", "could", "did", "do",
    "does", "for", "from", "had", "has", "have", "he", "her", "him", "his", "how", "i", "if", "in", "into",
    "is", "it", "its", "may", "me", "might", "must", "my", "not", "of", "on", "or", "our", "shall", "she",
    "should", "so", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "to", "us", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why",
    "will", "with", "would", "you", "your",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Split on `.`, `!` and `?`, keeping the terminator with its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim();
            if sentence.chars().any(|c| c.is_alphanumeric()) {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if rest.chars().any(|c| c.is_alphanumeric()) {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Lowercased words longer than two characters that are not stop words.
pub fn content_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() > 2 && !is_stop_word(w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = "Rust programs avoid data races. The borrow checker enforces ownership rules. \
        Ownership rules make Rust programs safe without a garbage collector. Lunch was pleasant.";

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("One. Two! Three? trailing");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "trailing"]);
        assert!(split_sentences("  ...  ").is_empty());
    }

    #[test]
    fn test_content_words_filter() {
        let words = content_words("The cat is on the big mat, it's fine");
        assert_eq!(words, vec!["cat", "big", "mat", "it's", "fine"]);
    }

    #[test]
    fn test_extractive_prefers_central_sentences() {
        let summary = ExtractiveSummarizer::new().extract(ARTICLE, 12);
        assert!(summary.contains("Ownership rules make Rust programs safe"));
        assert!(!summary.contains("Lunch"));
    }

    #[test]
    fn test_extractive_keeps_original_order() {
        let summary = ExtractiveSummarizer::new().extract(ARTICLE, 100);
        let first = summary.find("data races").unwrap();
        let second = summary.find("borrow checker").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_extractive_respects_word_budget() {
        let summary = ExtractiveSummarizer::new().extract(ARTICLE, 4);
        assert!(summary.split_whitespace().count() <= 4);
        assert!(!summary.is_empty());
    }

    #[test]
    fn test_extractive_provider() {
        let provider = ExtractiveSummarizer::new();
        let options = GenerationOptions { max_length: 50, min_length: 5 };
        assert!(!provider.summarize(ARTICLE, &options).unwrap().is_empty());
        assert_eq!(provider.summarize("", &options).unwrap(), "");
        assert_eq!(provider.info().memory_bytes, 0);
    }
}

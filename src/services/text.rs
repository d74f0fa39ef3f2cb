//! # Text Service
//!
//! Summarization with text cleanup before the model and tidying after it,
//! optional readability and key-phrase analysis, and batch summarization
//! through the shared bounded runner.
//!
//! ## Request Flow:
//! 1. Validate the request against the current limits
//! 2. `preprocess_text`: whitespace, quotes, URLs/e-mails, punctuation runs
//! 3. Summarize: abstractive through the loaded provider, or extractive
//!    with the built-in sentence scorer
//! 4. `postprocess_summary`: ending punctuation, filler openers, capitalization
//! 5. Optionally attach readability metrics and key phrases

use crate::batch::{run_batch, BatchError, BatchOutcome, MetricExtractor, Metrics, Quantity, Ratio, WorkUnit};
use crate::config::LimitsConfig;
use crate::models::summarizer::{is_stop_word, ExtractiveSummarizer};
use crate::models::{GenerationOptions, ModelKind, ModelLoader, ProviderInfo, TextSummarizer};
use crate::services::health::run_check;
use crate::services::{check_adapter, round2, run_blocking, unavailable, InputError, ServiceHealth, ServiceStats};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Openers models like to start a summary with.
const REDUNDANT_PHRASES: &[&str] = &[
    "In summary,",
    "To summarize,",
    "In conclusion,",
    "The text discusses",
    "This article talks about",
    "The main points are",
    "Key points include",
];

/// Input for the summarizer health check.
const HEALTH_CHECK_TEXT: &str = "This is a simple test text for health checking. It contains multiple \
sentences to verify that the summarization model is working correctly.";

const QUOTE_CHARS: &[char] = &['"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    #[default]
    Abstractive,
    Extractive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeParams {
    pub max_length: usize,
    pub min_length: usize,
    pub summary_type: SummaryType,
    pub include_analysis: bool,
    pub use_lora: bool,
    pub lora_adapter: Option<String>,
}

impl Default for SummarizeParams {
    fn default() -> Self {
        Self {
            max_length: 150,
            min_length: 30,
            summary_type: SummaryType::Abstractive,
            include_analysis: false,
            use_lora: false,
            lora_adapter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readability {
    pub flesch_reading_ease: f64,
    pub flesch_kincaid_grade: f64,
    pub avg_sentence_length: f64,
    pub avg_syllables_per_word: f64,
    pub total_sentences: usize,
    pub total_words: usize,
    pub total_syllables: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhraseKind {
    Word,
    Phrase,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyPhrase {
    pub phrase: String,
    pub frequency: usize,
    #[serde(rename = "type")]
    pub kind: PhraseKind,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextAnalysis {
    pub readability: Readability,
    pub key_phrases: Vec<KeyPhrase>,
    pub summary_readability: Readability,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryResult {
    pub summary: String,
    /// Provider output before postprocessing
    pub original_summary: String,
    pub summary_type: SummaryType,
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
    pub processing_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_analysis: Option<TextAnalysis>,
}

/// Batch metrics: length totals and the overall compression ratio.
pub struct SummaryMetrics;

impl MetricExtractor<SummaryResult> for SummaryMetrics {
    fn extract(&self, output: &SummaryResult) -> Metrics {
        Metrics::from([
            ("original_length".to_string(), output.original_length as f64),
            ("summary_length".to_string(), output.summary_length as f64),
        ])
    }

    fn metric_names(&self) -> Vec<&'static str> {
        vec!["original_length", "summary_length"]
    }

    fn ratios(&self) -> Vec<Ratio> {
        vec![
            Ratio::new(
                "average_compression_ratio",
                Quantity::Sum("summary_length"),
                Quantity::Sum("original_length"),
            ),
            Ratio::new("throughput_texts_per_second", Quantity::Total, Quantity::Duration),
        ]
    }
}

pub struct TextService {
    loader: Arc<ModelLoader>,
    extractive: ExtractiveSummarizer,
    stats: ServiceStats,
}

impl TextService {
    pub fn new(loader: Arc<ModelLoader>) -> Self {
        Self {
            loader,
            extractive: ExtractiveSummarizer::new(),
            stats: ServiceStats::new(),
        }
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub async fn provider(&self) -> Option<Arc<dyn TextSummarizer>> {
        self.loader.summarizer().await
    }

    /// Loaded abstractive provider, or `None` while it is unavailable.
    pub async fn model_info(&self) -> Option<ProviderInfo> {
        self.provider().await.map(|p| p.info())
    }

    /// Summarize one text. Counts towards the service statistics.
    pub async fn enhanced_summarization(
        &self,
        text: &str,
        params: &SummarizeParams,
        limits: &LimitsConfig,
    ) -> Result<SummaryResult> {
        let timer = self.stats.start();
        validate_request(text, params, limits)?;

        let processed = preprocess_text(text);
        let options = GenerationOptions {
            max_length: params.max_length,
            min_length: params.min_length,
        };

        let (raw_summary, adapter) = match params.summary_type {
            SummaryType::Extractive => (self.extractive.summarize(&processed, &options)?, None),
            SummaryType::Abstractive => {
                let provider = self
                    .provider()
                    .await
                    .ok_or_else(|| unavailable(ModelKind::TextSummarizer))?;
                let adapter = check_adapter(
                    ModelKind::TextSummarizer,
                    params.use_lora,
                    params.lora_adapter.as_deref(),
                    provider.info().adapter.as_deref(),
                )?;
                let summary = run_blocking(move || provider.summarize(&processed, &options)).await?;
                (summary, adapter)
            }
        };

        let summary = postprocess_summary(&raw_summary);
        let original_length = text.chars().count();
        let summary_length = summary.chars().count();

        let text_analysis = params.include_analysis.then(|| TextAnalysis {
            readability: calculate_readability_score(text),
            key_phrases: extract_key_phrases(text, 10),
            summary_readability: calculate_readability_score(&summary),
        });

        let processing_time_seconds = timer.success(original_length as u64);
        info!(
            summary_type = ?params.summary_type,
            original_length,
            summary_length,
            seconds = processing_time_seconds,
            "Summarization completed"
        );

        Ok(SummaryResult {
            compression_ratio: crate::batch::safe_ratio(summary_length as f64, original_length as f64),
            summary,
            original_summary: raw_summary,
            summary_type: params.summary_type,
            original_length,
            summary_length,
            processing_time_seconds,
            timestamp: Utc::now(),
            lora_adapter: adapter,
            text_analysis,
        })
    }

    /// Summarize a fixed two-sentence text with the abstractive provider.
    pub async fn health_check(&self) -> ServiceHealth {
        let check = self.provider().await.map(|provider| {
            move || {
                let options = GenerationOptions { max_length: 50, min_length: 10 };
                provider.summarize(HEALTH_CHECK_TEXT, &options).map(|s| s.chars().count())
            }
        });
        run_check(ModelKind::TextSummarizer, check).await
    }

    /// Summarize many texts with at most `max_concurrency` in flight.
    pub async fn batch_summarization(
        &self,
        texts: Vec<String>,
        params: &SummarizeParams,
        limits: &LimitsConfig,
        max_concurrency: usize,
    ) -> Result<BatchOutcome<SummaryResult>, BatchError> {
        debug!(texts = texts.len(), "Batch summarization requested");
        let units = WorkUnit::from_payloads(texts, params);
        let run = run_batch(
            units,
            |text: String, params: SummarizeParams| async move {
                self.enhanced_summarization(&text, &params, limits).await
            },
            max_concurrency,
        )
        .await?;
        Ok(run.into_outcome(&SummaryMetrics))
    }
}

fn validate_request(text: &str, params: &SummarizeParams, limits: &LimitsConfig) -> Result<(), InputError> {
    if text.trim().is_empty() {
        return Err(InputError::Invalid("Text cannot be empty".to_string()));
    }
    let length = text.chars().count();
    if length > limits.max_text_length {
        return Err(InputError::Invalid(format!(
            "Text length {} exceeds the maximum of {} characters",
            length, limits.max_text_length
        )));
    }
    if params.max_length > limits.max_summary_length {
        return Err(InputError::Invalid(format!(
            "max_length {} exceeds the maximum summary length of {}",
            params.max_length, limits.max_summary_length
        )));
    }
    if params.min_length > params.max_length {
        return Err(InputError::Invalid(format!(
            "min_length ({}) cannot be greater than max_length ({})",
            params.min_length, params.max_length
        )));
    }
    Ok(())
}

/// Clean text before summarization.
pub fn preprocess_text(text: &str) -> String {
    let normalized: String = text
        .chars()
        .map(|c| if QUOTE_CHARS.contains(&c) { '"' } else { c })
        .collect();

    let without_links = normalized
        .split_whitespace()
        .filter_map(strip_link)
        .collect::<Vec<_>>()
        .join(" ");

    let collapsed = collapse_punctuation_runs(&without_links);

    let mut out = String::with_capacity(collapsed.len());
    for c in collapsed.chars() {
        if matches!(c, ',' | '.' | '!' | '?' | ';' | ':') {
            while out.ends_with(' ') {
                out.pop();
            }
        }
        out.push(c);
    }
    out.trim().to_string()
}

/// Remove a URL or e-mail address from one whitespace-separated token,
/// keeping surrounding punctuation. Returns `None` when nothing is left.
fn strip_link(token: &str) -> Option<String> {
    let token = match token.find("http://").or_else(|| token.find("https://")) {
        Some(pos) => &token[..pos],
        None => token,
    };

    let core = token.trim_matches(|c: char| !c.is_alphanumeric());
    let kept = if is_email(core) { token.replacen(core, "", 1) } else { token.to_string() };

    if kept.trim().is_empty() {
        None
    } else {
        Some(kept)
    }
}

fn is_email(candidate: &str) -> bool {
    let Some((local, domain)) = candidate.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty() && local.chars().all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty() && host.chars().all(|c| c.is_ascii_alphanumeric() || ".-".contains(c));
    local_ok && host_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// `....` becomes `...`, `!!` becomes `!`, `??` becomes `?`.
fn collapse_punctuation_runs(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let run = chars[i..].iter().take_while(|&&x| x == c).count();
        match c {
            '.' if run >= 3 => out.push_str("..."),
            '!' | '?' => out.push(c),
            _ => out.extend(std::iter::repeat(c).take(run)),
        }
        i += run;
    }
    out
}

/// Tidy a generated summary.
pub fn postprocess_summary(summary: &str) -> String {
    let mut summary = summary.trim().to_string();

    if !summary.is_empty() && !summary.ends_with(['.', '!', '?']) {
        summary.push('.');
    }

    for phrase in REDUNDANT_PHRASES {
        let matches = summary
            .get(..phrase.len())
            .map(|head| head.eq_ignore_ascii_case(phrase))
            .unwrap_or(false);
        if matches {
            summary = summary[phrase.len()..].trim().to_string();
            break;
        }
    }

    capitalize_first(&summary)
}

pub(crate) fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn count_syllables(word: &str) -> usize {
    let mut groups = 0;
    let mut in_group = false;
    for c in word.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !in_group {
            groups += 1;
        }
        in_group = vowel;
    }
    if word.ends_with('e') && groups > 1 {
        groups -= 1;
    }
    groups.max(1)
}

/// Flesch reading ease and Flesch-Kincaid grade, with the inputs behind them.
pub fn calculate_readability_score(text: &str) -> Readability {
    let total_sentences = text
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    let words: Vec<&str> = text.split_whitespace().collect();

    let total_syllables: usize = words
        .iter()
        .map(|w| w.to_lowercase())
        .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation()).to_string())
        .filter(|w| !w.is_empty())
        .map(|w| count_syllables(&w))
        .sum();

    let avg_sentence_length = crate::batch::safe_ratio(words.len() as f64, total_sentences as f64);
    let avg_syllables_per_word = crate::batch::safe_ratio(total_syllables as f64, words.len() as f64);

    let flesch = 206.835 - 1.015 * avg_sentence_length - 84.6 * avg_syllables_per_word;
    let grade = 0.39 * avg_sentence_length + 11.8 * avg_syllables_per_word - 15.59;

    Readability {
        flesch_reading_ease: round2(flesch.clamp(0.0, 100.0)),
        flesch_kincaid_grade: round2(grade.max(0.0)),
        avg_sentence_length: round2(avg_sentence_length),
        avg_syllables_per_word: round2(avg_syllables_per_word),
        total_sentences,
        total_words: words.len(),
        total_syllables,
    }
}

/// Count occurrences, most frequent first, ties in order of first appearance.
fn ranked_counts(items: &[String]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, item) in items.iter().enumerate() {
        counts.entry(item.as_str()).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, usize)> = counts.into_iter().map(|(k, (n, first))| (k, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(k, n, _)| (k.to_string(), n)).collect()
}

/// Frequent words plus repeated two- and three-word phrases.
///
/// Words score their frequency; phrases seen more than once score
/// frequency × 1.5. The top `max_phrases` by score are returned.
pub fn extract_key_phrases(text: &str, max_phrases: usize) -> Vec<KeyPhrase> {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() > 2 && !is_stop_word(w))
        .map(str::to_string)
        .collect();

    let mut ngrams: Vec<String> = words.windows(2).map(|w| w.join(" ")).collect();
    ngrams.extend(words.windows(3).map(|w| w.join(" ")));

    let mut phrases: Vec<KeyPhrase> = ranked_counts(&words)
        .into_iter()
        .take(max_phrases)
        .map(|(phrase, frequency)| KeyPhrase {
            phrase,
            frequency,
            kind: PhraseKind::Word,
            score: frequency as f64,
        })
        .collect();

    phrases.extend(
        ranked_counts(&ngrams)
            .into_iter()
            .take(max_phrases)
            .filter(|(_, frequency)| *frequency > 1)
            .map(|(phrase, frequency)| KeyPhrase {
                phrase,
                frequency,
                kind: PhraseKind::Phrase,
                score: frequency as f64 * 1.5,
            }),
    );

    phrases.sort_by(|a, b| b.score.total_cmp(&a.score));
    phrases.truncate(max_phrases);
    phrases
}

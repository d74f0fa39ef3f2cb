//! # Whisper Speech Recognition
//!
//! Candle's Whisper encoder-decoder plus the log-mel front-end it expects.
//!
//! ## Pipeline:
//! 1. Split the 16 kHz samples into windows of `chunk_seconds` (max 30 s)
//! 2. Pad each window to 30 s and compute an 80-bin log-mel spectrogram
//!    (400-point Hann STFT, hop 160, 3000 frames)
//! 3. Encode, then decode greedily from
//!    `<|startoftranscript|> <|lang|> <|task|> <|notimestamps|>`
//! 4. Stop at `<|endoftext|>`, at the token budget, or when the output
//!    starts repeating itself
//!
//! ## Language detection:
//! When no language is given, the first window is scored once with only the
//! start token and the most likely of the supported language tokens wins.
//! Later windows reuse that language.

use crate::models::hub::ModelFiles;
use crate::models::{
    argmax_excluding, ModelKind, ProviderInfo, SpeechRecognizer, SpeechTask, TranscribeOptions, Transcript,
    TranscriptSegment,
};
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

pub const SAMPLE_RATE: usize = 16_000;
pub const N_FFT: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const CHUNK_LENGTH: usize = 30;
pub const N_SAMPLES: usize = CHUNK_LENGTH * SAMPLE_RATE;
pub const N_FRAMES: usize = N_SAMPLES / HOP_LENGTH;

/// Languages the service accepts: (code, English name, native name).
pub const LANGUAGES: &[(&str, &str, &str)] = &[
    ("en", "English", "English"),
    ("es", "Spanish", "Español"),
    ("fr", "French", "Français"),
    ("de", "German", "Deutsch"),
    ("it", "Italian", "Italiano"),
    ("pt", "Portuguese", "Português"),
    ("ru", "Russian", "Русский"),
    ("ja", "Japanese", "日本語"),
    ("ko", "Korean", "한국어"),
    ("zh", "Chinese", "中文"),
    ("ar", "Arabic", "العربية"),
    ("hi", "Hindi", "हिन्दी"),
    ("nl", "Dutch", "Nederlands"),
    ("pl", "Polish", "Polski"),
    ("tr", "Turkish", "Türkçe"),
];

pub fn is_supported_language(code: &str) -> bool {
    LANGUAGES.iter().any(|(c, _, _)| *c == code)
}

/// Token ids resolved from the tokenizer at load time.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no '{}' token", token))
        };
        let languages = LANGUAGES
            .iter()
            .filter_map(|(code, _, _)| tokenizer.token_to_id(&format!("<|{}|>", code)).map(|id| (*code, id)))
            .collect();

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            translate: id(m::TRANSLATE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            languages,
        })
    }

    fn language(&self, code: &str) -> Option<u32> {
        self.languages.iter().find(|(c, _)| *c == code).map(|(_, id)| *id)
    }
}

pub struct WhisperRecognizer {
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    device: Device,
    info: ProviderInfo,
}

impl WhisperRecognizer {
    pub fn load(model_id: &str, revision: &str, files: &ModelFiles, device: &Device) -> Result<Self> {
        let config: Config =
            serde_json::from_reader(std::fs::File::open(&files.config)?).context("Invalid Whisper config.json")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filters(config.num_mel_bins, N_FFT, SAMPLE_RATE);

        // SAFETY: the weight file is not modified while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], m::DTYPE, device)? };
        let model = m::model::Whisper::load(&vb, config.clone()).context("Failed to build Whisper model")?;

        let info = ProviderInfo {
            kind: ModelKind::AudioAsr,
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            backend: "candle-whisper".to_string(),
            device: format!("{:?}", device),
            adapter: None,
            memory_bytes: files.weights_size_bytes(),
        };

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            device: device.clone(),
            info,
        })
    }

    fn mel_tensor(&self, window: &[f32]) -> Result<Tensor> {
        let n_mels = self.config.num_mel_bins;
        let mel = log_mel_spectrogram(window, &self.mel_filters, n_mels);
        Ok(Tensor::from_vec(mel, (1, n_mels, N_FRAMES), &self.device)?)
    }

    fn detect_language(&self, model: &mut m::model::Whisper, features: &Tensor) -> Result<Option<&'static str>> {
        if self.tokens.languages.is_empty() {
            return Ok(None);
        }
        let input = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&input, features, true)?;
        let logits = model.decoder.final_linear(&ys.i((..1, ..1))?)?.i(0)?.i(0)?.to_vec1::<f32>()?;

        let best = self
            .tokens
            .languages
            .iter()
            .filter_map(|(code, id)| logits.get(*id as usize).map(|score| (*code, *score)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(code, _)| code);
        debug!(language = ?best, "Detected language");
        Ok(best)
    }

    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        features: &Tensor,
        language: Option<&str>,
        task: SpeechTask,
    ) -> Result<String> {
        let mut tokens = vec![self.tokens.sot];
        if let Some(id) = language.and_then(|code| self.tokens.language(code)) {
            tokens.push(id);
        }
        tokens.push(match task {
            SpeechTask::Transcribe => self.tokens.transcribe,
            SpeechTask::Translate => self.tokens.translate,
        });
        tokens.push(self.tokens.no_timestamps);

        let eot = self.tokens.eot;
        let budget = self.config.max_target_positions / 2;
        let mut output: Vec<u32> = Vec::new();

        for i in 0..budget {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_vec1::<f32>()?;

            // Special tokens above <|endoftext|> never appear in plain text
            let text_logits = &logits[..logits.len().min(eot as usize + 1)];
            let next = argmax_excluding(text_logits, &[]).ok_or_else(|| anyhow!("Decoder produced no usable logits"))?;
            if next == eot {
                break;
            }
            if is_repetitive(&output, next) {
                warn!(tokens = output.len(), "Stopping repetitive Whisper output");
                break;
            }
            tokens.push(next);
            output.push(next);
        }

        let text = self
            .tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }
        if let Some(code) = options.language.as_deref() {
            if self.tokens.language(code).is_none() {
                return Err(anyhow!("Unsupported language '{}'", code));
            }
        }

        let chunk = options.chunk_seconds.clamp(1, CHUNK_LENGTH) * SAMPLE_RATE;
        let mut model = self.model.lock().map_err(|_| anyhow!("Recognizer model lock poisoned"))?;
        let mut language: Option<String> = options.language.clone();
        let mut segments = Vec::new();

        for (start, end) in windows(samples.len(), chunk) {
            let mel = self.mel_tensor(&samples[start..end])?;
            let features = model.encoder.forward(&mel, true)?;

            if language.is_none() {
                language = self.detect_language(&mut model, &features)?.map(str::to_string);
            }

            let text = self.decode_window(&mut model, &features, language.as_deref(), options.task)?;
            segments.push(TranscriptSegment {
                start_seconds: start as f64 / SAMPLE_RATE as f64,
                end_seconds: end as f64 / SAMPLE_RATE as f64,
                text,
            });
        }
        drop(model);

        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Transcript { text, language, segments })
    }

    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }
}

/// `(start, end)` sample ranges covering `len` samples in steps of `chunk`.
pub fn windows(len: usize, chunk: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(1);
    (0..len).step_by(chunk).map(|start| (start, (start + chunk).min(len))).collect()
}

/// True when appending `next` would repeat the last token three times, or
/// repeat the previous three-token pattern.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }
    if tokens[tokens.len() - 3..] == [next, next, next] {
        return true;
    }
    let mut candidate = tokens[tokens.len() - 2..].to_vec();
    candidate.push(next);
    candidate == tokens[tokens.len() - 5..tokens.len() - 2]
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized triangular mel filterbank, `n_mels × (n_fft / 2 + 1)`,
/// row-major.
pub fn mel_filters(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..n_bins).map(|i| i as f64 * nyquist / (n_bins - 1) as f64).collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[m * n_bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

/// Whisper's log-mel spectrogram of one window, `n_mels × N_FRAMES`,
/// row-major. The window is zero-padded (or cut) to 30 seconds.
pub fn log_mel_spectrogram(samples: &[f32], filters: &[f32], n_mels: usize) -> Vec<f32> {
    let n_bins = N_FFT / 2 + 1;
    let half = N_FFT / 2;

    let mut audio = vec![0.0f32; N_SAMPLES];
    let len = samples.len().min(N_SAMPLES);
    audio[..len].copy_from_slice(&samples[..len]);

    // Reflect padding, as with a centered STFT
    let mut padded = Vec::with_capacity(N_SAMPLES + N_FFT);
    padded.extend((1..=half).rev().map(|i| audio[i]));
    padded.extend_from_slice(&audio);
    padded.extend((1..=half).map(|i| audio[N_SAMPLES - 1 - i]));

    let window: Vec<f32> = (0..N_FFT)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / N_FFT as f32).cos())
        .collect();
    let mut cos_table = vec![0.0f32; n_bins * N_FFT];
    let mut sin_table = vec![0.0f32; n_bins * N_FFT];
    for k in 0..n_bins {
        for n in 0..N_FFT {
            let angle = 2.0 * std::f64::consts::PI * (k * n % N_FFT) as f64 / N_FFT as f64;
            cos_table[k * N_FFT + n] = angle.cos() as f32;
            sin_table[k * N_FFT + n] = angle.sin() as f32;
        }
    }

    let mut mel = vec![0.0f32; n_mels * N_FRAMES];
    let mut frame = vec![0.0f32; N_FFT];
    let mut power = vec![0.0f32; n_bins];

    for t in 0..N_FRAMES {
        let offset = t * HOP_LENGTH;
        for n in 0..N_FFT {
            frame[n] = padded[offset + n] * window[n];
        }
        // Padded tails of short clips are all zero
        if frame.iter().all(|v| *v == 0.0) {
            power.fill(0.0);
        } else {
            dft_power(&frame, &cos_table, &sin_table, &mut power);
        }
        for m in 0..n_mels {
            let row = &filters[m * n_bins..(m + 1) * n_bins];
            let energy: f32 = row.iter().zip(&power).map(|(w, p)| w * p).sum();
            mel[m * N_FRAMES + t] = energy.max(1e-10).log10();
        }
    }

    let max = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    for value in mel.iter_mut() {
        *value = (value.max(max - 8.0) + 4.0) / 4.0;
    }
    mel
}

fn dft_power(frame: &[f32], cos_table: &[f32], sin_table: &[f32], power: &mut [f32]) {
    let n_fft = frame.len();
    for (k, out) in power.iter_mut().enumerate() {
        let cos_row = &cos_table[k * n_fft..(k + 1) * n_fft];
        let sin_row = &sin_table[k * n_fft..(k + 1) * n_fft];
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for n in 0..n_fft {
            re += frame[n] * cos_row[n];
            im -= frame[n] * sin_row[n];
        }
        *out = re * re + im * im;
    }
}

//! # Audio Service
//!
//! Speech-to-text and speech translation for uploaded audio files.
//!
//! ## Request Flow:
//! 1. Check the upload (type, size) and the requested language
//! 2. Decode to mono `f32` samples and resample to 16 kHz
//! 3. Run the speech recognizer on tokio's blocking pool
//! 4. Clean up the text and derive word/sentence counts and speaking rate
//! 5. Optionally attach level, peak and silence analysis
//!
//! ## Supported encodings:
//! WAV (8/16/24-bit PCM and 32-bit float) through the `wav` crate, and raw
//! little-endian 16-bit PCM at 16 kHz mono (`audio/pcm`, `audio/l16`).
//! Other encodings on the allowed list are accepted at upload and then
//! fail to decode with a message naming the encoding.

use crate::batch::{run_batch, BatchError, BatchOutcome, MetricExtractor, Metrics, Quantity, Ratio, WorkUnit};
use crate::config::LimitsConfig;
use crate::models::whisper::{self, is_supported_language};
use crate::models::{ModelKind, ModelLoader, ProviderInfo, SpeechTask, TranscribeOptions, TranscriptSegment};
use crate::services::health::run_check;
use crate::services::{round2, run_blocking, unavailable, FileUpload, InputError, ServiceHealth, ServiceStats};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

const TARGET_SAMPLE_RATE: u32 = whisper::SAMPLE_RATE as u32;

/// Frames quieter than this count as silence.
const SILENCE_THRESHOLD_DBFS: f64 = -40.0;

/// Silence shorter than this is treated as part of speech.
const MIN_SILENCE_MS: usize = 500;

/// Analysis frame length.
const FRAME_MS: usize = 10;

const RAW_PCM_TYPES: &[&str] = &["audio/pcm", "audio/l16"];
const WAV_TYPES: &[&str] = &["audio/wav", "audio/x-wav", "audio/wave", "audio/vnd.wave"];

/// Decoded audio, ready for the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples at 16 kHz in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / TARGET_SAMPLE_RATE as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioAnalysis {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub file_size_bytes: usize,
    pub rms_level: f64,
    pub peak_amplitude: f64,
    pub dynamic_range: f64,
    pub silence_ratio: f64,
    pub estimated_speech_duration: f64,
}

/// Cleaned transcription text with basic counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedTranscription {
    pub text: String,
    pub original_text: String,
    pub word_count: usize,
    pub character_count: usize,
    pub sentence_count: usize,
    pub sentences: Vec<String>,
    pub estimated_wpm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    #[serde(flatten)]
    pub transcription: ProcessedTranscription,
    pub language_detected: Option<String>,
    pub language_requested: Option<String>,
    pub task: SpeechTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub chunk_length: usize,
    pub audio_duration_seconds: f64,
    pub processing_time_seconds: f64,
    pub real_time_factor: f64,
    /// Empty unless timestamps were requested
    pub segments: Vec<TranscriptSegment>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_analysis: Option<AudioAnalysis>,
}

/// What an uploaded audio file turned out to be.
///
/// Every allowed type passes the upload check, but only WAV and raw PCM can
/// be decoded here. For anything else `decodable` is false and the format
/// fields are empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioUploadInfo {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: usize,
    pub decodable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeParams {
    pub language: Option<String>,
    pub task: SpeechTask,
    pub include_analysis: bool,
    /// Window length in seconds, clamped to 1..=30
    pub chunk_length: usize,
    pub return_timestamps: bool,
}

impl Default for TranscribeParams {
    fn default() -> Self {
        Self {
            language: None,
            task: SpeechTask::Transcribe,
            include_analysis: false,
            chunk_length: whisper::CHUNK_LENGTH,
            return_timestamps: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportedLanguage {
    pub code: &'static str,
    pub name: &'static str,
    pub native_name: &'static str,
}

/// Languages accepted in the `language` field.
pub fn get_supported_languages() -> Vec<SupportedLanguage> {
    whisper::LANGUAGES
        .iter()
        .map(|&(code, name, native_name)| SupportedLanguage { code, name, native_name })
        .collect()
}

/// Batch metrics: audio and word totals plus the batch real-time factor.
pub struct TranscriptionMetrics;

impl MetricExtractor<TranscriptionResult> for TranscriptionMetrics {
    fn extract(&self, output: &TranscriptionResult) -> Metrics {
        Metrics::from([
            ("audio_duration_seconds".to_string(), output.audio_duration_seconds),
            ("words".to_string(), output.transcription.word_count as f64),
        ])
    }

    fn metric_names(&self) -> Vec<&'static str> {
        vec!["audio_duration_seconds", "words"]
    }

    fn ratios(&self) -> Vec<Ratio> {
        vec![
            Ratio::new("real_time_factor", Quantity::Duration, Quantity::Sum("audio_duration_seconds")),
            Ratio::new("throughput_files_per_second", Quantity::Total, Quantity::Duration),
        ]
    }
}

pub struct AudioService {
    loader: Arc<ModelLoader>,
    stats: ServiceStats,
}

impl AudioService {
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
        self.loader.recognizer().await.map(|p| p.info())
    }

    pub fn get_supported_languages(&self) -> Vec<SupportedLanguage> {
        get_supported_languages()
    }

    /// Transcribe (or translate) one uploaded file.
    pub async fn enhanced_transcription(
        &self,
        upload: FileUpload,
        params: &TranscribeParams,
        limits: &LimitsConfig,
    ) -> Result<TranscriptionResult> {
        let timer = self.stats.start();
        upload.check(&limits.allowed_audio_types, limits.max_file_size, "audio")?;
        if let Some(code) = params.language.as_deref() {
            if !is_supported_language(code) {
                return Err(InputError::Invalid(format!("Unsupported language '{}'", code)).into());
            }
        }

        let provider = self
            .loader
            .recognizer()
            .await
            .ok_or_else(|| unavailable(ModelKind::AudioAsr))?;

        let chunk_length = params.chunk_length.clamp(1, whisper::CHUNK_LENGTH);
        let options = TranscribeOptions {
            language: params.language.clone(),
            task: params.task,
            chunk_seconds: chunk_length,
        };
        let include_analysis = params.include_analysis;
        let file_size = upload.data.len();
        let mime = upload.mime();
        let FileUpload { filename, data, .. } = upload;

        let (transcript, duration, analysis) = run_blocking(move || {
            let audio = decode_audio(&data, mime.as_deref())?;
            let analysis = include_analysis.then(|| analyze_audio_properties(&audio, file_size));
            let transcript = provider.transcribe(&audio.samples, &options)?;
            Ok((transcript, audio.duration_seconds(), analysis))
        })
        .await?;

        let transcription = postprocess_transcription(&transcript.text, duration);
        let processing_time_seconds = timer.success((duration * 1000.0).round() as u64);
        let real_time_factor = crate::batch::safe_ratio(processing_time_seconds, duration);
        info!(
            task = ?params.task,
            audio_seconds = duration,
            seconds = processing_time_seconds,
            real_time_factor,
            "Transcription completed"
        );

        Ok(TranscriptionResult {
            transcription,
            language_detected: transcript.language,
            language_requested: params.language.clone(),
            task: params.task,
            filename,
            chunk_length,
            audio_duration_seconds: duration,
            processing_time_seconds,
            real_time_factor,
            segments: if params.return_timestamps { transcript.segments } else { Vec::new() },
            timestamp: Utc::now(),
            audio_analysis: analysis,
        })
    }

    /// Check an upload and report its format without transcribing it.
    pub async fn inspect_upload(&self, upload: FileUpload, limits: &LimitsConfig) -> Result<AudioUploadInfo> {
        upload.check(&limits.allowed_audio_types, limits.max_file_size, "audio")?;
        let content_type = upload.mime();
        let size_bytes = upload.data.len();
        let FileUpload { filename, data, .. } = upload;

        let mime = content_type.clone();
        let decoded = run_blocking(move || Ok(decode_audio(&data, mime.as_deref()))).await?;
        info!(?filename, size_bytes, decodable = decoded.is_ok(), "Audio upload validated");

        let info = AudioUploadInfo {
            filename,
            content_type,
            size_bytes,
            decodable: decoded.is_ok(),
            duration_seconds: None,
            sample_rate: None,
            channels: None,
            decode_error: None,
            message: "Audio file uploaded and validated successfully".to_string(),
        };
        Ok(match decoded {
            Ok(audio) => AudioUploadInfo {
                duration_seconds: Some(round2(audio.duration_seconds())),
                sample_rate: Some(audio.source_sample_rate),
                channels: Some(audio.channels),
                ..info
            },
            Err(e) => AudioUploadInfo { decode_error: Some(format!("{:#}", e)), ..info },
        })
    }

    /// Transcribe one second of silence in English.
    pub async fn health_check(&self) -> ServiceHealth {
        let check = self.loader.recognizer().await.map(|provider| {
            move || {
                let silence = vec![0.0f32; whisper::SAMPLE_RATE];
                let options = TranscribeOptions {
                    language: Some("en".to_string()),
                    task: SpeechTask::Transcribe,
                    chunk_seconds: whisper::CHUNK_LENGTH,
                };
                provider.transcribe(&silence, &options).map(|t| t.text.chars().count())
            }
        });
        run_check(ModelKind::AudioAsr, check).await
    }

    /// Transcribe many files with at most `max_concurrency` in flight.
    pub async fn batch_transcribe(
        &self,
        uploads: Vec<FileUpload>,
        params: &TranscribeParams,
        limits: &LimitsConfig,
        max_concurrency: usize,
    ) -> Result<BatchOutcome<TranscriptionResult>, BatchError> {
        debug!(files = uploads.len(), task = ?params.task, "Batch transcription requested");
        let units = WorkUnit::from_payloads(uploads, params);
        let run = run_batch(
            units,
            |upload: FileUpload, params: TranscribeParams| async move {
                self.enhanced_transcription(upload, &params, limits).await
            },
            max_concurrency,
        )
        .await?;
        Ok(run.into_outcome(&TranscriptionMetrics))
    }
}

/// Decode an upload into 16 kHz mono samples.
pub fn decode_audio(data: &[u8], content_type: Option<&str>) -> Result<DecodedAudio> {
    let content_type = content_type.unwrap_or_default();
    if RAW_PCM_TYPES.contains(&content_type) {
        return decode_pcm16(data);
    }
    if WAV_TYPES.contains(&content_type) || data.starts_with(b"RIFF") {
        return decode_wav(data);
    }
    Err(InputError::Invalid(format!(
        "Cannot decode '{}' audio; upload WAV or raw 16-bit PCM",
        content_type
    ))
    .into())
}

/// Raw little-endian 16-bit PCM, 16 kHz mono.
fn decode_pcm16(data: &[u8]) -> Result<DecodedAudio> {
    if data.len() % 2 != 0 {
        return Err(InputError::Invalid("PCM data length must be even for 16-bit samples".to_string()).into());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    Ok(DecodedAudio {
        samples,
        source_sample_rate: TARGET_SAMPLE_RATE,
        channels: 1,
        bit_depth: 16,
    })
}

fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let (header, track) = wav::read(&mut Cursor::new(data))
        .map_err(|e| InputError::Invalid(format!("Invalid WAV data: {}", e)))
        .context("Failed to decode audio")?;

    let interleaved: Vec<f32> = match track {
        wav::BitDepth::Eight(s) => s.iter().map(|&x| (x as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(s) => s.iter().map(|&x| x as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(s) => s.iter().map(|&x| x as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(s) => s,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1);
    if header.sampling_rate == 0 {
        return Err(InputError::Invalid("WAV header reports a sample rate of 0".to_string()).into());
    }

    let mono = downmix(&interleaved, channels as usize);
    Ok(DecodedAudio {
        samples: resample_linear(&mono, header.sampling_rate, TARGET_SAMPLE_RATE),
        source_sample_rate: header.sampling_rate,
        channels,
        bit_depth: header.bits_per_sample,
    })
}

/// Average interleaved channels into one.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let step = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / step).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let frac = (position - index as f64) as f32;
            samples[index] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Levels and silence of decoded audio.
pub fn analyze_audio_properties(audio: &DecodedAudio, file_size_bytes: usize) -> AudioAnalysis {
    let samples = &audio.samples;
    let duration_seconds = audio.duration_seconds();

    let rms = if samples.is_empty() {
        0.0
    } else {
        (samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64).sqrt()
    };
    let peak = samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs())) as f64;
    let (min, max) = samples
        .iter()
        .fold((0.0f32, 0.0f32), |(lo, hi), &s| (lo.min(s), hi.max(s)));

    let silence_ratio = silence_ratio(samples, TARGET_SAMPLE_RATE as usize);

    AudioAnalysis {
        duration_seconds: round2(duration_seconds),
        sample_rate: audio.source_sample_rate,
        channels: audio.channels,
        bit_depth: audio.bit_depth,
        file_size_bytes,
        rms_level: (rms * 10_000.0).round() / 10_000.0,
        peak_amplitude: (peak * 10_000.0).round() / 10_000.0,
        dynamic_range: ((max - min) as f64 * 10_000.0).round() / 10_000.0,
        silence_ratio: (silence_ratio * 1000.0).round() / 1000.0,
        estimated_speech_duration: round2(duration_seconds * (1.0 - silence_ratio)),
    }
}

/// Share of frames inside silent runs of at least 500 ms.
pub fn silence_ratio(samples: &[f32], sample_rate: usize) -> f64 {
    let frame_len = (sample_rate * FRAME_MS / 1000).max(1);
    let min_run = MIN_SILENCE_MS / FRAME_MS;

    let silent: Vec<bool> = samples
        .chunks(frame_len)
        .map(|frame| {
            let rms = (frame.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / frame.len() as f64).sqrt();
            rms == 0.0 || 20.0 * rms.log10() < SILENCE_THRESHOLD_DBFS
        })
        .collect();
    if silent.is_empty() {
        return 0.0;
    }

    let mut silent_frames = 0;
    let mut run = 0;
    for &is_silent in silent.iter().chain(std::iter::once(&false)) {
        if is_silent {
            run += 1;
        } else {
            if run >= min_run {
                silent_frames += run;
            }
            run = 0;
        }
    }
    silent_frames as f64 / silent.len() as f64
}

/// Normalize whitespace and derive counts and speaking rate.
pub fn postprocess_transcription(text: &str, duration_seconds: f64) -> ProcessedTranscription {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let sentences: Vec<String> = cleaned
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let word_count = cleaned.split_whitespace().count();

    ProcessedTranscription {
        character_count: cleaned.chars().count(),
        sentence_count: sentences.len(),
        estimated_wpm: round2(crate::batch::safe_ratio(word_count as f64, duration_seconds / 60.0)),
        word_count,
        sentences,
        original_text: text.to_string(),
        text: cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::{SpeechRecognizer, Transcript};
    use byteorder::WriteBytesExt;
    use candle_core::Device;
    use std::io::Write;

    /// Reports how many seconds it heard; translation switches the language to English.
    struct FakeRecognizer;

    impl SpeechRecognizer for FakeRecognizer {
        fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
            let seconds = samples.len() / whisper::SAMPLE_RATE;
            let language = match options.task {
                SpeechTask::Translate => "en".to_string(),
                SpeechTask::Transcribe => options.language.clone().unwrap_or_else(|| "de".to_string()),
            };
            Ok(Transcript {
                text: format!("  heard   {} seconds.  done! ", seconds),
                language: Some(language),
                segments: vec![TranscriptSegment {
                    start_seconds: 0.0,
                    end_seconds: seconds as f64,
                    text: "heard".into(),
                }],
            })
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                kind: ModelKind::AudioAsr,
                model_id: "fake-whisper".into(),
                revision: "main".into(),
                backend: "test".into(),
                device: "cpu".into(),
                adapter: None,
                memory_bytes: 0,
            }
        }
    }

    /// 16-bit PCM WAV file bytes.
    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.write_all(b"RIFF").unwrap();
        out.write_u32::<LittleEndian>(36 + data_len).unwrap();
        out.write_all(b"WAVEfmt ").unwrap();
        out.write_u32::<LittleEndian>(16).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
        out.write_u16::<LittleEndian>(channels).unwrap();
        out.write_u32::<LittleEndian>(sample_rate).unwrap();
        out.write_u32::<LittleEndian>(sample_rate * channels as u32 * 2).unwrap();
        out.write_u16::<LittleEndian>(channels * 2).unwrap();
        out.write_u16::<LittleEndian>(16).unwrap();
        out.write_all(b"data").unwrap();
        out.write_u32::<LittleEndian>(data_len).unwrap();
        for &s in samples {
            out.write_i16::<LittleEndian>(s).unwrap();
        }
        out
    }

    fn tone(seconds: usize, sample_rate: usize) -> Vec<i16> {
        (0..seconds * sample_rate)
            .map(|i| ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32).sin() * 8000.0) as i16)
            .collect()
    }

    fn wav_upload(samples: &[i16], sample_rate: u32) -> FileUpload {
        FileUpload::new(Some("clip.wav".into()), Some("audio/wav".into()), wav_bytes(samples, sample_rate, 1))
    }

    async fn service() -> AudioService {
        let loader = Arc::new(ModelLoader::with_device(&AppConfig::default(), Device::Cpu));
        loader.install_recognizer(Arc::new(FakeRecognizer)).await;
        AudioService::new(loader)
    }

    fn limits() -> LimitsConfig {
        AppConfig::default().limits
    }

    #[test]
    fn test_decode_wav_resamples_and_downmixes() {
        let stereo: Vec<i16> = (0..8000).flat_map(|_| [16384i16, 0]).collect();
        let audio = decode_audio(&wav_bytes(&stereo, 8000, 2), Some("audio/wav")).unwrap();
        assert_eq!(audio.source_sample_rate, 8000);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.bit_depth, 16);
        assert_eq!(audio.samples.len(), 16_000);
        assert!((audio.samples[100] - 0.25).abs() < 1e-4);
        assert!((audio.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_raw_pcm() {
        let mut data = Vec::new();
        for s in [0i16, 16384, -32768] {
            data.write_i16::<LittleEndian>(s).unwrap();
        }
        let audio = decode_audio(&data, Some("audio/l16")).unwrap();
        assert_eq!(audio.samples, vec![0.0, 0.5, -1.0]);
        assert!(decode_audio(&data[..5], Some("audio/pcm")).is_err());
    }

    #[test]
    fn test_decode_rejects_unsupported_and_corrupt() {
        let err = decode_audio(b"ID3....", Some("audio/mp3")).unwrap_err();
        assert!(err.to_string().contains("Cannot decode 'audio/mp3'"));
        assert!(decode_audio(b"RIFF garbage", Some("audio/wav")).is_err());
    }

    #[test]
    fn test_resample_linear() {
        assert_eq!(resample_linear(&[0.0, 1.0], 16_000, 16_000), vec![0.0, 1.0]);
        assert_eq!(resample_linear(&[0.0, 1.0, 0.0, -1.0], 8_000, 16_000).len(), 8);
        assert_eq!(resample_linear(&[0.0, 1.0], 8_000, 16_000)[1], 0.5);
        assert!(resample_linear(&[], 8_000, 16_000).is_empty());
    }

    #[test]
    fn test_silence_ratio() {
        let rate = 16_000;
        let mut samples = vec![0.5f32; rate];
        samples.extend(vec![0.0f32; rate]);
        assert!((silence_ratio(&samples, rate) - 0.5).abs() < 1e-9);

        // 200 ms gaps are too short to count
        let mut choppy = Vec::new();
        for _ in 0..5 {
            choppy.extend(vec![0.5f32; rate / 5]);
            choppy.extend(vec![0.0f32; rate / 5]);
        }
        assert_eq!(silence_ratio(&choppy, rate), 0.0);
        assert_eq!(silence_ratio(&[], rate), 0.0);
    }

    #[test]
    fn test_analyze_audio_properties() {
        let audio = DecodedAudio {
            samples: [vec![0.5f32; 16_000], vec![0.0f32; 16_000]].concat(),
            source_sample_rate: 44_100,
            channels: 2,
            bit_depth: 16,
        };
        let analysis = analyze_audio_properties(&audio, 1234);
        assert_eq!(analysis.duration_seconds, 2.0);
        assert_eq!(analysis.peak_amplitude, 0.5);
        assert_eq!(analysis.dynamic_range, 0.5);
        assert_eq!(analysis.silence_ratio, 0.5);
        assert_eq!(analysis.estimated_speech_duration, 1.0);
        assert_eq!(analysis.sample_rate, 44_100);
        assert_eq!(analysis.file_size_bytes, 1234);
    }

    #[test]
    fn test_postprocess_transcription() {
        let processed = postprocess_transcription("  Hello   there. How are you?  ", 30.0);
        assert_eq!(processed.text, "Hello there. How are you?");
        assert_eq!(processed.word_count, 5);
        assert_eq!(processed.sentences, vec!["Hello there", "How are you"]);
        assert_eq!(processed.estimated_wpm, 10.0);
        assert_eq!(postprocess_transcription("words", 0.0).estimated_wpm, 0.0);
    }

    #[test]
    fn test_supported_languages() {
        let languages = get_supported_languages();
        assert_eq!(languages.len(), 15);
        assert_eq!(languages[0], SupportedLanguage { code: "en", name: "English", native_name: "English" });
        assert!(languages.iter().any(|l| l.code == "tr"));
    }

    #[tokio::test]
    async fn test_enhanced_transcription() {
        let service = service().await;
        let params = TranscribeParams {
            include_analysis: true,
            return_timestamps: true,
            chunk_length: 90,
            ..Default::default()
        };

        let result = service
            .enhanced_transcription(wav_upload(&tone(2, 16_000), 16_000), &params, &limits())
            .await
            .unwrap();
        assert_eq!(result.transcription.text, "heard 2 seconds. done!");
        assert_eq!(result.transcription.sentence_count, 2);
        assert_eq!(result.language_detected.as_deref(), Some("de"));
        assert_eq!(result.audio_duration_seconds, 2.0);
        assert_eq!(result.chunk_length, 30);
        assert_eq!(result.segments.len(), 1);
        assert!(result.audio_analysis.is_some());
        assert_eq!(service.stats().snapshot().total_input_units, 2000);
    }

    #[tokio::test]
    async fn test_translation_and_language_checks() {
        let service = service().await;
        let translate = TranscribeParams { task: SpeechTask::Translate, ..Default::default() };
        let result = service
            .enhanced_transcription(wav_upload(&tone(1, 16_000), 16_000), &translate, &limits())
            .await
            .unwrap();
        assert_eq!(result.language_detected.as_deref(), Some("en"));
        assert!(result.segments.is_empty());

        let klingon = TranscribeParams { language: Some("tlh".into()), ..Default::default() };
        let err = service
            .enhanced_transcription(wav_upload(&tone(1, 16_000), 16_000), &klingon, &limits())
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::Invalid("Unsupported language 'tlh'".into())));
    }

    #[tokio::test]
    async fn test_batch_with_corrupt_audio() {
        let service = service().await;
        let uploads = vec![
            wav_upload(&tone(1, 16_000), 16_000),
            FileUpload::new(Some("broken.wav".into()), Some("audio/wav".into()), b"RIFF\x00\x00not really".to_vec()),
            wav_upload(&tone(3, 8_000), 8_000),
        ];

        let outcome = service
            .batch_transcribe(uploads, &TranscribeParams::default(), &limits(), 2)
            .await
            .unwrap();
        assert_eq!(outcome.statistics.total, 3);
        assert_eq!(outcome.statistics.successful, 2);
        assert_eq!(outcome.failed_indices(), vec![1]);
        assert!(outcome.results[1].error_message().unwrap().contains("Failed to decode audio"));

        let domain = &outcome.statistics.domain;
        assert_eq!(domain["total_audio_duration_seconds"], 4.0);
        assert_eq!(domain["total_words"], 8.0);
        let expected = outcome.statistics.total_processing_time_seconds / 4.0;
        assert!((domain["real_time_factor"] - expected).abs() < 1e-9);
        assert!(domain.contains_key("throughput_files_per_second"));
    }

    #[tokio::test]
    async fn test_batch_duration_totals_are_not_rounded_per_item() {
        let service = service().await;
        // 5000 samples at 16 kHz is 0.3125 s, which rounds to 0.31 at two decimals
        let uploads = vec![wav_upload(&[1000; 5000], 16_000), wav_upload(&[1000; 5000], 16_000)];

        let outcome = service
            .batch_transcribe(uploads, &TranscribeParams::default(), &limits(), 2)
            .await
            .unwrap();
        let domain = &outcome.statistics.domain;
        assert_eq!(domain["total_audio_duration_seconds"], 0.625);
        assert_eq!(domain["average_audio_duration_seconds"], 0.3125);
        let expected = outcome.statistics.total_processing_time_seconds / 0.625;
        assert!((domain["real_time_factor"] - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_inspect_upload() {
        let service = service().await;
        let info = service
            .inspect_upload(wav_upload(&tone(2, 8_000), 8_000), &limits())
            .await
            .unwrap();
        assert!(info.decodable);
        assert_eq!(info.duration_seconds, Some(2.0));
        assert_eq!(info.sample_rate, Some(8_000));
        assert_eq!(info.channels, Some(1));
        assert_eq!(service.stats().snapshot().total_requests, 0);

        let mp3 = FileUpload::new(Some("song.mp3".into()), Some("audio/mp3".into()), b"ID3 frames".to_vec());
        let info = service.inspect_upload(mp3, &limits()).await.unwrap();
        assert!(!info.decodable);
        assert!(info.decode_error.is_some_and(|e| e.contains("Cannot decode")));

        let text = FileUpload::new(None, Some("text/plain".into()), b"hello".to_vec());
        assert!(service.inspect_upload(text, &limits()).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        let health = service().await.health_check().await;
        assert!(health.is_healthy());
        // "  heard   1 seconds.  done! "
        assert_eq!(health.test_output_length, Some(28));
    }
}

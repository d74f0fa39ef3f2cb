//! # Processing Services
//!
//! One service per domain. Each turns a request into provider calls, adds
//! pre/postprocessing and analysis, keeps cross-request statistics, and runs
//! batches through the shared [`crate::batch`] runner.
//!
//! ## Module Organization:
//! - **text**: summarization plus readability and key-phrase analysis
//! - **image**: captioning plus image property analysis
//! - **audio**: decoding, transcription/translation, audio analysis
//! - **stats**: atomic per-service counters
//! - **health**: smoke inference against each loaded provider

pub mod audio;
pub mod health;
pub mod image;
pub mod stats;
pub mod text;

use crate::models::{ModelKind, ModelUnavailable};
use std::fmt;

pub use health::ServiceHealth;
pub use stats::ServiceStats;

/// A request input the service refuses to process.
///
/// Carried inside `anyhow::Error` so the HTTP layer can map it to 400/413,
/// while inside a batch it simply becomes the item's failure message.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    Invalid(String),
    TooLarge(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Invalid(msg) => f.write_str(msg),
            InputError::TooLarge(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for InputError {}

/// One uploaded file, as read from a multipart field.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FileUpload {
    pub fn new(filename: Option<String>, content_type: Option<String>, data: Vec<u8>) -> Self {
        Self { filename, content_type, data }
    }

    /// Declared MIME type, lowercased, without parameters such as `; rate=16000`.
    pub fn mime(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_lowercase())
            .filter(|ct| !ct.is_empty())
    }

    /// Content type and size checks, done before any decoding.
    pub fn check(&self, allowed: &[String], max_file_size: usize, what: &str) -> Result<(), InputError> {
        let mime = self.mime().unwrap_or_else(|| "application/octet-stream".to_string());
        if !allowed.iter().any(|t| t.eq_ignore_ascii_case(&mime)) {
            return Err(InputError::Invalid(format!(
                "Unsupported {} type '{}'. Allowed types: {}",
                what,
                mime,
                allowed.join(", ")
            )));
        }
        if self.data.is_empty() {
            return Err(InputError::Invalid(format!("Uploaded {} file is empty", what)));
        }
        if self.data.len() > max_file_size {
            return Err(InputError::TooLarge(format!(
                "{} file exceeds the maximum file size of {} bytes",
                text::capitalize_first(what),
                max_file_size
            )));
        }
        Ok(())
    }
}

/// Check a request's LoRA selection against the adapter merged at load time.
pub fn check_adapter(
    kind: ModelKind,
    use_lora: bool,
    requested: Option<&str>,
    loaded: Option<&str>,
) -> Result<Option<String>, InputError> {
    if !use_lora {
        return Ok(None);
    }
    match (requested, loaded) {
        (_, None) => Err(InputError::Invalid(format!("No LoRA adapter is loaded for {}", kind))),
        (Some(requested), Some(loaded)) if requested != loaded => Err(InputError::Invalid(format!(
            "LoRA adapter '{}' is not loaded for {} (loaded: '{}')",
            requested, kind, loaded
        ))),
        (_, Some(loaded)) => Ok(Some(loaded.to_string())),
    }
}

/// Run blocking inference on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("Inference task failed: {}", e))?
}

pub(crate) fn unavailable(kind: ModelKind) -> anyhow::Error {
    anyhow::Error::new(ModelUnavailable(kind))
}

/// Round to two decimals for reporting.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_adapter() {
        let kind = ModelKind::TextSummarizer;
        assert_eq!(check_adapter(kind, false, Some("x"), None), Ok(None));
        assert_eq!(check_adapter(kind, true, None, Some("news")), Ok(Some("news".into())));
        assert_eq!(check_adapter(kind, true, Some("news"), Some("news")), Ok(Some("news".into())));
        assert!(check_adapter(kind, true, None, None).is_err());

        let err = check_adapter(kind, true, Some("legal"), Some("news")).unwrap_err();
        assert!(err.to_string().contains("'legal' is not loaded"));
    }

    #[tokio::test]
    async fn test_run_blocking_propagates_errors() {
        assert_eq!(run_blocking(|| Ok(2 + 2)).await.unwrap(), 4);
        let err = run_blocking::<(), _>(|| Err(anyhow::anyhow!("boom"))).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_upload_checks() {
        let allowed = vec!["audio/wav".to_string()];
        let upload = FileUpload::new(None, Some("Audio/WAV; codecs=1".into()), vec![0; 4]);
        assert_eq!(upload.mime().as_deref(), Some("audio/wav"));
        assert!(upload.check(&allowed, 10, "audio").is_ok());
        assert!(matches!(upload.check(&allowed, 2, "audio"), Err(InputError::TooLarge(_))));

        let untyped = FileUpload::new(None, None, vec![0; 4]);
        let err = untyped.check(&allowed, 10, "audio").unwrap_err();
        assert!(err.to_string().contains("application/octet-stream"));

        let empty = FileUpload::new(None, Some("audio/wav".into()), Vec::new());
        assert!(empty.check(&allowed, 10, "audio").is_err());
    }

    #[test]
    fn test_unavailable_downcasts() {
        let err = unavailable(ModelKind::ImageCaptioner);
        assert_eq!(err.downcast_ref::<ModelUnavailable>(), Some(&ModelUnavailable(ModelKind::ImageCaptioner)));
    }
}

//! # Multipart Form Reading
//!
//! Image and audio endpoints take `multipart/form-data`: one or more file
//! parts plus plain text fields for the options. This module collects the
//! whole form into a [`MultipartForm`] and gives the handlers typed access to
//! the text fields.
//!
//! ## Key Rust Concepts:
//! - **Streams**: `Multipart` is a `Stream` of fields and each field is a
//!   `Stream` of byte chunks, consumed with `StreamExt::next()`
//! - **Bounded buffering**: a file part stops being buffered one byte past
//!   the size limit. The rest is drained and the upload's own size check
//!   reports it, so in a batch only that item fails. The number of file
//!   parts and text fields is capped too, and the read stops at the first
//!   part over either cap
//! - **FromStr**: option fields are parsed with `str::parse::<T>()`

use crate::error::{AppError, AppResult};
use crate::services::FileUpload;
use actix_multipart::{Field, Multipart};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Text fields longer than this are rejected.
const MAX_TEXT_FIELD_BYTES: usize = 16 * 1024;

/// Option fields per form. The upload routes take at most eight.
const MAX_TEXT_FIELDS: usize = 32;

#[derive(Debug, Default)]
pub struct MultipartForm {
    /// File parts in upload order
    pub files: Vec<FileUpload>,
    fields: HashMap<String, String>,
}

/// Read every part of a form.
///
/// Parts named in `file_fields` are collected as files, everything else as
/// text. The read ends early with a 400 on the file part after `max_files`
/// or on too many text fields, and with a 413 on an oversized text field.
pub async fn read_multipart(
    mut payload: Multipart,
    file_fields: &[&str],
    max_files: usize,
    max_file_size: usize,
) -> AppResult<MultipartForm> {
    let mut form = MultipartForm::default();
    let mut text_fields = 0usize;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
        let name = disposition.get_name().unwrap_or_default().to_string();
        let filename = disposition.get_filename().map(|f| f.to_string());

        if file_fields.contains(&name.as_str()) {
            if form.files.len() >= max_files {
                return Err(AppError::ValidationError(format!(
                    "Too many '{}' parts, the maximum is {}",
                    name, max_files
                )));
            }
            let content_type = field.content_type().map(|m| m.essence_str().to_string());
            let label = filename.clone().unwrap_or_else(|| name.clone());
            let data = read_file_field(&mut field, max_file_size, &label).await?;
            form.files.push(FileUpload::new(filename, content_type, data));
        } else {
            text_fields += 1;
            if text_fields > MAX_TEXT_FIELDS {
                return Err(AppError::ValidationError(format!(
                    "Too many form fields, the maximum is {}",
                    MAX_TEXT_FIELDS
                )));
            }
            let data = read_field(&mut field, MAX_TEXT_FIELD_BYTES, &name).await?;
            let value = String::from_utf8(data)
                .map_err(|_| AppError::BadRequest(format!("Field '{}' is not valid UTF-8", name)))?;
            form.fields.insert(name, value.trim().to_string());
        }
    }

    Ok(form)
}

/// Keep at most `limit + 1` bytes of a file part, enough for
/// `FileUpload::check` to see that it is too large.
async fn read_file_field(field: &mut Field, limit: usize, label: &str) -> AppResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Error reading '{}': {}", label, e)))?;
        let room = (limit + 1).saturating_sub(data.len());
        data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(data)
}

async fn read_field(field: &mut Field, limit: usize, label: &str) -> AppResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Error reading '{}': {}", label, e)))?;
        if data.len() + chunk.len() > limit {
            return Err(AppError::PayloadTooLarge(format!(
                "'{}' exceeds the maximum size of {} bytes",
                label, limit
            )));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

impl MultipartForm {
    /// Non-empty text value of a field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// Parse a field, or fall back to `default` when it is absent.
    pub fn parse_or<T>(&self, name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.text(name) {
            Some(raw) => raw
                .parse()
                .map_err(|e| AppError::ValidationError(format!("Invalid value for '{}': {}", name, e))),
            None => Ok(default),
        }
    }

    /// Parse a numeric field and check it against `range`.
    pub fn number_in(&self, name: &str, default: usize, range: RangeInclusive<usize>) -> AppResult<usize> {
        let value = self.parse_or(name, default)?;
        check_range(name, value, &range)?;
        Ok(value)
    }

    /// Boolean field. Accepts true/false, 1/0, yes/no and on/off.
    pub fn flag(&self, name: &str, default: bool) -> AppResult<bool> {
        match self.text(name).map(|s| s.to_lowercase()) {
            None => Ok(default),
            Some(value) => match value.as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(AppError::ValidationError(format!(
                    "Invalid value for '{}': expected true or false",
                    name
                ))),
            },
        }
    }

    /// The single uploaded file, for endpoints that take exactly one.
    pub fn single_file(&mut self, field: &str) -> AppResult<FileUpload> {
        match self.files.len() {
            0 => Err(AppError::ValidationError(format!("No '{}' part in the upload", field))),
            1 => Ok(self.files.remove(0)),
            n => Err(AppError::ValidationError(format!(
                "Expected one '{}' part, received {}",
                field, n
            ))),
        }
    }
}

/// Range check shared by JSON and multipart handlers.
pub fn check_range(name: &str, value: usize, range: &RangeInclusive<usize>) -> AppResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(AppError::ValidationError(format!(
            "{} must be between {} and {}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{multipart_body, Part, BOUNDARY};
    use actix_web::error::PayloadError;
    use actix_web::http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use actix_web::web::Bytes;
    use futures_util::stream;

    fn form(fields: &[(&str, &str)]) -> MultipartForm {
        MultipartForm {
            files: Vec::new(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_typed_fields() {
        let form = form(&[("max_length", "40"), ("include_analysis", "Yes"), ("language", "")]);
        assert_eq!(form.number_in("max_length", 50, 5..=100).unwrap(), 40);
        assert_eq!(form.number_in("min_length", 10, 1..=50).unwrap(), 10);
        assert!(form.flag("include_analysis", false).unwrap());
        assert!(!form.flag("use_lora", false).unwrap());
        assert_eq!(form.text("language"), None);
    }

    #[test]
    fn test_bad_fields_are_rejected() {
        let form = form(&[("max_length", "400"), ("min_length", "ten"), ("enhance", "maybe")]);
        assert!(matches!(
            form.number_in("max_length", 50, 5..=100),
            Err(AppError::ValidationError(_))
        ));
        assert!(form.number_in("min_length", 10, 1..=50).is_err());
        assert!(form.flag("enhance", true).is_err());
    }

    /// A multipart stream that delivers `parts` without the closing
    /// boundary and then fails, so reading past the last part is an error.
    fn truncated_payload(parts: Vec<Part<'_>>) -> Multipart {
        let (content_type, mut body) = multipart_body(parts);
        let closing = format!("--{}--\r\n", BOUNDARY);
        body.truncate(body.len() - closing.len());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
        let chunks: Vec<Result<Bytes, PayloadError>> = vec![Ok(Bytes::from(body)), Err(PayloadError::Incomplete(None))];
        Multipart::new(&headers, stream::iter(chunks))
    }

    fn file_part(name: &str) -> Part<'_> {
        Part::File { name, filename: "a.bin", content_type: "application/octet-stream", data: vec![7; 64] }
    }

    #[actix_web::test]
    async fn test_stops_at_the_first_file_over_the_cap() {
        let parts = || vec![file_part("files"), file_part("files"), file_part("files")];

        let err = read_multipart(truncated_payload(parts()), &["files"], 2, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(ref m) if m.contains("maximum is 2")));

        // With room for all three the reader goes on to the broken tail
        let err = read_multipart(truncated_payload(parts()), &["files"], 3, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[actix_web::test]
    async fn test_too_many_text_fields() {
        let names: Vec<String> = (0..=MAX_TEXT_FIELDS).map(|i| format!("option_{}", i)).collect();
        let parts = names.iter().map(|n| Part::Text(n, "1")).collect();

        let err = read_multipart(truncated_payload(parts), &["file"], 1, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(ref m) if m.contains("Too many form fields")));
    }

    #[actix_web::test]
    async fn test_oversized_file_is_kept_one_byte_past_the_limit() {
        let (content_type, body) = multipart_body(vec![file_part("file"), Part::Text("detail_level", "basic")]);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
        let chunks: Vec<Result<Bytes, PayloadError>> = vec![Ok(Bytes::from(body))];

        let form = read_multipart(Multipart::new(&headers, stream::iter(chunks)), &["file"], 1, 10).await.unwrap();
        assert_eq!(form.files[0].data.len(), 11);
        assert_eq!(form.text("detail_level"), Some("basic"));
    }

    #[test]
    fn test_single_file() {
        let mut empty = form(&[]);
        assert!(empty.single_file("file").is_err());

        let mut one = form(&[]);
        one.files.push(FileUpload::new(None, None, vec![1]));
        assert_eq!(one.single_file("file").unwrap().data, vec![1]);
    }
}

//! # Error Handling
//! 
//! This module defines custom error types and how they're converted to HTTP responses.
//! This is a great example of Rust's powerful error handling system.
//! 
//! ## Key Rust Concepts for Error Handling:
//! 
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//! 
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of error
//! - **Data**: Each variant can hold additional information (String, numbers, etc.)
//! - **Pattern matching**: Use `match` to handle different error types
//! 
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//! 
//! ## Two layers of errors:
//! - **Plumbing** (model loading, decoding, inference) uses `anyhow::Result`
//!   with `.context(...)` so failures carry a readable chain
//! - **HTTP boundary** uses `AppError`, which knows its status code
//!
//! Batch items never surface here: a failing item is data inside a 200
//! response, not an `AppError`.

use crate::batch::BatchError;                  // Batch construction errors
use crate::models::ModelUnavailable;           // Provider not loaded
use crate::services::InputError;               // Rejected request input
use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
/// 
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds an error message
/// - **#[derive(Debug)]**: Automatically implements debug printing
/// 
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **PayloadTooLarge**: Upload exceeds the configured size limit (413 errors)
/// - **ServiceUnavailable**: The model behind an endpoint is not loaded (503 errors)
/// 
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (database failures, memory issues, etc.)
    Internal(String),
    
    /// Client sent invalid or malformed data
    BadRequest(String),
    
    /// Requested resource was not found
    NotFound(String),
    
    /// Configuration file or environment variable problems
    ConfigError(String),
    
    /// User input failed validation rules
    ValidationError(String),

    /// Uploaded file is larger than `limits.max_file_size`
    PayloadTooLarge(String),

    /// Required model is not loaded (still loading, failed, or unloaded)
    ServiceUnavailable(String),
}

/// Implementation of the Display trait for AppError.
/// 
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when you print an error or convert it to a string.
/// 
/// ## Rust Concepts:
/// - **impl Trait for Type**: Implementing a trait for our custom type
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings (like printf in C)
/// - **&self**: Immutable reference to the error
/// 
/// ## Trait Requirements:
/// The Display trait requires one method: `fmt`. This method writes
/// the formatted error message to a formatter.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
/// 
/// ## Purpose:
/// This trait converts our custom errors into HTTP responses that clients can understand.
/// It automatically handles the conversion when an error is returned from a handler.
/// 
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - PayloadTooLarge → 413 (Payload Too Large)
/// - ServiceUnavailable → 503 (Service Unavailable)
/// 
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Batch size 80 exceeds maximum of 50",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
/// 
/// ## Rust Concepts:
/// - **Tuple destructuring**: `let (a, b, c) = tuple`
/// - **json! macro**: Creates JSON values easily
/// - **StatusCode enum**: HTTP status codes as type-safe values
/// - **.clone()**: Creates a copy of the error message string
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
            AppError::PayloadTooLarge(msg) => (
                actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,  // 413
                "payload_too_large",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "service_unavailable",
                msg.clone(),
            ),
        };

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
/// 
/// ## Purpose:
/// Services report everything through `anyhow::Error`. Two error types
/// inside the chain decide the status code:
/// - `ModelUnavailable` → ServiceUnavailable (503)
/// - `InputError` → ValidationError (400) or PayloadTooLarge (413)
/// 
/// Anything else is an Internal error (500).
/// 
/// ## Rust Concepts:
/// - **downcast_ref**: Looks for a concrete error type inside the anyhow
///   error, including underneath any `.context(...)` layers
/// - **From trait**: Enables automatic conversion with `.into()` or `?`
/// 
/// The alternate format (`{:#}`) keeps the whole context chain in the message.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(unavailable) = err.downcast_ref::<ModelUnavailable>() {
            return AppError::ServiceUnavailable(unavailable.to_string());
        }
        if let Some(input) = err.downcast_ref::<InputError>() {
            return match input {
                InputError::Invalid(_) => AppError::ValidationError(format!("{:#}", err)),
                InputError::TooLarge(_) => AppError::PayloadTooLarge(format!("{:#}", err)),
            };
        }
        AppError::Internal(format!("{:#}", err))
    }
}

/// Direct conversion for request checks that happen in the handlers.
impl From<InputError> for AppError {
    fn from(err: InputError) -> Self {
        match err {
            InputError::Invalid(msg) => AppError::ValidationError(msg),
            InputError::TooLarge(msg) => AppError::PayloadTooLarge(msg),
        }
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
/// 
/// ## Purpose:
/// When parsing JSON from HTTP requests fails, we want to return a BadRequest
/// error with a helpful message about what went wrong.
/// 
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response, not a 500 (Internal Server Error).
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
/// 
/// ## Purpose:
/// Configuration loading can fail for various reasons (missing files, invalid syntax, etc.).
/// These are server-side issues that should be treated as configuration errors.
/// 
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - Required environment variables are missing
/// - Configuration values fail validation
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Conversion from batch construction errors.
///
/// The only batch-level error is an invalid concurrency limit, which comes
/// from the request or the runtime configuration, so it maps to a 400.
impl From<BatchError> for AppError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::InvalidArgument(msg) => AppError::ValidationError(msg),
        }
    }
}

/// Type alias for Results that use our custom error type.
/// 
/// ## Purpose:
/// This creates a shorthand for `Result<T, AppError>` so you can write
/// `AppResult<String>` instead of `Result<String, AppError>`.
/// 
/// ## Usage Example:
/// ```rust
/// async fn model_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
///     // This is equivalent to: -> Result<HttpResponse, AppError>
///     let info = state.text_service.model_info().await
///         .ok_or_else(|| AppError::ServiceUnavailable("summarizer not loaded".into()))?;
///     Ok(HttpResponse::Ok().json(info))
/// }
/// ```
/// 
/// ## Rust Concepts:
/// - **type alias**: Creates a new name for an existing type
/// - **Generic type**: `T` can be any type (HttpResponse, String, etc.)
pub type AppResult<T> = Result<T, AppError>;

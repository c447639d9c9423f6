//! Error handling for the sheet-prompt HTTP service
//!
//! This module provides:
//! - Reason codes returned to HTTP callers (`{"error": "PROMPT_EMPTY", ...}`)
//! - Rich error context with operation details and suggestions
//! - Builder pattern for constructing errors
//! - Conversion from component errors
//!
//! Errors are counted once, by reason code, when they are turned into a response.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{AsRefStr, EnumString};

use crate::prompts::StoreError;
use crate::tokens::UnresolvedTokens;
use crate::workbook::OpenError;

// =============================================================================
// REASON CODES
// =============================================================================

/// Machine-readable reason codes, serialized in SCREAMING_SNAKE_CASE
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Prompt text was missing or blank
    PromptEmpty,
    /// No files were uploaded
    FilesEmpty,
    /// One of the uploaded files had no content
    FileEmpty,
    /// JSON input was missing or blank
    JsonEmpty,
    /// Request body or parameters were malformed
    InvalidRequest,
    /// Workbook is encrypted and the password is missing or wrong
    PasswordRequiredOrInvalid,
    /// Workbook could not be parsed
    FailedToOpen,
    /// Prompt references sheets or columns that do not exist
    UnresolvedTokens,
    /// Workflow is missing steps or inputs
    WorkflowNotReady,
    /// Saved-prompt store could not be read or written
    StoreFailure,
    /// Unexpected server error
    InternalError,
}

impl ErrorCode {
    /// HTTP status for this reason code
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::StoreFailure | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Check if this error type is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::InternalError | ErrorCode::StoreFailure)
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::PromptEmpty
            | ErrorCode::FilesEmpty
            | ErrorCode::FileEmpty
            | ErrorCode::JsonEmpty
            | ErrorCode::InvalidRequest => "client_error",
            ErrorCode::PasswordRequiredOrInvalid | ErrorCode::FailedToOpen => "workbook_error",
            ErrorCode::UnresolvedTokens | ErrorCode::WorkflowNotReady => "validation_error",
            ErrorCode::StoreFailure => "io_error",
            ErrorCode::InternalError => "server_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

// =============================================================================
// ERROR CONTEXT
// =============================================================================

/// Context attached to an error
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    /// Operation that was being performed
    pub operation: Option<String>,
    /// File the error concerns, if any
    pub file_name: Option<String>,
    /// Additional parameters
    pub params: HashMap<String, serde_json::Value>,
    /// Suggestions for fixing the error
    pub suggestions: Vec<String>,
}

// =============================================================================
// API ERROR TYPE
// =============================================================================

/// Error returned by every HTTP handler
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub error_id: String,
    pub context: ErrorContext,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error_id: Self::generate_error_id(),
            context: ErrorContext::default(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Start building an error with the builder pattern
    pub fn builder(code: ErrorCode) -> ErrorBuilder {
        ErrorBuilder::new(code)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    fn generate_error_id() -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let timestamp = chrono::Utc::now().timestamp_millis();
        format!("err_{:x}_{:x}", timestamp, count)
    }

    /// Wire body: `{"error": CODE, "message", "errorId", "details"?, "timestamp"}`
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.code,
            "message": self.message,
            "errorId": self.error_id,
            "timestamp": self.timestamp,
        });
        let mut details = serde_json::Map::new();
        if let Some(file) = &self.context.file_name {
            details.insert("file".into(), file.clone().into());
        }
        for (key, value) in &self.context.params {
            details.insert(key.clone(), value.clone());
        }
        if !self.context.suggestions.is_empty() {
            details.insert(
                "suggestions".into(),
                serde_json::to_value(&self.context.suggestions).unwrap_or_default(),
            );
        }
        if !details.is_empty() {
            body["details"] = serde_json::Value::Object(details);
        }
        body
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code, error_id = %self.error_id, message = %self.message, "request failed");
        } else {
            tracing::debug!(code = %self.code, error_id = %self.error_id, message = %self.message, "request rejected");
        }
        crate::metrics::METRICS.record_error(self.code);
        (status, Json(self.body())).into_response()
    }
}

// =============================================================================
// ERROR BUILDER
// =============================================================================

/// Builder for constructing rich errors
pub struct ErrorBuilder {
    error: ApiError,
}

impl ErrorBuilder {
    fn new(code: ErrorCode) -> Self {
        Self {
            error: ApiError::new(code, ""),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error.message = message.into();
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.error.context.operation = Some(operation.into());
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.error.context.file_name = Some(file_name.into());
        self
    }

    /// Add a parameter to the context
    pub fn param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.error.context.params.insert(key.into(), json_value);
        }
        self
    }

    pub fn suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.error.context.suggestions.push(suggestion.into());
        self
    }

    pub fn build(self) -> ApiError {
        self.error
    }
}

// =============================================================================
// CONVERSION FROM COMPONENT ERRORS
// =============================================================================

/// Maps a workbook open failure for `file_name` onto the wire reason codes
pub fn open_error(file_name: &str, error: &OpenError) -> ApiError {
    match error {
        OpenError::NeedsPassword | OpenError::PasswordInvalid(_) => {
            ApiError::builder(ErrorCode::PasswordRequiredOrInvalid)
                .message(format!(
                    "Failed to open workbook '{file_name}'. If it is password-protected, provide correct password."
                ))
                .file_name(file_name)
                .suggestion("Supply the password for this file in meta.passwords")
                .build()
        }
        OpenError::OpenFailed(reason) => ApiError::builder(ErrorCode::FailedToOpen)
            .message(format!("Failed to open workbook '{file_name}': {reason}"))
            .file_name(file_name)
            .suggestion("Check that the file is an .xlsx, .xlsm or .xls workbook")
            .build(),
    }
}

impl From<UnresolvedTokens> for ApiError {
    fn from(error: UnresolvedTokens) -> Self {
        ApiError::builder(ErrorCode::UnresolvedTokens)
            .message(error.to_string())
            .param("missing", &error.missing)
            .build()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        let code = match error {
            StoreError::EmptyPrompt => ErrorCode::PromptEmpty,
            _ => ErrorCode::StoreFailure,
        };
        ApiError::builder(code)
            .message(error.to_string())
            .operation("prompt_store")
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_render_screaming_snake() {
        assert_eq!(ErrorCode::PromptEmpty.to_string(), "PROMPT_EMPTY");
        assert_eq!(
            ErrorCode::PasswordRequiredOrInvalid.to_string(),
            "PASSWORD_REQUIRED_OR_INVALID"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::FailedToOpen).unwrap(),
            serde_json::json!("FAILED_TO_OPEN")
        );
        assert_eq!(
            "UNRESOLVED_TOKENS".parse::<ErrorCode>().unwrap(),
            ErrorCode::UnresolvedTokens
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::PromptEmpty.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::InternalError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(ErrorCode::StoreFailure.is_retryable());
        assert!(!ErrorCode::JsonEmpty.is_retryable());
    }

    #[test]
    fn test_error_builder_and_body() {
        let error = ApiError::builder(ErrorCode::FileEmpty)
            .message("one of files is empty")
            .operation("process_multi")
            .file_name("a.xlsx")
            .suggestion("Re-upload the file")
            .build();

        assert_eq!(error.code, ErrorCode::FileEmpty);
        let body = error.body();
        assert_eq!(body["error"], "FILE_EMPTY");
        assert_eq!(body["message"], "one of files is empty");
        assert_eq!(body["details"]["file"], "a.xlsx");
        assert!(body["errorId"].as_str().unwrap().starts_with("err_"));
    }

    #[test]
    fn test_body_without_details() {
        let body = ApiError::new(ErrorCode::PromptEmpty, "prompt must not be blank").body();
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_open_error_mapping() {
        let needs = open_error("a.xlsx", &OpenError::NeedsPassword);
        assert_eq!(needs.code, ErrorCode::PasswordRequiredOrInvalid);
        assert!(needs.message.contains("provide correct password"));

        let failed = open_error("b.xlsx", &OpenError::OpenFailed("bad zip".into()));
        assert_eq!(failed.code, ErrorCode::FailedToOpen);
        assert!(failed.message.contains("bad zip"));
    }

    #[test]
    fn test_every_constructor_counts_once_on_response() {
        let count = |code: ErrorCode| {
            crate::metrics::METRICS
                .errors_total
                .get_or_create(&crate::metrics::ErrorLabels {
                    code: code.as_ref().to_string(),
                })
                .get()
        };
        let before_plain = count(ErrorCode::InvalidRequest);
        let before_built = count(ErrorCode::WorkflowNotReady);

        let plain = ApiError::invalid_request("steps is not a valid step list");
        let built = ApiError::builder(ErrorCode::WorkflowNotReady)
            .message("no steps")
            .operation("workflow")
            .build();
        assert_eq!(count(ErrorCode::InvalidRequest), before_plain);
        assert_eq!(count(ErrorCode::WorkflowNotReady), before_built);

        assert_eq!(plain.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(built.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(count(ErrorCode::InvalidRequest), before_plain + 1);
        assert_eq!(count(ErrorCode::WorkflowNotReady), before_built + 1);
    }
}

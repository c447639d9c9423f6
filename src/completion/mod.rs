//! Single-turn completions against the configured model backend.
//!
//! The main path never fails: any backend error turns into a deterministic
//! fallback text flagged with `used_remote_model = false`. The diagnostic path
//! ([`CompletionInvoker::try_complete`]) returns the classified error instead.

pub mod bedrock;
pub mod diagnostics;
pub mod http;

use crate::metrics::METRICS;
use crate::utils::truncate_chars;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const FALLBACK_CONTEXT_CHARS: usize = 2000;

/// Coarse classification of a failed completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    AccessDenied,
    Validation,
    Transport,
    Other,
}

impl FailureKind {
    /// Name reported by diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AccessDenied => "AccessDeniedException",
            FailureKind::Validation => "ValidationException",
            FailureKind::Transport => "TransportError",
            FailureKind::Other => "ServiceError",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InvokeError {
    pub kind: FailureKind,
    pub message: String,
}

impl InvokeError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A model endpoint that accepts a messages-style request body.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn model_id(&self) -> &str;

    /// Sends `body` and returns the parsed JSON response.
    async fn invoke(&self, body: &Value) -> Result<Value, InvokeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user_text: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(user_text: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: None,
            user_text: user_text.into(),
            max_tokens,
            temperature: None,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = (!system.trim().is_empty()).then_some(system);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": self.user_text }],
            }],
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(system) = &self.system {
            body["system"] = json!(system);
        }
        body
    }
}

/// `prompt.trim()` followed by the trimmed context block when there is one.
pub fn build_user_text(prompt: &str, context: Option<&str>) -> String {
    let mut text = prompt.trim().to_string();
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        text.push_str("\n\nContext:\n");
        text.push_str(context.trim());
    }
    text
}

/// `content[0].text`, falling back to `output_text`; trimmed.
pub fn response_text(response: &Value) -> String {
    let primary = response
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let text = if primary.trim().is_empty() {
        response
            .get("output_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
    } else {
        primary
    };
    text.trim().to_string()
}

pub fn fallback_text(prompt: &str, context: Option<&str>) -> String {
    let mut text = format!(
        "[FALLBACK] Unable to reach Bedrock. Echoing prompt with summarized context.\n\nPrompt: {}",
        prompt.trim()
    );
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        text.push_str("\nContext (truncated):\n");
        text.push_str(truncate_chars(context, FALLBACK_CONTEXT_CHARS));
    }
    text
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub output_text: String,
    pub used_remote_model: bool,
}

#[derive(Clone)]
pub struct CompletionInvoker {
    backend: Arc<dyn CompletionBackend>,
}

impl CompletionInvoker {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn backend(&self) -> &Arc<dyn CompletionBackend> {
        &self.backend
    }

    /// Main path: prompt plus optional context, masking failures with the echo fallback.
    pub async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        context: Option<&str>,
        max_tokens: u32,
        temperature: Option<f64>,
    ) -> CompletionResult {
        let mut request = CompletionRequest::new(build_user_text(prompt, context), max_tokens);
        if let Some(system) = system {
            request = request.system(system);
        }
        request.temperature = temperature;
        self.complete_or_else(&request, || fallback_text(prompt, context))
            .await
    }

    /// Sends `request`; on failure returns `fallback()` with `used_remote_model = false`.
    pub async fn complete_or_else<F>(&self, request: &CompletionRequest, fallback: F) -> CompletionResult
    where
        F: FnOnce() -> String,
    {
        match self.try_complete(request).await {
            Ok(output_text) => CompletionResult {
                output_text,
                used_remote_model: true,
            },
            Err(err) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    model_id = self.backend.model_id(),
                    failure = err.kind.as_str(),
                    error = %err,
                    "completion failed, using fallback"
                );
                METRICS.record_completion(self.backend.name(), "fallback", None);
                CompletionResult {
                    output_text: fallback(),
                    used_remote_model: false,
                }
            }
        }
    }

    /// Diagnostic path: failures are returned, classified.
    pub async fn try_complete(&self, request: &CompletionRequest) -> Result<String, InvokeError> {
        let body = request.to_body();
        let started = Instant::now();
        tracing::debug!(
            backend = self.backend.name(),
            model_id = self.backend.model_id(),
            max_tokens = request.max_tokens,
            user_chars = request.user_text.chars().count(),
            "invoking model"
        );
        let span = crate::logging::completion_span(self.backend.name(), self.backend.model_id());
        let result = self.backend.invoke(&body).instrument(span).await;
        let elapsed = started.elapsed();
        match result {
            Ok(response) => {
                METRICS.record_completion(self.backend.name(), "remote", Some(elapsed));
                Ok(response_text(&response))
            }
            Err(err) => {
                METRICS.record_completion(self.backend.name(), "error", Some(elapsed));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_omits_absent_optionals() {
        let body = CompletionRequest::new("hi", 16).to_body();
        assert_eq!(body["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(body["max_tokens"], 16);
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
        assert!(body.get("system").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn blank_system_is_dropped() {
        let request = CompletionRequest::new("hi", 16).system("   ");
        assert!(request.system.is_none());
    }

    #[test]
    fn user_text_appends_trimmed_context() {
        assert_eq!(build_user_text("  ask ", Some(" data \n")), "ask\n\nContext:\ndata");
        assert_eq!(build_user_text("ask", Some("   ")), "ask");
    }

    #[test]
    fn response_text_prefers_content_then_output_text() {
        assert_eq!(
            response_text(&json!({"content": [{"text": " yes "}]})),
            "yes"
        );
        assert_eq!(
            response_text(&json!({"content": [{"text": "  "}], "output_text": "alt"})),
            "alt"
        );
        assert_eq!(response_text(&json!({})), "");
    }

    #[test]
    fn fallback_truncates_context() {
        let context = "x".repeat(5000);
        let text = fallback_text(" q ", Some(&context));
        assert!(text.starts_with("[FALLBACK]"));
        assert!(text.contains("Prompt: q\nContext (truncated):\n"));
        assert!(text.ends_with(&"x".repeat(2000)));
        assert!(!text.contains(&"x".repeat(2001)));
    }
}

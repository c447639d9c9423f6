use super::{CompletionBackend, FailureKind, InvokeError};
use crate::config::ModelConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

const MESSAGES_API_VERSION: &str = "2023-06-01";

/// Anthropic Messages-compatible endpoint reached over plain HTTPS.
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(model: &ModelConfig) -> Result<Self> {
        let endpoint = model
            .endpoint
            .clone()
            .context("http provider requires an endpoint")?;
        let client = reqwest::Client::builder()
            .timeout(model.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            model_id: model.model_id.clone(),
            api_key: model.api_key.clone(),
        })
    }

    /// The Messages API takes the model in the body and the version as a header.
    fn request_body(&self, body: &Value) -> Value {
        let mut body = body.clone();
        if let Some(object) = body.as_object_mut() {
            object.remove("anthropic_version");
            object.insert("model".into(), Value::String(self.model_id.clone()));
        }
        body
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, body: &Value) -> Result<Value, InvokeError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("anthropic-version", MESSAGES_API_VERSION)
            .json(&self.request_body(body));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InvokeError::new(
                classify_status(status),
                format!("endpoint returned {status}: {detail}"),
            ));
        }
        response.json::<Value>().await.map_err(|err| {
            InvokeError::new(
                FailureKind::Other,
                format!("model response is not JSON: {err}"),
            )
        })
    }
}

fn classify_transport(err: reqwest::Error) -> InvokeError {
    let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
        FailureKind::Transport
    } else {
        FailureKind::Other
    };
    InvokeError::new(kind, err.to_string())
}

fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::AccessDenied,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            FailureKind::Validation
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            FailureKind::Transport
        }
        _ => FailureKind::Other,
    }
}

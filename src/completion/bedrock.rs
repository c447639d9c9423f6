use super::{CompletionBackend, FailureKind, InvokeError};
use crate::config::ModelConfig;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_bedrockruntime::Client as BedrockRuntimeClient;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, SdkError};
use aws_sdk_bedrockruntime::operation::invoke_model::InvokeModelError;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_types::region::Region;
use serde_json::Value;

/// `InvokeModel` on the Bedrock runtime, using the default AWS credential chain.
pub struct BedrockBackend {
    client: BedrockRuntimeClient,
    model_id: String,
}

impl BedrockBackend {
    pub async fn load_sdk_config(model: &ModelConfig) -> SdkConfig {
        aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(model.region.clone()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(model.request_timeout)
                    .build(),
            )
            .load()
            .await
    }

    pub fn new(sdk_config: &SdkConfig, model: &ModelConfig) -> Self {
        Self {
            client: BedrockRuntimeClient::new(sdk_config),
            model_id: model.model_id.clone(),
        }
    }
}

#[async_trait]
impl CompletionBackend for BedrockBackend {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, body: &Value) -> Result<Value, InvokeError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| InvokeError::new(FailureKind::Validation, err.to_string()))?;
        let output = self
            .client
            .invoke_model()
            .model_id(&self.model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(payload))
            .send()
            .await
            .map_err(classify)?;
        serde_json::from_slice(output.body().as_ref()).map_err(|err| {
            InvokeError::new(
                FailureKind::Other,
                format!("model response is not JSON: {err}"),
            )
        })
    }
}

fn classify(err: SdkError<InvokeModelError>) -> InvokeError {
    let kind = match &err {
        SdkError::ServiceError(ctx) => match ctx.err() {
            InvokeModelError::AccessDeniedException(_) => FailureKind::AccessDenied,
            InvokeModelError::ValidationException(_) => FailureKind::Validation,
            _ => FailureKind::Other,
        },
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            FailureKind::Transport
        }
        _ => FailureKind::Other,
    };
    InvokeError::new(kind, DisplayErrorContext(&err).to_string())
}

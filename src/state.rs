use crate::completion::bedrock::BedrockBackend;
use crate::completion::diagnostics::{Prober, SystemProber};
use crate::completion::http::HttpBackend;
use crate::completion::{CompletionBackend, CompletionInvoker};
use crate::config::{ModelProvider, ServerConfig};
use crate::prompts::{InMemoryPromptStore, JsonFilePromptStore, PromptStore};
use crate::service::SheetPromptService;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Shared, read-mostly state handed to every handler.
pub struct AppState {
    config: Arc<ServerConfig>,
    service: SheetPromptService,
    prompts: Arc<dyn PromptStore>,
    prober: Arc<dyn Prober>,
}

impl AppState {
    /// Builds the configured model backend, prompt store and diagnostics prober.
    pub async fn from_config(config: Arc<ServerConfig>) -> Result<Self> {
        let model = &config.model;
        let (backend, sdk_config) = match model.provider {
            ModelProvider::Bedrock => {
                let sdk_config = BedrockBackend::load_sdk_config(model).await;
                let backend: Arc<dyn CompletionBackend> =
                    Arc::new(BedrockBackend::new(&sdk_config, model));
                (backend, Some(sdk_config))
            }
            ModelProvider::Http => {
                let backend: Arc<dyn CompletionBackend> = Arc::new(HttpBackend::new(model)?);
                (backend, None)
            }
        };
        let invoker = CompletionInvoker::new(backend);

        let prompts: Arc<dyn PromptStore> = match &config.prompt_store_path {
            Some(path) => Arc::new(
                JsonFilePromptStore::open(path)
                    .with_context(|| format!("failed to open prompt store {}", path.display()))?,
            ),
            None => Arc::new(InMemoryPromptStore::new()),
        };
        let prober = Arc::new(SystemProber::new(model.clone(), invoker.clone(), sdk_config));

        tracing::info!(
            provider = %model.provider,
            model_id = %model.model_id,
            region = %model.region,
            persistent_prompts = config.prompt_store_path.is_some(),
            "application state initialized"
        );
        Ok(Self::with_components(config, invoker, prompts, prober))
    }

    /// Assembles state from pre-built parts.
    pub fn with_components(
        config: Arc<ServerConfig>,
        invoker: CompletionInvoker,
        prompts: Arc<dyn PromptStore>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let service = SheetPromptService::new(invoker, config.limits);
        Self {
            config,
            service,
            prompts,
            prober,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &SheetPromptService {
        &self.service
    }

    pub fn prompts(&self) -> &Arc<dyn PromptStore> {
        &self.prompts
    }

    pub fn prober(&self) -> &dyn Prober {
        self.prober.as_ref()
    }
}

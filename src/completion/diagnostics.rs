//! Connectivity and credential diagnostics for the completion backend.

use super::{CompletionInvoker, CompletionRequest, FailureKind, InvokeError};
use crate::config::{ModelConfig, ModelProvider};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::provider::ProvideCredentials;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

const PORT_TIMEOUT: Duration = Duration::from_millis(2000);
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub provider: ModelProvider,
    pub region: String,
    pub model_id: String,
    pub endpoint_host: String,
    pub env_aws_access_key_set: bool,
    pub env_aws_secret_key_set: bool,
    pub env_aws_session_token_set: bool,
    pub aws_profile_env: Option<String>,
    pub region_env: Option<String>,
    pub credentials_file_path: Option<String>,
    pub credentials_file_exists: bool,
    pub profile_section_exists: bool,
    pub credentials_available: bool,
    pub dns_resolvable: bool,
    pub port443_reachable: bool,
    pub invoke_ok: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub probable_causes: Vec<String>,
    pub suggested_actions: Vec<String>,
}

/// Everything `diagnose` touches outside the process.
#[async_trait]
pub trait Prober: Send + Sync {
    fn env_var(&self, name: &str) -> Option<String>;

    fn read_file(&self, path: &std::path::Path) -> Option<String>;

    async fn credentials_available(&self) -> bool;

    async fn dns_resolvable(&self, host: &str) -> bool;

    async fn port_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// Minimal invoke, surfacing the classified failure.
    async fn try_invoke(&self) -> Result<(), InvokeError>;
}

/// Probes the real environment.
pub struct SystemProber {
    model: ModelConfig,
    invoker: CompletionInvoker,
    sdk_config: Option<SdkConfig>,
}

impl SystemProber {
    pub fn new(model: ModelConfig, invoker: CompletionInvoker, sdk_config: Option<SdkConfig>) -> Self {
        Self {
            model,
            invoker,
            sdk_config,
        }
    }
}

#[async_trait]
impl Prober for SystemProber {
    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn read_file(&self, path: &std::path::Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    async fn credentials_available(&self) -> bool {
        match self.model.provider {
            ModelProvider::Http => self.model.api_key.is_some(),
            ModelProvider::Bedrock => {
                let Some(provider) = self
                    .sdk_config
                    .as_ref()
                    .and_then(|config| config.credentials_provider())
                else {
                    return false;
                };
                match provider.provide_credentials().await {
                    Ok(_) => true,
                    Err(err) => {
                        tracing::debug!(error = %err, "credential resolution failed");
                        false
                    }
                }
            }
        }
    }

    async fn dns_resolvable(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        tokio::net::lookup_host((host, HTTPS_PORT))
            .await
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }

    async fn port_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn try_invoke(&self) -> Result<(), InvokeError> {
        let request = CompletionRequest::new("healthcheck", 1);
        self.invoker.try_complete(&request).await.map(|_| ())
    }
}

pub async fn diagnose(model: &ModelConfig, prober: &dyn Prober) -> DiagnosticReport {
    let endpoint_host = model.endpoint_host();
    let env_set = |names: &[&str]| {
        names
            .iter()
            .any(|name| prober.env_var(name).is_some_and(|v| !v.trim().is_empty()))
    };
    let env_aws_access_key_set = env_set(&["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"]);
    let env_aws_secret_key_set = env_set(&["AWS_SECRET_ACCESS_KEY", "AWS_SECRET_KEY"]);
    let env_aws_session_token_set = env_set(&["AWS_SESSION_TOKEN"]);
    let aws_profile_env = prober.env_var("AWS_PROFILE").filter(|v| !v.trim().is_empty());
    let region_env = prober
        .env_var("AWS_REGION")
        .or_else(|| prober.env_var("AWS_DEFAULT_REGION"))
        .filter(|v| !v.trim().is_empty());

    let credentials_file = prober
        .env_var("HOME")
        .or_else(|| prober.env_var("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".aws").join("credentials"));
    let credentials_contents = credentials_file
        .as_deref()
        .and_then(|path| prober.read_file(path));
    let credentials_file_exists = credentials_contents.is_some();
    let profile_name = aws_profile_env.clone().unwrap_or_else(|| "default".to_string());
    let profile_section_exists = credentials_contents
        .as_deref()
        .is_some_and(|contents| has_profile_section(contents, &profile_name));

    let credentials_available = prober.credentials_available().await;
    let dns_resolvable = prober.dns_resolvable(&endpoint_host).await;
    let port443_reachable = if dns_resolvable {
        prober
            .port_reachable(&endpoint_host, HTTPS_PORT, PORT_TIMEOUT)
            .await
    } else {
        false
    };

    let mut report = DiagnosticReport {
        provider: model.provider,
        region: model.region.clone(),
        model_id: model.model_id.clone(),
        endpoint_host,
        env_aws_access_key_set,
        env_aws_secret_key_set,
        env_aws_session_token_set,
        aws_profile_env,
        region_env,
        credentials_file_path: credentials_file.map(|p| p.display().to_string()),
        credentials_file_exists,
        profile_section_exists,
        credentials_available,
        dns_resolvable,
        port443_reachable,
        invoke_ok: false,
        error_type: None,
        error_message: None,
        probable_causes: Vec::new(),
        suggested_actions: Vec::new(),
    };

    let mut failed_prechecks = Vec::new();
    if !credentials_available {
        failed_prechecks.push("credentials not available");
    }
    if !dns_resolvable {
        failed_prechecks.push("endpoint host does not resolve");
    }
    if !port443_reachable {
        failed_prechecks.push("port 443 not reachable");
    }

    let failure_kind = if failed_prechecks.is_empty() {
        match prober.try_invoke().await {
            Ok(()) => {
                report.invoke_ok = true;
                None
            }
            Err(err) => {
                report.error_type = Some(err.kind.as_str().to_string());
                report.error_message = Some(err.message.clone());
                Some(err.kind)
            }
        }
    } else {
        report.error_type = Some("PrecheckFailed".to_string());
        report.error_message = Some(failed_prechecks.join("; "));
        None
    };

    explain(&mut report, failure_kind);
    tracing::info!(
        provider = %report.provider,
        region = %report.region,
        invoke_ok = report.invoke_ok,
        error_type = report.error_type.as_deref().unwrap_or(""),
        "model diagnostics complete"
    );
    report
}

fn has_profile_section(contents: &str, profile: &str) -> bool {
    let wanted = format!("[{profile}]");
    contents.lines().any(|line| line.trim() == wanted)
}

fn explain(report: &mut DiagnosticReport, failure: Option<FailureKind>) {
    let causes = &mut report.probable_causes;
    let actions = &mut report.suggested_actions;

    if !report.credentials_available {
        match report.provider {
            ModelProvider::Bedrock => {
                causes.push("No AWS credentials were found in the default provider chain".into());
                if !report.env_aws_access_key_set && !report.credentials_file_exists {
                    actions.push(
                        "Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY or create ~/.aws/credentials"
                            .into(),
                    );
                } else if report.credentials_file_exists && !report.profile_section_exists {
                    actions.push(
                        "Add the selected profile section to ~/.aws/credentials or fix AWS_PROFILE"
                            .into(),
                    );
                } else {
                    actions.push("Check that the configured credentials are complete and not expired".into());
                }
            }
            ModelProvider::Http => {
                causes.push("No API key is configured for the http provider".into());
                actions.push("Set SHEET_PROMPT_API_KEY".into());
            }
        }
    }
    if !report.dns_resolvable {
        causes.push(format!("{} could not be resolved", report.endpoint_host));
        actions.push("Check DNS settings, the configured region and any proxy configuration".into());
    } else if !report.port443_reachable {
        causes.push(format!("{}:443 is not reachable", report.endpoint_host));
        actions.push("Allow outbound HTTPS to the endpoint through firewalls or proxies".into());
    }

    match failure {
        Some(FailureKind::AccessDenied) => {
            causes.push("The caller is not allowed to invoke this model".into());
            actions.push(
                "Grant bedrock:InvokeModel and enable model access for this model in the region"
                    .into(),
            );
        }
        Some(FailureKind::Validation) => {
            causes.push("The model id or request shape was rejected".into());
            actions.push("Verify the model id is available in the configured region".into());
        }
        Some(FailureKind::Transport) => {
            causes.push("The request did not complete at the network level".into());
            actions.push("Retry and check connectivity, proxies and TLS interception".into());
        }
        Some(FailureKind::Other) => {
            causes.push("The model endpoint returned an unexpected error".into());
            actions.push("Inspect errorMessage and the server logs".into());
        }
        None => {}
    }
}

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_ROWS_PER_SHEET: usize = 200;
pub const DEFAULT_MAX_COLS_PER_ROW: usize = 20;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 200_000;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// AWS Bedrock runtime `InvokeModel`
    #[default]
    Bedrock,
    /// Anthropic Messages-compatible HTTP endpoint
    Http,
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelProvider::Bedrock => write!(f, "bedrock"),
            ModelProvider::Http => write!(f, "http"),
        }
    }
}

/// Where completions go. Fixed for the lifetime of the process.
#[derive(Clone)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub region: String,
    pub model_id: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("region", &self.region)
            .field("model_id", &self.model_id)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Bedrock,
            region: DEFAULT_REGION.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            endpoint: None,
            api_key: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ModelConfig {
    /// Host the diagnostics probe resolves and connects to.
    pub fn endpoint_host(&self) -> String {
        match self.provider {
            ModelProvider::Bedrock => format!("bedrock-runtime.{}.amazonaws.com", self.region),
            ModelProvider::Http => self
                .endpoint
                .as_deref()
                .and_then(|url| reqwest::Url::parse(url).ok())
                .and_then(|url| url.host_str().map(str::to_string))
                .unwrap_or_default(),
        }
    }
}

/// Caps applied when serializing workbook context and calling the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitsConfig {
    pub max_rows_per_sheet: usize,
    pub max_cols_per_row: usize,
    pub max_context_chars: usize,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows_per_sheet: DEFAULT_MAX_ROWS_PER_SHEET,
            max_cols_per_row: DEFAULT_MAX_COLS_PER_ROW,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_bind_address: SocketAddr,
    pub max_upload_bytes: usize,
    pub graceful_shutdown_timeout: Duration,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
    pub prompt_store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind_address: default_bind(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            graceful_shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            model: ModelConfig::default(),
            limits: LimitsConfig::default(),
            prompt_store_path: None,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl ServerConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let CliArgs {
            config,
            http_bind: cli_http_bind,
            max_upload_bytes: cli_max_upload_bytes,
            shutdown_timeout_secs: cli_shutdown_timeout_secs,
            provider: cli_provider,
            region: cli_region,
            model_id: cli_model_id,
            endpoint: cli_endpoint,
            api_key: cli_api_key,
            request_timeout_secs: cli_request_timeout_secs,
            max_rows_per_sheet: cli_max_rows,
            max_cols_per_row: cli_max_cols,
            max_context_chars: cli_max_context_chars,
            max_tokens: cli_max_tokens,
            temperature: cli_temperature,
            prompt_store: cli_prompt_store,
        } = args;

        let file_config = if let Some(path) = config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            http_bind: file_http_bind,
            max_upload_bytes: file_max_upload_bytes,
            shutdown_timeout_secs: file_shutdown_timeout_secs,
            provider: file_provider,
            region: file_region,
            model_id: file_model_id,
            endpoint: file_endpoint,
            api_key: file_api_key,
            request_timeout_secs: file_request_timeout_secs,
            max_rows_per_sheet: file_max_rows,
            max_cols_per_row: file_max_cols,
            max_context_chars: file_max_context_chars,
            max_tokens: file_max_tokens,
            temperature: file_temperature,
            prompt_store: file_prompt_store,
        } = file_config;

        let http_bind_address = match cli_http_bind.or(file_http_bind) {
            Some(addr) => addr,
            None => DEFAULT_HTTP_BIND
                .parse()
                .context("default bind address is invalid")?,
        };

        let model = ModelConfig {
            provider: cli_provider.or(file_provider).unwrap_or_default(),
            region: cli_region
                .or(file_region)
                .map(|region| region.trim().to_string())
                .filter(|region| !region.is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            model_id: cli_model_id
                .or(file_model_id)
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            endpoint: cli_endpoint
                .or(file_endpoint)
                .filter(|url| !url.trim().is_empty()),
            api_key: cli_api_key
                .or(file_api_key)
                .filter(|key| !key.trim().is_empty()),
            request_timeout: Duration::from_secs(
                cli_request_timeout_secs
                    .or(file_request_timeout_secs)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        };

        let limits = LimitsConfig {
            max_rows_per_sheet: cli_max_rows
                .or(file_max_rows)
                .unwrap_or(DEFAULT_MAX_ROWS_PER_SHEET),
            max_cols_per_row: cli_max_cols
                .or(file_max_cols)
                .unwrap_or(DEFAULT_MAX_COLS_PER_ROW),
            max_context_chars: cli_max_context_chars
                .or(file_max_context_chars)
                .unwrap_or(DEFAULT_MAX_CONTEXT_CHARS),
            max_tokens: cli_max_tokens
                .or(file_max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: cli_temperature
                .or(file_temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
        };

        Ok(Self {
            http_bind_address,
            max_upload_bytes: cli_max_upload_bytes
                .or(file_max_upload_bytes)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            graceful_shutdown_timeout: Duration::from_secs(
                cli_shutdown_timeout_secs
                    .or(file_shutdown_timeout_secs)
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
            model,
            limits,
            prompt_store_path: cli_prompt_store.or(file_prompt_store),
        })
    }

    /// Fail-fast checks run once at startup.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        anyhow::ensure!(
            limits.max_rows_per_sheet > 0,
            "max_rows_per_sheet must be greater than zero"
        );
        anyhow::ensure!(
            limits.max_cols_per_row > 0,
            "max_cols_per_row must be greater than zero"
        );
        anyhow::ensure!(
            limits.max_context_chars > 0,
            "max_context_chars must be greater than zero"
        );
        anyhow::ensure!(limits.max_tokens > 0, "max_tokens must be greater than zero");
        anyhow::ensure!(
            (0.0..=1.0).contains(&limits.temperature),
            "temperature must be between 0.0 and 1.0 (got {})",
            limits.temperature
        );
        anyhow::ensure!(
            self.max_upload_bytes > 0,
            "max_upload_bytes must be greater than zero"
        );
        anyhow::ensure!(
            !self.model.request_timeout.is_zero(),
            "request_timeout_secs must be greater than zero"
        );

        if self.model.provider == ModelProvider::Http {
            let endpoint = self
                .model
                .endpoint
                .as_deref()
                .context("endpoint is required when provider is http")?;
            reqwest::Url::parse(endpoint)
                .with_context(|| format!("endpoint {endpoint:?} is not a valid URL"))?;
        }

        if let Some(path) = self.prompt_store_path.as_ref()
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            anyhow::ensure!(
                parent.is_dir(),
                "prompt store directory {:?} does not exist",
                parent
            );
        }
        Ok(())
    }
}

#[derive(Parser, Debug, Default, Clone)]
#[command(
    name = "sheet-prompt",
    about = "Ask an LLM about spreadsheet workbooks, and turn JSON back into spreadsheets",
    version
)]
pub struct CliArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML, JSON or TOML)",
        global = true
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEET_PROMPT_HTTP_BIND",
        value_name = "ADDR",
        help = "HTTP bind address"
    )]
    pub http_bind: Option<SocketAddr>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MAX_UPLOAD_BYTES",
        value_name = "BYTES",
        help = "Maximum accepted request body size",
        value_parser = clap::value_parser!(usize)
    )]
    pub max_upload_bytes: Option<usize>,

    #[arg(
        long,
        env = "SHEET_PROMPT_SHUTDOWN_TIMEOUT_SECS",
        value_name = "SECS",
        help = "Seconds to wait for in-flight requests on shutdown"
    )]
    pub shutdown_timeout_secs: Option<u64>,

    #[arg(
        long,
        env = "SHEET_PROMPT_PROVIDER",
        value_enum,
        value_name = "PROVIDER",
        help = "Completion backend (bedrock or http)"
    )]
    pub provider: Option<ModelProvider>,

    #[arg(
        long,
        env = "SHEET_PROMPT_REGION",
        value_name = "REGION",
        help = "AWS region of the Bedrock runtime"
    )]
    pub region: Option<String>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MODEL_ID",
        value_name = "ID",
        help = "Model identifier sent with every completion"
    )]
    pub model_id: Option<String>,

    #[arg(
        long,
        env = "SHEET_PROMPT_ENDPOINT",
        value_name = "URL",
        help = "Messages endpoint URL when provider is http"
    )]
    pub endpoint: Option<String>,

    #[arg(
        long,
        env = "SHEET_PROMPT_API_KEY",
        value_name = "KEY",
        hide_env_values = true,
        help = "API key sent to the http provider"
    )]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "SHEET_PROMPT_REQUEST_TIMEOUT_SECS",
        value_name = "SECS",
        help = "Timeout for a single completion call"
    )]
    pub request_timeout_secs: Option<u64>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MAX_ROWS_PER_SHEET",
        value_name = "N",
        help = "Default row cap per sheet when building context"
    )]
    pub max_rows_per_sheet: Option<usize>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MAX_COLS_PER_ROW",
        value_name = "N",
        help = "Default column cap per row when building context"
    )]
    pub max_cols_per_row: Option<usize>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MAX_CONTEXT_CHARS",
        value_name = "N",
        help = "Character cap of the serialized context"
    )]
    pub max_context_chars: Option<usize>,

    #[arg(
        long,
        env = "SHEET_PROMPT_MAX_TOKENS",
        value_name = "N",
        help = "max_tokens for workbook prompts"
    )]
    pub max_tokens: Option<u32>,

    #[arg(
        long,
        env = "SHEET_PROMPT_TEMPERATURE",
        value_name = "T",
        help = "Sampling temperature for workbook prompts"
    )]
    pub temperature: Option<f64>,

    #[arg(
        long,
        env = "SHEET_PROMPT_PROMPT_STORE",
        value_name = "FILE",
        help = "JSON file holding saved prompts (in-memory when omitted)"
    )]
    pub prompt_store: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    http_bind: Option<SocketAddr>,
    max_upload_bytes: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    provider: Option<ModelProvider>,
    region: Option<String>,
    model_id: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    request_timeout_secs: Option<u64>,
    max_rows_per_sheet: Option<usize>,
    max_cols_per_row: Option<usize>,
    max_context_chars: Option<usize>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    prompt_store: Option<PathBuf>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        "toml" => toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}

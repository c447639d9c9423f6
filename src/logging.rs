//! Tracing subscriber setup and the spans shared by the HTTP layer, the model
//! invoker and the workflow orchestrator.
//!
//! Uploaded bytes, workbook passwords and API keys are never recorded; callers
//! log sizes and flags instead.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::trace::TraceError;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer};
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_OTLP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rolling file under `log_dir`.
    File,
}

/// Where and how logs are written, plus optional OTLP trace export.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    pub log_dir: PathBuf,
    pub environment: String,
    pub otlp_endpoint: Option<String>,
    /// Set by `ENABLE_OTEL` alone; export still needs an endpoint.
    pub otel_requested: bool,
    pub otel_sampling_rate: f64,
    pub otlp_timeout: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `lookup`; unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let environment = lookup("ENVIRONMENT")
            .or_else(|| lookup("ENV"))
            .unwrap_or_else(|| "development".to_string());
        let production = is_production(&environment);

        let format = lookup("LOG_FORMAT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(if production {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            });
        let output = lookup("LOG_OUTPUT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(LogOutput::Stderr);
        let otlp_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
            .or_else(|| lookup("OTLP_ENDPOINT"))
            .filter(|v| !v.trim().is_empty());
        let otel_sampling_rate = lookup("OTEL_SAMPLING_RATE")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|rate| rate.clamp(0.0, 1.0))
            .unwrap_or(if production { 0.1 } else { 1.0 });
        let otlp_timeout = lookup("OTEL_EXPORTER_OTLP_TIMEOUT")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_OTLP_TIMEOUT_SECS);

        Self {
            format,
            output,
            log_dir: lookup("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            otel_requested: otlp_endpoint.is_some() || lookup("ENABLE_OTEL").is_some(),
            otlp_endpoint,
            otel_sampling_rate,
            otlp_timeout: Duration::from_secs(otlp_timeout),
            environment,
        }
    }

    fn default_directive(&self) -> String {
        let level = if is_production(&self.environment) {
            "info"
        } else {
            "debug"
        };
        format!("{level},hyper=info,tower=info")
    }

    fn sampler(&self) -> Sampler {
        match self.otel_sampling_rate {
            rate if rate >= 1.0 => Sampler::AlwaysOn,
            rate if rate <= 0.0 => Sampler::AlwaysOff,
            rate => Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rate))),
        }
    }

    fn resource(&self) -> Resource {
        Resource::new(vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                SERVICE_NAME,
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
            KeyValue::new("environment", self.environment.clone()),
        ])
    }
}

fn is_production(environment: &str) -> bool {
    matches!(environment, "production" | "prod")
}

fn writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(match config.output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File => {
            std::fs::create_dir_all(&config.log_dir).with_context(|| {
                format!("failed to create log directory {}", config.log_dir.display())
            })?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(
                &config.log_dir,
                SERVICE_NAME,
            ))
        }
    })
}

fn fmt_layer(
    format: LogFormat,
    writer: NonBlocking,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_span_events(FmtSpan::CLOSE)
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Installs the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init_logging(config: LoggingConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));
    let (writer, guard) = writer(&config)?;

    let otel_layer = match (&config.otlp_endpoint, config.otel_requested) {
        (Some(endpoint), _) => match otlp_tracer(&config, endpoint) {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(err) => {
                eprintln!("OTLP exporter unavailable, continuing without trace export: {err}");
                None
            }
        },
        (None, true) => {
            eprintln!("ENABLE_OTEL is set but no OTLP endpoint is configured");
            None
        }
        (None, false) => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer(config.format, writer, filter))
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(
        environment = %config.environment,
        format = %config.format,
        output = %config.output,
        otlp = config.otlp_endpoint.is_some(),
        "logging initialized"
    );
    Ok(guard)
}

/// Installs the batch exporter as the global provider and returns its tracer.
fn otlp_tracer(config: &LoggingConfig, endpoint: &str) -> Result<Tracer, TraceError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_timeout(config.otlp_timeout);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(config.sampler())
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(config.resource()),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Flushes spans still queued for export.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

pub fn request_span(route: &str) -> tracing::Span {
    tracing::info_span!("http_request", http.route = route)
}

pub fn completion_span(backend: &str, model_id: &str) -> tracing::Span {
    tracing::info_span!("completion", model.backend = backend, model.id = model_id)
}

pub fn workflow_span(steps: usize) -> tracing::Span {
    tracing::info_span!("workflow_run", workflow.steps = steps)
}

/// Prometheus metrics for production observability
///
/// Request, completion, workflow and error counters exposed at `/metrics`.
use crate::error::ErrorCode;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics registry instance
pub static METRICS: Lazy<Arc<MetricsCollector>> = Lazy::new(|| Arc::new(MetricsCollector::new()));

/// Labels for HTTP request metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Route name (e.g., "process_multi", "json_to_sheet")
    pub route: String,
    /// HTTP status code
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

/// Labels for model completion metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CompletionLabels {
    /// Backend name ("bedrock", "http")
    pub backend: String,
    /// "remote", "fallback" or "error"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    /// "SHEET" or "JSONTOSHEET"
    pub kind: String,
    /// "done" or "error"
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub code: String,
}

/// Central metrics collector with Prometheus registry
pub struct MetricsCollector {
    registry: RwLock<Registry>,

    /// Total HTTP requests by route and status
    pub http_requests_total: Family<RequestLabels, Counter>,

    /// Request duration in seconds by route
    pub http_request_duration_seconds: Family<RouteLabels, Histogram>,

    /// Requests currently being processed by route
    pub http_active_requests: Family<RouteLabels, Gauge>,

    /// Model calls by backend and outcome
    pub completion_calls_total: Family<CompletionLabels, Counter>,

    /// Latency of model calls that reached the backend
    pub completion_duration_seconds: Family<BackendLabels, Histogram>,

    /// Workflow steps by kind and final status
    pub workflow_steps_total: Family<StepLabels, Counter>,

    /// Error responses by reason code
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl MetricsCollector {
    /// Create a new metrics collector with all metrics registered
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "sheet_prompt_http_requests_total",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<RouteLabels, Histogram>::new_with_constructor(|| {
                // 10ms .. ~38s
                Histogram::new(exponential_buckets(0.01, 2.5, 10))
            });
        registry.register(
            "sheet_prompt_http_request_duration_seconds",
            "Request latency histogram in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_requests = Family::<RouteLabels, Gauge>::default();
        registry.register(
            "sheet_prompt_http_active_requests",
            "Number of requests currently being processed",
            http_active_requests.clone(),
        );

        let completion_calls_total = Family::<CompletionLabels, Counter>::default();
        registry.register(
            "sheet_prompt_completion_calls_total",
            "Model completion calls by backend and outcome",
            completion_calls_total.clone(),
        );

        let completion_duration_seconds =
            Family::<BackendLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 12))
            });
        registry.register(
            "sheet_prompt_completion_duration_seconds",
            "Model completion latency in seconds",
            completion_duration_seconds.clone(),
        );

        let workflow_steps_total = Family::<StepLabels, Counter>::default();
        registry.register(
            "sheet_prompt_workflow_steps_total",
            "Workflow steps by kind and final status",
            workflow_steps_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "sheet_prompt_errors_total",
            "Error responses by reason code",
            errors_total.clone(),
        );

        Self {
            registry: RwLock::new(registry),
            http_requests_total,
            http_request_duration_seconds,
            http_active_requests,
            completion_calls_total,
            completion_duration_seconds,
            workflow_steps_total,
            errors_total,
        }
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(err) = encode(&mut buffer, &registry) {
            tracing::error!(error = %err, "failed to encode metrics");
        }
        buffer
    }

    pub fn record_request(&self, route: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .get_or_create(&RequestLabels {
                route: route.to_string(),
                status: status.to_string(),
            })
            .inc();

        self.http_request_duration_seconds
            .get_or_create(&RouteLabels {
                route: route.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Record a model call; `duration` is absent for fallbacks.
    pub fn record_completion(&self, backend: &str, outcome: &str, duration: Option<Duration>) {
        self.completion_calls_total
            .get_or_create(&CompletionLabels {
                backend: backend.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        if let Some(duration) = duration {
            self.completion_duration_seconds
                .get_or_create(&BackendLabels {
                    backend: backend.to_string(),
                })
                .observe(duration.as_secs_f64());
        }
    }

    pub fn record_workflow_step(&self, kind: &str, status: &str) {
        self.workflow_steps_total
            .get_or_create(&StepLabels {
                kind: kind.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, code: ErrorCode) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                code: code.as_ref().to_string(),
            })
            .inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for request timing
///
/// Increments the active gauge on creation. `finish` records the status; a
/// guard dropped without `finish` counts as a 500.
pub struct RequestMetrics {
    route: String,
    start: Instant,
    completed: bool,
}

impl RequestMetrics {
    pub fn new(route: impl Into<String>) -> Self {
        let route = route.into();
        METRICS
            .http_active_requests
            .get_or_create(&RouteLabels {
                route: route.clone(),
            })
            .inc();

        Self {
            route,
            start: Instant::now(),
            completed: false,
        }
    }

    pub fn finish(mut self, status: u16) {
        self.complete(status);
    }

    fn complete(&mut self, status: u16) {
        if self.completed {
            return;
        }
        self.completed = true;
        METRICS.record_request(&self.route, status, self.start.elapsed());
        METRICS
            .http_active_requests
            .get_or_create(&RouteLabels {
                route: self.route.clone(),
            })
            .dec();
    }
}

impl Drop for RequestMetrics {
    fn drop(&mut self) {
        self.complete(500);
    }
}

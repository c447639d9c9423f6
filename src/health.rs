//! Liveness, readiness and per-component health for `/health`, `/ready` and
//! `/health/components`. None of these call the model; the diagnostics
//! endpoint does that.

use crate::config::{ModelProvider, ServerConfig};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Ordered from best to worst so the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but completions are likely to fall back.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn http_status(self) -> StatusCode {
        match self {
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub details: Value,
}

impl ComponentHealth {
    fn ok(details: Value) -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
            details,
        }
    }

    fn failing(status: HealthStatus, error: impl Into<String>, details: Value) -> Self {
        Self {
            status,
            error: Some(error.into()),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub ready: bool,
    pub version: &'static str,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_ready: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<&'static str, ComponentHealth>,
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let status = if self.ready {
            StatusCode::OK
        } else {
            self.status.http_status()
        };
        (status, Json(self)).into_response()
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    state: Arc<AppState>,
}

impl HealthChecker {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// The process is up; no component checks.
    pub fn liveness(&self) -> HealthReport {
        report(HealthStatus::Healthy, BTreeMap::new())
    }

    /// Component checks with the per-component detail dropped.
    pub fn readiness(&self) -> HealthReport {
        let components = self.components();
        let mut report = report(overall(&components), BTreeMap::new());
        report.not_ready = components
            .iter()
            .filter(|(_, health)| health.status == HealthStatus::Unhealthy)
            .map(|(name, _)| name.to_string())
            .collect();
        report
    }

    pub fn detailed(&self) -> HealthReport {
        let components = self.components();
        report(overall(&components), components)
    }

    fn components(&self) -> BTreeMap<&'static str, ComponentHealth> {
        BTreeMap::from([
            ("model", check_model_config(self.state.config())),
            ("prompt_store", self.check_prompt_store()),
        ])
    }

    fn check_prompt_store(&self) -> ComponentHealth {
        let records = self.state.prompts().len();
        let Some(path) = &self.state.config().prompt_store_path else {
            return ComponentHealth::ok(json!({ "backend": "memory", "records": records }));
        };
        let details = json!({
            "backend": "file",
            "path": path.display().to_string(),
            "records": records,
        });
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if dir.is_dir() {
            ComponentHealth::ok(details)
        } else {
            ComponentHealth::failing(
                HealthStatus::Unhealthy,
                format!("directory {} does not exist", dir.display()),
                details,
            )
        }
    }
}

fn check_model_config(config: &ServerConfig) -> ComponentHealth {
    let model = &config.model;
    let details = json!({
        "provider": model.provider.to_string(),
        "modelId": model.model_id,
        "endpointHost": model.endpoint_host(),
    });
    if model.provider == ModelProvider::Http && model.api_key.is_none() {
        return ComponentHealth::failing(
            HealthStatus::Degraded,
            "http provider has no API key",
            details,
        );
    }
    ComponentHealth::ok(details)
}

fn overall(components: &BTreeMap<&'static str, ComponentHealth>) -> HealthStatus {
    components
        .values()
        .map(|health| health.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

fn report(status: HealthStatus, components: BTreeMap<&'static str, ComponentHealth>) -> HealthReport {
    HealthReport {
        status,
        ready: status != HealthStatus::Unhealthy,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().timestamp(),
        not_ready: Vec::new(),
        components,
    }
}

pub async fn liveness_handler(State(checker): State<Arc<HealthChecker>>) -> HealthReport {
    checker.liveness()
}

pub async fn readiness_handler(State(checker): State<Arc<HealthChecker>>) -> HealthReport {
    checker.readiness()
}

pub async fn components_handler(State(checker): State<Arc<HealthChecker>>) -> HealthReport {
    checker.detailed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_status_wins() {
        let components = BTreeMap::from([
            ("a", ComponentHealth::ok(Value::Null)),
            (
                "b",
                ComponentHealth::failing(HealthStatus::Degraded, "slow", Value::Null),
            ),
        ]);
        assert_eq!(overall(&components), HealthStatus::Degraded);
        assert_eq!(overall(&BTreeMap::new()), HealthStatus::Healthy);
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
    }

    #[test]
    fn degraded_still_serves() {
        assert_eq!(HealthStatus::Degraded.http_status(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn http_provider_without_key_is_degraded() {
        let mut config = ServerConfig::default();
        config.model.provider = ModelProvider::Http;
        config.model.endpoint = Some("http://localhost:9000/v1/messages".into());
        assert_eq!(check_model_config(&config).status, HealthStatus::Degraded);

        config.model.api_key = Some("k".into());
        assert_eq!(check_model_config(&config).status, HealthStatus::Healthy);
    }
}

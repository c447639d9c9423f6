//! HTTP routes.

use crate::error::{ApiError, ErrorCode};
use crate::health::{self, HealthChecker};
use crate::metrics::{METRICS, RequestMetrics};
use crate::prompts::{NewPrompt, PromptRecord, ValidatedPrompt};
use crate::render::XLSX_CONTENT_TYPE;
use crate::service::{
    CustomizeRequest, CustomizeResult, JsonToSheetRequest, OutputMode, ProcessMeta, SheetListing,
    UploadedFile, WorkflowResponse,
};
use crate::shutdown::ShutdownCoordinator;
use crate::state::AppState;
use crate::utils::content_disposition;
use crate::workflow::WorkflowStep;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, MatchedPath, Multipart, Query, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;

pub const USED_REMOTE_MODEL_HEADER: &str = "x-used-remote-model";

/// API, health and metrics routes with request tracking.
pub fn router(state: Arc<AppState>, shutdown: Option<Arc<ShutdownCoordinator>>) -> Router {
    let upload_limit = state.config().max_upload_bytes;
    let checker = Arc::new(HealthChecker::new(state.clone()));

    let api = Router::new()
        .route("/api/excel/process-multi", post(process_multi))
        .route("/api/excel/list-sheets", post(list_sheets))
        .route("/api/excel/list-sheet-info", post(list_sheet_info))
        .route("/api/json-to-sheet", post(json_to_sheet))
        .route("/api/prompt/save", post(save_prompt))
        .route("/api/prompt/list", get(list_prompts))
        .route("/api/bedrock/prompt/customize", post(customize_prompt))
        .route("/api/bedrock/diagnostics", get(diagnostics))
        .route("/api/workflow/run", post(run_workflow))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state);

    let ops = Router::new()
        .route("/health", get(health::liveness_handler))
        .route("/ready", get(health::readiness_handler))
        .route("/health/components", get(health::components_handler))
        .with_state(checker);

    api.merge(ops)
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(move |request: Request, next: Next| {
            let shutdown = shutdown.clone();
            async move {
                let _in_flight = shutdown.as_ref().map(|coordinator| coordinator.track_request());
                track_request(request, next).await
            }
        }))
}

async fn track_request(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let span = crate::logging::request_span(&route);
    let metrics = RequestMetrics::new(route);
    let response = next.run(request).instrument(span).await;
    metrics.finish(response.status().as_u16());
    response
}

async fn metrics_handler() -> (StatusCode, String) {
    (StatusCode::OK, METRICS.encode())
}

/// Files plus text parts of a multipart body.
#[derive(Debug, Default)]
struct MultipartForm {
    files: Vec<UploadedFile>,
    fields: HashMap<String, String>,
}

impl MultipartForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::invalid_request(format!("malformed multipart body: {err}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" || name == "files" {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::invalid_request(format!("failed to read upload: {err}"))
                })?;
                form.files.push(UploadedFile {
                    name: file_name,
                    bytes: bytes.to_vec(),
                });
            } else {
                let text = field.text().await.map_err(|err| {
                    ApiError::invalid_request(format!("failed to read part '{name}': {err}"))
                })?;
                form.fields.insert(name, text);
            }
        }
        Ok(form)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::invalid_request(rejection.body_text()))
}

#[derive(Debug, Default, Deserialize)]
struct ModeQuery {
    mode: Option<String>,
}

impl ModeQuery {
    fn resolve(&self, form: Option<&str>) -> Result<OutputMode, ApiError> {
        self.mode
            .as_deref()
            .or(form)
            .unwrap_or_default()
            .parse()
    }
}

async fn process_multi(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut form = MultipartForm::read(multipart).await?;
    let mode = query.resolve(form.field("mode"))?;
    let meta = ProcessMeta::parse(form.field("meta"))?;
    let prompt = form.fields.remove("prompt").unwrap_or_default();
    let files = std::mem::take(&mut form.files);

    let result = state.service().process_multi(files, &prompt, meta).await?;
    Ok(Json(result.to_mode_value(mode)))
}

async fn list_sheets(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<SheetListing>, ApiError> {
    inspect(state, multipart, false).await
}

async fn list_sheet_info(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<SheetListing>, ApiError> {
    inspect(state, multipart, true).await
}

async fn inspect(
    state: Arc<AppState>,
    multipart: Multipart,
    with_columns: bool,
) -> Result<Json<SheetListing>, ApiError> {
    let mut form = MultipartForm::read(multipart).await?;
    let password = form.fields.remove("password");
    let Some(file) = form.files.into_iter().next() else {
        return Err(ApiError::builder(ErrorCode::FilesEmpty)
            .message("file part is required")
            .build());
    };
    let listing = state
        .service()
        .inspect_workbook(file, password, with_columns)
        .await?;
    Ok(Json(listing))
}

async fn json_to_sheet(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JsonToSheetRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(body)?;
    let artifact = state.service().json_to_sheet(request).await?;

    let disposition = HeaderValue::from_str(&content_disposition(&artifact.file_name))
        .map_err(|err| ApiError::internal(format!("invalid content disposition: {err}")))?;
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(XLSX_CONTENT_TYPE)),
        (header::CONTENT_DISPOSITION, disposition),
        (
            HeaderName::from_static(USED_REMOTE_MODEL_HEADER),
            HeaderValue::from_static(if artifact.used_remote_model {
                "true"
            } else {
                "false"
            }),
        ),
    ];
    Ok((headers, artifact.bytes).into_response())
}

async fn save_prompt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewPrompt>, JsonRejection>,
) -> Result<Json<PromptRecord>, ApiError> {
    let prompt = ValidatedPrompt::from_request(json_body(body)?)?;
    let store = state.prompts().clone();
    let record = tokio::task::spawn_blocking(move || store.save(prompt))
        .await
        .map_err(|err| ApiError::internal(format!("prompt store task failed: {err}")))??;
    tracing::info!(id = record.id, kind = %record.kind, "prompt saved");
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn list_prompts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PromptRecord>>, ApiError> {
    Ok(Json(state.prompts().list(query.kind.as_deref())?))
}

async fn customize_prompt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CustomizeRequest>, JsonRejection>,
) -> Result<Json<CustomizeResult>, ApiError> {
    let request = json_body(body)?;
    Ok(Json(state.service().customize_prompt(request).await?))
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report =
        crate::completion::diagnostics::diagnose(&state.config().model, state.prober()).await;
    Json(report)
}

async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeQuery>,
    multipart: Multipart,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let mut form = MultipartForm::read(multipart).await?;
    let mode = query.resolve(form.field("mode"))?;
    let meta = ProcessMeta::parse(form.field("meta"))?;
    let steps: Vec<WorkflowStep> = match form.field("steps") {
        Some(raw) => serde_json::from_str(raw).map_err(|err| {
            ApiError::invalid_request(format!("steps is not a valid step list: {err}"))
        })?,
        None => Vec::new(),
    };
    let files = std::mem::take(&mut form.files);

    let response = state
        .service()
        .run_workflow(steps, files, meta, mode)
        .await?;
    Ok(Json(response))
}

//! Request services behind the HTTP handlers: multi-workbook prompting, sheet
//! listing, JSON-to-sheet rendering, prompt customization and workflow runs.

use crate::completion::{CompletionInvoker, CompletionRequest};
use crate::config::LimitsConfig;
use crate::context::{self, ContextLimits, ContextSource, RowRecord};
use crate::error::{ApiError, ErrorCode, open_error};
use crate::extract;
use crate::filename;
use crate::render::{self, SheetArtifact};
use crate::tokens::{self, AvailableColumns};
use crate::workbook::{OpenError, Workbook};
use crate::workflow::{self, Orchestrator, SheetInputStatus, StepExecutor, WorkflowStep};
use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

pub const SCOPE_ALL_FILES: &str = "ALL_FILES";
pub const DEFAULT_SHEET_FILE_NAME: &str = "json_to_sheet";
const CUSTOMIZE_MAX_TOKENS: u32 = 512;
const WORKFLOW_DEFAULT_ROWS: usize = 200;
const WORKFLOW_DEFAULT_COLS: usize = 30;

const DATA_LINKING_SYSTEM: &str = "You link records across spreadsheets that are given to you as TSV lines.
- Answer the user's request using only the rows provided, across every file and sheet.
- When asked to join on a key and return values from related rows, match rows by exact text equality of the TSV values.
- Prefer a compact JSON result whose keys are the requested key values and whose values are the fields found.
- When a key has no match, use the string \"정보 없음\" as its value.
- When a sheet appears to have a header row, take the column names from its first row.";

const JSON_TO_SHEET_SYSTEM: &str =
    "You transform JSON into a well-structured tabular dataset suitable for Excel.";

const JSON_TO_SHEET_INSTRUCTION: &str = "Convert the JSON in the Context into one flat table. \
Reply with a JSON array of objects and nothing else. \
Every object is one row and all rows share the same keys, which become the columns. \
Flatten nested structures into dot.notation keys. \
Wrap a single object in an array of one element. \
Keep the important fields and infer sensible columns where needed.";

const CUSTOMIZE_SYSTEM: &str = "You are a prompt engineering assistant. Rewrite the prompt you are given so that it is unambiguous, actionable and well suited to a language model, without changing its intent.";

/// An uploaded file as received; `name` may be mis-encoded.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: Some(name.into()),
            bytes,
        }
    }
}

/// The `meta` part of multipart requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMeta {
    #[serde(default)]
    pub passwords: HashMap<String, String>,
    #[serde(default)]
    pub sheet_names: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub max_rows_per_sheet: Option<usize>,
    #[serde(default)]
    pub max_cols_per_row: Option<usize>,
}

impl ProcessMeta {
    /// Parses the raw part; a missing or blank part is the empty meta.
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Self::default()),
            Some(text) => serde_json::from_str(text).map_err(|err| {
                ApiError::builder(ErrorCode::InvalidRequest)
                    .message(format!("meta is not valid JSON: {err}"))
                    .operation("parse_meta")
                    .build()
            }),
        }
    }

    /// Rekeys both maps by canonical file name.
    fn normalized(self) -> Self {
        Self {
            passwords: filename::normalize_keys(self.passwords),
            sheet_names: filename::normalize_keys(self.sheet_names),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Detail,
    Json,
}

impl FromStr for OutputMode {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "detail" => Ok(OutputMode::Detail),
            "json" => Ok(OutputMode::Json),
            other => Err(ApiError::invalid_request(format!(
                "unknown mode '{other}', expected detail or json"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenedFile {
    pub key: String,
    pub workbook: Workbook,
    pub allowed_sheets: Option<Vec<String>>,
}

/// Opened uploads of one request.
#[derive(Debug, Clone, Default)]
pub struct OpenedUploads {
    pub files: Vec<OpenedFile>,
}

impl OpenedUploads {
    /// Opens every file; the first failure aborts with its reason code.
    pub async fn open_all(files: Vec<UploadedFile>, meta: &ProcessMeta) -> Result<Self, ApiError> {
        if files.is_empty() {
            return Err(ApiError::builder(ErrorCode::FilesEmpty)
                .message("files must not be empty")
                .build());
        }
        ensure_non_empty(&files)?;
        let mut opened = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            let (key, result) = open_one(index, file, meta).await;
            let workbook = result.map_err(|err| open_error(&key, &err))?;
            opened.push(opened_file(key, workbook, meta));
        }
        Ok(Self { files: opened })
    }

    /// Opens what it can and reports per-file readiness instead of failing.
    pub async fn open_lenient(
        files: Vec<UploadedFile>,
        meta: &ProcessMeta,
    ) -> (Self, Vec<SheetInputStatus>) {
        let mut opened = Vec::new();
        let mut statuses = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            if file.bytes.is_empty() {
                statuses.push(SheetInputStatus {
                    opened: false,
                    password_locked: false,
                });
                continue;
            }
            let (key, result) = open_one(index, file, meta).await;
            match result {
                Ok(workbook) => {
                    statuses.push(SheetInputStatus {
                        opened: true,
                        password_locked: false,
                    });
                    opened.push(opened_file(key, workbook, meta));
                }
                Err(err) => {
                    tracing::info!(file = %key, error = %err, "upload not usable for workflow");
                    statuses.push(SheetInputStatus {
                        opened: false,
                        password_locked: matches!(
                            err,
                            OpenError::NeedsPassword | OpenError::PasswordInvalid(_)
                        ),
                    });
                }
            }
        }
        (Self { files: opened }, statuses)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn sources(&self) -> Vec<ContextSource<'_>> {
        self.files
            .iter()
            .map(|file| ContextSource {
                key: &file.key,
                workbook: &file.workbook,
                allowed_sheets: file.allowed_sheets.as_deref(),
            })
            .collect()
    }

    fn selected_sheets(&self) -> impl Iterator<Item = &crate::workbook::Sheet> {
        self.files.iter().flat_map(|file| {
            file.workbook.sheets().iter().filter(move |sheet| {
                file.allowed_sheets
                    .as_ref()
                    .is_none_or(|allowed| allowed.iter().any(|name| name == sheet.name()))
            })
        })
    }

    /// Canonical sheet to header columns over the selected sheets of every file.
    pub fn available_columns(&self) -> AvailableColumns {
        let mut available = AvailableColumns::new();
        for sheet in self.selected_sheets() {
            available.add_sheet(sheet.name(), sheet.header_columns());
        }
        available
    }

    /// Largest used row count and column count over the selected sheets.
    pub fn used_extent(&self) -> (usize, usize) {
        self.selected_sheets().fold((0, 0), |(rows, cols), sheet| {
            (
                rows.max(sheet.row_count() as usize),
                cols.max(sheet.column_count() as usize),
            )
        })
    }
}

fn ensure_non_empty(files: &[UploadedFile]) -> Result<(), ApiError> {
    if let Some(file) = files.iter().find(|file| file.bytes.is_empty()) {
        let mut builder = ApiError::builder(ErrorCode::FileEmpty).message("one of files is empty");
        if let Some(name) = &file.name {
            builder = builder.file_name(filename::normalize(name));
        }
        return Err(builder.build());
    }
    Ok(())
}

fn file_key(index: usize, name: Option<&str>) -> String {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => filename::normalize(name),
        None => format!("file{index}"),
    }
}

async fn open_one(
    index: usize,
    file: UploadedFile,
    meta: &ProcessMeta,
) -> (String, Result<Workbook, OpenError>) {
    let key = file_key(index, file.name.as_deref());
    let password = meta.passwords.get(&key).cloned();
    tracing::debug!(
        file = %key,
        bytes = file.bytes.len(),
        has_password = password.is_some(),
        "opening upload"
    );
    let result = Workbook::open_blocking(file.bytes, password).await;
    (key, result)
}

fn opened_file(key: String, workbook: Workbook, meta: &ProcessMeta) -> OpenedFile {
    let allowed_sheets = meta.sheet_names.get(&key).cloned();
    OpenedFile {
        key,
        workbook,
        allowed_sheets,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub scope: String,
    pub rows: Vec<RowRecord>,
    pub output_text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiProcessResult {
    pub model_id: String,
    pub used_bedrock: bool,
    pub results: Vec<ProcessResult>,
}

impl MultiProcessResult {
    pub fn output_text(&self) -> &str {
        self.results
            .first()
            .map(|result| result.output_text.as_str())
            .unwrap_or_default()
    }

    /// Response body for `mode`: the full result, or the extracted JSON value.
    pub fn to_mode_value(&self, mode: OutputMode) -> Value {
        match mode {
            OutputMode::Detail => serde_json::to_value(self).unwrap_or(Value::Null),
            OutputMode::Json => extract::json_or_result(self.output_text()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetListing {
    pub sheets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns_by_sheet: Option<indexmap::IndexMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_counts: Option<indexmap::IndexMap<String, u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_counts: Option<indexmap::IndexMap<String, u32>>,
    pub needs_password: bool,
}

/// Body of `POST /api/json-to-sheet`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonToSheetRequest {
    #[serde(default)]
    pub json: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Body of `POST /api/bedrock/prompt/customize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeResult {
    pub optimized_prompt: String,
    pub model_id: String,
    pub used_remote_model: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowArtifact {
    pub step_index: usize,
    pub file_name: String,
    pub content_base64: String,
    pub used_remote_model: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub succeeded: bool,
    pub steps: Vec<WorkflowStep>,
    pub transitions: Vec<workflow::StepTransition>,
    pub artifacts: Vec<WorkflowArtifact>,
}

fn prompt_empty() -> ApiError {
    ApiError::builder(ErrorCode::PromptEmpty)
        .message("prompt must not be blank")
        .build()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Sheet file name from an optional user-supplied name.
pub fn sheet_file_name(sheet_name: Option<&str>) -> String {
    format!(
        "{}.xlsx",
        non_blank(sheet_name).unwrap_or(DEFAULT_SHEET_FILE_NAME)
    )
}

#[derive(Clone)]
pub struct SheetPromptService {
    invoker: CompletionInvoker,
    limits: LimitsConfig,
}

impl SheetPromptService {
    pub fn new(invoker: CompletionInvoker, limits: LimitsConfig) -> Self {
        Self { invoker, limits }
    }

    pub fn invoker(&self) -> &CompletionInvoker {
        &self.invoker
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Opens the uploads and runs `prompt` over their combined context.
    pub async fn process_multi(
        &self,
        files: Vec<UploadedFile>,
        prompt: &str,
        meta: ProcessMeta,
    ) -> Result<MultiProcessResult, ApiError> {
        if files.is_empty() {
            return Err(ApiError::builder(ErrorCode::FilesEmpty)
                .message("files must not be empty")
                .build());
        }
        if prompt.trim().is_empty() {
            return Err(prompt_empty());
        }
        let meta = meta.normalized();
        let uploads = OpenedUploads::open_all(files, &meta).await?;
        let mut limits = ContextLimits::from(&self.limits);
        if let Some(rows) = meta.max_rows_per_sheet {
            limits.max_rows_per_sheet = rows;
        }
        if let Some(cols) = meta.max_cols_per_row {
            limits.max_cols_per_row = cols;
        }
        self.prompt_uploads(&uploads, prompt, &limits).await
    }

    /// Validates and substitutes tokens, serializes the context and invokes the model.
    pub async fn prompt_uploads(
        &self,
        uploads: &OpenedUploads,
        prompt: &str,
        limits: &ContextLimits,
    ) -> Result<MultiProcessResult, ApiError> {
        if uploads.is_empty() {
            return Err(ApiError::builder(ErrorCode::FilesEmpty)
                .message("files must not be empty")
                .build());
        }
        if prompt.trim().is_empty() {
            return Err(prompt_empty());
        }
        tokens::resolve(prompt, &uploads.available_columns())?;
        let prompt = tokens::substitute(prompt);

        let serialized = context::serialize(&uploads.sources(), limits);
        tracing::info!(
            files = uploads.files.len(),
            rows = serialized.rows.len(),
            context_chars = serialized.text.chars().count(),
            truncated = serialized.truncated,
            "prompting over uploaded workbooks"
        );
        let completion = self
            .invoker
            .complete(
                Some(DATA_LINKING_SYSTEM),
                &prompt,
                Some(&serialized.text),
                self.limits.max_tokens,
                Some(self.limits.temperature),
            )
            .await;

        Ok(MultiProcessResult {
            model_id: self.invoker.model_id().to_string(),
            used_bedrock: completion.used_remote_model,
            results: vec![ProcessResult {
                scope: SCOPE_ALL_FILES.to_string(),
                rows: serialized.rows,
                output_text: completion.output_text,
            }],
        })
    }

    /// Sheet names, optionally with header columns. A locked workbook without
    /// a password is reported with `needs_password` instead of an error.
    pub async fn inspect_workbook(
        &self,
        file: UploadedFile,
        password: Option<String>,
        with_columns: bool,
    ) -> Result<SheetListing, ApiError> {
        let key = file_key(0, file.name.as_deref());
        if file.bytes.is_empty() {
            return Err(ApiError::builder(ErrorCode::FileEmpty)
                .message("file is empty")
                .file_name(key)
                .build());
        }
        let password = password.filter(|p| !p.trim().is_empty());
        match Workbook::open_blocking(file.bytes, password).await {
            Ok(workbook) => {
                let info = workbook.info();
                Ok(SheetListing {
                    sheets: info.sheets,
                    columns_by_sheet: with_columns.then_some(info.columns_by_sheet),
                    row_counts: with_columns.then_some(info.row_counts),
                    column_counts: with_columns.then_some(info.column_counts),
                    needs_password: false,
                })
            }
            Err(OpenError::NeedsPassword) => Ok(SheetListing {
                sheets: Vec::new(),
                columns_by_sheet: with_columns.then(indexmap::IndexMap::new),
                row_counts: None,
                column_counts: None,
                needs_password: true,
            }),
            Err(err) => Err(open_error(&key, &err)),
        }
    }

    /// Asks the model to flatten JSON into rows and renders them. Model failure
    /// or an empty answer tabulates the input JSON itself.
    pub async fn json_to_sheet(&self, request: JsonToSheetRequest) -> Result<SheetArtifact, ApiError> {
        let Some(json_input) = non_blank(request.json.as_deref()) else {
            return Err(ApiError::builder(ErrorCode::JsonEmpty)
                .message("json must not be blank")
                .build());
        };
        let Some(prompt) = non_blank(request.prompt.as_deref()) else {
            return Err(prompt_empty());
        };

        let instruction = format!("{JSON_TO_SHEET_INSTRUCTION}\n\nUser instruction: \n{prompt}");
        let mut user_text = instruction;
        user_text.push_str("\n\nContext (JSON):\n");
        user_text.push_str(json_input);
        let completion_request =
            CompletionRequest::new(user_text, request.max_tokens.unwrap_or(self.limits.max_tokens))
                .system(JSON_TO_SHEET_SYSTEM)
                .temperature(request.temperature.unwrap_or(self.limits.temperature));

        let completion = self
            .invoker
            .complete_or_else(&completion_request, String::new)
            .await;
        let model_text = completion.output_text.trim();
        let (value, used_remote_model) = if model_text.is_empty() {
            tracing::info!("no usable model output, tabulating input JSON");
            (extract::extract(json_input), false)
        } else {
            (
                extract::extract(model_text).or_else(|| extract::extract(json_input)),
                completion.used_remote_model,
            )
        };

        let table = render::to_table(value.as_ref());
        let bytes = tokio::task::spawn_blocking(move || render::write_xlsx(&table))
            .await
            .map_err(|err| ApiError::internal(format!("sheet writer aborted: {err}")))?
            .map_err(|err| ApiError::internal(format!("failed to render sheet: {err:#}")))?;

        Ok(SheetArtifact {
            file_name: sheet_file_name(request.sheet_name.as_deref()),
            bytes,
            used_remote_model,
        })
    }

    /// Rewrites a prompt for clarity. Failure yields a deterministic template.
    pub async fn customize_prompt(&self, request: CustomizeRequest) -> Result<CustomizeResult, ApiError> {
        let Some(prompt) = non_blank(request.prompt.as_deref()) else {
            return Err(prompt_empty());
        };
        let instructions = non_blank(request.instructions.as_deref());

        let mut user_text = String::from(
            "Optimize the prompt below. Restructure it into steps where that helps and make its inputs and outputs explicit.\n\nPrompt: \n",
        );
        user_text.push_str(prompt);
        if let Some(extra) = instructions {
            user_text.push_str("\n\nExtra instructions: ");
            user_text.push_str(extra);
        }
        user_text.push_str("\n\nReply with the optimized prompt text only.");

        let completion_request = CompletionRequest::new(
            user_text,
            request.max_tokens.unwrap_or(CUSTOMIZE_MAX_TOKENS),
        )
        .system(CUSTOMIZE_SYSTEM);
        let completion = self
            .invoker
            .complete_or_else(&completion_request, || rewrite_template(prompt, instructions))
            .await;

        let optimized_prompt = if completion.output_text.trim().is_empty() {
            prompt.to_string()
        } else {
            completion.output_text.trim().to_string()
        };
        Ok(CustomizeResult {
            optimized_prompt,
            model_id: self.invoker.model_id().to_string(),
            used_remote_model: completion.used_remote_model,
        })
    }

    /// Checks readiness and runs every step against the uploads.
    pub async fn run_workflow(
        &self,
        steps: Vec<WorkflowStep>,
        files: Vec<UploadedFile>,
        meta: ProcessMeta,
        mode: OutputMode,
    ) -> Result<WorkflowResponse, ApiError> {
        let meta = meta.normalized();
        let (uploads, statuses) = OpenedUploads::open_lenient(files, &meta).await;
        if !workflow::can_run(&steps, &statuses) {
            return Err(ApiError::builder(ErrorCode::WorkflowNotReady)
                .message("workflow needs at least two steps and a ready first step")
                .param("steps", steps.len())
                .suggestion("Upload readable workbooks for a SHEET first step, or set jsonText for a JSONTOSHEET first step")
                .build());
        }

        let (rows, cols) = uploads.used_extent();
        let limits = ContextLimits {
            max_rows_per_sheet: if rows == 0 { WORKFLOW_DEFAULT_ROWS } else { rows },
            max_cols_per_row: if cols == 0 { WORKFLOW_DEFAULT_COLS } else { cols },
            max_chars: self.limits.max_context_chars,
        };
        let available = uploads.available_columns();
        let executor = PipelineExecutor {
            service: self,
            uploads: &uploads,
            limits,
            mode,
        };
        let run = Orchestrator::new(&executor, &available).run(&steps).await;

        Ok(WorkflowResponse {
            succeeded: run.succeeded(),
            artifacts: run
                .artifacts
                .iter()
                .map(|(index, artifact)| WorkflowArtifact {
                    step_index: *index,
                    file_name: artifact.file_name.clone(),
                    content_base64: STANDARD.encode(&artifact.bytes),
                    used_remote_model: artifact.used_remote_model,
                })
                .collect(),
            steps: run.steps,
            transitions: run.transitions,
        })
    }
}

fn rewrite_template(prompt: &str, instructions: Option<&str>) -> String {
    let mut text = String::from(
        "You are an expert assistant. Rewrite the user prompt to be clear, specific, and goal-oriented.\n\
         Constraints: respond concisely and include explicit success criteria.\n\
         User Prompt: \n",
    );
    text.push_str(prompt);
    if let Some(extra) = instructions {
        text.push_str("\nAdditional Instructions: ");
        text.push_str(extra);
    }
    text
}

/// Runs workflow steps through the service with the uploads of one request.
pub struct PipelineExecutor<'a> {
    service: &'a SheetPromptService,
    uploads: &'a OpenedUploads,
    limits: ContextLimits,
    mode: OutputMode,
}

#[async_trait]
impl StepExecutor for PipelineExecutor<'_> {
    async fn run_tabular(&self, prompt: &str) -> anyhow::Result<String> {
        let result = self
            .service
            .prompt_uploads(self.uploads, prompt, &self.limits)
            .await
            .map_err(|err| anyhow!(err.message))?;
        Ok(match self.mode {
            OutputMode::Detail => result.output_text().to_string(),
            OutputMode::Json => {
                serde_json::to_string(&result.to_mode_value(OutputMode::Json))?
            }
        })
    }

    async fn run_json_to_sheet(
        &self,
        prompt: &str,
        json_input: &str,
        sheet_name: Option<&str>,
    ) -> anyhow::Result<SheetArtifact> {
        self.service
            .json_to_sheet(JsonToSheetRequest {
                json: Some(json_input.to_string()),
                prompt: Some(prompt.to_string()),
                sheet_name: sheet_name.map(str::to_string),
                max_tokens: None,
                temperature: None,
            })
            .await
            .map_err(|err| anyhow!(err.message))
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Write as _};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use ms_offcrypto_writer::Ecma376AgileWriter;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sheet_prompt::ServerConfig;
use sheet_prompt::completion::diagnostics::Prober;
use sheet_prompt::completion::{CompletionBackend, CompletionInvoker, FailureKind, InvokeError};
use sheet_prompt::config::LimitsConfig;
use sheet_prompt::prompts::{InMemoryPromptStore, PromptStore};
use sheet_prompt::service::SheetPromptService;
use sheet_prompt::state::AppState;
use umya_spreadsheet::{self, Spreadsheet};

pub const FAKE_MODEL_ID: &str = "fake.model-v1";

/// Serializes a workbook built by `f` to xlsx bytes.
pub fn xlsx_bytes<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut Spreadsheet),
{
    let mut book = umya_spreadsheet::new_file();
    f(&mut book);
    let mut cursor = Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut cursor).expect("write workbook");
    cursor.into_inner()
}

/// Fills `sheet` row by row from `rows`, starting at A1.
pub fn fill(book: &mut Spreadsheet, sheet: &str, rows: &[&[&str]]) {
    if book.get_sheet_by_name(sheet).is_none() {
        book.new_sheet(sheet).expect("add sheet");
    }
    let ws = book.get_sheet_by_name_mut(sheet).expect("sheet exists");
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            ws.get_cell_mut((c as u32 + 1, r as u32 + 1))
                .set_value(value.to_string());
        }
    }
}

/// `Sheet1` renamed to `Sales` with a header row and two data rows.
pub fn sales_workbook() -> Vec<u8> {
    xlsx_bytes(|book| {
        book.get_sheet_by_name_mut("Sheet1")
            .expect("default sheet")
            .set_name("Sales");
        fill(
            book,
            "Sales",
            &[&["Name", "Amount"], &["Kim", "100"], &["Lee", "250"]],
        );
    })
}

/// Two sheets: `Customers` (ID, City) and `Orders` (ID, Total).
pub fn linked_workbook() -> Vec<u8> {
    xlsx_bytes(|book| {
        book.get_sheet_by_name_mut("Sheet1")
            .expect("default sheet")
            .set_name("Customers");
        fill(
            book,
            "Customers",
            &[&["ID", "City"], &["C1", "Seoul"], &["C2", "Busan"]],
        );
        fill(book, "Orders", &[&["ID", "Total"], &["C1", "30"]]);
    })
}

/// Agile-encrypts plain workbook bytes with `password`.
pub fn encrypt(plain: &[u8], password: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut agile = Ecma376AgileWriter::create(&mut rand::rng(), password, &mut cursor)
        .expect("create agile writer");
    agile.write_all(plain).expect("write package");
    agile.finalize().expect("finalize package");
    cursor.into_inner()
}

/// Reads back a rendered workbook as `(sheet name, rows of cell values)`.
pub fn read_sheet(bytes: &[u8]) -> (String, Vec<Vec<String>>) {
    let book = umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes.to_vec()), true)
        .expect("read workbook");
    let sheet = &book.get_sheet_collection()[0];
    let (max_col, max_row) = sheet.get_highest_column_and_row();
    let rows = (1..=max_row)
        .map(|r| {
            (1..=max_col)
                .map(|c| sheet.get_value((c, r)))
                .collect::<Vec<_>>()
        })
        .collect();
    (sheet.get_name().to_string(), rows)
}

#[derive(Debug, Clone)]
pub enum FakeReply {
    Text(String),
    Fail(FailureKind),
}

/// Completion backend that replays scripted replies and records request bodies.
#[derive(Default)]
pub struct FakeBackend {
    replies: Mutex<VecDeque<FakeReply>>,
    default_reply: Option<String>,
    requests: Mutex<Vec<Value>>,
}

impl FakeBackend {
    /// Always answers with `text`.
    pub fn replying(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            default_reply: Some(text.into()),
            ..Self::default()
        })
    }

    /// Every call fails with `kind`.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers with `replies` in order, then fails.
    pub fn scripted(replies: Vec<FakeReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    /// User text of the n-th recorded request.
    pub fn user_text(&self, n: usize) -> String {
        self.requests.lock()[n]
            .pointer("/messages/0/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl CompletionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn model_id(&self) -> &str {
        FAKE_MODEL_ID
    }

    async fn invoke(&self, body: &Value) -> Result<Value, InvokeError> {
        self.requests.lock().push(body.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .or_else(|| self.default_reply.clone().map(FakeReply::Text));
        match reply {
            Some(FakeReply::Text(text)) => Ok(json!({
                "content": [{ "type": "text", "text": text }],
            })),
            Some(FakeReply::Fail(kind)) => Err(InvokeError::new(kind, "scripted failure")),
            None => Err(InvokeError::new(FailureKind::Transport, "connection refused")),
        }
    }
}

/// Prober with a fixed environment and no network.
#[derive(Default)]
pub struct FakeProber {
    pub env: HashMap<String, String>,
    pub files: HashMap<String, String>,
    pub credentials: bool,
    pub dns: bool,
    pub port: bool,
    pub invoke: Option<Result<(), InvokeError>>,
}

#[async_trait]
impl Prober for FakeProber {
    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        self.files.get(&path.display().to_string()).cloned()
    }

    async fn credentials_available(&self) -> bool {
        self.credentials
    }

    async fn dns_resolvable(&self, _host: &str) -> bool {
        self.dns
    }

    async fn port_reachable(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        self.port
    }

    async fn try_invoke(&self) -> Result<(), InvokeError> {
        self.invoke.clone().unwrap_or(Ok(()))
    }
}

pub fn service(backend: Arc<FakeBackend>) -> SheetPromptService {
    SheetPromptService::new(CompletionInvoker::new(backend), LimitsConfig::default())
}

pub fn app_state(backend: Arc<FakeBackend>) -> Arc<AppState> {
    app_state_with(backend, ServerConfig::default(), FakeProber::default())
}

pub fn app_state_with(
    backend: Arc<FakeBackend>,
    config: ServerConfig,
    prober: FakeProber,
) -> Arc<AppState> {
    let prompts: Arc<dyn PromptStore> = Arc::new(InMemoryPromptStore::new());
    Arc::new(AppState::with_components(
        Arc::new(config),
        CompletionInvoker::new(backend),
        prompts,
        Arc::new(prober),
    ))
}

pub fn router(backend: Arc<FakeBackend>) -> Router {
    sheet_prompt::server::router(app_state(backend), None)
}

/// Hand-built `multipart/form-data` body.
pub struct MultipartBody {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self {
            boundary: "sheetpromptboundary7MA4YWxkTrZu0gW".to_string(),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (self.content_type(), self.body)
    }
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

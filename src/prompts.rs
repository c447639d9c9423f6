//! Saved prompts: append-only records listed newest first.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PROMPT_TYPE: &str = "SHEET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRecord {
    pub id: u64,
    pub prompt: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request body of `POST /api/prompt/save`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPrompt {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("failed to read prompt store {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt store {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write prompt store {path:?}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Trimmed prompt, upper-cased type defaulting to `SHEET`, blank name as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPrompt {
    pub prompt: String,
    pub kind: String,
    pub name: Option<String>,
}

impl ValidatedPrompt {
    pub fn from_request(request: NewPrompt) -> Result<Self, StoreError> {
        let prompt = request.prompt.unwrap_or_default().trim().to_string();
        if prompt.is_empty() {
            return Err(StoreError::EmptyPrompt);
        }
        let kind = request
            .kind
            .map(|k| k.trim().to_uppercase())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_PROMPT_TYPE.to_string());
        let name = request
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        Ok(Self { prompt, kind, name })
    }
}

pub trait PromptStore: Send + Sync {
    fn save(&self, prompt: ValidatedPrompt) -> Result<PromptRecord, StoreError>;

    /// Newest first; `kind` matches case-insensitively.
    fn list(&self, kind: Option<&str>) -> Result<Vec<PromptRecord>, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn newest_first(records: &[PromptRecord], kind: Option<&str>) -> Vec<PromptRecord> {
    let kind = kind.map(str::trim).filter(|k| !k.is_empty());
    let mut out: Vec<PromptRecord> = records
        .iter()
        .filter(|r| kind.is_none_or(|k| r.kind.eq_ignore_ascii_case(k)))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    out
}

fn next_record(records: &[PromptRecord], prompt: ValidatedPrompt) -> PromptRecord {
    PromptRecord {
        id: records.iter().map(|r| r.id).max().unwrap_or(0) + 1,
        prompt: prompt.prompt,
        kind: prompt.kind,
        name: prompt.name,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPromptStore {
    records: RwLock<Vec<PromptRecord>>,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PromptStore for InMemoryPromptStore {
    fn save(&self, prompt: ValidatedPrompt) -> Result<PromptRecord, StoreError> {
        let mut records = self.records.write();
        let record = next_record(&records, prompt);
        records.push(record.clone());
        Ok(record)
    }

    fn list(&self, kind: Option<&str>) -> Result<Vec<PromptRecord>, StoreError> {
        Ok(newest_first(&self.records.read(), kind))
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// Keeps every record in one JSON array file, rewritten atomically on save.
#[derive(Debug)]
pub struct JsonFilePromptStore {
    path: PathBuf,
    records: RwLock<Vec<PromptRecord>>,
}

impl JsonFilePromptStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            Vec::new()
        };
        tracing::info!(path = %path.display(), records = records.len(), "prompt store opened");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &[PromptRecord]) -> Result<(), StoreError> {
        let write_err = |message: String| StoreError::Write {
            path: self.path.clone(),
            message,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|err| write_err(err.to_string()))?;
        let json =
            serde_json::to_vec_pretty(records).map_err(|err| write_err(err.to_string()))?;
        tmp.write_all(&json)
            .map_err(|err| write_err(err.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|err| write_err(err.error.to_string()))?;
        Ok(())
    }
}

impl PromptStore for JsonFilePromptStore {
    fn save(&self, prompt: ValidatedPrompt) -> Result<PromptRecord, StoreError> {
        let mut records = self.records.write();
        let record = next_record(&records, prompt);
        records.push(record.clone());
        if let Err(err) = self.persist(&records) {
            records.pop();
            return Err(err);
        }
        Ok(record)
    }

    fn list(&self, kind: Option<&str>) -> Result<Vec<PromptRecord>, StoreError> {
        Ok(newest_first(&self.records.read(), kind))
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

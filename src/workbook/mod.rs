//! Workbook introspection: open uploaded bytes, list sheets and header columns,
//! and expose a sparse cell grid for context serialization.

pub mod crypto;
mod legacy;

use crate::utils::format_number;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;
use umya_spreadsheet::CellRawValue;
use umya_spreadsheet::reader::xlsx;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CFB_MAGIC: &[u8] = &[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// Workbook is encrypted and no password was supplied.
    #[error("workbook is password-protected")]
    NeedsPassword,
    #[error("password is incorrect: {0}")]
    PasswordInvalid(String),
    #[error("failed to open workbook: {0}")]
    OpenFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkbookFormat {
    Xlsx,
    EncryptedXlsx,
    Xls,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    /// Text rendering used for headers and context rows.
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Text(text) => text.clone(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Bool(b) => b.to_string(),
        }
    }
}

/// Sparse, 0-based grid of a single worksheet. Empty cells are not stored.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    name: String,
    rows: BTreeMap<u32, BTreeMap<u32, CellValue>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_cell(&mut self, row: u32, col: u32, value: CellValue) {
        self.rows.entry(row).or_default().insert(col, value);
    }

    pub fn row(&self, row: u32) -> Option<&BTreeMap<u32, CellValue>> {
        self.rows.get(&row)
    }

    pub fn first_row(&self) -> Option<u32> {
        self.rows.keys().next().copied()
    }

    pub fn last_row(&self) -> Option<u32> {
        self.rows.keys().next_back().copied()
    }

    /// Number of physical rows spanned, counting from row 0.
    pub fn row_count(&self) -> u32 {
        self.last_row().map(|r| r + 1).unwrap_or(0)
    }

    /// Widest physical column span of any row, counting from column 0.
    pub fn column_count(&self) -> u32 {
        self.rows
            .values()
            .filter_map(|cells| cells.keys().next_back())
            .map(|c| c + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn cell_text(&self, row: u32, col: u32) -> String {
        self.rows
            .get(&row)
            .and_then(|cells| cells.get(&col))
            .map(CellValue::to_text)
            .unwrap_or_default()
    }

    /// Trimmed non-empty texts of the first present row.
    pub fn header_columns(&self) -> Vec<String> {
        let Some(first) = self.first_row() else {
            return Vec::new();
        };
        self.rows[&first]
            .values()
            .map(|value| value.to_text().trim().to_string())
            .filter(|text| !text.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetInfo {
    pub sheets: Vec<String>,
    pub columns_by_sheet: indexmap::IndexMap<String, Vec<String>>,
    pub row_counts: indexmap::IndexMap<String, u32>,
    pub column_counts: indexmap::IndexMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct Workbook {
    format: WorkbookFormat,
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn from_sheets(format: WorkbookFormat, sheets: Vec<Sheet>) -> Self {
        Self { format, sheets }
    }

    /// Opens workbook bytes, decrypting them first when they are password-protected.
    /// A blank password counts as no password.
    pub fn open(bytes: &[u8], password: Option<&str>) -> Result<Self, OpenError> {
        let password = password.filter(|p| !p.trim().is_empty());
        if bytes.starts_with(ZIP_MAGIC) {
            return read_zip(bytes, WorkbookFormat::Xlsx);
        }
        if bytes.starts_with(CFB_MAGIC) {
            let mut container = cfb::CompoundFile::open(Cursor::new(bytes))
                .map_err(|err| OpenError::OpenFailed(format!("invalid OLE container: {err}")))?;
            if !crypto::is_encrypted(&container) {
                return legacy::read_xls(bytes, password);
            }
            let Some(password) = password else {
                return Err(OpenError::NeedsPassword);
            };
            let package = crypto::decrypt_package(&mut container, password).map_err(|err| {
                match err {
                    crypto::DecryptError::InvalidPassword => {
                        OpenError::PasswordInvalid(err.to_string())
                    }
                    other => OpenError::OpenFailed(other.to_string()),
                }
            })?;
            return read_zip(&package, WorkbookFormat::EncryptedXlsx);
        }
        Err(OpenError::OpenFailed(
            "unrecognized file format; expected .xlsx, .xlsm or .xls".into(),
        ))
    }

    /// Opens on the blocking pool. A parser panic is reported as `OpenFailed`.
    pub async fn open_blocking(
        bytes: Vec<u8>,
        password: Option<String>,
    ) -> Result<Self, OpenError> {
        tokio::task::spawn_blocking(move || Self::open(&bytes, password.as_deref()))
            .await
            .map_err(|err| OpenError::OpenFailed(format!("workbook parser aborted: {err}")))?
    }

    pub fn format(&self) -> WorkbookFormat {
        self.format
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|sheet| sheet.name.clone()).collect()
    }

    pub fn header_columns(&self, sheet: &str) -> Vec<String> {
        self.sheet(sheet)
            .map(Sheet::header_columns)
            .unwrap_or_default()
    }

    pub fn info(&self) -> SheetInfo {
        SheetInfo {
            sheets: self.sheet_names(),
            columns_by_sheet: self
                .sheets
                .iter()
                .map(|sheet| (sheet.name.clone(), sheet.header_columns()))
                .collect(),
            row_counts: self
                .sheets
                .iter()
                .map(|sheet| (sheet.name.clone(), sheet.row_count()))
                .collect(),
            column_counts: self
                .sheets
                .iter()
                .map(|sheet| (sheet.name.clone(), sheet.column_count()))
                .collect(),
        }
    }
}

fn read_zip(bytes: &[u8], format: WorkbookFormat) -> Result<Workbook, OpenError> {
    let book = xlsx::read_reader(Cursor::new(bytes), true)
        .map_err(|err| OpenError::OpenFailed(err.to_string()))?;
    let sheets = book
        .get_sheet_collection()
        .iter()
        .map(sheet_from_worksheet)
        .collect();
    Ok(Workbook::from_sheets(format, sheets))
}

fn sheet_from_worksheet(worksheet: &umya_spreadsheet::Worksheet) -> Sheet {
    let mut sheet = Sheet::new(worksheet.get_name());
    for cell in worksheet.get_cell_collection() {
        if let Some(value) = cell_to_value(cell) {
            let coordinate = cell.get_coordinate();
            let row = *coordinate.get_row_num();
            let col = *coordinate.get_col_num();
            if row > 0 && col > 0 {
                sheet.set_cell(row - 1, col - 1, value);
            }
        }
    }
    sheet
}

/// Follows the stored cell type, so a string cell holding `TRUE` or `007`
/// stays text. Formula cells carry their cached result under the same rule.
pub fn cell_to_value(cell: &umya_spreadsheet::Cell) -> Option<CellValue> {
    match cell.get_raw_value() {
        CellRawValue::Empty => None,
        CellRawValue::Numeric(number) => Some(CellValue::Number(*number)),
        CellRawValue::Bool(flag) => Some(CellValue::Bool(*flag)),
        CellRawValue::String(text) | CellRawValue::Lazy(text) => {
            (!text.is_empty()).then(|| CellValue::Text(text.to_string()))
        }
        CellRawValue::RichText(_) | CellRawValue::Error(_) => {
            let text = cell.get_value();
            (!text.is_empty()).then(|| CellValue::Text(text.into_owned()))
        }
    }
}
